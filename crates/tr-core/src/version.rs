use std::fmt;

/// A four-part release version: `major.minor.patch.build`.
///
/// Ordering is lexicographic over the four components, so any parsed
/// release compares greater than [`Version::SENTINEL`]. Parsing never fails:
/// tags that cannot be read map to the sentinel instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: u32,
}

impl Version {
    /// Lowest possible rank, used for tags that do not parse.
    pub const SENTINEL: Version = Version::new(0, 0, 0, 0);

    /// Used when the running binary carries no readable version metadata.
    pub const UNKNOWN_SELF: Version = Version::new(0, 1, 0, 0);

    pub const fn new(major: u32, minor: u32, patch: u32, build: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            build,
        }
    }

    /// Parse a release tag such as `v1.2.3` or `1.2.3.4`.
    ///
    /// Returns [`Version::SENTINEL`] for anything that is not two to four
    /// dot-separated unsigned integers after an optional leading `v`.
    pub fn parse(tag: &str) -> Self {
        Self::try_parse(tag).unwrap_or(Self::SENTINEL)
    }

    /// Strict variant of [`Version::parse`].
    pub fn try_parse(tag: &str) -> Option<Self> {
        let trimmed = strip_tag_prefix(tag.trim());
        let parts: Vec<&str> = trimmed.split('.').collect();
        if !(2..=4).contains(&parts.len()) {
            return None;
        }

        let mut numbers = [0u32; 4];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            *slot = part.parse().ok()?;
        }

        Some(Self::new(numbers[0], numbers[1], numbers[2], numbers[3]))
    }

    /// Version of the running binary, read from build metadata.
    ///
    /// Callers pass `option_env!("CARGO_PKG_VERSION")` from the binary crate.
    pub fn from_build_metadata(raw: Option<&str>) -> Self {
        raw.and_then(Self::try_parse).unwrap_or(Self::UNKNOWN_SELF)
    }

    /// True when this is the unparsable-tag sentinel.
    pub fn is_sentinel(&self) -> bool {
        *self == Self::SENTINEL
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.patch, self.build
        )
    }
}

/// Strip one leading `v`/`V` from a tag.
pub fn strip_tag_prefix(tag: &str) -> &str {
    tag.strip_prefix('v')
        .or_else(|| tag.strip_prefix('V'))
        .unwrap_or(tag)
}
