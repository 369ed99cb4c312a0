//! Version compatibility between peers

use std::cmp::Ordering;
use std::fmt;

/// Parsed `major.minor.patch` version; any pre-release or build suffix is kept
/// but ignored for compatibility
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub suffix: Option<String>,
}

impl Version {
    /// Parse a version string; missing minor/patch components read as zero
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim().trim_start_matches('v');
        let (core, suffix) = match input.find(|c| c == '-' || c == '+') {
            Some(idx) => (&input[..idx], Some(input[idx..].to_string())),
            None => (input, None),
        };

        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().map_or(Some(0), |p| p.parse().ok())?;
        let patch = parts.next().map_or(Some(0), |p| p.parse().ok())?;
        if parts.next().is_some() {
            return None;
        }

        Some(Self {
            major,
            minor,
            patch,
            suffix,
        })
    }

    /// Same major version, and same minor version while major is 0
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        if self.major != other.major {
            return false;
        }
        self.major != 0 || self.minor == other.minor
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            // a release sorts after its pre-releases
            .then_with(|| match (&self.suffix, &other.suffix) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(suffix) = &self.suffix {
            write!(f, "{}", suffix)?;
        }
        Ok(())
    }
}

/// Whether this server can replicate from a peer running `remote`
///
/// Unparseable versions are only compatible with an identical string.
pub fn is_compatible(local: &str, remote: &str) -> bool {
    match (Version::parse(local), Version::parse(remote)) {
        (Some(l), Some(r)) => l.is_compatible_with(&r),
        _ => local == remote,
    }
}

/// Whether `candidate` may overwrite a stored `current` version marker
pub fn is_not_older(candidate: &str, current: &str) -> bool {
    match (Version::parse(candidate), Version::parse(current)) {
        (Some(c), Some(cur)) => c >= cur,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let v = Version::parse("1.3.0").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (1, 3, 0));

        let v = Version::parse("v2.1").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (2, 1, 0));

        let v = Version::parse("0.4.1-beta.2").unwrap();
        assert_eq!(v.suffix.as_deref(), Some("-beta.2"));
        assert_eq!(v.to_string(), "0.4.1-beta.2");

        assert!(Version::parse("one.two").is_none());
        assert!(Version::parse("1.2.3.4").is_none());
    }

    #[test]
    fn test_compatibility_rule() {
        assert!(is_compatible("1.3.0", "1.0.9"));
        assert!(!is_compatible("1.3.0", "2.0.0"));
        assert!(is_compatible("0.4.0", "0.4.7"));
        assert!(!is_compatible("0.4.0", "0.5.0"));
        assert!(is_compatible("custom", "custom"));
        assert!(!is_compatible("custom", "1.0.0"));
    }

    #[test]
    fn test_ordering() {
        assert!(is_not_older("1.3.0", "1.2.9"));
        assert!(is_not_older("1.3.0", "1.3.0"));
        assert!(!is_not_older("1.2.0", "1.3.0"));
        assert!(!is_not_older("1.3.0-rc.1", "1.3.0"));
    }
}
