//! Addon descriptors and compatibility checks

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Four-component version used for addon compatibility ranges
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CoreVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub revision: u32,
}

impl CoreVersion {
    pub fn new(major: u32, minor: u32, build: u32, revision: u32) -> Self {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }

    /// Version of the running core, from the crate version (missing
    /// components are zero).
    pub fn current() -> Self {
        env!("CARGO_PKG_VERSION").parse().unwrap_or_default()
    }
}

impl Default for CoreVersion {
    fn default() -> Self {
        Self::new(0, 0, 0, 0)
    }
}

impl FromStr for CoreVersion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts = [0u32; 4];
        for (i, piece) in s.trim().split('.').enumerate() {
            if i >= 4 {
                return Err(format!("too many version components in '{}'", s));
            }
            parts[i] = piece
                .parse()
                .map_err(|_| format!("invalid version component '{}' in '{}'", piece, s))?;
        }
        Ok(Self::new(parts[0], parts[1], parts[2], parts[3]))
    }
}

impl TryFrom<String> for CoreVersion {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CoreVersion> for String {
    fn from(value: CoreVersion) -> Self {
        value.to_string()
    }
}

impl fmt::Display for CoreVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

/// Static registration data for a single addon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddonDescriptor {
    /// Unique id, `[A-Za-z0-9_]+`, compared case-insensitively
    pub id: String,

    /// Human-readable name for diagnostics
    pub display_name: String,

    /// Inclusive lower bound on the core version, if any
    #[serde(default)]
    pub min_version: Option<CoreVersion>,

    /// Inclusive upper bound on the core version, if any
    #[serde(default)]
    pub max_version: Option<CoreVersion>,
}

impl AddonDescriptor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            min_version: None,
            max_version: None,
        }
    }

    /// Validate id shape, name presence, and version compatibility against
    /// the running core. Returns the reason the addon must be disabled, or
    /// `None` when it can be enabled.
    pub fn validation_failure(&self, core: &CoreVersion) -> Option<String> {
        let id_ok = regex::Regex::new(r"^[A-Za-z0-9_]+$")
            .map(|pattern| pattern.is_match(&self.id))
            .unwrap_or(false);
        if !id_ok {
            return Some(format!("invalid addon id '{}'", self.id));
        }
        if self.display_name.trim().is_empty() {
            return Some(format!("addon '{}' has an empty display name", self.id));
        }
        if let Some(min) = &self.min_version {
            if core < min {
                return Some(format!(
                    "addon '{}' requires core >= {}, running {}",
                    self.id, min, core
                ));
            }
        }
        if let Some(max) = &self.max_version {
            if core > max {
                return Some(format!(
                    "addon '{}' requires core <= {}, running {}",
                    self.id, max, core
                ));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse() {
        let v: CoreVersion = "1.2.3.4".parse().unwrap();
        assert_eq!(v, CoreVersion::new(1, 2, 3, 4));
    }

    #[test]
    fn test_version_parse_short() {
        let v: CoreVersion = "0.1.0".parse().unwrap();
        assert_eq!(v, CoreVersion::new(0, 1, 0, 0));
    }

    #[test]
    fn test_version_parse_invalid() {
        assert!("1.2.x".parse::<CoreVersion>().is_err());
        assert!("1.2.3.4.5".parse::<CoreVersion>().is_err());
    }

    #[test]
    fn test_version_ordering() {
        let a: CoreVersion = "1.2.0.0".parse().unwrap();
        let b: CoreVersion = "1.10.0.0".parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_valid_descriptor() {
        let descriptor = AddonDescriptor::new("Commands", "Command runner");
        assert!(descriptor
            .validation_failure(&CoreVersion::new(1, 0, 0, 0))
            .is_none());
    }

    #[test]
    fn test_bad_id_rejected() {
        for bad in ["with space", "dash-ed", "", "slash/ed"] {
            let descriptor = AddonDescriptor::new(bad, "Bad");
            assert!(
                descriptor
                    .validation_failure(&CoreVersion::new(1, 0, 0, 0))
                    .is_some(),
                "id {:?} should fail validation",
                bad
            );
        }
    }

    #[test]
    fn test_version_range_inclusive() {
        let mut descriptor = AddonDescriptor::new("ranged", "Ranged");
        descriptor.min_version = Some("1.0.0.0".parse().unwrap());
        descriptor.max_version = Some("2.0.0.0".parse().unwrap());

        // Inclusive on both bounds.
        assert!(descriptor
            .validation_failure(&CoreVersion::new(1, 0, 0, 0))
            .is_none());
        assert!(descriptor
            .validation_failure(&CoreVersion::new(2, 0, 0, 0))
            .is_none());
        assert!(descriptor
            .validation_failure(&CoreVersion::new(0, 9, 0, 0))
            .is_some());
        assert!(descriptor
            .validation_failure(&CoreVersion::new(2, 0, 0, 1))
            .is_some());
    }
}
