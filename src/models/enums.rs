use std::cmp::Ordering;

use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(Severity {
    Informational => "informational",
    Warning => "warning",
    Critical => "critical",
});

impl Severity {
    /// critical > warning > informational
    pub fn rank(&self) -> u8 {
        match self {
            Self::Informational => 0,
            Self::Warning => 1,
            Self::Critical => 2,
        }
    }
}

impl PartialOrd for Severity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Severity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

str_enum!(EvidenceOrigin {
    Knowledge => "knowledge",
    Profile => "profile",
});

str_enum!(RetrievalPath {
    Knowledge => "knowledge",
    Profile => "profile",
});

str_enum!(OverallRisk {
    Low => "low",
    Medium => "medium",
    High => "high",
});

str_enum!(Trend {
    Rising => "rising",
    Falling => "falling",
    Stable => "stable",
});

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn severity_round_trip() {
        for (variant, s) in [
            (Severity::Informational, "informational"),
            (Severity::Warning, "warning"),
            (Severity::Critical, "critical"),
        ] {
            assert_eq!(variant.as_str(), s);
            assert_eq!(Severity::from_str(s).unwrap(), variant);
        }
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Informational);
        let max = [Severity::Warning, Severity::Critical, Severity::Informational]
            .into_iter()
            .max()
            .unwrap();
        assert_eq!(max, Severity::Critical);
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&OverallRisk::Medium).unwrap();
        assert_eq!(json, "\"medium\"");
        let parsed: EvidenceOrigin = serde_json::from_str("\"profile\"").unwrap();
        assert_eq!(parsed, EvidenceOrigin::Profile);
    }

    #[test]
    fn invalid_enum_returns_error() {
        assert!(Severity::from_str("severe").is_err());
        assert!(Trend::from_str("up").is_err());
    }
}
