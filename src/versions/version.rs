//! Versions and Version Constraints
//!
//! Versions are dotted non-negative integers compared numerically,
//! left to right, with the shorter tuple padded with zeros. A
//! [`VersionSpec`] is a comma-separated list of constraints which must
//! all hold.
//!
//! # Grammar
//!
//! ```text
//! spec       := "" | constraint ("," constraint)*
//! constraint := [operator] version
//! operator   := "==" | ">=" | "<=" | ">" | "<"      (absent means "==")
//! version    := digits ("." digits)*
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::config::ConfigError;

/// A dotted numeric version such as `2.20.0.422`.
#[derive(Debug, Clone)]
pub struct Version {
    parts: Vec<u64>,
    text: String,
}

impl Version {
    /// Numeric components in order.
    pub fn parts(&self) -> &[u64] {
        &self.parts
    }

    /// The version exactly as written.
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl FromStr for Version {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let invalid = || ConfigError::InvalidVersion {
            token: s.to_string(),
        };

        if text.is_empty() {
            return Err(invalid());
        }

        let parts = text
            .split('.')
            .map(|part| {
                if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
                part.parse::<u64>().map_err(|_| invalid())
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            parts,
            text: text.to_string(),
        })
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        (0..len)
            .map(|i| {
                let a = self.parts.get(i).copied().unwrap_or(0);
                let b = other.parts.get(i).copied().unwrap_or(0);
                a.cmp(&b)
            })
            .find(|ordering| *ordering != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Comparison operator of a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ge,
    Le,
    Gt,
    Lt,
}

impl Operator {
    /// Longest symbols first so `>=` is not read as `>`.
    const SYMBOLS: [(&'static str, Operator); 5] = [
        ("==", Operator::Eq),
        (">=", Operator::Ge),
        ("<=", Operator::Le),
        (">", Operator::Gt),
        ("<", Operator::Lt),
    ];

    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Eq => "==",
            Operator::Ge => ">=",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Lt => "<",
        }
    }

    /// Whether `candidate.cmp(bound)` satisfies this operator.
    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Operator::Eq => ordering == Ordering::Equal,
            Operator::Ge => ordering != Ordering::Less,
            Operator::Le => ordering != Ordering::Greater,
            Operator::Gt => ordering == Ordering::Greater,
            Operator::Lt => ordering == Ordering::Less,
        }
    }
}

/// A single `[operator]version` constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    pub operator: Operator,
    pub version: Version,
}

impl VersionConstraint {
    /// Checks a candidate version against this constraint.
    pub fn matches(&self, candidate: &Version) -> bool {
        self.operator.accepts(candidate.cmp(&self.version))
    }
}

impl FromStr for VersionConstraint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let unknown = || ConfigError::UnknownOperator {
            constraint: s.trim().to_string(),
        };

        let (operator, rest) = Operator::SYMBOLS
            .iter()
            .find_map(|(symbol, op)| text.strip_prefix(symbol).map(|rest| (*op, rest)))
            .unwrap_or((Operator::Eq, text));

        let rest = rest.trim_start();
        if rest.starts_with(|c: char| !c.is_ascii_digit() && c.is_ascii_punctuation()) {
            return Err(unknown());
        }

        Ok(Self {
            operator,
            version: rest.parse()?,
        })
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.operator.symbol(), self.version)
    }
}

/// A conjunction of version constraints. Empty means "any version".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionSpec {
    constraints: Vec<VersionConstraint>,
}

impl VersionSpec {
    /// The always-true spec.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn constraints(&self) -> &[VersionConstraint] {
        &self.constraints
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// True if every constraint holds for `candidate`.
    pub fn matches(&self, candidate: &Version) -> bool {
        self.constraints.iter().all(|c| c.matches(candidate))
    }

    /// Combines two specs; the result requires both.
    pub fn and(&self, other: &VersionSpec) -> VersionSpec {
        let mut constraints = self.constraints.clone();
        constraints.extend(other.constraints.iter().cloned());
        VersionSpec { constraints }
    }
}

impl FromStr for VersionSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Ok(Self::any());
        }

        let constraints = s
            .split(',')
            .map(|item| {
                if item.trim().is_empty() {
                    return Err(ConfigError::EmptyConstraint {
                        spec: s.to_string(),
                    });
                }
                item.parse()
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { constraints })
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.constraints.iter().map(|c| c.to_string()).collect();
        f.write_str(&joined.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(text: &str) -> Version {
        text.parse().unwrap()
    }

    #[test]
    fn test_version_parse() {
        let version = v("2.20.0.422");
        assert_eq!(version.parts(), &[2, 20, 0, 422]);
        assert_eq!(version.to_string(), "2.20.0.422");
    }

    #[test]
    fn test_version_rejects_suffixes() {
        for text in ["2.17.1.14-patched", "v2.17", "", "1..2", "1.2.", "1.x", "-1"] {
            assert!(
                matches!(text.parse::<Version>(), Err(ConfigError::InvalidVersion { .. })),
                "'{}' should be rejected",
                text
            );
        }
    }

    #[test]
    fn test_version_numeric_not_lexical() {
        assert!(v("1.10") > v("1.9"));
        assert!(v("2.20.0.422") > v("2.17.1.14"));
        assert!(v("10") > v("9.99.99"));
    }

    #[test]
    fn test_version_zero_padding() {
        assert_eq!(v("2.0"), v("2.0.0"));
        assert!(v("2.0.1") > v("2"));
        assert!(v("1.8") < v("1.8.3"));
    }

    #[test]
    fn test_constraint_operators() {
        let c: VersionConstraint = ">=1.8.3".parse().unwrap();
        assert_eq!(c.operator, Operator::Ge);
        assert!(c.matches(&v("1.8.3")));
        assert!(c.matches(&v("1.9")));
        assert!(!c.matches(&v("1.8.2")));

        let c: VersionConstraint = "<2.0".parse().unwrap();
        assert!(c.matches(&v("1.99")));
        assert!(!c.matches(&v("2.0.0")));

        let c: VersionConstraint = "> 2".parse().unwrap();
        assert_eq!(c.operator, Operator::Gt);
        assert!(c.matches(&v("2.0.1")));

        let c: VersionConstraint = "<=2.17".parse().unwrap();
        assert!(c.matches(&v("2.17.0")));
        assert!(!c.matches(&v("2.17.1")));
    }

    #[test]
    fn test_constraint_without_operator_is_equality() {
        let c: VersionConstraint = "2.17.1.14".parse().unwrap();
        assert_eq!(c.operator, Operator::Eq);
        assert!(c.matches(&v("2.17.1.14")));
        assert!(!c.matches(&v("2.17.1.15")));
    }

    #[test]
    fn test_constraint_unknown_operator() {
        for text in ["~=2.0", "!=2.0", "=2.0", ">>2.0", ">=<2.0"] {
            assert!(
                matches!(
                    text.parse::<VersionConstraint>(),
                    Err(ConfigError::UnknownOperator { .. })
                ),
                "'{}' should be an unknown operator",
                text
            );
        }
    }

    #[test]
    fn test_constraint_non_numeric_token() {
        assert!(matches!(
            ">=latest".parse::<VersionConstraint>(),
            Err(ConfigError::InvalidVersion { .. })
        ));
    }

    #[test]
    fn test_spec_parse_and_match() {
        let spec: VersionSpec = ">=1.8.3, <2.0".parse().unwrap();
        assert_eq!(spec.constraints().len(), 2);
        assert!(spec.matches(&v("1.8.4")));
        assert!(!spec.matches(&v("2.0.0")));
        assert!(!spec.matches(&v("1.8.2")));
        assert_eq!(spec.to_string(), ">=1.8.3,<2.0");
    }

    #[test]
    fn test_spec_empty_matches_everything() {
        let spec: VersionSpec = "  ".parse().unwrap();
        assert!(spec.is_empty());
        assert!(spec.matches(&v("0.0.1")));
        assert_eq!(spec.to_string(), "");
    }

    #[test]
    fn test_spec_empty_element_rejected() {
        assert!(matches!(
            ">=1.0,,<2.0".parse::<VersionSpec>(),
            Err(ConfigError::EmptyConstraint { .. })
        ));
        assert!(">=1.0,".parse::<VersionSpec>().is_err());
    }

    #[test]
    fn test_spec_and() {
        let lower: VersionSpec = ">=2.17".parse().unwrap();
        let upper: VersionSpec = "<2.20".parse().unwrap();
        let both = lower.and(&upper);

        assert_eq!(both.to_string(), ">=2.17,<2.20");
        assert!(both.matches(&v("2.19.1")));
        assert!(!both.matches(&v("2.20.0.422")));
        assert_eq!(VersionSpec::any().and(&lower), lower);
    }

    #[test]
    fn test_version_serde_as_string() {
        let json = serde_json::to_string(&v("2.20.0.422")).unwrap();
        assert_eq!(json, "\"2.20.0.422\"");

        let parsed: Version = serde_json::from_str("\"1.8.4\"").unwrap();
        assert_eq!(parsed, v("1.8.4"));
        assert!(serde_json::from_str::<Version>("\"1.8.4-rc1\"").is_err());
    }
}
