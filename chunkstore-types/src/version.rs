//! Schema version identifiers.
//!
//! A [`SchemaVersion`] tags a persisted document with the shape it was written in. Versions are
//! dotted numeric strings such as `"1"`, `"2.1"` or `"3.0.4"`. The literal `"0"`, an empty string
//! and a missing value all denote the [`SchemaVersion::NULL`] sentinel for unversioned documents,
//! which sorts before every other version.
//!
//! # Ordering
//!
//! Versions are compared component-wise from left to right. Missing trailing components count as
//! zero, so `"1"`, `"1.0"` and `"1.0.0"` compare equal. Equality, ordering and hashing all follow
//! this rule, while [`Display`](fmt::Display) reproduces the components as they were parsed.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The canonical string of the [`SchemaVersion::NULL`] sentinel.
const NULL_LITERAL: &str = "0";

/// Errors that can occur when parsing a [`SchemaVersion`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaVersionError {
    /// A dot-separated component is empty, e.g. in `"1..2"` or `"1."`.
    #[error("empty component in schema version {0:?}")]
    EmptyComponent(String),

    /// A component is not a non-negative integer.
    #[error("invalid component {component:?} in schema version {version:?}")]
    InvalidComponent {
        /// The full version string that failed to parse.
        version: String,
        /// The offending component.
        component: String,
    },
}

/// An ordered schema version identifier.
///
/// See the [module docs](self) for parsing and ordering rules.
#[derive(Clone)]
pub struct SchemaVersion {
    components: Vec<u64>,
}

impl SchemaVersion {
    /// The sentinel for documents that carry no schema version.
    pub const NULL: SchemaVersion = SchemaVersion {
        components: Vec::new(),
    };

    /// Parses a version string.
    ///
    /// Blank strings and the literal `"0"` yield [`SchemaVersion::NULL`].
    pub fn create(version: &str) -> Result<Self, SchemaVersionError> {
        let version = version.trim();
        if version.is_empty() || version == NULL_LITERAL {
            return Ok(Self::NULL);
        }

        let components = version
            .split('.')
            .map(|component| {
                if component.is_empty() {
                    return Err(SchemaVersionError::EmptyComponent(version.to_owned()));
                }
                component
                    .parse::<u64>()
                    .map_err(|_| SchemaVersionError::InvalidComponent {
                        version: version.to_owned(),
                        component: component.to_owned(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { components })
    }

    /// Parses an optional version string, mapping `None` to [`SchemaVersion::NULL`].
    pub fn from_optional(version: Option<&str>) -> Result<Self, SchemaVersionError> {
        version.map_or(Ok(Self::NULL), Self::create)
    }

    /// Returns `true` if this is the unversioned sentinel.
    pub fn is_null(&self) -> bool {
        self.significant().is_empty()
    }

    /// Returns the numeric components as parsed.
    pub fn components(&self) -> &[u64] {
        &self.components
    }

    /// The components without trailing zeros, which is what comparisons operate on.
    fn significant(&self) -> &[u64] {
        let len = self
            .components
            .iter()
            .rposition(|c| *c != 0)
            .map_or(0, |pos| pos + 1);
        &self.components[..len]
    }
}

impl Default for SchemaVersion {
    fn default() -> Self {
        Self::NULL
    }
}

impl PartialEq for SchemaVersion {
    fn eq(&self, other: &Self) -> bool {
        self.significant() == other.significant()
    }
}

impl Eq for SchemaVersion {}

impl Hash for SchemaVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant().hash(state);
    }
}

impl PartialOrd for SchemaVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SchemaVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        // Slices compare lexicographically, and a strict prefix sorts first. With trailing zeros
        // stripped this is exactly zero-padded component-wise comparison.
        self.significant().cmp(other.significant())
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return f.write_str(NULL_LITERAL);
        }

        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{component}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SchemaVersion({self})")
    }
}

impl FromStr for SchemaVersion {
    type Err = SchemaVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::create(s)
    }
}

impl Serialize for SchemaVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SchemaVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<String>::deserialize(deserializer)?;
        Self::from_optional(value.as_deref()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> SchemaVersion {
        SchemaVersion::create(s).unwrap()
    }

    #[test]
    fn null_sentinels() {
        assert!(v("0").is_null());
        assert!(v("").is_null());
        assert!(v("   ").is_null());
        assert!(SchemaVersion::from_optional(None).unwrap().is_null());
        assert_eq!(v("0"), SchemaVersion::NULL);
        assert_eq!(SchemaVersion::NULL.to_string(), "0");
    }

    #[test]
    fn orders_component_wise() {
        assert!(v("0") < v("1"));
        assert!(v("1") < v("1.1"));
        assert!(v("1.2") < v("1.10"));
        assert!(v("2") > v("1.99.99"));
        assert_eq!(v("1"), v("1.0.0"));
        assert_eq!(v("1").cmp(&v("1.0")), Ordering::Equal);
    }

    #[test]
    fn round_trips_canonical_string() {
        for s in ["1", "2.1", "3.0.4", "10.20"] {
            assert_eq!(v(s).to_string(), s);
        }
        // leading zeros are not part of the canonical form
        assert_eq!(v("01.002").to_string(), "1.2");
    }

    #[test]
    fn rejects_malformed() {
        assert!(matches!(
            SchemaVersion::create("1..2"),
            Err(SchemaVersionError::EmptyComponent(_))
        ));
        assert!(matches!(
            SchemaVersion::create("1.beta"),
            Err(SchemaVersionError::InvalidComponent { component, .. }) if component == "beta"
        ));
        assert!(SchemaVersion::create("-1").is_err());
    }

    #[test]
    fn hash_agrees_with_eq() {
        use std::collections::HashSet;

        let set: HashSet<_> = [v("1"), v("1.0"), v("1.0.0")].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn serde_as_string() {
        let json = serde_json::to_string(&v("2.1")).unwrap();
        assert_eq!(json, r#""2.1""#);

        let parsed: SchemaVersion = serde_json::from_str(r#""2.1""#).unwrap();
        assert_eq!(parsed, v("2.1"));

        let null: SchemaVersion = serde_json::from_str("null").unwrap();
        assert!(null.is_null());
    }
}
