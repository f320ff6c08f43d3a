//! Strongly-typed identifiers for domain entities

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Macro to generate strongly-typed ID wrappers
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            pub fn into_uuid(self) -> Uuid {
                self.0
            }

            /// Prefixed form used in external references, e.g. `conn_<uuid>`
            pub fn to_prefixed(&self) -> String {
                format!("{}_{}", $prefix, self.0)
            }

            /// Parse the prefixed form, accepting a bare UUID as well
            pub fn from_prefixed(s: &str) -> Option<Self> {
                let prefix = concat!($prefix, "_");
                let raw = s.strip_prefix(prefix).unwrap_or(s);
                Uuid::parse_str(raw).ok().map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                if let Some(id) = Self::from_prefixed(s) {
                    return Ok(id);
                }
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

define_id!(TenantId, "tn");
define_id!(ConnectorId, "conn");
define_id!(TaskId, "task");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_generation() {
        let id1 = ConnectorId::new();
        let id2 = ConnectorId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_prefixed_roundtrip() {
        let id = TaskId::new();
        let prefixed = id.to_prefixed();
        assert!(prefixed.starts_with("task_"));

        let parsed = TaskId::from_prefixed(&prefixed).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_id_parsing() {
        let id = TenantId::new();
        let parsed: TenantId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
