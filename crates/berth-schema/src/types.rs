//! Newtype wrappers for string identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings so they can sit inside
//! label maps and JSON state files unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Full 64-character hex container identifier.
    ContainerId
);

string_newtype!(
    /// Supervisor-level partition of container metadata (`default`, `k8s.io`, ...).
    Namespace
);

impl ContainerId {
    /// Truncated 12-character prefix used in tables and default hostnames.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new("default")
    }
}

/// Validate a container or volume name: `[a-zA-Z0-9][a-zA-Z0-9_.-]*`.
pub fn is_valid_object_name(name: &str) -> bool {
    let mut bytes = name.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_id_short_prefix() {
        let id = ContainerId::new("0123456789abcdef0123");
        assert_eq!(id.short(), "0123456789ab");
        assert_eq!(ContainerId::new("abc").short(), "abc");
    }

    #[test]
    fn namespace_serde_is_transparent() {
        let ns = Namespace::new("k8s.io");
        let json = serde_json::to_string(&ns).unwrap();
        assert_eq!(json, "\"k8s.io\"");
        let back: Namespace = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ns);
        assert_eq!(Namespace::default().as_str(), "default");
    }

    #[test]
    fn object_names() {
        assert!(is_valid_object_name("web_1"));
        assert!(is_valid_object_name("a.b-c"));
        assert!(!is_valid_object_name(""));
        assert!(!is_valid_object_name("-leading"));
        assert!(!is_valid_object_name("has space"));
        assert!(!is_valid_object_name("has/slash"));
    }
}
