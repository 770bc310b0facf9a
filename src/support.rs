//! Shared support utilities: method keys, canonical JSON, hashing, clamping.
//!
//! # Method Keys
//!
//! A method key is the stable textual identifier of an operation, used
//! verbatim as a join key across the policy table, idempotency records,
//! audit rows and metrics. Two forms exist:
//!
//! - **full**: `<fully-qualified-type>#<operation>(<simple-arg-types>)` -
//!   used for persistence joins
//! - **metric**: `<simple-type>#<operation>` - used only as a metrics tag to
//!   keep label cardinality and length down
//!
//! # Canonical serialization
//!
//! Request hashing and audit payloads require a deterministic serialization:
//! the same logical arguments must always produce the same bytes. Arguments
//! enter the chain as `serde_json::Value`, whose object representation keeps
//! keys ordered, and timestamps serialize as ISO-8601 via chrono - so the
//! text form of a chain value is canonical by construction. The same text
//! feeds both the idempotency request hash and the audit args payload.

use sha2::{Digest, Sha256};

/// Stable textual identifier of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodKey {
    full: String,
    metric: String,
    target_type: String,
}

impl MethodKey {
    /// Build a method key from explicit parts.
    ///
    /// `target_type` should be the fully-qualified type name of the component
    /// owning the operation; `arg_types` are the simple names of the argument
    /// types in declaration order.
    pub fn new(target_type: &str, operation: &str, arg_types: &[&str]) -> Self {
        let full = format!("{target_type}#{operation}({})", arg_types.join(","));
        let simple = simple_type_name(target_type);
        let metric = format!("{simple}#{operation}");
        Self {
            full,
            metric,
            target_type: target_type.to_string(),
        }
    }

    /// Build a method key for a typed component, deriving the target type
    /// name from the type system.
    pub fn of<T>(operation: &str, arg_types: &[&str]) -> Self {
        Self::new(std::any::type_name::<T>(), operation, arg_types)
    }

    /// The full signature form used in persistence joins.
    pub fn full(&self) -> &str {
        &self.full
    }

    /// The short form used as a metrics tag.
    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// The fully-qualified owning type name.
    pub fn target_type(&self) -> &str {
        &self.target_type
    }

    /// The simple (unqualified) owning type name.
    pub fn simple_target_type(&self) -> &str {
        simple_type_name(&self.target_type)
    }
}

impl std::fmt::Display for MethodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full)
    }
}

/// Strip the module path from a fully-qualified Rust type name.
fn simple_type_name(full: &str) -> &str {
    full.rsplit("::").next().unwrap_or(full)
}

/// Clamp an optional integer override into `[min, max]`, falling back to the
/// spec default when absent.
pub fn clamp_override(value: Option<i64>, default: i64, min: i64, max: i64) -> i64 {
    match value {
        Some(v) => v.clamp(min, max),
        None => default,
    }
}

/// Lowercase hex SHA-256 of a string.
pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    to_hex(&digest)
}

/// Render bytes as lowercase hex.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(
        String::with_capacity(bytes.len() * 2),
        |mut out, b| {
            use std::fmt::Write;
            let _ = write!(out, "{b:02x}");
            out
        },
    )
}
