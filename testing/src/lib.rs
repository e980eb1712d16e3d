//! # Querybus Testing
//!
//! Test support for code built on the query bus.
//!
//! This crate provides:
//! - [`InMemoryConnectionProvider`]: a scriptable provider with a statement
//!   journal, a [`Gate`] for holding workers busy and latency injection
//! - [`properties`]: proptest strategies for bind values and shard keys
//! - [`init_test_tracing`]: route `tracing` output into the test harness
//!
//! ## Example
//!
//! ```
//! use querybus_testing::{InMemoryConnectionProvider, insert_into};
//!
//! let provider = InMemoryConnectionProvider::new();
//! provider.on_execute("INSERT INTO emails (email) VALUES (?)", insert_into("emails"));
//! provider.on_query("SELECT email FROM emails WHERE email = ?", |tables, args| {
//!     Ok(tables.select_where("emails", 0, &args[0]))
//! });
//! assert!(provider.journal().is_empty());
//! ```

use std::sync::Once;

/// Scriptable in-memory connection provider
pub mod provider;

/// Property-based testing strategies.
pub mod properties {
    use proptest::prelude::*;
    use querybus_core::BindValue;

    /// Any bind value, including `Null`.
    pub fn bind_value() -> impl Strategy<Value = BindValue> {
        prop_oneof![
            Just(BindValue::Null),
            any::<bool>().prop_map(BindValue::Bool),
            any::<i64>().prop_map(BindValue::Int),
            (-1.0e9..1.0e9f64).prop_map(BindValue::Float),
            ".{0,32}".prop_map(BindValue::Text),
            proptest::collection::vec(any::<u8>(), 0..32).prop_map(BindValue::Bytes),
        ]
    }

    /// Shard keys shaped like the identifiers handlers route on.
    pub fn shard_key() -> impl Strategy<Value = String> {
        prop_oneof![
            "user-[0-9]{1,6}",
            "[a-z]{1,12}@[a-z]{1,8}\\.com",
            ".{0,24}",
        ]
    }
}

pub use provider::{
    Gate, InMemoryConnectionProvider, JournalEntry, Record, StatementKind, Tables, insert_into,
};

static TRACING: Once = Once::new();

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Honours `RUST_LOG`, defaulting to `querybus=debug`. Safe to call from
/// every test; only the first call installs anything.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("querybus=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn tracing_init_is_idempotent() {
        init_test_tracing();
        init_test_tracing();
    }

    proptest! {
        #[test]
        fn inserted_values_are_found(value in properties::bind_value()) {
            let mut tables = Tables::default();
            tables.insert("t", vec![value.clone()]);
            prop_assert!(tables.contains("t", 0, &value));
        }
    }
}
