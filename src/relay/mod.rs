//! Shared key-value relay used for signaling.
//!
//! The relay holds one JSON document per session key. The coordinator only
//! talks to it through [`RelayStore`], never through a live handle into the
//! store's representation.

mod memory;

pub use memory::{MemoryRelay, MemoryRelayClient};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::RelayError;

/// Values of one field: the current value on subscribe, then every change.
/// An absent field is `Value::Null`.
pub type FieldStream = mpsc::UnboundedReceiver<Value>;

/// `(child id, value)` for each child of a collection, existing ones first.
pub type ChildStream = mpsc::UnboundedReceiver<(String, Value)>;

/// Client view of an eventually-consistent relay.
///
/// Delivery is at-least-once and there is no transaction spanning calls.
/// Any operation may fail with a transient [`RelayError`].
#[async_trait]
pub trait RelayStore: Send + Sync {
    /// Single read of the whole document; `None` when absent.
    async fn read(&self, key: &str) -> Result<Option<Value>, RelayError>;

    /// Replaces the whole document. Last writer wins.
    async fn write(&self, key: &str, document: Value) -> Result<(), RelayError>;

    /// Sets one top-level field, leaving siblings untouched.
    async fn write_field(&self, key: &str, field: &str, value: Value) -> Result<(), RelayError>;

    /// Appends to a collection field under a generated, insertion-ordered id.
    async fn append_child(
        &self,
        key: &str,
        collection: &str,
        value: Value,
    ) -> Result<String, RelayError>;

    async fn subscribe_field(&self, key: &str, field: &str) -> Result<FieldStream, RelayError>;

    async fn subscribe_child_added(
        &self,
        key: &str,
        collection: &str,
    ) -> Result<ChildStream, RelayError>;

    /// Drops every subscription this client holds on `key`; their streams end.
    async fn unsubscribe_all(&self, key: &str) -> Result<(), RelayError>;

    async fn delete(&self, key: &str) -> Result<(), RelayError>;
}
