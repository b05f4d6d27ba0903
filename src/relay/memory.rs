use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::trace;

use super::{ChildStream, FieldStream, RelayStore};
use crate::error::RelayError;

/// In-process relay shared by any number of clients.
///
/// Cloning shares the same store. Each [`MemoryRelay::client`] handle owns its
/// subscriptions, like separate browser tabs on one database.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<Mutex<Backend>>,
}

#[derive(Default)]
struct Backend {
    docs: HashMap<String, Value>,
    subscribers: Vec<Subscriber>,
    next_client: u64,
    next_child: u64,
    offline: bool,
    reads: usize,
    deletes: usize,
}

struct Subscriber {
    client: u64,
    key: String,
    field: String,
    sink: Sink,
}

enum Sink {
    Field {
        tx: mpsc::UnboundedSender<Value>,
        last: Value,
    },
    Children {
        tx: mpsc::UnboundedSender<(String, Value)>,
        seen: HashSet<String>,
    },
}

impl std::fmt::Debug for MemoryRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = self.lock();
        f.debug_struct("MemoryRelay")
            .field("docs", &backend.docs.len())
            .field("subscribers", &backend.subscribers.len())
            .field("offline", &backend.offline)
            .finish()
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new client connection with its own subscriptions.
    pub fn client(&self) -> MemoryRelayClient {
        let id = {
            let mut backend = self.lock();
            backend.next_client += 1;
            backend.next_client
        };
        MemoryRelayClient {
            relay: self.clone(),
            id,
        }
    }

    /// While offline every client operation fails with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Current document, bypassing the offline switch.
    pub fn snapshot(&self, key: &str) -> Option<Value> {
        self.lock().docs.get(key).cloned()
    }

    pub fn read_count(&self) -> usize {
        self.lock().reads
    }

    pub fn delete_count(&self) -> usize {
        self.lock().deletes
    }

    /// Live subscriptions across all clients.
    pub fn subscriber_count(&self) -> usize {
        let mut backend = self.lock();
        backend.prune_closed();
        backend.subscribers.len()
    }

    fn lock(&self) -> MutexGuard<'_, Backend> {
        // A panic while holding the lock cannot leave the maps half-updated
        // in a way later readers care about.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn online(&self) -> Result<MutexGuard<'_, Backend>, RelayError> {
        let backend = self.lock();
        if backend.offline {
            return Err(RelayError::Unavailable("relay offline".into()));
        }
        Ok(backend)
    }
}

impl Backend {
    fn field_value(&self, key: &str, field: &str) -> Value {
        self.docs
            .get(key)
            .and_then(|doc| doc.get(field))
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn children(&self, key: &str, collection: &str) -> Vec<(String, Value)> {
        match self.docs.get(key).and_then(|doc| doc.get(collection)) {
            Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            _ => Vec::new(),
        }
    }

    fn document_mut(&mut self, key: &str) -> &mut Map<String, Value> {
        let doc = self
            .docs
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !doc.is_object() {
            *doc = Value::Object(Map::new());
        }
        match doc {
            Value::Object(map) => map,
            _ => unreachable!("document replaced by an object above"),
        }
    }

    /// Pushes changes on `key` to its subscribers and drops closed ones.
    fn notify(&mut self, key: &str) {
        let mut pending_fields = Vec::new();
        let mut pending_children = Vec::new();
        for (idx, sub) in self.subscribers.iter().enumerate() {
            if sub.key != key {
                continue;
            }
            match &sub.sink {
                Sink::Field { .. } => pending_fields.push((idx, self.field_value(key, &sub.field))),
                Sink::Children { .. } => {
                    pending_children.push((idx, self.children(key, &sub.field)))
                }
            }
        }

        for (idx, current) in pending_fields {
            if let Sink::Field { tx, last } = &mut self.subscribers[idx].sink {
                if *last != current {
                    *last = current.clone();
                    let _ = tx.send(current);
                }
            }
        }
        for (idx, children) in pending_children {
            if let Sink::Children { tx, seen } = &mut self.subscribers[idx].sink {
                for (id, value) in children {
                    if seen.insert(id.clone()) {
                        let _ = tx.send((id, value));
                    }
                }
            }
        }

        self.prune_closed();
    }

    fn prune_closed(&mut self) {
        self.subscribers.retain(|sub| match &sub.sink {
            Sink::Field { tx, .. } => !tx.is_closed(),
            Sink::Children { tx, .. } => !tx.is_closed(),
        });
    }
}

/// One client connection to a [`MemoryRelay`].
#[derive(Debug)]
pub struct MemoryRelayClient {
    relay: MemoryRelay,
    id: u64,
}

#[async_trait]
impl RelayStore for MemoryRelayClient {
    async fn read(&self, key: &str) -> Result<Option<Value>, RelayError> {
        let mut backend = self.relay.online()?;
        backend.reads += 1;
        Ok(backend.docs.get(key).cloned())
    }

    async fn write(&self, key: &str, document: Value) -> Result<(), RelayError> {
        let mut backend = self.relay.online()?;
        backend.docs.insert(key.to_string(), document);
        backend.notify(key);
        trace!(key, client = self.id, "document written");
        Ok(())
    }

    async fn write_field(&self, key: &str, field: &str, value: Value) -> Result<(), RelayError> {
        let mut backend = self.relay.online()?;
        backend.document_mut(key).insert(field.to_string(), value);
        backend.notify(key);
        trace!(key, field, client = self.id, "field written");
        Ok(())
    }

    async fn append_child(
        &self,
        key: &str,
        collection: &str,
        value: Value,
    ) -> Result<String, RelayError> {
        let mut backend = self.relay.online()?;
        backend.next_child += 1;
        let id = format!("-c{:016}", backend.next_child);

        let doc = backend.document_mut(key);
        let entry = doc
            .entry(collection.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(children) = entry {
            children.insert(id.clone(), value);
        }
        backend.notify(key);
        Ok(id)
    }

    async fn subscribe_field(&self, key: &str, field: &str) -> Result<FieldStream, RelayError> {
        let mut backend = self.relay.online()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let current = backend.field_value(key, field);
        let _ = tx.send(current.clone());
        backend.subscribers.push(Subscriber {
            client: self.id,
            key: key.to_string(),
            field: field.to_string(),
            sink: Sink::Field { tx, last: current },
        });
        Ok(rx)
    }

    async fn subscribe_child_added(
        &self,
        key: &str,
        collection: &str,
    ) -> Result<ChildStream, RelayError> {
        let mut backend = self.relay.online()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut seen = HashSet::new();
        for (id, value) in backend.children(key, collection) {
            seen.insert(id.clone());
            let _ = tx.send((id, value));
        }
        backend.subscribers.push(Subscriber {
            client: self.id,
            key: key.to_string(),
            field: collection.to_string(),
            sink: Sink::Children { tx, seen },
        });
        Ok(rx)
    }

    async fn unsubscribe_all(&self, key: &str) -> Result<(), RelayError> {
        let mut backend = self.relay.online()?;
        let id = self.id;
        backend
            .subscribers
            .retain(|sub| !(sub.client == id && sub.key == key));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RelayError> {
        let mut backend = self.relay.online()?;
        backend.deletes += 1;
        if backend.docs.remove(key).is_some() {
            backend.notify(key);
        }
        trace!(key, client = self.id, "document deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn field_subscription_sees_current_then_changes() {
        let relay = MemoryRelay::new();
        let a = relay.client();
        let b = relay.client();

        a.write("s", json!({"offer": "o", "answer": null})).await.unwrap();
        let mut answers = b.subscribe_field("s", "answer").await.unwrap();
        assert_eq!(answers.recv().await, Some(Value::Null));

        a.write_field("s", "answer", json!("x")).await.unwrap();
        assert_eq!(answers.recv().await, Some(json!("x")));

        // unchanged value is not redelivered
        a.write_field("s", "offer", json!("o2")).await.unwrap();
        a.delete("s").await.unwrap();
        assert_eq!(answers.recv().await, Some(Value::Null));
    }

    #[tokio::test]
    async fn child_added_replays_existing_children_in_order() {
        let relay = MemoryRelay::new();
        let a = relay.client();
        let first = a.append_child("s", "candidates", json!(1)).await.unwrap();
        let second = a.append_child("s", "candidates", json!(2)).await.unwrap();
        assert!(first < second);

        let mut rx = a.subscribe_child_added("s", "candidates").await.unwrap();
        a.append_child("s", "candidates", json!(3)).await.unwrap();

        let got: Vec<Value> = vec![
            rx.recv().await.unwrap().1,
            rx.recv().await.unwrap().1,
            rx.recv().await.unwrap().1,
        ];
        assert_eq!(got, vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn write_field_keeps_siblings() {
        let relay = MemoryRelay::new();
        let a = relay.client();
        a.write("s", json!({"offer": "o"})).await.unwrap();
        a.append_child("s", "candidates", json!("c")).await.unwrap();
        a.write_field("s", "answer", json!("x")).await.unwrap();

        let doc = relay.snapshot("s").unwrap();
        assert_eq!(doc["offer"], "o");
        assert_eq!(doc["answer"], "x");
        assert_eq!(doc["candidates"].as_object().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_is_per_client() {
        let relay = MemoryRelay::new();
        let a = relay.client();
        let b = relay.client();
        let mut ra = a.subscribe_field("s", "answer").await.unwrap();
        let mut rb = b.subscribe_field("s", "answer").await.unwrap();
        ra.recv().await;
        rb.recv().await;

        a.unsubscribe_all("s").await.unwrap();
        b.write_field("s", "answer", json!("x")).await.unwrap();

        assert_eq!(ra.recv().await, None);
        assert_eq!(rb.recv().await, Some(json!("x")));
        assert_eq!(relay.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn offline_fails_every_operation() {
        let relay = MemoryRelay::new();
        let a = relay.client();
        relay.set_offline(true);
        assert!(matches!(a.read("s").await, Err(RelayError::Unavailable(_))));
        assert!(a.write("s", json!({})).await.is_err());
        assert!(a.delete("s").await.is_err());

        relay.set_offline(false);
        assert!(a.read("s").await.unwrap().is_none());
        assert_eq!(relay.read_count(), 1);
    }
}
