//! Synchronous publish/subscribe bus for host state change notifications.
//!
//! Handlers are keyed by `(source, signal name)` and invoked in
//! registration order. Delivery snapshots the subscriber list before
//! running any handler, so subscriptions added during a publish never see
//! the in-flight signal. A failing handler is logged and skipped; it never
//! blocks delivery to the handlers behind it, since handlers belong to
//! independently authored scripts.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::error::ScriptResult;

/// Explicit identity of a signal emitter.
///
/// Sources are named strings rather than object references so ownership and
/// coupling stay visible: `settings`, `featureList`, `controller`,
/// `element:<path>`, `addon:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignalSource(String);

impl SignalSource {
    /// Arbitrary named source.
    pub fn new(id: impl Into<String>) -> Self {
        SignalSource(id.into())
    }

    /// The persisted settings store.
    pub fn settings() -> Self {
        SignalSource::new("settings")
    }

    /// The feature registry.
    pub fn feature_list() -> Self {
        SignalSource::new("featureList")
    }

    /// The connection controller stub.
    pub fn controller() -> Self {
        SignalSource::new("controller")
    }

    /// The navigation layer.
    pub fn navigator() -> Self {
        SignalSource::new("navigator")
    }

    /// A UI element, identified by its query path.
    pub fn element(path: &str) -> Self {
        SignalSource::new(format!("element:{path}"))
    }

    /// A loaded addon.
    pub fn addon(id: &str) -> Self {
        SignalSource::new(format!("addon:{id}"))
    }

    /// The raw source id.
    pub fn id(&self) -> &str {
        &self.0
    }
}

/// A delivered change notification.
#[derive(Debug, Clone)]
pub struct Signal {
    /// Who emitted the signal.
    pub source: SignalSource,
    /// Signal name within the source.
    pub name: String,
    /// Optional payload (new value, state name, ...).
    pub payload: Option<Value>,
}

/// Handler invoked synchronously on delivery.
pub type SignalHandler = Arc<dyn Fn(&Signal) -> ScriptResult<()> + Send + Sync>;

/// Ticket for one subscription; pass back to [`SignalBus::unsubscribe`].
///
/// Handles are owned by whoever loaded the subscribing script and must be
/// released no later than that script's teardown.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: Uuid,
    source: SignalSource,
    name: String,
}

impl SubscriptionHandle {
    /// The `(source, name)` pair this handle subscribes to.
    pub fn key(&self) -> (&SignalSource, &str) {
        (&self.source, &self.name)
    }
}

type SubscriberMap = HashMap<(SignalSource, String), Vec<(Uuid, SignalHandler)>>;

/// In-process signal bus.
pub struct SignalBus {
    subscribers: Mutex<SubscriberMap>,
}

impl SignalBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        SignalBus {
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a handler for `(source, name)`.
    ///
    /// Handlers for one pair run in registration order. The same closure
    /// may be registered more than once; each registration is a distinct
    /// subscription with its own handle.
    pub fn subscribe(
        &self,
        source: SignalSource,
        name: impl Into<String>,
        handler: SignalHandler,
    ) -> SubscriptionHandle {
        let name = name.into();
        let id = Uuid::new_v4();

        let mut subscribers = self.subscribers.lock();
        subscribers
            .entry((source.clone(), name.clone()))
            .or_default()
            .push((id, handler));

        SubscriptionHandle { id, source, name }
    }

    /// Remove one subscription. Returns whether it was still registered.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut subscribers = self.subscribers.lock();
        let key = (handle.source.clone(), handle.name.clone());

        if let Some(list) = subscribers.get_mut(&key) {
            let before = list.len();
            list.retain(|(id, _)| *id != handle.id);
            let removed = list.len() != before;
            if list.is_empty() {
                subscribers.remove(&key);
            }
            removed
        } else {
            false
        }
    }

    /// Deliver a signal to every handler currently registered for
    /// `(source, name)`, synchronously and in registration order.
    ///
    /// The subscriber list is snapshotted before the first handler runs and
    /// the lock is released, so handlers may freely subscribe or publish.
    pub fn publish(&self, source: SignalSource, name: impl Into<String>, payload: Option<Value>) {
        let name = name.into();

        let snapshot: Vec<(Uuid, SignalHandler)> = {
            let subscribers = self.subscribers.lock();
            subscribers
                .get(&(source.clone(), name.clone()))
                .map(|list| list.clone())
                .unwrap_or_default()
        };

        if snapshot.is_empty() {
            return;
        }

        let signal = Signal {
            source,
            name,
            payload,
        };

        for (id, handler) in snapshot {
            if let Err(err) = handler(&signal) {
                tracing::warn!(
                    source = signal.source.id(),
                    signal = %signal.name,
                    subscription = %id,
                    "signal handler failed: {err}"
                );
            }
        }
    }

    /// Number of live subscriptions, across all `(source, name)` pairs.
    pub fn subscription_count(&self) -> usize {
        self.subscribers.lock().values().map(Vec::len).sum()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        SignalBus::new()
    }
}
