//! Addons: small, independently loaded content units driven by the host.
//!
//! An addon is a manifest (message or tutorial) plus a condition gating its
//! visibility. The manager owns the full lifecycle: building the condition
//! from the manifest's gate block, granting the capability surface, showing
//! and hiding content on condition transitions, and tearing down every
//! signal subscription when the unit is unloaded or replaced.

pub mod api;
pub mod composer;
pub mod condition;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Weak};
use uuid::Uuid;

use crate::host::error::{AddonError, AddonResult};
use crate::host::signal::{SignalBus, SignalHandler, SignalSource, SubscriptionHandle};
use crate::host::state::HostState;
use api::AddonApi;
use composer::{Composer, MessageContent};
use condition::{Condition, ConditionEngine, ConditionId, ManifestGate};

/// Query path of the element mirroring the tutorial playback state.
pub const TUTORIAL_ELEMENT: &str = "tutorial";

/// One step of a tutorial.
#[derive(Debug, Clone, Deserialize)]
pub struct TutorialStep {
    /// Step identity, unique within the tutorial.
    pub id: String,
    /// Query path of the element the user must click to advance.
    pub element: String,
    /// Optional instruction shown for the step.
    #[serde(default)]
    pub title: String,
}

/// Tutorial payload of a manifest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TutorialManifest {
    /// Ordered steps.
    #[serde(default)]
    pub steps: Vec<TutorialStep>,
}

/// A parsed addon manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct AddonManifest {
    /// Addon identity.
    pub id: String,
    /// Unit kind: `message` or `tutorial`.
    pub kind: String,
    /// Declarative condition block (gate name → gate config).
    #[serde(default)]
    pub conditions: Map<String, Value>,
    /// Message payload, for `kind: message`.
    #[serde(default)]
    pub message: Option<MessageContent>,
    /// Tutorial payload, for `kind: tutorial`.
    #[serde(default)]
    pub tutorial: Option<TutorialManifest>,
}

struct Playback {
    step: usize,
    subscription: SubscriptionHandle,
}

#[derive(Clone)]
enum AddonUnit {
    Message {
        composer: Composer,
    },
    Tutorial {
        steps: Arc<Vec<TutorialStep>>,
        playback: Arc<Mutex<Option<Playback>>>,
    },
}

struct LoadedAddon {
    instance: Uuid,
    condition_id: ConditionId,
    condition: Arc<Condition>,
    unit: AddonUnit,
}

struct ManagerInner {
    state: Arc<HostState>,
    bus: Arc<SignalBus>,
    engine: ConditionEngine,
    loaded: Mutex<HashMap<String, LoadedAddon>>,
}

/// Owns loaded addons and their lifecycle.
#[derive(Clone)]
pub struct AddonManager {
    inner: Arc<ManagerInner>,
}

impl AddonManager {
    /// Create a manager over the given state, bus, and engine.
    pub fn new(state: Arc<HostState>, bus: Arc<SignalBus>, engine: ConditionEngine) -> Self {
        AddonManager {
            inner: Arc::new(ManagerInner {
                state,
                bus,
                engine,
                loaded: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Load a manifest from a JSON file.
    pub fn load_from_path(&self, path: &Path) -> AddonResult<String> {
        if !path.exists() {
            return Err(AddonError::ManifestNotFound(path.to_path_buf()));
        }
        let text = fs::read_to_string(path)?;
        let manifest: AddonManifest = serde_json::from_str(&text)?;
        self.load(manifest)
    }

    /// Load (or hot-swap) an addon.
    ///
    /// The condition is built from the manifest's gate block and evaluated
    /// once synchronously; enabled content becomes observable before this
    /// returns. Loading an id that is already loaded replaces it.
    pub fn load(&self, manifest: AddonManifest) -> AddonResult<String> {
        if manifest.id.is_empty() {
            return Err(AddonError::InvalidManifest("empty addon id".to_string()));
        }

        // Replace-on-reload keeps stale subscriptions from outliving the
        // previous incarnation.
        if self.inner.loaded.lock().contains_key(&manifest.id) {
            self.unload(&manifest.id)?;
        }

        let gate = ManifestGate::from_conditions(&manifest.conditions)?;
        let id = manifest.id.clone();

        let (unit, api, on_change) = match manifest.kind.as_str() {
            "message" => {
                let content = manifest.message.clone().unwrap_or_default();
                let composer = Composer::new(&id, content, self.inner.state.clone());
                let api = AddonApi::new(&id, self.inner.state.clone())
                    .with_composer(composer.clone());

                let state = self.inner.state.clone();
                let shown = composer.clone();
                let on_change: Box<dyn Fn(bool) + Send + Sync> = Box::new(move |enabled| {
                    let path = shown.element_path();
                    if enabled {
                        state.elements.register(&path, shown.element_properties());
                    } else {
                        state.elements.unregister(&path);
                    }
                });

                (AddonUnit::Message { composer }, api, on_change)
            }
            "tutorial" => {
                let tutorial = manifest.tutorial.clone().unwrap_or_default();
                let steps = Arc::new(tutorial.steps);
                let playback: Arc<Mutex<Option<Playback>>> = Arc::new(Mutex::new(None));
                let api = AddonApi::new(&id, self.inner.state.clone());

                let state = self.inner.state.clone();
                let bus = self.inner.bus.clone();
                let marker = format!("tutorial-{id}");
                let playback_for_change = playback.clone();
                let on_change: Box<dyn Fn(bool) + Send + Sync> = Box::new(move |enabled| {
                    if enabled {
                        let mut properties = HashMap::new();
                        properties.insert("available".to_string(), json!(true));
                        state.elements.register(&marker, properties);
                    } else {
                        state.elements.unregister(&marker);
                        stop_playback(&state, &bus, &playback_for_change);
                    }
                });

                (AddonUnit::Tutorial { steps, playback }, api, on_change)
            }
            other => {
                return Err(AddonError::InvalidManifest(format!(
                    "unknown addon kind '{other}'"
                )));
            }
        };

        let (condition_id, condition) =
            self.inner
                .engine
                .register(Box::new(gate), api, Some(on_change));

        self.inner.loaded.lock().insert(
            id.clone(),
            LoadedAddon {
                instance: Uuid::new_v4(),
                condition_id,
                condition,
                unit,
            },
        );

        tracing::info!(addon = %id, "addon loaded");
        Ok(id)
    }

    /// Unload an addon, tearing down its condition, subscriptions, timers,
    /// and observable elements.
    pub fn unload(&self, id: &str) -> AddonResult<()> {
        let addon = self
            .inner
            .loaded
            .lock()
            .remove(id)
            .ok_or_else(|| AddonError::UnknownAddon(id.to_string()))?;

        self.inner.engine.unregister(addon.condition_id);

        match addon.unit {
            AddonUnit::Message { composer } => {
                self.inner.state.elements.unregister(&composer.element_path());
            }
            AddonUnit::Tutorial { playback, .. } => {
                stop_playback(&self.inner.state, &self.inner.bus, &playback);
                self.inner
                    .state
                    .elements
                    .unregister(&format!("tutorial-{id}"));
            }
        }

        tracing::info!(addon = %id, "addon unloaded");
        Ok(())
    }

    /// Unload every addon.
    pub fn unload_all(&self) {
        let ids: Vec<String> = self.inner.loaded.lock().keys().cloned().collect();
        for id in ids {
            let _ = self.unload(&id);
        }
    }

    /// Ids of currently loaded addons.
    pub fn loaded_ids(&self) -> Vec<String> {
        self.inner.loaded.lock().keys().cloned().collect()
    }

    /// Condition state of a loaded addon.
    pub fn is_enabled(&self, id: &str) -> Option<bool> {
        self.inner
            .loaded
            .lock()
            .get(id)
            .map(|addon| addon.condition.is_enabled())
    }

    /// Instance identity of a loaded addon (changes on hot-swap).
    pub fn instance(&self, id: &str) -> Option<Uuid> {
        self.inner.loaded.lock().get(id).map(|addon| addon.instance)
    }

    /// Composer of a loaded message addon.
    pub fn composer(&self, id: &str) -> Option<Composer> {
        match self.inner.loaded.lock().get(id).map(|addon| &addon.unit) {
            Some(AddonUnit::Message { composer }) => Some(composer.clone()),
            _ => None,
        }
    }

    /// Start playing a loaded, enabled tutorial.
    ///
    /// While playing, the [`TUTORIAL_ELEMENT`] element mirrors the current
    /// step; a `clicked` signal on the step's target element advances.
    pub fn start_tutorial(&self, id: &str) -> AddonResult<()> {
        let (steps, playback, enabled) = {
            let loaded = self.inner.loaded.lock();
            let addon = loaded
                .get(id)
                .ok_or_else(|| AddonError::UnknownAddon(id.to_string()))?;
            match &addon.unit {
                AddonUnit::Tutorial { steps, playback } => (
                    steps.clone(),
                    playback.clone(),
                    addon.condition.is_enabled(),
                ),
                AddonUnit::Message { .. } => {
                    return Err(AddonError::NotATutorial(id.to_string()));
                }
            }
        };

        if !enabled {
            return Err(AddonError::Disabled(id.to_string()));
        }

        stop_playback(&self.inner.state, &self.inner.bus, &playback);

        if steps.is_empty() {
            self.inner
                .bus
                .publish(SignalSource::addon(id), "tutorialCompleted", None);
            return Ok(());
        }

        let subscription = subscribe_step(&self.inner, id, &steps[0].element);
        *playback.lock() = Some(Playback {
            step: 0,
            subscription,
        });
        self.inner
            .state
            .elements
            .register(TUTORIAL_ELEMENT, tutorial_element_properties(id, &steps, 0));

        tracing::info!(addon = %id, "tutorial started");
        Ok(())
    }
}

fn stop_playback(state: &Arc<HostState>, bus: &Arc<SignalBus>, playback: &Arc<Mutex<Option<Playback>>>) {
    if let Some(playback) = playback.lock().take() {
        bus.unsubscribe(&playback.subscription);
        state.elements.unregister(TUTORIAL_ELEMENT);
    }
}

fn subscribe_step(inner: &Arc<ManagerInner>, addon_id: &str, element: &str) -> SubscriptionHandle {
    let weak: Weak<ManagerInner> = Arc::downgrade(inner);
    let addon_id = addon_id.to_string();
    let handler: SignalHandler = Arc::new(move |_signal| {
        if let Some(inner) = weak.upgrade() {
            advance_tutorial(&inner, &addon_id);
        }
        Ok(())
    });
    inner
        .bus
        .subscribe(SignalSource::element(element), "clicked", handler)
}

fn advance_tutorial(inner: &Arc<ManagerInner>, addon_id: &str) {
    let unit = {
        let loaded = inner.loaded.lock();
        match loaded.get(addon_id).map(|addon| addon.unit.clone()) {
            Some(unit) => unit,
            None => return,
        }
    };
    let AddonUnit::Tutorial { steps, playback } = unit else {
        return;
    };

    let mut slot = playback.lock();
    let Some(current) = slot.as_ref() else {
        return;
    };
    inner.bus.unsubscribe(&current.subscription);

    let next = current.step + 1;
    if next >= steps.len() {
        *slot = None;
        drop(slot);
        inner.state.elements.unregister(TUTORIAL_ELEMENT);
        inner
            .bus
            .publish(SignalSource::addon(addon_id), "tutorialCompleted", None);
        tracing::info!(addon = %addon_id, "tutorial completed");
        return;
    }

    let subscription = subscribe_step(inner, addon_id, &steps[next].element);
    *slot = Some(Playback {
        step: next,
        subscription,
    });
    drop(slot);
    inner.state.elements.register(
        TUTORIAL_ELEMENT,
        tutorial_element_properties(addon_id, &steps, next),
    );
}

fn tutorial_element_properties(
    addon_id: &str,
    steps: &[TutorialStep],
    index: usize,
) -> HashMap<String, Value> {
    let mut properties = HashMap::new();
    properties.insert("playing".to_string(), json!(true));
    properties.insert("tutorialId".to_string(), json!(addon_id));
    properties.insert("currentStep".to_string(), json!(index));
    properties.insert("stepCount".to_string(), json!(steps.len()));
    properties.insert("stepId".to_string(), json!(steps[index].id));
    properties.insert("stepElement".to_string(), json!(steps[index].element));
    properties.insert("stepTitle".to_string(), json!(steps[index].title));
    properties
}
