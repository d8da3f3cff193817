//! Conditions and the engine that evaluates them.
//!
//! Every addon owns exactly one [`Condition`], a boolean gate over its
//! content. The engine runs the owning script once at load and again on
//! every watched signal or due timer; each run terminates in exactly one
//! enable/disable. A script failure never propagates: the condition fails
//! closed and the content stays hidden.
//!
//! Each condition owns at most one named timer slot. Scheduling a new
//! deadline replaces the previous one, so stale timers cannot stack up
//! behind a rescheduling script.

use chrono::{DateTime, Duration as TimeDelta, Utc};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use uuid::Uuid;

use super::api::AddonApi;
use crate::host::error::{AddonError, AddonResult, ScriptError, ScriptResult};
use crate::host::signal::{SignalBus, SignalHandler, SignalSource, SubscriptionHandle};
use crate::util::version::Version;

// ---------------------------------------------------------------------------
// Clock

/// Time source for the engine. Tests inject a [`ManualClock`].
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        ManualClock {
            now: Mutex::new(start),
        }
    }

    /// Jump to an absolute instant.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    /// Advance by a delta.
    pub fn advance(&self, delta: TimeDelta) {
        let mut now = self.now.lock();
        *now += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// ---------------------------------------------------------------------------
// Condition

/// Boolean gate over one addon's content. Starts disabled; only the
/// engine's evaluation of the owning script flips it.
pub struct Condition {
    enabled: AtomicBool,
}

impl Condition {
    fn new() -> Self {
        Condition {
            enabled: AtomicBool::new(false),
        }
    }

    /// Current gate state.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

/// Engine-assigned identity of a registered condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConditionId(Uuid);

impl ConditionId {
    fn new() -> Self {
        ConditionId(Uuid::new_v4())
    }
}

impl fmt::Display for ConditionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Script contract

/// Signal interests declared by a script at attach time.
#[derive(Default)]
pub struct AttachContext {
    watches: Vec<(SignalSource, String)>,
}

impl AttachContext {
    /// Re-evaluate the condition whenever `(source, name)` fires.
    pub fn watch(&mut self, source: SignalSource, name: impl Into<String>) {
        self.watches.push((source, name.into()));
    }
}

enum TimerRequest {
    Keep,
    Arm(Duration),
    Clear,
}

/// Evaluation context handed to a script run.
pub struct EvalContext<'a> {
    api: &'a AddonApi,
    now: DateTime<Utc>,
    timer: TimerRequest,
}

impl<'a> EvalContext<'a> {
    /// The capability surface of the owning addon.
    pub fn api(&self) -> &AddonApi {
        self.api
    }

    /// The instant this evaluation runs at.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Arm the condition's timer slot to re-evaluate after `after`,
    /// replacing any previously scheduled deadline.
    pub fn set_timed_callback(&mut self, after: Duration) {
        self.timer = TimerRequest::Arm(after);
    }

    /// Cancel the condition's timer slot.
    pub fn clear_timers(&mut self) {
        self.timer = TimerRequest::Clear;
    }
}

/// One addon's gating script.
///
/// `attach` runs once at load and declares signal interests; `evaluate`
/// runs at load and on every re-evaluation trigger, returning the gate
/// state as its single terminal outcome.
pub trait ConditionScript: Send {
    /// Declare signal interests. Default: none.
    fn attach(&mut self, _cx: &mut AttachContext) {}

    /// Compute the gate state.
    fn evaluate(&mut self, cx: &mut EvalContext<'_>) -> ScriptResult<bool>;
}

// ---------------------------------------------------------------------------
// Engine

struct EntryCell {
    script: Box<dyn ConditionScript>,
    api: AddonApi,
    subscriptions: Vec<SubscriptionHandle>,
}

struct Entry {
    condition: Arc<Condition>,
    on_change: Option<Box<dyn Fn(bool) + Send + Sync>>,
    cell: Mutex<EntryCell>,
}

struct EngineInner {
    clock: Arc<dyn Clock>,
    bus: Arc<SignalBus>,
    entries: Mutex<HashMap<ConditionId, Arc<Entry>>>,
    timers: Mutex<HashMap<ConditionId, DateTime<Utc>>>,
}

/// Evaluates registered conditions and owns their timer slots.
#[derive(Clone)]
pub struct ConditionEngine {
    inner: Arc<EngineInner>,
}

impl ConditionEngine {
    /// Create an engine publishing re-evaluations through `bus`.
    pub fn new(bus: Arc<SignalBus>, clock: Arc<dyn Clock>) -> Self {
        ConditionEngine {
            inner: Arc::new(EngineInner {
                clock,
                bus,
                entries: Mutex::new(HashMap::new()),
                timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a script: attach it, wire its signal interests, and run the
    /// initial evaluation. `on_change` fires on every transition of the
    /// resulting condition, including the initial disabled→enabled one.
    pub fn register(
        &self,
        mut script: Box<dyn ConditionScript>,
        api: AddonApi,
        on_change: Option<Box<dyn Fn(bool) + Send + Sync>>,
    ) -> (ConditionId, Arc<Condition>) {
        let id = ConditionId::new();
        let condition = Arc::new(Condition::new());

        let mut attach_cx = AttachContext::default();
        script.attach(&mut attach_cx);

        let entry = Arc::new(Entry {
            condition: condition.clone(),
            on_change,
            cell: Mutex::new(EntryCell {
                script,
                api,
                subscriptions: Vec::new(),
            }),
        });
        self.inner.entries.lock().insert(id, entry.clone());

        let mut handles = Vec::with_capacity(attach_cx.watches.len());
        for (source, name) in attach_cx.watches {
            let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
            let handler: SignalHandler = Arc::new(move |_signal| {
                match weak.upgrade() {
                    Some(inner) => reevaluate(&inner, id),
                    None => Ok(()),
                }
            });
            handles.push(self.inner.bus.subscribe(source, name, handler));
        }
        entry.cell.lock().subscriptions = handles;

        if let Err(err) = reevaluate(&self.inner, id) {
            tracing::warn!(condition = %id, "initial condition evaluation failed: {err}");
        }

        (id, condition)
    }

    /// Tear a condition down: drop its signal subscriptions and timer slot.
    pub fn unregister(&self, id: ConditionId) {
        let entry = self.inner.entries.lock().remove(&id);
        self.inner.timers.lock().remove(&id);

        if let Some(entry) = entry {
            let handles = std::mem::take(&mut entry.cell.lock().subscriptions);
            for handle in &handles {
                self.inner.bus.unsubscribe(handle);
            }
        }
    }

    /// Force a re-evaluation outside of any signal or timer.
    pub fn reevaluate(&self, id: ConditionId) -> ScriptResult<()> {
        reevaluate(&self.inner, id)
    }

    /// Fire every timer due at `now`. A deadline is consumed before its
    /// evaluation runs, so a script can re-arm from inside the evaluation.
    pub fn pump(&self, now: DateTime<Utc>) {
        let due: Vec<ConditionId> = {
            let mut timers = self.inner.timers.lock();
            let due: Vec<ConditionId> = timers
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            for id in &due {
                timers.remove(id);
            }
            due
        };

        for id in due {
            if let Err(err) = reevaluate(&self.inner, id) {
                tracing::warn!(condition = %id, "timed re-evaluation failed: {err}");
            }
        }
    }

    /// Earliest scheduled deadline, if any timer is armed.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.inner.timers.lock().values().min().copied()
    }

    /// Number of registered conditions.
    pub fn condition_count(&self) -> usize {
        self.inner.entries.lock().len()
    }
}

fn reevaluate(inner: &Arc<EngineInner>, id: ConditionId) -> ScriptResult<()> {
    let entry = match inner.entries.lock().get(&id) {
        Some(entry) => entry.clone(),
        None => return Ok(()),
    };

    // A script whose own evaluation re-triggers itself (e.g. by mutating a
    // watched setting) would otherwise self-deadlock; skip the nested run.
    let Some(mut cell) = entry.cell.try_lock() else {
        tracing::warn!(condition = %id, "re-entrant evaluation skipped");
        return Ok(());
    };

    let now = inner.clock.now();
    let previous = entry.condition.is_enabled();

    let EntryCell { script, api, .. } = &mut *cell;
    let mut cx = EvalContext {
        api,
        now,
        timer: TimerRequest::Keep,
    };
    let outcome = script.evaluate(&mut cx);
    let timer = cx.timer;

    let (enabled, failure) = match outcome {
        Ok(enabled) => (enabled, None),
        Err(err) => (false, Some(err)),
    };
    entry.condition.set(enabled);

    {
        let mut timers = inner.timers.lock();
        match timer {
            TimerRequest::Arm(after) => {
                let delta = TimeDelta::from_std(after).unwrap_or(TimeDelta::MAX);
                let deadline = now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC);
                timers.insert(id, deadline);
            }
            TimerRequest::Clear => {
                timers.remove(&id);
            }
            TimerRequest::Keep => {}
        }
    }

    drop(cell);

    if previous != enabled {
        if let Some(on_change) = &entry.on_change {
            on_change(enabled);
        }
    }

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Declarative gates

/// One clause of a declarative condition block.
pub trait Gate: Send {
    /// Signals whose delivery should re-run the check. Default: none.
    fn watches(&self) -> Vec<(SignalSource, String)> {
        Vec::new()
    }

    /// Evaluate the clause.
    fn check(&mut self, cx: &mut EvalContext<'_>) -> ScriptResult<bool>;
}

/// Factory building a gate from its manifest configuration value.
pub type GateFactory = Arc<dyn Fn(&Value) -> AddonResult<Box<dyn Gate>> + Send + Sync>;

/// Global catalog of gate factories keyed by condition-block name.
pub struct GateCatalog {
    factories: RwLock<HashMap<String, GateFactory>>,
}

static CATALOG: Lazy<GateCatalog> = Lazy::new(|| {
    let catalog = GateCatalog {
        factories: RwLock::new(HashMap::new()),
    };
    register_builtin_gates(&catalog);
    catalog
});

impl GateCatalog {
    /// Access the global catalog singleton.
    pub fn global() -> &'static Self {
        &CATALOG
    }

    /// Register a gate factory under a condition-block key.
    pub fn register<F>(&self, key: &str, factory: F)
    where
        F: Fn(&Value) -> AddonResult<Box<dyn Gate>> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .insert(key.to_string(), Arc::new(factory));
    }

    /// Build the gate registered under `key`.
    pub fn build(&self, key: &str, config: &Value) -> AddonResult<Box<dyn Gate>> {
        let factory = self
            .factories
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| AddonError::UnknownGate(key.to_string()))?;
        factory(config)
    }
}

fn string_list(config: &Value, key: &str) -> AddonResult<Vec<String>> {
    config
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .ok_or_else(|| AddonError::InvalidManifest(format!("'{key}' expects a list of strings")))
}

fn register_builtin_gates(catalog: &GateCatalog) {
    catalog.register("enabled_features", |config| {
        Ok(Box::new(EnabledFeaturesGate {
            features: string_list(config, "enabled_features")?,
        }))
    });

    catalog.register("platforms", |config| {
        Ok(Box::new(PlatformsGate {
            platforms: string_list(config, "platforms")?,
        }))
    });

    catalog.register("min_client_version", |config| {
        let min = config.as_str().ok_or_else(|| {
            AddonError::InvalidManifest("'min_client_version' expects a string".to_string())
        })?;
        Ok(Box::new(MinClientVersionGate {
            min: min.to_string(),
        }))
    });

    catalog.register("days_after_subscription", |config| {
        let days = config.as_i64().ok_or_else(|| {
            AddonError::InvalidManifest("'days_after_subscription' expects a number".to_string())
        })?;
        Ok(Box::new(DaysAfterSubscriptionGate { days }))
    });

    catalog.register("never", |_config| Ok(Box::new(NeverGate)));
}

struct EnabledFeaturesGate {
    features: Vec<String>,
}

impl Gate for EnabledFeaturesGate {
    fn watches(&self) -> Vec<(SignalSource, String)> {
        self.features
            .iter()
            .map(|feature| (SignalSource::feature_list(), feature.clone()))
            .collect()
    }

    fn check(&mut self, cx: &mut EvalContext<'_>) -> ScriptResult<bool> {
        let features = cx
            .api()
            .feature_list()
            .ok_or_else(|| ScriptError::new("feature list capability unavailable"))?
            .clone();
        Ok(self.features.iter().all(|f| features.is_supported(f)))
    }
}

struct PlatformsGate {
    platforms: Vec<String>,
}

impl Gate for PlatformsGate {
    fn check(&mut self, cx: &mut EvalContext<'_>) -> ScriptResult<bool> {
        let env = cx
            .api()
            .env()
            .ok_or_else(|| ScriptError::new("env capability unavailable"))?;
        Ok(self.platforms.contains(&env.platform()))
    }
}

struct MinClientVersionGate {
    min: String,
}

impl Gate for MinClientVersionGate {
    fn check(&mut self, cx: &mut EvalContext<'_>) -> ScriptResult<bool> {
        let env = cx
            .api()
            .env()
            .ok_or_else(|| ScriptError::new("env capability unavailable"))?;

        // A version that does not parse never reaches the comparison:
        // unknown versions keep the content hidden.
        let Some(min) = Version::parse(&self.min) else {
            return Ok(false);
        };
        let Some(current) = Version::parse(&env.version_string()) else {
            return Ok(false);
        };
        Ok(current >= min)
    }
}

struct DaysAfterSubscriptionGate {
    days: i64,
}

impl Gate for DaysAfterSubscriptionGate {
    fn watches(&self) -> Vec<(SignalSource, String)> {
        vec![(
            SignalSource::settings(),
            crate::host::state::SUBSCRIPTION_DATA_KEY.to_string(),
        )]
    }

    fn check(&mut self, cx: &mut EvalContext<'_>) -> ScriptResult<bool> {
        let data = cx
            .api()
            .subscription_data()
            .ok_or_else(|| ScriptError::new("subscription data capability unavailable"))?
            .data();

        let Some(created_at) = data.and_then(|data| data.created_at) else {
            return Ok(false);
        };

        let boundary = created_at
            .checked_add_signed(TimeDelta::days(self.days))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        if cx.now() >= boundary {
            Ok(true)
        } else {
            let remaining = (boundary - cx.now()).to_std().unwrap_or(Duration::ZERO);
            cx.set_timed_callback(remaining);
            Ok(false)
        }
    }
}

struct NeverGate;

impl Gate for NeverGate {
    fn check(&mut self, _cx: &mut EvalContext<'_>) -> ScriptResult<bool> {
        Ok(false)
    }
}

/// Conjunction of the gates named in an addon manifest's condition block.
///
/// Every gate is checked on every evaluation (no short-circuit), so a
/// time gate behind a false feature gate still arms its boundary timer.
pub struct ManifestGate {
    gates: Vec<Box<dyn Gate>>,
}

impl ManifestGate {
    /// Build the conjunction from a manifest `conditions` object.
    pub fn from_conditions(conditions: &Map<String, Value>) -> AddonResult<Self> {
        let mut gates = Vec::with_capacity(conditions.len());
        for (key, config) in conditions {
            gates.push(GateCatalog::global().build(key, config)?);
        }
        Ok(ManifestGate { gates })
    }
}

impl ConditionScript for ManifestGate {
    fn attach(&mut self, cx: &mut AttachContext) {
        for gate in &self.gates {
            for (source, name) in gate.watches() {
                cx.watch(source, name);
            }
        }
    }

    fn evaluate(&mut self, cx: &mut EvalContext<'_>) -> ScriptResult<bool> {
        let mut all = true;
        for gate in &mut self.gates {
            if !gate.check(cx)? {
                all = false;
            }
        }
        Ok(all)
    }
}
