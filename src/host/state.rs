//! Mutable host state observed and driven through the protocol.
//!
//! Everything here is owned by the host process. Scripts and drivers only
//! reach it through defined verbs: dispatcher commands on one side, the
//! addon capability surface on the other. Mutators publish on the signal
//! bus after releasing their locks, so subscribed condition scripts can
//! re-evaluate synchronously without deadlocking.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::error::{SettingsError, SettingsResult};
use super::signal::{SignalBus, SignalSource};

/// Settings key holding the subscription JSON blob.
pub const SUBSCRIPTION_DATA_KEY: &str = "subscriptionData";

/// Settings key holding the installation timestamp (seconds since epoch).
pub const INSTALLATION_TIME_KEY: &str = "installationTime";

// ---------------------------------------------------------------------------
// Settings

/// Persisted key/value settings, stored as one JSON object.
///
/// Writes go through a temp-file-then-rename step so a crash never leaves a
/// half-written settings file behind.
pub struct SettingsStore {
    path: Option<PathBuf>,
    values: Mutex<Map<String, Value>>,
}

impl SettingsStore {
    /// Open (or create) the settings file under `root`.
    pub fn open(root: &Path) -> SettingsResult<Self> {
        fs::create_dir_all(root)?;
        let path = root.join("settings.json");

        let values = if path.exists() {
            let text = fs::read_to_string(&path)?;
            serde_json::from_str(&text)?
        } else {
            Map::new()
        };

        Ok(SettingsStore {
            path: Some(path),
            values: Mutex::new(values),
        })
    }

    /// Purely in-memory store (used by embedders and tests without a root).
    pub fn in_memory() -> Self {
        SettingsStore {
            path: None,
            values: Mutex::new(Map::new()),
        }
    }

    /// Read one setting.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().get(key).cloned()
    }

    /// Write one setting and persist the store.
    pub fn set(&self, key: &str, value: Value) -> SettingsResult<()> {
        let snapshot = {
            let mut values = self.values.lock();
            values.insert(key.to_string(), value);
            values.clone()
        };
        self.persist(&snapshot)
    }

    /// Remove one setting and persist the store.
    pub fn remove(&self, key: &str) -> SettingsResult<()> {
        let snapshot = {
            let mut values = self.values.lock();
            values.remove(key);
            values.clone()
        };
        self.persist(&snapshot)
    }

    /// Drop every setting and delete the backing file.
    pub fn wipe(&self) -> SettingsResult<()> {
        self.values.lock().clear();
        if let Some(path) = &self.path {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    fn persist(&self, snapshot: &Map<String, Value>) -> SettingsResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(&Value::Object(snapshot.clone()))?;
        fs::write(&tmp, text).map_err(|err| SettingsError::AtomicWriteFailed {
            path: tmp.clone(),
            detail: err.to_string(),
        })?;
        fs::rename(&tmp, path).map_err(|err| SettingsError::AtomicWriteFailed {
            path: path.clone(),
            detail: err.to_string(),
        })?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Features

/// Feature registry with default states plus runtime flip sets.
///
/// Flipping is a literal toggle of set membership: flipping the same
/// feature on twice returns it to its default state.
pub struct FeatureRegistry {
    defaults: RwLock<HashMap<String, bool>>,
    flipped_on: RwLock<HashSet<String>>,
    flipped_off: RwLock<HashSet<String>>,
}

impl FeatureRegistry {
    fn new() -> Self {
        FeatureRegistry {
            defaults: RwLock::new(HashMap::new()),
            flipped_on: RwLock::new(HashSet::new()),
            flipped_off: RwLock::new(HashSet::new()),
        }
    }

    /// Declare a feature and its default supported state.
    pub fn register(&self, name: &str, default_on: bool) {
        self.defaults.write().insert(name.to_string(), default_on);
    }

    /// Whether the feature exists in the registry.
    pub fn exists(&self, name: &str) -> bool {
        self.defaults.read().contains_key(name)
    }

    /// Effective supported state: flipped-on wins, then flipped-off, then
    /// the registered default.
    pub fn is_supported(&self, name: &str) -> bool {
        if self.flipped_on.read().contains(name) {
            return true;
        }
        if self.flipped_off.read().contains(name) {
            return false;
        }
        self.defaults.read().get(name).copied().unwrap_or(false)
    }

    /// Whether the feature is currently in the flipped-on set.
    pub fn is_flipped_on(&self, name: &str) -> bool {
        self.flipped_on.read().contains(name)
    }

    /// Whether the feature is currently in the flipped-off set.
    pub fn is_flipped_off(&self, name: &str) -> bool {
        self.flipped_off.read().contains(name)
    }

    fn toggle(set: &RwLock<HashSet<String>>, name: &str) {
        let mut set = set.write();
        if !set.remove(name) {
            set.insert(name.to_string());
        }
    }

    fn clear(&self) {
        self.flipped_on.write().clear();
        self.flipped_off.write().clear();
    }
}

// ---------------------------------------------------------------------------
// Environment, location, controller

/// Static environment facts exposed to scripts.
#[derive(Debug, Clone)]
pub struct EnvInfo {
    /// Platform identifier (`linux`, `macos`, `windows`, `android`, `ios`).
    pub platform: String,
    /// Client version string.
    pub version_string: String,
    /// Operating system version string.
    pub os_version: String,
    /// Whether this is a production build.
    pub in_production: bool,
}

impl Default for EnvInfo {
    fn default() -> Self {
        EnvInfo {
            platform: std::env::consts::OS.to_string(),
            version_string: crate::VERSION.to_string(),
            os_version: String::new(),
            in_production: true,
        }
    }
}

/// Geo hint exposed to scripts.
#[derive(Debug, Clone, Default)]
pub struct Location {
    /// ISO country code, empty when unknown.
    pub country_code: String,
}

/// Connection states of the controller stub.
///
/// The real connection state machine is an external collaborator; the host
/// only mirrors its externally visible state for scripts and drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Tunnel down.
    Off,
    /// Activation requested.
    Connecting,
    /// Tunnel up.
    On,
    /// Deactivation requested.
    Disconnecting,
}

impl ControllerState {
    /// Wire name of the state.
    pub fn name(&self) -> &'static str {
        match self {
            ControllerState::Off => "off",
            ControllerState::Connecting => "connecting",
            ControllerState::On => "on",
            ControllerState::Disconnecting => "disconnecting",
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription data

/// How the subscription was purchased.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionType {
    /// Purchased on the web.
    Web,
    /// Apple in-app purchase.
    Apple,
    /// Google in-app purchase.
    Google,
    /// Missing or unrecognized.
    Unknown,
}

/// Billing cadence of the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingInterval {
    /// Monthly plan.
    Monthly,
    /// Six-month plan.
    HalfYearly,
    /// Yearly plan.
    Yearly,
    /// Missing or unrecognized.
    Unknown,
}

/// Defensive view over the stored subscription JSON blob.
///
/// Scripts must tolerate missing or malformed stored data, so every field
/// degrades to an unknown/absent value instead of failing the parse.
#[derive(Debug, Clone)]
pub struct SubscriptionData {
    /// When the subscription was created.
    pub created_at: Option<DateTime<Utc>>,
    /// Purchase channel.
    pub sub_type: SubscriptionType,
    /// Billing cadence.
    pub billing_interval: BillingInterval,
    /// Whether the subscription is currently active.
    pub active: bool,
}

impl SubscriptionData {
    /// Parse the stored blob. Never fails; unrecognized pieces degrade to
    /// unknown values.
    pub fn parse(blob: &Value) -> Self {
        let subscription = blob.get("subscription");

        let created_at = subscription
            .and_then(|sub| sub.get("created"))
            .and_then(Value::as_i64)
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

        let sub_type = match subscription
            .and_then(|sub| sub.get("type"))
            .and_then(Value::as_str)
        {
            Some("web") => SubscriptionType::Web,
            Some("apple") => SubscriptionType::Apple,
            Some("google") => SubscriptionType::Google,
            _ => SubscriptionType::Unknown,
        };

        let plan = subscription.and_then(|sub| sub.get("plan"));
        let interval = plan.and_then(|p| p.get("interval")).and_then(Value::as_str);
        let interval_count = plan
            .and_then(|p| p.get("interval_count"))
            .and_then(Value::as_i64)
            .unwrap_or(1);

        let billing_interval = match (interval, interval_count) {
            (Some("month"), 1) => BillingInterval::Monthly,
            (Some("month"), 6) => BillingInterval::HalfYearly,
            (Some("year"), _) => BillingInterval::Yearly,
            _ => BillingInterval::Unknown,
        };

        let active = subscription
            .and_then(|sub| sub.get("active"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        SubscriptionData {
            created_at,
            sub_type,
            billing_interval,
            active,
        }
    }

    /// Web subscription on a monthly plan.
    pub fn is_monthly_web_plan(&self) -> bool {
        self.sub_type == SubscriptionType::Web
            && self.billing_interval == BillingInterval::Monthly
    }
}

// ---------------------------------------------------------------------------
// Element tree

#[derive(Debug, Clone)]
struct ElementNode {
    name: String,
    properties: HashMap<String, Value>,
    children: Vec<ElementNode>,
}

impl ElementNode {
    fn new(name: &str) -> Self {
        ElementNode {
            name: name.to_string(),
            properties: HashMap::new(),
            children: Vec::new(),
        }
    }
}

/// Named tree of observable UI elements.
///
/// Queries are slash-separated paths from a root, `*` matching any single
/// segment: `main/serverList/*`. Elements are registered by the embedder
/// (or the daemon's testing seed); the dispatcher never creates them.
pub struct ElementTree {
    roots: RwLock<Vec<ElementNode>>,
}

impl ElementTree {
    fn new() -> Self {
        ElementTree {
            roots: RwLock::new(Vec::new()),
        }
    }

    /// Register an element, creating missing intermediate nodes.
    /// Re-registering replaces the element's properties and keeps children.
    pub fn register(&self, path: &str, properties: HashMap<String, Value>) {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() || segments.iter().any(|s| *s == "*") {
            return;
        }

        let mut roots = self.roots.write();
        let mut nodes: &mut Vec<ElementNode> = &mut roots;
        for (depth, segment) in segments.iter().enumerate() {
            let position = match nodes.iter().position(|node| node.name == *segment) {
                Some(position) => position,
                None => {
                    nodes.push(ElementNode::new(segment));
                    nodes.len() - 1
                }
            };
            if depth == segments.len() - 1 {
                nodes[position].properties = properties;
                return;
            }
            nodes = &mut nodes[position].children;
        }
    }

    /// Remove an element (and its subtree). Returns whether it existed.
    pub fn unregister(&self, path: &str) -> bool {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some((leaf, parents)) = segments.split_last() else {
            return false;
        };

        let mut roots = self.roots.write();
        let mut nodes: &mut Vec<ElementNode> = &mut roots;
        for segment in parents {
            match nodes.iter().position(|node| node.name == *segment) {
                Some(position) => nodes = &mut nodes[position].children,
                None => return false,
            }
        }

        match nodes.iter().position(|node| node.name == *leaf) {
            Some(position) => {
                nodes.remove(position);
                true
            }
            None => false,
        }
    }

    /// Whether an element matches the query path.
    pub fn query(&self, path: &str) -> bool {
        self.with_node(path, |_| ()).is_some()
    }

    /// Read one property off the matched element.
    pub fn property(&self, path: &str, name: &str) -> Option<Value> {
        self.with_node(path, |node| node.properties.get(name).cloned())
            .flatten()
    }

    /// Write one property on the matched element. Returns whether the
    /// element exists.
    pub fn set_property(&self, path: &str, name: &str, value: Value) -> bool {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return false;
        }

        let mut roots = self.roots.write();
        match find_mut(&mut roots, &segments) {
            Some(node) => {
                node.properties.insert(name.to_string(), value);
                true
            }
            None => false,
        }
    }

    fn with_node<T>(&self, path: &str, f: impl FnOnce(&ElementNode) -> T) -> Option<T> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return None;
        }
        let roots = self.roots.read();
        find(&roots, &segments).map(f)
    }
}

fn find<'a>(nodes: &'a [ElementNode], segments: &[&str]) -> Option<&'a ElementNode> {
    let (head, rest) = segments.split_first()?;
    for node in nodes {
        if *head == "*" || node.name == *head {
            if rest.is_empty() {
                return Some(node);
            }
            if let Some(found) = find(&node.children, rest) {
                return Some(found);
            }
        }
    }
    None
}

fn find_mut<'a>(nodes: &'a mut Vec<ElementNode>, segments: &[&str]) -> Option<&'a mut ElementNode> {
    let (head, rest) = segments.split_first()?;
    let position = nodes
        .iter()
        .position(|node| *head == "*" || node.name == *head)?;
    let node = &mut nodes[position];
    if rest.is_empty() {
        Some(node)
    } else {
        find_mut(&mut node.children, rest)
    }
}

// ---------------------------------------------------------------------------
// Shared state

/// Named shared-state store for cross-script values.
///
/// Replaces the ambient module-level globals some source scripts leaned on:
/// ownership is explicit, and access goes through the capability surface.
pub struct SharedStateStore {
    values: RwLock<HashMap<String, Value>>,
}

impl SharedStateStore {
    fn new() -> Self {
        SharedStateStore {
            values: RwLock::new(HashMap::new()),
        }
    }

    /// Read a shared value.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    /// Write a shared value.
    pub fn set(&self, key: &str, value: Value) {
        self.values.write().insert(key.to_string(), value);
    }

    fn clear(&self) {
        self.values.write().clear();
    }
}

// ---------------------------------------------------------------------------
// Aggregate

/// All mutable host state, with bus-publishing mutators.
pub struct HostState {
    /// Persisted settings.
    pub settings: SettingsStore,
    /// Feature registry and flip sets.
    pub features: FeatureRegistry,
    /// Observable UI elements.
    pub elements: ElementTree,
    /// Cross-script shared values.
    pub shared: SharedStateStore,
    env: RwLock<EnvInfo>,
    version_override: RwLock<Option<String>>,
    location: RwLock<Location>,
    controller: RwLock<ControllerState>,
    languages: RwLock<Vec<String>>,
    last_url: Mutex<Option<String>>,
    bus: Arc<SignalBus>,
}

impl HostState {
    /// Build host state, persisting settings under `root` when provided.
    pub fn new(root: Option<&Path>, bus: Arc<SignalBus>) -> SettingsResult<Self> {
        let settings = match root {
            Some(root) => SettingsStore::open(root)?,
            None => return Ok(Self::in_memory(bus)),
        };

        Ok(Self::with_settings(settings, bus))
    }

    /// Build host state with a purely in-memory settings store.
    pub fn in_memory(bus: Arc<SignalBus>) -> Self {
        Self::with_settings(SettingsStore::in_memory(), bus)
    }

    fn with_settings(settings: SettingsStore, bus: Arc<SignalBus>) -> Self {
        HostState {
            settings,
            features: FeatureRegistry::new(),
            elements: ElementTree::new(),
            shared: SharedStateStore::new(),
            env: RwLock::new(EnvInfo::default()),
            version_override: RwLock::new(None),
            location: RwLock::new(Location::default()),
            controller: RwLock::new(ControllerState::Off),
            languages: RwLock::new(Vec::new()),
            last_url: Mutex::new(None),
            bus,
        }
    }

    /// The bus this state publishes on.
    pub fn bus(&self) -> &Arc<SignalBus> {
        &self.bus
    }

    // -- settings ----------------------------------------------------------

    /// Write a setting and notify `(settings, <key>)` subscribers.
    pub fn set_setting(&self, key: &str, value: Value) -> SettingsResult<()> {
        self.settings.set(key, value.clone())?;
        self.bus
            .publish(SignalSource::settings(), key, Some(value));
        Ok(())
    }

    /// Read a setting.
    pub fn setting(&self, key: &str) -> Option<Value> {
        self.settings.get(key)
    }

    /// Typed view over the stored subscription blob, when present.
    pub fn subscription_data(&self) -> Option<SubscriptionData> {
        self.settings
            .get(SUBSCRIPTION_DATA_KEY)
            .map(|blob| SubscriptionData::parse(&blob))
    }

    /// Rewrite `subscription.created` (seconds since epoch) in the stored
    /// subscription blob, creating the blob if absent.
    pub fn set_subscription_created(&self, created_secs: i64) -> SettingsResult<()> {
        let mut blob = self
            .settings
            .get(SUBSCRIPTION_DATA_KEY)
            .unwrap_or_else(|| json!({ "subscription": {} }));

        if !blob.is_object() {
            blob = json!({ "subscription": {} });
        }
        if let Some(obj) = blob.as_object_mut() {
            let subscription = obj.entry("subscription").or_insert_with(|| json!({}));
            if !subscription.is_object() {
                *subscription = json!({});
            }
            if let Some(subscription) = subscription.as_object_mut() {
                subscription.insert("created".to_string(), json!(created_secs));
            }
        }

        self.set_setting(SUBSCRIPTION_DATA_KEY, blob)
    }

    // -- features ----------------------------------------------------------

    /// Toggle the flipped-on set for a feature, notifying subscribers.
    /// Returns the new supported state.
    pub fn flip_feature_on(&self, name: &str) -> bool {
        FeatureRegistry::toggle(&self.features.flipped_on, name);
        let supported = self.features.is_supported(name);
        self.bus
            .publish(SignalSource::feature_list(), name, Some(json!(supported)));
        supported
    }

    /// Toggle the flipped-off set for a feature, notifying subscribers.
    /// Returns the new supported state.
    pub fn flip_feature_off(&self, name: &str) -> bool {
        FeatureRegistry::toggle(&self.features.flipped_off, name);
        let supported = self.features.is_supported(name);
        self.bus
            .publish(SignalSource::feature_list(), name, Some(json!(supported)));
        supported
    }

    // -- environment -------------------------------------------------------

    /// Current environment snapshot.
    pub fn env(&self) -> EnvInfo {
        self.env.read().clone()
    }

    /// Replace the environment snapshot.
    pub fn set_env(&self, env: EnvInfo) {
        *self.env.write() = env;
    }

    /// Version string after applying any test override.
    pub fn effective_version(&self) -> String {
        self.version_override
            .read()
            .clone()
            .unwrap_or_else(|| self.env.read().version_string.clone())
    }

    /// Override the client version string (testing only).
    pub fn set_version_override(&self, version: Option<String>) {
        *self.version_override.write() = version;
    }

    /// Current location hint.
    pub fn location(&self) -> Location {
        self.location.read().clone()
    }

    /// Replace the location hint.
    pub fn set_location(&self, location: Location) {
        *self.location.write() = location;
    }

    // -- controller --------------------------------------------------------

    /// Current controller state.
    pub fn controller_state(&self) -> ControllerState {
        *self.controller.read()
    }

    /// Drive the controller stub to a new state, notifying
    /// `(controller, stateChanged)` subscribers on an actual change.
    pub fn set_controller_state(&self, state: ControllerState) {
        let changed = {
            let mut current = self.controller.write();
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            self.bus.publish(
                SignalSource::controller(),
                "stateChanged",
                Some(json!(state.name())),
            );
        }
    }

    // -- languages ---------------------------------------------------------

    /// Available locale codes.
    pub fn languages(&self) -> Vec<String> {
        self.languages.read().clone()
    }

    /// Replace the available locale codes.
    pub fn set_languages(&self, languages: Vec<String>) {
        *self.languages.write() = languages;
    }

    // -- elements ----------------------------------------------------------

    /// Dispatch a click onto a matched element, publishing
    /// `(element:<path>, clicked)`. Returns whether the element exists.
    pub fn click_element(&self, path: &str) -> bool {
        if !self.elements.query(path) {
            return false;
        }
        self.bus
            .publish(SignalSource::element(path), "clicked", None);
        true
    }

    /// Write an element property, publishing
    /// `(element:<path>, propertyChanged)`. Returns whether the element
    /// exists.
    pub fn set_element_property(&self, path: &str, name: &str, value: Value) -> bool {
        if !self.elements.set_property(path, name, value.clone()) {
            return false;
        }
        self.bus.publish(
            SignalSource::element(path),
            "propertyChanged",
            Some(json!({ "property": name, "value": value })),
        );
        true
    }

    // -- urls --------------------------------------------------------------

    /// Record an opened URL (capability surface for scripts).
    pub fn record_opened_url(&self, url: &str) {
        *self.last_url.lock() = Some(url.to_string());
    }

    /// Last URL a script opened, if any.
    pub fn last_url(&self) -> Option<String> {
        self.last_url.lock().clone()
    }

    // -- resets ------------------------------------------------------------

    /// Soft reset: clear session-scoped state, keep persisted settings.
    pub fn reset(&self) {
        self.features.clear();
        *self.controller.write() = ControllerState::Off;
        *self.version_override.write() = None;
        *self.last_url.lock() = None;
        self.shared.clear();
    }

    /// Full reset: soft reset plus wiping persisted settings.
    pub fn hard_reset(&self) -> SettingsResult<()> {
        self.reset();
        self.settings.wipe()
    }
}
