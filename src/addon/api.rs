//! Capability surface exposed to addon scripts.
//!
//! The surface is a fixed struct of optional sub-capabilities rather than a
//! duck-typed bag: the common subset is statically typed, and a script can
//! probe for an optional member before using it. What a script cannot reach
//! through this surface, it cannot touch; in particular another addon's
//! condition or content.

use serde_json::Value;
use std::sync::Arc;

use super::composer::Composer;
use crate::host::error::SettingsResult;
use crate::host::signal::SignalSource;
use crate::host::state::{ControllerState, HostState, Location, SubscriptionData};

/// Read/write access to persisted settings.
#[derive(Clone)]
pub struct SettingsCap {
    state: Arc<HostState>,
}

impl SettingsCap {
    /// Read one setting.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.setting(key)
    }

    /// Write one setting; subscribers of `(settings, <key>)` are notified.
    pub fn set(&self, key: &str, value: Value) -> SettingsResult<()> {
        self.state.set_setting(key, value)
    }
}

/// Read access to the stored subscription data.
#[derive(Clone)]
pub struct SubscriptionCap {
    state: Arc<HostState>,
}

impl SubscriptionCap {
    /// Typed view over the stored blob, `None` when nothing is stored.
    pub fn data(&self) -> Option<SubscriptionData> {
        self.state.subscription_data()
    }
}

/// Environment facts.
#[derive(Clone)]
pub struct EnvCap {
    state: Arc<HostState>,
}

impl EnvCap {
    /// Platform identifier.
    pub fn platform(&self) -> String {
        self.state.env().platform
    }

    /// Client version string, after any test override.
    pub fn version_string(&self) -> String {
        self.state.effective_version()
    }

    /// Operating system version string.
    pub fn os_version(&self) -> String {
        self.state.env().os_version
    }

    /// Whether this is a production build.
    pub fn in_production(&self) -> bool {
        self.state.env().in_production
    }
}

/// Read access to the controller stub's state.
#[derive(Clone)]
pub struct ControllerCap {
    state: Arc<HostState>,
}

impl ControllerCap {
    /// Current connection state.
    pub fn state(&self) -> ControllerState {
        self.state.controller_state()
    }
}

/// Geo hint.
#[derive(Clone)]
pub struct LocationCap {
    state: Arc<HostState>,
}

impl LocationCap {
    /// Current location hint.
    pub fn get(&self) -> Location {
        self.state.location()
    }

    /// ISO country code, empty when unknown.
    pub fn country_code(&self) -> String {
        self.state.location().country_code
    }
}

/// Feature registry access.
#[derive(Clone)]
pub struct FeatureListCap {
    state: Arc<HostState>,
}

impl FeatureListCap {
    /// Effective supported state of a feature.
    pub fn is_supported(&self, name: &str) -> bool {
        self.state.features.is_supported(name)
    }

    /// Toggle a feature's flipped-on state; returns the new supported
    /// state.
    pub fn toggle(&self, name: &str) -> bool {
        self.state.flip_feature_on(name)
    }
}

/// URL opening on behalf of the user.
#[derive(Clone)]
pub struct UrlOpenerCap {
    state: Arc<HostState>,
}

impl UrlOpenerCap {
    /// Open a literal URL.
    pub fn open_url(&self, url: &str) {
        tracing::info!(url, "script requested url open");
        self.state.record_opened_url(url);
    }

    /// Open a URL registered under a label.
    pub fn open_url_label(&self, label: &str) {
        tracing::info!(label, "script requested labeled url open");
        self.state.record_opened_url(&format!("label:{label}"));
    }
}

/// Screen navigation requests.
#[derive(Clone)]
pub struct NavigatorCap {
    state: Arc<HostState>,
}

impl NavigatorCap {
    /// Ask the host to show a named screen; publishes
    /// `(navigator, screenRequested)`.
    pub fn request_screen(&self, screen: &str) {
        self.state.bus().publish(
            SignalSource::navigator(),
            "screenRequested",
            Some(Value::String(screen.to_string())),
        );
    }
}

/// Named shared values visible across scripts.
#[derive(Clone)]
pub struct SharedStateCap {
    state: Arc<HostState>,
}

impl SharedStateCap {
    /// Read a shared value.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.shared.get(key)
    }

    /// Write a shared value.
    pub fn set(&self, key: &str, value: Value) {
        self.state.shared.set(key, value);
    }
}

/// The capability set granted to one addon's scripts.
#[derive(Clone)]
pub struct AddonApi {
    addon_id: String,
    settings: Option<SettingsCap>,
    subscription_data: Option<SubscriptionCap>,
    env: Option<EnvCap>,
    controller: Option<ControllerCap>,
    location: Option<LocationCap>,
    feature_list: Option<FeatureListCap>,
    url_opener: Option<UrlOpenerCap>,
    navigator: Option<NavigatorCap>,
    shared_state: Option<SharedStateCap>,
    addon: Option<Composer>,
}

impl AddonApi {
    /// Grant the common capability set for `addon_id`.
    pub fn new(addon_id: impl Into<String>, state: Arc<HostState>) -> Self {
        AddonApi {
            addon_id: addon_id.into(),
            settings: Some(SettingsCap {
                state: state.clone(),
            }),
            subscription_data: Some(SubscriptionCap {
                state: state.clone(),
            }),
            env: Some(EnvCap {
                state: state.clone(),
            }),
            controller: Some(ControllerCap {
                state: state.clone(),
            }),
            location: Some(LocationCap {
                state: state.clone(),
            }),
            feature_list: Some(FeatureListCap {
                state: state.clone(),
            }),
            url_opener: Some(UrlOpenerCap {
                state: state.clone(),
            }),
            navigator: Some(NavigatorCap {
                state: state.clone(),
            }),
            shared_state: Some(SharedStateCap { state }),
            addon: None,
        }
    }

    /// Additionally grant the composer for the addon's own message content.
    pub fn with_composer(mut self, composer: Composer) -> Self {
        self.addon = Some(composer);
        self
    }

    /// The owning addon's id.
    pub fn addon_id(&self) -> &str {
        &self.addon_id
    }

    /// Settings capability, when granted.
    pub fn settings(&self) -> Option<&SettingsCap> {
        self.settings.as_ref()
    }

    /// Subscription data capability, when granted.
    pub fn subscription_data(&self) -> Option<&SubscriptionCap> {
        self.subscription_data.as_ref()
    }

    /// Environment capability, when granted.
    pub fn env(&self) -> Option<&EnvCap> {
        self.env.as_ref()
    }

    /// Controller capability, when granted.
    pub fn controller(&self) -> Option<&ControllerCap> {
        self.controller.as_ref()
    }

    /// Location capability, when granted.
    pub fn location(&self) -> Option<&LocationCap> {
        self.location.as_ref()
    }

    /// Feature registry capability, when granted.
    pub fn feature_list(&self) -> Option<&FeatureListCap> {
        self.feature_list.as_ref()
    }

    /// URL opener capability, when granted.
    pub fn url_opener(&self) -> Option<&UrlOpenerCap> {
        self.url_opener.as_ref()
    }

    /// Navigator capability, when granted.
    pub fn navigator(&self) -> Option<&NavigatorCap> {
        self.navigator.as_ref()
    }

    /// Shared state capability, when granted.
    pub fn shared_state(&self) -> Option<&SharedStateCap> {
        self.shared_state.as_ref()
    }

    /// Composer for the addon's own content, when granted.
    pub fn addon(&self) -> Option<&Composer> {
        self.addon.as_ref()
    }
}
