//! Host orchestrator and public API
//!
//! This module provides the `Host` struct that wires the protocol core
//! together (state, signal bus, condition engine, addon manager) and
//! exposes command dispatch for the channel front-ends.

use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

// Submodules
pub mod command;
pub mod dispatcher;
pub mod error;
pub mod signal;
pub mod state;
pub mod ws;

use crate::addon::AddonManager;
use crate::addon::condition::{Clock, ConditionEngine, SystemClock};
use command::Response;
use serde_json::json;
use signal::SignalBus;
use state::{EnvInfo, HostState};

/// Configuration for a hostpipe host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Root directory for persisted settings (default: .hostpipe/)
    pub root: PathBuf,

    /// Testing mode: seeds a deterministic element tree, registers test
    /// features, and marks the build as non-production
    pub testing: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".hostpipe"),
            testing: false,
        }
    }
}

/// The host side of the protocol: one of these backs every channel.
///
/// All channel front-ends share one `Host` behind an `Arc`; dispatch is
/// serial per channel but safe across channels.
pub struct Host {
    config: HostConfig,
    state: Arc<HostState>,
    bus: Arc<SignalBus>,
    engine: ConditionEngine,
    addons: AddonManager,
    clock: Arc<dyn Clock>,
}

impl Host {
    /// Create a host with the given configuration and the system clock.
    pub fn new(config: HostConfig) -> anyhow::Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a host with an explicit time source (tests inject a manual
    /// clock here).
    pub fn with_clock(config: HostConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let bus = Arc::new(SignalBus::new());
        let state = Arc::new(HostState::new(Some(&config.root), bus.clone())?);
        let engine = ConditionEngine::new(bus.clone(), clock.clone());
        let addons = AddonManager::new(state.clone(), bus.clone(), engine.clone());

        let host = Self {
            config,
            state,
            bus,
            engine,
            addons,
            clock,
        };

        if host.config.testing {
            host.seed_testing();
        }

        Ok(host)
    }

    /// Create a host without persisted settings (embedders and tests).
    pub fn ephemeral(testing: bool) -> Self {
        Self::ephemeral_with_clock(testing, Arc::new(SystemClock))
    }

    /// Create a host without persisted settings and an explicit time
    /// source.
    pub fn ephemeral_with_clock(testing: bool, clock: Arc<dyn Clock>) -> Self {
        let bus = Arc::new(SignalBus::new());
        let state = Arc::new(HostState::in_memory(bus.clone()));
        let engine = ConditionEngine::new(bus.clone(), clock.clone());
        let addons = AddonManager::new(state.clone(), bus.clone(), engine.clone());

        let host = Self {
            config: HostConfig {
                root: PathBuf::new(),
                testing,
            },
            state,
            bus,
            engine,
            addons,
            clock,
        };

        if testing {
            host.seed_testing();
        }

        host
    }

    /// Get the current configuration
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Get the host state
    pub fn state(&self) -> &Arc<HostState> {
        &self.state
    }

    /// Get the signal bus
    pub fn bus(&self) -> &Arc<SignalBus> {
        &self.bus
    }

    /// Get the condition engine
    pub fn engine(&self) -> &ConditionEngine {
        &self.engine
    }

    /// Get the addon manager
    pub fn addons(&self) -> &AddonManager {
        &self.addons
    }

    /// Get the time source
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Dispatch one command line, producing exactly one response.
    pub fn dispatch(&self, raw: &str) -> Response {
        dispatcher::dispatch(self, raw)
    }

    /// Process a whole connection: one command per line in, one JSON
    /// response per line out, strictly in order.
    pub fn handle<R: BufRead, W: Write>(&self, reader: R, mut writer: W) -> io::Result<()> {
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let response = self.dispatch(&line);
            serde_json::to_writer(&mut writer, &response)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        Ok(())
    }

    /// Fire every condition timer due at the current clock reading.
    pub fn pump_timers(&self) {
        self.engine.pump(self.clock.now());
    }

    /// Soft reset: clear session state, keep persisted settings and addons.
    pub fn reset(&self) {
        self.state.reset();
    }

    /// Full reset: soft reset plus wiping persisted settings and unloading
    /// every addon.
    pub fn hard_reset(&self) -> error::Result<()> {
        self.addons.unload_all();
        self.state.hard_reset()?;
        Ok(())
    }

    fn seed_testing(&self) {
        let mut env = EnvInfo::default();
        env.in_production = false;
        self.state.set_env(env);

        self.state
            .set_languages(vec!["en".to_string(), "de".to_string(), "fr".to_string()]);

        self.state.features.register("testFeatureAddonApi", false);
        self.state.features.register("shareLogs", true);

        for path in [
            "main",
            "main/getHelpLink",
            "main/getStarted",
            "main/learnMoreLink",
            "main/settingsButton",
            "main/serverListButton",
        ] {
            let mut properties = std::collections::HashMap::new();
            properties.insert("visible".to_string(), json!(true));
            self.state.elements.register(path, properties);
        }
    }
}

// Re-export commonly used types
pub use command::{Command, Response as CommandResponse};
