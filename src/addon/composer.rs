//! Content-block management for message addons.
//!
//! A message's displayed content is a titled list of blocks plus a little
//! metadata (badge, read flag, date). The composer is the only way a script
//! may edit its own message, and only its own: each composer is bound to
//! one addon at construction. While the message is enabled, its state is
//! mirrored onto the `message-<id>` element for drivers to observe.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

use crate::host::state::HostState;

/// One displayed content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Block identity, unique within the message.
    pub id: String,
    /// Block kind (`text`, `title`, `ulist`, ...).
    #[serde(rename = "type", default = "default_block_kind")]
    pub kind: String,
    /// Display text.
    #[serde(default)]
    pub text: String,
}

fn default_block_kind() -> String {
    "text".to_string()
}

/// Full displayable state of one message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    /// Message title.
    #[serde(default)]
    pub title: String,
    /// Message subtitle.
    #[serde(default)]
    pub subtitle: String,
    /// Ordered content blocks.
    #[serde(default)]
    pub blocks: Vec<Block>,
    /// Optional badge label (`new`, `warning`, ...).
    #[serde(default)]
    pub badge: Option<String>,
    /// Whether the user has read the message.
    #[serde(default)]
    pub is_read: bool,
    /// Message date, seconds since epoch.
    #[serde(default)]
    pub date: Option<i64>,
}

struct ComposerInner {
    addon_id: String,
    initial: MessageContent,
    content: Mutex<MessageContent>,
    state: Arc<HostState>,
}

/// Handle through which one addon's script edits its own message.
#[derive(Clone)]
pub struct Composer {
    inner: Arc<ComposerInner>,
}

impl Composer {
    /// Bind a composer to `addon_id`, starting from the manifest content.
    pub fn new(addon_id: impl Into<String>, initial: MessageContent, state: Arc<HostState>) -> Self {
        Composer {
            inner: Arc::new(ComposerInner {
                addon_id: addon_id.into(),
                content: Mutex::new(initial.clone()),
                initial,
                state,
            }),
        }
    }

    /// Query path of the element mirroring this message while enabled.
    pub fn element_path(&self) -> String {
        format!("message-{}", self.inner.addon_id)
    }

    /// Replace the title.
    pub fn set_title(&self, title: &str) {
        self.inner.content.lock().title = title.to_string();
        self.sync();
    }

    /// Replace the subtitle.
    pub fn set_subtitle(&self, subtitle: &str) {
        self.inner.content.lock().subtitle = subtitle.to_string();
        self.sync();
    }

    /// Replace the text of an existing block. Returns whether it exists.
    pub fn set_text(&self, block_id: &str, text: &str) -> bool {
        let updated = {
            let mut content = self.inner.content.lock();
            match content.blocks.iter_mut().find(|b| b.id == block_id) {
                Some(block) => {
                    block.text = text.to_string();
                    true
                }
                None => false,
            }
        };
        if updated {
            self.sync();
        }
        updated
    }

    /// Insert a block at `index` (clamped to the current length).
    pub fn create(&self, index: usize, block: Block) {
        {
            let mut content = self.inner.content.lock();
            let index = index.min(content.blocks.len());
            content.blocks.insert(index, block);
        }
        self.sync();
    }

    /// Append a block.
    pub fn append(&self, block: Block) {
        self.inner.content.lock().blocks.push(block);
        self.sync();
    }

    /// Remove a block. Returns whether it existed.
    pub fn remove(&self, block_id: &str) -> bool {
        let removed = {
            let mut content = self.inner.content.lock();
            let before = content.blocks.len();
            content.blocks.retain(|b| b.id != block_id);
            content.blocks.len() != before
        };
        if removed {
            self.sync();
        }
        removed
    }

    /// Message date, if set.
    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.inner
            .content
            .lock()
            .date
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    }

    /// Set the message date (seconds since epoch).
    pub fn set_date(&self, secs: i64) {
        self.inner.content.lock().date = Some(secs);
        self.sync();
    }

    /// Current badge label.
    pub fn badge(&self) -> Option<String> {
        self.inner.content.lock().badge.clone()
    }

    /// Replace the badge label.
    pub fn set_badge(&self, badge: Option<&str>) {
        self.inner.content.lock().badge = badge.map(String::from);
        self.sync();
    }

    /// Whether the message is marked read.
    pub fn is_read(&self) -> bool {
        self.inner.content.lock().is_read
    }

    /// Mark the message read or unread.
    pub fn set_is_read(&self, is_read: bool) {
        self.inner.content.lock().is_read = is_read;
        self.sync();
    }

    /// Restore the manifest content, discarding every edit.
    pub fn reset_message(&self) {
        *self.inner.content.lock() = self.inner.initial.clone();
        self.sync();
    }

    /// Snapshot of the current content.
    pub fn content(&self) -> MessageContent {
        self.inner.content.lock().clone()
    }

    /// Element properties mirroring the current content.
    pub fn element_properties(&self) -> HashMap<String, Value> {
        let content = self.inner.content.lock();
        let mut properties = HashMap::new();
        properties.insert("title".to_string(), json!(content.title));
        properties.insert("subtitle".to_string(), json!(content.subtitle));
        properties.insert("badge".to_string(), json!(content.badge));
        properties.insert("isRead".to_string(), json!(content.is_read));
        properties.insert("date".to_string(), json!(content.date));
        properties.insert("blockCount".to_string(), json!(content.blocks.len()));
        properties.insert("blocks".to_string(), json!(content.blocks));
        properties
    }

    fn sync(&self) {
        let path = self.element_path();
        if !self.inner.state.elements.query(&path) {
            // Disabled content has no element to mirror onto.
            return;
        }
        for (name, value) in self.element_properties() {
            self.inner.state.elements.set_property(&path, &name, value);
        }
    }
}
