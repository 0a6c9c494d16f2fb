#![forbid(unsafe_code)]

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Upstream event carrying a settings document.
pub const SETTINGS_UPDATE_EVENT: &str = "settings-update";
/// Push events the service emits once a settings save has been persisted.
/// Both spellings are live in production; the worker listens for either.
pub const SETTINGS_UPDATED_EVENTS: [&str; 2] = ["setting-updated", "settings-updated"];
/// Push event the service emits when a settings save fails.
pub const SETTINGS_ERROR_EVENT: &str = "error";

/// One filter section of the persisted configuration document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FilterSection {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_enabled")]
    pub original_view_enabled: bool,
    #[serde(default)]
    pub categories: Vec<String>,
}

const fn default_enabled() -> bool {
    true
}

impl FilterSection {
    /// Service schema requires complete sections: a disabled section always
    /// commits an empty category list.
    pub fn normalized(mut self) -> Self {
        if !self.enabled {
            self.categories.clear();
        }
        self
    }
}

/// The persisted configuration document. Consumed, not owned, by the relay:
/// commit payloads must match this shape exactly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsDocument {
    #[serde(default = "default_enabled")]
    pub service_enabled: bool,
    #[serde(default = "default_enabled")]
    pub show_icon: bool,
    #[serde(default = "default_enabled")]
    pub filtering_enabled: bool,
    #[serde(default)]
    pub filter_image: FilterSection,
    #[serde(default)]
    pub filter_text: FilterSection,
}

impl Default for SettingsDocument {
    fn default() -> Self {
        Self {
            service_enabled: true,
            show_icon: true,
            filtering_enabled: true,
            filter_image: FilterSection::default(),
            filter_text: FilterSection::default(),
        }
    }
}

impl SettingsDocument {
    pub fn normalized(self) -> Self {
        Self {
            filter_image: self.filter_image.normalized(),
            filter_text: self.filter_text.normalized(),
            ..self
        }
    }

    /// Final wire document emitted to the service.
    pub fn into_outgoing(self) -> OutgoingSettingsDoc {
        OutgoingSettingsDoc {
            kind: "settingsDoc",
            settings: self.normalized(),
            meta: OutgoingMeta {
                updated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutgoingSettingsDoc {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub settings: SettingsDocument,
    #[serde(rename = "__meta")]
    pub meta: OutgoingMeta,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMeta {
    pub updated_at: String,
}

/// Commit request as carried in a `SETTINGS_COMMIT` envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    pub req_id: String,
    #[serde(default = "default_commit_event")]
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub data: JsonValue,
}

fn default_commit_event() -> String {
    SETTINGS_UPDATE_EVENT.to_string()
}

impl CommitRequest {
    /// Builds a commit for one document with a freshly minted correlation
    /// id. Id uniqueness is what keeps correlation entries from trampling
    /// each other, so callers should not reuse ids across attempts.
    pub fn new(document: SettingsDocument) -> Self {
        Self {
            req_id: uuid::Uuid::new_v4().to_string(),
            event: SETTINGS_UPDATE_EVENT.to_string(),
            timeout_ms: None,
            data: serde_json::to_value(document.into_outgoing()).unwrap_or(JsonValue::Null),
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Terminal outcome of one commit attempt. Never retried automatically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOutcome {
    Acked,
    Errored,
    TimedOut,
}

/// Result delivered to the commit caller. Always well-formed: an erroring or
/// timed-out commit leaves the caller able to restore its previous state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitResult {
    pub ok: bool,
    pub outcome: CommitOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommitResult {
    pub fn acked(data: Option<JsonValue>) -> Self {
        Self {
            ok: true,
            outcome: CommitOutcome::Acked,
            data,
            error: None,
        }
    }

    pub fn errored(error: impl Into<String>, data: Option<JsonValue>) -> Self {
        Self {
            ok: false,
            outcome: CommitOutcome::Errored,
            data,
            error: Some(error.into()),
        }
    }

    pub fn timed_out() -> Self {
        Self {
            ok: false,
            outcome: CommitOutcome::TimedOut,
            data: None,
            error: Some("Timeout waiting for settings acknowledgement".to_string()),
        }
    }

    pub fn worker_not_ready() -> Self {
        Self {
            ok: false,
            outcome: CommitOutcome::Errored,
            data: None,
            error: Some("Worker not ready".to_string()),
        }
    }
}
