#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// Identifier of one client execution context. Assigned when the context
/// attaches and stable for the lifetime of its channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Closed topic vocabulary. Producers may send topics this build does not
/// know about; those arrive as `Unknown` and are dropped with a log line
/// rather than rejected, so new topics never require a coordinator change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Topic {
    TextBatch,
    ImageBatch,
    Decisions,
    ImageResults,
    Pong,
    Config,
    SettingsCommit,
    SettingsAck,
    SettingsError,
    Unknown(String),
}

impl Topic {
    pub fn as_str(&self) -> &str {
        match self {
            Topic::TextBatch => "TEXT_BATCH",
            Topic::ImageBatch => "IMAGE_BATCH",
            Topic::Decisions => "DECISIONS",
            Topic::ImageResults => "IMAGE_RESULTS",
            Topic::Pong => "PONG",
            Topic::Config => "CONFIG",
            Topic::SettingsCommit => "SETTINGS_COMMIT",
            Topic::SettingsAck => "SETTINGS_ACK",
            Topic::SettingsError => "SETTINGS_ERROR",
            Topic::Unknown(raw) => raw.as_str(),
        }
    }

    /// True for topics that travel client → coordinator → worker.
    pub fn is_worker_bound(&self) -> bool {
        matches!(self, Topic::TextBatch | Topic::ImageBatch)
    }
}

impl From<&str> for Topic {
    fn from(raw: &str) -> Self {
        match raw {
            "TEXT_BATCH" => Topic::TextBatch,
            "IMAGE_BATCH" => Topic::ImageBatch,
            "DECISIONS" => Topic::Decisions,
            "IMAGE_RESULTS" => Topic::ImageResults,
            "PONG" => Topic::Pong,
            "CONFIG" => Topic::Config,
            "SETTINGS_COMMIT" => Topic::SettingsCommit,
            "SETTINGS_ACK" => Topic::SettingsAck,
            "SETTINGS_ERROR" => Topic::SettingsError,
            other => Topic::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Topic {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Topic::from(raw.as_str()))
    }
}

/// The only unit of communication between contexts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub topic: Topic,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<ContextId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Envelope {
    pub fn new(topic: Topic) -> Self {
        Self {
            topic,
            data: None,
            origin_id: None,
            correlation_id: None,
        }
    }

    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_origin(mut self, origin: ContextId) -> Self {
        self.origin_id = Some(origin);
        self
    }

    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Serde adapter encoding binary payloads as base64 strings on the JSON wire.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_str(&BASE64_STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            Some(encoded) => BASE64_STANDARD
                .decode(encoded.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// One text fragment submitted for analysis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextItem {
    pub element_id: String,
    pub text: String,
}

/// Client-submitted text batch; `req_id` doubles as the correlation id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextBatch {
    pub req_id: String,
    pub items: Vec<TextItem>,
}

/// One image candidate. `image_data` is optional on arrival: items missing
/// their bytes are enriched from `src` before transmission, and items that
/// still lack a usable payload afterwards are dropped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageItem {
    pub element_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub image_data: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageBatch {
    pub req_id: String,
    pub images: Vec<ImageItem>,
}

/// Per-element verdict returned by the analysis service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionItem {
    pub element_id: String,
    #[serde(default)]
    pub should_blur: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Error details attached to a normalized upstream response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamErrorInfo {
    pub message: String,
    pub error_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_response: Option<JsonValue>,
}

/// Normalized per-chunk analysis outcome relayed back to the origin context.
/// Always well-formed: malformed upstream acknowledgements surface here with
/// empty `results` and a populated `error`, never as an exception.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisOutcome {
    #[serde(default)]
    pub results: Vec<DecisionItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<UpstreamErrorInfo>,
}

impl AnalysisOutcome {
    pub fn empty(req_id: Option<String>) -> Self {
        Self {
            results: Vec::new(),
            req_id,
            processing_time: None,
            processed_at: None,
            error: None,
        }
    }
}

/// One filtered span inside a text fragment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilteredSpan {
    pub start: u64,
    pub end: u64,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextResult {
    pub element_id: String,
    #[serde(default)]
    pub filtered_indexes: Vec<FilteredSpan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
}
