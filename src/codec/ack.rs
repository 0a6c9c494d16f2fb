#![forbid(unsafe_code)]

use crate::domain::{AnalysisOutcome, DecisionItem, UpstreamErrorInfo};
use crate::telemetry::relay_counters;
use serde_json::Value as JsonValue;

/// Fields a well-formed analysis acknowledgement must carry. Anything
/// missing one of them is treated as an error response.
const REQUIRED_FIELDS: [&str; 3] = ["results", "processingTime", "processedAt"];

/// Normalizes an upstream chunk acknowledgement into a well-formed outcome.
///
/// Malformed data is logged and folded into a synthetic error result;
/// downstream consumers always receive the same shape and never an
/// exception.
pub fn normalize_analysis_ack(ack: Option<JsonValue>, req_id: &str) -> AnalysisOutcome {
    let Some(ack) = ack else {
        return AnalysisOutcome::empty(Some(req_id.to_string()));
    };

    if is_well_formed(&ack) {
        if let Some(outcome) = decode_well_formed(&ack, req_id) {
            return outcome;
        }
    }

    relay_counters().inc_malformed_acks();
    tracing::error!(
        target: "veilhub::codec",
        event = "malformed_ack",
        req_id,
        "upstream acknowledgement is not a valid analysis response"
    );

    AnalysisOutcome {
        results: Vec::new(),
        req_id: Some(req_id.to_string()),
        processing_time: None,
        processed_at: None,
        error: Some(UpstreamErrorInfo {
            message: ack
                .get("message")
                .and_then(JsonValue::as_str)
                .unwrap_or("upstream error")
                .to_string(),
            error_code: ack
                .get("errorCode")
                .and_then(JsonValue::as_str)
                .unwrap_or("INVALID_RESPONSE")
                .to_string(),
            category: ack
                .get("category")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
            original_response: Some(ack),
        }),
    }
}

fn is_well_formed(ack: &JsonValue) -> bool {
    let Some(map) = ack.as_object() else {
        return false;
    };
    REQUIRED_FIELDS.iter().all(|field| map.contains_key(*field))
        && map.get("results").is_some_and(JsonValue::is_array)
}

fn decode_well_formed(ack: &JsonValue, req_id: &str) -> Option<AnalysisOutcome> {
    let results: Vec<DecisionItem> =
        serde_json::from_value(ack.get("results").cloned().unwrap_or(JsonValue::Null)).ok()?;
    Some(AnalysisOutcome {
        results,
        req_id: Some(req_id.to_string()),
        processing_time: ack.get("processingTime").and_then(JsonValue::as_f64),
        processed_at: ack
            .get("processedAt")
            .and_then(JsonValue::as_str)
            .map(str::to_string),
        error: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn well_formed_ack_passes_through() {
        let ack = json!({
            "processingTime": 12.5,
            "processedAt": "2025-03-01T00:00:00Z",
            "results": [
                { "elementId": "el-1", "shouldBlur": true, "primaryCategory": "violence" }
            ]
        });
        let outcome = normalize_analysis_ack(Some(ack), "req-1");
        assert!(outcome.error.is_none());
        assert_eq!(outcome.req_id.as_deref(), Some("req-1"));
        assert_eq!(outcome.processing_time, Some(12.5));
        assert_eq!(outcome.results.len(), 1);
        assert!(outcome.results[0].should_blur);
    }

    #[test]
    fn missing_required_fields_become_synthetic_error() {
        let outcome = normalize_analysis_ack(Some(json!({ "results": [] })), "req-2");
        let error = outcome.error.expect("error populated");
        assert_eq!(error.error_code, "INVALID_RESPONSE");
        assert!(outcome.results.is_empty());
    }

    #[test]
    fn service_error_shape_is_preserved_in_details() {
        let ack = json!({
            "message": "quota exceeded",
            "errorCode": "SO429",
            "category": "capacity"
        });
        let outcome = normalize_analysis_ack(Some(ack.clone()), "req-3");
        let error = outcome.error.expect("error populated");
        assert_eq!(error.message, "quota exceeded");
        assert_eq!(error.error_code, "SO429");
        assert_eq!(error.category.as_deref(), Some("capacity"));
        assert_eq!(error.original_response, Some(ack));
    }

    #[test]
    fn absent_ack_yields_empty_outcome_without_error() {
        let outcome = normalize_analysis_ack(None, "req-4");
        assert!(outcome.results.is_empty());
        assert!(outcome.error.is_none());
        assert_eq!(outcome.req_id.as_deref(), Some("req-4"));
    }

    #[test]
    fn non_object_ack_is_malformed() {
        let outcome = normalize_analysis_ack(Some(json!("oops")), "req-5");
        assert!(outcome.error.is_some());
    }
}
