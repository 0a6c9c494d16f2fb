#![forbid(unsafe_code)]

use crate::error::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use std::time::Duration;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves a payload by secondary reference when a batch item arrived
/// without its bytes. Enrichment is best-effort: any failure yields `None`
/// and the item is dropped, not retried.
#[async_trait]
pub trait PayloadFetcher: Send + Sync {
    async fn fetch(&self, locator: &str) -> Option<Vec<u8>>;
}

/// Fetcher backed by an HTTP client with credentials omitted, plus inline
/// decoding for `data:` locators.
pub struct HttpPayloadFetcher {
    client: reqwest::Client,
}

impl HttpPayloadFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PayloadFetcher for HttpPayloadFetcher {
    async fn fetch(&self, locator: &str) -> Option<Vec<u8>> {
        if let Some(decoded) = decode_data_url(locator) {
            return Some(decoded);
        }
        if locator.starts_with("data:") {
            return None;
        }
        // Blob locators reference another context's memory; unreachable here.
        if locator.starts_with("blob:") {
            return None;
        }

        let response = match self.client.get(locator).send().await {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(
                    target: "veilhub::worker",
                    event = "payload_fetch_failed",
                    locator,
                    error = %err,
                );
                return None;
            }
        };
        if !response.status().is_success() {
            tracing::debug!(
                target: "veilhub::worker",
                event = "payload_fetch_rejected",
                locator,
                status = response.status().as_u16(),
            );
            return None;
        }
        response.bytes().await.ok().map(|bytes| bytes.to_vec())
    }
}

/// Decodes a `data:` URL into raw bytes. Returns `None` for anything that is
/// not a well-formed data URL.
pub fn decode_data_url(url: &str) -> Option<Vec<u8>> {
    let rest = url.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    if header.ends_with(";base64") {
        BASE64_STANDARD.decode(payload.as_bytes()).ok()
    } else {
        Some(percent_decode(payload))
    }
}

fn percent_decode(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' && index + 2 < bytes.len() {
            let hex = &input[index + 1..index + 3];
            if let Ok(value) = u8::from_str_radix(hex, 16) {
                decoded.push(value);
                index += 3;
                continue;
            }
        }
        decoded.push(bytes[index]);
        index += 1;
    }
    decoded
}
