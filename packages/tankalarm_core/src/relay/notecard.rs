//! Notecard-style JSON request bridge over HTTP
//!
//! Speaks the card request protocol (`note.add`, `note.get` with delete,
//! `card.time`) as JSON POSTs to a single bridge endpoint, the way a
//! serial-to-HTTP Notecard bridge exposes it.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::queue::QueueName;
use crate::time::Epoch;

use super::{Relay, RelayError, RelayNote};

/// Marker the card returns when a queue has no notes.
const NOTE_NOT_FOUND: &str = "{note-noexist}";

#[derive(Debug, Default, Deserialize)]
struct CardResponse {
    #[serde(default)]
    err: Option<String>,
    #[serde(default)]
    body: Option<serde_json::Value>,
    #[serde(default)]
    time: Option<i64>,
}

/// Relay backed by a Notecard request bridge.
pub struct NotecardHttpRelay {
    client: reqwest::Client,
    endpoint: String,
}

impl NotecardHttpRelay {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    async fn request(&self, request: serde_json::Value) -> Result<CardResponse, RelayError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RelayError::Timeout
                } else {
                    RelayError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Unreachable(format!("bridge returned HTTP {}", status)));
        }

        response
            .json::<CardResponse>()
            .await
            .map_err(|e| RelayError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl Relay for NotecardHttpRelay {
    async fn add_note(&self, queue: &QueueName, body: serde_json::Value) -> Result<(), RelayError> {
        let response = self
            .request(json!({
                "req": "note.add",
                "file": queue.to_string(),
                "body": body,
            }))
            .await?;
        match response.err {
            Some(err) if !err.is_empty() => Err(RelayError::Rejected(err)),
            _ => Ok(()),
        }
    }

    async fn take_note(&self, queue: &QueueName) -> Result<Option<RelayNote>, RelayError> {
        let response = self
            .request(json!({
                "req": "note.get",
                "file": queue.to_string(),
                "delete": true,
            }))
            .await?;

        if let Some(err) = response.err.filter(|e| !e.is_empty()) {
            if err.contains(NOTE_NOT_FOUND) {
                return Ok(None);
            }
            return Err(RelayError::Rejected(err));
        }

        Ok(response.body.map(|body| RelayNote {
            body,
            epoch: Epoch(response.time.unwrap_or(0)),
        }))
    }

    async fn time(&self) -> Result<Epoch, RelayError> {
        let response = self.request(json!({ "req": "card.time" })).await?;
        if let Some(err) = response.err.filter(|e| !e.is_empty()) {
            return Err(RelayError::Rejected(err));
        }
        response
            .time
            .map(Epoch)
            .ok_or_else(|| RelayError::Malformed("card.time response has no time".to_string()))
    }
}
