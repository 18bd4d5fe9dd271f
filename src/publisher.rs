//! Outbound "file added" events
//!
//! Events are CloudEvents 1.0 in HTTP binary content mode: the event
//! attributes travel as `ce-*` headers and the body is the JSON file
//! description `{"Name", "Size", "ModTime"}`.

use crate::protocols::FileInfo;
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Event type used when none is configured
pub const DEFAULT_EVENT_TYPE: &str = "org.aikas.ftp.fileadded";

/// Failure to publish one event
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("failed to encode event for '{name}': {source}")]
    Encode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to send event for '{name}': {source}")]
    Transport {
        name: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("sink rejected event for '{name}' with status {status}")]
    Rejected { name: String, status: u16 },
}

/// Destination of per-file events
pub trait EventPublisher {
    /// Publishes one event; Ok only once the sink acknowledged it
    fn send(&mut self, file: &FileInfo) -> Result<(), DeliveryError>;
}

/// Event payload
#[derive(Debug, Serialize)]
pub struct FileEvent<'a> {
    #[serde(rename = "Name")]
    pub name: &'a str,
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "ModTime")]
    pub mod_time: DateTime<Utc>,
}

impl<'a> From<&'a FileInfo> for FileEvent<'a> {
    fn from(file: &'a FileInfo) -> Self {
        FileEvent {
            name: &file.name,
            size: file.size,
            mod_time: file.mod_time,
        }
    }
}

/// Builds the logical source URI prefix of a watched directory,
/// e.g. `ftp://files.example.com:21/incoming/`
pub fn source_prefix(scheme: &str, host: &str, port: u16, dir: &str) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() || dir == "." {
        format!("{}://{}:{}/", scheme, host, port)
    } else {
        format!("{}://{}:{}/{}/", scheme, host, port, dir)
    }
}

/// Publisher posting CloudEvents to an HTTP sink
#[derive(Debug, Clone)]
pub struct CloudEventPublisher {
    client: Client,
    sink: String,
    event_type: String,
    source_prefix: String,
}

impl CloudEventPublisher {
    pub fn new(
        sink: &str,
        event_type: &str,
        source_prefix: &str,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(CloudEventPublisher {
            client,
            sink: sink.to_string(),
            event_type: event_type.to_string(),
            source_prefix: source_prefix.to_string(),
        })
    }

    /// `ce-source` of the event describing `file`
    pub fn source_for(&self, file: &FileInfo) -> String {
        format!("{}{}", self.source_prefix, file.name)
    }
}

impl EventPublisher for CloudEventPublisher {
    fn send(&mut self, file: &FileInfo) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(&FileEvent::from(file)).map_err(|e| DeliveryError::Encode {
            name: file.name.clone(),
            source: e,
        })?;

        let response = self
            .client
            .post(&self.sink)
            .header("ce-specversion", "1.0")
            .header("ce-id", Uuid::new_v4().to_string())
            .header("ce-type", &self.event_type)
            .header("ce-source", self.source_for(file))
            .header("ce-time", Utc::now().to_rfc3339())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .map_err(|e| DeliveryError::Transport {
                name: file.name.clone(),
                source: e,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Rejected {
                name: file.name.clone(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}
