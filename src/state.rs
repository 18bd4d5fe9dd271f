//! Persisted watermark of the file-arrival source
//!
//! The record is stored as JSON using the field names `LastFileProcessed`
//! and `LastModTime`, so records written by earlier deployments decode
//! unchanged. `NamesAtMark` is optional and only written when non-empty.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

/// Watermark state: the newest modification time delivered so far and the
/// file(s) delivered at exactly that time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Name of the file that last advanced the watermark (JSON field: LastFileProcessed)
    #[serde(rename = "LastFileProcessed", default)]
    pub last_file_processed: String,
    /// Watermark timestamp, never decreases across saves (JSON field: LastModTime)
    #[serde(rename = "LastModTime", default = "epoch")]
    pub last_mod_time: DateTime<Utc>,
    /// Every name delivered with a modification time equal to `last_mod_time`
    /// (JSON field: NamesAtMark)
    #[serde(
        rename = "NamesAtMark",
        default,
        skip_serializing_if = "BTreeSet::is_empty"
    )]
    pub names_at_mark: BTreeSet<String>,
}

impl Default for StateRecord {
    fn default() -> Self {
        StateRecord {
            last_file_processed: String::new(),
            last_mod_time: epoch(),
            names_at_mark: BTreeSet::new(),
        }
    }
}

impl StateRecord {
    /// Builds a record that only tracks one name at the mark
    pub fn new(last_file_processed: impl Into<String>, last_mod_time: DateTime<Utc>) -> Self {
        StateRecord {
            last_file_processed: last_file_processed.into(),
            last_mod_time,
            names_at_mark: BTreeSet::new(),
        }
    }

    /// Serializes the record for storage
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes a stored record
    ///
    /// An empty payload is a freshly created record and decodes as the
    /// default value.
    pub fn decode(data: &str) -> Result<Self, serde_json::Error> {
        if data.trim().is_empty() {
            return Ok(StateRecord::default());
        }
        serde_json::from_str(data)
    }

    /// Returns true if `name` was already delivered at the current mark
    ///
    /// `last_file_processed` always counts, which keeps single-name records
    /// from older deployments meaningful.
    pub fn seen_at_mark(&self, name: &str) -> bool {
        name == self.last_file_processed || self.names_at_mark.contains(name)
    }
}
