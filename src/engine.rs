//! Watermark engine
//!
//! Decides which entries of a directory listing are new relative to the
//! persisted [`StateRecord`], hands each new entry to the publisher in
//! listing order and persists the advanced watermark.
//!
//! Delivery is at-least-once: the watermark is saved after the deliveries
//! of a cycle, so a failed save means those entries are offered again on
//! the next cycle.

use crate::logging::log_with_cycle;
use crate::protocols::FileInfo;
use crate::publisher::{DeliveryError, EventPublisher};
use crate::state::StateRecord;
use crate::store::{RecordBackend, StateStore, StoreError};
use serde::Deserialize;

/// How files sharing the watermark timestamp are remembered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryTracking {
    /// Only the file that advanced the watermark is remembered. Other
    /// files with exactly the watermark timestamp may be delivered again.
    SingleName,
    /// Every file delivered at the watermark timestamp is remembered.
    #[default]
    NameSet,
}

/// Outcome of one `process_listing` call that got past loading the state
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Names handed to the publisher successfully, in delivery order
    pub delivered: Vec<String>,
    /// Entries recognized as already delivered
    pub skipped: usize,
    /// Delivery failure that stopped the cycle early
    pub delivery_error: Option<DeliveryError>,
    /// The record written to the store, if the watermark moved
    pub committed: Option<StateRecord>,
}

/// Computes and persists the watermark for each poll cycle
#[derive(Debug)]
pub struct WatermarkEngine<B> {
    store: StateStore<B>,
    tracking: BoundaryTracking,
}

impl<B: RecordBackend> WatermarkEngine<B> {
    pub fn new(store: StateStore<B>, tracking: BoundaryTracking) -> Self {
        WatermarkEngine { store, tracking }
    }

    /// Runs one cycle over `entries`
    ///
    /// The state is always loaded fresh from the store. Entries are skipped
    /// when they are older than the stored watermark or were already
    /// delivered at it; every other entry is sent. The first failed send
    /// ends the loop. Progress made before that point is still saved.
    ///
    /// # Errors
    /// * `StoreError::Load` / `StoreError::Decode` before anything is sent
    /// * `StoreError::Save` / `StoreError::Encode` after the deliveries;
    ///   the deliveries stand but the watermark did not move
    pub fn process_listing<P>(
        &self,
        entries: &[FileInfo],
        publisher: &mut P,
        cycle: Option<u64>,
    ) -> Result<CycleReport, StoreError>
    where
        P: EventPublisher + ?Sized,
    {
        let loaded = self.store.load()?;
        let _ = log_with_cycle(
            &format!(
                "Loaded state: last file '{}', last modification time {}, {} name(s) at mark",
                loaded.last_file_processed,
                loaded.last_mod_time.to_rfc3339(),
                loaded.names_at_mark.len()
            ),
            cycle,
        );

        let mut next = loaded.clone();
        if self.tracking == BoundaryTracking::SingleName {
            next.names_at_mark.clear();
        }
        let mut report = CycleReport::default();

        for entry in entries {
            if entry.mod_time < loaded.last_mod_time || self.already_delivered(&loaded, entry) {
                report.skipped += 1;
                continue;
            }

            let _ = log_with_cycle(
                &format!(
                    "Found new file: {} ({} bytes, modified {})",
                    entry.name,
                    entry.size,
                    entry.mod_time.to_rfc3339()
                ),
                cycle,
            );
            if let Err(e) = publisher.send(entry) {
                let _ = log_with_cycle(
                    &format!("Failed to publish {}, stopping this cycle: {}", entry.name, e),
                    cycle,
                );
                report.delivery_error = Some(e);
                break;
            }
            report.delivered.push(entry.name.clone());
            self.advance(&mut next, entry);
        }

        if self.should_commit(&loaded, &next) {
            let _ = log_with_cycle(
                &format!(
                    "Saving state: last file '{}', last modification time {}",
                    next.last_file_processed,
                    next.last_mod_time.to_rfc3339()
                ),
                cycle,
            );
            if let Err(e) = self.store.save(&next) {
                let _ = log_with_cycle(&format!("Failed to save state: {}", e), cycle);
                return Err(e);
            }
            report.committed = Some(next);
        }

        Ok(report)
    }

    fn already_delivered(&self, loaded: &StateRecord, entry: &FileInfo) -> bool {
        match self.tracking {
            // Name match regardless of timestamp
            BoundaryTracking::SingleName => entry.name == loaded.last_file_processed,
            BoundaryTracking::NameSet => {
                entry.name == loaded.last_file_processed
                    || (entry.mod_time == loaded.last_mod_time && loaded.seen_at_mark(&entry.name))
            }
        }
    }

    /// Moves the working watermark past a delivered entry
    fn advance(&self, next: &mut StateRecord, entry: &FileInfo) {
        if entry.mod_time > next.last_mod_time {
            next.last_mod_time = entry.mod_time;
            next.last_file_processed = entry.name.clone();
            next.names_at_mark.clear();
            if self.tracking == BoundaryTracking::NameSet {
                next.names_at_mark.insert(entry.name.clone());
            }
        } else if entry.mod_time == next.last_mod_time && self.tracking == BoundaryTracking::NameSet {
            if next.names_at_mark.is_empty() && !next.last_file_processed.is_empty() {
                // Carry a single-name record over into the set
                next.names_at_mark.insert(next.last_file_processed.clone());
            }
            next.names_at_mark.insert(entry.name.clone());
        }
    }

    fn should_commit(&self, loaded: &StateRecord, next: &StateRecord) -> bool {
        if next.last_mod_time > loaded.last_mod_time {
            return true;
        }
        self.tracking == BoundaryTracking::NameSet
            && next.last_mod_time == loaded.last_mod_time
            && next.names_at_mark != loaded.names_at_mark
    }
}
