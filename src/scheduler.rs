//! Poll scheduler
//!
//! Runs one poll cycle (listing + watermark engine) per tick of a fixed
//! period on a dedicated thread. Cycles never overlap: ticks that fall due
//! while a cycle is still running are dropped, not queued.

use crate::config::Config;
use crate::engine::{CycleReport, WatermarkEngine};
use crate::logging::log_with_cycle;
use crate::protocols::{DirectoryLister, ListingError};
use crate::publisher::EventPublisher;
use crate::shutdown::ShutdownSignal;
use crate::store::{RecordBackend, StoreError};
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Lifecycle of a scheduler; `Stopped` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedulerState {
    Idle = 0,
    Running = 1,
    Stopped = 2,
}

impl SchedulerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SchedulerState::Idle,
            1 => SchedulerState::Running,
            _ => SchedulerState::Stopped,
        }
    }
}

/// What to poll and how often
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    pub dir: String,
    pub interval: Duration,
}

impl From<&Config> for PollSettings {
    fn from(config: &Config) -> Self {
        PollSettings {
            dir: config.dir.clone(),
            interval: config.poll_interval(),
        }
    }
}

/// Result of one poll cycle
#[derive(Debug)]
pub enum CycleOutcome {
    /// The directory could not be listed; the engine was not run
    ListingFailed(ListingError),
    /// The state could not be loaded or saved
    StateFailed(StoreError),
    Completed(CycleReport),
}

/// Drives the watermark engine from directory listings
pub struct PollScheduler<L, P, B> {
    lister: L,
    publisher: P,
    engine: WatermarkEngine<B>,
    settings: PollSettings,
    cycle: u64,
    state: Arc<AtomicU8>,
}

impl<L, P, B> PollScheduler<L, P, B>
where
    L: DirectoryLister,
    P: EventPublisher,
    B: RecordBackend,
{
    pub fn new(lister: L, publisher: P, engine: WatermarkEngine<B>, settings: PollSettings) -> Self {
        PollScheduler {
            lister,
            publisher,
            engine,
            settings,
            cycle: 0,
            state: Arc::new(AtomicU8::new(SchedulerState::Idle as u8)),
        }
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Number of cycles started so far
    pub fn cycles(&self) -> u64 {
        self.cycle
    }

    /// Lists the directory and feeds the listing to the engine
    ///
    /// Every failure is logged and contained in the returned outcome.
    pub fn run_cycle(&mut self) -> CycleOutcome {
        self.cycle += 1;
        let cycle = Some(self.cycle);

        let entries = match self.lister.list(&self.settings.dir) {
            Ok(entries) => entries,
            Err(e) => {
                let _ = log_with_cycle(&format!("Failed to list directory, skipping cycle: {}", e), cycle);
                return CycleOutcome::ListingFailed(e);
            }
        };
        let _ = log_with_cycle(
            &format!("Listed {} file(s) in {}", entries.len(), self.settings.dir),
            cycle,
        );

        match self.engine.process_listing(&entries, &mut self.publisher, cycle) {
            Ok(report) => {
                let _ = log_with_cycle(
                    &format!(
                        "Cycle done: {} delivered, {} already seen{}",
                        report.delivered.len(),
                        report.skipped,
                        if report.delivery_error.is_some() { ", stopped on delivery failure" } else { "" }
                    ),
                    cycle,
                );
                CycleOutcome::Completed(report)
            }
            Err(e) => {
                let _ = log_with_cycle(&format!("Cycle aborted: {}", e), cycle);
                CycleOutcome::StateFailed(e)
            }
        }
    }

    /// Runs cycles every `interval` until `shutdown` is requested
    ///
    /// The first cycle runs one interval after the call. A request observed
    /// while a cycle is running takes effect when that cycle returns. A tick
    /// beyond the range of `Instant` never comes; the loop then only waits
    /// for shutdown.
    pub fn run(&mut self, shutdown: &ShutdownSignal) {
        self.state.store(SchedulerState::Running as u8, Ordering::SeqCst);
        let interval = self.settings.interval;
        let mut next_tick = Instant::now().checked_add(interval);

        while let Some(tick) = next_tick {
            let now = Instant::now();
            if now < tick && shutdown.wait_timeout(tick - now) {
                break;
            }
            if shutdown.is_requested() {
                break;
            }

            self.run_cycle();

            next_tick = next_deadline(tick, Instant::now(), interval);
            if let Some(following) = next_tick {
                let missed = missed_ticks(tick, following, interval);
                if missed > 0 {
                    let _ = log_with_cycle(
                        &format!("Cycle overran the poll interval, {} tick(s) skipped", missed),
                        Some(self.cycle),
                    );
                }
            }
        }
        if next_tick.is_none() {
            let _ = log_with_cycle("Next poll is out of clock range, waiting for shutdown", None);
            shutdown.wait();
        }

        self.state.store(SchedulerState::Stopped as u8, Ordering::SeqCst);
        let _ = log_with_cycle("Poll scheduler stopped", None);
    }
}

impl<L, P, B> PollScheduler<L, P, B>
where
    L: DirectoryLister + Send + 'static,
    P: EventPublisher + Send + 'static,
    B: RecordBackend + Send + 'static,
{
    /// Moves the scheduler onto its own thread
    pub fn start(mut self, shutdown: ShutdownSignal) -> io::Result<SchedulerHandle> {
        let state = self.state.clone();
        state.store(SchedulerState::Running as u8, Ordering::SeqCst);
        let signal = shutdown.clone();

        let thread = thread::Builder::new()
            .name("poll-scheduler".to_string())
            .spawn(move || self.run(&signal))?;

        Ok(SchedulerHandle {
            shutdown,
            state,
            thread: Some(thread),
        })
    }
}

/// First tick strictly after `now`, on the grid `previous + k * interval`
///
/// `None` when that tick cannot be represented as an `Instant`.
pub fn next_deadline(previous: Instant, now: Instant, interval: Duration) -> Option<Instant> {
    let next = previous.checked_add(interval)?;
    if next > now || interval.is_zero() {
        return Some(next);
    }
    let behind = now.duration_since(next).as_nanos();
    let steps = behind / interval.as_nanos() + 1;
    let skip = interval.as_nanos().checked_mul(steps)?;
    let skip = Duration::from_nanos(u64::try_from(skip).ok()?);
    next.checked_add(skip)
}

fn missed_ticks(previous: Instant, next: Instant, interval: Duration) -> u128 {
    if interval.is_zero() {
        return 0;
    }
    (next.duration_since(previous).as_nanos() / interval.as_nanos()).saturating_sub(1)
}

/// Handle to a running scheduler thread
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: ShutdownSignal,
    state: Arc<AtomicU8>,
    thread: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Requests shutdown and waits for the current cycle to finish
    pub fn stop(mut self) {
        self.shutdown.request();
        self.join_thread();
    }

    fn join_thread(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                let _ = crate::logging::log("Poll scheduler thread panicked");
                self.state.store(SchedulerState::Stopped as u8, Ordering::SeqCst);
            }
        }
    }
}
