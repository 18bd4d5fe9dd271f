use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Signal type values recorded by `request_with_signal`
pub const SIGNAL_NONE: u8 = 0;
pub const SIGNAL_INT: u8 = 1;
pub const SIGNAL_TERM: u8 = 2;

struct Inner {
    requested: AtomicBool,
    signal_type: AtomicU8,
    lock: Mutex<()>,
    wakeup: Condvar,
}

/// Cooperative stop signal shared between the signal handler, the
/// foreground thread and the poll scheduler
///
/// Cloning is cheap; all clones observe the same flag.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("requested", &self.is_requested())
            .field("signal_type", &self.signal_type())
            .finish()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        ShutdownSignal {
            inner: Arc::new(Inner {
                requested: AtomicBool::new(false),
                signal_type: AtomicU8::new(SIGNAL_NONE),
                lock: Mutex::new(()),
                wakeup: Condvar::new(),
            }),
        }
    }

    /// Checks if shutdown has been requested
    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Requests shutdown and wakes every thread blocked in `wait_timeout`
    pub fn request(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.wakeup.notify_all();
    }

    /// Request shutdown with signal type for later logging
    ///
    /// Only sets flags; logging is done by the thread that observes the request.
    ///
    /// # Arguments
    /// * `signal_type` - `SIGNAL_INT` or `SIGNAL_TERM`
    pub fn request_with_signal(&self, signal_type: u8) {
        self.inner.signal_type.store(signal_type, Ordering::SeqCst);
        self.request();
    }

    /// Get the signal type that triggered shutdown
    ///
    /// # Returns
    /// * `None` if no signal received
    /// * `Some(1)` for SIGINT (Ctrl+C)
    /// * `Some(2)` for SIGTERM
    pub fn signal_type(&self) -> Option<u8> {
        match self.inner.signal_type.load(Ordering::SeqCst) {
            SIGNAL_NONE => None,
            t => Some(t),
        }
    }

    /// Blocks for up to `timeout` or until shutdown is requested
    ///
    /// A timeout past the range of `Instant` waits for the request only.
    ///
    /// # Returns
    /// `true` if shutdown was requested, `false` if the timeout elapsed
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if self.is_requested() {
                return true;
            }
            guard = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    match self.inner.wakeup.wait_timeout(guard, deadline - now) {
                        Ok((g, _)) => g,
                        Err(e) => e.into_inner().0,
                    }
                }
                None => self
                    .inner
                    .wakeup
                    .wait(guard)
                    .unwrap_or_else(|e| e.into_inner()),
            };
        }
    }

    /// Blocks until shutdown is requested
    pub fn wait(&self) {
        while !self.wait_timeout(Duration::from_secs(3600)) {}
    }
}

/// Registers SIGINT and SIGTERM handlers that trigger `signal`
///
/// The handler thread only sets atomic flags; the first signal received
/// wins and the thread exits.
pub fn install_signal_handler(signal: &ShutdownSignal) -> io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let signal = signal.clone();

    thread::Builder::new()
        .name("signal-handler".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                let signal_type = match sig {
                    SIGTERM => SIGNAL_TERM,
                    _ => SIGNAL_INT,
                };
                signal.request_with_signal(signal_type);
            }
        })?;

    Ok(())
}
