#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use penumbra::{Config, Cookie, Notifier, Status};

/// Notifier that records every `notify_io_complete` call.
pub struct RecordingNotifier {
    events: Mutex<Vec<(Cookie, Status)>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingNotifier {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<(Cookie, Status)> {
        self.events.lock().clone()
    }

    /// Blocks until `cookie` has been notified, returning its status.
    pub fn wait_for_cookie(&self, cookie: Cookie, timeout: Duration) -> Option<Status> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((_, status)) = self
                .events
                .lock()
                .iter()
                .rev()
                .find(|(c, _)| *c == cookie)
            {
                return Some(*status);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Notifier for RecordingNotifier {
    fn notify_io_complete(&self, cookie: Cookie, status: Status) {
        self.events.lock().push((cookie, status));
    }
}

/// Polls `pred` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if pred() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Test configuration over a database file inside `dir`.
pub fn test_config(dir: &Path) -> Config {
    Config::for_testing(dir.join("cache.db"))
}
