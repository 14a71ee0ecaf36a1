//! Root shared state handed to every task and request handler.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::config::{Config, SharedConfig};
use crate::scan::Scanner;
use crate::slave::SlaveControl;
use crate::sync::SyncState;

pub struct AppState {
    pub cfg: SharedConfig,
    pub scanner: Arc<Scanner>,
    pub sync: SyncState,
    pub slave: SlaveControl,
    stop: AtomicBool,
    stop_notify: Notify,
}

impl AppState {
    pub fn new(base: Config, config_path: Option<PathBuf>) -> Arc<Self> {
        Arc::new(AppState {
            cfg: SharedConfig::new(base, config_path),
            scanner: Scanner::new(),
            sync: SyncState::new(),
            slave: SlaveControl::new(),
            stop: AtomicBool::new(false),
            stop_notify: Notify::new(),
        })
    }

    /// Flip the global stop flag and wake everything waiting on it.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
    }

    pub fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub async fn stopped(&self) {
        if self.stopping() {
            return;
        }
        self.stop_notify.notified().await;
    }
}
