//! Scan state for the coordinator.
//!
//! The `scanning` flag is the authority for whether advertisements are
//! accepted. Each start opens a new session: the tag registry is cleared and
//! the once-per-session connect-all latch is re-armed.

use tracing::{info, warn};

use crate::events::{CoordinatorEvent, EventDispatcher};
use crate::registry::TagRegistry;
use crate::transport::Transport;

/// Tracks discovery state across scan sessions.
#[derive(Debug, Default)]
pub struct ScanController {
    scanning: bool,
    session: u64,
    connect_all_fired: bool,
}

impl ScanController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Number of sessions started so far.
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Clear the registry and start discovery. No-op while already scanning.
    ///
    /// Returns whether discovery is now running.
    pub async fn start(
        &mut self,
        transport: &dyn Transport,
        tags: &mut TagRegistry,
        events: &EventDispatcher<CoordinatorEvent>,
    ) -> bool {
        if self.scanning {
            return true;
        }
        tags.clear();
        self.session += 1;
        self.connect_all_fired = false;
        match transport.start_discovery().await {
            Ok(()) => {
                info!(session = self.session, "Started scanning");
                self.scanning = true;
                events.send(CoordinatorEvent::ScanStarted {
                    session: self.session,
                });
            }
            Err(e) => warn!(session = self.session, "Failed to start scanning: {}", e),
        }
        self.scanning
    }

    /// Stop discovery. No-op when not scanning.
    pub async fn stop(
        &mut self,
        transport: &dyn Transport,
        events: &EventDispatcher<CoordinatorEvent>,
    ) {
        if !self.scanning {
            return;
        }
        if let Err(e) = transport.stop_discovery().await {
            warn!(session = self.session, "Failed to stop scanning: {}", e);
        }
        self.scanning = false;
        info!(session = self.session, "Stopped scanning");
        events.send(CoordinatorEvent::ScanStopped {
            session: self.session,
        });
    }

    /// Latch connect-all for this session. Returns `false` if it already fired.
    pub fn arm_connect_all(&mut self) -> bool {
        !std::mem::replace(&mut self.connect_all_fired, true)
    }

    pub fn connect_all_fired(&self) -> bool {
        self.connect_all_fired
    }
}
