//! Per-tag connection state machine.
//!
//! A [`TagConnection`] is created when a consumer claims a tag and dropped
//! when that consumer is torn down or the group drains. Transitions are pure:
//! each input returns the [`ConnectionAction`]s the coordinator must perform
//! (transport calls, timers, consumer notifications). Timer callbacks carry a
//! generation number so that a stale timer can never revive a connection.
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected --link lost--> Reconnecting
//!                              |  ^                                         |
//!                 busy: reset  |  | backoff elapsed                         |
//!                 other: timer +--+ <---------------------------------------+
//!
//! any state --close--> Closed (terminal)
//! ```

use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tagmux_types::{FeatureSet, TagId, TagKind};

use crate::consumer::ConsumerId;
use crate::error::Error;

/// Identifies one claim of one tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle state of a tag connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Claimed but not yet asked to connect.
    Disconnected,
    /// A connect attempt is in flight or scheduled.
    Connecting,
    /// Link is up and features are being (or have been) configured.
    Connected,
    /// Link dropped; a reconnect is scheduled.
    Reconnecting,
    /// Torn down. Terminal.
    Closed,
}

/// How a failed connect should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    /// Resource busy: disconnect and retry without delay.
    Busy,
    /// Anything else: retry after the backoff.
    Transient,
}

impl From<&Error> for ConnectFailure {
    fn from(err: &Error) -> Self {
        if err.is_busy() {
            ConnectFailure::Busy
        } else {
            ConnectFailure::Transient
        }
    }
}

/// Side effects requested by a transition.
#[derive(Debug, Clone)]
pub enum ConnectionAction {
    /// Issue a transport connect.
    Connect,
    /// Issue a transport disconnect.
    Disconnect,
    /// Disconnect, then report back so the connect can be retried at once.
    ResetThenConnect,
    /// Report back after `delay` with this `generation`.
    ScheduleRetry { generation: u64, delay: Duration },
    /// Run feature setup; stop when the token is cancelled.
    ConfigureFeatures(CancellationToken),
    /// Tell the owning consumer the tag connected.
    ReportConnected,
    /// Tell the owning consumer the tag dropped.
    ReportDisconnected,
}

/// Connection to one claimed tag on behalf of one consumer.
#[derive(Debug)]
pub struct TagConnection {
    id: ConnectionId,
    tag: TagId,
    kind: TagKind,
    owner: ConsumerId,
    features: FeatureSet,
    state: ConnectionState,
    reconnect_enabled: bool,
    backoff: Duration,
    generation: u64,
    attempts: u32,
    session: Option<CancellationToken>,
}

impl TagConnection {
    pub fn new(
        id: ConnectionId,
        tag: TagId,
        kind: TagKind,
        owner: ConsumerId,
        features: FeatureSet,
        backoff: Duration,
    ) -> Self {
        Self {
            id,
            tag,
            kind,
            owner,
            features,
            state: ConnectionState::Disconnected,
            reconnect_enabled: true,
            backoff,
            generation: 0,
            attempts: 0,
            session: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn tag(&self) -> &TagId {
        &self.tag
    }

    pub fn kind(&self) -> TagKind {
        self.kind
    }

    pub fn owner(&self) -> ConsumerId {
        self.owner
    }

    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_enabled(&self) -> bool {
        self.reconnect_enabled
    }

    /// Connect attempts since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Begin connecting. Only valid from `Disconnected` or `Reconnecting`.
    pub fn connect(&mut self) -> Option<ConnectionAction> {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {
                self.state = ConnectionState::Connecting;
                self.attempts += 1;
                Some(ConnectionAction::Connect)
            }
            _ => None,
        }
    }

    /// Outcome of a transport connect.
    pub fn on_connect_result(
        &mut self,
        outcome: Result<(), ConnectFailure>,
    ) -> Vec<ConnectionAction> {
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        match outcome {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                self.attempts = 0;
                let token = CancellationToken::new();
                self.session = Some(token.clone());
                vec![
                    ConnectionAction::ReportConnected,
                    ConnectionAction::ConfigureFeatures(token),
                ]
            }
            Err(_) if !self.reconnect_enabled => {
                self.state = ConnectionState::Closed;
                Vec::new()
            }
            Err(ConnectFailure::Busy) => vec![ConnectionAction::ResetThenConnect],
            Err(ConnectFailure::Transient) => vec![self.schedule_retry()],
        }
    }

    /// The disconnect issued for a busy failure finished.
    pub fn on_reset_complete(&mut self) -> Option<ConnectionAction> {
        if self.state == ConnectionState::Connecting && self.reconnect_enabled {
            self.attempts += 1;
            Some(ConnectionAction::Connect)
        } else {
            None
        }
    }

    /// A scheduled retry fired.
    pub fn on_retry_elapsed(&mut self, generation: u64) -> Option<ConnectionAction> {
        if generation != self.generation || !self.reconnect_enabled {
            return None;
        }
        match self.state {
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                self.state = ConnectionState::Connecting;
                self.attempts += 1;
                Some(ConnectionAction::Connect)
            }
            _ => None,
        }
    }

    /// The transport reported the link down.
    pub fn on_link_lost(&mut self) -> Vec<ConnectionAction> {
        if self.state != ConnectionState::Connected {
            return Vec::new();
        }
        self.cancel_session();
        if self.reconnect_enabled {
            self.state = ConnectionState::Reconnecting;
            vec![ConnectionAction::ReportDisconnected, self.schedule_retry()]
        } else {
            self.state = ConnectionState::Closed;
            Vec::new()
        }
    }

    /// Tear down for good. Returns a disconnect if a link may be up.
    pub fn close(&mut self) -> Option<ConnectionAction> {
        self.reconnect_enabled = false;
        self.generation += 1;
        self.cancel_session();
        let previous = std::mem::replace(&mut self.state, ConnectionState::Closed);
        matches!(
            previous,
            ConnectionState::Connected | ConnectionState::Connecting
        )
        .then_some(ConnectionAction::Disconnect)
    }

    fn schedule_retry(&mut self) -> ConnectionAction {
        self.generation += 1;
        ConnectionAction::ScheduleRetry {
            generation: self.generation,
            delay: self.backoff,
        }
    }

    fn cancel_session(&mut self) {
        if let Some(token) = self.session.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BACKOFF: Duration = Duration::from_secs(5);

    fn connection() -> TagConnection {
        TagConnection::new(
            ConnectionId::from_raw(1),
            TagId::new("aabbccddeeff"),
            TagKind::Cc2650,
            ConsumerId::from_raw(1),
            FeatureSet::all(),
            BACKOFF,
        )
    }

    fn retry_generation(actions: &[ConnectionAction]) -> u64 {
        actions
            .iter()
            .find_map(|a| match a {
                ConnectionAction::ScheduleRetry { generation, delay } => {
                    assert_eq!(*delay, BACKOFF);
                    Some(*generation)
                }
                _ => None,
            })
            .expect("retry scheduled")
    }

    #[test]
    fn test_connect_only_from_idle_states() {
        let mut conn = connection();
        assert!(matches!(conn.connect(), Some(ConnectionAction::Connect)));
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(conn.connect().is_none());

        conn.on_connect_result(Ok(()));
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.connect().is_none());
    }

    #[test]
    fn test_success_reports_and_configures() {
        let mut conn = connection();
        conn.connect();
        let actions = conn.on_connect_result(Ok(()));
        assert!(matches!(actions[0], ConnectionAction::ReportConnected));
        let ConnectionAction::ConfigureFeatures(token) = &actions[1] else {
            panic!("expected feature setup");
        };
        assert!(!token.is_cancelled());
        assert_eq!(conn.attempts(), 0);
    }

    #[test]
    fn test_busy_failure_resets_without_delay() {
        let mut conn = connection();
        conn.connect();
        let actions = conn.on_connect_result(Err(ConnectFailure::Busy));
        assert!(matches!(actions.as_slice(), [ConnectionAction::ResetThenConnect]));
        assert_eq!(conn.state(), ConnectionState::Connecting);

        assert!(matches!(conn.on_reset_complete(), Some(ConnectionAction::Connect)));
        assert_eq!(conn.attempts(), 2);
    }

    #[test]
    fn test_transient_failure_schedules_backoff() {
        let mut conn = connection();
        conn.connect();
        let actions = conn.on_connect_result(Err(ConnectFailure::Transient));
        let generation = retry_generation(&actions);

        assert!(conn.on_retry_elapsed(generation + 1).is_none());
        assert!(matches!(
            conn.on_retry_elapsed(generation),
            Some(ConnectionAction::Connect)
        ));
    }

    #[test]
    fn test_link_loss_reconnects_and_cancels_setup() {
        let mut conn = connection();
        conn.connect();
        let actions = conn.on_connect_result(Ok(()));
        let ConnectionAction::ConfigureFeatures(token) = actions[1].clone() else {
            panic!("expected feature setup");
        };

        let actions = conn.on_link_lost();

        assert!(token.is_cancelled());
        assert_eq!(conn.state(), ConnectionState::Reconnecting);
        assert!(matches!(actions[0], ConnectionAction::ReportDisconnected));
        let generation = retry_generation(&actions);
        assert!(matches!(
            conn.on_retry_elapsed(generation),
            Some(ConnectionAction::Connect)
        ));
        assert_eq!(conn.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_link_loss_ignored_unless_connected() {
        let mut conn = connection();
        assert!(conn.on_link_lost().is_empty());
        conn.connect();
        assert!(conn.on_link_lost().is_empty());
        assert_eq!(conn.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_close_suppresses_pending_retry() {
        let mut conn = connection();
        conn.connect();
        let generation = retry_generation(&conn.on_connect_result(Err(ConnectFailure::Transient)));

        assert!(matches!(conn.close(), Some(ConnectionAction::Disconnect)));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.reconnect_enabled());
        assert!(conn.on_retry_elapsed(generation).is_none());
        assert!(conn.on_reset_complete().is_none());
        assert!(conn.connect().is_none());
    }

    #[test]
    fn test_close_of_idle_connection_needs_no_disconnect() {
        let mut conn = connection();
        assert!(conn.close().is_none());

        let mut conn = connection();
        conn.connect();
        conn.on_connect_result(Ok(()));
        conn.on_link_lost();
        assert!(conn.close().is_none());
    }

    #[test]
    fn test_late_connect_result_after_close_is_ignored() {
        let mut conn = connection();
        conn.connect();
        conn.close();
        assert!(conn.on_connect_result(Ok(())).is_empty());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_failure_from_error() {
        let busy = Error::connection_failed(
            TagId::new("aa"),
            crate::error::ConnectionFailureReason::Busy,
        );
        assert_eq!(ConnectFailure::from(&busy), ConnectFailure::Busy);
        let other = Error::NotConnected(TagId::new("aa"));
        assert_eq!(ConnectFailure::from(&other), ConnectFailure::Transient);
    }
}
