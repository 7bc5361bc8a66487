use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Polling,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Polling => "polling",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session left the push path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    ProbeRejected,
    SubscribeFailed,
    ChannelError,
    ChannelTimeout,
    ChannelClosed,
    GuardExpired,
}

impl FallbackReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FallbackReason::ProbeRejected => "probe_rejected",
            FallbackReason::SubscribeFailed => "subscribe_failed",
            FallbackReason::ChannelError => "channel_error",
            FallbackReason::ChannelTimeout => "channel_timeout",
            FallbackReason::ChannelClosed => "channel_closed",
            FallbackReason::GuardExpired => "guard_expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub reason: Option<FallbackReason>,
}

/// One session's connection mode. Every method returns the transition it made, or
/// `None` when the event does not apply in the current state. `Polling` is terminal.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    history: Vec<ConnectionState>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            history: vec![ConnectionState::Disconnected],
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Every state visited, starting with `Disconnected`.
    pub fn history(&self) -> &[ConnectionState] {
        &self.history
    }

    /// Initial decision from the probe result.
    pub fn begin(&mut self, viable: bool) -> Option<Transition> {
        if self.state != ConnectionState::Disconnected {
            return None;
        }
        if viable {
            self.move_to(ConnectionState::Connecting, None)
        } else {
            self.move_to(ConnectionState::Polling, Some(FallbackReason::ProbeRejected))
        }
    }

    pub fn acknowledge(&mut self) -> Option<Transition> {
        match self.state {
            ConnectionState::Connecting => self.move_to(ConnectionState::Connected, None),
            _ => None,
        }
    }

    pub fn fall_back(&mut self, reason: FallbackReason) -> Option<Transition> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                self.move_to(ConnectionState::Polling, Some(reason))
            }
            ConnectionState::Disconnected | ConnectionState::Polling => None,
        }
    }

    fn move_to(
        &mut self,
        to: ConnectionState,
        reason: Option<FallbackReason>,
    ) -> Option<Transition> {
        let from = self.state;
        self.state = to;
        self.history.push(to);
        Some(Transition { from, to, reason })
    }
}
