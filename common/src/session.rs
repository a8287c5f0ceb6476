//! Broker session state machine, layered on an established link.
//!
//! Only polled while the link is up. When the link comes back after an
//! outage the session's outage clock restarts (unless disabled in the
//! config), so time spent without a link is never charged to the session.

use crate::{
    clock::{elapsed, Millis},
    config::SupervisorConfig,
    error::Fatal,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Healthy { recovered: bool },
    Down { lost: bool },
    TimedOut(Fatal),
}

#[derive(Debug, Clone)]
pub struct SessionSupervisor {
    state: SessionState,
    last_connected: Millis,
    timeout_ms: Millis,
    reset_on_link_recovery: bool,
    tripped: bool,
}

impl SessionSupervisor {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            state: SessionState::Disconnected,
            last_connected: 0,
            timeout_ms: config.session_timeout_ms,
            reset_on_link_recovery: config.reset_session_on_link_recovery,
            tripped: false,
        }
    }

    pub fn start(&mut self, now: Millis) {
        self.last_connected = now;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_connected(&self) -> Millis {
        self.last_connected
    }

    /// Called when the link transitions back to connected.
    pub fn link_recovered(&mut self, now: Millis) {
        if self.reset_on_link_recovery {
            self.last_connected = now;
        }
    }

    pub fn poll(&mut self, now: Millis, connected: bool) -> SessionEvent {
        if self.tripped {
            return self.timed_out(now);
        }

        if connected {
            let recovered = self.state != SessionState::Connected;
            self.state = SessionState::Connected;
            self.last_connected = now;
            return SessionEvent::Healthy { recovered };
        }

        let lost = self.state == SessionState::Connected;
        self.state = SessionState::Disconnected;

        if elapsed(now, self.last_connected) > self.timeout_ms {
            self.tripped = true;
            return self.timed_out(now);
        }
        SessionEvent::Down { lost }
    }

    fn timed_out(&self, now: Millis) -> SessionEvent {
        SessionEvent::TimedOut(Fatal::SessionTimeout {
            outage_ms: elapsed(now, self.last_connected),
            limit_ms: self.timeout_ms,
        })
    }
}
