//! Network link state machine.
//!
//! Polled once per loop pass with the driver's latest status. The
//! supervisor decides when to reconnect and when the outage has lasted long
//! enough to give up on in-process recovery.

use crate::{
    clock::{elapsed, Millis},
    config::SupervisorConfig,
    error::Fatal,
    hal::LinkStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Up {
        /// The link was down on the previous poll.
        recovered: bool,
        report_signal: bool,
    },
    /// Issue a connect request now.
    Reconnect,
    /// Down, but a connect request was issued recently.
    Waiting,
    TimedOut(Fatal),
}

#[derive(Debug, Clone)]
pub struct LinkSupervisor {
    state: LinkState,
    last_connected: Millis,
    last_attempt: Option<Millis>,
    last_signal_report: Option<Millis>,
    timeout_ms: Millis,
    reconnect_interval_ms: Millis,
    signal_refresh_ms: Millis,
    tripped: bool,
}

impl LinkSupervisor {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            state: LinkState::Disconnected,
            last_connected: 0,
            last_attempt: None,
            last_signal_report: None,
            timeout_ms: config.link_timeout_ms,
            reconnect_interval_ms: config.reconnect_interval_ms,
            signal_refresh_ms: config.signal_refresh_ms,
            tripped: false,
        }
    }

    /// Starts the outage clock. Called once before the first poll.
    pub fn start(&mut self, now: Millis) {
        self.last_connected = now;
        self.last_attempt = None;
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn last_connected(&self) -> Millis {
        self.last_connected
    }

    pub fn poll(&mut self, now: Millis, status: LinkStatus, has_address: bool) -> LinkEvent {
        if self.tripped {
            return self.timed_out(now);
        }

        if status == LinkStatus::Connected && has_address {
            let recovered = self.state != LinkState::Connected;
            self.state = LinkState::Connected;
            self.last_connected = now;
            self.last_attempt = None;

            let report_signal = recovered
                || self
                    .last_signal_report
                    .map_or(true, |mark| elapsed(now, mark) >= self.signal_refresh_ms);
            if report_signal {
                self.last_signal_report = Some(now);
            }
            return LinkEvent::Up {
                recovered,
                report_signal,
            };
        }

        if self.state == LinkState::Connected {
            self.state = LinkState::Disconnected;
        }

        if elapsed(now, self.last_connected) > self.timeout_ms {
            self.tripped = true;
            return self.timed_out(now);
        }

        let attempt_due = self
            .last_attempt
            .map_or(true, |mark| elapsed(now, mark) >= self.reconnect_interval_ms);
        if attempt_due {
            self.state = LinkState::Connecting;
            self.last_attempt = Some(now);
            LinkEvent::Reconnect
        } else {
            LinkEvent::Waiting
        }
    }

    fn timed_out(&self, now: Millis) -> LinkEvent {
        LinkEvent::TimedOut(Fatal::LinkTimeout {
            outage_ms: elapsed(now, self.last_connected),
            limit_ms: self.timeout_ms,
        })
    }
}

/// Signal bars for the display: -50 dBm or better is 3, -85 dBm or worse is 1.
pub fn signal_level(rssi_dbm: i32) -> u8 {
    let mapped = (rssi_dbm + 50) * 2 / 35 + 3;
    mapped.clamp(1, 3) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptAction {
    /// Nothing in flight: drop any stale association and connect afresh.
    Restart,
    /// An attempt is still running; leave it alone.
    Hold,
}

/// In-flight connect request for drivers whose association and address
/// assignment complete asynchronously. Keeps repeated reconnect requests
/// from tearing down an attempt that is still making progress.
#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    window_ms: Millis,
    started: Option<Millis>,
}

impl ConnectAttempt {
    pub fn new(window_ms: Millis) -> Self {
        Self {
            window_ms,
            started: None,
        }
    }

    /// `associated` means the access point accepted the station, with or
    /// without an address.
    pub fn in_progress(&self, now: Millis, associated: bool) -> bool {
        associated
            || self
                .started
                .is_some_and(|mark| elapsed(now, mark) < self.window_ms)
    }

    pub fn request(&mut self, now: Millis, associated: bool) -> AttemptAction {
        if self.in_progress(now, associated) {
            return AttemptAction::Hold;
        }
        self.started = Some(now);
        AttemptAction::Restart
    }

    /// Status for a link without a usable address.
    pub fn status(&self, now: Millis, associated: bool) -> LinkStatus {
        if self.in_progress(now, associated) {
            LinkStatus::Connecting
        } else {
            LinkStatus::Disconnected
        }
    }

    /// The link is up with an address.
    pub fn settle(&mut self) {
        self.started = None;
    }
}
