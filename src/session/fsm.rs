//! Connection state machine
//!
//! Pure bookkeeping for the session lifecycle: which state we are in, how
//! many consecutive failures we have seen and what to do about a closure.
//! The manager feeds it events and carries out the returned [`Action`]s.
//!
//! ```text
//! Idle -> Connecting -> Open -> (clean close | error close)
//!            ^                        |              |
//!            +------------ now -------+              v
//!            +------ after backoff ---- Reconnecting (or Failed once the cap is hit)
//! ```

use crate::config::ReconnectPolicy;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Host-visible connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    /// Waiting for the backoff timer of retry `attempt`
    Reconnecting { attempt: u32 },
    Closing,
    /// Retries exhausted; needs an explicit `connect()`
    Failed,
}

impl ConnectionState {
    pub fn status(&self) -> SessionStatus {
        match self {
            ConnectionState::Idle | ConnectionState::Failed => SessionStatus::Disconnected,
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => SessionStatus::Connecting,
            ConnectionState::Open => SessionStatus::Open,
            ConnectionState::Closing => SessionStatus::Closing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closure {
    /// Remote end closed normally (or asked us to go away)
    Clean,
    /// Transport error, abnormal close or failed connect attempt
    Error,
}

/// What the manager must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing; the event did not apply
    Ignore,
    /// Open a new transport right away
    Connect,
    /// Open a new transport after `delay`
    ScheduleReconnect { attempt: u32, delay: Duration },
    /// Retries exhausted; report terminal failure
    Fail { attempts: u32 },
    /// Session over by host request
    Stop,
}

#[derive(Debug, Clone)]
pub struct ConnectionFsm {
    state: ConnectionState,
    attempts: u32,
    intentional_disconnect: bool,
    policy: ReconnectPolicy,
}

impl ConnectionFsm {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Idle,
            attempts: 0,
            intentional_disconnect: false,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_intentional_disconnect(&self) -> bool {
        self.intentional_disconnect
    }

    /// Host asked to connect. Ignored while an attempt is in flight or a
    /// session is open; a pending backoff is cut short.
    pub fn connect_requested(&mut self) -> Action {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Open => {
                info!("Connect ignored: session already {:?}", self.state);
                Action::Ignore
            }
            ConnectionState::Reconnecting { .. } => {
                info!("Connect requested during backoff, retrying now");
                self.state = ConnectionState::Connecting;
                Action::Connect
            }
            ConnectionState::Idle | ConnectionState::Failed | ConnectionState::Closing => {
                self.attempts = 0;
                self.intentional_disconnect = false;
                self.state = ConnectionState::Connecting;
                Action::Connect
            }
        }
    }

    /// Transport is open and set up.
    pub fn opened(&mut self) {
        if self.attempts > 0 {
            info!("Reconnected after {} failed attempt(s)", self.attempts);
        }
        self.attempts = 0;
        self.state = ConnectionState::Open;
    }

    /// The current transport closed, or a connect attempt failed.
    pub fn closed(&mut self, closure: Closure) -> Action {
        if self.intentional_disconnect {
            debug!("Closure after disconnect, not reconnecting");
            self.state = ConnectionState::Idle;
            return Action::Stop;
        }
        if !matches!(self.state, ConnectionState::Connecting | ConnectionState::Open) {
            debug!("Closure in state {:?} ignored", self.state);
            return Action::Ignore;
        }

        match closure {
            Closure::Clean => {
                info!("Session closed cleanly, reconnecting immediately");
                self.state = ConnectionState::Connecting;
                Action::Connect
            }
            Closure::Error if self.policy.allows(self.attempts) => {
                let delay = self.policy.delay_for(self.attempts);
                self.attempts += 1;
                warn!(
                    "Session closed with error, reconnect attempt {}/{} in {:?}",
                    self.attempts, self.policy.max_attempts, delay
                );
                self.state = ConnectionState::Reconnecting { attempt: self.attempts };
                Action::ScheduleReconnect {
                    attempt: self.attempts,
                    delay,
                }
            }
            Closure::Error => {
                warn!("Giving up after {} reconnect attempt(s)", self.attempts);
                self.state = ConnectionState::Failed;
                Action::Fail {
                    attempts: self.attempts,
                }
            }
        }
    }

    /// A connect attempt failed for a reason retrying cannot fix.
    pub fn terminal_failure(&mut self) {
        self.state = ConnectionState::Idle;
    }

    /// Backoff timer fired. Returns whether a connect should start now.
    pub fn reconnect_due(&mut self) -> bool {
        match self.state {
            ConnectionState::Reconnecting { .. } => {
                self.state = ConnectionState::Connecting;
                true
            }
            _ => false,
        }
    }

    /// Host-requested shutdown: any later closure is terminal.
    pub fn disconnect(&mut self) -> bool {
        self.intentional_disconnect = true;
        self.attempts = self.policy.max_attempts;
        let was_active = self.state != ConnectionState::Idle;
        self.state = ConnectionState::Closing;
        was_active
    }

    /// Teardown after `disconnect` finished.
    pub fn closed_by_host(&mut self) {
        self.state = ConnectionState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fsm() -> ConnectionFsm {
        ConnectionFsm::new(ReconnectPolicy::default())
    }

    fn open(fsm: &mut ConnectionFsm) {
        assert_eq!(fsm.connect_requested(), Action::Connect);
        fsm.opened();
        assert_eq!(fsm.state(), ConnectionState::Open);
    }

    #[test]
    fn test_duplicate_connect_is_ignored() {
        let mut fsm = fsm();
        assert_eq!(fsm.connect_requested(), Action::Connect);
        assert_eq!(fsm.connect_requested(), Action::Ignore);
        fsm.opened();
        assert_eq!(fsm.connect_requested(), Action::Ignore);
        assert_eq!(fsm.state().status(), SessionStatus::Open);
    }

    #[test]
    fn test_backoff_doubles_and_caps_at_five() {
        let mut fsm = fsm();
        open(&mut fsm);

        let mut delays = Vec::new();
        loop {
            match fsm.closed(Closure::Error) {
                Action::ScheduleReconnect { attempt, delay } => {
                    assert_eq!(attempt as usize, delays.len() + 1);
                    delays.push(delay.as_secs());
                    assert!(fsm.reconnect_due());
                }
                Action::Fail { attempts } => {
                    assert_eq!(attempts, 5);
                    break;
                }
                other => panic!("Unexpected action {:?}", other),
            }
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        assert_eq!(fsm.state(), ConnectionState::Failed);
        assert_eq!(fsm.state().status(), SessionStatus::Disconnected);
    }

    #[test]
    fn test_successful_open_resets_counter() {
        let mut fsm = fsm();
        open(&mut fsm);
        fsm.closed(Closure::Error);
        fsm.reconnect_due();
        fsm.closed(Closure::Error);
        assert_eq!(fsm.attempts(), 2);
        fsm.reconnect_due();
        fsm.opened();
        assert_eq!(fsm.attempts(), 0);
        assert_eq!(
            fsm.closed(Closure::Error),
            Action::ScheduleReconnect {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
    }

    #[test]
    fn test_clean_close_reconnects_without_delay() {
        let mut fsm = fsm();
        open(&mut fsm);
        assert_eq!(fsm.closed(Closure::Clean), Action::Connect);
        assert_eq!(fsm.state(), ConnectionState::Connecting);
        assert_eq!(fsm.attempts(), 0);
    }

    #[test]
    fn test_closure_after_disconnect_does_not_reconnect() {
        let mut fsm = fsm();
        open(&mut fsm);
        assert!(fsm.disconnect());
        assert_eq!(fsm.attempts(), 5);
        assert_eq!(fsm.closed(Closure::Error), Action::Stop);
        assert_eq!(fsm.closed(Closure::Clean), Action::Stop);
        assert_eq!(fsm.state(), ConnectionState::Idle);
        assert!(!fsm.reconnect_due());
    }

    #[test]
    fn test_stale_timer_and_closure_are_ignored() {
        let mut fsm = fsm();
        assert!(!fsm.reconnect_due());
        assert_eq!(fsm.closed(Closure::Error), Action::Ignore);

        open(&mut fsm);
        fsm.closed(Closure::Error);
        // A second closure report for the same transport.
        assert_eq!(fsm.closed(Closure::Error), Action::Ignore);
        assert_eq!(fsm.attempts(), 1);
    }

    #[test]
    fn test_connect_during_backoff_and_after_failure() {
        let mut fsm = fsm();
        open(&mut fsm);
        fsm.closed(Closure::Error);
        assert_eq!(fsm.connect_requested(), Action::Connect);
        assert!(!fsm.reconnect_due());

        fsm.terminal_failure();
        assert_eq!(fsm.state(), ConnectionState::Idle);
        assert_eq!(fsm.connect_requested(), Action::Connect);
        assert_eq!(fsm.attempts(), 0);
        assert!(!fsm.is_intentional_disconnect());
    }
}
