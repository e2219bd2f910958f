//! Session timers, surfaced to the state machine as ordinary events.
//!
//! Thresholds relative to the negotiated heartbeat interval: a Heartbeat is
//! emitted after 1.0 intervals of outbound silence, a TestRequest after 1.2
//! intervals of inbound silence, and the peer is declared dead after 2.4
//! intervals of inbound silence. A separate timeout bounds the wait for the
//! initial Logon and for the peer's Logout reply.

use tokio::time::{sleep_until, Duration, Instant, Sleep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    SendHeartbeat,
    SendTestRequest,
    PeerTimedOut,
    LogonExpired,
    LogoutExpired,
}

pub(crate) struct Timeout {
    next_instant: Instant,
    duration: Duration,
    event: TimerEvent,
}

impl Timeout {
    fn new(duration: Duration, event: TimerEvent) -> Timeout {
        Timeout {
            next_instant: Instant::now() + duration,
            duration,
            event,
        }
    }

    pub(crate) fn reset_timeout(&mut self) {
        self.next_instant = Instant::now() + self.duration;
    }

    fn set_timeout_duration(&mut self, dur: Duration) {
        self.duration = dur;
        self.reset_timeout();
    }

    pub(crate) fn timeout(&self) -> (Sleep, TimerEvent) {
        (sleep_until(self.next_instant), self.event)
    }
}

fn test_request_duration(heartbeat: Duration) -> Duration {
    (heartbeat * 12) / 10
}

fn peer_timeout_duration(heartbeat: Duration) -> Duration {
    (heartbeat * 24) / 10
}

fn logout_duration(heartbeat: Duration) -> Duration {
    heartbeat * 2
}

pub(crate) struct FixTimeouts {
    heartbeat: Timeout,
    test_request: Timeout,
    peer: Timeout,
    logon: Timeout,
    logout: Timeout,
    awaiting_logon: bool,
    awaiting_logout: bool,
}

impl FixTimeouts {
    pub(crate) fn new(heartbeat_dur: Duration, logon_dur: Duration) -> FixTimeouts {
        FixTimeouts {
            heartbeat: Timeout::new(heartbeat_dur, TimerEvent::SendHeartbeat),
            test_request: Timeout::new(
                test_request_duration(heartbeat_dur),
                TimerEvent::SendTestRequest,
            ),
            peer: Timeout::new(peer_timeout_duration(heartbeat_dur), TimerEvent::PeerTimedOut),
            logon: Timeout::new(logon_dur, TimerEvent::LogonExpired),
            logout: Timeout::new(logout_duration(heartbeat_dur), TimerEvent::LogoutExpired),
            awaiting_logon: true,
            awaiting_logout: false,
        }
    }

    pub(crate) fn next_expiring_timeout(&mut self) -> &mut Timeout {
        if self.awaiting_logon {
            return &mut self.logon;
        }
        if self.awaiting_logout {
            return &mut self.logout;
        }
        let mut next = &mut self.heartbeat;
        if self.test_request.next_instant < next.next_instant {
            next = &mut self.test_request;
        }
        if self.peer.next_instant < next.next_instant {
            next = &mut self.peer;
        }
        next
    }

    /// Called once the Logon handshake completes; adopts the negotiated
    /// interval and starts liveness tracking.
    pub(crate) fn logged_on(&mut self, heartbeat_dur: Duration) {
        self.awaiting_logon = false;
        self.heartbeat.set_timeout_duration(heartbeat_dur);
        self.test_request
            .set_timeout_duration(test_request_duration(heartbeat_dur));
        self.peer
            .set_timeout_duration(peer_timeout_duration(heartbeat_dur));
        self.logout
            .set_timeout_duration(logout_duration(heartbeat_dur));
    }

    pub(crate) fn reset_heartbeat(&mut self) {
        self.heartbeat.reset_timeout();
    }

    /// Re-arms only the TestRequest threshold after one was emitted, leaving
    /// the peer-silence deadline running.
    pub(crate) fn reset_test_request(&mut self) {
        self.test_request.reset_timeout();
    }

    /// Any inbound traffic proves the peer alive.
    pub(crate) fn reset_inbound(&mut self) {
        self.test_request.reset_timeout();
        self.peer.reset_timeout();
    }

    pub(crate) fn start_logout_timeout(&mut self) {
        self.awaiting_logout = true;
        self.logout.reset_timeout();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_logon_timeout_fires_first() {
        let mut timeouts = FixTimeouts::new(Duration::from_secs(30), Duration::from_secs(10));
        let (sleep, event) = timeouts.next_expiring_timeout().timeout();
        assert_eq!(event, TimerEvent::LogonExpired);
        tokio::time::advance(Duration::from_secs(11)).await;
        sleep.await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_ordering_after_logon() {
        let mut timeouts = FixTimeouts::new(Duration::from_secs(30), Duration::from_secs(30));
        timeouts.logged_on(Duration::from_secs(30));

        // heartbeat (x1.0) expires before test request (x1.2) and peer (x2.4)
        let (_, event) = timeouts.next_expiring_timeout().timeout();
        assert_eq!(event, TimerEvent::SendHeartbeat);

        // an outbound message postpones the heartbeat past the test request
        tokio::time::advance(Duration::from_secs(29)).await;
        timeouts.reset_heartbeat();
        let (_, event) = timeouts.next_expiring_timeout().timeout();
        assert_eq!(event, TimerEvent::SendTestRequest);

        // inbound traffic postpones test request and peer timers
        timeouts.reset_inbound();
        let (_, event) = timeouts.next_expiring_timeout().timeout();
        assert_eq!(event, TimerEvent::SendHeartbeat);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_wait_overrides() {
        let mut timeouts = FixTimeouts::new(Duration::from_secs(30), Duration::from_secs(30));
        timeouts.logged_on(Duration::from_secs(30));
        timeouts.start_logout_timeout();
        let (_, event) = timeouts.next_expiring_timeout().timeout();
        assert_eq!(event, TimerEvent::LogoutExpired);
    }
}
