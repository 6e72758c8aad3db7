/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Heartbeat and TestRequest supervision.
//!
//! Pure timer logic: decisions are functions of the configured interval and
//! the recorded activity timestamps, evaluated against an externally
//! supplied clock instant. The monitor never reads the clock and never
//! sleeps, which keeps liveness behavior deterministic under test and keeps
//! heartbeat logic decoupled from protocol logic: every decision is fed into
//! the state machine as an event.

use std::time::{Duration, Instant};

/// Liveness decision for one evaluation instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Nothing to do.
    Idle,
    /// Our side has been quiet for a full interval; send a Heartbeat.
    SendHeartbeat,
    /// The peer has been quiet for a full interval; probe with a TestRequest.
    SendTestRequest,
    /// The peer did not answer the TestRequest in time; liveness failure.
    Disconnect,
}

/// Outstanding TestRequest awaiting its answering Heartbeat.
#[derive(Debug, Clone)]
struct OutstandingProbe {
    id: String,
    sent_at: Instant,
}

/// Tracks heartbeat timing for one session.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    /// Agreed heartbeat interval.
    interval: Duration,
    /// Window the peer has to answer a TestRequest.
    response_timeout: Duration,
    /// Time of last outbound message.
    last_sent: Instant,
    /// Time of last inbound message.
    last_received: Instant,
    /// Unanswered TestRequest, if any.
    outstanding: Option<OutstandingProbe>,
}

impl HeartbeatMonitor {
    /// Creates a monitor.
    ///
    /// # Arguments
    /// * `interval` - The agreed heartbeat interval
    /// * `response_timeout` - How long to wait for a TestRequest answer
    /// * `now` - Current instant, supplied by the caller
    #[must_use]
    pub fn new(interval: Duration, response_timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            response_timeout,
            last_sent: now,
            last_received: now,
            outstanding: None,
        }
    }

    /// Returns the heartbeat interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Replaces the interval (acceptor adopting the initiator's HeartBtInt).
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Records an outbound message.
    #[inline]
    pub fn on_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    /// Records an inbound message.
    #[inline]
    pub fn on_received(&mut self, now: Instant) {
        self.last_received = now;
    }

    /// Records that a TestRequest with the given id went out.
    pub fn on_test_request_sent(&mut self, id: impl Into<String>, now: Instant) {
        self.outstanding = Some(OutstandingProbe {
            id: id.into(),
            sent_at: now,
        });
        self.last_sent = now;
    }

    /// Clears the outstanding probe if `id` matches it. Returns true if the
    /// probe was cleared.
    pub fn on_test_request_answered(&mut self, id: &str) -> bool {
        if self.outstanding.as_ref().is_some_and(|probe| probe.id == id) {
            self.outstanding = None;
            true
        } else {
            false
        }
    }

    /// Returns the outstanding TestRequest id, if any.
    #[must_use]
    pub fn outstanding_probe(&self) -> Option<&str> {
        self.outstanding.as_ref().map(|probe| probe.id.as_str())
    }

    /// Milliseconds of inbound silence at `now`.
    #[must_use]
    pub fn silence_millis(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.last_received).as_millis() as u64
    }

    /// Evaluates liveness at `now`.
    ///
    /// Priority: an expired probe wins over sending a new probe, which wins
    /// over keeping our own side alive.
    #[must_use]
    pub fn poll(&self, now: Instant) -> HeartbeatAction {
        if let Some(probe) = &self.outstanding {
            if now.saturating_duration_since(probe.sent_at) >= self.response_timeout {
                return HeartbeatAction::Disconnect;
            }
        } else if now.saturating_duration_since(self.last_received) >= self.interval {
            return HeartbeatAction::SendTestRequest;
        }

        if now.saturating_duration_since(self.last_sent) >= self.interval {
            return HeartbeatAction::SendHeartbeat;
        }
        HeartbeatAction::Idle
    }

    /// Resets all activity bookkeeping to `now`.
    pub fn reset(&mut self, now: Instant) {
        self.last_sent = now;
        self.last_received = now;
        self.outstanding = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(30);

    fn monitor(now: Instant) -> HeartbeatMonitor {
        HeartbeatMonitor::new(INTERVAL, INTERVAL, now)
    }

    #[test]
    fn test_idle_within_interval() {
        let start = Instant::now();
        let mon = monitor(start);
        assert_eq!(mon.poll(start + Duration::from_secs(29)), HeartbeatAction::Idle);
    }

    #[test]
    fn test_quiet_outbound_sends_heartbeat() {
        let start = Instant::now();
        let mut mon = monitor(start);
        // Peer stays chatty; only our side is quiet.
        mon.on_received(start + Duration::from_secs(25));
        assert_eq!(
            mon.poll(start + Duration::from_secs(30)),
            HeartbeatAction::SendHeartbeat
        );
    }

    #[test]
    fn test_quiet_inbound_sends_test_request() {
        let start = Instant::now();
        let mut mon = monitor(start);
        // We stay chatty; the peer goes silent for the full interval.
        mon.on_sent(start + Duration::from_secs(25));
        assert_eq!(
            mon.poll(start + Duration::from_secs(30)),
            HeartbeatAction::SendTestRequest
        );
    }

    #[test]
    fn test_unanswered_probe_disconnects() {
        let start = Instant::now();
        let mut mon = monitor(start);

        let probe_at = start + Duration::from_secs(30);
        mon.on_test_request_sent("TEST1", probe_at);
        assert_eq!(
            mon.poll(probe_at + Duration::from_secs(29)),
            HeartbeatAction::Idle
        );
        assert_eq!(
            mon.poll(probe_at + Duration::from_secs(30)),
            HeartbeatAction::Disconnect
        );
    }

    #[test]
    fn test_answered_probe_clears() {
        let start = Instant::now();
        let mut mon = monitor(start);

        mon.on_test_request_sent("TEST1", start + Duration::from_secs(30));
        assert!(!mon.on_test_request_answered("OTHER"));
        assert_eq!(mon.outstanding_probe(), Some("TEST1"));

        assert!(mon.on_test_request_answered("TEST1"));
        assert!(mon.outstanding_probe().is_none());
    }

    #[test]
    fn test_no_second_probe_while_outstanding() {
        let start = Instant::now();
        let mut mon = monitor(start);

        let probe_at = start + Duration::from_secs(30);
        mon.on_test_request_sent("TEST1", probe_at);
        // Still silent, but a probe is already in flight and our own side
        // just sent it, so nothing new fires inside the response window.
        assert_eq!(
            mon.poll(probe_at + Duration::from_secs(10)),
            HeartbeatAction::Idle
        );
    }

    #[test]
    fn test_reset() {
        let start = Instant::now();
        let mut mon = monitor(start);
        mon.on_test_request_sent("TEST1", start + Duration::from_secs(30));

        let later = start + Duration::from_secs(60);
        mon.reset(later);
        assert!(mon.outstanding_probe().is_none());
        assert_eq!(mon.poll(later + Duration::from_secs(1)), HeartbeatAction::Idle);
    }

    #[test]
    fn test_silence_millis() {
        let start = Instant::now();
        let mut mon = monitor(start);
        mon.on_received(start + Duration::from_secs(5));
        assert_eq!(mon.silence_millis(start + Duration::from_secs(15)), 10_000);
    }
}
