//! Per-connection liveness probing — ping/pong timer pair.
//!
//! DESIGN
//! ======
//! Each tick tells the owning connection to send a `ping`; the connection
//! then arms the pong deadline. A `pong` observed in time clears it; an
//! expired deadline reports the peer as unresponsive so the connection can
//! terminate the socket abruptly and reclaim resources from a half-open
//! peer. Timers are owned by the connection's select loop and die with it —
//! there is no process-wide timer registry.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

/// What the connection should do next about liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Interval elapsed: send a `ping` and arm the pong deadline.
    SendPing,
    /// Pong deadline expired: terminate the socket without a close
    /// handshake.
    PeerUnresponsive,
}

/// Ping interval plus pending-pong deadline for one connection.
pub struct KeepAlive {
    timer: Option<Timer>,
}

struct Timer {
    interval: Interval,
    period: Duration,
    /// Set while a ping is outstanding.
    deadline: Option<Instant>,
}

impl KeepAlive {
    /// `None` (or a zero interval upstream) disables probing entirely:
    /// [`KeepAlive::next`] then never resolves.
    #[must_use]
    pub fn new(interval: Option<Duration>) -> Self {
        let timer = interval.map(|period| {
            // First ping one full period after acknowledgement, not at once.
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Timer { interval, period, deadline: None }
        });
        Self { timer }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self { timer: None }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.timer.is_some()
    }

    /// Wait for the next liveness event. Cancel-safe: intended to be polled
    /// as one arm of the connection's `select!` loop.
    pub async fn next(&mut self) -> Liveness {
        let Some(timer) = self.timer.as_mut() else {
            return std::future::pending().await;
        };
        if let Some(deadline) = timer.deadline {
            // A ping is outstanding; the only question is whether the pong
            // arrives before the deadline.
            tokio::time::sleep_until(deadline).await;
            timer.deadline = None;
            Liveness::PeerUnresponsive
        } else {
            timer.interval.tick().await;
            Liveness::SendPing
        }
    }

    /// Arm the pong deadline after a `ping` went out.
    pub fn arm_deadline(&mut self) {
        if let Some(timer) = self.timer.as_mut() {
            timer.deadline = Some(Instant::now() + timer.period);
        }
    }

    /// A `pong` arrived: cancel the pending deadline.
    pub fn pong(&mut self) {
        if let Some(timer) = self.timer.as_mut() {
            timer.deadline = None;
        }
    }
}

#[cfg(test)]
#[path = "keepalive_test.rs"]
mod tests;
