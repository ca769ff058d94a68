use crate::protocol::Heartbeat;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerHealth {
    Alive,
    /// Quiet for longer than one heartbeat interval.
    Suspect,
    /// Quiet for longer than the heartbeat timeout. The link should be torn down.
    Dead,
}

/// Tracks liveness of the peer on one connection.
///
/// Any inbound frame counts as a sign of life, not only heartbeat acks.
pub struct PeerMonitor {
    origin: Instant,
    last_seen_ms: AtomicU64,
    next_seq: AtomicU64,
    interval: Duration,
    timeout: Duration,
}

impl PeerMonitor {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
            next_seq: AtomicU64::new(1),
            interval,
            timeout,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn observe(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_seen_ms.store(now, Ordering::Relaxed);
    }

    pub fn silence(&self) -> Duration {
        let last = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }

    pub fn health(&self) -> PeerHealth {
        self.classify(self.silence())
    }

    pub fn classify(&self, silence: Duration) -> PeerHealth {
        if silence >= self.timeout {
            PeerHealth::Dead
        } else if silence >= self.interval {
            PeerHealth::Suspect
        } else {
            PeerHealth::Alive
        }
    }

    pub fn next_request(&self) -> Heartbeat {
        Heartbeat::request(self.next_seq.fetch_add(1, Ordering::Relaxed))
    }

    /// Record an inbound heartbeat and produce the ack to send back, if any.
    pub fn reply_to(&self, heartbeat: &Heartbeat) -> Option<Heartbeat> {
        self.observe();
        if heartbeat.ack {
            debug!("Heartbeat ack seq={}", heartbeat.seq);
        }
        heartbeat.reply()
    }

    /// Log a health transition worth reporting. Returns true when the peer is dead.
    pub fn check(&self, peer: &str) -> bool {
        match self.health() {
            PeerHealth::Alive => false,
            PeerHealth::Suspect => {
                debug!("Peer {} quiet for {:?}", peer, self.silence());
                false
            }
            PeerHealth::Dead => {
                warn!(
                    "Peer {} silent for {:?}, exceeding heartbeat timeout {:?}",
                    peer,
                    self.silence(),
                    self.timeout
                );
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_thresholds() {
        let monitor = PeerMonitor::new(Duration::from_secs(5), Duration::from_secs(15));
        assert_eq!(monitor.classify(Duration::from_secs(1)), PeerHealth::Alive);
        assert_eq!(monitor.classify(Duration::from_secs(5)), PeerHealth::Suspect);
        assert_eq!(monitor.classify(Duration::from_secs(14)), PeerHealth::Suspect);
        assert_eq!(monitor.classify(Duration::from_secs(15)), PeerHealth::Dead);
    }

    #[test]
    fn test_fresh_monitor_is_alive() {
        let monitor = PeerMonitor::new(Duration::from_secs(5), Duration::from_secs(15));
        monitor.observe();
        assert_eq!(monitor.health(), PeerHealth::Alive);
        assert!(!monitor.check("127.0.0.1:1"));
    }

    #[test]
    fn test_heartbeat_sequence_increases() {
        let monitor = PeerMonitor::new(Duration::from_secs(1), Duration::from_secs(3));
        let first = monitor.next_request();
        let second = monitor.next_request();
        assert!(!first.ack);
        assert_eq!(second.seq, first.seq + 1);
    }

    #[test]
    fn test_reply_only_to_requests() {
        let monitor = PeerMonitor::new(Duration::from_secs(1), Duration::from_secs(3));
        let ack = monitor.reply_to(&Heartbeat::request(4)).unwrap();
        assert_eq!(ack, Heartbeat { seq: 4, ack: true });
        assert!(monitor.reply_to(&ack).is_none());
    }

    #[test]
    fn test_zero_timeout_is_immediately_dead() {
        let monitor = PeerMonitor::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(monitor.health(), PeerHealth::Dead);
    }
}
