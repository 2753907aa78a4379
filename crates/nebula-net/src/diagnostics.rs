//! Link diagnostics: RTT estimation, packet loss and traffic counters.
//!
//! Every packet a connection sends is eventually resolved as either
//! confirmed by the peer's ack bitfield or lost (it fell out of the ack
//! window unconfirmed). Confirmations produce RTT samples; resolutions feed a
//! rolling loss window.

use std::collections::VecDeque;
use std::time::Duration;

use crate::address::NetAddress;
use crate::connection::ConnectionState;

/// Configuration for the diagnostics tracker.
#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    /// Number of RTT samples kept for min/max/jitter. Default: 64.
    pub window_size: usize,
    /// Number of resolved packets the loss rate is computed over. Default: 64.
    pub loss_window: usize,
    /// Weight of a new RTT sample in the moving average. Default: 0.1.
    pub rtt_smoothing: f64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            window_size: 64,
            loss_window: 64,
            rtt_smoothing: 0.1,
        }
    }
}

/// Rolling link statistics for one connection.
#[derive(Debug)]
pub struct DiagnosticsTracker {
    config: DiagnosticsConfig,
    /// Recent RTT samples.
    pub(crate) rtt_samples: VecDeque<Duration>,
    /// Exponential moving average of RTT.
    smoothed_rtt: Option<Duration>,
    /// Recent packet outcomes, `true` for delivered.
    pub(crate) outcomes: VecDeque<bool>,
    pub(crate) packets_sent: u64,
    pub(crate) packets_received: u64,
    pub(crate) bytes_sent: u64,
    pub(crate) bytes_received: u64,
    pub(crate) packets_lost: u64,
}

impl DiagnosticsTracker {
    /// Create a new diagnostics tracker with the given configuration.
    pub fn new(config: DiagnosticsConfig) -> Self {
        Self {
            rtt_samples: VecDeque::with_capacity(config.window_size),
            smoothed_rtt: None,
            outcomes: VecDeque::with_capacity(config.loss_window),
            packets_sent: 0,
            packets_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            packets_lost: 0,
            config,
        }
    }

    pub fn on_packet_sent(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub fn on_packet_received(&mut self, bytes: usize) {
        self.packets_received += 1;
        self.bytes_received += bytes as u64;
    }

    /// A sent packet was confirmed after `rtt`.
    pub fn on_packet_acked(&mut self, rtt: Duration) {
        self.push_outcome(true);
        self.add_rtt_sample(rtt);
    }

    /// A sent packet left the ack window unconfirmed.
    pub fn on_packet_lost(&mut self) {
        self.packets_lost += 1;
        self.push_outcome(false);
    }

    /// Feed an RTT measured outside the ack path (join handshake, ping).
    pub fn add_rtt_sample(&mut self, rtt: Duration) {
        if self.rtt_samples.len() >= self.config.window_size {
            self.rtt_samples.pop_front();
        }
        self.rtt_samples.push_back(rtt);

        self.smoothed_rtt = Some(match self.smoothed_rtt {
            None => rtt,
            Some(avg) => {
                let alpha = self.config.rtt_smoothing;
                Duration::from_secs_f64(avg.as_secs_f64() * (1.0 - alpha) + rtt.as_secs_f64() * alpha)
            }
        });
    }

    fn push_outcome(&mut self, delivered: bool) {
        if self.outcomes.len() >= self.config.loss_window {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(delivered);
    }

    /// Moving-average RTT, zero until the first sample.
    pub fn rtt(&self) -> Duration {
        self.smoothed_rtt.unwrap_or(Duration::ZERO)
    }

    /// Minimum RTT in the rolling window.
    pub fn min_rtt(&self) -> Option<Duration> {
        self.rtt_samples.iter().min().copied()
    }

    /// Maximum RTT in the rolling window.
    pub fn max_rtt(&self) -> Option<Duration> {
        self.rtt_samples.iter().max().copied()
    }

    /// Jitter: standard deviation of RTT samples in the rolling window.
    pub fn jitter(&self) -> Option<Duration> {
        if self.rtt_samples.len() < 2 {
            return None;
        }

        let n = self.rtt_samples.len() as f64;
        let avg = self.rtt_samples.iter().map(Duration::as_secs_f64).sum::<f64>() / n;
        let variance: f64 = self
            .rtt_samples
            .iter()
            .map(|s| {
                let diff = s.as_secs_f64() - avg;
                diff * diff
            })
            .sum::<f64>()
            / (n - 1.0);

        Some(Duration::from_secs_f64(variance.sqrt()))
    }

    /// Fraction of recently resolved packets that were lost (0.0 to 1.0).
    pub fn loss_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let lost = self.outcomes.iter().filter(|delivered| !**delivered).count();
        lost as f64 / self.outcomes.len() as f64
    }

    /// Produce an immutable snapshot of current diagnostics.
    pub fn snapshot(&self) -> NetworkDiagnostics {
        NetworkDiagnostics {
            rtt: self.rtt(),
            min_rtt: self.min_rtt(),
            max_rtt: self.max_rtt(),
            jitter: self.jitter(),
            loss_rate: self.loss_rate(),
            packets_sent: self.packets_sent,
            packets_received: self.packets_received,
            packets_lost: self.packets_lost,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
        }
    }
}

impl Default for DiagnosticsTracker {
    fn default() -> Self {
        Self::new(DiagnosticsConfig::default())
    }
}

/// Immutable snapshot of link diagnostics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkDiagnostics {
    /// Moving-average round-trip time.
    pub rtt: Duration,
    pub min_rtt: Option<Duration>,
    pub max_rtt: Option<Duration>,
    /// Standard deviation of RTT.
    pub jitter: Option<Duration>,
    /// Packet loss rate (0.0 to 1.0).
    pub loss_rate: f64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Everything a status display needs to know about one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStats {
    pub index: Option<u8>,
    pub peer_id: String,
    pub address: NetAddress,
    pub state: ConnectionState,
    pub is_local: bool,
    /// Ack stamped on the most recent outgoing packet.
    pub last_sent_ack: u16,
    /// Newest ack received from the peer.
    pub last_received_ack: u16,
    /// Received-ack bitfield reported back to the peer.
    pub received_ack_bits: u32,
    /// Reliable messages transmitted but not yet confirmed.
    pub unconfirmed_reliables: usize,
    /// Reliable messages waiting for room in the reliable window.
    pub queued_reliables: usize,
    pub link: NetworkDiagnostics,
}

/// Session-wide receive counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounters {
    /// Datagrams read off the socket.
    pub packets_received: u64,
    /// Datagrams discarded by simulated loss.
    pub packets_dropped: u64,
    /// Datagrams that failed to parse.
    pub packets_malformed: u64,
    /// Packets dropped because no usable connection matched the sender.
    pub packets_unroutable: u64,
    /// Datagrams written to the socket.
    pub packets_sent: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tracker(window: usize) -> DiagnosticsTracker {
        DiagnosticsTracker::new(DiagnosticsConfig {
            window_size: window,
            loss_window: window,
            rtt_smoothing: 0.5,
        })
    }

    #[test]
    fn test_first_sample_seeds_average() {
        let mut tracker = make_tracker(10);
        assert_eq!(tracker.rtt(), Duration::ZERO);
        tracker.on_packet_acked(Duration::from_millis(40));
        assert_eq!(tracker.rtt(), Duration::from_millis(40));
    }

    #[test]
    fn test_average_moves_toward_new_samples() {
        let mut tracker = make_tracker(10);
        tracker.add_rtt_sample(Duration::from_millis(100));
        tracker.add_rtt_sample(Duration::from_millis(200));
        let ms = tracker.rtt().as_secs_f64() * 1000.0;
        assert!((ms - 150.0).abs() < 0.01, "expected ~150ms, got {ms:.2}ms");
    }

    #[test]
    fn test_jitter_calculated_from_variance() {
        let mut tracker = make_tracker(100);
        for ms in [10, 20, 30, 40, 50] {
            tracker.rtt_samples.push_back(Duration::from_millis(ms));
        }

        let jitter_ms = tracker.jitter().unwrap().as_secs_f64() * 1000.0;
        assert!(
            (jitter_ms - 15.81).abs() < 1.0,
            "Jitter should be ~15.81ms, got {jitter_ms:.2}ms",
        );
    }

    #[test]
    fn test_loss_rate_over_resolved_packets() {
        let mut tracker = make_tracker(100);
        for i in 0..10 {
            if i < 7 {
                tracker.on_packet_acked(Duration::from_millis(5));
            } else {
                tracker.on_packet_lost();
            }
        }
        assert!((tracker.loss_rate() - 0.3).abs() < 1e-9);
        assert_eq!(tracker.packets_lost, 3);
    }

    #[test]
    fn test_loss_window_is_bounded() {
        let mut tracker = make_tracker(4);
        for _ in 0..4 {
            tracker.on_packet_lost();
        }
        for _ in 0..4 {
            tracker.on_packet_acked(Duration::from_millis(1));
        }
        assert_eq!(tracker.loss_rate(), 0.0);
        assert_eq!(tracker.outcomes.len(), 4);
        assert_eq!(tracker.packets_lost, 4);
    }

    #[test]
    fn test_min_max_rtt() {
        let mut tracker = make_tracker(100);
        tracker.add_rtt_sample(Duration::from_millis(5));
        tracker.add_rtt_sample(Duration::from_millis(15));
        tracker.add_rtt_sample(Duration::from_millis(10));

        assert_eq!(tracker.min_rtt(), Some(Duration::from_millis(5)));
        assert_eq!(tracker.max_rtt(), Some(Duration::from_millis(15)));
    }

    #[test]
    fn test_empty_tracker() {
        let tracker = make_tracker(100);
        assert!(tracker.min_rtt().is_none());
        assert!(tracker.jitter().is_none());
        assert_eq!(tracker.loss_rate(), 0.0);
    }

    #[test]
    fn test_snapshot_carries_counters() {
        let mut tracker = make_tracker(100);
        tracker.on_packet_sent(100);
        tracker.on_packet_sent(50);
        tracker.on_packet_received(30);

        let snap = tracker.snapshot();
        assert_eq!(snap.packets_sent, 2);
        assert_eq!(snap.bytes_sent, 150);
        assert_eq!(snap.packets_received, 1);
        assert_eq!(snap.bytes_received, 30);
    }
}
