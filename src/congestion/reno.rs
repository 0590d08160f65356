use std::sync::Arc;
use std::time::{Duration, Instant};

use super::SendAlgorithm;
use crate::rtt::RttStats;
use crate::{ByteCount, PacketNumber};

/// A simple, standard congestion controller: slow start, AIMD congestion
/// avoidance, and a window collapse on retransmission timeout.
///
/// Recovery is tracked by packet number: losses of packets sent before the
/// last window cutback do not shrink the window again.
#[derive(Debug, Clone)]
pub struct Reno {
    config: Arc<RenoConfig>,
    /// Maximum number of bytes in flight that may be sent.
    window: ByteCount,
    /// Slow start threshold in bytes. Below it the window grows by the number
    /// of bytes acknowledged; above it, by roughly one datagram per RTT.
    ssthresh: ByteCount,
    largest_sent_packet_number: Option<PacketNumber>,
    largest_acked_packet_number: Option<PacketNumber>,
    /// The most recent packet sent when the window was last cut back.
    largest_sent_at_last_cutback: Option<PacketNumber>,
}

impl Reno {
    /// Construct a state using the given `config`.
    pub fn new(config: Arc<RenoConfig>) -> Self {
        Self {
            window: config.initial_window,
            ssthresh: ByteCount::MAX,
            largest_sent_packet_number: None,
            largest_acked_packet_number: None,
            largest_sent_at_last_cutback: None,
            config,
        }
    }

    fn in_slow_start(&self) -> bool {
        self.window < self.ssthresh
    }

    fn in_recovery(&self) -> bool {
        match (
            self.largest_acked_packet_number,
            self.largest_sent_at_last_cutback,
        ) {
            (Some(acked), Some(cutback)) => acked <= cutback,
            (None, Some(_)) => true,
            _ => false,
        }
    }
}

impl Default for Reno {
    fn default() -> Self {
        Self::new(Arc::new(RenoConfig::default()))
    }
}

impl SendAlgorithm for Reno {
    fn on_packet_sent(
        &mut self,
        _sent_time: Instant,
        _bytes_in_flight: ByteCount,
        packet_number: PacketNumber,
        _length: ByteCount,
        is_retransmittable: bool,
    ) {
        if is_retransmittable {
            self.largest_sent_packet_number = Some(packet_number);
        }
    }

    fn maybe_exit_slow_start(&mut self) {}

    fn on_packet_acked(
        &mut self,
        packet_number: PacketNumber,
        length: ByteCount,
        _bytes_in_flight: ByteCount,
    ) {
        self.largest_acked_packet_number = Some(
            self.largest_acked_packet_number
                .map_or(packet_number, |la| la.max(packet_number)),
        );
        if self.in_recovery() {
            return;
        }
        if self.in_slow_start() {
            self.window += length;
        } else {
            self.window += self.config.max_datagram_size * length / self.window;
        }
    }

    fn on_packet_lost(
        &mut self,
        packet_number: PacketNumber,
        _length: ByteCount,
        _bytes_in_flight: ByteCount,
    ) {
        // Only one cutback per congestion event: losses of packets older than
        // the last cutback are part of the same event.
        if self
            .largest_sent_at_last_cutback
            .is_some_and(|cutback| packet_number <= cutback)
        {
            return;
        }
        self.window = (self.window as f64 * self.config.loss_reduction_factor) as ByteCount;
        self.window = self.window.max(self.config.minimum_window);
        self.ssthresh = self.window;
        self.largest_sent_at_last_cutback = self.largest_sent_packet_number;
    }

    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool) {
        if !packets_retransmitted {
            return;
        }
        self.largest_sent_at_last_cutback = None;
        self.ssthresh = self.window / 2;
        self.window = self.config.minimum_window;
    }

    fn time_until_send(&self, rtt: &RttStats, _bytes_in_flight: ByteCount) -> Duration {
        let srtt = rtt.smoothed_rtt();
        if srtt.is_zero() || self.window == 0 {
            return Duration::ZERO;
        }
        // Spread one congestion window over one RTT; outside slow start, pace
        // at 5/8 of that rate to leave room for the window to grow.
        let delay = srtt.mul_f64(self.config.max_datagram_size as f64 / (2.0 * self.window as f64));
        if self.in_slow_start() {
            delay
        } else {
            delay * 8 / 5
        }
    }

    fn get_congestion_window(&self) -> ByteCount {
        self.window
    }

    fn retransmission_delay(&self, rtt: &RttStats) -> Duration {
        if rtt.smoothed_rtt().is_zero() {
            return Duration::ZERO;
        }
        rtt.smoothed_rtt() + 4 * rtt.mean_deviation()
    }
}

/// Configuration for the [`Reno`] congestion controller.
#[derive(Debug, Clone)]
pub struct RenoConfig {
    max_datagram_size: ByteCount,
    initial_window: ByteCount,
    minimum_window: ByteCount,
    loss_reduction_factor: f64,
}

impl RenoConfig {
    /// The sender's maximum UDP payload size. Does not include UDP or IP
    /// overhead. Used for calculating initial and minimum congestion windows.
    pub fn max_datagram_size(&mut self, value: ByteCount) -> &mut Self {
        self.max_datagram_size = value;
        self
    }

    /// Default limit on the amount of outstanding data in bytes.
    ///
    /// Recommended value: `min(10 * max_datagram_size, max(2 * max_datagram_size, 14720))`
    pub fn initial_window(&mut self, value: ByteCount) -> &mut Self {
        self.initial_window = value;
        self
    }

    /// Default minimum congestion window.
    ///
    /// Recommended value: `2 * max_datagram_size`.
    pub fn minimum_window(&mut self, value: ByteCount) -> &mut Self {
        self.minimum_window = value;
        self
    }

    /// Reduction in congestion window when a new loss event is detected.
    pub fn loss_reduction_factor(&mut self, value: f64) -> &mut Self {
        self.loss_reduction_factor = value;
        self
    }
}

impl Default for RenoConfig {
    fn default() -> Self {
        const MAX_DATAGRAM_SIZE: ByteCount = 1232;
        Self {
            max_datagram_size: MAX_DATAGRAM_SIZE,
            initial_window: 14720.max(2 * MAX_DATAGRAM_SIZE).min(10 * MAX_DATAGRAM_SIZE),
            minimum_window: 2 * MAX_DATAGRAM_SIZE,
            loss_reduction_factor: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSS: ByteCount = 1232;

    fn send_n(reno: &mut Reno, first_pn: PacketNumber, n: u64) {
        let now = Instant::now();
        for i in 0..n {
            reno.on_packet_sent(now, (i + 1) * MSS, first_pn + i, MSS, true);
        }
    }

    fn primed_rtt() -> RttStats {
        let mut rtt = RttStats::new();
        rtt.update(Duration::from_millis(100), Duration::ZERO, Instant::now());
        rtt
    }

    #[test]
    fn slow_start_grows_window_by_acked_bytes() {
        let mut reno = Reno::default();
        let initial = reno.get_congestion_window();
        send_n(&mut reno, 1, 2);
        reno.on_packet_acked(1, MSS, MSS);
        reno.on_packet_acked(2, MSS, 0);
        assert_eq!(reno.get_congestion_window(), initial + 2 * MSS);
    }

    #[test]
    fn loss_halves_the_window_once_per_event() {
        let mut reno = Reno::default();
        let initial = reno.get_congestion_window();
        send_n(&mut reno, 1, 10);
        reno.on_packet_lost(3, MSS, 9 * MSS);
        assert_eq!(reno.get_congestion_window(), initial / 2);
        // Packet 4 was sent before the cutback point (packet 10), so this
        // loss belongs to the same congestion event.
        reno.on_packet_lost(4, MSS, 8 * MSS);
        assert_eq!(reno.get_congestion_window(), initial / 2);
    }

    #[test]
    fn window_never_drops_below_the_minimum() {
        let mut reno = Reno::default();
        // Each loss hits a packet sent after the previous cutback, so every
        // one counts as a fresh congestion event.
        for pn in 1..=6 {
            send_n(&mut reno, pn, 1);
            reno.on_packet_lost(pn, MSS, 0);
        }
        assert_eq!(reno.get_congestion_window(), 2 * MSS);
    }

    #[test]
    fn rto_collapses_the_window() {
        let mut reno = Reno::default();
        send_n(&mut reno, 1, 4);
        let before = reno.get_congestion_window();
        reno.on_retransmission_timeout(false);
        assert_eq!(reno.get_congestion_window(), before);
        reno.on_retransmission_timeout(true);
        assert_eq!(reno.get_congestion_window(), 2 * MSS);
        assert_eq!(reno.ssthresh, before / 2);
    }

    #[test]
    fn no_window_growth_during_recovery() {
        let mut reno = Reno::default();
        send_n(&mut reno, 1, 10);
        reno.on_packet_lost(1, MSS, 9 * MSS);
        let after_loss = reno.get_congestion_window();
        // Packet 5 predates the cutback, so its ACK must not grow the window.
        reno.on_packet_acked(5, MSS, 8 * MSS);
        assert_eq!(reno.get_congestion_window(), after_loss);
        // A packet sent after the cutback ends recovery.
        send_n(&mut reno, 11, 1);
        reno.on_packet_acked(11, MSS, 0);
        assert!(reno.get_congestion_window() > after_loss);
    }

    #[test]
    fn pacing_delay_scales_with_rtt_and_window() {
        let reno = Reno::default();
        let rtt = primed_rtt();
        let delay = reno.time_until_send(&rtt, 0);
        assert!(!delay.is_zero());
        assert!(delay < Duration::from_millis(100));
        // No estimate yet: send immediately.
        assert_eq!(reno.time_until_send(&RttStats::new(), 0), Duration::ZERO);
    }

    #[test]
    fn retransmission_delay_follows_rtt_stats() {
        let reno = Reno::default();
        assert_eq!(
            reno.retransmission_delay(&RttStats::new()),
            Duration::ZERO
        );
        let rtt = primed_rtt();
        // First sample: smoothed = 100ms, mean deviation = 50ms.
        assert_eq!(
            reno.retransmission_delay(&rtt),
            Duration::from_millis(100) + 4 * Duration::from_millis(50)
        );
    }
}
