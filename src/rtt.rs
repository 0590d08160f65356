use std::cmp;
use std::time::{Duration, Instant};

use crate::DEFAULT_INITIAL_RTT;

/// Round-trip-time statistics for a connection, computed as described in
/// RFC6298.
///
/// The peer's reported ACK delay is subtracted from a sample before it enters
/// the smoothed estimate, but only when doing so cannot push the sample below
/// the minimum RTT seen so far.
#[derive(Debug, Default, Clone, Copy)]
pub struct RttStats {
    latest: Duration,
    min: Option<Duration>,
    smoothed: Option<Duration>,
    mean_deviation: Duration,
}

impl RttStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new RTT sample.
    ///
    /// `send_delta` is the time between sending a packet and receiving the
    /// ACK for it; `ack_delay` is the delay the peer reported in that ACK.
    pub fn update(&mut self, send_delta: Duration, ack_delay: Duration, _now: Instant) {
        if send_delta.is_zero() {
            return;
        }
        let min = match self.min {
            Some(min) if min <= send_delta => min,
            _ => {
                self.min = Some(send_delta);
                send_delta
            }
        };
        let mut sample = send_delta;
        if sample - min >= ack_delay {
            sample -= ack_delay;
        }
        self.latest = sample;
        match self.smoothed {
            None => {
                self.smoothed = Some(sample);
                self.mean_deviation = sample / 2;
            }
            Some(smoothed) => {
                let deviation = if smoothed > sample {
                    smoothed - sample
                } else {
                    sample - smoothed
                };
                self.mean_deviation = (3 * self.mean_deviation + deviation) / 4;
                self.smoothed = Some((7 * smoothed + sample) / 8);
            }
        }
    }

    /// The most recent (ACK-delay-adjusted) sample.
    pub fn latest_rtt(&self) -> Duration {
        self.latest
    }

    /// The minimum RTT observed, ignoring ACK delay. Zero before the first
    /// sample.
    pub fn min_rtt(&self) -> Duration {
        self.min.unwrap_or(Duration::ZERO)
    }

    /// The smoothed RTT. Zero before the first sample.
    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed.unwrap_or(Duration::ZERO)
    }

    /// The smoothed RTT, or the assumed initial RTT before the first sample.
    pub fn smoothed_or_initial_rtt(&self) -> Duration {
        self.smoothed.unwrap_or(DEFAULT_INITIAL_RTT)
    }

    /// The mean deviation of samples from the smoothed RTT.
    pub fn mean_deviation(&self) -> Duration {
        self.mean_deviation
    }

    /// Conservative estimate used by time-based loss detection: the larger of
    /// the latest and smoothed RTT.
    pub(crate) fn max_rtt(&self) -> Duration {
        cmp::max(self.latest, self.smoothed_rtt())
    }
}
