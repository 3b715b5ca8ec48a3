// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;
use std::time::Instant;

use log::*;

use super::has_elapsed;

/// RTT estimation for a congestion controller.
///
/// Besides the smoothed RTT of RFC 6298, it keeps two windowed minimums: the
/// round-trip propagation time `rt_prop` and the short-window `probe_rtt_min`
/// whose expiry schedules ProbeRTT.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// The most recent RTT sample.
    latest_rtt: Duration,

    /// The smoothed RTT, an exponentially weighted moving average of the
    /// samples.
    smoothed_rtt: Option<Duration>,

    /// The RTT variance estimates the variation in the RTT samples using a
    /// mean variation.
    rttvar: Duration,

    /// Minimum RTT over `rt_prop_window`.
    rt_prop: Option<Duration>,

    /// Time `rt_prop` was taken.
    rt_prop_stamp: Option<Instant>,

    rt_prop_window: Duration,

    /// Minimum RTT over `probe_rtt_interval`.
    probe_rtt_min: Option<Duration>,

    /// Time `probe_rtt_min` was taken.
    probe_rtt_min_stamp: Option<Instant>,

    probe_rtt_interval: Duration,

    /// Whether the short window expired since the last ProbeRTT.
    probe_rtt_expired: bool,
}

impl RttEstimator {
    pub fn new(rt_prop_window: Duration, probe_rtt_interval: Duration) -> Self {
        Self {
            latest_rtt: Duration::ZERO,
            smoothed_rtt: None,
            rttvar: Duration::ZERO,
            rt_prop: None,
            rt_prop_stamp: None,
            rt_prop_window,
            probe_rtt_min: None,
            probe_rtt_min_stamp: None,
            probe_rtt_interval,
            probe_rtt_expired: false,
        }
    }

    /// Return the smoothed RTT, if any sample was taken.
    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.smoothed_rtt
    }

    /// Return the latest rtt sample
    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    /// Return the variation in the RTT samples using a mean variation.
    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    /// Return the round-trip propagation time estimate.
    pub fn rt_prop(&self) -> Option<Duration> {
        self.rt_prop
    }

    /// Return the short-window minimum RTT.
    pub fn probe_rtt_min(&self) -> Option<Duration> {
        self.probe_rtt_min
    }

    pub fn has_sample(&self) -> bool {
        self.smoothed_rtt.is_some()
    }

    /// Whether the short window expired since the last ProbeRTT.
    pub fn probe_rtt_expired(&self) -> bool {
        self.probe_rtt_expired
    }

    /// Re-evaluate the short window against `now` and return whether it has
    /// expired. The result stays set until `schedule_next_probe_rtt`.
    pub fn check_probe_rtt_expired(&mut self, now: Instant) -> bool {
        if has_elapsed(self.probe_rtt_min_stamp, self.probe_rtt_interval, now) {
            self.probe_rtt_expired = true;
        }
        self.probe_rtt_expired
    }

    /// Restart the short window, e.g. when leaving ProbeRTT.
    pub fn schedule_next_probe_rtt(&mut self, now: Instant) {
        self.probe_rtt_expired = false;
        self.probe_rtt_min_stamp = Some(now);
    }

    /// Update estimator with the given RTT sample. Zero samples are ignored.
    /// Return whether the sample was taken.
    pub fn update(&mut self, rtt: Duration, now: Instant) -> bool {
        if rtt.is_zero() {
            warn!("rtt estimator: ignore zero rtt sample");
            return false;
        }

        // An expired window accepts the next sample whatever its value.
        let probe_expired = self.check_probe_rtt_expired(now);
        if self.probe_rtt_min.map_or(true, |min| rtt < min) || probe_expired {
            self.probe_rtt_min = Some(rtt);
            self.probe_rtt_min_stamp = Some(now);
        }

        let rt_prop_expired = has_elapsed(self.rt_prop_stamp, self.rt_prop_window, now);
        if self.rt_prop.map_or(true, |min| rtt < min) || rt_prop_expired {
            if rt_prop_expired {
                trace!(
                    "rtt estimator: rt_prop {:?} expired, take {:?}",
                    self.rt_prop,
                    rtt
                );
            }
            self.rt_prop = Some(rtt);
            self.rt_prop_stamp = Some(now);
        }

        self.latest_rtt = rtt;
        if let Some(smoothed_rtt) = self.smoothed_rtt {
            let var_sample = if smoothed_rtt > rtt {
                smoothed_rtt - rtt
            } else {
                rtt - smoothed_rtt
            };

            self.rttvar = (3 * self.rttvar + var_sample) / 4;
            self.smoothed_rtt = Some((7 * smoothed_rtt + rtt) / 8);
        } else {
            self.smoothed_rtt = Some(rtt);
            self.rttvar = rtt / 2;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> RttEstimator {
        RttEstimator::new(Duration::from_secs(10), Duration::from_secs(10))
    }

    #[test]
    fn initial() {
        let r = estimator();
        assert!(!r.has_sample());
        assert_eq!(r.rt_prop(), None);
        assert_eq!(r.probe_rtt_min(), None);
        assert_eq!(r.smoothed_rtt(), None);
        assert!(!r.probe_rtt_expired());
    }

    #[test]
    fn smoothed() {
        let mut r = estimator();
        let now = Instant::now();

        assert!(r.update(Duration::from_millis(400), now));
        assert_eq!(r.smoothed_rtt(), Some(Duration::from_millis(400)));
        assert_eq!(r.rttvar(), Duration::from_millis(200));

        r.update(Duration::from_millis(700), now);
        assert_eq!(r.latest_rtt(), Duration::from_millis(700));
        assert_eq!(r.rttvar(), Duration::from_micros(225_000));
        assert_eq!(r.smoothed_rtt(), Some(Duration::from_micros(437_500)));

        r.update(Duration::from_millis(225), now);
        assert_eq!(r.rttvar(), Duration::from_nanos(221_875_000));
        assert_eq!(r.smoothed_rtt(), Some(Duration::from_nanos(410_937_500)));
        assert_eq!(r.rt_prop(), Some(Duration::from_millis(225)));
    }

    #[test]
    fn zero_rtt_ignored() {
        let mut r = estimator();
        let now = Instant::now();
        assert!(!r.update(Duration::ZERO, now));
        assert!(!r.has_sample());

        r.update(Duration::from_millis(30), now);
        assert!(!r.update(Duration::ZERO, now));
        assert_eq!(r.rt_prop(), Some(Duration::from_millis(30)));
        assert_eq!(r.latest_rtt(), Duration::from_millis(30));
    }

    #[test]
    fn min_only_decreases_within_window() {
        let mut r = estimator();
        let now = Instant::now();

        r.update(Duration::from_millis(50), now);
        r.update(Duration::from_millis(80), now + Duration::from_secs(1));
        assert_eq!(r.rt_prop(), Some(Duration::from_millis(50)));
        r.update(Duration::from_millis(40), now + Duration::from_secs(2));
        assert_eq!(r.rt_prop(), Some(Duration::from_millis(40)));
        assert_eq!(r.probe_rtt_min(), Some(Duration::from_millis(40)));

        // The window expired: a larger sample replaces the minimum.
        r.update(Duration::from_millis(90), now + Duration::from_secs(13));
        assert_eq!(r.rt_prop(), Some(Duration::from_millis(90)));
        assert_eq!(r.probe_rtt_min(), Some(Duration::from_millis(90)));
    }

    #[test]
    fn probe_rtt_expiry_is_sticky() {
        let mut r = estimator();
        let now = Instant::now();
        let rtt = Duration::from_millis(20);

        r.update(rtt, now);
        assert!(!r.check_probe_rtt_expired(now + Duration::from_secs(10)));

        // A constant RTT does not refresh the stamp.
        r.update(rtt, now + Duration::from_secs(5));
        let later = now + Duration::from_secs(10) + Duration::from_millis(1);
        assert!(r.check_probe_rtt_expired(later));

        // Refreshing the minimum keeps the expiry until the next ProbeRTT.
        r.update(rtt, later);
        assert!(r.probe_rtt_expired());

        r.schedule_next_probe_rtt(later);
        assert!(!r.probe_rtt_expired());
        assert!(!r.check_probe_rtt_expired(later + Duration::from_secs(1)));
    }
}
