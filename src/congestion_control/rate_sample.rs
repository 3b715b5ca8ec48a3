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

//! Delivery rate samples, extended with the lost and CE-marked volume of the
//! sampling interval.
//!
//! See
//! <https://datatracker.ietf.org/doc/html/draft-cheng-iccrg-delivery-rate-estimation-02>.

use std::time::Duration;
use std::time::Instant;

use log::*;

/// Rate sample handed to the congestion controller once per ACK batch.
///
/// See
/// <https://datatracker.ietf.org/doc/html/draft-cheng-iccrg-delivery-rate-estimation-02#section-3.1.3>.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RateSample {
    /// rs.delivered: The amount of data marked as delivered over the sampling
    /// interval.
    pub delivered: u64,

    /// The amount of delivered data which carried a CE mark.
    pub delivered_ce: u64,

    /// The amount of data declared lost over the sampling interval.
    pub lost: u64,

    /// rs.interval: The length of the sampling interval.
    pub interval: Duration,

    /// rs.delivery_rate: The delivery rate sample in bytes per second.
    pub delivery_rate: u64,

    /// Bytes in flight before this ACK was processed.
    pub prior_in_flight: u64,

    /// rs.prior_delivered: The P.delivered count from the most recent packet
    /// delivered.
    pub prior_delivered: u64,

    /// Bytes newly acknowledged or selectively acknowledged by this ACK.
    pub acked_sacked: u64,

    /// rs.is_app_limited: The P.is_app_limited from the most recent packet
    /// delivered.
    pub is_app_limited: bool,

    /// RTT of the most recent packet delivered.
    pub rtt: Option<Duration>,
}

impl RateSample {
    /// Fraction of delivered bytes which were CE-marked.
    pub fn ce_ratio(&self) -> f64 {
        if self.delivered == 0 {
            return 0.0;
        }
        self.delivered_ce as f64 / self.delivered as f64
    }
}

/// Per-packet state recorded at transmission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketSnapshot {
    /// Send time of the packet.
    pub sent_time: Instant,

    /// P.first_sent_time: C.first_sent_time when the packet was sent.
    pub first_sent_time: Instant,

    /// P.delivered_time: C.delivered_time when the packet was sent.
    pub delivered_time: Instant,

    /// P.delivered: C.delivered when the packet was sent.
    pub delivered: u64,

    /// CE-marked bytes delivered when the packet was sent.
    pub delivered_ce: u64,

    /// Bytes lost when the packet was sent.
    pub lost: u64,

    /// P.is_app_limited.
    pub is_app_limited: bool,
}

/// An acknowledgment as reported by the host transport.
///
/// `delivered`, `delivered_ce` and `lost` are the host's cumulative counters
/// after the acknowledgment was processed.
#[derive(Debug, Clone, Copy)]
pub struct AckInfo {
    /// Time the acknowledgment was received.
    pub now: Instant,

    /// Bytes newly acknowledged.
    pub acked_bytes: u64,

    /// Cumulative bytes delivered.
    pub delivered: u64,

    /// Cumulative bytes delivered with a CE mark.
    pub delivered_ce: u64,

    /// Cumulative bytes lost.
    pub lost: u64,

    /// Bytes in flight before the acknowledgment.
    pub prior_in_flight: u64,

    /// Snapshot of the most recently sent packet acknowledged.
    pub packet: PacketSnapshot,
}

/// Turns acknowledgments into rate samples.
///
/// <https://datatracker.ietf.org/doc/html/draft-cheng-iccrg-delivery-rate-estimation-02#section-3.1.1>.
#[derive(Debug, Default, Clone)]
pub struct RateSampler {
    /// C.delivered, as the highest cumulative counter reported so far.
    delivered: u64,

    /// Highest cumulative CE-marked counter reported so far.
    delivered_ce: u64,

    /// Highest cumulative lost counter reported so far.
    lost: u64,

    /// C.delivered_time: The time when C.delivered was last updated.
    delivered_time: Option<Instant>,

    /// C.first_sent_time: The send time of the packet most recently marked as
    /// delivered, or of the most recently sent packet after an idle period.
    first_sent_time: Option<Instant>,
}

impl RateSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upon each packet transmission, return the state to keep with the
    /// packet until it is acknowledged.
    /// See <https://datatracker.ietf.org/doc/html/draft-cheng-iccrg-delivery-rate-estimation-02#section-3.2>.
    pub fn on_packet_sent(
        &mut self,
        now: Instant,
        bytes_in_flight: u64,
        is_app_limited: bool,
    ) -> PacketSnapshot {
        // no packets in flight yet?
        if bytes_in_flight == 0 || self.first_sent_time.is_none() {
            self.first_sent_time = Some(now);
            self.delivered_time = Some(now);
        }

        PacketSnapshot {
            sent_time: now,
            first_sent_time: self.first_sent_time.unwrap_or(now),
            delivered_time: self.delivered_time.unwrap_or(now),
            delivered: self.delivered,
            delivered_ce: self.delivered_ce,
            lost: self.lost,
            is_app_limited,
        }
    }

    /// Build the rate sample for an acknowledgment.
    ///
    /// Cumulative counters that move backwards are clamped to the highest
    /// value seen so far.
    pub fn on_ack(&mut self, ack: &AckInfo) -> RateSample {
        self.delivered = Self::monotonic("delivered", self.delivered, ack.delivered);
        self.delivered_ce = Self::monotonic("delivered_ce", self.delivered_ce, ack.delivered_ce);
        self.lost = Self::monotonic("lost", self.lost, ack.lost);
        self.delivered_time = Some(ack.now);

        let p = &ack.packet;
        self.first_sent_time = Some(p.sent_time);

        // Use the longer of the send_elapsed and ack_elapsed.
        let send_elapsed = p.sent_time.saturating_duration_since(p.first_sent_time);
        let ack_elapsed = ack.now.saturating_duration_since(p.delivered_time);
        let interval = send_elapsed.max(ack_elapsed);

        let delivered = self.delivered.saturating_sub(p.delivered);
        let delivery_rate = if interval.is_zero() {
            0
        } else {
            let rate = delivered as u128 * 1_000_000 / interval.as_micros().max(1);
            rate.min(u64::MAX as u128) as u64
        };

        let rtt = ack.now.saturating_duration_since(p.sent_time);

        RateSample {
            delivered,
            delivered_ce: self.delivered_ce.saturating_sub(p.delivered_ce),
            lost: self.lost.saturating_sub(p.lost),
            interval,
            delivery_rate,
            prior_in_flight: ack.prior_in_flight,
            prior_delivered: p.delivered,
            acked_sacked: ack.acked_bytes,
            is_app_limited: p.is_app_limited,
            rtt: if rtt.is_zero() { None } else { Some(rtt) },
        }
    }

    /// C.delivered.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    fn monotonic(name: &str, current: u64, reported: u64) -> u64 {
        if reported < current {
            warn!(
                "rate sampler: cumulative {} went backwards {} -> {}, clamped",
                name, current, reported
            );
            return current;
        }
        reported
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_sample_basic() {
        let mut rs = RateSampler::new();
        let t0 = Instant::now();

        let p0 = rs.on_packet_sent(t0, 0, false);
        let p1 = rs.on_packet_sent(t0 + Duration::from_millis(1), 1448, false);
        assert_eq!(p0.first_sent_time, t0);
        assert_eq!(p1.first_sent_time, t0);
        assert_eq!(p1.delivered, 0);

        let ack = AckInfo {
            now: t0 + Duration::from_millis(21),
            acked_bytes: 2896,
            delivered: 2896,
            delivered_ce: 1448,
            lost: 0,
            prior_in_flight: 2896,
            packet: p1,
        };
        let s = rs.on_ack(&ack);
        assert_eq!(s.delivered, 2896);
        assert_eq!(s.delivered_ce, 1448);
        assert_eq!(s.ce_ratio(), 0.5);
        assert_eq!(s.interval, Duration::from_millis(21));
        assert_eq!(s.delivery_rate, 2896 * 1000 / 21);
        assert_eq!(s.prior_in_flight, 2896);
        assert_eq!(s.prior_delivered, 0);
        assert_eq!(s.rtt, Some(Duration::from_millis(20)));
        assert_eq!(rs.delivered(), 2896);

        // Packets sent after the ACK carry the new delivered count.
        let p2 = rs.on_packet_sent(t0 + Duration::from_millis(22), 0, true);
        assert_eq!(p2.delivered, 2896);
        assert_eq!(p2.first_sent_time, t0 + Duration::from_millis(22));
        assert!(p2.is_app_limited);
    }

    #[test]
    fn rate_sample_non_monotonic_counters() {
        let mut rs = RateSampler::new();
        let t0 = Instant::now();
        let p = rs.on_packet_sent(t0, 0, false);

        let mut ack = AckInfo {
            now: t0 + Duration::from_millis(10),
            acked_bytes: 1448,
            delivered: 5000,
            delivered_ce: 3000,
            lost: 2000,
            prior_in_flight: 1448,
            packet: p,
        };
        rs.on_ack(&ack);

        // Counters go backwards: clamp instead of underflow.
        ack.delivered = 1000;
        ack.delivered_ce = 100;
        ack.lost = 0;
        let s = rs.on_ack(&ack);
        assert_eq!(s.delivered, 5000);
        assert_eq!(s.delivered_ce, 3000);
        assert_eq!(s.lost, 2000);
    }

    #[test]
    fn rate_sample_zero_interval() {
        let mut rs = RateSampler::new();
        let t0 = Instant::now();
        let p = rs.on_packet_sent(t0, 0, false);

        let s = rs.on_ack(&AckInfo {
            now: t0,
            acked_bytes: 1448,
            delivered: 1448,
            delivered_ce: 0,
            lost: 0,
            prior_in_flight: 1448,
            packet: p,
        });
        assert_eq!(s.interval, Duration::ZERO);
        assert_eq!(s.delivery_rate, 0);
        assert_eq!(s.rtt, None);
        assert_eq!(s.ce_ratio(), 0.0);
    }
}
