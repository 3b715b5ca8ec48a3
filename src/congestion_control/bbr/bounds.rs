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

//! Upper and lower bounds of the BBR model, adapted from loss and ECN
//! signals.
//!
//! The long-term bounds `bw_hi` and `inflight_hi` are cut when a bandwidth
//! probe finds too much loss or CE marks, and slowly raised while probing up.
//! The short-term bounds `bw_lo` and `inflight_lo` track the delivery process
//! of the latest round that saw congestion. `u64::MAX` means unset.

use std::time::Instant;

use log::*;

use super::AckProbePhase;
use super::Bbr;
use super::CongestionController;
use super::CongestionStateUpdatedTrigger;
use super::CyclePhase;
use super::LossThresholdBase;
use super::Mode;

impl Bbr {
    /// Forget the per-round congestion signals and the latest delivery
    /// signals.
    pub(super) fn reset_congestion_signals(&mut self) {
        self.loss_in_round = false;
        self.ecn_in_round = false;
        self.bw_latest = 0;
        self.inflight_latest = 0;
        self.latest_signaled = false;
    }

    pub(super) fn reset_lower_bounds(&mut self) {
        self.bw_lo = u64::MAX;
        self.inflight_lo = u64::MAX;
    }

    fn init_lower_bounds(&mut self) {
        if self.bw_lo == u64::MAX {
            self.bw_lo = self.max_bw;
        }
        if self.inflight_lo == u64::MAX {
            self.inflight_lo = self.cwnd.min(self.inflight_hi);
        }
    }

    /// Whether the flow is probing for bandwidth, in which case the lower
    /// bounds are left alone.
    fn is_probing_bw(&self) -> bool {
        self.mode == Mode::Startup
            || (self.mode == Mode::ProbeBw
                && matches!(self.cycle_phase, CyclePhase::Refill | CyclePhase::Up))
    }

    /// Whether the current sample carries a congestion signal.
    fn is_signaled_sample(&self) -> bool {
        self.sample.lost > 0 || (self.config.ecn_enabled && self.sample.delivered_ce > 0)
    }

    /// See <https://www.ietf.org/archive/id/draft-cardwell-iccrg-bbr-congestion-control-02.html#name-tracking-the-latest-deliver>.
    pub(super) fn update_latest_delivery_signals(&mut self) {
        self.loss_round_start = false;
        self.bw_latest = self.bw_latest.max(self.sample.delivery_rate);

        // Inflight that provoked congestion is the tightest evidence; without
        // congestion keep the largest volume delivered cleanly.
        let prior_in_flight = self.sample.prior_in_flight;
        if self.is_signaled_sample() {
            if self.latest_signaled {
                self.inflight_latest = self.inflight_latest.min(prior_in_flight);
            } else {
                self.inflight_latest = prior_in_flight;
                self.latest_signaled = true;
            }
        } else if !self.latest_signaled {
            self.inflight_latest = self.inflight_latest.max(prior_in_flight);
        }

        if self.sample.prior_delivered >= self.loss_round_delivered {
            self.loss_round_delivered = self.delivered;
            self.loss_round_start = true;
        }
    }

    pub(super) fn advance_latest_delivery_signals(&mut self) {
        if self.loss_round_start {
            self.bw_latest = self.sample.delivery_rate;
            self.inflight_latest = self.sample.prior_in_flight;
            self.latest_signaled = self.is_signaled_sample();
        }
    }

    /// See <https://www.ietf.org/archive/id/draft-cardwell-iccrg-bbr-congestion-control-02.html#name-updating-the-model-upon-pac>.
    pub(super) fn update_congestion_signals(&mut self) {
        self.update_max_bw();

        if self.sample.lost > 0 {
            self.loss_in_round = true;
            if self.mode == Mode::ProbeBw {
                self.loss_in_cycle = true;
            }
        }
        if self.config.ecn_enabled && self.sample.delivered_ce > 0 {
            self.ecn_in_round = true;
            if self.mode == Mode::ProbeBw {
                self.ecn_in_cycle = true;
            }
        }

        if !self.loss_round_start {
            // Wait until end of round trip.
            return;
        }

        self.adapt_lower_bounds_from_congestion();

        self.loss_in_round = false;
        self.ecn_in_round = false;
    }

    /// Once per round-trip respond to congestion.
    fn adapt_lower_bounds_from_congestion(&mut self) {
        if self.is_probing_bw() {
            return;
        }

        if self.loss_in_round || self.ecn_in_round {
            self.init_lower_bounds();
            self.loss_lower_bounds();
        } else {
            self.loosen_lower_bounds();
        }
    }

    /// Cut the lower bounds by beta, but not below what the last round
    /// delivered.
    fn loss_lower_bounds(&mut self) {
        let keep = 1.0 - self.config.beta;

        let bw_lo = self.bw_latest.max((self.bw_lo as f64 * keep) as u64);
        self.bw_lo = self.bw_lo.min(bw_lo);

        let inflight_lo = self
            .inflight_latest
            .max((self.inflight_lo as f64 * keep) as u64);
        self.inflight_lo = self.inflight_lo.min(inflight_lo);

        trace!(
            "{} lower bounds cut, bw_lo {} inflight_lo {} (loss {} ecn {})",
            self.name(),
            self.bw_lo,
            self.inflight_lo,
            self.loss_in_round,
            self.ecn_in_round
        );
    }

    /// A clean round lets the lower bounds recover towards the latest
    /// delivery signals.
    fn loosen_lower_bounds(&mut self) {
        if self.bw_lo != u64::MAX {
            self.bw_lo = self.bw_lo.max(self.bw_latest);
        }
        if self.inflight_lo != u64::MAX {
            self.inflight_lo = self
                .inflight_lo
                .max(self.inflight_latest)
                .min(self.inflight_hi);
        }
    }

    /// BBR.bw = min(max_bw, bw_hi, bw_lo).
    pub(super) fn bound_bw_for_model(&mut self) {
        self.bw = self.max_bw.min(self.bw_lo).min(self.bw_hi);
    }

    /// inflight_lo must never exceed inflight_hi. Both are dropped and a new
    /// probe is started if they ever cross.
    pub(super) fn check_bounds_order(&mut self, now: Instant) {
        if self.inflight_lo == u64::MAX || self.inflight_lo <= self.inflight_hi {
            return;
        }

        warn!(
            "{} inflight_lo {} above inflight_hi {}, reset bounds",
            self.name(),
            self.inflight_lo,
            self.inflight_hi
        );
        self.reset_lower_bounds();
        self.inflight_hi = u64::MAX;
        if self.mode == Mode::ProbeBw {
            self.start_probe_bw_refill(now, 0, false);
        }
    }

    /// Whether the CE-marked fraction of the current sample is too high.
    pub(super) fn is_ecn_too_high(&self) -> bool {
        self.config.ecn_enabled
            && !self.in_recovery
            && self.sample.ce_ratio() > self.config.ecn_threshold
    }

    /// Volume the loss rate is measured against.
    fn loss_base(&self, bytes_in_flight: u64, prior_in_flight: u64) -> u64 {
        match self.config.loss_threshold_base {
            LossThresholdBase::BytesInFlight => bytes_in_flight,
            LossThresholdBase::PriorInFlight => prior_in_flight,
        }
    }

    fn is_loss_too_high(&self, lost: u64, base: u64) -> bool {
        lost > 0 && lost as f64 > self.config.loss_threshold * base as f64
    }

    /// Whether the current sample shows that inflight was too high, either
    /// by the CE-marked fraction or by the loss rate.
    /// See <https://www.ietf.org/archive/id/draft-cardwell-iccrg-bbr-congestion-control-02.html#name-probe-bw-algorithm-details>.
    pub(super) fn is_inflight_too_high(&self, bytes_in_flight: u64) -> bool {
        if self.is_ecn_too_high() {
            return true;
        }

        let base = self.loss_base(bytes_in_flight, self.sample.prior_in_flight);
        self.is_loss_too_high(self.sample.lost, base)
    }

    /// Common reaction once a probe found inflight too high.
    fn on_inflight_too_high(&mut self, now: Instant, trigger: CongestionStateUpdatedTrigger) {
        self.prev_probe_too_high = true;
        self.bw_probe_samples = false;
        self.stats.inflight_too_high_count += 1;
        if self.bw_hi == u64::MAX {
            self.bw_hi = self.max_bw;
        }
        if self.inflight_lo != u64::MAX {
            self.inflight_lo = self.inflight_lo.min(self.inflight_hi);
        }

        debug!(
            "{} inflight too high, inflight_hi {} bw_hi {} mode {} phase {:?}",
            self.name(),
            self.inflight_hi,
            self.bw_hi,
            self.mode,
            self.cycle_phase()
        );

        if self.mode == Mode::ProbeBw && self.cycle_phase == CyclePhase::Up {
            self.state_trigger = Some(trigger);
            self.start_probe_bw_down(now);
            self.state_trigger = None;
        }
    }

    fn handle_inflight_too_high(&mut self, now: Instant) {
        if !self.sample.is_app_limited {
            let floor = (self.target_inflight() as f64 * (1.0 - self.config.beta)) as u64;
            self.inflight_hi = self.sample.prior_in_flight.max(floor);
        }
        let trigger = if self.is_ecn_too_high() {
            CongestionStateUpdatedTrigger::Ecn
        } else {
            CongestionStateUpdatedTrigger::Loss
        };
        self.on_inflight_too_high(now, trigger);
    }

    /// React to a loss event reported outside of a rate sample.
    pub(super) fn handle_lost_bytes(&mut self, now: Instant, lost_bytes: u64, bytes_in_flight: u64) {
        if !self.bw_probe_samples {
            return;
        }

        let base = self.loss_base(bytes_in_flight, bytes_in_flight.saturating_add(lost_bytes));
        if !self.is_loss_too_high(lost_bytes, base) {
            return;
        }

        self.inflight_hi = (self.target_inflight() as f64 * (1.0 - self.config.beta)) as u64;
        self.inflight_hi = self.inflight_hi.max(self.config.min_pipe_cwnd);
        self.on_inflight_too_high(now, CongestionStateUpdatedTrigger::Loss);
    }

    /// See <https://www.ietf.org/archive/id/draft-cardwell-iccrg-bbr-congestion-control-02.html#name-updating-the-model-upon-pac>.
    pub(super) fn adapt_upper_bounds(&mut self, now: Instant, bytes_in_flight: u64) {
        // Track when probe feedback starts and stops.
        if self.ack_phase == AckProbePhase::Starting && self.is_round_start() {
            // Starting to get bw probing samples.
            self.ack_phase = AckProbePhase::Feedback;
        }
        if self.ack_phase == AckProbePhase::Stopping && self.is_round_start() {
            // End of samples from bw probing phase.
            self.bw_probe_samples = false;
            self.ack_phase = AckProbePhase::Init;
        }

        if self.is_inflight_too_high(bytes_in_flight) {
            if self.bw_probe_samples {
                self.handle_inflight_too_high(now);
            }
            return;
        }

        // Loss and CE rates are fine, so maybe raise the bounds.
        if self.inflight_hi == u64::MAX {
            return;
        }
        if self.sample.prior_in_flight > self.inflight_hi {
            self.inflight_hi = self.sample.prior_in_flight;
        }
        if !self.sample.is_app_limited
            && self.bw_hi != u64::MAX
            && self.sample.delivery_rate > self.bw_hi
        {
            self.bw_hi = self.sample.delivery_rate;
        }

        if self.mode == Mode::ProbeBw && self.cycle_phase == CyclePhase::Up {
            self.probe_inflight_hi_upward(bytes_in_flight);
        }
    }

    /// Raise inflight_hi while probing up and cwnd limited.
    fn probe_inflight_hi_upward(&mut self, bytes_in_flight: u64) {
        let in_flight = bytes_in_flight.max(self.sample.prior_in_flight);
        let cwnd_limited = in_flight.saturating_add(self.config.segment_size) >= self.cwnd;
        if !cwnd_limited || self.cwnd < self.inflight_hi {
            // Not fully using inflight_hi, so don't grow it.
            return;
        }

        // For each bw_probe_up_cnt bytes ACKed, increase inflight_hi by one
        // segment.
        self.bw_probe_up_acks = self
            .bw_probe_up_acks
            .saturating_add(self.sample.acked_sacked);
        if self.bw_probe_up_acks >= self.bw_probe_up_cnt {
            let delta = self.bw_probe_up_acks / self.bw_probe_up_cnt;
            self.bw_probe_up_acks -= delta * self.bw_probe_up_cnt;
            self.inflight_hi = self
                .inflight_hi
                .saturating_add(delta.saturating_mul(self.config.segment_size));
        }

        if self.is_round_start() {
            self.raise_inflight_hi_slope();
        }
    }
}
