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

//! The ProbeBW cycle: Down, Cruise, Refill and Up.
//! See <https://www.ietf.org/archive/id/draft-cardwell-iccrg-bbr-congestion-control-02.html#name-probebw>.

use std::time::Duration;
use std::time::Instant;

use log::*;
use rand::Rng;

use super::super::has_elapsed;
use super::AckProbePhase;
use super::Bbr;
use super::CongestionController;
use super::CyclePhase;
use super::Mode;

/// Upper limit of the exponent of the inflight_hi growth per round.
const MAX_PROBE_UP_ROUNDS: u64 = 30;

impl Bbr {
    pub(super) fn enter_probe_bw(&mut self, now: Instant) {
        self.start_probe_bw_down(now);
        self.set_mode(Mode::ProbeBw);
        self.update_gains();
    }

    /// Randomized decision about how long to wait until probing for
    /// bandwidth, using round count and wall clock.
    fn pick_probe_wait(&mut self) {
        // Decide random round-trip bound for wait.
        self.rounds_since_bw_probe = if self.config.bw_probe_rand_rounds > 0 {
            self.rng.gen_range(0..self.config.bw_probe_rand_rounds)
        } else {
            0
        };

        // Decide the random wall clock bound for wait.
        let span = self
            .config
            .probe_wait_max
            .saturating_sub(self.config.probe_wait_min)
            .as_millis() as u64;
        let jitter = self.rng.gen_range(0..=span);
        self.bw_probe_wait = self.config.probe_wait_min + Duration::from_millis(jitter);
    }

    pub(super) fn start_probe_bw_down(&mut self, now: Instant) {
        self.reset_congestion_signals();
        self.loss_in_cycle = false;
        self.ecn_in_cycle = false;
        // Not growing inflight_hi.
        self.bw_probe_up_cnt = u64::MAX;
        self.pick_probe_wait();
        // Start wall clock.
        self.cycle_stamp = Some(now);
        self.ack_phase = AckProbePhase::Stopping;
        self.start_round();
        self.set_cycle_phase(CyclePhase::Down);
    }

    fn start_probe_bw_cruise(&mut self) {
        if self.inflight_lo != u64::MAX {
            self.inflight_lo = self.inflight_lo.min(self.inflight_hi);
        }
        self.set_cycle_phase(CyclePhase::Cruise);
    }

    /// Start refilling the pipe. `probe_up_rounds` is the initial exponent of
    /// the inflight_hi growth once probing up. `ecn_reprobe` marks a refill
    /// started by ECN re-probing, which moves to Up on the next sample.
    pub(super) fn start_probe_bw_refill(
        &mut self,
        now: Instant,
        probe_up_rounds: u64,
        ecn_reprobe: bool,
    ) {
        self.reset_lower_bounds();
        self.bw_probe_up_rounds = probe_up_rounds;
        self.bw_probe_up_acks = 0;
        self.refill_round_count = 0;
        self.ecn_reprobe = ecn_reprobe;
        self.cycle_stamp = Some(now);
        self.ack_phase = AckProbePhase::Refilling;
        self.start_round();
        self.set_cycle_phase(CyclePhase::Refill);
    }

    fn start_probe_bw_up(&mut self, now: Instant) {
        self.ack_phase = AckProbePhase::Starting;
        self.start_round();
        self.cycle_stamp = Some(now);
        self.set_cycle_phase(CyclePhase::Up);
        self.raise_inflight_hi_slope();
    }

    /// Raise the slope of inflight_hi growth: double the growth every round.
    pub(super) fn raise_inflight_hi_slope(&mut self) {
        let growth_this_round = 1u64 << self.bw_probe_up_rounds.min(MAX_PROBE_UP_ROUNDS);
        self.bw_probe_up_rounds = (self.bw_probe_up_rounds + 1).min(MAX_PROBE_UP_ROUNDS);
        self.bw_probe_up_cnt = (self.cwnd / growth_this_round).max(self.config.segment_size.max(1));
    }

    fn has_elapsed_in_phase(&self, now: Instant, interval: Duration) -> bool {
        has_elapsed(self.cycle_stamp, interval, now)
    }

    /// How long do we want to wait before probing for bandwidth, in rounds,
    /// to be fair to Reno flows with the same BDP.
    fn is_reno_coexistence_probe_time(&self) -> bool {
        let reno_rounds = self.target_inflight() / self.config.segment_size.max(1);
        let rounds = reno_rounds.min(self.config.bw_probe_max_rounds);
        self.rounds_since_bw_probe >= rounds
    }

    /// Exponent of the inflight_hi growth when re-probing after ECN marks,
    /// so that the growth of the first round is about
    /// `inflight_hi * ecn_reprobe_gain`.
    fn ecn_reprobe_rounds(&self) -> u64 {
        let segments =
            self.inflight_hi as f64 / self.config.segment_size as f64 * self.config.ecn_reprobe_gain;
        if segments < 1.0 {
            return 0;
        }
        (segments.log2().floor() as u64).min(MAX_PROBE_UP_ROUNDS)
    }

    /// Seen ECN marks but no loss in this cycle: probe again quickly in case
    /// the cross traffic went away.
    fn is_ecn_reprobe_time(&self) -> bool {
        self.config.ecn_enabled
            && self.config.ecn_reprobe_gain > 0.0
            && self.ecn_in_cycle
            && !self.loss_in_cycle
            && !self.in_recovery
            && self.inflight_hi != u64::MAX
    }

    /// Is it time to transition from Down or Cruise to Refill?
    fn check_time_to_probe_bw(&mut self, now: Instant) -> bool {
        if self.is_ecn_reprobe_time() {
            let n = self.ecn_reprobe_rounds();
            debug!(
                "{} ecn reprobe, inflight_hi {} rounds {}",
                self.name(),
                self.inflight_hi,
                n
            );
            self.start_probe_bw_refill(now, n, true);
            return true;
        }

        if self.has_elapsed_in_phase(now, self.bw_probe_wait)
            || self.is_reno_coexistence_probe_time()
        {
            self.start_probe_bw_refill(now, 0, false);
            return true;
        }

        false
    }

    /// Time to transition from Down to Cruise?
    fn is_time_to_cruise(&self) -> bool {
        let in_flight = self.sample.prior_in_flight;

        // Not enough headroom.
        if in_flight > self.inflight_with_headroom() {
            return false;
        }

        // Inflight <= estimated BDP.
        in_flight <= self.inflight(self.max_bw, 1.0)
    }

    /// Wall clock driven part of the cycle, evaluated on timer ticks.
    pub(super) fn check_probe_wait_timer(&mut self, now: Instant) {
        if self.mode != Mode::ProbeBw
            || !matches!(self.cycle_phase, CyclePhase::Down | CyclePhase::Cruise)
        {
            return;
        }

        if self.has_elapsed_in_phase(now, self.bw_probe_wait) {
            self.start_probe_bw_refill(now, 0, false);
        }
    }

    /// The core state machine logic for ProbeBW. At most one phase transition
    /// happens per sample.
    pub(super) fn update_probe_bw_cycle_phase(&mut self, now: Instant, bytes_in_flight: u64) {
        if !self.is_filled_pipe() {
            return;
        }

        let before = (self.mode, self.cycle_phase);
        self.adapt_upper_bounds(now, bytes_in_flight);
        if self.mode != Mode::ProbeBw || (self.mode, self.cycle_phase) != before {
            return;
        }

        match self.cycle_phase {
            CyclePhase::Down => {
                if self.check_time_to_probe_bw(now) {
                    // Already decided state transition.
                    return;
                }
                if self.is_time_to_cruise() {
                    self.start_probe_bw_cruise();
                }
            }

            CyclePhase::Cruise => {
                self.check_time_to_probe_bw(now);
            }

            CyclePhase::Refill => {
                // After one round of REFILL, start UP.
                if self.is_round_start() {
                    self.refill_round_count += 1;
                }
                if self.ecn_reprobe || self.refill_round_count >= self.config.refill_rounds {
                    self.bw_probe_samples = true;
                    self.start_probe_bw_up(now);
                }
            }

            CyclePhase::Up => {
                let in_flight = bytes_in_flight;
                let rt_prop = self.rtt.rt_prop().unwrap_or_default();

                let is_risky = self.prev_probe_too_high && in_flight >= self.inflight_hi;
                let is_queuing = self.has_elapsed_in_phase(now, rt_prop)
                    && in_flight >= self.inflight(self.max_bw, self.pacing_gain);

                if is_risky || is_queuing {
                    self.prev_probe_too_high = false;
                    self.start_probe_bw_down(now);
                }
            }
        }
    }
}
