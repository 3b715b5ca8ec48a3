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

//! Output control parameters of BBR: pacing rate, send quantum and cwnd.

use std::time::Duration;

use log::*;

use super::Bbr;
use super::CongestionController;
use super::CyclePhase;
use super::Mode;

/// Pacing rate threshold for the send quantum floor, 1.2Mbps in bytes/s.
const SEND_QUANTUM_THRESHOLD_PACING_RATE: u64 = 1_200_000 / 8;

/// Extra segments allowed in flight while probing up, to make sure the probe
/// actually raises inflight.
const PROBE_UP_EXTRA_SEGMENTS: u64 = 2;

impl Bbr {
    /// Estimated BDP scaled by `gain`. Without an rt_prop estimate the initial
    /// window is returned.
    /// See <https://www.ietf.org/archive/id/draft-cardwell-iccrg-bbr-congestion-control-02.html#name-computing-bbrmax_inflight>.
    pub(super) fn bdp_multiple(&self, bw: u64, gain: f64) -> u64 {
        let rt_prop = match self.rtt.rt_prop() {
            Some(rt_prop) => rt_prop,
            None => return self.config.initial_cwnd,
        };

        let bdp = bw as f64 * rt_prop.as_secs_f64();
        (bdp * gain) as u64
    }

    /// BBRQuantizationBudget: add headroom for the send quantum and delayed
    /// or stretched ACKs.
    fn quantization_budget(&self, inflight: u64) -> u64 {
        let mut inflight = inflight
            .saturating_add(self.send_quantum.saturating_mul(3))
            .max(self.config.min_pipe_cwnd);

        if self.mode == Mode::ProbeBw && self.cycle_phase == CyclePhase::Up {
            inflight = inflight
                .saturating_add(PROBE_UP_EXTRA_SEGMENTS * self.config.segment_size);
        }

        inflight
    }

    /// BBRInflight: the volume to keep in flight for `bw` scaled by `gain`.
    pub(super) fn inflight(&self, bw: u64, gain: f64) -> u64 {
        if self.rtt.rt_prop().is_none() {
            return self.config.initial_cwnd;
        }

        self.quantization_budget(self.bdp_multiple(bw, gain))
    }

    /// BBRTargetInflight: the smaller of the estimated BDP and cwnd.
    pub fn target_inflight(&self) -> u64 {
        self.inflight(self.bw, 1.0).min(self.cwnd)
    }

    /// BBRInflightWithHeadroom: inflight_hi less the share left free for
    /// other flows.
    pub(super) fn inflight_with_headroom(&self) -> u64 {
        if self.inflight_hi == u64::MAX {
            return u64::MAX;
        }

        let headroom = ((self.config.inflight_headroom * self.inflight_hi as f64) as u64).max(1);
        self.inflight_hi
            .saturating_sub(headroom)
            .max(self.config.min_pipe_cwnd)
    }

    /// BBRProbeRTTCwnd.
    pub(super) fn probe_rtt_cwnd(&self) -> u64 {
        self.config
            .min_pipe_cwnd
            .max(4 * self.config.segment_size)
    }

    /// See <https://www.ietf.org/archive/id/draft-cardwell-iccrg-bbr-congestion-control-02.html#name-pacing-rate>.
    pub(super) fn init_pacing_rate(&mut self, rtt: Option<Duration>) {
        let rtt = rtt
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_millis(1));

        // nominal_bandwidth = InitialCwnd / (SRTT ? SRTT : 1ms)
        let nominal_bandwidth = self.config.initial_cwnd as f64 / rtt.as_secs_f64();
        let rate = (self.config.high_gain * nominal_bandwidth) as u64;
        self.pacing_rate = rate.min(self.max_pacing_rate);
    }

    pub(super) fn set_pacing_rate_with_gain(&mut self, pacing_gain: f64) {
        let rate = (pacing_gain * self.bw as f64 * (1.0 - self.config.pacing_margin)) as u64;
        let rate = rate.min(self.max_pacing_rate);

        if self.is_filled_pipe() || rate > self.pacing_rate {
            self.pacing_rate = rate;
        }
    }

    pub(super) fn set_pacing_rate(&mut self) {
        self.set_pacing_rate_with_gain(self.pacing_gain);
    }

    /// See <https://www.ietf.org/archive/id/draft-cardwell-iccrg-bbr-congestion-control-02.html#name-send-quantum-bbrsend_quantu>.
    pub(super) fn set_send_quantum(&mut self) {
        let floor = if self.pacing_rate < SEND_QUANTUM_THRESHOLD_PACING_RATE {
            self.config.segment_size
        } else {
            2 * self.config.segment_size
        };

        // One millisecond worth of data.
        self.send_quantum = (self.pacing_rate / 1000)
            .min(self.config.max_send_quantum)
            .max(floor);
    }

    /// See <https://www.ietf.org/archive/id/draft-cardwell-iccrg-bbr-congestion-control-02.html#name-core-cwnd-adjustment-mechan>.
    pub(super) fn set_cwnd(&mut self, bytes_in_flight: u64) {
        self.target_cwnd = self.inflight(self.bw, self.cwnd_gain);

        if !self.in_recovery {
            let acked = self.sample.acked_sacked;
            if self.is_filled_pipe() {
                self.cwnd = self.cwnd.saturating_add(acked).min(self.target_cwnd);
            } else if self.cwnd < self.target_cwnd || self.delivered < self.config.initial_cwnd {
                self.cwnd = self.cwnd.saturating_add(acked);
            }
        } else {
            trace!(
                "{} keep recovery cwnd {}, bytes_in_flight {}",
                self.name(),
                self.cwnd,
                bytes_in_flight
            );
        }
        self.cwnd = self.cwnd.max(self.config.min_pipe_cwnd);

        self.bound_cwnd_for_probe_rtt();
        self.bound_cwnd_for_model();
    }

    /// See <https://www.ietf.org/archive/id/draft-cardwell-iccrg-bbr-congestion-control-02.html#name-modulating-cwnd-in-probertt>.
    pub(super) fn bound_cwnd_for_probe_rtt(&mut self) {
        if self.mode == Mode::ProbeRtt {
            self.cwnd = self.cwnd.min(self.probe_rtt_cwnd());
        }
    }

    /// See <https://www.ietf.org/archive/id/draft-cardwell-iccrg-bbr-congestion-control-02.html#name-bounding-cwnd-based-on-rece>.
    pub(super) fn bound_cwnd_for_model(&mut self) {
        let mut cap = u64::MAX;

        if self.mode == Mode::ProbeBw && self.cycle_phase != CyclePhase::Cruise {
            cap = self.inflight_hi;
        } else if self.mode == Mode::ProbeRtt
            || (self.mode == Mode::ProbeBw && self.cycle_phase == CyclePhase::Cruise)
        {
            cap = self.inflight_with_headroom();
        }

        // Apply inflight_lo (possibly infinite).
        cap = cap.min(self.inflight_lo);
        cap = cap.max(self.config.min_pipe_cwnd);
        self.cwnd = self.cwnd.min(cap);
    }
}
