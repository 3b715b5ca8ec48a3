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

//! BBR Congestion Control
//!
//! VERSION 3, ECN aware.
//!
//! BBR uses recent measurements of a transport connection's delivery rate,
//! round-trip time, loss and ECN CE marks to build an explicit model that
//! includes both the maximum recent bandwidth available to that connection,
//! and its minimum recent round-trip delay. BBR then uses this model to
//! control both how fast it sends data and the maximum amount of data it
//! allows in flight in the network at any time.
//!
//! CE marks are treated like loss when sizing `inflight_hi` and the lower
//! bounds, with a separate threshold so that shallow L4S style AQM marking
//! can be told apart from real congestion.
//!
//! See <https://datatracker.ietf.org/doc/html/draft-cardwell-iccrg-bbr-congestion-control-02>
//! and <https://datatracker.ietf.org/meeting/117/materials/slides-117-ccwg-bbrv3-algorithm-bug-fixes-and-public-internet-deployment-00>.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use log::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

use super::minmax::MinMax;
use super::rtt::RttEstimator;
use super::CongestionController;
use super::CongestionEvent;
use super::CongestionStats;
use super::ConnCtx;
use super::ControlOutput;
use super::LossThresholdBase;
use super::RateSample;
use crate::metrics::CongestionStateUpdatedTrigger;
use crate::metrics::EventData;
use crate::metrics::MetricsEmitter;
use crate::metrics::MetricsSink;
use crate::CongestionConfig;
use crate::Error;
use crate::Result;

/// BBR configurable parameters. Windows are in bytes.
#[derive(Debug, Clone)]
pub struct BbrConfig {
    /// Segment size in bytes.
    segment_size: u64,

    /// Initial congestion window in bytes.
    initial_cwnd: u64,

    /// BBRMinPipeCwnd in bytes.
    min_pipe_cwnd: u64,

    /// Upper limit of the pacing rate in bytes per second.
    max_pacing_rate: u64,

    /// RTT assumed for the initial pacing rate.
    initial_rtt: Option<Duration>,

    /// Startup pacing and cwnd gain.
    high_gain: f64,

    /// Length of the max bandwidth filter in rounds.
    bw_window_length: u64,

    /// Length of the rt_prop filter.
    rtt_window_length: Duration,

    /// ProbeRTTInterval.
    probe_rtt_interval: Duration,

    /// ProbeRTTDuration.
    probe_rtt_duration: Duration,

    /// BBRLossThresh.
    loss_threshold: f64,

    /// Volume the loss rate is measured against.
    loss_threshold_base: LossThresholdBase,

    /// React to CE marks.
    ecn_enabled: bool,

    /// Maximum tolerated CE-marked fraction of delivered bytes.
    ecn_threshold: f64,

    /// Gain for re-probing after ECN-only congestion. `0` disables it.
    ecn_reprobe_gain: f64,

    /// BBRBeta: multiplicative decrease on congestion.
    beta: f64,

    /// Max count of rounds with bandwidth growth below the threshold.
    full_bw_count: u64,

    /// Bandwidth growth factor that counts as growing.
    full_bw_threshold: f64,

    /// Loss marking events in a Startup recovery round to exit.
    full_loss_count: u64,

    /// Consecutive rounds with excessive CE marks in Startup to exit.
    full_ecn_count: u64,

    /// Max number of packet-timed rounds to wait before probing.
    bw_probe_max_rounds: u64,

    /// Max amount of randomness injected in round counting.
    bw_probe_rand_rounds: u64,

    /// Rounds spent in ProbeBW_REFILL.
    refill_rounds: u64,

    /// Lower bound of the ProbeBW time scale.
    probe_wait_min: Duration,

    /// Upper bound of the ProbeBW time scale.
    probe_wait_max: Duration,

    /// Fraction of inflight_hi left free for cross traffic.
    inflight_headroom: f64,

    probe_up_pacing_gain: f64,

    probe_down_pacing_gain: f64,

    cwnd_gain: f64,

    probe_up_cwnd_gain: f64,

    /// Static discount of the pacing rate.
    pacing_margin: f64,

    /// Upper limit of the send quantum in bytes.
    max_send_quantum: u64,

    /// Seed of the random stream.
    random_seed: Option<u64>,
}

impl BbrConfig {
    /// Take the BBR parameters of a configuration that has already been
    /// validated.
    fn with_config(conf: &CongestionConfig) -> Self {
        Self {
            segment_size: conf.segment_size,
            initial_cwnd: conf.initial_cwnd_bytes(),
            min_pipe_cwnd: conf.min_pipe_cwnd_bytes(),
            max_pacing_rate: conf.max_pacing_rate,
            initial_rtt: conf.initial_rtt,
            high_gain: conf.high_gain,
            bw_window_length: conf.bw_window_length,
            rtt_window_length: conf.rtt_window_length,
            probe_rtt_interval: conf.probe_rtt_interval,
            probe_rtt_duration: conf.probe_rtt_duration,
            loss_threshold: conf.loss_threshold,
            loss_threshold_base: conf.loss_threshold_base,
            ecn_enabled: conf.ecn_enabled,
            ecn_threshold: conf.ecn_threshold,
            ecn_reprobe_gain: conf.ecn_reprobe_gain,
            beta: conf.beta,
            full_bw_count: conf.full_bw_count,
            full_bw_threshold: conf.full_bw_threshold,
            full_loss_count: conf.full_loss_count,
            full_ecn_count: conf.full_ecn_count,
            bw_probe_max_rounds: conf.bw_probe_max_rounds,
            bw_probe_rand_rounds: conf.bw_probe_rand_rounds,
            refill_rounds: conf.refill_rounds,
            probe_wait_min: conf.probe_wait_min,
            probe_wait_max: conf.probe_wait_max,
            inflight_headroom: conf.inflight_headroom,
            probe_up_pacing_gain: conf.probe_up_pacing_gain,
            probe_down_pacing_gain: conf.probe_down_pacing_gain,
            cwnd_gain: conf.cwnd_gain,
            probe_up_cwnd_gain: conf.probe_up_cwnd_gain,
            pacing_margin: conf.pacing_margin,
            max_send_quantum: conf.max_send_quantum,
            random_seed: conf.random_seed,
        }
    }
}

impl TryFrom<&CongestionConfig> for BbrConfig {
    type Error = Error;

    fn try_from(conf: &CongestionConfig) -> Result<Self> {
        conf.validate()?;
        Ok(Self::with_config(conf))
    }
}

impl Default for BbrConfig {
    fn default() -> Self {
        Self::with_config(&CongestionConfig::default())
    }
}

/// BBR State Machine.
/// See <https://www.ietf.org/archive/id/draft-cardwell-iccrg-bbr-congestion-control-02.html#name-state-machine>.
//          |
//          V
//       Startup
//          |
//          V
//        Drain
//          |
//          V
// +---> ProbeBW  (REFILL -> UP -> DOWN -> CRUISE -> REFILL ...)
// |        |
// |        V
// +---- ProbeRTT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum Mode {
    Startup,
    Drain,
    ProbeBw,
    ProbeRtt,
}

/// Phases of the ProbeBW bandwidth probing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum CyclePhase {
    /// Refill the pipe at the estimated bandwidth before probing.
    Refill,

    /// Probe for more bandwidth.
    Up,

    /// Drain the queue created by probing.
    Down,

    /// Cruise with headroom left for other flows.
    Cruise,
}

/// Round trip counter for tracking packet-timed round trips which starts
/// at the transmission of some segment, and then end at the ack of that segment.
#[derive(Debug, Default, Clone)]
struct RoundTripCounter {
    /// BBR.round_count: Count of packet-timed round trips.
    round_count: u64,

    /// BBR.round_start: A boolean that BBR sets to true once per packet-
    /// timed round trip, on ACKs that advance BBR.round_count.
    is_round_start: bool,

    /// BBR.next_round_delivered: packet.delivered value denoting the end of
    /// a packet-timed round trip.
    next_round_delivered: u64,
}

/// Full pipe estimator, used mainly during Startup mode.
#[derive(Debug, Default, Clone)]
struct FullPipeEstimator {
    /// BBR.filled_pipe: A boolean that records whether BBR estimates that it
    /// has ever fully utilized its available bandwidth ("filled the pipe").
    is_filled_pipe: bool,

    /// Baseline level delivery rate for full pipe estimator.
    full_bw: u64,

    /// The number of round for full pipe estimator without much growth.
    full_bw_count: u64,
}

/// Ack probe phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckProbePhase {
    /// Not probing; not getting probe feedback.
    Init,

    /// Sending at est_bw to fill pipe.
    Stopping,

    /// Inflight rising to probe bw.
    Refilling,

    /// Getting feedback from bw probing.
    Starting,

    // Stopped probing; still getting feedback.
    Feedback,
}

/// BBR Congestion Control Algorithm.
///
/// See <https://datatracker.ietf.org/doc/html/draft-cardwell-iccrg-bbr-congestion-control-02>.
#[derive(Debug, Clone)]
pub struct Bbr {
    /// Configurable parameters.
    config: BbrConfig,

    /// Statistics.
    stats: CongestionStats,

    /// Metrics sinks.
    metrics: MetricsEmitter,

    /// Random stream for probe scheduling.
    rng: StdRng,

    /// Host time of the event being processed.
    now: Option<Instant>,

    /// The rate sample being processed.
    sample: RateSample,

    /// BBR.pacing_rate: The current pacing rate for a BBR flow, which
    /// controls inter-packet spacing.
    pacing_rate: u64,

    /// Upper limit of the pacing rate, from the config and the connection.
    max_pacing_rate: u64,

    /// BBR.send_quantum: The maximum size of a data aggregate scheduled and
    /// transmitted together.
    send_quantum: u64,

    /// cwnd: The transport sender's congestion window, which limits the
    /// amount of data in flight.
    cwnd: u64,

    /// The cwnd the model aims at.
    target_cwnd: u64,

    /// Slow start threshold reported on loss.
    ssthresh: u64,

    /// BBR.pacing_gain: The dynamic gain factor used to scale BBR.bw to
    /// produce BBR.pacing_rate.
    pacing_gain: f64,

    /// BBR.cwnd_gain: The dynamic gain factor used to scale the estimated BDP
    /// to produce a congestion window (cwnd).
    cwnd_gain: f64,

    /// BBR.state: The current mode of a BBR flow in the BBR state machine.
    mode: Mode,

    /// The current ProbeBW phase. Meaningful in ProbeBW only.
    cycle_phase: CyclePhase,

    /// Counter of packet-timed round trips.
    round: RoundTripCounter,

    /// C.delivered as seen by the controller, the sum of acked bytes.
    delivered: u64,

    /// BBR.idle_restart: A boolean that is true if and only if a connection is
    /// restarting after being idle.
    idle_restart: bool,

    /// BBR.max_bw: The windowed maximum recent bandwidth sample.
    max_bw: u64,

    /// BBR.MaxBwFilter: windowed max of delivery rates keyed by round.
    max_bw_filter: MinMax,

    /// BBR.bw_hi: The long-term maximum sending bandwidth that the algorithm
    /// estimates will produce acceptable queue pressure.
    bw_hi: u64,

    /// BBR.bw_lo: The short-term maximum sending bandwidth that the algorithm
    /// estimates is safe for matching the current network path delivery rate.
    bw_lo: u64,

    /// BBR.bw: min(max_bw, bw_hi, bw_lo).
    bw: u64,

    /// RTT estimator, owning BBR.min_rtt and BBR.probe_rtt_min_delay.
    rtt: RttEstimator,

    /// BBR.inflight_hi: the long-term maximum volume of in-flight data that
    /// the algorithm estimates will produce acceptable queue pressure.
    inflight_hi: u64,

    /// BBR.inflight_lo: the short-term maximum volume of in-flight data that
    /// the algorithm estimates is safe for matching the current network path
    /// delivery process.
    inflight_lo: u64,

    /// BBR.bw_latest: a 1-round-trip max of delivered bandwidth.
    bw_latest: u64,

    /// BBR.inflight_latest: a 1-round-trip extreme of prior in flight.
    inflight_latest: u64,

    /// Whether inflight_latest comes from a loss or CE signaled sample.
    latest_signaled: bool,

    /// Last time when the cycle phase changed to Down or Up.
    cycle_stamp: Option<Instant>,

    /// BBR.ack_phase. ACK probing state.
    ack_phase: AckProbePhase,

    /// Estimator of full pipe.
    full_pipe: FullPipeEstimator,

    /// Timestamp when ProbeRTT state ends.
    probe_rtt_done_stamp: Option<Instant>,

    /// Whether a roundtrip in ProbeRTT state ends.
    probe_rtt_round_done: bool,

    /// Packet-timed rounds since probed bw.
    rounds_since_bw_probe: u64,

    /// T_bbr: BBR-native time-scale.
    bw_probe_wait: Duration,

    /// Bytes delivered per inflight_hi increment.
    bw_probe_up_cnt: u64,

    /// Bytes (S)ACKed since inflight_hi increment.
    bw_probe_up_acks: u64,

    /// Cwnd-limited rounds in PROBE_UP.
    bw_probe_up_rounds: u64,

    /// Whether rate samples reflect bw probing.
    bw_probe_samples: bool,

    /// Whether the last probe ended with inflight too high.
    prev_probe_too_high: bool,

    /// Round starts seen in ProbeBW_REFILL.
    refill_round_count: u64,

    /// Whether the current refill was started by ECN re-probing.
    ecn_reprobe: bool,

    /// Whether a loss round starts.
    loss_round_start: bool,

    /// Loss round ending.
    loss_round_delivered: u64,

    /// Whether loss marked in this round.
    loss_in_round: bool,

    /// Whether CE marked in this round.
    ecn_in_round: bool,

    /// Whether loss marked in this ProbeBW cycle.
    loss_in_cycle: bool,

    /// Whether CE marked in this ProbeBW cycle.
    ecn_in_cycle: bool,

    /// Losses in STARTUP round.
    loss_events_in_round: u64,

    /// Whether a sample in this round had too many CE marks.
    ecn_high_in_round: bool,

    /// Consecutive STARTUP rounds with too many CE marks.
    startup_ecn_rounds: u64,

    /// Cwnd before loss recovery or ProbeRTT.
    prior_cwnd: u64,

    /// Whether in the recovery mode.
    in_recovery: bool,

    /// Congestion signal behind the state change being made, if any.
    state_trigger: Option<CongestionStateUpdatedTrigger>,
}

impl Bbr {
    pub fn new(config: BbrConfig, sinks: Vec<Arc<dyn MetricsSink>>) -> Self {
        let rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut bbr = Self {
            stats: Default::default(),
            metrics: MetricsEmitter::new(sinks),
            rng,
            now: None,
            sample: RateSample::default(),
            pacing_rate: 0,
            max_pacing_rate: config.max_pacing_rate,
            send_quantum: 0,
            cwnd: config.initial_cwnd,
            target_cwnd: config.initial_cwnd,
            ssthresh: u64::MAX,
            pacing_gain: config.high_gain,
            cwnd_gain: config.high_gain,
            mode: Mode::Startup,
            cycle_phase: CyclePhase::Down,
            round: Default::default(),
            delivered: 0,
            idle_restart: false,
            max_bw: 0,
            max_bw_filter: MinMax::new(config.bw_window_length),
            bw_hi: u64::MAX,
            bw_lo: u64::MAX,
            bw: 0,
            rtt: RttEstimator::new(config.rtt_window_length, config.probe_rtt_interval),
            inflight_hi: u64::MAX,
            inflight_lo: u64::MAX,
            bw_latest: 0,
            inflight_latest: 0,
            latest_signaled: false,
            cycle_stamp: None,
            ack_phase: AckProbePhase::Init,
            full_pipe: Default::default(),
            probe_rtt_done_stamp: None,
            probe_rtt_round_done: false,
            rounds_since_bw_probe: 0,
            bw_probe_wait: Duration::MAX,
            bw_probe_up_cnt: u64::MAX,
            bw_probe_up_acks: 0,
            bw_probe_up_rounds: 0,
            bw_probe_samples: false,
            prev_probe_too_high: false,
            refill_round_count: 0,
            ecn_reprobe: false,
            loss_round_start: false,
            loss_round_delivered: 0,
            loss_in_round: false,
            ecn_in_round: false,
            loss_in_cycle: false,
            ecn_in_cycle: false,
            loss_events_in_round: 0,
            ecn_high_in_round: false,
            startup_ecn_rounds: 0,
            prior_cwnd: 0,
            in_recovery: false,
            state_trigger: None,
            config,
        };
        bbr.reset();

        bbr
    }

    // Initialization Steps.
    // See <https://www.ietf.org/archive/id/draft-cardwell-iccrg-bbr-congestion-control-02.html#name-initialization>.
    fn reset(&mut self) {
        self.stats = Default::default();
        self.now = None;
        self.sample = RateSample::default();
        self.cwnd = self.config.initial_cwnd;
        self.target_cwnd = self.config.initial_cwnd;
        self.ssthresh = u64::MAX;
        self.delivered = 0;
        self.max_bw = 0;
        self.max_bw_filter.clear();
        self.bw = 0;
        self.rtt = RttEstimator::new(self.config.rtt_window_length, self.config.probe_rtt_interval);
        self.probe_rtt_done_stamp = None;
        self.probe_rtt_round_done = false;
        self.prior_cwnd = 0;
        self.in_recovery = false;
        self.state_trigger = None;
        self.idle_restart = false;
        self.ack_phase = AckProbePhase::Init;
        self.bw_hi = u64::MAX;
        self.inflight_hi = u64::MAX;
        self.cycle_stamp = None;
        self.rounds_since_bw_probe = 0;
        self.bw_probe_samples = false;
        self.prev_probe_too_high = false;
        self.loss_round_delivered = 0;
        self.loss_in_cycle = false;
        self.ecn_in_cycle = false;
        self.startup_ecn_rounds = 0;

        self.reset_congestion_signals();
        self.reset_lower_bounds();
        self.init_round_counting();
        self.init_full_pipe();
        self.init_pacing_rate(self.config.initial_rtt);
        self.set_send_quantum();

        self.mode = Mode::Startup;
        self.update_gains();
    }

    /// See <https://www.ietf.org/archive/id/draft-cardwell-iccrg-bbr-congestion-control-02.html#name-bbrround_count-tracking-pac>.
    fn init_round_counting(&mut self) {
        self.round.next_round_delivered = 0;
        self.round.round_count = 0;
        self.round.is_round_start = false;
    }

    pub(super) fn start_round(&mut self) {
        self.round.next_round_delivered = self.delivered;
    }

    /// See <https://www.ietf.org/archive/id/draft-cardwell-iccrg-bbr-congestion-control-02.html#name-bbrround_count-tracking-pac>.
    fn update_round(&mut self) {
        if self.sample.prior_delivered >= self.round.next_round_delivered {
            self.start_round();
            self.round.round_count += 1;
            self.rounds_since_bw_probe += 1;
            self.round.is_round_start = true;
        } else {
            self.round.is_round_start = false;
        }
    }

    /// Current mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Current ProbeBW phase, if in ProbeBW.
    pub fn cycle_phase(&self) -> Option<CyclePhase> {
        match self.mode {
            Mode::ProbeBw => Some(self.cycle_phase),
            _ => None,
        }
    }

    /// BBR.inflight_hi, `None` if unset.
    pub fn inflight_hi(&self) -> Option<u64> {
        Some(self.inflight_hi).filter(|v| *v != u64::MAX)
    }

    /// BBR.inflight_lo, `None` if unset.
    pub fn inflight_lo(&self) -> Option<u64> {
        Some(self.inflight_lo).filter(|v| *v != u64::MAX)
    }

    /// BBR.bw: the bandwidth estimate used for pacing.
    pub fn bw(&self) -> u64 {
        self.bw
    }

    /// BBR.max_bw.
    pub fn max_bw(&self) -> u64 {
        self.max_bw
    }

    /// Round-trip propagation time estimate.
    pub fn rt_prop(&self) -> Option<Duration> {
        self.rtt.rt_prop()
    }

    /// Is pipe filled.
    pub fn is_filled_pipe(&self) -> bool {
        self.full_pipe.is_filled_pipe
    }

    /// Is round start.
    pub fn is_round_start(&self) -> bool {
        self.round.is_round_start
    }

    /// Count of packet-timed round trips.
    pub fn round_count(&self) -> u64 {
        self.round.round_count
    }

    /// Whether the last bandwidth probe found inflight too high.
    pub fn prev_probe_too_high(&self) -> bool {
        self.prev_probe_too_high
    }

    fn set_mode(&mut self, mode: Mode) {
        if self.mode == mode {
            return;
        }

        debug!(
            "{} mode {} -> {}, bw {} rt_prop {:?} cwnd {}",
            self.name(),
            self.mode,
            mode,
            self.bw,
            self.rtt.rt_prop(),
            self.cwnd
        );
        let old = self.mode;
        self.mode = mode;
        self.emit_state(Some(old.to_string()), mode.to_string(), self.state_trigger);
    }

    pub(super) fn set_cycle_phase(&mut self, phase: CyclePhase) {
        let old = if self.mode == Mode::ProbeBw {
            Some(self.cycle_phase)
        } else {
            None
        };
        self.cycle_phase = phase;
        if old == Some(phase) {
            return;
        }

        debug!(
            "{} cycle phase {:?} -> {}, inflight_hi {:?} inflight_lo {:?}",
            self.name(),
            old,
            phase,
            self.inflight_hi(),
            self.inflight_lo()
        );
        self.emit_state(old.map(|p| p.to_string()), phase.to_string(), self.state_trigger);
    }

    fn emit_state(
        &self,
        old: Option<String>,
        new: String,
        trigger: Option<CongestionStateUpdatedTrigger>,
    ) {
        if let (true, Some(now)) = (self.metrics.is_enabled(), self.now) {
            self.metrics.emit(
                now,
                EventData::RecoveryCongestionStateUpdated { old, new, trigger },
            );
        }
    }

    fn emit_metrics(&self, now: Instant, bytes_in_flight: u64) {
        if !self.metrics.is_enabled() {
            return;
        }

        let ms = |d: Duration| d.as_micros() as f32 / 1000.0;
        self.metrics.emit(
            now,
            EventData::RecoveryMetricsUpdated {
                min_rtt: self.rtt.rt_prop().map(ms),
                smoothed_rtt: self.rtt.smoothed_rtt().map(ms),
                latest_rtt: Some(self.rtt.latest_rtt()).filter(|d| !d.is_zero()).map(ms),
                congestion_window: Some(self.congestion_window()),
                bytes_in_flight: Some(bytes_in_flight),
                ssthresh: Some(self.ssthresh).filter(|v| *v != u64::MAX),
                pacing_rate: Some(self.pacing_rate),
                send_quantum: Some(self.send_quantum),
                bw_estimate: Some(self.bw),
                inflight_hi: self.inflight_hi(),
                inflight_lo: self.inflight_lo(),
            },
        );
    }

    /// See <https://www.ietf.org/archive/id/draft-cardwell-iccrg-bbr-congestion-control-02.html#name-modulating-cwnd-in-loss-rec>.
    /// Remember cwnd.
    pub(super) fn save_cwnd(&mut self) {
        self.prior_cwnd = if !self.in_recovery && self.mode != Mode::ProbeRtt {
            self.cwnd
        } else {
            self.cwnd.max(self.prior_cwnd)
        }
    }

    /// Restore cwnd.
    pub(super) fn restore_cwnd(&mut self) {
        self.cwnd = self.cwnd.max(self.prior_cwnd)
    }

    /// Take an RTT sample. The first sample re-initializes the pacing rate
    /// while there is no bandwidth estimate yet.
    fn update_rtt(&mut self, now: Instant, rtt: Duration) {
        let first = !self.rtt.has_sample();
        if self.rtt.update(rtt, now) && first && self.max_bw == 0 {
            self.init_pacing_rate(Some(rtt));
            self.set_send_quantum();
        }
    }

    /// See <https://www.ietf.org/archive/id/draft-cardwell-iccrg-bbr-congestion-control-02.html#name-per-ack-steps>.
    fn update_model_and_state(&mut self, now: Instant, bytes_in_flight: u64) {
        self.update_latest_delivery_signals();
        self.update_congestion_signals();
        self.check_startup_done(bytes_in_flight);
        self.check_drain(now, bytes_in_flight);
        self.update_probe_bw_cycle_phase(now, bytes_in_flight);
        self.check_probe_rtt(now, bytes_in_flight);
        self.advance_latest_delivery_signals();
        self.bound_bw_for_model();
        self.check_bounds_order(now);
    }

    fn update_control_parameters(&mut self, bytes_in_flight: u64) {
        self.set_pacing_rate();
        self.set_send_quantum();
        self.set_cwnd(bytes_in_flight);
    }

    // Update cwnd gain and pacing gain.
    // See <https://www.ietf.org/archive/id/draft-cardwell-iccrg-bbr-congestion-control-02.html#name-updating-control-parameters>.
    // +-----------------+--------+-----------+-----------+--------+------------------+
    // | State           | Tactic | Pacing    | Cwnd      | Rate   | Volume           |
    // |                 |        | Gain      | Gain      | Cap    | Cap              |
    // +-----------------+--------+-----------+-----------+--------+------------------+
    // | Startup         | accel  | 2.89      | 2.89      |        |                  |
    // | Drain           | decel  | 1/2.89    | 2.89      | bw_hi, | inflight_hi,     |
    // |                 |        |           |           | bw_lo  | inflight_lo      |
    // | ProbeBW_DOWN    | decel  | 0.91      | 2         | bw_hi, | inflight_hi,     |
    // |                 |        |           |           | bw_lo  | inflight_lo      |
    // | ProbeBW_CRUISE  | cruise | 1.0       | 2         | bw_hi, | 0.85*inflight_hi |
    // |                 |        |           |           | bw_lo  | inflight_lo      |
    // | ProbeBW_REFILL  | accel  | 1.0       | 2.25      | bw_hi  | inflight_hi      |
    // | ProbeBW_UP      | accel  | 1.25      | 2.25      | bw_hi  | inflight_hi      |
    // | ProbeRTT        | decel  | 1.0       | 0.5       | bw_hi, | 0.85*inflight_hi |
    // |                 |        |           |           | bw_lo  | inflight_lo      |
    // +-----------------+--------+-----------+-----------+--------+------------------+
    pub(super) fn update_gains(&mut self) {
        let c = &self.config;
        let (pacing_gain, cwnd_gain) = match self.mode {
            Mode::Startup => (c.high_gain, c.high_gain),
            Mode::Drain => (1.0 / c.high_gain, c.high_gain),
            Mode::ProbeBw => match self.cycle_phase {
                CyclePhase::Refill => (1.0, c.probe_up_cwnd_gain),
                CyclePhase::Up => (c.probe_up_pacing_gain, c.probe_up_cwnd_gain),
                CyclePhase::Down => (c.probe_down_pacing_gain, c.cwnd_gain),
                CyclePhase::Cruise => (1.0, c.cwnd_gain),
            },
            Mode::ProbeRtt => (1.0, 0.5),
        };
        self.pacing_gain = pacing_gain;
        self.cwnd_gain = cwnd_gain;
    }

    /// See <https://www.ietf.org/archive/id/draft-cardwell-iccrg-bbr-congestion-control-02.html#name-startup>.
    fn enter_startup(&mut self) {
        self.set_mode(Mode::Startup);
        self.update_gains();
    }

    fn check_startup_done(&mut self, bytes_in_flight: u64) {
        self.check_startup_full_bandwidth();
        self.check_startup_high_loss(bytes_in_flight);
        self.check_startup_high_ecn();
        if self.mode == Mode::Startup && self.full_pipe.is_filled_pipe {
            self.enter_drain();
        }
        self.state_trigger = None;
    }

    fn init_full_pipe(&mut self) {
        self.full_pipe.is_filled_pipe = false;
        self.full_pipe.full_bw = 0;
        self.full_pipe.full_bw_count = 0;
    }

    fn check_startup_full_bandwidth(&mut self) {
        // No need to check for a full pipe now.
        if self.is_filled_pipe() || !self.is_round_start() || self.sample.is_app_limited {
            return;
        }

        // still growing?
        if self.max_bw as f64 >= self.full_pipe.full_bw as f64 * self.config.full_bw_threshold {
            // record new baseline level
            self.full_pipe.full_bw = self.max_bw;
            self.full_pipe.full_bw_count = 0;

            return;
        }

        // another round w/o much growth
        self.full_pipe.full_bw_count += 1;

        if self.full_pipe.full_bw_count >= self.config.full_bw_count {
            self.full_pipe.is_filled_pipe = true;
            debug!(
                "{} full bandwidth reached, max_bw {} round {}",
                self.name(),
                self.max_bw,
                self.round.round_count
            );
        }
    }

    fn handle_queue_too_high_in_startup(&mut self, trigger: CongestionStateUpdatedTrigger) {
        self.full_pipe.is_filled_pipe = true;
        self.state_trigger = Some(trigger);

        // When exiting STARTUP, set inflight_hi based on:
        //      max(estimated BDP, max number of packets delivered in last round trip)
        self.inflight_hi = self.inflight(self.max_bw, 1.0).max(self.inflight_latest);
        debug!(
            "{} exit startup on congestion, inflight_hi {}",
            self.name(),
            self.inflight_hi
        );
    }

    /// Check if loss rate is too high in startup.
    // Exit STARTUP based on loss rate and loss gaps in round. Wait until
    // the end of the round in recovery to get a good estimate of how many packets
    // have been lost, and how many we need to drain with a low pacing rate.
    fn check_startup_high_loss(&mut self, bytes_in_flight: u64) {
        if self.mode != Mode::Startup {
            return;
        }

        if self.sample.lost > 0 && self.loss_events_in_round < 0xf {
            // Update saturating counter.
            self.loss_events_in_round += 1;
        }

        if self.loss_round_start
            && self.in_recovery
            && self.loss_events_in_round >= self.config.full_loss_count
            && self.is_inflight_too_high(bytes_in_flight)
        {
            self.handle_queue_too_high_in_startup(CongestionStateUpdatedTrigger::Loss)
        }

        if self.loss_round_start {
            self.loss_events_in_round = 0;
        }
    }

    /// Exit STARTUP after `full_ecn_count` consecutive rounds whose CE-marked
    /// fraction exceeded the ECN threshold.
    fn check_startup_high_ecn(&mut self) {
        if self.mode != Mode::Startup || !self.config.ecn_enabled {
            return;
        }

        if self.is_ecn_too_high() {
            self.ecn_high_in_round = true;
        }

        if !self.loss_round_start {
            return;
        }

        if self.ecn_high_in_round {
            self.startup_ecn_rounds += 1;
        } else {
            self.startup_ecn_rounds = 0;
        }
        self.ecn_high_in_round = false;

        if self.config.full_ecn_count > 0
            && self.startup_ecn_rounds >= self.config.full_ecn_count
            && !self.is_filled_pipe()
        {
            self.handle_queue_too_high_in_startup(CongestionStateUpdatedTrigger::Ecn);
        }
    }

    /// See <https://www.ietf.org/archive/id/draft-cardwell-iccrg-bbr-congestion-control-02.html#name-drain>.
    fn enter_drain(&mut self) {
        self.set_mode(Mode::Drain);
        self.update_gains();
    }

    fn check_drain(&mut self, now: Instant, bytes_in_flight: u64) {
        if self.mode == Mode::Drain && bytes_in_flight <= self.inflight(self.max_bw, 1.0) {
            // BBR estimates the queue was drained.
            self.enter_probe_bw(now);
        }
    }

    /// See <https://www.ietf.org/archive/id/draft-cardwell-iccrg-bbr-congestion-control-02.html#name-probertt>.
    fn check_probe_rtt(&mut self, now: Instant, bytes_in_flight: u64) {
        let expired = self.rtt.check_probe_rtt_expired(now);
        if self.mode == Mode::ProbeBw && expired && !self.idle_restart {
            self.enter_probe_rtt();
        }

        if self.mode == Mode::ProbeRtt {
            self.handle_probe_rtt(now, bytes_in_flight);
        }
    }

    fn enter_probe_rtt(&mut self) {
        // Remember the last-known good cwnd and restore it when exiting probe-rtt.
        self.save_cwnd();
        self.probe_rtt_done_stamp = None;
        self.probe_rtt_round_done = false;
        self.ack_phase = AckProbePhase::Stopping;
        self.start_round();
        self.stats.probe_rtt_count += 1;

        self.set_mode(Mode::ProbeRtt);
        self.update_gains();
    }

    fn handle_probe_rtt(&mut self, now: Instant, bytes_in_flight: u64) {
        if self.probe_rtt_done_stamp.is_some() {
            if self.is_round_start() {
                self.probe_rtt_round_done = true;
            }

            if self.probe_rtt_round_done {
                self.check_probe_rtt_done(now);
            }
        } else if bytes_in_flight <= self.probe_rtt_cwnd() {
            // Wait for at least ProbeRTTDuration to elapse.
            self.probe_rtt_done_stamp = Some(now + self.config.probe_rtt_duration);
            // Wait for at least one round to elapse.
            self.probe_rtt_round_done = false;
            self.start_round();
        }
    }

    fn check_probe_rtt_done(&mut self, now: Instant) {
        if let Some(probe_rtt_done_stamp) = self.probe_rtt_done_stamp {
            if now > probe_rtt_done_stamp {
                // Schedule next ProbeRtt.
                self.rtt.schedule_next_probe_rtt(now);
                self.restore_cwnd();
                self.exit_probe_rtt(now);
            }
        }
    }

    /// See <https://www.ietf.org/archive/id/draft-cardwell-iccrg-bbr-congestion-control-02.html#name-exiting-probertt>.
    fn exit_probe_rtt(&mut self, now: Instant) {
        self.reset_lower_bounds();
        self.probe_rtt_done_stamp = None;

        if self.is_filled_pipe() {
            self.start_probe_bw_refill(now, 0, false);
            self.set_mode(Mode::ProbeBw);
        } else {
            self.enter_startup();
        }
        self.update_gains();
    }

    /// See <https://www.ietf.org/archive/id/draft-cardwell-iccrg-bbr-congestion-control-02.html#name-restarting-from-idle>.
    fn handle_restart_from_idle(&mut self, now: Instant, bytes_in_flight: u64) {
        // When restarting from idle, BBR leaves its cwnd as-is and paces
        // packets at exactly BBR.bw, aiming to return as quickly as possible
        // to its target operating point of rate balance and a full pipe.
        if bytes_in_flight == 0 {
            self.idle_restart = true;

            if self.mode == Mode::ProbeBw {
                self.set_pacing_rate_with_gain(1.0);
            } else if self.mode == Mode::ProbeRtt {
                self.check_probe_rtt_done(now);
            }
        }
    }

    /// See <https://www.ietf.org/archive/id/draft-cardwell-iccrg-bbr-congestion-control-02.html#name-updating-the-bbrmax_bw-max->.
    fn update_max_bw(&mut self) {
        let bw = self.sample.delivery_rate;

        self.update_round();

        if bw >= self.max_bw || !self.sample.is_app_limited {
            self.max_bw = self.max_bw_filter.update(self.round.round_count, bw);
        }
    }

    fn on_loss(&mut self, now: Instant, lost_bytes: u64, bytes_in_flight: u64) -> Option<u64> {
        self.stats.bytes_lost_in_total = self.stats.bytes_lost_in_total.saturating_add(lost_bytes);
        self.stats.loss_events += 1;
        self.loss_in_round = true;
        if self.mode == Mode::ProbeBw {
            self.loss_in_cycle = true;
        }

        self.handle_lost_bytes(now, lost_bytes, bytes_in_flight);

        self.ssthresh = (self.cwnd / 2).max(self.config.min_pipe_cwnd);
        Some(self.ssthresh)
    }

    fn on_ecn_ce(&mut self, ce_bytes: u64) {
        self.stats.bytes_ce_in_total = self.stats.bytes_ce_in_total.saturating_add(ce_bytes);
        self.stats.ecn_events += 1;
        if !self.config.ecn_enabled {
            return;
        }

        self.ecn_in_round = true;
        if self.mode == Mode::ProbeBw {
            self.ecn_in_cycle = true;
        }
    }

    /// See <https://www.ietf.org/archive/id/draft-cardwell-iccrg-bbr-congestion-control-02.html#name-modulating-cwnd-in-loss-rec>.
    fn enter_recovery(&mut self) {
        if self.in_recovery {
            return;
        }

        self.save_cwnd();
        self.in_recovery = true;
        self.cwnd = (self.prior_cwnd / 2).max(self.config.min_pipe_cwnd);
        self.stats.recovery_count += 1;
        debug!(
            "{} enter recovery, prior_cwnd {} cwnd {}",
            self.name(),
            self.prior_cwnd,
            self.cwnd
        );
        self.emit_state(
            Some(self.mode.to_string()),
            "Recovery".to_string(),
            Some(CongestionStateUpdatedTrigger::Loss),
        );
    }

    fn exit_recovery(&mut self) {
        if !self.in_recovery {
            return;
        }

        // Upon exiting loss recovery (RTO recovery or Fast Recovery), either by
        // repairing all losses or undoing recovery, BBR restores the best-known
        // cwnd value we had upon entering loss recovery
        self.in_recovery = false;
        self.restore_cwnd();
        self.bound_cwnd_for_probe_rtt();
        self.bound_cwnd_for_model();
        debug!("{} exit recovery, cwnd {}", self.name(), self.cwnd);
        self.emit_state(Some("Recovery".to_string()), self.mode.to_string(), None);
    }

    /// Copy of the controller without the per-round transient signals.
    fn forked(&self) -> Bbr {
        let mut bbr = self.clone();
        bbr.reset_congestion_signals();
        bbr.bw_probe_up_acks = 0;
        bbr.loss_events_in_round = 0;
        bbr.ecn_high_in_round = false;
        bbr.startup_ecn_rounds = 0;
        bbr
    }

    fn output_with_ssthresh(&self, ssthresh: Option<u64>) -> ControlOutput {
        ControlOutput {
            slow_start_thresh: ssthresh,
            ..self.output()
        }
    }
}

impl CongestionController for Bbr {
    fn name(&self) -> &str {
        "BBR"
    }

    fn init(&mut self, ctx: &ConnCtx) {
        if ctx.segment_size != self.config.segment_size {
            warn!(
                "{} segment size {} differs from configured {}",
                self.name(),
                ctx.segment_size,
                self.config.segment_size
            );
        }
        self.reset();
        self.max_pacing_rate = self.config.max_pacing_rate.min(ctx.max_pacing_rate);
        self.pacing_rate = self.pacing_rate.min(self.max_pacing_rate);
        self.set_send_quantum();
    }

    fn on_rate_sample(&mut self, now: Instant, rs: &RateSample, ctx: &ConnCtx) -> ControlOutput {
        self.now = Some(now);
        self.sample = *rs;
        self.max_pacing_rate = self.config.max_pacing_rate.min(ctx.max_pacing_rate);
        self.delivered = self.delivered.saturating_add(rs.acked_sacked);

        // Update stats.
        self.stats.bytes_in_flight = ctx.bytes_in_flight;
        self.stats.rate_samples += 1;
        self.stats.bytes_acked_in_total =
            self.stats.bytes_acked_in_total.saturating_add(rs.acked_sacked);
        if self.in_slow_start() {
            self.stats.bytes_acked_in_slow_start = self
                .stats
                .bytes_acked_in_slow_start
                .saturating_add(rs.acked_sacked);
        }

        if let Some(rtt) = rs.rtt {
            self.update_rtt(now, rtt);
        }

        // Update model and control parameters.
        self.update_model_and_state(now, ctx.bytes_in_flight);
        self.update_gains();
        self.update_control_parameters(ctx.bytes_in_flight);

        if rs.delivered > 0 {
            self.idle_restart = false;
        }

        trace!(
            "{} {:?} mode={} phase={:?} round={} bw={} max_bw={} rt_prop={:?} \
             inflight_hi={:?} inflight_lo={:?} cwnd={} pacing_rate={} send_quantum={}",
            self.name(),
            now,
            self.mode,
            self.cycle_phase(),
            self.round.round_count,
            self.bw,
            self.max_bw,
            self.rtt.rt_prop(),
            self.inflight_hi(),
            self.inflight_lo(),
            self.cwnd,
            self.pacing_rate,
            self.send_quantum
        );
        self.emit_metrics(now, ctx.bytes_in_flight);

        self.output()
    }

    fn on_rtt_sample(&mut self, now: Instant, rtt: Duration) {
        self.now = Some(now);
        self.update_rtt(now, rtt);
    }

    fn on_congestion_event(
        &mut self,
        now: Instant,
        event: CongestionEvent,
        ctx: &ConnCtx,
    ) -> ControlOutput {
        self.now = Some(now);
        self.stats.bytes_in_flight = ctx.bytes_in_flight;

        let ssthresh = match event {
            CongestionEvent::Loss { lost_bytes } => {
                self.on_loss(now, lost_bytes, ctx.bytes_in_flight)
            }
            CongestionEvent::EcnCe { ce_bytes } => {
                self.on_ecn_ce(ce_bytes);
                None
            }
            CongestionEvent::RecoveryEnter => {
                self.enter_recovery();
                None
            }
            CongestionEvent::RecoveryExit => {
                self.exit_recovery();
                None
            }
            CongestionEvent::CwndRestart => {
                self.handle_restart_from_idle(now, ctx.bytes_in_flight);
                None
            }
        };
        self.update_gains();

        self.output_with_ssthresh(ssthresh)
    }

    fn on_timer(&mut self, now: Instant, ctx: &ConnCtx) -> ControlOutput {
        self.now = Some(now);
        self.round.is_round_start = false;

        self.check_probe_rtt(now, ctx.bytes_in_flight);
        self.check_probe_wait_timer(now);
        self.update_gains();
        self.set_pacing_rate();
        self.set_send_quantum();
        self.bound_cwnd_for_probe_rtt();
        self.bound_cwnd_for_model();

        self.output()
    }

    fn in_slow_start(&self) -> bool {
        self.mode == Mode::Startup
    }

    fn in_recovery(&self) -> bool {
        self.in_recovery
    }

    fn congestion_window(&self) -> u64 {
        self.cwnd.max(self.config.min_pipe_cwnd)
    }

    fn pacing_rate(&self) -> u64 {
        self.pacing_rate
    }

    fn send_quantum(&self) -> u64 {
        self.send_quantum
    }

    fn slow_start_thresh(&self) -> u64 {
        self.ssthresh
    }

    fn initial_window(&self) -> u64 {
        self.config.initial_cwnd
    }

    fn minimal_window(&self) -> u64 {
        self.config.min_pipe_cwnd
    }

    fn stats(&self) -> &CongestionStats {
        &self.stats
    }

    fn fork(&self) -> Box<dyn CongestionController> {
        Box::new(self.forked())
    }
}


mod bounds;
mod probe_bw;
mod window;
