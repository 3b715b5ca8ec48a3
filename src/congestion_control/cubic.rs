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

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use log::*;

use super::rtt::RttEstimator;
use super::CongestionController;
use super::CongestionEvent;
use super::CongestionStats;
use super::ConnCtx;
use super::ControlOutput;
use super::RateSample;
use crate::metrics::CongestionStateUpdatedTrigger;
use crate::metrics::EventData;
use crate::metrics::MetricsEmitter;
use crate::metrics::MetricsSink;
use crate::CongestionConfig;
use crate::Error;
use crate::Result;

/// Pacing rate threshold for the send quantum floor, 1.2Mbps in bytes/s.
const SEND_QUANTUM_THRESHOLD_PACING_RATE: u64 = 1_200_000 / 8;

/// Cubic Configuration.
#[derive(Debug, Clone)]
pub struct CubicConfig {
    /// Constant C, which determines the aggressiveness of CUBIC in competing
    /// with other congestion control algorithms in high-BDP networks.
    ///
    /// See <https://www.rfc-editor.org/rfc/rfc9438.html#name-constants-of-interest>.
    c: f64,

    /// Beta_cubic, the multiplicative decrease factor: on a congestion event
    /// cwnd is reduced to W_cubic(0) = W_max * beta_cubic.
    beta: f64,

    /// Segment size in bytes.
    segment_size: u64,

    /// Minimal congestion window in bytes.
    min_congestion_window: u64,

    /// Initial congestion window in bytes.
    initial_congestion_window: u64,

    /// The threshold for slow start in bytes.
    slow_start_thresh: u64,

    /// Enable fast convergence, default to true.
    fast_convergence_enabled: bool,

    /// Reduce cwnd on CE marks as on loss (RFC 3168), default to true.
    ecn_enabled: bool,

    /// Initial rtt.
    initial_rtt: Option<Duration>,

    /// Windows of the rtt estimator.
    rtt_window_length: Duration,
    probe_rtt_interval: Duration,

    /// Upper limit of the pacing rate in bytes per second.
    max_pacing_rate: u64,

    /// Upper limit of the send quantum in bytes.
    max_send_quantum: u64,
}

impl CubicConfig {
    /// Take the CUBIC parameters of a configuration that has already been
    /// validated.
    fn with_config(conf: &CongestionConfig) -> Self {
        Self {
            c: conf.cubic_c,
            beta: conf.cubic_beta,
            segment_size: conf.segment_size,
            min_congestion_window: conf.min_pipe_cwnd_bytes(),
            initial_congestion_window: conf.initial_cwnd_bytes(),
            slow_start_thresh: u64::MAX,
            fast_convergence_enabled: conf.cubic_fast_convergence,
            ecn_enabled: conf.ecn_enabled,
            initial_rtt: conf.initial_rtt,
            rtt_window_length: conf.rtt_window_length,
            probe_rtt_interval: conf.probe_rtt_interval,
            max_pacing_rate: conf.max_pacing_rate,
            max_send_quantum: conf.max_send_quantum,
        }
    }

    /// Update C.
    pub fn set_c(&mut self, c: f64) -> &mut Self {
        self.c = c;
        self
    }

    /// Update beta.
    pub fn set_beta(&mut self, beta: f64) -> &mut Self {
        self.beta = beta;
        self
    }

    /// Enable fast_convergence.
    pub fn enable_fast_convergence(&mut self, enable: bool) -> &mut Self {
        self.fast_convergence_enabled = enable;
        self
    }

    /// Enable the reaction to CE marks.
    pub fn enable_ecn(&mut self, enable: bool) -> &mut Self {
        self.ecn_enabled = enable;
        self
    }

    /// Update min congestion window.
    pub fn set_min_congestion_window(&mut self, min_congestion_window: u64) -> &mut Self {
        self.min_congestion_window = min_congestion_window;
        self
    }

    /// Update initial congestion window.
    pub fn set_initial_congestion_window(&mut self, initial_congestion_window: u64) -> &mut Self {
        self.initial_congestion_window = initial_congestion_window;
        self
    }

    /// Update segment size.
    pub fn set_segment_size(&mut self, segment_size: u64) -> &mut Self {
        self.segment_size = segment_size;
        self
    }
}

impl TryFrom<&CongestionConfig> for CubicConfig {
    type Error = Error;

    fn try_from(conf: &CongestionConfig) -> Result<Self> {
        conf.validate()?;
        Ok(Self::with_config(conf))
    }
}

impl Default for CubicConfig {
    fn default() -> Self {
        Self::with_config(&CongestionConfig::default())
    }
}

/// Cubic congestion control algorithm.
///
/// See <https://www.rfc-editor.org/rfc/rfc9438.html>.
#[derive(Debug, Clone)]
pub struct Cubic {
    /// Configuration.
    config: CubicConfig,

    /// Congestion statistics.
    stats: CongestionStats,

    /// Metrics sinks.
    metrics: MetricsEmitter,

    /// RTT estimator, only the smoothed RTT is used.
    rtt: RttEstimator,

    /// Congestion window in bytes.
    cwnd: u64,

    /// Slow start thresh in bytes.
    ssthresh: u64,

    /// The window size just before the window is reduced in the last congestion event.
    w_max: f64,

    /// The time period that W_cubic takes to increase the current window
    /// size to W_max if there are no further congestion events.
    k: f64,

    /// CUBIC additive increase factor used in the Reno-friendly region.
    alpha: f64,

    /// Estimated window to achieve the same average window size as Standard TCP.
    w_est: f64,

    /// Cwnd increment during congestion avoidance.
    cwnd_inc: u64,

    /// Time of the last recovery event starts.
    recovery_epoch_start: Option<Instant>,

    /// Delivered count when cwnd was last reduced. Samples of data sent
    /// before that belong to the same congestion event.
    recovery_delivered: Option<u64>,

    /// Sum of acked bytes.
    delivered: u64,

    /// Time of the last rate sample.
    last_sample_time: Option<Instant>,

    /// Pacing rate
    pacing_rate: u64,

    /// Effective upper limit of the pacing rate.
    max_pacing_rate: u64,

    /// Send quantum in bytes.
    send_quantum: u64,
}

impl Cubic {
    pub fn new(config: CubicConfig, sinks: Vec<Arc<dyn MetricsSink>>) -> Self {
        let rtt = RttEstimator::new(config.rtt_window_length, config.probe_rtt_interval);
        let mut cubic = Self {
            cwnd: config.initial_congestion_window,
            ssthresh: config.slow_start_thresh,
            max_pacing_rate: config.max_pacing_rate,
            config,
            stats: Default::default(),
            metrics: MetricsEmitter::new(sinks),
            rtt,
            w_max: 0_f64,
            k: 0_f64,
            alpha: 0_f64,
            w_est: 0_f64,
            cwnd_inc: 0_u64,
            recovery_epoch_start: None,
            recovery_delivered: None,
            delivered: 0,
            last_sample_time: None,
            pacing_rate: 0,
            send_quantum: 0,
        };
        cubic.alpha = cubic.reno_friendly_alpha();
        cubic.update_pacing_rate();
        cubic
    }

    fn reset(&mut self) {
        self.stats = Default::default();
        self.rtt = RttEstimator::new(self.config.rtt_window_length, self.config.probe_rtt_interval);
        self.cwnd = self.config.initial_congestion_window;
        self.ssthresh = self.config.slow_start_thresh;
        self.w_max = 0_f64;
        self.k = 0_f64;
        self.alpha = self.reno_friendly_alpha();
        self.w_est = 0_f64;
        self.cwnd_inc = 0;
        self.recovery_epoch_start = None;
        self.recovery_delivered = None;
        self.delivered = 0;
        self.last_sample_time = None;
        self.update_pacing_rate();
    }

    /// CUBIC additive increase factor, 3 * (1 - beta) / (1 + beta).
    ///
    /// See <https://www.rfc-editor.org/rfc/rfc9438.html#name-reno-friendly-region>.
    fn reno_friendly_alpha(&self) -> f64 {
        3.0 * (1.0 - self.config.beta) / (1.0 + self.config.beta)
    }

    /// Calculate window increase during congestion avoidance.
    ///
    /// See <https://www.rfc-editor.org/rfc/rfc9438.html#name-window-increase-function>.
    fn w_cubic(&self, t: Duration, segment_size: u64) -> f64 {
        // W_cubic(t) = C*(t-K)^3 + W_max
        self.config.c * (t.as_secs_f64() - self.k).powi(3) * segment_size as f64 + self.w_max
    }

    /// Calculate window estimation to achieves approximately the same average window size as Reno.
    ///
    /// See <https://www.rfc-editor.org/rfc/rfc9438.html#name-reno-friendly-region>.
    fn w_est(&self, acked_bytes: u64, segment_size: u64) -> f64 {
        // W_est = W_est + [3*(1-beta_cubic)/(1+beta_cubic)] * (segments_acked/cwnd)
        self.w_est + self.alpha * acked_bytes as f64 / self.cwnd as f64 * segment_size as f64
    }

    /// Calculate parameter K.
    ///
    /// See <https://www.rfc-editor.org/rfc/rfc9438.html#name-window-increase-function>.
    fn cubic_k(&self, cwnd: u64, segment_size: u64) -> f64 {
        // K = cubic_root((W_max - cwnd_epoch)/C).
        if self.w_max > cwnd as f64 {
            ((self.w_max - cwnd as f64) / segment_size as f64 / self.config.c).cbrt()
        } else {
            0.0
        }
    }

    /// Whether a congestion event reduced cwnd and no data sent after the
    /// reduction has been delivered yet.
    fn is_recovering(&self) -> bool {
        self.recovery_delivered.is_some()
    }

    fn grow_cwnd(&mut self, now: Instant, acked_bytes: u64, srtt: Duration) {
        let segment_size = self.config.segment_size.max(1);

        if self.in_slow_start() {
            self.cwnd = self.cwnd.saturating_add(acked_bytes);
            return;
        }

        // Congestion avoidance.
        let duration_since_recovery: Duration;

        if let Some(recovery_start) = self.recovery_epoch_start {
            // Congestion event happened.
            duration_since_recovery = now.saturating_duration_since(recovery_start);
        } else {
            // No congestion event happened. Initialize here.
            self.recovery_epoch_start = Some(now);
            self.w_max = self.cwnd as f64;
            self.k = 0_f64;
            self.w_est = self.cwnd as f64;
            self.alpha = self.reno_friendly_alpha();

            duration_since_recovery = Duration::ZERO;
        }

        // Update W_cubic and target:
        //  `target = W_cubic(t+RTT).clamp(cwnd, 1.5*cwnd)`
        // as <https://www.rfc-editor.org/rfc/rfc9438.html#name-window-increase-function>.
        let mut target = self.w_cubic(duration_since_recovery.saturating_add(srtt), segment_size);

        target = target.clamp(self.cwnd as f64, 1.5 * self.cwnd as f64);

        self.w_est = self.w_est(acked_bytes, segment_size);

        // Once W_est has grown to reach the cwnd at the time of most recently
        // setting ssthresh, alpha is set to 1 to grow as fast as Reno.
        if self.w_est >= self.w_max {
            self.alpha = 1.0_f64;
        }

        let mut cwnd = self.cwnd;

        let w_cubic_t = self.w_cubic(duration_since_recovery, segment_size);

        if w_cubic_t < self.w_est {
            // Reno-friendly region.
            cwnd = cwnd.max(self.w_est as u64);
        } else {
            // Increment in concave and convex region is (target - cwnd)/cwnd
            // per acked segment.
            // See <https://www.rfc-editor.org/rfc/rfc9438.html#name-concave-region>.
            let cubic_inc = (target - cwnd as f64) / cwnd as f64 * acked_bytes as f64;

            cwnd += cubic_inc as u64;
        }

        // Update the increment and increase cwnd by segment size.
        self.cwnd_inc = self.cwnd_inc.saturating_add(cwnd.saturating_sub(self.cwnd));
        self.cwnd = self
            .cwnd
            .saturating_add(self.cwnd_inc / segment_size * segment_size);
        self.cwnd_inc %= segment_size;
    }

    /// Multiplicative decrease, at most once per congestion event.
    ///
    /// See <https://www.rfc-editor.org/rfc/rfc9438.html#name-multiplicative-decrease>.
    fn on_congestion(&mut self, now: Instant, trigger: CongestionStateUpdatedTrigger) {
        if self.is_recovering() {
            return;
        }

        let old = self.state_name();
        self.recovery_epoch_start = Some(now);
        self.recovery_delivered = Some(self.delivered);
        self.stats.recovery_count += 1;

        // Fast convergence.
        // See <https://www.rfc-editor.org/rfc/rfc9438.html#name-fast-convergence>.
        self.w_max = if self.config.fast_convergence_enabled && (self.cwnd as f64) < self.w_max {
            self.cwnd as f64 * (1.0 + self.config.beta) / 2.0
        } else {
            self.cwnd as f64
        };

        self.ssthresh = (self.cwnd as f64 * self.config.beta) as u64;
        self.ssthresh = self.ssthresh.max(self.config.min_congestion_window);
        self.cwnd = self.ssthresh;

        self.k = self.cubic_k(self.cwnd, self.config.segment_size);

        self.cwnd_inc = (self.cwnd_inc as f64 * self.config.beta) as u64;

        // W_est is set equal to cwnd_epoch at the start of the congestion avoidance stage,
        // see <https://www.rfc-editor.org/rfc/rfc9438.html#name-reno-friendly-region>.
        self.w_est = self.cwnd as f64;
        self.alpha = self.reno_friendly_alpha();

        debug!(
            "{} {:?} reduce cwnd to {}, w_max {} k {}",
            self.name(),
            trigger,
            self.cwnd,
            self.w_max,
            self.k
        );
        self.emit_state(now, old, Some(trigger));
        self.update_pacing_rate();
    }

    fn exit_recovery(&mut self, now: Instant) {
        if self.recovery_delivered.take().is_some() {
            debug!("{} exit recovery, cwnd {}", self.name(), self.cwnd);
            self.emit_state(now, "Recovery".to_string(), None);
        }
    }

    fn state_name(&self) -> String {
        if self.is_recovering() {
            "Recovery"
        } else if self.in_slow_start() {
            "SlowStart"
        } else {
            "CongestionAvoidance"
        }
        .to_string()
    }

    fn emit_state(
        &self,
        now: Instant,
        old: String,
        trigger: Option<CongestionStateUpdatedTrigger>,
    ) {
        if self.metrics.is_enabled() {
            self.metrics.emit(
                now,
                EventData::RecoveryCongestionStateUpdated {
                    old: Some(old),
                    new: self.state_name(),
                    trigger,
                },
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
                bw_estimate: None,
                inflight_hi: None,
                inflight_lo: None,
            },
        );
    }

    /// Pace one congestion window per smoothed RTT, falling back to the
    /// initial rtt, then 1ms, before the first sample.
    fn update_pacing_rate(&mut self) {
        let rtt = self
            .rtt
            .smoothed_rtt()
            .or(self.config.initial_rtt)
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_millis(1));

        let rate = self.congestion_window() as u128 * 1_000_000 / rtt.as_micros().max(1);
        self.pacing_rate = (rate.min(u64::MAX as u128) as u64).min(self.max_pacing_rate);

        let floor = if self.pacing_rate < SEND_QUANTUM_THRESHOLD_PACING_RATE {
            self.config.segment_size
        } else {
            2 * self.config.segment_size
        };
        self.send_quantum = (self.pacing_rate / 1000)
            .min(self.config.max_send_quantum)
            .max(floor);
    }

    fn output_with_ssthresh(&self, ssthresh: Option<u64>) -> ControlOutput {
        ControlOutput {
            slow_start_thresh: ssthresh,
            ..self.output()
        }
    }
}

impl CongestionController for Cubic {
    fn name(&self) -> &str {
        "CUBIC"
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
        self.max_pacing_rate = self.config.max_pacing_rate.min(ctx.max_pacing_rate);
        self.reset();
    }

    fn on_rate_sample(&mut self, now: Instant, rs: &RateSample, ctx: &ConnCtx) -> ControlOutput {
        self.max_pacing_rate = self.config.max_pacing_rate.min(ctx.max_pacing_rate);
        self.delivered = self.delivered.saturating_add(rs.acked_sacked);
        self.last_sample_time = Some(now);

        // Statistics.
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
            self.rtt.update(rtt, now);
        }

        // Data sent after the last reduction was delivered.
        if matches!(self.recovery_delivered, Some(d) if rs.prior_delivered > d) {
            self.exit_recovery(now);
        }

        match self.rtt.smoothed_rtt() {
            Some(srtt) if !rs.is_app_limited && !self.is_recovering() => {
                self.grow_cwnd(now, rs.acked_sacked, srtt)
            }
            _ => (),
        }
        self.update_pacing_rate();

        trace!(
            "{} {:?} cwnd={} ssthresh={} w_max={} k={} srtt={:?} pacing_rate={}",
            self.name(),
            now,
            self.cwnd,
            self.ssthresh,
            self.w_max,
            self.k,
            self.rtt.smoothed_rtt(),
            self.pacing_rate
        );
        self.emit_metrics(now, ctx.bytes_in_flight);

        self.output()
    }

    fn on_rtt_sample(&mut self, now: Instant, rtt: Duration) {
        self.rtt.update(rtt, now);
    }

    fn on_congestion_event(
        &mut self,
        now: Instant,
        event: CongestionEvent,
        ctx: &ConnCtx,
    ) -> ControlOutput {
        self.stats.bytes_in_flight = ctx.bytes_in_flight;

        let ssthresh = match event {
            CongestionEvent::Loss { lost_bytes } => {
                self.stats.bytes_lost_in_total =
                    self.stats.bytes_lost_in_total.saturating_add(lost_bytes);
                self.stats.loss_events += 1;
                self.on_congestion(now, CongestionStateUpdatedTrigger::Loss);
                Some(self.ssthresh)
            }
            CongestionEvent::EcnCe { ce_bytes } => {
                self.stats.bytes_ce_in_total =
                    self.stats.bytes_ce_in_total.saturating_add(ce_bytes);
                self.stats.ecn_events += 1;
                if self.config.ecn_enabled {
                    self.on_congestion(now, CongestionStateUpdatedTrigger::Ecn);
                }
                None
            }
            CongestionEvent::RecoveryEnter => None,
            CongestionEvent::RecoveryExit => {
                self.exit_recovery(now);
                None
            }
            CongestionEvent::CwndRestart => {
                // Better follow cubic curve after idle period.
                // See <https://github.com/torvalds/linux/commit/30927520dbae297182990bb21d08762bcc35ce1d>.
                if ctx.bytes_in_flight == 0 {
                    if let (Some(start), Some(last)) =
                        (self.recovery_epoch_start, self.last_sample_time)
                    {
                        // Shifted later in time by the amount of the idle period.
                        self.recovery_epoch_start =
                            Some(start + now.saturating_duration_since(last));
                    }
                }
                None
            }
        };

        self.output_with_ssthresh(ssthresh)
    }

    fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    fn in_recovery(&self) -> bool {
        self.is_recovering()
    }

    fn congestion_window(&self) -> u64 {
        self.cwnd.max(self.config.min_congestion_window)
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
        self.config.initial_congestion_window
    }

    fn minimal_window(&self) -> u64 {
        self.config.min_congestion_window
    }

    fn stats(&self) -> &CongestionStats {
        &self.stats
    }

    fn fork(&self) -> Box<dyn CongestionController> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MemorySink;

    const SEG: u64 = crate::DEFAULT_SEGMENT_SIZE;
    const ACKED: u64 = 10 * SEG;
    const RTT: Duration = Duration::from_millis(20);

    /// Feed one full window per RTT.
    struct Harness {
        cubic: Cubic,
        now: Instant,
        delivered: u64,
    }

    impl Harness {
        fn new(cubic: Cubic) -> Self {
            Harness {
                cubic,
                now: Instant::now(),
                delivered: 0,
            }
        }

        fn ctx(&self) -> ConnCtx {
            ConnCtx::new(SEG, ACKED, u64::MAX)
        }

        fn sample(&mut self, app_limited: bool) -> ControlOutput {
            self.now += RTT;
            let rs = RateSample {
                delivered: ACKED,
                acked_sacked: ACKED,
                interval: RTT,
                delivery_rate: ACKED * 50,
                prior_in_flight: ACKED,
                prior_delivered: self.delivered,
                is_app_limited: app_limited,
                rtt: Some(RTT),
                ..RateSample::default()
            };
            self.delivered += ACKED;
            let ctx = self.ctx();
            self.cubic.on_rate_sample(self.now, &rs, &ctx)
        }

        fn event(&mut self, event: CongestionEvent) -> ControlOutput {
            let ctx = self.ctx();
            self.cubic.on_congestion_event(self.now, event, &ctx)
        }
    }

    #[test]
    fn cubic_calc_k() {
        let cubic_cfg = CubicConfig::default();
        let mut cubic = Cubic::new(cubic_cfg, Vec::new());
        let segment_size = 1000;

        cubic.w_max = 10240.0;

        // Default settings.
        assert_eq!(cubic.minimal_window(), 4 * SEG);
        assert_eq!(cubic.initial_window(), 10 * SEG);

        // Valid cwnd.
        let cwnd = 7040;
        assert_eq!(cubic.cubic_k(cwnd, segment_size), 2.0);

        // Invalid cwnd (larger than w_max).
        let cwnd = 20000;
        assert_eq!(cubic.cubic_k(cwnd, segment_size), 0.0);
    }

    #[test]
    fn cubic_slow_start() {
        let mut h = Harness::new(Cubic::new(CubicConfig::default(), Vec::new()));
        assert!(h.cubic.in_slow_start());
        assert!(!h.cubic.in_recovery());

        let out = h.sample(false);
        assert_eq!(out.congestion_window, 20 * SEG);
        assert_eq!(h.cubic.stats().bytes_acked_in_slow_start, ACKED);

        // One window per 20ms.
        assert_eq!(out.pacing_rate, 20 * SEG * 50);
        assert_eq!(out.send_quantum, 2 * SEG);

        // App limited samples do not grow cwnd.
        let out = h.sample(true);
        assert_eq!(out.congestion_window, 20 * SEG);
    }

    #[test]
    fn cubic_loss_once_per_event() {
        let mut h = Harness::new(Cubic::new(CubicConfig::default(), Vec::new()));
        h.sample(false);
        let cwnd = h.cubic.congestion_window();

        let out = h.event(CongestionEvent::Loss { lost_bytes: SEG });
        assert_eq!(h.cubic.w_max, cwnd as f64);
        assert_eq!(h.cubic.ssthresh, (cwnd as f64 * h.cubic.config.beta) as u64);
        assert_eq!(h.cubic.cwnd, h.cubic.ssthresh);
        assert_eq!(out.slow_start_thresh, Some(h.cubic.ssthresh));
        assert!(h.cubic.in_recovery());
        assert!(!h.cubic.in_slow_start());

        // More losses of the same event.
        let reduced = h.cubic.cwnd;
        h.event(CongestionEvent::Loss { lost_bytes: SEG });
        h.event(CongestionEvent::EcnCe { ce_bytes: SEG });
        assert_eq!(h.cubic.cwnd, reduced);
        assert_eq!(h.cubic.stats().loss_events, 2);
        assert_eq!(h.cubic.stats().recovery_count, 1);

        // Fast convergence on the next event.
        h.event(CongestionEvent::RecoveryExit);
        assert!(!h.cubic.in_recovery());
        h.event(CongestionEvent::Loss { lost_bytes: SEG });
        assert_eq!(
            h.cubic.w_max,
            reduced as f64 * (1.0 + h.cubic.config.beta) / 2.0
        );
        assert_eq!(h.cubic.ssthresh, (reduced as f64 * h.cubic.config.beta) as u64);
        assert_eq!(h.cubic.stats().recovery_count, 2);
    }

    #[test]
    fn cubic_without_fast_convergence() {
        let mut conf = CubicConfig::default();
        conf.enable_fast_convergence(false);
        let mut h = Harness::new(Cubic::new(conf, Vec::new()));
        h.sample(false);

        h.event(CongestionEvent::Loss { lost_bytes: SEG });
        let reduced = h.cubic.cwnd;
        h.event(CongestionEvent::RecoveryExit);
        h.event(CongestionEvent::Loss { lost_bytes: SEG });
        assert_eq!(h.cubic.w_max, reduced as f64);
    }

    #[test]
    fn cubic_congestion_avoidance() {
        let mut h = Harness::new(Cubic::new(CubicConfig::default(), Vec::new()));
        h.sample(false);
        h.event(CongestionEvent::Loss { lost_bytes: SEG });
        let reduced = h.cubic.cwnd;

        // Acks for data sent before the reduction.
        h.sample(false);
        assert!(h.cubic.in_recovery());
        assert_eq!(h.cubic.cwnd, reduced);

        // Acks for data sent after it.
        for _ in 0..10 {
            h.sample(false);
            assert!(!h.cubic.in_recovery());
            assert!(!h.cubic.in_slow_start());
        }
        assert!(h.cubic.cwnd > reduced);
        assert_eq!(h.cubic.cwnd % SEG, reduced % SEG);
    }

    #[test]
    fn cubic_ecn() {
        let start = Instant::now();
        let sink = Arc::new(MemorySink::new(start));
        let mut h = Harness::new(Cubic::new(CubicConfig::default(), vec![sink.clone()]));
        h.now = start;
        h.sample(false);
        let cwnd = h.cubic.cwnd;

        let out = h.event(CongestionEvent::EcnCe { ce_bytes: 2 * SEG });
        assert_eq!(out.slow_start_thresh, None);
        assert_eq!(h.cubic.cwnd, (cwnd as f64 * h.cubic.config.beta) as u64);
        assert_eq!(h.cubic.stats().bytes_ce_in_total, 2 * SEG);

        let states: Vec<EventData> = sink
            .events()
            .into_iter()
            .map(|e| e.data)
            .filter(|d| matches!(d, EventData::RecoveryCongestionStateUpdated { .. }))
            .collect();
        assert_eq!(
            states,
            vec![EventData::RecoveryCongestionStateUpdated {
                old: Some("SlowStart".to_string()),
                new: "Recovery".to_string(),
                trigger: Some(CongestionStateUpdatedTrigger::Ecn),
            }]
        );
    }

    #[test]
    fn cubic_ecn_disabled() {
        let mut conf = CubicConfig::default();
        conf.enable_ecn(false);
        let mut h = Harness::new(Cubic::new(conf, Vec::new()));
        h.sample(false);
        let cwnd = h.cubic.cwnd;

        h.event(CongestionEvent::EcnCe { ce_bytes: 2 * SEG });
        assert_eq!(h.cubic.cwnd, cwnd);
        assert_eq!(h.cubic.stats().ecn_events, 1);
        assert!(!h.cubic.in_recovery());
    }

    #[test]
    fn cubic_idle_restart() {
        let mut h = Harness::new(Cubic::new(CubicConfig::default(), Vec::new()));
        h.sample(false);
        h.event(CongestionEvent::Loss { lost_bytes: SEG });
        let epoch = h.cubic.recovery_epoch_start;
        assert_eq!(epoch, Some(h.now));

        // Idle for one second, then restart.
        let idle = Duration::from_secs(1);
        h.now += idle;
        let ctx = ConnCtx::new(SEG, 0, u64::MAX);
        h.cubic
            .on_congestion_event(h.now, CongestionEvent::CwndRestart, &ctx);
        assert_eq!(h.cubic.recovery_epoch_start, epoch.map(|t| t + idle));
    }

    #[test]
    fn cubic_fork() {
        let mut h = Harness::new(Cubic::new(CubicConfig::default(), Vec::new()));
        h.sample(false);
        h.event(CongestionEvent::Loss { lost_bytes: SEG });

        let forked = h.cubic.fork();
        assert_eq!(forked.name(), "CUBIC");
        assert_eq!(forked.congestion_window(), h.cubic.congestion_window());
        assert_eq!(forked.slow_start_thresh(), h.cubic.slow_start_thresh());
        assert!(forked.in_recovery());
    }

    #[test]
    fn cubic_init_resets() {
        let mut h = Harness::new(Cubic::new(CubicConfig::default(), Vec::new()));
        h.sample(false);
        h.event(CongestionEvent::Loss { lost_bytes: SEG });

        h.cubic.init(&ConnCtx::new(SEG, 0, 1_000_000));
        assert_eq!(h.cubic.congestion_window(), 10 * SEG);
        assert!(h.cubic.in_slow_start());
        assert!(!h.cubic.in_recovery());
        assert_eq!(h.cubic.stats().loss_events, 0);
        assert_eq!(h.cubic.pacing_rate(), 1_000_000);
    }

    #[test]
    fn cubic_new_config() {
        let segment_size: u64 = 1000;
        let min_cwnd: u64 = 4 * segment_size;
        let initial_cwnd: u64 = 10 * segment_size;
        let mut cubic_config = CubicConfig::default();

        cubic_config.set_c(0.7);
        assert_eq!(cubic_config.c, 0.7);

        cubic_config.set_beta(0.4);
        assert_eq!(cubic_config.beta, 0.4);

        cubic_config.enable_fast_convergence(true);
        assert_eq!(cubic_config.fast_convergence_enabled, true);

        cubic_config.set_initial_congestion_window(initial_cwnd);
        assert_eq!(cubic_config.initial_congestion_window, initial_cwnd);

        cubic_config.set_min_congestion_window(min_cwnd);
        assert_eq!(cubic_config.min_congestion_window, min_cwnd);

        cubic_config.set_segment_size(segment_size);
        assert_eq!(cubic_config.segment_size, segment_size);

        let cubic = Cubic::new(cubic_config, Vec::new());
        assert_eq!(cubic.initial_window(), initial_cwnd);
        assert_eq!(cubic.alpha, 3.0 * (1.0 - 0.4) / (1.0 + 0.4));
    }

    #[test]
    fn cubic_config_requires_valid_config() {
        let conf = CongestionConfig {
            segment_size: 0,
            ..CongestionConfig::default()
        };
        assert!(matches!(
            CubicConfig::try_from(&conf),
            Err(Error::InvalidConfig(_))
        ));

        let conf = CongestionConfig {
            cubic_beta: 1.0,
            ..CongestionConfig::default()
        };
        assert!(CubicConfig::try_from(&conf).is_err());
        assert!(CubicConfig::try_from(&CongestionConfig::default()).is_ok());
    }

    #[test]
    fn cubic_zero_segment_size() {
        let mut conf = CubicConfig::default();
        conf.set_segment_size(0);
        let mut h = Harness::new(Cubic::new(conf, Vec::new()));

        h.sample(false);
        h.event(CongestionEvent::Loss { lost_bytes: SEG });
        for _ in 0..20 {
            let out = h.sample(false);
            assert!(out.congestion_window >= 4 * SEG);
        }
        assert!(!h.cubic.in_slow_start());
    }
}
