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

//! An ECN-aware BBR congestion controller core for congestion-control
//! evaluation testbeds.
//!
//! The crate decides, for one transport connection, how many bytes may be in
//! flight and at what rate they are paced. It is driven entirely by the host:
//! a discrete-event simulator or a real transport feeds delivery-rate
//! samples, RTT samples, loss events and ECN marks, and reads back the
//! congestion window, pacing rate and send quantum.
//!
//! ## Features
//!
//! * **BBR**: a BBRv3-style model-based controller which reacts to both loss
//!   and ECN CE marks, with configurable thresholds for L4S experiments.
//! * **CUBIC**: the loss-based comparison sender driven through the same
//!   interface.
//! * **Observability**: model changes are reported through `log` and through
//!   pluggable [`MetricsSink`]s, e.g. a JSON text sequence writer.
//!
//! ## Get started
//!
//! ```
//! use std::time::{Duration, Instant};
//! use l4s_cc::{build_congestion_controller, CongestionConfig, CongestionController, ConnCtx, RateSample};
//!
//! let conf = CongestionConfig::default();
//! let mut cc = build_congestion_controller(&conf, Vec::new())?;
//! let ctx = ConnCtx::new(conf.segment_size, 0, conf.max_pacing_rate);
//!
//! let now = Instant::now();
//! cc.on_rtt_sample(now, Duration::from_millis(20));
//! let sample = RateSample {
//!     delivered: 14480,
//!     acked_sacked: 14480,
//!     interval: Duration::from_millis(20),
//!     delivery_rate: 724_000,
//!     prior_in_flight: 14480,
//!     rtt: Some(Duration::from_millis(20)),
//!     ..RateSample::default()
//! };
//! let out = cc.on_rate_sample(now, &sample, &ctx);
//! assert!(out.congestion_window >= cc.minimal_window());
//! # Ok::<(), l4s_cc::Error>(())
//! ```

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_with::serde_as;
use serde_with::DurationMilliSeconds;

/// Default segment size in bytes, an Ethernet MSS.
pub const DEFAULT_SEGMENT_SIZE: u64 = 1448;

/// Result type for congestion control operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Configurations about congestion control.
///
/// Window sizes are given in segments and converted to bytes with
/// `segment_size`. Durations are (de)serialized as integer milliseconds.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CongestionConfig {
    /// The congestion control algorithm. Default to `bbr`.
    pub algorithm: CongestionControlAlgorithm,

    /// Segment size in bytes. Default to `1448`.
    pub segment_size: u64,

    /// Initial congestion window in segments. Default to `10`.
    pub initial_cwnd: u64,

    /// Minimal congestion window (BBRMinPipeCwnd) in segments. Default to `4`.
    pub min_pipe_cwnd: u64,

    /// Upper limit of the pacing rate in bytes per second. Default to
    /// unlimited.
    pub max_pacing_rate: u64,

    /// The RTT used for the initial pacing rate before any RTT sample.
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub initial_rtt: Option<Duration>,

    /// Startup pacing and cwnd gain. Default to `2.89` (2/ln2).
    pub high_gain: f64,

    /// Length of the max bandwidth filter in rounds. Default to `10`.
    pub bw_window_length: u64,

    /// Length of the rt_prop min filter. Default to `10s`.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub rtt_window_length: Duration,

    /// Minimum interval between ProbeRTT states. Default to `10s`.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub probe_rtt_interval: Duration,

    /// Time to hold inflight at the ProbeRTT floor. Default to `200ms`.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub probe_rtt_duration: Duration,

    /// Maximum tolerated per-round loss rate. Default to `0.02`.
    pub loss_threshold: f64,

    /// Which in-flight volume the loss rate is measured against.
    pub loss_threshold_base: LossThresholdBase,

    /// React to ECN CE marks. Default to `true`.
    pub ecn_enabled: bool,

    /// Maximum tolerated per-round CE-marked fraction. Default to `0.5`.
    pub ecn_threshold: f64,

    /// Gain for re-probing after persistent ECN marks without loss. `0`
    /// disables re-probing. Default to `0`.
    pub ecn_reprobe_gain: f64,

    /// Multiplicative decrease on congestion. Default to `0.3`.
    pub beta: f64,

    /// Rounds without enough growth before the pipe is full. Default to `3`.
    pub full_bw_count: u64,

    /// Growth factor that counts as "still growing". Default to `1.25`.
    pub full_bw_threshold: f64,

    /// Loss events in a Startup recovery round to exit. Default to `8`.
    pub full_loss_count: u64,

    /// Consecutive high-CE rounds in Startup to exit. Default to `3`.
    pub full_ecn_count: u64,

    /// Upper bound of rounds between bandwidth probes. Default to `63`.
    pub bw_probe_max_rounds: u64,

    /// Random jitter of rounds between bandwidth probes. Default to `2`.
    pub bw_probe_rand_rounds: u64,

    /// Rounds spent in ProbeBW_REFILL. Default to `1`.
    pub refill_rounds: u64,

    /// Lower bound of the wall clock wait between probes. Default to `2s`.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub probe_wait_min: Duration,

    /// Upper bound of the wall clock wait between probes. Default to `3s`.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub probe_wait_max: Duration,

    /// Fraction of inflight_hi left free in ProbeBW_CRUISE. Default to `0.15`.
    pub inflight_headroom: f64,

    /// Pacing gain of ProbeBW_UP. Default to `1.25`.
    pub probe_up_pacing_gain: f64,

    /// Pacing gain of ProbeBW_DOWN. Default to `0.91`.
    pub probe_down_pacing_gain: f64,

    /// Steady state cwnd gain. Default to `2.0`.
    pub cwnd_gain: f64,

    /// Cwnd gain while refilling and probing up. Default to `2.25`.
    pub probe_up_cwnd_gain: f64,

    /// Discount applied to the pacing rate. Default to `0.01`.
    pub pacing_margin: f64,

    /// Upper limit of the send quantum in bytes. Default to `65536`.
    pub max_send_quantum: u64,

    /// Seed of the per-connection random stream. Random when unset.
    pub random_seed: Option<u64>,

    /// CUBIC constant C. Default to `0.4`.
    pub cubic_c: f64,

    /// CUBIC multiplicative decrease factor. Default to `0.7`.
    pub cubic_beta: f64,

    /// Enable CUBIC fast convergence. Default to `true`.
    pub cubic_fast_convergence: bool,
}

impl CongestionConfig {
    /// Load and validate a configuration from a JSON document. Missing fields
    /// take their default values.
    pub fn from_json(json: &str) -> Result<Self> {
        let conf: CongestionConfig = serde_json::from_str(json)?;
        conf.validate()?;
        Ok(conf)
    }

    /// Serialize the configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Set the congestion control algorithm by name, e.g. `"bbr"`.
    pub fn set_congestion_control_algorithm(&mut self, name: &str) -> Result<&mut Self> {
        self.algorithm = name.parse()?;
        Ok(self)
    }

    /// Initial congestion window in bytes.
    pub fn initial_cwnd_bytes(&self) -> u64 {
        self.initial_cwnd.saturating_mul(self.segment_size)
    }

    /// Minimal congestion window in bytes.
    pub fn min_pipe_cwnd_bytes(&self) -> u64 {
        self.min_pipe_cwnd.saturating_mul(self.segment_size)
    }

    /// Check every field. Out of range values are reported, never clamped.
    pub fn validate(&self) -> Result<()> {
        if self.segment_size == 0 {
            return Err(invalid("segment_size must be positive"));
        }
        if self.min_pipe_cwnd == 0 {
            return Err(invalid("min_pipe_cwnd must be positive"));
        }
        if self.initial_cwnd < self.min_pipe_cwnd {
            return Err(invalid("initial_cwnd must not be below min_pipe_cwnd"));
        }
        if self.max_pacing_rate == 0 {
            return Err(invalid("max_pacing_rate must be positive"));
        }

        // The floor must be deliverable within one rt_prop window at the
        // maximum rate, otherwise the window could never be honoured.
        let ceiling = (self.max_pacing_rate as f64 * self.rtt_window_length.as_secs_f64()) as u64;
        if self.min_pipe_cwnd_bytes() > ceiling {
            return Err(invalid(&format!(
                "min_pipe_cwnd {} bytes exceeds the ceiling {} bytes",
                self.min_pipe_cwnd_bytes(),
                ceiling
            )));
        }

        if matches!(self.initial_rtt, Some(rtt) if rtt.is_zero()) {
            return Err(invalid("initial_rtt must be positive"));
        }
        if !(self.high_gain > 1.0) {
            return Err(invalid("high_gain must be greater than 1"));
        }
        if self.bw_window_length == 0 {
            return Err(invalid("bw_window_length must be positive"));
        }
        if self.rtt_window_length.is_zero()
            || self.probe_rtt_interval.is_zero()
            || self.probe_rtt_duration.is_zero()
        {
            return Err(invalid("rtt windows and probe_rtt_duration must be positive"));
        }

        check_fraction("loss_threshold", self.loss_threshold, false)?;
        check_fraction("ecn_threshold", self.ecn_threshold, false)?;
        check_fraction("beta", self.beta, false)?;
        check_fraction("inflight_headroom", self.inflight_headroom, true)?;
        check_fraction("pacing_margin", self.pacing_margin, true)?;
        if self.beta >= 1.0 {
            return Err(invalid("beta must be below 1"));
        }
        if !(self.ecn_reprobe_gain >= 0.0) {
            return Err(invalid("ecn_reprobe_gain must not be negative"));
        }

        if self.full_bw_count == 0 {
            return Err(invalid("full_bw_count must be positive"));
        }
        if !(self.full_bw_threshold > 1.0) {
            return Err(invalid("full_bw_threshold must be greater than 1"));
        }
        if self.refill_rounds == 0 {
            return Err(invalid("refill_rounds must be positive"));
        }
        if self.probe_wait_min > self.probe_wait_max {
            return Err(invalid("probe_wait_min must not exceed probe_wait_max"));
        }

        if !(self.probe_up_pacing_gain > 1.0) {
            return Err(invalid("probe_up_pacing_gain must be greater than 1"));
        }
        if !(self.probe_down_pacing_gain > 0.0 && self.probe_down_pacing_gain < 1.0) {
            return Err(invalid("probe_down_pacing_gain must be in (0, 1)"));
        }
        if !(self.cwnd_gain >= 1.0) {
            return Err(invalid("cwnd_gain must be at least 1"));
        }
        if !(self.probe_up_cwnd_gain >= self.cwnd_gain) {
            return Err(invalid("probe_up_cwnd_gain must be at least cwnd_gain"));
        }
        if self.max_send_quantum < 2 * self.segment_size {
            return Err(invalid("max_send_quantum must hold two segments"));
        }

        if !(self.cubic_c > 0.0) {
            return Err(invalid("cubic_c must be positive"));
        }
        if !(self.cubic_beta > 0.0 && self.cubic_beta < 1.0) {
            return Err(invalid("cubic_beta must be in (0, 1)"));
        }

        Ok(())
    }
}

fn invalid(reason: &str) -> Error {
    Error::InvalidConfig(reason.into())
}

fn check_fraction(name: &str, v: f64, allow_zero: bool) -> Result<()> {
    let low_ok = if allow_zero { v >= 0.0 } else { v > 0.0 };
    if low_ok && v <= 1.0 {
        return Ok(());
    }
    Err(invalid(&format!("{} {} is not a fraction", name, v)))
}

impl Default for CongestionConfig {
    fn default() -> CongestionConfig {
        CongestionConfig {
            algorithm: CongestionControlAlgorithm::Bbr,
            segment_size: DEFAULT_SEGMENT_SIZE,
            initial_cwnd: 10,
            min_pipe_cwnd: 4,
            max_pacing_rate: u64::MAX,
            initial_rtt: None,
            high_gain: 2.89,
            bw_window_length: 10,
            rtt_window_length: Duration::from_secs(10),
            probe_rtt_interval: Duration::from_secs(10),
            probe_rtt_duration: Duration::from_millis(200),
            loss_threshold: 0.02,
            loss_threshold_base: LossThresholdBase::BytesInFlight,
            ecn_enabled: true,
            ecn_threshold: 0.5,
            ecn_reprobe_gain: 0.0,
            beta: 0.3,
            full_bw_count: 3,
            full_bw_threshold: 1.25,
            full_loss_count: 8,
            full_ecn_count: 3,
            bw_probe_max_rounds: 63,
            bw_probe_rand_rounds: 2,
            refill_rounds: 1,
            probe_wait_min: Duration::from_secs(2),
            probe_wait_max: Duration::from_secs(3),
            inflight_headroom: 0.15,
            probe_up_pacing_gain: 1.25,
            probe_down_pacing_gain: 0.91,
            cwnd_gain: 2.0,
            probe_up_cwnd_gain: 2.25,
            pacing_margin: 0.01,
            max_send_quantum: 64 * 1024,
            random_seed: None,
            cubic_c: 0.4,
            cubic_beta: 0.7,
            cubic_fast_convergence: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[ctor::ctor]
    fn init() {
        env_logger::builder()
            .filter_level(log::LevelFilter::Trace)
            .format_timestamp_millis()
            .is_test(true)
            .init();
    }

    #[test]
    fn default_config_is_valid() -> Result<()> {
        let conf = CongestionConfig::default();
        conf.validate()?;
        assert_eq!(conf.initial_cwnd_bytes(), 14480);
        assert_eq!(conf.min_pipe_cwnd_bytes(), 4 * 1448);
        Ok(())
    }

    #[test]
    fn config_from_json() -> Result<()> {
        let conf = CongestionConfig::from_json(
            r#"{
                "algorithm": "cubic",
                "ecn_threshold": 0.3,
                "probe_rtt_duration": 100,
                "loss_threshold_base": "prior_in_flight",
                "random_seed": 7
            }"#,
        )?;
        assert_eq!(conf.algorithm, CongestionControlAlgorithm::Cubic);
        assert_eq!(conf.ecn_threshold, 0.3);
        assert_eq!(conf.probe_rtt_duration, Duration::from_millis(100));
        assert_eq!(conf.loss_threshold_base, LossThresholdBase::PriorInFlight);
        assert_eq!(conf.random_seed, Some(7));
        // Untouched fields keep defaults.
        assert_eq!(conf.beta, 0.3);
        assert_eq!(conf.rtt_window_length, Duration::from_secs(10));

        let json = conf.to_json()?;
        assert_eq!(CongestionConfig::from_json(&json)?, conf);
        Ok(())
    }

    #[test]
    fn config_malformed_json() {
        let e = CongestionConfig::from_json("{\"beta\": \"high\"}").unwrap_err();
        assert!(e.is_config_error());
    }

    #[test]
    fn config_rejects_out_of_range() {
        let cases: Vec<(&str, Box<dyn Fn(&mut CongestionConfig)>)> = vec![
            ("segment_size", Box::new(|c| c.segment_size = 0)),
            ("min_pipe_cwnd", Box::new(|c| c.min_pipe_cwnd = 0)),
            ("initial_cwnd", Box::new(|c| c.initial_cwnd = 2)),
            ("high_gain", Box::new(|c| c.high_gain = 1.0)),
            ("loss_threshold", Box::new(|c| c.loss_threshold = 1.5)),
            ("ecn_threshold", Box::new(|c| c.ecn_threshold = -0.1)),
            ("ecn_threshold nan", Box::new(|c| c.ecn_threshold = f64::NAN)),
            ("beta", Box::new(|c| c.beta = 1.0)),
            ("inflight_headroom", Box::new(|c| c.inflight_headroom = 2.0)),
            ("full_bw_threshold", Box::new(|c| c.full_bw_threshold = 0.9)),
            ("full_bw_count", Box::new(|c| c.full_bw_count = 0)),
            ("bw_window_length", Box::new(|c| c.bw_window_length = 0)),
            (
                "probe_wait",
                Box::new(|c| c.probe_wait_min = Duration::from_secs(5)),
            ),
            ("probe_down", Box::new(|c| c.probe_down_pacing_gain = 1.0)),
            ("probe_up_cwnd", Box::new(|c| c.probe_up_cwnd_gain = 1.5)),
            ("max_send_quantum", Box::new(|c| c.max_send_quantum = 1000)),
            ("initial_rtt", Box::new(|c| c.initial_rtt = Some(Duration::ZERO))),
            ("cubic_beta", Box::new(|c| c.cubic_beta = 0.0)),
        ];

        for (name, mutate) in cases {
            let mut conf = CongestionConfig::default();
            mutate(&mut conf);
            match conf.validate() {
                Err(Error::InvalidConfig(_)) => (),
                other => panic!("{}: expected InvalidConfig, got {:?}", name, other),
            }
        }
    }

    #[test]
    fn config_rejects_unreachable_floor() {
        let mut conf = CongestionConfig::default();
        // 4 segments of 1448 bytes can not be delivered within 10s at 500B/s.
        conf.max_pacing_rate = 500;
        assert!(matches!(conf.validate(), Err(Error::InvalidConfig(_))));

        conf.max_pacing_rate = 1000;
        assert!(conf.validate().is_ok());
    }

    #[test]
    fn config_set_algorithm() -> Result<()> {
        let mut conf = CongestionConfig::default();
        conf.set_congestion_control_algorithm("CUBIC")?;
        assert_eq!(conf.algorithm, CongestionControlAlgorithm::Cubic);
        assert_eq!(
            conf.set_congestion_control_algorithm("reno").unwrap_err(),
            Error::InvalidConfig("unknown".into())
        );
        Ok(())
    }
}

pub use crate::congestion_control::build_congestion_controller;
pub use crate::congestion_control::AckInfo;
pub use crate::congestion_control::Bbr;
pub use crate::congestion_control::BbrConfig;
pub use crate::congestion_control::CongestionControlAlgorithm;
pub use crate::congestion_control::CongestionController;
pub use crate::congestion_control::CongestionEvent;
pub use crate::congestion_control::CongestionStats;
pub use crate::congestion_control::ConnCtx;
pub use crate::congestion_control::ControlOutput;
pub use crate::congestion_control::Cubic;
pub use crate::congestion_control::CubicConfig;
pub use crate::congestion_control::CyclePhase;
pub use crate::congestion_control::LossThresholdBase;
pub use crate::congestion_control::Mode;
pub use crate::congestion_control::PacketSnapshot;
pub use crate::congestion_control::RateSample;
pub use crate::congestion_control::RateSampler;
pub use crate::error::Error;
pub use crate::metrics::JsonSeqSink;
pub use crate::metrics::MemorySink;
pub use crate::metrics::MetricsEvent;
pub use crate::metrics::MetricsSink;

#[path = "congestion_control/congestion_control.rs"]
mod congestion_control;

pub mod error;
pub mod metrics;
