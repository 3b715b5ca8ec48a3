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

use core::str::FromStr;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

use crate::metrics::MetricsSink;
use crate::CongestionConfig;
use crate::Error;
use crate::Result;
pub use bbr::Bbr;
pub use bbr::BbrConfig;
pub use bbr::CyclePhase;
pub use bbr::Mode;
pub use cubic::Cubic;
pub use cubic::CubicConfig;
pub use rate_sample::AckInfo;
pub use rate_sample::PacketSnapshot;
pub use rate_sample::RateSample;
pub use rate_sample::RateSampler;

/// Available congestion control algorithm
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CongestionControlAlgorithm {
    /// BBR uses recent measurements of a transport connection's delivery rate,
    /// round-trip time, packet loss rate and ECN marks to build an explicit
    /// model of the network path. The model is then used to control data
    /// transmission speed and the maximum volume of data allowed in flight.
    #[default]
    Bbr,

    /// CUBIC uses a cubic function instead of a linear window increase function
    /// of the current TCP standards to improve scalability and stability under
    /// fast and long-distance networks. It is the loss-based comparison sender.
    Cubic,
}

impl FromStr for CongestionControlAlgorithm {
    type Err = Error;

    fn from_str(algor: &str) -> Result<CongestionControlAlgorithm> {
        if algor.eq_ignore_ascii_case("bbr") {
            Ok(CongestionControlAlgorithm::Bbr)
        } else if algor.eq_ignore_ascii_case("cubic") {
            Ok(CongestionControlAlgorithm::Cubic)
        } else {
            Err(Error::InvalidConfig("unknown".into()))
        }
    }
}

/// The in-flight volume that the per-round loss rate is measured against
/// when deciding whether inflight is too high.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossThresholdBase {
    /// Bytes in flight at the time the sample is processed.
    #[default]
    BytesInFlight,

    /// Bytes in flight before the acknowledged data was delivered, i.e. the
    /// volume the probe actually put on the path.
    PriorInFlight,
}

/// Read-only connection state passed with every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnCtx {
    /// Current segment size in bytes.
    pub segment_size: u64,

    /// Current bytes in flight.
    pub bytes_in_flight: u64,

    /// Upper limit of the pacing rate in bytes per second.
    pub max_pacing_rate: u64,
}

impl ConnCtx {
    pub fn new(segment_size: u64, bytes_in_flight: u64, max_pacing_rate: u64) -> Self {
        Self {
            segment_size,
            bytes_in_flight,
            max_pacing_rate,
        }
    }

    /// Return a copy with the given bytes in flight.
    pub fn with_bytes_in_flight(&self, bytes_in_flight: u64) -> Self {
        Self {
            bytes_in_flight,
            ..*self
        }
    }
}

impl Default for ConnCtx {
    fn default() -> Self {
        Self {
            segment_size: crate::DEFAULT_SEGMENT_SIZE,
            bytes_in_flight: 0,
            max_pacing_rate: u64::MAX,
        }
    }
}

/// Congestion signals raised by the transport outside of rate samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionEvent {
    /// Loss detection declared `lost_bytes` lost.
    Loss { lost_bytes: u64 },

    /// The peer echoed CE marks for `ce_bytes`.
    EcnCe { ce_bytes: u64 },

    /// The transport entered fast recovery.
    RecoveryEnter,

    /// The transport left fast recovery.
    RecoveryExit,

    /// The transport restarts sending after an idle period.
    CwndRestart,
}

/// Control parameters handed back to the transport after every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlOutput {
    /// Congestion window in bytes.
    pub congestion_window: u64,

    /// Pacing rate in bytes per second.
    pub pacing_rate: u64,

    /// Maximum size of a burst scheduled at once, in bytes.
    pub send_quantum: u64,

    /// Slow start threshold in bytes, reported on loss.
    pub slow_start_thresh: Option<u64>,
}

/// Congestion control statistics.
#[derive(Debug, Default, Clone)]
pub struct CongestionStats {
    /// Bytes in flight.
    pub bytes_in_flight: u64,

    /// Total bytes acked in slow start.
    pub bytes_acked_in_slow_start: u64,

    /// Total bytes acked.
    pub bytes_acked_in_total: u64,

    /// Total bytes lost.
    pub bytes_lost_in_total: u64,

    /// Total bytes delivered with a CE mark.
    pub bytes_ce_in_total: u64,

    /// Number of rate samples processed.
    pub rate_samples: u64,

    /// Number of loss events.
    pub loss_events: u64,

    /// Number of ECN CE events.
    pub ecn_events: u64,

    /// Number of times inflight was judged too high.
    pub inflight_too_high_count: u64,

    /// Number of ProbeRTT visits.
    pub probe_rtt_count: u64,

    /// Number of recovery episodes.
    pub recovery_count: u64,
}

/// Congestion control interfaces shared by different algorithms.
///
/// All methods are driven by the host's event loop. `now` is the host clock,
/// which may be simulated; the controller never reads the system time.
pub trait CongestionController: Send {
    /// Name of congestion control algorithm.
    fn name(&self) -> &str;

    /// Reset the controller for a connection entering its active phase.
    fn init(&mut self, ctx: &ConnCtx);

    /// Process one rate sample, produced once per acknowledgment batch.
    fn on_rate_sample(&mut self, now: Instant, sample: &RateSample, ctx: &ConnCtx)
        -> ControlOutput;

    /// Process a fresh round-trip measurement.
    fn on_rtt_sample(&mut self, _now: Instant, _rtt: Duration) {}

    /// Process a congestion signal raised outside of rate samples.
    fn on_congestion_event(
        &mut self,
        now: Instant,
        event: CongestionEvent,
        ctx: &ConnCtx,
    ) -> ControlOutput;

    /// Periodic evaluation of time based transitions.
    fn on_timer(&mut self, _now: Instant, _ctx: &ConnCtx) -> ControlOutput {
        self.output()
    }

    /// Check if in slow start.
    fn in_slow_start(&self) -> bool {
        false
    }

    /// Check if in recovery mode.
    fn in_recovery(&self) -> bool {
        false
    }

    /// Current congestion window.
    fn congestion_window(&self) -> u64;

    /// Current pacing rate in bytes per second.
    fn pacing_rate(&self) -> u64;

    /// Current send quantum in bytes.
    fn send_quantum(&self) -> u64;

    /// Current slow start threshold in bytes.
    fn slow_start_thresh(&self) -> u64 {
        u64::MAX
    }

    /// Initial congestion window.
    fn initial_window(&self) -> u64;

    /// Minimal congestion window.
    fn minimal_window(&self) -> u64;

    /// Congestion stats.
    fn stats(&self) -> &CongestionStats;

    /// Current control parameters.
    fn output(&self) -> ControlOutput {
        ControlOutput {
            congestion_window: self.congestion_window(),
            pacing_rate: self.pacing_rate(),
            send_quantum: self.send_quantum(),
            slow_start_thresh: None,
        }
    }

    /// Duplicate the controller, e.g. for a forked connection. Per-round
    /// transient signals are not carried over.
    fn fork(&self) -> Box<dyn CongestionController>;
}

impl fmt::Debug for dyn CongestionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "congestion controller {}.", self.name())
    }
}

/// Whether `duration` has passed since `since`. An unset `since` or an
/// unrepresentable deadline never elapses.
pub(crate) fn has_elapsed(since: Option<Instant>, duration: Duration, now: Instant) -> bool {
    match since.and_then(|since| since.checked_add(duration)) {
        Some(deadline) => now > deadline,
        None => false,
    }
}

/// Build a congestion controller.
pub fn build_congestion_controller(
    conf: &CongestionConfig,
    sinks: Vec<Arc<dyn MetricsSink>>,
) -> Result<Box<dyn CongestionController>> {
    let controller: Box<dyn CongestionController> = match conf.algorithm {
        CongestionControlAlgorithm::Bbr => Box::new(Bbr::new(BbrConfig::try_from(conf)?, sinks)),
        CongestionControlAlgorithm::Cubic => {
            Box::new(Cubic::new(CubicConfig::try_from(conf)?, sinks))
        }
    };

    log::debug!("built congestion controller {}", controller.name());
    Ok(controller)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn congestion_control_name() {
        let cases = [
            ("bbr", Ok(CongestionControlAlgorithm::Bbr)),
            ("Bbr", Ok(CongestionControlAlgorithm::Bbr)),
            ("BBR", Ok(CongestionControlAlgorithm::Bbr)),
            ("cubic", Ok(CongestionControlAlgorithm::Cubic)),
            ("Cubic", Ok(CongestionControlAlgorithm::Cubic)),
            ("CUBIC", Ok(CongestionControlAlgorithm::Cubic)),
            ("cubci", Err(Error::InvalidConfig("unknown".into()))),
            ("prague", Err(Error::InvalidConfig("unknown".into()))),
        ];

        for (name, algor) in cases {
            assert_eq!(CongestionControlAlgorithm::from_str(name), algor);
        }
    }

    #[test]
    fn build_by_algorithm() -> Result<()> {
        let mut conf = CongestionConfig::default();
        let cc = build_congestion_controller(&conf, Vec::new())?;
        assert_eq!(cc.name(), "BBR");
        assert_eq!(cc.initial_window(), conf.initial_cwnd_bytes());
        assert_eq!(cc.minimal_window(), conf.min_pipe_cwnd_bytes());
        assert!(cc.in_slow_start());

        conf.algorithm = CongestionControlAlgorithm::Cubic;
        let cc = build_congestion_controller(&conf, Vec::new())?;
        assert_eq!(cc.name(), "CUBIC");
        assert_eq!(format!("{:?}", cc), "congestion controller CUBIC.");
        Ok(())
    }

    #[test]
    fn timer_without_transitions() -> Result<()> {
        let conf = CongestionConfig {
            algorithm: CongestionControlAlgorithm::Cubic,
            ..CongestionConfig::default()
        };
        let mut cc = build_congestion_controller(&conf, Vec::new())?;
        let ctx = ConnCtx::default();
        cc.init(&ctx);

        let before = cc.output();
        let out = cc.on_timer(Instant::now() + Duration::from_secs(5), &ctx);
        assert_eq!(out, before);
        Ok(())
    }

    #[test]
    fn build_rejects_invalid_config() {
        let conf = CongestionConfig {
            ecn_threshold: 1.5,
            ..CongestionConfig::default()
        };
        assert!(matches!(
            build_congestion_controller(&conf, Vec::new()),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn elapsed() {
        let now = Instant::now();
        let d = Duration::from_millis(200);
        assert!(!has_elapsed(None, d, now + d * 10));
        assert!(!has_elapsed(Some(now), d, now + d));
        assert!(has_elapsed(Some(now), d, now + d + Duration::from_micros(1)));
    }

    #[test]
    fn conn_ctx() {
        let ctx = ConnCtx::default();
        assert_eq!(ctx.segment_size, crate::DEFAULT_SEGMENT_SIZE);
        let ctx = ctx.with_bytes_in_flight(3000);
        assert_eq!(ctx.bytes_in_flight, 3000);
        assert_eq!(ctx.max_pacing_rate, u64::MAX);
    }
}

#[path = "bbr/bbr.rs"]
mod bbr;

mod cubic;
mod minmax;
mod rate_sample;
mod rtt;
