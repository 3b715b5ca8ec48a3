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

//! Congestion controller metrics, modelled on the qlog recovery events of
//! draft-ietf-quic-qlog-quic-events.
//!
//! Controllers report events to the [`MetricsSink`]s they were built with.
//! The crate never opens files: [`JsonSeqSink`] streams JSON Text Sequences
//! (RFC 7464) to a writer provided by the host.

use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use log::*;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

/// A consumer of congestion controller metrics.
pub trait MetricsSink: Send + Sync {
    /// Called with the host time of the event.
    fn on_event(&self, now: Instant, data: &EventData);
}

/// Fans events out to the sinks of one controller.
#[derive(Clone, Default)]
pub(crate) struct MetricsEmitter {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl MetricsEmitter {
    pub(crate) fn new(sinks: Vec<Arc<dyn MetricsSink>>) -> Self {
        MetricsEmitter { sinks }
    }

    /// Whether any sink is attached. Callers skip building events otherwise.
    pub(crate) fn is_enabled(&self) -> bool {
        !self.sinks.is_empty()
    }

    pub(crate) fn emit(&self, now: Instant, data: EventData) {
        for sink in &self.sinks {
            sink.on_event(now, &data);
        }
    }
}

impl fmt::Debug for MetricsEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MetricsEmitter({} sinks)", self.sinks.len())
    }
}

/// A timestamped metrics event.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct MetricsEvent {
    /// Milliseconds since the sink was created.
    pub time: f32,

    #[serde(flatten)]
    pub data: EventData,
}

impl MetricsEvent {
    pub fn new(time: f32, data: EventData) -> Self {
        MetricsEvent { time, data }
    }
}

#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(tag = "name", content = "data")]
pub enum EventData {
    /// Emitted when the observable congestion control metrics change. RTTs
    /// are in milliseconds, rates in bytes per second.
    #[serde(rename = "recovery:metrics_updated")]
    RecoveryMetricsUpdated {
        min_rtt: Option<f32>,
        smoothed_rtt: Option<f32>,
        latest_rtt: Option<f32>,
        congestion_window: Option<u64>,
        bytes_in_flight: Option<u64>,
        ssthresh: Option<u64>,
        pacing_rate: Option<u64>,
        send_quantum: Option<u64>,
        bw_estimate: Option<u64>,
        inflight_hi: Option<u64>,
        inflight_lo: Option<u64>,
    },

    /// Emitted when the controller enters a new state, e.g. a BBR mode or
    /// ProbeBW phase, or recovery.
    #[serde(rename = "recovery:congestion_state_updated")]
    RecoveryCongestionStateUpdated {
        old: Option<String>,
        new: String,
        trigger: Option<CongestionStateUpdatedTrigger>,
    },
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum CongestionStateUpdatedTrigger {
    Loss,
    Ecn,
}

/// Relative time in milliseconds.
fn relative_time(start: Instant, now: Instant) -> f32 {
    now.saturating_duration_since(start).as_micros() as f32 / 1000.0
}

/// Writes events as JSON Text Sequences.
pub struct JsonSeqSink {
    /// The underlying writer.
    writer: Mutex<Box<dyn Write + Send>>,

    /// The origin of event times.
    start_time: Instant,
}

impl JsonSeqSink {
    pub fn new(writer: Box<dyn Write + Send>, start_time: Instant) -> Self {
        JsonSeqSink {
            writer: Mutex::new(writer),
            start_time,
        }
    }

    /// Write an event in JSON-SEQ format.
    pub fn write_event(&self, event: &MetricsEvent) -> Result<()> {
        let mut writer = match self.writer.lock() {
            Ok(w) => w,
            Err(_) => return Err(crate::Error::InvalidState("writer poisoned".into())),
        };

        writer.write_all(b"\x1e")?;
        serde_json::to_writer(writer.as_mut(), event)?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    /// Flush the underlying writer.
    pub fn flush(&self) -> Result<()> {
        match self.writer.lock() {
            Ok(mut w) => Ok(w.flush()?),
            Err(_) => Err(crate::Error::InvalidState("writer poisoned".into())),
        }
    }
}

impl MetricsSink for JsonSeqSink {
    fn on_event(&self, now: Instant, data: &EventData) {
        let event = MetricsEvent::new(relative_time(self.start_time, now), data.clone());
        if let Err(e) = self.write_event(&event) {
            warn!("metrics: drop event: {:?}", e);
        }
    }
}

/// Keeps events in memory, e.g. for tests and in-process analysis.
pub struct MemorySink {
    events: Mutex<Vec<MetricsEvent>>,
    start_time: Instant,
}

impl MemorySink {
    pub fn new(start_time: Instant) -> Self {
        MemorySink {
            events: Mutex::new(Vec::new()),
            start_time,
        }
    }

    /// Return a copy of the events received so far.
    pub fn events(&self) -> Vec<MetricsEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(_) => Vec::new(),
        }
    }
}

impl MetricsSink for MemorySink {
    fn on_event(&self, now: Instant, data: &EventData) {
        let event = MetricsEvent::new(relative_time(self.start_time, now), data.clone());
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(_) => warn!("metrics: memory sink poisoned"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn state_updated(old: &str, new: &str) -> EventData {
        EventData::RecoveryCongestionStateUpdated {
            old: Some(old.to_string()),
            new: new.to_string(),
            trigger: None,
        }
    }

    #[test]
    fn serialize_state_updated() -> Result<()> {
        let event = MetricsEvent::new(1.5, state_updated("Startup", "Drain"));
        let json = serde_json::to_string(&event)?;
        assert_eq!(
            json,
            r#"{"time":1.5,"name":"recovery:congestion_state_updated","data":{"old":"Startup","new":"Drain"}}"#
        );
        Ok(())
    }

    #[test]
    fn serialize_metrics_updated() -> Result<()> {
        let event = MetricsEvent::new(
            0.0,
            EventData::RecoveryMetricsUpdated {
                min_rtt: Some(20.0),
                smoothed_rtt: None,
                latest_rtt: None,
                congestion_window: Some(14480),
                bytes_in_flight: None,
                ssthresh: None,
                pacing_rate: Some(1_000_000),
                send_quantum: None,
                bw_estimate: None,
                inflight_hi: None,
                inflight_lo: None,
            },
        );
        let json = serde_json::to_string(&event)?;
        assert_eq!(
            json,
            r#"{"time":0.0,"name":"recovery:metrics_updated","data":{"min_rtt":20.0,"congestion_window":14480,"pacing_rate":1000000}}"#
        );
        Ok(())
    }

    #[test]
    fn json_seq_sink() -> Result<()> {
        let buf = SharedBuf::default();
        let start = Instant::now();
        let sink = JsonSeqSink::new(Box::new(buf.clone()), start);

        sink.on_event(start + Duration::from_millis(2), &state_updated("Up", "Down"));
        sink.on_event(start + Duration::from_millis(4), &state_updated("Down", "Cruise"));
        sink.flush()?;

        let out = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let records: Vec<&str> = out.split_terminator('\n').collect();
        assert_eq!(records.len(), 2);
        for r in &records {
            assert!(r.starts_with('\x1e'));
        }

        let event: MetricsEvent = serde_json::from_str(&records[1][1..])?;
        assert_eq!(event.time, 4.0);
        assert_eq!(event.data, state_updated("Down", "Cruise"));
        Ok(())
    }

    #[test]
    fn memory_sink() {
        let start = Instant::now();
        let sink = MemorySink::new(start);
        assert!(sink.events().is_empty());

        sink.on_event(start, &state_updated("Drain", "ProbeBW"));
        sink.on_event(start + Duration::from_secs(1), &state_updated("ProbeBW", "ProbeRTT"));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].time, 0.0);
        assert_eq!(events[1].time, 1000.0);
    }

    #[test]
    fn emitter_fans_out() {
        let start = Instant::now();
        assert!(!MetricsEmitter::default().is_enabled());

        let a = Arc::new(MemorySink::new(start));
        let b = Arc::new(MemorySink::new(start));
        let emitter = MetricsEmitter::new(vec![a.clone(), b.clone()]);
        assert!(emitter.is_enabled());
        assert_eq!(format!("{:?}", emitter), "MetricsEmitter(2 sinks)");

        emitter.emit(start, state_updated("Startup", "Drain"));
        assert_eq!(a.events(), b.events());
        assert_eq!(a.events().len(), 1);
    }
}
