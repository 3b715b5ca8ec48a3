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

use criterion::black_box;
use criterion::criterion_group;
use criterion::criterion_main;
use criterion::Criterion;

use l4s_cc::build_congestion_controller;
use l4s_cc::AckInfo;
use l4s_cc::CongestionConfig;
use l4s_cc::CongestionController;
use l4s_cc::CongestionEvent;
use l4s_cc::ConnCtx;
use l4s_cc::RateSampler;

const SEGMENT: u64 = 1448;
const RTT: Duration = Duration::from_millis(20);
const PATH_RATE: u64 = 10_000_000;

/// A sender that puts one cwnd on a 10MB/s path per round and feeds the
/// acknowledgments through a rate sampler.
struct Path {
    sampler: RateSampler,
    now: Instant,
    delivered: u64,
    delivered_ce: u64,
    lost: u64,
    round: u64,
}

impl Path {
    fn new() -> Self {
        Path {
            sampler: RateSampler::new(),
            now: Instant::now(),
            delivered: 0,
            delivered_ce: 0,
            lost: 0,
            round: 0,
        }
    }

    /// One round, with a CE mark every 8th round and a loss every 64th.
    fn round(&mut self, cc: &mut dyn CongestionController) {
        self.round += 1;
        let flight = cc.congestion_window();
        let packet = self.sampler.on_packet_sent(self.now, 0, false);

        let serialization = Duration::from_micros(flight * 1_000_000 / PATH_RATE);
        self.now += serialization.max(RTT);
        self.delivered += flight;
        if self.round % 8 == 0 {
            self.delivered_ce += SEGMENT;
        }

        let rs = self.sampler.on_ack(&AckInfo {
            now: self.now,
            acked_bytes: flight,
            delivered: self.delivered,
            delivered_ce: self.delivered_ce,
            lost: self.lost,
            prior_in_flight: flight,
            packet,
        });
        let ctx = ConnCtx::new(SEGMENT, 0, u64::MAX);
        black_box(cc.on_rate_sample(self.now, &rs, &ctx));

        if self.round % 64 == 0 {
            self.lost += SEGMENT;
            let event = CongestionEvent::Loss {
                lost_bytes: SEGMENT,
            };
            black_box(cc.on_congestion_event(self.now, event, &ctx));
        }
    }
}

fn bench_algorithm(c: &mut Criterion, name: &str) {
    let mut conf = CongestionConfig::default();
    conf.random_seed = Some(1);
    if conf.set_congestion_control_algorithm(name).is_err() {
        return;
    }
    let mut cc = match build_congestion_controller(&conf, Vec::new()) {
        Ok(cc) => cc,
        Err(_) => return,
    };

    let mut path = Path::new();
    c.bench_function(&format!("{} on_rate_sample", name), |b| {
        b.iter(|| path.round(cc.as_mut()))
    });
}

pub fn bbr_rate_sample_benchmark(c: &mut Criterion) {
    bench_algorithm(c, "bbr");
}

pub fn cubic_rate_sample_benchmark(c: &mut Criterion) {
    bench_algorithm(c, "cubic");
}

criterion_group!(
    benches,
    bbr_rate_sample_benchmark,
    cubic_rate_sample_benchmark
);
criterion_main!(benches);
