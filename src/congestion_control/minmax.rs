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

/*
 * Copyright 2017, Google Inc.
 *
 * Use of this source code is governed by the following BSD-style license:
 *
 * Redistribution and use in source and binary forms, with or without
 * modification, are permitted provided that the following conditions are
 * met:
 *
 *    * Redistributions of source code must retain the above copyright
 * notice, this list of conditions and the following disclaimer.
 *    * Redistributions in binary form must reproduce the above
 * copyright notice, this list of conditions and the following disclaimer
 * in the documentation and/or other materials provided with the
 * distribution.
 *
 *    * Neither the name of Google Inc. nor the names of its
 * contributors may be used to endorse or promote products derived from
 * this software without specific prior written permission.
 *
 * THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
 * "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
 * LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
 * A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
 * OWNER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
 * SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
 * LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
 * DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
 * THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
 * (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
 * OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
 */

//! A windowed max estimator keyed by packet-timed rounds, based on the
//! algorithm by Kathleen Nichols (lib/minmax.c).
//!
//! The filter keeps the best, 2nd best and 3rd best samples with the
//! invariant that the round of the n'th best is not before the n-1'th best,
//! and keeps the three samples spread across the window so that the error
//! stays bounded when the data is monotonic over the window. A new best
//! sample makes everything before it worthless, so the filter restarts on
//! it.

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
struct Sample {
    /// Round count of the sample.
    round: u64,

    value: u64,
}

/// Windowed max filter over `u64` samples.
#[derive(Debug, Clone)]
pub struct MinMax {
    /// Window length in rounds.
    window: u64,

    /// The best, second best and third best samples.
    samples: [Sample; 3],

    /// Whether any sample was taken since the last reset.
    initialized: bool,
}

impl MinMax {
    /// Create a windowed max filter, e.g. for the bottleneck bandwidth.
    pub fn new(window: u64) -> Self {
        Self {
            window,
            samples: [Sample::default(); 3],
            initialized: false,
        }
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    /// Forget all samples.
    pub fn clear(&mut self) {
        self.samples = [Sample::default(); 3];
        self.initialized = false;
    }

    /// Restart the filter on a single sample.
    pub fn reset(&mut self, round: u64, value: u64) {
        self.samples.fill(Sample { round, value });
        self.initialized = true;
    }

    /// Current extreme, or zero if the filter is empty.
    pub fn get(&self) -> u64 {
        if self.initialized {
            self.samples[0].value
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.initialized
    }

    /// Take a sample observed in `round` and return the current extreme.
    /// Samples from a round before the newest retained one are ignored.
    pub fn update(&mut self, round: u64, value: u64) -> u64 {
        if self.initialized && round < self.samples[2].round {
            return self.get();
        }

        let sample = Sample { round, value };

        if !self.initialized
            || value >= self.samples[0].value
            || round.saturating_sub(self.samples[2].round) > self.window
        {
            self.reset(round, value);
            return self.get();
        }

        if value >= self.samples[1].value {
            self.samples[2] = sample;
            self.samples[1] = sample;
        } else if value >= self.samples[2].value {
            self.samples[2] = sample;
        }

        self.expire(sample);
        self.get()
    }

    /// Age out the best samples as rounds advance.
    fn expire(&mut self, sample: Sample) {
        let dt = sample.round.saturating_sub(self.samples[0].round);

        if dt > self.window {
            // The best sample left the window, promote the others. The 2nd
            // best may be out of the window too.
            self.samples.rotate_left(1);
            self.samples[2] = sample;
            if sample.round.saturating_sub(self.samples[0].round) > self.window {
                self.samples.rotate_left(1);
                self.samples[2] = sample;
            }
        } else if self.samples[1].round == self.samples[0].round && dt > self.window / 4 {
            // A quarter of the window without a new 2nd choice.
            self.samples[2] = sample;
            self.samples[1] = sample;
        } else if self.samples[2].round == self.samples[1].round && dt > self.window / 2 {
            // Half the window without a new 3rd choice.
            self.samples[2] = sample;
        }
    }
}

impl Default for MinMax {
    fn default() -> Self {
        // 10 rounds, the BBR bandwidth filter length.
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_filter_keeps_peak_within_window() {
        let mut f = MinMax::new(10);
        assert!(f.is_empty());
        assert_eq!(f.get(), 0);

        assert_eq!(f.update(1, 100), 100);
        assert_eq!(f.update(2, 300), 300);
        for round in 3..=12 {
            assert_eq!(f.update(round, 200), 300);
        }

        // The peak of round 2 ages out after 10 rounds.
        assert_eq!(f.update(13, 150), 200);
    }

    #[test]
    fn max_filter_ignores_stale_rounds() {
        let mut f = MinMax::new(10);
        f.update(20, 150);
        f.update(23, 120);
        assert_eq!(f.update(21, 500), 150);
        assert_eq!(f.get(), 150);
    }

    #[test]
    fn max_filter_restarts_after_gap() {
        let mut f = MinMax::new(10);
        f.update(1, 200);
        // Nothing left in window.
        assert_eq!(f.update(20, 120), 120);

        f.clear();
        assert!(f.is_empty());
        assert_eq!(f.update(21, 100), 100);
    }

    #[test]
    fn max_filter_sub_windows() {
        let mut f = MinMax::default();
        assert_eq!(f.window(), 10);

        f.update(20, 150);
        // Within a quarter window nothing changes.
        f.update(22, 120);
        assert_eq!(f.samples[1].value, 150);
        f.update(23, 120);
        assert_eq!(f.samples[1].value, 120);
        f.update(26, 110);
        assert_eq!(f.samples[2].value, 110);
        f.update(29, 105);
        assert_eq!(f.get(), 150);

        // Round 20 expires, the 2nd best takes over.
        assert_eq!(f.update(31, 90), 120);
    }
}
