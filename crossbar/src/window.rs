// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use itertools::Itertools;

use crate::config::SchedulerConfiguration;
use crate::ports::{InputPort, OutputPort, Proposal};
use crate::{Cycle, Error, PortId, Slot};

/// One cell arriving at `input` destined for `output`. Entries with an
/// out-of-range id are skipped on injection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Arrival {
    pub input: PortId,
    pub output: PortId,
}

/// The matching graduated in one cycle: `matching[output]` names the input
/// crossed to that output, `matching_size` counts the matched pairs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchingResult {
    pub matching: Vec<Option<PortId>>,
    pub matching_size: usize,
}

impl MatchingResult {
    pub fn empty(ports: usize) -> Self {
        Self {
            matching: vec![None; ports],
            matching_size: 0,
        }
    }
}

/// Running counters of the sliding-window scheduler.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WindowStats {
    pub ticks: u64,
    pub iterations: u64,
    pub matched_pairs: u64,
    pub cells_admitted: u64,
    pub cells_departed: u64,
}

impl WindowStats {
    pub fn average_matching_size(&self) -> f64 {
        if self.ticks == 0 {
            0.0
        } else {
            self.matched_pairs as f64 / self.ticks as f64
        }
    }
}

/// The sliding-window scheduler: N queue-proportional proposers, N
/// first-fit acceptors, and a window of future slots that advances by one
/// per tick.
///
/// The manager owns both port arrays and mediates every exchange through
/// `Proposal`/`Accept` records, so neither side holds a reference to the
/// other. One tick is ARRIVALS, then up to `iterations_per_tick`
/// propose/accept passes, then GRADUATE; the graduated matching is the
/// tick's output.
pub struct SlidingWindow {
    config: SchedulerConfiguration,
    inputs: Vec<InputPort>,
    outputs: Vec<OutputPort>,
    frame_slot: Slot,
    ticks: Cycle,
    stats: WindowStats,
}

impl SlidingWindow {
    pub fn new(config: SchedulerConfiguration) -> Result<Self, Error> {
        config.validate()?;
        let inputs = (0..config.ports)
            .map(|id| {
                InputPort::new(
                    id,
                    config.ports,
                    config.window_depth,
                    config.max_voq_len,
                    config.seed,
                )
            })
            .collect();
        let outputs = (0..config.ports)
            .map(|id| OutputPort::new(id, config.window_depth))
            .collect();
        Ok(Self {
            config,
            inputs,
            outputs,
            frame_slot: 0,
            ticks: 0,
            stats: WindowStats::default(),
        })
    }

    pub fn config(&self) -> &SchedulerConfiguration {
        &self.config
    }

    /// Reinitialize VOQs, calendars, bitmaps, counters, and reseed every
    /// proposer LFSR. Idempotent.
    pub fn reset(&mut self) {
        for input in &mut self.inputs {
            input.reset();
        }
        for output in &mut self.outputs {
            output.reset();
        }
        self.frame_slot = 0;
        self.ticks = 0;
        self.stats = WindowStats::default();
    }

    /// Apply a batch of arrivals. Records with an id outside [0, N) are
    /// skipped; admission saturates at the per-VOQ cap.
    pub fn inject(&mut self, arrivals: &[Arrival]) {
        for arrival in arrivals {
            if arrival.input >= self.config.ports || arrival.output >= self.config.ports {
                log::trace!(
                    "skipping arrival with invalid port pair ({}, {})",
                    arrival.input,
                    arrival.output
                );
                continue;
            }
            let admitted = self.inputs[arrival.input].enqueue(arrival.output, 1);
            self.stats.cells_admitted += admitted as u64;
        }
    }

    /// One propose/accept pass. All proposals are generated against the VOQ
    /// state at the start of the pass; every accept triggers its virtual
    /// departure before the next pass runs.
    pub fn run_iteration(&mut self) {
        let proposals: Vec<Proposal> = self
            .inputs
            .iter_mut()
            .filter_map(|input| input.generate_proposal())
            .collect();
        // Each input emits at most one proposal, so the buckets never hand
        // two accepts to one input.
        let buckets = proposals
            .into_iter()
            .map(|proposal| (proposal.output, proposal))
            .into_group_map();
        for (output, mut bucket) in buckets {
            if let Some(accept) =
                self.outputs[output].process_proposals(&mut bucket, self.config.knockout)
            {
                self.inputs[accept.input].apply_accept(&accept);
                self.stats.cells_departed += 1;
            }
        }
        self.stats.iterations += 1;
        self.frame_slot = (self.frame_slot + 1) % self.config.window_depth;
    }

    /// Advance the window by one slot: every output pops its senior entry
    /// into the result, every port shifts, and a fresh junior slot opens.
    /// VOQs are untouched; the graduated cells departed at accept time.
    pub fn graduate(&mut self) -> MatchingResult {
        let mut result = MatchingResult::empty(self.config.ports);
        for (output, port) in self.outputs.iter_mut().enumerate() {
            if let Some(input) = port.graduate() {
                result.matching[output] = Some(input);
                result.matching_size += 1;
                self.stats.matched_pairs += 1;
            }
        }
        for input in &mut self.inputs {
            input.graduate();
        }
        self.ticks += 1;
        self.stats.ticks += 1;
        log::debug!(
            "tick {}: graduated matching of size {}",
            self.ticks,
            result.matching_size
        );
        result
    }

    /// One full cycle: arrivals, `iterations_per_tick` passes, graduation.
    pub fn tick(&mut self, arrivals: &[Arrival]) -> MatchingResult {
        self.inject(arrivals);
        for _ in 0..self.config.iterations_per_tick {
            self.run_iteration();
        }
        self.graduate()
    }

    /// True iff no VOQ has ever saturated and none currently exceeds half
    /// its capacity.
    pub fn is_stable(&self) -> bool {
        self.inputs.iter().all(|input| {
            !input.voq().overloaded() && input.voq().max_length() <= self.config.max_voq_len / 2
        })
    }

    pub fn stats(&self) -> &WindowStats {
        &self.stats
    }

    pub fn ticks(&self) -> Cycle {
        self.ticks
    }

    pub fn frame_slot(&self) -> Slot {
        self.frame_slot
    }

    pub fn voq_length(&self, input: PortId, output: PortId) -> u32 {
        if input < self.config.ports {
            self.inputs[input].voq().length(output)
        } else {
            0
        }
    }

    /// Total cells queued across every input.
    pub fn backlog(&self) -> u64 {
        self.inputs
            .iter()
            .map(|input| input.voq().total() as u64)
            .sum()
    }

    // Observation accessors for monitors and tests.
    pub fn input(&self, id: PortId) -> &InputPort {
        &self.inputs[id]
    }

    pub fn output(&self, id: PortId) -> &OutputPort {
        &self.outputs[id]
    }
}
