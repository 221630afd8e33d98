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

use bitvec::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_pcg::Pcg64;

use crate::config::FrameBatchConfiguration;
use crate::util::Lfsr;
use crate::voq::VoqRegistry;
use crate::window::{Arrival, MatchingResult};
use crate::{Error, PortId, Slot};

/// Running counters of the frame batch engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameBatchStats {
    pub frames: u64,
    pub cells_admitted: u64,
    pub cells_scheduled: u64,
    pub max_voq_len: u32,
    /// sticky: a post-optimization pass left cells unplaced.
    pub residual: bool,
}

/// An input's bid for one output within the current frame slot.
#[derive(Clone, Copy, Debug)]
struct Bid {
    input: PortId,
    voq_len: u32,
}

/// Small-batch scheduler: an entire frame of slots is computed coherently,
/// one queue-proportional propose/accept pass per slot, then a
/// post-optimization pass colors the residual cells into whatever
/// (input, output) slot holes remain.
///
/// The acceptor rule is half-half: the first half of the frame books only
/// the top-ranked bid per output; in the second half the runner-up is
/// backfilled into the earliest prior slot where both ports are still free.
/// Completed frames are emitted one slot per `step` while the next frame is
/// being scheduled.
pub struct FrameBatchEngine {
    config: FrameBatchConfiguration,
    /// current frame length; adaptive growth persists into later frames.
    frame_len: usize,
    voqs: Vec<VoqRegistry>,
    /// bit f set iff the port is booked in slot f of the current frame.
    flag_in: Vec<BitVec>,
    flag_out: Vec<BitVec>,
    /// the frame being scheduled: `schedule[slot][input]` names the output.
    schedule: Vec<Vec<Option<PortId>>>,
    /// the completed frame being drained.
    emit: Vec<Vec<Option<PortId>>>,
    emit_slot: Slot,
    /// per-edge resume point for the coloring scans.
    cursor: Vec<Vec<Slot>>,
    slot: Slot,
    rngs: Vec<Lfsr>,
    shuffle_rng: Pcg64,
    stats: FrameBatchStats,
}

impl FrameBatchEngine {
    pub fn new(config: FrameBatchConfiguration) -> Result<Self, Error> {
        config.validate()?;
        let ports = config.ports;
        let frame_len = config.frame_size;
        Ok(Self {
            config,
            frame_len,
            voqs: (0..ports)
                .map(|_| VoqRegistry::new(ports, config.max_voq_len))
                .collect(),
            flag_in: (0..ports).map(|_| BitVec::repeat(false, frame_len)).collect(),
            flag_out: (0..ports).map(|_| BitVec::repeat(false, frame_len)).collect(),
            schedule: vec![vec![None; ports]; frame_len],
            emit: Vec::new(),
            emit_slot: 0,
            cursor: vec![vec![0; ports]; ports],
            slot: 0,
            rngs: (0..ports)
                .map(|id| Lfsr::new(config.seed ^ id as u32))
                .collect(),
            shuffle_rng: Pcg64::seed_from_u64(config.seed as u64),
            stats: FrameBatchStats::default(),
        })
    }

    pub fn config(&self) -> &FrameBatchConfiguration {
        &self.config
    }

    pub fn stats(&self) -> &FrameBatchStats {
        &self.stats
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn voq_length(&self, input: PortId, output: PortId) -> u32 {
        if input < self.config.ports {
            self.voqs[input].length(output)
        } else {
            0
        }
    }

    pub fn backlog(&self) -> u64 {
        self.voqs.iter().map(|voq| voq.total() as u64).sum()
    }

    pub fn is_stable(&self) -> bool {
        self.voqs
            .iter()
            .all(|voq| !voq.overloaded() && voq.max_length() <= self.config.max_voq_len / 2)
    }

    /// One slot time: emit the previous frame's slot, admit arrivals, run
    /// the current slot's propose/accept pass, and close the frame at the
    /// boundary. The first frame has nothing to emit yet.
    pub fn step(&mut self, arrivals: &[Arrival]) -> MatchingResult {
        let result = self.pop_emitted();
        self.admit(arrivals);
        self.schedule_slot();
        self.slot += 1;
        if self.slot == self.frame_len {
            self.finish_frame();
        }
        result
    }

    /// Restore the engine to its initial state, including the base frame
    /// size and all random-number generators. Idempotent.
    pub fn reset(&mut self) {
        let ports = self.config.ports;
        self.frame_len = self.config.frame_size;
        for voq in &mut self.voqs {
            voq.reset();
        }
        self.flag_in = (0..ports)
            .map(|_| BitVec::repeat(false, self.frame_len))
            .collect();
        self.flag_out = (0..ports)
            .map(|_| BitVec::repeat(false, self.frame_len))
            .collect();
        self.schedule = vec![vec![None; ports]; self.frame_len];
        self.emit = Vec::new();
        self.emit_slot = 0;
        self.slot = 0;
        for row in &mut self.cursor {
            row.fill(0);
        }
        self.rngs = (0..ports)
            .map(|id| Lfsr::new(self.config.seed ^ id as u32))
            .collect();
        self.shuffle_rng = Pcg64::seed_from_u64(self.config.seed as u64);
        self.stats = FrameBatchStats::default();
    }

    fn pop_emitted(&mut self) -> MatchingResult {
        let ports = self.config.ports;
        let mut result = MatchingResult::empty(ports);
        if self.emit.is_empty() {
            return result;
        }
        debug_assert!(self.emit_slot < self.emit.len());
        for (input, entry) in self.emit[self.emit_slot].iter().enumerate() {
            if let Some(output) = entry {
                debug_assert!(result.matching[*output].is_none());
                result.matching[*output] = Some(input);
                result.matching_size += 1;
            }
        }
        self.emit_slot += 1;
        result
    }

    fn admit(&mut self, arrivals: &[Arrival]) {
        for arrival in arrivals {
            if arrival.input >= self.config.ports || arrival.output >= self.config.ports {
                log::trace!(
                    "skipping arrival with invalid port pair ({}, {})",
                    arrival.input,
                    arrival.output
                );
                continue;
            }
            let admitted = self.voqs[arrival.input].add(arrival.output, 1);
            self.stats.cells_admitted += admitted as u64;
            let length = self.voqs[arrival.input].length(arrival.output);
            self.stats.max_voq_len = self.stats.max_voq_len.max(length);
        }
    }

    /// One QPS-1 pass for the current slot. Every backlogged input samples
    /// one output; each output ranks its bids by VOQ length and books the
    /// winner into the current slot. In the second half of the frame the
    /// runner-up is salvaged into an earlier hole, and with the
    /// retry-previous option the remaining losers attempt the same.
    fn schedule_slot(&mut self) {
        let ports = self.config.ports;
        let mut buckets: Vec<Vec<Bid>> = vec![Vec::new(); ports];
        for input in 0..ports {
            if self.voqs[input].total() == 0 {
                continue;
            }
            let r = self.rngs[input].step();
            if let Some(output) = self.voqs[input].sample(r) {
                buckets[output].push(Bid {
                    input,
                    voq_len: self.voqs[input].length(output),
                });
            }
        }
        let second_half = self.slot + 1 > self.frame_len / 2;
        for (output, mut bucket) in buckets.into_iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            bucket.sort_by(|a, b| b.voq_len.cmp(&a.voq_len).then_with(|| a.input.cmp(&b.input)));
            self.place(self.slot, bucket[0].input, output);
            let mut losers = 1;
            if second_half && bucket.len() > 1 {
                let secondary = bucket[1].input;
                losers = 2;
                if let Some(slot) = self.backfill_slot(secondary, output) {
                    self.place(slot, secondary, output);
                } else if self.config.retry_previous {
                    self.retry_previous(secondary, output);
                }
            }
            if self.config.retry_previous {
                for bid in &bucket[losers..] {
                    self.retry_previous(bid.input, output);
                }
            }
        }
    }

    /// Earliest slot before the current one that is free on both sides.
    fn backfill_slot(&self, input: PortId, output: PortId) -> Option<Slot> {
        (0..self.slot).find(|&slot| !self.flag_in[input][slot] && !self.flag_out[output][slot])
    }

    /// Coloring scan for a losing bid, restricted to slots strictly earlier
    /// than the current one. Resumes from the per-edge cursor; booked flags
    /// never clear within a frame, so on failure the cursor may skip the
    /// whole scanned range.
    fn retry_previous(&mut self, input: PortId, output: PortId) {
        let limit = self.slot;
        let start = self.cursor[input][output];
        if start >= limit {
            return;
        }
        for slot in start..limit {
            if !self.flag_in[input][slot] && !self.flag_out[output][slot] {
                self.place(slot, input, output);
                self.cursor[input][output] = slot + 1;
                return;
            }
        }
        self.cursor[input][output] = limit;
    }

    /// Book (input, output) into `slot`: schedule entry, both match flags,
    /// and the cell leaves the VOQ immediately.
    fn place(&mut self, slot: Slot, input: PortId, output: PortId) {
        debug_assert!(self.schedule[slot][input].is_none());
        debug_assert!(!self.flag_in[input][slot] && !self.flag_out[output][slot]);
        debug_assert!(self.voqs[input].length(output) > 0);
        self.schedule[slot][input] = Some(output);
        self.flag_in[input].set(slot, true);
        self.flag_out[output].set(slot, true);
        self.voqs[input].remove(output);
        self.stats.cells_scheduled += 1;
    }

    /// Serve the cells the per-slot passes missed: enumerate them, shuffle,
    /// and first-fit each into a slot where both ports are free, resuming
    /// from the per-edge cursor. Adaptive frames grow by one block when the
    /// scan runs off the end; otherwise the cell stays queued for the next
    /// frame and the sticky residual flag is raised.
    fn post_optimize(&mut self) {
        let ports = self.config.ports;
        let mut residuals: Vec<(PortId, PortId)> = Vec::new();
        for input in 0..ports {
            for output in 0..ports {
                for _ in 0..self.voqs[input].length(output) {
                    residuals.push((input, output));
                }
            }
        }
        if residuals.is_empty() {
            return;
        }
        residuals.shuffle(&mut self.shuffle_rng);
        for (input, output) in residuals {
            let mut slot = self.cursor[input][output];
            let placed = loop {
                if slot >= self.schedule.len() {
                    if !self.config.adaptive_frame {
                        break false;
                    }
                    self.grow_frame();
                }
                if !self.flag_in[input][slot] && !self.flag_out[output][slot] {
                    self.place(slot, input, output);
                    self.cursor[input][output] = slot + 1;
                    break true;
                }
                slot += 1;
            };
            if !placed {
                self.cursor[input][output] = self.schedule.len();
                if !self.stats.residual {
                    log::warn!("coloring pass left residual cells; carrying to the next frame");
                }
                self.stats.residual = true;
            }
        }
    }

    fn grow_frame(&mut self) {
        let grown = self.schedule.len() + self.config.frame_size_block;
        log::warn!("extending frame to {} slots", grown);
        self.schedule.resize(grown, vec![None; self.config.ports]);
        for flags in self.flag_in.iter_mut().chain(self.flag_out.iter_mut()) {
            flags.resize(grown, false);
        }
    }

    /// Frame boundary: color the residuals, swap the finished frame into the
    /// emit buffer, and start a fresh one. A grown frame length carries
    /// forward.
    fn finish_frame(&mut self) {
        self.post_optimize();
        self.stats.frames += 1;
        debug_assert!(self.emit.is_empty() || self.emit_slot == self.emit.len());
        self.frame_len = self.schedule.len();
        self.emit = std::mem::replace(
            &mut self.schedule,
            vec![vec![None; self.config.ports]; self.frame_len],
        );
        self.emit_slot = 0;
        self.slot = 0;
        for flags in self.flag_in.iter_mut().chain(self.flag_out.iter_mut()) {
            flags.fill(false);
            flags.resize(self.frame_len, false);
        }
        for row in &mut self.cursor {
            row.fill(0);
        }
    }
}

#[cfg(test)]
mod batch_tests {
    use super::*;

    fn small_config() -> FrameBatchConfiguration {
        FrameBatchConfiguration {
            ports: 4,
            frame_size: 4,
            frame_size_block: 4,
            seed: 7,
            ..Default::default()
        }
    }

    fn run_frame(engine: &mut FrameBatchEngine, arrivals: &[Arrival]) -> Vec<MatchingResult> {
        let mut results = vec![engine.step(arrivals)];
        while engine.slot() != 0 {
            results.push(engine.step(&[]));
        }
        results
    }

    #[test]
    fn test_first_frame_emits_nothing() {
        let mut engine = FrameBatchEngine::new(small_config()).unwrap();
        let results = run_frame(
            &mut engine,
            &[Arrival {
                input: 0,
                output: 0,
            }],
        );
        assert!(results.iter().all(|r| r.matching_size == 0));
        assert_eq!(engine.stats().cells_scheduled, 1);
    }

    #[test]
    fn test_diagonal_frame_emitted_next_frame() {
        let mut engine = FrameBatchEngine::new(small_config()).unwrap();
        let arrivals: Vec<Arrival> = (0..4)
            .map(|i| Arrival {
                input: i,
                output: i,
            })
            .collect();
        run_frame(&mut engine, &arrivals);
        // all four cells landed in slot 0 of the first frame
        let results = run_frame(&mut engine, &[]);
        assert_eq!(results[0].matching_size, 4);
        for i in 0..4 {
            assert_eq!(results[0].matching[i], Some(i));
        }
        assert!(results[1..].iter().all(|r| r.matching_size == 0));
        assert_eq!(engine.backlog(), 0);
    }

    #[test]
    fn test_second_half_backfills_runner_up() {
        let mut engine = FrameBatchEngine::new(small_config()).unwrap();
        // reach the last slot of the frame with no traffic
        for _ in 0..3 {
            engine.step(&[]);
        }
        // two inputs collide on output 0 in the second half; the runner-up
        // must land in an earlier hole instead of being dropped
        engine.step(&[
            Arrival {
                input: 0,
                output: 0,
            },
            Arrival {
                input: 1,
                output: 0,
            },
        ]);
        assert_eq!(engine.stats().cells_scheduled, 2);
        assert_eq!(engine.backlog(), 0);
        let results = run_frame(&mut engine, &[]);
        let served: usize = results.iter().map(|r| r.matching_size).sum();
        assert_eq!(served, 2);
    }

    #[test]
    fn test_post_optimization_places_third_contender() {
        let mut engine = FrameBatchEngine::new(small_config()).unwrap();
        for _ in 0..3 {
            engine.step(&[]);
        }
        // three inputs collide on output 0 at the last slot: primary takes
        // the slot, the secondary backfills, the third is left for the
        // coloring pass
        engine.step(&[
            Arrival {
                input: 0,
                output: 0,
            },
            Arrival {
                input: 1,
                output: 0,
            },
            Arrival {
                input: 2,
                output: 0,
            },
        ]);
        assert_eq!(engine.stats().cells_scheduled, 3);
        assert!(!engine.stats().residual);
        assert_eq!(engine.backlog(), 0);
        let results = run_frame(&mut engine, &[]);
        let served: usize = results.iter().map(|r| r.matching_size).sum();
        assert_eq!(served, 3);
    }

    #[test]
    fn test_residual_carries_and_sets_sticky_flag() {
        let config = FrameBatchConfiguration {
            ports: 2,
            frame_size: 2,
            frame_size_block: 2,
            seed: 3,
            ..Default::default()
        };
        let mut engine = FrameBatchEngine::new(config).unwrap();
        // six cells for output 1 but only two slots in the frame
        let arrivals: Vec<Arrival> = (0..2)
            .flat_map(|i| {
                (0..3).map(move |_| Arrival {
                    input: i,
                    output: 1,
                })
            })
            .collect();
        run_frame(&mut engine, &arrivals);
        assert!(engine.stats().residual);
        assert_eq!(engine.stats().cells_scheduled, 2);
        assert_eq!(engine.backlog(), 4);
        // the carried cells drain over the following frames
        run_frame(&mut engine, &[]);
        run_frame(&mut engine, &[]);
        assert_eq!(engine.backlog(), 0);
    }

    #[test]
    fn test_adaptive_frame_grows_to_fit() {
        let config = FrameBatchConfiguration {
            ports: 2,
            frame_size: 2,
            frame_size_block: 2,
            seed: 3,
            adaptive_frame: true,
            ..Default::default()
        };
        let mut engine = FrameBatchEngine::new(config).unwrap();
        let arrivals: Vec<Arrival> = (0..2)
            .flat_map(|i| {
                (0..3).map(move |_| Arrival {
                    input: i,
                    output: 1,
                })
            })
            .collect();
        run_frame(&mut engine, &arrivals);
        assert!(!engine.stats().residual);
        assert_eq!(engine.stats().cells_scheduled, 6);
        assert_eq!(engine.backlog(), 0);
        assert!(engine.frame_len() > 2);
        // the grown frame drains completely
        let results = run_frame(&mut engine, &[]);
        let served: usize = results.iter().map(|r| r.matching_size).sum();
        assert_eq!(served, 6);
    }

    #[test]
    fn test_emitted_slots_are_matchings() {
        let config = FrameBatchConfiguration {
            ports: 4,
            frame_size: 4,
            retry_previous: true,
            seed: 11,
            ..Default::default()
        };
        let mut engine = FrameBatchEngine::new(config).unwrap();
        let arrivals: Vec<Arrival> = (0..4)
            .flat_map(|i| {
                (0..4).map(move |j| Arrival {
                    input: i,
                    output: j,
                })
            })
            .collect();
        for _ in 0..6 {
            for result in run_frame(&mut engine, &arrivals) {
                let mut seen = std::collections::HashSet::new();
                for input in result.matching.iter().flatten() {
                    assert!(seen.insert(*input));
                }
            }
        }
    }

    #[test]
    fn test_departure_balance() {
        let mut engine = FrameBatchEngine::new(small_config()).unwrap();
        let arrivals: Vec<Arrival> = (0..4)
            .map(|i| Arrival {
                input: i,
                output: (i + 2) % 4,
            })
            .collect();
        for _ in 0..5 {
            run_frame(&mut engine, &arrivals);
        }
        assert_eq!(
            engine.stats().cells_scheduled + engine.backlog(),
            engine.stats().cells_admitted
        );
    }

    #[test]
    fn test_reset_restores_base_frame() {
        let config = FrameBatchConfiguration {
            ports: 2,
            frame_size: 2,
            frame_size_block: 2,
            adaptive_frame: true,
            ..Default::default()
        };
        let mut engine = FrameBatchEngine::new(config).unwrap();
        let arrivals: Vec<Arrival> = (0..6)
            .map(|k| Arrival {
                input: k % 2,
                output: 1,
            })
            .collect();
        run_frame(&mut engine, &arrivals);
        assert!(engine.frame_len() > 2);
        engine.reset();
        engine.reset();
        assert_eq!(engine.frame_len(), 2);
        assert_eq!(engine.backlog(), 0);
        assert_eq!(engine.stats(), &FrameBatchStats::default());
    }
}
