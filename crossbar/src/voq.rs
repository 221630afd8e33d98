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

use crate::PortId;

/// Binary sum tree over a power-of-two number of leaves. Point update and
/// "smallest leaf whose prefix sum exceeds a target" both walk one
/// root-to-leaf path. The internal array has length `2 * leaf_base` with the
/// root sum at index 1; padding leaves beyond the port count stay zero and
/// are therefore unreachable by the descent.
#[derive(Clone, Debug)]
struct SumTree {
    tree: Vec<u32>,
    leaf_base: usize,
}

impl SumTree {
    fn new(leaves: usize) -> Self {
        let leaf_base = leaves.next_power_of_two();
        Self {
            tree: vec![0; 2 * leaf_base],
            leaf_base,
        }
    }

    fn total(&self) -> u32 {
        self.tree[1]
    }

    fn get(&self, leaf: usize) -> u32 {
        self.tree[self.leaf_base + leaf]
    }

    fn add(&mut self, leaf: usize, delta: i64) {
        let mut idx = self.leaf_base + leaf;
        while idx >= 1 {
            let updated = self.tree[idx] as i64 + delta;
            debug_assert!(updated >= 0);
            self.tree[idx] = updated as u32;
            idx /= 2;
        }
    }

    /// Smallest leaf index whose cumulative sum exceeds `target`.
    /// Requires `target < total()`.
    fn find(&self, mut target: u32) -> usize {
        debug_assert!(target < self.total());
        let mut idx = 1;
        while idx < self.leaf_base {
            let left = self.tree[2 * idx];
            if target < left {
                idx = 2 * idx;
            } else {
                target -= left;
                idx = 2 * idx + 1;
            }
        }
        idx - self.leaf_base
    }

    fn clear(&mut self) {
        self.tree.fill(0);
    }
}

/// Virtual-output-queue lengths for one input port, with the weighted
/// sampler used by queue-proportional sampling.
///
/// Only queue lengths matter to scheduling; cells have no identity here.
/// `add` saturates per destination and latches a sticky overload flag,
/// `remove` tolerates an empty queue, and the lifetime `added`/`removed`
/// counters let callers audit the departure balance.
#[derive(Clone, Debug)]
pub struct VoqRegistry {
    tree: SumTree,
    ports: usize,
    max_len: u32,
    overloaded: bool,
    added: u64,
    removed: u64,
}

impl VoqRegistry {
    pub fn new(ports: usize, max_len: u32) -> Self {
        Self {
            tree: SumTree::new(ports),
            ports,
            max_len,
            overloaded: false,
            added: 0,
            removed: 0,
        }
    }

    /// Enqueue `count` cells for `output`, saturating at the per-VOQ cap.
    /// Returns how many cells were actually admitted; out-of-range ports
    /// admit nothing.
    pub fn add(&mut self, output: PortId, count: u32) -> u32 {
        if output >= self.ports || count == 0 {
            return 0;
        }
        let current = self.tree.get(output);
        let admitted = count.min(self.max_len - current);
        if admitted < count {
            if !self.overloaded {
                log::warn!("VOQ for output {} saturated at {}", output, self.max_len);
            }
            self.overloaded = true;
        }
        if admitted > 0 {
            self.tree.add(output, admitted as i64);
            self.added += admitted as u64;
        }
        admitted
    }

    /// Dequeue one cell for `output`. A no-op on an empty queue, so that a
    /// virtual departure followed by any later bookkeeping cannot underflow.
    pub fn remove(&mut self, output: PortId) {
        if output < self.ports && self.tree.get(output) > 0 {
            self.tree.add(output, -1);
            self.removed += 1;
        }
    }

    pub fn length(&self, output: PortId) -> u32 {
        if output < self.ports {
            self.tree.get(output)
        } else {
            0
        }
    }

    pub fn total(&self) -> u32 {
        self.tree.total()
    }

    pub fn max_length(&self) -> u32 {
        (0..self.ports).map(|j| self.tree.get(j)).max().unwrap_or(0)
    }

    /// Queue-proportional sample: `None` iff all queues are empty, otherwise
    /// output j with probability `length(j) / total()`. `r` is any uniform
    /// random word; the target is `r mod total()` and the tree descent finds
    /// the smallest j whose prefix sum exceeds it, so zero-length queues are
    /// never drawn.
    pub fn sample(&self, r: u32) -> Option<PortId> {
        let sum = self.tree.total();
        if sum == 0 {
            None
        } else {
            Some(self.tree.find(r % sum))
        }
    }

    pub fn overloaded(&self) -> bool {
        self.overloaded
    }

    pub fn added(&self) -> u64 {
        self.added
    }

    pub fn removed(&self) -> u64 {
        self.removed
    }

    pub fn reset(&mut self) {
        self.tree.clear();
        self.overloaded = false;
        self.added = 0;
        self.removed = 0;
    }
}
