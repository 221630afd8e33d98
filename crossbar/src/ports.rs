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

use crate::calendar::SlotCalendar;
use crate::util::{first_fit_accept, Lfsr};
use crate::voq::VoqRegistry;
use crate::{PortId, Slot};

/// A request from an input to one output: the sampled destination, the VOQ
/// backlog backing the request, and the input's free slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Proposal {
    pub input: PortId,
    pub output: PortId,
    pub voq_len: u32,
    pub availability: u64,
}

/// An output's reply booking a specific window slot for the proposer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Accept {
    pub output: PortId,
    pub input: PortId,
    pub slot: Slot,
}

/// One input port: its VOQ registry, its side of the window, and a private
/// LFSR. Ports never reference their output peers; the window manager
/// carries `Proposal`/`Accept` records between the two sides.
#[derive(Clone, Debug)]
pub struct InputPort {
    id: PortId,
    ports: usize,
    voq: VoqRegistry,
    calendar: SlotCalendar,
    rng: Lfsr,
    seed: u32,
}

impl InputPort {
    /// Each port derives its own seed as `seed ^ id` so concurrent proposers
    /// decorrelate while the whole system stays reproducible.
    pub fn new(id: PortId, ports: usize, depth: usize, max_voq_len: u32, seed: u32) -> Self {
        let port_seed = seed ^ id as u32;
        Self {
            id,
            ports,
            voq: VoqRegistry::new(ports, max_voq_len),
            calendar: SlotCalendar::new(depth),
            rng: Lfsr::new(port_seed),
            seed: port_seed,
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn voq(&self) -> &VoqRegistry {
        &self.voq
    }

    pub fn schedule(&self) -> &SlotCalendar {
        &self.calendar
    }

    pub fn enqueue(&mut self, output: PortId, count: u32) -> u32 {
        self.voq.add(output, count)
    }

    /// Queue-proportional sampling, up to `ports` attempts. A sampled output
    /// is proposed iff it still has backlog and is not already booked in
    /// this input's window; re-proposing a booked output would burn a second
    /// slot on one flow while its siblings starve. Returns `None` when the
    /// registry is empty or every attempt landed on a booked output.
    pub fn generate_proposal(&mut self) -> Option<Proposal> {
        if self.voq.total() == 0 {
            return None;
        }
        for _ in 0..self.ports {
            let r = self.rng.step();
            let output = self.voq.sample(r)?;
            if !self.calendar.contains(output) {
                return Some(Proposal {
                    input: self.id,
                    output,
                    voq_len: self.voq.length(output),
                    availability: self.calendar.availability(),
                });
            }
        }
        None
    }

    /// Book the accepted slot and perform the virtual departure: the cell
    /// leaves the VOQ now, not at graduation, so later iterations in the
    /// same cycle cannot double-count it.
    pub fn apply_accept(&mut self, accept: &Accept) {
        if accept.slot >= self.calendar.depth() || !self.calendar.is_free(accept.slot) {
            log::debug!(
                "input {} dropping accept for busy slot {}",
                self.id,
                accept.slot
            );
            return;
        }
        self.calendar.assign(accept.slot, accept.output);
        self.voq.remove(accept.output);
    }

    /// Shift the window. The graduated cell was already removed at accept
    /// time.
    pub fn graduate(&mut self) {
        self.calendar.advance();
    }

    pub fn reset(&mut self) {
        self.voq.reset();
        self.calendar.reset();
        self.rng = Lfsr::new(self.seed);
    }
}

/// One output port: its calendar over the window.
#[derive(Clone, Debug)]
pub struct OutputPort {
    id: PortId,
    calendar: SlotCalendar,
}

impl OutputPort {
    pub fn new(id: PortId, depth: usize) -> Self {
        Self {
            id,
            calendar: SlotCalendar::new(depth),
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn calendar(&self) -> &SlotCalendar {
        &self.calendar
    }

    /// Rank the bucket by descending VOQ length (ties to the lower input
    /// id), walk the top `knockout` entries, and First-Fit-Accept the first
    /// whose availability overlaps this calendar. At most one accept per
    /// iteration.
    pub fn process_proposals(
        &mut self,
        bucket: &mut [Proposal],
        knockout: usize,
    ) -> Option<Accept> {
        bucket.sort_by(|a, b| b.voq_len.cmp(&a.voq_len).then_with(|| a.input.cmp(&b.input)));
        for proposal in bucket.iter().take(knockout) {
            if let Some(slot) = first_fit_accept(proposal.availability, self.calendar.availability())
            {
                self.calendar.assign(slot, proposal.input);
                log::trace!(
                    "output {} accepts input {} at slot {} (voq_len {})",
                    self.id,
                    proposal.input,
                    slot,
                    proposal.voq_len
                );
                return Some(Accept {
                    output: self.id,
                    input: proposal.input,
                    slot,
                });
            }
        }
        None
    }

    /// Pop the senior entry and shift the calendar.
    pub fn graduate(&mut self) -> Option<PortId> {
        let senior = self.calendar.senior();
        self.calendar.advance();
        senior
    }

    pub fn reset(&mut self) {
        self.calendar.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded_input(id: PortId, lengths: &[(PortId, u32)]) -> InputPort {
        let mut port = InputPort::new(id, 4, 4, 1024, 1);
        for &(output, count) in lengths {
            port.enqueue(output, count);
        }
        port
    }

    #[test]
    fn test_proposal_targets_backlogged_output() {
        let mut port = loaded_input(0, &[(2, 10)]);
        let prop = port.generate_proposal().unwrap();
        assert_eq!(prop.input, 0);
        assert_eq!(prop.output, 2);
        assert_eq!(prop.voq_len, 10);
        assert_eq!(prop.availability, 0b1111);
    }

    #[test]
    fn test_empty_registry_yields_no_proposal() {
        let mut port = InputPort::new(0, 4, 4, 1024, 1);
        assert_eq!(port.generate_proposal(), None);
    }

    #[test]
    fn test_booked_output_not_reproposed() {
        let mut port = loaded_input(0, &[(2, 10)]);
        port.apply_accept(&Accept {
            output: 2,
            input: 0,
            slot: 0,
        });
        // output 2 is in the window and it is the only backlogged flow
        assert_eq!(port.generate_proposal(), None);
    }

    #[test]
    fn test_accept_is_virtual_departure() {
        let mut port = loaded_input(0, &[(1, 3)]);
        port.apply_accept(&Accept {
            output: 1,
            input: 0,
            slot: 2,
        });
        assert_eq!(port.voq().length(1), 2);
        assert_eq!(port.schedule().get(2), Some(1));
        assert!(!port.schedule().is_free(2));
        // graduation shifts the window but never touches the VOQ
        port.graduate();
        port.graduate();
        port.graduate();
        assert_eq!(port.voq().length(1), 2);
    }

    #[test]
    fn test_acceptor_ranks_by_voq_len() {
        let mut output = OutputPort::new(1, 4);
        let mut bucket = vec![
            Proposal {
                input: 0,
                output: 1,
                voq_len: 5,
                availability: 0b1111,
            },
            Proposal {
                input: 3,
                output: 1,
                voq_len: 9,
                availability: 0b1111,
            },
        ];
        let accept = output.process_proposals(&mut bucket, 3).unwrap();
        assert_eq!(accept.input, 3);
        assert_eq!(accept.slot, 0);
        assert_eq!(output.calendar().get(0), Some(3));
    }

    #[test]
    fn test_acceptor_tie_break_lower_input() {
        let mut output = OutputPort::new(0, 4);
        let mut bucket = vec![
            Proposal {
                input: 2,
                output: 0,
                voq_len: 4,
                availability: 0b1111,
            },
            Proposal {
                input: 1,
                output: 0,
                voq_len: 4,
                availability: 0b1111,
            },
        ];
        let accept = output.process_proposals(&mut bucket, 3).unwrap();
        assert_eq!(accept.input, 1);
    }

    #[test]
    fn test_knockout_caps_considered_proposals() {
        let mut output = OutputPort::new(0, 4);
        // the two heaviest proposals have no mutual slot; the third would
        // fit but sits beyond a knockout of 2
        let mut bucket = vec![
            Proposal {
                input: 0,
                output: 0,
                voq_len: 9,
                availability: 0,
            },
            Proposal {
                input: 1,
                output: 0,
                voq_len: 8,
                availability: 0,
            },
            Proposal {
                input: 2,
                output: 0,
                voq_len: 1,
                availability: 0b1111,
            },
        ];
        assert_eq!(output.process_proposals(&mut bucket, 2), None);
        let accept = output.process_proposals(&mut bucket, 3).unwrap();
        assert_eq!(accept.input, 2);
    }

    #[test]
    fn test_single_accept_per_iteration() {
        let mut output = OutputPort::new(0, 4);
        let mut bucket = vec![
            Proposal {
                input: 0,
                output: 0,
                voq_len: 5,
                availability: 0b1111,
            },
            Proposal {
                input: 1,
                output: 0,
                voq_len: 5,
                availability: 0b1111,
            },
        ];
        assert!(output.process_proposals(&mut bucket, 3).is_some());
        assert_eq!(output.calendar().availability().count_ones(), 3);
    }
}
