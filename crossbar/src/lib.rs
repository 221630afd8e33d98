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

mod batch;
mod calendar;
mod config;
mod error;
mod ports;
mod util;
mod voq;
mod window;

// Public types
// type to use for cycles (one cycle = one cell transmission slot time)
pub type Cycle = usize;
// port identifiers index the input/output arrays of the switch
pub type PortId = usize;
// slot identifiers index the sliding window / frame
pub type Slot = usize;

pub use crate::batch::{FrameBatchEngine, FrameBatchStats};
pub use crate::calendar::SlotCalendar;
pub use crate::config::{FrameBatchConfiguration, SchedulerConfiguration};
pub use crate::error::Error;
pub use crate::ports::{Accept, InputPort, OutputPort, Proposal};
pub use crate::util::{find_first_set, first_fit_accept, Lfsr};
pub use crate::window::{Arrival, MatchingResult, SlidingWindow, WindowStats};

// for benchmarking
pub use crate::voq::VoqRegistry;
