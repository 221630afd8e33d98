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

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Default port count of the reference switch.
pub const PORT_COUNT: usize = 64;

/// Default sliding-window depth in slots.
pub const WINDOW_DEPTH: usize = 16;

/// Default per-VOQ capacity.
pub const MAX_VOQ_LEN: u32 = 1024;

/// Default cap on proposals an output considers per iteration.
pub const KNOCKOUT_THRESH: usize = 3;

/// Default growth increment for adaptive frames.
pub const FRAME_SIZE_BLOCK: usize = 128;

/// Default bit width of a port identifier.
pub const PORT_BITS: u32 = 7;

/// parameters for the sliding-window scheduler
///
/// constructed programmatically or read from a config file.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct SchedulerConfiguration {
    pub ports: usize,
    pub window_depth: usize,
    pub max_voq_len: u32,
    pub knockout: usize,
    /// propose/accept passes per tick; the window depth is the steady-state
    /// reference, fewer trades matching size for speed.
    pub iterations_per_tick: usize,
    pub port_bits: u32,
    pub seed: u32,
}

impl Default for SchedulerConfiguration {
    fn default() -> Self {
        Self {
            ports: PORT_COUNT,
            window_depth: WINDOW_DEPTH,
            max_voq_len: MAX_VOQ_LEN,
            knockout: KNOCKOUT_THRESH,
            iterations_per_tick: WINDOW_DEPTH,
            port_bits: PORT_BITS,
            seed: 12345,
        }
    }
}

impl SchedulerConfiguration {
    pub fn validate(&self) -> Result<(), Error> {
        if self.port_bits < 2 || self.port_bits > 16 {
            return Err(Error::InvalidPortWidth(self.port_bits));
        }
        let max_ports = (1usize << self.port_bits) - 1;
        if self.ports < 2 || self.ports > max_ports {
            return Err(Error::InvalidPortCount(self.ports));
        }
        if !(2..=64).contains(&self.window_depth) {
            return Err(Error::InvalidWindowDepth(self.window_depth));
        }
        if self.knockout == 0 {
            return Err(Error::InvalidKnockout(self.knockout));
        }
        if self.iterations_per_tick == 0 {
            return Err(Error::InvalidIterationCount(self.iterations_per_tick));
        }
        if self.max_voq_len == 0 {
            return Err(Error::InvalidVoqCapacity(self.max_voq_len));
        }
        Ok(())
    }

    #[allow(dead_code)]
    pub fn from_file(file_name: &str) -> Self {
        let file = File::open(Path::new(file_name))
            .unwrap_or_else(|e| panic!("File {} not found. {:?}", file_name, e));
        let reader = BufReader::new(file);
        serde_yaml::from_reader(reader).unwrap()
    }

    #[allow(dead_code)]
    pub fn from_str(config: &str) -> Self {
        serde_yaml::from_str(config).unwrap()
    }
}

/// parameters for the frame batch engine
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct FrameBatchConfiguration {
    pub ports: usize,
    pub frame_size: usize,
    pub max_voq_len: u32,
    pub frame_size_block: usize,
    pub port_bits: u32,
    pub seed: u32,
    /// losing proposals immediately retry earlier, still-free slots.
    pub retry_previous: bool,
    /// grow the frame instead of carrying residual cells.
    pub adaptive_frame: bool,
}

impl Default for FrameBatchConfiguration {
    fn default() -> Self {
        Self {
            ports: PORT_COUNT,
            frame_size: WINDOW_DEPTH,
            max_voq_len: MAX_VOQ_LEN,
            frame_size_block: FRAME_SIZE_BLOCK,
            port_bits: PORT_BITS,
            seed: 12345,
            retry_previous: false,
            adaptive_frame: false,
        }
    }
}

impl FrameBatchConfiguration {
    pub fn validate(&self) -> Result<(), Error> {
        if self.port_bits < 2 || self.port_bits > 16 {
            return Err(Error::InvalidPortWidth(self.port_bits));
        }
        let max_ports = (1usize << self.port_bits) - 1;
        if self.ports < 2 || self.ports > max_ports {
            return Err(Error::InvalidPortCount(self.ports));
        }
        if !(2..=4096).contains(&self.frame_size) {
            return Err(Error::InvalidFrameSize(self.frame_size));
        }
        if self.frame_size_block == 0 {
            return Err(Error::InvalidFrameBlock(self.frame_size_block));
        }
        if self.max_voq_len == 0 {
            return Err(Error::InvalidVoqCapacity(self.max_voq_len));
        }
        Ok(())
    }

    #[allow(dead_code)]
    pub fn from_file(file_name: &str) -> Self {
        let file = File::open(Path::new(file_name))
            .unwrap_or_else(|e| panic!("File {} not found. {:?}", file_name, e));
        let reader = BufReader::new(file);
        serde_yaml::from_reader(reader).unwrap()
    }

    #[allow(dead_code)]
    pub fn from_str(config: &str) -> Self {
        serde_yaml::from_str(config).unwrap()
    }
}
