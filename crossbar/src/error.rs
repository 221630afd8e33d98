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

use std::fmt;

/// Construction-parameter violations. The schedulers never fail on data
/// inputs; every error here is raised before a scheduler exists.
#[derive(Debug, Eq, PartialEq)]
pub enum Error {
    InvalidPortCount(usize),
    InvalidPortWidth(u32),
    InvalidWindowDepth(usize),
    InvalidKnockout(usize),
    InvalidIterationCount(usize),
    InvalidVoqCapacity(u32),
    InvalidFrameSize(usize),
    InvalidFrameBlock(usize),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidPortCount(n) => {
                write!(f, "ERROR: Invalid port count {}", n)
            }
            Self::InvalidWindowDepth(t) => {
                write!(f, "ERROR: Invalid window depth {} (2..=64)", t)
            }
            Self::InvalidFrameSize(t) => {
                write!(f, "ERROR: Invalid frame size {}", t)
            }
            _ => write!(f, "{:?}", self),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}
