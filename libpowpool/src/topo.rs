// Copyright 2023 Google LLC
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

/*! The topology taxonomy for signal and control domains.

A domain is the hardware scope a signal is measured on or a control
applies to. Request files name domains by their lowercase string
form; the batch protocol carries them as integers.
*/

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Board,
    Package,
    Core,
    Cpu,
    Memory,
    Gpu,
    Nic,
}

lazy_static! {
    static ref DOMAIN_NAMES: HashMap<&'static str, Domain> = {
        let mut names = HashMap::new();
        names.insert("board", Domain::Board);
        names.insert("package", Domain::Package);
        names.insert("core", Domain::Core);
        names.insert("cpu", Domain::Cpu);
        names.insert("memory", Domain::Memory);
        names.insert("gpu", Domain::Gpu);
        names.insert("nic", Domain::Nic);
        names
    };
}

impl Domain {
    pub fn from_name(name: &str) -> Result<Domain> {
        DOMAIN_NAMES
            .get(name)
            .copied()
            .ok_or_else(|| Error::Invalid(format!("unknown domain name '{name}'")))
    }

    pub fn from_type(domain_type: i32) -> Result<Domain> {
        match domain_type {
            0 => Ok(Domain::Board),
            1 => Ok(Domain::Package),
            2 => Ok(Domain::Core),
            3 => Ok(Domain::Cpu),
            4 => Ok(Domain::Memory),
            5 => Ok(Domain::Gpu),
            6 => Ok(Domain::Nic),
            _ => Err(Error::Invalid(format!("unknown domain type {domain_type}"))),
        }
    }

    pub fn type_id(self) -> i32 {
        match self {
            Domain::Board => 0,
            Domain::Package => 1,
            Domain::Core => 2,
            Domain::Cpu => 3,
            Domain::Memory => 4,
            Domain::Gpu => 5,
            Domain::Nic => 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Domain::Board => "board",
            Domain::Package => "package",
            Domain::Core => "core",
            Domain::Cpu => "cpu",
            Domain::Memory => "memory",
            Domain::Gpu => "gpu",
            Domain::Nic => "nic",
        }
    }
}
