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

/*! A small sysfs backed platform layer.

This covers the signals and controls a stock linux kernel exposes
without extra drivers: wall time, cpufreq and intel powercap. The
full MSR and accelerator plumbing lives behind the same trait in
dedicated plugins and is out of scope here.
*/

use std::{fs, path::PathBuf, time::Instant};

use tracing::debug;

use crate::{
    error::{Error, Result},
    platform::PlatformIO,
    topo::Domain,
};

const CPUFREQ_ROOT: &str = "/sys/devices/system/cpu";
const POWERCAP_ROOT: &str = "/sys/class/powercap/intel-rapl:0";

#[derive(Debug, Clone, Copy)]
enum SignalKind {
    /// Seconds of monotonic time since this platform was created.
    Time,
    /// Current frequency of one cpu, in Hz.
    CpuFrequency(i32),
    /// Energy consumed by the package rapl zone, in joules.
    BoardEnergy,
}

#[derive(Debug, Clone, Copy)]
enum ControlKind {
    /// Maximum frequency cap of one cpu, in Hz.
    CpuFrequencyMax(i32),
    /// Power limit of the package rapl zone, in watts.
    BoardPowerLimit,
}

pub struct SysfsPlatformIO {
    start: Instant,
    signals: Vec<SignalKind>,
    samples: Vec<f64>,
    controls: Vec<ControlKind>,
    staged: Vec<Option<f64>>,
}

impl SysfsPlatformIO {
    pub fn new() -> SysfsPlatformIO {
        SysfsPlatformIO {
            start: Instant::now(),
            signals: Vec::new(),
            samples: Vec::new(),
            controls: Vec::new(),
            staged: Vec::new(),
        }
    }

    fn read_value(path: PathBuf, scale: f64) -> f64 {
        match fs::read_to_string(&path) {
            Ok(text) => match text.trim().parse::<f64>() {
                Ok(raw) => raw * scale,
                Err(_) => f64::NAN,
            },
            Err(err) => {
                debug!("reading {}: {}", path.display(), err);
                f64::NAN
            }
        }
    }

    fn write_value(path: PathBuf, raw: u64) -> Result<()> {
        fs::write(&path, format!("{raw}\n")).map_err(|e| Error::from_io("write(2)", e))
    }

    fn cpufreq_path(cpu: i32, leaf: &str) -> PathBuf {
        PathBuf::from(format!("{CPUFREQ_ROOT}/cpu{cpu}/cpufreq/{leaf}"))
    }
}

impl Default for SysfsPlatformIO {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformIO for SysfsPlatformIO {
    fn push_signal(&mut self, name: &str, domain_type: i32, domain_idx: i32) -> Result<i32> {
        if domain_idx < 0 {
            return Err(Error::Invalid(format!("negative domain index for signal {name}")));
        }
        let domain = Domain::from_type(domain_type)?;
        let kind = match (name, domain) {
            ("TIME", Domain::Board) => SignalKind::Time,
            ("CPU_FREQUENCY_STATUS", Domain::Cpu) => SignalKind::CpuFrequency(domain_idx),
            ("BOARD_ENERGY", Domain::Board) => SignalKind::BoardEnergy,
            _ => {
                return Err(Error::Invalid(format!(
                    "signal {name} is not supported at domain {}",
                    domain.name()
                )))
            }
        };
        self.signals.push(kind);
        self.samples.push(f64::NAN);
        Ok(self.signals.len() as i32 - 1)
    }

    fn push_control(&mut self, name: &str, domain_type: i32, domain_idx: i32) -> Result<i32> {
        if domain_idx < 0 {
            return Err(Error::Invalid(format!("negative domain index for control {name}")));
        }
        let domain = Domain::from_type(domain_type)?;
        let kind = match (name, domain) {
            ("CPU_FREQUENCY_MAX_CONTROL", Domain::Cpu) => ControlKind::CpuFrequencyMax(domain_idx),
            ("BOARD_POWER_LIMIT_CONTROL", Domain::Board) => ControlKind::BoardPowerLimit,
            _ => {
                return Err(Error::Invalid(format!(
                    "control {name} is not supported at domain {}",
                    domain.name()
                )))
            }
        };
        self.controls.push(kind);
        self.staged.push(None);
        Ok(self.controls.len() as i32 - 1)
    }

    fn read_batch(&mut self) -> Result<()> {
        for (idx, kind) in self.signals.iter().enumerate() {
            self.samples[idx] = match kind {
                SignalKind::Time => self.start.elapsed().as_secs_f64(),
                // scaling_cur_freq reports kHz
                SignalKind::CpuFrequency(cpu) => {
                    Self::read_value(Self::cpufreq_path(*cpu, "scaling_cur_freq"), 1e3)
                }
                // energy_uj reports microjoules
                SignalKind::BoardEnergy => {
                    Self::read_value(PathBuf::from(format!("{POWERCAP_ROOT}/energy_uj")), 1e-6)
                }
            };
        }
        Ok(())
    }

    fn sample(&mut self, handle: i32) -> Result<f64> {
        self.samples
            .get(handle as usize)
            .copied()
            .ok_or_else(|| Error::Invalid(format!("unknown signal handle {handle}")))
    }

    fn adjust(&mut self, handle: i32, setting: f64) -> Result<()> {
        let slot = self
            .staged
            .get_mut(handle as usize)
            .ok_or_else(|| Error::Invalid(format!("unknown control handle {handle}")))?;
        *slot = Some(setting);
        Ok(())
    }

    fn write_batch(&mut self) -> Result<()> {
        for (kind, staged) in self.controls.iter().zip(self.staged.iter()) {
            let setting = match staged {
                Some(setting) => *setting,
                None => continue,
            };
            if !setting.is_finite() || setting < 0.0 {
                return Err(Error::Invalid(format!("control setting {setting} is out of range")));
            }
            match kind {
                ControlKind::CpuFrequencyMax(cpu) => {
                    // scaling_max_freq takes kHz
                    Self::write_value(
                        Self::cpufreq_path(*cpu, "scaling_max_freq"),
                        (setting / 1e3) as u64,
                    )?;
                }
                ControlKind::BoardPowerLimit => {
                    // power_limit_uw takes microwatts
                    Self::write_value(
                        PathBuf::from(format!(
                            "{POWERCAP_ROOT}/constraint_0_power_limit_uw"
                        )),
                        (setting * 1e6) as u64,
                    )?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn time_signal_is_monotonic() {
        let mut platform = SysfsPlatformIO::new();
        let handle =
            platform.push_signal("TIME", Domain::Board.type_id(), 0).expect("push TIME");
        platform.read_batch().expect("read");
        let first = platform.sample(handle).expect("sample");
        platform.read_batch().expect("read");
        let second = platform.sample(handle).expect("sample");
        assert!(first >= 0.0);
        assert!(second >= first);
    }

    #[test]
    fn unsupported_requests_are_invalid() {
        let mut platform = SysfsPlatformIO::new();
        assert!(matches!(
            platform.push_signal("MSR::APERF", Domain::Cpu.type_id(), 0),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            platform.push_signal("TIME", Domain::Cpu.type_id(), 0),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            platform.push_control("TIME", Domain::Board.type_id(), 0),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn sample_before_push_is_invalid() {
        let mut platform = SysfsPlatformIO::new();
        assert!(matches!(platform.sample(0), Err(Error::Invalid(_))));
        assert!(matches!(platform.adjust(0, 1.0), Err(Error::Invalid(_))));
    }
}
