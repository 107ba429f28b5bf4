// SPDX-License-Identifier: LGPL-3.0-or-later

//! Readout layer (L10, §4.10): spectrum/baseline/SCA data and statistics
//! extraction, read from DSP symbols while a run is stopped so the counters
//! making up `module_statistics_2` are consistent with one another (§5
//! "Ordering guarantees").

use tracing::warn;

use crate::capability::{DeviceBus, MemRegion, ProductDriver, RunDataValue, StatisticsLayout};
use crate::defaults::Defaults;
use crate::error::Result;
use crate::module::Module;

/// Seconds per tick: `16 / (clock_MHz * 1e6)` (§4.10, shared with the preset
/// encoding in §4.9).
fn seconds_per_tick(clock_mhz: f64) -> f64 {
    16.0 / (clock_mhz * 1e6)
}

fn combine48(words: [u16; 3]) -> u64 {
    (words[0] as u64) | ((words[1] as u64) << 16) | ((words[2] as u64) << 32)
}

fn combine32(words: [u16; 2]) -> u32 {
    (words[0] as u32) | ((words[1] as u32) << 16)
}

fn read_triple(bus: &mut dyn DeviceBus, channel: i32, base: &str) -> Result<[u16; 3]> {
    Ok([
        bus.read_symbol(channel, &format!("{}0", base))?,
        bus.read_symbol(channel, &format!("{}1", base))?,
        bus.read_symbol(channel, &format!("{}2", base))?,
    ])
}

fn read_pair(bus: &mut dyn DeviceBus, channel: i32, base: &str) -> Result<[u16; 2]> {
    Ok([
        bus.read_symbol(channel, &format!("{}0", base))?,
        bus.read_symbol(channel, &format!("{}1", base))?,
    ])
}

pub struct Readout;

impl Readout {
    /// `get_run_data(handle, name, value)` for a single resolved (channel,
    /// module) pair. Names the generic layer does not recognize fall back to
    /// `ProductDriver::get_run_data`.
    #[allow(clippy::too_many_arguments)]
    pub fn get_run_data(
        bus: &mut dyn DeviceBus,
        driver: &dyn ProductDriver,
        channel: i32,
        name: &str,
        defaults: &Defaults,
        module: &Module,
        module_channel: u32,
    ) -> Result<RunDataValue> {
        let lname = name.to_lowercase();
        match lname.as_str() {
            "mca_length" | "number_mca_channels" => {
                Ok(RunDataValue::Counter(driver.number_mca_channels(defaults)?))
            }
            "baseline_length" => Ok(RunDataValue::Counter(driver.baseline_length(defaults)?)),
            "mca" => {
                let n = driver.number_mca_channels(defaults)?;
                let addr = driver.mca_start_address(module, module_channel)?;
                let words = bus.read_memory(MemRegion::Spectrum, addr, n as usize)?;
                Ok(RunDataValue::Buffer(words.into_iter().map(|w| w as i32).collect()))
            }
            "baseline" => {
                let n = driver.baseline_length(defaults)?;
                let words = bus.read_memory(MemRegion::Data, 0, n as usize)?;
                Ok(RunDataValue::Buffer(words.into_iter().map(|w| w as i32).collect()))
            }
            "run_active" => {
                let ch = module.channel(module_channel)?;
                Ok(RunDataValue::Bitmask(if ch.run_active { 1 } else { 0 }))
            }
            "livetime" => {
                warn!(name = "livetime", "deprecated acquisition-value name; resolving to trigger_livetime");
                Ok(RunDataValue::Scalar(Self::trigger_livetime(bus, driver, channel, module)?))
            }
            "events_in_run" => {
                warn!(name = "events_in_run", "deprecated acquisition-value name; resolving to mca_events");
                Ok(RunDataValue::Counter(Self::mca_events(bus, driver, channel)?))
            }
            "trigger_livetime" => Ok(RunDataValue::Scalar(Self::trigger_livetime(bus, driver, channel, module)?)),
            "energy_livetime" => Ok(RunDataValue::Scalar(Self::energy_livetime(bus, driver, channel, module)?)),
            "realtime" => Ok(RunDataValue::Scalar(Self::realtime(bus, driver, channel, module)?)),
            "triggers" => Ok(RunDataValue::Counter(Self::triggers(bus, driver, channel)?)),
            "mca_events" => Ok(RunDataValue::Counter(Self::mca_events(bus, driver, channel)?)),
            "underflows" => Ok(RunDataValue::Counter(Self::underflows(bus, driver, channel)?)),
            "overflows" => Ok(RunDataValue::Counter(Self::overflows(bus, driver, channel)?)),
            "total_output_events" => Ok(RunDataValue::Counter(Self::total_output_events(bus, driver, channel)?)),
            "input_count_rate" => {
                let triggers = Self::triggers(bus, driver, channel)? as f64;
                let tl = Self::trigger_livetime(bus, driver, channel, module)?;
                Ok(RunDataValue::Scalar(if tl > 0.0 { triggers / tl } else { 0.0 }))
            }
            "output_count_rate" => {
                let events = Self::mca_events(bus, driver, channel)? as f64
                    + Self::underflows(bus, driver, channel)? as f64
                    + Self::overflows(bus, driver, channel)? as f64;
                let rt = Self::realtime(bus, driver, channel, module)?;
                Ok(RunDataValue::Scalar(if rt > 0.0 { events / rt } else { 0.0 }))
            }
            "module_statistics_2" => Ok(RunDataValue::StatsVector(Self::statistics_snapshot(bus, driver, channel, module)?)),
            _ => driver.get_run_data(bus, channel, name, defaults, module),
        }
    }

    fn trigger_livetime(bus: &mut dyn DeviceBus, driver: &dyn ProductDriver, channel: i32, module: &Module) -> Result<f64> {
        let layout = driver.statistics_layout();
        let words = read_triple(bus, channel, &layout.trigger_livetime_base)?;
        let clock = driver.clock_speed_mhz(module)?;
        Ok(combine48(words) as f64 * seconds_per_tick(clock))
    }

    fn energy_livetime(bus: &mut dyn DeviceBus, driver: &dyn ProductDriver, channel: i32, module: &Module) -> Result<f64> {
        let layout = driver.statistics_layout();
        let words = read_triple(bus, channel, &layout.energy_livetime_base)?;
        let clock = driver.clock_speed_mhz(module)?;
        Ok(combine48(words) as f64 * seconds_per_tick(clock))
    }

    fn realtime(bus: &mut dyn DeviceBus, driver: &dyn ProductDriver, channel: i32, module: &Module) -> Result<f64> {
        let layout = driver.statistics_layout();
        let words = read_triple(bus, channel, &layout.realtime_base)?;
        let clock = driver.clock_speed_mhz(module)?;
        Ok(combine48(words) as f64 * seconds_per_tick(clock))
    }

    fn triggers(bus: &mut dyn DeviceBus, driver: &dyn ProductDriver, channel: i32) -> Result<u32> {
        let layout = driver.statistics_layout();
        Ok(combine32(read_pair(bus, channel, &layout.triggers_base)?))
    }

    fn mca_events(bus: &mut dyn DeviceBus, driver: &dyn ProductDriver, channel: i32) -> Result<u32> {
        let layout = driver.statistics_layout();
        Ok(combine32(read_pair(bus, channel, &layout.mca_events_base)?))
    }

    fn underflows(bus: &mut dyn DeviceBus, driver: &dyn ProductDriver, channel: i32) -> Result<u32> {
        let layout = driver.statistics_layout();
        Ok(combine32(read_pair(bus, channel, &layout.underflows_base)?))
    }

    fn overflows(bus: &mut dyn DeviceBus, driver: &dyn ProductDriver, channel: i32) -> Result<u32> {
        let layout = driver.statistics_layout();
        Ok(combine32(read_pair(bus, channel, &layout.overflows_base)?))
    }

    fn total_output_events(bus: &mut dyn DeviceBus, driver: &dyn ProductDriver, channel: i32) -> Result<u32> {
        let layout = driver.statistics_layout();
        Ok(combine32(read_pair(bus, channel, &layout.total_output_events_base)?))
    }

    /// `[realtime, trigger_livetime, energy_livetime, triggers, mca_events,
    /// icr, ocr, underflows, overflows]` (§4.10 `module_statistics_2`).
    fn statistics_snapshot(bus: &mut dyn DeviceBus, driver: &dyn ProductDriver, channel: i32, module: &Module) -> Result<[f64; 9]> {
        let layout: StatisticsLayout = driver.statistics_layout();
        let clock = driver.clock_speed_mhz(module)?;
        let tick = seconds_per_tick(clock);

        let realtime = combine48(read_triple(bus, channel, &layout.realtime_base)?) as f64 * tick;
        let trigger_livetime = combine48(read_triple(bus, channel, &layout.trigger_livetime_base)?) as f64 * tick;
        let energy_livetime = combine48(read_triple(bus, channel, &layout.energy_livetime_base)?) as f64 * tick;
        let triggers = combine32(read_pair(bus, channel, &layout.triggers_base)?) as f64;
        let mca_events = combine32(read_pair(bus, channel, &layout.mca_events_base)?) as f64;
        let underflows = combine32(read_pair(bus, channel, &layout.underflows_base)?) as f64;
        let overflows = combine32(read_pair(bus, channel, &layout.overflows_base)?) as f64;

        let icr = if trigger_livetime > 0.0 { triggers / trigger_livetime } else { 0.0 };
        let ocr = if realtime > 0.0 { (mca_events + underflows + overflows) / realtime } else { 0.0 };

        Ok([
            realtime,
            trigger_livetime,
            energy_livetime,
            triggers,
            mca_events,
            icr,
            ocr,
            underflows,
            overflows,
        ])
    }
}
