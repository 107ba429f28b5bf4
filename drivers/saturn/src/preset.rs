// SPDX-License-Identifier: LGPL-3.0-or-later

//! Named special-run dispatch: maps the handful of control tasks this
//! product exposes to the control-task ids `pslDoSpecialRun` issues, and
//! leaves the generic busy-poll/auto-stop sequencing to
//! `dppctl_core::RunController`.
//!
//! Capture tasks (`baseline_history`, `adc_trace`, `external_memory`) are
//! read out through `SaturnDriver::get_run_data` while still busy-free but
//! un-stopped; `get_special_run_data` is what finally issues the stop, per
//! `RunController`'s `CAPTURE_TASKS` exemption.

use dppctl_core::{DeviceBus, Error, Result, RunController};

const TASK_BASELINE_HISTORY: u32 = 0;
const TASK_ADC_TRACE: u32 = 1;
const TASK_EXTERNAL_MEMORY: u32 = 2;
const TASK_CPLD_VERSION: u32 = 3;

fn task_id(name: &str) -> Result<u32> {
    match name {
        "baseline_history" => Ok(TASK_BASELINE_HISTORY),
        "adc_trace" => Ok(TASK_ADC_TRACE),
        "external_memory" => Ok(TASK_EXTERNAL_MEMORY),
        "get_cpld_version" => Ok(TASK_CPLD_VERSION),
        _ => Err(Error::UnknownValue(name.to_string())),
    }
}

pub fn do_special_run(bus: &mut dyn DeviceBus, channel: i32, name: &str, info: &[f64]) -> Result<()> {
    let id = task_id(name)?;
    RunController::do_special_run(bus, channel, id, name, info)
}

/// Scalar result for a special run. For the three capture tasks this is
/// also the point the control task is finally stopped — the buffer itself
/// is read separately through `get_run_data` while the task is still busy.
pub fn get_special_run_data(bus: &mut dyn DeviceBus, channel: i32, name: &str) -> Result<f64> {
    task_id(name)?;
    let data = RunController::get_special_run_data(bus, channel, name, 1)?;
    Ok(*data.first().unwrap_or(&0) as f64)
}

/// Raw capture buffer for the three capture tasks, read without stopping
/// the control task (`SaturnDriver::get_run_data` fallback).
pub fn read_capture_buffer(bus: &mut dyn DeviceBus, channel: i32, name: &str, len: usize) -> Result<Vec<i32>> {
    task_id(name)?;
    if !dppctl_core::CAPTURE_TASKS.contains(&name) {
        return Err(Error::UnknownValue(name.to_string()));
    }
    let words = bus.control_task_read_result(channel, len)?;
    Ok(words.into_iter().map(|w| w as i32).collect())
}

#[cfg(test)]
mod test {
    use super::*;
    use dppctl_core::mock::MemoryBus;

    #[test]
    fn rejects_unknown_special_run_names() {
        let mut bus = MemoryBus::new();
        let err = do_special_run(&mut bus, 0, "not_a_task", &[]).unwrap_err();
        assert!(matches!(err, Error::UnknownValue(_)));
    }

    #[test]
    fn capture_task_round_trips_through_start_read_stop() {
        let mut bus = MemoryBus::new();
        do_special_run(&mut bus, 0, "adc_trace", &[]).unwrap();
        let buf = read_capture_buffer(&mut bus, 0, "adc_trace", 4).unwrap();
        assert_eq!(buf.len(), 4);
        get_special_run_data(&mut bus, 0, "adc_trace").unwrap();
    }

    #[test]
    fn non_capture_task_is_not_readable_as_a_buffer() {
        let mut bus = MemoryBus::new();
        do_special_run(&mut bus, 0, "get_cpld_version", &[]).unwrap();
        let err = read_capture_buffer(&mut bus, 0, "get_cpld_version", 1).unwrap_err();
        assert!(matches!(err, Error::UnknownValue(_)));
    }
}
