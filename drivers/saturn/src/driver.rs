// SPDX-License-Identifier: LGPL-3.0-or-later

//! `SaturnDriver`: the single `ProductDriver` implementation for this
//! crate. Wires the filter/gain/detector-sync/sca/preset/statistics
//! submodules together behind the capability trait the core dispatches
//! through; holds no per-channel state of its own (everything mutable
//! lives in the `Module`/`Defaults`/`Detector` the core passes in).
//!
//! Grounded in `saturn_psl.c`'s `PSL_FuncSet` table: one function per
//! `ProductDriver` method, same division of labor between "acquisition
//! value" (persists to Defaults) and "board operation" (one-shot, no
//! persistence).

use dppctl_core::{
    mock::MemoryBus, Defaults, Detector, DetectorType, DeviceBus, Error, FirmwareKind, FirmwareSet, Module, ProductDriver, Result,
    RunDataValue, StatisticsLayout,
};

use crate::detector_sync::sync_detector;
use crate::gain::{calculate_gain, ev_per_adc, quick_run, recompute_gain_and_thresholds, update_baseline_threshold, update_energy_threshold, update_trigger_threshold};
use crate::filter::{update_fast_filter, update_slow_filter};
use crate::preset;
use crate::sca::{free_scas, set_number_scas};
use crate::statistics::{baseline_length, mca_start_address, number_mca_channels, statistics_layout, REQUIRED_DEFAULTS};
use crate::{DEFAULT_CLOCK_SPEED_MHZ, VALID_CLOCK_SPEEDS_MHZ};

/// Reference single-channel DSP product driver (§4.11).
#[derive(Debug, Default)]
pub struct SaturnDriver;

impl SaturnDriver {
    pub fn new() -> Self {
        SaturnDriver
    }
}

/// `pslGetClockSpeed`: reads SYSMICROSEC, falls back to the default with a
/// warning if the symbol can't be read, and rejects anything that isn't one
/// of the product's two supported speeds.
fn read_clock_speed(bus: &mut dyn DeviceBus, channel: i32) -> Result<f64> {
    let raw = match bus.read_symbol(channel, "SYSMICROSEC") {
        Ok(v) => v as f64,
        Err(_) => {
            tracing::warn!(channel, "SYSMICROSEC unreadable, using default clock speed");
            DEFAULT_CLOCK_SPEED_MHZ
        }
    };
    if !VALID_CLOCK_SPEEDS_MHZ.contains(&raw) {
        return Err(Error::ClockSpeed(raw));
    }
    Ok(raw)
}

impl ProductDriver for SaturnDriver {
    fn channel_count(&self) -> u32 {
        1
    }

    fn clock_speed_mhz(&self, module: &Module) -> Result<f64> {
        // The mock bus used outside of tests has no live SYSMICROSEC to
        // read without a channel context; callers that only have a Module
        // (preset/filter math ahead of any bus access) get the product
        // default, matching the reference's DEFAULT_CLOCK_SPEED fallback.
        let _ = module;
        Ok(DEFAULT_CLOCK_SPEED_MHZ)
    }

    /// `pslUpdateFilter` reads `DECIMATION` off the live DSP before every
    /// filter update (`saturn_psl.c:3722`) rather than assuming a fixed
    /// value; a product with a single fixed FiPPI could still report
    /// decimation > 0 at longer peaking times.
    fn decimation(&self, bus: &mut dyn DeviceBus, channel: i32) -> Result<u32> {
        Ok(bus.read_symbol(channel, "DECIMATION")? as u32)
    }

    fn statistics_layout(&self) -> StatisticsLayout {
        statistics_layout()
    }

    fn mca_start_address(&self, module: &Module, module_channel: u32) -> Result<u32> {
        mca_start_address(module, module_channel)
    }

    fn number_mca_channels(&self, defaults: &Defaults) -> Result<u32> {
        number_mca_channels(defaults)
    }

    fn baseline_length(&self, defaults: &Defaults) -> Result<u32> {
        baseline_length(defaults)
    }

    fn validate_module(&self, module: &Module) -> Result<()> {
        module.validate_channel_count(self.channel_count())
    }

    fn validate_defaults(&self, defaults: &Defaults) -> Result<()> {
        for (name, _) in REQUIRED_DEFAULTS {
            defaults.get(name)?;
        }
        Ok(())
    }

    fn download_firmware(
        &mut self,
        _bus: &mut dyn DeviceBus,
        channel: i32,
        kind: FirmwareKind,
        staged_path: &str,
        _module: &mut Module,
        _module_channel: u32,
        raw_name: &str,
        _defaults: &Defaults,
    ) -> Result<()> {
        tracing::info!(channel, ?kind, staged_path, raw_name, "firmware staged for download");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn set_acquisition_value(
        &mut self,
        bus: &mut dyn DeviceBus,
        channel: i32,
        name: &str,
        value: &mut f64,
        defaults: &mut Defaults,
        firmware_set: Option<&FirmwareSet>,
        _module: &mut Module,
        _module_channel: u32,
        _detector: Option<&Detector>,
        _detector_channel: u32,
    ) -> Result<()> {
        let clock_mhz = read_clock_speed(bus, channel).unwrap_or(DEFAULT_CLOCK_SPEED_MHZ);

        match name {
            "peaking_time" => {
                let gap_time = defaults.get("gap_time")?;
                let decimation = self.decimation(bus, channel)?;
                let (actual_pt, actual_gt) = update_slow_filter(bus, channel, clock_mhz, *value, gap_time, firmware_set, defaults, decimation)?;
                defaults.set("gap_time", actual_gt);
                *value = actual_pt;
                let preamp_gain = defaults.get("preamp_gain")?;
                recompute_gain_and_thresholds(bus, channel, clock_mhz, defaults, preamp_gain)?;
            }
            "gap_time" => {
                let peaking_time = defaults.get("peaking_time")?;
                let decimation = self.decimation(bus, channel)?;
                let (actual_pt, actual_gt) = update_slow_filter(bus, channel, clock_mhz, peaking_time, *value, firmware_set, defaults, decimation)?;
                defaults.set("peaking_time", actual_pt);
                *value = actual_gt;
            }
            "trigger_peaking_time" => {
                let trigger_gap_time = defaults.get("trigger_gap_time")?;
                let (actual_pt, actual_gt) = update_fast_filter(bus, channel, clock_mhz, *value, trigger_gap_time)?;
                defaults.set("trigger_gap_time", actual_gt);
                *value = actual_pt;
            }
            "trigger_gap_time" => {
                let trigger_peaking_time = defaults.get("trigger_peaking_time")?;
                let (actual_pt, actual_gt) = update_fast_filter(bus, channel, clock_mhz, trigger_peaking_time, *value)?;
                defaults.set("trigger_peaking_time", actual_pt);
                *value = actual_gt;
            }
            "trigger_threshold" => {
                let adc_percent_rule = defaults.get("adc_percent_rule")?;
                let calib_ev = defaults.get("calibration_energy")?;
                let trigger_peaking_time = defaults.get("trigger_peaking_time")?;
                let ev_adc = ev_per_adc(calib_ev, adc_percent_rule);
                *value = update_trigger_threshold(bus, channel, clock_mhz, trigger_peaking_time, ev_adc, *value)?;
            }
            "energy_threshold" => {
                let adc_percent_rule = defaults.get("adc_percent_rule")?;
                let calib_ev = defaults.get("calibration_energy")?;
                let ev_adc = ev_per_adc(calib_ev, adc_percent_rule);
                *value = update_energy_threshold(bus, channel, ev_adc, *value)?;
            }
            "baseline_threshold" => {
                let adc_percent_rule = defaults.get("adc_percent_rule")?;
                let calib_ev = defaults.get("calibration_energy")?;
                let ev_adc = ev_per_adc(calib_ev, adc_percent_rule);
                *value = update_baseline_threshold(bus, channel, ev_adc, *value)?;
            }
            "calibration_energy" | "adc_percent_rule" | "mca_bin_width" => {
                let preamp_gain = defaults.get("preamp_gain")?;
                defaults.set(name, *value);
                recompute_gain_and_thresholds(bus, channel, clock_mhz, defaults, preamp_gain)?;
            }
            "preamp_gain" => {
                recompute_gain_and_thresholds(bus, channel, clock_mhz, defaults, *value)?;
            }
            "number_mca_channels" => {
                if *value < 1.0 {
                    return Err(Error::BinsOor {
                        value: value.max(0.0) as u32,
                        min: 1,
                        max: u32::MAX,
                    });
                }
            }
            "max_width" => {
                if *value <= 0.0 {
                    return Err(Error::MaxwidthOor { value: *value, min: 0.0, max: f64::MAX });
                }
            }
            _ => return Err(Error::UnknownValue(name.to_string())),
        }
        Ok(())
    }

    fn get_acquisition_value(&self, bus: &mut dyn DeviceBus, channel: i32, name: &str, defaults: &Defaults) -> Result<f64> {
        match name {
            "gain_db" => {
                let adc_percent_rule = defaults.get("adc_percent_rule")?;
                let calib_ev = defaults.get("calibration_energy")?;
                let preamp_gain = defaults.get("preamp_gain")?;
                let mca_bin_width = defaults.get("mca_bin_width")?;
                let slowlen = bus.read_symbol(channel, "SLOWLEN")?;
                let (gaindac, _) = calculate_gain(adc_percent_rule, calib_ev, preamp_gain, mca_bin_width, slowlen)?;
                Ok(gaindac as f64)
            }
            _ => Err(Error::UnknownValue(name.to_string())),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn gain_operation(
        &mut self,
        bus: &mut dyn DeviceBus,
        channel: i32,
        name: &str,
        value: f64,
        _detector: Option<&Detector>,
        _module: &mut Module,
        _module_channel: u32,
        defaults: &mut Defaults,
    ) -> Result<()> {
        match name {
            "adjust_gain" => {
                let preamp_gain = value;
                defaults.set("preamp_gain", preamp_gain);
                let clock_mhz = read_clock_speed(bus, channel).unwrap_or(DEFAULT_CLOCK_SPEED_MHZ);
                recompute_gain_and_thresholds(bus, channel, clock_mhz, defaults, preamp_gain)
            }
            _ => Err(Error::UnknownValue(name.to_string())),
        }
    }

    fn gain_calibrate(
        &mut self,
        bus: &mut dyn DeviceBus,
        channel: i32,
        _detector: Option<&Detector>,
        _module: &mut Module,
        _module_channel: u32,
        defaults: &mut Defaults,
        delta_gain: f64,
    ) -> Result<()> {
        let preamp_gain = defaults.get("preamp_gain")? + delta_gain;
        if preamp_gain <= 0.0 {
            return Err(Error::GainOor {
                value: preamp_gain,
                min: dppctl_core::GAIN_MIN,
                max: dppctl_core::GAIN_MAX,
            });
        }
        defaults.set("preamp_gain", preamp_gain);
        let clock_mhz = read_clock_speed(bus, channel).unwrap_or(DEFAULT_CLOCK_SPEED_MHZ);
        recompute_gain_and_thresholds(bus, channel, clock_mhz, defaults, preamp_gain)
    }

    fn start_run(&mut self, bus: &mut dyn DeviceBus, channel: i32, resume: bool, _defaults: &Defaults, _module: &mut Module) -> Result<()> {
        bus.start_run(channel, resume)
    }

    fn stop_run(&mut self, bus: &mut dyn DeviceBus, channel: i32, _module: &mut Module) -> Result<()> {
        bus.stop_run(channel)
    }

    fn get_run_data(&self, bus: &mut dyn DeviceBus, channel: i32, name: &str, defaults: &Defaults, module: &Module) -> Result<RunDataValue> {
        if dppctl_core::CAPTURE_TASKS.contains(&name) {
            let len = baseline_length(defaults)? as usize;
            let _ = module;
            return Ok(RunDataValue::Buffer(preset::read_capture_buffer(bus, channel, name, len)?));
        }
        Err(Error::UnknownValue(name.to_string()))
    }

    fn do_special_run(
        &mut self,
        bus: &mut dyn DeviceBus,
        channel: i32,
        name: &str,
        info: &[f64],
        _defaults: &Defaults,
        _detector: Option<&Detector>,
        _detector_channel: u32,
    ) -> Result<()> {
        preset::do_special_run(bus, channel, name, info)
    }

    fn get_special_run_data(&self, bus: &mut dyn DeviceBus, channel: i32, name: &str, _defaults: &Defaults) -> Result<f64> {
        preset::get_special_run_data(bus, channel, name)
    }

    #[allow(clippy::too_many_arguments)]
    fn user_setup(
        &mut self,
        bus: &mut dyn DeviceBus,
        channel: i32,
        _defaults: &mut Defaults,
        _firmware_set: Option<&FirmwareSet>,
        detector_type: DetectorType,
        detector: Option<&Detector>,
        detector_channel: u32,
        _module: &mut Module,
        _module_channel: u32,
    ) -> Result<()> {
        let clock_mhz = read_clock_speed(bus, channel).unwrap_or(DEFAULT_CLOCK_SPEED_MHZ);
        sync_detector(bus, channel, clock_mhz, detector_type, detector, detector_channel)
    }

    fn module_setup(&mut self, bus: &mut dyn DeviceBus, channel: i32, _defaults: &Defaults, _module: &mut Module) -> Result<()> {
        // Single-channel product: nothing module-wide left to latch once
        // every channel has run its own user_setup.
        let _ = (bus, channel);
        Ok(())
    }

    fn num_defaults(&self) -> usize {
        REQUIRED_DEFAULTS.len()
    }

    fn default_seed(&self, index: usize) -> (String, f64) {
        let (name, value) = REQUIRED_DEFAULTS[index];
        (name.to_string(), value)
    }

    fn get_parameter(&self, bus: &mut dyn DeviceBus, channel: i32, name: &str) -> Result<f64> {
        bus.read_symbol(channel, name).map(|v| v as f64)
    }

    fn set_parameter(&mut self, bus: &mut dyn DeviceBus, channel: i32, name: &str, value: f64) -> Result<()> {
        if !(0.0..=u16::MAX as f64).contains(&value) {
            return Err(Error::BadValue { name: name.to_string(), value: value.to_string() });
        }
        bus.write_symbol(channel, name, value.round() as u16)?;
        quick_run(bus, channel)
    }

    fn num_params(&self, bus: &mut dyn DeviceBus, channel: i32) -> Result<usize> {
        let _ = (bus, channel);
        Ok(0)
    }

    fn param_name_by_index(&self, bus: &mut dyn DeviceBus, channel: i32, index: usize) -> Result<String> {
        bus.symbol_name(channel, index as u16)
    }

    fn board_operation(&mut self, bus: &mut dyn DeviceBus, channel: i32, name: &str, value: &mut f64, _defaults: &Defaults) -> Result<()> {
        match name {
            "get_cpld_version" => {
                *value = preset::get_special_run_data(bus, channel, "get_cpld_version")?;
                Ok(())
            }
            _ => {
                tracing::debug!(channel, name, "board operation ignored by this product");
                Ok(())
            }
        }
    }

    fn free_scas(&mut self, module: &mut Module, module_channel: u32) -> Result<()> {
        free_scas(module, module_channel)
    }

    fn unhook(&mut self, channel: i32) -> Result<()> {
        tracing::debug!(channel, "unhooking channel");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use dppctl_core::mock::StaticArchive;
    use dppctl_core::LibraryState;

    fn seeded_defaults() -> Defaults {
        let mut d = Defaults::new();
        for (name, value) in REQUIRED_DEFAULTS {
            d.set(name, *value);
        }
        d
    }

    #[test]
    fn validate_defaults_requires_every_seed_value() {
        let driver = SaturnDriver::new();
        let mut d = Defaults::new();
        assert!(driver.validate_defaults(&d).is_err());
        d = seeded_defaults();
        assert!(driver.validate_defaults(&d).is_ok());
    }

    /// `MemoryBus::start_run` always leaves `BUSY=1`, so it can't model
    /// hardware reaching the apply-latched state on its own; this wraps a
    /// real `MemoryBus` and force-latches `BUSY` the instant a run starts,
    /// while every other operation (symbol reads/writes included) is
    /// delegated straight through so the test can still inspect what the
    /// driver wrote.
    struct LatchedMemoryBus(MemoryBus);

    impl DeviceBus for LatchedMemoryBus {
        fn open(&mut self, interface_kind: &str, address: &str) -> Result<()> {
            self.0.open(interface_kind, address)
        }
        fn close(&mut self) -> Result<()> {
            self.0.close()
        }
        fn read_memory(&mut self, region: dppctl_core::MemRegion, addr: u32, len: usize) -> Result<Vec<u16>> {
            self.0.read_memory(region, addr, len)
        }
        fn write_memory(&mut self, region: dppctl_core::MemRegion, addr: u32, data: &[u16]) -> Result<()> {
            self.0.write_memory(region, addr, data)
        }
        fn read_register(&mut self, name: &str) -> Result<u16> {
            self.0.read_register(name)
        }
        fn write_register(&mut self, name: &str, value: u16) -> Result<()> {
            self.0.write_register(name, value)
        }
        fn start_run(&mut self, channel: i32, resume: bool) -> Result<()> {
            self.0.start_run(channel, resume)?;
            self.0.set_busy(channel, dppctl_core::BUSY_APPLY_LATCHED);
            Ok(())
        }
        fn stop_run(&mut self, channel: i32) -> Result<()> {
            self.0.stop_run(channel)
        }
        fn control_task_start(&mut self, channel: i32, task_id: u32, args: &[f64]) -> Result<()> {
            self.0.control_task_start(channel, task_id, args)
        }
        fn control_task_poll_busy(&mut self, channel: i32) -> Result<bool> {
            self.0.control_task_poll_busy(channel)
        }
        fn control_task_read_result(&mut self, channel: i32, len: usize) -> Result<Vec<u16>> {
            self.0.control_task_read_result(channel, len)
        }
        fn control_task_stop(&mut self, channel: i32) -> Result<()> {
            self.0.control_task_stop(channel)
        }
        fn symbol_index(&mut self, channel: i32, name: &str) -> Result<u16> {
            self.0.symbol_index(channel, name)
        }
        fn symbol_name(&mut self, channel: i32, index: u16) -> Result<String> {
            self.0.symbol_name(channel, index)
        }
        fn symbol_bounds(&mut self, channel: i32, name: &str) -> Result<(f64, f64)> {
            self.0.symbol_bounds(channel, name)
        }
        fn read_symbol(&mut self, channel: i32, name: &str) -> Result<u16> {
            self.0.read_symbol(channel, name)
        }
        fn write_symbol(&mut self, channel: i32, name: &str, value: u16) -> Result<()> {
            self.0.write_symbol(channel, name, value)
        }
        fn clock_tick(&mut self) -> Result<u64> {
            self.0.clock_tick()
        }
        fn alloc(&mut self, len: usize) -> Result<u32> {
            self.0.alloc(len)
        }
        fn free(&mut self, addr: u32) -> Result<()> {
            self.0.free(addr)
        }
    }

    #[test]
    fn set_peaking_time_updates_filter_and_regains() {
        let mut bus = LatchedMemoryBus(MemoryBus::new());
        bus.0.set_symbol("DECIMATION", 3);
        let mut driver = SaturnDriver::new();
        let mut defaults = seeded_defaults();
        let mut module = Module::new();
        module.set_number_of_channels(1).unwrap();
        let mut value = 8.0;
        driver
            .set_acquisition_value(&mut bus, 0, "peaking_time", &mut value, &mut defaults, None, &mut module, 0, None, 0)
            .unwrap();
        assert!((value - 8.0).abs() < 0.25);
        assert!(bus.0.symbol("GAINDAC") > 0);
    }

    #[test]
    fn gain_calibrate_rejects_nonpositive_result() {
        let mut bus = MemoryBus::new();
        let mut driver = SaturnDriver::new();
        let mut defaults = seeded_defaults();
        let mut module = Module::new();
        module.set_number_of_channels(1).unwrap();
        let err = driver
            .gain_calibrate(&mut bus, 0, None, &mut module, 0, &mut defaults, -10.0)
            .unwrap_err();
        assert!(matches!(err, Error::GainOor { .. }));
    }

    #[test]
    fn full_library_start_system_with_saturn_driver() {
        let mut lib = LibraryState::new(Box::new(MemoryBus::new()), Box::new(StaticArchive::new("/tmp")));
        lib.register_driver("saturn", Box::new(SaturnDriver::new()));
        lib.init_handel().unwrap();
        lib.new_module("mod0").unwrap();
        lib.add_module_item("mod0", "product_type", "saturn").unwrap();
        lib.add_module_item("mod0", "number_of_channels", "1").unwrap();
        lib.add_module_item("mod0", "interface", "usb").unwrap();
        lib.add_module_item("mod0", "device_number", "0").unwrap();
        lib.add_module_item("mod0", "channel0_logical_channel", "0").unwrap();
        lib.new_defaults("def0").unwrap();
        for (name, value) in REQUIRED_DEFAULTS {
            lib.add_default_item("def0", name, *value).unwrap();
        }
        lib.add_module_item("mod0", "channel0_defaults", "def0").unwrap();
        lib.start_system().unwrap();
    }
}
