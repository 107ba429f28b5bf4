// SPDX-License-Identifier: LGPL-3.0-or-later

//! Acquisition-value translation engine (L6, §4.6): named, physics-level
//! set/get/remove dispatch, SCA endpoint bookkeeping, preset-composite
//! decomposition, and the generic slow-filter update formula shared by every
//! product driver's peaking-time handling.

use tracing::info;

use crate::capability::{DeviceBus, FirmwareArchive, ProductDriver};
use crate::defaults::Defaults;
use crate::detector::{Detector, DetectorType};
use crate::error::{Error, Result};
use crate::firmware::{FirmwareKind, FirmwareSet};
use crate::module::Module;
use crate::resolver::FirmwareResolver;

/// Matches `XIA_MAX_SCAS` in spirit: a per-channel cap on the number of
/// single-channel-analyzer regions a product need support.
pub const MAX_SCAS: usize = 16;

/// Tick divisor in the preset-length formula (§4.9): `16 / (clock_MHz × 1e6)`
/// seconds per count.
pub const PRESET_TICK_DIVISOR: f64 = 16.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaEndpoint {
    Lo,
    Hi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresetKind {
    Runtime,
    Livetime,
    Output,
    Input,
    Standard,
}

impl PresetKind {
    /// The `PRESET` DSP symbol encoding: none, fixed-real, fixed-live,
    /// fixed-events, fixed-triggers (§4.9).
    fn code(self) -> u16 {
        match self {
            PresetKind::Standard => 0,
            PresetKind::Runtime => 1,
            PresetKind::Livetime => 2,
            PresetKind::Output => 3,
            PresetKind::Input => 4,
        }
    }

    fn is_time_based(self) -> bool {
        matches!(self, PresetKind::Runtime | PresetKind::Livetime)
    }
}

/// A parsed acquisition-value name (§9 "Dynamic named parameters"): parsed
/// once rather than re-matched by string prefix at every call site.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionName {
    Sca { index: u16, endpoint: ScaEndpoint },
    Preset(PresetKind),
    /// All-uppercase name with no recognized structure: a direct DSP symbol
    /// passthrough.
    DspSymbol(String),
    /// Anything else — dispatched to the driver by name, or handled
    /// specially by the engine (`peaking_time`).
    Known(String),
}

impl AcquisitionName {
    pub fn parse(name: &str) -> Self {
        let lname = name.to_lowercase();
        if let Some(rest) = lname.strip_prefix("sca") {
            if let Some((idx_str, endpoint_str)) = rest.split_once('_') {
                if let Ok(index) = idx_str.parse::<u16>() {
                    match endpoint_str {
                        "lo" => return AcquisitionName::Sca { index, endpoint: ScaEndpoint::Lo },
                        "hi" => return AcquisitionName::Sca { index, endpoint: ScaEndpoint::Hi },
                        _ => {}
                    }
                }
            }
        }
        match lname.as_str() {
            "preset_runtime" => return AcquisitionName::Preset(PresetKind::Runtime),
            "preset_livetime" => return AcquisitionName::Preset(PresetKind::Livetime),
            "preset_output" => return AcquisitionName::Preset(PresetKind::Output),
            "preset_input" => return AcquisitionName::Preset(PresetKind::Input),
            "preset_standard" => return AcquisitionName::Preset(PresetKind::Standard),
            _ => {}
        }
        let is_symbol = !name.is_empty()
            && name.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
            && name.chars().any(|c| c.is_ascii_uppercase());
        if is_symbol {
            AcquisitionName::DspSymbol(name.to_string())
        } else {
            AcquisitionName::Known(lname)
        }
    }
}

/// Output of the generic slow-filter update (§4.6 "Filter update"); the
/// reference product's decimation and clock speed parameterize it, but the
/// formula itself is shared machinery.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterUpdate {
    pub slowlen: u32,
    pub slowgap: u32,
    pub peakint: u32,
    pub peaksam: u32,
    pub actual_peaking_time: f64,
    pub actual_gap_time: f64,
}

/// SLOWLEN/SLOWGAP/PEAKINT/PEAKSAM from peaking/gap time, clock speed,
/// decimation and the firmware's filter-info offsets (§4.6).
pub fn compute_filter_update(
    peaking_time: f64,
    gap_time: f64,
    clock_mhz: f64,
    decimation: u32,
    peakint_offset: u16,
    peaksam_offset: u16,
) -> Result<FilterUpdate> {
    if clock_mhz <= 0.0 {
        return Err(Error::ClockSpeed(clock_mhz));
    }
    let ticks_per_unit = clock_mhz / (1u64 << decimation) as f64;

    let slowlen_i = (peaking_time * ticks_per_unit).round() as i64;
    if !(2..=28).contains(&slowlen_i) {
        return Err(Error::SlowlenOor(slowlen_i));
    }
    let slowlen = slowlen_i as u32;

    let slowgap_i = (gap_time * ticks_per_unit).ceil() as i64;
    let mut slowgap = slowgap_i.clamp(3, 29) as u32;

    if slowlen + slowgap > 31 {
        let shrunk = 31 - slowlen;
        info!(slowlen, from = slowgap, to = shrunk, "shrinking SLOWGAP to fit SLOWLEN+SLOWGAP<=31");
        slowgap = shrunk;
    }

    let peakint = slowlen + slowgap + peakint_offset as u32;
    let peaksam = peakint.saturating_sub(peaksam_offset as u32);

    Ok(FilterUpdate {
        slowlen,
        slowgap,
        peakint,
        peaksam,
        actual_peaking_time: slowlen as f64 / ticks_per_unit,
        actual_gap_time: slowgap as f64 / ticks_per_unit,
    })
}

pub struct AcquisitionEngine;

impl AcquisitionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn set(
        bus: &mut dyn DeviceBus,
        archive: &mut dyn FirmwareArchive,
        driver: &mut dyn ProductDriver,
        channel: i32,
        name: &str,
        value: &mut f64,
        defaults: &mut Defaults,
        firmware_set: Option<&FirmwareSet>,
        detector: Option<&Detector>,
        detector_channel: u32,
        detector_type: DetectorType,
        module: &mut Module,
        module_channel: u32,
    ) -> Result<()> {
        match AcquisitionName::parse(name) {
            AcquisitionName::Known(n) if n == "peaking_time" => Self::set_peaking_time(
                bus,
                archive,
                driver,
                channel,
                value,
                defaults,
                firmware_set,
                detector,
                detector_channel,
                detector_type,
                module,
                module_channel,
            ),
            AcquisitionName::Known(n) => {
                driver.set_acquisition_value(
                    bus,
                    channel,
                    &n,
                    value,
                    defaults,
                    firmware_set,
                    module,
                    module_channel,
                    detector,
                    detector_channel,
                )?;
                defaults.set(&n, *value);
                Ok(())
            }
            AcquisitionName::DspSymbol(sym) => {
                if !(0.0..=u16::MAX as f64).contains(value) {
                    return Err(Error::BadValue {
                        name: sym,
                        value: value.to_string(),
                    });
                }
                bus.write_symbol(channel, &sym, value.round() as u16)?;
                defaults.set(&sym, *value);
                Ok(())
            }
            AcquisitionName::Sca { index, endpoint } => {
                Self::set_sca(bus, channel, module, module_channel, index, endpoint, value, defaults)
            }
            AcquisitionName::Preset(kind) => {
                Self::set_preset(bus, &*driver, module, channel, kind, value, defaults, name)
            }
        }
    }

    pub fn get(
        bus: &mut dyn DeviceBus,
        driver: &dyn ProductDriver,
        channel: i32,
        name: &str,
        defaults: &Defaults,
        module: &Module,
        module_channel: u32,
    ) -> Result<f64> {
        match AcquisitionName::parse(name) {
            AcquisitionName::Known(n) => match defaults.entry(&n) {
                Some(e) if e.read_only => driver.get_acquisition_value(bus, channel, &n, defaults),
                Some(e) => Ok(e.current),
                None => Err(Error::UnknownValue(n)),
            },
            AcquisitionName::DspSymbol(sym) => bus.read_symbol(channel, &sym).map(|v| v as f64),
            AcquisitionName::Sca { index, endpoint } => {
                let ch = module.channel(module_channel)?;
                let sca = ch.scas.get(index as usize).ok_or(Error::NoSca(index))?;
                Ok(match endpoint {
                    ScaEndpoint::Lo => sca.lo as f64,
                    ScaEndpoint::Hi => sca.hi as f64,
                })
            }
            AcquisitionName::Preset(_) => defaults.get(&name.to_lowercase()),
        }
    }

    /// Drops the Defaults entry for `name`. Triggering the `user_setup`
    /// rerun the contract calls for (§4.6) is `LibraryState`'s job — it is
    /// the only layer holding both this engine and the user-setup sequencer.
    pub fn remove(defaults: &mut Defaults, name: &str) -> Result<()> {
        let key = match AcquisitionName::parse(name) {
            AcquisitionName::Known(n) => n,
            AcquisitionName::DspSymbol(sym) => sym,
            AcquisitionName::Sca { index, endpoint } => format!(
                "sca{}_{}",
                index,
                match endpoint {
                    ScaEndpoint::Lo => "lo",
                    ScaEndpoint::Hi => "hi",
                }
            ),
            AcquisitionName::Preset(_) => name.to_lowercase(),
        };
        defaults.remove(&key)
    }

    #[allow(clippy::too_many_arguments)]
    fn set_sca(
        bus: &mut dyn DeviceBus,
        channel: i32,
        module: &mut Module,
        module_channel: u32,
        index: u16,
        endpoint: ScaEndpoint,
        value: &mut f64,
        defaults: &mut Defaults,
    ) -> Result<()> {
        if index as usize >= MAX_SCAS {
            return Err(Error::MaxScas(MAX_SCAS as u32));
        }
        if !(0.0..=u16::MAX as f64).contains(value) {
            return Err(Error::ScaOor(index));
        }
        let v = value.round() as u32;
        let lo_key = format!("sca{}_lo", index);
        let hi_key = format!("sca{}_hi", index);

        match endpoint {
            ScaEndpoint::Lo => {
                if let Ok(hi) = defaults.get(&hi_key) {
                    if v as f64 > hi {
                        return Err(Error::BinMismatch { channel, index });
                    }
                }
            }
            ScaEndpoint::Hi => {
                if let Ok(lo) = defaults.get(&lo_key) {
                    if (v as f64) < lo {
                        return Err(Error::BinMismatch { channel, index });
                    }
                }
            }
        }

        let sym = format!(
            "sca{}_{}",
            index,
            match endpoint {
                ScaEndpoint::Lo => "lo",
                ScaEndpoint::Hi => "hi",
            }
        );
        bus.write_symbol(channel, &sym, v as u16)?;
        defaults.set(
            match endpoint {
                ScaEndpoint::Lo => &lo_key,
                ScaEndpoint::Hi => &hi_key,
            },
            v as f64,
        );

        let ch = module.channel_mut(module_channel)?;
        if ch.scas.len() <= index as usize {
            ch.scas.resize(index as usize + 1, crate::module::Sca { lo: 0, hi: 0 });
        }
        match endpoint {
            ScaEndpoint::Lo => ch.scas[index as usize].lo = v,
            ScaEndpoint::Hi => ch.scas[index as usize].hi = v,
        }
        *value = v as f64;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn set_preset(
        bus: &mut dyn DeviceBus,
        driver: &dyn ProductDriver,
        module: &Module,
        channel: i32,
        kind: PresetKind,
        value: &mut f64,
        defaults: &mut Defaults,
        original_name: &str,
    ) -> Result<()> {
        if *value < 0.0 {
            return Err(Error::PresetValueOor(*value));
        }
        let preset_len: u32 = if kind.is_time_based() {
            let clock_mhz = driver.clock_speed_mhz(module)?;
            let ticks = (*value * clock_mhz * 1e6 / PRESET_TICK_DIVISOR).round();
            if ticks < 0.0 || ticks > u32::MAX as f64 {
                return Err(Error::PresetValueOor(*value));
            }
            ticks as u32
        } else {
            if *value > u32::MAX as f64 {
                return Err(Error::PresetValueOor(*value));
            }
            value.round() as u32
        };

        bus.write_symbol(channel, "PRESET", kind.code())?;
        bus.write_symbol(channel, "PRESETLEN0", (preset_len >> 16) as u16)?;
        bus.write_symbol(channel, "PRESETLEN1", (preset_len & 0xFFFF) as u16)?;

        let actual = if kind.is_time_based() {
            let clock_mhz = driver.clock_speed_mhz(module)?;
            preset_len as f64 * PRESET_TICK_DIVISOR / (clock_mhz * 1e6)
        } else {
            preset_len as f64
        };
        *value = actual;
        defaults.set(&original_name.to_lowercase(), actual);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn set_peaking_time(
        bus: &mut dyn DeviceBus,
        archive: &mut dyn FirmwareArchive,
        driver: &mut dyn ProductDriver,
        channel: i32,
        value: &mut f64,
        defaults: &mut Defaults,
        firmware_set: Option<&FirmwareSet>,
        detector: Option<&Detector>,
        detector_channel: u32,
        detector_type: DetectorType,
        module: &mut Module,
        module_channel: u32,
    ) -> Result<()> {
        if let Some(fs) = firmware_set {
            for kind in [
                FirmwareKind::Dsp,
                FirmwareKind::Fippi,
                FirmwareKind::UserDsp,
                FirmwareKind::UserFippi,
            ] {
                let resolved = match FirmwareResolver::resolve(fs, kind, *value, detector_type, Some(defaults), None, archive) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                let needs = module
                    .channel(module_channel)?
                    .current_firmware
                    .needs_download(kind, &resolved.raw_name);
                if needs {
                    driver.download_firmware(
                        bus,
                        channel,
                        kind,
                        &resolved.staged_path,
                        module,
                        module_channel,
                        &resolved.raw_name,
                        defaults,
                    )?;
                    module
                        .channel_mut(module_channel)?
                        .current_firmware
                        .set(kind, resolved.raw_name);
                }
            }
        }

        driver.set_acquisition_value(
            bus,
            channel,
            "peaking_time",
            value,
            defaults,
            firmware_set,
            module,
            module_channel,
            detector,
            detector_channel,
        )?;
        defaults.set("peaking_time", *value);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::capability::mock::{MemoryBus, StaticArchive};
    use crate::capability::RunDataValue;

    #[test]
    fn parse_recognizes_sca_and_preset_and_symbol() {
        assert_eq!(
            AcquisitionName::parse("sca3_lo"),
            AcquisitionName::Sca { index: 3, endpoint: ScaEndpoint::Lo }
        );
        assert_eq!(AcquisitionName::parse("preset_livetime"), AcquisitionName::Preset(PresetKind::Livetime));
        assert_eq!(AcquisitionName::parse("SLOWLEN"), AcquisitionName::DspSymbol("SLOWLEN".into()));
        assert_eq!(AcquisitionName::parse("trigger_threshold"), AcquisitionName::Known("trigger_threshold".into()));
    }

    #[test]
    fn slowlen_boundaries_enforced() {
        let ok_low = compute_filter_update(2.0, 1.0, 1.0, 0, 2, 2).unwrap();
        assert_eq!(ok_low.slowlen, 2);
        let ok_high = compute_filter_update(28.0, 1.0, 1.0, 0, 2, 2).unwrap();
        assert_eq!(ok_high.slowlen, 28);
        assert!(compute_filter_update(1.0, 1.0, 1.0, 0, 2, 2).is_err());
        assert!(compute_filter_update(29.0, 1.0, 1.0, 0, 2, 2).is_err());
    }

    #[test]
    fn sca_monotonic_ordering_enforced() {
        let mut bus = MemoryBus::new();
        let mut module = Module::new();
        module.set_number_of_channels(1).unwrap();
        let mut defaults = Defaults::new();

        let mut lo = 10.0;
        AcquisitionEngine::set_sca(&mut bus, 0, &mut module, 0, ScaEndpoint::Lo, &mut lo, &mut defaults).unwrap();
        let mut bad_hi = 5.0;
        let err = AcquisitionEngine::set_sca(&mut bus, 0, &mut module, 0, ScaEndpoint::Hi, &mut bad_hi, &mut defaults).unwrap_err();
        assert!(matches!(err, Error::BinMismatch { .. }));

        let mut good_hi = 20.0;
        AcquisitionEngine::set_sca(&mut bus, 0, &mut module, 0, ScaEndpoint::Hi, &mut good_hi, &mut defaults).unwrap();
        assert_eq!(module.channel(0).unwrap().scas[0].lo, 10);
        assert_eq!(module.channel(0).unwrap().scas[0].hi, 20);
    }

    struct StubDriver {
        clock_mhz: f64,
    }

    impl ProductDriver for StubDriver {
        fn channel_count(&self) -> u32 {
            1
        }
        fn clock_speed_mhz(&self, _module: &Module) -> Result<f64> {
            Ok(self.clock_mhz)
        }
        fn decimation(&self, _bus: &mut dyn DeviceBus, _channel: i32) -> Result<u32> {
            Ok(0)
        }
        fn statistics_layout(&self) -> crate::capability::StatisticsLayout {
            crate::capability::StatisticsLayout {
                realtime_base: "REALTIME".into(),
                trigger_livetime_base: "LIVETIME".into(),
                energy_livetime_base: "ELIVETIME".into(),
                triggers_base: "TRIGGERS".into(),
                mca_events_base: "FASTPEAKS".into(),
                underflows_base: "UNDERFLOWS".into(),
                overflows_base: "OVERFLOWS".into(),
                total_output_events_base: "TOTALEVENTS".into(),
            }
        }
        fn mca_start_address(&self, _module: &Module, _module_channel: u32) -> Result<u32> {
            Ok(0)
        }
        fn number_mca_channels(&self, _defaults: &Defaults) -> Result<u32> {
            Ok(2048)
        }
        fn baseline_length(&self, _defaults: &Defaults) -> Result<u32> {
            Ok(256)
        }
        fn validate_module(&self, _module: &Module) -> Result<()> {
            Ok(())
        }
        fn validate_defaults(&self, _defaults: &Defaults) -> Result<()> {
            Ok(())
        }
        fn download_firmware(
            &mut self,
            _bus: &mut dyn DeviceBus,
            _channel: i32,
            _kind: FirmwareKind,
            _staged_path: &str,
            _module: &mut Module,
            _module_channel: u32,
            _raw_name: &str,
            _defaults: &Defaults,
        ) -> Result<()> {
            Ok(())
        }
        fn set_acquisition_value(
            &mut self,
            _bus: &mut dyn DeviceBus,
            _channel: i32,
            _name: &str,
            _value: &mut f64,
            _defaults: &mut Defaults,
            _firmware_set: Option<&FirmwareSet>,
            _module: &mut Module,
            _module_channel: u32,
            _detector: Option<&Detector>,
            _detector_channel: u32,
        ) -> Result<()> {
            Ok(())
        }
        fn get_acquisition_value(&self, _bus: &mut dyn DeviceBus, _channel: i32, _name: &str, _defaults: &Defaults) -> Result<f64> {
            Ok(0.0)
        }
        fn gain_operation(
            &mut self,
            _bus: &mut dyn DeviceBus,
            _channel: i32,
            _name: &str,
            _value: f64,
            _detector: Option<&Detector>,
            _module: &mut Module,
            _module_channel: u32,
            _defaults: &mut Defaults,
        ) -> Result<()> {
            Ok(())
        }
        fn gain_calibrate(
            &mut self,
            _bus: &mut dyn DeviceBus,
            _channel: i32,
            _detector: Option<&Detector>,
            _module: &mut Module,
            _module_channel: u32,
            _defaults: &mut Defaults,
            _delta_gain: f64,
        ) -> Result<()> {
            Ok(())
        }
        fn start_run(&mut self, _bus: &mut dyn DeviceBus, _channel: i32, _resume: bool, _defaults: &Defaults, _module: &mut Module) -> Result<()> {
            Ok(())
        }
        fn stop_run(&mut self, _bus: &mut dyn DeviceBus, _channel: i32, _module: &mut Module) -> Result<()> {
            Ok(())
        }
        fn get_run_data(&self, _bus: &mut dyn DeviceBus, _channel: i32, _name: &str, _defaults: &Defaults, _module: &Module) -> Result<RunDataValue> {
            Ok(RunDataValue::Scalar(0.0))
        }
        fn do_special_run(
            &mut self,
            _bus: &mut dyn DeviceBus,
            _channel: i32,
            _name: &str,
            _info: &[f64],
            _defaults: &Defaults,
            _detector: Option<&Detector>,
            _detector_channel: u32,
        ) -> Result<()> {
            Ok(())
        }
        fn get_special_run_data(&self, _bus: &mut dyn DeviceBus, _channel: i32, _name: &str, _defaults: &Defaults) -> Result<f64> {
            Ok(0.0)
        }
        fn user_setup(
            &mut self,
            _bus: &mut dyn DeviceBus,
            _channel: i32,
            _defaults: &mut Defaults,
            _firmware_set: Option<&FirmwareSet>,
            _detector_type: DetectorType,
            _detector: Option<&Detector>,
            _detector_channel: u32,
            _module: &mut Module,
            _module_channel: u32,
        ) -> Result<()> {
            Ok(())
        }
        fn module_setup(&mut self, _bus: &mut dyn DeviceBus, _channel: i32, _defaults: &Defaults, _module: &mut Module) -> Result<()> {
            Ok(())
        }
        fn num_defaults(&self) -> usize {
            0
        }
        fn default_seed(&self, _index: usize) -> (String, f64) {
            (String::new(), 0.0)
        }
        fn get_parameter(&self, _bus: &mut dyn DeviceBus, _channel: i32, _name: &str) -> Result<f64> {
            Ok(0.0)
        }
        fn set_parameter(&mut self, _bus: &mut dyn DeviceBus, _channel: i32, _name: &str, _value: f64) -> Result<()> {
            Ok(())
        }
        fn num_params(&self, _bus: &mut dyn DeviceBus, _channel: i32) -> Result<usize> {
            Ok(0)
        }
        fn param_name_by_index(&self, _bus: &mut dyn DeviceBus, _channel: i32, _index: usize) -> Result<String> {
            Ok(String::new())
        }
        fn board_operation(&mut self, _bus: &mut dyn DeviceBus, _channel: i32, _name: &str, _value: &mut f64, _defaults: &Defaults) -> Result<()> {
            Ok(())
        }
        fn free_scas(&mut self, _module: &mut Module, _module_channel: u32) -> Result<()> {
            Ok(())
        }
        fn unhook(&mut self, _channel: i32) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn preset_livetime_quantizes_length_scenario_6() {
        let mut bus = MemoryBus::new();
        let driver = StubDriver { clock_mhz: 20.0 };
        let module = Module::new();
        let mut defaults = Defaults::new();
        let mut value = 0.5;
        AcquisitionEngine::set_preset(&mut bus, &driver, &module, 0, PresetKind::Livetime, &mut value, &mut defaults, "preset_livetime").unwrap();
        assert_eq!(bus.symbol("PRESET"), 2);
        let expected_len = (0.5_f64 * 20.0 * 1e6 / 16.0).round() as u32;
        let hi = (bus.symbol("PRESETLEN0") as u32) << 16;
        let lo = bus.symbol("PRESETLEN1") as u32;
        assert_eq!(hi | lo, expected_len);
    }

    #[test]
    fn set_dispatches_known_name_to_driver() {
        let mut bus = MemoryBus::new();
        let mut archive = StaticArchive::new("/tmp");
        let mut driver = StubDriver { clock_mhz: 20.0 };
        let mut module = Module::new();
        module.set_number_of_channels(1).unwrap();
        let mut defaults = Defaults::new();
        let mut value = 1234.0;
        AcquisitionEngine::set(
            &mut bus,
            &mut archive,
            &mut driver,
            0,
            "trigger_threshold",
            &mut value,
            &mut defaults,
            None,
            None,
            0,
            DetectorType::Reset,
            &mut module,
            0,
        )
        .unwrap();
        assert_eq!(defaults.get("trigger_threshold").unwrap(), 1234.0);
    }
}
