// SPDX-License-Identifier: LGPL-3.0-or-later

//! Validation + driver-config emit (L7, §4.7): `StartSystem` is the single
//! operation that crosses from "client can still mutate" to "hardware is
//! configured". Every step below runs in the order the contract names; the
//! first failure aborts the whole pipeline.

use std::collections::HashMap;

use tracing::info;

use crate::capability::{DeviceBus, FirmwareArchive, ProductDriver};
use crate::channel::ChannelTree;
use crate::defaults::Defaults;
use crate::detector::{Detector, DetectorType};
use crate::error::{Error, Result};
use crate::firmware::{FirmwareKind, FirmwareSet};
use crate::module::{Module, Transport};
use crate::registry::Registry;
use crate::resolver::{FirmwareResolver, GLOBAL_FIRMWARE_NOMINAL_PTIME};

fn transport_address(transport: &Transport) -> String {
    match transport {
        Transport::Epp { address, daisy_chain_id: Some(id) } => format!("{:#06x}:{}", address, id),
        Transport::Epp { address, daisy_chain_id: None } => format!("{:#06x}", address),
        Transport::Usb { device_number } | Transport::Usb2 { device_number } => device_number.to_string(),
        Transport::Serial { port, baud_rate } => {
            let port_str = match port {
                crate::module::SerialPort::ComPort(n) => format!("COM{}", n),
                crate::module::SerialPort::DeviceFile(p) => p.clone(),
            };
            format!("{}@{}", port_str, baud_rate)
        }
        Transport::Pxi { bus, slot } => format!("{}:{}", bus, slot),
    }
}

pub struct Xerxes;

impl Xerxes {
    /// Runs steps 1-5 of §4.7 against the full configuration graph. Every
    /// registry is passed explicitly rather than bundled, matching the rest
    /// of the core's stateless-engine style; `LibraryState` owns the actual
    /// storage.
    #[allow(clippy::too_many_arguments)]
    pub fn start_system(
        firmware_sets: &Registry<FirmwareSet>,
        detectors: &Registry<Detector>,
        channel_tree: &ChannelTree,
        modules: &mut Registry<Module>,
        defaults: &Registry<Defaults>,
        drivers: &mut HashMap<String, Box<dyn ProductDriver>>,
        archive: &mut dyn FirmwareArchive,
        bus: &mut dyn DeviceBus,
    ) -> Result<()> {
        // 1. FirmwareSet validation.
        for (_, fs) in firmware_sets.iter() {
            fs.validate()?;
        }

        // 2. Detector validation.
        for (_, det) in detectors.iter() {
            det.validate()?;
        }

        // 3. Logical-channel graph validation.
        channel_tree.validate()?;

        // 4 & 5 run per module.
        let aliases: Vec<String> = modules.aliases().map(|a| a.to_string()).collect();
        for alias in aliases {
            Self::start_module(&alias, firmware_sets, detectors, modules, defaults, drivers, archive, bus)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn start_module(
        alias: &str,
        firmware_sets: &Registry<FirmwareSet>,
        detectors: &Registry<Detector>,
        modules: &mut Registry<Module>,
        defaults: &Registry<Defaults>,
        drivers: &mut HashMap<String, Box<dyn ProductDriver>>,
        archive: &mut dyn FirmwareArchive,
        bus: &mut dyn DeviceBus,
    ) -> Result<()> {
        let product_type = modules.get(alias)?.product_type.clone();
        let driver = drivers
            .get_mut(&product_type)
            .ok_or_else(|| Error::UnknownBtype(product_type.clone()))?;

        // 4. Per-module validation.
        {
            let module = modules.get(alias)?;
            driver.validate_module(module)?;
            for idx in module.active_channel_indices() {
                let ch = module.channel(idx)?;
                let ch_defaults = ch
                    .defaults
                    .as_ref()
                    .and_then(|d| defaults.get(d).ok())
                    .ok_or_else(|| Error::IncompleteDefaults(alias.to_string()))?;
                driver.validate_defaults(ch_defaults)?;
            }
        }

        // 5. Driver-config emit.
        let (transport, logical_ids): (Transport, Vec<i32>) = {
            let module = modules.get(alias)?;
            let transport = module.transport.clone().ok_or_else(|| Error::MissingInterface(alias.to_string()))?;
            let ids: Vec<i32> = module.channels.iter().filter_map(|c| c.logical_channel).collect();
            (transport, ids)
        };

        // (a)-(c): board type + interface descriptor + module descriptor,
        // folded into a single bus-level open (the core never builds a wire
        // descriptor itself, §1 Non-goals).
        bus.open(transport.kind_keyword(), &transport_address(&transport))?;
        info!(module = alias, interface = transport.kind_keyword(), channels = ?logical_ids, "module descriptor registered");

        let firmware_set_alias = {
            let module = modules.get(alias)?;
            module
                .channels
                .iter()
                .find_map(|c| c.firmware_set.clone())
        };
        let fs = match firmware_set_alias.as_deref().and_then(|a| firmware_sets.get(a).ok()) {
            Some(fs) => fs,
            None => return Ok(()),
        };

        let channel_defaults = |module: &Module, idx: u32| -> Option<Defaults> {
            module
                .channel(idx)
                .ok()
                .and_then(|c| c.defaults.as_ref())
                .and_then(|d| defaults.get(d).ok())
                .cloned()
        };
        let probe_defaults = {
            let module = modules.get(alias)?;
            module.active_channel_indices().find_map(|i| channel_defaults(module, i))
        };

        // (d) MMU.
        if let Ok(resolved) = FirmwareResolver::resolve(fs, FirmwareKind::Mmu, GLOBAL_FIRMWARE_NOMINAL_PTIME, DetectorType::Unknown, probe_defaults.as_ref(), None, archive) {
            let module = modules.get_mut(alias)?;
            if let Some(idx) = module.active_channel_indices().next() {
                driver.download_firmware(bus, -1, FirmwareKind::Mmu, &resolved.staged_path, module, idx, &resolved.raw_name, probe_defaults.as_ref().unwrap_or(&Defaults::new()))?;
                module.channel_mut(idx)?.current_firmware.set(FirmwareKind::Mmu, resolved.raw_name);
            }
            info!(module = alias, "MMU firmware staged");
        }

        // (e) System FiPPI.
        let system_fippi = FirmwareResolver::resolve(fs, FirmwareKind::SystemFippi, GLOBAL_FIRMWARE_NOMINAL_PTIME, DetectorType::Unknown, probe_defaults.as_ref(), None, archive);
        if let Ok(resolved) = &system_fippi {
            let module = modules.get_mut(alias)?;
            if let Some(idx) = module.active_channel_indices().next() {
                driver.download_firmware(bus, -1, FirmwareKind::SystemFippi, &resolved.staged_path, module, idx, &resolved.raw_name, probe_defaults.as_ref().unwrap_or(&Defaults::new()))?;
                module.channel_mut(idx)?.current_firmware.set(FirmwareKind::SystemFippi, resolved.raw_name.clone());
            }
            info!(module = alias, "system FiPPI staged");
        }

        // (f) System FPGA.
        if let Ok(resolved) = FirmwareResolver::resolve(fs, FirmwareKind::SystemFpga, GLOBAL_FIRMWARE_NOMINAL_PTIME, DetectorType::Unknown, probe_defaults.as_ref(), None, archive) {
            let module = modules.get_mut(alias)?;
            if let Some(idx) = module.active_channel_indices().next() {
                driver.download_firmware(bus, -1, FirmwareKind::SystemFpga, &resolved.staged_path, module, idx, &resolved.raw_name, probe_defaults.as_ref().unwrap_or(&Defaults::new()))?;
                module.channel_mut(idx)?.current_firmware.set(FirmwareKind::SystemFpga, resolved.raw_name);
            }
            info!(module = alias, "system FPGA staged");
        }

        // (g) System DSP, falling back to per-channel DSP if both it and
        // System FiPPI are absent.
        let system_dsp = FirmwareResolver::resolve(fs, FirmwareKind::SystemDsp, GLOBAL_FIRMWARE_NOMINAL_PTIME, DetectorType::Unknown, probe_defaults.as_ref(), None, archive);
        if let Ok(resolved) = &system_dsp {
            let module = modules.get_mut(alias)?;
            if let Some(idx) = module.active_channel_indices().next() {
                driver.download_firmware(bus, -1, FirmwareKind::SystemDsp, &resolved.staged_path, module, idx, &resolved.raw_name, probe_defaults.as_ref().unwrap_or(&Defaults::new()))?;
                module.channel_mut(idx)?.current_firmware.set(FirmwareKind::SystemDsp, resolved.raw_name.clone());
            }
            info!(module = alias, "system DSP staged");
        } else if system_fippi.is_err() {
            Self::per_channel_fallback(alias, fs, FirmwareKind::Dsp, detectors, modules, defaults, driver, archive, bus)?;
        }

        // (h) FiPPI A, same fallback condition.
        if let Ok(resolved) = FirmwareResolver::resolve(fs, FirmwareKind::FippiA, GLOBAL_FIRMWARE_NOMINAL_PTIME, DetectorType::Unknown, probe_defaults.as_ref(), None, archive) {
            let module = modules.get_mut(alias)?;
            if let Some(idx) = module.active_channel_indices().next() {
                driver.download_firmware(bus, -1, FirmwareKind::FippiA, &resolved.staged_path, module, idx, &resolved.raw_name, probe_defaults.as_ref().unwrap_or(&Defaults::new()))?;
                module.channel_mut(idx)?.current_firmware.set(FirmwareKind::FippiA, resolved.raw_name);
            }
            info!(module = alias, "FiPPI A staged");
        } else if system_fippi.is_err() {
            Self::per_channel_fallback(alias, fs, FirmwareKind::Fippi, detectors, modules, defaults, driver, archive, bus)?;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn per_channel_fallback(
        alias: &str,
        fs: &FirmwareSet,
        kind: FirmwareKind,
        detectors: &Registry<Detector>,
        modules: &mut Registry<Module>,
        defaults: &Registry<Defaults>,
        driver: &mut Box<dyn ProductDriver>,
        archive: &mut dyn FirmwareArchive,
        bus: &mut dyn DeviceBus,
    ) -> Result<()> {
        let indices: Vec<u32> = modules.get(alias)?.active_channel_indices().collect();
        for idx in indices {
            let (ptime, detector_type, channel_defaults) = {
                let module = modules.get(alias)?;
                let ch = module.channel(idx)?;
                let ch_defaults = ch.defaults.as_ref().and_then(|d| defaults.get(d).ok());
                let ptime = ch_defaults.and_then(|d| d.get("peaking_time").ok()).unwrap_or(GLOBAL_FIRMWARE_NOMINAL_PTIME);
                let dtype = ch
                    .detector_binding
                    .as_ref()
                    .and_then(|(det_alias, _)| detectors.get(det_alias).ok())
                    .map(|d| d.dtype)
                    .unwrap_or(DetectorType::Unknown);
                (ptime, dtype, ch_defaults.cloned())
            };
            let resolved = FirmwareResolver::resolve(fs, kind, ptime, detector_type, channel_defaults.as_ref(), None, archive)?;
            let module = modules.get_mut(alias)?;
            driver.download_firmware(bus, idx as i32, kind, &resolved.staged_path, module, idx, &resolved.raw_name, channel_defaults.as_ref().unwrap_or(&Defaults::new()))?;
            module.channel_mut(idx)?.current_firmware.set(kind, resolved.raw_name);
            info!(module = alias, channel = idx, ?kind, "per-channel firmware fallback staged");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::capability::mock::{MemoryBus, StaticArchive};
    use crate::error::AliasKind;
    use crate::firmware::FirmwareVariant;

    struct NoopDriver;
    impl ProductDriver for NoopDriver {
        fn channel_count(&self) -> u32 { 1 }
        fn clock_speed_mhz(&self, _m: &Module) -> Result<f64> { Ok(20.0) }
        fn decimation(&self, _bus: &mut dyn DeviceBus, _channel: i32) -> Result<u32> { Ok(0) }
        fn statistics_layout(&self) -> crate::capability::StatisticsLayout {
            crate::capability::StatisticsLayout {
                realtime_base: "REALTIME".into(), trigger_livetime_base: "LIVETIME".into(),
                energy_livetime_base: "ELIVETIME".into(), triggers_base: "TRIGGERS".into(),
                mca_events_base: "FASTPEAKS".into(), underflows_base: "UNDERFLOWS".into(),
                overflows_base: "OVERFLOWS".into(), total_output_events_base: "TOTALEVENTS".into(),
            }
        }
        fn mca_start_address(&self, _m: &Module, _c: u32) -> Result<u32> { Ok(0) }
        fn number_mca_channels(&self, _d: &Defaults) -> Result<u32> { Ok(2048) }
        fn baseline_length(&self, _d: &Defaults) -> Result<u32> { Ok(256) }
        fn validate_module(&self, _m: &Module) -> Result<()> { Ok(()) }
        fn validate_defaults(&self, _d: &Defaults) -> Result<()> { Ok(()) }
        fn download_firmware(&mut self, _b: &mut dyn DeviceBus, _c: i32, _k: FirmwareKind, _p: &str, _m: &mut Module, _mc: u32, _r: &str, _d: &Defaults) -> Result<()> { Ok(()) }
        fn set_acquisition_value(&mut self, _b: &mut dyn DeviceBus, _c: i32, _n: &str, _v: &mut f64, _d: &mut Defaults, _fs: Option<&FirmwareSet>, _m: &mut Module, _mc: u32, _det: Option<&Detector>, _dc: u32) -> Result<()> { Ok(()) }
        fn get_acquisition_value(&self, _b: &mut dyn DeviceBus, _c: i32, _n: &str, _d: &Defaults) -> Result<f64> { Ok(0.0) }
        fn gain_operation(&mut self, _b: &mut dyn DeviceBus, _c: i32, _n: &str, _v: f64, _det: Option<&Detector>, _m: &mut Module, _mc: u32, _d: &mut Defaults) -> Result<()> { Ok(()) }
        fn gain_calibrate(&mut self, _b: &mut dyn DeviceBus, _c: i32, _det: Option<&Detector>, _m: &mut Module, _mc: u32, _d: &mut Defaults, _dg: f64) -> Result<()> { Ok(()) }
        fn start_run(&mut self, _b: &mut dyn DeviceBus, _c: i32, _r: bool, _d: &Defaults, _m: &mut Module) -> Result<()> { Ok(()) }
        fn stop_run(&mut self, _b: &mut dyn DeviceBus, _c: i32, _m: &mut Module) -> Result<()> { Ok(()) }
        fn get_run_data(&self, _b: &mut dyn DeviceBus, _c: i32, _n: &str, _d: &Defaults, _m: &Module) -> Result<crate::capability::RunDataValue> { Ok(crate::capability::RunDataValue::Scalar(0.0)) }
        fn do_special_run(&mut self, _b: &mut dyn DeviceBus, _c: i32, _n: &str, _i: &[f64], _d: &Defaults, _det: Option<&Detector>, _dc: u32) -> Result<()> { Ok(()) }
        fn get_special_run_data(&self, _b: &mut dyn DeviceBus, _c: i32, _n: &str, _d: &Defaults) -> Result<f64> { Ok(0.0) }
        fn user_setup(&mut self, _b: &mut dyn DeviceBus, _c: i32, _d: &mut Defaults, _fs: Option<&FirmwareSet>, _dt: DetectorType, _det: Option<&Detector>, _dc: u32, _m: &mut Module, _mc: u32) -> Result<()> { Ok(()) }
        fn module_setup(&mut self, _b: &mut dyn DeviceBus, _c: i32, _d: &Defaults, _m: &mut Module) -> Result<()> { Ok(()) }
        fn num_defaults(&self) -> usize { 0 }
        fn default_seed(&self, _i: usize) -> (String, f64) { (String::new(), 0.0) }
        fn get_parameter(&self, _b: &mut dyn DeviceBus, _c: i32, _n: &str) -> Result<f64> { Ok(0.0) }
        fn set_parameter(&mut self, _b: &mut dyn DeviceBus, _c: i32, _n: &str, _v: f64) -> Result<()> { Ok(()) }
        fn num_params(&self, _b: &mut dyn DeviceBus, _c: i32) -> Result<usize> { Ok(0) }
        fn param_name_by_index(&self, _b: &mut dyn DeviceBus, _c: i32, _i: usize) -> Result<String> { Ok(String::new()) }
        fn board_operation(&mut self, _b: &mut dyn DeviceBus, _c: i32, _n: &str, _v: &mut f64, _d: &Defaults) -> Result<()> { Ok(()) }
        fn free_scas(&mut self, _m: &mut Module, _mc: u32) -> Result<()> { Ok(()) }
        fn unhook(&mut self, _c: i32) -> Result<()> { Ok(()) }
    }

    #[test]
    fn start_system_runs_clean_module_with_no_firmware_set() {
        let firmware_sets: Registry<FirmwareSet> = Registry::new(AliasKind::FirmwareSet);
        let detectors: Registry<Detector> = Registry::new(AliasKind::Detector);
        let channel_tree = ChannelTree::new();
        let mut modules: Registry<Module> = Registry::new(AliasKind::Module);
        let defaults: Registry<Defaults> = Registry::new(AliasKind::Defaults);

        let mut module = Module::new();
        module.alias = "mod0".into();
        module.product_type = "stub".into();
        module.transport = Some(Transport::Usb { device_number: 0 });
        module.set_number_of_channels(1).unwrap();
        modules.insert_new("mod0", module).unwrap();

        let mut drivers: HashMap<String, Box<dyn ProductDriver>> = HashMap::new();
        drivers.insert("stub".into(), Box::new(NoopDriver));
        let mut archive = StaticArchive::new("/tmp");
        let mut bus = MemoryBus::new();

        Xerxes::start_system(&firmware_sets, &detectors, &channel_tree, &mut modules, &defaults, &mut drivers, &mut archive, &mut bus).unwrap();
    }

    #[test]
    fn start_system_rejects_overlapping_firmware_set() {
        let mut firmware_sets: Registry<FirmwareSet> = Registry::new(AliasKind::FirmwareSet);
        let mut fs = FirmwareSet::new();
        fs.alias = "fs0".into();
        let mut v0 = FirmwareVariant::new(0, 1.0, 10.0).unwrap();
        v0.dsp = Some("d0".into());
        v0.fippi = Some("f0".into());
        fs.add_variant(v0).unwrap();
        let mut v1 = FirmwareVariant::new(1, 5.0, 20.0).unwrap();
        v1.dsp = Some("d1".into());
        v1.fippi = Some("f1".into());
        fs.add_variant(v1).unwrap();
        firmware_sets.insert_new("fs0", fs).unwrap();

        let detectors: Registry<Detector> = Registry::new(AliasKind::Detector);
        let channel_tree = ChannelTree::new();
        let mut modules: Registry<Module> = Registry::new(AliasKind::Module);
        let defaults: Registry<Defaults> = Registry::new(AliasKind::Defaults);
        let mut drivers: HashMap<String, Box<dyn ProductDriver>> = HashMap::new();
        let mut archive = StaticArchive::new("/tmp");
        let mut bus = MemoryBus::new();

        let err = Xerxes::start_system(&firmware_sets, &detectors, &channel_tree, &mut modules, &defaults, &mut drivers, &mut archive, &mut bus).unwrap_err();
        assert!(matches!(err, Error::PtrOverlap { .. }));
    }
}
