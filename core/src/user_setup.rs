// SPDX-License-Identifier: LGPL-3.0-or-later

//! User-setup sequencer (L8, §4.8): replays a module's Defaults onto
//! hardware in insertion order, once driver-config emit has staged
//! firmware. Insertion order is load-bearing — some values (peaking_time)
//! trigger firmware downloads that change which DSP symbols exist for
//! later entries in the same Defaults bag.

use crate::acquisition::AcquisitionEngine;
use crate::capability::{DeviceBus, FirmwareArchive, ProductDriver};
use crate::defaults::Defaults;
use crate::detector::{Detector, DetectorType};
use crate::error::Result;
use crate::firmware::FirmwareSet;
use crate::module::Module;

pub struct UserSetup;

impl UserSetup {
    /// §4.8: per module, run `user_setup` on the first reachable channel,
    /// then every other channel, then `module_setup` once.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        bus: &mut dyn DeviceBus,
        archive: &mut dyn FirmwareArchive,
        driver: &mut dyn ProductDriver,
        channel: i32,
        module: &mut Module,
        firmware_set: Option<&FirmwareSet>,
        detector: Option<&Detector>,
        detector_channel: u32,
        defaults_by_channel: &mut dyn FnMut(u32) -> Option<&mut Defaults>,
    ) -> Result<()> {
        let indices: Vec<u32> = module.active_channel_indices().collect();
        let mut any_done = false;

        for idx in &indices {
            let detector_type = detector.map(|d| d.dtype).unwrap_or(DetectorType::Unknown);
            driver.user_setup(
                bus,
                channel,
                defaults_by_channel(*idx).ok_or(crate::error::Error::IncompleteDefaults(module.alias.clone()))?,
                firmware_set,
                detector_type,
                detector,
                detector_channel,
                module,
                *idx,
            )?;

            if let Some(defaults) = defaults_by_channel(*idx) {
                Self::replay_defaults(bus, archive, driver, channel, defaults, firmware_set, detector, detector_channel, module, *idx)?;
            }
            any_done = true;
        }

        if any_done {
            if let Some(idx) = indices.first() {
                let defaults = defaults_by_channel(*idx).ok_or(crate::error::Error::IncompleteDefaults(module.alias.clone()))?;
                driver.module_setup(bus, channel, defaults, module)?;
            }
            module.is_setup = true;
        }
        Ok(())
    }

    /// Replays every non-read-only Defaults entry through the acquisition
    /// engine, in the order it was inserted.
    #[allow(clippy::too_many_arguments)]
    fn replay_defaults(
        bus: &mut dyn DeviceBus,
        archive: &mut dyn FirmwareArchive,
        driver: &mut dyn ProductDriver,
        channel: i32,
        defaults: &mut Defaults,
        firmware_set: Option<&FirmwareSet>,
        detector: Option<&Detector>,
        detector_channel: u32,
        module: &mut Module,
        module_channel: u32,
    ) -> Result<()> {
        let names: Vec<String> = defaults.iter_applicable().map(|e| e.name.clone()).collect();
        let detector_type = detector.map(|d| d.dtype).unwrap_or(DetectorType::Unknown);
        for name in names {
            let mut value = defaults.get(&name)?;
            AcquisitionEngine::set(
                bus,
                archive,
                driver,
                channel,
                &name,
                &mut value,
                defaults,
                firmware_set,
                detector,
                detector_channel,
                detector_type,
                module,
                module_channel,
            )?;
        }
        Ok(())
    }
}
