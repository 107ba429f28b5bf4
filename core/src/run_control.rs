// SPDX-License-Identifier: LGPL-3.0-or-later

//! Run controller (L9, §4.9): start/stop with multichannel broadcast
//! semantics, a bounded `BUSY==0` drain on stop, and special-run
//! sequencing around the driver's control-task primitives.

use tracing::warn;

use crate::capability::DeviceBus;
use crate::channel::ChannelTree;
use crate::capability::ProductDriver;
use crate::defaults::Defaults;
use crate::error::{Error, Result};
use crate::module::Module;
use crate::registry::Registry;
use crate::timing::{POLL_INTERVAL, STOP_RUN_MAX_POLLS};

/// Special runs that capture data the caller must read before stopping
/// (§4.9): the sequencer does not auto-stop these.
pub const CAPTURE_TASKS: &[&str] = &["baseline_history", "adc_trace", "external_memory"];

pub struct RunController;

impl RunController {
    /// Fans a handle out across the channel tree and starts every resolved
    /// module, honoring the "already running" silent-success rule.
    pub fn start_run(
        channel_tree: &ChannelTree,
        handle: i32,
        resume: bool,
        modules: &mut Registry<Module>,
        drivers: &mut std::collections::HashMap<String, Box<dyn ProductDriver>>,
        defaults_by_module: &dyn Fn(&str) -> Defaults,
        bus: &mut dyn DeviceBus,
    ) -> Result<()> {
        for (_logical, module_alias) in channel_tree.resolve(handle)? {
            let module = modules.get_mut(&module_alias)?;
            if module.is_multichannel && module.any_run_active() {
                continue;
            }
            let product_type = module.product_type.clone();
            let driver = drivers.get_mut(&product_type).ok_or_else(|| Error::UnknownBtype(product_type.clone()))?;
            let defaults = defaults_by_module(&module_alias);
            driver.start_run(bus, -1, resume, &defaults, module)?;
            module.broadcast_run_active(true);
        }
        Ok(())
    }

    pub fn stop_run(
        channel_tree: &ChannelTree,
        handle: i32,
        modules: &mut Registry<Module>,
        drivers: &mut std::collections::HashMap<String, Box<dyn ProductDriver>>,
        bus: &mut dyn DeviceBus,
    ) -> Result<()> {
        for (_logical, module_alias) in channel_tree.resolve(handle)? {
            let module = modules.get_mut(&module_alias)?;
            let product_type = module.product_type.clone();
            let driver = drivers.get_mut(&product_type).ok_or_else(|| Error::UnknownBtype(product_type.clone()))?;
            driver.stop_run(bus, -1, module)?;

            let mut polls = 0;
            loop {
                if bus.read_symbol(-1, "BUSY")? == 0 {
                    break;
                }
                polls += 1;
                if polls >= STOP_RUN_MAX_POLLS {
                    return Err(Error::Timeout("stop_run BUSY drain".into()));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            module.broadcast_run_active(false);
        }
        Ok(())
    }

    /// §4.9: thin sequencer around the driver's control-task primitives.
    /// Capture tasks are left running for the caller to read out; every
    /// other task is stopped once it reports not-busy.
    pub fn do_special_run(
        bus: &mut dyn DeviceBus,
        channel: i32,
        task_id: u32,
        name: &str,
        args: &[f64],
    ) -> Result<()> {
        bus.control_task_start(channel, task_id, args)?;
        let mut polls = 0;
        loop {
            if !bus.control_task_poll_busy(channel)? {
                break;
            }
            polls += 1;
            if polls >= crate::timing::CONTROL_TASK_MAX_POLLS {
                return Err(Error::Timeout(format!("special run {}", name)));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        if !CAPTURE_TASKS.contains(&name) {
            bus.control_task_stop(channel)?;
        }
        Ok(())
    }

    pub fn get_special_run_data(bus: &mut dyn DeviceBus, channel: i32, name: &str, len: usize) -> Result<Vec<u16>> {
        let data = bus.control_task_read_result(channel, len)?;
        if CAPTURE_TASKS.contains(&name) {
            bus.control_task_stop(channel)?;
        }
        Ok(data)
    }
}
