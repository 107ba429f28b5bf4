// SPDX-License-Identifier: LGPL-3.0-or-later

//! Capability interfaces (L5): the narrow traits that shelter the core from
//! bus protocols (`DeviceBus`), firmware container formats
//! (`FirmwareArchive`), and product-specific DSP layouts (`ProductDriver`).
//!
//! The core is generic over these three trait objects; it never speaks a
//! wire protocol or parses a firmware file itself (§1 Non-goals).

use crate::defaults::Defaults;
use crate::detector::{Detector, DetectorType};
use crate::error::Result;
use crate::firmware::{FirmwareKind, FirmwareSet};
use crate::module::Module;

/// A memory/register region name as used in memory-operation strings (§6):
/// `data`, `spectrum`, or `register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemRegion {
    Data,
    Spectrum,
    Register,
}

/// Blocking hardware transport capability (§4.5). One object is shared by
/// every product driver; the core never holds transport state itself.
pub trait DeviceBus {
    fn open(&mut self, interface_kind: &str, address: &str) -> Result<()>;
    fn close(&mut self) -> Result<()>;

    fn read_memory(&mut self, region: MemRegion, addr: u32, len: usize) -> Result<Vec<u16>>;
    fn write_memory(&mut self, region: MemRegion, addr: u32, data: &[u16]) -> Result<()>;

    fn read_register(&mut self, name: &str) -> Result<u16>;
    fn write_register(&mut self, name: &str, value: u16) -> Result<()>;

    /// Run control: `channel < 0` means broadcast to every channel on the
    /// unit (§4.9).
    fn start_run(&mut self, channel: i32, resume: bool) -> Result<()>;
    fn stop_run(&mut self, channel: i32) -> Result<()>;

    fn control_task_start(&mut self, channel: i32, task_id: u32, args: &[f64]) -> Result<()>;
    fn control_task_poll_busy(&mut self, channel: i32) -> Result<bool>;
    fn control_task_read_result(&mut self, channel: i32, len: usize) -> Result<Vec<u16>>;
    fn control_task_stop(&mut self, channel: i32) -> Result<()>;

    fn symbol_index(&mut self, channel: i32, name: &str) -> Result<u16>;
    fn symbol_name(&mut self, channel: i32, index: u16) -> Result<String>;
    fn symbol_bounds(&mut self, channel: i32, name: &str) -> Result<(f64, f64)>;
    fn read_symbol(&mut self, channel: i32, name: &str) -> Result<u16>;
    fn write_symbol(&mut self, channel: i32, name: &str, value: u16) -> Result<()>;

    /// Monotonically-advancing tick counter used by poll loops to bound
    /// waits (§5 "Suspension points").
    fn clock_tick(&mut self) -> Result<u64>;

    fn alloc(&mut self, len: usize) -> Result<u32>;
    fn free(&mut self, addr: u32) -> Result<()>;
}

/// Firmware-container capability (§4.4, §4.5): resolves a single firmware
/// kind for a peaking time/detector type into a staged path plus a raw name
/// stable across repeated extraction, and reports what filter offsets an
/// archive entry carries.
pub trait FirmwareArchive {
    #[allow(clippy::too_many_arguments)]
    fn resolve(
        &mut self,
        archive_path: &str,
        temp_dir: &str,
        kind: FirmwareKind,
        peaking_time: f64,
        detector_type: DetectorType,
        keywords: &[String],
    ) -> Result<(String, String)>;

    fn num_filter(&mut self, peaking_time: f64, detector_type: DetectorType) -> Result<usize>;
    fn filter_info(&mut self, peaking_time: f64, detector_type: DetectorType) -> Result<Vec<u16>>;
    fn temp_path(&self) -> &str;
}

/// Symbol-name layout for the statistics snapshot read by the generic
/// readout layer (§4.10): each counter is either a 3-word 48-bit tick count
/// (realtime/livetimes) or a 2-word 32-bit count (events), named
/// `{base}0`/`{base}1`[`/{base}2`] the way the reference source lays out
/// `REALTIME0..2`, `LIVETIME0..2`, `FASTPEAKS0..1`, etc.
#[derive(Debug, Clone)]
pub struct StatisticsLayout {
    pub realtime_base: String,
    pub trigger_livetime_base: String,
    pub energy_livetime_base: String,
    pub triggers_base: String,
    pub mca_events_base: String,
    pub underflows_base: String,
    pub overflows_base: String,
    pub total_output_events_base: String,
}

/// A value returned by `get_run_data` (§4.10). Kept as a tagged union
/// rather than an open `f64` so buffer/statistics-vector reads don't need a
/// side channel for length.
#[derive(Debug, Clone, PartialEq)]
pub enum RunDataValue {
    Scalar(f64),
    Counter(u32),
    Buffer(Vec<i32>),
    /// `[realtime, trigger_livetime, energy_livetime, triggers, mca_events,
    /// icr, ocr, underflows, overflows]` (§4.10 `module_statistics_2`).
    StatsVector([f64; 9]),
    Bitmask(u32),
}

/// The dispatch surface that shelters the core from product differences
/// (§4.5, §9 "Capability dispatch"). One object is selected per Module by
/// `product_type` at registry-insertion time, not re-selected on every call.
#[allow(clippy::too_many_arguments)]
pub trait ProductDriver {
    /// The channel count this product declares; checked against
    /// `Module::number_of_channels` at `StartSystem` (§3 invariant).
    fn channel_count(&self) -> u32;

    fn clock_speed_mhz(&self, module: &Module) -> Result<f64>;

    /// Hardware decimation exponent for the installed FiPPI (§4.6 filter
    /// update, GLOSSARY "Decimation"). Read live off the bus, not cached —
    /// the reference source re-reads the `DECIMATION` DSP symbol on every
    /// filter update rather than assuming a fixed value for the product.
    fn decimation(&self, bus: &mut dyn DeviceBus, channel: i32) -> Result<u32>;

    fn statistics_layout(&self) -> StatisticsLayout;
    fn mca_start_address(&self, module: &Module, module_channel: u32) -> Result<u32>;
    fn number_mca_channels(&self, defaults: &Defaults) -> Result<u32>;
    fn baseline_length(&self, defaults: &Defaults) -> Result<u32>;

    /// §9 Open Question 2: whether `set_acquisition_value`'s analog-gain
    /// path needs the start/wait/stop "apply" run to latch the value. The
    /// reference product does.
    fn requires_gain_apply(&self) -> bool {
        true
    }

    fn validate_module(&self, module: &Module) -> Result<()>;
    fn validate_defaults(&self, defaults: &Defaults) -> Result<()>;

    fn download_firmware(
        &mut self,
        bus: &mut dyn DeviceBus,
        channel: i32,
        kind: FirmwareKind,
        staged_path: &str,
        module: &mut Module,
        module_channel: u32,
        raw_name: &str,
        defaults: &Defaults,
    ) -> Result<()>;

    fn set_acquisition_value(
        &mut self,
        bus: &mut dyn DeviceBus,
        channel: i32,
        name: &str,
        value: &mut f64,
        defaults: &mut Defaults,
        firmware_set: Option<&FirmwareSet>,
        module: &mut Module,
        module_channel: u32,
        detector: Option<&Detector>,
        detector_channel: u32,
    ) -> Result<()>;

    fn get_acquisition_value(
        &self,
        bus: &mut dyn DeviceBus,
        channel: i32,
        name: &str,
        defaults: &Defaults,
    ) -> Result<f64>;

    fn gain_operation(
        &mut self,
        bus: &mut dyn DeviceBus,
        channel: i32,
        name: &str,
        value: f64,
        detector: Option<&Detector>,
        module: &mut Module,
        module_channel: u32,
        defaults: &mut Defaults,
    ) -> Result<()>;

    fn gain_calibrate(
        &mut self,
        bus: &mut dyn DeviceBus,
        channel: i32,
        detector: Option<&Detector>,
        module: &mut Module,
        module_channel: u32,
        defaults: &mut Defaults,
        delta_gain: f64,
    ) -> Result<()>;

    fn start_run(
        &mut self,
        bus: &mut dyn DeviceBus,
        channel: i32,
        resume: bool,
        defaults: &Defaults,
        module: &mut Module,
    ) -> Result<()>;

    fn stop_run(&mut self, bus: &mut dyn DeviceBus, channel: i32, module: &mut Module) -> Result<()>;

    /// Fallback for product-specific run-data names the generic readout
    /// layer (§4.10) does not recognize.
    fn get_run_data(
        &self,
        bus: &mut dyn DeviceBus,
        channel: i32,
        name: &str,
        defaults: &Defaults,
        module: &Module,
    ) -> Result<RunDataValue>;

    fn do_special_run(
        &mut self,
        bus: &mut dyn DeviceBus,
        channel: i32,
        name: &str,
        info: &[f64],
        defaults: &Defaults,
        detector: Option<&Detector>,
        detector_channel: u32,
    ) -> Result<()>;

    fn get_special_run_data(
        &self,
        bus: &mut dyn DeviceBus,
        channel: i32,
        name: &str,
        defaults: &Defaults,
    ) -> Result<f64>;

    fn user_setup(
        &mut self,
        bus: &mut dyn DeviceBus,
        channel: i32,
        defaults: &mut Defaults,
        firmware_set: Option<&FirmwareSet>,
        detector_type: DetectorType,
        detector: Option<&Detector>,
        detector_channel: u32,
        module: &mut Module,
        module_channel: u32,
    ) -> Result<()>;

    fn module_setup(&mut self, bus: &mut dyn DeviceBus, channel: i32, defaults: &Defaults, module: &mut Module) -> Result<()>;

    fn num_defaults(&self) -> usize;
    /// `(name, seed value)` for the `index`-th product-required default.
    fn default_seed(&self, index: usize) -> (String, f64);

    fn get_parameter(&self, bus: &mut dyn DeviceBus, channel: i32, name: &str) -> Result<f64>;
    fn set_parameter(&mut self, bus: &mut dyn DeviceBus, channel: i32, name: &str, value: f64) -> Result<()>;
    fn num_params(&self, bus: &mut dyn DeviceBus, channel: i32) -> Result<usize>;
    fn param_name_by_index(&self, bus: &mut dyn DeviceBus, channel: i32, index: usize) -> Result<String>;

    fn board_operation(
        &mut self,
        bus: &mut dyn DeviceBus,
        channel: i32,
        name: &str,
        value: &mut f64,
        defaults: &Defaults,
    ) -> Result<()>;

    fn free_scas(&mut self, module: &mut Module, module_channel: u32) -> Result<()>;
    fn unhook(&mut self, channel: i32) -> Result<()>;
}

pub mod mock;
