// SPDX-License-Identifier: LGPL-3.0-or-later

//! `dppctl-core`: a transport-, firmware-format-, and product-agnostic
//! control library for X-ray digital pulse processor spectrometer hardware.
//!
//! The crate never speaks a wire protocol, never parses a firmware
//! container, and never hosts product physics formulas itself — those are
//! capability traits (`DeviceBus`, `FirmwareArchive`, `ProductDriver`) a
//! host application or a product driver crate (e.g. `dppctl-saturn-driver`)
//! supplies. [`LibraryState`] is the single entry point: it owns every
//! registry (L2), the logical-channel tree (§3), and the capability objects,
//! and exposes the client-facing operations of each layer (L4–L10) as
//! inherent methods.

mod acquisition;
mod capability;
mod channel;
mod config;
mod defaults;
mod detector;
mod error;
mod firmware;
mod logging;
mod module;
mod readout;
mod registry;
mod resolver;
mod run_control;
mod timing;
mod transport;
mod user_setup;
mod xerxes;

pub use acquisition::{
    compute_filter_update, AcquisitionEngine, AcquisitionName, FilterUpdate, PresetKind, ScaEndpoint, MAX_SCAS,
    PRESET_TICK_DIVISOR,
};
pub use capability::{mock, DeviceBus, FirmwareArchive, MemRegion, ProductDriver, RunDataValue, StatisticsLayout};
pub use channel::{ChannelTree, UNIVERSAL_SET_ID};
pub use config::{parse as parse_config, write as write_config, ParsedConfig, WriteInput};
pub use defaults::{DefaultEntry, Defaults};
pub use detector::{Detector, DetectorType, Polarity, GAIN_MAX, GAIN_MIN, MAX_DETECTOR_CHANS};
pub use error::{AliasKind, Error, Result};
pub use firmware::{FirmwareKind, FirmwareSet, FirmwareSetMode, FirmwareVariant};
pub use logging::{init_logging, LogLevel};
pub use module::{CurrentFirmware, Module, ModuleChannel, Sca, SerialPort, Transport};
pub use readout::Readout;
pub use registry::{Registry, MAX_ALIAS_LEN};
pub use resolver::{FirmwareResolver, ResolvedFirmware, GLOBAL_FIRMWARE_NOMINAL_PTIME};
pub use run_control::{RunController, CAPTURE_TASKS};
pub use timing::{APPLY_RUN_MAX_POLLS, BUSY_APPLY_LATCHED, CONTROL_TASK_MAX_POLLS, POLL_INTERVAL, STOP_RUN_MAX_POLLS};
pub use transport::{format_memory_op, format_transport, parse_memory_op, parse_transport, MemoryOp};
pub use user_setup::UserSetup;
pub use xerxes::Xerxes;

use std::collections::{HashMap, HashSet};

use tracing::info;

/// The client handle (§6): owns every registry, the logical-channel tree,
/// the product driver table, and the two capability objects the whole
/// configuration graph is validated and driven through.
///
/// Every public method takes `&mut self`; the crate is single-threaded
/// cooperative (§5) and makes no attempt at interior concurrency.
pub struct LibraryState {
    detectors: Registry<Detector>,
    firmware_sets: Registry<FirmwareSet>,
    modules: Registry<Module>,
    defaults: Registry<Defaults>,
    channel_tree: ChannelTree,
    drivers: HashMap<String, Box<dyn ProductDriver>>,
    bus: Box<dyn DeviceBus>,
    archive: Box<dyn FirmwareArchive>,
    log_level: LogLevel,
    log_output: String,
    initialized: bool,
    /// Staged `interface`/transport-field items for `modify_module_item`
    /// (§4.2): a module's bus binding arrives one name/value pair at a time,
    /// so the fields collected so far are kept here until enough of them are
    /// present for `transport::parse_transport` to succeed, mirroring
    /// `FirmwareSet`'s own `staged_range` idiom.
    transport_staging: HashMap<String, (String, Vec<(String, String)>)>,
    /// Staged `channelN_detector`/`channelN_detector_channel` items, for the
    /// same reason: either may arrive first.
    detector_binding_staging: HashMap<(String, u32), (Option<String>, Option<u32>)>,
}

impl LibraryState {
    /// Builds an uninitialized library around the given transport and
    /// firmware-container capabilities. Product drivers are registered
    /// separately via [`Self::register_driver`] before [`Self::init`].
    pub fn new(bus: Box<dyn DeviceBus>, archive: Box<dyn FirmwareArchive>) -> Self {
        LibraryState {
            detectors: Registry::new(AliasKind::Detector),
            firmware_sets: Registry::new(AliasKind::FirmwareSet),
            modules: Registry::new(AliasKind::Module),
            defaults: Registry::new(AliasKind::Defaults),
            channel_tree: ChannelTree::new(),
            drivers: HashMap::new(),
            bus,
            archive,
            log_level: LogLevel::Info,
            log_output: "stderr".to_string(),
            initialized: false,
            transport_staging: HashMap::new(),
            detector_binding_staging: HashMap::new(),
        }
    }

    /// Registers the `ProductDriver` dispatched to for every Module whose
    /// `product_type` equals `product_type` (§4.5 "Capability dispatch":
    /// selected once at registry-insertion time, not re-selected per call).
    pub fn register_driver(&mut self, product_type: impl Into<String>, driver: Box<dyn ProductDriver>) {
        self.drivers.insert(product_type.into(), driver);
    }

    // ---- Lifecycle (§6) ----

    /// Populates every registry from a configuration source (§6 grammar),
    /// or leaves them empty if `config_source` is `None` (`init_handel`'s
    /// behavior).
    pub fn init(&mut self, config_source: Option<&str>) -> Result<()> {
        if let Some(text) = config_source {
            let parsed = config::parse(text)?;
            for (alias, det) in parsed.detectors {
                self.detectors.insert_new(&alias, det)?;
            }
            for (alias, fs) in parsed.firmware_sets {
                self.firmware_sets.insert_new(&alias, fs)?;
            }
            for (alias, def) in parsed.defaults {
                self.defaults.insert_new(&alias, def)?;
            }
            for (alias, module) in parsed.modules {
                for ch in &module.channels {
                    if let Some(logical) = ch.logical_channel {
                        self.channel_tree.register_single(logical, &alias)?;
                    }
                }
                self.modules.insert_new(&alias, module)?;
            }
            if let Some(level) = parsed.log_level {
                self.log_level = level;
            }
            if let Some(output) = parsed.log_output {
                self.log_output = output;
            }
        }
        self.initialized = true;
        info!(configured = config_source.is_some(), "library initialized");
        Ok(())
    }

    /// `init_handel()`: start from an empty configuration graph.
    pub fn init_handel(&mut self) -> Result<()> {
        self.init(None)
    }

    /// Releases the transport and marks the library torn down. Scoped
    /// resources acquired at `init` (log sinks, firmware temp directories)
    /// are the capability objects' own responsibility to release on `drop`;
    /// the core only closes the bus it was handed (§9 "Scoped resources").
    pub fn exit(&mut self) -> Result<()> {
        self.bus.close()?;
        self.initialized = false;
        info!("library exited");
        Ok(())
    }

    /// Runs §4.7 steps 1–5 against the full configuration graph.
    pub fn start_system(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(Error::Initialize);
        }
        Xerxes::start_system(
            &self.firmware_sets,
            &self.detectors,
            &self.channel_tree,
            &mut self.modules,
            &self.defaults,
            &mut self.drivers,
            self.archive.as_mut(),
            self.bus.as_mut(),
        )
    }

    /// Writes the full registry state to `output_path` in the given format
    /// (only `"handel_ini"` is supported; §6 "Persistence").
    pub fn save_system(&self, format: &str, output_path: &str) -> Result<()> {
        if format != "handel_ini" {
            return Err(Error::BadSystemItem(format.to_string()));
        }
        let input = config::WriteInput {
            detectors: self.detectors.iter().collect(),
            firmware_sets: self.firmware_sets.iter().collect(),
            defaults: self.defaults.iter().collect(),
            modules: self.modules.iter().collect(),
            log_level: self.log_level,
            log_output: self.log_output.clone(),
        };
        let text = config::write(&input);
        std::fs::write(output_path, text).map_err(|e| Error::RewriteFailure(e.to_string()))
    }

    // ---- Registries: Detector (§4.2) ----

    pub fn new_detector(&mut self, alias: &str) -> Result<()> {
        let mut d = Detector::new();
        d.alias = alias.to_string();
        self.detectors.insert_new(alias, d)
    }

    pub fn add_detector_item(&mut self, alias: &str, name: &str, value: &str) -> Result<()> {
        self.detectors.get_mut(alias)?.add_item(name, value)
    }

    pub fn modify_detector_item(&mut self, alias: &str, name: &str, value: &str) -> Result<()> {
        self.detectors.get_mut(alias)?.modify_item(name, value)
    }

    pub fn get_detector_item(&self, alias: &str, name: &str) -> Result<String> {
        self.detectors.get(alias)?.get_item(name)
    }

    pub fn remove_detector(&mut self, alias: &str) -> Result<()> {
        self.detectors.remove(alias).map(|_| ())
    }

    pub fn num_detectors(&self) -> usize {
        self.detectors.num()
    }

    pub fn detector_aliases(&self) -> Vec<String> {
        self.detectors.aliases().map(str::to_string).collect()
    }

    pub fn detector_alias_by_index(&self, index: usize) -> Result<String> {
        self.detectors.alias_by_index(index).map(str::to_string)
    }

    // ---- Registries: FirmwareSet (§4.2) ----

    pub fn new_firmware_set(&mut self, alias: &str) -> Result<()> {
        let mut fs = FirmwareSet::new();
        fs.alias = alias.to_string();
        self.firmware_sets.insert_new(alias, fs)
    }

    pub fn add_firmware_item(&mut self, alias: &str, name: &str, value: &str) -> Result<()> {
        self.firmware_sets.get_mut(alias)?.add_item(name, value)
    }

    pub fn modify_firmware_item(&mut self, alias: &str, name: &str, value: &str) -> Result<()> {
        self.firmware_sets.get_mut(alias)?.add_item(name, value)
    }

    pub fn get_firmware_item(&self, alias: &str, name: &str) -> Result<String> {
        self.firmware_sets.get(alias)?.get_item(name)
    }

    pub fn remove_firmware_set(&mut self, alias: &str) -> Result<()> {
        self.firmware_sets.remove(alias).map(|_| ())
    }

    pub fn num_firmware_sets(&self) -> usize {
        self.firmware_sets.num()
    }

    pub fn firmware_set_aliases(&self) -> Vec<String> {
        self.firmware_sets.aliases().map(str::to_string).collect()
    }

    pub fn firmware_set_alias_by_index(&self, index: usize) -> Result<String> {
        self.firmware_sets.alias_by_index(index).map(str::to_string)
    }

    // ---- Registries: Defaults (§6 "Defaults:") ----

    pub fn new_defaults(&mut self, alias: &str) -> Result<()> {
        let mut d = Defaults::new();
        d.alias = alias.to_string();
        self.defaults.insert_new(alias, d)
    }

    pub fn add_default_item(&mut self, alias: &str, name: &str, value: f64) -> Result<()> {
        self.defaults.get_mut(alias)?.set(name, value);
        Ok(())
    }

    pub fn get_default_item(&self, alias: &str, name: &str) -> Result<f64> {
        self.defaults.get(alias)?.get(name)
    }

    pub fn remove_default_item(&mut self, alias: &str, name: &str) -> Result<()> {
        self.defaults.get_mut(alias)?.remove(name)
    }

    pub fn remove_defaults(&mut self, alias: &str) -> Result<()> {
        self.defaults.remove(alias).map(|_| ())
    }

    pub fn num_defaults(&self) -> usize {
        self.defaults.num()
    }

    pub fn defaults_aliases(&self) -> Vec<String> {
        self.defaults.aliases().map(str::to_string).collect()
    }

    // ---- Registries: Module (§4.2) ----
    //
    // Module has no item-keyed setter of its own (unlike Detector and
    // FirmwareSet) since its fields are plain public structs; the grammar
    // below mirrors `config::parse_module`'s field names one item at a time.

    pub fn new_module(&mut self, alias: &str) -> Result<()> {
        let mut m = Module::new();
        m.alias = alias.to_string();
        self.modules.insert_new(alias, m)
    }

    pub fn add_module_item(&mut self, alias: &str, name: &str, value: &str) -> Result<()> {
        self.modify_module_item(alias, name, value)
    }

    pub fn modify_module_item(&mut self, alias: &str, name: &str, value: &str) -> Result<()> {
        let lname = name.to_lowercase();
        match lname.as_str() {
            "product_type" => {
                self.modules.get_mut(alias)?.product_type = value.to_string();
                return Ok(());
            }
            "number_of_channels" => {
                let n: u32 = value.parse().map_err(|_| Error::BadValue { name: name.into(), value: value.into() })?;
                self.modules.get_mut(alias)?.set_number_of_channels(n)?;
                return Ok(());
            }
            "interface" => {
                self.transport_staging.insert(alias.to_string(), (value.to_lowercase(), Vec::new()));
                return Ok(());
            }
            _ => {}
        }

        const TRANSPORT_FIELDS: &[&str] = &[
            "epp_address",
            "daisy_chain_id",
            "device_number",
            "com_port",
            "device_file",
            "baud_rate",
            "bus",
            "slot",
        ];
        if TRANSPORT_FIELDS.contains(&lname.as_str()) {
            let staged = self
                .transport_staging
                .get_mut(alias)
                .ok_or_else(|| Error::MissingInterface(alias.to_string()))?;
            staged.1.retain(|(k, _)| k != &lname);
            staged.1.push((lname.clone(), value.to_string()));
            if let Ok(transport) = transport::parse_transport(&staged.0, &staged.1) {
                self.modules.get_mut(alias)?.transport = Some(transport);
            }
            return Ok(());
        }

        if let Some(rest) = lname.strip_prefix("channel") {
            let sep = rest.find('_').ok_or_else(|| Error::BadName(name.into()))?;
            let idx: u32 = rest[..sep].parse().map_err(|_| Error::BadName(name.into()))?;
            let field = &rest[sep + 1..];
            match field {
                "logical_channel" => {
                    let id: i32 = value.parse().map_err(|_| Error::BadValue { name: name.into(), value: value.into() })?;
                    self.modules.get_mut(alias)?.channel_mut(idx)?.logical_channel = Some(id);
                    self.channel_tree.register_single(id, alias)?;
                }
                "detector" => {
                    let entry = self.detector_binding_staging.entry((alias.to_string(), idx)).or_insert((None, None));
                    entry.0 = Some(value.to_string());
                    self.apply_detector_binding(alias, idx)?;
                }
                "detector_channel" => {
                    let det_chan: u32 = value.parse().map_err(|_| Error::BadValue { name: name.into(), value: value.into() })?;
                    let entry = self.detector_binding_staging.entry((alias.to_string(), idx)).or_insert((None, None));
                    entry.1 = Some(det_chan);
                    self.apply_detector_binding(alias, idx)?;
                }
                "firmware_set" => {
                    self.modules.get_mut(alias)?.channel_mut(idx)?.firmware_set = Some(value.to_string());
                }
                "defaults" => {
                    self.modules.get_mut(alias)?.channel_mut(idx)?.defaults = Some(value.to_string());
                }
                "sca" => {
                    let (lo, hi) = value.split_once(',').ok_or_else(|| Error::BadValue { name: "sca".into(), value: value.into() })?;
                    let lo: u32 = lo.trim().parse().map_err(|_| Error::BadValue { name: "sca.lo".into(), value: value.into() })?;
                    let hi: u32 = hi.trim().parse().map_err(|_| Error::BadValue { name: "sca.hi".into(), value: value.into() })?;
                    self.modules.get_mut(alias)?.channel_mut(idx)?.scas.push(Sca { lo, hi });
                }
                _ => return Err(Error::BadName(name.into())),
            }
            return Ok(());
        }

        Err(Error::BadName(name.into()))
    }

    fn apply_detector_binding(&mut self, alias: &str, idx: u32) -> Result<()> {
        if let Some((det_alias, det_chan)) = self.detector_binding_staging.get(&(alias.to_string(), idx)).cloned() {
            if let Some(det_alias) = det_alias {
                self.modules.get_mut(alias)?.channel_mut(idx)?.detector_binding = Some((det_alias, det_chan.unwrap_or(0)));
            }
        }
        Ok(())
    }

    pub fn get_module_item(&self, alias: &str, name: &str) -> Result<String> {
        let module = self.modules.get(alias)?;
        let lname = name.to_lowercase();
        match lname.as_str() {
            "product_type" => return Ok(module.product_type.clone()),
            "number_of_channels" => return Ok(module.number_of_channels().to_string()),
            "interface" => {
                return module
                    .transport
                    .as_ref()
                    .map(|t| t.kind_keyword().to_string())
                    .ok_or_else(|| Error::MissingInterface(alias.to_string()))
            }
            _ => {}
        }
        if let Some(rest) = lname.strip_prefix("channel") {
            let sep = rest.find('_').ok_or_else(|| Error::BadName(name.into()))?;
            let idx: u32 = rest[..sep].parse().map_err(|_| Error::BadName(name.into()))?;
            let field = &rest[sep + 1..];
            let ch = module.channel(idx)?;
            return match field {
                "logical_channel" => ch.logical_channel.map(|v| v.to_string()).ok_or(Error::NoModChan(idx as i32)),
                "detector" => ch.detector_binding.as_ref().map(|(a, _)| a.clone()).ok_or(Error::NoDetChan(idx as i32)),
                "detector_channel" => ch
                    .detector_binding
                    .as_ref()
                    .map(|(_, c)| c.to_string())
                    .ok_or(Error::NoDetChan(idx as i32)),
                "firmware_set" => ch.firmware_set.clone().ok_or_else(|| Error::MissingFirm(alias.to_string())),
                "defaults" => ch.defaults.clone().ok_or_else(|| Error::IncompleteDefaults(alias.to_string())),
                _ => Err(Error::BadName(name.into())),
            };
        }
        Err(Error::BadName(name.into()))
    }

    /// Removing a Module does not cascade into the logical-channel tree
    /// (which has no removal primitive, §3); callers must not leave stale
    /// Single-channel bindings in place afterward.
    pub fn remove_module(&mut self, alias: &str) -> Result<()> {
        self.modules.remove(alias).map(|_| ())
    }

    pub fn num_modules(&self) -> usize {
        self.modules.num()
    }

    pub fn module_aliases(&self) -> Vec<String> {
        self.modules.aliases().map(str::to_string).collect()
    }

    pub fn module_alias_by_index(&self, index: usize) -> Result<String> {
        self.modules.alias_by_index(index).map(str::to_string)
    }

    // ---- Logical-channel handle resolution helpers ----

    /// Every (module alias, module-channel index) pair a handle fans out to
    /// (§4.9/§4.10 resolution). Used by operations that broadcast across a
    /// Set the way the run controller does.
    fn resolve_all(&self, handle: i32) -> Result<Vec<(String, u32)>> {
        self.channel_tree
            .resolve(handle)?
            .into_iter()
            .map(|(logical, module_alias)| {
                let idx = self
                    .modules
                    .get(&module_alias)?
                    .find_logical(logical)
                    .ok_or(Error::NoModChan(logical))?;
                Ok((module_alias, idx))
            })
            .collect()
    }

    /// The first (module alias, module-channel index, defaults alias,
    /// detector binding) a handle resolves to, for scalar get-style
    /// operations that return a single value.
    fn resolve_primary(&self, handle: i32) -> Result<(String, u32, Option<String>, Option<(String, u32)>)> {
        let resolved = self.channel_tree.resolve(handle)?;
        let (logical, module_alias) = resolved.into_iter().next().ok_or(Error::BadChannel(handle))?;
        let module = self.modules.get(&module_alias)?;
        let idx = module.find_logical(logical).ok_or(Error::NoModChan(logical))?;
        let ch = module.channel(idx)?;
        Ok((module_alias, idx, ch.defaults.clone(), ch.detector_binding.clone()))
    }

    // ---- User-setup sequencer (L8, §4.8) ----

    /// Replays a module's Defaults onto hardware in insertion order. Not
    /// called implicitly by `start_system()` — the client lifecycle keeps
    /// the two calls separate (§9 Open Question resolution).
    pub fn user_setup(&mut self, handle: i32) -> Result<()> {
        let resolved = self.channel_tree.resolve(handle)?;
        let mut seen = HashSet::new();
        for (_logical, module_alias) in resolved {
            if !seen.insert(module_alias.clone()) {
                continue;
            }
            let product_type = self.modules.get(&module_alias)?.product_type.clone();
            let (firmware_set_alias, detector_binding, channel_defaults_alias) = {
                let module = self.modules.get(&module_alias)?;
                let first_idx = module.active_channel_indices().next();
                let fs_alias = first_idx.and_then(|i| module.channel(i).ok()).and_then(|c| c.firmware_set.clone());
                let det_binding = first_idx.and_then(|i| module.channel(i).ok()).and_then(|c| c.detector_binding.clone());
                let chan_defaults: Vec<Option<String>> = module.channels.iter().map(|c| c.defaults.clone()).collect();
                (fs_alias, det_binding, chan_defaults)
            };
            let det_chan = detector_binding.as_ref().map(|(_, c)| *c).unwrap_or(0);

            let LibraryState {
                modules, defaults, firmware_sets, detectors, drivers, bus, archive, ..
            } = self;
            let driver = drivers.get_mut(&product_type).ok_or_else(|| Error::UnknownBtype(product_type.clone()))?;
            let fs = firmware_set_alias.as_deref().and_then(|a| firmware_sets.get(a).ok());
            let det = detector_binding.as_ref().and_then(|(a, _)| detectors.get(a).ok());
            let module = modules.get_mut(&module_alias)?;
            let mut defaults_by_channel = |idx: u32| -> Option<&mut Defaults> {
                channel_defaults_alias.get(idx as usize)?.as_ref().and_then(|alias| defaults.get_mut(alias).ok())
            };
            UserSetup::run(
                bus.as_mut(),
                archive.as_mut(),
                driver.as_mut(),
                -1,
                module,
                fs,
                det,
                det_chan,
                &mut defaults_by_channel,
            )?;
        }
        Ok(())
    }

    // ---- Acquisition values (L6, §4.6) ----

    pub fn set_acquisition_value(&mut self, handle: i32, name: &str, value: f64) -> Result<f64> {
        let targets = self.resolve_all(handle)?;
        let mut result = value;
        for (module_alias, module_channel) in targets {
            let product_type = self.modules.get(&module_alias)?.product_type.clone();
            let (firmware_set_alias, defaults_alias, detector_binding) = {
                let ch = self.modules.get(&module_alias)?.channel(module_channel)?;
                (ch.firmware_set.clone(), ch.defaults.clone(), ch.detector_binding.clone())
            };
            let defaults_alias = defaults_alias.ok_or_else(|| Error::IncompleteDefaults(module_alias.clone()))?;
            let det_chan = detector_binding.as_ref().map(|(_, c)| *c).unwrap_or(0);
            let det_alias = detector_binding.map(|(a, _)| a);
            let detector_type = det_alias
                .as_deref()
                .and_then(|a| self.detectors.get(a).ok())
                .map(|d| d.dtype)
                .unwrap_or(DetectorType::Unknown);

            let LibraryState {
                modules, defaults, firmware_sets, detectors, drivers, bus, archive, ..
            } = self;
            let driver = drivers.get_mut(&product_type).ok_or_else(|| Error::UnknownBtype(product_type.clone()))?;
            let fs = firmware_set_alias.as_deref().and_then(|a| firmware_sets.get(a).ok());
            let det = det_alias.as_deref().and_then(|a| detectors.get(a).ok());
            let module = modules.get_mut(&module_alias)?;
            let def = defaults.get_mut(&defaults_alias)?;
            AcquisitionEngine::set(
                bus.as_mut(),
                archive.as_mut(),
                driver.as_mut(),
                module_channel as i32,
                name,
                &mut result,
                def,
                fs,
                det,
                det_chan,
                detector_type,
                module,
                module_channel,
            )?;
        }
        Ok(result)
    }

    pub fn get_acquisition_value(&mut self, handle: i32, name: &str) -> Result<f64> {
        let (module_alias, module_channel, defaults_alias, _) = self.resolve_primary(handle)?;
        let product_type = self.modules.get(&module_alias)?.product_type.clone();
        let defaults_alias = defaults_alias.ok_or_else(|| Error::IncompleteDefaults(module_alias.clone()))?;
        let LibraryState { modules, defaults, drivers, bus, .. } = self;
        let driver = drivers.get(&product_type).ok_or_else(|| Error::UnknownBtype(product_type.clone()))?;
        let module = modules.get(&module_alias)?;
        let def = defaults.get(&defaults_alias)?;
        AcquisitionEngine::get(bus.as_mut(), driver.as_ref(), module_channel as i32, name, def, module, module_channel)
    }

    /// Drops the Defaults entry and reruns `user_setup` on the channel to
    /// restore coherence (§4.6).
    pub fn remove_acquisition_value(&mut self, handle: i32, name: &str) -> Result<()> {
        let targets = self.resolve_all(handle)?;
        for (module_alias, module_channel) in &targets {
            let defaults_alias = self.modules.get(module_alias)?.channel(*module_channel)?.defaults.clone();
            if let Some(defaults_alias) = defaults_alias {
                AcquisitionEngine::remove(self.defaults.get_mut(&defaults_alias)?, name)?;
            }
        }
        self.user_setup(handle)
    }

    /// No narrower recomputation path exists in the engine beyond what
    /// `set()` already performs inline; `update_user_params` reruns the same
    /// Defaults replay `user_setup` does.
    pub fn update_user_params(&mut self, handle: i32) -> Result<()> {
        self.user_setup(handle)
    }

    pub fn gain_operation(&mut self, handle: i32, name: &str, value: f64) -> Result<()> {
        let targets = self.resolve_all(handle)?;
        for (module_alias, module_channel) in targets {
            let product_type = self.modules.get(&module_alias)?.product_type.clone();
            let (defaults_alias, detector_binding) = {
                let ch = self.modules.get(&module_alias)?.channel(module_channel)?;
                (ch.defaults.clone(), ch.detector_binding.clone())
            };
            let defaults_alias = defaults_alias.ok_or_else(|| Error::IncompleteDefaults(module_alias.clone()))?;
            let det_alias = detector_binding.map(|(a, _)| a);
            let requires_apply = self.drivers.get(&product_type).map(|d| d.requires_gain_apply()).unwrap_or(true);

            {
                let LibraryState { modules, defaults, detectors, drivers, bus, .. } = self;
                let driver = drivers.get_mut(&product_type).ok_or_else(|| Error::UnknownBtype(product_type.clone()))?;
                let det = det_alias.as_deref().and_then(|a| detectors.get(a).ok());
                let module = modules.get_mut(&module_alias)?;
                let def = defaults.get_mut(&defaults_alias)?;
                driver.gain_operation(bus.as_mut(), module_channel as i32, name, value, det, module, module_channel, def)?;
            }

            // §9 Open Question 2: the analog-gain path latches through a
            // short apply run when the product requires it.
            if requires_apply {
                self.bus.start_run(module_channel as i32, false)?;
                let mut polls = 0;
                loop {
                    if self.bus.read_symbol(module_channel as i32, "BUSY")? != BUSY_APPLY_LATCHED {
                        break;
                    }
                    polls += 1;
                    if polls >= APPLY_RUN_MAX_POLLS {
                        return Err(Error::Timeout("gain apply run".into()));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                self.bus.stop_run(module_channel as i32)?;
            }
        }
        Ok(())
    }

    pub fn gain_calibrate(&mut self, handle: i32, delta_gain: f64) -> Result<()> {
        let targets = self.resolve_all(handle)?;
        for (module_alias, module_channel) in targets {
            let product_type = self.modules.get(&module_alias)?.product_type.clone();
            let (defaults_alias, detector_binding) = {
                let ch = self.modules.get(&module_alias)?.channel(module_channel)?;
                (ch.defaults.clone(), ch.detector_binding.clone())
            };
            let defaults_alias = defaults_alias.ok_or_else(|| Error::IncompleteDefaults(module_alias.clone()))?;
            let det_alias = detector_binding.map(|(a, _)| a);

            let LibraryState { modules, defaults, detectors, drivers, bus, .. } = self;
            let driver = drivers.get_mut(&product_type).ok_or_else(|| Error::UnknownBtype(product_type.clone()))?;
            let det = det_alias.as_deref().and_then(|a| detectors.get(a).ok());
            let module = modules.get_mut(&module_alias)?;
            let def = defaults.get_mut(&defaults_alias)?;
            driver.gain_calibrate(bus.as_mut(), module_channel as i32, det, module, module_channel, def, delta_gain)?;
        }
        Ok(())
    }

    // ---- DSP parameters (§6) ----

    pub fn get_parameter(&mut self, handle: i32, name: &str) -> Result<f64> {
        let (module_alias, module_channel, _, _) = self.resolve_primary(handle)?;
        let product_type = self.modules.get(&module_alias)?.product_type.clone();
        let driver = self.drivers.get(&product_type).ok_or_else(|| Error::UnknownBtype(product_type.clone()))?;
        driver.get_parameter(self.bus.as_mut(), module_channel as i32, name)
    }

    pub fn set_parameter(&mut self, handle: i32, name: &str, value: f64) -> Result<()> {
        let (module_alias, module_channel, _, _) = self.resolve_primary(handle)?;
        let product_type = self.modules.get(&module_alias)?.product_type.clone();
        let driver = self.drivers.get_mut(&product_type).ok_or_else(|| Error::UnknownBtype(product_type.clone()))?;
        driver.set_parameter(self.bus.as_mut(), module_channel as i32, name, value)
    }

    pub fn get_num_params(&mut self, handle: i32) -> Result<usize> {
        let (module_alias, module_channel, _, _) = self.resolve_primary(handle)?;
        let product_type = self.modules.get(&module_alias)?.product_type.clone();
        let driver = self.drivers.get(&product_type).ok_or_else(|| Error::UnknownBtype(product_type.clone()))?;
        driver.num_params(self.bus.as_mut(), module_channel as i32)
    }

    pub fn get_param_name(&mut self, handle: i32, index: usize) -> Result<String> {
        let (module_alias, module_channel, _, _) = self.resolve_primary(handle)?;
        let product_type = self.modules.get(&module_alias)?.product_type.clone();
        let driver = self.drivers.get(&product_type).ok_or_else(|| Error::UnknownBtype(product_type.clone()))?;
        driver.param_name_by_index(self.bus.as_mut(), module_channel as i32, index)
    }

    /// `get_param_data(handle, "names"|"values", out)`; `"access"`,
    /// `"lower_bounds"` and `"upper_bounds"` have no counterpart on
    /// `ProductDriver` (no bounds-reporting capability is defined) and
    /// return `Unimplemented`.
    pub fn get_param_data(&mut self, handle: i32, what: &str) -> Result<Vec<f64>> {
        match what {
            "values" => {
                let n = self.get_num_params(handle)?;
                let mut out = Vec::with_capacity(n);
                for i in 0..n {
                    let name = self.get_param_name(handle, i)?;
                    out.push(self.get_parameter(handle, &name)?);
                }
                Ok(out)
            }
            "names" | "access" | "lower_bounds" | "upper_bounds" => Err(Error::Unimplemented(format!("get_param_data({})", what))),
            other => Err(Error::BadName(other.to_string())),
        }
    }

    pub fn get_param_names(&mut self, handle: i32) -> Result<Vec<String>> {
        let n = self.get_num_params(handle)?;
        (0..n).map(|i| self.get_param_name(handle, i)).collect()
    }

    // ---- Run control (L9, §4.9) ----

    pub fn start_run(&mut self, handle: i32, resume: bool) -> Result<()> {
        let resolved = self.channel_tree.resolve(handle)?;
        let mut precomputed: HashMap<String, Defaults> = HashMap::new();
        for (_, module_alias) in &resolved {
            if precomputed.contains_key(module_alias) {
                continue;
            }
            let def = self
                .modules
                .get(module_alias)
                .ok()
                .and_then(|m| m.active_channel_indices().next().and_then(|idx| m.channel(idx).ok().cloned()))
                .and_then(|ch| ch.defaults)
                .and_then(|alias| self.defaults.get(&alias).ok().cloned())
                .unwrap_or_default();
            precomputed.insert(module_alias.clone(), def);
        }
        let LibraryState { channel_tree, modules, drivers, bus, .. } = self;
        RunController::start_run(
            channel_tree,
            handle,
            resume,
            modules,
            drivers,
            &|alias: &str| precomputed.get(alias).cloned().unwrap_or_default(),
            bus.as_mut(),
        )
    }

    pub fn stop_run(&mut self, handle: i32) -> Result<()> {
        let LibraryState { channel_tree, modules, drivers, bus, .. } = self;
        RunController::stop_run(channel_tree, handle, modules, drivers, bus.as_mut())
    }

    pub fn get_run_data(&mut self, handle: i32, name: &str) -> Result<RunDataValue> {
        let (module_alias, module_channel, defaults_alias, _) = self.resolve_primary(handle)?;
        let product_type = self.modules.get(&module_alias)?.product_type.clone();
        let defaults_alias = defaults_alias.ok_or_else(|| Error::IncompleteDefaults(module_alias.clone()))?;
        let LibraryState { modules, defaults, drivers, bus, .. } = self;
        let driver = drivers.get(&product_type).ok_or_else(|| Error::UnknownBtype(product_type.clone()))?;
        let module = modules.get(&module_alias)?;
        let def = defaults.get(&defaults_alias)?;
        Readout::get_run_data(bus.as_mut(), driver.as_ref(), module_channel as i32, name, def, module, module_channel)
    }

    /// Thin LibraryState-level dispatch to the driver's own special-run
    /// handling; the generic control-task poll sequencer in `run_control` is
    /// plumbing the driver crate uses internally, not called directly here.
    pub fn do_special_run(&mut self, handle: i32, name: &str, info: &[f64]) -> Result<()> {
        let (module_alias, module_channel, defaults_alias, detector_binding) = self.resolve_primary(handle)?;
        let product_type = self.modules.get(&module_alias)?.product_type.clone();
        let defaults_alias = defaults_alias.ok_or_else(|| Error::IncompleteDefaults(module_alias.clone()))?;
        let det_chan = detector_binding.as_ref().map(|(_, c)| *c).unwrap_or(0);
        let det_alias = detector_binding.map(|(a, _)| a);

        let LibraryState { defaults, detectors, drivers, bus, .. } = self;
        let driver = drivers.get_mut(&product_type).ok_or_else(|| Error::UnknownBtype(product_type.clone()))?;
        let det = det_alias.as_deref().and_then(|a| detectors.get(a).ok());
        let def = defaults.get(&defaults_alias)?;
        driver.do_special_run(bus.as_mut(), module_channel as i32, name, info, def, det, det_chan)
    }

    pub fn get_special_run_data(&mut self, handle: i32, name: &str) -> Result<f64> {
        let (module_alias, module_channel, defaults_alias, _) = self.resolve_primary(handle)?;
        let product_type = self.modules.get(&module_alias)?.product_type.clone();
        let defaults_alias = defaults_alias.ok_or_else(|| Error::IncompleteDefaults(module_alias.clone()))?;
        let LibraryState { defaults, drivers, bus, .. } = self;
        let driver = drivers.get(&product_type).ok_or_else(|| Error::UnknownBtype(product_type.clone()))?;
        let def = defaults.get(&defaults_alias)?;
        driver.get_special_run_data(bus.as_mut(), module_channel as i32, name, def)
    }

    // ---- Board operations (§6) ----

    pub fn board_operation(&mut self, handle: i32, name: &str, value: f64) -> Result<f64> {
        let (module_alias, module_channel, defaults_alias, _) = self.resolve_primary(handle)?;
        let product_type = self.modules.get(&module_alias)?.product_type.clone();
        let defaults_alias = defaults_alias.ok_or_else(|| Error::IncompleteDefaults(module_alias.clone()))?;
        let mut v = value;
        let LibraryState { defaults, drivers, bus, .. } = self;
        let driver = drivers.get_mut(&product_type).ok_or_else(|| Error::UnknownBtype(product_type.clone()))?;
        let def = defaults.get(&defaults_alias)?;
        driver.board_operation(bus.as_mut(), module_channel as i32, name, &mut v, def)?;
        Ok(v)
    }

    /// `memory_operation(handle, "{type}:{r|w}:{addr}:{len}", data)` (§6).
    /// `handle` is validated against the channel tree but does not select
    /// which bus instance services the read/write — this model's
    /// `DeviceBus` represents one already-opened connection, not a
    /// multiplexed per-module fleet.
    pub fn memory_operation(&mut self, handle: i32, op: &str, data: &mut Vec<u16>) -> Result<()> {
        self.channel_tree.resolve(handle)?;
        let parsed = transport::parse_memory_op(op)?;
        let region = parsed.region()?;
        if parsed.write {
            if data.len() != parsed.len {
                return Err(Error::MemoryLength {
                    region: parsed.kind.clone(),
                    requested: data.len(),
                    capacity: parsed.len,
                });
            }
            self.bus.write_memory(region, parsed.addr, data)
        } else {
            *data = self.bus.read_memory(region, parsed.addr, parsed.len)?;
            Ok(())
        }
    }

    /// No generic command-byte primitive exists on `DeviceBus` (§1
    /// Non-goals: the core never speaks a wire protocol); raw command
    /// passthrough is left to a future product-specific capability.
    pub fn command_operation(&mut self, _handle: i32, cmd: &str, _send: &[u8], _recv: &mut Vec<u8>) -> Result<()> {
        Err(Error::Unimplemented(format!("command_operation({})", cmd)))
    }

    /// Process-scheduling priority hints are host-OS specific and out of
    /// scope (§1 Non-goals); this only logs the request.
    pub fn set_io_priority(&mut self, priority: i32) -> Result<()> {
        info!(priority, "I/O priority request noted (host scheduling is out of scope)");
        Ok(())
    }

    pub fn download_firmware(&mut self, handle: i32, kind: FirmwareKind) -> Result<()> {
        let targets = self.resolve_all(handle)?;
        for (module_alias, module_channel) in targets {
            let product_type = self.modules.get(&module_alias)?.product_type.clone();
            let (firmware_set_alias, defaults_alias, detector_binding) = {
                let ch = self.modules.get(&module_alias)?.channel(module_channel)?;
                (ch.firmware_set.clone(), ch.defaults.clone(), ch.detector_binding.clone())
            };
            let firmware_set_alias = firmware_set_alias.ok_or_else(|| Error::MissingFirm(module_alias.clone()))?;
            let defaults_alias = defaults_alias.ok_or_else(|| Error::IncompleteDefaults(module_alias.clone()))?;
            let detector_type = detector_binding
                .as_ref()
                .and_then(|(a, _)| self.detectors.get(a).ok())
                .map(|d| d.dtype)
                .unwrap_or(DetectorType::Unknown);
            let peaking_time = self
                .defaults
                .get(&defaults_alias)
                .ok()
                .and_then(|d| d.get("peaking_time").ok())
                .unwrap_or(GLOBAL_FIRMWARE_NOMINAL_PTIME);

            let resolved = {
                let fs = self.firmware_sets.get(&firmware_set_alias)?;
                let def = self.defaults.get(&defaults_alias)?;
                FirmwareResolver::resolve(fs, kind, peaking_time, detector_type, Some(def), None, self.archive.as_mut())?
            };

            let LibraryState { modules, defaults, drivers, bus, .. } = self;
            let driver = drivers.get_mut(&product_type).ok_or_else(|| Error::UnknownBtype(product_type.clone()))?;
            let def = defaults.get(&defaults_alias)?;
            let module = modules.get_mut(&module_alias)?;
            driver.download_firmware(
                bus.as_mut(),
                module_channel as i32,
                kind,
                &resolved.staged_path,
                module,
                module_channel,
                &resolved.raw_name,
                def,
            )?;
            module.channel_mut(module_channel)?.current_firmware.set(kind, resolved.raw_name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::capability::mock::{MemoryBus, StaticArchive};
    use crate::capability::{RunDataValue, StatisticsLayout};

    struct StubDriver;
    impl ProductDriver for StubDriver {
        fn channel_count(&self) -> u32 {
            1
        }
        fn clock_speed_mhz(&self, _m: &Module) -> Result<f64> {
            Ok(20.0)
        }
        fn decimation(&self, _bus: &mut dyn DeviceBus, _channel: i32) -> Result<u32> {
            Ok(0)
        }
        fn statistics_layout(&self) -> StatisticsLayout {
            StatisticsLayout {
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
        fn mca_start_address(&self, _m: &Module, _c: u32) -> Result<u32> {
            Ok(0)
        }
        fn number_mca_channels(&self, _d: &Defaults) -> Result<u32> {
            Ok(16)
        }
        fn baseline_length(&self, _d: &Defaults) -> Result<u32> {
            Ok(16)
        }
        fn validate_module(&self, _m: &Module) -> Result<()> {
            Ok(())
        }
        fn validate_defaults(&self, _d: &Defaults) -> Result<()> {
            Ok(())
        }
        fn download_firmware(
            &mut self,
            _b: &mut dyn DeviceBus,
            _c: i32,
            _k: FirmwareKind,
            _p: &str,
            _m: &mut Module,
            _mc: u32,
            _r: &str,
            _d: &Defaults,
        ) -> Result<()> {
            Ok(())
        }
        fn set_acquisition_value(
            &mut self,
            _b: &mut dyn DeviceBus,
            _c: i32,
            _n: &str,
            _v: &mut f64,
            _d: &mut Defaults,
            _fs: Option<&FirmwareSet>,
            _m: &mut Module,
            _mc: u32,
            _det: Option<&Detector>,
            _dc: u32,
        ) -> Result<()> {
            Ok(())
        }
        fn get_acquisition_value(&self, _b: &mut dyn DeviceBus, _c: i32, _n: &str, _d: &Defaults) -> Result<f64> {
            Ok(0.0)
        }
        fn gain_operation(
            &mut self,
            _b: &mut dyn DeviceBus,
            _c: i32,
            _n: &str,
            _v: f64,
            _det: Option<&Detector>,
            _m: &mut Module,
            _mc: u32,
            _d: &mut Defaults,
        ) -> Result<()> {
            Ok(())
        }
        fn gain_calibrate(
            &mut self,
            _b: &mut dyn DeviceBus,
            _c: i32,
            _det: Option<&Detector>,
            _m: &mut Module,
            _mc: u32,
            _d: &mut Defaults,
            _dg: f64,
        ) -> Result<()> {
            Ok(())
        }
        fn start_run(&mut self, b: &mut dyn DeviceBus, c: i32, resume: bool, _d: &Defaults, _m: &mut Module) -> Result<()> {
            b.start_run(c, resume)
        }
        fn stop_run(&mut self, b: &mut dyn DeviceBus, c: i32, _m: &mut Module) -> Result<()> {
            b.stop_run(c)
        }
        fn get_run_data(&self, _b: &mut dyn DeviceBus, _c: i32, n: &str, _d: &Defaults, _m: &Module) -> Result<RunDataValue> {
            Err(Error::UnknownValue(n.to_string()))
        }
        fn do_special_run(
            &mut self,
            _b: &mut dyn DeviceBus,
            _c: i32,
            _n: &str,
            _i: &[f64],
            _d: &Defaults,
            _det: Option<&Detector>,
            _dc: u32,
        ) -> Result<()> {
            Ok(())
        }
        fn get_special_run_data(&self, _b: &mut dyn DeviceBus, _c: i32, _n: &str, _d: &Defaults) -> Result<f64> {
            Ok(0.0)
        }
        fn user_setup(
            &mut self,
            _b: &mut dyn DeviceBus,
            _c: i32,
            _d: &mut Defaults,
            _fs: Option<&FirmwareSet>,
            _dt: DetectorType,
            _det: Option<&Detector>,
            _dc: u32,
            _m: &mut Module,
            _mc: u32,
        ) -> Result<()> {
            Ok(())
        }
        fn module_setup(&mut self, _b: &mut dyn DeviceBus, _c: i32, _d: &Defaults, _m: &mut Module) -> Result<()> {
            Ok(())
        }
        fn num_defaults(&self) -> usize {
            0
        }
        fn default_seed(&self, _i: usize) -> (String, f64) {
            (String::new(), 0.0)
        }
        fn get_parameter(&self, _b: &mut dyn DeviceBus, _c: i32, _n: &str) -> Result<f64> {
            Ok(0.0)
        }
        fn set_parameter(&mut self, _b: &mut dyn DeviceBus, _c: i32, _n: &str, _v: f64) -> Result<()> {
            Ok(())
        }
        fn num_params(&self, _b: &mut dyn DeviceBus, _c: i32) -> Result<usize> {
            Ok(0)
        }
        fn param_name_by_index(&self, _b: &mut dyn DeviceBus, _c: i32, _i: usize) -> Result<String> {
            Ok(String::new())
        }
        fn board_operation(&mut self, _b: &mut dyn DeviceBus, _c: i32, _n: &str, _v: &mut f64, _d: &Defaults) -> Result<()> {
            Ok(())
        }
        fn free_scas(&mut self, _m: &mut Module, _mc: u32) -> Result<()> {
            Ok(())
        }
        fn unhook(&mut self, _c: i32) -> Result<()> {
            Ok(())
        }
    }

    fn basic_library() -> LibraryState {
        let mut lib = LibraryState::new(Box::new(MemoryBus::new()), Box::new(StaticArchive::new("/tmp")));
        lib.register_driver("stub", Box::new(StubDriver));
        lib.init_handel().unwrap();
        lib.new_module("mod0").unwrap();
        lib.add_module_item("mod0", "product_type", "stub").unwrap();
        lib.add_module_item("mod0", "number_of_channels", "1").unwrap();
        lib.add_module_item("mod0", "interface", "usb").unwrap();
        lib.add_module_item("mod0", "device_number", "0").unwrap();
        lib.add_module_item("mod0", "channel0_logical_channel", "0").unwrap();
        lib
    }

    #[test]
    fn add_module_item_builds_transport_from_staged_fields() {
        let lib = basic_library();
        assert_eq!(lib.get_module_item("mod0", "interface").unwrap(), "usb");
    }

    #[test]
    fn start_system_then_start_run_and_stop_run_round_trip() {
        let mut lib = basic_library();
        lib.start_system().unwrap();
        lib.start_run(0, false).unwrap();
        assert_eq!(lib.get_run_data(0, "run_active").unwrap(), RunDataValue::Bitmask(1));
        lib.stop_run(0).unwrap();
        assert_eq!(lib.get_run_data(0, "run_active").unwrap(), RunDataValue::Bitmask(0));
    }

    #[test]
    fn detector_channel_may_arrive_before_detector_alias() {
        let mut lib = basic_library();
        lib.new_detector("det0").unwrap();
        lib.add_module_item("mod0", "channel0_detector_channel", "2").unwrap();
        lib.add_module_item("mod0", "channel0_detector", "det0").unwrap();
        assert_eq!(lib.get_module_item("mod0", "channel0_detector").unwrap(), "det0");
        assert_eq!(lib.get_module_item("mod0", "channel0_detector_channel").unwrap(), "2");
    }

    #[test]
    fn save_system_rejects_unknown_format() {
        let lib = basic_library();
        let err = lib.save_system("xml", "/tmp/out.ini").unwrap_err();
        assert!(matches!(err, Error::BadSystemItem(_)));
    }

    #[test]
    fn start_system_before_init_fails() {
        let mut lib = LibraryState::new(Box::new(MemoryBus::new()), Box::new(StaticArchive::new("/tmp")));
        let err = lib.start_system().unwrap_err();
        assert!(matches!(err, Error::Initialize));
    }
}
