// SPDX-License-Identifier: LGPL-3.0-or-later

//! In-process test doubles for [`DeviceBus`](super::DeviceBus) and
//! [`FirmwareArchive`](super::FirmwareArchive). Not gated behind a feature:
//! downstream driver crates need them for their own tests just as much as
//! `dppctl-core` does (§4.5 NEW).

use std::collections::HashMap;

use super::{DeviceBus, FirmwareArchive, MemRegion};
use crate::detector::DetectorType;
use crate::error::{Error, Result};
use crate::firmware::FirmwareKind;

/// An in-process `DeviceBus` backed by plain maps. `BUSY` and a run-ident
/// counter are simulated registers so run-controller/apply-step tests can
/// exercise the poll loops without a real timeout.
#[derive(Debug, Default)]
pub struct MemoryBus {
    registers: HashMap<String, u16>,
    symbols: HashMap<String, u16>,
    memory: HashMap<(u8, u32), u16>,
    run_active: HashMap<i32, bool>,
    busy: HashMap<i32, u16>,
    run_ident: HashMap<i32, u16>,
    control_task_busy: HashMap<i32, u32>,
    tick: u64,
    opened: bool,
}

fn region_tag(region: MemRegion) -> u8 {
    match region {
        MemRegion::Data => 0,
        MemRegion::Spectrum => 1,
        MemRegion::Register => 2,
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_symbol(&mut self, name: &str, value: u16) {
        self.symbols.insert(name.to_string(), value);
    }

    pub fn symbol(&self, name: &str) -> u16 {
        self.symbols.get(name).copied().unwrap_or(0)
    }

    pub fn seed_memory(&mut self, region: MemRegion, addr: u32, values: &[u16]) {
        for (i, v) in values.iter().enumerate() {
            self.memory.insert((region_tag(region), addr + i as u32), *v);
        }
    }

    /// Advance BUSY to 0 and bump the run-ident counter, as real hardware
    /// does when a run completes (used by run-controller tests to simulate
    /// completion without a real timeout).
    pub fn complete_run(&mut self, channel: i32) {
        self.busy.insert(channel, 0);
        let id = self.run_ident.entry(channel).or_insert(0);
        *id = id.wrapping_add(1);
    }

    pub fn set_busy(&mut self, channel: i32, value: u16) {
        self.busy.insert(channel, value);
    }
}

impl DeviceBus for MemoryBus {
    fn open(&mut self, _interface_kind: &str, _address: &str) -> Result<()> {
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.opened = false;
        Ok(())
    }

    fn read_memory(&mut self, region: MemRegion, addr: u32, len: usize) -> Result<Vec<u16>> {
        let tag = region_tag(region);
        Ok((0..len as u32)
            .map(|i| self.memory.get(&(tag, addr + i)).copied().unwrap_or(0))
            .collect())
    }

    fn write_memory(&mut self, region: MemRegion, addr: u32, data: &[u16]) -> Result<()> {
        let tag = region_tag(region);
        for (i, v) in data.iter().enumerate() {
            self.memory.insert((tag, addr + i as u32), *v);
        }
        Ok(())
    }

    fn read_register(&mut self, name: &str) -> Result<u16> {
        Ok(self.registers.get(name).copied().unwrap_or(0))
    }

    fn write_register(&mut self, name: &str, value: u16) -> Result<()> {
        self.registers.insert(name.to_string(), value);
        Ok(())
    }

    fn start_run(&mut self, channel: i32, _resume: bool) -> Result<()> {
        self.run_active.insert(channel, true);
        self.busy.insert(channel, 1);
        Ok(())
    }

    fn stop_run(&mut self, channel: i32) -> Result<()> {
        self.run_active.insert(channel, false);
        self.busy.insert(channel, 0);
        Ok(())
    }

    fn control_task_start(&mut self, channel: i32, _task_id: u32, _args: &[f64]) -> Result<()> {
        self.control_task_busy.insert(channel, 1);
        Ok(())
    }

    fn control_task_poll_busy(&mut self, channel: i32) -> Result<bool> {
        let busy = self.control_task_busy.entry(channel).or_insert(0);
        if *busy > 0 {
            *busy -= 1;
            Ok(*busy > 0)
        } else {
            Ok(false)
        }
    }

    fn control_task_read_result(&mut self, _channel: i32, len: usize) -> Result<Vec<u16>> {
        Ok(vec![0; len])
    }

    fn control_task_stop(&mut self, channel: i32) -> Result<()> {
        self.control_task_busy.insert(channel, 0);
        Ok(())
    }

    fn symbol_index(&mut self, _channel: i32, name: &str) -> Result<u16> {
        Ok(self
            .symbols
            .keys()
            .position(|k| k == name)
            .map(|p| p as u16)
            .unwrap_or(0))
    }

    fn symbol_name(&mut self, _channel: i32, index: u16) -> Result<String> {
        self.symbols
            .keys()
            .nth(index as usize)
            .cloned()
            .ok_or(Error::BadIndex(index as usize))
    }

    fn symbol_bounds(&mut self, _channel: i32, _name: &str) -> Result<(f64, f64)> {
        Ok((0.0, 65535.0))
    }

    fn read_symbol(&mut self, channel: i32, name: &str) -> Result<u16> {
        match name {
            "BUSY" => Ok(self.busy.get(&channel).copied().unwrap_or(0)),
            "RUNIDENT" => Ok(self.run_ident.get(&channel).copied().unwrap_or(0)),
            _ => Ok(self.symbol(name)),
        }
    }

    fn write_symbol(&mut self, _channel: i32, name: &str, value: u16) -> Result<()> {
        self.set_symbol(name, value);
        Ok(())
    }

    fn clock_tick(&mut self) -> Result<u64> {
        self.tick += 1;
        Ok(self.tick)
    }

    fn alloc(&mut self, _len: usize) -> Result<u32> {
        Ok(0)
    }

    fn free(&mut self, _addr: u32) -> Result<()> {
        Ok(())
    }
}

/// A `FirmwareArchive` that resolves from an in-memory table rather than a
/// real archive file, keyed by `(kind, detector_type)`.
#[derive(Debug, Default)]
pub struct StaticArchive {
    entries: HashMap<(FirmwareKind, DetectorType), (String, String)>,
    filters: Vec<u16>,
    temp: String,
}

impl StaticArchive {
    pub fn new(temp: impl Into<String>) -> Self {
        StaticArchive {
            entries: HashMap::new(),
            filters: vec![2, 2],
            temp: temp.into(),
        }
    }

    pub fn insert(
        &mut self,
        kind: FirmwareKind,
        detector_type: DetectorType,
        staged_path: impl Into<String>,
        raw_name: impl Into<String>,
    ) {
        self.entries
            .insert((kind, detector_type), (staged_path.into(), raw_name.into()));
    }
}

impl FirmwareArchive for StaticArchive {
    fn resolve(
        &mut self,
        _archive_path: &str,
        _temp_dir: &str,
        kind: FirmwareKind,
        _peaking_time: f64,
        detector_type: DetectorType,
        _keywords: &[String],
    ) -> Result<(String, String)> {
        self.entries
            .get(&(kind, detector_type))
            .cloned()
            .ok_or_else(|| Error::NoFilename(format!("{:?}/{:?}", kind, detector_type)))
    }

    fn num_filter(&mut self, _peaking_time: f64, _detector_type: DetectorType) -> Result<usize> {
        Ok(self.filters.len())
    }

    fn filter_info(&mut self, _peaking_time: f64, _detector_type: DetectorType) -> Result<Vec<u16>> {
        Ok(self.filters.clone())
    }

    fn temp_path(&self) -> &str {
        &self.temp
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn memory_bus_round_trips_a_symbol() {
        let mut bus = MemoryBus::new();
        bus.write_symbol(0, "SLOWLEN", 10).unwrap();
        assert_eq!(bus.read_symbol(0, "SLOWLEN").unwrap(), 10);
    }

    #[test]
    fn memory_bus_simulates_run_completion() {
        let mut bus = MemoryBus::new();
        bus.start_run(0, false).unwrap();
        assert_eq!(bus.read_symbol(0, "BUSY").unwrap(), 1);
        bus.complete_run(0);
        assert_eq!(bus.read_symbol(0, "BUSY").unwrap(), 0);
    }

    #[test]
    fn static_archive_resolves_known_entry() {
        let mut archive = StaticArchive::new("/tmp/x");
        archive.insert(FirmwareKind::Dsp, DetectorType::Reset, "/tmp/x/dsp.bin", "dsp-v1");
        let (path, raw) = archive
            .resolve("archive.bin", "/tmp/x", FirmwareKind::Dsp, 5.0, DetectorType::Reset, &[])
            .unwrap();
        assert_eq!(path, "/tmp/x/dsp.bin");
        assert_eq!(raw, "dsp-v1");
    }
}
