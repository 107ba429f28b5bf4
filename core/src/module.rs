// SPDX-License-Identifier: LGPL-3.0-or-later

//! Module entity (§3): transport binding, per-channel detector/firmware/
//! defaults bindings, SCA ranges, and the CurrentFirmware cache.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::firmware::FirmwareKind;

/// One of the five transport bindings a Module can carry (§6).
#[derive(Debug, Clone, PartialEq)]
pub enum Transport {
    Epp {
        address: u32,
        daisy_chain_id: Option<u32>,
    },
    Usb {
        device_number: u32,
    },
    Usb2 {
        device_number: u32,
    },
    Serial {
        port: SerialPort,
        baud_rate: u32,
    },
    Pxi {
        bus: u8,
        slot: u8,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SerialPort {
    ComPort(u32),
    DeviceFile(String),
}

impl Transport {
    /// The interface-kind keyword used in the configuration grammar (§6).
    pub fn kind_keyword(&self) -> &'static str {
        match self {
            Transport::Epp { .. } => "epp",
            Transport::Usb { .. } => "usb",
            Transport::Usb2 { .. } => "usb2",
            Transport::Serial { .. } => "serial",
            Transport::Pxi { .. } => "pxi",
        }
    }
}

/// Avoids re-downloading identical firmware on parameter changes: slots
/// hold the raw filename last staged for each kind, compared against a
/// freshly resolved raw filename before a download is issued (§3).
#[derive(Debug, Clone, Default)]
pub struct CurrentFirmware {
    slots: HashMap<FirmwareKind, String>,
}

impl CurrentFirmware {
    pub fn raw_name(&self, kind: FirmwareKind) -> Option<&str> {
        self.slots.get(&kind).map(|s| s.as_str())
    }

    /// Returns `true` if `raw_name` differs from (or is not yet present in)
    /// the cache, i.e. a download is required. Updates the cache either way
    /// is left to the caller via [`Self::set`], matching the driver
    /// contract: compare first, write firmware, then cache.
    pub fn needs_download(&self, kind: FirmwareKind, raw_name: &str) -> bool {
        self.slots.get(&kind).map(|s| s.as_str()) != Some(raw_name)
    }

    pub fn set(&mut self, kind: FirmwareKind, raw_name: String) {
        self.slots.insert(kind, raw_name);
    }
}

/// A single-channel-analyzer region of interest (low/high bin pair).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sca {
    pub lo: u32,
    pub hi: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ModuleChannel {
    pub logical_channel: Option<i32>,
    pub detector_binding: Option<(String, u32)>,
    pub firmware_set: Option<String>,
    pub defaults: Option<String>,
    pub scas: Vec<Sca>,
    pub current_firmware: CurrentFirmware,
    pub run_active: bool,
}

impl ModuleChannel {
    pub fn is_disabled(&self) -> bool {
        self.logical_channel.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct Module {
    pub alias: String,
    pub product_type: String,
    pub transport: Option<Transport>,
    pub channels: Vec<ModuleChannel>,
    pub is_multichannel: bool,
    pub is_setup: bool,
}

impl Module {
    pub fn new() -> Self {
        Module {
            alias: String::new(),
            product_type: String::new(),
            transport: None,
            channels: Vec::new(),
            is_multichannel: false,
            is_setup: false,
        }
    }

    pub fn set_number_of_channels(&mut self, n: u32) -> Result<()> {
        if n == 0 {
            return Err(Error::InvalidNumchans(n));
        }
        self.channels = (0..n).map(|_| ModuleChannel::default()).collect();
        self.is_multichannel = n > 1;
        Ok(())
    }

    pub fn number_of_channels(&self) -> u32 {
        self.channels.len() as u32
    }

    pub fn channel(&self, index: u32) -> Result<&ModuleChannel> {
        self.channels
            .get(index as usize)
            .ok_or(Error::NoModChan(index as i32))
    }

    pub fn channel_mut(&mut self, index: u32) -> Result<&mut ModuleChannel> {
        self.channels
            .get_mut(index as usize)
            .ok_or(Error::NoModChan(index as i32))
    }

    /// Index (and channel) of the module channel bound to logical channel
    /// `logical`, if any.
    pub fn find_logical(&self, logical: i32) -> Option<u32> {
        self.channels
            .iter()
            .position(|c| c.logical_channel == Some(logical))
            .map(|i| i as u32)
    }

    pub fn active_channel_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_disabled())
            .map(|(i, _)| i as u32)
    }

    /// §4.9: broadcast `run_active` to every channel of a multichannel
    /// module.
    pub fn broadcast_run_active(&mut self, active: bool) {
        for c in self.channels.iter_mut() {
            c.run_active = active;
        }
    }

    pub fn any_run_active(&self) -> bool {
        self.channels.iter().any(|c| c.run_active)
    }

    /// §4.7 step 4 precondition / §3 invariant: number_of_channels matches
    /// the product driver's declared channel count.
    pub fn validate_channel_count(&self, expected: u32) -> Result<()> {
        if self.number_of_channels() != expected {
            return Err(Error::InvalidNumchans(self.number_of_channels()));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.transport.is_none() {
            return Err(Error::MissingInterface(self.alias.clone()));
        }
        if self.channels.is_empty() {
            return Err(Error::NoChannels(self.alias.clone()));
        }
        Ok(())
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn current_firmware_detects_change() {
        let mut cf = CurrentFirmware::default();
        assert!(cf.needs_download(FirmwareKind::Dsp, "a.bin"));
        cf.set(FirmwareKind::Dsp, "a.bin".into());
        assert!(!cf.needs_download(FirmwareKind::Dsp, "a.bin"));
        assert!(cf.needs_download(FirmwareKind::Dsp, "b.bin"));
    }

    #[test]
    fn broadcast_sets_every_channel() {
        let mut m = Module::new();
        m.set_number_of_channels(4).unwrap();
        m.broadcast_run_active(true);
        assert!(m.any_run_active());
        assert!(m.channels.iter().all(|c| c.run_active));
    }
}
