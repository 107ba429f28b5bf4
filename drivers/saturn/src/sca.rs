// SPDX-License-Identifier: LGPL-3.0-or-later

//! Single-channel-analyzer count and width management.
//!
//! Grounded in `pslSetNumberSCAs`/`pslFreeSCAMemory`: the hardware carries
//! one `NUMSCAS` DSP symbol capping how many `sca{n}_lo`/`sca{n}_hi` pairs
//! the acquisition engine (`dppctl_core::acquisition`) will accept; shrinking
//! it drops the now out-of-range entries from the Module's own SCA table
//! rather than leaving stale high regions behind.

use dppctl_core::{DeviceBus, Error, Module, Result, MAX_SCAS};

/// `pslSetNumberSCAs`: writes NUMSCAS and truncates the module channel's SCA
/// table to match. Growing never invents new ranges — the caller still has
/// to `set()` `sca{n}_lo`/`sca{n}_hi` for the new slots.
pub fn set_number_scas(bus: &mut dyn DeviceBus, channel: i32, module: &mut Module, module_channel: u32, count: u32) -> Result<()> {
    if count as usize > MAX_SCAS {
        return Err(Error::MaxScas(MAX_SCAS as u32));
    }
    bus.write_symbol(channel, "NUMSCAS", count as u16)?;
    let ch = module.channel_mut(module_channel)?;
    ch.scas.truncate(count as usize);
    Ok(())
}

pub fn num_scas(module: &Module, module_channel: u32) -> Result<u32> {
    Ok(module.channel(module_channel)?.scas.len() as u32)
}

/// `pslFreeSCAMemory`: drops every configured region without touching
/// NUMSCAS on the bus (teardown only, §4.5 `free_scas`).
pub fn free_scas(module: &mut Module, module_channel: u32) -> Result<()> {
    module.channel_mut(module_channel)?.scas.clear();
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use dppctl_core::mock::MemoryBus;

    #[test]
    fn shrinking_count_truncates_existing_ranges() {
        let mut bus = MemoryBus::new();
        let mut module = Module::new();
        module.set_number_of_channels(1).unwrap();
        module.channel_mut(0).unwrap().scas = vec![
            dppctl_core::Sca { lo: 0, hi: 10 },
            dppctl_core::Sca { lo: 11, hi: 20 },
            dppctl_core::Sca { lo: 21, hi: 30 },
        ];
        set_number_scas(&mut bus, 0, &mut module, 0, 1).unwrap();
        assert_eq!(num_scas(&module, 0).unwrap(), 1);
        assert_eq!(bus.symbol("NUMSCAS"), 1);
    }

    #[test]
    fn rejects_counts_above_max_scas() {
        let mut bus = MemoryBus::new();
        let mut module = Module::new();
        module.set_number_of_channels(1).unwrap();
        let err = set_number_scas(&mut bus, 0, &mut module, 0, MAX_SCAS as u32 + 1).unwrap_err();
        assert!(matches!(err, Error::MaxScas(_)));
    }

    #[test]
    fn free_scas_clears_table() {
        let mut module = Module::new();
        module.set_number_of_channels(1).unwrap();
        module.channel_mut(0).unwrap().scas = vec![dppctl_core::Sca { lo: 0, hi: 10 }];
        free_scas(&mut module, 0).unwrap();
        assert_eq!(num_scas(&module, 0).unwrap(), 0);
    }
}
