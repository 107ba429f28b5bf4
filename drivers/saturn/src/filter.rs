// SPDX-License-Identifier: LGPL-3.0-or-later

//! Slow-filter (SLOWLEN/SLOWGAP/PEAKINT/PEAKSAM) and fast-filter
//! (FASTLEN/FASTGAP) updates.
//!
//! Grounded in `pslUpdateFilter` / `pslUpdateTriggerFilter`: the slow
//! filter reuses the core's shared `compute_filter_update`, scaled by the
//! `DECIMATION` DSP symbol read live off the bus (`saturn_psl.c:3722-3734`)
//! rather than a fixed exponent; the fast filter enforces the same
//! SLOWLEN/SLOWGAP-shaped bounds under different error tags
//! (`FastlenOor`/`FastgapOor`/`FastfilterOor`) since it never shrinks
//! FASTGAP the way the slow filter shrinks SLOWGAP, and the reference
//! source never scales the fast filter by decimation at all.

use dppctl_core::{compute_filter_update, DeviceBus, Defaults, Error, FirmwareSet, Result};

/// `filterInfo[0]` / `filterInfo[1]`: PEAKINT/PEAKSAM offsets. Listed mode
/// carries them on the covering PTRR variant; archive mode (and the
/// no-firmware-set test doubles) fall back to Defaults overrides with no
/// PTRR suffix, then to zero.
pub fn filter_offsets(firmware_set: Option<&FirmwareSet>, defaults: &Defaults, peaking_time: f64) -> (u16, u16) {
    if let Some(fs) = firmware_set {
        if !fs.is_archive_mode() {
            if let Ok(variants) = fs.sorted_variants() {
                if let Some(v) = variants.iter().find(|v| v.covers(peaking_time)) {
                    if v.filter_info.len() >= 2 {
                        return (v.filter_info[0], v.filter_info[1]);
                    }
                }
            }
        }
    }
    let peakint = defaults.get("peakint_offset").unwrap_or(0.0) as u16;
    let peaksam = defaults.get("peaksam_offset").unwrap_or(0.0) as u16;
    (peakint, peaksam)
}

/// Updates SLOWLEN/SLOWGAP/PEAKINT/PEAKSAM for the given peaking/gap time,
/// writes them to the bus, and returns the actual (post-rounding) values.
/// `decimation` is the live `DECIMATION` DSP symbol (`ProductDriver::decimation`),
/// read by the caller since it needs the same `bus`/`channel` this function
/// goes on to write through.
#[allow(clippy::too_many_arguments)]
pub fn update_slow_filter(
    bus: &mut dyn DeviceBus,
    channel: i32,
    clock_mhz: f64,
    peaking_time: f64,
    gap_time: f64,
    firmware_set: Option<&FirmwareSet>,
    defaults: &Defaults,
    decimation: u32,
) -> Result<(f64, f64)> {
    let (peakint_offset, peaksam_offset) = filter_offsets(firmware_set, defaults, peaking_time);
    let update = compute_filter_update(peaking_time, gap_time, clock_mhz, decimation, peakint_offset, peaksam_offset)?;

    bus.write_symbol(channel, "SLOWLEN", update.slowlen as u16)?;
    bus.write_symbol(channel, "SLOWGAP", update.slowgap as u16)?;
    bus.write_symbol(channel, "PEAKINT", update.peakint as u16)?;
    bus.write_symbol(channel, "PEAKSAM", update.peaksam as u16)?;

    Ok((update.actual_peaking_time, update.actual_gap_time))
}

/// FASTLEN/FASTGAP for the trigger (fast) filter. Unlike the slow filter,
/// an over-length combination is a hard error rather than a shrink.
pub fn update_fast_filter(
    bus: &mut dyn DeviceBus,
    channel: i32,
    clock_mhz: f64,
    trigger_peaking_time: f64,
    trigger_gap_time: f64,
) -> Result<(f64, f64)> {
    if clock_mhz <= 0.0 {
        return Err(Error::ClockSpeed(clock_mhz));
    }
    let fastlen_i = (trigger_peaking_time * clock_mhz).round() as i64;
    if !(2..=28).contains(&fastlen_i) {
        return Err(Error::FastlenOor(fastlen_i));
    }
    let fastlen = fastlen_i as u32;

    let fastgap_i = (trigger_gap_time * clock_mhz).ceil() as i64;
    if fastgap_i > 29 || fastgap_i < 0 {
        return Err(Error::FastgapOor(fastgap_i));
    }
    let fastgap = fastgap_i as u32;

    if fastlen + fastgap > 31 {
        return Err(Error::FastfilterOor(format!("FASTLEN {} + FASTGAP {} > 31", fastlen, fastgap)));
    }

    bus.write_symbol(channel, "FASTLEN", fastlen as u16)?;
    bus.write_symbol(channel, "FASTGAP", fastgap as u16)?;

    Ok((fastlen as f64 / clock_mhz, fastgap as f64 / clock_mhz))
}

#[cfg(test)]
mod test {
    use super::*;
    use dppctl_core::mock::MemoryBus;

    #[test]
    fn slow_filter_writes_expected_symbols() {
        let mut bus = MemoryBus::new();
        let defaults = Defaults::new();
        // DECIMATION=3 scales 8us/20MHz down to SLOWLEN=20, in [2,28].
        let (pt, gt) = update_slow_filter(&mut bus, 0, 20.0, 8.0, 0.150, None, &defaults, 3).unwrap();
        assert!((pt - 8.0).abs() < 0.2);
        assert!(gt > 0.0);
        assert_eq!(bus.symbol("SLOWLEN"), 20);
    }

    #[test]
    fn slow_filter_rejects_slowlen_out_of_range_at_decimation_zero() {
        let mut bus = MemoryBus::new();
        let defaults = Defaults::new();
        let err = update_slow_filter(&mut bus, 0, 20.0, 8.0, 0.150, None, &defaults, 0).unwrap_err();
        assert!(matches!(err, Error::SlowlenOor(160)));
    }

    #[test]
    fn fast_filter_rejects_out_of_range_fastlen() {
        let mut bus = MemoryBus::new();
        let err = update_fast_filter(&mut bus, 0, 20.0, 0.01, 0.150).unwrap_err();
        assert!(matches!(err, Error::FastlenOor(_)));
    }

    #[test]
    fn trigger_threshold_scenario_matches_reference() {
        // clock=20MHz, FASTLEN=round(0.200*20)=4
        let mut bus = MemoryBus::new();
        let (pt, _gt) = update_fast_filter(&mut bus, 0, 20.0, 0.200, 0.0).unwrap();
        assert!((pt - 0.2).abs() < 1e-9);
    }
}
