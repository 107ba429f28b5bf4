// SPDX-License-Identifier: LGPL-3.0-or-later

//! Per-channel addressable layout and the statistics symbol bases this
//! product exposes to the core's generic readout layer (§4.10). The layer
//! itself (snapshot read, tick-to-second conversion, ICR/OCR formulas)
//! lives in `dppctl_core::readout`; this module only supplies the bases and
//! the Defaults-driven lengths a single-channel DSP product reports.

use dppctl_core::{Defaults, Error, Module, Result, StatisticsLayout};

/// Every acquisition value `validate_defaults` (§4.7 step 4) requires
/// present before `start_system` succeeds, paired with a seed value
/// `default_seed` reports to callers that want to pre-populate a Defaults
/// bag (`ProductDriver::num_defaults`/`default_seed`, §4.5).
pub const REQUIRED_DEFAULTS: &[(&str, f64)] = &[
    ("peaking_time", 8.0),
    ("gap_time", 0.150),
    ("trigger_peaking_time", 0.2),
    ("trigger_gap_time", 0.0),
    ("trigger_threshold", 1000.0),
    ("energy_threshold", 0.0),
    ("baseline_threshold", 0.0),
    ("calibration_energy", 5900.0),
    ("adc_percent_rule", 5.0),
    ("mca_bin_width", 20.0),
    ("preamp_gain", 1.0),
    ("number_mca_channels", 2048.0),
    ("max_width", 1.0),
];

/// The reference product allocates one fixed-width MCA region per channel
/// starting at address 0 (`pslGetMCAStartAddress` on a single-channel
/// board never needs to query the device for it).
const MCA_CHANNEL_STRIDE: u32 = 8192;

pub fn statistics_layout() -> StatisticsLayout {
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

pub fn number_mca_channels(defaults: &Defaults) -> Result<u32> {
    let n = defaults.get("number_mca_channels")?;
    if n < 1.0 || n > u32::MAX as f64 {
        return Err(Error::BinsOor {
            value: n.max(0.0) as u32,
            min: 1,
            max: u32::MAX,
        });
    }
    Ok(n as u32)
}

/// Fixed for this product: the baseline history buffer is always 256
/// samples wide (`pslGetBaselineLen`).
pub fn baseline_length(_defaults: &Defaults) -> Result<u32> {
    Ok(256)
}

pub fn mca_start_address(_module: &Module, module_channel: u32) -> Result<u32> {
    Ok(module_channel * MCA_CHANNEL_STRIDE)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn number_mca_channels_rejects_nonpositive() {
        let mut d = Defaults::new();
        d.set("number_mca_channels", 0.0);
        assert!(matches!(number_mca_channels(&d), Err(Error::BinsOor { .. })));
    }

    #[test]
    fn mca_start_address_is_channel_strided() {
        let module = Module::new();
        assert_eq!(mca_start_address(&module, 0).unwrap(), 0);
        assert_eq!(mca_start_address(&module, 2).unwrap(), 2 * MCA_CHANNEL_STRIDE);
    }
}
