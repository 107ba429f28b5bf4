// SPDX-License-Identifier: LGPL-3.0-or-later

//! Detector polarity and reset-delay/decay-time synchronization.
//!
//! Grounded in `psl__DownloadPolarity`/the type-value dispatch implied by
//! the `Detector` entity: POLARITY is a single bit per channel; the
//! type-value register depends on which `DetectorType` tag the bound
//! detector carries (`RESETINT` ticks for reset-preamp detectors,
//! `TAURC` ticks for RC-feedback detectors). Both writes only take effect
//! once latched by a quick run; the caller (`SaturnDriver::user_setup`)
//! does that once after every per-channel sync, not per field.

use crate::gain::quick_run;
use dppctl_core::{Detector, DetectorType, DeviceBus, Error, Polarity, Result};

/// Writes POLARITY and, if the detector's type is known, the reset-delay or
/// decay-time register. A no-op if no detector is bound to this channel yet
/// (module-only setup before a detector alias arrives).
pub fn sync_detector(
    bus: &mut dyn DeviceBus,
    channel: i32,
    clock_mhz: f64,
    detector_type: DetectorType,
    detector: Option<&Detector>,
    detector_channel: u32,
) -> Result<()> {
    let detector = match detector {
        Some(d) => d,
        None => return Ok(()),
    };

    let polarity = detector.polarity_at(detector_channel)?;
    bus.write_symbol(
        channel,
        "POLARITY",
        match polarity {
            Polarity::Positive => 1,
            Polarity::Negative => 0,
        },
    )?;

    if detector_type != DetectorType::Unknown {
        if clock_mhz <= 0.0 {
            return Err(Error::ClockSpeed(clock_mhz));
        }
        let type_value = detector.type_value_at(detector_channel)?;
        let ticks = (type_value * clock_mhz).round().clamp(0.0, u16::MAX as f64) as u16;
        let reg = match detector_type {
            DetectorType::Reset => "RESETINT",
            DetectorType::RcFeedback => "TAURC",
            DetectorType::Unknown => unreachable!("checked above"),
        };
        bus.write_symbol(channel, reg, ticks)?;
    }

    quick_run(bus, channel)
}

#[cfg(test)]
mod test {
    use super::*;
    use dppctl_core::mock::MemoryBus;

    fn detector_with(polarity: Polarity, dtype: DetectorType, type_value: f64) -> Detector {
        let mut d = Detector::new();
        d.alias = "det0".into();
        d.add_item("number_of_channels", "1").unwrap();
        d.add_item("type", match dtype {
            DetectorType::Reset => "reset",
            DetectorType::RcFeedback => "rc_feedback",
            DetectorType::Unknown => unreachable!(),
        })
        .unwrap();
        d.add_item("type_value", &type_value.to_string()).unwrap();
        d.add_item("channel0_gain", "1.0").unwrap();
        d.add_item(
            "channel0_polarity",
            match polarity {
                Polarity::Positive => "positive",
                Polarity::Negative => "negative",
            },
        )
        .unwrap();
        d
    }

    #[test]
    fn writes_polarity_and_reset_delay() {
        let mut bus = MemoryBus::new();
        let detector = detector_with(Polarity::Negative, DetectorType::Reset, 1.5);
        sync_detector(&mut bus, 0, 20.0, DetectorType::Reset, Some(&detector), 0).unwrap();
        assert_eq!(bus.symbol("POLARITY"), 0);
        assert_eq!(bus.symbol("RESETINT"), 30);
    }

    #[test]
    fn writes_decay_time_for_rc_feedback() {
        let mut bus = MemoryBus::new();
        let detector = detector_with(Polarity::Positive, DetectorType::RcFeedback, 2.0);
        sync_detector(&mut bus, 0, 20.0, DetectorType::RcFeedback, Some(&detector), 0).unwrap();
        assert_eq!(bus.symbol("POLARITY"), 1);
        assert_eq!(bus.symbol("TAURC"), 40);
        assert_eq!(bus.symbol("RESETINT"), 0);
    }

    #[test]
    fn no_detector_bound_is_a_no_op() {
        let mut bus = MemoryBus::new();
        sync_detector(&mut bus, 0, 20.0, DetectorType::Unknown, None, 0).unwrap();
        assert_eq!(bus.symbol("POLARITY"), 0);
    }
}
