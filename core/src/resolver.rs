// SPDX-License-Identifier: LGPL-3.0-or-later

//! Firmware resolver (L4, §4.4): `(firmware_set, kind, peaking_time,
//! detector_type) -> (staged_path, raw_name)`, with filter-info override
//! from Defaults layered on top of whatever the set/archive provides.

use tracing::info;

use crate::capability::FirmwareArchive;
use crate::defaults::Defaults;
use crate::detector::DetectorType;
use crate::error::{Error, Result};
use crate::firmware::{FirmwareKind, FirmwareSet};

/// Nominal peaking time (µs) used to probe global firmware kinds, which are
/// set-level rather than peaking-time-indexed (§4.4).
pub const GLOBAL_FIRMWARE_NOMINAL_PTIME: f64 = 1.0;

/// The result of a successful resolve: a path staged for the driver to
/// load, a raw name stable across repeated extraction (for CurrentFirmware
/// comparisons), and the filter offsets in effect for this kind.
#[derive(Debug, Clone)]
pub struct ResolvedFirmware {
    pub staged_path: String,
    pub raw_name: String,
    pub filter_info: Vec<u16>,
}

pub struct FirmwareResolver;

impl FirmwareResolver {
    pub fn resolve(
        firmware_set: &FirmwareSet,
        kind: FirmwareKind,
        peaking_time: f64,
        detector_type: DetectorType,
        defaults: Option<&Defaults>,
        ptrr_hint: Option<u32>,
        archive: &mut dyn FirmwareArchive,
    ) -> Result<ResolvedFirmware> {
        let mut resolved = if firmware_set.is_archive_mode() {
            Self::resolve_archive(firmware_set, kind, peaking_time, detector_type, archive)
        } else {
            Self::resolve_listed(firmware_set, kind, peaking_time)
        }?;

        let ptrr = ptrr_hint.or_else(|| {
            firmware_set
                .sorted_variants()
                .ok()
                .and_then(|vs| vs.into_iter().find(|v| v.covers(peaking_time)).map(|v| v.ptrr))
        });
        Self::apply_filter_override(
            &mut resolved.filter_info,
            defaults,
            firmware_set.is_archive_mode(),
            ptrr,
        );
        Ok(resolved)
    }

    fn resolve_listed(
        firmware_set: &FirmwareSet,
        kind: FirmwareKind,
        peaking_time: f64,
    ) -> Result<ResolvedFirmware> {
        if kind.is_mmu() {
            let path = match &firmware_set.mode {
                crate::firmware::FirmwareSetMode::Listed { mmu_path, .. } => mmu_path.clone(),
                _ => None,
            }
            .ok_or_else(|| Error::MissingFirm(format!("{}: no MMU path", firmware_set.alias)))?;
            return Ok(ResolvedFirmware {
                staged_path: path.clone(),
                raw_name: path,
                filter_info: Vec::new(),
            });
        }

        let variants = firmware_set.sorted_variants()?;
        let variant = variants
            .iter()
            .find(|v| v.covers(peaking_time))
            .ok_or_else(|| Error::BadValue {
                name: "peaking_time".into(),
                value: peaking_time.to_string(),
            })?;
        let path = variant.path_for(kind)?.to_string();
        Ok(ResolvedFirmware {
            staged_path: path.clone(),
            raw_name: path,
            filter_info: variant.filter_info.clone(),
        })
    }

    fn resolve_archive(
        firmware_set: &FirmwareSet,
        kind: FirmwareKind,
        peaking_time: f64,
        detector_type: DetectorType,
        archive: &mut dyn FirmwareArchive,
    ) -> Result<ResolvedFirmware> {
        let (archive_path, keywords, temp_path) = match &firmware_set.mode {
            crate::firmware::FirmwareSetMode::Archive {
                archive_path,
                keywords,
                temp_path,
            } => (archive_path.clone(), keywords.clone(), temp_path.clone()),
            _ => return Err(Error::FirmBoth(firmware_set.alias.clone())),
        };
        let temp_dir = temp_path.unwrap_or_else(|| archive.temp_path().to_string());
        let effective_ptime = if kind.is_global() {
            GLOBAL_FIRMWARE_NOMINAL_PTIME
        } else {
            peaking_time
        };

        match archive.resolve(&archive_path, &temp_dir, kind, effective_ptime, detector_type, &keywords) {
            Ok((staged_path, raw_name)) => {
                let filter_info = archive
                    .filter_info(effective_ptime, detector_type)
                    .unwrap_or_default();
                Ok(ResolvedFirmware {
                    staged_path,
                    raw_name,
                    filter_info,
                })
            }
            Err(e) => {
                if kind.is_global() {
                    info!(
                        set = %firmware_set.alias,
                        ?kind,
                        "this product does not use this global firmware kind"
                    );
                }
                Err(e)
            }
        }
    }

    /// Overlays `peakint_offset`/`peaksam_offset` Defaults entries onto the
    /// base filter-info pair resolved above (§4.4). Listed mode uses the
    /// `_ptrrN` suffix; archive mode drops it.
    fn apply_filter_override(
        filter_info: &mut [u16],
        defaults: Option<&Defaults>,
        is_archive: bool,
        ptrr: Option<u32>,
    ) {
        let defaults = match defaults {
            Some(d) => d,
            None => return,
        };
        let suffix = if is_archive {
            String::new()
        } else {
            match ptrr {
                Some(n) => format!("_ptrr{}", n),
                None => return,
            }
        };
        if let Some(slot) = filter_info.get_mut(0) {
            if let Ok(v) = defaults.get(&format!("peakint_offset{}", suffix)) {
                *slot = v as u16;
            }
        }
        if let Some(slot) = filter_info.get_mut(1) {
            if let Ok(v) = defaults.get(&format!("peaksam_offset{}", suffix)) {
                *slot = v as u16;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::capability::mock::StaticArchive;
    use crate::firmware::FirmwareVariant;

    fn listed_set() -> FirmwareSet {
        let mut fs = FirmwareSet::new();
        fs.alias = "fs0".into();
        let mut v0 = FirmwareVariant::new(0, 1.0, 10.0).unwrap();
        v0.dsp = Some("dsp0.bin".into());
        v0.fippi = Some("fippi0.bin".into());
        v0.filter_info = vec![2, 2];
        fs.add_variant(v0).unwrap();
        let mut v1 = FirmwareVariant::new(1, 10.001, 50.0).unwrap();
        v1.dsp = Some("dsp1.bin".into());
        v1.fippi = Some("fippi1.bin".into());
        v1.filter_info = vec![4, 3];
        fs.add_variant(v1).unwrap();
        fs
    }

    #[test]
    fn listed_mode_selects_covering_variant() {
        let fs = listed_set();
        let mut archive = StaticArchive::new("/tmp");
        let resolved = FirmwareResolver::resolve(
            &fs,
            FirmwareKind::Fippi,
            5.0,
            DetectorType::Reset,
            None,
            None,
            &mut archive,
        )
        .unwrap();
        assert_eq!(resolved.staged_path, "fippi0.bin");

        let resolved = FirmwareResolver::resolve(
            &fs,
            FirmwareKind::Fippi,
            20.0,
            DetectorType::Reset,
            None,
            None,
            &mut archive,
        )
        .unwrap();
        assert_eq!(resolved.staged_path, "fippi1.bin");
    }

    #[test]
    fn peaking_time_outside_all_variants_is_bad_value() {
        let fs = listed_set();
        let mut archive = StaticArchive::new("/tmp");
        let err = FirmwareResolver::resolve(
            &fs,
            FirmwareKind::Fippi,
            1000.0,
            DetectorType::Reset,
            None,
            None,
            &mut archive,
        )
        .unwrap_err();
        assert!(matches!(err, Error::BadValue { .. }));
    }

    #[test]
    fn filter_override_applies_ptrr_suffix_in_listed_mode() {
        let fs = listed_set();
        let mut archive = StaticArchive::new("/tmp");
        let mut defaults = Defaults::new();
        defaults.set("peakint_offset_ptrr0", 9.0);
        let resolved = FirmwareResolver::resolve(
            &fs,
            FirmwareKind::Fippi,
            5.0,
            DetectorType::Reset,
            Some(&defaults),
            None,
            &mut archive,
        )
        .unwrap();
        assert_eq!(resolved.filter_info[0], 9);
        assert_eq!(resolved.filter_info[1], 2);
    }
}
