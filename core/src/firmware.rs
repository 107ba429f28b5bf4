// SPDX-License-Identifier: LGPL-3.0-or-later

//! Firmware variant (PTRR) and FirmwareSet entities (§3).

use std::collections::HashMap;

use crate::error::{Error, Result};

/// The kinds of firmware file the resolver and driver deal with (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareKind {
    Fippi,
    UserFippi,
    Dsp,
    UserDsp,
    Mmu,
    SystemFpga,
    SystemDsp,
    SystemFippi,
    FippiA,
}

impl FirmwareKind {
    /// Global kinds are set-level (not variant-level) and queried with a
    /// fixed nominal peaking time (§4.4).
    pub fn is_global(&self) -> bool {
        matches!(
            self,
            FirmwareKind::SystemFpga | FirmwareKind::SystemDsp | FirmwareKind::SystemFippi | FirmwareKind::FippiA
        )
    }

    pub fn is_mmu(&self) -> bool {
        matches!(self, FirmwareKind::Mmu)
    }
}

/// One peaking-time range reference within a FirmwareSet.
#[derive(Debug, Clone, Default)]
pub struct FirmwareVariant {
    pub ptrr: u32,
    pub min_ptime: f64,
    pub max_ptime: f64,
    pub fippi: Option<String>,
    pub user_fippi: Option<String>,
    pub dsp: Option<String>,
    pub user_dsp: Option<String>,
    pub system_fpga: Option<String>,
    /// Ordered filter offsets, typically `[peakint_offset, peaksam_offset]`.
    pub filter_info: Vec<u16>,
}

impl FirmwareVariant {
    pub fn new(ptrr: u32, min_ptime: f64, max_ptime: f64) -> Result<Self> {
        if min_ptime > max_ptime {
            return Err(Error::BadPtr(ptrr));
        }
        Ok(FirmwareVariant {
            ptrr,
            min_ptime,
            max_ptime,
            ..Default::default()
        })
    }

    pub fn covers(&self, peaking_time: f64) -> bool {
        peaking_time >= self.min_ptime && peaking_time <= self.max_ptime
    }

    pub fn path_for(&self, kind: FirmwareKind) -> Result<&str> {
        let opt = match kind {
            FirmwareKind::Fippi => &self.fippi,
            FirmwareKind::UserFippi => &self.user_fippi,
            FirmwareKind::Dsp => &self.dsp,
            FirmwareKind::UserDsp => &self.user_dsp,
            FirmwareKind::SystemFpga => &self.system_fpga,
            _ => return Err(Error::NoSupportFirm(format!("{:?}", kind))),
        };
        opt.as_deref()
            .ok_or_else(|| Error::MissingFirm(format!("ptrr {} kind {:?}", self.ptrr, kind)))
    }

    /// §4.7 step 1c: every variant has both a DSP and at least one FiPPI kind.
    pub fn validate(&self) -> Result<()> {
        if self.dsp.is_none() && self.user_dsp.is_none() {
            return Err(Error::MissingFirm(format!("ptrr {} has no DSP", self.ptrr)));
        }
        if self.fippi.is_none() && self.user_fippi.is_none() {
            return Err(Error::MissingFirm(format!(
                "ptrr {} has no FiPPI",
                self.ptrr
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum FirmwareSetMode {
    /// No mode populated yet.
    Empty,
    Archive {
        archive_path: String,
        keywords: Vec<String>,
        temp_path: Option<String>,
    },
    Listed {
        mmu_path: Option<String>,
        variants: Vec<FirmwareVariant>,
    },
}

#[derive(Debug, Clone)]
pub struct FirmwareSet {
    pub alias: String,
    pub mode: FirmwareSetMode,
    /// `(min_ptime, max_ptime)` accumulated by item-keyed `add_item` calls
    /// before both halves of a PTRR's range are known (§6 registry surface —
    /// unlike a config-file section, an item-at-a-time caller may supply
    /// `ptrrN_fippi` before `ptrrN_min`/`ptrrN_max`).
    staged_range: HashMap<u32, (Option<f64>, Option<f64>)>,
}

impl FirmwareSet {
    pub fn new() -> Self {
        FirmwareSet {
            alias: String::new(),
            mode: FirmwareSetMode::Empty,
            staged_range: HashMap::new(),
        }
    }

    pub fn set_archive(&mut self, archive_path: String) -> Result<()> {
        match &self.mode {
            FirmwareSetMode::Listed { .. } => return Err(Error::FirmBoth(self.alias.clone())),
            _ => {}
        }
        self.mode = FirmwareSetMode::Archive {
            archive_path,
            keywords: Vec::new(),
            temp_path: None,
        };
        Ok(())
    }

    pub fn add_keyword(&mut self, keyword: String) -> Result<()> {
        match &mut self.mode {
            FirmwareSetMode::Archive { keywords, .. } => {
                keywords.push(keyword);
                Ok(())
            }
            _ => Err(Error::BadSystemItem(format!(
                "{}: keywords require archive mode",
                self.alias
            ))),
        }
    }

    pub fn set_temp_path(&mut self, path: String) -> Result<()> {
        match &mut self.mode {
            FirmwareSetMode::Archive { temp_path, .. } => {
                *temp_path = Some(path);
                Ok(())
            }
            _ => Err(Error::BadSystemItem(format!(
                "{}: temp path requires archive mode",
                self.alias
            ))),
        }
    }

    pub fn set_mmu(&mut self, mmu_path: String) -> Result<()> {
        match &self.mode {
            FirmwareSetMode::Archive { .. } => return Err(Error::FirmBoth(self.alias.clone())),
            _ => {}
        }
        if let FirmwareSetMode::Empty = self.mode {
            self.mode = FirmwareSetMode::Listed {
                mmu_path: None,
                variants: Vec::new(),
            };
        }
        if let FirmwareSetMode::Listed { mmu_path: slot, .. } = &mut self.mode {
            *slot = Some(mmu_path);
        }
        Ok(())
    }

    /// Insert a variant. No ordering/overlap check here — per §4.3, overlap
    /// is a *late* error surfaced at `StartSystem`, not a placement error,
    /// so clients can rebuild a set incrementally.
    pub fn add_variant(&mut self, variant: FirmwareVariant) -> Result<()> {
        match &self.mode {
            FirmwareSetMode::Archive { .. } => return Err(Error::FirmBoth(self.alias.clone())),
            _ => {}
        }
        if let FirmwareSetMode::Empty = self.mode {
            self.mode = FirmwareSetMode::Listed {
                mmu_path: None,
                variants: Vec::new(),
            };
        }
        if let FirmwareSetMode::Listed { variants, .. } = &mut self.mode {
            if variants.iter().any(|v| v.ptrr == variant.ptrr) {
                return Err(Error::AliasExists(format!(
                    "ptrr {} in firmware set {}",
                    variant.ptrr, self.alias
                )));
            }
            variants.push(variant);
        }
        Ok(())
    }

    pub fn variant_mut(&mut self, ptrr: u32) -> Result<&mut FirmwareVariant> {
        match &mut self.mode {
            FirmwareSetMode::Listed { variants, .. } => variants
                .iter_mut()
                .find(|v| v.ptrr == ptrr)
                .ok_or(Error::BadPtr(ptrr)),
            _ => Err(Error::BadPtr(ptrr)),
        }
    }

    /// §4.7 step 1: stable sort by `min_ptime`, reject overlapping adjacent
    /// pairs. Returns the sorted variant list (cloned) so the resolver can
    /// walk it in order without re-sorting on every lookup.
    pub fn sorted_variants(&self) -> Result<Vec<FirmwareVariant>> {
        match &self.mode {
            FirmwareSetMode::Listed { variants, .. } => {
                let mut sorted = variants.clone();
                sorted.sort_by(|a, b| {
                    a.min_ptime
                        .partial_cmp(&b.min_ptime)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                for win in sorted.windows(2) {
                    let (a, b) = (&win[0], &win[1]);
                    if a.max_ptime >= b.min_ptime {
                        return Err(Error::PtrOverlap {
                            set: self.alias.clone(),
                            a: a.ptrr,
                            b: b.ptrr,
                        });
                    }
                }
                Ok(sorted)
            }
            _ => Ok(Vec::new()),
        }
    }

    /// §4.7 step 1: exactly one of archive-mode/listed-mode is populated,
    /// every listed variant valid, and variants are non-overlapping.
    pub fn validate(&self) -> Result<()> {
        match &self.mode {
            FirmwareSetMode::Empty => Err(Error::MissingFirm(self.alias.clone())),
            FirmwareSetMode::Archive { archive_path, .. } => {
                if archive_path.is_empty() {
                    return Err(Error::NoFilename("archive path".into()));
                }
                Ok(())
            }
            FirmwareSetMode::Listed { variants, .. } => {
                if variants.is_empty() {
                    return Err(Error::MissingFirm(self.alias.clone()));
                }
                for v in variants {
                    v.validate()?;
                }
                self.sorted_variants().map(|_| ())
            }
        }
    }

    pub fn is_archive_mode(&self) -> bool {
        matches!(self.mode, FirmwareSetMode::Archive { .. })
    }

    fn ensure_variant(&mut self, ptrr: u32) -> Result<&mut FirmwareVariant> {
        if self.variant_mut(ptrr).is_err() {
            let (min, max) = self.staged_range.get(&ptrr).copied().unwrap_or((None, None));
            let (min, max) = (min.ok_or(Error::BadPtr(ptrr))?, max.ok_or(Error::BadPtr(ptrr))?);
            self.add_variant(FirmwareVariant::new(ptrr, min, max)?)?;
        }
        self.variant_mut(ptrr)
    }

    /// Item-keyed setter mirroring `Detector::add_item`'s string grammar:
    /// `archive_path`, `keyword`, `temp_path`, `mmu`, and
    /// `ptrr{N}_{min,max,fippi,user_fippi,dsp,user_dsp,system_fpga,filter_info}`.
    /// `ptrr{N}_min`/`_max` may arrive in either order or interleaved with the
    /// other `ptrr{N}_*` fields; the variant itself is materialized once both
    /// halves of its range are known.
    pub fn add_item(&mut self, name: &str, value: &str) -> Result<()> {
        let lname = name.to_lowercase();
        match lname.as_str() {
            "archive_path" => return self.set_archive(value.to_string()),
            "keyword" => return self.add_keyword(value.to_string()),
            "temp_path" => return self.set_temp_path(value.to_string()),
            "mmu" => return self.set_mmu(value.to_string()),
            _ => {}
        }

        let rest = lname.strip_prefix("ptrr").ok_or_else(|| Error::BadName(name.into()))?;
        let sep = rest.find('_').ok_or_else(|| Error::BadName(name.into()))?;
        let ptrr: u32 = rest[..sep].parse().map_err(|_| Error::BadName(name.into()))?;
        let field = &rest[sep + 1..];

        if field == "min" || field == "max" {
            let v: f64 = value.parse().map_err(|_| Error::BadValue { name: name.into(), value: value.into() })?;
            let entry = self.staged_range.entry(ptrr).or_insert((None, None));
            if field == "min" {
                entry.0 = Some(v);
            } else {
                entry.1 = Some(v);
            }
            if let (Some(min), Some(max)) = *entry {
                if self.variant_mut(ptrr).is_ok() {
                    let variant = self.variant_mut(ptrr)?;
                    variant.min_ptime = min;
                    variant.max_ptime = max;
                } else {
                    self.add_variant(FirmwareVariant::new(ptrr, min, max)?)?;
                }
            }
            return Ok(());
        }

        let variant = self.ensure_variant(ptrr)?;
        match field {
            "fippi" => variant.fippi = Some(value.to_string()),
            "user_fippi" => variant.user_fippi = Some(value.to_string()),
            "dsp" => variant.dsp = Some(value.to_string()),
            "user_dsp" => variant.user_dsp = Some(value.to_string()),
            "system_fpga" => variant.system_fpga = Some(value.to_string()),
            "filter_info" => {
                variant.filter_info = value
                    .split(',')
                    .map(|s| s.trim().parse::<u16>().map_err(|_| Error::BadValue { name: "filter_info".into(), value: value.into() }))
                    .collect::<Result<Vec<u16>>>()?;
            }
            _ => return Err(Error::BadName(name.into())),
        }
        Ok(())
    }

    /// Item-keyed reader, the inverse of [`Self::add_item`].
    pub fn get_item(&self, name: &str) -> Result<String> {
        let lname = name.to_lowercase();
        match (&self.mode, lname.as_str()) {
            (FirmwareSetMode::Archive { archive_path, .. }, "archive_path") => return Ok(archive_path.clone()),
            (FirmwareSetMode::Archive { temp_path: Some(p), .. }, "temp_path") => return Ok(p.clone()),
            (FirmwareSetMode::Archive { keywords, .. }, "keyword") => return Ok(keywords.join(",")),
            (FirmwareSetMode::Listed { mmu_path: Some(p), .. }, "mmu") => return Ok(p.clone()),
            _ => {}
        }

        let rest = lname.strip_prefix("ptrr").ok_or_else(|| Error::BadName(name.into()))?;
        let sep = rest.find('_').ok_or_else(|| Error::BadName(name.into()))?;
        let ptrr: u32 = rest[..sep].parse().map_err(|_| Error::BadName(name.into()))?;
        let field = &rest[sep + 1..];

        let variants = match &self.mode {
            FirmwareSetMode::Listed { variants, .. } => variants,
            _ => return Err(Error::BadPtr(ptrr)),
        };
        let variant = variants.iter().find(|v| v.ptrr == ptrr).ok_or(Error::BadPtr(ptrr))?;
        match field {
            "min" => Ok(variant.min_ptime.to_string()),
            "max" => Ok(variant.max_ptime.to_string()),
            "fippi" => variant.fippi.clone().ok_or_else(|| Error::MissingFirm(name.into())),
            "user_fippi" => variant.user_fippi.clone().ok_or_else(|| Error::MissingFirm(name.into())),
            "dsp" => variant.dsp.clone().ok_or_else(|| Error::MissingFirm(name.into())),
            "user_dsp" => variant.user_dsp.clone().ok_or_else(|| Error::MissingFirm(name.into())),
            "system_fpga" => variant.system_fpga.clone().ok_or_else(|| Error::MissingFirm(name.into())),
            "filter_info" => Ok(variant.filter_info.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(",")),
            _ => Err(Error::BadName(name.into())),
        }
    }
}

impl Default for FirmwareSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn set_with(variants: Vec<(u32, f64, f64)>) -> FirmwareSet {
        let mut fs = FirmwareSet::new();
        fs.alias = "fs0".into();
        for (ptrr, min, max) in variants {
            let mut v = FirmwareVariant::new(ptrr, min, max).unwrap();
            v.dsp = Some("d.bin".into());
            v.fippi = Some("f.bin".into());
            fs.add_variant(v).unwrap();
        }
        fs
    }

    #[test]
    fn non_overlapping_variants_sort_and_validate() {
        let fs = set_with(vec![(1, 10.0, 50.0), (0, 1.0, 10.0)]);
        let sorted = fs.sorted_variants().unwrap();
        assert_eq!(sorted[0].ptrr, 0);
        assert_eq!(sorted[1].ptrr, 1);
        assert!(fs.validate().is_err(), "ranges touch at 10.0, overlap");
    }

    #[test]
    fn disjoint_variants_validate_ok() {
        let fs = set_with(vec![(0, 1.0, 10.0), (1, 10.001, 50.0)]);
        assert!(fs.validate().is_ok());
    }

    #[test]
    fn archive_and_listed_are_mutually_exclusive() {
        let mut fs = FirmwareSet::new();
        fs.alias = "fs0".into();
        fs.set_archive("archive.bin".into()).unwrap();
        let v = FirmwareVariant::new(0, 1.0, 2.0).unwrap();
        let err = fs.add_variant(v).unwrap_err();
        assert!(matches!(err, Error::FirmBoth(_)));
    }
}
