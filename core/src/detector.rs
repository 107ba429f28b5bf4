// SPDX-License-Identifier: LGPL-3.0-or-later

//! Detector entity (§3): alias, per-channel polarity/gain, and a detector
//! type tag whose associated value (reset delay or decay time) is stored in
//! the same per-channel slot but interpreted differently depending on tag.

use crate::error::{Error, Result};

pub const GAIN_MIN: f64 = 0.001;
pub const GAIN_MAX: f64 = 100.0;
/// Matches `MAX_DETECTOR_CHANS` in the reference source.
pub const MAX_DETECTOR_CHANS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Positive,
    Negative,
}

impl Polarity {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "positive" => Ok(Polarity::Positive),
            "negative" => Ok(Polarity::Negative),
            other => Err(Error::BadValue {
                name: "polarity".into(),
                value: other.into(),
            }),
        }
    }
}

/// Detector type, carrying the per-channel type-value interpretation with it
/// so callers cannot read `reset_delay` out of an `RCFeedback` detector by
/// mistake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectorType {
    Unknown,
    Reset,
    RcFeedback,
}

impl Default for DetectorType {
    fn default() -> Self {
        DetectorType::Unknown
    }
}

impl DetectorType {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "reset" => Ok(DetectorType::Reset),
            "rc_feedback" => Ok(DetectorType::RcFeedback),
            other => Err(Error::BadValue {
                name: "type".into(),
                value: other.into(),
            }),
        }
    }
}

/// The per-channel type-value: reset delay (µs) for `Reset` detectors, decay
/// time (µs) for `RcFeedback` detectors. Stored as a bare `f64`; the tag
/// living on the `Detector` determines how to read it back.
pub type TypeValue = f64;

#[derive(Debug, Clone, Default)]
pub struct Detector {
    pub alias: String,
    number_of_channels: Option<u32>,
    polarity: Vec<Option<Polarity>>,
    gain: Vec<Option<f64>>,
    pub dtype: DetectorType,
    type_value: Vec<Option<TypeValue>>,
}

impl Detector {
    pub fn new() -> Self {
        Detector {
            alias: String::new(),
            number_of_channels: None,
            polarity: Vec::new(),
            gain: Vec::new(),
            dtype: DetectorType::Unknown,
            type_value: Vec::new(),
        }
    }

    pub fn number_of_channels(&self) -> Option<u32> {
        self.number_of_channels
    }

    fn require_channels(&self) -> Result<u32> {
        self.number_of_channels
            .ok_or_else(|| Error::NoChannels(self.alias.clone()))
    }

    fn set_number_of_channels(&mut self, n: u32) -> Result<()> {
        if n == 0 || n > MAX_DETECTOR_CHANS {
            return Err(Error::InvalidNumchans(n));
        }
        self.number_of_channels = Some(n);
        self.polarity = vec![None; n as usize];
        self.gain = vec![None; n as usize];
        self.type_value = vec![None; n as usize];
        Ok(())
    }

    pub fn gain_at(&self, channel: u32) -> Result<f64> {
        self.gain
            .get(channel as usize)
            .and_then(|g| *g)
            .ok_or(Error::MissingGain(self.alias.clone()))
    }

    pub fn polarity_at(&self, channel: u32) -> Result<Polarity> {
        self.polarity
            .get(channel as usize)
            .and_then(|p| *p)
            .ok_or(Error::MissingPol(self.alias.clone()))
    }

    pub fn type_value_at(&self, channel: u32) -> Result<TypeValue> {
        self.type_value
            .get(channel as usize)
            .and_then(|v| *v)
            .ok_or(Error::MissingType(self.alias.clone()))
    }

    /// Named setter mirroring the reference source's
    /// `number_of_channels` / `type` / `type_value` / `channel{N}_gain` /
    /// `channel{N}_polarity` item names.
    pub fn add_item(&mut self, name: &str, value: &str) -> Result<()> {
        self.modify_item(name, value)
    }

    pub fn modify_item(&mut self, name: &str, value: &str) -> Result<()> {
        let lname = name.to_lowercase();
        if lname == "number_of_channels" {
            let n: u32 = value
                .parse()
                .map_err(|_| Error::BadValue {
                    name: name.into(),
                    value: value.into(),
                })?;
            return self.set_number_of_channels(n);
        }

        // Every other item requires number_of_channels to already be set.
        self.require_channels()?;

        if lname == "type" {
            self.dtype = DetectorType::parse(value)?;
            return Ok(());
        }
        if lname == "type_value" {
            let v: f64 = value.parse().map_err(|_| Error::BadValue {
                name: name.into(),
                value: value.into(),
            })?;
            for slot in self.type_value.iter_mut() {
                *slot = Some(v);
            }
            return Ok(());
        }
        if let Some(rest) = lname.strip_prefix("channel") {
            if let Some(chan_str) = rest.strip_suffix("_gain") {
                let chan: u32 = chan_str.parse().map_err(|_| Error::BadValue {
                    name: name.into(),
                    value: value.into(),
                })?;
                let v: f64 = value.parse().map_err(|_| Error::BadValue {
                    name: name.into(),
                    value: value.into(),
                })?;
                if !(GAIN_MIN..=GAIN_MAX).contains(&v) {
                    return Err(Error::GainOor {
                        value: v,
                        min: GAIN_MIN,
                        max: GAIN_MAX,
                    });
                }
                let slot = self
                    .gain
                    .get_mut(chan as usize)
                    .ok_or(Error::InvalidDetChan {
                        detector: self.alias.clone(),
                        channel: chan,
                    })?;
                *slot = Some(v);
                return Ok(());
            }
            if let Some(chan_str) = rest.strip_suffix("_polarity") {
                let chan: u32 = chan_str.parse().map_err(|_| Error::BadValue {
                    name: name.into(),
                    value: value.into(),
                })?;
                let p = Polarity::parse(value)?;
                let slot = self
                    .polarity
                    .get_mut(chan as usize)
                    .ok_or(Error::InvalidDetChan {
                        detector: self.alias.clone(),
                        channel: chan,
                    })?;
                *slot = Some(p);
                return Ok(());
            }
        }
        Err(Error::BadName(name.into()))
    }

    pub fn get_item(&self, name: &str) -> Result<String> {
        let lname = name.to_lowercase();
        if lname == "number_of_channels" {
            return Ok(self.require_channels()?.to_string());
        }
        if lname == "type" {
            return Ok(match self.dtype {
                DetectorType::Unknown => "unknown",
                DetectorType::Reset => "reset",
                DetectorType::RcFeedback => "rc_feedback",
            }
            .to_string());
        }
        if lname == "type_value" {
            return Ok(self.type_value_at(0)?.to_string());
        }
        if let Some(rest) = lname.strip_prefix("channel") {
            if let Some(chan_str) = rest.strip_suffix("_gain") {
                let chan: u32 = chan_str.parse().map_err(|_| Error::BadName(name.into()))?;
                return Ok(self.gain_at(chan)?.to_string());
            }
            if let Some(chan_str) = rest.strip_suffix("_polarity") {
                let chan: u32 = chan_str.parse().map_err(|_| Error::BadName(name.into()))?;
                return Ok(match self.polarity_at(chan)? {
                    Polarity::Positive => "positive",
                    Polarity::Negative => "negative",
                }
                .to_string());
            }
        }
        Err(Error::BadName(name.into()))
    }

    /// §4.7 step 2: polarity and gain set for every channel, type ≠ Unknown.
    pub fn validate(&self) -> Result<()> {
        let n = self.require_channels()?;
        for chan in 0..n {
            self.polarity_at(chan)?;
            self.gain_at(chan)?;
        }
        if self.dtype == DetectorType::Unknown {
            return Err(Error::MissingType(self.alias.clone()));
        }
        Ok(())
    }

    /// §3 invariant: fully populated before it can appear in a Module binding.
    pub fn is_complete(&self) -> bool {
        self.validate().is_ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn make() -> Detector {
        let mut d = Detector::new();
        d.alias = "det0".into();
        d.add_item("number_of_channels", "2").unwrap();
        d
    }

    #[test]
    fn requires_channel_count_before_other_fields() {
        let mut d = Detector::new();
        d.alias = "det0".into();
        let err = d.add_item("channel0_gain", "3.5").unwrap_err();
        assert!(matches!(err, Error::NoChannels(_)));
    }

    #[test]
    fn gain_bounds_enforced() {
        let mut d = make();
        let err = d.add_item("channel0_gain", "1000").unwrap_err();
        assert!(matches!(err, Error::GainOor { .. }));
    }

    #[test]
    fn validate_requires_every_channel_populated() {
        let mut d = make();
        assert!(d.validate().is_err());
        d.add_item("channel0_gain", "1.0").unwrap();
        d.add_item("channel0_polarity", "positive").unwrap();
        d.add_item("channel1_gain", "1.0").unwrap();
        d.add_item("channel1_polarity", "negative").unwrap();
        assert!(d.validate().is_err(), "type is still Unknown");
        d.add_item("type", "reset").unwrap();
        assert!(d.validate().is_ok());
    }

    #[test]
    fn too_many_channels_rejected() {
        let mut d = Detector::new();
        d.alias = "det0".into();
        let err = d
            .add_item("number_of_channels", &(MAX_DETECTOR_CHANS + 1).to_string())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidNumchans(_)));
    }
}
