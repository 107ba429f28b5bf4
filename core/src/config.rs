// SPDX-License-Identifier: LGPL-3.0-or-later

//! Configuration source grammar (§6): a hand-rolled reader/writer for the
//! INI-style format, covering `detector definitions`, `firmware
//! definitions`, `default definitions`, `module definitions`, and `handel
//! settings`. Bespoke format, bespoke parser — no generic INI crate, the
//! same call the teacher workspace makes for `ieee1212-config-rom` and
//! `alsa-ctl-tlv-codec`.

use crate::detector::Detector;
use crate::error::{Error, Result};
use crate::firmware::{FirmwareSet, FirmwareVariant};
use crate::logging::LogLevel;
use crate::module::{Module, ModuleChannel, Sca};
use crate::transport;

const SECTION_DETECTOR: &str = "detector definitions";
const SECTION_FIRMWARE: &str = "firmware definitions";
const SECTION_DEFAULT: &str = "default definitions";
const SECTION_MODULE: &str = "module definitions";
const SECTION_SETTINGS: &str = "handel settings";

/// One `<name> = <value>` line, in file order.
struct Line {
    name: String,
    value: String,
}

/// A parsed section: a name and the entity blocks within it, each keyed by
/// its `alias = ` line and holding every subsequent `<name> = <value>` pair
/// up to the next `alias =` or the next section header.
struct Entity {
    alias: String,
    lines: Vec<Line>,
}

/// Everything read out of a configuration source, grouped by section, plus
/// the `handel settings` key/value pairs (no entities, just flat fields).
#[derive(Default)]
pub struct ParsedConfig {
    pub detectors: Vec<(String, Detector)>,
    pub firmware_sets: Vec<(String, FirmwareSet)>,
    pub defaults: Vec<(String, crate::defaults::Defaults)>,
    pub modules: Vec<(String, Module)>,
    pub log_level: Option<LogLevel>,
    pub log_output: Option<String>,
}

/// Splits `text` into lines, accepting both `\n` and `\r\n` (§6).
fn split_lines(text: &str) -> Vec<&str> {
    text.lines().collect()
}

/// Groups raw lines under their section headers (`[section name]`) and,
/// within a section, under the entity started by each `alias = ` line.
fn group_sections(text: &str) -> Result<Vec<(String, Vec<Entity>, Vec<Line>)>> {
    let mut sections: Vec<(String, Vec<Entity>, Vec<Line>)> = Vec::new();
    let mut current: Option<(String, Vec<Entity>, Vec<Line>)> = None;

    for raw in split_lines(text) {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            if let Some(done) = current.take() {
                sections.push(done);
            }
            current = Some((name.trim().to_lowercase(), Vec::new(), Vec::new()));
            continue;
        }
        let (name, value) = split_kv(line)?;
        let (_, entities, flat) = current
            .as_mut()
            .ok_or_else(|| Error::MalformedFile(format!("line outside any section: {}", line)))?;

        if name.eq_ignore_ascii_case("alias") {
            entities.push(Entity { alias: value, lines: Vec::new() });
        } else if let Some(entity) = entities.last_mut() {
            entity.lines.push(Line { name, value });
        } else {
            flat.push(Line { name, value });
        }
    }
    if let Some(done) = current.take() {
        sections.push(done);
    }
    Ok(sections)
}

fn split_kv(line: &str) -> Result<(String, String)> {
    let pos = line.find('=').ok_or_else(|| Error::MalformedFile(line.to_string()))?;
    let name = line[..pos].trim().to_lowercase();
    let value = line[pos + 1..].trim().to_string();
    if name.is_empty() {
        return Err(Error::MalformedFile(line.to_string()));
    }
    Ok((name, value))
}

fn find_line<'a>(lines: &'a [Line], name: &str) -> Option<&'a str> {
    lines.iter().find(|l| l.name == name).map(|l| l.value.as_str())
}

fn find_lines<'a>(lines: &'a [Line], name: &str) -> Vec<&'a str> {
    lines.iter().filter(|l| l.name == name).map(|l| l.value.as_str()).collect()
}

fn parse_detector(entity: &Entity) -> Result<Detector> {
    let mut d = Detector::new();
    d.alias = entity.alias.clone();
    // number_of_channels must be applied before channel-indexed fields.
    if let Some(v) = find_line(&entity.lines, "number_of_channels") {
        d.add_item("number_of_channels", v)?;
    }
    for line in &entity.lines {
        if line.name == "number_of_channels" {
            continue;
        }
        d.add_item(&line.name, &line.value)?;
    }
    Ok(d)
}

fn parse_filter_info(value: &str) -> Result<Vec<u16>> {
    value
        .split(',')
        .map(|s| s.trim().parse::<u16>().map_err(|_| Error::BadValue { name: "filter_info".into(), value: value.to_string() }))
        .collect()
}

fn parse_firmware(entity: &Entity) -> Result<FirmwareSet> {
    let mut fs = FirmwareSet::new();
    fs.alias = entity.alias.clone();

    if let Some(path) = find_line(&entity.lines, "archive_path") {
        fs.set_archive(path.to_string())?;
        for kw in find_lines(&entity.lines, "keyword") {
            fs.add_keyword(kw.to_string())?;
        }
        if let Some(tmp) = find_line(&entity.lines, "temp_path") {
            fs.set_temp_path(tmp.to_string())?;
        }
        return Ok(fs);
    }

    if let Some(mmu) = find_line(&entity.lines, "mmu") {
        fs.set_mmu(mmu.to_string())?;
    }

    let mut ptrrs: Vec<u32> = entity
        .lines
        .iter()
        .filter_map(|l| l.name.strip_prefix("ptrr").and_then(|rest| rest.split('_').next()))
        .filter_map(|n| n.parse::<u32>().ok())
        .collect();
    ptrrs.sort_unstable();
    ptrrs.dedup();

    for ptrr in ptrrs {
        let prefix = format!("ptrr{}_", ptrr);
        let min: f64 = find_line(&entity.lines, &format!("{}min", prefix))
            .ok_or_else(|| Error::MissingFirm(format!("ptrr {} has no min_ptime", ptrr)))?
            .parse()
            .map_err(|_| Error::BadPtr(ptrr))?;
        let max: f64 = find_line(&entity.lines, &format!("{}max", prefix))
            .ok_or_else(|| Error::MissingFirm(format!("ptrr {} has no max_ptime", ptrr)))?
            .parse()
            .map_err(|_| Error::BadPtr(ptrr))?;
        let mut variant = FirmwareVariant::new(ptrr, min, max)?;
        variant.fippi = find_line(&entity.lines, &format!("{}fippi", prefix)).map(String::from);
        variant.user_fippi = find_line(&entity.lines, &format!("{}user_fippi", prefix)).map(String::from);
        variant.dsp = find_line(&entity.lines, &format!("{}dsp", prefix)).map(String::from);
        variant.user_dsp = find_line(&entity.lines, &format!("{}user_dsp", prefix)).map(String::from);
        variant.system_fpga = find_line(&entity.lines, &format!("{}system_fpga", prefix)).map(String::from);
        if let Some(fi) = find_line(&entity.lines, &format!("{}filter_info", prefix)) {
            variant.filter_info = parse_filter_info(fi)?;
        }
        fs.add_variant(variant)?;
    }
    Ok(fs)
}

fn parse_defaults(entity: &Entity) -> Result<crate::defaults::Defaults> {
    let mut defaults = crate::defaults::Defaults::new();
    defaults.alias = entity.alias.clone();
    for line in &entity.lines {
        let v: f64 = line.value.parse().map_err(|_| Error::BadValue { name: line.name.clone(), value: line.value.clone() })?;
        defaults.set(&line.name, v);
    }
    Ok(defaults)
}

fn parse_module(entity: &Entity) -> Result<Module> {
    let mut m = Module::new();
    m.alias = entity.alias.clone();
    m.product_type = find_line(&entity.lines, "product_type").unwrap_or_default().to_string();

    let n: u32 = find_line(&entity.lines, "number_of_channels")
        .ok_or_else(|| Error::NoChannels(m.alias.clone()))?
        .parse()
        .map_err(|_| Error::InvalidNumchans(0))?;
    m.set_number_of_channels(n)?;

    if let Some(kind) = find_line(&entity.lines, "interface") {
        let fields: Vec<(String, String)> = entity
            .lines
            .iter()
            .filter(|l| l.name != "interface" && l.name != "product_type" && l.name != "number_of_channels" && !l.name.starts_with("channel"))
            .map(|l| (l.name.clone(), l.value.clone()))
            .collect();
        m.transport = Some(transport::parse_transport(kind, &fields)?);
    }

    for idx in 0..n {
        let prefix = format!("channel{}_", idx);
        let mut channel = ModuleChannel::default();
        if let Some(v) = find_line(&entity.lines, &format!("{}logical_channel", prefix)) {
            channel.logical_channel = Some(v.parse().map_err(|_| Error::BadValue { name: "logical_channel".into(), value: v.to_string() })?);
        }
        if let Some(alias) = find_line(&entity.lines, &format!("{}detector", prefix)) {
            let det_chan: u32 = find_line(&entity.lines, &format!("{}detector_channel", prefix))
                .unwrap_or("0")
                .parse()
                .unwrap_or(0);
            channel.detector_binding = Some((alias.to_string(), det_chan));
        }
        if let Some(alias) = find_line(&entity.lines, &format!("{}firmware_set", prefix)) {
            channel.firmware_set = Some(alias.to_string());
        }
        if let Some(alias) = find_line(&entity.lines, &format!("{}defaults", prefix)) {
            channel.defaults = Some(alias.to_string());
        }
        for sca_str in find_lines(&entity.lines, &format!("{}sca", prefix)) {
            let (lo, hi) = sca_str
                .split_once(',')
                .ok_or_else(|| Error::BadValue { name: "sca".into(), value: sca_str.to_string() })?;
            channel.scas.push(Sca {
                lo: lo.trim().parse().map_err(|_| Error::BadValue { name: "sca.lo".into(), value: sca_str.to_string() })?,
                hi: hi.trim().parse().map_err(|_| Error::BadValue { name: "sca.hi".into(), value: sca_str.to_string() })?,
            });
        }
        *m.channel_mut(idx)? = channel;
    }
    Ok(m)
}

/// Parses a full configuration source (§6). Unrecognized section names are
/// ignored rather than rejected, matching the reference source's tolerance
/// for forward-compatible files.
pub fn parse(text: &str) -> Result<ParsedConfig> {
    let mut out = ParsedConfig::default();
    for (section, entities, flat) in group_sections(text)? {
        match section.as_str() {
            SECTION_DETECTOR => {
                for entity in &entities {
                    out.detectors.push((entity.alias.clone(), parse_detector(entity)?));
                }
            }
            SECTION_FIRMWARE => {
                for entity in &entities {
                    out.firmware_sets.push((entity.alias.clone(), parse_firmware(entity)?));
                }
            }
            SECTION_DEFAULT => {
                for entity in &entities {
                    out.defaults.push((entity.alias.clone(), parse_defaults(entity)?));
                }
            }
            SECTION_MODULE => {
                for entity in &entities {
                    out.modules.push((entity.alias.clone(), parse_module(entity)?));
                }
            }
            SECTION_SETTINGS => {
                if let Some(level) = find_line(&flat, "log_level") {
                    out.log_level = Some(LogLevel::parse(level)?);
                }
                if let Some(output) = find_line(&flat, "log_output") {
                    out.log_output = Some(output.to_string());
                }
            }
            _ => {}
        }
    }
    Ok(out)
}

fn write_detector(out: &mut String, alias: &str, d: &Detector) {
    out.push_str(&format!("alias = {}\n", alias));
    if let Ok(n) = d.get_item("number_of_channels") {
        out.push_str(&format!("number_of_channels = {}\n", n));
        let count: u32 = n.parse().unwrap_or(0);
        for chan in 0..count {
            if let Ok(g) = d.get_item(&format!("channel{}_gain", chan)) {
                out.push_str(&format!("channel{}_gain = {}\n", chan, g));
            }
            if let Ok(p) = d.get_item(&format!("channel{}_polarity", chan)) {
                out.push_str(&format!("channel{}_polarity = {}\n", chan, p));
            }
        }
    }
    if let Ok(t) = d.get_item("type") {
        out.push_str(&format!("type = {}\n", t));
    }
    if let Ok(tv) = d.get_item("type_value") {
        out.push_str(&format!("type_value = {}\n", tv));
    }
}

fn write_firmware(out: &mut String, alias: &str, fs: &FirmwareSet) {
    use crate::firmware::FirmwareSetMode;
    out.push_str(&format!("alias = {}\n", alias));
    match &fs.mode {
        FirmwareSetMode::Empty => {}
        FirmwareSetMode::Archive { archive_path, keywords, temp_path } => {
            out.push_str(&format!("archive_path = {}\n", archive_path));
            for kw in keywords {
                out.push_str(&format!("keyword = {}\n", kw));
            }
            if let Some(tmp) = temp_path {
                out.push_str(&format!("temp_path = {}\n", tmp));
            }
        }
        FirmwareSetMode::Listed { mmu_path, variants } => {
            if let Some(mmu) = mmu_path {
                out.push_str(&format!("mmu = {}\n", mmu));
            }
            for v in variants {
                let prefix = format!("ptrr{}_", v.ptrr);
                out.push_str(&format!("{}min = {}\n", prefix, v.min_ptime));
                out.push_str(&format!("{}max = {}\n", prefix, v.max_ptime));
                if let Some(p) = &v.fippi {
                    out.push_str(&format!("{}fippi = {}\n", prefix, p));
                }
                if let Some(p) = &v.user_fippi {
                    out.push_str(&format!("{}user_fippi = {}\n", prefix, p));
                }
                if let Some(p) = &v.dsp {
                    out.push_str(&format!("{}dsp = {}\n", prefix, p));
                }
                if let Some(p) = &v.user_dsp {
                    out.push_str(&format!("{}user_dsp = {}\n", prefix, p));
                }
                if let Some(p) = &v.system_fpga {
                    out.push_str(&format!("{}system_fpga = {}\n", prefix, p));
                }
                if !v.filter_info.is_empty() {
                    let joined: Vec<String> = v.filter_info.iter().map(|n| n.to_string()).collect();
                    out.push_str(&format!("{}filter_info = {}\n", prefix, joined.join(",")));
                }
            }
        }
    }
}

fn write_defaults(out: &mut String, alias: &str, defaults: &crate::defaults::Defaults) {
    out.push_str(&format!("alias = {}\n", alias));
    for entry in defaults.iter() {
        out.push_str(&format!("{} = {}\n", entry.name, entry.current));
    }
}

fn write_module(out: &mut String, alias: &str, m: &Module) {
    out.push_str(&format!("alias = {}\n", alias));
    out.push_str(&format!("product_type = {}\n", m.product_type));
    out.push_str(&format!("number_of_channels = {}\n", m.number_of_channels()));
    if let Some(transport) = &m.transport {
        out.push_str(&format!("interface = {}\n", transport.kind_keyword()));
        for (name, value) in transport::format_transport(transport) {
            out.push_str(&format!("{} = {}\n", name, value));
        }
    }
    for (idx, channel) in m.channels.iter().enumerate() {
        let prefix = format!("channel{}_", idx);
        if let Some(logical) = channel.logical_channel {
            out.push_str(&format!("{}logical_channel = {}\n", prefix, logical));
        }
        if let Some((alias, det_chan)) = &channel.detector_binding {
            out.push_str(&format!("{}detector = {}\n", prefix, alias));
            out.push_str(&format!("{}detector_channel = {}\n", prefix, det_chan));
        }
        if let Some(fs) = &channel.firmware_set {
            out.push_str(&format!("{}firmware_set = {}\n", prefix, fs));
        }
        if let Some(defaults) = &channel.defaults {
            out.push_str(&format!("{}defaults = {}\n", prefix, defaults));
        }
        for sca in &channel.scas {
            out.push_str(&format!("{}sca = {},{}\n", prefix, sca.lo, sca.hi));
        }
    }
}

/// Inputs gathered from `LibraryState` for `save_system("handel_ini", ...)`.
pub struct WriteInput<'a> {
    pub detectors: Vec<(&'a str, &'a Detector)>,
    pub firmware_sets: Vec<(&'a str, &'a FirmwareSet)>,
    pub defaults: Vec<(&'a str, &'a crate::defaults::Defaults)>,
    pub modules: Vec<(&'a str, &'a Module)>,
    pub log_level: LogLevel,
    pub log_output: String,
}

/// Writes a round-trippable `handel_ini`-format file (§6, §8 round-trip
/// law): every current registry entry, one section per entity kind.
pub fn write(input: &WriteInput) -> String {
    let mut out = String::new();

    if !input.detectors.is_empty() {
        out.push_str(&format!("[{}]\n", SECTION_DETECTOR));
        for (alias, d) in &input.detectors {
            write_detector(&mut out, alias, d);
        }
        out.push('\n');
    }
    if !input.firmware_sets.is_empty() {
        out.push_str(&format!("[{}]\n", SECTION_FIRMWARE));
        for (alias, fs) in &input.firmware_sets {
            write_firmware(&mut out, alias, fs);
        }
        out.push('\n');
    }
    if !input.defaults.is_empty() {
        out.push_str(&format!("[{}]\n", SECTION_DEFAULT));
        for (alias, defaults) in &input.defaults {
            write_defaults(&mut out, alias, defaults);
        }
        out.push('\n');
    }
    if !input.modules.is_empty() {
        out.push_str(&format!("[{}]\n", SECTION_MODULE));
        for (alias, m) in &input.modules {
            write_module(&mut out, alias, m);
        }
        out.push('\n');
    }

    out.push_str(&format!("[{}]\n", SECTION_SETTINGS));
    out.push_str(&format!("log_level = {:?}\n", input.log_level).to_lowercase());
    out.push_str(&format!("log_output = {}\n", input.log_output));

    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_source_parses_to_empty_config() {
        let parsed = parse("").unwrap();
        assert!(parsed.detectors.is_empty());
        assert!(parsed.modules.is_empty());
    }

    #[test]
    fn accepts_both_line_endings() {
        let unix = "[default definitions]\nalias = d0\npeaking_time = 4.0\n";
        let windows = "[default definitions]\r\nalias = d0\r\npeaking_time = 4.0\r\n";
        let a = parse(unix).unwrap();
        let b = parse(windows).unwrap();
        assert_eq!(a.defaults[0].1.get("peaking_time").unwrap(), b.defaults[0].1.get("peaking_time").unwrap());
    }

    #[test]
    fn parses_detector_with_two_channels() {
        let text = "\
[detector definitions]
alias = det0
number_of_channels = 2
channel0_gain = 1.0
channel0_polarity = positive
channel1_gain = 2.0
channel1_polarity = negative
type = reset
type_value = 1.5
";
        let parsed = parse(text).unwrap();
        assert_eq!(parsed.detectors.len(), 1);
        let (alias, det) = &parsed.detectors[0];
        assert_eq!(alias, "det0");
        assert_eq!(det.gain_at(1).unwrap(), 2.0);
    }

    #[test]
    fn parses_listed_firmware_set_with_two_ptrrs() {
        let text = "\
[firmware definitions]
alias = fs0
ptrr0_min = 1.0
ptrr0_max = 10.0
ptrr0_dsp = d0.bin
ptrr0_fippi = f0.bin
ptrr1_min = 10.001
ptrr1_max = 50.0
ptrr1_dsp = d1.bin
ptrr1_fippi = f1.bin
ptrr1_filter_info = 2,3
";
        let parsed = parse(text).unwrap();
        let (_, fs) = &parsed.firmware_sets[0];
        assert!(fs.validate().is_ok());
        let sorted = fs.sorted_variants().unwrap();
        assert_eq!(sorted[1].filter_info, vec![2, 3]);
    }

    #[test]
    fn parses_module_with_epp_interface_and_channel_bindings() {
        let text = "\
[module definitions]
alias = mod0
product_type = saturn
number_of_channels = 1
interface = epp
epp_address = 378
channel0_logical_channel = 0
channel0_detector = det0
channel0_detector_channel = 0
channel0_firmware_set = fs0
channel0_defaults = defaults0
channel0_sca = 10,20
";
        let parsed = parse(text).unwrap();
        let (_, m) = &parsed.modules[0];
        assert_eq!(m.product_type, "saturn");
        let ch = m.channel(0).unwrap();
        assert_eq!(ch.logical_channel, Some(0));
        assert_eq!(ch.detector_binding, Some(("det0".to_string(), 0)));
        assert_eq!(ch.scas[0].lo, 10);
        assert_eq!(ch.scas[0].hi, 20);
    }

    #[test]
    fn round_trips_a_default_entry_through_write_and_parse() {
        let mut defaults = crate::defaults::Defaults::new();
        defaults.alias = "defaults0".into();
        defaults.set("peaking_time", 4.0);
        let input = WriteInput {
            detectors: vec![],
            firmware_sets: vec![],
            defaults: vec![("defaults0", &defaults)],
            modules: vec![],
            log_level: LogLevel::Info,
            log_output: "stderr".to_string(),
        };
        let text = write(&input);
        let parsed = parse(&text).unwrap();
        assert_eq!(parsed.defaults[0].1.get("peaking_time").unwrap(), 4.0);
    }

    #[test]
    fn malformed_line_without_equals_is_rejected() {
        let text = "[default definitions]\nalias = d0\nnotakeyvaluepair\n";
        assert!(parse(text).is_err());
    }
}
