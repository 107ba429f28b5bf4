// SPDX-License-Identifier: LGPL-3.0-or-later

//! Transport binding vocabulary and memory-operation string grammar (§6).
//! Parsing only — the core never speaks a wire protocol itself (§1
//! Non-goals); this module just turns configuration text and client-facing
//! strings into the typed values the rest of the crate works with.

use crate::capability::MemRegion;
use crate::error::{Error, Result};
use crate::module::{SerialPort, Transport};

/// A parsed `"{type}:{r|w}:{addr-hex}:{len-dec}"` memory-operation string
/// (§6). `kind` is left as the raw section name; callers match it against
/// their own `MemRegion` mapping (`region()` covers the three names the
/// core recognizes).
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryOp {
    pub kind: String,
    pub write: bool,
    pub addr: u32,
    pub len: usize,
}

impl MemoryOp {
    /// Maps `kind` to a `MemRegion`, matching the names `DeviceBus` uses.
    pub fn region(&self) -> Result<MemRegion> {
        match self.kind.as_str() {
            "data" => Ok(MemRegion::Data),
            "spectrum" => Ok(MemRegion::Spectrum),
            "register" => Ok(MemRegion::Register),
            _ => Err(Error::UnknownMem(self.kind.clone())),
        }
    }
}

/// Parses a memory-operation string against `^[a-z]+:[rw]:[0-9a-f]+:[0-9]+$`
/// (§8 "Quantified invariants"). Any deviation yields `InvalidString`.
pub fn parse_memory_op(s: &str) -> Result<MemoryOp> {
    let fields: Vec<&str> = s.split(':').collect();
    if fields.len() != 4 {
        return Err(Error::InvalidString(s.to_string()));
    }
    let [kind, rw, addr, len] = [fields[0], fields[1], fields[2], fields[3]];

    if kind.is_empty() || !kind.chars().all(|c| c.is_ascii_lowercase()) {
        return Err(Error::InvalidString(s.to_string()));
    }
    let write = match rw {
        "r" => false,
        "w" => true,
        _ => return Err(Error::InvalidString(s.to_string())),
    };
    if addr.is_empty() || !addr.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidString(s.to_string()));
    }
    let addr = u32::from_str_radix(addr, 16).map_err(|_| Error::InvalidString(s.to_string()))?;
    if len.is_empty() || !len.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::InvalidString(s.to_string()));
    }
    let len: usize = len.parse().map_err(|_| Error::InvalidString(s.to_string()))?;

    Ok(MemoryOp {
        kind: kind.to_string(),
        write,
        addr,
        len,
    })
}

pub fn format_memory_op(op: &MemoryOp) -> String {
    format!("{}:{}:{:x}:{}", op.kind, if op.write { "w" } else { "r" }, op.addr, op.len)
}

/// Parses a transport binding out of the `<name> = <value>` pairs collected
/// under a module's `interface` section (§6 "Transport binding
/// vocabulary"). `interface_kind` has already been read from the
/// configuration grammar; `fields` holds the remaining key/value pairs in
/// file order.
pub fn parse_transport(interface_kind: &str, fields: &[(String, String)]) -> Result<Transport> {
    let get = |key: &str| fields.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());

    match interface_kind {
        "epp" | "genericEPP" => {
            let address_str = get("epp_address").ok_or_else(|| Error::MissingAddress(interface_kind.to_string()))?;
            let address = u32::from_str_radix(address_str.trim_start_matches("0x"), 16)
                .map_err(|_| Error::BadValue { name: "epp_address".into(), value: address_str.to_string() })?;
            let daisy_chain_id = get("daisy_chain_id")
                .map(|v| v.parse::<u32>().map_err(|_| Error::BadValue { name: "daisy_chain_id".into(), value: v.to_string() }))
                .transpose()?;
            Ok(Transport::Epp { address, daisy_chain_id })
        }
        "usb" => {
            let device_number = parse_uint("device_number", get("device_number"))?;
            Ok(Transport::Usb { device_number })
        }
        "usb2" => {
            let device_number = parse_uint("device_number", get("device_number"))?;
            Ok(Transport::Usb2 { device_number })
        }
        "serial" => {
            let port = match (get("com_port"), get("device_file")) {
                (Some(v), _) => SerialPort::ComPort(parse_uint("com_port", Some(v))?),
                (None, Some(v)) => SerialPort::DeviceFile(v.to_string()),
                (None, None) => return Err(Error::MissingAddress("serial".to_string())),
            };
            let baud_rate = parse_uint("baud_rate", get("baud_rate"))?;
            Ok(Transport::Serial { port, baud_rate })
        }
        "pxi" => {
            let bus = parse_byte("bus", get("bus"))?;
            let slot = parse_byte("slot", get("slot"))?;
            Ok(Transport::Pxi { bus, slot })
        }
        other => Err(Error::BadIoName(other.to_string())),
    }
}

fn parse_uint(name: &str, value: Option<&str>) -> Result<u32> {
    value
        .ok_or_else(|| Error::MissingAddress(name.to_string()))?
        .parse()
        .map_err(|_| Error::BadValue { name: name.to_string(), value: value.unwrap_or_default().to_string() })
}

fn parse_byte(name: &str, value: Option<&str>) -> Result<u8> {
    value
        .ok_or_else(|| Error::MissingAddress(name.to_string()))?
        .parse()
        .map_err(|_| Error::BadValue { name: name.to_string(), value: value.unwrap_or_default().to_string() })
}

/// Serializes a transport binding back to `<name> = <value>` pairs in the
/// same field order the parser accepts, for `save_system`.
pub fn format_transport(transport: &Transport) -> Vec<(String, String)> {
    match transport {
        Transport::Epp { address, daisy_chain_id } => {
            let mut fields = vec![("epp_address".to_string(), format!("{:x}", address))];
            if let Some(id) = daisy_chain_id {
                fields.push(("daisy_chain_id".to_string(), id.to_string()));
            }
            fields
        }
        Transport::Usb { device_number } => vec![("device_number".to_string(), device_number.to_string())],
        Transport::Usb2 { device_number } => vec![("device_number".to_string(), device_number.to_string())],
        Transport::Serial { port, baud_rate } => {
            let mut fields = match port {
                SerialPort::ComPort(n) => vec![("com_port".to_string(), n.to_string())],
                SerialPort::DeviceFile(path) => vec![("device_file".to_string(), path.clone())],
            };
            fields.push(("baud_rate".to_string(), baud_rate.to_string()));
            fields
        }
        Transport::Pxi { bus, slot } => vec![("bus".to_string(), bus.to_string()), ("slot".to_string(), slot.to_string())],
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_well_formed_memory_op() {
        let op = parse_memory_op("spectrum:r:1a2b:512").unwrap();
        assert_eq!(op.kind, "spectrum");
        assert!(!op.write);
        assert_eq!(op.addr, 0x1a2b);
        assert_eq!(op.len, 512);
    }

    #[test]
    fn rejects_malformed_memory_ops() {
        assert!(parse_memory_op("spectrum:x:1a2b:512").is_err());
        assert!(parse_memory_op("spectrum:r:zz:512").is_err());
        assert!(parse_memory_op("spectrum:r:1a2b:-1").is_err());
        assert!(parse_memory_op("spectrum:r:1a2b").is_err());
        assert!(parse_memory_op("Spectrum:r:1a2b:512").is_err());
    }

    #[test]
    fn memory_op_round_trips_through_format() {
        let op = parse_memory_op("data:w:ff:16").unwrap();
        assert_eq!(parse_memory_op(&format_memory_op(&op)).unwrap(), op);
    }

    #[test]
    fn parses_epp_transport_with_default_daisy_chain() {
        let fields = vec![("epp_address".to_string(), "378".to_string())];
        let transport = parse_transport("epp", &fields).unwrap();
        assert_eq!(transport, Transport::Epp { address: 0x378, daisy_chain_id: None });
    }

    #[test]
    fn parses_serial_with_device_file() {
        let fields = vec![
            ("device_file".to_string(), "/dev/ttyUSB0".to_string()),
            ("baud_rate".to_string(), "9600".to_string()),
        ];
        let transport = parse_transport("serial", &fields).unwrap();
        assert_eq!(
            transport,
            Transport::Serial { port: SerialPort::DeviceFile("/dev/ttyUSB0".to_string()), baud_rate: 9600 }
        );
    }

    #[test]
    fn rejects_unknown_interface_kind() {
        assert!(parse_transport("bogus", &[]).is_err());
    }
}
