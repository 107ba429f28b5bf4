// SPDX-License-Identifier: LGPL-3.0-or-later

//! Flat tagged error taxonomy shared by every fallible operation in the core.
//!
//! Every layer propagates an [`Error`] without translation; only the topmost
//! dispatcher (the CLI, or a host application) attaches contextual logging.
//! The numeric ranges below group kinds the way callers reason about them
//! (can the client recover? is the channel dead? is this a config mistake
//! caught before `start_system`?) without resorting to string matching.

use std::fmt;

/// One error kind per fallible condition described by the core. Grouped by
/// numeric range: 1000s I/O, 2000s DSP/FiPPI, 3000s configuration, 4000s
/// acquisition-value, 5000s host, 6000s logging.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    // ---- I/O (1000s) ----
    #[error("failed to open device: {0}")]
    Open(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("failed to initialize port: {0}")]
    InitializePort(String),
    #[error("failed to close port: {0}")]
    ClosePort(String),
    #[error("bad I/O name: {0}")]
    BadIoName(String),
    #[error("unknown baud rate: {0}")]
    UnknownBaud(u32),

    // ---- DSP / FiPPI (2000s) ----
    #[error("failed to load DSP code for channel {0}")]
    DspLoad(i32),
    #[error("DSP did not wake from sleep on channel {0}")]
    DspSleep(i32),
    #[error("failed to access DSP memory on channel {0}")]
    DspAccess(i32),
    #[error("DSP parameter {name} out of bounds: {value} not in [{min}, {max}]")]
    DspParamBounds {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("no DSP symbol named {0}")]
    NoSymbol(String),
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("FPGA did not respond within timeout: {0}")]
    FpgaTimeout(String),
    #[error("checksum mismatch in firmware {0}")]
    Checksum(String),
    #[error("unexpected bit pattern reading {0}")]
    BadBit(String),
    #[error("run already active on channel {0}")]
    RunActive(i32),
    #[error("invalid string: {0}")]
    InvalidString(String),
    #[error("operation not implemented: {0}")]
    Unimplemented(String),
    #[error("memory length {requested} exceeds region {region} capacity {capacity}")]
    MemoryLength {
        region: String,
        requested: usize,
        capacity: usize,
    },
    #[error("memory block size mismatch in region {0}")]
    MemoryBlkSize(String),
    #[error("unknown memory region: {0}")]
    UnknownMem(String),
    #[error("unknown FPGA identifier: {0}")]
    UnknownFpga(String),
    #[error("apply run did not reach expected status: {0}")]
    ApplyStatus(String),
    #[error("invalid length: {0}")]
    InvalidLength(usize),
    #[error("no SCA defined at index {0}")]
    NoSca(u16),
    #[error("FPGA CRC check failed: {0}")]
    FpgaCrc(String),
    #[error("unknown register: {0}")]
    UnknownReg(String),
    #[error("failed to open file: {0}")]
    OpenFile(String),
    #[error("failed to rewrite configuration file: {0}")]
    RewriteFailure(String),

    // ---- Configuration (3000s) ----
    #[error("bad system item: {0}")]
    BadSystemItem(String),
    #[error("maximum number of modules ({0}) exceeded")]
    MaxModules(u32),
    #[error("no detector channel {0}")]
    NoDetChan(i32),
    #[error("no I/O channel associated with {0}")]
    NoIoChan(String),
    #[error("no module channel {0}")]
    NoModChan(i32),
    #[error("library not initialized")]
    Initialize,
    #[error("unknown board type: {0}")]
    UnknownBtype(String),
    #[error("bad channel: {0}")]
    BadChannel(i32),
    #[error("null reference: {0}")]
    Null(String),
    #[error("malformed configuration file: {0}")]
    MalformedFile(String),
    #[error("unknown control task: {0}")]
    UnknownCt(String),
    #[error("alias already exists: {0}")]
    AliasExists(String),
    #[error("alias exceeds maximum length ({max} bytes): {alias}")]
    AliasSize { alias: String, max: usize },
    #[error("no such alias: {0}")]
    NoAlias(String),
    #[error("bad value for {name}: {value}")]
    BadValue { name: String, value: String },
    #[error("bad name: {0}")]
    BadName(String),
    #[error("bad type: {0}")]
    BadType(String),
    #[error("infinite loop detected in logical channel set {0}")]
    InfiniteLoop(i32),
    #[error("firmware set {0} has both archive-mode and listed-mode populated")]
    FirmBoth(String),
    #[error("peaking time ranges overlap in firmware set {set}: ptrr {a} and ptrr {b}")]
    PtrOverlap { set: String, a: u32, b: u32 },
    #[error("missing firmware for {0}")]
    MissingFirm(String),
    #[error("detector {0} is missing polarity for one or more channels")]
    MissingPol(String),
    #[error("detector {0} is missing gain for one or more channels")]
    MissingGain(String),
    #[error("detector {0} has unset (Unknown) type")]
    MissingType(String),
    #[error("module {0} has no channels configured")]
    NoChannels(String),
    #[error("invalid detector channel {channel} for detector {detector}")]
    InvalidDetChan { detector: String, channel: u32 },
    #[error("SCA {index} low/high endpoints out of order on channel {channel}")]
    BinMismatch { channel: i32, index: u16 },
    #[error("SCA index {0} out of range")]
    ScaOor(u16),
    #[error("maximum number of SCAs ({0}) exceeded")]
    MaxScas(u32),

    // ---- Acquisition-value (4000s) ----
    #[error("unknown acquisition value: {0}")]
    UnknownValue(String),
    #[error("trigger threshold {value} out of range [{min}, {max}]")]
    ThreshOor { value: f64, min: f64, max: f64 },
    #[error("MCA bin count {value} out of range [{min}, {max}]")]
    BinsOor { value: u32, min: u32, max: u32 },
    #[error("gain {value} out of range [{min}, {max}]")]
    GainOor { value: f64, min: f64, max: f64 },
    #[error("SLOWLEN {0} out of range [2, 28]")]
    SlowlenOor(i64),
    #[error("FASTLEN {0} out of range")]
    FastlenOor(i64),
    #[error("FASTGAP {0} out of range")]
    FastgapOor(i64),
    #[error("fast filter configuration out of range: {0}")]
    FastfilterOor(String),
    #[error("MAXWIDTH {value} out of range [{min}, {max}]")]
    MaxwidthOor { value: f64, min: f64, max: f64 },
    #[error("preset value {0} out of range")]
    PresetValueOor(f64),
    #[error("unknown preset style: {0}")]
    UnknownPreset(String),
    #[error("invalid clock speed: {0}")]
    ClockSpeed(f64),
    #[error("Defaults {0} is missing one or more product-required values")]
    IncompleteDefaults(String),
    #[error("bad PSL arguments: {0}")]
    BadPslArgs(String),
    #[error("bad filter configuration: {0}")]
    BadFilter(String),
    #[error("value cannot be removed: {0}")]
    NoRemove(String),
    #[error("FiPPI parameter out of range: {0}")]
    FipOor(String),
    #[error("firmware kind not supported by this product: {0:?}")]
    NoSupportFirm(String),
    #[error("unknown firmware kind: {0}")]
    UnknownFirm(String),
    #[error("module {0} is missing an interface/transport binding")]
    MissingInterface(String),
    #[error("module {0} is missing a transport address")]
    MissingAddress(String),
    #[error("invalid number of channels: {0}")]
    InvalidNumchans(u32),
    #[error("no temp path configured for firmware staging")]
    NoTmpPath,
    #[error("no filename available for firmware kind {0:?}")]
    NoFilename(String),
    #[error("firmware set resolved to a null/empty firmware entry")]
    NullFirmware,
    #[error("peaking time {0} does not fall within any configured PTRR")]
    LookingPtr(f64),
    #[error("bad PTRR index: {0}")]
    BadPtr(u32),
    #[error("bad index: {0}")]
    BadIndex(usize),
    #[error("null alias")]
    NullAlias,
    #[error("null name")]
    NullName,
    #[error("null value")]
    NullValue,
    #[error("null info buffer")]
    NullInfo,

    // ---- Host (5000s) ----
    #[error("out of memory")]
    NoMem,
    #[error("operating system API error: {0}")]
    OsApi(String),

    // ---- Log (6000s) ----
    #[error("invalid log level: {0}")]
    LogLevel(String),
}

impl Error {
    /// The numeric code a process-level CLI reports on exit (§6, "Exit codes").
    pub fn code(&self) -> i32 {
        use Error::*;
        match self {
            Open(_) => 1000,
            Io(_) => 1001,
            InitializePort(_) => 1002,
            ClosePort(_) => 1003,
            BadIoName(_) => 1004,
            UnknownBaud(_) => 1005,

            DspLoad(_) => 2000,
            DspSleep(_) => 2001,
            DspAccess(_) => 2002,
            DspParamBounds { .. } => 2003,
            NoSymbol(_) => 2004,
            Timeout(_) => 2005,
            FpgaTimeout(_) => 2006,
            Checksum(_) => 2007,
            BadBit(_) => 2008,
            RunActive(_) => 2009,
            InvalidString(_) => 2010,
            Unimplemented(_) => 2011,
            MemoryLength { .. } => 2012,
            MemoryBlkSize(_) => 2013,
            UnknownMem(_) => 2014,
            UnknownFpga(_) => 2015,
            ApplyStatus(_) => 2016,
            InvalidLength(_) => 2017,
            NoSca(_) => 2018,
            FpgaCrc(_) => 2019,
            UnknownReg(_) => 2020,
            OpenFile(_) => 2021,
            RewriteFailure(_) => 2022,

            BadSystemItem(_) => 3000,
            MaxModules(_) => 3001,
            NoDetChan(_) => 3002,
            NoIoChan(_) => 3003,
            NoModChan(_) => 3004,
            Initialize => 3005,
            UnknownBtype(_) => 3006,
            BadChannel(_) => 3007,
            Null(_) => 3008,
            MalformedFile(_) => 3009,
            UnknownCt(_) => 3010,
            AliasExists(_) => 3011,
            NoAlias(_) => 3012,
            BadValue { .. } => 3013,
            BadName(_) => 3014,
            BadType(_) => 3015,
            InfiniteLoop(_) => 3016,
            FirmBoth(_) => 3017,
            PtrOverlap { .. } => 3018,
            MissingFirm(_) => 3019,
            MissingPol(_) => 3020,
            MissingGain(_) => 3021,
            MissingType(_) => 3022,
            NoChannels(_) => 3023,
            InvalidDetChan { .. } => 3024,
            BinMismatch { .. } => 3025,
            ScaOor(_) => 3026,
            MaxScas(_) => 3027,
            AliasSize { .. } => 3028,

            UnknownValue(_) => 4000,
            ThreshOor { .. } => 4001,
            BinsOor { .. } => 4002,
            GainOor { .. } => 4003,
            SlowlenOor(_) => 4004,
            FastlenOor(_) => 4005,
            FastgapOor(_) => 4006,
            FastfilterOor(_) => 4007,
            MaxwidthOor { .. } => 4008,
            PresetValueOor(_) => 4009,
            UnknownPreset(_) => 4010,
            ClockSpeed(_) => 4011,
            IncompleteDefaults(_) => 4012,
            BadPslArgs(_) => 4013,
            BadFilter(_) => 4014,
            NoRemove(_) => 4015,
            FipOor(_) => 4016,
            NoSupportFirm(_) => 4017,
            UnknownFirm(_) => 4018,
            MissingInterface(_) => 4019,
            MissingAddress(_) => 4020,
            InvalidNumchans(_) => 4021,
            NoTmpPath => 4022,
            NoFilename(_) => 4023,
            NullFirmware => 4024,
            LookingPtr(_) => 4025,
            BadPtr(_) => 4026,
            BadIndex(_) => 4027,
            NullAlias => 4028,
            NullName => 4029,
            NullValue => 4030,
            NullInfo => 4031,

            NoMem => 5000,
            OsApi(_) => 5001,

            LogLevel(_) => 6000,
        }
    }

    /// Whether this error leaves the channel/hardware in a state a client
    /// can recover from without re-running `start_system`. Timeouts and
    /// out-of-range errors are recoverable; DSP load failures are fatal for
    /// the channel until firmware is reloaded (§7).
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Error::DspLoad(_) | Error::Checksum(_) | Error::FpgaCrc(_) | Error::NoMem
        )
    }
}

/// Lightweight alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for AliasKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AliasKind::Detector => "detector",
            AliasKind::FirmwareSet => "firmware set",
            AliasKind::Module => "module",
            AliasKind::Defaults => "defaults",
        };
        write!(f, "{}", s)
    }
}

/// Which registry an alias belongs to; used only for diagnostic messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasKind {
    Detector,
    FirmwareSet,
    Module,
    Defaults,
}
