#![deny(unsafe_code)]
//! Extracts media properties (duration, codec, sample rate, channels,
//! bitrate, frame size) from Matroska/WebM, ISO-BMFF (MP4/M4A), ASF
//! (WMA/WMV), Ogg and RIFF (WAV/AVI) files.
//!
//! Corrupt input never panics: structural damage is recorded in a
//! [`CorruptionLedger`] and whatever was read before the damage is still
//! returned.
//!
//! ```no_run
//! use mediaprops::{ParseConfig, Unstoppable};
//!
//! let mut file = std::fs::File::open("song.ogg")?;
//! let probe = mediaprops::read_properties(&mut file, &ParseConfig::default(), &Unstoppable)?;
//! if let Some(props) = &probe.properties {
//!     println!("{:?} at {} Hz", props.duration(), props.sample_rate());
//! }
//! if probe.is_possibly_corrupt() {
//!     for entry in probe.ledger.iter() {
//!         eprintln!("{entry}");
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! This crate is written entirely in safe Rust code.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use log::debug;

use fallible_collections::TryReserveError;
use std::convert::TryInto as _;
use std::io::{Read, Seek};

mod asf;
mod boxes;
mod element;
mod ledger;
mod matroska;
mod mp4;
mod ogg;
mod properties;
mod riff;
pub mod sizes;
mod source;
mod walker;

pub use crate::boxes::FourCC;
pub use crate::ledger::{Corruption, CorruptionLedger};
pub use crate::properties::{Codec, CodecFact, MediaKind, Properties};
pub use enough::{Stop, StopReason, Unstoppable};

use crate::source::Source;

/// A trait to indicate a type can be infallibly converted to `u64`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
pub(crate) trait ToU64 {
    fn to_u64(self) -> u64;
}

/// Statically verify that the platform `usize` can fit within a `u64`.
/// If the size won't fit on the given platform, this will fail at compile time, but if a type
/// which can fail `TryInto<usize>` is used, it may panic.
impl ToU64 for usize {
    fn to_u64(self) -> u64 {
        const _: () = assert!(std::mem::size_of::<usize>() <= std::mem::size_of::<u64>());
        self.try_into().ok().unwrap_or(u64::MAX)
    }
}

/// A trait to indicate a type can be infallibly converted to `usize`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
pub(crate) trait ToUsize {
    fn to_usize(self) -> usize;
}

macro_rules! impl_to_usize_from {
    ( $from_type:ty ) => {
        impl ToUsize for $from_type {
            fn to_usize(self) -> usize {
                const _: () = assert!(std::mem::size_of::<$from_type>() <= std::mem::size_of::<usize>());
                self.try_into().ok().unwrap_or(usize::MAX)
            }
        }
    };
}

impl_to_usize_from!(u8);
impl_to_usize_from!(u16);
impl_to_usize_from!(u32);

#[doc(hidden)]
pub type TryVec<T> = fallible_collections::TryVec<T>;

// To ensure we don't use stdlib allocating types by accident
#[allow(dead_code)]
struct Vec;
#[allow(dead_code)]
struct Box;
#[allow(dead_code)]
struct HashMap;
#[allow(dead_code)]
struct String;

/// Describes parser failures.
///
/// This enum wraps the standard `io::Error` type, unified with
/// our own parser error states and those of crates we use.
#[derive(Debug)]
pub enum Error {
    /// Parse error caused by corrupt or malformed data.
    InvalidData(&'static str),
    /// A required signature, magic number or GUID is missing, or the
    /// container declares a flavour this crate does not read.
    Unsupported(&'static str),
    /// Reflect `std::io::ErrorKind::UnexpectedEof` for short data.
    UnexpectedEOF,
    /// A declared size or offset points outside its container or the source.
    OutOfBounds(&'static str),
    /// An indexed element did not match what the index predicted.
    Inconsistent(&'static str),
    /// Propagate underlying errors from `std::io`.
    Io(std::io::Error),
    /// Out of memory
    OutOfMemory,
    /// Resource limit exceeded during parsing
    ResourceLimitExceeded(&'static str),
    /// Operation was stopped/cancelled
    Stopped(enough::StopReason),
}

impl Error {
    /// Whether parsing can carry on after recording this error in the
    /// corruption ledger.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidData(_)
                | Self::UnexpectedEOF
                | Self::OutOfBounds(_)
                | Self::Inconsistent(_)
                | Self::ResourceLimitExceeded(_)
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::InvalidData(s)
            | Self::Unsupported(s)
            | Self::OutOfBounds(s)
            | Self::Inconsistent(s)
            | Self::ResourceLimitExceeded(s) => s,
            Self::UnexpectedEOF => "EOF",
            Self::Io(err) => return err.fmt(f),
            Self::OutOfMemory => "OOM",
            Self::Stopped(reason) => return write!(f, "Stopped: {}", reason),
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<bitreader::BitReaderError> for Error {
    #[cold]
    #[cfg_attr(debug_assertions, track_caller)]
    fn from(err: bitreader::BitReaderError) -> Self {
        log::warn!("bitreader: {err}");
        debug_assert!(!matches!(err, bitreader::BitReaderError::TooManyBitsForType { .. })); // bug
        Self::InvalidData("truncated bits")
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::UnexpectedEOF,
            _ => Self::Io(err),
        }
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(_: std::num::TryFromIntError) -> Self {
        Self::Unsupported("integer conversion failed")
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::InvalidData(_) | Error::Inconsistent(_) => std::io::ErrorKind::InvalidData,
            Error::UnexpectedEOF => std::io::ErrorKind::UnexpectedEof,
            Error::Io(io_err) => return io_err,
            _ => std::io::ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

impl From<enough::StopReason> for Error {
    fn from(reason: enough::StopReason) -> Self {
        Self::Stopped(reason)
    }
}

/// Result shorthand using our Error enum.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How much work the parser may do beyond reading headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadStyle {
    /// Stop at the first media payload; estimate Ogg durations from the
    /// last 64 KiB of the file.
    Fast,
    /// Like `Fast`, but derive MP4 track bitrates from sample size tables
    /// when no bitrate is declared.
    #[default]
    Average,
    /// Scan whole files where that improves the answer: Matroska segments
    /// past their clusters, every Ogg page (checksums included).
    Accurate,
}

/// Configuration for reading media properties with resource limits
///
/// Limits bound the work done on hostile or damaged files. Hitting one is
/// recorded in the corruption ledger and ends the walk that hit it; it
/// never aborts the whole read.
///
/// # Examples
///
/// ```rust
/// use mediaprops::{ParseConfig, ReadStyle};
///
/// // Default limits (suitable for most apps)
/// let config = ParseConfig::default();
///
/// // Thorough scan of a trusted library
/// let config = ParseConfig::unlimited().with_read_style(ReadStyle::Accurate);
///
/// // Strict limits for untrusted input
/// let config = ParseConfig::default()
///     .with_max_depth(16)
///     .with_max_elements(10_000)
///     .with_max_packet_size(1 << 20);
/// ```
#[derive(Debug, Clone)]
pub struct ParseConfig {
    /// How much of the file to read.
    /// Default: `ReadStyle::Average`
    pub read_style: ReadStyle,

    /// Maximum element nesting depth the tree walker descends into.
    /// Default: 32
    pub max_depth: u32,

    /// Maximum number of elements, boxes, objects, chunks or pages visited
    /// in one read.
    /// Default: 1,000,000
    pub max_elements: Option<u64>,

    /// Maximum size of one reassembled Ogg header packet.
    /// Default: 16 MiB
    pub max_packet_size: Option<u64>,

    /// Maximum number of chained Matroska SeekHead indices followed.
    /// Default: 4
    pub max_seek_head_depth: u32,
}

impl Default for ParseConfig {
    fn default() -> Self {
        Self {
            read_style: ReadStyle::Average,
            max_depth: 32,
            max_elements: Some(1_000_000),
            max_packet_size: Some(16 << 20),
            max_seek_head_depth: 4,
        }
    }
}

impl ParseConfig {
    /// Create a configuration with no count or size limits.
    ///
    /// The nesting depth stays bounded, since the walker's stack grows with it.
    pub fn unlimited() -> Self {
        Self {
            read_style: ReadStyle::Average,
            max_depth: 256,
            max_elements: None,
            max_packet_size: None,
            max_seek_head_depth: 16,
        }
    }

    /// Set how much of the file is read
    pub fn with_read_style(mut self, read_style: ReadStyle) -> Self {
        self.read_style = read_style;
        self
    }

    /// Set the maximum nesting depth
    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    /// Set the maximum number of visited elements
    pub fn with_max_elements(mut self, count: u64) -> Self {
        self.max_elements = Some(count);
        self
    }

    /// Set the maximum reassembled Ogg packet size in bytes
    pub fn with_max_packet_size(mut self, bytes: u64) -> Self {
        self.max_packet_size = Some(bytes);
        self
    }

    /// Set the maximum chained SeekHead depth
    pub fn with_max_seek_head_depth(mut self, depth: u32) -> Self {
        self.max_seek_head_depth = depth;
        self
    }
}

/// Container families this crate reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerFormat {
    /// EBML based Matroska and WebM
    Matroska,
    /// ISO base media file format: MP4, M4A, MOV
    Mp4,
    /// Advanced Systems Format: WMA, WMV
    Asf,
    Ogg,
    /// WAV and AVI
    Riff,
}

/// Guess the container from the first bytes of a file.
///
/// Sixteen bytes are enough for every signature this crate knows.
pub fn detect_format(prefix: &[u8]) -> Option<ContainerFormat> {
    if prefix.starts_with(&matroska::EBML_MAGIC) {
        return Some(ContainerFormat::Matroska);
    }
    if prefix.starts_with(b"OggS") {
        return Some(ContainerFormat::Ogg);
    }
    if prefix.starts_with(b"RIFF") {
        return Some(ContainerFormat::Riff);
    }
    if prefix.starts_with(&asf::HEADER_OBJECT.to_bytes()) {
        return Some(ContainerFormat::Asf);
    }
    match prefix.get(4..8) {
        Some(b"ftyp" | b"moov" | b"mdat" | b"free" | b"skip" | b"wide") => Some(ContainerFormat::Mp4),
        _ => None,
    }
}

/// The outcome of one read.
#[derive(Debug)]
pub struct Probe {
    /// The container that was recognized, if any.
    pub format: Option<ContainerFormat>,
    /// What could be read. `None` when no container signature was found.
    pub properties: Option<Properties>,
    /// Reasons the file looks damaged. Empty for clean files.
    pub ledger: CorruptionLedger,
}

impl Probe {
    /// Whether anything suspicious was found while reading. Properties may
    /// still be present, but could be incomplete.
    pub fn is_possibly_corrupt(&self) -> bool {
        !self.ledger.is_empty()
    }
}

/// State shared by every parser during one read.
pub(crate) struct Session<'a, R> {
    pub(crate) src: Source<'a, R>,
    pub(crate) config: &'a ParseConfig,
    stop: &'a dyn Stop,
    pub(crate) ledger: CorruptionLedger,
    elements_visited: u64,
}

impl<'a, R: Read + Seek> Session<'a, R> {
    fn new(source: &'a mut R, config: &'a ParseConfig, stop: &'a dyn Stop) -> Result<Self> {
        Ok(Self {
            src: Source::new(source)?,
            config,
            stop,
            ledger: CorruptionLedger::default(),
            elements_visited: 0,
        })
    }

    pub(crate) fn read_style(&self) -> ReadStyle {
        self.config.read_style
    }

    pub(crate) fn check_stop(&self) -> Result<()> {
        self.stop.check()?;
        Ok(())
    }

    /// Count one more visited element against `max_elements`.
    pub(crate) fn count_element(&mut self) -> Result<()> {
        self.elements_visited += 1;
        match self.config.max_elements {
            Some(limit) if self.elements_visited > limit => Err(Error::ResourceLimitExceeded("element count limit exceeded")),
            _ => Ok(()),
        }
    }

    /// Record a recoverable error and return `Ok(None)`; pass anything else on.
    pub(crate) fn recover<T>(&mut self, offset: u64, result: Result<T>) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_recoverable() => {
                self.ledger.record(offset, &err);
                Ok(None)
            },
            Err(err) => Err(err),
        }
    }
}

/// Read the media properties of a file, detecting its container format.
///
/// Returns a [`Probe`] with `properties: None` when no known container
/// signature is present. Damage found along the way is listed in the
/// returned ledger. Fails outright only for I/O errors, cancellation via
/// `stop`, or a recognized container that declares something unreadable
/// (for instance a Matroska DocType other than "matroska" or "webm").
pub fn read_properties<R: Read + Seek>(source: &mut R, config: &ParseConfig, stop: &dyn Stop) -> Result<Probe> {
    let mut session = Session::new(source, config, stop)?;
    let mut prefix = [0u8; 16];
    let available = session.src.len().min(16) as usize;
    session.src.read_exact(&mut prefix[..available])?;

    match detect_format(&prefix[..available]) {
        Some(format) => read_with(session, format),
        None => {
            let mut ledger = session.ledger;
            ledger.record(0, "no recognizable container signature");
            Ok(Probe { format: None, properties: None, ledger })
        },
    }
}

/// Read the media properties of a file known to be in `format`.
pub fn read_properties_as<R: Read + Seek>(
    source: &mut R,
    format: ContainerFormat,
    config: &ParseConfig,
    stop: &dyn Stop,
) -> Result<Probe> {
    let session = Session::new(source, config, stop)?;
    read_with(session, format)
}

fn read_with<R: Read + Seek>(mut session: Session<'_, R>, format: ContainerFormat) -> Result<Probe> {
    debug!("reading {format:?}, {} bytes", session.src.len());
    let result = match format {
        ContainerFormat::Matroska => matroska::read(&mut session),
        ContainerFormat::Mp4 => mp4::read(&mut session),
        ContainerFormat::Asf => asf::read(&mut session),
        ContainerFormat::Ogg => ogg::read(&mut session),
        ContainerFormat::Riff => riff::read(&mut session),
    };
    let properties = match result {
        Ok(properties) => properties,
        // Damage before the first element: nothing usable, but not a hard failure
        Err(err) if err.is_recoverable() => {
            session.ledger.record(session.src.tell(), &err);
            Properties::aggregate(None, &[])?
        },
        Err(err) => return Err(err),
    };
    Ok(Probe {
        format: Some(format),
        properties: Some(properties),
        ledger: session.ledger,
    })
}

#[test]
fn detect_signatures() {
    assert_eq!(detect_format(&[0x1A, 0x45, 0xDF, 0xA3, 0x9F]), Some(ContainerFormat::Matroska));
    assert_eq!(detect_format(b"OggS\0\x02"), Some(ContainerFormat::Ogg));
    assert_eq!(detect_format(b"RIFF\x24\0\0\0WAVE"), Some(ContainerFormat::Riff));
    assert_eq!(detect_format(b"\0\0\0\x18ftypM4A "), Some(ContainerFormat::Mp4));
    assert_eq!(detect_format(&asf::HEADER_OBJECT.to_bytes()), Some(ContainerFormat::Asf));
    assert_eq!(detect_format(b"ID3\x04"), None);
    assert_eq!(detect_format(b""), None);
}

#[test]
fn recoverable_errors() {
    assert!(Error::OutOfBounds("x").is_recoverable());
    assert!(Error::Inconsistent("x").is_recoverable());
    assert!(!Error::Unsupported("x").is_recoverable());
    assert!(!Error::Stopped(StopReason::Cancelled).is_recoverable());
    assert!(!Error::OutOfMemory.is_recoverable());
}
