//! Custom error types.
//!
//! Failures come in three layers: [`Error`] is fatal and stops a decode
//! run, [`StreamError`] describes a malformed Program Stream (these are
//! fatal too, since the walk cannot continue past them), and [`SpuError`]
//! describes a single bad subpicture, which only costs that subtitle.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A fatal decoding error.
#[derive(Debug, Error)]
pub enum Error {
    /// We could not open one of the input files.
    #[error("could not open {}", path.display())]
    Open {
        /// The file we tried to open.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// We could not read from one of the input files.
    #[error("could not read {}", path.display())]
    Read {
        /// The file we tried to read.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The path given to [`decode`](crate::decode) was not a `*.sub` file.
    #[error("expected a .sub file: {}", path.display())]
    NotASubFile {
        /// The offending path.
        path: PathBuf,
    },

    /// An `*.idx` file was missing a key we cannot decode without.
    #[error("missing required idx key {key:?}")]
    MissingIdxKey {
        /// The key that never appeared.
        key: &'static str,
    },

    /// A line of an `*.idx` file could not be parsed.
    #[error("invalid idx data at line {line}: {reason}")]
    MalformedIdx {
        /// 1-based line number.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// An I/O error while scanning `*.idx` data.
    #[error("i/o error while reading idx data")]
    IdxIo {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The Program Stream itself was malformed.
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// An error encountered while walking the MPEG-2 Program Stream.
///
/// Every variant carries the absolute byte offset in the `*.sub` data at
/// which the problem was detected.
#[derive(Debug, Error)]
pub enum StreamError {
    /// A header did not begin with the `00 00 01` start code.
    #[error("invalid start code {bytes:02x?} at offset {offset:#x}")]
    InvalidStartCode {
        /// Offset of the would-be start code.
        offset: u64,
        /// The four bytes we actually read.
        bytes: [u8; 4],
    },

    /// A pack header had the wrong values in its fixed bit positions.
    #[error("invalid fixed bits in pack header at offset {offset:#x}")]
    InvalidPackFixedBits {
        /// Offset of the pack start code.
        offset: u64,
    },

    /// A pack header declared a program mux rate of zero.
    #[error("program mux rate is zero in pack header at offset {offset:#x}")]
    ZeroMuxRate {
        /// Offset of the pack start code.
        offset: u64,
    },

    /// We found a stream ID we do not expect in a `*.sub` file.
    #[error("unexpected stream id {id:#04x} at offset {offset:#x}")]
    UnexpectedStreamId {
        /// Offset of the start code (or substream byte) carrying the ID.
        offset: u64,
        /// The stream ID we found.
        id: u8,
    },

    /// A PES extension did not start with the `10` marker bits.
    #[error("invalid PES extension marker at offset {offset:#x}")]
    InvalidPesExtensionMarker {
        /// Offset of the first extension byte.
        offset: u64,
    },

    /// A fixed bit inside the PES extension data was wrong.
    #[error("invalid fixed bits in PES extension data at offset {offset:#x}")]
    InvalidPesFixedBits {
        /// Offset of the offending byte.
        offset: u64,
    },

    /// The unused tail of a PES extension data area was not `0xff`.
    #[error("PES extension data is not 0xff padded at offset {offset:#x}")]
    InvalidPesPadding {
        /// Offset of the first non-padding byte.
        offset: u64,
    },

    /// A subtitle continuation packet arrived before any subtitle start.
    #[error("continuation packet at offset {offset:#x} has no subpicture to extend")]
    DanglingContinuation {
        /// Offset of the continuation packet's start code.
        offset: u64,
    },

    /// The stream ended in the middle of a header or payload.
    #[error("unexpected end of stream at offset {offset:#x}")]
    UnexpectedEof {
        /// Offset of the first missing byte.
        offset: u64,
    },

    /// Reading the underlying byte source failed.
    #[error("read failed at offset {offset:#x}")]
    Io {
        /// Offset of the failed read.
        offset: u64,
        /// The underlying I/O error.
        source: io::Error,
    },
}

/// An error in a single Subpicture Unit.
///
/// These are recoverable: the decode loop reports the subpicture as
/// skipped and moves on.  Offsets are relative to the start of the
/// reassembled SPU buffer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpuError {
    /// The buffer is too short to even hold the two size fields.
    #[error("subpicture is only {len} bytes long")]
    TooShort {
        /// Actual buffer length.
        len: usize,
    },

    /// The size header does not describe the buffer we reassembled.
    #[error("subpicture header declares {declared} bytes but {actual} were reassembled")]
    LengthMismatch {
        /// Length according to the SPU header.
        declared: usize,
        /// Length of the reassembled buffer.
        actual: usize,
    },

    /// A control sequence offset points outside the control area.
    #[error("control sequence offset {offset:#x} is out of bounds")]
    ControlOffsetOutOfBounds {
        /// The offending offset.
        offset: usize,
    },

    /// The control chain revisited a sequence without terminating.
    #[error("control sequence chain loops at offset {offset:#x}")]
    ControlChainLoop {
        /// Offset of the first revisited sequence.
        offset: usize,
    },

    /// A control sequence ran past the end of the buffer.
    #[error("truncated control sequence at offset {offset:#x}")]
    TruncatedControlSequence {
        /// Offset at which bytes ran out.
        offset: usize,
    },

    /// A control sequence used an opcode we do not know.
    #[error("unknown control opcode {opcode:#04x} at offset {offset:#x}")]
    UnknownOpcode {
        /// The opcode byte.
        opcode: u8,
        /// Its offset.
        offset: usize,
    },

    /// The bytes after the last control sequence were not `0xff`.
    #[error("subpicture tail is not 0xff padding at offset {offset:#x}")]
    InvalidPadding {
        /// Offset of the first non-padding byte.
        offset: usize,
    },

    /// A command every subpicture needs never appeared.
    #[error("subpicture is missing a {field} command")]
    Incomplete {
        /// Which command was missing.
        field: &'static str,
    },

    /// The display rectangle is inverted.
    #[error("invalid display rectangle ({x1},{y1})-({x2},{y2})")]
    InvalidRectangle {
        /// Left edge.
        x1: u16,
        /// Top edge.
        y1: u16,
        /// Right edge (inclusive).
        x2: u16,
        /// Bottom edge (inclusive).
        y2: u16,
    },

    /// The RLE line offsets do not point into the pixel data.
    #[error("scan line offsets {first:#x} and {second:#x} do not fit the pixel data")]
    InvalidRleOffsets {
        /// Offset of the odd-line stream, from the SPU start.
        first: usize,
        /// Offset of the even-line stream, from the SPU start.
        second: usize,
    },

    /// The run-length data stopped in the middle of a codeword.
    #[error("run-length data ends in the middle of a code")]
    TruncatedRle,
}

/// A subpicture that was dropped from the output.
///
/// Bad subpictures have been observed in otherwise healthy discs, so a
/// single one never aborts the batch; it is reported here instead.
#[derive(Debug, Error)]
#[error("stream {stream_id}: subpicture at offset {offset:#x}: {source}")]
pub struct SkippedSpu {
    /// Subtitle stream the subpicture belonged to.
    pub stream_id: u8,
    /// Offset of the packet that started the subpicture.
    pub offset: u64,
    /// Why it was dropped.
    pub source: SpuError,
}
