//! # Subpicture Unit parsing.
//!
//! A Subpicture Unit (SPU) is one on-screen caption: a 2-bit
//! run-length-encoded bitmap followed by a chain of control sequences
//! that pick palette entries, alpha levels, the display rectangle, the
//! RLE line offsets, and the start/stop times relative to the packet's
//! PTS.  For background, see [this documentation on the DVD subtitle
//! format][subs].
//!
//! [subs]: http://sam.zoy.org/writings/dvd/subtitles/

use std::collections::HashSet;
use std::time::Duration;

use log::trace;
use nom::bits::bits;
use nom::bits::complete::take as bit_take;
use nom::number::complete::be_u16;
use nom::IResult;

use crate::errors::{SpuError, StreamError};
use crate::mpeg2::clock::{BitInput, Clock};
use crate::mpeg2::ps::Private1Packet;

// Command opcodes of a control sequence.
const CMD_FORCE: u8 = 0x00;
const CMD_START_DATE: u8 = 0x01;
const CMD_STOP_DATE: u8 = 0x02;
const CMD_PALETTE: u8 = 0x03;
const CMD_ALPHA: u8 = 0x04;
const CMD_COORDINATES: u8 = 0x05;
const CMD_RLE_OFFSETS: u8 = 0x06;
const CMD_END: u8 = 0xff;

/// A reassembled Subpicture Unit, not yet parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSpu {
    /// Subtitle stream this SPU belongs to (substream ID minus `0x20`).
    pub stream_id: u8,
    /// Presentation Time Stamp of the packet that started the SPU.
    pub pts: Clock,
    /// Offset of that packet in the stream, for error reporting.
    pub offset: u64,
    /// The SPU bytes, concatenated across packets.
    pub data: Vec<u8>,
}

/// Glue split subtitle packets back into whole Subpicture Units.
///
/// A packet with a nonzero PTS starts a new SPU; a packet with a zero
/// (or absent) PTS continues the previous one.  Encoders split large
/// subtitles across sector-sized packets, and only the first fragment
/// gets a timestamp.
pub fn assemble(packets: Vec<Private1Packet>) -> Result<Vec<RawSpu>, StreamError> {
    let mut spus: Vec<RawSpu> = Vec::with_capacity(packets.len());
    for packet in packets {
        let ticks = packet.pts().map_or(0, Clock::ticks);
        if ticks != 0 {
            spus.push(RawSpu {
                stream_id: packet.substream_id - 0x20,
                pts: Clock::from_ticks(ticks),
                offset: packet.offset,
                data: packet.payload,
            });
        } else {
            let Some(last) = spus.last_mut() else {
                return Err(StreamError::DanglingContinuation { offset: packet.offset });
            };
            last.data.extend_from_slice(&packet.payload);
        }
    }
    Ok(spus)
}

/// Location at which to display the subtitle.  The right and bottom
/// edges are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coordinates {
    x1: u16,
    y1: u16,
    x2: u16,
    y2: u16,
}

impl Coordinates {
    /// The leftmost edge of the subtitle.
    pub fn left(&self) -> u16 {
        self.x1
    }

    /// The topmost edge of the subtitle.
    pub fn top(&self) -> u16 {
        self.y1
    }

    /// The width of the subtitle.
    pub fn width(&self) -> u16 {
        self.x2 + 1 - self.x1
    }

    /// The height of the subtitle.
    pub fn height(&self) -> u16 {
        self.y2 + 1 - self.y1
    }

    /// The size of the subtitle in pixels, as `u32` dimensions.
    pub(crate) fn size(&self) -> (u32, u32) {
        (cast::u32(self.width()), cast::u32(self.height()))
    }
}

/// Parse a 12-bit coordinate value.
fn coordinate(i: BitInput) -> IResult<BitInput, u16> {
    bit_take(12usize)(i)
}

/// Parse four packed 12-bit coordinates, in `x1 x2 y1 y2` order.
fn coordinates_body(i: BitInput) -> IResult<BitInput, Coordinates> {
    let (i, x1) = coordinate(i)?;
    let (i, x2) = coordinate(i)?;
    let (i, y1) = coordinate(i)?;
    let (i, y2) = coordinate(i)?;
    Ok((i, Coordinates { x1, y1, x2, y2 }))
}

/// Parse the 6-byte argument of a coordinates command.
fn coordinates(input: &[u8]) -> IResult<&[u8], Coordinates> {
    bits(coordinates_body)(input)
}

/// Parse the 4-byte argument of an RLE-offsets command.
fn rle_offsets(input: &[u8]) -> IResult<&[u8], [u16; 2]> {
    let (input, first) = be_u16(input)?;
    let (input, second) = be_u16(input)?;
    Ok((input, [first, second]))
}

/// Split a 2-byte nibble-packed argument into per-color values.
///
/// Pixel color `i` pairs with nibble `i` counted from the low end: for
/// args `b0 b1`, color 0 gets the low nibble of `b1` and color 3 the
/// high nibble of `b0`.
fn nibble_args(args: [u8; 2]) -> [u8; 4] {
    [args[1] & 0x0f, args[1] >> 4, args[0] & 0x0f, args[0] >> 4]
}

/// One control sequence: a date plus the commands it carried.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct ControlSequence {
    /// Delay in 1/100ths of a second after the SPU's PTS.
    date: u16,
    force: bool,
    start: bool,
    stop: bool,
    palette: Option<[u8; 4]>,
    alpha: Option<[u8; 4]>,
    coordinates: Option<Coordinates>,
    rle_offsets: Option<[u16; 2]>,
}

/// A fully parsed Subpicture Unit, ready to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spu<'a> {
    /// The RLE-compressed bitmap area.
    pub pixel_data: &'a [u8],
    /// Display delay of the subtitle, relative to its PTS.
    pub start_delay: Duration,
    /// Hide delay of the subtitle; zero when the SPU never said.
    pub stop_delay: Duration,
    /// Display this subtitle even when subtitles are turned off.
    pub force: bool,
    /// Palette indices for the four pixel colors.
    pub palette: [u8; 4],
    /// Alpha nibbles (0 transparent ..= 15 opaque) for the four colors.
    pub alpha: [u8; 4],
    /// Where on screen the subtitle goes.
    pub coordinates: Coordinates,
    /// Start of the odd-line RLE stream, relative to `pixel_data`.
    pub odd_offset: usize,
    /// Start of the even-line RLE stream, relative to `pixel_data`.
    pub even_offset: usize,
}

/// Parse a reassembled SPU buffer.
pub fn parse(data: &[u8]) -> Result<Spu, SpuError> {
    if data.len() < 4 {
        return Err(SpuError::TooShort { len: data.len() });
    }
    let declared = usize::from(u16::from_be_bytes([data[0], data[1]]));
    let control_offset = usize::from(u16::from_be_bytes([data[2], data[3]]));
    if declared != data.len() || control_offset > data.len() || control_offset < 4 {
        return Err(SpuError::LengthMismatch { declared, actual: data.len() });
    }
    let pixel_data = &data[4..control_offset];

    let sequences = walk_control_chain(data, control_offset)?;

    // Fold the chain into a render plan, later commands overriding
    // earlier ones.
    let mut start_delay = Duration::ZERO;
    let mut stop_delay = Duration::ZERO;
    let mut force = false;
    let mut palette = None;
    let mut alpha = None;
    let mut coordinates = None;
    let mut offsets = None;
    for sequence in &sequences {
        let delay = Duration::from_millis(u64::from(sequence.date) * 10);
        if sequence.start {
            start_delay = delay;
        } else if sequence.stop {
            stop_delay = delay;
        }
        force |= sequence.force;
        palette = sequence.palette.or(palette);
        alpha = sequence.alpha.or(alpha);
        coordinates = sequence.coordinates.or(coordinates);
        offsets = sequence.rle_offsets.or(offsets);
    }

    let palette = palette.ok_or(SpuError::Incomplete { field: "palette" })?;
    let alpha = alpha.ok_or(SpuError::Incomplete { field: "alpha" })?;
    let coordinates = coordinates.ok_or(SpuError::Incomplete { field: "coordinates" })?;
    let offsets = offsets.ok_or(SpuError::Incomplete { field: "rle-offsets" })?;

    if coordinates.x2 < coordinates.x1 || coordinates.y2 < coordinates.y1 {
        return Err(SpuError::InvalidRectangle {
            x1: coordinates.x1,
            y1: coordinates.y1,
            x2: coordinates.x2,
            y2: coordinates.y2,
        });
    }

    // The offsets count from the SPU start, but the bitmap slice starts
    // after the four header bytes.
    let first = cast::usize(offsets[0]);
    let second = cast::usize(offsets[1]);
    if first < 4 || second < first || second > control_offset {
        return Err(SpuError::InvalidRleOffsets { first, second });
    }

    Ok(Spu {
        pixel_data,
        start_delay,
        stop_delay,
        force,
        palette,
        alpha,
        coordinates,
        odd_offset: first - 4,
        even_offset: second - 4,
    })
}

/// Follow the chain of control sequences starting at `control_offset`.
///
/// Each sequence names the offset of the next one; a sequence naming
/// itself is the last.  The offsets are attacker-controlled, so the
/// walk keeps a visited set and a step bound instead of trusting them.
fn walk_control_chain(
    data: &[u8],
    control_offset: usize,
) -> Result<Vec<ControlSequence>, SpuError> {
    let mut sequences = Vec::with_capacity(2);
    let mut visited = HashSet::new();
    let max_sequences = data.len() / 4;
    let mut pos = control_offset;
    let end_of_chain = loop {
        if pos < control_offset || pos + 4 > data.len() {
            return Err(SpuError::ControlOffsetOutOfBounds { offset: pos });
        }
        if !visited.insert(pos) || sequences.len() >= max_sequences {
            return Err(SpuError::ControlChainLoop { offset: pos });
        }
        let date = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let next = usize::from(u16::from_be_bytes([data[pos + 2], data[pos + 3]]));
        let (sequence, commands_end) = parse_commands(data, pos, date)?;
        trace!("control sequence at {:#x}: {:?}", pos, sequence);
        sequences.push(sequence);
        if next == pos {
            // The terminator points back at itself.
            break commands_end;
        }
        pos = next;
    };
    // Whatever follows the last sequence must be padding.
    if let Some(bad) = data[end_of_chain..].iter().position(|&byte| byte != 0xff) {
        return Err(SpuError::InvalidPadding { offset: end_of_chain + bad });
    }
    Ok(sequences)
}

/// Parse the command list of the sequence at `pos`, returning the
/// sequence and the offset just past its end command.
fn parse_commands(
    data: &[u8],
    pos: usize,
    date: u16,
) -> Result<(ControlSequence, usize), SpuError> {
    let mut sequence = ControlSequence { date, ..ControlSequence::default() };
    let mut index = pos + 4;
    loop {
        let &opcode = data
            .get(index)
            .ok_or(SpuError::TruncatedControlSequence { offset: index })?;
        index += 1;
        match opcode {
            CMD_FORCE => sequence.force = true,
            CMD_START_DATE => sequence.start = true,
            CMD_STOP_DATE => sequence.stop = true,
            CMD_PALETTE => {
                sequence.palette = Some(nibble_args(command_args::<2>(data, &mut index)?));
            }
            CMD_ALPHA => {
                sequence.alpha = Some(nibble_args(command_args::<2>(data, &mut index)?));
            }
            CMD_COORDINATES => {
                let args = command_args::<6>(data, &mut index)?;
                // Six bytes always parse; the error type is only for nom.
                let (_, coordinates) = coordinates(&args)
                    .map_err(|_| SpuError::TruncatedControlSequence { offset: index })?;
                sequence.coordinates = Some(coordinates);
            }
            CMD_RLE_OFFSETS => {
                let args = command_args::<4>(data, &mut index)?;
                let (_, offsets) = rle_offsets(&args)
                    .map_err(|_| SpuError::TruncatedControlSequence { offset: index })?;
                sequence.rle_offsets = Some(offsets);
            }
            CMD_END => return Ok((sequence, index)),
            opcode => return Err(SpuError::UnknownOpcode { opcode, offset: index - 1 }),
        }
    }
}

/// Take the fixed-size argument block of a command.
fn command_args<const N: usize>(data: &[u8], index: &mut usize) -> Result<[u8; N], SpuError> {
    let args = data
        .get(*index..*index + N)
        .ok_or(SpuError::TruncatedControlSequence { offset: data.len() })?;
    *index += N;
    // Length is checked above.
    args.try_into()
        .map_err(|_| SpuError::TruncatedControlSequence { offset: data.len() })
}

/// A small SPU used by the tests: an 8x2 bitmap with two control
/// sequences (start with all render commands, then a stop at +800 ms).
#[cfg(test)]
pub(crate) const TINY_SPU: [u8; 36] = [
    0x00, 0x24, // total size
    0x00, 0x06, // control chain offset
    0x21, 0x22, // pixel data: one run per field
    0x00, 0x00, // sequence 0: date 0
    0x00, 0x1e, // next sequence at 0x1e
    0x01, // start date
    0x03, 0x01, 0x23, // palette
    0x04, 0xff, 0xf0, // alpha
    0x05, 0x00, 0x00, 0x07, 0x00, 0x00, 0x01, // rectangle (0,0)-(7,1)
    0x06, 0x00, 0x04, 0x00, 0x05, // RLE offsets
    0xff, // end
    0x00, 0x50, // sequence 1: date 80 (800 ms)
    0x00, 0x1e, // next points at itself: last sequence
    0x02, // stop date
    0xff, // end
];

#[test]
fn parse_tiny_spu() {
    let _ = env_logger::builder().is_test(true).try_init();

    let spu = parse(&TINY_SPU).unwrap();
    assert_eq!(spu.pixel_data, &[0x21, 0x22]);
    assert_eq!(spu.start_delay, Duration::ZERO);
    assert_eq!(spu.stop_delay, Duration::from_millis(800));
    assert!(!spu.force);
    assert_eq!(spu.palette, [0x3, 0x2, 0x1, 0x0]);
    assert_eq!(spu.alpha, [0x0, 0xf, 0xf, 0xf]);
    assert_eq!(spu.coordinates, Coordinates { x1: 0, y1: 0, x2: 7, y2: 1 });
    assert_eq!((spu.coordinates.width(), spu.coordinates.height()), (8, 2));
    assert_eq!(spu.odd_offset, 0);
    assert_eq!(spu.even_offset, 1);
}

#[test]
fn parse_force_flag() {
    let mut data = TINY_SPU;
    // Rewrite the stop command of the second sequence into a
    // force-display command.
    data[34] = 0x00;
    let spu = parse(&data).unwrap();
    assert!(spu.force);
    assert_eq!(spu.stop_delay, Duration::ZERO);
}

#[test]
fn reject_length_mismatch() {
    let mut data = TINY_SPU.to_vec();
    data.push(0xff);
    assert_eq!(
        parse(&data),
        Err(SpuError::LengthMismatch { declared: 36, actual: 37 })
    );
}

#[test]
fn reject_bad_padding() {
    let mut data = TINY_SPU;
    data[35] = 0xfe; // corrupt the end command of the last sequence
    assert_eq!(parse(&data), Err(SpuError::UnknownOpcode { opcode: 0xfe, offset: 35 }));

    let mut data = TINY_SPU.to_vec();
    data[1] = 0x26; // declare two extra bytes...
    data.extend_from_slice(&[0x00, 0xfe]); // ...that are not padding
    assert_eq!(parse(&data), Err(SpuError::InvalidPadding { offset: 36 }));
}

#[test]
fn reject_missing_commands() {
    // A single sequence with only a start date.
    let data = [
        0x00, 0x0b, // size
        0x00, 0x04, // control chain right after the header
        0x00, 0x00, 0x00, 0x04, // date 0, next = self
        0x01, 0xff, // start date, end
        0xff, // padding
    ];
    assert_eq!(parse(&data), Err(SpuError::Incomplete { field: "palette" }));
}

#[test]
fn reject_control_chain_loop() {
    let mut data = TINY_SPU;
    // Point the second sequence's next offset back at the first.
    data[32] = 0x00;
    data[33] = 0x06;
    assert_eq!(parse(&data), Err(SpuError::ControlChainLoop { offset: 6 }));
}

#[test]
fn reject_out_of_bounds_chain() {
    let mut data = TINY_SPU;
    data[8] = 0xff; // next offset far past the end
    data[9] = 0xff;
    assert_eq!(parse(&data), Err(SpuError::ControlOffsetOutOfBounds { offset: 0xffff }));
}

#[test]
fn assemble_concatenates_continuations() {
    use crate::mpeg2::pes::Extension;

    let starter = Private1Packet {
        offset: 0,
        substream_id: 0x21,
        extension: Extension {
            data: crate::mpeg2::pes::ExtensionData {
                pts: Some(Clock::from_ticks(90_000)),
                ..Default::default()
            },
            ..Default::default()
        },
        payload: vec![1, 2, 3],
    };
    let continuation = Private1Packet {
        offset: 50,
        substream_id: 0x21,
        extension: Extension::default(),
        payload: vec![4, 5],
    };

    let spus = assemble(vec![starter.clone(), continuation.clone()]).unwrap();
    assert_eq!(spus.len(), 1);
    assert_eq!(spus[0].stream_id, 1);
    assert_eq!(spus[0].pts, Clock::from_ticks(90_000));
    assert_eq!(spus[0].data, [1, 2, 3, 4, 5]);

    let err = assemble(vec![continuation]).unwrap_err();
    assert!(matches!(err, StreamError::DanglingContinuation { offset: 50 }));
}
