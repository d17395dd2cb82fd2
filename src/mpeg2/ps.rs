//! # MPEG-2 Program Streams (PS)
//!
//! This is the container format used at the top level of a `*.sub`
//! file: a sequence of packs, each carrying a clock reference and a PES
//! packet, with padding packets in between and a program-end code (or a
//! bare end of file, seen in the wild) at the end.

use std::fmt;

use log::trace;
use nom::bits::bits;
use nom::bits::complete::{tag as bit_tag, take as bit_take};
use nom::IResult;

use super::clock::{scr_and_ext, BitInput, Clock, Scr};
use super::pes;
use crate::errors::StreamError;
use crate::read::ReadAt;
use crate::util::BytesFormatter;

/// Stream ID marking the end of the program.
pub const STREAM_ID_PROGRAM_END: u8 = 0xb9;
/// Stream ID of a pack header.
pub const STREAM_ID_PACK: u8 = 0xba;
/// Stream ID of a Private Stream 1 packet (DVD subtitles, among others).
pub const STREAM_ID_PRIVATE_1: u8 = 0xbd;
/// Stream ID of a padding packet.
pub const STREAM_ID_PADDING: u8 = 0xbe;

/// Length of the pack header body following its start code.
const PACK_BODY_LEN: usize = 10;

/// A parsed [MPEG-2 Program Stream pack header][MPEG-PS].
///
/// [MPEG-PS]: https://en.wikipedia.org/wiki/MPEG_program_stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackHeader {
    /// The System Clock Reference and its extension.
    pub scr: Scr,
    /// The program mux rate, in units of 50 bytes per second.
    pub mux_rate: u32,
    /// How many stuffing bytes follow the header.
    pub stuffing_length: u8,
}

/// Parse the bit-packed body of a pack header.
fn pack_body(i: BitInput) -> IResult<BitInput, PackHeader> {
    // MPEG-2 version tag.
    let (i, _): (_, u8) = bit_tag(0b01, 2usize)(i)?;
    let (i, scr) = scr_and_ext(i)?;
    let (i, mux_rate): (_, u32) = bit_take(22usize)(i)?;
    // Marker bits.
    let (i, _): (_, u8) = bit_tag(0b11, 2usize)(i)?;
    // Reserved bits, then the stuffing length.
    let (i, _): (_, u8) = bit_take(5usize)(i)?;
    let (i, stuffing_length): (_, u8) = bit_take(3usize)(i)?;
    Ok((i, PackHeader { scr, mux_rate, stuffing_length }))
}

/// Decode a pack header body, validating every fixed bit and the mux
/// rate.  `offset` is the position of the pack's start code.
pub fn parse_pack_header(body: &[u8; PACK_BODY_LEN], offset: u64) -> Result<PackHeader, StreamError> {
    let parsed: IResult<&[u8], PackHeader> = bits(pack_body)(&body[..]);
    let (_, header) = parsed.map_err(|_| StreamError::InvalidPackFixedBits { offset })?;
    if header.mux_rate == 0 {
        return Err(StreamError::ZeroMuxRate { offset });
    }
    Ok(header)
}

/// Check a 4-byte start code and return its stream ID.
pub(crate) fn parse_start_code(bytes: [u8; 4], offset: u64) -> Result<u8, StreamError> {
    if bytes[0..3] != [0x00, 0x00, 0x01] {
        return Err(StreamError::InvalidStartCode { offset, bytes });
    }
    Ok(bytes[3])
}

/// A Private Stream 1 packet pulled out of the Program Stream.
#[derive(Clone, PartialEq, Eq)]
pub struct Private1Packet {
    /// Offset of the packet's start code in the stream.
    pub offset: u64,
    /// The substream ID byte (`0x20..=0x3f` for subtitles).
    pub substream_id: u8,
    /// The PES extension, including the PTS when present.
    pub extension: pes::Extension,
    /// The raw payload: one Subpicture Unit, or a fragment of one.
    pub payload: Vec<u8>,
}

impl Private1Packet {
    /// The packet's Presentation Time Stamp, if it carried one.
    pub fn pts(&self) -> Option<Clock> {
        self.extension.data.pts
    }
}

impl fmt::Debug for Private1Packet {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Private1Packet")
            .field("offset", &self.offset)
            .field("substream_id", &self.substream_id)
            .field("extension", &self.extension)
            .field("payload", &BytesFormatter(&self.payload))
            .finish()
    }
}

/// An iterator over the Private Stream 1 packets of a Program Stream.
///
/// Pack headers, stuffing and padding packets are consumed silently;
/// a program-end code or a clean end of data terminates the iteration.
/// After yielding an error the iterator is fused: the stream structure
/// cannot be trusted past that point.
pub struct Packets<'a, R: ?Sized> {
    src: &'a R,
    pos: u64,
    done: bool,
}

/// Iterate over the Private Stream 1 packets of `src`.
pub fn packets<R: ReadAt + ?Sized>(src: &R) -> Packets<R> {
    Packets { src, pos: 0, done: false }
}

impl<'a, R: ReadAt + ?Sized> Packets<'a, R> {
    /// Like [`packets`], but starting at an arbitrary packet boundary.
    pub fn starting_at(src: &'a R, pos: u64) -> Packets<'a, R> {
        Packets { src, pos, done: false }
    }

    /// The offset of the next packet boundary to be examined.
    pub fn position(&self) -> u64 {
        self.pos
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StreamError> {
        self.src.read_full(offset, buf).map_err(|source| StreamError::Io { offset, source })
    }

    fn read_exact(&self, offset: u64, buf: &mut [u8]) -> Result<(), StreamError> {
        let n = self.read(offset, buf)?;
        if n < buf.len() {
            return Err(StreamError::UnexpectedEof { offset: offset + n as u64 });
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<Option<Private1Packet>, StreamError> {
        loop {
            let mut start = [0u8; 4];
            let n = self.read(self.pos, &mut start)?;
            if n == 0 {
                // An implicit end of stream; seen in the wild.
                trace!("reached end of data at {:#x}", self.pos);
                return Ok(None);
            }
            if n < 4 {
                return Err(StreamError::UnexpectedEof { offset: self.pos + n as u64 });
            }
            match parse_start_code(start, self.pos)? {
                STREAM_ID_PROGRAM_END => {
                    trace!("program end at {:#x}", self.pos);
                    return Ok(None);
                }
                STREAM_ID_PADDING => self.skip_padding(self.pos)?,
                STREAM_ID_PACK => {
                    let pack_offset = self.pos;
                    let mut body = [0u8; PACK_BODY_LEN];
                    self.read_exact(pack_offset + 4, &mut body)?;
                    let header = parse_pack_header(&body, pack_offset)?;
                    trace!("pack at {:#x}: {:?}", pack_offset, header);
                    self.pos = pack_offset
                        + 4
                        + PACK_BODY_LEN as u64
                        + u64::from(header.stuffing_length);
                    // A PES packet follows the pack directly.
                    if let Some(packet) = self.pes_packet()? {
                        return Ok(Some(packet));
                    }
                }
                id => return Err(StreamError::UnexpectedStreamId { offset: self.pos, id }),
            }
        }
    }

    /// Parse the PES packet at the cursor.  Returns `None` for padding.
    fn pes_packet(&mut self) -> Result<Option<Private1Packet>, StreamError> {
        let pes_offset = self.pos;
        let mut prefix = [0u8; 6];
        self.read_exact(pes_offset, &mut prefix)?;
        let id = parse_start_code([prefix[0], prefix[1], prefix[2], prefix[3]], pes_offset)?;
        // The length counts every byte after this six-byte prefix.
        let packet_length = u16::from_be_bytes([prefix[4], prefix[5]]);
        let body_offset = pes_offset + 6;
        self.pos = body_offset + u64::from(packet_length);
        match id {
            STREAM_ID_PRIVATE_1 => {
                let mut body = vec![0u8; usize::from(packet_length)];
                self.read_exact(body_offset, &mut body)?;
                let (extension, consumed) = pes::parse_extension(&body, body_offset)?;
                let substream_offset = body_offset + consumed as u64;
                let (&substream_id, payload) = body[consumed..]
                    .split_first()
                    .ok_or(StreamError::UnexpectedEof { offset: self.pos })?;
                if !(0x20..=0x3f).contains(&substream_id) {
                    return Err(StreamError::UnexpectedStreamId {
                        offset: substream_offset,
                        id: substream_id,
                    });
                }
                let packet = Private1Packet {
                    offset: pes_offset,
                    substream_id,
                    extension,
                    payload: payload.to_vec(),
                };
                trace!("private1 packet: {:?}", packet);
                Ok(Some(packet))
            }
            STREAM_ID_PADDING => Ok(None),
            id => Err(StreamError::UnexpectedStreamId { offset: pes_offset, id }),
        }
    }

    /// Skip a padding packet starting at `offset`.
    fn skip_padding(&mut self, offset: u64) -> Result<(), StreamError> {
        let mut length = [0u8; 2];
        self.read_exact(offset + 4, &mut length)?;
        self.pos = offset + 6 + u64::from(u16::from_be_bytes(length));
        Ok(())
    }
}

impl<'a, R: ReadAt + ?Sized> Iterator for Packets<'a, R> {
    type Item = Result<Private1Packet, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(packet)) => Some(Ok(packet)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// A syntactically valid pack header body with SCR 0, mux rate 1 and no
/// stuffing.
#[cfg(test)]
pub(crate) const PACK_BODY: [u8; PACK_BODY_LEN] =
    [0x44, 0x00, 0x04, 0x00, 0x04, 0x01, 0x00, 0x00, 0x07, 0xf8];

/// Build a pack start code and header.
#[cfg(test)]
pub(crate) fn pack_bytes() -> Vec<u8> {
    let mut bytes = vec![0x00, 0x00, 0x01, STREAM_ID_PACK];
    bytes.extend_from_slice(&PACK_BODY);
    bytes
}

/// Build a Private Stream 1 packet with an optional PTS.
#[cfg(test)]
pub(crate) fn private1_bytes(pts: Option<u64>, substream_id: u8, payload: &[u8]) -> Vec<u8> {
    use super::clock::encode_pts;

    let mut bytes = vec![0x00, 0x00, 0x01, STREAM_ID_PRIVATE_1];
    let header_length: usize = if pts.is_some() { 5 } else { 0 };
    let packet_length = 3 + header_length + 1 + payload.len();
    bytes.extend_from_slice(&(packet_length as u16).to_be_bytes());
    bytes.push(0x81);
    bytes.push(if pts.is_some() { 0x80 } else { 0x00 });
    bytes.push(header_length as u8);
    if let Some(ticks) = pts {
        bytes.extend_from_slice(&encode_pts(ticks));
    }
    bytes.push(substream_id);
    bytes.extend_from_slice(payload);
    bytes
}

/// Build a padding packet with `length` bytes of stuffing.
#[cfg(test)]
pub(crate) fn padding_bytes(length: usize) -> Vec<u8> {
    let mut bytes = vec![0x00, 0x00, 0x01, STREAM_ID_PADDING];
    bytes.extend_from_slice(&(length as u16).to_be_bytes());
    bytes.extend(std::iter::repeat(0xff).take(length));
    bytes
}

/// The program-end code.
#[cfg(test)]
pub(crate) const PROGRAM_END: [u8; 4] = [0x00, 0x00, 0x01, STREAM_ID_PROGRAM_END];

#[test]
fn parse_pack_header_fields() {
    let header = parse_pack_header(&PACK_BODY, 0).unwrap();
    assert_eq!(header.scr.ticks(), 0);
    assert_eq!(header.mux_rate, 1);
    assert_eq!(header.stuffing_length, 0);

    let mut bad = PACK_BODY;
    bad[0] = 0x04; // version tag cleared
    assert!(matches!(
        parse_pack_header(&bad, 3),
        Err(StreamError::InvalidPackFixedBits { offset: 3 })
    ));

    let mut zero_rate = PACK_BODY;
    zero_rate[6] = 0x00;
    zero_rate[7] = 0x00;
    zero_rate[8] = 0x03;
    assert!(matches!(
        parse_pack_header(&zero_rate, 0),
        Err(StreamError::ZeroMuxRate { offset: 0 })
    ));
}

#[test]
fn program_end_yields_nothing() {
    let stream = PROGRAM_END;
    assert!(packets(&stream[..]).next().is_none());
}

#[test]
fn empty_stream_yields_nothing() {
    let stream: &[u8] = &[];
    assert!(packets(stream).next().is_none());
}

#[test]
fn padding_only_pack_yields_nothing() {
    let mut stream = pack_bytes();
    stream.extend_from_slice(&padding_bytes(4));
    stream.extend_from_slice(&PROGRAM_END);
    assert!(packets(&stream[..]).next().is_none());
}

#[test]
fn reject_unexpected_stream_id() {
    let stream = [0x00, 0x00, 0x01, 0xc0];
    let err = packets(&stream[..]).next().unwrap().unwrap_err();
    assert!(matches!(err, StreamError::UnexpectedStreamId { offset: 0, id: 0xc0 }));
}

#[test]
fn reject_invalid_start_code() {
    let stream = [0x00, 0x00, 0x02, 0xba];
    let err = packets(&stream[..]).next().unwrap().unwrap_err();
    assert!(matches!(err, StreamError::InvalidStartCode { offset: 0, .. }));
}

#[test]
fn reject_truncated_pack() {
    let stream = [0x00, 0x00, 0x01, 0xba, 0x44];
    let err = packets(&stream[..]).next().unwrap().unwrap_err();
    assert!(matches!(err, StreamError::UnexpectedEof { .. }));
}

#[test]
fn extract_private1_payload() {
    let mut stream = pack_bytes();
    stream.extend_from_slice(&private1_bytes(Some(180_000), 0x20, &[0xde, 0xad, 0xbe, 0xef]));
    stream.extend_from_slice(&PROGRAM_END);

    let packet = packets(&stream[..]).next().unwrap().unwrap();
    assert_eq!(packet.substream_id, 0x20);
    assert_eq!(packet.pts(), Some(Clock::from_ticks(180_000)));
    assert_eq!(packet.payload, [0xde, 0xad, 0xbe, 0xef]);
    assert_eq!(packet.offset, 14);
}

#[test]
fn reject_out_of_range_substream() {
    let mut stream = pack_bytes();
    stream.extend_from_slice(&private1_bytes(Some(90_000), 0x81, &[0x00]));
    let err = packets(&stream[..]).next().unwrap().unwrap_err();
    assert!(matches!(err, StreamError::UnexpectedStreamId { id: 0x81, .. }));
}

#[test]
fn rereading_from_reported_positions_is_idempotent() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut stream = Vec::new();
    for i in 0..3u64 {
        stream.extend_from_slice(&pack_bytes());
        stream.extend_from_slice(&private1_bytes(Some(90_000 * (i + 1)), 0x20, &[i as u8; 3]));
        stream.extend_from_slice(&padding_bytes(2));
    }
    stream.extend_from_slice(&PROGRAM_END);

    let mut walker = packets(&stream[..]);
    let mut found = Vec::new();
    let mut positions = vec![walker.position()];
    while let Some(packet) = walker.next() {
        found.push(packet.unwrap());
        positions.push(walker.position());
    }
    assert_eq!(found.len(), 3);

    for (skip, &pos) in positions.iter().enumerate() {
        let rest: Vec<_> = Packets::starting_at(&stream[..], pos)
            .map(|packet| packet.unwrap())
            .collect();
        assert_eq!(rest[..], found[skip..], "restart at {:#x}", pos);
    }
}
