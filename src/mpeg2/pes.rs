//! # MPEG-2 Packetized Elementary Stream (PES) extensions
//!
//! Private Stream 1 packets carry a three-byte extension header (two
//! flag bytes and a length) followed by a conditional data area.  The
//! flags say which of the optional fields are actually present; the
//! fields always appear in the same order, and whatever the declared
//! header length leaves unused must be `0xff` padding.
//!
//! See the [PES header documentation][PES] for the layout.
//!
//! [PES]: http://dvd.sourceforge.net/dvdinfo/pes-hdr.html

use nom::bits::bits;
use nom::bits::complete::{tag as bit_tag, take as bit_take};
use nom::combinator::map;
use nom::IResult;

use super::clock::{BitInput, Clock};
use crate::errors::StreamError;

/// Flags describing which conditional fields follow the extension
/// header.  These are the second flag byte, plus the PTS/DTS bits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DataFlags {
    /// A Presentation Time Stamp is present.
    pub pts: bool,
    /// A Decode Time Stamp is present.
    pub dts: bool,
    /// An Elementary Stream Clock Reference is present.
    pub escr: bool,
    /// An ES rate field is present.
    pub es_rate: bool,
    /// DSM trick mode is in effect.
    pub dsm_trick_mode: bool,
    /// Additional copy info is present.
    pub additional_copy_info: bool,
    /// The previous packet's CRC is present.
    pub crc: bool,
    /// A second extension follows the conditional fields.
    pub extension: bool,
}

/// The conditional fields of a PES extension, in wire order.
///
/// Only the PTS matters for subtitles, but the other fields still have
/// to be consumed to find the payload, so we keep what we read.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtensionData {
    /// Presentation Time Stamp.
    pub pts: Option<Clock>,
    /// Decode Time Stamp.
    pub dts: Option<Clock>,
    /// Elementary Stream Clock Reference, raw.
    pub escr: Option<[u8; 6]>,
    /// ES rate in units of 50 bytes per second, raw.
    pub es_rate: Option<[u8; 3]>,
    /// Additional copy info (7 value bits).
    pub additional_copy_info: Option<u8>,
    /// CRC of the previous packet.
    pub previous_packet_crc: Option<[u8; 2]>,
    /// PES private data from the second extension.
    pub private_data: Option<[u8; 16]>,
    /// Pack header field from the second extension.
    pub pack_header_field: Option<u8>,
    /// Program packet sequence counter from the second extension.
    pub program_packet_sequence_counter: Option<[u8; 2]>,
    /// P-STD buffer size from the second extension.
    pub p_std_buffer: Option<[u8; 2]>,
    /// Payload of the "PES extension 2" field.
    pub extension_2: Option<Vec<u8>>,
}

/// A parsed PES extension: the fixed flag bytes plus the data area.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Extension {
    /// Scrambling control bits.
    pub scrambling_control: u8,
    /// High-priority packet.
    pub priority: bool,
    /// The payload starts with a byte-aligned elementary stream.
    pub data_alignment_indicator: bool,
    /// The payload is copyrighted material.
    pub copyright: bool,
    /// The payload is an original, not a copy.
    pub original: bool,
    /// Which conditional fields were present.
    pub flags: DataFlags,
    /// The conditional fields themselves.
    pub data: ExtensionData,
}

/// Deserialize a single boolean flag bit.
fn bool_flag(i: BitInput) -> IResult<BitInput, bool> {
    map(bit_take(1usize), |bit: u8| bit == 1)(i)
}

/// Parse the two flag bytes of a PES extension, starting with the `10`
/// marker bits.
fn flag_bits(i: BitInput) -> IResult<BitInput, Extension> {
    let (i, _): (_, u8) = bit_tag(0b10, 2usize)(i)?;
    let (i, scrambling_control): (_, u8) = bit_take(2usize)(i)?;
    let (i, priority) = bool_flag(i)?;
    let (i, data_alignment_indicator) = bool_flag(i)?;
    let (i, copyright) = bool_flag(i)?;
    let (i, original) = bool_flag(i)?;
    let (i, pts) = bool_flag(i)?;
    let (i, dts) = bool_flag(i)?;
    let (i, escr) = bool_flag(i)?;
    let (i, es_rate) = bool_flag(i)?;
    let (i, dsm_trick_mode) = bool_flag(i)?;
    let (i, additional_copy_info) = bool_flag(i)?;
    let (i, crc) = bool_flag(i)?;
    let (i, extension) = bool_flag(i)?;
    Ok((
        i,
        Extension {
            scrambling_control,
            priority,
            data_alignment_indicator,
            copyright,
            original,
            flags: DataFlags {
                pts,
                dts,
                escr,
                es_rate,
                dsm_trick_mode,
                additional_copy_info,
                crc,
                extension,
            },
            data: ExtensionData::default(),
        },
    ))
}

/// Take the next `N` bytes of the extension data area.
fn take_bytes<'a, const N: usize>(
    data: &'a [u8],
    index: &mut usize,
    offset: u64,
) -> Result<&'a [u8; N], StreamError> {
    let eof = StreamError::UnexpectedEof { offset: offset + data.len() as u64 };
    let bytes = data.get(*index..*index + N).ok_or(eof)?;
    *index += N;
    // The length was just checked, so this conversion cannot fail.
    bytes.try_into().map_err(|_| StreamError::UnexpectedEof {
        offset: offset + data.len() as u64,
    })
}

/// Parse a PES extension from the start of a packet body.
///
/// `body` is the whole area counted by `packet_length`; `offset` is its
/// absolute position in the stream, for error reporting.  Returns the
/// extension and the number of bytes it occupied (three flag bytes plus
/// the declared data area).
pub fn parse_extension(body: &[u8], offset: u64) -> Result<(Extension, usize), StreamError> {
    if body.len() < 3 {
        return Err(StreamError::UnexpectedEof { offset: offset + body.len() as u64 });
    }
    let parsed: IResult<&[u8], Extension> = bits(flag_bits)(&body[..2]);
    let mut extension = match parsed {
        Ok((_, extension)) => extension,
        Err(_) => return Err(StreamError::InvalidPesExtensionMarker { offset }),
    };
    let header_length = usize::from(body[2]);
    let data = body
        .get(3..3 + header_length)
        .ok_or(StreamError::UnexpectedEof { offset: offset + body.len() as u64 })?;
    parse_extension_data(&mut extension, data, offset + 3)?;
    Ok((extension, 3 + header_length))
}

/// Consume the conditional fields selected by `extension.flags`, then
/// require the rest of the data area to be `0xff` padding.
fn parse_extension_data(
    extension: &mut Extension,
    data: &[u8],
    offset: u64,
) -> Result<(), StreamError> {
    let flags = extension.flags;
    let mut index = 0;
    if flags.pts {
        let bytes = take_bytes::<5>(data, &mut index, offset)?;
        extension.data.pts = Some(Clock::from_pts_bytes(bytes));
    }
    if flags.dts {
        let bytes = take_bytes::<5>(data, &mut index, offset)?;
        extension.data.dts = Some(Clock::from_pts_bytes(bytes));
    }
    if flags.escr {
        extension.data.escr = Some(*take_bytes::<6>(data, &mut index, offset)?);
    }
    if flags.es_rate {
        extension.data.es_rate = Some(*take_bytes::<3>(data, &mut index, offset)?);
    }
    if flags.additional_copy_info {
        let byte = take_bytes::<1>(data, &mut index, offset)?[0];
        if byte & 0x80 != 0x80 {
            return Err(StreamError::InvalidPesFixedBits { offset: offset + index as u64 - 1 });
        }
        extension.data.additional_copy_info = Some(byte & 0x7f);
    }
    if flags.crc {
        extension.data.previous_packet_crc = Some(*take_bytes::<2>(data, &mut index, offset)?);
    }
    if flags.extension {
        parse_second_extension(extension, data, &mut index, offset)?;
    }
    // The declared header length often exceeds the fields actually
    // present; everything left over must be padding.
    if let Some(bad) = data[index..].iter().position(|&byte| byte != 0xff) {
        return Err(StreamError::InvalidPesPadding { offset: offset + (index + bad) as u64 });
    }
    Ok(())
}

/// Consume the fields selected by a second-extension flag byte.
fn parse_second_extension(
    extension: &mut Extension,
    data: &[u8],
    index: &mut usize,
    offset: u64,
) -> Result<(), StreamError> {
    let flags = take_bytes::<1>(data, index, offset)?[0];
    if flags & 0x80 == 0x80 {
        extension.data.private_data = Some(*take_bytes::<16>(data, index, offset)?);
    }
    if flags & 0x40 == 0x40 {
        extension.data.pack_header_field = Some(take_bytes::<1>(data, index, offset)?[0]);
    }
    if flags & 0x20 == 0x20 {
        extension.data.program_packet_sequence_counter =
            Some(*take_bytes::<2>(data, index, offset)?);
    }
    if flags & 0x10 == 0x10 {
        extension.data.p_std_buffer = Some(*take_bytes::<2>(data, index, offset)?);
    }
    if flags & 0x0e != 0x0e {
        return Err(StreamError::InvalidPesFixedBits { offset: offset + *index as u64 - 1 });
    }
    if flags & 0x01 == 0x01 {
        let header = take_bytes::<2>(data, index, offset)?;
        let length = usize::from(header[0] & 0x7f);
        let eof = StreamError::UnexpectedEof { offset: offset + data.len() as u64 };
        let payload = data.get(*index..*index + length).ok_or(eof)?;
        *index += length;
        extension.data.extension_2 = Some(payload.to_vec());
    }
    Ok(())
}

#[cfg(test)]
use super::clock::encode_pts;

#[test]
fn parse_extension_with_pts() {
    // Flags declare a PTS; the data area holds it plus two padding bytes.
    let mut body = vec![0x81, 0x80, 0x07];
    body.extend_from_slice(&encode_pts(2_815_200));
    body.extend_from_slice(&[0xff, 0xff]);
    body.extend_from_slice(&[0x20, 0x00]); // payload, not part of the extension

    let (extension, consumed) = parse_extension(&body, 0).unwrap();
    assert_eq!(consumed, 10);
    assert!(extension.original);
    assert!(!extension.priority);
    assert_eq!(extension.data.pts, Some(Clock::from_ticks(2_815_200)));
    assert_eq!(extension.data.dts, None);
}

#[test]
fn parse_extension_without_timestamps() {
    let body = [0x81, 0x00, 0x00, 0x20];
    let (extension, consumed) = parse_extension(&body, 0).unwrap();
    assert_eq!(consumed, 3);
    assert_eq!(extension.data.pts, None);
}

#[test]
fn parse_extension_full_field_set() {
    // PTS + DTS + ESCR + ES rate + copy info + CRC + second extension
    // with private data, a pack header field, a sequence counter, a
    // P-STD buffer and a 2-byte "extension 2" payload.
    let mut body = vec![0x81, 0xff, 0x00];
    body.extend_from_slice(&encode_pts(900));
    body.extend_from_slice(&encode_pts(450));
    body.extend_from_slice(&[0x01; 6]); // ESCR
    body.extend_from_slice(&[0x02; 3]); // ES rate
    body.push(0x80 | 0x15); // additional copy info, fixed bit set
    body.extend_from_slice(&[0xab, 0xcd]); // CRC
    body.push(0xff); // second extension: everything present
    body.extend_from_slice(&[0x03; 16]); // private data
    body.push(0x42); // pack header field
    body.extend_from_slice(&[0x04; 2]); // sequence counter
    body.extend_from_slice(&[0x05; 2]); // P-STD
    body.extend_from_slice(&[0x82, 0x00]); // extension 2 header: 2 data bytes
    body.extend_from_slice(&[0x06, 0x07]); // extension 2 payload
    body[2] = (body.len() - 3) as u8;

    let (extension, consumed) = parse_extension(&body, 0).unwrap();
    assert_eq!(consumed, body.len());
    assert_eq!(extension.data.pts, Some(Clock::from_ticks(900)));
    assert_eq!(extension.data.dts, Some(Clock::from_ticks(450)));
    assert_eq!(extension.data.escr, Some([0x01; 6]));
    assert_eq!(extension.data.es_rate, Some([0x02; 3]));
    assert_eq!(extension.data.additional_copy_info, Some(0x15));
    assert_eq!(extension.data.previous_packet_crc, Some([0xab, 0xcd]));
    assert_eq!(extension.data.private_data, Some([0x03; 16]));
    assert_eq!(extension.data.pack_header_field, Some(0x42));
    assert_eq!(extension.data.program_packet_sequence_counter, Some([0x04; 2]));
    assert_eq!(extension.data.p_std_buffer, Some([0x05; 2]));
    assert_eq!(extension.data.extension_2.as_deref(), Some(&[0x06, 0x07][..]));
}

#[test]
fn reject_bad_marker() {
    let body = [0x41, 0x00, 0x00];
    assert!(matches!(
        parse_extension(&body, 7),
        Err(StreamError::InvalidPesExtensionMarker { offset: 7 })
    ));
}

#[test]
fn reject_bad_padding() {
    let body = [0x81, 0x00, 0x02, 0xff, 0x00];
    assert!(matches!(
        parse_extension(&body, 0),
        Err(StreamError::InvalidPesPadding { offset: 4 })
    ));
}

#[test]
fn reject_bad_copy_info_fixed_bit() {
    let body = [0x81, 0x04, 0x01, 0x15];
    assert!(matches!(
        parse_extension(&body, 0),
        Err(StreamError::InvalidPesFixedBits { .. })
    ));
}
