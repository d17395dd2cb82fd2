//! Clock values recovered from the stream.
//!
//! Presentation Time Stamps run on a 90 kHz clock, while the pack-level
//! System Clock Reference runs on a 27 MHz clock and is stored as a
//! 33-bit base (in 90 kHz units) plus a 9-bit extension counting
//! 1/300ths of a tick.

use std::fmt;
use std::time::Duration;

use nom::bits::complete::{tag as bit_tag, take as bit_take};
use nom::IResult;

/// The 90 kHz clock frequency used by PTS and DTS values.
pub const PTS_CLOCK_HZ: u64 = 90_000;

/// The 27 MHz clock frequency used by SCR values.
pub const SYSTEM_CLOCK_HZ: u64 = 27_000_000;

/// Input to a bit-level `nom` parser.
pub(crate) type BitInput<'a> = (&'a [u8], usize);

/// A 33-bit, 90 kHz Presentation Time Stamp value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Clock {
    ticks: u64,
}

impl Clock {
    /// Build a clock from a raw 90 kHz tick count.
    pub fn from_ticks(ticks: u64) -> Clock {
        Clock { ticks }
    }

    /// Assemble a clock from the five PTS/DTS bytes of a PES extension.
    ///
    /// The value bits live at fixed positions: bits 3..1 of the first
    /// byte are ticks 32..30, then whole bytes and 7-bit groups follow.
    /// The surrounding prefix and marker bits are ignored, as the
    /// encoders observed in the wild do not always set them correctly.
    pub fn from_pts_bytes(bytes: &[u8; 5]) -> Clock {
        let mut ticks = (u64::from(bytes[0] & 0x0e) >> 1) << 30;
        ticks |= u64::from(bytes[1]) << 22;
        ticks |= (u64::from(bytes[2] & 0xfe) >> 1) << 15;
        ticks |= u64::from(bytes[3]) << 7;
        ticks |= u64::from(bytes[4] & 0xfe) >> 1;
        Clock { ticks }
    }

    /// The raw 90 kHz tick count.
    pub fn ticks(self) -> u64 {
        self.ticks
    }

    /// Convert to a duration since the start of the stream clock.
    pub fn as_duration(self) -> Duration {
        Duration::from_nanos(self.ticks * 1_000_000_000 / PTS_CLOCK_HZ)
    }
}

impl fmt::Display for Clock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let millis = self.ticks / (PTS_CLOCK_HZ / 1000);
        let h = millis / 3_600_000;
        let m = millis / 60_000 % 60;
        let s = millis / 1000 % 60;
        let ms = millis % 1000;
        write!(f, "{}:{:02}:{:02}.{:03}", h, m, s, ms)
    }
}

/// A System Clock Reference: a 33-bit base plus a 9-bit extension.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Scr {
    base: u64,
    ext: u16,
}

impl Scr {
    /// The full 27 MHz tick count.
    pub fn ticks(self) -> u64 {
        self.base * 300 + u64::from(self.ext)
    }

    /// Convert to a duration since the start of the stream clock.
    pub fn as_duration(self) -> Duration {
        Duration::from_nanos(self.ticks() * 1_000 / (SYSTEM_CLOCK_HZ / 1_000_000))
    }
}

/// Parse a single `1` marker bit.
fn marker(i: BitInput) -> IResult<BitInput, u8> {
    bit_tag(0b1, 1usize)(i)
}

/// Parse a 33-bit SCR base, its 9-bit extension and the 4 interleaved
/// marker bits, consuming 46 bits.  Unlike the PTS codec, this
/// validates the marker bits: a pack header with bad fixed bits is not
/// a pack header.
pub(crate) fn scr_and_ext(i: BitInput) -> IResult<BitInput, Scr> {
    let (i, hi): (_, u64) = bit_take(3usize)(i)?;
    let (i, _) = marker(i)?;
    let (i, mid): (_, u64) = bit_take(15usize)(i)?;
    let (i, _) = marker(i)?;
    let (i, lo): (_, u64) = bit_take(15usize)(i)?;
    let (i, _) = marker(i)?;
    let (i, ext): (_, u16) = bit_take(9usize)(i)?;
    let (i, _) = marker(i)?;
    Ok((i, Scr { base: hi << 30 | mid << 15 | lo, ext }))
}

/// Encode a 33-bit tick count as the five PTS bytes of a PES extension,
/// with the `0010` prefix and all marker bits set.
#[cfg(test)]
pub(crate) fn encode_pts(ticks: u64) -> [u8; 5] {
    [
        0x21 | ((((ticks >> 30) & 0x07) as u8) << 1),
        ((ticks >> 22) & 0xff) as u8,
        ((((ticks >> 15) & 0x7f) as u8) << 1) | 1,
        ((ticks >> 7) & 0xff) as u8,
        (((ticks & 0x7f) as u8) << 1) | 1,
    ]
}

#[test]
fn pts_round_trips() {
    for ticks in [0, 1, 180_000, 0x2bf20, 0x1_2345_6789 & 0x1_ffff_ffff, (1 << 33) - 1] {
        let bytes = encode_pts(ticks);
        assert_eq!(Clock::from_pts_bytes(&bytes).ticks(), ticks, "ticks {:#x}", ticks);
    }
}

#[test]
fn pts_to_duration() {
    assert_eq!(Clock::from_ticks(180_000).as_duration(), Duration::from_secs(2));
    assert_eq!(Clock::from_ticks(9).as_duration(), Duration::from_micros(100));
}

#[test]
fn parse_scr() {
    let input: BitInput = (&[0x44, 0x02, 0xc4, 0x82, 0x04, 0xa9][..], 2);
    let (rest, scr) = scr_and_ext(input).unwrap();
    assert_eq!(rest, (&[][..], 0));
    assert_eq!(scr, Scr { base: 88 << 15 | 4160, ext: 84 });
    // 300 times the base plus the extension, in 27 MHz ticks.
    assert_eq!(scr.ticks(), (88 << 15 | 4160) * 300 + 84);
}

#[test]
fn scr_to_duration() {
    let scr = Scr { base: 90_000, ext: 0 };
    assert_eq!(scr.as_duration(), Duration::from_secs(1));
}

#[test]
fn clock_display() {
    assert_eq!(Clock::from_ticks(90_000 * 3661 + 90).to_string(), "1:01:01.001");
}
