//! Parse a file in `*.idx` format.
//!
//! The sidecar is a line-oriented `key: value` text file describing how
//! the subtitles in the sibling `*.sub` file should be rendered: screen
//! size, origin offset, the 16-color palette, the master alpha, and a
//! global time offset.  Keys we do not consume are skipped.

use std::fmt;
use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use image::{Rgb, Rgba};
use lazy_static::lazy_static;
use log::trace;
use nom::bytes::complete::take_while_m_n;
use nom::combinator::{all_consuming, map, map_res};
use nom::sequence::tuple;
use nom::IResult;
use regex::Regex;

use crate::errors::Error;

/// The 16-color palette declared by an `*.idx` file, with each entry's
/// alpha channel preset to the master alpha.
pub type Palette = [Rgba<u8>; 16];

/// Parse two hex digits as a byte.
fn hex_byte(input: &str) -> IResult<&str, u8> {
    map_res(take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()), |digits| {
        u8::from_str_radix(digits, 16)
    })(input)
}

/// Parse a six-hex-digit RGB color.
fn rgb(input: &str) -> IResult<&str, Rgb<u8>> {
    map(tuple((hex_byte, hex_byte, hex_byte)), |(r, g, b)| Rgb([r, g, b]))(input)
}

/// Parse the 16 comma-separated colors of a `palette:` line.  Both
/// `", "` and `","` separators appear in the wild.
fn palette_line(value: &str) -> Result<[Rgb<u8>; 16], String> {
    let mut entries = Vec::with_capacity(16);
    for entry in value.split(',') {
        let entry = entry.trim();
        let (_, color) =
            all_consuming(rgb)(entry).map_err(|_| format!("invalid palette color {:?}", entry))?;
        entries.push(color);
    }
    entries
        .try_into()
        .map_err(|entries: Vec<Rgb<u8>>| {
            format!("palette must have 16 entries, found {}", entries.len())
        })
}

/// Rendering metadata read from an `*.idx` file.
#[derive(Debug, Clone, PartialEq)]
pub struct IdxMetadata {
    /// Screen width in pixels.
    pub width: u32,
    /// Screen height in pixels.
    pub height: u32,
    /// Origin offset applied to every subtitle rectangle.
    pub origin: (i32, i32),
    /// Master alpha ratio in `(0, 1]`.
    pub alpha: f64,
    /// Smoothing requested (not used by the renderer).
    pub smooth: bool,
    /// Fade-in time (not used by the renderer).
    pub fade_in: Duration,
    /// Fade-out time (not used by the renderer).
    pub fade_out: Duration,
    /// Raw alignment setting (not used by the renderer).
    pub align: Option<String>,
    /// Global shift applied to all subtitle times, in milliseconds.
    /// Negative values are allowed; times saturate at zero.
    pub time_offset_ms: i64,
    /// Only forced subtitles should be shown.
    pub forced_subs: bool,
    /// Index of the language this stream is for.
    pub lang_idx: usize,
    /// The 16-color palette, alpha premultiplied by [`IdxMetadata::alpha`].
    pub palette: Palette,
}

impl IdxMetadata {
    /// Read metadata from an `*.idx` file on disk.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<IdxMetadata, Error> {
        let path = path.as_ref();
        let f = fs::File::open(path)
            .map_err(|source| Error::Open { path: path.to_owned(), source })?;
        IdxMetadata::read(io::BufReader::new(f))
    }

    /// Read metadata from any line-oriented source.
    pub fn read<R: BufRead>(input: R) -> Result<IdxMetadata, Error> {
        lazy_static! {
            static ref KEY_VALUE: Regex = Regex::new("^([A-Za-z/ ]+): (.*)").unwrap();
        }

        let mut size = None;
        let mut origin = (0, 0);
        let mut alpha = None;
        let mut smooth = false;
        let mut fade_in = Duration::ZERO;
        let mut fade_out = Duration::ZERO;
        let mut align = None;
        let mut time_offset_ms = 0;
        let mut forced_subs = false;
        let mut lang_idx = 0;
        let mut colors: Option<[Rgb<u8>; 16]> = None;

        for (index, line) in input.lines().enumerate() {
            let line = line.map_err(|source| Error::IdxIo { source })?;
            let number = index + 1;
            let malformed = |reason: String| Error::MalformedIdx { line: number, reason };
            let Some(cap) = KEY_VALUE.captures(&line) else {
                continue;
            };
            let key = cap.get(1).map_or("", |m| m.as_str());
            let value = cap.get(2).map_or("", |m| m.as_str());
            match key {
                "size" => {
                    let (w, h) = value
                        .split_once('x')
                        .ok_or_else(|| malformed(format!("size must be WxH: {:?}", value)))?;
                    size = Some((
                        parse_num(w, number, "width")?,
                        parse_num(h, number, "height")?,
                    ));
                }
                "org" => {
                    let (x, y) = value
                        .split_once(',')
                        .ok_or_else(|| malformed(format!("org must be X, Y: {:?}", value)))?;
                    origin = (parse_num(x, number, "origin x")?, parse_num(y, number, "origin y")?);
                }
                "alpha" => {
                    let percent = value
                        .strip_suffix('%')
                        .ok_or_else(|| malformed(format!("alpha must end with '%': {:?}", value)))?;
                    let percent: i64 = parse_num(percent, number, "alpha")?;
                    if !(1..=100).contains(&percent) {
                        return Err(malformed(format!(
                            "alpha must be in (0, 100]: {}",
                            percent
                        )));
                    }
                    alpha = Some(f64::from(percent as i32) / 100.0);
                }
                "smooth" => smooth = parse_on_off(value, number, "smooth")?,
                "fadein/out" => {
                    let (fin, fout) = value
                        .split_once(',')
                        .ok_or_else(|| malformed(format!("fadein/out must be IN, OUT: {:?}", value)))?;
                    fade_in = Duration::from_millis(parse_num(fin, number, "fade in")?);
                    fade_out = Duration::from_millis(parse_num(fout, number, "fade out")?);
                }
                "align" => align = Some(value.to_owned()),
                "time offset" => time_offset_ms = parse_num(value, number, "time offset")?,
                "forced subs" => forced_subs = parse_on_off(value, number, "forced subs")?,
                "langidx" => lang_idx = parse_num(value, number, "langidx")?,
                "palette" => colors = Some(palette_line(value).map_err(malformed)?),
                _ => trace!("unimplemented idx key: {}", key),
            }
        }

        let (width, height) = size.ok_or(Error::MissingIdxKey { key: "size" })?;
        let colors = colors.ok_or(Error::MissingIdxKey { key: "palette" })?;
        // Every real .idx declares an alpha; default to opaque if not.
        let alpha = alpha.unwrap_or(1.0);
        let master = (255.0 * alpha) as u8;
        let mut palette = [Rgba([0, 0, 0, 0]); 16];
        for (out, Rgb([r, g, b])) in palette.iter_mut().zip(colors) {
            *out = Rgba([r, g, b, master]);
        }

        Ok(IdxMetadata {
            width,
            height,
            origin,
            alpha,
            smooth,
            fade_in,
            fade_out,
            align,
            time_offset_ms,
            forced_subs,
            lang_idx,
            palette,
        })
    }
}

/// Parse a trimmed numeric value, giving parse failures a line number.
fn parse_num<T: FromStr>(value: &str, line: usize, what: &str) -> Result<T, Error>
where
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|err| Error::MalformedIdx {
        line,
        reason: format!("invalid {}: {}", what, err),
    })
}

/// Parse an `ON`/`OFF` value.
fn parse_on_off(value: &str, line: usize, what: &str) -> Result<bool, Error> {
    match value.trim() {
        "ON" => Ok(true),
        "OFF" => Ok(false),
        other => Err(Error::MalformedIdx {
            line,
            reason: format!("{} must be ON or OFF: {:?}", what, other),
        }),
    }
}

/// Metadata equivalent to a minimal well-formed `.idx`, for tests.
#[cfg(test)]
pub(crate) fn test_metadata() -> IdxMetadata {
    let mut palette = [Rgba([0, 0, 0, 255]); 16];
    palette[1] = Rgba([0xff, 0xff, 0xff, 255]);
    palette[2] = Rgba([0x80, 0x80, 0x80, 255]);
    palette[3] = Rgba([0x40, 0x40, 0x40, 255]);
    IdxMetadata {
        width: 720,
        height: 576,
        origin: (0, 0),
        alpha: 1.0,
        smooth: false,
        fade_in: Duration::ZERO,
        fade_out: Duration::ZERO,
        align: None,
        time_offset_ms: 0,
        forced_subs: false,
        lang_idx: 0,
        palette,
    }
}

#[cfg(test)]
const SAMPLE_IDX: &str = "\
# VobSub index file, v7 (do not modify this line!)
size: 720x576
org: 10, -20
alpha: 50%
smooth: OFF
fadein/out: 50, 75
align: OFF at LEFT TOP
time offset: -250
forced subs: OFF
langidx: 2
palette: 000000, ffffff, 808080, 404040, 3333fa, 1111bb, fa3333, bb1111, 33fa33, 11bb11, fafa33, bbbb11, fa33fa, bb11bb, 33fafa, 11bbbb
id: en, index: 0
";

#[test]
fn parse_sample_idx() {
    let metadata = IdxMetadata::read(io::Cursor::new(SAMPLE_IDX)).unwrap();
    assert_eq!((metadata.width, metadata.height), (720, 576));
    assert_eq!(metadata.origin, (10, -20));
    assert_eq!(metadata.alpha, 0.5);
    assert!(!metadata.smooth);
    assert_eq!(metadata.fade_in, Duration::from_millis(50));
    assert_eq!(metadata.fade_out, Duration::from_millis(75));
    assert_eq!(metadata.align.as_deref(), Some("OFF at LEFT TOP"));
    assert_eq!(metadata.time_offset_ms, -250);
    assert!(!metadata.forced_subs);
    assert_eq!(metadata.lang_idx, 2);
    // A 50% master alpha premultiplies every palette entry.
    assert_eq!(metadata.palette[0], Rgba([0x00, 0x00, 0x00, 127]));
    assert_eq!(metadata.palette[1], Rgba([0xff, 0xff, 0xff, 127]));
    assert_eq!(metadata.palette[15], Rgba([0x11, 0xbb, 0xbb, 127]));
}

#[test]
fn missing_alpha_defaults_to_opaque() {
    let input = "size: 640x480\npalette: 000000, ffffff, 808080, 404040, 3333fa, 1111bb, \
                 fa3333, bb1111, 33fa33, 11bb11, fafa33, bbbb11, fa33fa, bb11bb, 33fafa, 11bbbb\n";
    let metadata = IdxMetadata::read(io::Cursor::new(input)).unwrap();
    assert_eq!(metadata.alpha, 1.0);
    assert_eq!(metadata.palette[1].0[3], 255);
}

#[test]
fn reject_malformed_alpha() {
    let input = "size: 640x480\nalpha: 150%\n";
    let err = IdxMetadata::read(io::Cursor::new(input)).unwrap_err();
    assert!(matches!(err, Error::MalformedIdx { line: 2, .. }));
}

#[test]
fn reject_short_palette() {
    let input = "size: 640x480\npalette: 000000, ffffff\n";
    let err = IdxMetadata::read(io::Cursor::new(input)).unwrap_err();
    assert!(matches!(err, Error::MalformedIdx { line: 2, .. }));
}

#[test]
fn reject_missing_palette() {
    let input = "size: 640x480\n";
    let err = IdxMetadata::read(io::Cursor::new(input)).unwrap_err();
    assert!(matches!(err, Error::MissingIdxKey { key: "palette" }));
}

#[test]
fn parse_hex_colors() {
    assert_eq!(rgb("1234ab"), Ok(("", Rgb([0x12, 0x34, 0xab]))));
    assert!(all_consuming(rgb)("12345").is_err());
    assert!(all_consuming(rgb)("12345g").is_err());
}
