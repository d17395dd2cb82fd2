//! Run-length decoding and rendering of subpicture bitmaps.
//!
//! The bitmap is stored as two independent streams of variable-length
//! codes, one for the even display rows and one for the odd rows
//! (DVDs are interlaced).  Each code is one to four nibbles long and
//! expands to a run of a single 2-bit color; a run length of zero fills
//! the rest of the line.  Every line starts byte-aligned.

use image::{Rgba, RgbaImage};

use crate::errors::SpuError;
use crate::idx::IdxMetadata;
use crate::nibble::NibbleCursor;
use crate::spu::Spu;

/// A run-length decoded value.
#[derive(Debug, PartialEq, Eq)]
struct Run {
    /// The 2-bit color index.
    color: u8,
    /// The number of times to repeat it.  A value of 0 indicates that
    /// we should fill to the end of the line.
    length: u16,
}

/// Decode the next codeword.
///
/// The nibble layout is:
///
/// ```text
/// 1 nibble:  rrcc
/// 2 nibbles: 00rr rrcc
/// 3 nibbles: 0000 rrrr rrcc
/// 4 nibbles: 0000 00rr rrrr rrcc
/// ```
///
/// A codeword cut short by the end of the stream is a zero run when the
/// nibbles read so far were all zero (trailing alignment slack decodes
/// this way), and an error otherwise.
fn decode_run(nibbles: &mut NibbleCursor) -> Result<Run, SpuError> {
    let Some(first) = nibbles.next() else {
        return Ok(Run { color: 0, length: 0 });
    };
    if first & 0b1100 != 0 {
        return Ok(Run { color: first & 0b0011, length: u16::from(first >> 2) });
    }
    let Some(second) = nibbles.next() else {
        if first != 0 {
            return Err(SpuError::TruncatedRle);
        }
        return Ok(Run { color: 0, length: 0 });
    };
    if first != 0 {
        return Ok(Run {
            color: second & 0b0011,
            length: u16::from((first & 0b0011) << 2 | second >> 2),
        });
    }
    let Some(third) = nibbles.next() else {
        if second != 0 {
            return Err(SpuError::TruncatedRle);
        }
        return Ok(Run { color: 0, length: 0 });
    };
    if second & 0b1100 != 0 {
        return Ok(Run {
            color: third & 0b0011,
            length: u16::from(second << 2 | third >> 2),
        });
    }
    let Some(fourth) = nibbles.next() else {
        if second != 0 || third != 0 {
            return Err(SpuError::TruncatedRle);
        }
        return Ok(Run { color: 0, length: 0 });
    };
    Ok(Run {
        color: fourth & 0b0011,
        length: u16::from(second) << 6 | u16::from(third) << 2 | u16::from(fourth >> 2),
    })
}

/// Decode one interlaced field into every second row of `img`,
/// starting at `first_row`.
fn decode_field(
    img: &mut RgbaImage,
    colors: &[Rgba<u8>; 4],
    data: &[u8],
    first_row: u32,
) -> Result<(), SpuError> {
    let width = img.width();
    let height = img.height();
    let mut nibbles = NibbleCursor::new(data);
    let mut x = 0;
    let mut y = first_row;
    if y >= height {
        return Ok(());
    }
    while !nibbles.ended() {
        let run = decode_run(&mut nibbles)?;
        let length = if run.length == 0 { width - x } else { u32::from(run.length) };
        for _ in 0..length {
            img.put_pixel(x, y, colors[usize::from(run.color)]);
            if x + 1 == width {
                // The line is full: jump to this field's next row and
                // discard whatever remains of the run.
                x = 0;
                y += 2;
                if y >= height {
                    return Ok(());
                }
                nibbles.align();
                break;
            }
            x += 1;
        }
    }
    Ok(())
}

/// Resolve the SPU's four colors against the `.idx` palette.
///
/// The palette command picks 16-color palette entries; the alpha
/// command scales each entry's master alpha by a 0..=15 nibble.
fn resolve_colors(spu: &Spu, metadata: &IdxMetadata) -> [Rgba<u8>; 4] {
    let mut colors = [Rgba([0, 0, 0, 0]); 4];
    for (i, color) in colors.iter_mut().enumerate() {
        let Rgba([r, g, b, master]) = metadata.palette[usize::from(spu.palette[i])];
        let alpha = (f64::from(master) * (f64::from(spu.alpha[i]) / 16.0)) as u8;
        *color = Rgba([r, g, b, alpha]);
    }
    colors
}

/// Render a parsed SPU to an RGBA image.
///
/// With `full_size` unset the image covers exactly the SPU's display
/// rectangle.  With it set, the image covers the whole screen declared
/// by the `.idx` file and the subtitle is placed at the metadata origin
/// plus its rectangle position; pixels falling off screen are clipped.
pub fn render(spu: &Spu, metadata: &IdxMetadata, full_size: bool) -> Result<RgbaImage, SpuError> {
    let colors = resolve_colors(spu, metadata);
    let (width, height) = spu.coordinates.size();
    let mut rect = RgbaImage::new(width, height);
    decode_field(&mut rect, &colors, &spu.pixel_data[spu.odd_offset..spu.even_offset], 0)?;
    decode_field(&mut rect, &colors, &spu.pixel_data[spu.even_offset..], 1)?;
    if !full_size {
        return Ok(rect);
    }

    let mut canvas = RgbaImage::new(metadata.width, metadata.height);
    let left = i64::from(metadata.origin.0) + i64::from(spu.coordinates.left());
    let top = i64::from(metadata.origin.1) + i64::from(spu.coordinates.top());
    for (x, y, pixel) in rect.enumerate_pixels() {
        let dx = left + i64::from(x);
        let dy = top + i64::from(y);
        if (0..i64::from(canvas.width())).contains(&dx)
            && (0..i64::from(canvas.height())).contains(&dy)
        {
            canvas.put_pixel(dx as u32, dy as u32, *pixel);
        }
    }
    Ok(canvas)
}

/// Encode a single run canonically, pushing nibbles.
#[cfg(test)]
fn encode_run(color: u8, length: u16, nibbles: &mut Vec<u8>) {
    let value = length << 2 | u16::from(color);
    let count = match length {
        1..=3 => 1,
        4..=15 => 2,
        16..=63 => 3,
        _ => 4,
    };
    for shift in (0..count).rev() {
        nibbles.push((value >> (shift * 4)) as u8 & 0x0f);
    }
}

/// Pack nibbles into bytes, padding the tail with a low zero nibble.
#[cfg(test)]
fn pack_nibbles(nibbles: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity((nibbles.len() + 1) / 2);
    for pair in nibbles.chunks(2) {
        bytes.push(pair[0] << 4 | pair.get(1).copied().unwrap_or(0));
    }
    bytes
}

#[test]
fn rle_codes_round_trip() {
    // The decoder must be a left inverse of the canonical encoder for
    // every code size.
    for color in 0..4u8 {
        for length in [1u16, 3, 4, 15, 16, 63, 64, 100, 255] {
            let mut nibbles = Vec::new();
            encode_run(color, length, &mut nibbles);
            if nibbles.len() % 2 == 1 {
                // Keep a second codeword after an odd-length one so the
                // packing slack cannot be mistaken for data.
                encode_run(color, length, &mut nibbles);
            }
            let data = pack_nibbles(&nibbles);
            let mut cursor = NibbleCursor::new(&data);
            assert_eq!(decode_run(&mut cursor).unwrap(), Run { color, length });
        }
    }
}

#[test]
fn rle_end_of_line_code() {
    // 00 00 00 03 => fill to end of line with color 3.
    let data = [0x00, 0x03];
    let mut cursor = NibbleCursor::new(&data);
    assert_eq!(decode_run(&mut cursor).unwrap(), Run { color: 3, length: 0 });
}

#[test]
fn rle_truncated_code_is_an_error() {
    // A lone 0x0 nibble pair decodes as slack, but a nonzero prefix
    // cut off mid-code does not.
    let data = [0x01];
    let mut cursor = NibbleCursor::new(&data);
    cursor.next().unwrap(); // consume the high nibble
    assert_eq!(decode_run(&mut cursor), Err(SpuError::TruncatedRle));
}

#[test]
fn decode_field_interlaces_rows() {
    let colors = [
        Rgba([0, 0, 0, 0]),
        Rgba([10, 10, 10, 255]),
        Rgba([20, 20, 20, 255]),
        Rgba([30, 30, 30, 255]),
    ];
    // 4x4 image: odd field paints rows 0 and 2, even field rows 1 and 3.
    let mut img = RgbaImage::new(4, 4);
    // Row 0: color 1 x4; row 2: color 2 x2, then fill with color 3.
    let mut nibbles = Vec::new();
    encode_run(1, 4, &mut nibbles); // 2 nibbles; line ends aligned
    encode_run(2, 2, &mut nibbles); // 1 nibble
    encode_run(3, 0, &mut nibbles); // end of line, 4 nibbles
    let odd = pack_nibbles(&nibbles);
    decode_field(&mut img, &colors, &odd, 0).unwrap();
    // Rows 1 and 3: a single full-width run each.
    let mut nibbles = Vec::new();
    encode_run(3, 4, &mut nibbles);
    encode_run(1, 4, &mut nibbles);
    let even = pack_nibbles(&nibbles);
    decode_field(&mut img, &colors, &even, 1).unwrap();

    let row = |y: u32| (0..4).map(|x| img.get_pixel(x, y).0[0]).collect::<Vec<_>>();
    assert_eq!(row(0), [10, 10, 10, 10]);
    assert_eq!(row(1), [30, 30, 30, 30]);
    assert_eq!(row(2), [20, 20, 30, 30]);
    assert_eq!(row(3), [10, 10, 10, 10]);
}

#[test]
fn render_tiny_spu() {
    let metadata = crate::idx::test_metadata();
    let spu = crate::spu::parse(&crate::spu::TINY_SPU).unwrap();
    let img = render(&spu, &metadata, false).unwrap();
    assert_eq!((img.width(), img.height()), (8, 2));
    // Pixel color 1 maps to palette entry 2, color 2 to entry 1, and
    // both carry alpha 15/16 of the master 255.
    assert_eq!(img.get_pixel(0, 0), &Rgba([0x80, 0x80, 0x80, 239]));
    assert_eq!(img.get_pixel(7, 0), &Rgba([0x80, 0x80, 0x80, 239]));
    assert_eq!(img.get_pixel(0, 1), &Rgba([0xff, 0xff, 0xff, 239]));
    assert_eq!(img.get_pixel(7, 1), &Rgba([0xff, 0xff, 0xff, 239]));
}

#[test]
fn render_full_size_places_at_origin() {
    let mut metadata = crate::idx::test_metadata();
    metadata.origin = (8, 16);
    let spu = crate::spu::parse(&crate::spu::TINY_SPU).unwrap();
    let img = render(&spu, &metadata, true).unwrap();
    assert_eq!((img.width(), img.height()), (720, 576));
    assert_eq!(img.get_pixel(0, 0), &Rgba([0, 0, 0, 0]));
    assert_eq!(img.get_pixel(8, 16), &Rgba([0x80, 0x80, 0x80, 239]));
    assert_eq!(img.get_pixel(15, 17), &Rgba([0xff, 0xff, 0xff, 239]));
    assert_eq!(img.get_pixel(16, 16), &Rgba([0, 0, 0, 0]));
}
