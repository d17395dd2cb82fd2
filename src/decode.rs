//! Top-level decoding: compose the packetizer, the SPU reassembler, the
//! control-chain parser and the renderer into per-stream subtitle lists.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use image::RgbaImage;
use log::warn;

use crate::errors::{Error, SkippedSpu, SpuError};
use crate::idx::IdxMetadata;
use crate::img;
use crate::mpeg2::ps;
use crate::read::ReadAt;
use crate::spu::{self, Coordinates, RawSpu};

/// Gap left before the following subtitle when a stop time has to be
/// invented.  Anything shorter is unreadable anyway.
const MISSING_STOP_GAP: Duration = Duration::from_millis(100);

/// A single decoded subtitle.
pub struct Subtitle {
    start: Duration,
    stop: Duration,
    force: bool,
    coordinates: Coordinates,
    image: RgbaImage,
}

impl Subtitle {
    /// When the subtitle appears, measured from the start of the video.
    pub fn start(&self) -> Duration {
        self.start
    }

    /// When the subtitle disappears.
    pub fn stop(&self) -> Duration {
        self.stop
    }

    /// Should this subtitle be shown even when subtitles are off?
    pub fn force(&self) -> bool {
        self.force
    }

    /// The display rectangle the subtitle was encoded for.
    pub fn coordinates(&self) -> &Coordinates {
        &self.coordinates
    }

    /// The rendered image.
    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    /// Consume the subtitle, keeping only the rendered image.
    pub fn into_image(self) -> RgbaImage {
        self.image
    }
}

impl fmt::Debug for Subtitle {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Subtitle")
            .field("start", &self.start)
            .field("stop", &self.stop)
            .field("force", &self.force)
            .field("coordinates", &self.coordinates)
            .field("image", &format_args!("{}x{}", self.image.width(), self.image.height()))
            .finish()
    }
}

/// Everything recovered from a `*.sub`/`*.idx` pair.
pub struct Decoded {
    /// Decoded subtitles, grouped by subtitle stream ID.  Most files
    /// carry a single stream with ID 0.
    pub streams: BTreeMap<u8, Vec<Subtitle>>,
    /// Subpictures that could not be decoded.  Bad ones appear in
    /// otherwise healthy rips, so they are reported rather than fatal.
    pub skipped: Vec<SkippedSpu>,
}

impl fmt::Debug for Decoded {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Decoded")
            .field("streams", &self.streams)
            .field("skipped", &self.skipped)
            .finish()
    }
}

/// Decode every subtitle stream of a `*.sub` file.
///
/// The sibling `*.idx` file is found by swapping the extension.  With
/// `full_size_images` set, every subtitle is rendered onto a
/// screen-sized canvas at its on-screen position; otherwise each image
/// covers exactly its own display rectangle.
pub fn decode<P: AsRef<Path>>(sub_path: P, full_size_images: bool) -> Result<Decoded, Error> {
    let sub_path = sub_path.as_ref();
    if sub_path.extension() != Some(OsStr::new("sub")) {
        return Err(Error::NotASubFile { path: sub_path.to_owned() });
    }
    let metadata = IdxMetadata::open(sub_path.with_extension("idx"))?;
    let sub = fs::File::open(sub_path)
        .map_err(|source| Error::Open { path: sub_path.to_owned(), source })?;
    decode_source(&metadata, &sub, full_size_images)
}

/// Decode subtitle streams from an already-loaded source.
///
/// This is [`decode`] without the filesystem: callers supply the parsed
/// metadata and any [`ReadAt`] over the `*.sub` bytes.
pub fn decode_source<R: ReadAt + ?Sized>(
    metadata: &IdxMetadata,
    sub: &R,
    full_size_images: bool,
) -> Result<Decoded, Error> {
    let mut packets = Vec::new();
    for packet in ps::packets(sub) {
        packets.push(packet?);
    }
    let spus = spu::assemble(packets)?;

    let mut streams: BTreeMap<u8, Vec<Subtitle>> = BTreeMap::new();
    let mut skipped = Vec::new();
    for raw in &spus {
        match decode_spu(raw, metadata, full_size_images) {
            Ok(subtitle) => streams.entry(raw.stream_id).or_default().push(subtitle),
            Err(source) => {
                let skip = SkippedSpu { stream_id: raw.stream_id, offset: raw.offset, source };
                warn!("{}", skip);
                skipped.push(skip);
            }
        }
    }
    for subtitles in streams.values_mut() {
        fix_missing_stops(subtitles);
    }
    Ok(Decoded { streams, skipped })
}

/// Parse and render one reassembled SPU.
fn decode_spu(
    raw: &RawSpu,
    metadata: &IdxMetadata,
    full_size: bool,
) -> Result<Subtitle, SpuError> {
    let parsed = spu::parse(&raw.data)?;
    let image = img::render(&parsed, metadata, full_size)?;
    let base = raw.pts.as_duration();
    Ok(Subtitle {
        start: offset_time(base + parsed.start_delay, metadata.time_offset_ms),
        stop: offset_time(base + parsed.stop_delay, metadata.time_offset_ms),
        force: parsed.force,
        coordinates: parsed.coordinates,
        image,
    })
}

/// Apply the signed `.idx` time offset, saturating at zero.
fn offset_time(time: Duration, offset_ms: i64) -> Duration {
    if offset_ms >= 0 {
        time + Duration::from_millis(offset_ms as u64)
    } else {
        time.saturating_sub(Duration::from_millis(offset_ms.unsigned_abs()))
    }
}

/// Give subtitles without a stop-date command a usable stop time.
///
/// Some (rare) subtitles never say when to disappear, which leaves stop
/// equal to start.  Borrow the next subtitle's start, minus a readable
/// gap; if there is no next subtitle, or it starts too soon, leave the
/// subtitle alone.
fn fix_missing_stops(subtitles: &mut [Subtitle]) {
    for index in 0..subtitles.len() {
        if subtitles[index].stop != subtitles[index].start {
            continue;
        }
        let Some(next_start) = subtitles.get(index + 1).map(Subtitle::start) else {
            continue;
        };
        let candidate = next_start.saturating_sub(MISSING_STOP_GAP);
        if candidate > subtitles[index].start {
            subtitles[index].stop = candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idx::test_metadata;
    use crate::mpeg2::ps::{pack_bytes, private1_bytes, PROGRAM_END};
    use crate::spu::TINY_SPU;
    use image::Rgba;

    /// Like [`TINY_SPU`] but with no stop-date sequence at all.
    const NO_STOP_SPU: [u8; 30] = [
        0x00, 0x1e, // total size
        0x00, 0x06, // control chain offset
        0x21, 0x22, // pixel data
        0x00, 0x00, // date 0
        0x00, 0x06, // next points at itself: only sequence
        0x01, // start date
        0x03, 0x01, 0x23, // palette
        0x04, 0xff, 0xf0, // alpha
        0x05, 0x00, 0x00, 0x07, 0x00, 0x00, 0x01, // rectangle (0,0)-(7,1)
        0x06, 0x00, 0x04, 0x00, 0x05, // RLE offsets
        0xff, // end
    ];

    /// Wrap each `(pts, payload)` pair in a pack + PES packet.
    fn build_stream(packets: &[(Option<u64>, &[u8])]) -> Vec<u8> {
        let mut stream = Vec::new();
        for &(pts, payload) in packets {
            stream.extend_from_slice(&pack_bytes());
            stream.extend_from_slice(&private1_bytes(pts, 0x20, payload));
        }
        stream.extend_from_slice(&PROGRAM_END);
        stream
    }

    #[test]
    fn decode_two_subtitles() {
        let _ = env_logger::builder().is_test(true).try_init();

        // The second SPU arrives split across two packets; only the
        // first fragment has a PTS.
        let stream = build_stream(&[
            (Some(180_000), &TINY_SPU),
            (Some(360_000), &TINY_SPU[..20]),
            (None, &TINY_SPU[20..]),
        ]);
        let decoded = decode_source(&test_metadata(), &stream[..], false).unwrap();
        assert!(decoded.skipped.is_empty());
        assert_eq!(decoded.streams.len(), 1);

        let subs = &decoded.streams[&0];
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].start(), Duration::from_secs(2));
        assert_eq!(subs[0].stop(), Duration::from_millis(2800));
        assert_eq!(subs[1].start(), Duration::from_secs(4));
        assert_eq!(subs[1].stop(), Duration::from_millis(4800));
        assert!(!subs[0].force());
        assert_eq!(subs[0].coordinates().width(), 8);

        // Starts are non-decreasing within the stream.
        assert!(subs.windows(2).all(|pair| pair[0].start() <= pair[1].start()));

        let img = subs[0].image();
        assert_eq!((img.width(), img.height()), (8, 2));
        assert_eq!(img.get_pixel(0, 0), &Rgba([0x80, 0x80, 0x80, 239]));
        assert_eq!(img.get_pixel(0, 1), &Rgba([0xff, 0xff, 0xff, 239]));
    }

    #[test]
    fn bad_spu_is_skipped_not_fatal() {
        // Declare two extra bytes that are not 0xff padding.
        let mut corrupt = TINY_SPU.to_vec();
        corrupt[1] = 0x26;
        corrupt.extend_from_slice(&[0x00, 0xfe]);

        let stream = build_stream(&[
            (Some(180_000), &corrupt),
            (Some(360_000), &TINY_SPU),
        ]);
        let decoded = decode_source(&test_metadata(), &stream[..], false).unwrap();
        assert_eq!(decoded.streams[&0].len(), 1);
        assert_eq!(decoded.skipped.len(), 1);
        assert_eq!(decoded.skipped[0].stream_id, 0);
        assert_eq!(decoded.skipped[0].source, SpuError::InvalidPadding { offset: 36 });
    }

    #[test]
    fn missing_stop_borrows_next_start() {
        let stream = build_stream(&[
            (Some(180_000), &NO_STOP_SPU),
            (Some(360_000), &TINY_SPU),
        ]);
        let decoded = decode_source(&test_metadata(), &stream[..], false).unwrap();
        let subs = &decoded.streams[&0];
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].start(), Duration::from_secs(2));
        assert_eq!(subs[0].stop(), Duration::from_millis(3900));
    }

    #[test]
    fn missing_stop_without_successor_is_left_alone() {
        let stream = build_stream(&[(Some(180_000), &NO_STOP_SPU)]);
        let decoded = decode_source(&test_metadata(), &stream[..], false).unwrap();
        let subs = &decoded.streams[&0];
        assert_eq!(subs[0].stop(), subs[0].start());
    }

    #[test]
    fn negative_time_offset_saturates() {
        let mut metadata = test_metadata();
        metadata.time_offset_ms = -2500;
        let stream = build_stream(&[(Some(180_000), &TINY_SPU)]);
        let decoded = decode_source(&metadata, &stream[..], false).unwrap();
        let subs = &decoded.streams[&0];
        assert_eq!(subs[0].start(), Duration::ZERO);
        assert_eq!(subs[0].stop(), Duration::from_millis(300));
    }

    #[test]
    fn dangling_continuation_is_fatal() {
        let stream = build_stream(&[(None, &TINY_SPU[20..])]);
        let err = decode_source(&test_metadata(), &stream[..], false).unwrap_err();
        assert!(matches!(
            err,
            Error::Stream(crate::errors::StreamError::DanglingContinuation { .. })
        ));
    }

    #[test]
    fn streams_are_grouped_by_substream() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&pack_bytes());
        stream.extend_from_slice(&private1_bytes(Some(180_000), 0x21, &TINY_SPU));
        stream.extend_from_slice(&pack_bytes());
        stream.extend_from_slice(&private1_bytes(Some(180_000), 0x23, &TINY_SPU));
        stream.extend_from_slice(&PROGRAM_END);

        let decoded = decode_source(&test_metadata(), &stream[..], false).unwrap();
        assert_eq!(decoded.streams.keys().copied().collect::<Vec<_>>(), [1, 3]);
    }
}
