//! This crate decodes DVD subtitles in VobSub format.  These are typically
//! stored as two sibling files: a textual `*.idx` file carrying rendering
//! metadata (screen size, origin, palette, master alpha, time offset), and
//! a binary `*.sub` file holding an MPEG-2 Program Stream whose Private
//! Stream 1 packets carry the actual subtitle bitmaps.
//!
//! ## Example code
//!
//! ```no_run
//! let decoded = subpicture::decode("movie.sub", false)?;
//! for (stream_id, subtitles) in &decoded.streams {
//!     for sub in subtitles {
//!         println!("stream {}: {:?} - {:?}", stream_id, sub.start(), sub.stop());
//!         // `sub.image()` is an `image::RgbaImage` ready to composite.
//!     }
//! }
//! for skipped in &decoded.skipped {
//!     eprintln!("skipped one bad subpicture: {}", skipped);
//! }
//! # Ok::<(), subpicture::Error>(())
//! ```
//!
//! ## Background & References
//!
//! The binary `*.sub` file is essentially an MPEG-2 Program Stream
//! containing Packetized Elementary Stream data for one or more subtitle
//! tracks.  Each subtitle is a Subpicture Unit: a run-length-encoded
//! 2-bit bitmap plus a chain of control sequences selecting palette
//! entries, alpha levels, the display rectangle and timing.
//!
//! Useful references include:
//!
//! - [Program Stream](https://en.wikipedia.org/wiki/MPEG_program_stream) (PS)
//! - [Packetized Elementary Stream][PES] (PES)
//! - [DVD subtitles](http://sam.zoy.org/writings/dvd/subtitles/)
//!
//! [PES]: http://dvd.sourceforge.net/dvdinfo/pes-hdr.html
//!
//! ## Limitations
//!
//! This library decodes subtitle streams offline; it does not encode or
//! mux VobSub data, perform OCR on the bitmaps, or schedule playback.

#![warn(missing_docs)]

mod decode;
mod errors;
mod idx;
mod img;
pub mod mpeg2;
mod nibble;
mod probe;
mod read;
mod spu;
mod util;

pub use crate::decode::{decode, decode_source, Decoded, Subtitle};
pub use crate::errors::{Error, SkippedSpu, SpuError, StreamError};
pub use crate::idx::{IdxMetadata, Palette};
pub use crate::probe::{is_idx_file, is_sub_file};
pub use crate::read::ReadAt;
pub use crate::spu::Coordinates;
