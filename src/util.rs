//! Miscellaneous utilities.

use std::fmt;

/// Wrapper to force a `&[u8]` to display as nicely-formatted hexadecimal
/// bytes, with only the first line or so of bytes shown.
pub struct BytesFormatter<'a>(pub &'a [u8]);

impl<'a> fmt::Debug for BytesFormatter<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let BytesFormatter(bytes) = *self;
        for byte in bytes.iter().take(16) {
            write!(f, "{:02x} ", byte)?;
        }
        if bytes.len() > 16 {
            write!(f, "... ")?;
        }
        write!(f, "({} bytes)", bytes.len())
    }
}

#[test]
fn format_bytes() {
    assert_eq!(format!("{:?}", BytesFormatter(&[0x00, 0xab])), "00 ab (2 bytes)");
    let long = [0u8; 20];
    assert!(format!("{:?}", BytesFormatter(&long)).ends_with("... (20 bytes)"));
}
