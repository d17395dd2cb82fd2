//! Try to guess the types of files on disk.

use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::Path;

use crate::errors::Error;

/// Does the file at `path` begin with `magic`?  A file shorter than the
/// magic simply is not that kind of file.
fn has_magic(path: &Path, magic: &[u8]) -> Result<bool, Error> {
    let mut f = fs::File::open(path)
        .map_err(|source| Error::Open { path: path.to_owned(), source })?;
    let mut bytes = vec![0; magic.len()];
    match f.read_exact(&mut bytes) {
        Ok(()) => Ok(bytes == magic),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(source) => Err(Error::Read { path: path.to_owned(), source }),
    }
}

/// Does the specified path appear to point to an `*.idx` file?
pub fn is_idx_file<P: AsRef<Path>>(path: P) -> Result<bool, Error> {
    has_magic(path.as_ref(), b"# VobSub index file")
}

/// Does the specified path appear to point to a `*.sub` file?
///
/// Note that this may return false positives for other MPEG-2 Program
/// Stream data, which uses the same pack start code.
pub fn is_sub_file<P: AsRef<Path>>(path: P) -> Result<bool, Error> {
    has_magic(path.as_ref(), &[0x00, 0x00, 0x01, 0xba])
}

#[test]
fn probe_idx_files() {
    assert!(is_idx_file("fixtures/tiny.idx").unwrap());
    assert!(!is_idx_file("fixtures/tiny.sub").unwrap());
}

#[test]
fn probe_sub_files() {
    assert!(is_sub_file("fixtures/tiny.sub").unwrap());
    assert!(!is_sub_file("fixtures/tiny.idx").unwrap());
}
