//! Random-access byte sources.
//!
//! The packetizer dispatches on offsets it computes from header fields,
//! so it wants positioned reads rather than a sequential `Read`.  A
//! whole `*.sub` file therefore never needs to be resident: a plain
//! `fs::File` works as a source, and in-memory slices work for tests and
//! callers that already hold the data.

use std::fs;
use std::io;

/// A byte source supporting reads at arbitrary offsets.
pub trait ReadAt {
    /// Read bytes starting at `offset` into `buf`, returning how many
    /// were read.  A return of `Ok(0)` means `offset` is at or past the
    /// end of the source.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Read bytes at `offset` until `buf` is full or the source ends,
    /// returning how many bytes were read.  Unlike [`ReadAt::read_at`],
    /// a short count here always means end of data.
    fn read_full(&self, mut offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut read = 0;
        while read < buf.len() {
            match self.read_at(offset, &mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => {
                    read += n;
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(read)
    }
}

impl ReadAt for [u8] {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let Ok(offset) = usize::try_from(offset) else {
            return Ok(0);
        };
        if offset >= self.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.len() - offset);
        buf[..n].copy_from_slice(&self[offset..offset + n]);
        Ok(n)
    }
}

#[cfg(unix)]
impl ReadAt for fs::File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }
}

#[cfg(windows)]
impl ReadAt for fs::File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buf, offset)
    }
}

impl<'a, R: ReadAt + ?Sized> ReadAt for &'a R {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }
}

#[test]
fn read_slices_at_offsets() {
    let data: &[u8] = &[1, 2, 3, 4, 5];
    let mut buf = [0u8; 3];
    assert_eq!(data.read_at(1, &mut buf).unwrap(), 3);
    assert_eq!(buf, [2, 3, 4]);
    assert_eq!(data.read_at(4, &mut buf).unwrap(), 1);
    assert_eq!(data.read_at(5, &mut buf).unwrap(), 0);
    assert_eq!(data.read_at(u64::MAX, &mut buf).unwrap(), 0);
}

#[test]
fn read_full_reports_short_reads() {
    let data: &[u8] = &[1, 2, 3];
    let mut buf = [0u8; 5];
    assert_eq!(data.read_full(1, &mut buf).unwrap(), 2);
    assert_eq!(&buf[..2], &[2, 3]);
}
