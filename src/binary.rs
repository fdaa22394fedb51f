//! Byte-for-byte content equality
//!
//! The final tiebreaker of a tree comparison: two files are equal only if
//! their streams yield the same bytes and end at the same point.

use std::io::{self, Read};
use std::sync::Arc;
use tracing::trace;

use crate::error::Result;
use crate::fs::{read_to_vec, FileSystem};

/// Bytes compared per chunk
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Compare two streams in fixed-size chunks
///
/// Returns `false` at the first mismatching chunk or when one stream ends
/// before the other.
pub fn streams_equal(a: &mut dyn Read, b: &mut dyn Read) -> io::Result<bool> {
    let mut buf_a = vec![0u8; CHUNK_SIZE];
    let mut buf_b = vec![0u8; CHUNK_SIZE];
    loop {
        let n = fill(a, &mut buf_a)?;
        let m = fill(b, &mut buf_b)?;
        if n != m || buf_a[..n] != buf_b[..m] {
            return Ok(false);
        }
        if n < CHUNK_SIZE {
            return Ok(true);
        }
    }
}

/// Read until `buf` is full or the stream ends
fn fill(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Compare a file on one view with a file on another
///
/// Both locks are held while streaming, left first. The same view at the same
/// path is equal without any read; the same view at two paths buffers the left
/// file so only one lock acquisition is ever live.
pub fn files_match(
    left: &Arc<dyn FileSystem>,
    left_path: &str,
    right: &Arc<dyn FileSystem>,
    right_path: &str,
) -> Result<bool> {
    if Arc::ptr_eq(left, right) {
        if left_path == right_path {
            trace!("Self comparison of {} short-circuited", left_path);
            return Ok(true);
        }
        let left_bytes = read_to_vec(left.as_ref(), left_path)?;
        let mut equal = false;
        right.read_with(right_path, &mut |rb| {
            equal = streams_equal(&mut &left_bytes[..], rb)?;
            Ok(())
        })?;
        return Ok(equal);
    }

    let mut equal = false;
    left.read_with(left_path, &mut |ra| {
        right.read_with(right_path, &mut |rb| {
            equal = streams_equal(&mut *ra, rb)?;
            Ok(())
        })
    })?;
    Ok(equal)
}
