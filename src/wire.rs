//! Length-delimited framing primitives shared by the server and client.
//!
//! Everything here is host-endian (§4.1): the protocol is loopback-only,
//! so there is no cross-machine byte-order concern, and fixing an
//! explicit endianness would just be extra ceremony for no portability
//! gain in this component's scope. An implementer targeting a non-native
//! host should replace the `to_ne_bytes`/`from_ne_bytes` calls below with
//! `to_le_bytes`/`from_le_bytes` and nothing else changes.

use std::io::{self, Read, Write};

use crate::error::{Error, Result};

/// Reads exactly `buf.len()` bytes, looping over short reads. A read that
/// returns `0` bytes with the buffer still incomplete is a clean peer
/// disconnect and is reported as [`Error::ConnectionClosed`].
pub fn read_exact(stream: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        filled += n;
    }
    Ok(())
}

/// Writes all of `buf`, looping over short writes.
pub fn write_all(stream: &mut impl Write, buf: &[u8]) -> Result<()> {
    stream.write_all(buf).map_err(Error::from)
}

pub fn read_i32(stream: &mut impl Read) -> Result<i32> {
    let mut buf = [0u8; 4];
    read_exact(stream, &mut buf)?;
    Ok(i32::from_ne_bytes(buf))
}

pub fn write_i32(stream: &mut impl Write, v: i32) -> Result<()> {
    write_all(stream, &v.to_ne_bytes())
}

pub fn read_u32(stream: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(stream, &mut buf)?;
    Ok(u32::from_ne_bytes(buf))
}

pub fn write_u32(stream: &mut impl Write, v: u32) -> Result<()> {
    write_all(stream, &v.to_ne_bytes())
}

pub fn read_u64(stream: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact(stream, &mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

pub fn write_u64(stream: &mut impl Write, v: u64) -> Result<()> {
    write_all(stream, &v.to_ne_bytes())
}

pub fn read_bool(stream: &mut impl Read) -> Result<bool> {
    let mut buf = [0u8; 1];
    read_exact(stream, &mut buf)?;
    Ok(buf[0] != 0)
}

pub fn write_bool(stream: &mut impl Write, v: bool) -> Result<()> {
    write_all(stream, &[v as u8])
}

/// `size_t` on the wire is modelled as `u64`, matching the widest native
/// `size_t` this crate is likely to run on; a length that doesn't fit in
/// `usize` on a 32-bit target is rejected as [`io::ErrorKind::InvalidData`].
pub fn read_length_prefixed(stream: &mut impl Read) -> Result<Vec<u8>> {
    let len = read_u64(stream)?;
    let len: usize = len
        .try_into()
        .map_err(|_| Error::Io(io::Error::new(io::ErrorKind::InvalidData, "length does not fit in usize")))?;
    let mut buf = vec![0u8; len];
    read_exact(stream, &mut buf)?;
    Ok(buf)
}

pub fn write_length_prefixed(stream: &mut impl Write, bytes: &[u8]) -> Result<()> {
    write_u64(stream, bytes.len() as u64)?;
    write_all(stream, bytes)
}

pub fn read_length_prefixed_string(stream: &mut impl Read) -> Result<String> {
    let bytes = read_length_prefixed(stream)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn write_length_prefixed_str(stream: &mut impl Write, s: &str) -> Result<()> {
    write_length_prefixed(stream, s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn length_prefixed_round_trip() {
        let mut buf = Vec::new();
        write_length_prefixed_str(&mut buf, "AkVCamVideoDevice0").unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_length_prefixed_string(&mut cursor).unwrap(), "AkVCamVideoDevice0");
    }

    #[test]
    fn short_read_is_connection_closed() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        match read_i32(&mut cursor) {
            Err(Error::ConnectionClosed) => {}
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }
    }
}
