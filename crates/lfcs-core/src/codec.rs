//! Little-endian wire encoding shared by every CRDT type.

use crate::error::{CrdtError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

/// Binary snapshot encoding.
///
/// All integers are little-endian regardless of host byte order. Decoding
/// checks every declared length against the remaining input and the
/// compiled capacities before reading, and rejects malformed input with
/// [`CrdtError::InvalidArgument`].
pub trait WireCodec: Sized {
    /// Exact number of bytes [`encode`](Self::encode) will write.
    fn serialized_size(&self) -> usize;

    fn encode<B: BufMut>(&self, buf: &mut B);

    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;

    /// Encodes into a caller-provided buffer and returns the bytes written.
    fn serialize_into(&self, dst: &mut [u8]) -> Result<usize> {
        let size = self.serialized_size();
        if dst.len() < size {
            return Err(CrdtError::Full(format!(
                "destination holds {} bytes, {size} required",
                dst.len()
            )));
        }
        let mut cursor = &mut dst[..size];
        self.encode(&mut cursor);
        Ok(size)
    }

    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_size());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes a complete snapshot; trailing bytes are an error.
    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let value = Self::decode(&mut buf)?;
        if buf.has_remaining() {
            return Err(reject(format!("{} trailing bytes", buf.remaining())));
        }
        Ok(value)
    }
}

pub(crate) fn reject(what: impl Into<String>) -> CrdtError {
    let what = what.into();
    debug!(reason = %what, "rejected serialized input");
    CrdtError::malformed(what)
}

pub(crate) fn ensure_remaining<B: Buf>(buf: &B, needed: usize, field: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(reject(format!(
            "truncated {field}: {needed} bytes needed, {} left",
            buf.remaining()
        )));
    }
    Ok(())
}

pub(crate) fn read_u8<B: Buf>(buf: &mut B, field: &str) -> Result<u8> {
    ensure_remaining(buf, 1, field)?;
    Ok(buf.get_u8())
}

pub(crate) fn read_u32<B: Buf>(buf: &mut B, field: &str) -> Result<u32> {
    ensure_remaining(buf, 4, field)?;
    Ok(buf.get_u32_le())
}

pub(crate) fn read_u64<B: Buf>(buf: &mut B, field: &str) -> Result<u64> {
    ensure_remaining(buf, 8, field)?;
    Ok(buf.get_u64_le())
}

/// Reads an element count and checks it against `max` and the input left,
/// given that each element occupies at least `min_element_size` bytes.
pub(crate) fn read_count<B: Buf>(
    buf: &mut B,
    max: usize,
    min_element_size: usize,
    field: &str,
) -> Result<usize> {
    let count = read_u32(buf, field)? as usize;
    if count > max {
        return Err(reject(format!("{field} {count} exceeds capacity {max}")));
    }
    ensure_remaining(buf, count.saturating_mul(min_element_size), field)?;
    Ok(count)
}

/// Size of a length-prefixed blob.
pub(crate) fn blob_size(data: &[u8]) -> usize {
    4 + data.len()
}

pub(crate) fn put_blob<B: BufMut>(buf: &mut B, data: &[u8]) {
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

/// Reads a non-empty, length-prefixed blob.
pub(crate) fn read_blob<B: Buf>(buf: &mut B, field: &str) -> Result<Bytes> {
    let len = read_u32(buf, field)? as usize;
    if len == 0 {
        return Err(reject(format!("empty {field}")));
    }
    ensure_remaining(buf, len, field)?;
    Ok(buf.copy_to_bytes(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_helpers_reject_truncation() {
        let mut buf: &[u8] = &[1, 0];
        assert!(matches!(read_u32(&mut buf, "count"), Err(CrdtError::InvalidArgument(_))));

        let mut buf: &[u8] = &[3, 0, 0, 0, b'a', b'b'];
        assert!(read_blob(&mut buf, "element").is_err());
    }

    #[test]
    fn test_blob_roundtrip() {
        let mut out = BytesMut::new();
        put_blob(&mut out, b"hello");
        assert_eq!(out.len(), blob_size(b"hello"));

        let mut buf = &out[..];
        assert_eq!(read_blob(&mut buf, "element").unwrap(), Bytes::from_static(b"hello"));
        assert!(!buf.has_remaining());
    }

    #[test]
    fn test_zero_length_blob_rejected() {
        let mut buf: &[u8] = &[0, 0, 0, 0];
        assert!(read_blob(&mut buf, "element").is_err());
    }

    #[test]
    fn test_count_checks_capacity_and_input() {
        let mut buf: &[u8] = &[65, 0, 0, 0];
        assert!(read_count(&mut buf, 64, 8, "nodes").is_err());

        // Declares 2 elements of at least 8 bytes, carries 8.
        let mut buf: &[u8] = &[2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(read_count(&mut buf, 64, 8, "nodes").is_err());
    }
}
