//! On-wire packet framing (spec C2): `u32 body_length ‖ i32 type ‖ body`,
//! bounded length, per-frame read/write deadlines, and a small buffer pool
//! bucketed by size so hot paths avoid an allocation per packet.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{ProxyError, Result};

pub const MAX_BODY: u32 = 512 * 1024;
pub const FRAME_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const FRAME_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// A single decoded packet: an opaque type id and its raw body.
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: i32,
    pub body: Vec<u8>,
}

impl Packet {
    pub fn new(kind: i32, body: Vec<u8>) -> Self {
        Self { kind, body }
    }
}

const BUCKET_SIZES: [usize; 3] = [4 * 1024, 64 * 1024, 512 * 1024];

/// Bucketed buffer pool. Buffers are returned to the bucket matching their
/// capacity; oversized or odd-capacity buffers are simply dropped instead
/// of being pooled, matching the teacher's "put only if it fits a bucket"
/// `sync.Pool` idiom ported to a plain mutex-free stack per bucket.
pub struct BufferPool {
    buckets: [parking_lot::Mutex<Vec<Vec<u8>>>; 3],
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            buckets: [
                parking_lot::Mutex::new(Vec::new()),
                parking_lot::Mutex::new(Vec::new()),
                parking_lot::Mutex::new(Vec::new()),
            ],
        }
    }

    fn bucket_index(size: usize) -> Option<usize> {
        BUCKET_SIZES.iter().position(|&b| size <= b)
    }

    /// Borrow a zero-filled buffer of exactly `len` bytes, backed by the
    /// smallest bucket that fits. Falls back to a fresh heap allocation if
    /// `len` exceeds every bucket (only reachable if `MAX_BODY` were raised
    /// past the largest bucket).
    pub fn get(&self, len: usize) -> Vec<u8> {
        match Self::bucket_index(len) {
            Some(idx) => {
                let mut bucket = self.buckets[idx].lock();
                let mut buf = bucket.pop().unwrap_or_else(|| vec![0u8; BUCKET_SIZES[idx]]);
                buf.truncate(len);
                buf.resize(len, 0);
                buf
            }
            None => vec![0u8; len],
        }
    }

    /// Return a buffer to its bucket. A no-op for buffers whose capacity
    /// doesn't exactly match a bucket size (e.g. the heap-allocated
    /// oversized fallback).
    pub fn put(&self, mut buf: Vec<u8>) {
        if let Some(idx) = BUCKET_SIZES.iter().position(|&b| buf.capacity() == b) {
            buf.clear();
            buf.resize(BUCKET_SIZES[idx], 0);
            self.buckets[idx].lock().push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Read one framed packet from `stream`, enforcing the 30s read deadline
/// and the `MAX_BODY` bound. Returns `ProxyError::Framing` on any
/// violation; this is fatal to the connection per spec §7.
pub async fn read_packet<S: AsyncRead + Unpin>(
    stream: &mut S,
    pool: &BufferPool,
) -> Result<Packet> {
    timeout(FRAME_READ_TIMEOUT, read_packet_inner(stream, pool))
        .await
        .map_err(|_| ProxyError::framing("read deadline expired"))?
}

async fn read_packet_inner<S: AsyncRead + Unpin>(stream: &mut S, pool: &BufferPool) -> Result<Packet> {
    let body_len = stream.read_u32().await?;
    if body_len == 0 || body_len > MAX_BODY {
        return Err(ProxyError::framing(format!(
            "body_length {body_len} out of bounds (0, {MAX_BODY}]"
        )));
    }
    let kind = stream.read_i32().await?;

    let mut body = pool.get(body_len as usize);
    stream.read_exact(&mut body).await?;
    Ok(Packet::new(kind, body))
}

/// Write one framed packet to `stream`, enforcing the 30s write deadline.
pub async fn write_packet<S: AsyncWrite + Unpin>(stream: &mut S, packet: &Packet) -> Result<()> {
    timeout(FRAME_WRITE_TIMEOUT, write_packet_inner(stream, packet))
        .await
        .map_err(|_| ProxyError::framing("write deadline expired"))?
}

async fn write_packet_inner<S: AsyncWrite + Unpin>(stream: &mut S, packet: &Packet) -> Result<()> {
    if packet.body.len() as u64 > MAX_BODY as u64 {
        return Err(ProxyError::framing("body exceeds MAX_BODY on write"));
    }
    let mut header = [0u8; 8];
    header[0..4].copy_from_slice(&(packet.body.len() as u32).to_be_bytes());
    header[4..8].copy_from_slice(&packet.kind.to_be_bytes());
    stream.write_all(&header).await?;
    stream.write_all(&packet.body).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame_bytes(kind: i32, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&kind.to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    #[tokio::test]
    async fn roundtrip_small_packet() {
        let pool = BufferPool::new();
        let mut buf = Vec::new();
        write_packet(&mut buf, &Packet::new(160, vec![1, 2, 3])).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let packet = read_packet(&mut cursor, &pool).await.unwrap();
        assert_eq!(packet.kind, 160);
        assert_eq!(packet.body, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn rejects_zero_length_body() {
        let pool = BufferPool::new();
        let mut cursor = Cursor::new(frame_bytes(160, &[]));
        let err = read_packet(&mut cursor, &pool).await.unwrap_err();
        assert!(matches!(err, ProxyError::Framing(_)));
    }

    #[tokio::test]
    async fn rejects_over_max_body() {
        let pool = BufferPool::new();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(MAX_BODY + 1).to_be_bytes());
        bytes.extend_from_slice(&160i32.to_be_bytes());
        let mut cursor = Cursor::new(bytes);
        let err = read_packet(&mut cursor, &pool).await.unwrap_err();
        assert!(matches!(err, ProxyError::Framing(_)));
    }

    #[tokio::test]
    async fn accepts_exactly_max_body() {
        let pool = BufferPool::new();
        let body = vec![7u8; MAX_BODY as usize];
        let mut buf = Vec::new();
        write_packet(&mut buf, &Packet::new(106, body.clone())).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let packet = read_packet(&mut cursor, &pool).await.unwrap();
        assert_eq!(packet.body.len(), MAX_BODY as usize);
        assert_eq!(packet.body, body);
    }

    #[test]
    fn pool_bucket_roundtrip() {
        let pool = BufferPool::new();
        let buf = pool.get(10);
        assert_eq!(buf.len(), 10);
        assert_eq!(buf.capacity(), BUCKET_SIZES[0]);
        pool.put(buf);
        let buf2 = pool.get(10);
        assert_eq!(buf2.capacity(), BUCKET_SIZES[0]);
    }

    proptest::proptest! {
        #[test]
        fn pool_never_loses_or_duplicates_capacity(sizes in proptest::collection::vec(1usize..=MAX_BODY as usize, 1..64)) {
            let pool = BufferPool::new();
            let mut borrowed: Vec<Vec<u8>> = Vec::new();
            for &s in &sizes {
                let buf = pool.get(s);
                prop_assert_eq!(buf.len(), s);
                borrowed.push(buf);
            }
            for buf in borrowed {
                pool.put(buf);
            }
        }
    }
}
