//! Typed big-endian binary primitives, length-prefixed strings, optional
//! values, and gzip-wrapped nested sub-streams.
//!
//! This is spec component C1. Reads are not restartable: a short read or a
//! malformed length consumes the reader and returns `ProxyError::Framing`.
//! Individual field reads inside a packet analyzer are expected to be
//! wrapped so that a failure yields a zero value rather than aborting the
//! whole parse — see `protocol::packets` for that convention.

use std::io::{self, Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{ProxyError, Result};

fn eof_to_framing(e: io::Error) -> ProxyError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ProxyError::framing("unexpected end of stream")
    } else {
        ProxyError::Io(e)
    }
}

/// Read side of the codec, generic over any `Read` source (a `&[u8]` slice
/// for packet bodies, or a gzip-inflated sub-reader).
pub struct GameReader<R> {
    inner: R,
}

impl<R: Read> GameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn read_exact_buf(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf).map_err(eof_to_framing)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_exact_buf(&mut b)?;
        Ok(b[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        let mut b = [0u8; 2];
        self.read_exact_buf(&mut b)?;
        Ok(i16::from_be_bytes(b))
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read_exact_buf(&mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    pub fn read_i16_le(&mut self) -> Result<i16> {
        let mut b = [0u8; 2];
        self.read_exact_buf(&mut b)?;
        Ok(i16::from_le_bytes(b))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let mut b = [0u8; 4];
        self.read_exact_buf(&mut b)?;
        Ok(i32::from_be_bytes(b))
    }

    pub fn read_i32_le(&mut self) -> Result<i32> {
        let mut b = [0u8; 4];
        self.read_exact_buf(&mut b)?;
        Ok(i32::from_le_bytes(b))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let mut b = [0u8; 8];
        self.read_exact_buf(&mut b)?;
        Ok(i64::from_be_bytes(b))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        let mut b = [0u8; 4];
        self.read_exact_buf(&mut b)?;
        Ok(f32::from_be_bytes(b))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        let mut b = [0u8; 8];
        self.read_exact_buf(&mut b)?;
        Ok(f64::from_be_bytes(b))
    }

    /// A single UTF-16 code unit widened to a `char`. Lone surrogates are
    /// replaced with U+FFFD rather than failing the read.
    pub fn read_char(&mut self) -> Result<char> {
        let unit = self.read_u16()?;
        Ok(char::decode_utf16([unit])
            .next()
            .unwrap()
            .unwrap_or('\u{FFFD}'))
    }

    /// Short string: `u16` length N followed by N raw UTF-8 bytes.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let mut buf = vec![0u8; len];
        self.read_exact_buf(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Long string: signed `i32` length N (must be >= 0) followed by N bytes.
    pub fn read_long_string(&mut self) -> Result<String> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(ProxyError::framing("negative UTF length"));
        }
        let mut buf = vec![0u8; len as usize];
        self.read_exact_buf(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// `bool` tag followed by `T` if true.
    pub fn read_optional_string(&mut self) -> Result<Option<String>> {
        if self.read_bool()? {
            Ok(Some(self.read_string()?))
        } else {
            Ok(None)
        }
    }

    pub fn read_optional_i32(&mut self) -> Result<Option<i32>> {
        if self.read_bool()? {
            Ok(Some(self.read_i32()?))
        } else {
            Ok(None)
        }
    }

    /// `i32` length N followed by N raw bytes.
    pub fn read_stream_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(ProxyError::framing("negative stream_bytes length"));
        }
        let mut buf = vec![0u8; len as usize];
        self.read_exact_buf(&mut buf)?;
        Ok(buf)
    }

    /// An ignored `i32` "relay type" followed by `stream_bytes`.
    pub fn read_stream_bytes_with_relay_header(&mut self) -> Result<Vec<u8>> {
        let _relay_type = self.read_i32()?;
        self.read_stream_bytes()
    }

    /// `stream_bytes_with_relay_header`, gzip-inflated.
    pub fn read_gzip_nested_stream(&mut self) -> Result<Vec<u8>> {
        let raw = self.read_stream_bytes_with_relay_header()?;
        gzip_inflate(&raw)
    }

    /// A `string` head (discarded) followed by gzip-compressed `stream_bytes`;
    /// returns the inflated payload. Wrap the result in `GameReader::new` over
    /// a `Cursor` to continue reading typed fields out of it.
    pub fn read_decode_stream(&mut self) -> Result<Vec<u8>> {
        let _head = self.read_string()?;
        let raw = self.read_stream_bytes()?;
        gzip_inflate(&raw)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        let mut sink = io::sink();
        io::copy(&mut self.inner.by_ref().take(n as u64), &mut sink).map_err(eof_to_framing)?;
        Ok(())
    }

    /// Copy exactly `n` bytes from this reader to `w`.
    pub fn transfer_fixed<W: Write>(&mut self, w: &mut W, n: usize) -> Result<()> {
        io::copy(&mut self.inner.by_ref().take(n as u64), w).map_err(eof_to_framing)?;
        Ok(())
    }

    /// Copy all remaining bytes from this reader to `w`.
    pub fn transfer_all<W: Write>(&mut self, w: &mut W) -> Result<()> {
        io::copy(&mut self.inner, w).map_err(eof_to_framing)?;
        Ok(())
    }

    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.inner.read_to_end(&mut buf).map_err(eof_to_framing)?;
        Ok(buf)
    }
}

/// Inflated output is capped well above any legitimate 106/115 slot block
/// (source is itself bounded to MAX_BODY = 512 KiB) to keep a malicious
/// gzip member from inflating into an unbounded allocation.
const MAX_INFLATED_SIZE: u64 = 8 * 1024 * 1024;

/// Inflate `raw` (a gzip member, as produced by `stream_bytes`) and return
/// the decompressed bytes. Callers wrap the result in `GameReader::new` over
/// an owned `Cursor`/slice as needed.
pub fn gzip_inflate(raw: &[u8]) -> Result<Vec<u8>> {
    let decoder = GzDecoder::new(raw);
    let mut out = Vec::new();
    let read = decoder
        .take(MAX_INFLATED_SIZE + 1)
        .read_to_end(&mut out)
        .map_err(|e| ProxyError::framing(format!("gzip inflate failed: {e}")))?;
    if read as u64 > MAX_INFLATED_SIZE {
        return Err(ProxyError::framing("inflated gzip member exceeds size cap"));
    }
    Ok(out)
}

/// Write side of the codec, generic over any `Write` sink.
pub struct GameWriter<W> {
    inner: W,
}

impl<W: Write> GameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.inner.write_all(&[v])?;
        Ok(())
    }

    pub fn write_bool(&mut self, v: bool) -> Result<()> {
        self.write_u8(if v { 1 } else { 0 })
    }

    pub fn write_i16(&mut self, v: i16) -> Result<()> {
        self.inner.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.inner.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    pub fn write_i16_le(&mut self, v: i16) -> Result<()> {
        self.inner.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        self.inner.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    pub fn write_i32_le(&mut self, v: i32) -> Result<()> {
        self.inner.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    pub fn write_i64(&mut self, v: i64) -> Result<()> {
        self.inner.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    pub fn write_f32(&mut self, v: f32) -> Result<()> {
        self.inner.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    pub fn write_f64(&mut self, v: f64) -> Result<()> {
        self.inner.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    /// Supplementary-plane chars are written as a surrogate pair, matching
    /// `read_char`'s single-code-unit read on the BMP and round-tripping
    /// through two `read_char` calls otherwise.
    pub fn write_char(&mut self, v: char) -> Result<()> {
        let mut units = [0u16; 2];
        for unit in v.encode_utf16(&mut units) {
            self.write_u16(*unit)?;
        }
        Ok(())
    }

    pub fn write_string(&mut self, v: &str) -> Result<()> {
        let bytes = v.as_bytes();
        if bytes.len() > u16::MAX as usize {
            return Err(ProxyError::framing("string too long for short string field"));
        }
        self.write_u16(bytes.len() as u16)?;
        self.inner.write_all(bytes)?;
        Ok(())
    }

    pub fn write_long_string(&mut self, v: &str) -> Result<()> {
        let bytes = v.as_bytes();
        self.write_i32(bytes.len() as i32)?;
        self.inner.write_all(bytes)?;
        Ok(())
    }

    pub fn write_optional_string(&mut self, v: Option<&str>) -> Result<()> {
        match v {
            Some(s) => {
                self.write_bool(true)?;
                self.write_string(s)
            }
            None => self.write_bool(false),
        }
    }

    pub fn write_optional_i32(&mut self, v: Option<i32>) -> Result<()> {
        match v {
            Some(n) => {
                self.write_bool(true)?;
                self.write_i32(n)
            }
            None => self.write_bool(false),
        }
    }

    pub fn write_stream_bytes(&mut self, v: &[u8]) -> Result<()> {
        self.write_i32(v.len() as i32)?;
        self.inner.write_all(v)?;
        Ok(())
    }

    /// `head ‖ i32 inner_len ‖ inner_bytes`, where `inner_bytes` is the
    /// gzip-compressed form of `payload`.
    pub fn write_decode_stream(&mut self, head: &str, payload: &[u8]) -> Result<()> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(payload)?;
        let compressed = enc
            .finish()
            .map_err(|e| ProxyError::framing(format!("gzip deflate failed: {e}")))?;
        self.write_string(head)?;
        self.write_stream_bytes(&compressed)
    }

    pub fn write_bytes(&mut self, v: &[u8]) -> Result<()> {
        self.inner.write_all(v)?;
        Ok(())
    }

    pub fn transfer_fixed<R: Read>(&mut self, r: &mut R, n: usize) -> Result<()> {
        io::copy(&mut r.take(n as u64), &mut self.inner).map_err(eof_to_framing)?;
        Ok(())
    }

    pub fn transfer_all<R: Read>(&mut self, r: &mut R) -> Result<()> {
        io::copy(r, &mut self.inner).map_err(eof_to_framing)?;
        Ok(())
    }
}

/// gzip-compress `payload` and return the compressed bytes (used for the
/// 115 player-list inner block when building a fresh one).
pub fn gzip_deflate(payload: &[u8]) -> Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(payload)?;
    enc.finish()
        .map_err(|e| ProxyError::framing(format!("gzip deflate failed: {e}")))
}
