//! The binary codec (C1) and packet framing (C2).

pub mod frame;
pub mod io;

pub use frame::{read_packet, write_packet, BufferPool, Packet, MAX_BODY};
pub use io::{gzip_deflate, gzip_inflate, GameReader, GameWriter};
