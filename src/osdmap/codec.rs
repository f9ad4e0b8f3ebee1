//! Encoded map format.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ MAGIC: [u8; 4]  "CMAP" full / "CINC" delta   │
//! ├──────────────────────────────────────────────┤
//! │ VERSION: u16                                 │
//! ├──────────────────────────────────────────────┤
//! │ RESERVED: u16                                │
//! ├──────────────────────────────────────────────┤
//! │ EPOCH: u32                                   │
//! ├──────────────────────────────────────────────┤
//! │ PAYLOAD_LEN: u32                             │
//! ├──────────────────────────────────────────────┤
//! │ PAYLOAD (bincode)                            │
//! ├──────────────────────────────────────────────┤
//! │ CRC32: u32  (header + payload)               │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian.

use super::incremental::Incremental;
use super::map::ClusterMap;
use crate::error::MapError;
use crate::types::Epoch;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISCSI};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Magic of a full map encoding.
pub const FULL_MAGIC: [u8; 4] = *b"CMAP";

/// Magic of an incremental encoding.
pub const INC_MAGIC: [u8; 4] = *b"CINC";

/// Current encoding version.
pub const VERSION: u16 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 16;

const TRAILER_SIZE: usize = 4;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Encode a full map.
pub fn encode_full(map: &ClusterMap) -> Result<Bytes, MapError> {
    encode(FULL_MAGIC, map.epoch(), map)
}

/// Decode a full map.
pub fn decode_full(buf: &[u8]) -> Result<ClusterMap, MapError> {
    let (epoch, map): (Epoch, ClusterMap) = decode(FULL_MAGIC, buf)?;
    if map.epoch() != epoch {
        return Err(MapError::MisfiledEpoch {
            expected: epoch,
            encoded: map.epoch(),
        });
    }
    Ok(map)
}

/// Encode an incremental delta.
pub fn encode_incremental(inc: &Incremental) -> Result<Bytes, MapError> {
    encode(INC_MAGIC, inc.epoch, inc)
}

/// Decode an incremental delta.
pub fn decode_incremental(buf: &[u8]) -> Result<Incremental, MapError> {
    let (epoch, inc): (Epoch, Incremental) = decode(INC_MAGIC, buf)?;
    if inc.epoch != epoch {
        return Err(MapError::MisfiledEpoch {
            expected: epoch,
            encoded: inc.epoch,
        });
    }
    Ok(inc)
}

/// Read the epoch from an encoded header without decoding the payload.
pub fn peek_epoch(buf: &[u8]) -> Result<Epoch, MapError> {
    if buf.len() < HEADER_SIZE {
        return Err(MapError::Truncated {
            needed: HEADER_SIZE,
            available: buf.len(),
        });
    }
    let mut header = &buf[8..12];
    Ok(header.get_u32_le())
}

fn encode<T: Serialize>(magic: [u8; 4], epoch: Epoch, value: &T) -> Result<Bytes, MapError> {
    let payload = bincode::serialize(value)?;
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len() + TRAILER_SIZE);

    buf.put_slice(&magic);
    buf.put_u16_le(VERSION);
    buf.put_u16_le(0);
    buf.put_u32_le(epoch);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);

    let crc = CRC32.checksum(&buf);
    buf.put_u32_le(crc);

    Ok(buf.freeze())
}

fn decode<T: DeserializeOwned>(magic: [u8; 4], buf: &[u8]) -> Result<(Epoch, T), MapError> {
    if buf.len() < HEADER_SIZE + TRAILER_SIZE {
        return Err(MapError::Truncated {
            needed: HEADER_SIZE + TRAILER_SIZE,
            available: buf.len(),
        });
    }

    let mut header = &buf[..HEADER_SIZE];
    let mut found = [0u8; 4];
    header.copy_to_slice(&mut found);
    if found != magic {
        return Err(MapError::BadMagic(found));
    }

    let version = header.get_u16_le();
    if version > VERSION {
        return Err(MapError::UnsupportedVersion(version));
    }
    let _reserved = header.get_u16_le();
    let epoch = header.get_u32_le();
    let len = header.get_u32_le() as usize;

    let needed = HEADER_SIZE + len + TRAILER_SIZE;
    if buf.len() < needed {
        return Err(MapError::Truncated {
            needed,
            available: buf.len(),
        });
    }

    let body_end = HEADER_SIZE + len;
    let mut trailer = &buf[body_end..needed];
    let expected = trailer.get_u32_le();
    let computed = CRC32.checksum(&buf[..body_end]);
    if expected != computed {
        return Err(MapError::ChecksumMismatch { expected, computed });
    }

    let value = bincode::deserialize(&buf[HEADER_SIZE..body_end])?;
    Ok((epoch, value))
}
