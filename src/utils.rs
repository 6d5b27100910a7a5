// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility functions used by several parts of this crate.
//!
//! Conversions between Annex B byte streams and the length-prefixed form used
//! by MP4 and other packetized transports live here.

pub mod nalu;

use std::io::Cursor;

use byteorder::BigEndian;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use bytes::Buf;
use thiserror::Error;

use crate::codec::h265::nalu_writer::START_CODE;
use crate::codec::h265::parser::Nalu;

/// Size of the big-endian length replacing each start code.
pub const NALU_LENGTH_SIZE: usize = 4;

#[derive(Error, Debug)]
pub enum PacketizedError {
    #[error("NAL unit of {0} bytes does not fit a 32-bit length")]
    NaluTooLarge(usize),
    #[error("NAL unit at offset {offset} claims {len} bytes, only {remaining} left")]
    Truncated {
        offset: usize,
        len: usize,
        remaining: usize,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Parser(#[from] anyhow::Error),
}

pub type PacketizedResult<T> = Result<T, PacketizedError>;

fn has_start_code(data: &[u8]) -> bool {
    data.windows(3).any(|w| w == [0x00, 0x00, 0x01])
}

/// Replaces the start code of every NAL unit in `stream` by its length as a
/// big-endian `u32`. Trailing zero bytes between NAL units are dropped.
pub fn annexb_to_length_prefixed(stream: &[u8]) -> PacketizedResult<Vec<u8>> {
    let mut cursor = Cursor::new(stream);
    let mut out = Vec::with_capacity(stream.len());

    while has_start_code(cursor.chunk()) {
        let nalu = Nalu::next(&mut cursor)?;
        let len = nalu.data.len();
        let len = u32::try_from(len).map_err(|_| PacketizedError::NaluTooLarge(len))?;

        out.write_u32::<BigEndian>(len)?;
        out.extend_from_slice(nalu.data);
    }

    Ok(out)
}

/// Replaces the length of every NAL unit in `data` by a four-byte start code.
pub fn length_prefixed_to_annexb(data: &[u8]) -> PacketizedResult<Vec<u8>> {
    let mut cursor = Cursor::new(data);
    let mut out = Vec::with_capacity(data.len());

    while cursor.has_remaining() {
        let offset = cursor.position() as usize;
        if cursor.remaining() < NALU_LENGTH_SIZE {
            return Err(PacketizedError::Truncated {
                offset,
                len: NALU_LENGTH_SIZE,
                remaining: cursor.remaining(),
            });
        }

        let len = cursor.read_u32::<BigEndian>()? as usize;
        if len > cursor.remaining() {
            return Err(PacketizedError::Truncated {
                offset,
                len,
                remaining: cursor.remaining(),
            });
        }

        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(&cursor.chunk()[..len]);
        cursor.advance(len);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h265::nalu_writer::pack_nal;
    use crate::codec::h265::parser::NaluType;

    fn stream() -> Vec<u8> {
        let mut stream = pack_nal(NaluType::VpsNut, &[0x0c, 0x01, 0xff, 0xff, 0x80]).unwrap();
        // Needs an emulation prevention byte.
        stream.extend(pack_nal(NaluType::PrefixSeiNut, &[0x05, 0x00, 0x00, 0x01, 0x80]).unwrap());
        stream
    }

    #[test]
    fn start_codes_become_lengths() {
        let annexb = stream();
        let packetized = annexb_to_length_prefixed(&annexb).unwrap();

        // VPS: 2 header bytes and 5 payload bytes.
        assert_eq!(&packetized[..4], &[0, 0, 0, 7]);
        assert_eq!(&packetized[4..11], &annexb[4..11]);
        // SEI: 2 header bytes, 5 payload bytes and the emulation prevention byte.
        assert_eq!(&packetized[11..15], &[0, 0, 0, 8]);
        assert_eq!(packetized.len(), annexb.len());

        assert_eq!(length_prefixed_to_annexb(&packetized).unwrap(), annexb);
    }

    #[test]
    fn short_start_codes_and_trailing_zeros() {
        let mut annexb = vec![0x00, 0x00, 0x01];
        annexb.extend_from_slice(&stream()[4..11]);
        annexb.extend_from_slice(&[0x00, 0x00]);
        annexb.extend_from_slice(&stream()[11..]);

        let packetized = annexb_to_length_prefixed(&annexb).unwrap();
        assert_eq!(length_prefixed_to_annexb(&packetized).unwrap(), stream());

        assert!(annexb_to_length_prefixed(&[]).unwrap().is_empty());
    }

    #[test]
    fn truncated_input() {
        let packetized = annexb_to_length_prefixed(&stream()).unwrap();

        assert!(matches!(
            length_prefixed_to_annexb(&packetized[..packetized.len() - 1]),
            Err(PacketizedError::Truncated { offset: 11, len: 8, remaining: 7 })
        ));
        assert!(matches!(
            length_prefixed_to_annexb(&packetized[..2]),
            Err(PacketizedError::Truncated { offset: 0, .. })
        ));
    }
}
