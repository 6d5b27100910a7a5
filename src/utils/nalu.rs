// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Annex B NAL unit scanning.

use std::fmt::Debug;
use std::io::Cursor;

use anyhow::anyhow;
use anyhow::Context;

/// A NAL unit header, as needed to delimit NAL units in a byte stream.
pub trait Header: Sized {
    fn parse(data: &[u8]) -> anyhow::Result<Self>;
    /// End of sequence or end of bitstream. Such units carry no payload.
    fn is_end(&self) -> bool;
    /// Size of the header in bytes.
    fn len(&self) -> usize;
}

/// A NAL unit found in an Annex B stream. `data` points into the stream and
/// covers the NAL header and its escaped payload, without the start code or
/// trailing zero bytes.
#[derive(Debug)]
pub struct Nalu<'a, U> {
    pub header: U,
    pub data: &'a [u8],
    /// Offset of the NAL header within the stream.
    pub offset: usize,
}

/// Position of the first `00 00 01` in `data`.
fn start_code_at(data: &[u8]) -> Option<usize> {
    data.windows(3).position(|w| w == [0x00, 0x00, 0x01])
}

impl<'a, U> Nalu<'a, U>
where
    U: Debug + Header,
{
    /// Returns the first NAL unit at or after the position of `cursor`, and
    /// leaves `cursor` at the end of it.
    pub fn next(cursor: &mut Cursor<&'a [u8]>) -> anyhow::Result<Nalu<'a, U>> {
        let stream: &'a [u8] = *cursor.get_ref();
        let from = usize::try_from(cursor.position())?;
        let rest = stream.get(from..).unwrap_or_default();

        let offset = from + start_code_at(rest).context("No NAL found")? + 3;
        if offset >= stream.len() {
            return Err(anyhow!("Start code without NAL unit"));
        }

        let body = &stream[offset..];
        let header = U::parse(body)?;

        let size = if header.is_end() {
            header.len()
        } else {
            // Up to the next start code, leaving out the zero_byte and
            // trailing_zero_8bits in front of it.
            let end = start_code_at(body).unwrap_or(body.len());
            body[..end]
                .iter()
                .rposition(|&b| b != 0)
                .map_or(0, |last| last + 1)
        };

        if size < header.len() {
            return Err(anyhow!("NAL unit shorter than its header"));
        }

        cursor.set_position(u64::try_from(offset + size)?);

        Ok(Nalu {
            header,
            data: &body[..size],
            offset,
        })
    }

    /// The escaped payload following the NAL header.
    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.header.len()..]
    }

    /// Number of bytes from the start of the stream to the end of this NAL unit.
    pub fn end_offset(&self) -> usize {
        self.offset + self.data.len()
    }
}
