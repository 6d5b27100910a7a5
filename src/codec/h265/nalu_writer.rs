// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bit-level writing of H.265 NAL units with emulation prevention (7.4.2).

use std::io::Write;

use thiserror::Error;

use crate::bitstream_utils::BitWriter;
use crate::bitstream_utils::BitWriterError;
use crate::codec::h265::parser::NaluType;

/// Annex B start code written in front of every NAL unit.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Byte sink inserting `emulation_prevention_three_byte` where the payload
/// would otherwise contain a start code prefix.
struct Escaper<W: Write> {
    sink: W,
    /// Zero bytes in a row since the last non-zero or inserted byte.
    zero_run: usize,
    escape: bool,
}

impl<W: Write> Escaper<W> {
    fn new(sink: W, escape: bool) -> Self {
        Self {
            sink,
            zero_run: 0,
            escape,
        }
    }

    fn push(&mut self, byte: u8) -> std::io::Result<()> {
        if self.zero_run >= 2 && byte <= 0x03 {
            self.sink.write_all(&[0x03])?;
            self.zero_run = 0;
        }

        self.sink.write_all(&[byte])?;
        self.zero_run = if byte == 0 { self.zero_run + 1 } else { 0 };

        Ok(())
    }

    /// Start code followed by nal_unit_header() (7.3.1.2), with
    /// nuh_layer_id 0. Never escaped.
    fn start_nal(&mut self, nal_type: NaluType, temporal_id_plus1: u8) -> std::io::Result<()> {
        let header = [(nal_type as u8 & 0x3f) << 1, temporal_id_plus1 & 0x07];
        self.sink.write_all(&START_CODE)?;
        self.sink.write_all(&header)?;
        self.zero_run = 0;

        Ok(())
    }
}

impl<W: Write> Write for Escaper<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.escape {
            buf.iter().try_for_each(|&b| self.push(b))?;
        } else {
            self.sink.write_all(buf)?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.sink.flush()
    }
}

#[derive(Error, Debug)]
pub enum NaluWriterError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    BitWriterError(#[from] BitWriterError),
}

impl NaluWriterError {
    /// Whether the failure comes from the output buffer running out of space.
    pub fn is_overflow(&self) -> bool {
        matches!(self, NaluWriterError::BitWriterError(BitWriterError::Overflow))
            || matches!(self, NaluWriterError::Io(e) if e.kind() == std::io::ErrorKind::WriteZero)
    }
}

pub type NaluWriterResult<T> = std::result::Result<T, NaluWriterError>;

/// Writes the syntax elements of one or more NAL units, escaping the payload
/// when `escape` is set.
pub struct NaluWriter<W: Write>(BitWriter<Escaper<W>>);

impl<W: Write> NaluWriter<W> {
    pub fn new(writer: W, escape: bool) -> Self {
        Self(BitWriter::new(Escaper::new(writer, escape)))
    }

    /// `f(n)`: the `bits` low bits of `value`, most significant first.
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> NaluWriterResult<usize> {
        self.0
            .write_f(bits, value)
            .map_err(NaluWriterError::BitWriterError)
    }

    /// `u(n)`, identical to `f(n)` on the writing side.
    pub fn write_u<T: Into<u32>>(&mut self, bits: usize, value: T) -> NaluWriterResult<usize> {
        self.write_f(bits, value)
    }

    /// `ue(v)`
    pub fn write_ue<T: Into<u32>>(&mut self, value: T) -> NaluWriterResult<()> {
        Ok(self.0.write_ue(value)?)
    }

    /// `se(v)`
    pub fn write_se<T: Into<i32>>(&mut self, value: T) -> NaluWriterResult<()> {
        Ok(self.0.write_se(value)?)
    }

    /// Writes rbsp_trailing_bits().
    pub fn rbsp_trailing_bits(&mut self) -> NaluWriterResult<()> {
        Ok(self.0.align_to_byte()?)
    }

    pub fn has_data_pending(&self) -> bool {
        self.0.has_data_pending()
    }

    /// Writes the start code and a H.265 NALU header with `nuh_layer_id` 0
    /// and `nuh_temporal_id_plus1` 1.
    pub fn write_header(&mut self, type_: NaluType) -> NaluWriterResult<()> {
        self.0.flush()?;
        self.0.inner_mut().start_nal(type_, 1)?;
        Ok(())
    }

    /// byte_aligned()
    pub fn aligned(&self) -> bool {
        !self.has_data_pending()
    }
}

/// Escapes `rbsp` so that no `00 00 0{0,1,2,3}` sequence appears in the
/// output.
pub fn add_emulation_prevention(rbsp: &[u8]) -> NaluWriterResult<Vec<u8>> {
    let mut out = Vec::with_capacity(rbsp.len() + rbsp.len() / 64);
    Escaper::new(&mut out, true).write_all(rbsp)?;

    Ok(out)
}

/// Wraps an RBSP into a start-code prefixed, escaped NAL unit.
pub fn pack_nal(type_: NaluType, rbsp: &[u8]) -> NaluWriterResult<Vec<u8>> {
    let mut out = Vec::with_capacity(START_CODE.len() + 2 + rbsp.len() + rbsp.len() / 64);
    {
        let mut escaper = Escaper::new(&mut out, true);
        escaper.start_nal(type_, 1)?;
        escaper.write_all(rbsp)?;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream_utils::remove_emulation_prevention;
    use crate::bitstream_utils::BitReader;

    fn written(escape: bool, f: impl FnOnce(&mut NaluWriter<&mut Vec<u8>>)) -> Vec<u8> {
        let mut buf = vec![];
        let mut writer = NaluWriter::new(&mut buf, escape);
        f(&mut writer);
        drop(writer);
        buf
    }

    #[test]
    fn flags_fill_bytes_msb_first() {
        let flags = [false, true, true, false, true, false, false, true, true];
        let buf = written(false, |w| {
            for flag in flags {
                w.write_f(1, flag).unwrap();
            }
            assert!(!w.aligned());
        });

        // The ninth flag is flushed in a byte of its own.
        assert_eq!(buf, vec![0b0110_1001, 0b1000_0000]);
    }

    #[test]
    fn exp_golomb_codes() {
        let ue = |value: u32| written(false, |w| w.write_ue(value).unwrap());
        let se = |value: i32| written(false, |w| w.write_se(value).unwrap());

        assert_eq!(ue(0), vec![0b1000_0000]);
        assert_eq!(ue(2), vec![0b0110_0000]);
        assert_eq!(ue(6), vec![0b0011_1000]);
        assert_eq!(ue(14), vec![0b0001_1110]);
        assert_eq!(ue(15), vec![0b0000_1000, 0b0000_0000]);

        // 1, -1, 2 map to codeNum 1, 2, 3.
        assert_eq!(se(1), vec![0b0100_0000]);
        assert_eq!(se(-1), vec![0b0110_0000]);
        assert_eq!(se(2), vec![0b0010_0000]);
    }

    #[test]
    fn slice_like_syntax_reads_back() {
        let buf = written(true, |w| {
            w.write_f(1, true).unwrap();
            w.write_ue(63u32).unwrap();
            w.write_se(-26).unwrap();
            w.write_u(24, 0u32).unwrap();
            w.write_se(7).unwrap();
            w.rbsp_trailing_bits().unwrap();
            assert!(w.aligned());
        });

        let mut reader = BitReader::new(&buf, true);
        assert!(reader.read_bit().unwrap());
        assert_eq!(reader.read_ue::<u32>().unwrap(), 63);
        assert_eq!(reader.read_se::<i32>().unwrap(), -26);
        assert_eq!(reader.read_bits::<u32>(24).unwrap(), 0);
        assert_eq!(reader.read_se::<i32>().unwrap(), 7);
        assert!(!reader.has_more_rsbp_data());
    }

    #[test]
    fn escaped_payload_bytes() {
        let cases: [(&[u8], &[u8]); 6] = [
            (&[0, 0, 0], &[0, 0, 3, 0]),
            (&[0, 0, 2], &[0, 0, 3, 2]),
            (&[0, 0, 3, 0xff], &[0, 0, 3, 3, 0xff]),
            (&[7, 0, 0, 1, 0, 0], &[7, 0, 0, 3, 1, 0, 0]),
            (&[0, 0, 0, 0, 1], &[0, 0, 3, 0, 0, 3, 1]),
            (&[0, 0, 4, 0, 0], &[0, 0, 4, 0, 0]),
        ];

        for (input, expected) in cases {
            let buf = written(true, |w| {
                for &byte in input {
                    w.write_f(8, byte).unwrap();
                }
            });
            assert_eq!(buf, expected, "{:02x?}", input);

            let mut reader = BitReader::new(&buf, true);
            for &byte in input {
                assert_eq!(reader.read_bits::<u8>(8).unwrap(), byte);
            }

            // Without escaping the bytes go through untouched.
            let raw = written(false, |w| {
                for &byte in input {
                    w.write_f(8, byte).unwrap();
                }
            });
            assert_eq!(raw, input);
        }
    }

    #[test]
    fn emulation_prevention_round_trip() {
        let mut inputs: Vec<Vec<u8>> = vec![
            vec![],
            vec![0x00],
            vec![0x00, 0x00],
            vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            vec![0x00, 0x00, 0x03, 0x00, 0x00, 0x03],
            vec![0x01, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x03, 0xff],
        ];

        // Every 3-byte combination of the interesting values.
        let interesting = [0x00u8, 0x01, 0x02, 0x03, 0x04, 0xff];
        for a in interesting {
            for b in interesting {
                for c in interesting {
                    inputs.push(vec![0x00, 0x00, a, b, c, 0x00, 0x00]);
                }
            }
        }

        for input in inputs {
            let escaped = add_emulation_prevention(&input).unwrap();
            for (i, w) in escaped.windows(3).enumerate() {
                if w[0] == 0 && w[1] == 0 {
                    assert!(w[2] > 0x02, "{:02x?} -> {:02x?}", input, escaped);
                    if w[2] == 0x03 {
                        // Only inserted bytes, which always precede a byte <= 3.
                        assert!(escaped[i + 3] <= 0x03, "{:02x?} -> {:02x?}", input, escaped);
                    }
                }
            }
            assert_eq!(remove_emulation_prevention(&escaped), input);
        }
    }

    #[test]
    fn escaping_into_a_full_buffer_fails() {
        // Three payload bytes grow to four once escaped.
        let mut buf = [0u8; 3];
        let mut writer = NaluWriter::new(&mut buf[..], true);
        writer.write_f(8, 0u8).unwrap();
        writer.write_f(8, 0u8).unwrap();
        let err = writer.write_f(8, 1u8).unwrap_err();
        assert!(err.is_overflow());
        drop(writer);

        let mut escaper = Escaper::new(&mut buf[..], true);
        let err = escaper.write_all(&[0x00, 0x00, 0x01]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WriteZero);
    }

    #[test]
    fn pack_nal_header() {
        let nal = pack_nal(NaluType::SpsNut, &[0x01, 0x00, 0x00, 0x01]).unwrap();
        assert_eq!(
            nal,
            vec![0x00, 0x00, 0x00, 0x01, 0x42, 0x01, 0x01, 0x00, 0x00, 0x03, 0x01]
        );

        let nal = pack_nal(NaluType::IdrWRadl, &[0x80]).unwrap();
        assert_eq!(nal, vec![0x00, 0x00, 0x00, 0x01, 0x26, 0x01, 0x80]);
    }
}
