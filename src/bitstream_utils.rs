// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bit-level reading and writing shared by the H.265 header parser and
//! synthesizer.

use std::io::Cursor;
use std::io::Read;
use std::io::Write;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BitReaderError {
    /// Not enough data left in the stream. The caller may retry with more input.
    #[error("bitstream underrun: reader ran out of bits")]
    Underrun,
    #[error("cannot read {0} bits at once, at most 31")]
    TooManyBitsRequested(usize),
    #[error("invalid exp-golomb code")]
    InvalidExpGolomb,
    #[error("value out of bounds: expected {min} - {max}, got {value}")]
    OutOfRange { min: i64, max: i64, value: i64 },
    #[error("value does not fit the requested type")]
    ConversionFailed,
}

pub type BitReaderResult<T> = std::result::Result<T, BitReaderError>;

/// MSB-first reader over an RBSP or an escaped NAL payload. When `unescape`
/// is set, `emulation_prevention_three_byte`s are dropped as they are met.
#[derive(Clone)]
pub struct BitReader<'a> {
    cursor: Cursor<&'a [u8]>,
    /// Byte being consumed. Its low `bits_in_byte` bits are still unread.
    byte: u8,
    bits_in_byte: usize,
    /// Last two bytes fetched, for spotting `00 00 03`.
    last_two: u16,
    epb_count: usize,
    unescape: bool,
    bits_read: u64,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8], unescape: bool) -> Self {
        Self {
            cursor: Cursor::new(data),
            byte: 0,
            bits_in_byte: 0,
            last_two: 0xffff,
            epb_count: 0,
            unescape,
            bits_read: 0,
        }
    }

    /// u(1) as a flag.
    pub fn read_bit(&mut self) -> BitReaderResult<bool> {
        Ok(self.read_bits::<u32>(1)? != 0)
    }

    /// u(n) for `n` up to 31.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> BitReaderResult<U> {
        if num_bits > 31 {
            return Err(BitReaderError::TooManyBitsRequested(num_bits));
        }

        let mut value = 0u32;
        let mut wanted = num_bits;

        while wanted > 0 {
            if self.bits_in_byte == 0 {
                self.fetch_byte()?;
            }

            let take = wanted.min(self.bits_in_byte);
            let shift = self.bits_in_byte - take;
            let chunk = (u32::from(self.byte) >> shift) & ((1 << take) - 1);

            value = (value << take) | chunk;
            self.bits_in_byte -= take;
            wanted -= take;
        }

        self.bits_read += num_bits as u64;
        U::try_from(value).map_err(|_| BitReaderError::ConversionFailed)
    }

    pub fn skip_bits(&mut self, num_bits: usize) -> BitReaderResult<()> {
        let mut left = num_bits;
        while left > 0 {
            let n = left.min(31);
            self.read_bits::<u32>(n)?;
            left -= n;
        }

        Ok(())
    }

    /// Bits not consumed yet, counting escape bytes not reached yet.
    pub fn num_bits_left(&self) -> usize {
        let unread = self.cursor.get_ref().len() - self.cursor.position() as usize;
        unread * 8 + self.bits_in_byte
    }

    /// Emulation prevention bytes dropped so far.
    pub fn num_epb(&self) -> usize {
        self.epb_count
    }

    /// more_rbsp_data(): false once only the stop bit and zero padding remain.
    pub fn has_more_rsbp_data(&mut self) -> bool {
        if self.bits_in_byte == 0 && self.fetch_byte().is_err() {
            return false;
        }

        let below_next = (1u8 << (self.bits_in_byte - 1)) - 1;
        if self.byte & below_next != 0 {
            return true;
        }

        // The next bit may be the stop bit: look ahead without consuming.
        let rest = &self.cursor.get_ref()[self.cursor.position() as usize..];
        rest.iter().any(|&b| b != 0)
    }

    /// ue(v) over the whole u32 range, which needs up to 32 leading zeros.
    pub fn read_ue<U: TryFrom<u32>>(&mut self) -> BitReaderResult<U> {
        let mut leading_zeros = 0;
        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 32 {
                return Err(BitReaderError::InvalidExpGolomb);
            }
        }

        let mut suffix = 0u64;
        let mut left = leading_zeros;
        while left > 0 {
            let n = left.min(31);
            suffix = (suffix << n) | u64::from(self.read_bits::<u32>(n)?);
            left -= n;
        }

        let code_num = (1u64 << leading_zeros) - 1 + suffix;
        let code_num = u32::try_from(code_num).map_err(|_| BitReaderError::InvalidExpGolomb)?;

        U::try_from(code_num).map_err(|_| BitReaderError::ConversionFailed)
    }

    pub fn read_ue_bounded<U: TryFrom<u32>>(&mut self, min: u32, max: u32) -> BitReaderResult<U> {
        let value = self.read_ue::<u32>()?;
        if !(min..=max).contains(&value) {
            return Err(BitReaderError::OutOfRange {
                min: min.into(),
                max: max.into(),
                value: value.into(),
            });
        }

        U::try_from(value).map_err(|_| BitReaderError::ConversionFailed)
    }

    pub fn read_ue_max<U: TryFrom<u32>>(&mut self, max: u32) -> BitReaderResult<U> {
        self.read_ue_bounded(0, max)
    }

    /// se(v): odd code numbers are positive, even ones zero or negative.
    pub fn read_se<U: TryFrom<i32>>(&mut self) -> BitReaderResult<U> {
        let code_num = i64::from(self.read_ue::<u32>()?);

        let value = if code_num % 2 == 0 {
            -(code_num / 2)
        } else {
            code_num / 2 + 1
        };
        let value = i32::try_from(value).map_err(|_| BitReaderError::ConversionFailed)?;

        U::try_from(value).map_err(|_| BitReaderError::ConversionFailed)
    }

    pub fn read_se_bounded<U: TryFrom<i32>>(&mut self, min: i32, max: i32) -> BitReaderResult<U> {
        let value = self.read_se::<i32>()?;
        if !(min..=max).contains(&value) {
            return Err(BitReaderError::OutOfRange {
                min: min.into(),
                max: max.into(),
                value: value.into(),
            });
        }

        U::try_from(value).map_err(|_| BitReaderError::ConversionFailed)
    }

    /// Bits consumed so far, escape bytes excluded.
    pub fn position(&self) -> u64 {
        self.bits_read
    }

    pub fn is_aligned(&self) -> bool {
        self.bits_in_byte == 0
    }

    fn next_raw_byte(&mut self) -> BitReaderResult<u8> {
        let mut buf = [0u8; 1];
        self.cursor
            .read_exact(&mut buf)
            .map_err(|_| BitReaderError::Underrun)?;
        Ok(buf[0])
    }

    fn fetch_byte(&mut self) -> BitReaderResult<()> {
        let mut byte = self.next_raw_byte()?;

        if self.unescape {
            if self.last_two == 0 && byte == 0x03 {
                self.epb_count += 1;
                byte = self.next_raw_byte()?;
                // The escape byte resets the zero run.
                self.last_two = 0xffff;
            }
            self.last_two = (self.last_two << 8) | u16::from(byte);
        }

        self.byte = byte;
        self.bits_in_byte = 8;
        Ok(())
    }
}

/// Strips emulation-prevention bytes from an escaped NAL payload, yielding the
/// RBSP. A 0x03 is dropped when it follows two zero bytes and is either the
/// last byte or followed by a byte <= 0x03.
pub fn remove_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0usize;

    for (i, &byte) in data.iter().enumerate() {
        if zeros >= 2 && byte == 0x03 {
            let next = data.get(i + 1).copied();
            if next.map_or(true, |b| b <= 0x03) {
                zeros = 0;
                continue;
            }
        }

        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
    }

    out
}

#[derive(Error, Debug)]
pub enum BitWriterError {
    #[error("invalid bit count")]
    InvalidBitCount,
    /// The backing buffer cannot grow any further.
    #[error("bitstream overflow: output buffer is full")]
    Overflow,
    #[error("value cannot be represented as exp-golomb")]
    ExpGolombRange,
    #[error(transparent)]
    Io(std::io::Error),
}

impl From<std::io::Error> for BitWriterError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WriteZero | std::io::ErrorKind::OutOfMemory => {
                BitWriterError::Overflow
            }
            _ => BitWriterError::Io(err),
        }
    }
}

pub type BitWriterResult<T> = std::result::Result<T, BitWriterError>;

/// Append-only MSB-first bit writer over [`std::io::Write`]. Pending bits
/// are flushed, zero padded, on drop.
pub struct BitWriter<W: Write> {
    sink: W,
    /// Bits of `pending` already set, from the most significant one.
    used_bits: u8,
    pending: u8,
}

impl<W: Write> BitWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            used_bits: 0,
            pending: 0,
        }
    }

    /// f(n) for `bits` up to 32. Returns the number of bits written.
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> BitWriterResult<usize> {
        if bits > 32 {
            return Err(BitWriterError::InvalidBitCount);
        }

        let value = value.into();
        for i in (0..bits).rev() {
            self.write_bit((value >> i) & 1 == 1)?;
        }

        Ok(bits)
    }

    pub fn write_bit(&mut self, bit: bool) -> BitWriterResult<()> {
        if bit {
            self.pending |= 0x80 >> self.used_bits;
        }
        self.used_bits += 1;

        if self.used_bits == 8 {
            let byte = std::mem::take(&mut self.pending);
            self.used_bits = 0;
            self.sink.write_all(&[byte])?;
        }

        Ok(())
    }

    /// Writes an unsigned Exp-Golomb code: `k - 1` zero bits followed by the
    /// `k` bit binary form of `value + 1`.
    pub fn write_ue<T: Into<u32>>(&mut self, value: T) -> BitWriterResult<()> {
        let value = u64::from(value.into()) + 1;
        let bits = 64 - value.leading_zeros() as usize;

        for _ in 0..bits - 1 {
            self.write_bit(false)?;
        }

        if bits > 32 {
            self.write_f(bits - 32, (value >> 32) as u32)?;
            self.write_f(32, value as u32)?;
        } else {
            self.write_f(bits, value as u32)?;
        }

        Ok(())
    }

    /// Writes a signed Exp-Golomb code.
    pub fn write_se<T: Into<i32>>(&mut self, value: T) -> BitWriterResult<()> {
        let value: i32 = value.into();
        let abs_value = u64::from(value.unsigned_abs());

        let mapped = if value <= 0 {
            2 * abs_value
        } else {
            2 * abs_value - 1
        };

        self.write_ue(u32::try_from(mapped).map_err(|_| BitWriterError::ExpGolombRange)?)
    }

    /// Writes rbsp_trailing_bits(): a single one bit, then zero bits up to the
    /// next byte boundary.
    pub fn align_to_byte(&mut self) -> BitWriterResult<()> {
        self.write_bit(true)?;

        while self.has_data_pending() {
            self.write_bit(false)?;
        }

        Ok(())
    }

    /// Writes out a partial byte, zero padded, and flushes the sink.
    pub fn flush(&mut self) -> BitWriterResult<()> {
        if self.has_data_pending() {
            let byte = std::mem::take(&mut self.pending);
            self.used_bits = 0;
            self.sink.write_all(&[byte])?;
        }

        Ok(self.sink.flush()?)
    }

    /// Whether some bits are still waiting for their byte to complete.
    pub fn has_data_pending(&self) -> bool {
        self.used_bits != 0
    }

    pub(crate) fn inner_mut(&mut self) -> &mut W {
        &mut self.sink
    }
}

impl<W: Write> Drop for BitWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Dropping unwritten bits: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn written(f: impl FnOnce(&mut BitWriter<&mut Vec<u8>>)) -> Vec<u8> {
        let mut buf = vec![];
        let mut writer = BitWriter::new(&mut buf);
        f(&mut writer);
        drop(writer);
        buf
    }

    #[test]
    fn fixed_length_fields() {
        // forbidden_zero_bit, nal_unit_type 33, nuh_layer_id 0, temporal id 1.
        let header = written(|w| {
            w.write_f(1, false).unwrap();
            w.write_f(6, 33u8).unwrap();
            w.write_f(6, 0u8).unwrap();
            w.write_f(3, 1u8).unwrap();
        });
        assert_eq!(header, vec![0x42, 0x01]);

        // A partial byte is zero padded when the writer goes away.
        assert_eq!(written(|w| assert_eq!(w.write_f(5, 0b10111u8).unwrap(), 5)), vec![0b1011_1000]);

        let mut buf = vec![];
        let mut writer = BitWriter::new(&mut buf);
        assert!(matches!(writer.write_f(33, 0u32), Err(BitWriterError::InvalidBitCount)));
    }

    #[test]
    fn trailing_bits() {
        let buf = written(|w| {
            w.write_f(2, 0b11u8).unwrap();
            w.align_to_byte().unwrap();
            assert!(!w.has_data_pending());
            // On a boundary the stop bit takes a whole byte.
            w.align_to_byte().unwrap();
        });
        assert_eq!(buf, vec![0b1110_0000, 0b1000_0000]);
    }

    #[test]
    fn full_sink_is_an_overflow() {
        let mut storage = [0u8; 1];
        let mut writer = BitWriter::new(&mut storage[..]);
        writer.write_f(8, 0x40u8).unwrap();
        let err = writer.write_f(8, 0x01u8).unwrap_err();
        assert!(matches!(err, BitWriterError::Overflow));
        assert!(!writer.has_data_pending());
    }

    #[test]
    fn exp_golomb_round_trip() {
        let unsigned = [0u32, 1, 5, 31, 32, 1000, 65535, 1 << 24, 0xffff_fffe, u32::MAX];
        let signed = [0i32, 1, -1, -26, 25, 1 << 16, -(1 << 16), i32::MAX, i32::MIN + 1];

        let buf = written(|w| {
            unsigned.iter().for_each(|&v| w.write_ue(v).unwrap());
            signed.iter().for_each(|&v| w.write_se(v).unwrap());
        });

        let mut reader = BitReader::new(&buf, false);
        for v in unsigned {
            assert_eq!(reader.read_ue::<u32>().unwrap(), v);
        }
        for v in signed {
            assert_eq!(reader.read_se::<i32>().unwrap(), v);
        }

        let mut sink = vec![];
        assert!(matches!(
            BitWriter::new(&mut sink).write_se(i32::MIN),
            Err(BitWriterError::ExpGolombRange)
        ));
    }

    #[test]
    fn fields_across_byte_boundaries() {
        let data = [0b1010_0110, 0b0111_1000, 0xc3, 0x80];
        let mut reader = BitReader::new(&data, false);

        assert_eq!(reader.read_bits::<u8>(3).unwrap(), 0b101);
        assert_eq!(reader.read_bits::<u32>(9).unwrap(), 0b0_0110_0111);
        assert_eq!(reader.position(), 12);
        assert_eq!(reader.num_bits_left(), 20);
        assert!(!reader.is_aligned());

        reader.skip_bits(4).unwrap();
        assert!(reader.is_aligned());
        assert_eq!(reader.read_bits::<u8>(8).unwrap(), 0xc3);

        assert!(matches!(
            reader.read_bits::<u32>(32),
            Err(BitReaderError::TooManyBitsRequested(32))
        ));
        assert!(matches!(
            reader.read_bits::<u8>(9),
            Err(BitReaderError::ConversionFailed) | Err(BitReaderError::Underrun)
        ));
    }

    #[test]
    fn more_rbsp_data() {
        // A flag, then the stop bit in the same byte.
        let mut reader = BitReader::new(&[0b1100_0000], false);
        assert!(reader.has_more_rsbp_data());
        assert!(reader.read_bit().unwrap());
        assert!(!reader.has_more_rsbp_data());

        // The stop bit is followed by cabac_zero_words.
        let mut reader = BitReader::new(&[0x5a, 0x80, 0x00, 0x00], false);
        reader.read_bits::<u8>(8).unwrap();
        assert!(!reader.has_more_rsbp_data());

        // A one bit further on means the current one is not the stop bit.
        let mut reader = BitReader::new(&[0x80, 0x01], false);
        assert!(reader.has_more_rsbp_data());
        assert!(reader.read_bit().unwrap());
        assert_eq!(reader.read_bits::<u8>(7).unwrap(), 0);
        assert!(reader.has_more_rsbp_data());

        assert!(!BitReader::new(&[], false).has_more_rsbp_data());
    }

    #[test]
    fn ue_limits() {
        // 32 leading zeros, the longest valid code.
        let mut data = vec![0u8; 4];
        data.extend_from_slice(&[0x80, 0, 0, 0, 0]);
        let mut reader = BitReader::new(&data, false);
        assert_eq!(reader.read_ue::<u32>().unwrap(), u32::MAX);
        assert_eq!(reader.position(), 65);

        let mut reader = BitReader::new(&[0, 0, 0, 0, 0x40], false);
        assert_eq!(reader.read_ue::<u32>().unwrap_err(), BitReaderError::InvalidExpGolomb);

        let mut reader = BitReader::new(&[0, 0], false);
        assert_eq!(reader.read_ue::<u32>().unwrap_err(), BitReaderError::Underrun);

        // codeNum 4, as 00101.
        let mut reader = BitReader::new(&[0b0010_1000], false);
        assert_eq!(
            reader.read_ue_max::<u8>(3).unwrap_err(),
            BitReaderError::OutOfRange { min: 0, max: 3, value: 4 }
        );

        // codeNum 4 is se(v) -2.
        let mut reader = BitReader::new(&[0b0010_1000], false);
        assert_eq!(
            reader.read_se_bounded::<i8>(-1, 1).unwrap_err(),
            BitReaderError::OutOfRange { min: -1, max: 1, value: -2 }
        );
    }

    #[test]
    fn unescaping_reader() {
        let data = [0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x02, 0x00, 0x03];

        let mut reader = BitReader::new(&data, true);
        let bytes: Vec<u8> = (0..6).map(|_| reader.read_bits::<u8>(8).unwrap()).collect();
        assert_eq!(bytes, vec![0x00, 0x00, 0x00, 0x00, 0x02, 0x00]);
        // Only one zero precedes the last 0x03, which is payload.
        assert_eq!(reader.read_bits::<u8>(8).unwrap(), 0x03);
        assert_eq!(reader.num_epb(), 2);
        assert_eq!(reader.position(), 56);

        let mut raw = BitReader::new(&data, false);
        raw.skip_bits(16).unwrap();
        assert_eq!(raw.read_bits::<u8>(8).unwrap(), 0x03);
        assert_eq!(raw.num_epb(), 0);
    }

    #[test]
    fn remove_epb() {
        assert_eq!(
            remove_emulation_prevention(&[0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03]),
            vec![0x00, 0x00, 0x01, 0x00, 0x00]
        );
        // Followed by a byte above 3, the 0x03 is payload.
        assert_eq!(
            remove_emulation_prevention(&[0x00, 0x00, 0x03, 0x04]),
            vec![0x00, 0x00, 0x03, 0x04]
        );
    }
}
