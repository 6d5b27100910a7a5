// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod h265;

use thiserror::Error;

use crate::codec::h265::hvcc::HvccError;
use crate::codec::h265::level::PtlError;
use crate::codec::h265::synthesizer::SynthesizerError;

/// Rate control mode. Only what ends up in the headers depends on it here.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RateControl {
    /// Constant QP, the bitrate is whatever the QP gives.
    #[default]
    Cqp,
    /// Constant bitrate, signalled with cbr_flag.
    Cbr,
    Vbr,
    /// Intelligent constant quality.
    Icq,
    /// Quality defined variable bitrate.
    Qvbr,
}

impl RateControl {
    /// Whether the mode targets a bitrate, which is then signalled in the HRD.
    pub fn has_bitrate(&self) -> bool {
        matches!(self, RateControl::Cbr | RateControl::Vbr | RateControl::Qvbr)
    }
}

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("no allowed profile supports the requested format")]
    UnsupportedProfile,
    #[error("no level accommodates the requested stream")]
    UnsupportedLevel,
    #[error("unsupported chroma format {0}")]
    UnsupportedChromaFormat(u8),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to allocate encoder resources")]
    AllocationFailed,
    #[error("coded header did not fit the output buffer")]
    BitstreamOverflow,
    #[error("encoder state is inconsistent")]
    InvalidInternalState,
    #[error(transparent)]
    Synthesizer(SynthesizerError),
    #[error(transparent)]
    Hvcc(#[from] HvccError),
}

impl From<PtlError> for EncodeError {
    fn from(err: PtlError) -> Self {
        match err {
            PtlError::UnsupportedChromaFormat(idc) => EncodeError::UnsupportedChromaFormat(idc),
            PtlError::UnsupportedProfile => EncodeError::UnsupportedProfile,
            PtlError::UnsupportedLevel => EncodeError::UnsupportedLevel,
        }
    }
}

impl From<SynthesizerError> for EncodeError {
    fn from(err: SynthesizerError) -> Self {
        if err.is_overflow() {
            EncodeError::BitstreamOverflow
        } else {
            EncodeError::Synthesizer(err)
        }
    }
}

pub type EncodeResult<T> = Result<T, EncodeError>;

/// Per-frame input of the encoder.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Presentation timestamp, in nanoseconds.
    pub timestamp: u64,
    pub force_keyframe: bool,
}

/// Coded picture, with the metadata of the frame it came from.
#[derive(Debug)]
pub struct CodedBitstreamBuffer {
    pub metadata: FrameMetadata,
    /// Annex B NAL units, parameter sets included when they precede the picture.
    pub bitstream: Vec<u8>,
}

impl CodedBitstreamBuffer {
    pub fn new(metadata: FrameMetadata, bitstream: Vec<u8>) -> Self {
        Self {
            metadata,
            bitstream,
        }
    }
}

impl From<CodedBitstreamBuffer> for Vec<u8> {
    fn from(value: CodedBitstreamBuffer) -> Self {
        value.bitstream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream_utils::BitWriterError;
    use crate::codec::h265::nalu_writer::NaluWriterError;

    #[test]
    fn synthesizer_overflow_maps_to_bitstream_overflow() {
        let err = SynthesizerError::NaluWriter(NaluWriterError::BitWriterError(
            BitWriterError::Overflow,
        ));
        assert!(matches!(EncodeError::from(err), EncodeError::BitstreamOverflow));

        let err = SynthesizerError::Unsupported;
        assert!(matches!(EncodeError::from(err), EncodeError::Synthesizer(_)));
    }

    #[test]
    fn ptl_errors() {
        assert!(matches!(
            EncodeError::from(PtlError::UnsupportedChromaFormat(5)),
            EncodeError::UnsupportedChromaFormat(5)
        ));
        assert!(matches!(
            EncodeError::from(PtlError::UnsupportedLevel),
            EncodeError::UnsupportedLevel
        ));
    }

    #[test]
    fn bitrate_modes() {
        assert!(!RateControl::Cqp.has_bitrate());
        assert!(!RateControl::Icq.has_bitrate());
        assert!(RateControl::Cbr.has_bitrate());
        assert!(RateControl::Qvbr.has_bitrate());
    }
}
