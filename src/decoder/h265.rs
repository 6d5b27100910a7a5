// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.265 decoding context: drives the POC, RPS and DPB processes for each
//! coded picture and hands the slices to a backend.

pub mod dummy;
pub mod rps;

use std::io::Cursor;
use std::rc::Rc;

use crate::bitstream_utils::BitReader;
use crate::codec::h265::dpb::BumpingLimits;
use crate::codec::h265::dpb::Dpb;
use crate::codec::h265::dpb::DpbEntry;
use crate::codec::h265::parser::Nalu;
use crate::codec::h265::parser::NaluType;
use crate::codec::h265::parser::Parser;
use crate::codec::h265::parser::Pps;
use crate::codec::h265::parser::Slice;
use crate::codec::h265::parser::Sps;
use crate::codec::h265::parser::MAX_PPS_COUNT;
use crate::codec::h265::picture::PictureData;
use crate::decoder::h265::rps::RefPicSet;
use crate::decoder::BackendResult;
use crate::decoder::DecodeError;
use crate::decoder::DecodedPicture;
use crate::decoder::ReadyFramesQueue;
use crate::Resolution;

/// Backend methods specific to H.265.
pub trait H265DecoderBackend {
    /// Backend-specific type representing a frame being decoded.
    type Picture;
    /// Handle to a decoded surface. Kept in the DPB while the picture is used
    /// for reference and returned to the client on output.
    type Handle: Clone;

    /// Called when a new SPS is activated.
    fn new_sequence(&mut self, sps: &Sps) -> BackendResult<()>;

    /// Called when the decoder determines that a frame was found.
    fn new_picture(&mut self, picture: &PictureData, timestamp: u64)
        -> BackendResult<Self::Picture>;

    /// Called to dispatch a decode operation to the backend.
    #[allow(clippy::too_many_arguments)]
    fn decode_slice(
        &mut self,
        picture: &mut Self::Picture,
        slice: &Slice,
        sps: &Sps,
        pps: &Pps,
        rps: &RefPicSet,
        ref_pic_list0: &[Option<DpbEntry<Self::Handle>>],
        ref_pic_list1: &[Option<DpbEntry<Self::Handle>>],
    ) -> BackendResult<()>;

    /// Called when the decoder wants the backend to finish the decoding
    /// operations for `picture`. At this point, `decode_slice` has been called
    /// for all slices.
    fn submit_picture(&mut self, picture: Self::Picture) -> BackendResult<Self::Handle>;
}

enum BumpingType {
    BeforeDecoding,
    AfterDecoding,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DecodingState {
    /// No usable parameter sets yet. Only parameter sets are processed.
    AwaitingStreamInfo,
    /// Decoding is in progress.
    Decoding,
    /// Flushed. Decoding resumes at the next SPS or random access point.
    Reset,
}

/// Keeps track of the last values seen, to detect a new sequence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct NegotiationInfo {
    coded_resolution: Resolution,
    general_profile_idc: u8,
    bit_depth_luma_minus8: u8,
    bit_depth_chroma_minus8: u8,
    chroma_format_idc: u8,
}

impl From<&Sps> for NegotiationInfo {
    fn from(sps: &Sps) -> Self {
        NegotiationInfo {
            coded_resolution: Resolution {
                width: sps.width(),
                height: sps.height(),
            },
            general_profile_idc: sps.profile_tier_level.general.profile_idc,
            bit_depth_luma_minus8: sps.bit_depth_luma_minus8,
            bit_depth_chroma_minus8: sps.bit_depth_chroma_minus8,
            chroma_format_idc: sps.chroma_format_idc,
        }
    }
}

/// State of the picture being currently decoded.
///
/// Kept between calls to `decode` that carry slices of the same picture.
struct CurrentPicState<B: H265DecoderBackend> {
    /// Data for the current picture as extracted from the stream.
    pic: PictureData,
    /// Backend-specific data for that picture.
    backend_pic: B::Picture,
    /// The RPS of the picture, derived from its first slice.
    rps: RefPicSet,
}

impl<H> From<DpbEntry<H>> for DecodedPicture<H> {
    fn from(entry: DpbEntry<H>) -> Self {
        DecodedPicture {
            poc: entry.pic.pic_order_cnt_val,
            timestamp: entry.pic.timestamp,
            handle: entry.handle,
        }
    }
}

/// Reads the PPS id of a slice segment without parsing the rest of it.
fn slice_pps_id(nalu: &Nalu) -> anyhow::Result<u8> {
    let mut r = BitReader::new(nalu.payload(), true);

    // first_slice_segment_in_pic_flag
    r.skip_bits(1)?;
    if nalu.header.type_.is_irap() {
        // no_output_of_prior_pics_flag
        r.skip_bits(1)?;
    }

    Ok(r.read_ue_max(63)?)
}

/// A H.265 decoder working on one NAL unit at a time.
///
/// # Accepted input
///
/// [`DecoderContext::decode`] processes exactly one NAL unit of input per
/// call, and returns the number of bytes until the end of this NAL unit. This
/// makes it possible to call it repeatedly on an unsplit Annex B stream,
/// shrinking it by the number of bytes processed after each call, until the
/// stream ends up being empty.
pub struct DecoderContext<B: H265DecoderBackend> {
    /// A parser to extract bitstream metadata.
    parser: Parser,
    backend: B,

    decoding_state: DecodingState,
    /// Keeps track of the last values seen to detect new sequences.
    negotiation_info: NegotiationInfo,

    /// The decoded picture buffer.
    dpb: Dpb<B::Handle>,
    bumping_limits: BumpingLimits,

    /// The current active SPS id.
    cur_sps_id: u8,

    /// Set after an end of sequence NAL unit.
    first_picture_after_eos: bool,
    /// Whether the next picture is the first one in the bitstream in decoding
    /// order.
    first_picture_in_bitstream: bool,
    /// prevTid0Pic of 8.3.1.
    prev_tid_0_pic: Option<PictureData>,

    /// MaxPicOrderCntLsb of the active SPS.
    max_pic_order_cnt_lsb: i32,
    /// The value of NoRaslOutputFlag for the last IRAP picture.
    irap_no_rasl_output_flag: bool,

    /// The picture currently being decoded. Its slices may arrive in
    /// different calls to `decode`.
    current_pic: Option<CurrentPicState<B>>,

    /// PPS NAL units that could not be parsed yet because their SPS is
    /// missing, with their start code. At most one per PPS id.
    pending_pps: Vec<(u8, Vec<u8>)>,

    ready_queue: ReadyFramesQueue<B::Handle>,
    num_dropped: usize,
}

impl<B: H265DecoderBackend> DecoderContext<B> {
    pub fn new(backend: B) -> Self {
        Self {
            parser: Default::default(),
            backend,
            decoding_state: DecodingState::AwaitingStreamInfo,
            negotiation_info: Default::default(),
            dpb: Default::default(),
            bumping_limits: Default::default(),
            cur_sps_id: 0,
            first_picture_after_eos: false,
            first_picture_in_bitstream: true,
            prev_tid_0_pic: None,
            max_pic_order_cnt_lsb: 16,
            irap_no_rasl_output_flag: false,
            current_pic: None,
            pending_pps: Default::default(),
            ready_queue: Default::default(),
            num_dropped: 0,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn dpb(&self) -> &Dpb<B::Handle> {
        &self.dpb
    }

    /// Number of NAL units or pictures that were dropped instead of decoded.
    pub fn num_dropped(&self) -> usize {
        self.num_dropped
    }

    /// Number of pictures waiting to be retrieved with `next_output`.
    pub fn num_ready(&self) -> usize {
        self.ready_queue.len()
    }

    /// Returns the next picture in output order, if any.
    pub fn next_output(&mut self) -> Option<DecodedPicture<B::Handle>> {
        (&mut self.ready_queue).next()
    }

    /// Whether a new sequence starts with `sps`.
    fn negotiation_possible(&self, sps: &Sps) -> bool {
        NegotiationInfo::from(sps) != self.negotiation_info
            || self.dpb.max_num_pics() != sps.max_dpb_size()
    }

    /// Makes `sps` the active SPS, starting a new sequence if its parameters
    /// differ from the previous one.
    fn activate_sps(&mut self, sps: &Sps) -> Result<(), DecodeError> {
        if self.negotiation_possible(sps) {
            log::debug!(
                "New sequence: {}x{}, DPB size {}",
                sps.width(),
                sps.height(),
                sps.max_dpb_size()
            );

            // Output everything decoded with the previous parameters.
            self.drain()?;
            self.backend.new_sequence(sps)?;
            self.negotiation_info = NegotiationInfo::from(sps);
            self.dpb.set_max_num_pics(sps.max_dpb_size());
        }

        self.bumping_limits = BumpingLimits::from(sps);
        self.max_pic_order_cnt_lsb = sps.max_pic_order_cnt_lsb();

        Ok(())
    }

    fn output(&mut self, pics: Vec<DpbEntry<B::Handle>>) {
        if pics.is_empty() {
            return;
        }

        log::debug!(
            "Adding POCs {:?} to the ready queue",
            pics.iter()
                .map(|e| e.pic.pic_order_cnt_val)
                .collect::<Vec<_>>()
        );
        log::trace!("{:#?}", pics.iter().map(|e| &e.pic).collect::<Vec<_>>());

        self.ready_queue
            .extend(pics.into_iter().map(DecodedPicture::from));
    }

    /// Drain the decoder, outputting all pending pictures.
    fn drain(&mut self) -> Result<(), DecodeError> {
        log::debug!("Draining the decoder");

        // Finish the current picture if there is one pending.
        if let Some(cur_pic) = self.current_pic.take() {
            self.finish_picture(cur_pic)?;
        }

        let pics = self.dpb.drain();
        self.output(pics);
        self.dpb.clear();

        Ok(())
    }

    /// Bumps the DPB if needed.
    fn bump_as_needed(&mut self, bumping_type: BumpingType) {
        let needs_bumping = match bumping_type {
            BumpingType::BeforeDecoding => Dpb::<B::Handle>::needs_bumping,
            BumpingType::AfterDecoding => Dpb::<B::Handle>::needs_additional_bumping,
        };

        let mut pics = vec![];
        while needs_bumping(&self.dpb, &self.bumping_limits) {
            match self.dpb.bump(false) {
                Some(pic) => pics.push(pic),
                None => break,
            }
        }

        self.output(pics);
    }

    /// See C.5.2.2.
    fn update_dpb_before_decoding(
        &mut self,
        cur_pic: &PictureData,
        first_picture_in_bitstream: bool,
    ) -> Result<(), DecodeError> {
        if cur_pic.is_irap && cur_pic.no_rasl_output_flag && !first_picture_in_bitstream {
            if cur_pic.no_output_of_prior_pics_flag {
                if !self.dpb.is_empty() {
                    log::debug!("Discarding {} pictures without output", self.dpb.len());
                }
                self.dpb.clear();
            } else {
                self.drain()?;
            }
        } else {
            self.dpb.remove_unused();
            self.bump_as_needed(BumpingType::BeforeDecoding);
        }

        Ok(())
    }

    /// Called once per picture to start it. Returns `None` if the picture is
    /// to be skipped.
    fn begin_picture(
        &mut self,
        timestamp: u64,
        slice: &Slice,
    ) -> Result<Option<CurrentPicState<B>>, DecodeError> {
        let pps = Rc::clone(
            self.parser
                .get_pps(slice.header.pic_parameter_set_id)
                .ok_or(DecodeError::InvalidHeaderState)?,
        );
        let sps = Rc::clone(
            self.parser
                .get_sps(pps.seq_parameter_set_id)
                .ok_or(DecodeError::InvalidHeaderState)?,
        );

        self.cur_sps_id = sps.seq_parameter_set_id;
        self.activate_sps(&sps)?;

        let first_picture_in_bitstream = self.first_picture_in_bitstream;
        let pic = PictureData::new_from_slice(
            slice,
            first_picture_in_bitstream,
            self.first_picture_after_eos,
            self.prev_tid_0_pic.as_ref(),
            self.max_pic_order_cnt_lsb,
            timestamp,
        );

        self.first_picture_after_eos = false;
        self.first_picture_in_bitstream = false;

        if pic.is_irap {
            self.irap_no_rasl_output_flag = pic.no_rasl_output_flag;
        } else if pic.nalu_type.is_rasl() && self.irap_no_rasl_output_flag {
            // The RASL picture may reference pictures that are not present in
            // the bitstream. It is not output and not used as a reference.
            log::debug!(
                "Dropping RASL picture POC {}, it is not decodable",
                pic.pic_order_cnt_val
            );
            self.num_dropped += 1;

            return Ok(None);
        }

        log::debug!("Decode picture POC {}", pic.pic_order_cnt_val);

        let mut rps = RefPicSet::derive(&slice.header, &sps, &pic, self.max_pic_order_cnt_lsb)?;
        rps.mark(&mut self.dpb, self.max_pic_order_cnt_lsb);

        self.update_dpb_before_decoding(&pic, first_picture_in_bitstream)?;

        let backend_pic = self.backend.new_picture(&pic, timestamp)?;

        Ok(Some(CurrentPicState {
            pic,
            backend_pic,
            rps,
        }))
    }

    /// Handle a slice. Called once per slice NALU.
    fn handle_slice(
        &mut self,
        pic: &mut CurrentPicState<B>,
        slice: &Slice,
    ) -> Result<(), DecodeError> {
        let pps = Rc::clone(
            self.parser
                .get_pps(slice.header.pic_parameter_set_id)
                .ok_or(DecodeError::InvalidHeaderState)?,
        );
        let sps = Rc::clone(
            self.parser
                .get_sps(pps.seq_parameter_set_id)
                .ok_or(DecodeError::InvalidHeaderState)?,
        );

        if sps.seq_parameter_set_id != self.cur_sps_id {
            return Err(anyhow::anyhow!("SPS changed in the middle of a picture").into());
        }

        let lists = pic.rps.build_ref_pic_lists(&slice.header, &self.dpb)?;

        self.backend.decode_slice(
            &mut pic.backend_pic,
            slice,
            &sps,
            &pps,
            &pic.rps,
            &lists.ref_pic_list0,
            &lists.ref_pic_list1,
        )?;

        Ok(())
    }

    fn finish_picture(&mut self, pic: CurrentPicState<B>) -> Result<(), DecodeError> {
        log::debug!("Finishing picture POC {:?}", pic.pic.pic_order_cnt_val);

        let handle = self.backend.submit_picture(pic.backend_pic)?;
        let pic = pic.pic;

        // 8.3.1
        if pic.valid_for_prev_tid0_pic {
            self.prev_tid_0_pic = Some(pic.clone());
        }

        // First store the current picture in the DPB, only then we should
        // decide whether to bump.
        self.dpb.store_picture(pic, handle)?;
        self.bump_as_needed(BumpingType::AfterDecoding);

        Ok(())
    }

    fn process_slice(&mut self, timestamp: u64, nalu: Nalu) -> Result<(), DecodeError> {
        let pps_id = slice_pps_id(&nalu)?;
        let has_sets = self
            .parser
            .get_pps(pps_id)
            .is_some_and(|pps| self.parser.get_sps(pps.seq_parameter_set_id).is_some());
        if !has_sets {
            return Err(DecodeError::InvalidHeaderState);
        }

        let slice = self.parser.parse_slice_header(nalu)?;
        let first_slice_segment_in_pic_flag = slice.header.first_slice_segment_in_pic_flag;

        let cur_pic = match self.current_pic.take() {
            Some(cur_pic) if first_slice_segment_in_pic_flag => {
                self.finish_picture(cur_pic)?;
                self.begin_picture(timestamp, &slice)?
            }
            Some(cur_pic) => Some(cur_pic),
            None if first_slice_segment_in_pic_flag => self.begin_picture(timestamp, &slice)?,
            None => {
                log::debug!("Skipping slice of a picture that is not being decoded");
                None
            }
        };

        // The picture may have been dropped in begin_picture().
        if let Some(mut cur_pic) = cur_pic {
            self.handle_slice(&mut cur_pic, &slice)?;
            self.current_pic = Some(cur_pic);
        }

        Ok(())
    }

    fn process_nalu(&mut self, timestamp: u64, nalu: Nalu) -> Result<(), DecodeError> {
        log::debug!(
            "Processing NALU {:?}, length is {}",
            nalu.header.type_,
            nalu.data.len()
        );

        match nalu.header.type_ {
            NaluType::VpsNut => {
                self.parser.parse_vps(&nalu)?;
            }
            NaluType::SpsNut => {
                self.parser.parse_sps(&nalu)?;

                // Try parsing the pending PPSs again.
                for (pps_id, data) in std::mem::take(&mut self.pending_pps) {
                    let mut cursor = Cursor::new(data.as_slice());
                    let parsed = Nalu::next(&mut cursor)
                        .and_then(|nalu| self.parser.parse_pps(&nalu).map(|_| ()));
                    if parsed.is_err() {
                        self.pending_pps.push((pps_id, data));
                    }
                }
            }
            NaluType::PpsNut => {
                if let Err(e) = self.parser.parse_pps(&nalu) {
                    let pps_id = BitReader::new(nalu.payload(), true)
                        .read_ue_max::<u8>(MAX_PPS_COUNT as u32 - 1);
                    match pps_id {
                        Ok(pps_id) => {
                            log::debug!("Keeping PPS {} for later: {:#}", pps_id, e);
                            // A later PPS with the same id supersedes the queued one.
                            self.pending_pps.retain(|(id, _)| *id != pps_id);
                            let mut data = vec![0, 0, 1];
                            data.extend_from_slice(nalu.data);
                            self.pending_pps.push((pps_id, data));
                        }
                        Err(_) => log::warn!("Dropping PPS without a valid id: {:#}", e),
                    }
                }
            }
            t if t.is_slice() => self.process_slice(timestamp, nalu)?,
            NaluType::EosNut => {
                self.drain()?;
                self.first_picture_after_eos = true;
            }
            NaluType::EobNut => {
                self.drain()?;
                self.first_picture_in_bitstream = true;
            }
            other => {
                log::debug!("Unsupported NAL unit type {:?}", other);
            }
        }

        Ok(())
    }

    /// Decodes the first NAL unit of `bitstream` and returns the number of
    /// bytes consumed.
    ///
    /// Malformed NAL units, and slices whose parameter sets are unknown, are
    /// dropped and counted in `num_dropped` rather than returned as errors.
    pub fn decode(&mut self, timestamp: u64, bitstream: &[u8]) -> Result<usize, DecodeError> {
        let mut cursor = Cursor::new(bitstream);
        let nalu = Nalu::next(&mut cursor).map_err(|e| {
            log::debug!("No NAL unit found: {:#}", e);
            DecodeError::BitstreamUnderrun
        })?;

        let nalu_len = nalu.end_offset();
        let nalu_type = nalu.header.type_;
        let is_parameter_set = matches!(
            nalu_type,
            NaluType::VpsNut | NaluType::SpsNut | NaluType::PpsNut
        );

        // In the Reset state we can resume decoding from any random access
        // point.
        if self.decoding_state == DecodingState::Reset
            && (nalu_type == NaluType::SpsNut || nalu_type.is_irap())
        {
            self.decoding_state = DecodingState::Decoding;
        }

        let res = match self.decoding_state {
            DecodingState::Decoding => self.process_nalu(timestamp, nalu),
            // Process parameter sets, but skip input until we get information
            // from the stream.
            DecodingState::AwaitingStreamInfo | DecodingState::Reset if is_parameter_set => {
                self.process_nalu(timestamp, nalu)
            }
            DecodingState::AwaitingStreamInfo | DecodingState::Reset => {
                if nalu_type.is_slice() {
                    log::debug!("Skipping {:?} slice, not decoding yet", nalu_type);
                    self.num_dropped += 1;
                }
                Ok(())
            }
        };

        match res {
            Ok(()) => {
                if self.decoding_state == DecodingState::AwaitingStreamInfo
                    && is_parameter_set
                    && nalu_type != NaluType::VpsNut
                    && (nalu_type == NaluType::SpsNut || self.pending_pps.is_empty())
                {
                    self.decoding_state = DecodingState::Decoding;
                }
            }
            Err(DecodeError::InvalidHeaderState) => {
                log::warn!(
                    "Dropping {:?} slice: its parameter sets are not active",
                    nalu_type
                );
                self.num_dropped += 1;
                self.decoding_state = DecodingState::AwaitingStreamInfo;
            }
            Err(DecodeError::DecoderError(e)) => {
                log::warn!("Dropping {:?} NAL unit: {:#}", nalu_type, e);
                self.num_dropped += 1;
            }
            Err(e) => return Err(e),
        }

        Ok(nalu_len)
    }

    /// Outputs every pending picture and resets the decoder. Decoding resumes
    /// at the next SPS or random access point. Calling it again has no
    /// effect.
    pub fn flush(&mut self) -> Result<(), DecodeError> {
        self.drain()?;
        self.prev_tid_0_pic = None;
        self.first_picture_in_bitstream = true;
        if self.decoding_state == DecodingState::Decoding {
            self.decoding_state = DecodingState::Reset;
        }

        Ok(())
    }
}
