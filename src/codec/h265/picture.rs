// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::codec::h265::parser::NaluType;
use crate::codec::h265::parser::Slice;
use crate::codec::h265::parser::SliceType;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Reference {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

/// Per-picture state of the decoding process, taken from the first slice
/// segment of the picture.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct PictureData {
    // Derived variables of 8.1.3 and 8.3.1.
    pub nalu_type: NaluType,
    pub slice_type: SliceType,
    pub is_irap: bool,
    pub no_rasl_output_flag: bool,
    pub pic_output_flag: bool,
    pub valid_for_prev_tid0_pic: bool,
    pub slice_pic_order_cnt_lsb: i32,
    pub pic_order_cnt_msb: i32,
    pub pic_order_cnt_val: i32,
    pub no_output_of_prior_pics_flag: bool,

    // Internal state.
    pub first_picture_after_eos: bool,
    pub(crate) reference: Reference,
    pub pic_latency_cnt: u32,
    pub needed_for_output: bool,
    pub timestamp: u64,
}

impl PictureData {
    /// Runs the first steps of decoding a picture (8.1.3) on its first slice,
    /// picture order count included (8.3.1).
    pub fn new_from_slice(
        slice: &Slice,
        first_picture_in_bitstream: bool,
        first_picture_after_eos: bool,
        prev_tid0_pic: Option<&PictureData>,
        max_pic_order_cnt_lsb: i32,
        timestamp: u64,
    ) -> Self {
        let hdr = &slice.header;
        let nalu_type = slice.nalu.header.type_;
        let is_irap = nalu_type.is_irap();

        // HandleCraAsBlaFlag is always 0: it can only be set by external
        // means, which are not provided.

        let slice_pic_order_cnt_lsb: i32 = hdr.pic_order_cnt_lsb.into();

        // NoRaslOutputFlag is 1 for each IDR and BLA picture, and for each
        // CRA picture that is the first picture in the bitstream or the first
        // one following an end of sequence NAL unit.
        let no_rasl_output_flag = nalu_type.is_idr()
            || nalu_type.is_bla()
            || (nalu_type.is_cra() && first_picture_in_bitstream)
            || first_picture_after_eos;

        let pic_output_flag = if nalu_type.is_rasl() && no_rasl_output_flag {
            false
        } else {
            hdr.pic_output_flag
        };

        let pic_order_cnt_msb = match prev_tid0_pic {
            Some(prev) if !(is_irap && no_rasl_output_flag) => {
                // Equation (8-1)
                let prev_lsb = prev.slice_pic_order_cnt_lsb;
                let prev_msb = prev.pic_order_cnt_msb;
                let half = max_pic_order_cnt_lsb / 2;

                if slice_pic_order_cnt_lsb < prev_lsb
                    && prev_lsb - slice_pic_order_cnt_lsb >= half
                {
                    prev_msb + max_pic_order_cnt_lsb
                } else if slice_pic_order_cnt_lsb > prev_lsb
                    && slice_pic_order_cnt_lsb - prev_lsb > half
                {
                    prev_msb - max_pic_order_cnt_lsb
                } else {
                    prev_msb
                }
            }
            _ => 0,
        };

        // Candidate for prevTid0Pic of the pictures that follow.
        let valid_for_prev_tid0_pic = slice.nalu.header.temporal_id() == 0
            && !nalu_type.is_radl()
            && !nalu_type.is_rasl()
            && !nalu_type.is_slnr();

        // C.5.2.2: a CRA picture always behaves as if the flag was set.
        let no_output_of_prior_pics_flag =
            if is_irap && no_rasl_output_flag && !first_picture_in_bitstream {
                nalu_type.is_cra() || hdr.no_output_of_prior_pics_flag
            } else {
                false
            };

        let pic = Self {
            nalu_type,
            slice_type: hdr.type_,
            is_irap,
            no_rasl_output_flag,
            no_output_of_prior_pics_flag,
            pic_output_flag,
            valid_for_prev_tid0_pic,
            slice_pic_order_cnt_lsb,
            pic_order_cnt_msb,
            // Equation (8-2)
            pic_order_cnt_val: pic_order_cnt_msb + slice_pic_order_cnt_lsb,
            first_picture_after_eos,
            reference: Default::default(),
            pic_latency_cnt: 0,
            needed_for_output: false,
            timestamp,
        };

        log::debug!(
            "{:?} picture: POC {} (msb {}, lsb {}), NoRaslOutputFlag {}",
            nalu_type,
            pic.pic_order_cnt_val,
            pic_order_cnt_msb,
            slice_pic_order_cnt_lsb,
            no_rasl_output_flag
        );

        pic
    }

    /// Marked as used for short-term or long-term reference.
    pub fn is_ref(&self) -> bool {
        !matches!(self.reference, Reference::None)
    }

    pub fn set_reference(&mut self, reference: Reference) {
        log::debug!(
            "POC {} is now {:?}",
            self.pic_order_cnt_val,
            reference
        );

        self.reference = reference;
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::codec::h265::nalu_writer::pack_nal;
    use crate::codec::h265::parser::Nalu;
    use crate::codec::h265::parser::SliceHeader;

    fn picture(
        stream: &[u8],
        pic_order_cnt_lsb: u16,
        first_in_bitstream: bool,
        prev: Option<&PictureData>,
    ) -> PictureData {
        let slice = Slice {
            header: SliceHeader {
                pic_order_cnt_lsb,
                ..Default::default()
            },
            nalu: Nalu::next(&mut Cursor::new(stream)).unwrap(),
        };

        PictureData::new_from_slice(&slice, first_in_bitstream, false, prev, 16, 0)
    }

    #[test]
    fn poc_msb_wraps() {
        let idr = pack_nal(NaluType::IdrWRadl, &[0x80]).unwrap();
        let trail = pack_nal(NaluType::TrailR, &[0x80]).unwrap();

        let first = picture(&idr, 0, true, None);
        assert!(first.no_rasl_output_flag);
        assert!(!first.no_output_of_prior_pics_flag);
        assert_eq!(first.pic_order_cnt_val, 0);

        // A step of half MaxPicOrderCntLsb or more goes backwards.
        let back = picture(&trail, 14, false, Some(&first));
        assert_eq!(back.pic_order_cnt_msb, -16);
        assert_eq!(back.pic_order_cnt_val, -2);

        let p7 = picture(&trail, 7, false, Some(&first));
        assert_eq!(p7.pic_order_cnt_val, 7);
        let p14 = picture(&trail, 14, false, Some(&p7));
        assert_eq!(p14.pic_order_cnt_val, 14);

        // LSB wrapped from 14 to 2.
        let p18 = picture(&trail, 2, false, Some(&p14));
        assert_eq!(p18.pic_order_cnt_msb, 16);
        assert_eq!(p18.pic_order_cnt_val, 18);

        // And backwards again.
        let p15 = picture(&trail, 15, false, Some(&p18));
        assert_eq!(p15.pic_order_cnt_val, 15);
    }

    #[test]
    fn irap_flags() {
        let cra = pack_nal(NaluType::CraNut, &[0x80]).unwrap();
        let first = picture(&cra, 5, true, None);
        assert!(first.no_rasl_output_flag);
        assert_eq!(first.pic_order_cnt_val, 5);

        // A CRA in the middle of the stream keeps the POC chain.
        let middle = picture(&cra, 9, false, Some(&first));
        assert!(!middle.no_rasl_output_flag);
        assert!(!middle.no_output_of_prior_pics_flag);

        let rasl = pack_nal(NaluType::RaslN, &[0x80]).unwrap();
        let rasl = picture(&rasl, 3, false, Some(&first));
        assert!(!rasl.valid_for_prev_tid0_pic);
        assert!(rasl.pic_output_flag);

        let bla = pack_nal(NaluType::BlaWLp, &[0x80]).unwrap();
        let bla = picture(&bla, 2, false, Some(&middle));
        assert!(bla.no_rasl_output_flag);
        assert_eq!(bla.pic_order_cnt_msb, 0);
    }
}
