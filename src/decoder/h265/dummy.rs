// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Backend that decodes nothing and records every call, for exercising the
//! decoding process on synthesized streams.

use crate::codec::h265::dpb::DpbEntry;
use crate::codec::h265::parser::Pps;
use crate::codec::h265::parser::Slice;
use crate::codec::h265::parser::SliceType;
use crate::codec::h265::parser::Sps;
use crate::codec::h265::picture::PictureData;
use crate::decoder::h265::rps::RefPicSet;
use crate::decoder::h265::H265DecoderBackend;
use crate::decoder::BackendResult;

/// Stands for a decoded surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DummyHandle {
    pub poc: i32,
    pub timestamp: u64,
}

/// A slice as seen by the backend, with its reference lists as POCs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedSlice {
    pub poc: i32,
    pub slice_type: SliceType,
    pub ref_pic_list0: Vec<Option<i32>>,
    pub ref_pic_list1: Vec<Option<i32>>,
}

#[derive(Debug, Default)]
pub struct DummyBackend {
    /// Number of sequences started.
    pub num_sequences: usize,
    /// POCs of the submitted pictures, in decoding order.
    pub submitted: Vec<i32>,
    pub slices: Vec<DecodedSlice>,
}

fn pocs(list: &[Option<DpbEntry<DummyHandle>>]) -> Vec<Option<i32>> {
    list.iter()
        .map(|e| e.as_ref().map(|e| e.pic.pic_order_cnt_val))
        .collect()
}

impl H265DecoderBackend for DummyBackend {
    type Picture = DummyHandle;
    type Handle = DummyHandle;

    fn new_sequence(&mut self, _: &Sps) -> BackendResult<()> {
        self.num_sequences += 1;
        Ok(())
    }

    fn new_picture(&mut self, picture: &PictureData, timestamp: u64) -> BackendResult<DummyHandle> {
        Ok(DummyHandle {
            poc: picture.pic_order_cnt_val,
            timestamp,
        })
    }

    fn decode_slice(
        &mut self,
        picture: &mut DummyHandle,
        slice: &Slice,
        _: &Sps,
        _: &Pps,
        _: &RefPicSet,
        ref_pic_list0: &[Option<DpbEntry<DummyHandle>>],
        ref_pic_list1: &[Option<DpbEntry<DummyHandle>>],
    ) -> BackendResult<()> {
        self.slices.push(DecodedSlice {
            poc: picture.poc,
            slice_type: slice.header.type_,
            ref_pic_list0: pocs(ref_pic_list0),
            ref_pic_list1: pocs(ref_pic_list1),
        });

        Ok(())
    }

    fn submit_picture(&mut self, picture: DummyHandle) -> BackendResult<DummyHandle> {
        self.submitted.push(picture.poc);
        Ok(picture)
    }
}
