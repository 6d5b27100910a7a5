// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::anyhow;

use crate::codec::h265::parser::Sps;
use crate::codec::h265::picture::PictureData;
use crate::codec::h265::picture::Reference;

/// A picture stored in the DPB together with the backend handle of its
/// decoded surface.
#[derive(Clone, Debug)]
pub struct DpbEntry<T> {
    pub pic: PictureData,
    pub handle: T,
}

/// The output and removal limits of C.5.2 for the active SPS.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BumpingLimits {
    /// sps_max_num_reorder_pics[HighestTid].
    pub max_num_reorder: usize,
    /// SpsMaxLatencyPictures, if a latency limit is signalled.
    pub max_latency_pictures: Option<u32>,
    /// sps_max_dec_pic_buffering_minus1[HighestTid] + 1.
    pub max_dec_pic_buffering: usize,
}

impl From<&Sps> for BumpingLimits {
    fn from(sps: &Sps) -> Self {
        let highest_tid = usize::from(sps.max_sub_layers_minus1);
        let max_num_reorder = sps.max_num_reorder_pics[highest_tid];
        let max_latency_increase_plus1 = sps.max_latency_increase_plus1[highest_tid];

        // Equation (7-9)
        let max_latency_pictures = (max_latency_increase_plus1 != 0)
            .then(|| u32::from(max_num_reorder) + max_latency_increase_plus1 - 1);

        Self {
            max_num_reorder: usize::from(max_num_reorder),
            max_latency_pictures,
            max_dec_pic_buffering: usize::from(sps.max_dec_pic_buffering_minus1[highest_tid]) + 1,
        }
    }
}

pub struct Dpb<T> {
    /// Decoded pictures and their backend handles, in insertion order.
    entries: Vec<DpbEntry<T>>,
    /// sps_max_dec_pic_buffering_minus1 + 1 of the highest sub-layer.
    max_num_pics: usize,
}

impl<T: Clone> Dpb<T> {
    /// Returns an iterator over the pictures stored in the DPB.
    pub fn pictures(&self) -> impl Iterator<Item = &PictureData> {
        self.entries.iter().map(|e| &e.pic)
    }

    /// Returns a mutable iterator over the pictures stored in the DPB.
    pub fn pictures_mut(&mut self) -> impl Iterator<Item = &mut PictureData> {
        self.entries.iter_mut().map(|e| &mut e.pic)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> &[DpbEntry<T>] {
        &self.entries
    }

    pub fn set_max_num_pics(&mut self, max_num_pics: usize) {
        self.max_num_pics = max_num_pics;
    }

    pub fn max_num_pics(&self) -> usize {
        self.max_num_pics
    }

    /// Reference picture with exactly `poc`.
    pub fn find_ref_by_poc(&self, poc: i32) -> Option<&DpbEntry<T>> {
        self.entries
            .iter()
            .find(|e| e.pic.is_ref() && e.pic.pic_order_cnt_val == poc)
    }

    /// Reference picture whose POC matches `poc` on the bits of `mask`.
    pub fn find_ref_by_poc_masked(&self, poc: i32, mask: i32) -> Option<&DpbEntry<T>> {
        self.entries
            .iter()
            .find(|e| e.pic.is_ref() && (e.pic.pic_order_cnt_val & mask) == (poc & mask))
    }

    /// Short-term reference with exactly `poc`.
    pub fn find_short_term_ref_by_poc(&self, poc: i32) -> Option<&DpbEntry<T>> {
        self.entries.iter().find(|e| {
            matches!(e.pic.reference(), Reference::ShortTerm) && e.pic.pic_order_cnt_val == poc
        })
    }

    /// Sets the marking of the reference picture with POC `poc`.
    pub fn set_reference(&mut self, poc: i32, reference: Reference) {
        if let Some(pic) = self
            .pictures_mut()
            .find(|p| p.is_ref() && p.pic_order_cnt_val == poc)
        {
            pic.set_reference(reference);
        }
    }

    /// Bumps until no picture waits for output.
    pub fn drain(&mut self) -> Vec<DpbEntry<T>> {
        log::debug!("Flushing {} DPB entries", self.entries.len());

        let mut pics = vec![];
        while let Some(pic) = self.bump(true) {
            pics.push(pic);
        }

        pics
    }

    fn num_needed_for_output(&self) -> usize {
        self.pictures().filter(|pic| pic.needed_for_output).count()
    }

    fn latency_exceeded(&self, limits: &BumpingLimits) -> bool {
        limits.max_latency_pictures.is_some_and(|max| {
            self.pictures()
                .any(|pic| pic.needed_for_output && pic.pic_latency_cnt >= max)
        })
    }

    /// Whether the DPB needs bumping before the current picture is decoded.
    /// See C.5.2.2.
    pub fn needs_bumping(&self, limits: &BumpingLimits) -> bool {
        self.num_needed_for_output() > limits.max_num_reorder
            || self.latency_exceeded(limits)
            || self.len() >= limits.max_dec_pic_buffering
    }

    /// Whether the DPB needs bumping after the current picture has been
    /// stored. See C.5.2.3.
    pub fn needs_additional_bumping(&self, limits: &BumpingLimits) -> bool {
        self.num_needed_for_output() > limits.max_num_reorder || self.latency_exceeded(limits)
    }

    /// See C.5.2.4 "Bumping process". Outputs the picture with the smallest
    /// POC among those needed for output, and removes it unless it is still
    /// used for reference. With `flush`, it is removed in any case.
    pub fn bump(&mut self, flush: bool) -> Option<DpbEntry<T>> {
        let (index, _) = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.pic.needed_for_output)
            .min_by_key(|(_, e)| e.pic.pic_order_cnt_val)?;

        let entry = &mut self.entries[index];
        entry.pic.needed_for_output = false;
        log::debug!("Bumping picture POC {} from the DPB", entry.pic.pic_order_cnt_val);

        if !entry.pic.is_ref() || flush {
            log::debug!("Removed picture POC {} from the DPB", entry.pic.pic_order_cnt_val);
            Some(self.entries.remove(index))
        } else {
            Some(entry.clone())
        }
    }

    /// Drops every picture without outputting it.
    pub fn clear(&mut self) {
        log::debug!("Emptying the DPB");

        self.entries.clear();
    }

    /// C.5.2.2: pictures neither waiting for output nor used for reference
    /// leave the DPB.
    pub fn remove_unused(&mut self) {
        self.entries.retain(|e| {
            let retain = e.pic.needed_for_output || e.pic.is_ref();
            if !retain {
                log::debug!("Removing unused picture POC {}", e.pic.pic_order_cnt_val);
            }
            retain
        })
    }

    /// Stores a decoded picture and its backend handle in the DPB. See
    /// C.5.2.3.
    pub fn store_picture(&mut self, mut pic: PictureData, handle: T) -> anyhow::Result<()> {
        if self.entries.len() >= self.max_num_pics {
            return Err(anyhow!("DPB already holds {} pictures", self.max_num_pics));
        }

        for other in self.pictures_mut().filter(|p| p.needed_for_output) {
            other.pic_latency_cnt += 1;
        }

        pic.needed_for_output = pic.pic_output_flag;
        pic.pic_latency_cnt = 0;

        // C.3.4. After all the slices of the current picture have been
        // decoded, it is marked as "used for short-term reference".
        pic.set_reference(Reference::ShortTerm);

        log::debug!(
            "Stored picture POC {}, the DPB length is {}",
            pic.pic_order_cnt_val,
            self.entries.len() + 1
        );

        self.entries.push(DpbEntry { pic, handle });

        Ok(())
    }

    pub fn get_all_references(&self) -> Vec<&DpbEntry<T>> {
        self.entries.iter().filter(|e| e.pic.is_ref()).collect()
    }
}

impl<T> Default for Dpb<T> {
    fn default() -> Self {
        // derive(Default) would require T: Default.
        Self {
            entries: Default::default(),
            max_num_pics: Default::default(),
        }
    }
}

impl<T> std::fmt::Debug for Dpb<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pocs = self
            .entries
            .iter()
            .map(|e| (e.pic.pic_order_cnt_val, *e.pic.reference(), e.pic.needed_for_output))
            .collect::<Vec<_>>();
        f.debug_struct("Dpb")
            .field("pictures", &pocs)
            .field("max_num_pics", &self.max_num_pics)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pic(poc: i32) -> PictureData {
        PictureData {
            pic_order_cnt_val: poc,
            pic_output_flag: true,
            ..Default::default()
        }
    }

    fn limits(max_num_reorder: usize, max_dec_pic_buffering: usize) -> BumpingLimits {
        BumpingLimits {
            max_num_reorder,
            max_latency_pictures: None,
            max_dec_pic_buffering,
        }
    }

    #[test]
    fn limits_from_sps() {
        let mut sps = Sps::default();
        sps.max_dec_pic_buffering_minus1[0] = 4;
        sps.max_num_reorder_pics[0] = 2;
        assert_eq!(BumpingLimits::from(&sps), limits(2, 5));

        sps.max_latency_increase_plus1[0] = 3;
        assert_eq!(BumpingLimits::from(&sps).max_latency_pictures, Some(4));
    }

    #[test]
    fn bump_outputs_lowest_poc() {
        let mut dpb = Dpb::default();
        dpb.set_max_num_pics(4);

        for (poc, handle) in [(0, 'a'), (4, 'b'), (2, 'c')] {
            dpb.store_picture(pic(poc), handle).unwrap();
        }

        let bumped = dpb.bump(false).unwrap();
        assert_eq!(bumped.pic.pic_order_cnt_val, 0);
        assert_eq!(bumped.handle, 'a');
        // Still a reference, so it stays.
        assert_eq!(dpb.len(), 3);
        assert!(!dpb.entries()[0].pic.needed_for_output);

        dpb.set_reference(2, Reference::None);
        let bumped = dpb.bump(false).unwrap();
        assert_eq!(bumped.pic.pic_order_cnt_val, 2);
        assert_eq!(dpb.len(), 2);

        let drained = dpb.drain();
        assert_eq!(
            drained.iter().map(|e| e.pic.pic_order_cnt_val).collect::<Vec<_>>(),
            vec![4]
        );
        // POC 0 is not needed for output anymore.
        assert_eq!(dpb.len(), 1);
    }

    #[test]
    fn full_dpb_rejects_pictures() {
        let mut dpb = Dpb::default();
        dpb.set_max_num_pics(1);
        dpb.store_picture(pic(0), ()).unwrap();
        assert!(dpb.store_picture(pic(1), ()).is_err());
        assert_eq!(dpb.len(), 1);
        assert!(dpb.needs_bumping(&limits(1, 1)));
        assert!(!dpb.needs_additional_bumping(&limits(1, 1)));
    }

    #[test]
    fn reorder_and_latency() {
        let mut dpb = Dpb::default();
        dpb.set_max_num_pics(16);
        dpb.store_picture(pic(8), ()).unwrap();
        dpb.store_picture(pic(2), ()).unwrap();

        assert!(dpb.needs_additional_bumping(&limits(1, 16)));
        assert!(!dpb.needs_additional_bumping(&limits(2, 16)));

        // POC 8 has waited for one picture.
        let latency = BumpingLimits {
            max_latency_pictures: Some(1),
            ..limits(2, 16)
        };
        assert!(dpb.needs_additional_bumping(&latency));
        assert_eq!(dpb.bump(false).unwrap().pic.pic_order_cnt_val, 2);
    }

    #[test]
    fn remove_unused_keeps_references_and_pending_output() {
        let mut dpb = Dpb::default();
        dpb.set_max_num_pics(4);
        dpb.store_picture(pic(0), ()).unwrap();
        dpb.store_picture(pic(1), ()).unwrap();
        dpb.store_picture(pic(2), ()).unwrap();

        dpb.bump(false);
        dpb.set_reference(0, Reference::None);
        dpb.set_reference(1, Reference::None);
        dpb.remove_unused();

        assert_eq!(
            dpb.pictures().map(|p| p.pic_order_cnt_val).collect::<Vec<_>>(),
            vec![1, 2]
        );

        dpb.set_reference(2, Reference::LongTerm);
        assert!(dpb.find_short_term_ref_by_poc(2).is_none());
        assert!(dpb.find_ref_by_poc(2).is_some());
        assert!(dpb.find_ref_by_poc_masked(18, 15).is_some());
        assert!(dpb.find_ref_by_poc(1).is_none());
    }
}
