// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture set derivation and picture marking (8.3.2), and
//! reference picture list construction (8.3.4).

use std::collections::BTreeSet;

use anyhow::anyhow;
use anyhow::Context;

use crate::codec::h265::dpb::Dpb;
use crate::codec::h265::dpb::DpbEntry;
use crate::codec::h265::parser::SliceHeader;
use crate::codec::h265::parser::Sps;
use crate::codec::h265::parser::MAX_DPB_SIZE;
use crate::codec::h265::picture::PictureData;
use crate::codec::h265::picture::Reference;

/// The five POC lists of the RPS of the current picture, and the POCs of the
/// DPB pictures they resolved to. Derived fresh for every picture.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicSet {
    pub poc_st_curr_before: Vec<i32>,
    pub poc_st_curr_after: Vec<i32>,
    pub poc_st_foll: Vec<i32>,
    pub poc_lt_curr: Vec<i32>,
    pub poc_lt_foll: Vec<i32>,

    curr_delta_poc_msb_present_flag: Vec<bool>,
    foll_delta_poc_msb_present_flag: Vec<bool>,

    /// RefPicSetStCurrBefore and friends, as the POC of the DPB picture
    /// each entry resolved to, or `None` if it is missing.
    pub ref_pic_set_st_curr_before: Vec<Option<i32>>,
    pub ref_pic_set_st_curr_after: Vec<Option<i32>>,
    pub ref_pic_set_st_foll: Vec<Option<i32>>,
    pub ref_pic_set_lt_curr: Vec<Option<i32>>,
    pub ref_pic_set_lt_foll: Vec<Option<i32>>,
}

/// The reference picture lists of one slice.
#[derive(Clone, Debug)]
pub struct ReferencePicLists<T> {
    pub ref_pic_list0: Vec<Option<DpbEntry<T>>>,
    pub ref_pic_list1: Vec<Option<DpbEntry<T>>>,
}

impl<T> Default for ReferencePicLists<T> {
    fn default() -> Self {
        Self {
            ref_pic_list0: Default::default(),
            ref_pic_list1: Default::default(),
        }
    }
}

impl RefPicSet {
    /// Computes the POC lists of the RPS for `cur_pic` (equation 8-5).
    pub fn derive(
        hdr: &SliceHeader,
        sps: &Sps,
        cur_pic: &PictureData,
        max_pic_order_cnt_lsb: i32,
    ) -> anyhow::Result<Self> {
        let mut rps = Self::default();

        if cur_pic.nalu_type.is_idr() {
            return Ok(rps);
        }

        let st_rps = hdr.st_rps(sps).context("Invalid short-term RPS index")?;
        let poc = cur_pic.pic_order_cnt_val;

        let negative = st_rps
            .delta_poc_s0
            .iter()
            .zip(st_rps.used_by_curr_pic_s0.iter())
            .take(usize::from(st_rps.num_negative_pics));
        for (delta, &used) in negative {
            if used {
                rps.poc_st_curr_before.push(poc + delta);
            } else {
                rps.poc_st_foll.push(poc + delta);
            }
        }

        let positive = st_rps
            .delta_poc_s1
            .iter()
            .zip(st_rps.used_by_curr_pic_s1.iter())
            .take(usize::from(st_rps.num_positive_pics));
        for (delta, &used) in positive {
            if used {
                rps.poc_st_curr_after.push(poc + delta);
            } else {
                rps.poc_st_foll.push(poc + delta);
            }
        }

        // Equation (7-52)
        let mut delta_poc_msb_cycle_lt = 0i64;
        for i in 0..hdr.num_long_term() {
            let cycle = i64::from(hdr.delta_poc_msb_cycle_lt[i]);
            if i == 0 || i == usize::from(hdr.num_long_term_sps) {
                delta_poc_msb_cycle_lt = cycle;
            } else {
                delta_poc_msb_cycle_lt += cycle;
            }

            let msb_present = hdr.delta_poc_msb_present_flag[i];
            let mut poc_lt = i32::from(hdr.poc_lsb_lt[i]);
            if msb_present {
                // The cycles may point outside of the 32-bit POC range.
                poc_lt = delta_poc_msb_cycle_lt
                    .checked_mul(i64::from(max_pic_order_cnt_lsb))
                    .and_then(|d| i64::from(poc & !(max_pic_order_cnt_lsb - 1)).checked_sub(d))
                    .and_then(|msb| msb.checked_add(i64::from(poc_lt)))
                    .and_then(|v| i32::try_from(v).ok())
                    .ok_or_else(|| {
                        anyhow!(
                            "Long-term reference {} cycles before POC {} is out of range",
                            delta_poc_msb_cycle_lt,
                            poc
                        )
                    })?;
            }

            if hdr.used_by_curr_pic_lt[i] {
                rps.poc_lt_curr.push(poc_lt);
                rps.curr_delta_poc_msb_present_flag.push(msb_present);
            } else {
                rps.poc_lt_foll.push(poc_lt);
                rps.foll_delta_poc_msb_present_flag.push(msb_present);
            }
        }

        if rps.num_total() > MAX_DPB_SIZE {
            return Err(anyhow!("RPS has {} entries", rps.num_total()));
        }

        log::debug!(
            "RPS of POC {}: StCurrBefore {:?}, StCurrAfter {:?}, StFoll {:?}, LtCurr {:?}, LtFoll {:?}",
            poc,
            rps.poc_st_curr_before,
            rps.poc_st_curr_after,
            rps.poc_st_foll,
            rps.poc_lt_curr,
            rps.poc_lt_foll
        );

        Ok(rps)
    }

    fn num_total(&self) -> usize {
        self.poc_st_curr_before.len()
            + self.poc_st_curr_after.len()
            + self.poc_st_foll.len()
            + self.poc_lt_curr.len()
            + self.poc_lt_foll.len()
    }

    /// Number of pictures usable for inter prediction of the current picture.
    pub fn num_curr(&self) -> usize {
        self.poc_st_curr_before.len() + self.poc_st_curr_after.len() + self.poc_lt_curr.len()
    }

    fn find_lt<T: Clone>(dpb: &Dpb<T>, poc: i32, msb_present: bool, mask: i32) -> Option<i32> {
        let found = if msb_present {
            dpb.find_ref_by_poc(poc)
        } else {
            dpb.find_ref_by_poc_masked(poc, mask)
        };

        if found.is_none() {
            log::warn!("No long-term reference found for POC {}", poc);
        }

        found.map(|e| e.pic.pic_order_cnt_val)
    }

    fn find_st<T: Clone>(dpb: &Dpb<T>, poc: i32) -> Option<i32> {
        let found = dpb.find_short_term_ref_by_poc(poc);

        if found.is_none() {
            log::warn!("No short-term reference found for POC {}", poc);
        }

        found.map(|e| e.pic.pic_order_cnt_val)
    }

    /// Resolves the RPS against `dpb` and updates the reference marking of
    /// its pictures (equations 8-6 and 8-7). Every reference picture not
    /// included in the RPS is marked as unused for reference.
    pub fn mark<T: Clone>(&mut self, dpb: &mut Dpb<T>, max_pic_order_cnt_lsb: i32) {
        let mask = max_pic_order_cnt_lsb - 1;

        self.ref_pic_set_lt_curr = self
            .poc_lt_curr
            .iter()
            .zip(&self.curr_delta_poc_msb_present_flag)
            .map(|(&poc, &msb)| Self::find_lt(dpb, poc, msb, mask))
            .collect();
        self.ref_pic_set_lt_foll = self
            .poc_lt_foll
            .iter()
            .zip(&self.foll_delta_poc_msb_present_flag)
            .map(|(&poc, &msb)| Self::find_lt(dpb, poc, msb, mask))
            .collect();

        for &poc in self.ref_pic_set_lt_curr.iter().chain(&self.ref_pic_set_lt_foll).flatten() {
            dpb.set_reference(poc, Reference::LongTerm);
        }

        self.ref_pic_set_st_curr_before = self
            .poc_st_curr_before
            .iter()
            .map(|&poc| Self::find_st(dpb, poc))
            .collect();
        self.ref_pic_set_st_curr_after = self
            .poc_st_curr_after
            .iter()
            .map(|&poc| Self::find_st(dpb, poc))
            .collect();
        self.ref_pic_set_st_foll = self
            .poc_st_foll
            .iter()
            .map(|&poc| Self::find_st(dpb, poc))
            .collect();

        let in_rps: BTreeSet<i32> = self
            .ref_pic_set_lt_curr
            .iter()
            .chain(&self.ref_pic_set_lt_foll)
            .chain(&self.ref_pic_set_st_curr_before)
            .chain(&self.ref_pic_set_st_curr_after)
            .chain(&self.ref_pic_set_st_foll)
            .flatten()
            .copied()
            .collect();

        for pic in dpb.pictures_mut() {
            if pic.is_ref() && !in_rps.contains(&pic.pic_order_cnt_val) {
                pic.set_reference(Reference::None);
            }
        }
    }

    /// Builds the reference picture lists of a P or B slice (8.3.4). I
    /// slices get empty lists.
    pub fn build_ref_pic_lists<T: Clone>(
        &self,
        hdr: &SliceHeader,
        dpb: &Dpb<T>,
    ) -> anyhow::Result<ReferencePicLists<T>> {
        let mut lists = ReferencePicLists::default();

        if hdr.type_.is_i() {
            return Ok(lists);
        }

        if self.num_curr() == 0 {
            log::warn!("Broken stream: inter slice without reference pictures");
            return Ok(lists);
        }

        let lookup = |poc: &Option<i32>| -> Option<DpbEntry<T>> {
            poc.and_then(|poc| dpb.find_ref_by_poc(poc)).cloned()
        };

        let st_before: Vec<_> = self.ref_pic_set_st_curr_before.iter().map(lookup).collect();
        let st_after: Vec<_> = self.ref_pic_set_st_curr_after.iter().map(lookup).collect();
        let lt_curr: Vec<_> = self.ref_pic_set_lt_curr.iter().map(lookup).collect();
        let rplm = &hdr.ref_pic_list_modification;

        // Equations (8-8) and (8-9)
        let num_active = usize::from(hdr.num_ref_idx_l0_active_minus1) + 1;
        let temp0 = Self::temp_list(&[&st_before, &st_after, &lt_curr], num_active, hdr);
        lists.ref_pic_list0 = Self::final_list(
            &temp0,
            num_active,
            rplm.ref_pic_list_modification_flag_l0,
            &rplm.list_entry_l0,
        )?;

        if hdr.type_.is_b() {
            // Equations (8-10) and (8-11)
            let num_active = usize::from(hdr.num_ref_idx_l1_active_minus1) + 1;
            let temp1 = Self::temp_list(&[&st_after, &st_before, &lt_curr], num_active, hdr);
            lists.ref_pic_list1 = Self::final_list(
                &temp1,
                num_active,
                rplm.ref_pic_list_modification_flag_l1,
                &rplm.list_entry_l1,
            )?;
        }

        Ok(lists)
    }

    /// Cycles through `sources` until `max(num_active, NumPicTotalCurr)`
    /// entries are collected.
    fn temp_list<T: Clone>(
        sources: &[&Vec<Option<DpbEntry<T>>>],
        num_active: usize,
        hdr: &SliceHeader,
    ) -> Vec<Option<DpbEntry<T>>> {
        let num_rps_curr_temp_list = std::cmp::max(num_active, hdr.num_pic_total_curr as usize);

        sources
            .iter()
            .flat_map(|s| s.iter())
            .cycle()
            .take(num_rps_curr_temp_list)
            .cloned()
            .collect()
    }

    fn final_list<T: Clone>(
        temp: &[Option<DpbEntry<T>>],
        num_active: usize,
        modification_flag: bool,
        list_entry: &[u32],
    ) -> anyhow::Result<Vec<Option<DpbEntry<T>>>> {
        (0..num_active)
            .map(|r_idx| {
                let idx = if modification_flag {
                    *list_entry
                        .get(r_idx)
                        .ok_or_else(|| anyhow!("Missing list_entry {}", r_idx))?
                        as usize
                } else {
                    r_idx
                };

                temp.get(idx)
                    .cloned()
                    .ok_or_else(|| anyhow!("Reference list index {} out of range", idx))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h265::parser::NaluType;
    use crate::codec::h265::parser::ShortTermRefPicSet;
    use crate::codec::h265::parser::SliceType;

    fn dpb_with(pocs: &[i32]) -> Dpb<i32> {
        let mut dpb = Dpb::default();
        dpb.set_max_num_pics(16);
        for &poc in pocs {
            let pic = PictureData {
                pic_order_cnt_val: poc,
                ..Default::default()
            };
            dpb.store_picture(pic, poc).unwrap();
        }
        dpb
    }

    fn current(poc: i32) -> PictureData {
        PictureData {
            nalu_type: NaluType::TrailR,
            pic_order_cnt_val: poc,
            ..Default::default()
        }
    }

    fn header(s0: &[(i32, bool)], s1: &[(i32, bool)]) -> SliceHeader {
        let mut st = ShortTermRefPicSet {
            num_negative_pics: s0.len() as u8,
            num_positive_pics: s1.len() as u8,
            ..Default::default()
        };
        for (i, &(delta, used)) in s0.iter().enumerate() {
            st.delta_poc_s0[i] = delta;
            st.used_by_curr_pic_s0[i] = used;
        }
        for (i, &(delta, used)) in s1.iter().enumerate() {
            st.delta_poc_s1[i] = delta;
            st.used_by_curr_pic_s1[i] = used;
        }

        SliceHeader {
            type_: SliceType::B,
            short_term_ref_pic_set: st,
            ..Default::default()
        }
    }

    #[test]
    fn short_term_marking() {
        let mut dpb = dpb_with(&[0, 4, 8, 2]);
        let hdr = header(&[(-2, true), (-4, false)], &[(2, true)]);

        let mut rps = RefPicSet::derive(&hdr, &Sps::default(), &current(6), 16).unwrap();
        assert_eq!(rps.poc_st_curr_before, vec![4]);
        assert_eq!(rps.poc_st_foll, vec![2]);
        assert_eq!(rps.poc_st_curr_after, vec![8]);

        rps.mark(&mut dpb, 16);
        assert_eq!(rps.ref_pic_set_st_curr_before, vec![Some(4)]);
        assert_eq!(rps.ref_pic_set_st_foll, vec![Some(2)]);

        let refs = dpb
            .get_all_references()
            .iter()
            .map(|e| e.pic.pic_order_cnt_val)
            .collect::<Vec<_>>();
        assert_eq!(refs, vec![4, 8, 2]);
    }

    #[test]
    fn missing_reference() {
        let mut dpb = dpb_with(&[0]);
        let hdr = header(&[(-1, true)], &[]);

        let mut rps = RefPicSet::derive(&hdr, &Sps::default(), &current(2), 16).unwrap();
        rps.mark(&mut dpb, 16);

        assert_eq!(rps.ref_pic_set_st_curr_before, vec![None]);
        assert!(dpb.get_all_references().is_empty());
    }

    #[test]
    fn long_term_lsb_and_msb() {
        let mut dpb = dpb_with(&[20, 35, 12]);
        let mut hdr = header(&[], &[]);
        hdr.type_ = SliceType::P;
        hdr.num_long_term_pics = 2;
        // POC 35, matched by its LSBs only.
        hdr.poc_lsb_lt[0] = 3;
        hdr.used_by_curr_pic_lt[0] = true;
        // POC 20: 40 - 1 * 16 - (40 & 15) + 4.
        hdr.poc_lsb_lt[1] = 4;
        hdr.delta_poc_msb_present_flag[1] = true;
        hdr.delta_poc_msb_cycle_lt[1] = 1;
        hdr.used_by_curr_pic_lt[1] = false;

        let mut rps = RefPicSet::derive(&hdr, &Sps::default(), &current(40), 16).unwrap();
        assert_eq!(rps.poc_lt_curr, vec![3]);
        assert_eq!(rps.poc_lt_foll, vec![20]);

        rps.mark(&mut dpb, 16);
        assert_eq!(rps.ref_pic_set_lt_curr, vec![Some(35)]);
        assert_eq!(rps.ref_pic_set_lt_foll, vec![Some(20)]);

        let long_term = dpb
            .pictures()
            .filter(|p| matches!(p.reference(), Reference::LongTerm))
            .count();
        assert_eq!(long_term, 2);
        // POC 12 is not part of the RPS anymore.
        assert!(dpb.find_ref_by_poc(12).is_none());
    }

    #[test]
    fn delta_poc_msb_cycle_accumulates() {
        let mut hdr = header(&[], &[]);
        hdr.num_long_term_pics = 2;
        for i in 0..2 {
            hdr.poc_lsb_lt[i] = 0;
            hdr.delta_poc_msb_present_flag[i] = true;
            hdr.delta_poc_msb_cycle_lt[i] = 1;
            hdr.used_by_curr_pic_lt[i] = true;
        }

        let rps = RefPicSet::derive(&hdr, &Sps::default(), &current(64), 16).unwrap();
        assert_eq!(rps.poc_lt_curr, vec![48, 32]);
    }

    #[test]
    fn long_term_msb_cycle_out_of_range() {
        let mut hdr = header(&[], &[]);
        hdr.num_long_term_pics = 1;
        hdr.delta_poc_msb_present_flag[0] = true;
        hdr.delta_poc_msb_cycle_lt[0] = 1 << 28;
        hdr.used_by_curr_pic_lt[0] = true;

        assert!(RefPicSet::derive(&hdr, &Sps::default(), &current(64), 16).is_err());

        // Accumulated over several entries.
        hdr.num_long_term_pics = 3;
        for i in 0..3 {
            hdr.delta_poc_msb_present_flag[i] = true;
            hdr.delta_poc_msb_cycle_lt[i] = u32::MAX;
            hdr.used_by_curr_pic_lt[i] = true;
        }
        assert!(RefPicSet::derive(&hdr, &Sps::default(), &current(64), 1 << 16).is_err());
    }

    #[test]
    fn ref_pic_lists() {
        let mut dpb = dpb_with(&[0, 4, 8]);
        let mut hdr = header(&[(-2, true), (-6, true)], &[(2, true)]);
        hdr.num_ref_idx_l0_active_minus1 = 3;
        hdr.num_ref_idx_l1_active_minus1 = 1;
        hdr.num_pic_total_curr = 3;

        let mut rps = RefPicSet::derive(&hdr, &Sps::default(), &current(6), 16).unwrap();
        rps.mark(&mut dpb, 16);

        let lists = rps.build_ref_pic_lists(&hdr, &dpb).unwrap();
        let pocs = |list: &[Option<DpbEntry<i32>>]| {
            list.iter()
                .map(|e| e.as_ref().map(|e| e.handle))
                .collect::<Vec<_>>()
        };

        assert_eq!(pocs(&lists.ref_pic_list0), vec![Some(4), Some(0), Some(8), Some(4)]);
        assert_eq!(pocs(&lists.ref_pic_list1), vec![Some(8), Some(4)]);

        hdr.ref_pic_list_modification.ref_pic_list_modification_flag_l1 = true;
        hdr.ref_pic_list_modification.list_entry_l1 = vec![2, 0];
        let lists = rps.build_ref_pic_lists(&hdr, &dpb).unwrap();
        assert_eq!(pocs(&lists.ref_pic_list1), vec![Some(0), Some(8)]);

        hdr.ref_pic_list_modification.list_entry_l1 = vec![5, 0];
        assert!(rps.build_ref_pic_lists(&hdr, &dpb).is_err());
    }

    #[test]
    fn idr_has_empty_rps() {
        let mut pic = current(0);
        pic.nalu_type = NaluType::IdrNLp;
        let rps = RefPicSet::derive(&header(&[(-1, true)], &[]), &Sps::default(), &pic, 16)
            .unwrap();
        assert_eq!(rps, RefPicSet::default());
    }
}
