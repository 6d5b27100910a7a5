// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference pictures kept by the encoder and the reference lists and
//! short-term RPS derived from them.

use std::collections::VecDeque;

use crate::codec::h265::parser::ShortTermRefPicSet;
use crate::codec::h265::parser::MAX_DPB_SIZE;
use crate::encoder::h265::reorder::PictureType;

/// Reference lists of one picture, as POCs, closest first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefLists {
    pub list0: Vec<u32>,
    pub list1: Vec<u32>,
}

/// Bounded queue of the reference pictures, in coding order. Pictures are
/// identified by PicOrderCntVal, counted from the last IDR without wrapping.
#[derive(Debug)]
pub struct ReferencePool {
    refs: VecDeque<u32>,
    max_reflist0: usize,
    max_reflist1: usize,
}

impl ReferencePool {
    pub fn new(max_reflist0: usize, max_reflist1: usize) -> Self {
        Self {
            refs: VecDeque::with_capacity(max_reflist0 + max_reflist1),
            max_reflist0,
            max_reflist1,
        }
    }

    /// Capacity of the pool.
    pub fn max_ref_frames(&self) -> usize {
        std::cmp::min(self.max_reflist0 + self.max_reflist1, MAX_DPB_SIZE)
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// POCs of the pictures in the pool, oldest first.
    pub fn pocs(&self) -> impl Iterator<Item = u32> + '_ {
        self.refs.iter().copied()
    }

    pub fn clear(&mut self) {
        self.refs.clear();
    }

    /// Adds a just coded picture. An IDR empties the pool first, B pictures
    /// are never kept.
    pub fn update(&mut self, poc: u32, type_: PictureType, is_idr: bool) {
        if type_ == PictureType::B {
            return;
        }

        if is_idr {
            self.refs.clear();
        } else if self.refs.len() >= self.max_ref_frames() {
            if let Some(evicted) = self.refs.pop_front() {
                log::trace!("Evicting reference with POC {}", evicted);
            }
        }

        self.refs.push_back(poc);
        log::trace!("Reference pool: {:?}", self.refs);
    }

    /// Builds the reference lists of the picture `poc`: list 0 holds the
    /// pictures preceding it and list 1, for B pictures, the ones following
    /// it.
    pub fn ref_lists(&self, poc: u32, type_: PictureType) -> RefLists {
        if !matches!(type_, PictureType::P | PictureType::B) {
            return Default::default();
        }

        let last_before = self.refs.iter().rposition(|&r| r <= poc);

        let (list0, after) = match last_before {
            Some(pos) => (
                self.refs
                    .range(..=pos)
                    .rev()
                    .take(self.max_reflist0)
                    .copied()
                    .collect(),
                pos + 1,
            ),
            None => (vec![], 0),
        };

        let list1 = if type_ == PictureType::B {
            self.refs
                .range(after..)
                .take(self.max_reflist1)
                .copied()
                .collect()
        } else {
            vec![]
        };

        if list0.is_empty() && list1.is_empty() {
            log::warn!("No reference available for {:?} picture {}", type_, poc);
        }

        RefLists { list0, list1 }
    }

    /// Builds the short-term RPS of the picture `poc`. Every picture of the
    /// pool is kept in the set so that the decoder retains what the encoder
    /// may still reference, and only those in `lists` are marked as used.
    pub fn short_term_rps(&self, poc: u32, lists: &RefLists) -> ShortTermRefPicSet {
        let mut before = vec![];
        let mut after = vec![];

        for &r in &self.refs {
            let used = lists.list0.contains(&r) || lists.list1.contains(&r);
            match i32::try_from(i64::from(r) - i64::from(poc)) {
                Ok(d) if d < 0 => before.push((d, used)),
                Ok(d) if d > 0 => after.push((d, used)),
                _ => log::warn!("Cannot signal reference {} from POC {}", r, poc),
            }
        }

        before.sort_by_key(|(d, _)| std::cmp::Reverse(*d));
        after.sort_by_key(|(d, _)| *d);
        before.truncate(MAX_DPB_SIZE);
        after.truncate(MAX_DPB_SIZE - before.len());

        let mut rps = ShortTermRefPicSet {
            num_negative_pics: before.len() as u8,
            num_positive_pics: after.len() as u8,
            ..Default::default()
        };

        for (i, (d, used)) in before.into_iter().enumerate() {
            rps.delta_poc_s0[i] = d;
            rps.used_by_curr_pic_s0[i] = used;
        }

        for (i, (d, used)) in after.into_iter().enumerate() {
            rps.delta_poc_s1[i] = d;
            rps.used_by_curr_pic_s1[i] = used;
        }

        rps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(max_reflist0: usize, max_reflist1: usize, pocs: &[u32]) -> ReferencePool {
        let mut pool = ReferencePool::new(max_reflist0, max_reflist1);
        for (i, &poc) in pocs.iter().enumerate() {
            pool.update(poc, PictureType::P, i == 0);
        }
        pool
    }

    #[test]
    fn pool_is_bounded_and_cleared_on_idr() {
        let mut pool = ReferencePool::new(2, 1);
        assert_eq!(pool.max_ref_frames(), 3);

        for (i, poc) in [0, 3, 6, 9, 12].into_iter().enumerate() {
            pool.update(poc, PictureType::P, i == 0);
            assert!(pool.len() <= pool.max_ref_frames());
        }
        assert_eq!(pool.pocs().collect::<Vec<_>>(), vec![6, 9, 12]);

        // B pictures are not kept.
        pool.update(10, PictureType::B, false);
        assert_eq!(pool.len(), 3);

        pool.update(0, PictureType::I, true);
        assert_eq!(pool.pocs().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn lists_of_p_and_b_pictures() {
        let pool = pool_with(2, 1, &[0, 3, 6]);

        let lists = pool.ref_lists(9, PictureType::P);
        assert_eq!(lists.list0, vec![6, 3]);
        assert!(lists.list1.is_empty());

        let lists = pool.ref_lists(4, PictureType::B);
        assert_eq!(lists.list0, vec![3, 0]);
        assert_eq!(lists.list1, vec![6]);

        assert_eq!(pool.ref_lists(7, PictureType::I), RefLists::default());
    }

    #[test]
    fn references_further_than_half_the_lsb_range() {
        // 14 references, while a 4 bit POC LSB only spans 16 pictures.
        let mut pool = ReferencePool::new(14, 0);
        for poc in 0..15 {
            let lists = pool.ref_lists(poc, PictureType::P);
            let rps = pool.short_term_rps(poc, &lists);

            assert_eq!(rps.num_positive_pics, 0);
            assert_eq!(usize::from(rps.num_negative_pics), pool.len());
            for (i, &delta) in rps.delta_poc_s0[..pool.len()].iter().enumerate() {
                assert_eq!(delta, -(i as i32 + 1));
            }
            assert_eq!(lists.list0.first().copied(), poc.checked_sub(1));

            pool.update(poc, if poc == 0 { PictureType::I } else { PictureType::P }, poc == 0);
        }

        assert_eq!(pool.len(), 14);
        let lists = pool.ref_lists(15, PictureType::P);
        assert_eq!(lists.list0, (1..15).rev().collect::<Vec<_>>());
        let rps = pool.short_term_rps(15, &lists);
        assert_eq!(rps.delta_poc_s0[13], -14);
    }

    #[test]
    fn rps_keeps_the_whole_pool() {
        let pool = pool_with(1, 1, &[0, 3]);
        let lists = pool.ref_lists(1, PictureType::B);
        assert_eq!(lists.list0, vec![0]);
        assert_eq!(lists.list1, vec![3]);

        let pool = pool_with(2, 1, &[0, 3, 6]);
        let lists = RefLists {
            list0: vec![3],
            list1: vec![6],
        };
        let rps = pool.short_term_rps(4, &lists);
        assert_eq!(rps.num_negative_pics, 2);
        assert_eq!(&rps.delta_poc_s0[..2], &[-1, -4]);
        assert_eq!(&rps.used_by_curr_pic_s0[..2], &[true, false]);
        assert_eq!(rps.num_positive_pics, 1);
        assert_eq!(rps.delta_poc_s1[0], 2);
        assert!(rps.used_by_curr_pic_s1[0]);
        assert_eq!(rps.num_used_by_curr(), 2);

        // An intra picture keeps the references without using them.
        let rps = pool.short_term_rps(8, &RefLists::default());
        assert_eq!(rps.num_negative_pics, 3);
        assert_eq!(rps.num_used_by_curr(), 0);
    }
}
