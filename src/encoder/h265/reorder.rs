// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Picture reordering for B-frame encoding. Input frames are given a POC and
//! a picture type and released in coding order.

use std::collections::VecDeque;

use crate::encoder::FrameMetadata;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PictureType {
    /// Not decided yet, the frame waits in the reorder queue.
    #[default]
    None,
    I,
    P,
    B,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReorderState {
    /// No B-frames, every frame is released as it arrives.
    None,
    /// Collecting frames that will become B-frames.
    WaitFrames,
    /// Releasing a completed mini-GOP.
    DumpFrames,
}

/// A frame scheduled for encoding.
#[derive(Debug)]
pub struct EncoderPicture<P> {
    pub input: P,
    pub meta: FrameMetadata,
    /// PicOrderCntVal: the presentation index since the last IDR. Slice
    /// headers carry it modulo MaxPicOrderCntLsb.
    pub poc: u32,
    pub type_: PictureType,
    pub is_idr: bool,
}

impl<P> EncoderPicture<P> {
    /// Whether the reconstructed picture goes to the reference pool.
    pub fn is_reference(&self) -> bool {
        self.type_ != PictureType::B
    }
}

/// GOP parameters driving the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GopStructure {
    /// Distance between I frames. Must not be zero.
    pub keyframe_period: u32,
    /// Distance between IDR frames, at least `keyframe_period`.
    pub idr_period: u32,
    pub num_bframes: u32,
    /// Added to the timestamp of every released picture.
    pub cts_offset: u64,
}

pub struct ReorderScheduler<P> {
    gop: GopStructure,
    queue: VecDeque<EncoderPicture<P>>,
    state: ReorderState,
    /// Frames seen since the last IDR, the IDR counting as one.
    frame_index: u32,
    /// Presentation counter, reset by each IDR.
    cur_present_index: u32,
    idr_num: u32,
}

impl<P> ReorderScheduler<P> {
    pub fn new(gop: GopStructure) -> Self {
        Self {
            gop: GopStructure {
                keyframe_period: gop.keyframe_period.max(1),
                ..gop
            },
            queue: VecDeque::new(),
            state: ReorderState::None,
            frame_index: 0,
            cur_present_index: 0,
            idr_num: 0,
        }
    }

    pub fn state(&self) -> ReorderState {
        self.state
    }

    /// Number of frames held back.
    pub fn num_pending(&self) -> usize {
        self.queue.len()
    }

    /// Number of IDR pictures scheduled so far.
    pub fn idr_num(&self) -> u32 {
        self.idr_num
    }

    fn release(&self, mut pic: EncoderPicture<P>) -> EncoderPicture<P> {
        pic.meta.timestamp = pic.meta.timestamp.saturating_add(self.gop.cts_offset);
        log::debug!(
            "Releasing {:?}{} picture with POC {}, timestamp {}",
            pic.type_,
            if pic.is_idr { " (IDR)" } else { "" },
            pic.poc,
            pic.meta.timestamp
        );

        pic
    }

    fn set_key_frame(&mut self, pic: &mut EncoderPicture<P>, is_idr: bool) {
        pic.type_ = PictureType::I;
        pic.is_idr = is_idr;

        if is_idr {
            // A new coded video sequence starts counting from the IDR.
            self.idr_num += 1;
            self.frame_index = 1;
            self.cur_present_index = 0;
            pic.poc = 0;
        }
    }

    /// Feeds `frame` to the scheduler, or polls it when `frame` is `None`.
    ///
    /// Returns the next picture in coding order, if one is ready. After
    /// feeding a frame, call again with `None` until nothing is returned.
    pub fn reorder(&mut self, frame: Option<(P, FrameMetadata)>) -> Option<EncoderPicture<P>> {
        let Some((input, meta)) = frame else {
            if self.state != ReorderState::DumpFrames {
                return None;
            }

            let pic = self.queue.pop_front();
            if self.queue.is_empty() {
                self.state = ReorderState::WaitFrames;
            }

            return pic.map(|pic| self.release(pic));
        };

        self.cur_present_index += 1;
        let poc = self.cur_present_index;
        let is_idr = self.frame_index == 0 || self.frame_index >= self.gop.idr_period;

        let mut pic = EncoderPicture {
            input,
            meta,
            poc,
            type_: PictureType::None,
            is_idr: false,
        };

        log::trace!(
            "New frame {} with timestamp {}, POC {}",
            self.frame_index,
            pic.meta.timestamp,
            poc
        );

        if is_idr || pic.meta.force_keyframe || self.frame_index % self.gop.keyframe_period == 0 {
            self.frame_index += 1;

            // The newest waiting frame closes the mini-GOP as a P frame and the
            // key frame is released after the B frames.
            if self.gop.num_bframes > 0 {
                if let Some(mut p) = self.queue.pop_back() {
                    p.type_ = PictureType::P;
                    for b in self.queue.iter_mut() {
                        b.type_ = PictureType::B;
                    }

                    self.set_key_frame(&mut pic, is_idr);
                    self.queue.push_back(pic);
                    self.state = ReorderState::DumpFrames;

                    return Some(self.release(p));
                }
            }

            self.set_key_frame(&mut pic, is_idr);
            if self.gop.num_bframes > 0 {
                self.state = ReorderState::WaitFrames;
            }

            return Some(self.release(pic));
        }

        self.frame_index += 1;

        if self.state == ReorderState::WaitFrames
            && self.queue.len() < self.gop.num_bframes as usize
        {
            self.queue.push_back(pic);
            return None;
        }

        pic.type_ = PictureType::P;
        if self.state == ReorderState::WaitFrames {
            for b in self.queue.iter_mut() {
                b.type_ = PictureType::B;
            }

            self.state = ReorderState::DumpFrames;
        }

        Some(self.release(pic))
    }

    /// Releases every held frame at the end of the stream: the newest becomes
    /// a P frame, the others B frames referencing it.
    pub fn drain(&mut self) -> Vec<EncoderPicture<P>> {
        let mut pictures = Vec::with_capacity(self.queue.len());

        if self.state == ReorderState::DumpFrames {
            // Already typed.
            pictures.extend(self.queue.drain(..));
            self.state = ReorderState::WaitFrames;
        } else if let Some(mut p) = self.queue.pop_back() {
            p.type_ = PictureType::P;
            pictures.push(p);
            pictures.extend(self.queue.drain(..).map(|mut b| {
                b.type_ = PictureType::B;
                b
            }));
        }

        pictures.into_iter().map(|pic| self.release(pic)).collect()
    }

    /// Discards the held frames and restarts the GOP, so that the next frame
    /// becomes an IDR. Returns the inputs of the discarded frames.
    pub fn flush(&mut self) -> Vec<P> {
        if !self.queue.is_empty() {
            log::debug!("Discarding {} frames from the reorder queue", self.queue.len());
        }

        self.frame_index = 0;
        self.cur_present_index = 0;
        self.state = ReorderState::None;

        self.queue.drain(..).map(|pic| pic.input).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Scheduled = (u32, PictureType, bool);

    fn gop(keyframe_period: u32, idr_period: u32, num_bframes: u32) -> GopStructure {
        GopStructure {
            keyframe_period,
            idr_period,
            num_bframes,
            cts_offset: 0,
        }
    }

    fn describe(pic: &EncoderPicture<u32>) -> Scheduled {
        (pic.poc, pic.type_, pic.is_idr)
    }

    /// Feeds frames `0..count`, forcing key frames at `forced`, then drains.
    fn schedule(sched: &mut ReorderScheduler<u32>, count: u32, forced: &[u32]) -> Vec<Scheduled> {
        let mut out = Vec::new();

        for i in 0..count {
            let meta = FrameMetadata {
                timestamp: u64::from(i),
                force_keyframe: forced.contains(&i),
            };

            let mut next = sched.reorder(Some((i, meta)));
            while let Some(pic) = next {
                out.push(describe(&pic));
                next = sched.reorder(None);
            }
        }

        out.extend(sched.drain().iter().map(describe));
        out
    }

    #[test]
    fn mini_gops_with_two_b_frames() {
        use PictureType::*;

        let mut sched = ReorderScheduler::new(gop(8, 32, 2));
        let out = schedule(&mut sched, 10, &[]);

        assert_eq!(
            out,
            vec![
                (0, I, true),
                (3, P, false),
                (1, B, false),
                (2, B, false),
                (6, P, false),
                (4, B, false),
                (5, B, false),
                (7, P, false),
                (8, I, false),
                (9, P, false),
            ]
        );

        // Exactly one IDR, and every frame comes out once.
        assert_eq!(out.iter().filter(|(_, _, idr)| *idr).count(), 1);
        let mut pocs: Vec<u32> = out.iter().map(|(poc, _, _)| *poc).collect();
        pocs.sort();
        assert_eq!(pocs, (0..10).collect::<Vec<_>>());
        assert_eq!(sched.idr_num(), 1);
        assert_eq!(sched.num_pending(), 0);
    }

    #[test]
    fn same_input_same_schedule() {
        let first = schedule(&mut ReorderScheduler::new(gop(8, 32, 2)), 25, &[]);
        let second = schedule(&mut ReorderScheduler::new(gop(8, 32, 2)), 25, &[]);
        assert_eq!(first, second);
    }

    #[test]
    fn low_delay_with_idr_period() {
        use PictureType::*;

        let mut sched = ReorderScheduler::new(gop(4, 8, 0));
        let out = schedule(&mut sched, 10, &[]);

        assert_eq!(
            out,
            vec![
                (0, I, true),
                (1, P, false),
                (2, P, false),
                (3, P, false),
                (4, I, false),
                (5, P, false),
                (6, P, false),
                (7, P, false),
                (0, I, true),
                (1, P, false),
            ]
        );
        assert_eq!(sched.state(), ReorderState::None);
        assert_eq!(sched.idr_num(), 2);
    }

    #[test]
    fn forced_key_frame_closes_the_mini_gop() {
        use PictureType::*;

        let mut sched = ReorderScheduler::new(gop(30, 30, 2));
        let out = schedule(&mut sched, 3, &[2]);

        assert_eq!(out, vec![(0, I, true), (1, P, false), (2, I, false)]);
    }

    #[test]
    fn drain_releases_p_then_b() {
        use PictureType::*;

        let mut sched = ReorderScheduler::new(gop(30, 30, 3));
        assert!(sched.reorder(Some((0, FrameMetadata::default()))).is_some());
        for i in 1..4 {
            assert!(sched.reorder(Some((i, FrameMetadata::default()))).is_none());
        }
        assert_eq!(sched.state(), ReorderState::WaitFrames);
        assert_eq!(sched.num_pending(), 3);

        let drained: Vec<_> = sched.drain().iter().map(describe).collect();
        assert_eq!(drained, vec![(3, P, false), (1, B, false), (2, B, false)]);
        assert!(sched.drain().is_empty());
    }

    #[test]
    fn timestamps_carry_the_offset() {
        let mut sched = ReorderScheduler::new(GopStructure {
            cts_offset: 33,
            ..gop(8, 8, 1)
        });

        let meta = |timestamp| FrameMetadata {
            timestamp,
            force_keyframe: false,
        };

        let idr = sched.reorder(Some((0, meta(0)))).unwrap();
        assert_eq!(idr.meta.timestamp, 33);
        assert!(sched.reorder(Some((1, meta(100)))).is_none());
        let p = sched.reorder(Some((2, meta(200)))).unwrap();
        assert_eq!((p.input, p.meta.timestamp), (2, 233));
        let b = sched.reorder(None).unwrap();
        assert_eq!((b.input, b.meta.timestamp), (1, 133));
        assert!(sched.reorder(None).is_none());
    }

    #[test]
    fn flush_restarts_the_gop() {
        let mut sched = ReorderScheduler::new(gop(8, 32, 2));
        assert!(sched.flush().is_empty());
        assert!(sched.flush().is_empty());

        schedule(&mut sched, 5, &[]);
        assert!(sched.reorder(Some((5, FrameMetadata::default()))).is_none());
        assert_eq!(sched.flush(), vec![5]);
        assert!(sched.flush().is_empty());

        let idr = sched.reorder(Some((6, FrameMetadata::default()))).unwrap();
        assert!(idr.is_idr);
        assert_eq!(idr.poc, 0);
    }
}
