// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoder surface: errors, decoded pictures and their output queue.

pub mod h265;

use std::collections::VecDeque;

use thiserror::Error;

/// Error returned by decoder backend methods.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("not enough resources to proceed with the operation now")]
    OutOfResources,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Error returned by the `decode` method of a decoder.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The input does not hold a complete NAL unit.
    #[error("not enough input data to extract a NAL unit")]
    BitstreamUnderrun,
    /// A slice refers to parameter sets that have not been activated.
    #[error("slice received before its parameter sets")]
    InvalidHeaderState,
    #[error(transparent)]
    DecoderError(#[from] anyhow::Error),
    #[error(transparent)]
    BackendError(#[from] BackendError),
}

/// A picture output by the decoder, in output order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedPicture<H> {
    pub poc: i32,
    pub timestamp: u64,
    /// The backend handle of the decoded surface.
    pub handle: H,
}

/// A queue where decoded pictures wait until the client retrieves them.
pub(crate) struct ReadyFramesQueue<H> {
    queue: VecDeque<DecodedPicture<H>>,
}

impl<H> Default for ReadyFramesQueue<H> {
    fn default() -> Self {
        Self {
            queue: Default::default(),
        }
    }
}

impl<H> ReadyFramesQueue<H> {
    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }
}

impl<H> Extend<DecodedPicture<H>> for ReadyFramesQueue<H> {
    fn extend<I: IntoIterator<Item = DecodedPicture<H>>>(&mut self, iter: I) {
        self.queue.extend(iter)
    }
}

/// Allows us to manipulate the frames list like an iterator without consuming it.
impl<H> Iterator for &mut ReadyFramesQueue<H> {
    type Item = DecodedPicture<H>;

    /// Returns the next picture (if any) waiting to be dequeued.
    fn next(&mut self) -> Option<DecodedPicture<H>> {
        self.queue.pop_front()
    }
}
