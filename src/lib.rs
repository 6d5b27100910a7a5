// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.265/HEVC bitstream core: header syntax reading and writing, an encoder
//! context producing per-picture requests for a hardware backend, and a
//! decoder implementing the POC, RPS and DPB processes.

pub mod bitstream_utils;
pub mod codec;
pub mod decoder;
pub mod encoder;
pub mod utils;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Rounds both dimensions up to a multiple of `alignment`.
    pub fn round_up(&self, alignment: u32) -> Self {
        Self {
            width: self.width.next_multiple_of(alignment),
            height: self.height.next_multiple_of(alignment),
        }
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(value: Resolution) -> Self {
        (value.width, value.height)
    }
}
