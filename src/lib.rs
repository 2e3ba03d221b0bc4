// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Packet, task and pipeline orchestration for fixed-function video engines.
//!
//! A frame of decode or encode work goes through a few layers before it reaches the hardware:
//!
//! * A [`pipeline::MediaPipeline`] owns a registry of packets and a per-frame queue of activated
//!   packets. Codec pipelines such as [`decode::mpeg2::Mpeg2Pipeline`] or
//!   [`encode::avc::AvcVdencPipeline`] decide which packets to activate, for which pass and on
//!   which pipe.
//! * A [`task::MediaTask`] receives the activated packets and turns them into a single command
//!   buffer, which it obtains from a [`scalability::MediaScalability`] instance sized from the
//!   packets' own upper-bound estimates.
//! * A [`packet::MediaPacket`] emits its commands into that buffer.
//!
//! Completion is asynchronous: the commands store hardware registers into a status buffer, and
//! [`status_report::MediaStatusReport`] parses them later and forwards them to its observers.
//!
//! [`os::sysmem::SysMemOs`] provides a system memory implementation of the OS layer with a
//! software command streamer, which makes it possible to run the whole stack without a GPU.

pub mod debug;
pub mod decode;
pub mod encode;
pub mod feature;
pub mod hw;
pub mod os;
pub mod packet;
pub mod pipeline;
pub mod profiler;
pub mod scalability;
pub mod status_report;
pub mod task;

use enumn::N;
use thiserror::Error;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` can contain `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    pub fn width_in_mbs(&self) -> u32 {
        (self.width + 15) / 16
    }

    pub fn height_in_mbs(&self) -> u32 {
        (self.height + 15) / 16
    }

    pub fn num_mbs(&self) -> u32 {
        self.width_in_mbs() * self.height_in_mbs()
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self { width: value.0, height: value.1 }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(value: Resolution) -> Self {
        (value.width, value.height)
    }
}

/// Integer status codes, for callers that need to forward a failure across an ABI boundary.
#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum StatusCode {
    Success = 0,
    InvalidParameter = 2,
    NullPointer = 5,
    Unknown = 6,
    NoSpace = 0x10,
    ExceedMaxBbSize = 0x11,
}

/// Error returned by every fallible operation of this crate.
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("required collaborator missing: {0}")]
    NullPointer(&'static str),
    #[error("unknown failure: {0}")]
    Unknown(String),
    #[error("no space left in {0}")]
    NoSpace(&'static str),
    #[error("batch buffer size exceeded")]
    ExceedMaxBbSize,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MediaError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            MediaError::InvalidParameter(_) => StatusCode::InvalidParameter,
            MediaError::NullPointer(_) => StatusCode::NullPointer,
            MediaError::Unknown(_) | MediaError::Other(_) => StatusCode::Unknown,
            MediaError::NoSpace(_) => StatusCode::NoSpace,
            MediaError::ExceedMaxBbSize => StatusCode::ExceedMaxBbSize,
        }
    }
}

/// Result type returned by every fallible operation of this crate.
pub type MediaResult<T> = Result<T, MediaError>;

/// Converts a result into its integer status code.
pub fn status_code_of<T>(result: &MediaResult<T>) -> StatusCode {
    match result {
        Ok(_) => StatusCode::Success,
        Err(e) => e.status_code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_in_mbs() {
        let res = Resolution::from((720, 480));
        assert_eq!(res.width_in_mbs(), 45);
        assert_eq!(res.height_in_mbs(), 30);
        assert_eq!(res.num_mbs(), 1350);

        let odd = Resolution::from((17, 1));
        assert_eq!(odd.width_in_mbs(), 2);
        assert_eq!(odd.height_in_mbs(), 1);
        assert!(res.can_contain(odd));
        assert!(!odd.can_contain(res));
    }

    #[test]
    fn test_status_codes() {
        let err: MediaResult<()> = Err(MediaError::InvalidParameter("packet 99".into()));
        assert_eq!(status_code_of(&err), StatusCode::InvalidParameter);
        assert_eq!(status_code_of(&Ok(())), StatusCode::Success);
        assert_eq!(MediaError::NoSpace("command buffer").status_code() as u32, 0x10);
        assert_eq!(StatusCode::n(5), Some(StatusCode::NullPointer));
        assert_eq!(StatusCode::n(3), None);
        let other = MediaError::from(anyhow::anyhow!("driver went away"));
        assert_eq!(other.status_code(), StatusCode::Unknown);
    }
}
