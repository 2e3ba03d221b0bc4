// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode side of the VDBOX orchestration.
//!
//! A decode pipeline is driven three times per frame, once per [`DecodePipeMode`]. The work of a
//! frame is split between the codec pipeline itself and auxiliary sub-pipelines running before
//! (bitstream concatenation) and after (stream-out) the main decode.

pub mod input_bitstream;
pub mod mpeg2;
pub mod stream_out;
pub mod sub_pipeline;

use log::warn;

use crate::os::Resource;
use crate::status_report::CodecStatus;
use crate::status_report::DecodeStatusReportData;
use crate::status_report::StatusRecord;
use crate::status_report::StatusReportObserver;
use crate::status_report::QUERY_END;
use crate::status_report::QUERY_SKIPPED;
use crate::MediaResult;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DecodePipeMode {
    /// Start of a frame, before any bitstream is known.
    #[default]
    Begin,
    /// A bitstream buffer of the frame is available.
    Process,
    /// All the buffers of the frame have been processed.
    End,
}

/// One buffer of bitstream handed to the decoder.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BitstreamParams {
    pub resource: Resource,
    /// Valid bytes in `resource`.
    pub data_size: u32,
    /// Size of the whole frame, which may span several buffers. Zero when the buffer holds the
    /// whole frame.
    pub frame_size: u32,
}

impl BitstreamParams {
    pub fn frame_size(&self) -> u32 {
        if self.frame_size == 0 {
            self.data_size
        } else {
            self.frame_size
        }
    }
}

/// Codec independent part of the parameters of a decode call.
#[derive(Clone, Debug, Default)]
pub struct DecodePipelineParams {
    pub mode: DecodePipeMode,
    pub bitstream: Option<BitstreamParams>,
    /// Client buffer receiving the per-frame stream-out statistics.
    pub stream_out: Option<Resource>,
}

/// Turns the MFX status registers stored at the end of a frame into the decode report.
pub struct MfxStatusObserver {
    error_mask: u32,
}

impl MfxStatusObserver {
    pub fn new(error_mask: u32) -> Self {
        Self { error_mask }
    }
}

impl StatusReportObserver for MfxStatusObserver {
    fn completed(
        &mut self,
        status: &StatusRecord,
        report: &mut DecodeStatusReportData,
    ) -> MediaResult<()> {
        match status.hw_stored_data {
            QUERY_END => {
                report.codec_status = if status.error_status & self.error_mask != 0 {
                    warn!(
                        "Frame {} decoded with MFX errors {:#x}",
                        report.feedback_number, status.error_status
                    );
                    CodecStatus::Error
                } else {
                    CodecStatus::Successful
                };
                report.num_mbs_affected = status.mb_count & 0xffff;
                report.frame_crc = status.frame_crc;
            }
            QUERY_SKIPPED => report.codec_status = CodecStatus::Successful,
            // The end of the frame was never reached, e.g. after a media reset.
            _ => report.codec_status = CodecStatus::Error,
        }
        Ok(())
    }
}
