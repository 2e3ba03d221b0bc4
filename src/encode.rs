// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encode side of the VDBOX orchestration.
//!
//! Encoders recycle their per-frame buffers over [`RECYCLED_BUFFER_NUM`] slots. Before a slot is
//! reused, the frame that last used it must have completed, which [`RecycledBufferTracker`]
//! checks against the completed counter of the status report.

pub mod avc;

use std::time::Duration;

use log::debug;
use log::error;

use crate::status_report::CodecStatus;
use crate::status_report::EncodeStatusReportData;
use crate::status_report::StatusRecord;
use crate::status_report::StatusReportObserver;
use crate::status_report::QUERY_END;
use crate::MediaError;
use crate::MediaResult;

/// Number of frames whose buffers can be in flight at once.
pub const RECYCLED_BUFFER_NUM: usize = 6;
/// Total time to wait for a recycled slot to free up.
pub const MHW_TIMEOUT_MS_DEFAULT: u64 = 1000;
/// Interval between two reads of the completed counter while waiting.
pub const MHW_EVENT_TIMEOUT_MS: u64 = 5;

/// Tracks which frame last used each recycled slot.
#[derive(Debug, Default)]
pub struct RecycledBufferTracker {
    /// Value of the completed counter once the last frame using each slot is done.
    status_num: [u32; RECYCLED_BUFFER_NUM],
    current: usize,
}

impl RecycledBufferTracker {
    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Waits until the frame that last used the current slot has completed. `completed` reads
    /// the completed counter and `sleep` waits between two reads.
    pub fn wait_for_batch_buffer_complete<C, S>(
        &self,
        mut completed: C,
        mut sleep: S,
    ) -> MediaResult<()>
    where
        C: FnMut() -> MediaResult<u32>,
        S: FnMut(Duration),
    {
        let needed = self.status_num[self.current];
        let mut count = completed()?;
        if needed <= count {
            return Ok(());
        }

        let mut waited = 0;
        while waited < MHW_TIMEOUT_MS_DEFAULT {
            sleep(Duration::from_millis(MHW_EVENT_TIMEOUT_MS));
            waited += MHW_EVENT_TIMEOUT_MS;
            count = completed()?;
            if needed <= count {
                debug!("Waited {waited} ms for recycled slot {}", self.current);
                return Ok(());
            }
        }

        error!(
            "No recycled buffer available, wait timed out at {MHW_TIMEOUT_MS_DEFAULT} ms \
             (slot {} needs {needed}, completed {count})",
            self.current
        );
        Err(MediaError::NoSpace("recycled buffer"))
    }

    /// Records that the current slot is in use until the completed counter reaches `store_data`.
    pub fn record_submission(&mut self, store_data: u32) {
        self.status_num[self.current] = store_data;
    }

    /// Moves to the next slot. Every slot is considered free again after wrapping around.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % RECYCLED_BUFFER_NUM;
        if self.current == 0 {
            self.status_num = [0; RECYCLED_BUFFER_NUM];
        }
    }
}

/// Turns the MFC status registers stored at the end of a frame into the encode report.
#[derive(Default)]
pub struct EncodeStatusObserver;

impl StatusReportObserver for EncodeStatusObserver {
    fn completed(
        &mut self,
        status: &StatusRecord,
        report: &mut EncodeStatusReportData,
    ) -> MediaResult<()> {
        if status.hw_stored_data != QUERY_END {
            report.codec_status = CodecStatus::Error;
            return Ok(());
        }
        report.codec_status = CodecStatus::Successful;
        report.bitstream_size = status.bitstream_byte_count;
        report.qp_y = (status.qp_status_count & 0xff) as u8;
        report.num_passes = status.num_passes as u8;
        Ok(())
    }
}
