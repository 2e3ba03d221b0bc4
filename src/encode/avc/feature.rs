// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-frame AVC encode state and bitrate control.

use log::debug;

use crate::os::Lockability;
use crate::os::OsRef;
use crate::os::Resource;
use crate::os::ResourceUsage;
use crate::MediaError;
use crate::MediaResult;
use crate::Resolution;

/// Size of the BRC history buffer kept by the HuC from one frame to the next.
pub const BRC_HISTORY_SIZE: u32 = 0x1000;
/// Size of the DMEM of one BRC kernel run.
pub const BRC_DMEM_SIZE: u32 = 0x100;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RateControl {
    /// Constant QP, no bitrate control.
    #[default]
    Cqp,
    Cbr,
    Vbr,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum AvcPictureType {
    #[default]
    I,
    P,
}

/// Everything the AVC packets need to know about the current frame.
#[derive(Debug)]
pub struct AvcBasicFeature {
    pub resolution: Resolution,
    pub picture_type: AvcPictureType,
    pub qp: u8,
    pub source: Option<Resource>,
    pub reference: Option<Resource>,
    pub reconstructed: Option<Resource>,
    pub bitstream: Option<Resource>,
    /// Frames encoded so far.
    pub frame_num: u32,
    /// Recycled slot the per-frame buffers of the current frame come from.
    pub recycled_index: usize,
}

impl AvcBasicFeature {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            picture_type: AvcPictureType::I,
            qp: 26,
            source: None,
            reference: None,
            reconstructed: None,
            bitstream: None,
            frame_num: 0,
            recycled_index: 0,
        }
    }

    /// Checks the surfaces of the frame. A P frame without reference is an error.
    pub fn validate(&self) -> MediaResult<()> {
        self.source.ok_or(MediaError::NullPointer("source surface"))?;
        self.reconstructed.ok_or(MediaError::NullPointer("reconstructed surface"))?;
        self.bitstream.ok_or(MediaError::NullPointer("bitstream buffer"))?;
        if self.picture_type == AvcPictureType::P && self.reference.is_none() {
            return Err(MediaError::InvalidParameter(format!(
                "P frame {} has no reference",
                self.frame_num
            )));
        }
        if self.qp > 51 {
            return Err(MediaError::InvalidParameter(format!("invalid QP {}", self.qp)));
        }
        Ok(())
    }
}

/// Bitrate control state, and the buffers the BRC kernels share across frames.
#[derive(Debug)]
pub struct AvcBrcFeature {
    rate_control: RateControl,
    pub target_bitrate: u32,
    pub max_bitrate: u32,
    pub frame_rate: u32,
    brc_passes: u8,
    init_required: bool,
    /// Whether the BRC has been initialized once, so the next init is a reset.
    initialized: bool,
    history: Option<Resource>,
    image_states: Option<Resource>,
}

impl AvcBrcFeature {
    pub fn new(rate_control: RateControl, brc_passes: u8) -> Self {
        Self {
            rate_control,
            target_bitrate: 0,
            max_bitrate: 0,
            frame_rate: 30,
            brc_passes: brc_passes.max(1),
            init_required: rate_control != RateControl::Cqp,
            initialized: false,
            history: None,
            image_states: None,
        }
    }

    /// Allocates the BRC buffers. `image_state_size` is the size of the image states of one
    /// pass, which the update kernel writes for the VDENC to read.
    pub fn init(&mut self, os: &OsRef, image_state_size: u32) -> MediaResult<()> {
        if !self.is_brc_enabled() || self.history.is_some() {
            return Ok(());
        }
        let mut os = os.borrow_mut();
        self.history = Some(os.allocate_buffer(
            BRC_HISTORY_SIZE,
            "VdencBrcHistory",
            ResourceUsage::InternalReadWrite,
            Lockability::Lockable,
        )?);
        self.image_states = Some(os.allocate_buffer(
            image_state_size * u32::from(self.brc_passes),
            "VdencBrcImageStates",
            ResourceUsage::BatchBuffer,
            Lockability::Lockable,
        )?);
        Ok(())
    }

    pub fn rate_control(&self) -> RateControl {
        self.rate_control
    }

    pub fn is_brc_enabled(&self) -> bool {
        self.rate_control != RateControl::Cqp
    }

    pub fn is_brc_init_required(&self) -> bool {
        self.init_required
    }

    /// True on frames after the first init, so the init kernel must reset the BRC instead.
    pub fn is_brc_reset(&self) -> bool {
        self.initialized
    }

    pub fn is_brc_update_required(&self) -> bool {
        self.is_brc_enabled()
    }

    pub fn num_passes(&self) -> u8 {
        if self.is_brc_enabled() {
            self.brc_passes
        } else {
            1
        }
    }

    pub fn history(&self) -> MediaResult<Resource> {
        self.history.ok_or(MediaError::NullPointer("BRC history buffer"))
    }

    pub fn image_states(&self) -> MediaResult<Resource> {
        self.image_states.ok_or(MediaError::NullPointer("BRC image states"))
    }

    /// Requests a BRC reset, e.g. after the target bitrate changed.
    pub fn reset(&mut self) {
        if self.is_brc_enabled() {
            debug!("BRC reset requested");
            self.init_required = true;
        }
    }

    pub fn frame_done(&mut self) {
        if self.init_required {
            self.initialized = true;
        }
        self.init_required = false;
    }

    pub fn destroy(&mut self, os: &OsRef) -> MediaResult<()> {
        let mut os = os.borrow_mut();
        for resource in [self.history.take(), self.image_states.take()].into_iter().flatten() {
            os.free_resource(&resource)?;
        }
        Ok(())
    }
}
