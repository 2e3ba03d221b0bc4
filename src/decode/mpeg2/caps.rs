// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! What each hardware generation can do for MPEG-2 decoding.

use crate::hw::vdbox;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum HwGeneration {
    #[default]
    Gen12,
    XeHpm,
    XeLpmPlus,
}

/// Capabilities the MPEG-2 decode stages are built from. One table per [`HwGeneration`], so a
/// single implementation of every stage serves all of them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Mpeg2Capabilities {
    /// The BSD row store lives in an on-chip cache instead of a scratch buffer.
    pub bsd_row_store_cache: bool,
    /// Same for the MPR row store.
    pub mpr_row_store_cache: bool,
    pub max_ref_frames: u32,
    /// Bits of the MFX error flags register that mean the frame is corrupted.
    pub mfx_error_mask: u32,
    /// Whether a VD_PIPELINE_FLUSH must close the picture.
    pub vd_pipeline_flush: bool,
}

impl HwGeneration {
    pub fn mpeg2_capabilities(self) -> Mpeg2Capabilities {
        let base = Mpeg2Capabilities {
            bsd_row_store_cache: false,
            mpr_row_store_cache: false,
            max_ref_frames: 2,
            mfx_error_mask: 0xfbff,
            vd_pipeline_flush: false,
        };
        match self {
            HwGeneration::Gen12 => base,
            HwGeneration::XeHpm => Mpeg2Capabilities {
                bsd_row_store_cache: true,
                mpr_row_store_cache: true,
                vd_pipeline_flush: true,
                ..base
            },
            HwGeneration::XeLpmPlus => {
                Mpeg2Capabilities { bsd_row_store_cache: true, vd_pipeline_flush: true, ..base }
            }
        }
    }
}

impl Mpeg2Capabilities {
    /// Picture level states emitted into the primary command buffer, in bytes.
    pub fn picture_states_size(&self) -> u32 {
        let flush = if self.vd_pipeline_flush { vdbox::VD_PIPELINE_FLUSH.size() } else { 0 };
        vdbox::MFX_PIPE_MODE_SELECT.size()
            + vdbox::MFX_SURFACE_STATE.size()
            + vdbox::MFX_PIPE_BUF_ADDR_STATE.size()
            + vdbox::MFX_IND_OBJ_BASE_ADDR_STATE.size()
            + vdbox::MFX_BSP_BUF_BASE_ADDR_STATE.size()
            + vdbox::MFX_MPEG2_PIC_STATE.size()
            + 2 * vdbox::MFX_QM_STATE.size()
            + flush
    }

    /// Relocations of the picture level states: destination, references, row stores, the
    /// bitstream and the deblocking output.
    pub fn picture_states_patches(&self) -> u32 {
        1 + 1 + self.max_ref_frames + 2 + 1 + 2
    }

    /// Size of the commands of one slice, which covers a macroblock as well.
    pub fn slice_states_size(&self) -> u32 {
        vdbox::MFD_MPEG2_BSD_OBJECT.size().max(vdbox::MFD_IT_OBJECT.size())
    }
}
