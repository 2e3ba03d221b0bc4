// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VDBOX MMIO register map.

pub const GPU_TIMESTAMP: u32 = 0x2358;

const VDBOX_BASE: [u32; 4] = [0x1c_0000, 0x1c_4000, 0x1d_0000, 0x1d_4000];

/// Register offsets of one VDBOX instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VdboxMmio {
    base: u32,
}

impl VdboxMmio {
    /// Registers of the VDBOX driven by pipe `index`. Pipes beyond the last instance wrap around.
    pub fn for_pipe(index: u8) -> Self {
        Self { base: VDBOX_BASE[index as usize % VDBOX_BASE.len()] }
    }

    pub fn mfx_error_flags(&self) -> u32 {
        self.base + 0x0800
    }

    pub fn mfx_frame_crc(&self) -> u32 {
        self.base + 0x0850
    }

    pub fn mfx_mb_count(&self) -> u32 {
        self.base + 0x0868
    }

    pub fn mfc_bitstream_bytecount_frame(&self) -> u32 {
        self.base + 0x08a0
    }

    pub fn mfc_image_status_ctrl(&self) -> u32 {
        self.base + 0x08b8
    }

    pub fn mfc_qp_status_count(&self) -> u32 {
        self.base + 0x08bc
    }

    pub fn huc_status(&self) -> u32 {
        self.base + 0x2000
    }

    pub fn huc_status2(&self) -> u32 {
        self.base + 0x23b0
    }
}
