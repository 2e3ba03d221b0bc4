// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VDBOX commands (MFX, HuC and VDENC).
//!
//! Only the header and the size of each command are meaningful here: field layouts belong to the
//! per-generation hardware definitions, so payloads are packed in order and zero padded. The
//! exceptions are the HuC stream commands, whose layout is fixed because the software command
//! streamer in [`crate::os::sysmem`] executes them:
//!
//! * `HUC_IND_OBJ_BASE_ADDR_STATE`: dwords 1-2 source base, dwords 3-4 destination base.
//! * `HUC_STREAM_OBJECT`: dword 1 length, dword 2 source offset, dword 3 destination offset.
//! * `HUC_START`: copies the described stream.

use crate::hw::CommandSink;
use crate::os::Resource;
use crate::MediaError;
use crate::MediaResult;

/// Hardware command type shared by all VDBOX commands.
pub const VDBOX_COMMAND_TYPE: u32 = 3;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VdboxCommand {
    pub name: &'static str,
    /// Upper 16 bits of the header.
    pub id: u16,
    pub dwords: u32,
}

impl VdboxCommand {
    pub const fn size(&self) -> u32 {
        self.dwords * 4
    }

    pub const fn header(&self) -> u32 {
        ((self.id as u32) << 16) | (self.dwords - 2)
    }

    /// Emits the command with `payload` right after the header followed by `addresses`.
    pub fn emit(
        &self,
        cmd: &mut dyn CommandSink,
        payload: &[u32],
        addresses: &[(&Resource, u32)],
    ) -> MediaResult<()> {
        let used = 1 + payload.len() as u32 + 2 * addresses.len() as u32;
        if used > self.dwords {
            return Err(MediaError::InvalidParameter(format!(
                "{} takes {} dwords, got {}",
                self.name, self.dwords, used
            )));
        }
        cmd.add_dwords(&[self.header()])?;
        cmd.add_dwords(payload)?;
        for (resource, offset) in addresses {
            cmd.add_address(resource, *offset)?;
        }
        let padding = vec![0u32; (self.dwords - used) as usize];
        cmd.add_dwords(&padding)
    }
}

/// Total length in dwords of the VDBOX command starting with `header`.
pub fn command_length(header: u32) -> usize {
    (header & 0xfff) as usize + 2
}

pub fn command_id(header: u32) -> u16 {
    (header >> 16) as u16
}

macro_rules! vdbox_commands {
    ($($name:ident = ($id:expr, $dwords:expr);)*) => {
        $(
            pub const $name: VdboxCommand =
                VdboxCommand { name: stringify!($name), id: $id, dwords: $dwords };
        )*
    };
}

vdbox_commands! {
    MFX_PIPE_MODE_SELECT = (0x7000, 5);
    MFX_SURFACE_STATE = (0x7001, 6);
    MFX_PIPE_BUF_ADDR_STATE = (0x7002, 68);
    MFX_IND_OBJ_BASE_ADDR_STATE = (0x7003, 26);
    MFX_BSP_BUF_BASE_ADDR_STATE = (0x7004, 10);
    MFX_QM_STATE = (0x7007, 18);
    MFX_AVC_IMG_STATE = (0x7100, 37);
    MFX_AVC_SLICE_STATE = (0x7103, 11);
    MFX_AVC_REF_IDX_STATE = (0x7104, 10);
    MFD_IT_OBJECT = (0x7109, 14);
    MFX_MPEG2_PIC_STATE = (0x7300, 13);
    MFD_MPEG2_BSD_OBJECT = (0x7328, 5);
    HUC_PIPE_MODE_SELECT = (0x7580, 3);
    HUC_IMEM_STATE = (0x7581, 5);
    HUC_DMEM_STATE = (0x7582, 6);
    HUC_IND_OBJ_BASE_ADDR_STATE = (0x7583, 11);
    HUC_VIRTUAL_ADDR_STATE = (0x7584, 49);
    HUC_STREAM_OBJECT = (0x7590, 9);
    HUC_START = (0x75a1, 2);
    VDENC_PIPE_MODE_SELECT = (0x7080, 5);
    VDENC_SRC_SURFACE_STATE = (0x7081, 6);
    VDENC_REF_SURFACE_STATE = (0x7082, 6);
    VDENC_DS_REF_SURFACE_STATE = (0x7083, 10);
    VDENC_PIPE_BUF_ADDR_STATE = (0x7084, 62);
    VDENC_IMG_STATE = (0x7085, 16);
    VDENC_CONST_QPT_STATE = (0x7086, 61);
    VDENC_WALKER_STATE = (0x7087, 10);
    VD_PIPELINE_FLUSH = (0x7780, 2);
}

pub fn add_huc_ind_obj_base_addr(
    cmd: &mut dyn CommandSink,
    src: (&Resource, u32),
    dst: (&Resource, u32),
) -> MediaResult<()> {
    HUC_IND_OBJ_BASE_ADDR_STATE.emit(cmd, &[], &[src, dst])
}

pub fn add_huc_stream_object(
    cmd: &mut dyn CommandSink,
    length: u32,
    src_offset: u32,
    dst_offset: u32,
) -> MediaResult<()> {
    HUC_STREAM_OBJECT.emit(cmd, &[length, src_offset, dst_offset], &[])
}

pub fn add_huc_start(cmd: &mut dyn CommandSink) -> MediaResult<()> {
    HUC_START.emit(cmd, &[1], &[])
}
