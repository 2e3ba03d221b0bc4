// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Memory interface (MI) commands understood by every command streamer.

use crate::hw::BatchBuffer;
use crate::hw::CommandSink;
use crate::os::Resource;
use crate::MediaResult;

const fn mi_header(opcode: u32, length: u32) -> u32 {
    (opcode << 23) | (length - 2)
}

pub const MI_NOOP: u32 = 0;
pub const MI_BATCH_BUFFER_END: u32 = 0x0A << 23;

pub const OPCODE_NOOP: u32 = 0x00;
pub const OPCODE_BATCH_BUFFER_END: u32 = 0x0A;
pub const OPCODE_STORE_DATA_IMM: u32 = 0x20;
pub const OPCODE_STORE_REGISTER_MEM: u32 = 0x24;
pub const OPCODE_FLUSH_DW: u32 = 0x26;
pub const OPCODE_COPY_MEM_MEM: u32 = 0x2E;
pub const OPCODE_BATCH_BUFFER_START: u32 = 0x31;

/// Bit of `MI_BATCH_BUFFER_START` making the jump return to the caller on `MI_BATCH_BUFFER_END`.
pub const SECOND_LEVEL_BATCH: u32 = 1 << 22;

/// Sizes in bytes.
pub const BATCH_BUFFER_START_SIZE: u32 = 12;
pub const BATCH_BUFFER_END_SIZE: u32 = 4;
pub const STORE_DATA_IMM_SIZE: u32 = 16;
pub const STORE_REGISTER_MEM_SIZE: u32 = 16;
pub const FLUSH_DW_SIZE: u32 = 20;
pub const COPY_MEM_MEM_SIZE: u32 = 20;

/// Command client encoded in the top bits of every header.
pub fn command_type(header: u32) -> u32 {
    header >> 29
}

pub fn opcode(header: u32) -> u32 {
    (header >> 23) & 0x3f
}

/// Total length in dwords of the MI command starting with `header`.
pub fn command_length(header: u32) -> usize {
    match opcode(header) {
        OPCODE_NOOP | OPCODE_BATCH_BUFFER_END => 1,
        _ => (header & 0xff) as usize + 2,
    }
}

pub fn add_batch_buffer_end(cmd: &mut dyn CommandSink) -> MediaResult<()> {
    cmd.add_dwords(&[MI_BATCH_BUFFER_END])
}

/// Jumps into `batch` at `offset`, returning to `cmd` once the batch ends.
pub fn add_batch_buffer_start(
    cmd: &mut dyn CommandSink,
    batch: &BatchBuffer,
    offset: u32,
) -> MediaResult<()> {
    add_second_level_batch(cmd, batch.resource(), offset)
}

/// Same as [`add_batch_buffer_start`], for commands the GPU itself wrote into `resource`.
pub fn add_second_level_batch(
    cmd: &mut dyn CommandSink,
    resource: &Resource,
    offset: u32,
) -> MediaResult<()> {
    cmd.add_dwords(&[mi_header(OPCODE_BATCH_BUFFER_START, 3) | SECOND_LEVEL_BATCH])?;
    cmd.add_address(resource, offset)
}

pub fn add_store_data_imm(
    cmd: &mut dyn CommandSink,
    resource: &Resource,
    offset: u32,
    value: u32,
) -> MediaResult<()> {
    cmd.add_dwords(&[mi_header(OPCODE_STORE_DATA_IMM, 4)])?;
    cmd.add_address(resource, offset)?;
    cmd.add_dwords(&[value])
}

pub fn add_store_register_mem(
    cmd: &mut dyn CommandSink,
    register: u32,
    resource: &Resource,
    offset: u32,
) -> MediaResult<()> {
    cmd.add_dwords(&[mi_header(OPCODE_STORE_REGISTER_MEM, 4), register])?;
    cmd.add_address(resource, offset)
}

/// Copies one dword from `src` to `dst`.
pub fn add_copy_mem_mem(
    cmd: &mut dyn CommandSink,
    dst: (&Resource, u32),
    src: (&Resource, u32),
) -> MediaResult<()> {
    cmd.add_dwords(&[mi_header(OPCODE_COPY_MEM_MEM, 5)])?;
    cmd.add_address(dst.0, dst.1)?;
    cmd.add_address(src.0, src.1)
}

pub fn add_flush_dw(cmd: &mut dyn CommandSink) -> MediaResult<()> {
    cmd.add_dwords(&[mi_header(OPCODE_FLUSH_DW, 5), 0, 0, 0, 0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::CommandBuffer;

    #[test]
    fn test_encoded_sizes() {
        let res = Resource::new(1, 0x40);
        let mut cmd = CommandBuffer::new(0x100, 0);

        add_store_data_imm(&mut cmd, &res, 0, 1).unwrap();
        assert_eq!(cmd.used(), STORE_DATA_IMM_SIZE);
        add_store_register_mem(&mut cmd, 0x2358, &res, 4).unwrap();
        assert_eq!(cmd.used(), STORE_DATA_IMM_SIZE + STORE_REGISTER_MEM_SIZE);
        add_flush_dw(&mut cmd).unwrap();
        add_copy_mem_mem(&mut cmd, (&res, 8), (&res, 0)).unwrap();
        add_batch_buffer_end(&mut cmd).unwrap();
        assert_eq!(
            cmd.used(),
            STORE_DATA_IMM_SIZE
                + STORE_REGISTER_MEM_SIZE
                + FLUSH_DW_SIZE
                + COPY_MEM_MEM_SIZE
                + BATCH_BUFFER_END_SIZE
        );
    }

    #[test]
    fn test_header_decoding() {
        let header = mi_header(OPCODE_STORE_DATA_IMM, 4);
        assert_eq!(command_type(header), 0);
        assert_eq!(opcode(header), OPCODE_STORE_DATA_IMM);
        assert_eq!(command_length(header), 4);
        assert_eq!(command_length(MI_BATCH_BUFFER_END), 1);
        assert_eq!(command_length(MI_NOOP), 1);
        assert_eq!(command_length(mi_header(OPCODE_BATCH_BUFFER_START, 3)), 3);
    }
}
