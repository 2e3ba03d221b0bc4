// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! OS layer backed by system memory, with a software command streamer.
//!
//! Submitted command buffers are queued and executed by [`SysMemOs::complete_pending`], which
//! plays the role of the GPU: it follows second-level batch buffers, performs the MI memory
//! writes and register stores, and runs HuC stream copies. Every other VDBOX command is counted
//! and skipped. This is enough to exercise the asynchronous status reporting without hardware.

use std::collections::HashMap;
use std::collections::VecDeque;

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use bytes::Buf;
use bytes::Bytes;
use log::debug;
use log::trace;

use crate::hw::mi;
use crate::hw::mmio;
use crate::hw::vdbox;
use crate::hw::CommandBuffer;
use crate::os::split_gpu_address;
use crate::os::GpuContext;
use crate::os::LockMode;
use crate::os::Lockability;
use crate::os::OsInterface;
use crate::os::Resource;
use crate::os::ResourceUsage;
use crate::MediaError;
use crate::MediaResult;

/// Maximum nesting of batch buffers, matching what the hardware supports.
const MAX_BATCH_DEPTH: u32 = 2;

struct SysMemResource {
    name: String,
    data: Vec<u8>,
    lockable: bool,
    locked: bool,
}

/// A command buffer as it was submitted.
#[derive(Clone, Debug)]
pub struct Submission {
    pub context: GpuContext,
    pub data: Bytes,
}

#[derive(Default)]
struct HucStream {
    src: u64,
    dst: u64,
    length: u32,
    src_offset: u32,
    dst_offset: u32,
}

pub struct SysMemOs {
    resources: HashMap<u32, SysMemResource>,
    next_id: u32,
    context: GpuContext,
    patch_list: bool,
    auto_complete: bool,
    pending: VecDeque<Submission>,
    history: Vec<Submission>,
    registers: HashMap<u32, u32>,
    timestamp: u32,
    huc: HucStream,
    vdbox_commands: usize,
}

impl Default for SysMemOs {
    fn default() -> Self {
        Self::new()
    }
}

impl SysMemOs {
    /// Creates an OS whose submissions only run when [`SysMemOs::complete_pending`] is called.
    pub fn new() -> Self {
        Self {
            resources: HashMap::new(),
            next_id: 1,
            context: GpuContext::default(),
            patch_list: true,
            auto_complete: false,
            pending: VecDeque::new(),
            history: Vec::new(),
            registers: HashMap::new(),
            timestamp: 0,
            huc: HucStream::default(),
            vdbox_commands: 0,
        }
    }

    /// Runs submissions as soon as they are made.
    pub fn with_auto_complete(mut self, auto_complete: bool) -> Self {
        self.auto_complete = auto_complete;
        self
    }

    pub fn with_patch_list(mut self, patch_list: bool) -> Self {
        self.patch_list = patch_list;
        self
    }

    /// Presets the value of an MMIO register, e.g. to inject a hardware error.
    pub fn set_register(&mut self, register: u32, value: u32) {
        self.registers.insert(register, value);
    }

    pub fn pending_submissions(&self) -> usize {
        self.pending.len()
    }

    pub fn submissions(&self) -> &[Submission] {
        &self.history
    }

    pub fn live_resources(&self) -> usize {
        self.resources.len()
    }

    pub fn resource_name(&self, resource: &Resource) -> Option<&str> {
        self.resources.get(&resource.id()).map(|r| r.name.as_str())
    }

    /// Number of VDBOX commands the command streamer went through.
    pub fn executed_vdbox_commands(&self) -> usize {
        self.vdbox_commands
    }

    /// Executes every queued submission in order.
    pub fn complete_pending(&mut self) -> MediaResult<()> {
        while let Some(submission) = self.pending.pop_front() {
            debug!(
                "Executing {} bytes submitted on {:?}",
                submission.data.len(),
                submission.context
            );
            self.execute(submission.data, 0)?;
        }
        Ok(())
    }

    fn read_register(&mut self, register: u32) -> u32 {
        if register == mmio::GPU_TIMESTAMP {
            self.timestamp = self.timestamp.wrapping_add(1);
            return self.timestamp;
        }
        self.registers.get(&register).copied().unwrap_or(0)
    }

    fn memory(&mut self, address: u64, len: usize) -> MediaResult<&mut [u8]> {
        let (id, offset) = split_gpu_address(address);
        let resource = self
            .resources
            .get_mut(&id)
            .ok_or_else(|| MediaError::InvalidParameter(format!("bad GPU address {address:#x}")))?;
        let start = offset as usize;
        resource.data.get_mut(start..start + len).ok_or_else(|| {
            MediaError::InvalidParameter(format!("GPU access past the end of {}", resource.name))
        })
    }

    fn write_u32(&mut self, address: u64, value: u32) -> MediaResult<()> {
        LittleEndian::write_u32(self.memory(address, 4)?, value);
        Ok(())
    }

    fn read_u32(&mut self, address: u64) -> MediaResult<u32> {
        Ok(LittleEndian::read_u32(self.memory(address, 4)?))
    }

    fn execute(&mut self, mut stream: Bytes, depth: u32) -> MediaResult<()> {
        while stream.remaining() >= 4 {
            let header = LittleEndian::read_u32(&stream[..4]);
            let len = if mi::command_type(header) == 0 {
                mi::command_length(header)
            } else {
                vdbox::command_length(header)
            };
            if stream.remaining() < len * 4 {
                return Err(MediaError::InvalidParameter(format!(
                    "truncated command {header:#010x}"
                )));
            }
            let mut cmd = stream.split_to(len * 4);
            cmd.advance(4);

            if mi::command_type(header) != 0 {
                self.execute_vdbox(header, cmd)?;
                continue;
            }

            match mi::opcode(header) {
                mi::OPCODE_NOOP | mi::OPCODE_FLUSH_DW => (),
                mi::OPCODE_BATCH_BUFFER_END => return Ok(()),
                mi::OPCODE_STORE_DATA_IMM => {
                    let address = cmd.get_u64_le();
                    let value = cmd.get_u32_le();
                    trace!("MI_STORE_DATA_IMM {value:#x} -> {address:#x}");
                    self.write_u32(address, value)?;
                }
                mi::OPCODE_STORE_REGISTER_MEM => {
                    let register = cmd.get_u32_le();
                    let address = cmd.get_u64_le();
                    let value = self.read_register(register);
                    trace!("MI_STORE_REGISTER_MEM {register:#x} ({value:#x}) -> {address:#x}");
                    self.write_u32(address, value)?;
                }
                mi::OPCODE_COPY_MEM_MEM => {
                    let dst = cmd.get_u64_le();
                    let src = cmd.get_u64_le();
                    let value = self.read_u32(src)?;
                    self.write_u32(dst, value)?;
                }
                mi::OPCODE_BATCH_BUFFER_START => {
                    if depth >= MAX_BATCH_DEPTH {
                        return Err(MediaError::InvalidParameter("batch buffers nested too deep".into()));
                    }
                    let address = cmd.get_u64_le();
                    let (id, offset) = split_gpu_address(address);
                    let batch = self
                        .resources
                        .get(&id)
                        .and_then(|r| r.data.get(offset as usize..))
                        .map(Bytes::copy_from_slice)
                        .ok_or_else(|| {
                            MediaError::InvalidParameter(format!("bad batch address {address:#x}"))
                        })?;
                    self.execute(batch, depth + 1)?;
                    if header & mi::SECOND_LEVEL_BATCH == 0 {
                        return Ok(());
                    }
                }
                op => {
                    return Err(MediaError::InvalidParameter(format!("unknown MI opcode {op:#x}")))
                }
            }
        }
        Ok(())
    }

    fn execute_vdbox(&mut self, header: u32, mut cmd: Bytes) -> MediaResult<()> {
        self.vdbox_commands += 1;
        match vdbox::command_id(header) {
            id if id == vdbox::HUC_IND_OBJ_BASE_ADDR_STATE.id => {
                self.huc.src = cmd.get_u64_le();
                self.huc.dst = cmd.get_u64_le();
            }
            id if id == vdbox::HUC_STREAM_OBJECT.id => {
                self.huc.length = cmd.get_u32_le();
                self.huc.src_offset = cmd.get_u32_le();
                self.huc.dst_offset = cmd.get_u32_le();
            }
            id if id == vdbox::HUC_START.id => {
                // Only stream copies are emulated, other firmware runs do nothing.
                let huc = std::mem::take(&mut self.huc);
                if huc.length == 0 {
                    return Ok(());
                }
                let len = huc.length as usize;
                let src = huc.src + u64::from(huc.src_offset);
                let dst = huc.dst + u64::from(huc.dst_offset);
                trace!("HuC copy of {len} bytes {src:#x} -> {dst:#x}");
                let data = self.memory(src, len)?.to_vec();
                self.memory(dst, len)?.copy_from_slice(&data);
            }
            _ => (),
        }
        Ok(())
    }

    fn resource_mut(&mut self, resource: &Resource) -> MediaResult<&mut SysMemResource> {
        self.resources
            .get_mut(&resource.id())
            .ok_or_else(|| MediaError::InvalidParameter(format!("unknown resource {}", resource.id())))
    }
}

impl OsInterface for SysMemOs {
    fn allocate_buffer(
        &mut self,
        size: u32,
        name: &str,
        _usage: ResourceUsage,
        lockability: Lockability,
    ) -> MediaResult<Resource> {
        if size == 0 {
            return Err(MediaError::InvalidParameter(format!("zero-sized buffer {name}")));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.resources.insert(
            id,
            SysMemResource {
                name: name.to_string(),
                data: vec![0; size as usize],
                lockable: lockability == Lockability::Lockable,
                locked: false,
            },
        );
        debug!("Allocated {name} ({size:#x} bytes) as resource {id}");
        Ok(Resource::new(id, size))
    }

    fn free_resource(&mut self, resource: &Resource) -> MediaResult<()> {
        self.resources
            .remove(&resource.id())
            .map(|_| ())
            .ok_or_else(|| MediaError::InvalidParameter(format!("double free of {}", resource.id())))
    }

    fn lock_resource(&mut self, resource: &Resource, _mode: LockMode) -> MediaResult<&mut [u8]> {
        let res = self.resource_mut(resource)?;
        if !res.lockable {
            return Err(MediaError::InvalidParameter(format!("{} is not lockable", res.name)));
        }
        if res.locked {
            return Err(MediaError::InvalidParameter(format!("{} is already locked", res.name)));
        }
        res.locked = true;
        Ok(&mut res.data)
    }

    fn mapping(&mut self, resource: &Resource) -> MediaResult<&mut [u8]> {
        let res = self.resource_mut(resource)?;
        if !res.locked {
            return Err(MediaError::InvalidParameter(format!("{} is not locked", res.name)));
        }
        Ok(&mut res.data)
    }

    fn unlock_resource(&mut self, resource: &Resource) -> MediaResult<()> {
        let res = self.resource_mut(resource)?;
        if !res.locked {
            return Err(MediaError::InvalidParameter(format!("{} is not locked", res.name)));
        }
        res.locked = false;
        Ok(())
    }

    fn submit_command_buffer(&mut self, cmd_buffer: &CommandBuffer) -> MediaResult<()> {
        let submission = Submission {
            context: self.context,
            data: Bytes::copy_from_slice(cmd_buffer.as_bytes()),
        };
        debug!(
            "Submitting {} bytes with {} patches on {:?}",
            submission.data.len(),
            cmd_buffer.patch_list().len(),
            self.context
        );
        self.history.push(submission.clone());
        self.pending.push_back(submission);
        if self.auto_complete {
            self.complete_pending()?;
        }
        Ok(())
    }

    fn wait_for_resource(&mut self, _resource: &Resource) -> MediaResult<()> {
        self.complete_pending()
    }

    fn uses_patch_list(&self) -> bool {
        self.patch_list
    }

    fn gpu_context(&self) -> GpuContext {
        self.context
    }

    fn set_gpu_context(&mut self, context: GpuContext) -> MediaResult<()> {
        if self.context != context {
            debug!("Switching GPU context {:?} -> {:?}", self.context, context);
            self.context = context;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::BatchBuffer;
    use crate::hw::CommandSink;
    use crate::os::read_u32;
    use crate::os::write_bytes;

    fn status_buffer(os: &mut SysMemOs) -> Resource {
        os.allocate_buffer(0x40, "status", ResourceUsage::StatusBuffer, Lockability::Lockable)
            .unwrap()
    }

    #[test]
    fn test_lock_rules() {
        let mut os = SysMemOs::new();
        let res = status_buffer(&mut os);
        let hidden = os
            .allocate_buffer(0x40, "rowstore", ResourceUsage::InternalReadWrite, Lockability::NotLockable)
            .unwrap();

        assert!(os.lock_resource(&hidden, LockMode::ReadOnly).is_err());
        assert!(os.mapping(&res).is_err());
        os.lock_resource(&res, LockMode::WriteOnly).unwrap();
        assert!(os.lock_resource(&res, LockMode::WriteOnly).is_err());
        os.unlock_resource(&res).unwrap();
        assert!(os.unlock_resource(&res).is_err());

        os.free_resource(&res).unwrap();
        assert!(os.free_resource(&res).is_err());
        assert_eq!(os.live_resources(), 1);
    }

    #[test]
    fn test_deferred_execution() {
        let mut os = SysMemOs::new();
        let res = status_buffer(&mut os);
        os.set_register(0x1c_0800, 0x44);

        let mut cmd = CommandBuffer::new(0x100, 8);
        mi::add_store_data_imm(&mut cmd, &res, 4, 0xff).unwrap();
        mi::add_store_register_mem(&mut cmd, 0x1c_0800, &res, 8).unwrap();
        mi::add_copy_mem_mem(&mut cmd, (&res, 12), (&res, 8)).unwrap();
        mi::add_batch_buffer_end(&mut cmd).unwrap();
        os.submit_command_buffer(&cmd).unwrap();

        assert_eq!(os.pending_submissions(), 1);
        assert_eq!(read_u32(&mut os, &res, 4).unwrap(), 0);

        os.complete_pending().unwrap();
        assert_eq!(read_u32(&mut os, &res, 4).unwrap(), 0xff);
        assert_eq!(read_u32(&mut os, &res, 8).unwrap(), 0x44);
        assert_eq!(read_u32(&mut os, &res, 12).unwrap(), 0x44);
        assert_eq!(os.submissions().len(), 1);
    }

    #[test]
    fn test_second_level_batch() {
        let mut os = SysMemOs::new().with_auto_complete(true);
        let res = status_buffer(&mut os);
        let mut bb = BatchBuffer::allocate(&mut os, 0x40, "bb").unwrap();
        bb.lock(&mut os).unwrap();
        vdbox::MFD_MPEG2_BSD_OBJECT.emit(&mut bb, &[], &[]).unwrap();
        mi::add_store_data_imm(&mut bb, &res, 0, 7).unwrap();
        mi::add_batch_buffer_end(&mut bb).unwrap();
        bb.unlock(&mut os, false).unwrap();

        let mut cmd = CommandBuffer::new(0x100, 8);
        mi::add_batch_buffer_start(&mut cmd, &bb, 0).unwrap();
        mi::add_store_data_imm(&mut cmd, &res, 4, 9).unwrap();
        mi::add_batch_buffer_end(&mut cmd).unwrap();
        os.submit_command_buffer(&cmd).unwrap();

        assert_eq!(read_u32(&mut os, &res, 0).unwrap(), 7);
        assert_eq!(read_u32(&mut os, &res, 4).unwrap(), 9);
        assert_eq!(os.executed_vdbox_commands(), 1);
    }

    #[test]
    fn test_huc_copy() {
        let mut os = SysMemOs::new().with_auto_complete(true);
        let src = status_buffer(&mut os);
        let dst = status_buffer(&mut os);
        write_bytes(&mut os, &src, 0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let mut cmd = CommandBuffer::new(0x100, 8);
        vdbox::add_huc_ind_obj_base_addr(&mut cmd, (&src, 0), (&dst, 0)).unwrap();
        vdbox::add_huc_stream_object(&mut cmd, 4, 2, 0x10).unwrap();
        vdbox::add_huc_start(&mut cmd).unwrap();
        os.submit_command_buffer(&cmd).unwrap();

        assert_eq!(read_u32(&mut os, &dst, 0x10).unwrap(), u32::from_le_bytes([3, 4, 5, 6]));
        assert_eq!(cmd.used() as usize, os.submissions()[0].data.len());
    }
}
