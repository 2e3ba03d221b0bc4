// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Command buffers, second-level batch buffers and the commands written into them.

pub mod mi;
pub mod mmio;
pub mod vdbox;

use std::ops::Add;
use std::ops::AddAssign;

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use bytes::BufMut;
use bytes::BytesMut;
use log::debug;

use crate::os::LockMode;
use crate::os::Lockability;
use crate::os::OsInterface;
use crate::os::Resource;
use crate::os::ResourceUsage;
use crate::MediaError;
use crate::MediaResult;

/// Space left unused at the end of every command buffer.
pub const COMMAND_BUFFER_RESERVED_SPACE: u32 = 0x80;

/// Upper bound of the command and patch-list space needed by a packet.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandSize {
    /// In bytes.
    pub commands: u32,
    /// In entries.
    pub patch_list: u32,
}

impl CommandSize {
    pub fn new(commands: u32, patch_list: u32) -> Self {
        Self { commands, patch_list }
    }

    pub fn times(self, count: u32) -> Self {
        Self { commands: self.commands * count, patch_list: self.patch_list * count }
    }

    /// Drops the patch list requirement when the OS does not relocate addresses.
    pub fn for_os(self, uses_patch_list: bool) -> Self {
        if uses_patch_list {
            self
        } else {
            Self { patch_list: 0, ..self }
        }
    }
}

impl Add for CommandSize {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            commands: self.commands + rhs.commands,
            patch_list: self.patch_list + rhs.patch_list,
        }
    }
}

impl AddAssign for CommandSize {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Relocation entry telling the kernel driver where a resource address was written.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PatchEntry {
    /// Byte offset of the address within the command stream.
    pub cmd_offset: u32,
    pub resource: Resource,
    pub resource_offset: u32,
}

/// Anything commands can be written into.
pub trait CommandSink {
    fn add_dwords(&mut self, dwords: &[u32]) -> MediaResult<()>;

    /// Writes the two-dword GPU address of `offset` within `resource`.
    fn add_address(&mut self, resource: &Resource, offset: u32) -> MediaResult<()>;

    /// Bytes written so far.
    fn used(&self) -> u32;
}

/// Primary command buffer handed out by the scalability layer.
#[derive(Clone, Debug, Default)]
pub struct CommandBuffer {
    data: BytesMut,
    capacity: u32,
    patch_list: Vec<PatchEntry>,
    patch_capacity: u32,
}

impl CommandBuffer {
    pub fn new(capacity: u32, patch_capacity: u32) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity as usize),
            capacity,
            patch_list: Vec::with_capacity(patch_capacity as usize),
            patch_capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn patch_capacity(&self) -> u32 {
        self.patch_capacity
    }

    pub fn remaining(&self) -> u32 {
        self.capacity - self.used()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn patch_list(&self) -> &[PatchEntry] {
        &self.patch_list
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Grows the buffer so it can hold at least `capacity` bytes and `patch_capacity` patches.
    pub fn ensure_capacity(&mut self, capacity: u32, patch_capacity: u32) {
        if capacity > self.capacity {
            debug!("Growing command buffer from {:#x} to {:#x} bytes", self.capacity, capacity);
            self.data.reserve((capacity - self.capacity) as usize);
            self.capacity = capacity;
        }
        self.patch_capacity = self.patch_capacity.max(patch_capacity);
    }

    pub fn reset(&mut self) {
        self.data.clear();
        self.patch_list.clear();
    }
}

impl CommandSink for CommandBuffer {
    fn add_dwords(&mut self, dwords: &[u32]) -> MediaResult<()> {
        if dwords.len() * 4 > self.remaining() as usize {
            return Err(MediaError::NoSpace("command buffer"));
        }
        for dw in dwords {
            self.data.put_u32_le(*dw);
        }
        Ok(())
    }

    fn add_address(&mut self, resource: &Resource, offset: u32) -> MediaResult<()> {
        if self.patch_capacity > 0 {
            if self.patch_list.len() as u32 >= self.patch_capacity {
                return Err(MediaError::NoSpace("patch list"));
            }
            self.patch_list.push(PatchEntry {
                cmd_offset: self.used(),
                resource: *resource,
                resource_offset: offset,
            });
        }
        let address = resource.gpu_address(offset);
        self.add_dwords(&[address as u32, (address >> 32) as u32])
    }

    fn used(&self) -> u32 {
        self.data.len() as u32
    }
}

/// Second-level batch buffer backed by a graphics resource.
///
/// The CPU may only write into the buffer between [`BatchBuffer::lock`] and
/// [`BatchBuffer::unlock`]. Commands are staged on the CPU side and copied into the resource on
/// unlock, after optionally waiting for the GPU to stop reading the previous content.
pub struct BatchBuffer {
    resource: Resource,
    staging: Vec<u8>,
    offset: u32,
    patch_list: Vec<PatchEntry>,
    locked: bool,
}

impl BatchBuffer {
    pub fn allocate(os: &mut dyn OsInterface, size: u32, name: &str) -> MediaResult<Self> {
        let resource =
            os.allocate_buffer(size, name, ResourceUsage::BatchBuffer, Lockability::Lockable)?;
        Ok(Self {
            resource,
            staging: vec![0; size as usize],
            offset: 0,
            patch_list: Vec::new(),
            locked: false,
        })
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn size(&self) -> u32 {
        self.resource.size()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn patch_list(&self) -> &[PatchEntry] {
        &self.patch_list
    }

    /// Moves the write position, so a region can be rewritten without touching the others.
    pub fn set_offset(&mut self, offset: u32) -> MediaResult<()> {
        if offset > self.size() {
            return Err(MediaError::ExceedMaxBbSize);
        }
        self.offset = offset;
        Ok(())
    }

    pub fn lock(&mut self, os: &mut dyn OsInterface) -> MediaResult<()> {
        if self.locked {
            return Err(MediaError::InvalidParameter("batch buffer is already locked".into()));
        }
        let mapped = os.lock_resource(&self.resource, LockMode::WriteOnly)?;
        let len = self.staging.len().min(mapped.len());
        self.staging[..len].copy_from_slice(&mapped[..len]);
        self.locked = true;
        self.offset = 0;
        self.patch_list.clear();
        Ok(())
    }

    /// Publishes the staged commands. With `wait_for_gpu`, any submission still reading the
    /// buffer completes before its content is replaced.
    pub fn unlock(&mut self, os: &mut dyn OsInterface, wait_for_gpu: bool) -> MediaResult<()> {
        if !self.locked {
            return Err(MediaError::InvalidParameter("batch buffer is not locked".into()));
        }
        if wait_for_gpu {
            os.wait_for_resource(&self.resource)?;
        }
        let mapped = os.mapping(&self.resource)?;
        let len = self.staging.len().min(mapped.len());
        mapped[..len].copy_from_slice(&self.staging[..len]);
        os.unlock_resource(&self.resource)?;
        self.locked = false;
        Ok(())
    }

    pub fn free(&self, os: &mut dyn OsInterface) -> MediaResult<()> {
        os.free_resource(&self.resource)
    }
}

impl CommandSink for BatchBuffer {
    fn add_dwords(&mut self, dwords: &[u32]) -> MediaResult<()> {
        if !self.locked {
            return Err(MediaError::InvalidParameter("batch buffer is not locked".into()));
        }
        let start = self.offset as usize;
        let end = start + dwords.len() * 4;
        if end > self.staging.len() {
            return Err(MediaError::ExceedMaxBbSize);
        }
        LittleEndian::write_u32_into(dwords, &mut self.staging[start..end]);
        self.offset = end as u32;
        Ok(())
    }

    fn add_address(&mut self, resource: &Resource, offset: u32) -> MediaResult<()> {
        self.patch_list.push(PatchEntry {
            cmd_offset: self.offset,
            resource: *resource,
            resource_offset: offset,
        });
        let address = resource.gpu_address(offset);
        self.add_dwords(&[address as u32, (address >> 32) as u32])
    }

    fn used(&self) -> u32 {
        self.offset
    }
}

/// Array of identical batch buffers recycled across frames, allocated on first use.
pub struct BatchBufferArray {
    name: String,
    buffer_size: u32,
    max_buffers: usize,
    buffers: Vec<BatchBuffer>,
}

impl BatchBufferArray {
    pub fn new(name: &str, buffer_size: u32, max_buffers: usize) -> Self {
        Self { name: name.to_string(), buffer_size, max_buffers, buffers: Vec::new() }
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Returns the buffer at `index`, allocating every buffer up to it if needed.
    pub fn fetch(&mut self, os: &mut dyn OsInterface, index: usize) -> MediaResult<&mut BatchBuffer> {
        if index >= self.max_buffers {
            return Err(MediaError::ExceedMaxBbSize);
        }
        while self.buffers.len() <= index {
            let name = format!("{}{}", self.name, self.buffers.len());
            self.buffers.push(BatchBuffer::allocate(os, self.buffer_size, &name)?);
        }
        Ok(&mut self.buffers[index])
    }

    pub fn get(&self, index: usize) -> Option<&BatchBuffer> {
        self.buffers.get(index)
    }

    pub fn destroy(&mut self, os: &mut dyn OsInterface) -> MediaResult<()> {
        for buffer in self.buffers.drain(..) {
            buffer.free(os)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::read_bytes;
    use crate::os::sysmem::SysMemOs;

    #[test]
    fn test_command_buffer_capacity() {
        let mut cmd = CommandBuffer::new(16, 1);
        let res = Resource::new(3, 0x100);

        cmd.add_dwords(&[1, 2]).unwrap();
        cmd.add_address(&res, 0x40).unwrap();
        assert_eq!(cmd.used(), 16);
        assert_eq!(cmd.remaining(), 0);
        assert_eq!(cmd.patch_list(), &[PatchEntry { cmd_offset: 8, resource: res, resource_offset: 0x40 }]);
        assert_eq!(&cmd.as_bytes()[8..16], &[0x40, 0, 0, 0, 3, 0, 0, 0]);

        assert!(matches!(cmd.add_dwords(&[3]), Err(MediaError::NoSpace(_))));

        cmd.ensure_capacity(32, 1);
        assert!(matches!(cmd.add_address(&res, 0), Err(MediaError::NoSpace("patch list"))));

        cmd.reset();
        assert!(cmd.is_empty());
        assert!(cmd.patch_list().is_empty());
    }

    #[test]
    fn test_command_size_sum() {
        let mut total = CommandSize::new(0x100, 4);
        total += CommandSize::new(0x20, 1).times(3);
        assert_eq!(total, CommandSize::new(0x160, 7));
        assert_eq!(total.for_os(false), CommandSize::new(0x160, 0));
    }

    #[test]
    fn test_batch_buffer_lock_discipline() {
        let mut os = SysMemOs::new();
        let mut bb = BatchBuffer::allocate(&mut os, 16, "bb").unwrap();

        assert!(matches!(bb.add_dwords(&[1]), Err(MediaError::InvalidParameter(_))));

        bb.lock(&mut os).unwrap();
        assert!(bb.lock(&mut os).is_err());
        bb.add_dwords(&[0xdead_beef, 0x1234_5678]).unwrap();
        assert!(matches!(bb.add_dwords(&[0, 0, 0]), Err(MediaError::ExceedMaxBbSize)));
        bb.unlock(&mut os, true).unwrap();
        assert!(bb.unlock(&mut os, false).is_err());

        let data = read_bytes(&mut os, bb.resource(), 0, 8).unwrap();
        assert_eq!(data, [0xef, 0xbe, 0xad, 0xde, 0x78, 0x56, 0x34, 0x12]);

        // Rewriting the second dword keeps the first one.
        bb.lock(&mut os).unwrap();
        bb.set_offset(4).unwrap();
        bb.add_dwords(&[7]).unwrap();
        bb.unlock(&mut os, false).unwrap();
        let data = read_bytes(&mut os, bb.resource(), 0, 8).unwrap();
        assert_eq!(data, [0xef, 0xbe, 0xad, 0xde, 7, 0, 0, 0]);
    }

    #[test]
    fn test_batch_buffer_array_fetch() {
        let mut os = SysMemOs::new();
        let mut array = BatchBufferArray::new("slices", 64, 3);
        assert!(array.is_empty());

        assert_eq!(array.fetch(&mut os, 1).unwrap().size(), 64);
        assert_eq!(array.len(), 2);
        array.fetch(&mut os, 0).unwrap();
        assert_eq!(array.len(), 2);
        assert!(matches!(array.fetch(&mut os, 3), Err(MediaError::ExceedMaxBbSize)));

        array.destroy(&mut os).unwrap();
        assert_eq!(os.live_resources(), 0);
    }
}
