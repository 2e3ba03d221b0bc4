// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the OS layer managing graphics resources and command submission.
//!
//! Everything above this layer refers to memory through opaque [`Resource`] handles and never
//! touches GPU contexts directly.

pub mod sysmem;

use std::cell::RefCell;
use std::rc::Rc;

use byteorder::ByteOrder;
use byteorder::LittleEndian;

use crate::hw::CommandBuffer;
use crate::MediaError;
use crate::MediaResult;

/// Opaque handle to a graphics buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Resource {
    id: u32,
    size: u32,
}

impl Resource {
    pub fn new(id: u32, size: u32) -> Self {
        Self { id, size }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// GPU virtual address of `offset` bytes into this resource. Every resource lives in its own
    /// 4GB window of the GPU address space.
    pub fn gpu_address(&self, offset: u32) -> u64 {
        (u64::from(self.id) << 32) | u64::from(offset)
    }
}

/// Splits a GPU address built by [`Resource::gpu_address`] into a resource id and an offset.
pub fn split_gpu_address(address: u64) -> (u32, u32) {
    ((address >> 32) as u32, address as u32)
}

/// Cacheability hint given when allocating a buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResourceUsage {
    /// Scratch buffers only ever touched by the hardware (row stores, stream-out).
    InternalReadWrite,
    /// Buffers the hardware writes and the CPU reads back (status, profiler).
    StatusBuffer,
    /// Second-level batch buffers.
    BatchBuffer,
    Bitstream,
    Surface,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Lockability {
    Lockable,
    NotLockable,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LockMode {
    ReadOnly,
    WriteOnly,
}

/// Hardware queue command buffers are submitted to.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum GpuContext {
    #[default]
    Video,
    VideoEncode,
    /// Virtual engine spanning several VDBOX instances.
    VirtualEngine,
}

pub trait OsInterface {
    fn allocate_buffer(
        &mut self,
        size: u32,
        name: &str,
        usage: ResourceUsage,
        lockability: Lockability,
    ) -> MediaResult<Resource>;

    fn free_resource(&mut self, resource: &Resource) -> MediaResult<()>;

    /// Maps `resource` for CPU access until [`OsInterface::unlock_resource`] is called.
    fn lock_resource(&mut self, resource: &Resource, mode: LockMode) -> MediaResult<&mut [u8]>;

    /// Returns the CPU mapping of an already locked resource.
    fn mapping(&mut self, resource: &Resource) -> MediaResult<&mut [u8]>;

    fn unlock_resource(&mut self, resource: &Resource) -> MediaResult<()>;

    fn submit_command_buffer(&mut self, cmd_buffer: &CommandBuffer) -> MediaResult<()>;

    /// Blocks until the GPU is done with every submission that may access `resource`.
    fn wait_for_resource(&mut self, resource: &Resource) -> MediaResult<()>;

    /// Whether the kernel driver needs a patch list to relocate addresses in command buffers.
    fn uses_patch_list(&self) -> bool;

    fn gpu_context(&self) -> GpuContext;

    fn set_gpu_context(&mut self, context: GpuContext) -> MediaResult<()>;
}

/// Shared handle to the OS layer. Pipelines, packets and the status report all hold one.
pub type OsRef = Rc<RefCell<dyn OsInterface>>;

pub fn read_u32(os: &mut dyn OsInterface, resource: &Resource, offset: u32) -> MediaResult<u32> {
    let data = os.lock_resource(resource, LockMode::ReadOnly)?;
    let start = offset as usize;
    let value = data
        .get(start..start + 4)
        .map(LittleEndian::read_u32)
        .ok_or_else(|| MediaError::InvalidParameter(format!("read past end at {offset:#x}")));
    os.unlock_resource(resource)?;
    value
}

pub fn read_bytes(
    os: &mut dyn OsInterface,
    resource: &Resource,
    offset: u32,
    len: u32,
) -> MediaResult<Vec<u8>> {
    let data = os.lock_resource(resource, LockMode::ReadOnly)?;
    let range = offset as usize..(offset + len) as usize;
    let bytes = data
        .get(range)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| MediaError::InvalidParameter(format!("read past end at {offset:#x}")));
    os.unlock_resource(resource)?;
    bytes
}

pub fn write_bytes(
    os: &mut dyn OsInterface,
    resource: &Resource,
    offset: u32,
    bytes: &[u8],
) -> MediaResult<()> {
    let data = os.lock_resource(resource, LockMode::WriteOnly)?;
    let range = offset as usize..offset as usize + bytes.len();
    let res = match data.get_mut(range) {
        Some(dst) => {
            dst.copy_from_slice(bytes);
            Ok(())
        }
        None => Err(MediaError::InvalidParameter(format!("write past end at {offset:#x}"))),
    };
    os.unlock_resource(resource)?;
    res
}
