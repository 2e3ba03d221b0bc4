// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Concatenation of a frame bitstream handed over in several buffers.
//!
//! When the first buffer of a frame does not hold the whole frame, every buffer is copied by the
//! HuC into a concatenation buffer, and the main decode only runs once the frame is complete.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use log::debug;

use crate::decode::sub_pipeline::DecodeSubPipeline;
use crate::decode::DecodePipeMode;
use crate::decode::DecodePipelineParams;
use crate::feature::FeatureRef;
use crate::hw::mi;
use crate::hw::vdbox;
use crate::hw::CommandBuffer;
use crate::hw::CommandSize;
use crate::os::Lockability;
use crate::os::OsRef;
use crate::os::Resource;
use crate::os::ResourceUsage;
use crate::packet::decode_packet_id;
use crate::packet::MediaPacket;
use crate::packet::PacketId;
use crate::packet::PacketPhase;
use crate::packet::PacketRef;
use crate::packet::PacketRegistry;
use crate::packet::Placement;
use crate::pipeline::MediaPipeline;
use crate::scalability::MediaFunction;
use crate::scalability::ScalabilityPars;
use crate::scalability::StateParams;
use crate::MediaError;
use crate::MediaResult;

/// Local id of the HuC copy packet.
pub const HUC_COPY_PACKET: u32 = 0x10;

/// Bitstream of the current frame, as the main decode must read it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodeBitstream {
    pub resource: Option<Resource>,
    pub size: u32,
    /// Whether the whole frame has been received.
    pub complete: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HucCopyParams {
    pub src: Resource,
    pub src_offset: u32,
    pub dst: Resource,
    pub dst_offset: u32,
    pub size: u32,
}

/// Copies a linear region of memory with the HuC stream-out path, one copy per submission.
#[derive(Default)]
pub struct HucCopyPkt {
    copies: VecDeque<HucCopyParams>,
}

impl HucCopyPkt {
    pub fn push_copy(&mut self, params: HucCopyParams) {
        self.copies.push_back(params);
    }

    pub fn pending_copies(&self) -> usize {
        self.copies.len()
    }
}

impl MediaPacket for HucCopyPkt {
    fn name(&self) -> &'static str {
        "HucCopy"
    }

    fn init(&mut self) -> MediaResult<()> {
        Ok(())
    }

    fn prepare(&mut self, _state: &StateParams) -> MediaResult<()> {
        if self.copies.is_empty() {
            return Err(MediaError::InvalidParameter("no copy to run".into()));
        }
        Ok(())
    }

    fn submit(
        &mut self,
        cmd_buffer: &mut CommandBuffer,
        phase: PacketPhase,
        _state: &StateParams,
    ) -> MediaResult<()> {
        let copy = self
            .copies
            .pop_front()
            .ok_or_else(|| MediaError::InvalidParameter("no copy to run".into()))?;
        vdbox::HUC_PIPE_MODE_SELECT.emit(cmd_buffer, &[], &[])?;
        vdbox::add_huc_ind_obj_base_addr(cmd_buffer, (&copy.src, 0), (&copy.dst, 0))?;
        vdbox::add_huc_stream_object(cmd_buffer, copy.size, copy.src_offset, copy.dst_offset)?;
        vdbox::add_huc_start(cmd_buffer)?;
        vdbox::VD_PIPELINE_FLUSH.emit(cmd_buffer, &[], &[])?;
        mi::add_flush_dw(cmd_buffer)?;
        if phase.is_last() {
            mi::add_batch_buffer_end(cmd_buffer)?;
        }
        Ok(())
    }

    fn calculate_command_size(&self) -> MediaResult<CommandSize> {
        let commands = vdbox::HUC_PIPE_MODE_SELECT.size()
            + vdbox::HUC_IND_OBJ_BASE_ADDR_STATE.size()
            + vdbox::HUC_STREAM_OBJECT.size()
            + vdbox::HUC_START.size()
            + vdbox::VD_PIPELINE_FLUSH.size()
            + mi::FLUSH_DW_SIZE
            + mi::BATCH_BUFFER_END_SIZE;
        Ok(CommandSize::new(commands, 2))
    }

    fn destroy(&mut self) -> MediaResult<()> {
        self.copies.clear();
        Ok(())
    }
}

pub struct InputBitstream {
    os: OsRef,
    bitstream: FeatureRef<DecodeBitstream>,
    registry: PacketRegistry,
    copy_packet: Rc<RefCell<HucCopyPkt>>,
    packet_id: PacketId,
    concat_buffer: Option<Resource>,
    accumulated: u32,
}

impl InputBitstream {
    pub fn new(os: OsRef, bitstream: FeatureRef<DecodeBitstream>) -> Self {
        Self {
            os,
            bitstream,
            registry: Default::default(),
            copy_packet: Default::default(),
            packet_id: 0,
            concat_buffer: None,
            accumulated: 0,
        }
    }

    fn concat_buffer(&mut self, size: u32) -> MediaResult<Resource> {
        if let Some(buffer) = self.concat_buffer {
            if buffer.size() >= size {
                return Ok(buffer);
            }
            self.os.borrow_mut().free_resource(&buffer)?;
        }
        let buffer = self.os.borrow_mut().allocate_buffer(
            size,
            "InputBitstreamConcat",
            ResourceUsage::Bitstream,
            Lockability::Lockable,
        )?;
        self.concat_buffer = Some(buffer);
        Ok(buffer)
    }

    fn append(&mut self, params: &DecodePipelineParams) -> MediaResult<()> {
        let Some(bs) = params.bitstream else {
            *self.bitstream.borrow_mut() = DecodeBitstream { complete: true, ..Default::default() };
            return Ok(());
        };
        let frame_size = bs.frame_size();

        if self.accumulated == 0 && bs.data_size >= frame_size {
            *self.bitstream.borrow_mut() = DecodeBitstream {
                resource: Some(bs.resource),
                size: bs.data_size,
                complete: true,
            };
            return Ok(());
        }

        let dst = self.concat_buffer(frame_size)?;
        let size = bs.data_size.min(frame_size.saturating_sub(self.accumulated));
        debug!("Appending {size:#x} bytes at {:#x} of a {frame_size:#x} bytes frame", self.accumulated);
        self.copy_packet.borrow_mut().push_copy(HucCopyParams {
            src: bs.resource,
            src_offset: 0,
            dst,
            dst_offset: self.accumulated,
            size,
        });
        self.registry.activate_packet(self.packet_id, true, Placement::new(0, 0))?;
        self.accumulated += size;

        *self.bitstream.borrow_mut() = DecodeBitstream {
            resource: Some(dst),
            size: self.accumulated,
            complete: self.accumulated >= frame_size,
        };
        Ok(())
    }
}

impl DecodeSubPipeline for InputBitstream {
    fn name(&self) -> &'static str {
        "InputBitstream"
    }

    fn init(&mut self, pipeline: &MediaPipeline) -> MediaResult<()> {
        self.packet_id = decode_packet_id(pipeline, HUC_COPY_PACKET);
        let packet: PacketRef = self.copy_packet.clone();
        packet.borrow_mut().init()?;
        self.registry.register_packet(self.packet_id, packet);
        Ok(())
    }

    fn prepare(&mut self, params: &DecodePipelineParams) -> MediaResult<()> {
        match params.mode {
            DecodePipeMode::Begin => {
                self.accumulated = 0;
                *self.bitstream.borrow_mut() = Default::default();
                Ok(())
            }
            DecodePipeMode::Process => self.append(params),
            DecodePipeMode::End => Ok(()),
        }
    }

    fn media_function(&self) -> MediaFunction {
        MediaFunction::VdboxCopy
    }

    fn scalability_pars(&self) -> ScalabilityPars {
        ScalabilityPars::default()
    }

    fn registry(&mut self) -> &mut PacketRegistry {
        &mut self.registry
    }

    fn destroy(&mut self) -> MediaResult<()> {
        self.registry.delete_packets()?;
        if let Some(buffer) = self.concat_buffer.take() {
            self.os.borrow_mut().free_resource(&buffer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::sub_pipeline::execute_sub_pipeline;
    use crate::decode::BitstreamParams;
    use crate::feature::FeatureManager;
    use crate::os::read_bytes;
    use crate::os::sysmem::SysMemOs;
    use crate::os::write_bytes;
    use crate::pipeline::PipelineSettings;

    fn fragment(os: &OsRef, data: &[u8]) -> Resource {
        let mut os = os.borrow_mut();
        let resource = os
            .allocate_buffer(
                data.len() as u32,
                "fragment",
                ResourceUsage::Bitstream,
                Lockability::Lockable,
            )
            .unwrap();
        write_bytes(&mut *os, &resource, 0, data).unwrap();
        resource
    }

    fn process(resource: Resource, data_size: u32, frame_size: u32) -> DecodePipelineParams {
        DecodePipelineParams {
            mode: DecodePipeMode::Process,
            bitstream: Some(BitstreamParams { resource, data_size, frame_size }),
            stream_out: None,
        }
    }

    #[test]
    fn test_concatenates_fragments() {
        let sysmem = Rc::new(RefCell::new(SysMemOs::new()));
        let os: OsRef = sysmem.clone();
        let mut pipeline = MediaPipeline::new(os.clone(), PipelineSettings::default());
        pipeline.init().unwrap();
        let mut features = FeatureManager::default();
        let bitstream = features.register(DecodeBitstream::default());

        let mut input = InputBitstream::new(os.clone(), bitstream.clone());
        input.init(&pipeline).unwrap();
        input.prepare(&DecodePipelineParams::default()).unwrap();

        let first = fragment(&os, b"abcd");
        input.prepare(&process(first, 4, 8)).unwrap();
        assert!(!bitstream.borrow().complete);
        execute_sub_pipeline(&mut pipeline, &mut input).unwrap();

        let second = fragment(&os, b"efgh");
        input.prepare(&process(second, 4, 8)).unwrap();
        execute_sub_pipeline(&mut pipeline, &mut input).unwrap();
        assert_eq!(sysmem.borrow().submissions().len(), 2);

        let state = *bitstream.borrow();
        assert!(state.complete);
        assert_eq!(state.size, 8);
        sysmem.borrow_mut().complete_pending().unwrap();
        let data = read_bytes(&mut *os.borrow_mut(), &state.resource.unwrap(), 0, 8).unwrap();
        assert_eq!(data, b"abcdefgh");
        assert_eq!(input.copy_packet.borrow().pending_copies(), 0);

        input.destroy().unwrap();
        os.borrow_mut().free_resource(&first).unwrap();
        os.borrow_mut().free_resource(&second).unwrap();
        pipeline.destroy().unwrap();
        assert_eq!(sysmem.borrow().live_resources(), 0);
    }

    #[test]
    fn test_whole_frame_is_used_in_place() {
        let sysmem = Rc::new(RefCell::new(SysMemOs::new()));
        let os: OsRef = sysmem.clone();
        let pipeline = MediaPipeline::new(os.clone(), PipelineSettings::default());
        let mut features = FeatureManager::default();
        let bitstream = features.register(DecodeBitstream::default());
        let mut input = InputBitstream::new(os.clone(), bitstream.clone());
        input.init(&pipeline).unwrap();

        let whole = fragment(&os, b"abcdefgh");
        input.prepare(&process(whole, 8, 0)).unwrap();
        assert!(input.registry().active_packets().is_empty());
        assert_eq!(
            *bitstream.borrow(),
            DecodeBitstream { resource: Some(whole), size: 8, complete: true }
        );

        input.prepare(&DecodePipelineParams { mode: DecodePipeMode::Process, ..Default::default() }).unwrap();
        assert!(bitstream.borrow().complete);
        assert!(bitstream.borrow().resource.is_none());
    }
}
