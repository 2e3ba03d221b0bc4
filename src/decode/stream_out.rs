// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-frame decode statistics copied out to a client buffer after the main decode.
//!
//! The main decode packet stores its statistics into an internal buffer when stream-out is
//! enabled for the frame. This sub-pipeline then copies them into the buffer given by the client.

use std::cell::RefCell;
use std::rc::Rc;

use crate::decode::input_bitstream::DecodeBitstream;
use crate::decode::sub_pipeline::DecodeSubPipeline;
use crate::decode::DecodePipeMode;
use crate::decode::DecodePipelineParams;
use crate::feature::FeatureRef;
use crate::hw::mi;
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

/// Local id of the stream-out copy packet.
pub const STREAM_OUT_PACKET: u32 = 0x11;

/// Dwords of statistics streamed out per frame.
pub const STREAM_OUT_DWORDS: u32 = 4;
pub const STREAM_OUT_SIZE: u32 = STREAM_OUT_DWORDS * 4;

/// Dword offsets within the stream-out record.
pub const STREAM_OUT_MB_COUNT: u32 = 0;
pub const STREAM_OUT_ERROR_STATUS: u32 = 4;
pub const STREAM_OUT_FRAME_CRC: u32 = 8;
pub const STREAM_OUT_FRAME_NUM: u32 = 12;

/// Stream-out state shared with the main decode packet.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamOutFeature {
    /// Whether the decode of the current frame must store its statistics.
    pub enabled: bool,
    /// Where the main decode stores them.
    pub buffer: Option<Resource>,
}

#[derive(Default)]
pub struct StreamOutPkt {
    src: Option<Resource>,
    dst: Option<Resource>,
}

impl StreamOutPkt {
    pub fn set_buffers(&mut self, src: Resource, dst: Resource) {
        self.src = Some(src);
        self.dst = Some(dst);
    }
}

impl MediaPacket for StreamOutPkt {
    fn name(&self) -> &'static str {
        "StreamOut"
    }

    fn init(&mut self) -> MediaResult<()> {
        Ok(())
    }

    fn prepare(&mut self, _state: &StateParams) -> MediaResult<()> {
        match self.dst {
            Some(dst) if dst.size() >= STREAM_OUT_SIZE => Ok(()),
            Some(_) => Err(MediaError::InvalidParameter("stream-out buffer is too small".into())),
            None => Err(MediaError::NullPointer("stream-out buffer")),
        }
    }

    fn submit(
        &mut self,
        cmd_buffer: &mut CommandBuffer,
        phase: PacketPhase,
        _state: &StateParams,
    ) -> MediaResult<()> {
        let (src, dst) = self.src.zip(self.dst).ok_or(MediaError::NullPointer("stream-out buffer"))?;
        for offset in (0..STREAM_OUT_SIZE).step_by(4) {
            mi::add_copy_mem_mem(cmd_buffer, (&dst, offset), (&src, offset))?;
        }
        mi::add_flush_dw(cmd_buffer)?;
        if phase.is_last() {
            mi::add_batch_buffer_end(cmd_buffer)?;
        }
        Ok(())
    }

    fn calculate_command_size(&self) -> MediaResult<CommandSize> {
        Ok(CommandSize::new(
            STREAM_OUT_DWORDS * mi::COPY_MEM_MEM_SIZE + mi::FLUSH_DW_SIZE + mi::BATCH_BUFFER_END_SIZE,
            STREAM_OUT_DWORDS * 2,
        ))
    }

    fn destroy(&mut self) -> MediaResult<()> {
        self.src = None;
        self.dst = None;
        Ok(())
    }
}

pub struct StreamOut {
    os: OsRef,
    feature: FeatureRef<StreamOutFeature>,
    bitstream: FeatureRef<DecodeBitstream>,
    registry: PacketRegistry,
    packet: Rc<RefCell<StreamOutPkt>>,
    packet_id: PacketId,
}

impl StreamOut {
    pub fn new(
        os: OsRef,
        feature: FeatureRef<StreamOutFeature>,
        bitstream: FeatureRef<DecodeBitstream>,
    ) -> Self {
        Self {
            os,
            feature,
            bitstream,
            registry: Default::default(),
            packet: Default::default(),
            packet_id: 0,
        }
    }
}

impl DecodeSubPipeline for StreamOut {
    fn name(&self) -> &'static str {
        "StreamOut"
    }

    fn init(&mut self, pipeline: &MediaPipeline) -> MediaResult<()> {
        let buffer = self.os.borrow_mut().allocate_buffer(
            STREAM_OUT_SIZE,
            "StreamOutBuffer",
            ResourceUsage::InternalReadWrite,
            Lockability::Lockable,
        )?;
        self.feature.borrow_mut().buffer = Some(buffer);

        self.packet_id = decode_packet_id(pipeline, STREAM_OUT_PACKET);
        let packet: PacketRef = self.packet.clone();
        packet.borrow_mut().init()?;
        self.registry.register_packet(self.packet_id, packet);
        Ok(())
    }

    /// Must run after the bitstream of the frame has been prepared, since statistics only exist
    /// for frames that get decoded.
    fn prepare(&mut self, params: &DecodePipelineParams) -> MediaResult<()> {
        let mut feature = self.feature.borrow_mut();
        match params.mode {
            DecodePipeMode::Begin | DecodePipeMode::End => feature.enabled = false,
            DecodePipeMode::Process => {
                feature.enabled = params.stream_out.is_some() && self.bitstream.borrow().complete;
                if let (true, Some(src), Some(dst)) =
                    (feature.enabled, feature.buffer, params.stream_out)
                {
                    self.packet.borrow_mut().set_buffers(src, dst);
                    self.registry.activate_packet(self.packet_id, true, Placement::new(0, 0))?;
                }
            }
        }
        Ok(())
    }

    fn media_function(&self) -> MediaFunction {
        MediaFunction::VdboxDecode
    }

    fn scalability_pars(&self) -> ScalabilityPars {
        ScalabilityPars::default()
    }

    fn registry(&mut self) -> &mut PacketRegistry {
        &mut self.registry
    }

    fn destroy(&mut self) -> MediaResult<()> {
        self.registry.delete_packets()?;
        let mut feature = self.feature.borrow_mut();
        feature.enabled = false;
        if let Some(buffer) = feature.buffer.take() {
            self.os.borrow_mut().free_resource(&buffer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::sub_pipeline::execute_sub_pipeline;
    use crate::feature::FeatureManager;
    use crate::os::read_bytes;
    use crate::os::sysmem::SysMemOs;
    use crate::os::write_bytes;
    use crate::pipeline::PipelineSettings;

    #[test]
    fn test_copies_statistics_of_decoded_frames() {
        let sysmem = Rc::new(RefCell::new(SysMemOs::new().with_auto_complete(true)));
        let os: OsRef = sysmem.clone();
        let mut pipeline = MediaPipeline::new(os.clone(), PipelineSettings::default());
        pipeline.init().unwrap();
        let mut features = FeatureManager::default();
        let feature = features.register(StreamOutFeature::default());
        let bitstream = features.register(DecodeBitstream::default());

        let mut stream_out = StreamOut::new(os.clone(), feature.clone(), bitstream.clone());
        stream_out.init(&pipeline).unwrap();
        let internal = feature.borrow().buffer.unwrap();
        let stats: Vec<u8> = (1..=16).collect();
        write_bytes(&mut *os.borrow_mut(), &internal, 0, &stats).unwrap();

        let client = os
            .borrow_mut()
            .allocate_buffer(STREAM_OUT_SIZE, "client", ResourceUsage::Surface, Lockability::Lockable)
            .unwrap();
        let params = DecodePipelineParams {
            mode: DecodePipeMode::Process,
            bitstream: None,
            stream_out: Some(client),
        };

        // No statistics until the frame is complete.
        stream_out.prepare(&params).unwrap();
        assert!(!feature.borrow().enabled);
        execute_sub_pipeline(&mut pipeline, &mut stream_out).unwrap();
        assert!(sysmem.borrow().submissions().is_empty());

        bitstream.borrow_mut().complete = true;
        stream_out.prepare(&params).unwrap();
        assert!(feature.borrow().enabled);
        execute_sub_pipeline(&mut pipeline, &mut stream_out).unwrap();
        assert_eq!(sysmem.borrow().submissions().len(), 1);
        assert_eq!(read_bytes(&mut *os.borrow_mut(), &client, 0, STREAM_OUT_SIZE).unwrap(), stats);

        stream_out.destroy().unwrap();
        assert!(feature.borrow().buffer.is_none());
    }
}
