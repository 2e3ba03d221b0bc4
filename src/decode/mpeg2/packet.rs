// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The MPEG-2 decode packet.
//!
//! Picture level states go into the primary command buffer. Slices (VLD) or macroblocks (IDCT)
//! are written into a second-level batch buffer the primary buffer jumps to. The batch buffer is
//! recycled across frames, so it is only rewritten once the GPU is done with its previous content.

use std::cell::RefCell;
use std::rc::Rc;

use log::trace;

use crate::debug::DebugInterface;
use crate::decode::mpeg2::caps::Mpeg2Capabilities;
use crate::decode::mpeg2::feature::Mpeg2BasicFeature;
use crate::decode::mpeg2::feature::Mpeg2DecodeMode;
use crate::decode::mpeg2::feature::SliceSource;
use crate::decode::stream_out::StreamOutFeature;
use crate::decode::stream_out::STREAM_OUT_ERROR_STATUS;
use crate::decode::stream_out::STREAM_OUT_FRAME_CRC;
use crate::decode::stream_out::STREAM_OUT_FRAME_NUM;
use crate::decode::stream_out::STREAM_OUT_MB_COUNT;
use crate::decode::MfxStatusObserver;
use crate::feature::FeatureRef;
use crate::hw::mi;
use crate::hw::mmio::VdboxMmio;
use crate::hw::vdbox;
use crate::hw::BatchBufferArray;
use crate::hw::CommandBuffer;
use crate::hw::CommandSink;
use crate::hw::CommandSize;
use crate::hw::COMMAND_BUFFER_RESERVED_SPACE;
use crate::os::read_bytes;
use crate::os::Lockability;
use crate::os::OsRef;
use crate::os::Resource;
use crate::os::ResourceUsage;
use crate::packet::MediaPacket;
use crate::packet::PacketPhase;
use crate::profiler::PerfProfiler;
use crate::profiler::PerfProfilerRef;
use crate::scalability::StateParams;
use crate::status_report::MediaStatusReport;
use crate::status_report::ObserverRef;
use crate::status_report::StatusField;
use crate::status_report::StatusReportRef;
use crate::MediaError;
use crate::MediaResult;
use crate::Resolution;

/// Slice batch buffers recycled across frames.
const SLICE_BATCH_BUFFERS: usize = 4;

/// Bytes of row store needed per macroblock column.
const ROW_STORE_BYTES_PER_MB: u32 = 64;

/// Picture level states.
pub struct Mpeg2PicturePkt {
    caps: Mpeg2Capabilities,
    os: OsRef,
    bsd_row_store: Option<Resource>,
    mpr_row_store: Option<Resource>,
}

impl Mpeg2PicturePkt {
    pub fn new(caps: Mpeg2Capabilities, os: OsRef) -> Self {
        Self { caps, os, bsd_row_store: None, mpr_row_store: None }
    }

    /// Allocates the row stores the generation has no cache for.
    pub fn init(&mut self, resolution: Resolution) -> MediaResult<()> {
        let size = resolution.width_in_mbs() * ROW_STORE_BYTES_PER_MB;
        let mut os = self.os.borrow_mut();
        if !self.caps.bsd_row_store_cache && self.bsd_row_store.is_none() {
            self.bsd_row_store = Some(os.allocate_buffer(
                size,
                "Mpeg2BsdRowStoreScratch",
                ResourceUsage::InternalReadWrite,
                Lockability::Lockable,
            )?);
        }
        if !self.caps.mpr_row_store_cache && self.mpr_row_store.is_none() {
            self.mpr_row_store = Some(os.allocate_buffer(
                size,
                "Mpeg2MprRowStoreScratch",
                ResourceUsage::InternalReadWrite,
                Lockability::Lockable,
            )?);
        }
        Ok(())
    }

    pub fn add_picture_states(
        &self,
        cmd: &mut dyn CommandSink,
        feature: &Mpeg2BasicFeature,
    ) -> MediaResult<()> {
        let dest = feature.dest_surface.as_ref().ok_or(MediaError::NullPointer("destination"))?;
        let bitstream =
            feature.bitstream.resource.as_ref().ok_or(MediaError::NullPointer("bitstream"))?;
        let res = feature.resolution;
        let it_mode = feature.mode == Mpeg2DecodeMode::Idct;
        let pic = &feature.pic_params;

        vdbox::MFX_PIPE_MODE_SELECT.emit(cmd, &[(u32::from(it_mode) << 15) | 0x10], &[])?;
        let surface = (res.height.saturating_sub(1) << 18) | (res.width.saturating_sub(1) << 4);
        vdbox::MFX_SURFACE_STATE.emit(cmd, &[surface], &[])?;

        let mut addresses = vec![(dest, 0)];
        for reference in [&feature.forward_reference, &feature.backward_reference]
            .into_iter()
            .flatten()
        {
            addresses.push((reference, 0));
        }
        addresses.extend(self.bsd_row_store.iter().map(|r| (r, 0)));
        addresses.extend(self.mpr_row_store.iter().map(|r| (r, 0)));
        vdbox::MFX_PIPE_BUF_ADDR_STATE.emit(cmd, &[], &addresses)?;

        vdbox::MFX_IND_OBJ_BASE_ADDR_STATE.emit(cmd, &[], &[(bitstream, 0)])?;
        let bsp: Vec<_> = self.bsd_row_store.iter().map(|r| (r, 0)).collect();
        vdbox::MFX_BSP_BUF_BASE_ADDR_STATE.emit(cmd, &[], &bsp)?;

        let flags = pic.picture_coding_type as u32
            | (u32::from(pic.intra_vlc_format) << 4)
            | (u32::from(pic.quantizer_scale_type) << 5)
            | (u32::from(pic.top_field_first) << 6)
            | (u32::from(pic.alternate_scan) << 7);
        let size_in_mbs = (res.height_in_mbs().saturating_sub(1) << 16)
            | res.width_in_mbs().saturating_sub(1);
        vdbox::MFX_MPEG2_PIC_STATE.emit(cmd, &[flags, size_in_mbs], &[])?;

        // Intra then non-intra quantization matrix.
        vdbox::MFX_QM_STATE.emit(cmd, &[0], &[])?;
        vdbox::MFX_QM_STATE.emit(cmd, &[1], &[])?;

        if self.caps.vd_pipeline_flush {
            vdbox::VD_PIPELINE_FLUSH.emit(cmd, &[1], &[])?;
        }
        Ok(())
    }

    pub fn destroy(&mut self) -> MediaResult<()> {
        let mut os = self.os.borrow_mut();
        for resource in [self.bsd_row_store.take(), self.mpr_row_store.take()].into_iter().flatten() {
            os.free_resource(&resource)?;
        }
        Ok(())
    }
}

/// Slice objects of a VLD frame.
pub struct Mpeg2SlicePkt {
    caps: Mpeg2Capabilities,
}

impl Mpeg2SlicePkt {
    pub fn new(caps: Mpeg2Capabilities) -> Self {
        Self { caps }
    }

    pub fn add_slices(
        &self,
        batch: &mut dyn CommandSink,
        feature: &Mpeg2BasicFeature,
    ) -> MediaResult<()> {
        for slice in feature.slice_commands() {
            let position = (u32::from(slice.vertical_position) << 24)
                | (u32::from(slice.horizontal_position) << 16)
                | u32::from(slice.num_mbs);
            // Dummy slices are read from the dummy bitstream rather than the frame's.
            let flags = u32::from(slice.last)
                | (u32::from(slice.source == SliceSource::Dummy) << 1)
                | (u32::from(slice.quantiser_scale_code) << 8)
                | (u32::from(slice.macroblock_offset & 7) << 16);
            vdbox::MFD_MPEG2_BSD_OBJECT.emit(
                batch,
                &[slice.length, slice.offset, position, flags],
                &[],
            )?;
        }
        trace!(
            "{} slices, {:#x} bytes per slice",
            feature.slice_commands().len(),
            self.caps.slice_states_size()
        );
        Ok(())
    }
}

/// IT objects of an IDCT frame.
pub struct Mpeg2MbPkt {
    caps: Mpeg2Capabilities,
}

impl Mpeg2MbPkt {
    pub fn new(caps: Mpeg2Capabilities) -> Self {
        Self { caps }
    }

    pub fn add_macroblocks(
        &self,
        batch: &mut dyn CommandSink,
        feature: &Mpeg2BasicFeature,
    ) -> MediaResult<()> {
        for mb in feature.mb_commands() {
            vdbox::MFD_IT_OBJECT.emit(
                batch,
                &[
                    u32::from(mb.mb_addr),
                    u32::from(mb.mb_type) | (u32::from(mb.skipped) << 16),
                    u32::from(mb.coded_block_pattern),
                    mb.data_offset,
                ],
                &[],
            )?;
        }
        trace!(
            "{} macroblocks, {:#x} bytes per macroblock",
            feature.mb_commands().len(),
            self.caps.slice_states_size()
        );
        Ok(())
    }
}

pub struct Mpeg2DecodePkt {
    os: OsRef,
    caps: Mpeg2Capabilities,
    feature: FeatureRef<Mpeg2BasicFeature>,
    stream_out: FeatureRef<StreamOutFeature>,
    status_report: StatusReportRef,
    observer: ObserverRef,
    profiler: Option<PerfProfilerRef>,
    picture: Mpeg2PicturePkt,
    slice: Mpeg2SlicePkt,
    mb: Mpeg2MbPkt,
    batch_buffers: BatchBufferArray,
    current_batch: usize,
}

impl Mpeg2DecodePkt {
    pub fn new(
        os: OsRef,
        caps: Mpeg2Capabilities,
        feature: FeatureRef<Mpeg2BasicFeature>,
        stream_out: FeatureRef<StreamOutFeature>,
        status_report: StatusReportRef,
        profiler: Option<PerfProfilerRef>,
    ) -> Self {
        let max_commands = feature.borrow().resolution.num_mbs();
        let batch_size =
            caps.slice_states_size() * (max_commands + 1) + mi::BATCH_BUFFER_END_SIZE;
        Self {
            picture: Mpeg2PicturePkt::new(caps, os.clone()),
            slice: Mpeg2SlicePkt::new(caps),
            mb: Mpeg2MbPkt::new(caps),
            batch_buffers: BatchBufferArray::new("Mpeg2SliceBatch", batch_size, SLICE_BATCH_BUFFERS),
            current_batch: 0,
            observer: Rc::new(RefCell::new(MfxStatusObserver::new(caps.mfx_error_mask))),
            os,
            caps,
            feature,
            stream_out,
            status_report,
            profiler,
        }
    }

    fn status_registers(pipe: u8) -> [(u32, StatusField); 3] {
        let mmio = VdboxMmio::for_pipe(pipe);
        [
            (mmio.mfx_error_flags(), StatusField::ErrorStatus),
            (mmio.mfx_mb_count(), StatusField::MbCount),
            (mmio.mfx_frame_crc(), StatusField::FrameCrc),
        ]
    }

    /// Writes the slices or macroblocks of the frame into the current batch buffer.
    fn write_batch(&mut self, feature: &Mpeg2BasicFeature) -> MediaResult<()> {
        let mut os = self.os.borrow_mut();
        let batch = self.batch_buffers.fetch(&mut *os, self.current_batch)?;
        batch.lock(&mut *os)?;
        let written = match feature.mode {
            Mpeg2DecodeMode::Vld => self.slice.add_slices(&mut *batch, feature),
            Mpeg2DecodeMode::Idct => self.mb.add_macroblocks(&mut *batch, feature),
        }
        .and_then(|()| mi::add_batch_buffer_end(&mut *batch));
        // The buffer gets unlocked even if writing it failed.
        let unlocked = batch.unlock(&mut *os, true);
        written.and(unlocked)
    }

    fn add_stream_out(
        &self,
        cmd: &mut dyn CommandSink,
        pipe: u8,
        frame_num: u32,
    ) -> MediaResult<()> {
        let stream_out = self.stream_out.borrow();
        let (true, Some(buffer)) = (stream_out.enabled, stream_out.buffer) else {
            return Ok(());
        };
        let mmio = VdboxMmio::for_pipe(pipe);
        mi::add_store_register_mem(cmd, mmio.mfx_mb_count(), &buffer, STREAM_OUT_MB_COUNT)?;
        mi::add_store_register_mem(cmd, mmio.mfx_error_flags(), &buffer, STREAM_OUT_ERROR_STATUS)?;
        mi::add_store_register_mem(cmd, mmio.mfx_frame_crc(), &buffer, STREAM_OUT_FRAME_CRC)?;
        mi::add_store_data_imm(cmd, &buffer, STREAM_OUT_FRAME_NUM, frame_num)
    }
}

impl MediaPacket for Mpeg2DecodePkt {
    fn name(&self) -> &'static str {
        "Mpeg2Decode"
    }

    fn init(&mut self) -> MediaResult<()> {
        let resolution = self.feature.borrow().resolution;
        self.picture.init(resolution)?;
        self.status_report.borrow_mut().regist_observer(&self.observer);
        Ok(())
    }

    fn prepare(&mut self, _state: &StateParams) -> MediaResult<()> {
        let feature = self.feature.borrow();
        let commands = match feature.mode {
            Mpeg2DecodeMode::Vld => feature.slice_commands().len(),
            Mpeg2DecodeMode::Idct => feature.mb_commands().len(),
        };
        if commands == 0 {
            return Err(MediaError::InvalidParameter("nothing to decode".into()));
        }
        self.current_batch = feature.frame_num as usize % SLICE_BATCH_BUFFERS;
        Ok(())
    }

    fn submit(
        &mut self,
        cmd_buffer: &mut CommandBuffer,
        phase: PacketPhase,
        state: &StateParams,
    ) -> MediaResult<()> {
        let feature_ref = Rc::clone(&self.feature);
        let feature = feature_ref.borrow();
        let report_ref = Rc::clone(&self.status_report);
        let status_report = report_ref.borrow();

        status_report.start_status_report(cmd_buffer)?;
        if let Some(profiler) = &self.profiler {
            profiler.borrow().add_perf_collect_start(cmd_buffer)?;
        }

        self.picture.add_picture_states(cmd_buffer, &feature)?;
        self.write_batch(&feature)?;
        let batch = self
            .batch_buffers
            .get(self.current_batch)
            .ok_or(MediaError::NullPointer("slice batch buffer"))?;
        mi::add_batch_buffer_start(cmd_buffer, batch, 0)?;

        self.add_stream_out(cmd_buffer, state.current_pipe, feature.frame_num)?;
        status_report.end_status_report(cmd_buffer, &Self::status_registers(state.current_pipe))?;
        if let Some(profiler) = &self.profiler {
            profiler.borrow().add_perf_collect_end(cmd_buffer)?;
        }
        if phase.is_last() {
            mi::add_batch_buffer_end(cmd_buffer)?;
        }
        Ok(())
    }

    fn calculate_command_size(&self) -> MediaResult<CommandSize> {
        let max_commands = self.feature.borrow().resolution.num_mbs();
        let registers = Self::status_registers(0).len();
        let commands = self.caps.picture_states_size()
            + MediaStatusReport::status_commands_size(registers)
            + 3 * mi::STORE_REGISTER_MEM_SIZE
            + mi::STORE_DATA_IMM_SIZE
            + PerfProfiler::cmd_size()
            + mi::BATCH_BUFFER_START_SIZE
            + mi::BATCH_BUFFER_END_SIZE
            + self.caps.slice_states_size() * (max_commands + 1)
            + COMMAND_BUFFER_RESERVED_SPACE;
        let patches = self.caps.picture_states_patches()
            + MediaStatusReport::status_commands_patches(registers)
            + 4
            + 2
            + 1;
        Ok(CommandSize::new(commands, patches))
    }

    fn destroy(&mut self) -> MediaResult<()> {
        self.status_report.borrow_mut().unregist_observer(&self.observer);
        self.picture.destroy()?;
        self.batch_buffers.destroy(&mut *self.os.borrow_mut())
    }

    fn dump_output(&mut self, debug: &mut dyn DebugInterface) -> MediaResult<()> {
        let Some(batch) = self.batch_buffers.get(self.current_batch) else {
            return Ok(());
        };
        let data = read_bytes(&mut *self.os.borrow_mut(), batch.resource(), 0, batch.used())?;
        debug.dump_data("Mpeg2SliceBatch", &data)
    }
}
