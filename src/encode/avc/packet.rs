// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Packets of the AVC VDENC pipeline: the two HuC BRC kernels and the VDENC/MFX encode itself.

use std::cell::RefCell;
use std::rc::Rc;

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use log::trace;

use crate::debug::DebugInterface;
use crate::encode::avc::feature::AvcBasicFeature;
use crate::encode::avc::feature::AvcBrcFeature;
use crate::encode::avc::feature::AvcPictureType;
use crate::encode::avc::feature::BRC_DMEM_SIZE;
use crate::encode::EncodeStatusObserver;
use crate::encode::RECYCLED_BUFFER_NUM;
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
use crate::os::write_bytes;
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

/// HuC kernels loaded by HUC_IMEM_STATE.
const HUC_BRC_INIT_KERNEL: u32 = 4;
const HUC_BRC_UPDATE_KERNEL: u32 = 5;

/// BRC init DMEM function codes.
const BRC_FUNC_INIT: u32 = 0;
const BRC_FUNC_RESET: u32 = 2;

/// Size of the image states of one pass, in bytes.
pub fn image_state_size() -> u32 {
    vdbox::MFX_AVC_IMG_STATE.size()
        + vdbox::VDENC_IMG_STATE.size()
        + vdbox::VDENC_CONST_QPT_STATE.size()
        + mi::BATCH_BUFFER_END_SIZE
}

fn add_image_states(cmd: &mut dyn CommandSink, basic: &AvcBasicFeature) -> MediaResult<()> {
    let res = basic.resolution;
    let size_in_mbs =
        (res.height_in_mbs().saturating_sub(1) << 16) | res.width_in_mbs().saturating_sub(1);
    let intra = u32::from(basic.picture_type == AvcPictureType::I);
    vdbox::MFX_AVC_IMG_STATE.emit(cmd, &[res.num_mbs(), size_in_mbs, intra], &[])?;
    vdbox::VDENC_IMG_STATE.emit(cmd, &[intra, u32::from(basic.qp)], &[])?;
    vdbox::VDENC_CONST_QPT_STATE.emit(cmd, &[], &[])?;
    mi::add_batch_buffer_end(cmd)
}

fn dmem_bytes(values: &[u32]) -> Vec<u8> {
    let mut data = vec![0u8; values.len() * 4];
    LittleEndian::write_u32_into(values, &mut data);
    data
}

fn huc_commands_size() -> u32 {
    vdbox::HUC_PIPE_MODE_SELECT.size()
        + vdbox::HUC_IMEM_STATE.size()
        + vdbox::HUC_DMEM_STATE.size()
        + vdbox::HUC_VIRTUAL_ADDR_STATE.size()
        + vdbox::HUC_START.size()
        + vdbox::VD_PIPELINE_FLUSH.size()
        + mi::FLUSH_DW_SIZE
        + mi::STORE_REGISTER_MEM_SIZE
}

/// Runs one HuC kernel and stores the HuC status `register` into `field` of the frame's record.
fn add_huc_kernel(
    cmd: &mut dyn CommandSink,
    state: &StateParams,
    kernel: u32,
    dmem: (&Resource, u32),
    regions: &[(&Resource, u32)],
    (register, field): (u32, StatusField),
) -> MediaResult<()> {
    vdbox::HUC_PIPE_MODE_SELECT.emit(cmd, &[], &[])?;
    vdbox::HUC_IMEM_STATE.emit(cmd, &[kernel], &[])?;
    vdbox::HUC_DMEM_STATE.emit(cmd, &[BRC_DMEM_SIZE], &[dmem])?;
    vdbox::HUC_VIRTUAL_ADDR_STATE.emit(cmd, &[], regions)?;
    vdbox::add_huc_start(cmd)?;
    vdbox::VD_PIPELINE_FLUSH.emit(cmd, &[1], &[])?;
    mi::add_flush_dw(cmd)?;

    let report = state.status_report.as_ref().ok_or(MediaError::NullPointer("status report"))?;
    let (resource, offset) = report.borrow().get_address(field);
    mi::add_store_register_mem(cmd, register, &resource, offset)
}

fn allocate_dmem(os: &OsRef, size: u32, name: &str) -> MediaResult<Resource> {
    os.borrow_mut().allocate_buffer(
        size,
        name,
        ResourceUsage::InternalReadWrite,
        Lockability::Lockable,
    )
}

/// Initializes, or resets, the bitrate control of the HuC.
pub struct HucBrcInitPkt {
    os: OsRef,
    basic: FeatureRef<AvcBasicFeature>,
    brc: FeatureRef<AvcBrcFeature>,
    dmem: Option<Resource>,
}

impl HucBrcInitPkt {
    pub fn new(
        os: OsRef,
        basic: FeatureRef<AvcBasicFeature>,
        brc: FeatureRef<AvcBrcFeature>,
    ) -> Self {
        Self { os, basic, brc, dmem: None }
    }
}

impl MediaPacket for HucBrcInitPkt {
    fn name(&self) -> &'static str {
        "HucBrcInit"
    }

    fn init(&mut self) -> MediaResult<()> {
        if self.dmem.is_none() {
            self.dmem = Some(allocate_dmem(&self.os, BRC_DMEM_SIZE, "HucBrcInitDmem")?);
        }
        Ok(())
    }

    fn prepare(&mut self, _state: &StateParams) -> MediaResult<()> {
        let dmem = self.dmem.ok_or(MediaError::NullPointer("BRC init DMEM"))?;
        let basic = self.basic.borrow();
        let brc = self.brc.borrow();
        let function = if brc.is_brc_reset() { BRC_FUNC_RESET } else { BRC_FUNC_INIT };
        let data = dmem_bytes(&[
            function,
            brc.target_bitrate,
            brc.max_bitrate.max(brc.target_bitrate),
            brc.frame_rate,
            basic.resolution.width,
            basic.resolution.height,
            u32::from(brc.num_passes()),
        ]);
        write_bytes(&mut *self.os.borrow_mut(), &dmem, 0, &data)
    }

    fn submit(
        &mut self,
        cmd_buffer: &mut CommandBuffer,
        phase: PacketPhase,
        state: &StateParams,
    ) -> MediaResult<()> {
        let dmem = self.dmem.ok_or(MediaError::NullPointer("BRC init DMEM"))?;
        let history = self.brc.borrow().history()?;
        let register = VdboxMmio::for_pipe(state.current_pipe).huc_status2();
        let status = (register, StatusField::HucStatus2);
        add_huc_kernel(
            cmd_buffer,
            state,
            HUC_BRC_INIT_KERNEL,
            (&dmem, 0),
            &[(&history, 0)],
            status,
        )?;
        if phase.is_last() {
            mi::add_batch_buffer_end(cmd_buffer)?;
        }
        Ok(())
    }

    fn calculate_command_size(&self) -> MediaResult<CommandSize> {
        Ok(CommandSize::new(huc_commands_size() + mi::BATCH_BUFFER_END_SIZE, 3))
    }

    fn destroy(&mut self) -> MediaResult<()> {
        if let Some(dmem) = self.dmem.take() {
            self.os.borrow_mut().free_resource(&dmem)?;
        }
        Ok(())
    }
}

/// Computes the QP of a pass and writes the image states the VDENC packet then runs.
pub struct HucBrcUpdatePkt {
    os: OsRef,
    basic: FeatureRef<AvcBasicFeature>,
    brc: FeatureRef<AvcBrcFeature>,
    /// One DMEM region per pass.
    dmem: Option<Resource>,
}

impl HucBrcUpdatePkt {
    pub fn new(
        os: OsRef,
        basic: FeatureRef<AvcBasicFeature>,
        brc: FeatureRef<AvcBrcFeature>,
    ) -> Self {
        Self { os, basic, brc, dmem: None }
    }

    fn passes(&self) -> u32 {
        u32::from(self.brc.borrow().num_passes())
    }
}

impl MediaPacket for HucBrcUpdatePkt {
    fn name(&self) -> &'static str {
        "HucBrcUpdate"
    }

    fn init(&mut self) -> MediaResult<()> {
        if self.dmem.is_none() {
            let size = BRC_DMEM_SIZE * self.passes();
            self.dmem = Some(allocate_dmem(&self.os, size, "HucBrcUpdateDmem")?);
        }
        Ok(())
    }

    fn prepare(&mut self, state: &StateParams) -> MediaResult<()> {
        let dmem = self.dmem.ok_or(MediaError::NullPointer("BRC update DMEM"))?;
        let basic = self.basic.borrow();
        let brc = self.brc.borrow();
        let target_frame_size = brc.target_bitrate / brc.frame_rate.max(1) / 8;
        let data = dmem_bytes(&[
            basic.frame_num,
            u32::from(state.current_pass),
            u32::from(basic.picture_type == AvcPictureType::I),
            u32::from(basic.qp),
            target_frame_size,
        ]);
        let offset = u32::from(state.current_pass) * BRC_DMEM_SIZE;
        write_bytes(&mut *self.os.borrow_mut(), &dmem, offset, &data)
    }

    fn submit(
        &mut self,
        cmd_buffer: &mut CommandBuffer,
        phase: PacketPhase,
        state: &StateParams,
    ) -> MediaResult<()> {
        let dmem = self.dmem.ok_or(MediaError::NullPointer("BRC update DMEM"))?;
        let (history, image_states) = {
            let brc = self.brc.borrow();
            (brc.history()?, brc.image_states()?)
        };
        let pass = u32::from(state.current_pass);
        let register = VdboxMmio::for_pipe(state.current_pipe).huc_status();
        let status = (register, StatusField::HucStatus);
        add_huc_kernel(
            cmd_buffer,
            state,
            HUC_BRC_UPDATE_KERNEL,
            (&dmem, pass * BRC_DMEM_SIZE),
            &[(&history, 0), (&image_states, pass * image_state_size())],
            status,
        )?;
        if phase.is_last() {
            mi::add_batch_buffer_end(cmd_buffer)?;
        }
        Ok(())
    }

    /// Every pass of a frame may go into the same command buffer.
    fn calculate_command_size(&self) -> MediaResult<CommandSize> {
        Ok(CommandSize::new(huc_commands_size(), 4).times(self.passes())
            + CommandSize::new(mi::BATCH_BUFFER_END_SIZE, 0))
    }

    fn destroy(&mut self) -> MediaResult<()> {
        if let Some(dmem) = self.dmem.take() {
            self.os.borrow_mut().free_resource(&dmem)?;
        }
        Ok(())
    }
}

/// One pass of VDENC encoding.
///
/// Under BRC the image states are the ones the HuC wrote for the pass. In CQP mode they are built
/// by the CPU into a batch buffer recycled over [`RECYCLED_BUFFER_NUM`] frames.
pub struct AvcVdencPkt {
    os: OsRef,
    basic: FeatureRef<AvcBasicFeature>,
    brc: FeatureRef<AvcBrcFeature>,
    status_report: StatusReportRef,
    observer: ObserverRef,
    profiler: Option<PerfProfilerRef>,
    image_states: BatchBufferArray,
}

impl AvcVdencPkt {
    pub fn new(
        os: OsRef,
        basic: FeatureRef<AvcBasicFeature>,
        brc: FeatureRef<AvcBrcFeature>,
        status_report: StatusReportRef,
        profiler: Option<PerfProfilerRef>,
    ) -> Self {
        Self {
            os,
            basic,
            brc,
            status_report,
            observer: Rc::new(RefCell::new(EncodeStatusObserver)),
            profiler,
            image_states: BatchBufferArray::new(
                "AvcVdencImageStates",
                image_state_size(),
                RECYCLED_BUFFER_NUM,
            ),
        }
    }

    fn status_registers(pipe: u8) -> [(u32, StatusField); 3] {
        let mmio = VdboxMmio::for_pipe(pipe);
        [
            (mmio.mfc_bitstream_bytecount_frame(), StatusField::BitstreamByteCount),
            (mmio.mfc_image_status_ctrl(), StatusField::ImageStatusCtrl),
            (mmio.mfc_qp_status_count(), StatusField::QpStatusCount),
        ]
    }

    fn add_surfaces(cmd: &mut dyn CommandSink, basic: &AvcBasicFeature) -> MediaResult<()> {
        let source = basic.source.ok_or(MediaError::NullPointer("source surface"))?;
        let recon = basic.reconstructed.ok_or(MediaError::NullPointer("reconstructed surface"))?;
        let bitstream = basic.bitstream.ok_or(MediaError::NullPointer("bitstream buffer"))?;
        let res = basic.resolution;
        let surface = (res.height.saturating_sub(1) << 18) | (res.width.saturating_sub(1) << 4);
        let reference: Vec<_> = basic.reference.iter().map(|r| (r, 0)).collect();

        vdbox::MFX_SURFACE_STATE.emit(cmd, &[surface], &[])?;
        vdbox::VDENC_SRC_SURFACE_STATE.emit(cmd, &[surface], &[(&source, 0)])?;
        vdbox::VDENC_REF_SURFACE_STATE.emit(cmd, &[surface], &reference)?;
        vdbox::VDENC_DS_REF_SURFACE_STATE.emit(cmd, &[surface >> 2], &[])?;

        let mut buffers = vec![(&recon, 0)];
        buffers.extend(reference.iter().copied());
        vdbox::MFX_PIPE_BUF_ADDR_STATE.emit(cmd, &[], &buffers)?;
        vdbox::MFX_IND_OBJ_BASE_ADDR_STATE.emit(cmd, &[], &[(&bitstream, 0)])?;

        let mut vdenc_buffers = vec![(&source, 0)];
        vdenc_buffers.extend(reference.iter().copied());
        vdbox::VDENC_PIPE_BUF_ADDR_STATE.emit(cmd, &[], &vdenc_buffers)
    }

    /// Writes the image states of `pass` into the batch buffer of the current slot and jumps
    /// to them.
    fn add_cqp_image_states(
        &mut self,
        cmd: &mut dyn CommandSink,
        basic: &AvcBasicFeature,
        pass: u16,
        last_pass: bool,
    ) -> MediaResult<()> {
        let mut os = self.os.borrow_mut();
        let batch = self.image_states.fetch(&mut *os, basic.recycled_index)?;
        if !batch.is_locked() {
            batch.lock(&mut *os)?;
        }
        let offset = u32::from(pass) * image_state_size();
        let written = batch.set_offset(offset).and_then(|()| add_image_states(&mut *batch, basic));
        let unlocked = if last_pass || written.is_err() {
            batch.unlock(&mut *os, true)
        } else {
            Ok(())
        };
        written.and(unlocked)?;
        mi::add_batch_buffer_start(cmd, batch, offset)
    }

    fn per_pass_size() -> CommandSize {
        let commands = vdbox::VDENC_PIPE_MODE_SELECT.size()
            + vdbox::MFX_PIPE_MODE_SELECT.size()
            + vdbox::MFX_SURFACE_STATE.size()
            + vdbox::VDENC_SRC_SURFACE_STATE.size()
            + vdbox::VDENC_REF_SURFACE_STATE.size()
            + vdbox::VDENC_DS_REF_SURFACE_STATE.size()
            + vdbox::MFX_PIPE_BUF_ADDR_STATE.size()
            + vdbox::MFX_IND_OBJ_BASE_ADDR_STATE.size()
            + vdbox::VDENC_PIPE_BUF_ADDR_STATE.size()
            + mi::BATCH_BUFFER_START_SIZE
            + vdbox::MFX_AVC_REF_IDX_STATE.size()
            + vdbox::MFX_AVC_SLICE_STATE.size()
            + vdbox::VDENC_WALKER_STATE.size()
            + vdbox::VD_PIPELINE_FLUSH.size()
            + mi::FLUSH_DW_SIZE;
        // Source twice, reconstructed, bitstream, the reference three times, the batch jump.
        CommandSize::new(commands, 8)
    }
}

impl MediaPacket for AvcVdencPkt {
    fn name(&self) -> &'static str {
        "AvcVdenc"
    }

    fn init(&mut self) -> MediaResult<()> {
        self.status_report.borrow_mut().regist_observer(&self.observer);
        Ok(())
    }

    fn prepare(&mut self, state: &StateParams) -> MediaResult<()> {
        let passes = self.brc.borrow().num_passes();
        if state.current_pass >= u16::from(passes) {
            return Err(MediaError::InvalidParameter(format!(
                "pass {} of a {passes} pass frame",
                state.current_pass
            )));
        }
        self.basic.borrow().validate()
    }

    fn submit(
        &mut self,
        cmd_buffer: &mut CommandBuffer,
        phase: PacketPhase,
        state: &StateParams,
    ) -> MediaResult<()> {
        let basic_ref = Rc::clone(&self.basic);
        let basic = basic_ref.borrow();
        let (brc_enabled, passes, brc_image_states) = {
            let brc = self.brc.borrow();
            let image_states = if brc.is_brc_enabled() { Some(brc.image_states()?) } else { None };
            (brc.is_brc_enabled(), brc.num_passes(), image_states)
        };
        let report_ref = Rc::clone(&self.status_report);
        let status_report = report_ref.borrow();
        let pass = state.current_pass;
        let last_pass = pass + 1 == u16::from(passes);
        trace!("Frame {} pass {pass} of {passes}", basic.frame_num);

        if pass == 0 {
            status_report.start_status_report(cmd_buffer)?;
            if let Some(profiler) = &self.profiler {
                profiler.borrow().add_perf_collect_start(cmd_buffer)?;
            }
        }

        vdbox::VDENC_PIPE_MODE_SELECT.emit(cmd_buffer, &[u32::from(brc_enabled)], &[])?;
        // Encoding, VDENC enabled.
        vdbox::MFX_PIPE_MODE_SELECT.emit(cmd_buffer, &[(1 << 9) | 1], &[])?;
        Self::add_surfaces(cmd_buffer, &basic)?;

        match brc_image_states {
            Some(image_states) => mi::add_second_level_batch(
                cmd_buffer,
                &image_states,
                u32::from(pass) * image_state_size(),
            )?,
            None => self.add_cqp_image_states(cmd_buffer, &basic, pass, last_pass)?,
        }

        if basic.picture_type == AvcPictureType::P {
            vdbox::MFX_AVC_REF_IDX_STATE.emit(cmd_buffer, &[0], &[])?;
        }
        vdbox::MFX_AVC_SLICE_STATE.emit(
            cmd_buffer,
            &[basic.resolution.num_mbs(), u32::from(basic.qp), u32::from(last_pass)],
            &[],
        )?;
        vdbox::VDENC_WALKER_STATE.emit(cmd_buffer, &[basic.resolution.num_mbs()], &[])?;
        vdbox::VD_PIPELINE_FLUSH.emit(cmd_buffer, &[1], &[])?;
        mi::add_flush_dw(cmd_buffer)?;

        if last_pass {
            let (resource, offset) = status_report.get_address(StatusField::NumPasses);
            mi::add_store_data_imm(cmd_buffer, &resource, offset, u32::from(passes))?;
            status_report
                .end_status_report(cmd_buffer, &Self::status_registers(state.current_pipe))?;
            if let Some(profiler) = &self.profiler {
                profiler.borrow().add_perf_collect_end(cmd_buffer)?;
            }
        }
        if phase.is_last() {
            mi::add_batch_buffer_end(cmd_buffer)?;
        }
        Ok(())
    }

    /// Every pass of a frame may go into the same command buffer.
    fn calculate_command_size(&self) -> MediaResult<CommandSize> {
        let passes = u32::from(self.brc.borrow().num_passes());
        let registers = Self::status_registers(0).len();
        let frame = CommandSize::new(
            MediaStatusReport::status_commands_size(registers)
                + mi::STORE_DATA_IMM_SIZE
                + PerfProfiler::cmd_size()
                + mi::BATCH_BUFFER_END_SIZE
                + COMMAND_BUFFER_RESERVED_SPACE,
            MediaStatusReport::status_commands_patches(registers) + 1 + 2,
        );
        Ok(Self::per_pass_size().times(passes) + frame)
    }

    fn destroy(&mut self) -> MediaResult<()> {
        self.status_report.borrow_mut().unregist_observer(&self.observer);
        self.image_states.destroy(&mut *self.os.borrow_mut())
    }

    fn dump_output(&mut self, debug: &mut dyn DebugInterface) -> MediaResult<()> {
        let index = self.basic.borrow().recycled_index;
        let Some(batch) = self.image_states.get(index) else {
            return Ok(());
        };
        let data = read_bytes(&mut *self.os.borrow_mut(), batch.resource(), 0, batch.size())?;
        debug.dump_data("AvcVdencImageStates", &data)
    }
}
