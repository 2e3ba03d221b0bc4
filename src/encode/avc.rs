// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! AVC encoding on the VDENC, optionally under HuC bitrate control.
//!
//! A frame is one [`AvcVdencPipeline::prepare`] followed by one [`AvcVdencPipeline::execute`].
//! Under BRC every pass of the frame runs the HuC BRC update kernel before the VDENC pass,
//! and the first frame (or the first frame after a bitrate change) also runs the BRC init
//! kernel. With single task phase support all of it goes into one command buffer, otherwise
//! every packet is submitted on its own.

pub mod feature;
pub mod packet;

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;
use log::error;

use crate::encode::avc::feature::AvcBasicFeature;
use crate::encode::avc::feature::AvcBrcFeature;
use crate::encode::avc::feature::AvcPictureType;
use crate::encode::avc::feature::RateControl;
use crate::encode::avc::packet::image_state_size;
use crate::encode::avc::packet::AvcVdencPkt;
use crate::encode::avc::packet::HucBrcInitPkt;
use crate::encode::avc::packet::HucBrcUpdatePkt;
use crate::encode::RecycledBufferTracker;
use crate::feature::FeatureRef;
use crate::os::OsRef;
use crate::os::Resource;
use crate::packet::decode_packet_id;
use crate::packet::PacketId;
use crate::packet::PacketRef;
use crate::packet::Placement;
use crate::pipeline::MediaPipeline;
use crate::pipeline::PipelineSettings;
use crate::scalability::MediaFunction;
use crate::status_report::EncodeStatusReportData;
use crate::status_report::FrameStatusParams;
use crate::MediaError;
use crate::MediaResult;
use crate::Resolution;

pub const HUC_BRC_INIT_PACKET: u32 = 1;
pub const HUC_BRC_UPDATE_PACKET: u32 = 2;
pub const VDENC_PACKET: u32 = 3;

#[derive(Clone, Debug)]
pub struct AvcEncodeSettings {
    pub resolution: Resolution,
    pub rate_control: RateControl,
    /// In bits per second. Ignored in CQP mode.
    pub target_bitrate: u32,
    pub max_bitrate: u32,
    pub frame_rate: u32,
    /// Passes per frame under BRC.
    pub brc_passes: u8,
    pub pipeline: PipelineSettings,
}

impl Default for AvcEncodeSettings {
    fn default() -> Self {
        Self {
            resolution: Resolution::default(),
            rate_control: RateControl::Cqp,
            target_bitrate: 0,
            max_bitrate: 0,
            frame_rate: 30,
            brc_passes: 2,
            pipeline: PipelineSettings::default(),
        }
    }
}

/// Parameters of one frame.
#[derive(Clone, Debug)]
pub struct AvcEncodeParams {
    pub picture_type: AvcPictureType,
    /// QP of the frame in CQP mode, initial QP under BRC.
    pub qp: u8,
    pub source: Option<Resource>,
    pub reference: Option<Resource>,
    pub reconstructed: Option<Resource>,
    pub bitstream: Option<Resource>,
    /// Forces the BRC to be reinitialized with the current bitrates.
    pub reset_brc: bool,
    /// New target bitrate, which resets the BRC if it changed.
    pub target_bitrate: Option<u32>,
}

impl Default for AvcEncodeParams {
    fn default() -> Self {
        Self {
            picture_type: AvcPictureType::I,
            qp: 26,
            source: None,
            reference: None,
            reconstructed: None,
            bitstream: None,
            reset_brc: false,
            target_bitrate: None,
        }
    }
}

struct PacketIds {
    brc_init: PacketId,
    brc_update: PacketId,
    vdenc: PacketId,
}

pub struct AvcVdencPipeline {
    pipeline: MediaPipeline,
    settings: AvcEncodeSettings,
    basic: FeatureRef<AvcBasicFeature>,
    brc: FeatureRef<AvcBrcFeature>,
    packet_ids: PacketIds,
    tracker: RecycledBufferTracker,
    /// Whether `prepare` was called for the frame about to be executed.
    prepared: bool,
    destroyed: bool,
}

impl AvcVdencPipeline {
    pub fn new(os: OsRef, settings: AvcEncodeSettings) -> MediaResult<Self> {
        let resolution = settings.resolution;
        if resolution.width == 0 || resolution.height == 0 {
            return Err(MediaError::InvalidParameter(format!(
                "invalid resolution {}x{}",
                resolution.width, resolution.height
            )));
        }
        if settings.rate_control != RateControl::Cqp && settings.target_bitrate == 0 {
            return Err(MediaError::InvalidParameter(format!(
                "{:?} needs a target bitrate",
                settings.rate_control
            )));
        }

        let mut pipeline = MediaPipeline::new(Rc::clone(&os), settings.pipeline.clone());
        pipeline.init()?;

        let features = pipeline.create_feature_manager()?;
        let basic = features.register(AvcBasicFeature::new(resolution));
        let brc = features.register({
            let mut brc = AvcBrcFeature::new(settings.rate_control, settings.brc_passes);
            brc.target_bitrate = settings.target_bitrate;
            brc.max_bitrate = settings.max_bitrate;
            brc.frame_rate = settings.frame_rate;
            brc
        });
        brc.borrow_mut().init(&os, image_state_size())?;

        let packet_ids = PacketIds {
            brc_init: decode_packet_id(&pipeline, HUC_BRC_INIT_PACKET),
            brc_update: decode_packet_id(&pipeline, HUC_BRC_UPDATE_PACKET),
            vdenc: decode_packet_id(&pipeline, VDENC_PACKET),
        };
        Self::register_packets(&mut pipeline, &os, &packet_ids, &basic, &brc)?;

        debug!("AVC pipeline {} ready for {:?}", pipeline.instance_id(), settings);
        Ok(Self {
            pipeline,
            settings,
            basic,
            brc,
            packet_ids,
            tracker: RecycledBufferTracker::default(),
            prepared: false,
            destroyed: false,
        })
    }

    fn register_packets(
        pipeline: &mut MediaPipeline,
        os: &OsRef,
        ids: &PacketIds,
        basic: &FeatureRef<AvcBasicFeature>,
        brc: &FeatureRef<AvcBrcFeature>,
    ) -> MediaResult<()> {
        let (init_os, init_basic, init_brc) = (Rc::clone(os), Rc::clone(basic), Rc::clone(brc));
        pipeline.register_packet_creator(
            ids.brc_init,
            Box::new(move || {
                let packet: PacketRef = Rc::new(RefCell::new(HucBrcInitPkt::new(
                    Rc::clone(&init_os),
                    Rc::clone(&init_basic),
                    Rc::clone(&init_brc),
                )));
                Ok(packet)
            }),
        );

        let (update_os, update_basic, update_brc) =
            (Rc::clone(os), Rc::clone(basic), Rc::clone(brc));
        pipeline.register_packet_creator(
            ids.brc_update,
            Box::new(move || {
                let packet: PacketRef = Rc::new(RefCell::new(HucBrcUpdatePkt::new(
                    Rc::clone(&update_os),
                    Rc::clone(&update_basic),
                    Rc::clone(&update_brc),
                )));
                Ok(packet)
            }),
        );

        let (os, basic, brc) = (Rc::clone(os), Rc::clone(basic), Rc::clone(brc));
        let status_report = pipeline.status_report()?;
        let profiler = pipeline.profiler();
        pipeline.register_packet_creator(
            ids.vdenc,
            Box::new(move || {
                let packet: PacketRef = Rc::new(RefCell::new(AvcVdencPkt::new(
                    Rc::clone(&os),
                    Rc::clone(&basic),
                    Rc::clone(&brc),
                    Rc::clone(&status_report),
                    profiler.clone(),
                )));
                Ok(packet)
            }),
        );
        Ok(())
    }

    pub fn pipeline(&self) -> &MediaPipeline {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut MediaPipeline {
        &mut self.pipeline
    }

    pub fn basic_feature(&self) -> &FeatureRef<AvcBasicFeature> {
        &self.basic
    }

    pub fn brc_feature(&self) -> &FeatureRef<AvcBrcFeature> {
        &self.brc
    }

    /// Sets up the next frame.
    pub fn prepare(&mut self, params: &AvcEncodeParams) -> MediaResult<()> {
        let frame_num = {
            let mut basic = self.basic.borrow_mut();
            basic.picture_type = params.picture_type;
            basic.qp = params.qp;
            basic.source = params.source;
            basic.reference = params.reference;
            basic.reconstructed = params.reconstructed;
            basic.bitstream = params.bitstream;
            basic.validate()?;
            basic.frame_num
        };

        {
            let mut brc = self.brc.borrow_mut();
            if let Some(target) = params.target_bitrate {
                if target != brc.target_bitrate {
                    debug!("Target bitrate {} -> {target}", brc.target_bitrate);
                    brc.target_bitrate = target;
                    brc.reset();
                }
            }
            if params.reset_brc {
                brc.reset();
            }
        }

        self.pipeline
            .status_report()?
            .borrow_mut()
            .init(FrameStatusParams { feedback_number: frame_num, picture_index: 0 })?;
        let pars = self.settings.pipeline.scalability_pars();
        self.pipeline.switch_context(MediaFunction::VdboxEncode, &pars)?;
        self.prepared = true;
        Ok(())
    }

    /// Submits the frame set up by the last [`AvcVdencPipeline::prepare`].
    pub fn execute(&mut self) -> MediaResult<()> {
        if !self.prepared {
            return Err(MediaError::InvalidParameter("frame executed before prepare".into()));
        }
        let report = self.pipeline.status_report()?;
        let completed = || report.borrow().get_completed_count();
        self.tracker.wait_for_batch_buffer_complete(completed, std::thread::sleep)?;
        self.basic.borrow_mut().recycled_index = self.tracker.current_index();

        let res = self.activate_packets().and_then(|()| self.pipeline.execute_active_packets());
        if res.is_err() {
            self.pipeline.active_packets_mut().clear();
            self.prepared = false;
            return res;
        }

        let submitted = report.borrow().get_submitted_count();
        self.tracker.record_submission(submitted + 1);
        self.reset_params();
        Ok(())
    }

    fn activate_packets(&mut self) -> MediaResult<()> {
        let immediate = !self.settings.pipeline.single_task_phase_supported;
        let (init_required, update_required, passes) = {
            let brc = self.brc.borrow();
            (brc.is_brc_init_required(), brc.is_brc_update_required(), brc.num_passes())
        };

        if init_required {
            let placement = Placement::new(0, 0);
            self.pipeline.activate_packet(self.packet_ids.brc_init, immediate, placement)?;
        }
        for pass in 0..u16::from(passes) {
            if update_required {
                self.pipeline.activate_packet(
                    self.packet_ids.brc_update,
                    immediate,
                    Placement::new(pass, 0),
                )?;
            }
            let placement = Placement::new(pass, 0);
            self.pipeline.activate_packet(self.packet_ids.vdenc, immediate, placement)?;
        }
        if let Some(last) = self.pipeline.active_packets_mut().last_mut() {
            last.immediate_submit = true;
        }
        Ok(())
    }

    fn reset_params(&mut self) {
        self.tracker.advance();
        self.basic.borrow_mut().frame_num += 1;
        self.brc.borrow_mut().frame_done();
        if let Ok(report) = self.pipeline.status_report() {
            report.borrow_mut().reset();
        }
        self.pipeline.frame_done();
        self.prepared = false;
    }

    /// Prepares and executes one frame.
    pub fn encode(&mut self, params: &AvcEncodeParams) -> MediaResult<()> {
        self.prepare(params)?;
        self.execute()
    }

    /// Returns the reports of up to `num` frames, oldest first.
    pub fn get_status_report(&mut self, num: u32) -> MediaResult<Vec<EncodeStatusReportData>> {
        self.pipeline.status_report()?.borrow_mut().get_report(num)
    }

    pub fn get_completed_report(&self) -> MediaResult<u32> {
        self.pipeline.status_report()?.borrow().get_completed_report()
    }

    pub fn destroy(&mut self) -> MediaResult<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;

        let pipeline = self.pipeline.destroy();
        let brc = self.brc.borrow_mut().destroy(self.pipeline.os());
        pipeline.and(brc)
    }
}

impl Drop for AvcVdencPipeline {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            error!("Failed to destroy AVC pipeline: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::mmio::VdboxMmio;
    use crate::os::sysmem::SysMemOs;
    use crate::os::Lockability;
    use crate::os::ResourceUsage;
    use crate::status_report::CodecStatus;

    struct Harness {
        sysmem: Rc<RefCell<SysMemOs>>,
        os: OsRef,
        encoder: AvcVdencPipeline,
        params: AvcEncodeParams,
    }

    fn harness(rate_control: RateControl, single_task_phase_supported: bool) -> Harness {
        let sysmem = Rc::new(RefCell::new(SysMemOs::new()));
        let os: OsRef = sysmem.clone();
        let settings = AvcEncodeSettings {
            resolution: Resolution::from((64, 32)),
            rate_control,
            target_bitrate: 1_000_000,
            max_bitrate: 2_000_000,
            pipeline: PipelineSettings { single_task_phase_supported, ..Default::default() },
            ..Default::default()
        };
        let encoder = AvcVdencPipeline::new(os.clone(), settings).unwrap();

        let allocate = |name: &str| {
            os.borrow_mut()
                .allocate_buffer(0x3000, name, ResourceUsage::Surface, Lockability::Lockable)
                .unwrap()
        };
        let params = AvcEncodeParams {
            source: Some(allocate("source")),
            reconstructed: Some(allocate("recon")),
            bitstream: Some(allocate("bitstream")),
            ..Default::default()
        };
        let mmio = VdboxMmio::for_pipe(0);
        sysmem.borrow_mut().set_register(mmio.mfc_bitstream_bytecount_frame(), 0x800);
        sysmem.borrow_mut().set_register(mmio.mfc_qp_status_count(), 0x1c);
        Harness { sysmem, os, encoder, params }
    }

    #[test]
    fn test_cqp_frame() {
        let Harness { sysmem, os, mut encoder, params } = harness(RateControl::Cqp, false);
        encoder.encode(&params).unwrap();
        assert_eq!(sysmem.borrow().submissions().len(), 1);
        assert_eq!(encoder.get_completed_report().unwrap(), 0);

        sysmem.borrow_mut().complete_pending().unwrap();
        let report = encoder.get_status_report(1).unwrap();
        assert_eq!(report[0].codec_status, CodecStatus::Successful);
        assert_eq!(report[0].feedback_number, 0);
        assert_eq!(report[0].bitstream_size, 0x800);
        assert_eq!(report[0].qp_y, 0x1c);
        assert_eq!(report[0].num_passes, 1);

        encoder.destroy().unwrap();
        let resources = [params.source, params.reconstructed, params.bitstream];
        for resource in resources.into_iter().flatten() {
            os.borrow_mut().free_resource(&resource).unwrap();
        }
        assert_eq!(sysmem.borrow().live_resources(), 0);
    }

    #[test]
    fn test_brc_submits_every_packet() {
        let Harness { sysmem, mut encoder, params, .. } = harness(RateControl::Cbr, false);
        encoder.encode(&params).unwrap();
        // BRC init, then update and VDENC for each of the two passes.
        assert_eq!(sysmem.borrow().submissions().len(), 5);
        assert!(!encoder.brc_feature().borrow().is_brc_init_required());

        let p_frame = AvcEncodeParams {
            picture_type: AvcPictureType::P,
            reference: params.reconstructed,
            ..params.clone()
        };
        encoder.encode(&p_frame).unwrap();
        assert_eq!(sysmem.borrow().submissions().len(), 9);

        sysmem.borrow_mut().complete_pending().unwrap();
        let report = encoder.get_status_report(2).unwrap();
        for (frame, status) in report.iter().enumerate() {
            assert_eq!(status.codec_status, CodecStatus::Successful);
            assert_eq!(status.feedback_number, frame as u32);
            assert_eq!(status.num_passes, 2);
        }
    }

    #[test]
    fn test_single_task_phase_and_bitrate_change() {
        let Harness { sysmem, mut encoder, params, .. } = harness(RateControl::Vbr, true);
        encoder.encode(&params).unwrap();
        assert_eq!(sysmem.borrow().submissions().len(), 1);

        let params = AvcEncodeParams { target_bitrate: Some(500_000), ..params };
        encoder.prepare(&params).unwrap();
        assert!(encoder.brc_feature().borrow().is_brc_reset());
        assert!(encoder.brc_feature().borrow().is_brc_init_required());
        encoder.execute().unwrap();
        assert_eq!(sysmem.borrow().submissions().len(), 2);
        assert_eq!(encoder.brc_feature().borrow().target_bitrate, 500_000);
    }

    #[test]
    fn test_recycled_slots_wrap_without_waiting() {
        let Harness { sysmem, mut encoder, params, .. } = harness(RateControl::Cbr, true);
        for _ in 0..8 {
            encoder.encode(&params).unwrap();
        }
        assert_eq!(sysmem.borrow().pending_submissions(), 8);
        assert_eq!(encoder.basic_feature().borrow().frame_num, 8);
        assert_eq!(encoder.basic_feature().borrow().recycled_index, 1);
    }

    #[test]
    fn test_invalid_frames() {
        let Harness { mut encoder, params, .. } = harness(RateControl::Cqp, false);
        assert!(matches!(encoder.execute(), Err(MediaError::InvalidParameter(_))));

        let p_frame = AvcEncodeParams { picture_type: AvcPictureType::P, ..params };
        assert!(matches!(encoder.encode(&p_frame), Err(MediaError::InvalidParameter(_))));
        assert!(matches!(encoder.execute(), Err(MediaError::InvalidParameter(_))));
    }

    #[test]
    fn test_brc_needs_bitrate() {
        let os: OsRef = Rc::new(RefCell::new(SysMemOs::new()));
        let settings = AvcEncodeSettings {
            resolution: Resolution::from((64, 32)),
            rate_control: RateControl::Cbr,
            ..Default::default()
        };
        assert!(matches!(
            AvcVdencPipeline::new(os, settings),
            Err(MediaError::InvalidParameter(_))
        ));
    }
}
