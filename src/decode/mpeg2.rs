// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! MPEG-2 decoding on the VDBOX.
//!
//! [`Mpeg2Pipeline`] is driven three times per frame. The [`DecodePipeMode::Process`] calls feed
//! it bitstream buffers; once the frame is complete its single decode packet gets submitted, and
//! the result is read back later through [`Mpeg2Pipeline::get_status_report`].

pub mod caps;
pub mod feature;
pub mod packet;

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;
use log::error;

use crate::decode::input_bitstream::DecodeBitstream;
use crate::decode::input_bitstream::InputBitstream;
use crate::decode::mpeg2::caps::HwGeneration;
use crate::decode::mpeg2::feature::Mpeg2BasicFeature;
use crate::decode::mpeg2::feature::Mpeg2DecodeMode;
use crate::decode::mpeg2::feature::Mpeg2MbParams;
use crate::decode::mpeg2::feature::Mpeg2PicParams;
use crate::decode::mpeg2::feature::Mpeg2SliceParams;
use crate::decode::mpeg2::packet::Mpeg2DecodePkt;
use crate::decode::stream_out::StreamOut;
use crate::decode::stream_out::StreamOutFeature;
use crate::decode::sub_pipeline::DecodeSubPipelineManager;
use crate::decode::DecodePipeMode;
use crate::decode::DecodePipelineParams;
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
use crate::status_report::DecodeStatusReportData;
use crate::status_report::FrameStatusParams;
use crate::MediaError;
use crate::MediaResult;
use crate::Resolution;

/// Local id of the main decode packet.
pub const MPEG2_DECODE_PACKET: u32 = 1;

#[derive(Clone, Debug, Default)]
pub struct Mpeg2DecodeSettings {
    pub generation: HwGeneration,
    /// Size of the decoded pictures. Fixed for the lifetime of the pipeline.
    pub resolution: Resolution,
    pub mode: Mpeg2DecodeMode,
    pub pipeline: PipelineSettings,
}

/// Parameters of one call to [`Mpeg2Pipeline::prepare`].
#[derive(Clone, Debug, Default)]
pub struct Mpeg2DecodeParams {
    pub pipeline: DecodePipelineParams,
    pub picture: Mpeg2PicParams,
    pub slices: Vec<Mpeg2SliceParams>,
    pub macroblocks: Vec<Mpeg2MbParams>,
    pub dest_surface: Option<Resource>,
    pub forward_reference: Option<Resource>,
    pub backward_reference: Option<Resource>,
}

pub struct Mpeg2Pipeline {
    pipeline: MediaPipeline,
    settings: Mpeg2DecodeSettings,
    basic: FeatureRef<Mpeg2BasicFeature>,
    bitstream: FeatureRef<DecodeBitstream>,
    pre: DecodeSubPipelineManager,
    post: DecodeSubPipelineManager,
    packet_id: PacketId,
    /// Whether the current frame has been submitted already.
    decoded: bool,
    destroyed: bool,
}

impl Mpeg2Pipeline {
    /// Creates an initialized pipeline: features, sub-pipelines and the creator of the decode
    /// packet are all registered on return.
    pub fn new(os: OsRef, settings: Mpeg2DecodeSettings) -> MediaResult<Self> {
        let resolution = settings.resolution;
        if resolution.width == 0 || resolution.height == 0 {
            return Err(MediaError::InvalidParameter(format!(
                "invalid resolution {}x{}",
                resolution.width, resolution.height
            )));
        }

        let mut pipeline = MediaPipeline::new(Rc::clone(&os), settings.pipeline.clone());
        pipeline.init()?;

        let features = pipeline.create_feature_manager()?;
        let basic = features.register(Mpeg2BasicFeature::new(resolution, settings.mode));
        let bitstream = features.register(DecodeBitstream::default());
        let stream_out = features.register(StreamOutFeature::default());
        basic.borrow_mut().init(&os)?;

        let mut pre = DecodeSubPipelineManager::default();
        pre.register(Box::new(InputBitstream::new(Rc::clone(&os), Rc::clone(&bitstream))));
        pre.init(&pipeline)?;
        let mut post = DecodeSubPipelineManager::default();
        post.register(Box::new(StreamOut::new(
            Rc::clone(&os),
            Rc::clone(&stream_out),
            Rc::clone(&bitstream),
        )));
        post.init(&pipeline)?;

        let packet_id = decode_packet_id(&pipeline, MPEG2_DECODE_PACKET);
        let caps = settings.generation.mpeg2_capabilities();
        let status_report = pipeline.status_report()?;
        let profiler = pipeline.profiler();
        let packet_feature = Rc::clone(&basic);
        pipeline.register_packet_creator(
            packet_id,
            Box::new(move || {
                let packet: PacketRef = Rc::new(RefCell::new(Mpeg2DecodePkt::new(
                    Rc::clone(&os),
                    caps,
                    Rc::clone(&packet_feature),
                    Rc::clone(&stream_out),
                    Rc::clone(&status_report),
                    profiler.clone(),
                )));
                Ok(packet)
            }),
        );

        debug!("MPEG-2 pipeline {} ready for {:?}", pipeline.instance_id(), settings);
        Ok(Self {
            pipeline,
            settings,
            basic,
            bitstream,
            pre,
            post,
            packet_id,
            decoded: false,
            destroyed: false,
        })
    }

    pub fn pipeline(&self) -> &MediaPipeline {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut MediaPipeline {
        &mut self.pipeline
    }

    pub fn basic_feature(&self) -> &FeatureRef<Mpeg2BasicFeature> {
        &self.basic
    }

    pub fn prepare(&mut self, params: &Mpeg2DecodeParams) -> MediaResult<()> {
        match params.pipeline.mode {
            DecodePipeMode::Begin => {
                self.decoded = false;
                self.pre.prepare(&params.pipeline)?;
                self.post.prepare(&params.pipeline)
            }
            DecodePipeMode::Process => self.process(params),
            DecodePipeMode::End => self.end(params),
        }
    }

    fn process(&mut self, params: &Mpeg2DecodeParams) -> MediaResult<()> {
        self.pre.prepare(&params.pipeline)?;
        self.pre.execute(&mut self.pipeline)?;

        let bitstream = *self.bitstream.borrow();
        if !bitstream.complete || self.decoded {
            return Ok(());
        }
        if bitstream.resource.is_none() {
            return Err(MediaError::NullPointer("bitstream"));
        }

        let frame = {
            let mut basic = self.basic.borrow_mut();
            basic.pic_params = params.picture;
            basic.slices = params.slices.clone();
            basic.macroblocks = params.macroblocks.clone();
            basic.dest_surface = params.dest_surface;
            basic.forward_reference = params.forward_reference;
            basic.backward_reference = params.backward_reference;
            basic.update(bitstream)?;
            FrameStatusParams {
                feedback_number: basic.frame_num,
                picture_index: basic.pic_params.picture_index,
            }
        };
        self.pipeline.status_report()?.borrow_mut().init(frame)?;
        // Stream-out must be enabled before the decode packet is built.
        self.post.prepare(&params.pipeline)?;

        let pars = self.settings.pipeline.scalability_pars();
        self.pipeline.switch_context(MediaFunction::VdboxDecode, &pars)?;
        self.pipeline.activate_packet(self.packet_id, true, Placement::new(0, 0))?;
        self.pipeline.execute_active_packets()?;
        self.decoded = true;
        debug!("Submitted frame {}", frame.feedback_number);
        self.post.execute(&mut self.pipeline)
    }

    fn end(&mut self, params: &Mpeg2DecodeParams) -> MediaResult<()> {
        if self.decoded {
            self.pipeline.status_report()?.borrow_mut().reset();
            self.basic.borrow_mut().frame_num += 1;
            self.pipeline.frame_done();
            self.decoded = false;
        }
        self.pre.prepare(&params.pipeline)?;
        self.post.prepare(&params.pipeline)
    }

    /// Returns the reports of up to `num` frames, oldest first.
    pub fn get_status_report(&mut self, num: u32) -> MediaResult<Vec<DecodeStatusReportData>> {
        self.pipeline.status_report()?.borrow_mut().get_report(num)
    }

    /// Number of frames completed by the hardware but not reported yet.
    pub fn get_completed_report(&self) -> MediaResult<u32> {
        self.pipeline.status_report()?.borrow().get_completed_report()
    }

    pub fn destroy(&mut self) -> MediaResult<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;

        let pre = self.pre.destroy();
        let post = self.post.destroy();
        let basic = self.basic.borrow_mut().destroy(self.pipeline.os());
        let pipeline = self.pipeline.destroy();
        pre.and(post).and(basic).and(pipeline)
    }
}

impl Drop for Mpeg2Pipeline {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            error!("Failed to destroy MPEG-2 pipeline: {e}");
        }
    }
}
