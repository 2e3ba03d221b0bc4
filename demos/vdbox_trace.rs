// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! vdbox_trace, drives a decode or encode pipeline against the system memory OS and prints
//! what the hardware would have been given: the number of submissions, an MD5 of every command
//! buffer and the status reports of the frames.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::str::FromStr;

use argh::FromArgs;

use cros_vdbox::decode::mpeg2::caps::HwGeneration;
use cros_vdbox::decode::mpeg2::feature::Mpeg2PicParams;
use cros_vdbox::decode::mpeg2::feature::Mpeg2SliceParams;
use cros_vdbox::decode::mpeg2::Mpeg2DecodeParams;
use cros_vdbox::decode::mpeg2::Mpeg2DecodeSettings;
use cros_vdbox::decode::mpeg2::Mpeg2Pipeline;
use cros_vdbox::decode::BitstreamParams;
use cros_vdbox::decode::DecodePipeMode;
use cros_vdbox::decode::DecodePipelineParams;
use cros_vdbox::encode::avc::feature::AvcPictureType;
use cros_vdbox::encode::avc::feature::RateControl;
use cros_vdbox::encode::avc::AvcEncodeParams;
use cros_vdbox::encode::avc::AvcEncodeSettings;
use cros_vdbox::encode::avc::AvcVdencPipeline;
use cros_vdbox::hw::mmio::VdboxMmio;
use cros_vdbox::os::sysmem::SysMemOs;
use cros_vdbox::os::Lockability;
use cros_vdbox::os::OsRef;
use cros_vdbox::os::Resource;
use cros_vdbox::os::ResourceUsage;
use cros_vdbox::pipeline::PipelineSettings;
use cros_vdbox::status_report::StatusReportData;
use cros_vdbox::MediaResult;
use cros_vdbox::Resolution;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
enum Codec {
    Mpeg2,
    Avc,
}

impl FromStr for Codec {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mpeg2" | "MPEG2" => Ok(Codec::Mpeg2),
            "avc" | "h264" | "H264" => Ok(Codec::Avc),
            _ => Err("unrecognized codec. Valid values: mpeg2, avc"),
        }
    }
}

#[derive(Debug, Copy, Clone)]
struct RateControlArg(RateControl);

impl FromStr for RateControlArg {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cqp" => Ok(Self(RateControl::Cqp)),
            "cbr" => Ok(Self(RateControl::Cbr)),
            "vbr" => Ok(Self(RateControl::Vbr)),
            _ => Err("unrecognized rate control. Valid values: cqp, cbr, vbr"),
        }
    }
}

#[derive(Debug, Copy, Clone)]
struct GenerationArg(HwGeneration);

impl FromStr for GenerationArg {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gen12" => Ok(Self(HwGeneration::Gen12)),
            "xe_hpm" => Ok(Self(HwGeneration::XeHpm)),
            "xe_lpm_plus" => Ok(Self(HwGeneration::XeLpmPlus)),
            _ => Err("unrecognized generation. Valid values: gen12, xe_hpm, xe_lpm_plus"),
        }
    }
}

/// Traces the VDBOX command buffers of a few frames
#[derive(Debug, FromArgs)]
struct Args {
    /// codec to run, mpeg2 or avc
    #[argh(option, default = "Codec::Mpeg2")]
    codec: Codec,

    /// number of frames
    #[argh(option, default = "4")]
    frames: u32,

    /// width of the frames
    #[argh(option, default = "320")]
    width: u32,

    /// height of the frames
    #[argh(option, default = "240")]
    height: u32,

    /// hardware generation of the MPEG-2 decoder: gen12, xe_hpm or xe_lpm_plus
    #[argh(option, default = "GenerationArg(HwGeneration::Gen12)")]
    generation: GenerationArg,

    /// rate control of the AVC encoder: cqp, cbr or vbr
    #[argh(option, default = "RateControlArg(RateControl::Cqp)")]
    rate_control: RateControlArg,

    /// target bitrate of the AVC encoder, in bits per second
    #[argh(option, default = "1_000_000")]
    bitrate: u32,

    /// put all the passes of a frame in a single command buffer
    #[argh(switch)]
    single_task_phase: bool,

    /// directory to dump the command buffers to
    #[argh(option)]
    dump_dir: Option<PathBuf>,
}

fn allocate(os: &OsRef, size: u32, name: &str, usage: ResourceUsage) -> MediaResult<Resource> {
    os.borrow_mut().allocate_buffer(size, name, usage, Lockability::Lockable)
}

fn print_report(report: &[StatusReportData]) {
    for frame in report {
        println!(
            "frame {}: {:?}, {} MBs, crc {:08x}, {} bytes, qp {}, {} passes",
            frame.feedback_number,
            frame.codec_status,
            frame.num_mbs_affected,
            frame.frame_crc,
            frame.bitstream_size,
            frame.qp_y,
            frame.num_passes
        );
    }
}

fn run_mpeg2(args: &Args, os: &OsRef, pipeline: PipelineSettings) -> MediaResult<()> {
    let resolution = Resolution::from((args.width, args.height));
    let mut decoder = Mpeg2Pipeline::new(
        Rc::clone(os),
        Mpeg2DecodeSettings {
            generation: args.generation.0,
            resolution,
            pipeline,
            ..Default::default()
        },
    )?;

    let rows = resolution.height_in_mbs();
    let bitstream_size = rows * 0x40;
    let bitstream = allocate(os, bitstream_size, "bitstream", ResourceUsage::Bitstream)?;
    let dest = allocate(os, resolution.num_mbs() * 384, "dest", ResourceUsage::Surface)?;
    let slices = (0..rows as u16)
        .map(|row| Mpeg2SliceParams {
            slice_data_size: 0x200,
            slice_data_offset: u32::from(row) * 0x40,
            slice_vertical_position: row,
            num_mbs_for_slice: resolution.width_in_mbs() as u16,
            quantiser_scale_code: 8,
            ..Default::default()
        })
        .collect::<Vec<_>>();
    let mode = |mode| Mpeg2DecodeParams {
        pipeline: DecodePipelineParams { mode, ..Default::default() },
        ..Default::default()
    };

    for frame in 0..args.frames {
        decoder.prepare(&mode(DecodePipeMode::Begin))?;
        decoder.prepare(&Mpeg2DecodeParams {
            pipeline: DecodePipelineParams {
                mode: DecodePipeMode::Process,
                bitstream: Some(BitstreamParams {
                    resource: bitstream,
                    data_size: bitstream_size,
                    frame_size: 0,
                }),
                stream_out: None,
            },
            picture: Mpeg2PicParams { picture_index: (frame % 16) as u8, ..Default::default() },
            slices: slices.clone(),
            dest_surface: Some(dest),
            ..Default::default()
        })?;
        decoder.prepare(&mode(DecodePipeMode::End))?;
    }
    print_report(&decoder.get_status_report(args.frames)?);

    decoder.destroy()?;
    os.borrow_mut().free_resource(&bitstream)?;
    os.borrow_mut().free_resource(&dest)
}

fn run_avc(args: &Args, os: &OsRef, pipeline: PipelineSettings) -> MediaResult<()> {
    let resolution = Resolution::from((args.width, args.height));
    let mut encoder = AvcVdencPipeline::new(
        Rc::clone(os),
        AvcEncodeSettings {
            resolution,
            rate_control: args.rate_control.0,
            target_bitrate: args.bitrate,
            max_bitrate: args.bitrate * 2,
            pipeline,
            ..Default::default()
        },
    )?;

    let surface_size = resolution.num_mbs() * 384;
    let source = allocate(os, surface_size, "source", ResourceUsage::Surface)?;
    let recon = [
        allocate(os, surface_size, "recon0", ResourceUsage::Surface)?,
        allocate(os, surface_size, "recon1", ResourceUsage::Surface)?,
    ];
    let bitstream = allocate(os, surface_size, "bitstream", ResourceUsage::Bitstream)?;

    for frame in 0..args.frames as usize {
        let params = AvcEncodeParams {
            picture_type: if frame == 0 { AvcPictureType::I } else { AvcPictureType::P },
            source: Some(source),
            reference: (frame > 0).then(|| recon[(frame - 1) % 2]),
            reconstructed: Some(recon[frame % 2]),
            bitstream: Some(bitstream),
            ..Default::default()
        };
        encoder.encode(&params)?;
    }
    print_report(&encoder.get_status_report(args.frames)?);

    encoder.destroy()?;
    let mut os = os.borrow_mut();
    for resource in [source, recon[0], recon[1], bitstream] {
        os.free_resource(&resource)?;
    }
    Ok(())
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    let sysmem = Rc::new(RefCell::new(SysMemOs::new().with_auto_complete(true)));
    let mmio = VdboxMmio::for_pipe(0);
    {
        let mut sysmem = sysmem.borrow_mut();
        let num_mbs = Resolution::from((args.width, args.height)).num_mbs();
        sysmem.set_register(mmio.mfx_mb_count(), num_mbs);
        sysmem.set_register(mmio.mfx_frame_crc(), 0x5eed_c0de);
        sysmem.set_register(mmio.mfc_bitstream_bytecount_frame(), args.bitrate / 8 / 30);
        sysmem.set_register(mmio.mfc_qp_status_count(), 26);
    }
    let os: OsRef = sysmem.clone();

    let pipeline = PipelineSettings {
        single_task_phase_supported: args.single_task_phase,
        dump_dir: args.dump_dir.clone(),
        ..Default::default()
    };
    let res = match args.codec {
        Codec::Mpeg2 => run_mpeg2(&args, &os, pipeline),
        Codec::Avc => run_avc(&args, &os, pipeline),
    };
    if let Err(e) = res {
        eprintln!("{:?} failed: {e}", args.codec);
        std::process::exit(1);
    }

    let sysmem = sysmem.borrow();
    let mut stream = md5::Context::new();
    for (i, submission) in sysmem.submissions().iter().enumerate() {
        println!(
            "submission {i} on {:?}: {} bytes, md5 {:x}",
            submission.context,
            submission.data.len(),
            md5::compute(&submission.data)
        );
        stream.consume(&submission.data);
    }
    println!("{} submissions, md5 {:x}", sysmem.submissions().len(), stream.compute());
}
