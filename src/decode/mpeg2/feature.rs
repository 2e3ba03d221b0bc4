// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-frame MPEG-2 decode state, and the slice and macroblock command lists derived from it.

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use enumn::N;
use log::debug;
use log::warn;

use crate::decode::input_bitstream::DecodeBitstream;
use crate::os::write_bytes;
use crate::os::Lockability;
use crate::os::OsRef;
use crate::os::Resource;
use crate::os::ResourceUsage;
use crate::MediaError;
use crate::MediaResult;
use crate::Resolution;

/// Hardware limit on the length of a slice, in bytes.
const MAX_SLICE_LENGTH: u32 = 0x1ffe0;

/// Four one-macroblock slices, one per `quantizer_scale_type * 2 + intra_vlc_format`. They are
/// decoded in place of the missing or corrupted parts of a picture.
const DUMMY_BITSTREAM: [u32; 12] = [
    0x01010000, 0x54e29752, 0x002022a5, // q_scale_type = 0, intra_vlc_format = 0
    0x01010000, 0x4de29752, 0x8661341a, // q_scale_type = 0, intra_vlc_format = 1
    0x01010000, 0x54e2a772, 0x002022a5, // q_scale_type = 1, intra_vlc_format = 0
    0x01010000, 0x4de2a772, 0x8661341a, // q_scale_type = 1, intra_vlc_format = 1
];
const DUMMY_SLICE_LENGTHS: [u32; 4] = [0x8, 0x8, 0x8, 0x8];
const DUMMY_SLICE_OFFSETS: [u32; 4] = [0x4, 0x10, 0x1c, 0x28];
const DUMMY_MACROBLOCK_OFFSET: u16 = 6;
const DUMMY_QUANTISER_SCALE_CODE: u8 = 10;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
#[repr(u8)]
pub enum PictureCodingType {
    #[default]
    I = 1,
    P = 2,
    B = 3,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Mpeg2DecodeMode {
    /// The hardware parses the slices.
    #[default]
    Vld,
    /// The client parsed the bitstream and hands over macroblocks and their coefficients.
    Idct,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Mpeg2PicParams {
    /// Index of the decoded picture, reported back in the status report.
    pub picture_index: u8,
    pub picture_coding_type: PictureCodingType,
    pub intra_vlc_format: bool,
    pub quantizer_scale_type: bool,
    pub top_field_first: bool,
    pub alternate_scan: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Mpeg2SliceParams {
    /// In bits, including the slice header.
    pub slice_data_size: u32,
    /// Byte offset of the slice within the bitstream.
    pub slice_data_offset: u32,
    /// Bit offset of the first macroblock within the slice.
    pub macroblock_offset: u16,
    pub slice_horizontal_position: u16,
    pub slice_vertical_position: u16,
    pub quantiser_scale_code: u8,
    pub num_mbs_for_slice: u16,
    /// Set by the client when the slice runs past the end of its row.
    pub num_mbs_for_slice_overflow: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Mpeg2MbParams {
    pub mb_addr: u16,
    pub mb_type: u16,
    pub coded_block_pattern: u8,
    /// Macroblocks skipped right after this one.
    pub mb_skip_following: u16,
    /// Dword offset of the coefficients of the macroblock.
    pub mb_data_location: u32,
}

impl Mpeg2MbParams {
    pub const MB_TYPE_INTRA: u16 = 1 << 0;
}

/// Location of a slice in the bitstream, as computed from its parameters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceRecord {
    /// In bytes, without the slice header.
    pub length: u32,
    /// Size of the slice header, in bytes.
    pub offset: u32,
    pub start_mb: u32,
    pub skip: bool,
    pub last: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SliceSource {
    Bitstream,
    Dummy,
}

/// One MFD_MPEG2_BSD_OBJECT to emit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Mpeg2SliceCommand {
    pub source: SliceSource,
    /// Byte offset of the slice data within its source.
    pub offset: u32,
    pub length: u32,
    pub horizontal_position: u16,
    pub vertical_position: u16,
    pub num_mbs: u16,
    pub quantiser_scale_code: u8,
    pub macroblock_offset: u16,
    pub last: bool,
}

/// One MFD_IT_OBJECT to emit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Mpeg2MbCommand {
    pub mb_addr: u16,
    pub mb_type: u16,
    pub coded_block_pattern: u8,
    /// Byte offset of the coefficients in the bitstream.
    pub data_offset: u32,
    pub skipped: bool,
}

/// Everything the MPEG-2 packets need to know about the current frame.
pub struct Mpeg2BasicFeature {
    pub resolution: Resolution,
    pub mode: Mpeg2DecodeMode,
    pub pic_params: Mpeg2PicParams,
    pub slices: Vec<Mpeg2SliceParams>,
    pub macroblocks: Vec<Mpeg2MbParams>,
    pub bitstream: DecodeBitstream,
    pub dest_surface: Option<Resource>,
    pub forward_reference: Option<Resource>,
    pub backward_reference: Option<Resource>,
    /// Frames decoded so far.
    pub frame_num: u32,
    dummy_bitstream: Option<Resource>,
    slices_invalid: bool,
    slice_records: Vec<SliceRecord>,
    slice_commands: Vec<Mpeg2SliceCommand>,
    mb_commands: Vec<Mpeg2MbCommand>,
}

impl Mpeg2BasicFeature {
    pub fn new(resolution: Resolution, mode: Mpeg2DecodeMode) -> Self {
        Self {
            resolution,
            mode,
            pic_params: Default::default(),
            slices: Vec::new(),
            macroblocks: Vec::new(),
            bitstream: Default::default(),
            dest_surface: None,
            forward_reference: None,
            backward_reference: None,
            frame_num: 0,
            dummy_bitstream: None,
            slices_invalid: false,
            slice_records: Vec::new(),
            slice_commands: Vec::new(),
            mb_commands: Vec::new(),
        }
    }

    /// Allocates the bitstream dummy slices are read from.
    pub fn init(&mut self, os: &OsRef) -> MediaResult<()> {
        if self.dummy_bitstream.is_some() {
            return Ok(());
        }
        let mut data = [0u8; DUMMY_BITSTREAM.len() * 4];
        LittleEndian::write_u32_into(&DUMMY_BITSTREAM, &mut data);
        let mut os = os.borrow_mut();
        let resource = os.allocate_buffer(
            data.len() as u32,
            "Mpeg2DummyBitstream",
            ResourceUsage::Bitstream,
            Lockability::Lockable,
        )?;
        write_bytes(&mut *os, &resource, 0, &data)?;
        self.dummy_bitstream = Some(resource);
        Ok(())
    }

    pub fn dummy_bitstream(&self) -> Option<&Resource> {
        self.dummy_bitstream.as_ref()
    }

    pub fn slice_records(&self) -> &[SliceRecord] {
        &self.slice_records
    }

    pub fn slice_commands(&self) -> &[Mpeg2SliceCommand] {
        &self.slice_commands
    }

    pub fn mb_commands(&self) -> &[Mpeg2MbCommand] {
        &self.mb_commands
    }

    fn total_mbs(&self) -> u32 {
        self.resolution.num_mbs()
    }

    /// Takes the parameters of a new frame and computes what to send to the hardware.
    pub fn update(&mut self, bitstream: DecodeBitstream) -> MediaResult<()> {
        if !bitstream.complete {
            return Err(MediaError::InvalidParameter("frame bitstream is incomplete".into()));
        }
        self.bitstream = bitstream;
        if self.dest_surface.is_none() {
            return Err(MediaError::NullPointer("destination surface"));
        }
        self.slice_commands.clear();
        self.mb_commands.clear();
        self.validate()?;
        self.set_references();

        match self.mode {
            Mpeg2DecodeMode::Vld => {
                self.compute_slice_records()?;
                self.build_slice_commands();
            }
            Mpeg2DecodeMode::Idct => self.build_mb_commands()?,
        }
        Ok(())
    }

    /// Rejects parameters that would address macroblocks outside of the picture.
    fn validate(&self) -> MediaResult<()> {
        let total = self.total_mbs();
        if self.slices.len() > total as usize {
            return Err(MediaError::InvalidParameter(format!(
                "{} slices for {total} macroblocks",
                self.slices.len()
            )));
        }
        if self.mode != Mpeg2DecodeMode::Idct {
            return Ok(());
        }

        let mut next = 0;
        for mb in &self.macroblocks {
            let addr = u32::from(mb.mb_addr);
            if addr >= total {
                return Err(MediaError::InvalidParameter(format!(
                    "macroblock {addr} is outside of the {total} of the picture"
                )));
            }
            if addr < next {
                return Err(MediaError::InvalidParameter(format!(
                    "macroblock {addr} comes after macroblock {}",
                    next - 1
                )));
            }
            next = (addr + 1 + self.skip_following(mb)).min(total);
        }
        Ok(())
    }

    fn skip_following(&self, mb: &Mpeg2MbParams) -> u32 {
        match self.pic_params.picture_coding_type {
            PictureCodingType::I => 0,
            _ => u32::from(mb.mb_skip_following),
        }
    }

    /// Missing references are replaced by the current picture so that the frame still decodes.
    fn set_references(&mut self) {
        let needed = match self.pic_params.picture_coding_type {
            PictureCodingType::I => 0,
            PictureCodingType::P => 1,
            PictureCodingType::B => 2,
        };
        if needed >= 1 && self.forward_reference.is_none() {
            warn!("Frame {} has no forward reference", self.frame_num);
            self.forward_reference = self.dest_surface;
        }
        if needed >= 2 && self.backward_reference.is_none() {
            warn!("Frame {} has no backward reference", self.frame_num);
            self.backward_reference = self.dest_surface;
        }
    }

    fn compute_slice_records(&mut self) -> MediaResult<()> {
        if self.slices.is_empty() {
            return Err(MediaError::InvalidParameter("no slice to decode".into()));
        }
        let width = self.resolution.width_in_mbs();
        self.slices_invalid = false;
        self.slice_records.clear();

        let mut prev_end = 0;
        let mut first_valid = true;
        let mut last_valid = None;
        for i in 0..self.slices.len() {
            let slice = self.slices[i];
            let offset = u32::from(slice.macroblock_offset & 0xfff8) >> 3;
            let length = ((slice.slice_data_size + 7) >> 3).min(MAX_SLICE_LENGTH);
            let mut record = SliceRecord {
                length: length.saturating_sub(offset),
                offset,
                start_mb: u32::from(slice.slice_horizontal_position)
                    + u32::from(slice.slice_vertical_position) * width,
                ..Default::default()
            };

            record.skip = self.detect_slice_error(i, &record, prev_end, first_valid);
            if record.skip {
                warn!("Skipping corrupted slice {i} starting at MB {}", record.start_mb);
            } else {
                first_valid = false;
                last_valid = Some(i);
            }
            prev_end = record.start_mb + u32::from(self.slices[i].num_mbs_for_slice);
            self.slice_records.push(record);
        }

        let last = last_valid.ok_or_else(|| {
            MediaError::Unknown(format!("every slice of frame {} is corrupted", self.frame_num))
        })?;
        self.slice_records[last].last = true;
        Ok(())
    }

    fn detect_slice_error(
        &mut self,
        index: usize,
        record: &SliceRecord,
        prev_end: u32,
        first_valid: bool,
    ) -> bool {
        let slice = self.slices[index];
        let width = self.resolution.width_in_mbs();
        let height = self.resolution.height_in_mbs();

        if record.length == 0 || record.length > 1 << 31 {
            true
        } else if u64::from(slice.slice_data_offset) + u64::from(record.length)
            > u64::from(self.bitstream.size)
        {
            true
        } else if self.slices_invalid {
            true
        } else if prev_end > record.start_mb
            || u32::from(slice.slice_vertical_position) >= height
            || u32::from(slice.slice_horizontal_position) >= width
        {
            self.slices_invalid = true;
            true
        } else if slice.num_mbs_for_slice == 0 {
            // The hardware does not process empty slices, so whatever follows is garbage.
            self.slices_invalid = true;
            true
        } else if slice.num_mbs_for_slice_overflow {
            let end = record.start_mb + u32::from(slice.num_mbs_for_slice);
            if index == self.slices.len() - 1 && !first_valid && end < self.total_mbs() {
                self.slices[index].num_mbs_for_slice = width as u16;
                false
            } else {
                self.slices_invalid = true;
                true
            }
        } else {
            false
        }
    }

    fn push_dummy_slices(&mut self, start_mb: u32, end_mb: u32) {
        let width = self.resolution.width_in_mbs();
        let total = self.total_mbs();
        let index = usize::from(self.pic_params.quantizer_scale_type) * 2
            + usize::from(self.pic_params.intra_vlc_format);
        for mb in start_mb..end_mb {
            self.slice_commands.push(Mpeg2SliceCommand {
                source: SliceSource::Dummy,
                offset: DUMMY_SLICE_OFFSETS[index],
                length: DUMMY_SLICE_LENGTHS[index],
                horizontal_position: (mb % width) as u16,
                vertical_position: (mb / width) as u16,
                num_mbs: 1,
                quantiser_scale_code: DUMMY_QUANTISER_SCALE_CODE,
                macroblock_offset: DUMMY_MACROBLOCK_OFFSET,
                last: mb + 1 == total,
            });
        }
    }

    fn build_slice_commands(&mut self) {
        let total = self.total_mbs();
        let mut prev_end = 0;
        for i in 0..self.slice_records.len() {
            let record = self.slice_records[i];
            if record.skip {
                continue;
            }
            let slice = self.slices[i];
            if prev_end < record.start_mb {
                warn!("Concealing MBs {prev_end}..{} with dummy slices", record.start_mb);
                self.push_dummy_slices(prev_end, record.start_mb);
            }
            let end = record.start_mb + u32::from(slice.num_mbs_for_slice);
            self.slice_commands.push(Mpeg2SliceCommand {
                source: SliceSource::Bitstream,
                offset: slice.slice_data_offset + record.offset,
                length: record.length,
                horizontal_position: slice.slice_horizontal_position,
                vertical_position: slice.slice_vertical_position,
                num_mbs: slice.num_mbs_for_slice,
                quantiser_scale_code: slice.quantiser_scale_code,
                macroblock_offset: slice.macroblock_offset,
                last: record.last && end >= total,
            });
            prev_end = end;
        }
        if prev_end < total {
            warn!("Picture ends at MB {prev_end} out of {total}, concealing the rest");
            self.push_dummy_slices(prev_end, total);
        }
        debug!("{} slice commands for frame {}", self.slice_commands.len(), self.frame_num);
    }

    fn push_skipped_mbs(&mut self, template: &Mpeg2MbParams, start: u32, count: u32) {
        for mb in start..start + count {
            self.mb_commands.push(Mpeg2MbCommand {
                mb_addr: mb as u16,
                mb_type: template.mb_type & !Mpeg2MbParams::MB_TYPE_INTRA,
                coded_block_pattern: 0,
                data_offset: 0,
                skipped: true,
            });
        }
    }

    fn build_mb_commands(&mut self) -> MediaResult<()> {
        let macroblocks = std::mem::take(&mut self.macroblocks);
        let Some(last) = macroblocks.last().copied() else {
            return Err(MediaError::InvalidParameter("no macroblock to decode".into()));
        };
        let total = self.total_mbs();
        let mut expected = 0;
        for mb in &macroblocks {
            let addr = u32::from(mb.mb_addr);
            if addr > expected {
                self.push_skipped_mbs(mb, expected, addr - expected);
            }
            self.mb_commands.push(Mpeg2MbCommand {
                mb_addr: mb.mb_addr,
                mb_type: mb.mb_type,
                coded_block_pattern: mb.coded_block_pattern,
                data_offset: mb.mb_data_location << 2,
                skipped: false,
            });
            let end = addr + 1;
            let skip = self.skip_following(mb).min(total - end);
            if skip > 0 {
                self.push_skipped_mbs(mb, end, skip);
            }
            expected = end + skip;
        }

        if expected < total {
            warn!("Macroblocks end at {expected} out of {total}, skipping the rest");
            self.push_skipped_mbs(&last, expected, total - expected);
        }
        self.macroblocks = macroblocks;
        Ok(())
    }

    pub fn destroy(&mut self, os: &OsRef) -> MediaResult<()> {
        if let Some(resource) = self.dummy_bitstream.take() {
            os.borrow_mut().free_resource(&resource)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::os::read_bytes;
    use crate::os::sysmem::SysMemOs;

    // 4x2 macroblocks.
    fn feature(mode: Mpeg2DecodeMode) -> Mpeg2BasicFeature {
        let mut feature = Mpeg2BasicFeature::new(Resolution::from((64, 32)), mode);
        feature.dest_surface = Some(Resource::new(10, 0x3000));
        feature
    }

    fn bitstream(size: u32) -> DecodeBitstream {
        DecodeBitstream { resource: Some(Resource::new(11, size)), size, complete: true }
    }

    fn slice(h: u16, v: u16, num_mbs: u16, data_offset: u32) -> Mpeg2SliceParams {
        Mpeg2SliceParams {
            slice_data_size: 0x40 * 8,
            slice_data_offset: data_offset,
            macroblock_offset: 0x23,
            slice_horizontal_position: h,
            slice_vertical_position: v,
            quantiser_scale_code: 4,
            num_mbs_for_slice: num_mbs,
            num_mbs_for_slice_overflow: false,
        }
    }

    #[test]
    fn test_gaps_are_filled_with_dummy_slices() {
        let mut feature = feature(Mpeg2DecodeMode::Vld);
        feature.pic_params.quantizer_scale_type = true;
        feature.slices = vec![slice(0, 0, 4, 0), slice(2, 1, 2, 0x40)];
        feature.update(bitstream(0x80)).unwrap();

        let records = feature.slice_records();
        // The 0x23 bits of header take 4 whole bytes.
        assert_eq!(records[0].offset, 4);
        assert_eq!(records[0].length, 0x3c);
        assert_eq!(records[1].start_mb, 6);
        assert!(records[1].last);

        let commands = feature.slice_commands();
        let sources: Vec<_> = commands.iter().map(|c| c.source).collect();
        use SliceSource::*;
        assert_eq!(sources, vec![Bitstream, Dummy, Dummy, Bitstream]);
        let dummy = commands[1];
        assert_eq!((dummy.horizontal_position, dummy.vertical_position), (0, 1));
        assert_eq!(dummy.offset, 0x1c);
        assert_eq!(dummy.quantiser_scale_code, 10);
        assert_eq!(dummy.macroblock_offset, 6);
        assert_eq!(commands[3].offset, 0x44);
        assert!(commands[3].last);
        assert_eq!(commands.iter().filter(|c| c.last).count(), 1);
    }

    #[test]
    fn test_overlapping_slice_invalidates_the_rest() {
        let mut feature = feature(Mpeg2DecodeMode::Vld);
        feature.slices = vec![slice(0, 0, 4, 0), slice(2, 0, 2, 0), slice(0, 1, 4, 0)];
        feature.update(bitstream(0x80)).unwrap();

        let skipped: Vec<_> = feature.slice_records().iter().map(|r| r.skip).collect();
        assert_eq!(skipped, vec![false, true, true]);
        assert!(feature.slice_records()[0].last);

        // The second row is concealed, the last dummy slice ends the picture.
        let commands = feature.slice_commands();
        assert_eq!(commands.len(), 5);
        assert!(commands[1..].iter().all(|c| c.source == SliceSource::Dummy));
        assert!(commands[4].last);
        assert!(!commands[0].last);
    }

    #[test]
    fn test_slice_past_the_bitstream_is_skipped() {
        let mut feature = feature(Mpeg2DecodeMode::Vld);
        feature.slices = vec![slice(0, 0, 4, 0), slice(0, 1, 4, 0x60)];
        feature.update(bitstream(0x80)).unwrap();
        assert!(feature.slice_records()[1].skip);
        assert!(!feature.slices_invalid);
    }

    #[test]
    fn test_overflowing_last_slice_is_clamped() {
        let mut feature = feature(Mpeg2DecodeMode::Vld);
        let mut last = slice(0, 1, 1, 0x40);
        last.num_mbs_for_slice_overflow = true;
        feature.slices = vec![slice(0, 0, 4, 0), last];
        feature.update(bitstream(0x80)).unwrap();

        assert!(!feature.slice_records()[1].skip);
        assert_eq!(feature.slices[1].num_mbs_for_slice, 4);
        assert_eq!(feature.slice_commands().len(), 2);
    }

    #[test]
    fn test_frame_without_valid_slice_fails() {
        let mut feature = feature(Mpeg2DecodeMode::Vld);
        feature.slices = vec![slice(0, 5, 4, 0)];
        assert!(matches!(feature.update(bitstream(0x80)), Err(MediaError::Unknown(_))));

        feature.slices.clear();
        assert!(matches!(feature.update(bitstream(0x80)), Err(MediaError::InvalidParameter(_))));
    }

    #[test]
    fn test_skipped_macroblocks() {
        let mut feature = feature(Mpeg2DecodeMode::Idct);
        feature.pic_params.picture_coding_type = PictureCodingType::P;
        feature.macroblocks = vec![
            Mpeg2MbParams { mb_addr: 1, mb_type: 3, mb_skip_following: 2, ..Default::default() },
            Mpeg2MbParams { mb_addr: 4, mb_data_location: 0x10, ..Default::default() },
        ];
        feature.update(bitstream(0x80)).unwrap();

        let skipped: Vec<_> = feature.mb_commands().iter().map(|c| c.skipped).collect();
        assert_eq!(skipped, vec![true, false, true, true, false, true, true, true]);
        let addrs: Vec<_> = feature.mb_commands().iter().map(|c| c.mb_addr).collect();
        assert_eq!(addrs, (0..8u16).collect::<Vec<_>>());
        assert_eq!(feature.mb_commands()[0].mb_type, 2);
        assert_eq!(feature.mb_commands()[4].data_offset, 0x40);
        // Missing references fall back to the picture itself.
        assert_eq!(feature.forward_reference, feature.dest_surface);
        assert_eq!(feature.backward_reference, None);
    }

    #[test]
    fn test_macroblocks_outside_the_picture_are_rejected() {
        let mut feature = feature(Mpeg2DecodeMode::Idct);
        feature.pic_params.picture_coding_type = PictureCodingType::P;
        feature.macroblocks = vec![Mpeg2MbParams { mb_addr: 8, ..Default::default() }];
        assert!(matches!(feature.update(bitstream(0x80)), Err(MediaError::InvalidParameter(_))));
        assert!(feature.mb_commands().is_empty());

        // The second macroblock lands inside the run skipped by the first one.
        feature.macroblocks = vec![
            Mpeg2MbParams { mb_addr: 1, mb_skip_following: 3, ..Default::default() },
            Mpeg2MbParams { mb_addr: 3, ..Default::default() },
        ];
        assert!(matches!(feature.update(bitstream(0x80)), Err(MediaError::InvalidParameter(_))));

        // Skip runs are cut at the end of the picture.
        feature.macroblocks =
            vec![Mpeg2MbParams { mb_addr: 6, mb_skip_following: 9, ..Default::default() }];
        feature.update(bitstream(0x80)).unwrap();
        let addrs: Vec<_> = feature.mb_commands().iter().map(|c| c.mb_addr).collect();
        assert_eq!(addrs, (0..8u16).collect::<Vec<_>>());
    }

    #[test]
    fn test_more_slices_than_macroblocks_are_rejected() {
        let mut feature = feature(Mpeg2DecodeMode::Vld);
        feature.slices = (0..9).map(|i| slice(i % 4, i / 4, 1, 0)).collect();
        assert!(matches!(feature.update(bitstream(0x80)), Err(MediaError::InvalidParameter(_))));
        assert!(feature.slice_records().is_empty());
        assert!(feature.slice_commands().is_empty());
    }

    #[test]
    fn test_dummy_bitstream() {
        let sysmem = Rc::new(RefCell::new(SysMemOs::new()));
        let os: OsRef = sysmem.clone();
        let mut feature = feature(Mpeg2DecodeMode::Vld);
        feature.init(&os).unwrap();
        let resource = *feature.dummy_bitstream().unwrap();
        let data = read_bytes(&mut *os.borrow_mut(), &resource, 0x10, 4).unwrap();
        assert_eq!(LittleEndian::read_u32(&data), 0x4de29752);

        feature.destroy(&os).unwrap();
        assert_eq!(sysmem.borrow().live_resources(), 0);
    }
}
