// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Asynchronous completion tracking.
//!
//! Each submitted frame owns a record in a ring of [`STATUS_REPORT_NUM`] records. The commands
//! emitted by [`MediaStatusReport::end_status_report`] make the hardware copy its status
//! registers into that record and then bump a global completed counter. Reading the counter back
//! tells how many frames are done; their records are parsed and handed to the registered
//! [`StatusReportObserver`]s, which fill in the codec specific part of the report.

use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use enumn::N;
use log::debug;
use log::error;

use crate::hw::mi;
use crate::hw::CommandSink;
use crate::os::read_bytes;
use crate::os::read_u32;
use crate::os::write_bytes;
use crate::os::Lockability;
use crate::os::OsRef;
use crate::os::Resource;
use crate::os::ResourceUsage;
use crate::MediaResult;

/// Number of frames that can be in flight before their records get reused.
pub const STATUS_REPORT_NUM: u32 = 512;
/// Size in bytes of the record of one frame.
pub const STATUS_RECORD_SIZE: u32 = 64;

/// Values of [`StatusField::HwStoredData`].
pub const QUERY_SKIPPED: u32 = 0x00;
pub const QUERY_START: u32 = 0x01;
pub const QUERY_END: u32 = 0xff;

/// Dwords of a status record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum StatusField {
    HwStoredData = 0,
    ErrorStatus = 1,
    MbCount = 2,
    FrameCrc = 3,
    HucStatus = 4,
    HucStatus2 = 5,
    BitstreamByteCount = 6,
    ImageStatusCtrl = 7,
    QpStatusCount = 8,
    NumPasses = 9,
}

impl StatusField {
    pub fn offset(self) -> u32 {
        self as u32 * 4
    }
}

/// Status record of one frame as written by the hardware.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusRecord {
    pub hw_stored_data: u32,
    pub error_status: u32,
    pub mb_count: u32,
    pub frame_crc: u32,
    pub huc_status: u32,
    pub huc_status2: u32,
    pub bitstream_byte_count: u32,
    pub image_status_ctrl: u32,
    pub qp_status_count: u32,
    pub num_passes: u32,
}

impl StatusRecord {
    fn parse(data: &[u8]) -> Self {
        let field = |f: StatusField| LittleEndian::read_u32(&data[f.offset() as usize..]);
        Self {
            hw_stored_data: field(StatusField::HwStoredData),
            error_status: field(StatusField::ErrorStatus),
            mb_count: field(StatusField::MbCount),
            frame_crc: field(StatusField::FrameCrc),
            huc_status: field(StatusField::HucStatus),
            huc_status2: field(StatusField::HucStatus2),
            bitstream_byte_count: field(StatusField::BitstreamByteCount),
            image_status_ctrl: field(StatusField::ImageStatusCtrl),
            qp_status_count: field(StatusField::QpStatusCount),
            num_passes: field(StatusField::NumPasses),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CodecStatus {
    Successful,
    /// Submitted but not finished by the hardware yet.
    Incomplete,
    Error,
    /// Never submitted.
    #[default]
    Unavailable,
}

/// Per-frame inputs recorded when the frame is submitted.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameStatusParams {
    pub feedback_number: u32,
    pub picture_index: u8,
}

/// Report returned to the client for one frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusReportData {
    pub feedback_number: u32,
    pub picture_index: u8,
    pub codec_status: CodecStatus,
    pub num_mbs_affected: u32,
    pub frame_crc: u32,
    pub bitstream_size: u32,
    pub qp_y: u8,
    pub num_passes: u8,
}

pub type DecodeStatusReportData = StatusReportData;
pub type EncodeStatusReportData = StatusReportData;

/// Receives the hardware status of every completed frame.
pub trait StatusReportObserver {
    fn completed(&mut self, status: &StatusRecord, report: &mut StatusReportData)
        -> MediaResult<()>;
}

pub type ObserverRef = Rc<RefCell<dyn StatusReportObserver>>;

pub struct MediaStatusReport {
    os: OsRef,
    status_buffer: Resource,
    completed_buffer: Resource,
    submitted: u32,
    reported: u32,
    frames: Vec<FrameStatusParams>,
    observers: Vec<Weak<RefCell<dyn StatusReportObserver>>>,
}

pub type StatusReportRef = Rc<RefCell<MediaStatusReport>>;

impl MediaStatusReport {
    pub fn new(os: OsRef) -> MediaResult<Self> {
        let (status_buffer, completed_buffer) = {
            let mut os = os.borrow_mut();
            let status = os.allocate_buffer(
                STATUS_REPORT_NUM * STATUS_RECORD_SIZE,
                "StatusQueryBuffer",
                ResourceUsage::StatusBuffer,
                Lockability::Lockable,
            )?;
            let completed = os.allocate_buffer(
                4,
                "CompletedCountBuffer",
                ResourceUsage::StatusBuffer,
                Lockability::Lockable,
            )?;
            (status, completed)
        };

        Ok(Self {
            os,
            status_buffer,
            completed_buffer,
            submitted: 0,
            reported: 0,
            frames: vec![Default::default(); STATUS_REPORT_NUM as usize],
            observers: Vec::new(),
        })
    }

    fn index_of(count: u32) -> u32 {
        count % STATUS_REPORT_NUM
    }

    /// Index of the record the next submitted frame writes to.
    pub fn current_index(&self) -> u32 {
        Self::index_of(self.submitted)
    }

    /// Prepares the record of the frame about to be submitted.
    pub fn init(&mut self, params: FrameStatusParams) -> MediaResult<()> {
        let index = self.current_index();
        self.frames[index as usize] = params;
        let offset = index * STATUS_RECORD_SIZE;
        write_bytes(
            &mut *self.os.borrow_mut(),
            &self.status_buffer,
            offset,
            &[0; STATUS_RECORD_SIZE as usize],
        )
    }

    /// Moves on to the next frame once the current one has been submitted.
    pub fn reset(&mut self) {
        self.submitted = self.submitted.wrapping_add(1);
    }

    /// Where the hardware must write `field` for the current frame.
    pub fn get_address(&self, field: StatusField) -> (Resource, u32) {
        (self.status_buffer, self.current_index() * STATUS_RECORD_SIZE + field.offset())
    }

    pub fn start_status_report(&self, cmd: &mut dyn CommandSink) -> MediaResult<()> {
        let (resource, offset) = self.get_address(StatusField::HwStoredData);
        mi::add_store_data_imm(cmd, &resource, offset, QUERY_START)
    }

    /// Stores each `(register, field)` pair, then marks the frame as done.
    pub fn end_status_report(
        &self,
        cmd: &mut dyn CommandSink,
        registers: &[(u32, StatusField)],
    ) -> MediaResult<()> {
        mi::add_flush_dw(cmd)?;
        for (register, field) in registers {
            let (resource, offset) = self.get_address(*field);
            mi::add_store_register_mem(cmd, *register, &resource, offset)?;
        }
        let (resource, offset) = self.get_address(StatusField::HwStoredData);
        mi::add_store_data_imm(cmd, &resource, offset, QUERY_END)?;
        mi::add_store_data_imm(cmd, &self.completed_buffer, 0, self.submitted.wrapping_add(1))
    }

    /// Size in bytes of the commands emitted by the start and end calls.
    pub fn status_commands_size(registers: usize) -> u32 {
        mi::STORE_DATA_IMM_SIZE * 3
            + mi::FLUSH_DW_SIZE
            + mi::STORE_REGISTER_MEM_SIZE * registers as u32
    }

    pub fn status_commands_patches(registers: usize) -> u32 {
        3 + registers as u32
    }

    pub fn get_submitted_count(&self) -> u32 {
        self.submitted
    }

    pub fn get_reported_count(&self) -> u32 {
        self.reported
    }

    /// Number of frames the hardware has finished, as last written by it.
    pub fn get_completed_count(&self) -> MediaResult<u32> {
        read_u32(&mut *self.os.borrow_mut(), &self.completed_buffer, 0)
    }

    /// Number of completed frames not reported yet.
    pub fn get_completed_report(&self) -> MediaResult<u32> {
        let completed = self.get_completed_count()?;
        if self.reported > completed {
            error!("Reported count {} is ahead of completed count {}", self.reported, completed);
            return Ok(0);
        }
        Ok(completed - self.reported)
    }

    pub fn regist_observer(&mut self, observer: &ObserverRef) {
        self.observers.push(Rc::downgrade(observer));
    }

    pub fn unregist_observer(&mut self, observer: &ObserverRef) {
        let target = Rc::downgrade(observer);
        self.observers.retain(|o| !Weak::ptr_eq(o, &target));
    }

    pub fn observer_count(&self) -> usize {
        self.observers.iter().filter(|o| o.strong_count() > 0).count()
    }

    /// Returns up to `num` reports, oldest first. Completed frames are passed to the observers
    /// and count as reported; frames still in flight are returned as incomplete and will be
    /// returned again by a later call.
    pub fn get_report(&mut self, num: u32) -> MediaResult<Vec<StatusReportData>> {
        let completed = self.get_completed_count()?;
        self.observers.retain(|o| o.strong_count() > 0);

        let mut reports = Vec::with_capacity(num as usize);
        let mut next = self.reported;
        for _ in 0..num {
            if next >= self.submitted {
                reports.push(StatusReportData::default());
                continue;
            }

            let index = Self::index_of(next);
            let frame = self.frames[index as usize];
            let mut report = StatusReportData {
                feedback_number: frame.feedback_number,
                picture_index: frame.picture_index,
                ..Default::default()
            };

            if next < completed {
                let data = read_bytes(
                    &mut *self.os.borrow_mut(),
                    &self.status_buffer,
                    index * STATUS_RECORD_SIZE,
                    STATUS_RECORD_SIZE,
                )?;
                let record = StatusRecord::parse(&data);
                report.codec_status = CodecStatus::Successful;
                for observer in self.observers.iter().filter_map(Weak::upgrade) {
                    observer.borrow_mut().completed(&record, &mut report)?;
                }
                debug!("Frame {} completed: {:?}", report.feedback_number, report.codec_status);
                self.reported = next + 1;
            } else {
                report.codec_status = CodecStatus::Incomplete;
            }
            reports.push(report);
            next += 1;
        }

        Ok(reports)
    }

    pub fn destroy(&mut self) -> MediaResult<()> {
        self.observers.clear();
        let mut os = self.os.borrow_mut();
        os.free_resource(&self.status_buffer)?;
        os.free_resource(&self.completed_buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::CommandBuffer;
    use crate::os::sysmem::SysMemOs;
    use crate::os::OsInterface;

    struct CrcObserver {
        calls: usize,
    }

    impl StatusReportObserver for CrcObserver {
        fn completed(
            &mut self,
            status: &StatusRecord,
            report: &mut StatusReportData,
        ) -> MediaResult<()> {
            self.calls += 1;
            report.frame_crc = status.frame_crc;
            Ok(())
        }
    }

    fn submit_frame(
        sysmem: &Rc<RefCell<SysMemOs>>,
        report: &mut MediaStatusReport,
        feedback_number: u32,
    ) {
        report.init(FrameStatusParams { feedback_number, picture_index: 0 }).unwrap();
        let mut cmd = CommandBuffer::new(0x200, 16);
        report.start_status_report(&mut cmd).unwrap();
        report.end_status_report(&mut cmd, &[(0x1c_0850, StatusField::FrameCrc)]).unwrap();
        assert_eq!(cmd.used(), MediaStatusReport::status_commands_size(1));
        assert_eq!(cmd.patch_list().len() as u32, MediaStatusReport::status_commands_patches(1));
        mi::add_batch_buffer_end(&mut cmd).unwrap();
        sysmem.borrow_mut().submit_command_buffer(&cmd).unwrap();
        report.reset();
    }

    #[test]
    fn test_reports_follow_completion() {
        let sysmem = Rc::new(RefCell::new(SysMemOs::new()));
        sysmem.borrow_mut().set_register(0x1c_0850, 0xc0ffee);
        let mut report = MediaStatusReport::new(sysmem.clone()).unwrap();
        let observer: ObserverRef = Rc::new(RefCell::new(CrcObserver { calls: 0 }));
        report.regist_observer(&observer);

        submit_frame(&sysmem, &mut report, 10);
        submit_frame(&sysmem, &mut report, 11);
        assert_eq!(report.get_submitted_count(), 2);
        assert_eq!(report.get_completed_report().unwrap(), 0);

        let reports = report.get_report(3).unwrap();
        assert_eq!(reports[0].codec_status, CodecStatus::Incomplete);
        assert_eq!(reports[0].feedback_number, 10);
        assert_eq!(reports[1].codec_status, CodecStatus::Incomplete);
        assert_eq!(reports[2].codec_status, CodecStatus::Unavailable);
        assert_eq!(report.get_reported_count(), 0);

        sysmem.borrow_mut().complete_pending().unwrap();
        assert_eq!(report.get_completed_count().unwrap(), 2);
        assert_eq!(report.get_completed_report().unwrap(), 2);

        let reports = report.get_report(1).unwrap();
        assert_eq!(reports[0].codec_status, CodecStatus::Successful);
        assert_eq!(reports[0].frame_crc, 0xc0ffee);
        assert_eq!(report.get_reported_count(), 1);
        assert_eq!(report.get_completed_report().unwrap(), 1);

        let reports = report.get_report(1).unwrap();
        assert_eq!(reports[0].feedback_number, 11);
        assert_eq!(report.get_completed_report().unwrap(), 0);
    }

    #[test]
    fn test_completed_report_never_underflows() {
        let _ = env_logger::builder().is_test(true).try_init();
        let sysmem = Rc::new(RefCell::new(SysMemOs::new().with_auto_complete(true)));
        let mut report = MediaStatusReport::new(sysmem.clone()).unwrap();
        submit_frame(&sysmem, &mut report, 0);
        submit_frame(&sysmem, &mut report, 1);
        report.get_report(2).unwrap();
        assert_eq!(report.get_reported_count(), 2);

        // The hardware counter went backwards, e.g. after an engine reset.
        write_bytes(&mut *sysmem.borrow_mut(), &report.completed_buffer, 0, &1u32.to_le_bytes())
            .unwrap();
        assert_eq!(report.get_completed_report().unwrap(), 0);
    }

    #[test]
    fn test_observer_registration() {
        let sysmem = Rc::new(RefCell::new(SysMemOs::new().with_auto_complete(true)));
        let mut report = MediaStatusReport::new(sysmem.clone()).unwrap();
        let first = Rc::new(RefCell::new(CrcObserver { calls: 0 }));
        let second = Rc::new(RefCell::new(CrcObserver { calls: 0 }));
        let first_ref: ObserverRef = first.clone();
        let second_ref: ObserverRef = second.clone();
        report.regist_observer(&first_ref);
        report.regist_observer(&second_ref);
        assert_eq!(report.observer_count(), 2);

        report.unregist_observer(&second_ref);
        submit_frame(&sysmem, &mut report, 0);
        report.get_report(1).unwrap();
        assert_eq!(first.borrow().calls, 1);
        assert_eq!(second.borrow().calls, 0);

        drop(first_ref);
        drop(first);
        assert_eq!(report.observer_count(), 0);

        report.destroy().unwrap();
        assert_eq!(sysmem.borrow().live_resources(), 0);
    }

    #[test]
    fn test_record_layout() {
        let mut data = vec![0u8; STATUS_RECORD_SIZE as usize];
        LittleEndian::write_u32(&mut data[StatusField::MbCount.offset() as usize..], 0x1_0005);
        LittleEndian::write_u32(&mut data[StatusField::NumPasses.offset() as usize..], 2);
        let record = StatusRecord::parse(&data);
        assert_eq!(record.mb_count, 0x1_0005);
        assert_eq!(record.num_passes, 2);
        assert_eq!(StatusField::n(3), Some(StatusField::FrameCrc));
    }
}
