// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! GPU-side timing of packets.
//!
//! The profiler is owned by a pipeline and handed to the packets that want their execution
//! timed. Each frame gets a slot in a ring of records, into which the command streamer stores the
//! GPU timestamp when the packet starts and ends.

use std::cell::RefCell;
use std::rc::Rc;

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use log::debug;

use crate::hw::mi;
use crate::hw::mmio;
use crate::hw::CommandSink;
use crate::os::read_bytes;
use crate::os::write_bytes;
use crate::os::Lockability;
use crate::os::OsRef;
use crate::os::Resource;
use crate::os::ResourceUsage;
use crate::MediaResult;

/// Number of frames kept before their slots get reused.
pub const PERF_RECORD_NUM: u32 = 64;
const PERF_RECORD_SIZE: u32 = 8;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PerfRecord {
    pub frame: u32,
    pub start: u32,
    pub end: u32,
}

impl PerfRecord {
    pub fn ticks(&self) -> u32 {
        self.end.wrapping_sub(self.start)
    }
}

pub struct PerfProfiler {
    os: OsRef,
    buffer: Resource,
    frame: u32,
}

pub type PerfProfilerRef = Rc<RefCell<PerfProfiler>>;

impl PerfProfiler {
    pub fn new(os: OsRef) -> MediaResult<Self> {
        let buffer = os.borrow_mut().allocate_buffer(
            PERF_RECORD_NUM * PERF_RECORD_SIZE,
            "PerfProfilerBuffer",
            ResourceUsage::StatusBuffer,
            Lockability::Lockable,
        )?;
        Ok(Self { os, buffer, frame: 0 })
    }

    fn slot_offset(&self) -> u32 {
        (self.frame % PERF_RECORD_NUM) * PERF_RECORD_SIZE
    }

    pub fn add_perf_collect_start(&self, cmd: &mut dyn CommandSink) -> MediaResult<()> {
        let offset = self.slot_offset();
        write_bytes(&mut *self.os.borrow_mut(), &self.buffer, offset, &[0; 8])?;
        mi::add_store_register_mem(cmd, mmio::GPU_TIMESTAMP, &self.buffer, offset)
    }

    pub fn add_perf_collect_end(&self, cmd: &mut dyn CommandSink) -> MediaResult<()> {
        mi::add_store_register_mem(cmd, mmio::GPU_TIMESTAMP, &self.buffer, self.slot_offset() + 4)
    }

    /// Size in bytes of the commands emitted by one start/end pair.
    pub fn cmd_size() -> u32 {
        2 * mi::STORE_REGISTER_MEM_SIZE
    }

    pub fn next_frame(&mut self) {
        self.frame = self.frame.wrapping_add(1);
    }

    /// Timings of the frames still held by the ring, oldest first.
    pub fn records(&self) -> MediaResult<Vec<PerfRecord>> {
        let first = self.frame.saturating_sub(PERF_RECORD_NUM);
        let data = read_bytes(
            &mut *self.os.borrow_mut(),
            &self.buffer,
            0,
            PERF_RECORD_NUM * PERF_RECORD_SIZE,
        )?;
        Ok((first..self.frame)
            .map(|frame| {
                let offset = ((frame % PERF_RECORD_NUM) * PERF_RECORD_SIZE) as usize;
                PerfRecord {
                    frame,
                    start: LittleEndian::read_u32(&data[offset..]),
                    end: LittleEndian::read_u32(&data[offset + 4..]),
                }
            })
            .collect())
    }

    pub fn destroy(&mut self) -> MediaResult<()> {
        debug!("Releasing profiler after {} frames", self.frame);
        self.os.borrow_mut().free_resource(&self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::CommandBuffer;
    use crate::os::sysmem::SysMemOs;

    #[test]
    fn test_profiler_records_timestamps() {
        let sysmem = Rc::new(RefCell::new(SysMemOs::new()));
        let os: OsRef = sysmem.clone();
        let mut profiler = PerfProfiler::new(os.clone()).unwrap();

        for _ in 0..2 {
            let mut cmd = CommandBuffer::new(0x100, 8);
            profiler.add_perf_collect_start(&mut cmd).unwrap();
            cmd.add_dwords(&[mi::MI_NOOP]).unwrap();
            profiler.add_perf_collect_end(&mut cmd).unwrap();
            mi::add_batch_buffer_end(&mut cmd).unwrap();
            assert_eq!(cmd.used(), PerfProfiler::cmd_size() + 8);
            os.borrow_mut().submit_command_buffer(&cmd).unwrap();
            sysmem.borrow_mut().complete_pending().unwrap();
            profiler.next_frame();
        }

        let records = profiler.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], PerfRecord { frame: 0, start: 1, end: 2 });
        assert_eq!(records[1].frame, 1);
        assert_eq!(records[1].ticks(), 1);

        profiler.destroy().unwrap();
        assert_eq!(sysmem.borrow().live_resources(), 0);
    }
}
