// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Packet logging every call made to it, so tasks and pipelines can be tested in isolation.

use std::cell::RefCell;
use std::rc::Rc;

use crate::debug::DebugInterface;
use crate::hw::mi;
use crate::hw::CommandBuffer;
use crate::hw::CommandSink;
use crate::hw::CommandSize;
use crate::packet::MediaPacket;
use crate::packet::PacketPhase;
use crate::scalability::StateParams;
use crate::task::TaskType;
use crate::MediaError;
use crate::MediaResult;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum PacketEvent {
    Init,
    Prepare { pass: u16 },
    Submit { phase: PacketPhase, pass: u16, pipe: u8, status_report: bool },
    DumpOutput,
    Destroy,
}

pub(crate) type EventLog = Rc<RefCell<Vec<(&'static str, PacketEvent)>>>;

pub(crate) struct RecordingPacket {
    name: &'static str,
    log: EventLog,
    size: CommandSize,
    task_type: TaskType,
    fail_init: bool,
    fail_submit: bool,
}

impl RecordingPacket {
    pub(crate) fn new(name: &'static str, log: &EventLog) -> Self {
        Self {
            name,
            log: Rc::clone(log),
            size: CommandSize::new(0x10, 1),
            task_type: TaskType::Cmd,
            fail_init: false,
            fail_submit: false,
        }
    }

    pub(crate) fn new_ref(name: &'static str, log: &EventLog) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::new(name, log)))
    }

    pub(crate) fn with_size(mut self, size: CommandSize) -> Self {
        self.size = size;
        self
    }

    pub(crate) fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    pub(crate) fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    /// Writes its first command, then fails.
    pub(crate) fn failing_submit(mut self) -> Self {
        self.fail_submit = true;
        self
    }

    fn record(&self, event: PacketEvent) {
        self.log.borrow_mut().push((self.name, event));
    }
}

impl MediaPacket for RecordingPacket {
    fn name(&self) -> &'static str {
        self.name
    }

    fn init(&mut self) -> MediaResult<()> {
        if self.fail_init {
            return Err(MediaError::Unknown(format!("{} failed to init", self.name)));
        }
        self.record(PacketEvent::Init);
        Ok(())
    }

    fn prepare(&mut self, state: &StateParams) -> MediaResult<()> {
        self.record(PacketEvent::Prepare { pass: state.current_pass });
        Ok(())
    }

    fn submit(
        &mut self,
        cmd_buffer: &mut CommandBuffer,
        phase: PacketPhase,
        state: &StateParams,
    ) -> MediaResult<()> {
        self.record(PacketEvent::Submit {
            phase,
            pass: state.current_pass,
            pipe: state.current_pipe,
            status_report: state.status_report.is_some(),
        });
        cmd_buffer.add_dwords(&[mi::MI_NOOP])?;
        if self.fail_submit {
            return Err(MediaError::Unknown(format!("{} failed to submit", self.name)));
        }
        if phase.is_last() {
            mi::add_batch_buffer_end(cmd_buffer)?;
        }
        Ok(())
    }

    fn calculate_command_size(&self) -> MediaResult<CommandSize> {
        Ok(self.size)
    }

    fn destroy(&mut self) -> MediaResult<()> {
        self.record(PacketEvent::Destroy);
        Ok(())
    }

    fn active_task_type(&self) -> TaskType {
        self.task_type
    }

    fn dump_output(&mut self, _debug: &mut dyn DebugInterface) -> MediaResult<()> {
        self.record(PacketEvent::DumpOutput);
        Ok(())
    }
}
