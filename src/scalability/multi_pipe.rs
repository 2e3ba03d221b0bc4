// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use log::debug;

use crate::hw::CommandBuffer;
use crate::hw::COMMAND_BUFFER_RESERVED_SPACE;
use crate::os::OsRef;
use crate::scalability::FrameTracker;
use crate::scalability::MediaScalability;
use crate::scalability::ScalabilityPars;
use crate::scalability::StateParams;
use crate::MediaError;
use crate::MediaResult;

/// Scalability for a virtual engine spanning several VDBOX instances. Every pipe gets its own
/// command buffer, all sized identically.
pub struct MultiPipeScalability {
    os: OsRef,
    pipes: Vec<Option<CommandBuffer>>,
    current_pipe: u8,
    pass_number: u16,
    frame_tracking_enabled: bool,
    tracker: FrameTracker,
}

impl MultiPipeScalability {
    pub fn new(os: OsRef, pipes: u8, pars: &ScalabilityPars) -> MediaResult<Self> {
        if pipes < 2 {
            return Err(MediaError::InvalidParameter(format!("{pipes} pipes is not scalable")));
        }
        let tracker = FrameTracker::new(&os, pipes)?;
        Ok(Self {
            os,
            pipes: (0..pipes).map(|_| Some(CommandBuffer::default())).collect(),
            current_pipe: 0,
            pass_number: 1,
            frame_tracking_enabled: pars.frame_tracking_enabled,
            tracker,
        })
    }

    fn all_checked_in(&self) -> MediaResult<()> {
        match self.pipes.iter().position(Option::is_none) {
            Some(pipe) => Err(MediaError::InvalidParameter(format!(
                "command buffer of pipe {pipe} is checked out"
            ))),
            None => Ok(()),
        }
    }
}

impl MediaScalability for MultiPipeScalability {
    fn update_state(&mut self, state: &StateParams) -> MediaResult<()> {
        self.set_current_pipe_index(state.current_pipe)
    }

    fn verify_cmd_buffer(
        &mut self,
        size: u32,
        patch_list_size: u32,
        single_task_phase: bool,
    ) -> MediaResult<()> {
        self.all_checked_in()?;
        let tracking = if self.frame_tracking_enabled { FrameTracker::cmd_size() } else { 0 };
        let size = size + tracking + COMMAND_BUFFER_RESERVED_SPACE;
        let patch_list_size =
            if self.os.borrow().uses_patch_list() { patch_list_size + 1 } else { 0 };
        debug!(
            "Verifying {} pipe buffers for {size:#x} bytes{}",
            self.pipes.len(),
            if single_task_phase { " (all passes)" } else { "" }
        );
        for cmd in self.pipes.iter_mut().flatten() {
            cmd.ensure_capacity(size, patch_list_size);
        }
        Ok(())
    }

    fn get_cmd_buffer(&mut self, frame_tracking_requested: bool) -> MediaResult<CommandBuffer> {
        let pipe = self.current_pipe;
        let mut cmd = self.pipes[pipe as usize].take().ok_or_else(|| {
            MediaError::InvalidParameter(format!("command buffer of pipe {pipe} is checked out"))
        })?;
        if cmd.is_empty() && frame_tracking_requested && self.frame_tracking_enabled {
            self.tracker.add_tag(&mut cmd, pipe)?;
        }
        Ok(cmd)
    }

    fn return_cmd_buffer(&mut self, cmd_buffer: CommandBuffer) -> MediaResult<()> {
        let slot = &mut self.pipes[self.current_pipe as usize];
        if slot.is_some() {
            return Err(MediaError::InvalidParameter("command buffer returned twice".into()));
        }
        *slot = Some(cmd_buffer);
        Ok(())
    }

    fn submit_cmd_buffer(&mut self) -> MediaResult<()> {
        self.all_checked_in()?;
        let mut os = self.os.borrow_mut();
        for (pipe, cmd) in self.pipes.iter_mut().flatten().enumerate() {
            if cmd.is_empty() {
                continue;
            }
            debug!("Submitting pipe {pipe}");
            os.submit_command_buffer(cmd)?;
            cmd.reset();
        }
        self.tracker.next_frame();
        Ok(())
    }

    fn discard_cmd_buffers(&mut self) {
        for cmd in self.pipes.iter_mut().flatten() {
            cmd.reset();
        }
    }

    fn pipe_number(&self) -> u8 {
        self.pipes.len() as u8
    }

    fn current_pipe(&self) -> u8 {
        self.current_pipe
    }

    fn set_current_pipe_index(&mut self, index: u8) -> MediaResult<()> {
        if index as usize >= self.pipes.len() {
            return Err(MediaError::InvalidParameter(format!(
                "pipe {index} out of {}",
                self.pipes.len()
            )));
        }
        self.current_pipe = index;
        Ok(())
    }

    fn cmd_buffer(&self, pipe: u8) -> Option<&CommandBuffer> {
        self.pipes.get(pipe as usize).and_then(Option::as_ref)
    }

    fn pass_number(&self) -> u16 {
        self.pass_number
    }

    fn set_pass_number(&mut self, pass_number: u16) {
        self.pass_number = pass_number;
    }

    fn is_frame_tracking_enabled(&self) -> bool {
        self.frame_tracking_enabled
    }

    fn destroy(&mut self) -> MediaResult<()> {
        self.os.borrow_mut().free_resource(self.tracker.resource())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::hw::mi;
    use crate::hw::CommandSink;
    use crate::os::sysmem::SysMemOs;

    #[test]
    fn test_per_pipe_buffers() {
        let sysmem = Rc::new(RefCell::new(SysMemOs::new()));
        let pars = ScalabilityPars {
            num_vdbox: 2,
            disable_scalability: false,
            frame_tracking_enabled: true,
        };
        let mut scalability = MultiPipeScalability::new(sysmem.clone(), 2, &pars).unwrap();
        scalability.verify_cmd_buffer(0x40, 2, true).unwrap();

        for pipe in 0..2 {
            let state = StateParams { current_pipe: pipe, ..Default::default() };
            scalability.update_state(&state).unwrap();
            let mut cmd = scalability.get_cmd_buffer(true).unwrap();
            mi::add_batch_buffer_end(&mut cmd).unwrap();
            scalability.return_cmd_buffer(cmd).unwrap();
        }
        for pipe in 0..2 {
            let used = scalability.cmd_buffer(pipe).unwrap().used();
            assert_eq!(used, FrameTracker::cmd_size() + mi::BATCH_BUFFER_END_SIZE);
        }

        let state = StateParams { current_pipe: 2, ..Default::default() };
        assert!(scalability.update_state(&state).is_err());

        scalability.submit_cmd_buffer().unwrap();
        assert_eq!(sysmem.borrow().submissions().len(), 2);
        assert!(scalability.cmd_buffer(1).unwrap().is_empty());
    }

    #[test]
    fn test_submit_requires_all_buffers() {
        let sysmem = Rc::new(RefCell::new(SysMemOs::new()));
        let mut scalability =
            MultiPipeScalability::new(sysmem, 3, &ScalabilityPars::default()).unwrap();
        scalability.set_current_pipe_index(2).unwrap();
        let cmd = scalability.get_cmd_buffer(false).unwrap();
        assert!(scalability.cmd_buffer(2).is_none());
        assert!(scalability.submit_cmd_buffer().is_err());
        scalability.return_cmd_buffer(cmd).unwrap();
        scalability.submit_cmd_buffer().unwrap();
    }
}
