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

/// Scalability for a context driving a single VDBOX.
pub struct SinglePipeScalability {
    os: OsRef,
    cmd_buffer: Option<CommandBuffer>,
    pass_number: u16,
    current_pass: u16,
    frame_tracking_enabled: bool,
    tracker: FrameTracker,
}

impl SinglePipeScalability {
    pub fn new(os: OsRef, pars: &ScalabilityPars) -> MediaResult<Self> {
        let tracker = FrameTracker::new(&os, 1)?;
        Ok(Self {
            os,
            cmd_buffer: Some(CommandBuffer::default()),
            pass_number: 1,
            current_pass: 0,
            frame_tracking_enabled: pars.frame_tracking_enabled,
            tracker,
        })
    }

    pub fn current_pass(&self) -> u16 {
        self.current_pass
    }

    fn checked_in(&mut self) -> MediaResult<&mut CommandBuffer> {
        self.cmd_buffer
            .as_mut()
            .ok_or_else(|| MediaError::InvalidParameter("command buffer is checked out".into()))
    }
}

impl MediaScalability for SinglePipeScalability {
    fn update_state(&mut self, state: &StateParams) -> MediaResult<()> {
        if state.current_pipe != 0 {
            return Err(MediaError::InvalidParameter(format!(
                "pipe {} on a single pipe context",
                state.current_pipe
            )));
        }
        self.current_pass = state.current_pass;
        Ok(())
    }

    fn verify_cmd_buffer(
        &mut self,
        size: u32,
        patch_list_size: u32,
        single_task_phase: bool,
    ) -> MediaResult<()> {
        let tracking = if self.frame_tracking_enabled { FrameTracker::cmd_size() } else { 0 };
        let size = size + tracking + COMMAND_BUFFER_RESERVED_SPACE;
        let patch_list_size = if self.os.borrow().uses_patch_list() { patch_list_size + 1 } else { 0 };
        debug!(
            "Verifying command buffer for {size:#x} bytes, {patch_list_size} patches{}",
            if single_task_phase { " (all passes)" } else { "" }
        );
        self.checked_in()?.ensure_capacity(size, patch_list_size);
        Ok(())
    }

    fn get_cmd_buffer(&mut self, frame_tracking_requested: bool) -> MediaResult<CommandBuffer> {
        let mut cmd = self
            .cmd_buffer
            .take()
            .ok_or_else(|| MediaError::InvalidParameter("command buffer is checked out".into()))?;
        if cmd.is_empty() && frame_tracking_requested && self.frame_tracking_enabled {
            self.tracker.add_tag(&mut cmd, 0)?;
        }
        Ok(cmd)
    }

    fn return_cmd_buffer(&mut self, cmd_buffer: CommandBuffer) -> MediaResult<()> {
        if self.cmd_buffer.is_some() {
            return Err(MediaError::InvalidParameter("command buffer returned twice".into()));
        }
        self.cmd_buffer = Some(cmd_buffer);
        Ok(())
    }

    fn submit_cmd_buffer(&mut self) -> MediaResult<()> {
        let os = self.os.clone();
        let cmd = self.checked_in()?;
        os.borrow_mut().submit_command_buffer(cmd)?;
        cmd.reset();
        self.tracker.next_frame();
        Ok(())
    }

    fn discard_cmd_buffers(&mut self) {
        if let Some(cmd) = self.cmd_buffer.as_mut() {
            cmd.reset();
        }
    }

    fn pipe_number(&self) -> u8 {
        1
    }

    fn current_pipe(&self) -> u8 {
        0
    }

    fn set_current_pipe_index(&mut self, index: u8) -> MediaResult<()> {
        match index {
            0 => Ok(()),
            _ => Err(MediaError::InvalidParameter(format!("pipe {index} on a single pipe context"))),
        }
    }

    fn cmd_buffer(&self, pipe: u8) -> Option<&CommandBuffer> {
        match pipe {
            0 => self.cmd_buffer.as_ref(),
            _ => None,
        }
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
