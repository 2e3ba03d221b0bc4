// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Scalability that records every call made to it, so tasks can be tested in isolation.

use crate::hw::CommandBuffer;
use crate::scalability::MediaScalability;
use crate::scalability::StateParams;
use crate::MediaError;
use crate::MediaResult;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    UpdateState { pass: u16, pipe: u8 },
    Verify { size: u32, patch_list_size: u32 },
    Get,
    Return,
    Submit,
    Discard,
}

pub(crate) struct RecordingScalability {
    pub(crate) calls: Vec<Call>,
    /// Contents of every submitted buffer, per pipe.
    pub(crate) submitted: Vec<Vec<CommandBuffer>>,
    pipes: Vec<Option<CommandBuffer>>,
    current_pipe: u8,
    pass_number: u16,
}

impl RecordingScalability {
    pub(crate) fn new(pipes: u8) -> Self {
        Self {
            calls: Vec::new(),
            submitted: Vec::new(),
            pipes: (0..pipes).map(|_| Some(CommandBuffer::new(0x1000, 64))).collect(),
            current_pipe: 0,
            pass_number: 1,
        }
    }

    pub(crate) fn count(&self, call: &Call) -> usize {
        self.calls.iter().filter(|c| *c == call).count()
    }
}

impl MediaScalability for RecordingScalability {
    fn update_state(&mut self, state: &StateParams) -> MediaResult<()> {
        self.calls.push(Call::UpdateState { pass: state.current_pass, pipe: state.current_pipe });
        self.set_current_pipe_index(state.current_pipe)
    }

    fn verify_cmd_buffer(
        &mut self,
        size: u32,
        patch_list_size: u32,
        _single_task_phase: bool,
    ) -> MediaResult<()> {
        self.calls.push(Call::Verify { size, patch_list_size });
        Ok(())
    }

    fn get_cmd_buffer(&mut self, _frame_tracking_requested: bool) -> MediaResult<CommandBuffer> {
        self.calls.push(Call::Get);
        self.pipes[self.current_pipe as usize]
            .take()
            .ok_or(MediaError::NullPointer("command buffer"))
    }

    fn return_cmd_buffer(&mut self, cmd_buffer: CommandBuffer) -> MediaResult<()> {
        self.calls.push(Call::Return);
        self.pipes[self.current_pipe as usize] = Some(cmd_buffer);
        Ok(())
    }

    fn submit_cmd_buffer(&mut self) -> MediaResult<()> {
        self.calls.push(Call::Submit);
        let mut submission = Vec::new();
        for cmd in self.pipes.iter_mut().flatten() {
            submission.push(cmd.clone());
            cmd.reset();
        }
        self.submitted.push(submission);
        Ok(())
    }

    fn discard_cmd_buffers(&mut self) {
        self.calls.push(Call::Discard);
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
            return Err(MediaError::InvalidParameter(format!("no pipe {index}")));
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
        false
    }

    fn destroy(&mut self) -> MediaResult<()> {
        Ok(())
    }
}
