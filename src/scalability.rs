// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Coordination of command submission across one or several VDBOX instances.
//!
//! Packets and tasks never talk to GPU contexts directly. They obtain a [`MediaScalability`]
//! instance from [`MediaContext::switch_context`] and borrow command buffers from it.

#[cfg(test)]
pub(crate) mod dummy;
pub mod multi_pipe;
pub mod single_pipe;

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use log::debug;

use crate::hw::mi;
use crate::hw::CommandBuffer;
use crate::hw::CommandSink;
use crate::os::GpuContext;
use crate::os::Lockability;
use crate::os::OsRef;
use crate::os::Resource;
use crate::os::ResourceUsage;
use crate::scalability::multi_pipe::MultiPipeScalability;
use crate::scalability::single_pipe::SinglePipeScalability;
use crate::status_report::StatusReportRef;
use crate::MediaResult;

/// Placement of one packet execution, read by the packet while it emits commands.
#[derive(Clone)]
pub struct StateParams {
    pub current_pass: u16,
    pub current_pipe: u8,
    pub pipe_index_for_submit: u8,
    pub current_sub_pass: u8,
    pub current_row: u16,
    pub status_report: Option<StatusReportRef>,
    pub single_task_phase_supported: bool,
    pub frame_tracking_requested: bool,
}

impl Default for StateParams {
    fn default() -> Self {
        Self {
            current_pass: 0,
            current_pipe: 0,
            pipe_index_for_submit: 1,
            current_sub_pass: 0,
            current_row: 0,
            status_report: None,
            single_task_phase_supported: false,
            frame_tracking_requested: false,
        }
    }
}

impl fmt::Debug for StateParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateParams")
            .field("current_pass", &self.current_pass)
            .field("current_pipe", &self.current_pipe)
            .field("pipe_index_for_submit", &self.pipe_index_for_submit)
            .field("current_sub_pass", &self.current_sub_pass)
            .field("current_row", &self.current_row)
            .field("status_report", &self.status_report.is_some())
            .field("single_task_phase_supported", &self.single_task_phase_supported)
            .field("frame_tracking_requested", &self.frame_tracking_requested)
            .finish()
    }
}

/// Kind of work a GPU context is created for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MediaFunction {
    VdboxDecode,
    VdboxEncode,
    /// HuC based copies run around the main decode.
    VdboxCopy,
}

impl MediaFunction {
    fn gpu_context(self) -> GpuContext {
        match self {
            MediaFunction::VdboxDecode | MediaFunction::VdboxCopy => GpuContext::Video,
            MediaFunction::VdboxEncode => GpuContext::VideoEncode,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ScalabilityPars {
    pub num_vdbox: u8,
    pub disable_scalability: bool,
    pub frame_tracking_enabled: bool,
}

impl Default for ScalabilityPars {
    fn default() -> Self {
        Self { num_vdbox: 1, disable_scalability: true, frame_tracking_enabled: false }
    }
}

impl ScalabilityPars {
    pub fn pipe_count(&self) -> u8 {
        if self.disable_scalability || self.num_vdbox < 2 {
            1
        } else {
            self.num_vdbox
        }
    }
}

pub type DecodeScalabilityPars = ScalabilityPars;
pub type EncodeScalabilityPars = ScalabilityPars;

pub trait MediaScalability {
    /// Selects the pipe and pass subsequent buffer operations apply to.
    fn update_state(&mut self, state: &StateParams) -> MediaResult<()>;

    /// Makes sure every pipe buffer can hold `size` bytes of commands and `patch_list_size`
    /// relocations. `single_task_phase` tells whether the size covers all passes of a frame.
    fn verify_cmd_buffer(
        &mut self,
        size: u32,
        patch_list_size: u32,
        single_task_phase: bool,
    ) -> MediaResult<()>;

    /// Checks out the command buffer of the current pipe until `return_cmd_buffer`.
    fn get_cmd_buffer(&mut self, frame_tracking_requested: bool) -> MediaResult<CommandBuffer>;

    fn return_cmd_buffer(&mut self, cmd_buffer: CommandBuffer) -> MediaResult<()>;

    fn submit_cmd_buffer(&mut self) -> MediaResult<()>;

    /// Drops the commands written to the checked-in buffers since the last submission.
    fn discard_cmd_buffers(&mut self);

    fn pipe_number(&self) -> u8;

    fn current_pipe(&self) -> u8;

    fn set_current_pipe_index(&mut self, index: u8) -> MediaResult<()>;

    /// Command buffer of `pipe`, unless it is checked out.
    fn cmd_buffer(&self, pipe: u8) -> Option<&CommandBuffer>;

    fn pass_number(&self) -> u16;

    fn set_pass_number(&mut self, pass_number: u16);

    fn is_frame_tracking_enabled(&self) -> bool;

    fn destroy(&mut self) -> MediaResult<()>;
}

pub type ScalabilityRef = Rc<RefCell<dyn MediaScalability>>;

/// Per-pipe frame tags stored at the start of every submission, so the OS can tell which
/// frame each engine last started.
pub(crate) struct FrameTracker {
    resource: Resource,
    tag: u32,
}

impl FrameTracker {
    pub(crate) fn new(os: &OsRef, pipes: u8) -> MediaResult<Self> {
        let resource = os.borrow_mut().allocate_buffer(
            4 * u32::from(pipes),
            "FrameTracker",
            ResourceUsage::StatusBuffer,
            Lockability::Lockable,
        )?;
        Ok(Self { resource, tag: 0 })
    }

    pub(crate) fn resource(&self) -> &Resource {
        &self.resource
    }

    pub(crate) fn next_frame(&mut self) {
        self.tag = self.tag.wrapping_add(1);
    }

    pub(crate) fn add_tag(&self, cmd: &mut CommandBuffer, pipe: u8) -> MediaResult<()> {
        mi::add_store_data_imm(cmd, &self.resource, 4 * u32::from(pipe), self.tag)
    }

    pub(crate) fn cmd_size() -> u32 {
        mi::STORE_DATA_IMM_SIZE
    }
}

/// Set of GPU contexts used by one pipeline, one scalability instance per function and pipe
/// count.
pub struct MediaContext {
    os: OsRef,
    instances: HashMap<(MediaFunction, u8), ScalabilityRef>,
    current: Option<ScalabilityRef>,
}

impl MediaContext {
    pub fn new(os: OsRef) -> Self {
        Self { os, instances: HashMap::new(), current: None }
    }

    /// Makes the context for `function` current, creating its scalability instance on first
    /// use.
    pub fn switch_context(
        &mut self,
        function: MediaFunction,
        pars: &ScalabilityPars,
    ) -> MediaResult<ScalabilityRef> {
        let pipes = pars.pipe_count();
        let scalability = match self.instances.get(&(function, pipes)) {
            Some(scalability) => Rc::clone(scalability),
            None => {
                debug!("Creating {pipes}-pipe scalability for {function:?}");
                let scalability: ScalabilityRef = if pipes > 1 {
                    Rc::new(RefCell::new(MultiPipeScalability::new(
                        Rc::clone(&self.os),
                        pipes,
                        pars,
                    )?))
                } else {
                    Rc::new(RefCell::new(SinglePipeScalability::new(Rc::clone(&self.os), pars)?))
                };
                self.instances.insert((function, pipes), Rc::clone(&scalability));
                scalability
            }
        };

        let context = if pipes > 1 { GpuContext::VirtualEngine } else { function.gpu_context() };
        self.os.borrow_mut().set_gpu_context(context)?;
        self.current = Some(Rc::clone(&scalability));
        Ok(scalability)
    }

    pub fn current(&self) -> Option<ScalabilityRef> {
        self.current.clone()
    }

    pub fn destroy(&mut self) -> MediaResult<()> {
        self.current = None;
        for (_, scalability) in self.instances.drain() {
            scalability.borrow_mut().destroy()?;
        }
        Ok(())
    }
}
