// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Tasks turn the packets handed to them into a submitted command buffer.

use std::collections::HashMap;
use std::collections::HashSet;

use log::debug;
use log::trace;

use crate::debug::DebugInterface;
use crate::hw::CommandSize;
use crate::os::OsRef;
use crate::packet::PacketPhase;
use crate::packet::PacketProperty;
use crate::scalability::MediaScalability;
use crate::MediaError;
use crate::MediaResult;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// Command streamer work.
    Cmd,
    /// Render kernel work.
    Mdf,
}

pub trait MediaTask {
    fn task_type(&self) -> TaskType;

    /// Queues a copy of `prop`.
    fn add_packet(&mut self, prop: &PacketProperty) -> MediaResult<()>;

    /// Builds and submits one command buffer out of every queued packet. The queue is empty
    /// afterwards, and on failure nothing written for it stays in the scalability buffers.
    fn submit(
        &mut self,
        immediate_submit: bool,
        scalability: &mut dyn MediaScalability,
        debug: Option<&mut dyn DebugInterface>,
    ) -> MediaResult<()>;

    fn clear(&mut self);

    fn packets(&self) -> &[PacketProperty];
}

pub type TaskList = HashMap<TaskType, Box<dyn MediaTask>>;

pub fn create_task(task_type: TaskType, os: &OsRef) -> MediaResult<Box<dyn MediaTask>> {
    match task_type {
        TaskType::Cmd => Ok(Box::new(CmdTask::new(os.clone()))),
        TaskType::Mdf => {
            Err(MediaError::InvalidParameter("render kernel tasks are not supported".into()))
        }
    }
}

/// Returns the task of `task_type`, creating it on first use.
pub fn get_task<'a>(
    tasks: &'a mut TaskList,
    task_type: TaskType,
    os: &OsRef,
) -> MediaResult<&'a mut Box<dyn MediaTask>> {
    if !tasks.contains_key(&task_type) {
        debug!("Creating {task_type:?} task");
        tasks.insert(task_type, create_task(task_type, os)?);
    }
    tasks.get_mut(&task_type).ok_or(MediaError::NullPointer("task"))
}

pub struct CmdTask {
    os: OsRef,
    packets: Vec<PacketProperty>,
    cmd_buf_size: u32,
    patch_list_size: u32,
}

impl CmdTask {
    pub fn new(os: OsRef) -> Self {
        Self { os, packets: Vec::new(), cmd_buf_size: 0, patch_list_size: 0 }
    }

    /// Sums the command sizes of the queued packets. Pipes share the command layout, so only
    /// the executions on pipe 0 count, and each packet counts once however many passes it runs.
    fn calculate_cmd_buffer_size_from_active_packets(&mut self) -> MediaResult<()> {
        let mut total = CommandSize::default();
        let mut counted = HashSet::new();
        for prop in self.packets.iter().filter(|p| p.state.current_pipe == 0) {
            if !counted.insert(prop.packet_id) {
                continue;
            }
            total += prop.packet()?.borrow().calculate_command_size()?;
        }
        let total = total.for_os(self.os.borrow().uses_patch_list());
        self.cmd_buf_size = total.commands;
        self.patch_list_size = total.patch_list;
        Ok(())
    }

    pub fn cmd_buf_size(&self) -> u32 {
        self.cmd_buf_size
    }

    pub fn patch_list_size(&self) -> u32 {
        self.patch_list_size
    }

    fn build_and_submit(
        &mut self,
        immediate_submit: bool,
        scalability: &mut dyn MediaScalability,
        mut debug: Option<&mut dyn DebugInterface>,
    ) -> MediaResult<()> {
        self.calculate_cmd_buffer_size_from_active_packets()?;

        let (front, back) = match (self.packets.first(), self.packets.last()) {
            (Some(front), Some(back)) => (front, back),
            _ => return Err(MediaError::InvalidParameter("no packet to submit".into())),
        };
        debug!(
            "Submitting {} packets ({:#x} bytes, {} patches){}",
            self.packets.len(),
            self.cmd_buf_size,
            self.patch_list_size,
            if immediate_submit { " immediately" } else { "" }
        );

        scalability.update_state(&front.state)?;
        scalability.verify_cmd_buffer(
            self.cmd_buf_size,
            self.patch_list_size,
            front.state.single_task_phase_supported,
        )?;

        for prop in &self.packets {
            let packet = prop.packet()?;
            let mut packet = packet.borrow_mut();
            scalability.update_state(&prop.state)?;
            packet.prepare(&prop.state)?;

            let mut cmd = scalability.get_cmd_buffer(prop.state.frame_tracking_requested)?;
            let phase = PacketPhase::new(std::ptr::eq(prop, front), std::ptr::eq(prop, back));
            trace!(
                "{} pass {} pipe {}: {:?}",
                packet.name(),
                prop.state.current_pass,
                prop.state.current_pipe,
                phase
            );
            let res = packet.submit(&mut cmd, phase, &prop.state);
            scalability.return_cmd_buffer(cmd)?;
            res?;
        }

        if let Some(debug) = debug.as_deref_mut() {
            let current = scalability.current_pipe();
            for pipe in 0..scalability.pipe_number() {
                scalability.set_current_pipe_index(pipe)?;
                if let Some(cmd) = scalability.cmd_buffer(pipe) {
                    debug.dump_cmd_buffer(cmd, pipe, "CmdTask")?;
                }
            }
            scalability.set_current_pipe_index(current)?;
        }

        scalability.submit_cmd_buffer()?;

        if let Some(debug) = debug {
            for prop in &self.packets {
                prop.packet()?.borrow_mut().dump_output(debug)?;
            }
        }

        Ok(())
    }
}

impl MediaTask for CmdTask {
    fn task_type(&self) -> TaskType {
        TaskType::Cmd
    }

    fn add_packet(&mut self, prop: &PacketProperty) -> MediaResult<()> {
        prop.packet()?;
        self.packets.push(prop.clone());
        Ok(())
    }

    fn submit(
        &mut self,
        immediate_submit: bool,
        scalability: &mut dyn MediaScalability,
        debug: Option<&mut dyn DebugInterface>,
    ) -> MediaResult<()> {
        if self.packets.is_empty() {
            return Err(MediaError::InvalidParameter("no packet to submit".into()));
        }
        let res = self.build_and_submit(immediate_submit, scalability, debug);
        if res.is_err() {
            // Partially written commands must not leak into the next frame.
            scalability.discard_cmd_buffers();
        }
        self.clear();
        res
    }

    fn clear(&mut self) {
        self.packets.clear();
    }

    fn packets(&self) -> &[PacketProperty] {
        &self.packets
    }
}
