// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Packets, the units of work a task turns into commands.
//!
//! A packet goes through the following states during the life of its pipeline:
//!
//! * [`MediaPacket::init`], once, allocating the resources it keeps for its whole life.
//! * [`MediaPacket::prepare`], once per frame, binding the frame parameters.
//! * [`MediaPacket::submit`], once per pass, pipe or slice it is activated for.
//! * [`MediaPacket::destroy`], once, when the pipeline goes away.
//!
//! Completion is observed separately through [`crate::status_report::StatusReportObserver`].

#[cfg(test)]
pub(crate) mod dummy;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::rc::Weak;

use log::debug;
use log::error;

use crate::debug::DebugInterface;
use crate::hw::CommandBuffer;
use crate::hw::CommandSize;
use crate::pipeline::MediaPipeline;
use crate::scalability::StateParams;
use crate::task::TaskType;
use crate::MediaError;
use crate::MediaResult;

pub type PacketId = u32;

/// Builds a packet id unique across every pipeline instance of the process, from a packet
/// number local to a codec.
pub fn decode_packet_id(pipeline: &MediaPipeline, id: u32) -> PacketId {
    (pipeline.instance_id() << 16) | (id & 0xffff)
}

/// Position of a packet within the task being submitted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PacketPhase {
    first: bool,
    last: bool,
}

impl PacketPhase {
    pub const FIRST: Self = Self { first: true, last: false };
    pub const OTHER: Self = Self { first: false, last: false };
    pub const LAST: Self = Self { first: false, last: true };
    /// Both first and last, when the task holds a single packet.
    pub const ONLY: Self = Self { first: true, last: true };

    pub fn new(first: bool, last: bool) -> Self {
        Self { first, last }
    }

    /// Whether the packet opens the command buffer.
    pub fn is_first(self) -> bool {
        self.first
    }

    /// Whether the packet closes the command buffer and must end the batch.
    pub fn is_last(self) -> bool {
        self.last
    }
}

pub trait MediaPacket {
    fn name(&self) -> &'static str;

    fn init(&mut self) -> MediaResult<()>;

    fn prepare(&mut self, state: &StateParams) -> MediaResult<()>;

    /// Emits the packet's commands. The buffer is owned by the calling task.
    fn submit(
        &mut self,
        cmd_buffer: &mut CommandBuffer,
        phase: PacketPhase,
        state: &StateParams,
    ) -> MediaResult<()>;

    /// Upper bound of what one `submit` may emit, whatever the frame parameters.
    fn calculate_command_size(&self) -> MediaResult<CommandSize>;

    fn destroy(&mut self) -> MediaResult<()>;

    fn active_task_type(&self) -> TaskType {
        TaskType::Cmd
    }

    /// Dumps whatever the packet produced once its commands have been submitted.
    fn dump_output(&mut self, _debug: &mut dyn DebugInterface) -> MediaResult<()> {
        Ok(())
    }
}

pub type PacketRef = Rc<RefCell<dyn MediaPacket>>;

/// One scheduled execution of a packet.
#[derive(Clone)]
pub struct PacketProperty {
    pub packet: Weak<RefCell<dyn MediaPacket>>,
    pub packet_id: PacketId,
    pub immediate_submit: bool,
    pub state: StateParams,
}

impl PacketProperty {
    /// The packet, unless it was destroyed since the property was created.
    pub fn packet(&self) -> MediaResult<PacketRef> {
        self.packet.upgrade().ok_or(MediaError::NullPointer("packet"))
    }
}

/// Scheduling coordinates of an activated packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    pub pass: u16,
    pub pipe: u8,
    pub pipe_num: u8,
    pub sub_pass: u8,
    pub row: u16,
}

impl Placement {
    pub fn new(pass: u16, pipe: u8) -> Self {
        Self { pass, pipe, pipe_num: 1, sub_pass: 0, row: 0 }
    }

    pub fn with_pipe_num(mut self, pipe_num: u8) -> Self {
        self.pipe_num = pipe_num;
        self
    }

    pub fn with_sub_pass(mut self, sub_pass: u8) -> Self {
        self.sub_pass = sub_pass;
        self
    }

    pub fn with_row(mut self, row: u16) -> Self {
        self.row = row;
        self
    }
}

pub type PacketList = HashMap<PacketId, PacketRef>;
pub type ActivePacketList = Vec<PacketProperty>;
pub type PacketCreator = Box<dyn Fn() -> MediaResult<PacketRef>>;

/// Packets known to a pipeline, and the queue of the ones activated for the current frame.
#[derive(Default)]
pub struct PacketRegistry {
    packets: PacketList,
    creators: HashMap<PacketId, PacketCreator>,
    active: ActivePacketList,
}

impl PacketRegistry {
    /// Registers `packet` under `id`, returning the packet previously registered there, if any.
    /// The replaced packet is not destroyed.
    pub fn register_packet(&mut self, id: PacketId, packet: PacketRef) -> Option<PacketRef> {
        self.packets.insert(id, packet)
    }

    /// Registers a function creating the packet `id` the first time it is activated.
    pub fn register_packet_creator(&mut self, id: PacketId, creator: PacketCreator) {
        self.creators.insert(id, creator);
    }

    pub fn get(&self, id: PacketId) -> Option<&PacketRef> {
        self.packets.get(&id)
    }

    pub fn packets(&self) -> &PacketList {
        &self.packets
    }

    fn get_or_create(&mut self, id: PacketId) -> MediaResult<PacketRef> {
        if let Some(packet) = self.packets.get(&id) {
            return Ok(Rc::clone(packet));
        }
        let creator = self.creators.get(&id).ok_or_else(|| {
            MediaError::InvalidParameter(format!("packet {id:#x} is not registered"))
        })?;
        let packet = creator()?;
        debug!("Created packet {} for id {id:#x}", packet.borrow().name());
        packet.borrow_mut().init()?;
        self.packets.insert(id, Rc::clone(&packet));
        Ok(packet)
    }

    /// Appends an execution of packet `id` to the active queue.
    pub fn activate_packet(
        &mut self,
        id: PacketId,
        immediate_submit: bool,
        placement: Placement,
    ) -> MediaResult<&mut PacketProperty> {
        let packet = self.get_or_create(id)?;
        let state = StateParams {
            current_pass: placement.pass,
            current_pipe: placement.pipe,
            pipe_index_for_submit: placement.pipe_num,
            current_sub_pass: placement.sub_pass,
            current_row: placement.row,
            ..Default::default()
        };
        self.active.push(PacketProperty {
            packet: Rc::downgrade(&packet),
            packet_id: id,
            immediate_submit,
            state,
        });
        let last = self.active.len() - 1;
        Ok(&mut self.active[last])
    }

    pub fn active_packets(&self) -> &ActivePacketList {
        &self.active
    }

    pub fn active_packets_mut(&mut self) -> &mut ActivePacketList {
        &mut self.active
    }

    /// Hands the active queue over, leaving it empty.
    pub fn take_active(&mut self) -> ActivePacketList {
        std::mem::take(&mut self.active)
    }

    /// Destroys and forgets every registered packet.
    pub fn delete_packets(&mut self) -> MediaResult<()> {
        self.active.clear();
        let mut result = Ok(());
        for (id, packet) in self.packets.drain() {
            if let Err(e) = packet.borrow_mut().destroy() {
                error!("Failed to destroy packet {id:#x}: {e}");
                result = Err(e);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::dummy::PacketEvent;
    use super::dummy::RecordingPacket;
    use super::*;

    #[test]
    fn test_activate_selects_registered_packet() {
        let log = Default::default();
        let a = RecordingPacket::new_ref("a", &log);
        let b = RecordingPacket::new_ref("b", &log);
        let mut registry = PacketRegistry::default();
        registry.register_packet(5, a.clone());
        registry.register_packet(6, b);

        let prop = registry.activate_packet(5, false, Placement::new(1, 0)).unwrap();
        assert_eq!(prop.packet_id, 5);
        assert_eq!(prop.state.current_pass, 1);
        assert_eq!(prop.state.pipe_index_for_submit, 1);
        assert!(Rc::ptr_eq(&prop.packet().unwrap(), &(a as PacketRef)));
        assert_eq!(registry.active_packets().len(), 1);
    }

    #[test]
    fn test_activate_unknown_packet() {
        let log = Default::default();
        let mut registry = PacketRegistry::default();
        registry.register_packet(5, RecordingPacket::new_ref("a", &log));
        registry.activate_packet(5, false, Placement::new(0, 0)).unwrap();

        let res = registry.activate_packet(99, false, Placement::new(0, 0));
        assert!(matches!(res, Err(MediaError::InvalidParameter(_))));
        assert_eq!(registry.active_packets().len(), 1);
    }

    #[test]
    fn test_register_replaces_without_destroying() {
        let log = Default::default();
        let mut registry = PacketRegistry::default();
        assert!(registry.register_packet(1, RecordingPacket::new_ref("old", &log)).is_none());
        let old = registry.register_packet(1, RecordingPacket::new_ref("new", &log)).unwrap();
        assert_eq!(old.borrow().name(), "old");
        assert_eq!(registry.get(1).unwrap().borrow().name(), "new");
        assert!(log.borrow().is_empty());

        registry.delete_packets().unwrap();
        assert_eq!(*log.borrow(), vec![("new", PacketEvent::Destroy)]);
        assert!(registry.packets().is_empty());
    }

    #[test]
    fn test_lazy_creation() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut registry = PacketRegistry::default();
        let creator_log = log.clone();
        registry.register_packet_creator(
            7,
            Box::new(move || Ok(RecordingPacket::new_ref("lazy", &creator_log) as PacketRef)),
        );

        registry.activate_packet(7, true, Placement::new(0, 0).with_pipe_num(2)).unwrap();
        registry.activate_packet(7, true, Placement::new(1, 0)).unwrap();
        assert_eq!(*log.borrow(), vec![("lazy", PacketEvent::Init)]);

        let active = registry.take_active();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].state.pipe_index_for_submit, 2);
        assert!(registry.active_packets().is_empty());
    }

    #[test]
    fn test_lazy_creation_failure_propagates() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut registry = PacketRegistry::default();
        let creator_log = log.clone();
        registry.register_packet_creator(
            7,
            Box::new(move || {
                let packet = RecordingPacket::new("broken", &creator_log).failing_init();
                Ok(Rc::new(RefCell::new(packet)) as PacketRef)
            }),
        );

        assert!(registry.activate_packet(7, false, Placement::new(0, 0)).is_err());
        assert!(registry.active_packets().is_empty());
        assert!(registry.get(7).is_none());
    }

    #[test]
    fn test_property_outliving_packet() {
        let log = Default::default();
        let mut registry = PacketRegistry::default();
        registry.register_packet(1, RecordingPacket::new_ref("a", &log));
        registry.activate_packet(1, false, Placement::new(0, 0)).unwrap();
        let active = registry.take_active();
        registry.delete_packets().unwrap();
        assert!(matches!(active[0].packet(), Err(MediaError::NullPointer(_))));
    }

    #[test]
    fn test_phases() {
        assert!(PacketPhase::ONLY.is_first() && PacketPhase::ONLY.is_last());
        assert!(PacketPhase::FIRST.is_first() && !PacketPhase::FIRST.is_last());
        assert_eq!(PacketPhase::new(false, true), PacketPhase::LAST);
        assert!(!PacketPhase::OTHER.is_first() && !PacketPhase::OTHER.is_last());
    }
}
