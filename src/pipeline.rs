// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-codec-instance orchestration shared by every decoder and encoder.
//!
//! A [`MediaPipeline`] owns the packets of one codec instance, the tasks they are submitted
//! through, the GPU contexts and the status report. Codec pipelines drive it frame by frame:
//! activate the packets needed for the frame with [`MediaPipeline::activate_packet`], then hand
//! them to their tasks with [`MediaPipeline::execute_active_packets`].

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use log::debug;
use log::error;

use crate::debug::CmdBufferDumper;
use crate::debug::DebugInterface;
use crate::feature::FeatureManager;
use crate::os::OsRef;
use crate::packet::ActivePacketList;
use crate::packet::PacketCreator;
use crate::packet::PacketId;
use crate::packet::PacketProperty;
use crate::packet::PacketRef;
use crate::packet::PacketRegistry;
use crate::packet::Placement;
use crate::profiler::PerfProfiler;
use crate::profiler::PerfProfilerRef;
use crate::scalability::MediaContext;
use crate::scalability::MediaFunction;
use crate::scalability::ScalabilityPars;
use crate::scalability::ScalabilityRef;
use crate::status_report::MediaStatusReport;
use crate::status_report::StatusReportRef;
use crate::task;
use crate::task::MediaTask;
use crate::task::TaskList;
use crate::task::TaskType;
use crate::MediaError;
use crate::MediaResult;

/// Number of feature slots reserved up front by [`MediaPipeline::create_feature_manager`].
const FEATURE_CAPACITY: usize = 8;

static NEXT_INSTANCE_ID: AtomicU32 = AtomicU32::new(0);

/// Knobs shared by every codec pipeline.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    /// VDBOX instances available to the pipeline.
    pub num_vdbox: u8,
    /// Whether all passes of a frame go into a single command buffer.
    pub single_task_phase_supported: bool,
    pub frame_tracking_requested: bool,
    pub disable_scalability: bool,
    /// Build command buffers but never submit them.
    pub null_hw: bool,
    pub enable_profiler: bool,
    /// Where to dump command buffers, if anywhere.
    pub dump_dir: Option<PathBuf>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            num_vdbox: 1,
            single_task_phase_supported: false,
            frame_tracking_requested: true,
            disable_scalability: true,
            null_hw: false,
            enable_profiler: false,
            dump_dir: None,
        }
    }
}

impl PipelineSettings {
    pub fn scalability_pars(&self) -> ScalabilityPars {
        ScalabilityPars {
            num_vdbox: self.num_vdbox,
            disable_scalability: self.disable_scalability,
            frame_tracking_enabled: self.frame_tracking_requested,
        }
    }
}

pub struct MediaPipeline {
    instance_id: u32,
    os: OsRef,
    settings: PipelineSettings,
    registry: PacketRegistry,
    tasks: TaskList,
    context: MediaContext,
    scalability: Option<ScalabilityRef>,
    status_report: Option<StatusReportRef>,
    feature_manager: Option<FeatureManager>,
    profiler: Option<PerfProfilerRef>,
    debug: Option<Box<dyn DebugInterface>>,
    destroyed: bool,
}

impl MediaPipeline {
    pub fn new(os: OsRef, settings: PipelineSettings) -> Self {
        let instance_id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed) & 0xffff;
        Self {
            instance_id,
            context: MediaContext::new(Rc::clone(&os)),
            os,
            settings,
            registry: Default::default(),
            tasks: Default::default(),
            scalability: None,
            status_report: None,
            feature_manager: None,
            profiler: None,
            debug: None,
            destroyed: false,
        }
    }

    /// Creates the status report, and the profiler and command buffer dumper if the settings
    /// ask for them.
    pub fn init(&mut self) -> MediaResult<()> {
        if self.status_report.is_none() {
            let report = MediaStatusReport::new(Rc::clone(&self.os))?;
            self.status_report = Some(Rc::new(RefCell::new(report)));
        }
        if self.settings.enable_profiler && self.profiler.is_none() {
            self.profiler = Some(Rc::new(RefCell::new(PerfProfiler::new(Rc::clone(&self.os))?)));
        }
        if let Some(dir) = &self.settings.dump_dir {
            if self.debug.is_none() {
                self.debug = Some(Box::new(CmdBufferDumper::new(Some(dir.clone()))));
            }
        }
        debug!("Pipeline {} initialized with {:?}", self.instance_id, self.settings);
        Ok(())
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    pub fn os(&self) -> &OsRef {
        &self.os
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Registers `packet` under `id`. A packet previously registered under the same id is
    /// returned and left for the caller to destroy.
    pub fn register_packet(&mut self, id: PacketId, packet: PacketRef) -> Option<PacketRef> {
        self.registry.register_packet(id, packet)
    }

    pub fn register_packet_creator(&mut self, id: PacketId, creator: PacketCreator) {
        self.registry.register_packet_creator(id, creator)
    }

    pub fn registry(&self) -> &PacketRegistry {
        &self.registry
    }

    /// Queues an execution of packet `id` for the current frame.
    pub fn activate_packet(
        &mut self,
        id: PacketId,
        immediate_submit: bool,
        placement: Placement,
    ) -> MediaResult<&mut PacketProperty> {
        let prop = self.registry.activate_packet(id, immediate_submit, placement)?;
        prop.state.single_task_phase_supported = self.settings.single_task_phase_supported;
        prop.state.frame_tracking_requested = self.settings.frame_tracking_requested;
        Ok(prop)
    }

    pub fn active_packets(&self) -> &ActivePacketList {
        self.registry.active_packets()
    }

    pub fn active_packets_mut(&mut self) -> &mut ActivePacketList {
        self.registry.active_packets_mut()
    }

    /// Hands the active packets to their tasks. The active queue is empty afterwards, whether
    /// or not the execution succeeded.
    pub fn execute_active_packets(&mut self) -> MediaResult<()> {
        let mut active = self.registry.take_active();
        self.execute_packet_queue(&mut active)
    }

    /// Hands every packet of `active` to its task, submitting the task whenever a packet asks
    /// for immediate submission. `active` is drained. On failure the tasks are emptied too, so
    /// nothing of the failed frame is submitted with the next one.
    pub fn execute_packet_queue(&mut self, active: &mut ActivePacketList) -> MediaResult<()> {
        let res = self.queue_packets(active);
        if res.is_err() {
            active.clear();
            for task in self.tasks.values_mut() {
                task.clear();
            }
        }
        res
    }

    fn queue_packets(&mut self, active: &mut ActivePacketList) -> MediaResult<()> {
        for mut prop in active.drain(..) {
            prop.state.status_report = self.status_report.clone();
            let task_type = prop.packet()?.borrow().active_task_type();
            let task = task::get_task(&mut self.tasks, task_type, &self.os)?;
            task.add_packet(&prop)?;

            if !prop.immediate_submit {
                continue;
            }
            if self.settings.null_hw {
                debug!("Dropping {} packets (null hardware)", task.packets().len());
                task.clear();
                continue;
            }
            let scalability =
                self.scalability.clone().ok_or(MediaError::NullPointer("scalability"))?;
            let mut scalability = scalability.borrow_mut();
            let debug = self.debug.as_mut().map(|d| d.as_mut() as &mut dyn DebugInterface);
            task.submit(true, &mut *scalability, debug)?;
        }
        Ok(())
    }

    pub fn create_task(&mut self, task_type: TaskType) -> MediaResult<&mut Box<dyn MediaTask>> {
        let task = task::create_task(task_type, &self.os)?;
        self.tasks.insert(task_type, task);
        self.get_task(task_type)
    }

    /// Returns the task of `task_type`, creating it on first use.
    pub fn get_task(&mut self, task_type: TaskType) -> MediaResult<&mut Box<dyn MediaTask>> {
        task::get_task(&mut self.tasks, task_type, &self.os)
    }

    pub fn create_feature_manager(&mut self) -> MediaResult<&mut FeatureManager> {
        let manager = FeatureManager::try_new(FEATURE_CAPACITY)?;
        Ok(self.feature_manager.insert(manager))
    }

    pub fn feature_manager(&self) -> MediaResult<&FeatureManager> {
        self.feature_manager.as_ref().ok_or(MediaError::NullPointer("feature manager"))
    }

    /// Makes the GPU context for `function` current and returns its scalability.
    pub fn switch_context(
        &mut self,
        function: MediaFunction,
        pars: &ScalabilityPars,
    ) -> MediaResult<ScalabilityRef> {
        let scalability = self.context.switch_context(function, pars)?;
        self.scalability = Some(Rc::clone(&scalability));
        Ok(scalability)
    }

    pub fn scalability(&self) -> Option<ScalabilityRef> {
        self.scalability.clone()
    }

    /// False until a context has been switched to.
    pub fn is_frame_tracking_enabled(&self) -> bool {
        self.scalability.as_ref().is_some_and(|s| s.borrow().is_frame_tracking_enabled())
    }

    pub fn status_report(&self) -> MediaResult<StatusReportRef> {
        self.status_report.clone().ok_or(MediaError::NullPointer("status report"))
    }

    pub fn profiler(&self) -> Option<PerfProfilerRef> {
        self.profiler.clone()
    }

    pub fn set_debug_interface(&mut self, debug: Box<dyn DebugInterface>) {
        self.debug = Some(debug);
    }

    /// Dumps `data` through the debug interface, if any.
    pub fn dump_data(&mut self, name: &str, data: &[u8]) -> MediaResult<()> {
        match self.debug.as_deref_mut() {
            Some(debug) => debug.dump_data(name, data),
            None => Ok(()),
        }
    }

    /// Called by codec pipelines once all the work of a frame has been executed.
    pub fn frame_done(&mut self) {
        if let Some(debug) = self.debug.as_deref_mut() {
            debug.next_frame();
        }
        if let Some(profiler) = &self.profiler {
            profiler.borrow_mut().next_frame();
        }
    }

    /// Releases the packets, tasks, contexts and reports of the pipeline. Called on drop if not
    /// called before.
    pub fn destroy(&mut self) -> MediaResult<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        debug!("Destroying pipeline {}", self.instance_id);

        self.tasks.clear();
        let packets = self.registry.delete_packets();
        self.scalability = None;
        let contexts = self.context.destroy();
        let report = match self.status_report.take() {
            Some(report) => report.borrow_mut().destroy(),
            None => Ok(()),
        };
        let profiler = match self.profiler.take() {
            Some(profiler) => profiler.borrow_mut().destroy(),
            None => Ok(()),
        };
        self.feature_manager = None;
        packets.and(contexts).and(report).and(profiler)
    }
}

impl Drop for MediaPipeline {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            error!("Failed to destroy pipeline {}: {}", self.instance_id, e);
        }
    }
}
