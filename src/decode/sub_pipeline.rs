// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Auxiliary units run around the main decode of a frame.
//!
//! A sub-pipeline owns its packets and activates them on its own [`PacketRegistry`]. Executing
//! it switches the parent pipeline to the context the sub-pipeline runs on and hands its active
//! queue to [`MediaPipeline::execute_packet_queue`], so the queues of the parent pipeline are
//! never touched.

use log::debug;

use crate::decode::DecodePipelineParams;
use crate::packet::PacketRegistry;
use crate::pipeline::MediaPipeline;
use crate::scalability::MediaFunction;
use crate::scalability::ScalabilityPars;
use crate::MediaResult;

pub trait DecodeSubPipeline {
    fn name(&self) -> &'static str;

    /// Creates and registers the packets of the sub-pipeline.
    fn init(&mut self, pipeline: &MediaPipeline) -> MediaResult<()>;

    /// Activates the packets needed for the current call.
    fn prepare(&mut self, params: &DecodePipelineParams) -> MediaResult<()>;

    fn media_function(&self) -> MediaFunction;

    fn scalability_pars(&self) -> ScalabilityPars;

    fn registry(&mut self) -> &mut PacketRegistry;

    fn destroy(&mut self) -> MediaResult<()>;
}

/// Runs the active packets of `sub_pipeline` through `pipeline`. Nothing happens, not even a
/// context switch, when no packet is active.
pub fn execute_sub_pipeline(
    pipeline: &mut MediaPipeline,
    sub_pipeline: &mut dyn DecodeSubPipeline,
) -> MediaResult<()> {
    let mut active = sub_pipeline.registry().take_active();
    if active.is_empty() {
        return Ok(());
    }
    debug!("Executing {} packets of {}", active.len(), sub_pipeline.name());
    pipeline.switch_context(sub_pipeline.media_function(), &sub_pipeline.scalability_pars())?;
    pipeline.execute_packet_queue(&mut active)
}

/// Sub-pipelines run at the same point of a frame, in registration order.
#[derive(Default)]
pub struct DecodeSubPipelineManager {
    sub_pipelines: Vec<Box<dyn DecodeSubPipeline>>,
}

impl DecodeSubPipelineManager {
    pub fn register(&mut self, sub_pipeline: Box<dyn DecodeSubPipeline>) {
        self.sub_pipelines.push(sub_pipeline);
    }

    pub fn len(&self) -> usize {
        self.sub_pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sub_pipelines.is_empty()
    }

    pub fn init(&mut self, pipeline: &MediaPipeline) -> MediaResult<()> {
        for sub_pipeline in &mut self.sub_pipelines {
            sub_pipeline.init(pipeline)?;
        }
        Ok(())
    }

    pub fn prepare(&mut self, params: &DecodePipelineParams) -> MediaResult<()> {
        for sub_pipeline in &mut self.sub_pipelines {
            sub_pipeline.prepare(params)?;
        }
        Ok(())
    }

    pub fn execute(&mut self, pipeline: &mut MediaPipeline) -> MediaResult<()> {
        for sub_pipeline in &mut self.sub_pipelines {
            execute_sub_pipeline(pipeline, sub_pipeline.as_mut())?;
        }
        Ok(())
    }

    pub fn destroy(&mut self) -> MediaResult<()> {
        for sub_pipeline in &mut self.sub_pipelines {
            sub_pipeline.destroy()?;
        }
        self.sub_pipelines.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::decode::DecodePipeMode;
    use crate::os::sysmem::SysMemOs;
    use crate::os::GpuContext;
    use crate::os::OsInterface;
    use crate::packet::decode_packet_id;
    use crate::packet::dummy::EventLog;
    use crate::packet::dummy::PacketEvent;
    use crate::packet::dummy::RecordingPacket;
    use crate::packet::PacketRef;
    use crate::packet::Placement;
    use crate::pipeline::PipelineSettings;
    use crate::task::TaskType;

    struct TestSubPipeline {
        name: &'static str,
        log: EventLog,
        registry: PacketRegistry,
        id: u32,
        function: MediaFunction,
    }

    impl TestSubPipeline {
        fn new(name: &'static str, log: &EventLog, function: MediaFunction) -> Self {
            Self { name, log: log.clone(), registry: Default::default(), id: 0, function }
        }
    }

    impl DecodeSubPipeline for TestSubPipeline {
        fn name(&self) -> &'static str {
            self.name
        }

        fn init(&mut self, pipeline: &MediaPipeline) -> MediaResult<()> {
            self.id = decode_packet_id(pipeline, 0x100);
            let packet: PacketRef = RecordingPacket::new_ref(self.name, &self.log);
            self.registry.register_packet(self.id, packet);
            Ok(())
        }

        fn prepare(&mut self, params: &DecodePipelineParams) -> MediaResult<()> {
            if params.mode == DecodePipeMode::Process {
                self.registry.activate_packet(self.id, true, Placement::new(0, 0))?;
            }
            Ok(())
        }

        fn media_function(&self) -> MediaFunction {
            self.function
        }

        fn scalability_pars(&self) -> ScalabilityPars {
            ScalabilityPars::default()
        }

        fn registry(&mut self) -> &mut PacketRegistry {
            &mut self.registry
        }

        fn destroy(&mut self) -> MediaResult<()> {
            self.registry.delete_packets()
        }
    }

    fn setup() -> (Rc<RefCell<SysMemOs>>, MediaPipeline, EventLog, u32) {
        let sysmem = Rc::new(RefCell::new(SysMemOs::new()));
        let mut pipeline = MediaPipeline::new(sysmem.clone(), PipelineSettings::default());
        pipeline.init().unwrap();
        let log = EventLog::default();
        let main_id = decode_packet_id(&pipeline, 1);
        pipeline.register_packet(main_id, RecordingPacket::new_ref("main", &log));
        (sysmem, pipeline, log, main_id)
    }

    #[test]
    fn test_empty_sub_pipeline_is_noop() {
        let (sysmem, mut pipeline, log, main_id) = setup();
        pipeline.activate_packet(main_id, false, Placement::new(0, 0)).unwrap();

        let mut sub = TestSubPipeline::new("copy", &log, MediaFunction::VdboxCopy);
        sub.init(&pipeline).unwrap();
        execute_sub_pipeline(&mut pipeline, &mut sub).unwrap();

        assert!(pipeline.scalability().is_none());
        assert!(sysmem.borrow().submissions().is_empty());
        assert_eq!(pipeline.active_packets().len(), 1);
        assert_eq!(pipeline.registry().packets().len(), 1);
    }

    #[test]
    fn test_execution_leaves_parent_queues_alone() {
        let (sysmem, mut pipeline, log, main_id) = setup();
        pipeline.activate_packet(main_id, false, Placement::new(0, 0)).unwrap();
        pipeline.activate_packet(main_id, false, Placement::new(1, 0)).unwrap();

        let mut manager = DecodeSubPipelineManager::default();
        manager.register(Box::new(TestSubPipeline::new("copy", &log, MediaFunction::VdboxCopy)));
        manager.register(Box::new(TestSubPipeline::new("out", &log, MediaFunction::VdboxDecode)));
        manager.init(&pipeline).unwrap();
        manager
            .prepare(&DecodePipelineParams { mode: DecodePipeMode::Process, ..Default::default() })
            .unwrap();
        manager.execute(&mut pipeline).unwrap();

        let active = pipeline.active_packets();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].packet_id, main_id);
        assert_eq!(active[1].state.current_pass, 1);
        assert_eq!(pipeline.registry().packets().len(), 1);

        let submitted: Vec<_> = log
            .borrow()
            .iter()
            .filter(|(_, e)| matches!(e, PacketEvent::Submit { .. }))
            .map(|(name, _)| *name)
            .collect();
        assert_eq!(submitted, vec!["copy", "out"]);
        assert_eq!(sysmem.borrow().submissions().len(), 2);
        assert_eq!(sysmem.borrow().gpu_context(), GpuContext::Video);
        assert!(pipeline.get_task(TaskType::Cmd).unwrap().packets().is_empty());

        manager.destroy().unwrap();
        assert!(manager.is_empty());
    }
}
