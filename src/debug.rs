// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Dumping of composed command buffers and packet outputs.

use std::path::PathBuf;

use anyhow::Context;
use log::debug;

use crate::hw::CommandBuffer;
use crate::MediaResult;

pub trait DebugInterface {
    /// Called once per pipe with the command buffer about to be submitted.
    fn dump_cmd_buffer(&mut self, cmd: &CommandBuffer, pipe: u8, name: &str) -> MediaResult<()>;

    /// Dumps an arbitrary buffer produced by a packet.
    fn dump_data(&mut self, name: &str, data: &[u8]) -> MediaResult<()>;

    /// Called by the pipeline once a frame has been fully submitted.
    fn next_frame(&mut self) {}
}

/// Logs the CRC of everything dumped and optionally writes it to a directory as
/// `frame<N>_<name>_pipe<P>.bin`.
pub struct CmdBufferDumper {
    dir: Option<PathBuf>,
    frame: u32,
    crcs: Vec<(String, u32)>,
}

impl CmdBufferDumper {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir, frame: 0, crcs: Vec::new() }
    }

    /// CRC of every buffer dumped so far, with the file name it was or would have been
    /// written to.
    pub fn crcs(&self) -> &[(String, u32)] {
        &self.crcs
    }

    fn dump(&mut self, file_name: String, data: &[u8]) -> MediaResult<()> {
        let crc = crc32fast::hash(data);
        debug!("{file_name}: {} bytes, crc {crc:08x}", data.len());
        if let Some(dir) = &self.dir {
            let path = dir.join(&file_name);
            std::fs::write(&path, data)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        self.crcs.push((file_name, crc));
        Ok(())
    }
}

impl DebugInterface for CmdBufferDumper {
    fn dump_cmd_buffer(&mut self, cmd: &CommandBuffer, pipe: u8, name: &str) -> MediaResult<()> {
        let file_name = format!("frame{}_{}_pipe{}.bin", self.frame, name, pipe);
        self.dump(file_name, cmd.as_bytes())
    }

    fn dump_data(&mut self, name: &str, data: &[u8]) -> MediaResult<()> {
        let file_name = format!("frame{}_{}.bin", self.frame, name);
        self.dump(file_name, data)
    }

    fn next_frame(&mut self) {
        self.frame += 1;
    }
}

/// Debug interface remembering what it was given.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingDebug {
    pub(crate) cmd_buffers: Vec<(u8, Vec<u8>)>,
    pub(crate) data: Vec<String>,
}

#[cfg(test)]
impl DebugInterface for RecordingDebug {
    fn dump_cmd_buffer(&mut self, cmd: &CommandBuffer, pipe: u8, _name: &str) -> MediaResult<()> {
        self.cmd_buffers.push((pipe, cmd.as_bytes().to_vec()));
        Ok(())
    }

    fn dump_data(&mut self, name: &str, _data: &[u8]) -> MediaResult<()> {
        self.data.push(name.to_string());
        Ok(())
    }
}
