// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shared fixtures for the graph test suite.

mod registry_access;
mod sync_barrier;

use crate::context::Context;
use crate::data_loop::DataLoop;
use crate::events::AsyncComplete;
use crate::node::{AsyncNotify, BufferHints, NodePlugin, PortCaps, PortFlags, RingbufferParams};
use patchbay_core::{
    AudioRaw, BufferPool, Completion, Direction, MediaFormat, NodeCommand, ObjectId, Properties,
    Result, SampleFormat, SeqId,
};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub fn s16_48k() -> MediaFormat {
    MediaFormat::AudioRaw(AudioRaw { format: SampleFormat::S16, rate: 48000, channels: 2 })
}

pub fn f32_48k() -> MediaFormat {
    MediaFormat::AudioRaw(AudioRaw { format: SampleFormat::F32, rate: 48000, channels: 2 })
}

/// A test context plus the channel plugin completions arrive on.
pub struct Fixture {
    pub ctx: Context,
    pub completions: mpsc::UnboundedReceiver<AsyncComplete>,
    // Keeps the data-loop thread alive for the test's duration.
    _data_loop: DataLoop,
}

impl Fixture {
    pub fn new() -> Self {
        let (tx, completions) = mpsc::unbounded_channel();
        let data_loop = DataLoop::spawn(tx.clone()).unwrap();
        let ctx = Context::new("test-core", Properties::new(), data_loop.handle(), tx);
        Self { ctx, completions, _data_loop: data_loop }
    }

    /// Registers a throwaway factory for `plugin` and instantiates it.
    pub fn add_node(&mut self, name: &str, plugin: TestPlugin) -> (ObjectId, PluginHandle) {
        let handle = plugin.handle.clone();
        let factory_name = format!("test.{name}");
        let mut slot = Some(Box::new(plugin) as Box<dyn NodePlugin>);
        self.ctx.register_factory(crate::factory::FactoryDef::new(
            factory_name.clone(),
            0,
            move |_props| {
                slot.take().ok_or_else(|| {
                    patchbay_core::Error::InvalidArgument("factory exhausted".into())
                })
            },
        ));
        let id = self
            .ctx
            .create_node(&factory_name, name, Properties::new(), None)
            .unwrap();
        (id, handle)
    }

    /// Feeds every pending completion into the context and drains the work
    /// queue, waiting for at least one completion when `expect_one` is set.
    pub fn pump(&mut self, expect_one: bool) {
        if expect_one {
            let done = self
                .completions
                .blocking_recv()
                .expect("expected a completion");
            self.ctx.async_complete(&done);
        }
        while let Ok(done) = self.completions.try_recv() {
            self.ctx.async_complete(&done);
        }
        self.ctx.drain_work();
    }
}

/// What the shared test plugin records and exposes to assertions.
#[derive(Default)]
pub struct PluginState {
    pub notify: Option<AsyncNotify>,
    pub pending: Vec<SeqId>,
    pub commands: Vec<NodeCommand>,
    pub used_pools: Vec<Option<Arc<BufferPool>>>,
    pub formats_set: Vec<(Direction, u32, Option<MediaFormat>)>,
}

#[derive(Clone, Default)]
pub struct PluginHandle(pub Arc<Mutex<PluginState>>);

impl PluginHandle {
    pub fn state(&self) -> std::sync::MutexGuard<'_, PluginState> {
        self.0.lock().unwrap()
    }

    /// Acknowledges every outstanding async sequence with `result`.
    pub fn complete_pending(&self, result: &std::result::Result<(), String>) {
        let (notify, pending) = {
            let mut state = self.state();
            (state.notify.clone(), std::mem::take(&mut state.pending))
        };
        let notify = notify.expect("plugin was never attached");
        for seq in pending {
            notify.complete(seq, result.clone());
        }
    }
}

/// Configurable mock plugin used across the suite.
pub struct TestPlugin {
    pub inputs: Vec<u32>,
    pub outputs: Vec<u32>,
    pub formats: Vec<MediaFormat>,
    pub flags: PortFlags,
    pub hints: BufferHints,
    pub ringbuffer: Option<RingbufferParams>,
    /// Commands complete asynchronously and wait for `complete_pending`.
    pub async_commands: bool,
    /// `port_set_format` completes asynchronously.
    pub async_formats: bool,
    pub handle: PluginHandle,
    seq: u32,
}

impl TestPlugin {
    pub fn source(formats: Vec<MediaFormat>) -> Self {
        Self::new(vec![], vec![0], formats)
    }

    pub fn sink(formats: Vec<MediaFormat>) -> Self {
        Self::new(vec![0], vec![], formats)
    }

    pub fn new(inputs: Vec<u32>, outputs: Vec<u32>, formats: Vec<MediaFormat>) -> Self {
        Self {
            inputs,
            outputs,
            formats,
            flags: PortFlags::CAN_USE_BUFFERS,
            hints: BufferHints::default(),
            ringbuffer: None,
            async_commands: false,
            async_formats: false,
            handle: PluginHandle::default(),
            seq: 0,
        }
    }

    fn next_seq(&mut self) -> SeqId {
        self.seq += 1;
        let seq = SeqId(self.seq);
        self.handle.state().pending.push(seq);
        seq
    }
}

impl NodePlugin for TestPlugin {
    fn attach(&mut self, notify: AsyncNotify) {
        self.handle.state().notify = Some(notify);
    }

    fn input_ports(&self) -> Vec<u32> {
        self.inputs.clone()
    }

    fn output_ports(&self) -> Vec<u32> {
        self.outputs.clone()
    }

    fn port_get_info(&self, _direction: Direction, _port: u32) -> Result<PortCaps> {
        Ok(PortCaps {
            flags: self.flags,
            hints: self.hints,
            metas: Vec::new(),
            ringbuffer: self.ringbuffer,
        })
    }

    fn port_enum_formats(&self, _direction: Direction, _port: u32) -> Result<Vec<MediaFormat>> {
        Ok(self.formats.clone())
    }

    fn port_set_format(
        &mut self,
        direction: Direction,
        port: u32,
        format: Option<&MediaFormat>,
    ) -> Result<Completion> {
        self.handle
            .state()
            .formats_set
            .push((direction, port, format.cloned()));
        if self.async_formats && format.is_some() {
            Ok(Completion::Async(self.next_seq()))
        } else {
            Ok(Completion::Done)
        }
    }

    fn port_use_buffers(
        &mut self,
        _direction: Direction,
        _port: u32,
        buffers: Option<Arc<BufferPool>>,
    ) -> Result<Completion> {
        self.handle.state().used_pools.push(buffers);
        Ok(Completion::Done)
    }

    fn send_command(&mut self, command: NodeCommand) -> Result<Completion> {
        self.handle.state().commands.push(command);
        if self.async_commands {
            Ok(Completion::Async(self.next_seq()))
        } else {
            Ok(Completion::Done)
        }
    }
}
