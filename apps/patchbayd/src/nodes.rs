// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Builtin node factories: a tone source that drives the graph clock and a
//! null sink. Enough to patch a working graph without any external plugin.

use patchbay_core::{
    AudioRaw, BufferPool, Completion, Direction, MediaFormat, NodeCommand, Properties, Result,
    SampleFormat,
};
use patchbay_graph::{
    Clock, FactoryDef, GraphHandle, NodePlugin, PortCaps, PortFlags, RtContext, RtEvent, RtProcess,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

fn parse_rate(props: &Properties) -> u32 {
    props.get("audio.rate").and_then(|v| v.parse().ok()).unwrap_or(48000)
}

fn audio_formats(rate: u32) -> Vec<MediaFormat> {
    vec![
        MediaFormat::AudioRaw(AudioRaw { format: SampleFormat::F32, rate, channels: 2 }),
        MediaFormat::AudioRaw(AudioRaw { format: SampleFormat::S16, rate, channels: 2 }),
    ]
}

/// Wall-clock driver for the data loop.
struct MonotonicClock {
    origin: Instant,
}

impl Clock for MonotonicClock {
    fn get_time(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Real-time side of the tone source: cycles the pool's buffers as "filled".
struct ToneRt {
    n_buffers: AtomicU32,
    next: AtomicU32,
}

impl RtProcess for ToneRt {
    fn process(&self, ctx: &mut RtContext<'_>) {
        let n = self.n_buffers.load(Ordering::Acquire);
        if n == 0 {
            return;
        }
        let buffer = self.next.fetch_add(1, Ordering::AcqRel) % n;
        ctx.events
            .push(RtEvent::HaveBuffer { direction: Direction::Output, port: 0, buffer });
    }

    fn recycle_buffer(&self, _port: u32, _buffer: u32) {}
}

pub struct ToneSource {
    formats: Vec<MediaFormat>,
    rt: Arc<ToneRt>,
    clock: Arc<MonotonicClock>,
}

impl ToneSource {
    pub fn new(props: &Properties) -> Self {
        Self {
            formats: audio_formats(parse_rate(props)),
            rt: Arc::new(ToneRt { n_buffers: AtomicU32::new(0), next: AtomicU32::new(0) }),
            clock: Arc::new(MonotonicClock { origin: Instant::now() }),
        }
    }
}

impl NodePlugin for ToneSource {
    fn output_ports(&self) -> Vec<u32> {
        vec![0]
    }

    fn port_get_info(&self, _direction: Direction, _port: u32) -> Result<PortCaps> {
        Ok(PortCaps { flags: PortFlags::CAN_USE_BUFFERS, ..PortCaps::default() })
    }

    fn port_enum_formats(&self, _direction: Direction, _port: u32) -> Result<Vec<MediaFormat>> {
        Ok(self.formats.clone())
    }

    fn port_set_format(
        &mut self,
        _direction: Direction,
        _port: u32,
        _format: Option<&MediaFormat>,
    ) -> Result<Completion> {
        Ok(Completion::Done)
    }

    fn port_use_buffers(
        &mut self,
        _direction: Direction,
        _port: u32,
        buffers: Option<Arc<BufferPool>>,
    ) -> Result<Completion> {
        let n = buffers.map_or(0, |pool| u32::try_from(pool.len()).unwrap_or(0));
        self.rt.n_buffers.store(n, Ordering::Release);
        Ok(Completion::Done)
    }

    fn send_command(&mut self, _command: NodeCommand) -> Result<Completion> {
        Ok(Completion::Done)
    }

    fn clock(&self) -> Option<Arc<dyn Clock>> {
        Some(self.clock.clone())
    }

    fn rt(&self) -> Option<Arc<dyn RtProcess>> {
        Some(self.rt.clone())
    }
}

/// Consumes and immediately recycles whatever arrives.
struct NullSinkRt;

impl RtProcess for NullSinkRt {
    fn process(&self, _ctx: &mut RtContext<'_>) {}

    fn receive_buffer(&self, _port: u32, _buffer: u32) {
        // A real sink would read the chunk here before recycling.
    }
}

pub struct NullSink {
    formats: Vec<MediaFormat>,
    rt: Arc<NullSinkRt>,
}

impl NullSink {
    pub fn new(props: &Properties) -> Self {
        Self { formats: audio_formats(parse_rate(props)), rt: Arc::new(NullSinkRt) }
    }
}

impl NodePlugin for NullSink {
    fn input_ports(&self) -> Vec<u32> {
        vec![0]
    }

    fn port_get_info(&self, _direction: Direction, _port: u32) -> Result<PortCaps> {
        Ok(PortCaps { flags: PortFlags::CAN_USE_BUFFERS, ..PortCaps::default() })
    }

    fn port_enum_formats(&self, _direction: Direction, _port: u32) -> Result<Vec<MediaFormat>> {
        Ok(self.formats.clone())
    }

    fn port_set_format(
        &mut self,
        _direction: Direction,
        _port: u32,
        _format: Option<&MediaFormat>,
    ) -> Result<Completion> {
        Ok(Completion::Done)
    }

    fn port_use_buffers(
        &mut self,
        _direction: Direction,
        _port: u32,
        _buffers: Option<Arc<BufferPool>>,
    ) -> Result<Completion> {
        Ok(Completion::Done)
    }

    fn send_command(&mut self, _command: NodeCommand) -> Result<Completion> {
        Ok(Completion::Done)
    }

    fn rt(&self) -> Option<Arc<dyn RtProcess>> {
        Some(self.rt.clone())
    }
}

/// Registers the builtin factories on the core.
pub async fn register_builtin(handle: &GraphHandle) -> patchbay_core::Result<()> {
    handle
        .register_factory(FactoryDef::new("support.tone-source", 0, |props| {
            Ok(Box::new(ToneSource::new(props)))
        }))
        .await?;
    handle
        .register_factory(FactoryDef::new("support.null-sink", 0, |props| {
            Ok(Box::new(NullSink::new(props)))
        }))
        .await?;
    Ok(())
}
