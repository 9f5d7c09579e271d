// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The real-time data loop.
//!
//! A dedicated thread runs a `poll(2)` loop over two descriptors: an eventfd
//! signalled when invoke items are waiting in a lock-free ring, and a timerfd
//! armed by the driving node's clock. Everything the thread touches lives on
//! its own [`RtState`]; the control plane reaches in only through
//! [`DataLoopHandle::invoke`] and friends.
//!
//! Invoking from the loop thread itself is recursion-safe: pending ring items
//! are dispatched first, then the function runs inline.

use crate::events::AsyncComplete;
use crate::node::{RtContext, RtEvent, RtProcess};
use patchbay_core::{Direction, Error, ObjectId, Result, SeqId};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::fd::AsFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Work shipped into the loop. Runs on the loop thread with access to the
/// loop's own state through the [`RtLoop`] facade.
pub type InvokeFn = Box<dyn FnOnce(&RtLoop) + Send>;

enum Item {
    Invoke { func: InvokeFn, done: DoneAction },
    Terminate,
}

enum DoneAction {
    None,
    /// Unblock a waiting `invoke_sync` caller.
    Ack(std::sync::mpsc::SyncSender<()>),
    /// Report completion through the graph actor's completion channel.
    Complete { obj: ObjectId, seq: SeqId },
}

/// A node's real-time face as installed on the loop.
pub struct RtNode {
    pub process: Arc<dyn RtProcess>,
    pub driving: bool,
}

/// The data-thread twin of a link: just enough to route buffer
/// notifications without touching control-plane lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtLink {
    pub link: ObjectId,
    pub output: (ObjectId, u32),
    pub input: (ObjectId, u32),
}

/// State owned by the loop thread.
#[derive(Default)]
pub struct RtState {
    nodes: HashMap<ObjectId, RtNode>,
    links: Vec<RtLink>,
    driver: Option<ObjectId>,
}

impl RtState {
    pub fn add_node(&mut self, id: ObjectId, node: RtNode) {
        self.nodes.insert(id, node);
    }

    pub fn remove_node(&mut self, id: ObjectId) {
        self.nodes.remove(&id);
        if self.driver == Some(id) {
            self.driver = None;
        }
    }

    pub fn add_link(&mut self, link: RtLink) {
        self.links.push(link);
    }

    /// Unsplices the link's rt twin. Idempotent.
    pub fn remove_link(&mut self, link: ObjectId) {
        self.links.retain(|l| l.link != link);
    }

    pub fn set_driver(&mut self, node: Option<ObjectId>) {
        self.driver = node;
    }

    pub fn links(&self) -> &[RtLink] {
        &self.links
    }

    pub fn has_node(&self, id: ObjectId) -> bool {
        self.nodes.contains_key(&id)
    }
}

struct LoopCtx {
    id: u64,
    state: RefCell<RtState>,
    consumer: RefCell<rtrb::Consumer<Item>>,
    timer: nix::sys::timerfd::TimerFd,
    completions: mpsc::UnboundedSender<AsyncComplete>,
    stop: Cell<bool>,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<LoopCtx>>> = const { RefCell::new(None) };
}

/// The loop's face as seen by invoke handlers.
pub struct RtLoop {
    inner: Rc<LoopCtx>,
}

impl RtLoop {
    /// Transient access to the loop state. Do not hold the borrow across a
    /// nested invoke.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut RtState) -> R) -> R {
        f(&mut self.inner.state.borrow_mut())
    }

    /// Arms (or with `None`, disarms) the driving-clock timer.
    pub fn set_interval(&self, interval: Option<Duration>) {
        use nix::sys::time::TimeSpec;
        use nix::sys::timerfd::{Expiration, TimerSetTimeFlags};

        let result = match interval {
            Some(period) => self.inner.timer.set(
                Expiration::Interval(TimeSpec::from_duration(period)),
                TimerSetTimeFlags::empty(),
            ),
            None => self.inner.timer.unset(),
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to update data-loop timer");
        }
    }

    fn drain(&self) {
        loop {
            let item = self.inner.consumer.borrow_mut().pop();
            let Ok(item) = item else { break };
            match item {
                Item::Invoke { func, done } => {
                    func(self);
                    match done {
                        DoneAction::None => {},
                        DoneAction::Ack(tx) => {
                            let _ = tx.send(());
                        },
                        DoneAction::Complete { obj, seq } => {
                            let _ = self.inner.completions.send(AsyncComplete {
                                node: obj,
                                seq,
                                result: Ok(()),
                            });
                        },
                    }
                },
                Item::Terminate => self.inner.stop.set(true),
            }
        }
    }

    /// One processing cycle of the driving node, with buffer notifications
    /// routed along the rt link chain.
    fn process_cycle(&self) {
        let mut events = Vec::new();
        let driver = self.with_state(|state| {
            state.driver.and_then(|id| state.nodes.get(&id).map(|n| (id, n.process.clone())))
        });
        let Some((driver_id, process)) = driver else { return };

        let now_ns = u64::try_from(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos(),
        )
        .unwrap_or(u64::MAX);
        process.process(&mut RtContext { now_ns, events: &mut events });
        self.route(driver_id, &events);
    }

    /// Routes `have_buffer` / `reuse_buffer` events from `origin` to the
    /// peers reachable over the rt links. Touches only loop-owned lists.
    pub fn route(&self, origin: ObjectId, events: &[RtEvent]) {
        // Collect targets first so no state borrow is held across callbacks.
        let mut targets: Vec<(Arc<dyn RtProcess>, u32, u32, bool)> = Vec::new();
        self.with_state(|state| {
            for event in events {
                match *event {
                    RtEvent::HaveBuffer { direction: Direction::Output, port, buffer } => {
                        for link in &state.links {
                            if link.output == (origin, port) {
                                if let Some(peer) = state.nodes.get(&link.input.0) {
                                    targets.push((peer.process.clone(), link.input.1, buffer, true));
                                }
                            }
                        }
                    },
                    RtEvent::ReuseBuffer { direction: Direction::Input, port, buffer } => {
                        for link in &state.links {
                            if link.input == (origin, port) {
                                if let Some(peer) = state.nodes.get(&link.output.0) {
                                    targets
                                        .push((peer.process.clone(), link.output.1, buffer, false));
                                }
                            }
                        }
                    },
                    _ => {},
                }
            }
        });
        for (process, port, buffer, incoming) in targets {
            if incoming {
                process.receive_buffer(port, buffer);
            } else {
                process.recycle_buffer(port, buffer);
            }
        }
    }
}

struct HandleShared {
    loop_id: u64,
    producer: Mutex<rtrb::Producer<Item>>,
    efd: Arc<nix::sys::eventfd::EventFd>,
}

/// Cloneable sender side of the loop.
#[derive(Clone)]
pub struct DataLoopHandle {
    shared: Arc<HandleShared>,
}

impl DataLoopHandle {
    fn push(&self, item: Item) -> Result<()> {
        let mut producer = self
            .shared
            .producer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        producer
            .push(item)
            .map_err(|_| Error::NoMemory("data-loop invoke ring is full".into()))?;
        self.shared.efd.write(1)?;
        Ok(())
    }

    /// Runs `func` inline when called from the loop's own thread, after
    /// dispatching whatever is already queued. Leaves `slot` untouched
    /// otherwise.
    fn try_inline(&self, slot: &mut Option<InvokeFn>) -> bool {
        CURRENT.with(|current| {
            let ctx = current.borrow().clone();
            match ctx {
                Some(ctx) if ctx.id == self.shared.loop_id => {
                    let rt = RtLoop { inner: ctx };
                    rt.drain();
                    if let Some(func) = slot.take() {
                        func(&rt);
                    }
                    true
                },
                _ => false,
            }
        })
    }

    /// Fire-and-forget invoke.
    pub fn invoke(&self, func: InvokeFn) -> Result<()> {
        let mut slot = Some(func);
        if self.try_inline(&mut slot) {
            return Ok(());
        }
        let func = slot.take().unwrap_or_else(|| unreachable!());
        self.push(Item::Invoke { func, done: DoneAction::None })
    }

    /// Blocks until the loop executed `func`. Runs inline when already on
    /// the loop thread.
    pub fn invoke_sync(&self, func: InvokeFn) -> Result<()> {
        let mut slot = Some(func);
        if self.try_inline(&mut slot) {
            return Ok(());
        }
        let func = slot.take().unwrap_or_else(|| unreachable!());
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.push(Item::Invoke { func, done: DoneAction::Ack(tx) })?;
        rx.recv().map_err(|_| Error::Io(std::io::Error::other("data loop went away")))?;
        Ok(())
    }

    /// Async invoke: completion is reported as `(obj, seq)` through the
    /// completion channel, i.e. into the work queue.
    pub fn invoke_seq(&self, obj: ObjectId, seq: SeqId, func: InvokeFn) -> Result<()> {
        let mut slot = Some(func);
        let ran_inline = CURRENT.with(|current| {
            let ctx = current.borrow().clone();
            match ctx {
                Some(ctx) if ctx.id == self.shared.loop_id => {
                    let completions = ctx.completions.clone();
                    let rt = RtLoop { inner: ctx };
                    rt.drain();
                    if let Some(func) = slot.take() {
                        func(&rt);
                    }
                    let _ = completions.send(AsyncComplete { node: obj, seq, result: Ok(()) });
                    true
                },
                _ => false,
            }
        });
        if ran_inline {
            return Ok(());
        }
        let func = slot.take().unwrap_or_else(|| unreachable!());
        self.push(Item::Invoke { func, done: DoneAction::Complete { obj, seq } })
    }
}

/// The owning side: spawns the thread, joins it on shutdown.
pub struct DataLoop {
    handle: DataLoopHandle,
    join: Option<std::thread::JoinHandle<()>>,
}

static LOOP_IDS: AtomicU64 = AtomicU64::new(1);
const RING_CAPACITY: usize = 1024;

impl DataLoop {
    /// Starts the loop thread. Fatal when the thread cannot be spawned.
    pub fn spawn(completions: mpsc::UnboundedSender<AsyncComplete>) -> Result<Self> {
        use nix::sys::eventfd::{EfdFlags, EventFd};

        let loop_id = LOOP_IDS.fetch_add(1, Ordering::Relaxed);
        let (producer, consumer) = rtrb::RingBuffer::new(RING_CAPACITY);
        let efd = Arc::new(EventFd::from_value_and_flags(
            0,
            EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK,
        )?);

        let thread_efd = efd.clone();
        let join = std::thread::Builder::new()
            .name("patchbay-data".into())
            .spawn(move || run_loop(loop_id, consumer, thread_efd, completions))
            .map_err(Error::Io)?;

        let handle = DataLoopHandle {
            shared: Arc::new(HandleShared { loop_id, producer: Mutex::new(producer), efd }),
        };
        Ok(Self { handle, join: Some(join) })
    }

    pub fn handle(&self) -> DataLoopHandle {
        self.handle.clone()
    }

    /// Stops the loop and joins the thread.
    pub fn shutdown(&mut self) {
        if let Some(join) = self.join.take() {
            if self.handle.push(Item::Terminate).is_ok() {
                let _ = join.join();
            }
        }
    }
}

impl Drop for DataLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(
    id: u64,
    consumer: rtrb::Consumer<Item>,
    efd: Arc<nix::sys::eventfd::EventFd>,
    completions: mpsc::UnboundedSender<AsyncComplete>,
) {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use nix::sys::timerfd::{ClockId, TimerFd, TimerFlags};

    let timer = match TimerFd::new(
        ClockId::CLOCK_MONOTONIC,
        TimerFlags::TFD_CLOEXEC | TimerFlags::TFD_NONBLOCK,
    ) {
        Ok(timer) => timer,
        Err(err) => {
            tracing::error!(error = %err, "data loop cannot create its timer");
            return;
        },
    };

    let ctx = Rc::new(LoopCtx {
        id,
        state: RefCell::new(RtState::default()),
        consumer: RefCell::new(consumer),
        timer,
        completions,
        stop: Cell::new(false),
    });
    CURRENT.with(|current| *current.borrow_mut() = Some(ctx.clone()));
    tracing::debug!(loop_id = id, "data loop running");

    let rt = RtLoop { inner: ctx.clone() };
    while !ctx.stop.get() {
        let mut fds = [
            PollFd::new(efd.as_fd(), PollFlags::POLLIN),
            PollFd::new(ctx.timer.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {},
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => {
                tracing::error!(error = %err, "data loop poll failed, exiting");
                break;
            },
        }
        let ring_ready = fds[0].revents().is_some_and(|r| r.contains(PollFlags::POLLIN));
        let timer_ready = fds[1].revents().is_some_and(|r| r.contains(PollFlags::POLLIN));

        if ring_ready {
            let _ = efd.read();
            rt.drain();
        }
        if timer_ready && !ctx.stop.get() {
            // Consume the expiration count before processing.
            let _ = ctx.timer.wait();
            rt.process_cycle();
        }
    }

    CURRENT.with(|current| *current.borrow_mut() = None);
    tracing::debug!(loop_id = id, "data loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_loop() -> (DataLoop, mpsc::UnboundedReceiver<AsyncComplete>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (DataLoop::spawn(tx).unwrap(), rx)
    }

    #[test]
    fn sync_invoke_runs_on_the_loop_thread() {
        let (mut data_loop, _rx) = spawn_loop();
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        let main = std::thread::current().id();
        data_loop
            .handle()
            .invoke_sync(Box::new(move |_rt| {
                *seen_clone.lock().unwrap() = Some(std::thread::current().id());
            }))
            .unwrap();
        let tid = seen.lock().unwrap().take().unwrap();
        assert_ne!(tid, main);
        data_loop.shutdown();
    }

    #[test]
    fn recursive_invoke_runs_inline_without_deadlock() {
        let (mut data_loop, _rx) = spawn_loop();
        let handle = data_loop.handle();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        let inner_handle = handle.clone();
        handle
            .invoke_sync(Box::new(move |_rt| {
                o.lock().unwrap().push("outer-start");
                let o2 = o.clone();
                let deepest = inner_handle.clone();
                inner_handle
                    .invoke_sync(Box::new(move |_rt| {
                        o2.lock().unwrap().push("inner-start");
                        let o3 = o2.clone();
                        deepest
                            .invoke_sync(Box::new(move |_rt| {
                                o3.lock().unwrap().push("deepest");
                            }))
                            .unwrap();
                        o2.lock().unwrap().push("inner-end");
                    }))
                    .unwrap();
                o.lock().unwrap().push("outer-end");
            }))
            .unwrap();

        assert_eq!(
            *order.lock().unwrap(),
            vec!["outer-start", "inner-start", "deepest", "inner-end", "outer-end"]
        );
        data_loop.shutdown();
    }

    #[test]
    fn seq_invoke_reports_completion() {
        let (mut data_loop, mut rx) = spawn_loop();
        data_loop
            .handle()
            .invoke_seq(ObjectId(9), SeqId(4), Box::new(|_rt| {}))
            .unwrap();
        let done = rx.blocking_recv().unwrap();
        assert_eq!(done.node, ObjectId(9));
        assert_eq!(done.seq, SeqId(4));
        assert!(done.result.is_ok());
        data_loop.shutdown();
    }

    #[test]
    fn rt_links_are_spliced_and_unspliced() {
        let (mut data_loop, _rx) = spawn_loop();
        let handle = data_loop.handle();
        let link =
            RtLink { link: ObjectId(5), output: (ObjectId(1), 0), input: (ObjectId(2), 0) };
        handle.invoke_sync(Box::new(move |rt| rt.with_state(|s| s.add_link(link)))).unwrap();

        let count = Arc::new(Mutex::new(0usize));
        let c = count.clone();
        handle
            .invoke_sync(Box::new(move |rt| {
                *c.lock().unwrap() = rt.with_state(|s| s.links().len());
            }))
            .unwrap();
        assert_eq!(*count.lock().unwrap(), 1);

        handle
            .invoke_sync(Box::new(move |rt| rt.with_state(|s| s.remove_link(ObjectId(5)))))
            .unwrap();
        let c = count.clone();
        handle
            .invoke_sync(Box::new(move |rt| {
                *c.lock().unwrap() = rt.with_state(|s| s.links().len());
            }))
            .unwrap();
        assert_eq!(*count.lock().unwrap(), 0);
        data_loop.shutdown();
    }
}
