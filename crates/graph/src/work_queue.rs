// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Deferred work with async-sequence completion.
//!
//! The queue serializes continuations behind in-flight plugin operations.
//! Items parked on a sequence number stay queued until `complete` marks them;
//! `WAIT_SYNC` items act as barriers: they run only once they reach the head
//! of the queue, after everything inserted before them has drained.

use patchbay_core::{ObjectId, SeqId};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// Result delivered to a continuation.
pub type AsyncResult = Result<(), String>;

/// Continuation stored on the queue. Runs against the owning state `C`.
pub type WorkFn<C> = Box<dyn FnOnce(&mut C, AsyncResult) + Send>;

/// Identifies one queued item, for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkId(pub u32);

/// How an item enters the queue.
pub enum WorkInput {
    /// Ready to run on the next drain.
    Done(AsyncResult),
    /// Parked until `complete` is called for this sequence.
    Async(SeqId),
    /// Barrier: runs only at the head of the queue.
    WaitSync,
}

enum Pending {
    Ready(AsyncResult),
    Awaiting(SeqId),
    WaitSync,
}

struct WorkItem<C> {
    id: WorkId,
    obj: ObjectId,
    pending: Pending,
    func: Option<WorkFn<C>>,
}

/// The deferred-work queue. One per graph actor.
pub struct WorkQueue<C> {
    items: VecDeque<WorkItem<C>>,
    counter: u32,
    notify: Arc<Notify>,
}

impl<C> Default for WorkQueue<C> {
    fn default() -> Self {
        Self { items: VecDeque::new(), counter: 0, notify: Arc::new(Notify::new()) }
    }
}

impl<C> WorkQueue<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The wakeup the owner should select on; signalled whenever a drain may
    /// make progress.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Queues `func` for `obj`. Returns the item id.
    pub fn add(&mut self, obj: ObjectId, input: WorkInput, func: WorkFn<C>) -> WorkId {
        self.counter = self.counter.wrapping_add(1);
        let id = WorkId(self.counter);
        let (pending, wake) = match input {
            WorkInput::Done(res) => (Pending::Ready(res), true),
            WorkInput::Async(seq) => {
                tracing::trace!(obj = %obj, seq = %seq, "defer async work");
                (Pending::Awaiting(seq), false)
            },
            WorkInput::WaitSync => (Pending::WaitSync, true),
        };
        self.items.push_back(WorkItem { id, obj, pending, func: Some(func) });
        if wake {
            self.notify.notify_one();
        }
        id
    }

    /// Marks all items parked on `(obj, seq)` as ready with `res`.
    ///
    /// Returns true when at least one item matched.
    pub fn complete(&mut self, obj: ObjectId, seq: SeqId, res: &AsyncResult) -> bool {
        let mut matched = false;
        for item in &mut self.items {
            if item.obj == obj && matches!(item.pending, Pending::Awaiting(s) if s == seq) {
                item.pending = Pending::Ready(res.clone());
                matched = true;
            }
        }
        if matched {
            self.notify.notify_one();
        }
        matched
    }

    /// Disarms matching items: they drain without running their continuation.
    ///
    /// `obj = None` matches every object; `id = None` matches every item of
    /// the object.
    pub fn cancel(&mut self, obj: Option<ObjectId>, id: Option<WorkId>) {
        let mut touched = false;
        for item in &mut self.items {
            let obj_match = obj.is_none_or(|o| item.obj == o);
            let id_match = id.is_none_or(|i| item.id == i);
            if obj_match && id_match {
                item.func = None;
                item.pending = Pending::Ready(Ok(()));
                touched = true;
            }
        }
        if touched {
            self.notify.notify_one();
        }
    }

    /// Removes and returns every item allowed to run right now, in insertion
    /// order.
    ///
    /// Items still awaiting a sequence are skipped; a `WAIT_SYNC` item is
    /// only released when nothing remains queued before it.
    pub fn take_ready(&mut self) -> Vec<(ObjectId, AsyncResult, WorkFn<C>)> {
        let mut ready = Vec::new();
        let mut skipped = false;
        let mut index = 0;
        while index < self.items.len() {
            let release = match &self.items[index].pending {
                Pending::Ready(_) => true,
                Pending::Awaiting(_) => false,
                Pending::WaitSync => !skipped,
            };
            if !release {
                skipped = true;
                index += 1;
                continue;
            }
            let mut item = self.items.remove(index).unwrap_or_else(|| unreachable!());
            let res = match std::mem::replace(&mut item.pending, Pending::WaitSync) {
                Pending::Ready(res) => res,
                Pending::WaitSync => Ok(()),
                Pending::Awaiting(_) => unreachable!(),
            };
            if let Some(func) = item.func.take() {
                ready.push((item.obj, res, func));
            }
        }
        ready
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = Vec<String>;

    fn record(tag: &str) -> WorkFn<Log> {
        let tag = tag.to_string();
        Box::new(move |log: &mut Log, res| {
            log.push(format!("{tag}:{}", if res.is_ok() { "ok" } else { "err" }));
        })
    }

    fn drain(queue: &mut WorkQueue<Log>, log: &mut Log) {
        for (_, res, func) in queue.take_ready() {
            func(log, res);
        }
    }

    #[test]
    fn ready_items_run_in_insertion_order() {
        let mut queue = WorkQueue::new();
        let mut log = Log::new();
        queue.add(ObjectId(1), WorkInput::Done(Ok(())), record("a"));
        queue.add(ObjectId(1), WorkInput::Done(Ok(())), record("b"));
        drain(&mut queue, &mut log);
        assert_eq!(log, vec!["a:ok", "b:ok"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn wait_sync_releases_only_at_the_head() {
        let mut queue = WorkQueue::new();
        let mut log = Log::new();
        let obj = ObjectId(7);
        queue.add(obj, WorkInput::Async(SeqId(11)), record("async"));
        queue.add(obj, WorkInput::WaitSync, record("sync"));
        queue.add(obj, WorkInput::Done(Ok(())), record("tail"));

        // The async item blocks the barrier; the tail may still run.
        drain(&mut queue, &mut log);
        assert_eq!(log, vec!["tail:ok"]);
        assert_eq!(queue.len(), 2);

        assert!(queue.complete(obj, SeqId(11), &Ok(())));
        drain(&mut queue, &mut log);
        assert_eq!(log, vec!["tail:ok", "async:ok", "sync:ok"]);
    }

    #[test]
    fn complete_matches_object_and_sequence() {
        let mut queue = WorkQueue::new();
        queue.add(ObjectId(1), WorkInput::Async(SeqId(5)), record("x"));
        assert!(!queue.complete(ObjectId(2), SeqId(5), &Ok(())));
        assert!(!queue.complete(ObjectId(1), SeqId(6), &Ok(())));
        assert!(queue.complete(ObjectId(1), SeqId(5), &Err("boom".into())));

        let mut log = Log::new();
        drain(&mut queue, &mut log);
        assert_eq!(log, vec!["x:err"]);
    }

    #[test]
    fn cancelled_items_drain_silently() {
        let mut queue = WorkQueue::new();
        let mut log = Log::new();
        let id = queue.add(ObjectId(3), WorkInput::Async(SeqId(9)), record("gone"));
        queue.add(ObjectId(3), WorkInput::Done(Ok(())), record("kept"));
        queue.cancel(Some(ObjectId(3)), Some(id));
        drain(&mut queue, &mut log);
        assert_eq!(log, vec!["kept:ok"]);
        assert!(queue.is_empty());
    }
}
