//! Deduplicating pending/failed queue and the batching dispatcher policy.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

use log::debug;

use crate::entry::Entry;

struct State {
    pending: Vec<Entry>,
    pending_names: HashSet<String>,
    failed: Vec<Entry>,
    running_batches: usize,
}

/// Two FIFO queues guarded by one mutex, plus the dispatcher's running-batch
/// count and the condition variable that `wait_idle` blocks on. `pending`
/// never holds two entries with the same name (§8); `failed` is a graveyard
/// nothing ever drains automatically (§4.5, §9 open question).
pub struct TaskQueue {
    state: Mutex<State>,
    idle: Condvar,
    batch_size: usize,
}

impl TaskQueue {
    pub fn new(batch_size: usize) -> Self {
        TaskQueue {
            state: Mutex::new(State {
                pending: Vec::new(),
                pending_names: HashSet::new(),
                failed: Vec::new(),
                running_batches: 0,
            }),
            idle: Condvar::new(),
            batch_size,
        }
    }

    /// `enqueue(entry)` (§4.5 steps 1-4), running dispatcher policy `F(false)`.
    /// Returns a batch if this call is the one that triggers dispatch.
    pub fn enqueue(&self, entry: Entry) -> Option<Vec<Entry>> {
        self.enqueue_with_force(entry, false)
    }

    /// Same as `enqueue`, but runs `F(force=true)`, used when the caller
    /// (shutdown) needs every pending task drained regardless of batch size.
    pub fn enqueue_with_force(&self, entry: Entry, force: bool) -> Option<Vec<Entry>> {
        let mut state = self.state.lock().unwrap();
        if state.pending_names.insert(entry.name.clone()) {
            state.pending.push(entry);
        } else {
            debug!("dropping duplicate pending task for {}", entry.name);
        }
        self.dispatch_locked(&mut state, force)
    }

    /// Policy `F(force)` from §4.5: drain `pending` into a batch and count it
    /// as running when `force`, or the pending count reaches `batch_size`, or
    /// the pool is otherwise idle (`running_batches == 0`); the idle branch
    /// is what guarantees liveness when batches never fill up.
    fn dispatch_locked(&self, state: &mut State, force: bool) -> Option<Vec<Entry>> {
        if state.pending.is_empty() {
            return None;
        }
        let should_dispatch = force || state.pending.len() >= self.batch_size || state.running_batches == 0;
        if !should_dispatch {
            return None;
        }
        let batch: Vec<Entry> = state.pending.drain(..).collect();
        for task in &batch {
            state.pending_names.remove(&task.name);
        }
        state.running_batches += 1;
        Some(batch)
    }

    /// Called by a worker thread when it runs out of tasks without reaching
    /// `batch_size` or `force`; routes an unprocessable task to the graveyard.
    pub fn mark_failed(&self, entry: Entry) {
        self.state.lock().unwrap().failed.push(entry);
    }

    /// Called by a worker once it finishes the batch it was given: decrements
    /// `running_batches`, wakes `wait_idle` if the queue is now quiescent, and
    /// re-runs `F(false)` so any tasks that piled up while we were busy get
    /// picked up without waiting for another `enqueue`.
    pub fn batch_complete(&self) -> Option<Vec<Entry>> {
        let mut state = self.state.lock().unwrap();
        state.running_batches = state.running_batches.saturating_sub(1);
        let next = self.dispatch_locked(&mut state, false);
        if state.running_batches == 0 && state.pending.is_empty() {
            self.idle.notify_all();
        }
        next
    }

    /// Forces a flush of whatever is pending right now, regardless of batch
    /// size. Used by `shutdown(wait=true)`'s force-dispatch loop.
    pub fn force_flush(&self) -> Option<Vec<Entry>> {
        let mut state = self.state.lock().unwrap();
        self.dispatch_locked(&mut state, true)
    }

    /// Blocks until `running_batches == 0 ∧ pending.is_empty()`.
    pub fn wait_idle(&self) {
        let state = self.state.lock().unwrap();
        let _state = self
            .idle
            .wait_while(state, |s| s.running_batches > 0 || !s.pending.is_empty())
            .unwrap();
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.running_batches == 0 && state.pending.is_empty()
    }

    pub fn failed_snapshot(&self) -> Vec<Entry> {
        self.state.lock().unwrap().failed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> Entry {
        Entry::pending(name, false)
    }

    #[test]
    fn pending_never_holds_two_tasks_for_the_same_name() {
        let queue = TaskQueue::new(20);
        queue.enqueue(entry("/tmp/x"));
        queue.enqueue(entry("/tmp/x"));
        assert_eq!(queue.pending_len(), 1);
    }

    #[test]
    fn idle_pool_dispatches_immediately() {
        let queue = TaskQueue::new(20);
        let batch = queue.enqueue(entry("/tmp/x"));
        assert_eq!(batch.unwrap().len(), 1);
    }

    #[test]
    fn batch_size_triggers_dispatch_even_when_busy() {
        let queue = TaskQueue::new(2);
        // Force running_batches to 1 by dispatching one batch that never completes.
        let first = queue.enqueue(entry("/tmp/a"));
        assert!(first.is_some());
        // Now the pool is "busy" (running_batches == 1); queue two more without
        // completing the first, and batch_size should still trigger dispatch.
        assert!(queue.enqueue(entry("/tmp/b")).is_none());
        let batch = queue.enqueue(entry("/tmp/c"));
        assert_eq!(batch.unwrap().len(), 2);
    }

    #[test]
    fn force_flush_drains_regardless_of_size() {
        let queue = TaskQueue::new(20);
        let first = queue.enqueue(entry("/tmp/a"));
        assert!(first.is_some());
        queue.enqueue_with_force(entry("/tmp/b"), false);
        let flushed = queue.force_flush();
        assert_eq!(flushed.unwrap().len(), 1);
    }

    #[test]
    fn failed_tasks_accumulate_without_retry() {
        let queue = TaskQueue::new(20);
        queue.mark_failed(entry("/tmp/gone"));
        assert_eq!(queue.failed_snapshot().len(), 1);
        assert_eq!(queue.pending_len(), 0);
    }
}
