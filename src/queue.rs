//! Planner-to-client action handoff.
//!
//! Single producer (the planning cycle) and single consumer (the browser
//! client's `next-action` poll). At most one action is in flight: an action
//! is popped here, delivered, and the queue stays untouched until the
//! matching `action-result` arrives.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::session::types::Action;

#[derive(Default)]
pub struct ActionQueue {
    inner: Mutex<VecDeque<Action>>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, action: Action) {
        self.inner.lock().push_back(action);
    }

    /// Remove and return the oldest queued action.
    pub fn pop(&self) -> Option<Action> {
        self.inner.lock().pop_front()
    }

    pub fn peek_id(&self) -> Option<webpilot_core_types::ActionId> {
        self.inner.lock().front().map(|action| action.id.clone())
    }

    /// Empty the queue, returning what was dropped. Used on cancel.
    pub fn drain(&self) -> Vec<Action> {
        self.inner.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
