//! FIFO of launch requests waiting for the spawner

use std::collections::VecDeque;

use crate::request::LaunchRequest;

/// Requests that have not been sent to the spawner yet, oldest first
#[derive(Debug, Default)]
pub struct RequestQueue {
    pending: VecDeque<LaunchRequest>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: LaunchRequest) {
        self.pending.push_back(request);
    }

    pub fn pop(&mut self) -> Option<LaunchRequest> {
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
