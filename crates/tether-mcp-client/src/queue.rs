//! Outbound frames held back while a connection is being (re)established

use std::collections::VecDeque;

use tether_mcp_json_rpc::RequestId;

use crate::error::{McpClientError, McpClientResult};

#[derive(Debug, Clone)]
pub(crate) struct QueuedFrame {
    /// Set for requests so teardown can find their pending entry
    pub id: Option<RequestId>,
    pub method: String,
    pub text: String,
}

/// Bounded FIFO; pushing onto a full queue fails instead of evicting
#[derive(Debug)]
pub(crate) struct OutboundQueue {
    frames: VecDeque<QueuedFrame>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            capacity,
        }
    }

    pub fn push(&mut self, frame: QueuedFrame) -> McpClientResult<()> {
        if self.frames.len() >= self.capacity {
            return Err(McpClientError::queue_full(self.capacity));
        }
        self.frames.push_back(frame);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<QueuedFrame> {
        self.frames.pop_front()
    }

    /// Put a frame back at the head after a failed flush
    pub fn push_front(&mut self, frame: QueuedFrame) {
        self.frames.push_front(frame);
    }

    /// Drop a queued request whose caller has gone away
    pub fn remove(&mut self, id: &RequestId) -> bool {
        let before = self.frames.len();
        self.frames
            .retain(|frame| frame.id.as_ref() != Some(id));
        self.frames.len() != before
    }

    pub fn drain(&mut self) -> Vec<QueuedFrame> {
        self.frames.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
