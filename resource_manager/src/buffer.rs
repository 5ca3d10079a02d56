// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-instance buffer queues.
//!
//! Source buffers enter the instance-wide ready queue and are handed to a core by moving them into
//! that core's local queue. A buffer lives in exactly one queue at a time. Whenever the core
//! assignment changes, buffers still waiting in core-local queues go back to the front of the
//! ready queue so they are re-claimed in sequence order.

use std::collections::VecDeque;

use crate::CoreId;
use crate::MAX_CORES;

/// A bitstream (decoder) or raw frame (encoder) buffer waiting for a core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrcBuffer {
    /// Index of the buffer in the client's buffer pool.
    pub index: u32,
    /// Sequence number assigned at queue time; decides the executing core in mode 2.
    pub src_index: u32,
    /// End of stream marker.
    pub last_frame: bool,
    // Queue order; unlike `src_index` it survives end of stream and renumbering.
    queued: u64,
}

/// An output buffer. Destination buffers stay instance-wide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DstBuffer {
    pub index: u32,
}

#[derive(Debug, Default)]
pub struct BufferQueues {
    ready: VecDeque<SrcBuffer>,
    core_src: [VecDeque<SrcBuffer>; MAX_CORES],
    dst: VecDeque<DstBuffer>,
    serial_src_index: u32,
    next_queued: u64,
    // Sequence number of the last source buffer a core started on.
    curr_src_index: Option<u32>,
}

impl BufferQueues {
    /// Appends a source buffer to the ready queue and returns its sequence number.
    pub fn queue_src(&mut self, index: u32, last_frame: bool) -> u32 {
        let src_index = self.serial_src_index;
        self.serial_src_index = self.serial_src_index.wrapping_add(1);
        let queued = self.next_queued;
        self.next_queued += 1;
        self.ready.push_back(SrcBuffer {
            index,
            src_index,
            last_frame,
            queued,
        });
        src_index
    }

    pub fn queue_dst(&mut self, index: u32) {
        self.dst.push_back(DstBuffer { index });
    }

    pub fn pop_dst(&mut self) -> Option<DstBuffer> {
        self.dst.pop_front()
    }

    pub fn ready_head(&self) -> Option<&SrcBuffer> {
        self.ready.front()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn core_count(&self, core: CoreId) -> usize {
        self.core_src.get(core.0).map_or(0, VecDeque::len)
    }

    pub fn dst_count(&self) -> usize {
        self.dst.len()
    }

    pub fn ready_indices(&self) -> Vec<u32> {
        self.ready.iter().map(|b| b.src_index).collect()
    }

    pub fn core_indices(&self, core: CoreId) -> Vec<u32> {
        self.core_src
            .get(core.0)
            .map(|q| q.iter().map(|b| b.src_index).collect())
            .unwrap_or_default()
    }

    pub fn serial_src_index(&self) -> u32 {
        self.serial_src_index
    }

    pub fn curr_src_index(&self) -> Option<u32> {
        self.curr_src_index
    }

    pub fn set_curr_src_index(&mut self, src_index: u32) {
        self.curr_src_index = Some(src_index);
    }

    /// Restarts numbering for buffers queued after an end of stream.
    pub fn reset_serial(&mut self) {
        self.serial_src_index = 0;
    }

    /// Moves the oldest ready buffer to the back of `core`'s queue and returns its sequence
    /// number.
    pub fn move_ready_head_to_core(&mut self, core: CoreId) -> Option<u32> {
        let queue = self.core_src.get_mut(core.0)?;
        let buf = self.ready.pop_front()?;
        let src_index = buf.src_index;
        queue.push_back(buf);
        Some(src_index)
    }

    /// Moves every ready buffer to the back of `core`'s queue, preserving order.
    pub fn move_all_ready_to_core(&mut self, core: CoreId) -> usize {
        let Some(queue) = self.core_src.get_mut(core.0) else {
            return 0;
        };
        let moved = self.ready.len();
        queue.extend(self.ready.drain(..));
        moved
    }

    /// Moves the buffers of the given cores' queues back to the front of the ready queue, in the
    /// order they were queued by the client.
    pub fn return_core_src_to_ready(&mut self, cores: &[CoreId]) -> usize {
        let mut returned: Vec<SrcBuffer> = Vec::new();
        for core in cores {
            if let Some(queue) = self.core_src.get_mut(core.0) {
                returned.extend(queue.drain(..));
            }
        }
        // Core-local buffers were all routed before anything still in the ready queue.
        returned.sort_by_key(|b| b.queued);
        let count = returned.len();
        for buf in returned.into_iter().rev() {
            self.ready.push_front(buf);
        }
        count
    }

    /// Moves the head of `from`'s queue to the front of `to`'s queue.
    pub fn move_core_head_to_core(&mut self, from: CoreId, to: CoreId) -> Option<u32> {
        if from == to || to.0 >= MAX_CORES {
            return None;
        }
        let buf = self.core_src.get_mut(from.0)?.pop_front()?;
        let src_index = buf.src_index;
        self.core_src[to.0].push_front(buf);
        Some(src_index)
    }

    /// Hands everything queued on `from` over to `to`, behind what `to` already holds.
    pub fn transfer_core_src(&mut self, from: CoreId, to: CoreId) -> usize {
        if from == to || from.0 >= MAX_CORES || to.0 >= MAX_CORES {
            return 0;
        }
        let moved: Vec<SrcBuffer> = self.core_src[from.0].drain(..).collect();
        let count = moved.len();
        self.core_src[to.0].extend(moved);
        count
    }

    /// Renumbers the ready queue from 0 so mode 2 round-robin restarts cleanly.
    pub fn renumber_ready(&mut self) {
        self.serial_src_index = 0;
        self.curr_src_index = None;
        for buf in self.ready.iter_mut() {
            buf.src_index = self.serial_src_index;
            self.serial_src_index += 1;
        }
    }

    /// Takes the next buffer `core` must execute. Used by the core command layer.
    pub fn pop_core_src(&mut self, core: CoreId) -> Option<SrcBuffer> {
        self.core_src.get_mut(core.0)?.pop_front()
    }
}
