//! Multi-part message reassembly.
//!
//! Parts are filed under their message's correlation id and part number,
//! never by arrival order. A part seen again after a reconnect overwrites
//! its slot, and a message that was already emitted is never emitted again.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Remembered completed ids before the oldest is forgotten.
pub const COMPLETED_CAPACITY: usize = 1024;

/// Incomplete messages held at once. Past this the oldest one is dropped.
pub const PENDING_CAPACITY: usize = 256;

/// Position of one part inside a multi-part message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub correlation_id: String,
    /// 1-based.
    pub number: u32,
    pub total: u32,
}

/// One item received from a server stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPart<P> {
    pub chunk: Option<ChunkInfo>,
    pub payload: P,
}

impl<P> StreamPart<P> {
    pub fn single(payload: P) -> Self {
        Self { chunk: None, payload }
    }

    pub fn chunk(correlation_id: impl Into<String>, number: u32, total: u32, payload: P) -> Self {
        Self {
            chunk: Some(ChunkInfo {
                correlation_id: correlation_id.into(),
                number,
                total,
            }),
            payload,
        }
    }
}

/// A complete message, parts in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<P> {
    pub correlation_id: Option<String>,
    pub parts: Vec<P>,
}

struct Pending<P> {
    total: u32,
    parts: BTreeMap<u32, P>,
}

pub struct ChunkAssembler<P> {
    pending: HashMap<String, Pending<P>>,
    pending_order: VecDeque<String>,
    completed: HashSet<String>,
    completed_order: VecDeque<String>,
}

impl<P> Default for ChunkAssembler<P> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
            pending_order: VecDeque::new(),
            completed: HashSet::new(),
            completed_order: VecDeque::new(),
        }
    }
}

impl<P> ChunkAssembler<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// File one part. Returns the message it completes, if any.
    pub fn push(&mut self, part: StreamPart<P>) -> Option<Message<P>> {
        let Some(chunk) = part.chunk else {
            return Some(Message {
                correlation_id: None,
                parts: vec![part.payload],
            });
        };

        if self.completed.contains(&chunk.correlation_id) {
            tracing::trace!(correlation_id = %chunk.correlation_id, "Dropping part of completed message");
            return None;
        }
        if chunk.total <= 1 {
            self.mark_completed(chunk.correlation_id.clone());
            return Some(Message {
                correlation_id: Some(chunk.correlation_id),
                parts: vec![part.payload],
            });
        }
        if chunk.number == 0 || chunk.number > chunk.total {
            tracing::debug!(
                correlation_id = %chunk.correlation_id,
                number = chunk.number,
                total = chunk.total,
                "Ignoring part with out-of-range number"
            );
            return None;
        }

        if !self.pending.contains_key(&chunk.correlation_id) {
            self.make_room();
            self.pending_order.push_back(chunk.correlation_id.clone());
        }
        let pending = self
            .pending
            .entry(chunk.correlation_id.clone())
            .or_insert_with(|| Pending {
                total: chunk.total,
                parts: BTreeMap::new(),
            });
        if chunk.total != pending.total {
            tracing::warn!(
                correlation_id = %chunk.correlation_id,
                number = chunk.number,
                total = chunk.total,
                expected_total = pending.total,
                "Ignoring part with mismatched total"
            );
            return None;
        }
        pending.parts.insert(chunk.number, part.payload);
        if pending.parts.len() < pending.total as usize {
            return None;
        }

        let pending = self.pending.remove(&chunk.correlation_id)?;
        self.pending_order.retain(|id| id != &chunk.correlation_id);
        self.mark_completed(chunk.correlation_id.clone());
        Some(Message {
            correlation_id: Some(chunk.correlation_id),
            parts: pending.parts.into_values().collect(),
        })
    }

    /// Messages still waiting for parts.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn make_room(&mut self) {
        while self.pending.len() >= PENDING_CAPACITY {
            let Some(oldest) = self.pending_order.pop_front() else {
                break;
            };
            if let Some(dropped) = self.pending.remove(&oldest) {
                tracing::warn!(
                    correlation_id = %oldest,
                    received = dropped.parts.len(),
                    total = dropped.total,
                    "Dropping incomplete message"
                );
            }
        }
    }

    fn mark_completed(&mut self, id: String) {
        if self.completed.insert(id.clone()) {
            self.completed_order.push_back(id);
        }
        while self.completed_order.len() > COMPLETED_CAPACITY {
            if let Some(oldest) = self.completed_order.pop_front() {
                self.completed.remove(&oldest);
            }
        }
    }
}
