/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Resend range chunking and completion tracking.
//!
//! Counterparties and intermediary infrastructure impose burst limits, so a
//! large resend range is split into bounded sub-ranges. Each chunk is
//! independently serviceable: a dropped chunk only needs that chunk
//! re-requested, not the whole range. Chunks are issued in ascending order
//! but may complete out of order; the chunker tracks completion per
//! outstanding request.

use gapless_core::types::SeqRange;
use std::collections::HashMap;
use std::fmt;

/// Identifier of one outstanding resend request plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    /// Returns the raw identifier value.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resend-{}", self.0)
    }
}

/// One planned resend request: its range, chunks, and per-chunk completion.
#[derive(Debug, Clone)]
struct ResendPlan {
    range: SeqRange,
    chunks: Vec<SeqRange>,
    serviced: Vec<bool>,
}

/// Plans and tracks chunked resend requests.
#[derive(Debug)]
pub struct ResendChunker {
    chunk_size: u32,
    next_id: u64,
    plans: HashMap<RequestId, ResendPlan>,
}

impl ResendChunker {
    /// Creates a chunker with the configured chunk size.
    ///
    /// # Arguments
    /// * `chunk_size` - Maximum sequence slots per chunk; 0 means unbounded
    ///   (one chunk covering the whole range)
    #[must_use]
    pub fn new(chunk_size: u32) -> Self {
        Self {
            chunk_size,
            next_id: 1,
            plans: HashMap::new(),
        }
    }

    /// Returns the configured chunk size.
    #[must_use]
    pub const fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Splits a range into ascending chunks of at most `chunk_size` slots.
    ///
    /// A `chunk_size` of 0 yields a single chunk covering the whole range.
    #[must_use]
    pub fn split(range: SeqRange, chunk_size: u32) -> Vec<SeqRange> {
        if range.is_empty() {
            return vec![];
        }
        if chunk_size == 0 {
            return vec![range];
        }

        let step = u64::from(chunk_size);
        let mut chunks = Vec::new();
        let mut begin = range.begin;
        while begin <= range.end {
            let end = range.end.min(begin + step - 1);
            chunks.push(SeqRange::new(begin, end));
            begin = end + 1;
        }
        chunks
    }

    /// Registers a new plan covering `range` and returns its id.
    pub fn plan(&mut self, range: SeqRange) -> RequestId {
        let id = RequestId(self.next_id);
        self.next_id += 1;

        let chunks = Self::split(range, self.chunk_size);
        let serviced = vec![false; chunks.len()];
        self.plans.insert(
            id,
            ResendPlan {
                range,
                chunks,
                serviced,
            },
        );
        id
    }

    /// Returns the chunks of a plan, ascending.
    #[must_use]
    pub fn chunks(&self, id: RequestId) -> Option<&[SeqRange]> {
        self.plans.get(&id).map(|plan| plan.chunks.as_slice())
    }

    /// Returns the overall range of a plan.
    #[must_use]
    pub fn range(&self, id: RequestId) -> Option<SeqRange> {
        self.plans.get(&id).map(|plan| plan.range)
    }

    /// Returns the lowest-index chunk that has not been serviced yet.
    #[must_use]
    pub fn first_outstanding(&self, id: RequestId) -> Option<(usize, SeqRange)> {
        let plan = self.plans.get(&id)?;
        plan.serviced
            .iter()
            .position(|done| !done)
            .map(|idx| (idx, plan.chunks[idx]))
    }

    /// Marks one chunk as fully serviced (every record sent or gap-filled).
    /// Chunks may be marked in any order.
    pub fn mark_serviced(&mut self, id: RequestId, chunk_index: usize) {
        if let Some(plan) = self.plans.get_mut(&id)
            && let Some(flag) = plan.serviced.get_mut(chunk_index)
        {
            *flag = true;
        }
    }

    /// Marks every chunk that ends at or below `seq` as serviced. Used when
    /// in-order delivery has caught up through `seq`.
    pub fn mark_through(&mut self, id: RequestId, seq: u64) {
        if let Some(plan) = self.plans.get_mut(&id) {
            for (chunk, flag) in plan.chunks.iter().zip(plan.serviced.iter_mut()) {
                if chunk.end <= seq {
                    *flag = true;
                }
            }
        }
    }

    /// Returns true if every chunk of the plan has been serviced.
    ///
    /// Unknown ids report false.
    #[must_use]
    pub fn is_complete(&self, id: RequestId) -> bool {
        self.plans
            .get(&id)
            .is_some_and(|plan| plan.serviced.iter().all(|done| *done))
    }

    /// Abandons a plan (supersession or completion). Returns true if the
    /// plan existed.
    pub fn abandon(&mut self, id: RequestId) -> bool {
        self.plans.remove(&id).is_some()
    }

    /// Number of plans currently outstanding.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.plans.len()
    }
}
