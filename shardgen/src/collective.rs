//! In-process ring collectives
//!
//! The devices of a replica group form a ring: worker `i` sends to
//! `(i + 1) % n` and receives from `(i + n - 1) % n`. Both collectives move
//! data in `n - 1` steps of one chunk per worker, the same pattern a
//! bandwidth-optimal implementation uses over a real interconnect.
//!
//! 1. **All-gather**: every worker forwards the block it received last
//! 2. **All-reduce**: reduce-scatter (accumulate one chunk per worker)
//!    followed by all-gather of the reduced chunks

#![allow(clippy::needless_range_loop)]

use crate::errors::{EngineError, Result};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Phase of a ring collective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RingPhase {
    /// Each worker accumulates partial sums of one chunk
    ReduceScatter,
    /// Workers exchange finished chunks
    AllGather,
}

/// Range of chunk `idx` when `len` elements are split into exactly `n` chunks
///
/// The first `len % n` chunks get one extra element; chunks may be empty.
fn chunk_range(len: usize, n: usize, idx: usize) -> (usize, usize) {
    let base = len / n;
    let rem = len % n;
    let start = idx * base + idx.min(rem);
    let size = base + usize::from(idx < rem);
    (start, start + size)
}

/// Split flat data into exactly `n` chunks
fn split_chunks(data: &[f32], n: usize) -> Vec<Vec<f32>> {
    (0..n)
        .map(|i| {
            let (start, end) = chunk_range(data.len(), n, i);
            data[start..end].to_vec()
        })
        .collect()
}

/// All-gather blocks around the ring
///
/// `blocks[i]` is worker `i`'s local block. Returns one tensor per worker,
/// each the concatenation of all blocks along `axis` in worker order.
pub fn ring_all_gather(blocks: Vec<Tensor>, axis: usize) -> Result<Vec<Tensor>> {
    let n = blocks.len();
    if n == 0 {
        return Err(EngineError::InvalidArgument(
            "All-gather needs at least one worker".to_string(),
        ));
    }
    if n == 1 {
        return Ok(blocks);
    }

    // slots[worker][block]
    let mut slots: Vec<Vec<Option<Tensor>>> = (0..n)
        .map(|w| {
            let mut s = vec![None; n];
            s[w] = Some(blocks[w].clone());
            s
        })
        .collect();

    for step in 0..(n - 1) {
        let outgoing: Vec<(usize, Option<Tensor>)> = (0..n)
            .map(|worker| {
                let send_idx = (worker + n - step) % n;
                (send_idx, slots[worker][send_idx].clone())
            })
            .collect();

        for worker in 0..n {
            let left = (worker + n - 1) % n;
            let (idx, block) = &outgoing[left];
            trace!(
                phase = ?RingPhase::AllGather,
                step,
                worker,
                block = idx,
                "Received block from left neighbor"
            );
            slots[worker][*idx] = block.clone();
        }
    }

    slots
        .into_iter()
        .map(|worker_slots| {
            let parts = worker_slots
                .into_iter()
                .collect::<Option<Vec<Tensor>>>()
                .ok_or_else(|| EngineError::Sharding("All-gather left a block missing".to_string()))?;
            Tensor::concat(axis, &parts)
        })
        .collect()
}

/// Sum partial results around the ring
///
/// Every partial must have the same shape. Returns one tensor per worker;
/// all are identical and equal to the element-wise sum.
pub fn ring_all_reduce(partials: Vec<Tensor>) -> Result<Vec<Tensor>> {
    let n = partials.len();
    let first = partials.first().ok_or_else(|| {
        EngineError::InvalidArgument("All-reduce needs at least one worker".to_string())
    })?;
    let shape = first.shape.clone();

    if let Some(bad) = partials.iter().find(|p| p.shape != shape) {
        return Err(EngineError::Shape(format!(
            "All-reduce partial shape {:?} doesn't match {:?}",
            bad.shape, shape
        )));
    }
    if n == 1 {
        return Ok(partials);
    }

    let mut chunks: Vec<Vec<Vec<f32>>> = partials.iter().map(|p| split_chunks(&p.data, n)).collect();

    // Phase 1: reduce-scatter
    for step in 0..(n - 1) {
        let outgoing: Vec<Vec<f32>> = (0..n)
            .map(|worker| {
                let send_idx = (worker + n - step) % n;
                chunks[worker][send_idx].clone()
            })
            .collect();

        for worker in 0..n {
            let recv_idx = (worker + n - step - 1) % n;
            let left = (worker + n - 1) % n;
            trace!(phase = ?RingPhase::ReduceScatter, step, worker, chunk = recv_idx, "Accumulating chunk");
            for (acc, v) in chunks[worker][recv_idx].iter_mut().zip(&outgoing[left]) {
                *acc += v;
            }
        }
    }

    // Phase 2: all-gather
    for step in 0..(n - 1) {
        let outgoing: Vec<Vec<f32>> = (0..n)
            .map(|worker| {
                let send_idx = (worker + n - step + 1) % n;
                chunks[worker][send_idx].clone()
            })
            .collect();

        for worker in 0..n {
            let recv_idx = (worker + n - step) % n;
            let left = (worker + n - 1) % n;
            trace!(phase = ?RingPhase::AllGather, step, worker, chunk = recv_idx, "Copying chunk");
            chunks[worker][recv_idx] = outgoing[left].clone();
        }
    }

    chunks
        .into_iter()
        .map(|worker_chunks| Tensor::new(worker_chunks.concat(), shape.clone()))
        .collect()
}
