//! Read-chain exception accumulation
//!
//! Exceptions found while reading the replies of one chain are collected in
//! an [`ExceptionAccumulator`] and raised together at the end of the chain.
//! Exceptions raised where nothing can propagate them wait in a
//! [`DeferredQueue`] until the next call that can.

use std::collections::VecDeque;

use crate::constants::EXECUTE_FAILED;
use crate::exception::{SqlException, SqlResult};

#[derive(Debug)]
struct BatchTracker {
    failed: Vec<bool>,
    current: usize,
}

/// Per-session collector for exceptions observed while reading replies
#[derive(Debug, Default)]
pub struct ExceptionAccumulator {
    head: Option<SqlException>,
    batch: Option<BatchTracker>,
    chain_breaking: bool,
}

impl ExceptionAccumulator {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget anything accumulated; called at the start of every read chain
    pub fn reset(&mut self) {
        if let Some(dropped) = self.head.take() {
            tracing::debug!(
                sql_state = dropped.sql_state(),
                "Discarding exceptions left over from previous read chain"
            );
        }
        self.chain_breaking = false;
    }

    /// Whether anything is waiting to be raised
    pub fn has_accumulated(&self) -> bool {
        self.head.is_some()
    }

    /// Whether a chain-breaking exception was raised in this read chain
    pub fn is_chain_breaking(&self) -> bool {
        self.chain_breaking
    }

    /// Append an exception chain, labeling it when a batch is tracked
    pub fn accumulate(&mut self, mut exception: SqlException) {
        if let Some(batch) = self.batch.as_mut() {
            if let Some(slot) = batch.failed.get_mut(batch.current) {
                *slot = true;
            }
            exception.label_batch(batch.current);
        }
        tracing::trace!(
            sql_state = exception.sql_state(),
            code = exception.error_code(),
            "Accumulated read exception"
        );
        match self.head.as_mut() {
            Some(head) => head.append(exception),
            None => self.head = Some(exception),
        }
    }

    /// Put a session-ending exception in front of everything accumulated
    ///
    /// The accumulator is left empty. The returned chain must be raised.
    #[must_use]
    pub fn accumulate_chain_breaking(&mut self, mut exception: SqlException) -> SqlException {
        if let Some(previous) = self.head.take() {
            exception.append(previous);
        }
        self.chain_breaking = true;
        tracing::debug!(
            sql_state = exception.sql_state(),
            "Chain-breaking exception raised"
        );
        exception
    }

    /// Raise the accumulated chain, if any, leaving the accumulator empty
    pub fn check_for_accumulated(&mut self) -> SqlResult<()> {
        match self.head.take() {
            Some(head) => Err(head),
            None => Ok(()),
        }
    }

    /// Start tracking a batch of `size` elements
    pub fn begin_batch(&mut self, size: usize) {
        self.batch = Some(BatchTracker {
            failed: vec![false; size],
            current: 0,
        });
    }

    /// Set the batch element whose replies are being read
    pub fn set_batch_index(&mut self, index: usize) {
        if let Some(batch) = self.batch.as_mut() {
            batch.current = index;
        }
    }

    /// Whether a batch is being tracked
    pub fn is_batching(&self) -> bool {
        self.batch.is_some()
    }

    /// Stop tracking the batch without reporting it
    pub fn cancel_batch(&mut self) {
        self.batch = None;
    }

    /// Stop tracking the batch and report its outcome
    ///
    /// Every failed slot in `update_counts` is forced to
    /// [`EXECUTE_FAILED`]. When `chain` is empty and nothing was accumulated
    /// the batch succeeded; otherwise a non-atomic batch failure carrying the
    /// counts and the exceptions (chain first) is returned.
    pub fn end_batch(
        &mut self,
        update_counts: &mut [i64],
        chain: Option<SqlException>,
    ) -> SqlResult<()> {
        if let Some(batch) = self.batch.take() {
            for (count, failed) in update_counts.iter_mut().zip(batch.failed) {
                if failed {
                    *count = EXECUTE_FAILED;
                }
            }
        }

        let chain = match (chain, self.head.take()) {
            (Some(mut first), Some(rest)) => {
                first.append(rest);
                Some(first)
            }
            (Some(first), None) => Some(first),
            (None, rest) => rest,
        };

        match chain {
            None => Ok(()),
            Some(chain) => Err(SqlException::batch_failure(
                update_counts.to_vec(),
                Some(chain),
            )),
        }
    }
}

/// Exceptions waiting for a call that can raise them
#[derive(Debug, Default)]
pub struct DeferredQueue {
    pending: VecDeque<SqlException>,
}

impl DeferredQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an exception
    pub fn push(&mut self, exception: SqlException) {
        tracing::debug!(
            sql_state = exception.sql_state(),
            pending = self.pending.len() + 1,
            "Deferring exception"
        );
        self.pending.push_back(exception);
    }

    /// Number of queued exceptions
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take everything queued as one chain, oldest first
    pub fn drain(&mut self) -> Option<SqlException> {
        let mut head: Option<SqlException> = None;
        while let Some(next) = self.pending.pop_front() {
            match head.as_mut() {
                Some(h) => h.append(next),
                None => head = Some(next),
            }
        }
        head
    }

    /// Raise the queued chain, if any
    pub fn check(&mut self) -> SqlResult<()> {
        match self.drain() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drop everything queued
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
