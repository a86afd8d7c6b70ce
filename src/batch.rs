//! Batch execution
//!
//! A batch runs one statement once per parameter set. The statement is
//! prepared in its own round trip; every set is then sent in a single
//! chain and the replies are read back in order.
//!
//! ```rust,no_run
//! use drda_client::{BatchBuilder, Connection, Value};
//!
//! # fn example(conn: Connection) -> drda_client::Result<()> {
//! let batch = BatchBuilder::new("INSERT INTO users (id, name) VALUES (?, ?)")
//!     .add_row(vec![Value::Integer(1), Value::from("Alice")])
//!     .add_row(vec![Value::Integer(2), Value::from("Bob")])
//!     .add_row(vec![Value::Integer(3), Value::from("Charlie")])
//!     .build();
//!
//! let result = conn.execute_batch(&batch)?;
//! println!("Rows affected per statement: {:?}", result.update_counts);
//! # Ok(())
//! # }
//! ```

use crate::constants::{EXECUTE_FAILED, SUCCESS_NO_INFO};
use crate::error::Result;
use crate::exception::{MessageId, SqlException};
use crate::types::Value;

/// Statement text plus the parameter sets to run it with
#[derive(Debug, Clone)]
pub struct BatchBinds {
    sql: String,
    parameter_sets: Vec<Vec<Value>>,
}

impl BatchBinds {
    /// Empty batch for `sql`
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            parameter_sets: Vec::new(),
        }
    }

    /// Append one parameter set
    pub fn push(&mut self, parameters: Vec<Value>) -> &mut Self {
        self.parameter_sets.push(parameters);
        self
    }

    /// Executions this batch will perform
    pub fn len(&self) -> usize {
        self.parameter_sets.len()
    }

    /// True when there is nothing to execute
    pub fn is_empty(&self) -> bool {
        self.parameter_sets.is_empty()
    }

    /// Parameters per set, taken from the first one
    pub fn width(&self) -> usize {
        self.parameter_sets.first().map_or(0, Vec::len)
    }

    /// Statement text
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Parameter sets in execution order
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.parameter_sets
    }

    /// Every set must be as wide as the first
    pub(crate) fn check_shape(&self) -> Result<()> {
        let width = self.width();
        match self
            .parameter_sets
            .iter()
            .position(|set| set.len() != width)
        {
            Some(index) => Err(SqlException::client(
                MessageId::InvalidApiParameter,
                [
                    self.parameter_sets[index].len().to_string(),
                    format!("width of batch element #{}", index),
                ],
            )
            .into()),
            None => Ok(()),
        }
    }
}

/// Fluent construction of [`BatchBinds`]
#[derive(Debug)]
pub struct BatchBuilder {
    binds: BatchBinds,
}

impl BatchBuilder {
    /// Start a batch for `sql`
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            binds: BatchBinds::new(sql),
        }
    }

    /// Append one parameter set
    pub fn add_row(mut self, parameters: Vec<Value>) -> Self {
        self.binds.push(parameters);
        self
    }

    /// Append several parameter sets
    pub fn add_rows<I>(mut self, sets: I) -> Self
    where
        I: IntoIterator<Item = Vec<Value>>,
    {
        for set in sets {
            self.binds.push(set);
        }
        self
    }

    /// Finish the batch
    pub fn build(self) -> BatchBinds {
        self.binds
    }
}

/// Result of a successful batch execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// Update count of each row, in row order
    ///
    /// [`SUCCESS_NO_INFO`] marks a row that succeeded without reporting a
    /// count.
    pub update_counts: Vec<i64>,
}

impl BatchResult {
    /// Create a batch result from per-row update counts
    pub fn new(update_counts: Vec<i64>) -> Self {
        Self { update_counts }
    }

    /// Total rows affected over the rows that reported a count
    pub fn total_rows_affected(&self) -> u64 {
        self.update_counts
            .iter()
            .filter(|c| **c >= 0)
            .map(|c| *c as u64)
            .sum()
    }

    /// Number of rows that succeeded without reporting a count
    pub fn no_info_count(&self) -> usize {
        self.update_counts
            .iter()
            .filter(|c| **c == SUCCESS_NO_INFO)
            .count()
    }
}

/// Indexes of the failed rows in the update counts of a batch failure
pub fn failed_rows(update_counts: &[i64]) -> Vec<usize> {
    update_counts
        .iter()
        .enumerate()
        .filter(|(_, c)| **c == EXECUTE_FAILED)
        .map(|(i, _)| i)
        .collect()
}
