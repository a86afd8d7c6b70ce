//! Callable statements
//!
//! A [`CallableStatement`] is a prepared SQL text bound to a package section
//! on the server. Input parameters are set by 1-based index, output
//! parameters are registered with their type, and each execution produces a
//! [`CallResults`] holding the values the server returned.

use crate::exception::{MessageId, SqlException, SqlResult};
use crate::types::{SqlType, Value};

/// A prepared call or statement
#[derive(Debug, Clone)]
pub struct CallableStatement {
    sql: String,
    section: u16,
    prepared: bool,
    params: Vec<Value>,
    out_types: Vec<Option<SqlType>>,
}

impl CallableStatement {
    /// Create an unprepared statement for `sql` in package section `section`
    pub fn new(sql: impl Into<String>, section: u16) -> Self {
        let sql = sql.into();
        let markers = parameter_count(&sql);
        Self {
            sql,
            section,
            prepared: false,
            params: vec![Value::Null; markers],
            out_types: vec![None; markers],
        }
    }

    /// SQL text
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Package section number identifying the statement on the server
    pub fn section(&self) -> u16 {
        self.section
    }

    /// Whether the server has accepted the prepare
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub(crate) fn mark_prepared(&mut self) {
        self.prepared = true;
    }

    /// Move to another section, keeping the bound values
    pub(crate) fn rebase(&mut self, section: u16) {
        self.section = section;
        self.prepared = false;
    }

    /// Number of parameter markers
    pub fn parameter_count(&self) -> usize {
        self.params.len()
    }

    fn slot(&self, index: usize) -> SqlResult<usize> {
        if index == 0 || index > self.params.len() {
            return Err(SqlException::client(
                MessageId::InvalidApiParameter,
                [index.to_string(), "parameterIndex".to_string()],
            ));
        }
        Ok(index - 1)
    }

    /// Bind any value to a 1-based parameter index
    pub fn set_value(&mut self, index: usize, value: impl Into<Value>) -> SqlResult<()> {
        let slot = self.slot(index)?;
        self.params[slot] = value.into();
        Ok(())
    }

    /// Bind an INTEGER
    pub fn set_int(&mut self, index: usize, value: i32) -> SqlResult<()> {
        self.set_value(index, value)
    }

    /// Bind a BIGINT
    pub fn set_long(&mut self, index: usize, value: i64) -> SqlResult<()> {
        self.set_value(index, value)
    }

    /// Bind a SMALLINT
    pub fn set_short(&mut self, index: usize, value: i16) -> SqlResult<()> {
        self.set_value(index, value)
    }

    /// Bind a VARCHAR
    pub fn set_string(&mut self, index: usize, value: &str) -> SqlResult<()> {
        self.set_value(index, value)
    }

    /// Bind binary data
    pub fn set_bytes(&mut self, index: usize, value: &[u8]) -> SqlResult<()> {
        self.set_value(index, value)
    }

    /// Register an output parameter
    pub fn register_out_parameter(&mut self, index: usize, sql_type: SqlType) -> SqlResult<()> {
        let slot = self.slot(index)?;
        self.out_types[slot] = Some(sql_type);
        Ok(())
    }

    /// Reset every input to NULL, keeping output registrations
    pub fn clear_parameters(&mut self) {
        for p in self.params.iter_mut() {
            *p = Value::Null;
        }
    }

    /// Input values in marker order; output-only slots are sent as NULL
    pub fn parameters(&self) -> &[Value] {
        &self.params
    }

    /// Registered output types in marker order
    pub fn out_types(&self) -> &[Option<SqlType>] {
        &self.out_types
    }

    /// Whether any output parameter is registered
    pub fn has_outputs(&self) -> bool {
        self.out_types.iter().any(Option::is_some)
    }
}

/// Count `?` markers outside quoted strings
fn parameter_count(sql: &str) -> usize {
    let mut count = 0;
    let mut in_quote = false;
    for c in sql.chars() {
        match c {
            '\'' => in_quote = !in_quote,
            '?' if !in_quote => count += 1,
            _ => {}
        }
    }
    count
}

/// Values returned by one execution
#[derive(Debug, Clone, Default)]
pub struct CallResults {
    update_count: i64,
    values: Vec<Value>,
}

impl CallResults {
    /// Create results from the row count and the returned parameter values
    pub fn new(update_count: i64, values: Vec<Value>) -> Self {
        Self {
            update_count,
            values,
        }
    }

    /// Rows affected, as reported by the server
    pub fn update_count(&self) -> i64 {
        self.update_count
    }

    fn value(&self, index: usize) -> SqlResult<&Value> {
        index
            .checked_sub(1)
            .and_then(|i| self.values.get(i))
            .ok_or_else(|| {
                SqlException::client(
                    MessageId::InvalidApiParameter,
                    [index.to_string(), "parameterIndex".to_string()],
                )
            })
    }

    /// Output value as i32; NULL reads as 0
    pub fn get_int(&self, index: usize) -> SqlResult<i32> {
        Ok(self.value(index)?.to_i32()?.unwrap_or(0))
    }

    /// Output value as i64; NULL reads as 0
    pub fn get_long(&self, index: usize) -> SqlResult<i64> {
        Ok(self.value(index)?.as_i64().unwrap_or(0))
    }

    /// Output value as i16; NULL reads as 0
    pub fn get_short(&self, index: usize) -> SqlResult<i16> {
        Ok(self.value(index)?.to_i16()?.unwrap_or(0))
    }

    /// Output value as a string; NULL reads as `None`
    pub fn get_string(&self, index: usize) -> SqlResult<Option<String>> {
        Ok(self.value(index)?.as_str().map(str::to_string))
    }

    /// Move binary output out of the results; NULL reads as `None`
    pub fn take_bytes(&mut self, index: usize) -> SqlResult<Option<Vec<u8>>> {
        self.value(index)?;
        Ok(self.values[index - 1].take_bytes())
    }

    /// Move string output out of the results; NULL reads as `None`
    pub fn take_string(&mut self, index: usize) -> SqlResult<Option<String>> {
        self.value(index)?;
        Ok(self.values[index - 1].take_string())
    }
}
