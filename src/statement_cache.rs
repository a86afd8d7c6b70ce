//! Session statement cache
//!
//! Every distinct SQL text issued by the session core (locator procedures,
//! the message formatting procedure, application statements) is prepared
//! once and kept for the lifetime of the session. The cache hands a
//! statement out for the duration of one execution and takes it back
//! afterwards, so the session can keep mutable access to itself while the
//! statement is in flight.
//!
//! # Lifecycle
//!
//! - The first checkout of a SQL text allocates the next package section.
//! - A statement whose prepare failed comes back unprepared and is prepared
//!   again on its next use.
//! - Sections are never reused within a session; [`StatementCache::clear`]
//!   drops everything when the session is reset.

use indexmap::IndexMap;

use crate::statement::CallableStatement;

#[derive(Debug)]
struct CachedStatement {
    /// `None` while the statement is checked out
    statement: Option<CallableStatement>,
    section: u16,
    executions: u64,
}

/// One prepared statement per SQL text
#[derive(Debug)]
pub struct StatementCache {
    cache: IndexMap<String, CachedStatement>,
    next_section: u16,
    epoch: u64,
}

impl StatementCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self {
            cache: IndexMap::new(),
            next_section: 1,
            epoch: 0,
        }
    }

    /// Take the statement for `sql` out of the cache, creating it on first use
    ///
    /// A statement that is already checked out (a re-entrant call) gets a
    /// fresh unprepared copy on the same section.
    pub fn checkout(&mut self, sql: &str) -> CallableStatement {
        if let Some(cached) = self.cache.get_mut(sql) {
            cached.executions += 1;
            return match cached.statement.take() {
                Some(statement) => {
                    tracing::trace!(sql = sql, section = cached.section, "Statement cache hit");
                    statement
                }
                None => {
                    tracing::trace!(sql = sql, "Statement cache hit but in use, returning fresh");
                    CallableStatement::new(sql, cached.section)
                }
            };
        }

        let section = self.next_section;
        self.next_section = self.next_section.wrapping_add(1).max(1);
        tracing::trace!(sql = sql, section = section, "Statement cache miss");
        self.cache.insert(
            sql.to_string(),
            CachedStatement {
                statement: None,
                section,
                executions: 1,
            },
        );
        CallableStatement::new(sql, section)
    }

    /// Return a statement after use
    pub fn checkin(&mut self, mut statement: CallableStatement) {
        statement.clear_parameters();
        if let Some(cached) = self.cache.get_mut(statement.sql()) {
            if cached.statement.is_none() {
                cached.statement = Some(statement);
            }
        }
    }

    /// Whether `sql` has a prepared statement in the cache
    pub fn is_prepared(&self, sql: &str) -> bool {
        self.cache
            .get(sql)
            .and_then(|c| c.statement.as_ref())
            .map(CallableStatement::is_prepared)
            .unwrap_or(false)
    }

    /// Number of checkouts of `sql` so far
    pub fn executions(&self, sql: &str) -> u64 {
        self.cache.get(sql).map(|c| c.executions).unwrap_or(0)
    }

    /// Drop every cached statement
    pub fn clear(&mut self) {
        self.cache.clear();
        self.next_section = 1;
        self.epoch += 1;
        tracing::debug!("Statement cache cleared");
    }

    /// Bumped by every [`clear`](Self::clear)
    ///
    /// A statement checked out under an older epoch names a section the
    /// server no longer knows.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Number of distinct SQL texts
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new()
    }
}
