//! Key range boundaries
//!
//! A [`KeyBoundary`] describes the key range of one table transfer: optional
//! start and end tuples, whether iteration is scoped to one partition at a
//! time, an optional restart checkpoint, and the cursor within the current
//! partition. It is an immutable value; advancing the cursor returns a new
//! boundary.
//!
//! Lower-bound inclusivity:
//! - explicit start keys are inclusive, on the first fetch of each partition
//! - a restart checkpoint is exclusive; its row was already committed
//! - every later fetch is exclusive of the previous batch's last row

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use crate::checkpoint::Checkpoint;
use crate::error::{Error, Result};
use crate::predicate::{lexicographic, Bound, Predicate};
use crate::types::{KeyTuple, Value};

/// Lower bound of the next fetch within a partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    /// From the beginning of the partition
    Unbounded,
    /// At or after the tuple
    From(KeyTuple),
    /// Strictly after the tuple
    After(KeyTuple),
}

/// Composite key range of one transfer
#[derive(Debug, Clone)]
pub struct KeyBoundary {
    key_columns: Arc<[String]>,
    start: Option<KeyTuple>,
    end: Option<KeyTuple>,
    partition_scoped: bool,
    restart: Option<Checkpoint>,
    partition: u32,
    cursor: Cursor,
}

impl KeyBoundary {
    /// Create an unbounded range over `key_columns`.
    ///
    /// Fails when no key column is given or a column is repeated.
    pub fn new(key_columns: Vec<String>) -> Result<Self> {
        if key_columns.is_empty() {
            return Err(Error::config("at least one key column is required"));
        }
        let mut seen = HashSet::new();
        for column in &key_columns {
            if !seen.insert(column.to_lowercase()) {
                return Err(Error::config(format!(
                    "key column '{}' listed more than once",
                    column
                )));
            }
        }
        Ok(Self {
            key_columns: key_columns.into(),
            start: None,
            end: None,
            partition_scoped: false,
            restart: None,
            partition: 1,
            cursor: Cursor::Unbounded,
        })
    }

    /// Inclusive lower bound applied to the first fetch of every partition
    pub fn with_start(mut self, start: KeyTuple) -> Result<Self> {
        self.check_width("start", &start)?;
        if let Some(end) = &self.end {
            if start.cmp_prefix(end) == Ordering::Greater {
                return Err(Error::config(format!(
                    "start keys {} are after end keys {}",
                    start, end
                )));
            }
        }
        self.cursor = Cursor::From(start.clone());
        self.start = Some(start);
        Ok(self)
    }

    /// Inclusive upper bound of the whole transfer
    pub fn with_end(mut self, end: KeyTuple) -> Result<Self> {
        self.check_width("end", &end)?;
        if let Some(start) = &self.start {
            if start.cmp_prefix(&end) == Ordering::Greater {
                return Err(Error::config(format!(
                    "start keys {} are after end keys {}",
                    start, end
                )));
            }
        }
        self.end = Some(end);
        Ok(self)
    }

    /// Restrict every fetch to one partition at a time
    pub fn with_partition_scoping(mut self, scoped: bool) -> Self {
        self.partition_scoped = scoped;
        self
    }

    /// Resume after a committed checkpoint
    pub fn with_restart(mut self, checkpoint: Checkpoint) -> Result<Self> {
        self.check_width("restart", &checkpoint.keys)?;
        self.restart = Some(checkpoint);
        Ok(self)
    }

    fn check_width(&self, what: &str, tuple: &KeyTuple) -> Result<()> {
        if tuple.is_empty() || tuple.len() > self.key_columns.len() {
            return Err(Error::config(format!(
                "{} keys have {} values but the key has {} columns",
                what,
                tuple.len(),
                self.key_columns.len()
            )));
        }
        Ok(())
    }

    /// Key column names, most significant first
    #[inline]
    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }

    /// Start tuple, if any
    #[inline]
    pub fn start(&self) -> Option<&KeyTuple> {
        self.start.as_ref()
    }

    /// End tuple, if any
    #[inline]
    pub fn end(&self) -> Option<&KeyTuple> {
        self.end.as_ref()
    }

    /// Restart checkpoint, if any
    #[inline]
    pub fn restart(&self) -> Option<&Checkpoint> {
        self.restart.as_ref()
    }

    /// Whether fetches are scoped to a single partition
    #[inline]
    pub fn is_partition_scoped(&self) -> bool {
        self.partition_scoped
    }

    /// Current partition number
    #[inline]
    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Current cursor
    #[inline]
    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    /// True until a batch has been drawn from the current starting position
    pub fn is_first_fetch(&self) -> bool {
        !matches!(self.cursor, Cursor::After(_))
    }

    /// Position the boundary at the start of `partition`.
    ///
    /// Returns `None` when a restart checkpoint says the partition was
    /// already completed.
    pub fn enter_partition(&self, partition: u32) -> Option<KeyBoundary> {
        let start_cursor = match &self.start {
            Some(start) => Cursor::From(start.clone()),
            None => Cursor::Unbounded,
        };
        let cursor = match &self.restart {
            Some(cp) if !self.partition_scoped => Cursor::After(cp.keys.clone()),
            Some(cp) => match partition.cmp(&cp.partition) {
                Ordering::Less => return None,
                Ordering::Equal => Cursor::After(cp.keys.clone()),
                Ordering::Greater => start_cursor,
            },
            None => start_cursor,
        };
        Some(KeyBoundary {
            partition,
            cursor,
            ..self.clone()
        })
    }

    /// Boundary for the batch after the one ending at `last`
    pub fn advance(&self, last: KeyTuple) -> KeyBoundary {
        KeyBoundary {
            cursor: Cursor::After(last),
            ..self.clone()
        }
    }

    /// Checkpoint for a committed batch ending at `last`
    pub fn checkpoint(&self, last: &KeyTuple) -> Checkpoint {
        Checkpoint::new(self.partition, last.clone())
    }

    /// Lower-bound predicate with its parameters, numbered from `first_param`
    pub fn lower_bound(&self, first_param: usize) -> Option<(Predicate, Vec<Value>)> {
        let (tuple, inclusive) = match &self.cursor {
            Cursor::Unbounded => return None,
            Cursor::From(t) => (t, true),
            Cursor::After(t) => (t, false),
        };
        Some(bounded(tuple, Bound::Lower { inclusive }, first_param))
    }

    /// End-key predicate with its parameters, numbered from `first_param`
    pub fn end_bound(&self, first_param: usize) -> Option<(Predicate, Vec<Value>)> {
        self.end
            .as_ref()
            .map(|end| bounded(end, Bound::Upper { inclusive: true }, first_param))
    }

    /// Inclusive upper-bound predicate for a batch ending at `limit`
    pub fn upper_bound(limit: &KeyTuple, first_param: usize) -> (Predicate, Vec<Value>) {
        bounded(limit, Bound::Upper { inclusive: true }, first_param)
    }

    /// Clamp a probed limit to the end keys.
    ///
    /// Returns the scan's upper bound and whether the batch is the last one
    /// of the partition.
    pub fn clamp_limit(&self, limit: KeyTuple) -> (KeyTuple, bool) {
        let Some(end) = &self.end else {
            return (limit, false);
        };
        match limit.cmp_prefix(end) {
            Ordering::Greater => (end.clone(), true),
            Ordering::Equal if end.len() >= limit.len() => (limit, true),
            _ => (limit, false),
        }
    }

    /// Whether a row with key `key` lies inside the current range
    pub fn admits(&self, key: &KeyTuple) -> bool {
        [self.lower_bound(0), self.end_bound(0)]
            .into_iter()
            .flatten()
            .all(|(p, values)| p.evaluate(key.values(), &values, Some(self.partition)))
    }
}

fn bounded(tuple: &KeyTuple, bound: Bound, first_param: usize) -> (Predicate, Vec<Value>) {
    (
        lexicographic(tuple.len(), bound, first_param),
        tuple.values().to_vec(),
    )
}
