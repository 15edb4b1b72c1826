//! Composite-key comparison predicates
//!
//! A lexicographic comparison of key columns `(k1..kn)` against a tuple
//! `(b1..bn)` is not a conjunction of per-column inequalities. "key > bound"
//! expands to:
//!
//! ```text
//! (k1 > b1)
//! OR (k1 = b1 AND k2 > b2)
//! OR ...
//! OR (k1 = b1 AND ... AND kn-1 = bn-1 AND kn > bn)
//! ```
//!
//! [`lexicographic`] builds that shape as a [`Predicate`] tree. The tree is
//! rendered to SQL by [`Predicate::render`] and evaluated in-process by
//! [`Predicate::evaluate`], so both paths share one construction.

use std::cmp::Ordering;

use crate::dialect::SqlDialect;
use crate::error::{Error, Result};
use crate::types::Value;

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
}

impl CompareOp {
    /// SQL operator text
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        }
    }

    /// Whether `left <op> right` holds given `left.cmp(right)`
    pub const fn holds(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => matches!(ordering, Ordering::Equal),
            Self::Gt => matches!(ordering, Ordering::Greater),
            Self::Ge => !matches!(ordering, Ordering::Less),
            Self::Lt => matches!(ordering, Ordering::Less),
            Self::Le => !matches!(ordering, Ordering::Greater),
        }
    }
}

/// Which side of a range a tuple bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    /// Rows after the tuple
    Lower {
        /// Include the tuple itself
        inclusive: bool,
    },
    /// Rows up to the tuple
    Upper {
        /// Include the tuple itself
        inclusive: bool,
    },
}

impl Bound {
    fn ops(self) -> (CompareOp, CompareOp) {
        match self {
            Self::Lower { inclusive: true } => (CompareOp::Gt, CompareOp::Ge),
            Self::Lower { inclusive: false } => (CompareOp::Gt, CompareOp::Gt),
            Self::Upper { inclusive: true } => (CompareOp::Lt, CompareOp::Le),
            Self::Upper { inclusive: false } => (CompareOp::Lt, CompareOp::Lt),
        }
    }
}

/// Boolean expression over key columns and bound parameters.
///
/// `column` indexes the key column list; `param` indexes the parameter list
/// the predicate is rendered or evaluated with.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `key[column] <op> param[param]`
    Compare {
        /// Key column index
        column: usize,
        /// Operator
        op: CompareOp,
        /// Parameter index
        param: usize,
    },
    /// Row lives in the partition numbered `param[param]`
    Partition {
        /// Parameter index
        param: usize,
    },
    /// All of
    And(Vec<Predicate>),
    /// Any of
    Or(Vec<Predicate>),
}

impl Predicate {
    /// Conjunction, flattening nested conjunctions and single-element lists
    pub fn and(parts: Vec<Predicate>) -> Predicate {
        let mut flat = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                Predicate::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.remove(0)
        } else {
            Predicate::And(flat)
        }
    }

    /// Disjunction, collapsing single-element lists
    pub fn or(mut parts: Vec<Predicate>) -> Predicate {
        if parts.len() == 1 {
            parts.remove(0)
        } else {
            Predicate::Or(parts)
        }
    }

    /// True for the empty conjunction, which admits every row
    pub fn is_always_true(&self) -> bool {
        matches!(self, Predicate::And(parts) if parts.is_empty())
    }

    /// Render to SQL.
    ///
    /// `columns` holds the SQL expression for each key column, already
    /// qualified and converted; `partition_expr` is the expression yielding a
    /// row's partition number.
    pub fn render(
        &self,
        columns: &[String],
        partition_expr: Option<&str>,
        dialect: &dyn SqlDialect,
    ) -> Result<String> {
        match self {
            Predicate::Compare { column, op, param } => {
                let expr = columns.get(*column).ok_or_else(|| {
                    Error::internal(format!("predicate references key column {}", column))
                })?;
                Ok(format!(
                    "{} {} {}",
                    expr,
                    op.as_sql(),
                    dialect.placeholder(param + 1)
                ))
            }
            Predicate::Partition { param } => {
                let expr = partition_expr.ok_or_else(|| {
                    Error::internal("partition predicate on a table without partitioning")
                })?;
                Ok(format!("{} = {}", expr, dialect.placeholder(param + 1)))
            }
            Predicate::And(parts) => Ok(parts
                .iter()
                .map(|p| p.render(columns, partition_expr, dialect))
                .collect::<Result<Vec<_>>>()?
                .join(" AND ")),
            Predicate::Or(parts) => {
                let rendered = parts
                    .iter()
                    .map(|p| {
                        p.render(columns, partition_expr, dialect)
                            .map(|s| format!("({})", s))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(format!("({})", rendered.join(" OR ")))
            }
        }
    }

    /// Evaluate against one row's key values and partition.
    ///
    /// Comparisons involving NULL or mismatched types are false, as in SQL.
    pub fn evaluate(&self, keys: &[Value], params: &[Value], partition: Option<u32>) -> bool {
        match self {
            Predicate::Compare { column, op, param } => {
                match (keys.get(*column), params.get(*param)) {
                    (Some(key), Some(bound)) => {
                        key.sql_cmp(bound).is_some_and(|ord| op.holds(ord))
                    }
                    _ => false,
                }
            }
            Predicate::Partition { param } => {
                match (params.get(*param).and_then(Value::as_i64), partition) {
                    (Some(wanted), Some(actual)) => wanted == i64::from(actual),
                    _ => false,
                }
            }
            Predicate::And(parts) => parts.iter().all(|p| p.evaluate(keys, params, partition)),
            Predicate::Or(parts) => parts.iter().any(|p| p.evaluate(keys, params, partition)),
        }
    }
}

/// Lexicographic comparison of the leading `width` key columns against
/// parameters `first_param..first_param + width`.
///
/// Intermediate columns always compare strictly; only the last column's
/// operator honours `inclusive`.
pub fn lexicographic(width: usize, bound: Bound, first_param: usize) -> Predicate {
    let (strict, last) = bound.ops();
    let disjuncts = (1..=width)
        .map(|prefix| {
            let mut conj: Vec<Predicate> = (0..prefix - 1)
                .map(|col| Predicate::Compare {
                    column: col,
                    op: CompareOp::Eq,
                    param: first_param + col,
                })
                .collect();
            conj.push(Predicate::Compare {
                column: prefix - 1,
                op: if prefix == width { last } else { strict },
                param: first_param + prefix - 1,
            });
            Predicate::and(conj)
        })
        .collect();
    Predicate::or(disjuncts)
}
