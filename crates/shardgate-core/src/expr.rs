//! Expression input surface for the planner.
//!
//! The SQL tokenizer/parser lives outside this crate; the planner consumes a
//! closed set of typed expression nodes. Node kinds here are the contract:
//! column reference, literal, bind parameter, binary operator over a closed
//! operator set, IN/NOT IN list, IS [NOT] NULL, and an opaque subquery handle
//! resolved through the semantic table.

use serde::{Deserialize, Serialize};

/// Constant value carried by literals and bind-variable bindings.
///
/// No float variant: routing never hashes floats, and keeping `Value`
/// `Eq + Hash` lets the semantic table memoize dependency lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Closed operator set for binary expression nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    /// `<=>`, the null-safe comparison. Never null-intolerant.
    NullSafeEq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// One node of the expression tree handed in by semantic analysis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    Column {
        /// Table qualifier (alias), when the reference is qualified.
        table: Option<String>,
        name: String,
    },
    Literal(Value),
    BindParam(String),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    InList {
        lhs: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    IsNull {
        inner: Box<Expr>,
        negated: bool,
    },
    /// Opaque subquery handle; dependencies are registered on the SemTable.
    Subquery(usize),
}

impl Expr {
    pub fn col(table: &str, name: &str) -> Expr {
        Expr::Column {
            table: Some(table.to_string()),
            name: name.to_string(),
        }
    }

    pub fn bare_col(name: &str) -> Expr {
        Expr::Column {
            table: None,
            name: name.to_string(),
        }
    }

    pub fn int(v: i64) -> Expr {
        Expr::Literal(Value::Int(v))
    }

    pub fn null() -> Expr {
        Expr::Literal(Value::Null)
    }

    pub fn bind(name: &str) -> Expr {
        Expr::BindParam(name.to_string())
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn eq(left: Expr, right: Expr) -> Expr {
        Expr::binary(BinaryOp::Eq, left, right)
    }

    pub fn and(left: Expr, right: Expr) -> Expr {
        Expr::binary(BinaryOp::And, left, right)
    }

    /// True for nodes usable as routing inputs without evaluation: literals
    /// and bind parameters.
    pub fn is_constant(&self) -> bool {
        matches!(self, Expr::Literal(_) | Expr::BindParam(_))
    }

    pub fn is_null_literal(&self) -> bool {
        matches!(self, Expr::Literal(Value::Null))
    }
}

/// Splits a predicate on AND into its conjuncts, left to right.
pub fn split_conjunction(expr: &Expr) -> Vec<&Expr> {
    let mut out = Vec::new();
    collect_conjuncts(expr, &mut out);
    out
}

fn collect_conjuncts<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    match expr {
        Expr::Binary {
            op: BinaryOp::And,
            left,
            right,
        } => {
            collect_conjuncts(left, out);
            collect_conjuncts(right, out);
        }
        other => out.push(other),
    }
}

/// Rebuilds a single predicate from conjuncts; `None` when the list is empty.
pub fn conjoin(mut exprs: Vec<Expr>) -> Option<Expr> {
    let first = if exprs.is_empty() {
        return None;
    } else {
        exprs.remove(0)
    };
    Some(exprs.into_iter().fold(first, Expr::and))
}

/// ANDs a new conjunct onto an optional existing predicate.
pub fn and_opt(existing: Option<Expr>, extra: Expr) -> Expr {
    match existing {
        Some(e) => Expr::and(e, extra),
        None => extra,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_nested_conjunction_preserves_order() {
        let e = Expr::and(
            Expr::and(Expr::eq(Expr::col("t", "a"), Expr::int(1)), Expr::eq(Expr::col("t", "b"), Expr::int(2))),
            Expr::eq(Expr::col("t", "c"), Expr::int(3)),
        );
        let parts = split_conjunction(&e);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], &Expr::eq(Expr::col("t", "a"), Expr::int(1)));
        assert_eq!(parts[2], &Expr::eq(Expr::col("t", "c"), Expr::int(3)));
    }

    #[test]
    fn split_non_conjunction_is_identity() {
        let e = Expr::eq(Expr::col("t", "a"), Expr::int(1));
        assert_eq!(split_conjunction(&e), vec![&e]);
    }

    #[test]
    fn conjoin_round_trips_split() {
        let e = Expr::and(
            Expr::eq(Expr::col("t", "a"), Expr::int(1)),
            Expr::eq(Expr::col("t", "b"), Expr::int(2)),
        );
        let parts: Vec<Expr> = split_conjunction(&e).into_iter().cloned().collect();
        assert_eq!(conjoin(parts), Some(e));
    }

    #[test]
    fn conjoin_empty_is_none() {
        assert_eq!(conjoin(vec![]), None);
    }
}
