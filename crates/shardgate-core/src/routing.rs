//! Shard routing: destination resolution against the shard map, and the
//! table-level route planner.
//!
//! The planner classifies a WHERE clause against a sharding column into a
//! routing opcode (targeted equality / IN list / scatter / provably-none)
//! and carries the bind values needed at execution time. The opcode only
//! ever narrows as filters are folded in; it never widens, except for the
//! `None` override when a predicate set is provably unsatisfiable.
//!
//! Routing completes before any shard call begins: the resulting plan is an
//! immutable description of "what to run where", so retries at the
//! execution layer reuse it without re-planning.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::expr::{split_conjunction, BinaryOp, Expr, Value};
use crate::keyrange::ShardReference;
use crate::vindex::{Destination, Vindex, VindexError};

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("no shard matches keyspace id {0}")]
    NoShardForKeyspaceId(String),
    #[error("no shards available for the keyspace")]
    EmptyShardList,
    #[error("missing bind variable: {0}")]
    MissingBindVariable(String),
    #[error("malformed route plan: {0}")]
    MalformedPlan(String),
    #[error(transparent)]
    Vindex(#[from] VindexError),
}

/// Resolves one destination to concrete shard names.
///
/// Keyspace ids scan the ordered reference list linearly; the list is tens
/// of entries, ranges are non-overlapping, so exactly one match exists or
/// the input is invalid. `AllShards` returns every name; `None` resolves to
/// nothing and never errors.
pub fn resolve_destination(
    destination: &Destination,
    shards: &[ShardReference],
) -> Result<Vec<String>, RoutingError> {
    match destination {
        Destination::KeyspaceId(id) => {
            if shards.is_empty() {
                return Err(RoutingError::EmptyShardList);
            }
            shards
                .iter()
                .find(|shard| shard.contains(id))
                .map(|shard| vec![shard.name.clone()])
                .ok_or_else(|| RoutingError::NoShardForKeyspaceId(fmt_hex(id)))
        }
        Destination::AllShards => Ok(shards.iter().map(|s| s.name.clone()).collect()),
        Destination::None => Ok(Vec::new()),
    }
}

/// Resolves a batch of destinations, deduplicating shard names while
/// preserving first-seen order.
pub fn resolve_destinations(
    destinations: &[Destination],
    shards: &[ShardReference],
) -> Result<Vec<String>, RoutingError> {
    let mut out: Vec<String> = Vec::new();
    for destination in destinations {
        for name in resolve_destination(destination, shards)? {
            if !out.contains(&name) {
                out.push(name);
            }
        }
    }
    Ok(out)
}

fn fmt_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Routing strategy for a table-level statement, from most to least
/// permissive. `EqualUnique` and `None` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteOpcode {
    /// Unique-vindex equality: at most one shard.
    EqualUnique,
    /// Non-unique equality.
    Equal,
    /// IN list of routable values.
    In,
    /// Every shard. The initial state.
    Scatter,
    /// Provably unsatisfiable; no shard at all.
    None,
}

impl RouteOpcode {
    /// Permissiveness rank: Scatter > Equal/In > EqualUnique > None.
    pub fn permissiveness(&self) -> u8 {
        match self {
            RouteOpcode::Scatter => 3,
            RouteOpcode::Equal | RouteOpcode::In => 2,
            RouteOpcode::EqualUnique => 1,
            RouteOpcode::None => 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RouteOpcode::EqualUnique | RouteOpcode::None)
    }
}

/// A value the plan needs at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanValue {
    Null,
    Literal(Value),
    BindVar(String),
    List(Vec<PlanValue>),
}

/// Immutable routing decision for one table-level statement: computed once
/// per WHERE clause, then only narrowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutePlan {
    pub opcode: RouteOpcode,
    pub column: String,
    pub values: Vec<PlanValue>,
}

/// Table-level route planner: a sharding column and its vindex.
#[derive(Debug, Clone)]
pub struct TableRouting {
    pub column: String,
    pub vindex: Vindex,
}

impl TableRouting {
    pub fn new(column: impl Into<String>, vindex: Vindex) -> TableRouting {
        TableRouting {
            column: column.into(),
            vindex,
        }
    }

    /// Classifies a WHERE clause, folding each conjunct through the opcode
    /// state machine.
    pub fn plan(&self, where_clause: Option<&Expr>) -> RoutePlan {
        let mut plan = RoutePlan {
            opcode: RouteOpcode::Scatter,
            column: self.column.clone(),
            values: Vec::new(),
        };
        if let Some(clause) = where_clause {
            for filter in split_conjunction(clause) {
                self.fold_filter(&mut plan, filter);
            }
        }
        debug!(opcode = ?plan.opcode, column = %plan.column, "route plan computed");
        plan
    }

    /// Folds one additional filter into an existing plan. Monotonic: the
    /// opcode narrows or stays; only `None` overrides, and terminal states
    /// never move.
    pub fn fold_filter(&self, plan: &mut RoutePlan, filter: &Expr) {
        let (next, values) = self.opcode_for_filter(filter);
        if plan.opcode.is_terminal() {
            return;
        }
        match next {
            RouteOpcode::Scatter => {}
            RouteOpcode::None => {
                plan.opcode = RouteOpcode::None;
                plan.values.clear();
            }
            narrower => {
                if plan.opcode == RouteOpcode::Scatter
                    || matches!(plan.opcode, RouteOpcode::Equal | RouteOpcode::In)
                {
                    plan.opcode = narrower;
                    plan.values = values;
                }
            }
        }
    }

    /// Per-filter opcode computation. Any shape not recognized is Scatter.
    fn opcode_for_filter(&self, filter: &Expr) -> (RouteOpcode, Vec<PlanValue>) {
        match filter {
            Expr::Binary {
                op: BinaryOp::Eq,
                left,
                right,
            } => {
                let value_side = if self.is_sharding_column(left) {
                    right
                } else if self.is_sharding_column(right) {
                    left
                } else {
                    return (RouteOpcode::Scatter, Vec::new());
                };
                if value_side.is_null_literal() {
                    // col = NULL matches nothing.
                    return (RouteOpcode::None, Vec::new());
                }
                match plan_value(value_side) {
                    Some(value) => (self.equality_opcode(), vec![value]),
                    None => (RouteOpcode::Scatter, Vec::new()),
                }
            }
            Expr::IsNull { inner, .. } => {
                if self.is_sharding_column(inner) {
                    // Synthetic NULL value; the vindex decides at execution.
                    (self.equality_opcode(), vec![PlanValue::Null])
                } else {
                    (RouteOpcode::Scatter, Vec::new())
                }
            }
            Expr::InList {
                lhs,
                list,
                negated: false,
            } => {
                if !self.is_sharding_column(lhs) {
                    return (RouteOpcode::Scatter, Vec::new());
                }
                if list.len() == 1 && list[0].is_null_literal() {
                    // IN (NULL) matches nothing.
                    return (RouteOpcode::None, Vec::new());
                }
                let mut values = Vec::with_capacity(list.len());
                for item in list {
                    if item.is_null_literal() {
                        return (RouteOpcode::Scatter, Vec::new());
                    }
                    match plan_value(item) {
                        Some(value) => values.push(value),
                        None => return (RouteOpcode::Scatter, Vec::new()),
                    }
                }
                (RouteOpcode::In, vec![PlanValue::List(values)])
            }
            Expr::InList {
                list, negated: true, ..
            } => {
                // NOT IN with a literal NULL is always false.
                if list.iter().any(|item| item.is_null_literal()) {
                    (RouteOpcode::None, Vec::new())
                } else {
                    (RouteOpcode::Scatter, Vec::new())
                }
            }
            _ => (RouteOpcode::Scatter, Vec::new()),
        }
    }

    fn equality_opcode(&self) -> RouteOpcode {
        if self.vindex.is_unique() {
            RouteOpcode::EqualUnique
        } else {
            RouteOpcode::Equal
        }
    }

    fn is_sharding_column(&self, expr: &Expr) -> bool {
        matches!(expr, Expr::Column { name, .. } if *name == self.column)
    }
}

fn plan_value(expr: &Expr) -> Option<PlanValue> {
    match expr {
        Expr::Literal(Value::Null) => Some(PlanValue::Null),
        Expr::Literal(value) => Some(PlanValue::Literal(value.clone())),
        Expr::BindParam(name) => Some(PlanValue::BindVar(name.clone())),
        _ => None,
    }
}

/// Evaluates a route plan to concrete shard names: bind values are looked
/// up, fed through the vindex, and the destinations resolved against the
/// shard map.
pub fn shards_for_plan(
    plan: &RoutePlan,
    vindex: Vindex,
    bindings: &FxHashMap<String, Value>,
    shards: &[ShardReference],
) -> Result<Vec<String>, RoutingError> {
    match plan.opcode {
        RouteOpcode::Scatter => Ok(shards.iter().map(|s| s.name.clone()).collect()),
        RouteOpcode::None => Ok(Vec::new()),
        RouteOpcode::Equal | RouteOpcode::EqualUnique => {
            let first = plan
                .values
                .first()
                .ok_or_else(|| RoutingError::MalformedPlan("equality plan with no value".to_string()))?;
            let value = resolve_plan_value(first, bindings)?;
            let destinations = vindex.map(&[value])?;
            resolve_destinations(&destinations, shards)
        }
        RouteOpcode::In => {
            let PlanValue::List(items) = plan
                .values
                .first()
                .ok_or_else(|| RoutingError::MalformedPlan("IN plan with no value list".to_string()))?
            else {
                return Err(RoutingError::MalformedPlan(
                    "IN plan value is not a list".to_string(),
                ));
            };
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(resolve_plan_value(item, bindings)?);
            }
            let destinations = vindex.map(&values)?;
            resolve_destinations(&destinations, shards)
        }
    }
}

fn resolve_plan_value(
    value: &PlanValue,
    bindings: &FxHashMap<String, Value>,
) -> Result<Value, RoutingError> {
    match value {
        PlanValue::Null => Ok(Value::Null),
        PlanValue::Literal(v) => Ok(v.clone()),
        PlanValue::BindVar(name) => bindings
            .get(name)
            .cloned()
            .ok_or_else(|| RoutingError::MissingBindVariable(name.clone())),
        PlanValue::List(_) => Err(RoutingError::MalformedPlan(
            "nested value list in route plan".to_string(),
        )),
    }
}

// ============================================================================
// Tests
// ============================================================================
