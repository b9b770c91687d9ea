//! Logical operator tree for multi-table statements.
//!
//! Operators represent a statement's shape before it is lowered to physical
//! per-shard execution. The tree supports:
//! - predicate push-down to the lowest operator that can evaluate it,
//!   driven by the TableSet each predicate depends on
//! - outer-to-inner join conversion for null-intolerant predicates
//! - tree compaction: dropping empty filters, merging inner joins of query
//!   graphs, flattening nested unions
//!
//! The variant set is closed on purpose: match dispatch replaces virtual
//! calls so every new operator kind forces every site to handle it. Trees
//! are built by a single caller per statement; mutation is in-place and not
//! synchronized.

use thiserror::Error;

use crate::expr::{and_opt, split_conjunction, BinaryOp, Expr};
use crate::semantics::{SemTable, SemanticError, TableSet};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Semantic(#[from] SemanticError),
    #[error("predicate references tables outside this subtree: {0}")]
    PredicateNotPushable(String),
    #[error("operator does not accept predicates: {0}")]
    PredicatesForbidden(&'static str),
    #[error("malformed operator tree: {0}")]
    InvalidTree(String),
}

/// One table participating in a query graph, with the predicates that
/// depend on it alone.
#[derive(Debug, Clone)]
pub struct QueryTable {
    pub alias: String,
    pub table_set: TableSet,
    pub predicates: Vec<Expr>,
}

impl QueryTable {
    pub fn new(alias: impl Into<String>, table_set: TableSet) -> QueryTable {
        QueryTable {
            alias: alias.into(),
            table_set,
            predicates: Vec::new(),
        }
    }
}

/// Leaf-ish aggregate of tables and the predicates connecting them.
///
/// Predicates with zero table dependencies are hoisted into `no_deps`;
/// single-table predicates attach to the owning table; multi-table
/// predicates become join edges keyed by the exact TableSet they depend on.
#[derive(Debug, Clone, Default)]
pub struct QueryGraph {
    pub tables: Vec<QueryTable>,
    pub inner_joins: Vec<(TableSet, Vec<Expr>)>,
    pub no_deps: Option<Expr>,
}

impl QueryGraph {
    pub fn new() -> QueryGraph {
        QueryGraph::default()
    }

    pub fn add_table(&mut self, table: QueryTable) {
        self.tables.push(table);
    }

    pub fn table_id(&self) -> TableSet {
        let mut id = TableSet::empty();
        for table in &self.tables {
            id.merge_in_place(&table.table_set);
        }
        id
    }

    /// Routes one conjunct to its place in the graph.
    pub fn collect_predicate(&mut self, expr: Expr, sem: &SemTable) -> Result<(), PlanError> {
        let deps = sem.recursive_deps(&expr)?;
        match deps.number_of_tables() {
            0 => self.no_deps = Some(and_opt(self.no_deps.take(), expr)),
            1 => {
                if let Some(table) = self.tables.iter_mut().find(|t| t.table_set == deps) {
                    table.predicates.push(expr);
                } else {
                    // Single-table predicate for a table outside this graph:
                    // keep it as a join predicate for the eventual owner.
                    self.add_join_predicate(deps, expr);
                }
            }
            _ => self.add_join_predicate(deps, expr),
        }
        Ok(())
    }

    fn add_join_predicate(&mut self, deps: TableSet, expr: Expr) {
        if let Some((_, preds)) = self.inner_joins.iter_mut().find(|(key, _)| *key == deps) {
            preds.push(expr);
        } else {
            self.inner_joins.push((deps, vec![expr]));
        }
    }

    /// Join-edge predicates for an exact dependency set.
    pub fn predicates_for(&self, deps: &TableSet) -> Option<&[Expr]> {
        self.inner_joins
            .iter()
            .find(|(key, _)| key == deps)
            .map(|(_, preds)| preds.as_slice())
    }
}

#[derive(Debug, Clone)]
pub struct Join {
    pub lhs: Box<Operator>,
    pub rhs: Box<Operator>,
    pub predicate: Option<Expr>,
    pub is_outer: bool,
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub source: Box<Operator>,
    pub predicates: Vec<Expr>,
}

/// Ordering key on a union's merged output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSpec {
    pub column: String,
    pub descending: bool,
}

/// UNION / UNION ALL over source trees. `select_statements` runs parallel to
/// `sources`; a slot is `None` when the source was spliced out of a nested
/// union and its own SELECT text is no longer needed at that position.
#[derive(Debug, Clone)]
pub struct Concatenate {
    pub distinct: bool,
    pub sources: Vec<Operator>,
    pub select_statements: Vec<Option<String>>,
    pub order_by: Vec<OrderSpec>,
    pub limit: Option<usize>,
}

/// Derived table (subquery in FROM) wrapping an inner tree under its own
/// table ordinal.
#[derive(Debug, Clone)]
pub struct Derived {
    pub source: Box<Operator>,
    pub alias: String,
    pub table_set: TableSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubqueryKind {
    Scalar,
    In,
    Exists,
}

/// One extracted subquery, tied to the `Expr::Subquery` handle that marks
/// its position in the outer expression tree.
#[derive(Debug, Clone)]
pub struct SubQueryInner {
    pub inner: Operator,
    pub handle: usize,
    pub kind: SubqueryKind,
}

#[derive(Debug, Clone)]
pub struct SubQuery {
    pub outer: Box<Operator>,
    pub inner: Vec<SubQueryInner>,
}

/// The closed operator variant set.
#[derive(Debug, Clone)]
pub enum Operator {
    QueryGraph(QueryGraph),
    Join(Join),
    Filter(Filter),
    Concatenate(Concatenate),
    Derived(Derived),
    SubQuery(SubQuery),
}

impl Operator {
    /// Which tables this subtree solves.
    pub fn table_id(&self) -> TableSet {
        match self {
            Operator::QueryGraph(qg) => qg.table_id(),
            Operator::Join(j) => j.lhs.table_id().merge(&j.rhs.table_id()),
            Operator::Filter(f) => f.source.table_id(),
            Operator::Concatenate(c) => {
                let mut id = TableSet::empty();
                for source in &c.sources {
                    id.merge_in_place(&source.table_id());
                }
                id
            }
            Operator::Derived(d) => d.table_set.clone(),
            Operator::SubQuery(s) => {
                let mut id = s.outer.table_id();
                for inner in &s.inner {
                    id.merge_in_place(&inner.inner.table_id());
                }
                id
            }
        }
    }

    /// Pushes a predicate (splitting on AND) to the lowest operators that
    /// can evaluate its conjuncts.
    pub fn push_predicate(self, expr: Expr, sem: &SemTable) -> Result<Operator, PlanError> {
        let conjuncts: Vec<Expr> = split_conjunction(&expr).into_iter().cloned().collect();
        let mut op = self;
        for conjunct in conjuncts {
            op = op.push_conjunct(conjunct, sem)?;
        }
        Ok(op)
    }

    fn push_conjunct(self, expr: Expr, sem: &SemTable) -> Result<Operator, PlanError> {
        match self {
            Operator::QueryGraph(mut qg) => {
                qg.collect_predicate(expr, sem)?;
                Ok(Operator::QueryGraph(qg))
            }
            Operator::Join(join) => push_into_join(join, expr, sem),
            Operator::Filter(mut filter) => {
                filter.source = Box::new(filter.source.push_conjunct(expr, sem)?);
                Ok(Operator::Filter(filter))
            }
            Operator::Concatenate(_) => Err(PlanError::PredicatesForbidden("concatenate")),
            Operator::Derived(derived) => {
                // Safe default: evaluate above the derived-table boundary.
                Ok(wrap_in_filter(Operator::Derived(derived), expr))
            }
            Operator::SubQuery(mut sq) => {
                sq.outer = Box::new(sq.outer.push_conjunct(expr, sem)?);
                Ok(Operator::SubQuery(sq))
            }
        }
    }

    /// Compacts the tree bottom-up: empty filters collapse, inner joins of
    /// query graphs merge, nested unions flatten.
    pub fn compact(self, sem: &SemTable) -> Result<Operator, PlanError> {
        match self {
            Operator::QueryGraph(qg) => Ok(Operator::QueryGraph(qg)),
            Operator::Filter(filter) => compact_filter(filter, sem),
            Operator::Join(join) => compact_join(join, sem),
            Operator::Concatenate(concat) => compact_concatenate(concat, sem),
            Operator::Derived(mut derived) => {
                derived.source = Box::new(derived.source.compact(sem)?);
                Ok(Operator::Derived(derived))
            }
            Operator::SubQuery(mut sq) => {
                sq.outer = Box::new(sq.outer.compact(sem)?);
                for inner in &mut sq.inner {
                    let compacted = std::mem::replace(&mut inner.inner, Operator::QueryGraph(QueryGraph::new()))
                        .compact(sem)?;
                    inner.inner = compacted;
                }
                Ok(Operator::SubQuery(sq))
            }
        }
    }

    /// Structural sanity checks; violations indicate a bug in an earlier
    /// analysis phase, not user error.
    pub fn check_valid(&self) -> Result<(), PlanError> {
        match self {
            Operator::QueryGraph(_) => Ok(()),
            Operator::Join(j) => {
                j.lhs.check_valid()?;
                j.rhs.check_valid()
            }
            Operator::Filter(f) => f.source.check_valid(),
            Operator::Concatenate(c) => {
                if c.sources.len() != c.select_statements.len() {
                    return Err(PlanError::InvalidTree(format!(
                        "concatenate has {} sources but {} select slots",
                        c.sources.len(),
                        c.select_statements.len()
                    )));
                }
                if c.sources.is_empty() {
                    return Err(PlanError::InvalidTree("concatenate with no sources".to_string()));
                }
                for source in &c.sources {
                    source.check_valid()?;
                }
                Ok(())
            }
            Operator::Derived(d) => d.source.check_valid(),
            Operator::SubQuery(s) => {
                s.outer.check_valid()?;
                for inner in &s.inner {
                    inner.inner.check_valid()?;
                }
                Ok(())
            }
        }
    }
}

fn wrap_in_filter(op: Operator, expr: Expr) -> Operator {
    Operator::Filter(Filter {
        source: Box::new(op),
        predicates: vec![expr],
    })
}

fn push_into_join(mut join: Join, expr: Expr, sem: &SemTable) -> Result<Operator, PlanError> {
    let deps = sem.recursive_deps(&expr)?;
    let lhs_id = join.lhs.table_id();
    let rhs_id = join.rhs.table_id();

    if deps.is_solved_by(&lhs_id) {
        join.lhs = Box::new(join.lhs.push_conjunct(expr, sem)?);
        return Ok(Operator::Join(join));
    }

    if deps.is_solved_by(&rhs_id) {
        if join.is_outer {
            if converts_outer_to_inner(&expr, &rhs_id, sem)? {
                join.is_outer = false;
            } else {
                // Cannot push below an outer-join boundary safely.
                return Ok(wrap_in_filter(Operator::Join(join), expr));
            }
        }
        join.rhs = Box::new(join.rhs.push_conjunct(expr, sem)?);
        return Ok(Operator::Join(join));
    }

    if deps.is_solved_by(&lhs_id.merge(&rhs_id)) {
        if join.is_outer {
            if converts_outer_to_inner(&expr, &rhs_id, sem)? {
                join.is_outer = false;
            } else {
                return Ok(wrap_in_filter(Operator::Join(join), expr));
            }
        }
        join.predicate = Some(and_opt(join.predicate.take(), expr));
        return Ok(Operator::Join(join));
    }

    Err(PlanError::PredicateNotPushable(format!("{expr:?}")))
}

/// Outer-join elimination: a predicate referencing the RHS of a left join
/// converts the join to inner when it is null-intolerant, i.e. a
/// NULL-extended row could not satisfy it.
///
/// - `<=>` (null-safe comparison) never converts.
/// - `IS [NOT] NULL` converts only when the tested expression is a plain
///   RHS column.
/// - Ordinary binary comparisons convert when either side is an RHS column.
fn converts_outer_to_inner(
    expr: &Expr,
    rhs_id: &TableSet,
    sem: &SemTable,
) -> Result<bool, PlanError> {
    match expr {
        Expr::Binary {
            op: BinaryOp::NullSafeEq,
            ..
        } => Ok(false),
        Expr::IsNull { inner, .. } => is_rhs_column(inner, rhs_id, sem),
        Expr::Binary { op, left, right } => match op {
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                Ok(is_rhs_column(left, rhs_id, sem)? || is_rhs_column(right, rhs_id, sem)?)
            }
            BinaryOp::NullSafeEq | BinaryOp::And | BinaryOp::Or => Ok(false),
        },
        _ => Ok(false),
    }
}

fn is_rhs_column(expr: &Expr, rhs_id: &TableSet, sem: &SemTable) -> Result<bool, PlanError> {
    if !matches!(expr, Expr::Column { .. }) {
        return Ok(false);
    }
    let deps = sem.recursive_deps(expr)?;
    Ok(!deps.is_empty() && deps.is_solved_by(rhs_id))
}

fn compact_filter(mut filter: Filter, sem: &SemTable) -> Result<Operator, PlanError> {
    let source = filter.source.compact(sem)?;
    if filter.predicates.is_empty() {
        return Ok(source);
    }
    if let Operator::Filter(inner) = source {
        // Stacked filters merge; the inner one sits closer to the data.
        let mut predicates = inner.predicates;
        predicates.append(&mut filter.predicates);
        return Ok(Operator::Filter(Filter {
            source: inner.source,
            predicates,
        }));
    }
    Ok(Operator::Filter(Filter {
        source: Box::new(source),
        predicates: filter.predicates,
    }))
}

fn compact_join(join: Join, sem: &SemTable) -> Result<Operator, PlanError> {
    let lhs = join.lhs.compact(sem)?;
    let rhs = join.rhs.compact(sem)?;
    if !join.is_outer {
        if let (Operator::QueryGraph(lhs_qg), Operator::QueryGraph(rhs_qg)) = (&lhs, &rhs) {
            let mut merged = lhs_qg.clone();
            let rhs_qg = rhs_qg.clone();
            merged.tables.extend(rhs_qg.tables);
            for (deps, preds) in rhs_qg.inner_joins {
                for pred in preds {
                    merged.add_join_predicate(deps.clone(), pred);
                }
            }
            if let Some(no_deps) = rhs_qg.no_deps {
                merged.no_deps = Some(and_opt(merged.no_deps.take(), no_deps));
            }
            if let Some(predicate) = join.predicate {
                for conjunct in split_conjunction(&predicate) {
                    merged.collect_predicate(conjunct.clone(), sem)?;
                }
            }
            return Ok(Operator::QueryGraph(merged));
        }
    }
    Ok(Operator::Join(Join {
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
        predicate: join.predicate,
        is_outer: join.is_outer,
    }))
}

fn compact_concatenate(concat: Concatenate, sem: &SemTable) -> Result<Operator, PlanError> {
    let mut sources = Vec::with_capacity(concat.sources.len());
    let mut selects = Vec::with_capacity(concat.select_statements.len());
    for (source, select) in concat.sources.into_iter().zip(concat.select_statements) {
        let source = source.compact(sem)?;
        match source {
            Operator::Concatenate(child) if can_flatten_into(concat.distinct, &child) => {
                // Splice the child's sources in place, preserving order.
                sources.extend(child.sources);
                selects.extend(child.select_statements);
            }
            Operator::Concatenate(child) => {
                // Kept as an opaque source; its SELECT text is not needed at
                // this position.
                sources.push(Operator::Concatenate(child));
                selects.push(None);
            }
            other => {
                sources.push(other);
                selects.push(select);
            }
        }
    }
    Ok(Operator::Concatenate(Concatenate {
        distinct: concat.distinct,
        sources,
        select_statements: selects,
        order_by: concat.order_by,
        limit: concat.limit,
    }))
}

/// A nested union can be spliced into its parent when it is a plain UNION
/// ALL with no LIMIT/ORDER BY of its own, or when the parent is DISTINCT
/// and the child carries no LIMIT.
fn can_flatten_into(parent_distinct: bool, child: &Concatenate) -> bool {
    (!child.distinct && child.limit.is_none() && child.order_by.is_empty())
        || (parent_distinct && child.limit.is_none())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Value;
    use std::collections::HashSet;

    fn sem_with(aliases: &[(&str, &[&str])]) -> (SemTable, Vec<TableSet>) {
        let mut sem = SemTable::new();
        let mut sets = Vec::new();
        for (alias, cols) in aliases {
            sets.push(sem.add_table(alias, cols));
        }
        (sem, sets)
    }

    fn graph_of(sem_sets: &[(&str, TableSet)]) -> QueryGraph {
        let mut qg = QueryGraph::new();
        for (alias, set) in sem_sets {
            qg.add_table(QueryTable::new(*alias, set.clone()));
        }
        qg
    }

    fn two_table_graph() -> (SemTable, TableSet, TableSet, Operator) {
        let (sem, sets) = sem_with(&[("u", &["id", "name"]), ("o", &["id", "user_id", "total"])]);
        let qg = graph_of(&[("u", sets[0].clone()), ("o", sets[1].clone())]);
        (sem, sets[0].clone(), sets[1].clone(), Operator::QueryGraph(qg))
    }

    fn as_graph(op: &Operator) -> &QueryGraph {
        match op {
            Operator::QueryGraph(qg) => qg,
            other => panic!("expected a query graph, got {other:?}"),
        }
    }

    #[test]
    fn single_table_predicate_attaches_to_owner() {
        let (sem, _, _, op) = two_table_graph();
        let pred = Expr::eq(Expr::col("u", "id"), Expr::int(5));
        let op = op.push_predicate(pred.clone(), &sem).unwrap();
        let qg = as_graph(&op);
        assert_eq!(qg.tables[0].predicates, vec![pred]);
        assert!(qg.tables[1].predicates.is_empty());
        assert!(qg.inner_joins.is_empty());
    }

    #[test]
    fn zero_dep_predicate_hoists_into_no_deps() {
        let (sem, _, _, op) = two_table_graph();
        let p1 = Expr::eq(Expr::int(1), Expr::int(1));
        let p2 = Expr::eq(Expr::bind("a"), Expr::int(2));
        let op = op.push_predicate(Expr::and(p1.clone(), p2.clone()), &sem).unwrap();
        let qg = as_graph(&op);
        assert_eq!(qg.no_deps, Some(Expr::and(p1, p2)));
    }

    #[test]
    fn multi_table_predicates_group_by_exact_dependency_set() {
        let (sem, users, orders, op) = two_table_graph();
        let join1 = Expr::eq(Expr::col("u", "id"), Expr::col("o", "user_id"));
        let join2 = Expr::eq(Expr::col("u", "name"), Expr::col("o", "total"));
        let op = op
            .push_predicate(join1.clone(), &sem)
            .unwrap()
            .push_predicate(join2.clone(), &sem)
            .unwrap();
        let qg = as_graph(&op);
        assert_eq!(qg.inner_joins.len(), 1);
        let key = users.merge(&orders);
        assert_eq!(qg.predicates_for(&key), Some(&[join1, join2][..]));
    }

    #[test]
    fn join_edge_grouping_is_order_independent() {
        let preds = [
            Expr::eq(Expr::col("u", "id"), Expr::col("o", "user_id")),
            Expr::eq(Expr::col("u", "id"), Expr::int(5)),
            Expr::eq(Expr::col("o", "total"), Expr::int(100)),
            Expr::eq(Expr::col("u", "name"), Expr::col("o", "total")),
        ];
        let orders: [Vec<usize>; 3] = [vec![0, 1, 2, 3], vec![3, 2, 1, 0], vec![2, 0, 3, 1]];
        let mut seen: Vec<(Vec<(TableSet, HashSet<Expr>)>, Vec<HashSet<Expr>>)> = Vec::new();
        for order in orders {
            let (sem, _, _, mut op) = two_table_graph();
            for idx in order {
                op = op.push_predicate(preds[idx].clone(), &sem).unwrap();
            }
            let qg = as_graph(&op);
            let mut edges: Vec<(TableSet, HashSet<Expr>)> = qg
                .inner_joins
                .iter()
                .map(|(k, v)| (k.clone(), v.iter().cloned().collect()))
                .collect();
            edges.sort_by_key(|(k, _)| format!("{k:?}"));
            let tables: Vec<HashSet<Expr>> = qg
                .tables
                .iter()
                .map(|t| t.predicates.iter().cloned().collect())
                .collect();
            seen.push((edges, tables));
        }
        assert!(seen.windows(2).all(|w| w[0] == w[1]));
    }

    fn join_over(sem_tables: &[(&str, &[&str])], is_outer: bool) -> (SemTable, Operator) {
        let (sem, sets) = sem_with(sem_tables);
        let lhs = graph_of(&[(sem_tables[0].0, sets[0].clone())]);
        let rhs = graph_of(&[(sem_tables[1].0, sets[1].clone())]);
        let join = Operator::Join(Join {
            lhs: Box::new(Operator::QueryGraph(lhs)),
            rhs: Box::new(Operator::QueryGraph(rhs)),
            predicate: None,
            is_outer,
        });
        (sem, join)
    }

    #[test]
    fn lhs_predicate_recurses_into_left_side() {
        let (sem, join) = join_over(&[("u", &["id"]), ("o", &["user_id"])], false);
        let pred = Expr::eq(Expr::col("u", "id"), Expr::int(3));
        let op = join.push_predicate(pred.clone(), &sem).unwrap();
        let Operator::Join(j) = op else { panic!("expected join") };
        assert_eq!(as_graph(&j.lhs).tables[0].predicates, vec![pred]);
    }

    #[test]
    fn spanning_predicate_lands_on_inner_join() {
        let (sem, join) = join_over(&[("u", &["id"]), ("o", &["user_id"])], false);
        let pred = Expr::eq(Expr::col("u", "id"), Expr::col("o", "user_id"));
        let op = join.push_predicate(pred.clone(), &sem).unwrap();
        let Operator::Join(j) = op else { panic!("expected join") };
        assert_eq!(j.predicate, Some(pred));
        assert!(!j.is_outer);
    }

    #[test]
    fn null_intolerant_rhs_predicate_converts_outer_join() {
        let (sem, join) = join_over(&[("u", &["id"]), ("o", &["user_id", "total"])], true);
        let pred = Expr::eq(Expr::col("o", "total"), Expr::int(9));
        let op = join.push_predicate(pred.clone(), &sem).unwrap();
        let Operator::Join(j) = op else { panic!("expected join") };
        assert!(!j.is_outer, "comparison against an RHS column must convert the join");
        assert_eq!(as_graph(&j.rhs).tables[0].predicates, vec![pred]);
    }

    #[test]
    fn is_null_on_plain_rhs_column_converts() {
        let (sem, join) = join_over(&[("u", &["id"]), ("o", &["user_id"])], true);
        let pred = Expr::IsNull {
            inner: Box::new(Expr::col("o", "user_id")),
            negated: true,
        };
        let op = join.push_predicate(pred, &sem).unwrap();
        let Operator::Join(j) = op else { panic!("expected join") };
        assert!(!j.is_outer);
    }

    #[test]
    fn is_null_on_complex_rhs_expression_does_not_convert() {
        let (sem, join) = join_over(&[("u", &["id"]), ("o", &["user_id", "total"])], true);
        let pred = Expr::IsNull {
            inner: Box::new(Expr::binary(
                BinaryOp::Lt,
                Expr::col("o", "user_id"),
                Expr::col("o", "total"),
            )),
            negated: false,
        };
        let op = join.push_predicate(pred.clone(), &sem).unwrap();
        let Operator::Filter(f) = op else { panic!("expected filter wrap, got converted join") };
        assert_eq!(f.predicates, vec![pred]);
        let Operator::Join(j) = *f.source else { panic!("filter must wrap the join") };
        assert!(j.is_outer, "outer join must survive when conversion fails");
    }

    #[test]
    fn null_safe_comparison_never_converts() {
        let (sem, join) = join_over(&[("u", &["id"]), ("o", &["user_id"])], true);
        let pred = Expr::binary(BinaryOp::NullSafeEq, Expr::col("o", "user_id"), Expr::null());
        let op = join.push_predicate(pred.clone(), &sem).unwrap();
        assert!(matches!(op, Operator::Filter(_)));
    }

    #[test]
    fn unpushable_predicate_is_a_planner_invariant_error() {
        let (mut sem, _) = sem_with(&[("u", &["id"])]);
        sem.add_table("x", &["y"]);
        let qg = graph_of(&[("u", sem.table_set("u").unwrap())]);
        let join = Operator::Join(Join {
            lhs: Box::new(Operator::QueryGraph(qg.clone())),
            rhs: Box::new(Operator::QueryGraph(qg)),
            predicate: None,
            is_outer: false,
        });
        let pred = Expr::eq(Expr::col("x", "y"), Expr::int(1));
        assert!(matches!(
            join.push_predicate(pred, &sem),
            Err(PlanError::PredicateNotPushable(_))
        ));
    }

    #[test]
    fn empty_filter_compacts_to_source() {
        let (sem, _, _, op) = two_table_graph();
        let filter = Operator::Filter(Filter {
            source: Box::new(op),
            predicates: Vec::new(),
        });
        assert!(matches!(filter.compact(&sem).unwrap(), Operator::QueryGraph(_)));
    }

    #[test]
    fn stacked_filters_merge_inner_first() {
        let (sem, _, _, op) = two_table_graph();
        let inner_pred = Expr::eq(Expr::int(1), Expr::int(1));
        let outer_pred = Expr::eq(Expr::int(2), Expr::int(2));
        let stacked = Operator::Filter(Filter {
            source: Box::new(Operator::Filter(Filter {
                source: Box::new(op),
                predicates: vec![inner_pred.clone()],
            })),
            predicates: vec![outer_pred.clone()],
        });
        let Operator::Filter(f) = stacked.compact(&sem).unwrap() else {
            panic!("expected a single filter")
        };
        assert_eq!(f.predicates, vec![inner_pred, outer_pred]);
        assert!(matches!(*f.source, Operator::QueryGraph(_)));
    }

    #[test]
    fn inner_join_of_query_graphs_merges_and_refolds_predicate() {
        let (sem, join) = join_over(&[("u", &["id"]), ("o", &["user_id"])], false);
        let pred = Expr::eq(Expr::col("u", "id"), Expr::col("o", "user_id"));
        let op = join.push_predicate(pred.clone(), &sem).unwrap().compact(&sem).unwrap();
        let qg = as_graph(&op);
        assert_eq!(qg.tables.len(), 2);
        let key = sem.table_set("u").unwrap().merge(&sem.table_set("o").unwrap());
        assert_eq!(qg.predicates_for(&key), Some(&[pred][..]));
    }

    #[test]
    fn outer_join_never_merges_on_compact() {
        let (sem, join) = join_over(&[("u", &["id"]), ("o", &["user_id"])], true);
        assert!(matches!(join.compact(&sem).unwrap(), Operator::Join(_)));
    }

    fn leaf(sem: &mut SemTable, alias: &str) -> Operator {
        let set = sem.add_table(alias, &["c"]);
        Operator::QueryGraph(graph_of(&[(alias, set)]))
    }

    fn union(distinct: bool, parts: Vec<Operator>, limit: Option<usize>) -> Concatenate {
        let selects = (0..parts.len()).map(|i| Some(format!("select {i}"))).collect();
        Concatenate {
            distinct,
            sources: parts,
            select_statements: selects,
            order_by: Vec::new(),
            limit,
        }
    }

    #[test]
    fn union_all_child_flattens_into_parent() {
        let mut sem = SemTable::new();
        let a = leaf(&mut sem, "a");
        let b = leaf(&mut sem, "b");
        let c = leaf(&mut sem, "c");
        let child = Operator::Concatenate(union(false, vec![b, c], None));
        let parent = Operator::Concatenate(union(false, vec![a, child], None));
        let Operator::Concatenate(out) = parent.compact(&sem).unwrap() else {
            panic!("expected concatenate")
        };
        assert_eq!(out.sources.len(), 3);
        assert_eq!(out.select_statements.len(), 3);
        // Spliced children bring their own select slots along.
        assert_eq!(out.select_statements[1], Some("select 0".to_string()));
    }

    #[test]
    fn child_with_limit_stays_opaque_with_absent_select() {
        let mut sem = SemTable::new();
        let a = leaf(&mut sem, "a");
        let b = leaf(&mut sem, "b");
        let c = leaf(&mut sem, "c");
        let child = Operator::Concatenate(union(false, vec![b, c], Some(10)));
        let parent = Operator::Concatenate(union(false, vec![a, child], None));
        let Operator::Concatenate(out) = parent.compact(&sem).unwrap() else {
            panic!("expected concatenate")
        };
        assert_eq!(out.sources.len(), 2);
        assert!(matches!(out.sources[1], Operator::Concatenate(_)));
        assert_eq!(out.select_statements[1], None);
    }

    #[test]
    fn distinct_parent_flattens_distinct_child_without_limit() {
        let mut sem = SemTable::new();
        let a = leaf(&mut sem, "a");
        let b = leaf(&mut sem, "b");
        let c = leaf(&mut sem, "c");
        let child = Operator::Concatenate(union(true, vec![b, c], None));
        let parent = Operator::Concatenate(union(true, vec![a, child], None));
        let Operator::Concatenate(out) = parent.compact(&sem).unwrap() else {
            panic!("expected concatenate")
        };
        assert_eq!(out.sources.len(), 3);
    }

    #[test]
    fn distinct_child_under_union_all_parent_stays_opaque() {
        let mut sem = SemTable::new();
        let a = leaf(&mut sem, "a");
        let b = leaf(&mut sem, "b");
        let c = leaf(&mut sem, "c");
        let child = Operator::Concatenate(union(true, vec![b, c], None));
        let parent = Operator::Concatenate(union(false, vec![a, child], None));
        let Operator::Concatenate(out) = parent.compact(&sem).unwrap() else {
            panic!("expected concatenate")
        };
        assert_eq!(out.sources.len(), 2);
    }

    #[test]
    fn concatenate_rejects_predicate_push_down() {
        let mut sem = SemTable::new();
        let a = leaf(&mut sem, "a");
        let parent = Operator::Concatenate(union(false, vec![a], None));
        let pred = Expr::eq(Expr::col("a", "c"), Expr::int(1));
        assert!(matches!(
            parent.push_predicate(pred, &sem),
            Err(PlanError::PredicatesForbidden("concatenate"))
        ));
    }

    #[test]
    fn derived_predicate_evaluates_above_the_boundary() {
        let mut sem = SemTable::new();
        let inner = leaf(&mut sem, "inner");
        let derived_set = sem.add_table("d", &["c"]);
        let derived = Operator::Derived(Derived {
            source: Box::new(inner),
            alias: "d".to_string(),
            table_set: derived_set,
        });
        let pred = Expr::eq(Expr::col("d", "c"), Expr::int(1));
        let op = derived.push_predicate(pred.clone(), &sem).unwrap();
        let Operator::Filter(f) = op else { panic!("expected filter above derived") };
        assert_eq!(f.predicates, vec![pred]);
    }

    #[test]
    fn subquery_pushes_into_outer_and_reports_combined_tables() {
        let mut sem = SemTable::new();
        let outer = leaf(&mut sem, "u");
        let inner = leaf(&mut sem, "o");
        let inner_id = inner.table_id();
        sem.register_subquery(1, inner_id.clone());
        let sq = Operator::SubQuery(SubQuery {
            outer: Box::new(outer),
            inner: vec![SubQueryInner {
                inner,
                handle: 1,
                kind: SubqueryKind::In,
            }],
        });
        assert_eq!(
            sq.table_id(),
            sem.table_set("u").unwrap().merge(&sem.table_set("o").unwrap())
        );
        let pred = Expr::eq(Expr::col("u", "c"), Expr::int(1));
        let op = sq.push_predicate(pred.clone(), &sem).unwrap();
        let Operator::SubQuery(s) = op else { panic!("expected subquery") };
        assert_eq!(as_graph(&s.outer).tables[0].predicates, vec![pred]);
    }

    #[test]
    fn check_valid_catches_select_slot_mismatch() {
        let mut sem = SemTable::new();
        let a = leaf(&mut sem, "a");
        let broken = Operator::Concatenate(Concatenate {
            distinct: false,
            sources: vec![a],
            select_statements: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        });
        assert!(matches!(broken.check_valid(), Err(PlanError::InvalidTree(_))));
    }

    #[test]
    fn push_then_compact_assignment_is_order_independent() {
        let preds = [
            Expr::eq(Expr::col("u", "id"), Expr::col("o", "user_id")),
            Expr::eq(Expr::col("o", "total"), Expr::int(7)),
            Expr::eq(Expr::Literal(Value::Int(1)), Expr::int(1)),
        ];
        let mut outcomes = Vec::new();
        for order in [[0usize, 1, 2], [2, 1, 0], [1, 2, 0]] {
            let (sem, join) = join_over(&[("u", &["id"]), ("o", &["user_id", "total"])], false);
            let mut op = join;
            for idx in order {
                op = op.push_predicate(preds[idx].clone(), &sem).unwrap();
            }
            let op = op.compact(&sem).unwrap();
            let qg = as_graph(&op).clone();
            let edges: Vec<(TableSet, HashSet<Expr>)> = qg
                .inner_joins
                .iter()
                .map(|(k, v)| (k.clone(), v.iter().cloned().collect()))
                .collect();
            let tables: Vec<HashSet<Expr>> = qg
                .tables
                .iter()
                .map(|t| t.predicates.iter().cloned().collect())
                .collect();
            outcomes.push((edges, tables));
        }
        assert!(outcomes.windows(2).all(|w| w[0] == w[1]));
    }
}
