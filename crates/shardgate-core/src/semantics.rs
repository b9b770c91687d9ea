//! Semantic dependency tracking for the planner.
//!
//! `TableSet` is a growable bitset over table ordinals assigned during
//! semantic analysis; it is the substrate for predicate placement and
//! join-ability tests. `SemTable` is the sidecar that assigns ordinals,
//! resolves column references, and answers "which tables does this
//! expression depend on" with per-node memoization.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::expr::Expr;

#[derive(Debug, Error)]
pub enum SemanticError {
    #[error("unknown table or alias: {0}")]
    UnknownTable(String),
    #[error("column {0} not found in any table in scope")]
    UnresolvedColumn(String),
    #[error("column {0} is ambiguous")]
    AmbiguousColumn(String),
}

const WORD_BITS: usize = 64;

/// Set of table ordinals, held as a word vector with no trailing zero words
/// so equality and hashing are structural. Ordinals are unbounded; sets over
/// hundreds of tables cost one word per 64 ordinals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableSet {
    words: Vec<u64>,
}

impl TableSet {
    pub fn empty() -> TableSet {
        TableSet::default()
    }

    /// Singleton set for one table ordinal; the atomic unit every other set
    /// is built from via `merge`.
    pub fn single(ordinal: usize) -> TableSet {
        let mut words = vec![0u64; ordinal / WORD_BITS + 1];
        words[ordinal / WORD_BITS] = 1u64 << (ordinal % WORD_BITS);
        TableSet { words }
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn contains(&self, ordinal: usize) -> bool {
        self.words
            .get(ordinal / WORD_BITS)
            .is_some_and(|w| w & (1u64 << (ordinal % WORD_BITS)) != 0)
    }

    /// Union.
    pub fn merge(&self, other: &TableSet) -> TableSet {
        let mut out = self.clone();
        out.merge_in_place(other);
        out
    }

    pub fn merge_in_place(&mut self, other: &TableSet) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w |= o;
        }
    }

    /// Subset test: true when every table in `self` is also in `other`.
    pub fn is_solved_by(&self, other: &TableSet) -> bool {
        if self.words.len() > other.words.len() {
            return false;
        }
        self.words.iter().zip(&other.words).all(|(w, o)| w & !o == 0)
    }

    /// Intersection test.
    pub fn is_overlapping(&self, other: &TableSet) -> bool {
        self.words.iter().zip(&other.words).any(|(w, o)| w & o != 0)
    }

    pub fn number_of_tables(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Decomposes into singleton sets in ascending ordinal order.
    pub fn constituents(&self) -> Vec<TableSet> {
        self.ordinals().map(TableSet::single).collect()
    }

    /// Set difference: drops every table present in `other`.
    pub fn remove_in_place(&mut self, other: &TableSet) {
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w &= !o;
        }
        self.normalize();
    }

    /// Set intersection: keeps only tables also present in `other`.
    pub fn keep_only(&mut self, other: &TableSet) {
        if other.words.len() < self.words.len() {
            self.words.truncate(other.words.len());
        }
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w &= o;
        }
        self.normalize();
    }

    fn ordinals(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(idx, word)| {
            (0..WORD_BITS).filter_map(move |bit| {
                if word & (1u64 << bit) != 0 {
                    Some(idx * WORD_BITS + bit)
                } else {
                    None
                }
            })
        })
    }

    fn normalize(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }
}

/// One table brought into scope, with the columns it declares.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub alias: String,
    pub columns: Vec<String>,
}

/// Sidecar produced by semantic analysis: table ordinals plus memoized
/// expression-dependency lookups. Built once per statement; the memo uses a
/// mutex so the table stays shareable, but the lock is never held across a
/// recursive step.
#[derive(Debug, Default)]
pub struct SemTable {
    tables: Vec<TableInfo>,
    by_alias: FxHashMap<String, usize>,
    subquery_deps: FxHashMap<usize, TableSet>,
    deps_memo: Mutex<FxHashMap<Expr, TableSet>>,
}

impl SemTable {
    pub fn new() -> SemTable {
        SemTable::default()
    }

    /// Brings a table into scope, assigning it the next ordinal.
    pub fn add_table(&mut self, alias: &str, columns: &[&str]) -> TableSet {
        let ordinal = self.tables.len();
        self.tables.push(TableInfo {
            alias: alias.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self.by_alias.insert(alias.to_string(), ordinal);
        TableSet::single(ordinal)
    }

    pub fn table_set(&self, alias: &str) -> Option<TableSet> {
        self.by_alias.get(alias).map(|&ord| TableSet::single(ord))
    }

    /// Records the tables an opaque subquery handle depends on.
    pub fn register_subquery(&mut self, handle: usize, deps: TableSet) {
        self.subquery_deps.insert(handle, deps);
    }

    /// Which tables does this expression transitively depend on? Memoized
    /// per expression node.
    pub fn recursive_deps(&self, expr: &Expr) -> Result<TableSet, SemanticError> {
        if let Some(hit) = self.deps_memo.lock().get(expr) {
            return Ok(hit.clone());
        }
        let deps = self.compute_deps(expr)?;
        self.deps_memo.lock().insert(expr.clone(), deps.clone());
        Ok(deps)
    }

    fn compute_deps(&self, expr: &Expr) -> Result<TableSet, SemanticError> {
        match expr {
            Expr::Column { table, name } => self.resolve_column(table.as_deref(), name),
            Expr::Literal(_) | Expr::BindParam(_) => Ok(TableSet::empty()),
            Expr::Binary { left, right, .. } => {
                Ok(self.recursive_deps(left)?.merge(&self.recursive_deps(right)?))
            }
            Expr::InList { lhs, list, .. } => {
                let mut deps = self.recursive_deps(lhs)?;
                for item in list {
                    deps.merge_in_place(&self.recursive_deps(item)?);
                }
                Ok(deps)
            }
            Expr::IsNull { inner, .. } => self.recursive_deps(inner),
            Expr::Subquery(handle) => Ok(self
                .subquery_deps
                .get(handle)
                .cloned()
                .unwrap_or_default()),
        }
    }

    fn resolve_column(&self, table: Option<&str>, name: &str) -> Result<TableSet, SemanticError> {
        if let Some(alias) = table {
            return self
                .table_set(alias)
                .ok_or_else(|| SemanticError::UnknownTable(alias.to_string()));
        }
        let mut owner = None;
        for (ordinal, info) in self.tables.iter().enumerate() {
            if info.columns.iter().any(|c| c == name) {
                if owner.is_some() {
                    return Err(SemanticError::AmbiguousColumn(name.to_string()));
                }
                owner = Some(ordinal);
            }
        }
        match owner {
            Some(ordinal) => Ok(TableSet::single(ordinal)),
            None => Err(SemanticError::UnresolvedColumn(name.to_string())),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
