pub mod expr;
pub mod keyrange;
pub mod operators;
pub mod routing;
pub mod semantics;
pub mod session;
pub mod vindex;

pub use expr::{and_opt, conjoin, split_conjunction, BinaryOp, Expr, Value};
pub use keyrange::{
    build_references, compare_bytes, KeyRange, KeyRangeError, ShardMapCache, ShardReference,
};
pub use operators::{
    Concatenate, Derived, Filter, Join, Operator, OrderSpec, PlanError, QueryGraph, QueryTable,
    SubQuery, SubQueryInner, SubqueryKind,
};
pub use routing::{
    resolve_destination, resolve_destinations, shards_for_plan, PlanValue, RouteOpcode, RoutePlan,
    RoutingError, TableRouting,
};
pub use semantics::{SemTable, SemanticError, TableInfo, TableSet};
pub use session::{
    AutocommitState, CommitOrder, SafeSession, SessionError, SessionState, ShardSession,
    TabletType, Target, TransactionMode,
};
pub use vindex::{Destination, Vindex, VindexError};
