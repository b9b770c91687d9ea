//! Distributed session coordination.
//!
//! `SafeSession` tracks, per logical connection, which shards currently
//! participate in an open transaction or reserved connection, in what
//! commit order, and whether autocommit is still safe. Every statement
//! execution mutates it.
//!
//! One `parking_lot::Mutex` guards all state; public operations lock for
//! their full duration and never perform I/O under the lock, so hold times
//! are pure in-memory mutation. Methods never call each other while holding
//! the guard.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("multi-db transaction attempted: {0} shard sessions active in single-db mode")]
    MultiDbTransaction(usize),
    #[error("cannot track shard session: not in transaction and no reserved connection")]
    NotInTransaction,
    #[error("cannot track shard session: statement already auto-committed")]
    AlreadyAutoCommitted,
    #[error("tablet alias changed for shard {shard}: had {was}, got {now}")]
    TabletAliasMismatch {
        shard: String,
        was: String,
        now: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabletType {
    Primary,
    Replica,
    Rdonly,
}

/// Shard-count policy for the connection's transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMode {
    #[default]
    Unspecified,
    /// At most one shard may join the transaction.
    Single,
    /// Best-effort commit across shards.
    Multi,
    /// Two-phase commit across shards.
    TwoPc,
}

/// The bucket a shard session belongs to, controlling multi-phase commit
/// sequencing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOrder {
    #[default]
    Normal,
    Pre,
    Post,
}

/// Autocommit eligibility for the current statement. Monotonic forward
/// within one statement's lifecycle; reset by `reset`/`reset_tx`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutocommitState {
    #[default]
    NotAutoCommittable,
    AutoCommittable,
    AutoCommitted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub keyspace: String,
    pub shard: String,
    pub tablet_type: TabletType,
}

impl Target {
    pub fn new(keyspace: impl Into<String>, shard: impl Into<String>, tablet_type: TabletType) -> Target {
        Target {
            keyspace: keyspace.into(),
            shard: shard.into(),
            tablet_type,
        }
    }

    fn same_shard(&self, other: &Target) -> bool {
        self.keyspace == other.keyspace
            && self.tablet_type == other.tablet_type
            && self.shard == other.shard
    }
}

/// One shard's participation in the session: its open transaction and/or
/// reserved-connection ids, and the tablet serving it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSession {
    pub target: Target,
    pub transaction_id: i64,
    pub reserved_id: i64,
    pub tablet_alias: String,
}

/// The serializable session wire shape: what would be persisted or migrated
/// if a logical connection moves between gateway processes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub in_transaction: bool,
    pub in_reserved_conn: bool,
    pub autocommit: bool,
    pub transaction_mode: TransactionMode,
    pub autocommit_state: AutocommitState,
    pub commit_order: CommitOrder,
    pub must_rollback: bool,
    pub savepoints: Vec<String>,
    pub shard_sessions: Vec<ShardSession>,
    pub pre_sessions: Vec<ShardSession>,
    pub post_sessions: Vec<ShardSession>,
}

/// Lock-guarded per-connection session handle.
#[derive(Debug, Default)]
pub struct SafeSession {
    state: Mutex<SessionState>,
}

impl SafeSession {
    pub fn new(state: SessionState) -> SafeSession {
        SafeSession {
            state: Mutex::new(state),
        }
    }

    /// Clones the wire shape for persistence or inspection.
    pub fn snapshot(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn begin(&self) {
        self.state.lock().in_transaction = true;
    }

    pub fn in_transaction(&self) -> bool {
        self.state.lock().in_transaction
    }

    pub fn set_reserved_conn(&self, reserved: bool) {
        self.state.lock().in_reserved_conn = reserved;
    }

    pub fn in_reserved_conn(&self) -> bool {
        self.state.lock().in_reserved_conn
    }

    pub fn set_transaction_mode(&self, mode: TransactionMode) {
        self.state.lock().transaction_mode = mode;
    }

    pub fn set_commit_order(&self, order: CommitOrder) {
        self.state.lock().commit_order = order;
    }

    pub fn commit_order(&self) -> CommitOrder {
        self.state.lock().commit_order
    }

    pub fn set_must_rollback(&self) {
        self.state.lock().must_rollback = true;
    }

    /// Sticky until the next `reset_tx`/`reset`; callers check it before
    /// doing further work on the session.
    pub fn must_rollback(&self) -> bool {
        self.state.lock().must_rollback
    }

    pub fn add_savepoint(&self, name: impl Into<String>) {
        self.state.lock().savepoints.push(name.into());
    }

    pub fn savepoints(&self) -> Vec<String> {
        self.state.lock().savepoints.clone()
    }

    /// Marks the current statement autocommittable (or not). A statement
    /// that already auto-committed keeps its state.
    pub fn set_autocommittable(&self, autocommittable: bool) {
        let mut state = self.state.lock();
        if state.autocommit_state == AutocommitState::AutoCommitted {
            return;
        }
        state.autocommit_state = if autocommittable {
            AutocommitState::AutoCommittable
        } else {
            AutocommitState::NotAutoCommittable
        };
    }

    pub fn autocommit_state(&self) -> AutocommitState {
        self.state.lock().autocommit_state
    }

    /// The single allowed transition into `AutoCommitted`. Returns whether
    /// the caller is responsible for auto-committing: true only on the
    /// AutoCommittable -> AutoCommitted edge.
    pub fn autocommit_approval(&self) -> bool {
        let mut state = self.state.lock();
        match state.autocommit_state {
            AutocommitState::AutoCommitted => {
                // The state machine is designed to make this unreachable.
                warn!("autocommit approval requested after statement already auto-committed");
                false
            }
            AutocommitState::AutoCommittable => {
                state.autocommit_state = AutocommitState::AutoCommitted;
                true
            }
            AutocommitState::NotAutoCommittable => false,
        }
    }

    /// Tracks a shard's participation, keyed by (keyspace, tablet type,
    /// shard) within the current commit-order bucket. An existing entry is
    /// replaced, never duplicated; a changed tablet alias for the same
    /// shard indicates a topology inconsistency and fails the statement.
    ///
    /// Under Normal commit order, single-db transaction mode is enforced
    /// here: a second distinct shard sets `must_rollback` and fails, so an
    /// accidental cross-shard write becomes a forced rollback instead of a
    /// silent partial commit. The list itself keeps both entries; only the
    /// caller's transaction is expected to roll back.
    pub fn append_or_update(
        &self,
        session: ShardSession,
        tx_mode: TransactionMode,
    ) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if state.autocommit_state == AutocommitState::AutoCommitted {
            return Err(SessionError::AlreadyAutoCommitted);
        }
        if !state.in_transaction && !state.in_reserved_conn {
            return Err(SessionError::NotInTransaction);
        }
        // Once a shard session is tracked, this statement cannot autocommit.
        state.autocommit_state = AutocommitState::NotAutoCommittable;

        let commit_order = state.commit_order;
        let effective_mode = if tx_mode == TransactionMode::Unspecified {
            state.transaction_mode
        } else {
            tx_mode
        };

        {
            let list = match commit_order {
                CommitOrder::Normal => &mut state.shard_sessions,
                CommitOrder::Pre => &mut state.pre_sessions,
                CommitOrder::Post => &mut state.post_sessions,
            };
            if let Some(existing) = list.iter_mut().find(|s| s.target.same_shard(&session.target)) {
                if existing.tablet_alias != session.tablet_alias {
                    return Err(SessionError::TabletAliasMismatch {
                        shard: session.target.shard.clone(),
                        was: existing.tablet_alias.clone(),
                        now: session.tablet_alias,
                    });
                }
                *existing = session;
            } else {
                list.push(session);
            }
        }

        if commit_order == CommitOrder::Normal
            && effective_mode == TransactionMode::Single
            && state.shard_sessions.len() > 1
        {
            state.must_rollback = true;
            warn!(
                shard_sessions = state.shard_sessions.len(),
                "single-db transaction crossed shards, forcing rollback"
            );
            return Err(SessionError::MultiDbTransaction(state.shard_sessions.len()));
        }
        Ok(())
    }

    /// Looks up the transaction/reserved id pair for a shard in the current
    /// commit-order bucket; zeros when the shard is not tracked. Used to
    /// decide whether a new shard session must be opened or an existing one
    /// reused.
    pub fn find(&self, keyspace: &str, shard: &str, tablet_type: TabletType) -> (i64, i64) {
        let state = self.state.lock();
        let list = match state.commit_order {
            CommitOrder::Normal => &state.shard_sessions,
            CommitOrder::Pre => &state.pre_sessions,
            CommitOrder::Post => &state.post_sessions,
        };
        for session in list {
            if session.target.keyspace == keyspace
                && session.target.shard == shard
                && session.target.tablet_type == tablet_type
            {
                return (session.transaction_id, session.reserved_id);
            }
        }
        (0, 0)
    }

    /// Clears transaction-scoped state. Shard/pre/post session lists are
    /// preserved while a reserved connection is active: the physical
    /// connections stay open across transaction boundaries.
    pub fn reset_tx(&self) {
        let mut state = self.state.lock();
        state.in_transaction = false;
        state.autocommit_state = AutocommitState::NotAutoCommittable;
        state.must_rollback = false;
        state.commit_order = CommitOrder::Normal;
        state.savepoints.clear();
        if !state.in_reserved_conn {
            state.shard_sessions.clear();
            state.pre_sessions.clear();
            state.post_sessions.clear();
        }
    }

    /// Full reset for connection teardown: like `reset_tx` but the session
    /// lists are cleared unconditionally.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.in_transaction = false;
        state.autocommit_state = AutocommitState::NotAutoCommittable;
        state.must_rollback = false;
        state.commit_order = CommitOrder::Normal;
        state.savepoints.clear();
        state.shard_sessions.clear();
        state.pre_sessions.clear();
        state.post_sessions.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn shard_session(shard: &str, tx_id: i64) -> ShardSession {
        ShardSession {
            target: Target::new("commerce", shard, TabletType::Primary),
            transaction_id: tx_id,
            reserved_id: 0,
            tablet_alias: format!("cell-0000000{tx_id}"),
        }
    }

    fn in_tx_session(mode: TransactionMode) -> SafeSession {
        let session = SafeSession::default();
        session.set_transaction_mode(mode);
        session.begin();
        session
    }

    #[test]
    fn single_mode_rejects_second_distinct_shard() {
        let session = in_tx_session(TransactionMode::Single);
        session
            .append_or_update(shard_session("-80", 1), TransactionMode::Unspecified)
            .unwrap();
        let err = session
            .append_or_update(shard_session("80-", 2), TransactionMode::Unspecified)
            .unwrap_err();
        assert!(matches!(err, SessionError::MultiDbTransaction(2)));
        assert!(session.must_rollback());
        // The failed append does not roll back the list itself.
        assert_eq!(session.find("commerce", "-80", TabletType::Primary), (1, 0));
        assert_eq!(session.find("commerce", "80-", TabletType::Primary), (2, 0));
    }

    #[test]
    fn same_shard_append_replaces_without_duplicating() {
        let session = in_tx_session(TransactionMode::Single);
        let mut first = shard_session("-80", 1);
        first.tablet_alias = "cell-1".to_string();
        let mut second = shard_session("-80", 9);
        second.tablet_alias = "cell-1".to_string();
        session.append_or_update(first, TransactionMode::Unspecified).unwrap();
        session.append_or_update(second, TransactionMode::Unspecified).unwrap();
        let state = session.snapshot();
        assert_eq!(state.shard_sessions.len(), 1);
        assert_eq!(state.shard_sessions[0].transaction_id, 9);
        assert!(!session.must_rollback());
    }

    #[test]
    fn changed_tablet_alias_is_a_topology_error() {
        let session = in_tx_session(TransactionMode::Multi);
        session
            .append_or_update(shard_session("-80", 1), TransactionMode::Unspecified)
            .unwrap();
        let err = session
            .append_or_update(shard_session("-80", 2), TransactionMode::Unspecified)
            .unwrap_err();
        assert!(matches!(err, SessionError::TabletAliasMismatch { .. }));
        // Entry is untouched on failure.
        assert_eq!(session.find("commerce", "-80", TabletType::Primary), (1, 0));
    }

    #[test]
    fn multi_mode_allows_cross_shard_sessions() {
        let session = in_tx_session(TransactionMode::Multi);
        session
            .append_or_update(shard_session("-80", 1), TransactionMode::Unspecified)
            .unwrap();
        session
            .append_or_update(shard_session("80-", 2), TransactionMode::Unspecified)
            .unwrap();
        assert_eq!(session.snapshot().shard_sessions.len(), 2);
        assert!(!session.must_rollback());
    }

    #[test]
    fn explicit_mode_argument_overrides_connection_default() {
        let session = in_tx_session(TransactionMode::Multi);
        session
            .append_or_update(shard_session("-80", 1), TransactionMode::Single)
            .unwrap();
        assert!(session
            .append_or_update(shard_session("80-", 2), TransactionMode::Single)
            .is_err());
    }

    #[test]
    fn append_requires_transaction_or_reserved_conn() {
        let session = SafeSession::default();
        assert!(matches!(
            session.append_or_update(shard_session("-80", 1), TransactionMode::Unspecified),
            Err(SessionError::NotInTransaction)
        ));

        session.set_reserved_conn(true);
        session
            .append_or_update(shard_session("-80", 1), TransactionMode::Unspecified)
            .unwrap();
    }

    #[test]
    fn append_after_autocommit_is_an_invariant_error() {
        let session = in_tx_session(TransactionMode::Multi);
        session.set_autocommittable(true);
        assert!(session.autocommit_approval());
        assert!(matches!(
            session.append_or_update(shard_session("-80", 1), TransactionMode::Unspecified),
            Err(SessionError::AlreadyAutoCommitted)
        ));
    }

    #[test]
    fn autocommit_approval_fires_exactly_once() {
        let session = SafeSession::default();
        assert!(!session.autocommit_approval());

        session.set_autocommittable(true);
        assert!(session.autocommit_approval());
        assert_eq!(session.autocommit_state(), AutocommitState::AutoCommitted);
        // Defensive path: already committed.
        assert!(!session.autocommit_approval());
        // set_autocommittable cannot pull the state back.
        session.set_autocommittable(true);
        assert_eq!(session.autocommit_state(), AutocommitState::AutoCommitted);
    }

    #[test]
    fn tracking_a_shard_session_kills_autocommit() {
        let session = in_tx_session(TransactionMode::Multi);
        session.set_autocommittable(true);
        session
            .append_or_update(shard_session("-80", 1), TransactionMode::Unspecified)
            .unwrap();
        assert!(!session.autocommit_approval());
    }

    #[test]
    fn commit_order_buckets_are_independent() {
        let session = in_tx_session(TransactionMode::Single);
        session
            .append_or_update(shard_session("-80", 1), TransactionMode::Unspecified)
            .unwrap();
        // Pre-transaction work on another shard does not trip single-db
        // enforcement, which applies to the Normal bucket only.
        session.set_commit_order(CommitOrder::Pre);
        session
            .append_or_update(shard_session("80-", 2), TransactionMode::Unspecified)
            .unwrap();
        assert_eq!(session.find("commerce", "80-", TabletType::Primary), (2, 0));
        session.set_commit_order(CommitOrder::Normal);
        assert_eq!(session.find("commerce", "80-", TabletType::Primary), (0, 0));
    }

    #[test]
    fn reset_tx_preserves_sessions_for_reserved_connections() {
        let session = in_tx_session(TransactionMode::Multi);
        session.set_reserved_conn(true);
        session.add_savepoint("sp1");
        session
            .append_or_update(shard_session("-80", 1), TransactionMode::Unspecified)
            .unwrap();
        session.set_must_rollback();

        session.reset_tx();
        let state = session.snapshot();
        assert!(!state.in_transaction);
        assert!(!state.must_rollback);
        assert!(state.savepoints.is_empty());
        assert_eq!(state.commit_order, CommitOrder::Normal);
        // Reserved connections stay open across transaction boundaries.
        assert_eq!(state.shard_sessions.len(), 1);
    }

    #[test]
    fn reset_tx_clears_sessions_without_reserved_conn() {
        let session = in_tx_session(TransactionMode::Multi);
        session
            .append_or_update(shard_session("-80", 1), TransactionMode::Unspecified)
            .unwrap();
        session.reset_tx();
        assert!(session.snapshot().shard_sessions.is_empty());
    }

    #[test]
    fn reset_clears_unconditionally() {
        let session = in_tx_session(TransactionMode::Multi);
        session.set_reserved_conn(true);
        session
            .append_or_update(shard_session("-80", 1), TransactionMode::Unspecified)
            .unwrap();
        session.reset();
        let state = session.snapshot();
        assert!(state.shard_sessions.is_empty());
        assert!(state.pre_sessions.is_empty());
        assert!(state.post_sessions.is_empty());
    }

    #[test]
    fn wire_shape_round_trips_through_serde() {
        let session = in_tx_session(TransactionMode::Single);
        session
            .append_or_update(shard_session("-80", 42), TransactionMode::Unspecified)
            .unwrap();
        let state = session.snapshot();
        let json = serde_json::to_string(&state).unwrap();
        let restored: SessionState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);

        let revived = SafeSession::new(restored);
        assert_eq!(revived.find("commerce", "-80", TabletType::Primary), (42, 0));
    }
}
