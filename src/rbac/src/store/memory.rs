//! In-process assignment store
//!
//! Keeps assignments, the scope hierarchy and the audit log behind a
//! `parking_lot` mutex. Transactions work on a private copy and replay
//! their journal onto the shared state at commit, so uncommitted writes are
//! never visible to other callers. Fault injection hooks let tests simulate
//! connection trouble and audit outages.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{AssignmentStore, StoreTransaction};
use crate::error::{StoreError, StoreResult};
use crate::types::{AuditEntry, RoleAssignment, ScopeRef};

#[derive(Debug, Clone, Default)]
struct State {
    assignments: Vec<RoleAssignment>,
    hierarchy: HashMap<ScopeRef, ScopeRef>,
    audit: Vec<AuditEntry>,
}

impl State {
    fn role_names(&self, user_id: &str, scope_type: &str, scope_id: &str) -> Vec<String> {
        self.assignments
            .iter()
            .filter(|a| a.user_id == user_id && a.scope_type == scope_type && a.scope_id == scope_id)
            .map(|a| a.role.clone())
            .collect()
    }

    fn contains(&self, assignment: &RoleAssignment) -> bool {
        self.assignments.iter().any(|a| {
            a.is_same_grant(
                &assignment.user_id,
                &assignment.role,
                &assignment.scope_type,
                &assignment.scope_id,
            )
        })
    }

    fn insert(&mut self, assignment: &RoleAssignment) -> StoreResult<()> {
        if self.contains(assignment) {
            return Err(StoreError::Duplicate(format!(
                "{}/{}/{}",
                assignment.user_id,
                assignment.role,
                assignment.scope()
            )));
        }
        self.assignments.push(assignment.clone());
        Ok(())
    }

    fn delete(&mut self, user_id: &str, role: &str, scope_type: &str, scope_id: &str) -> u64 {
        let before = self.assignments.len();
        self.assignments
            .retain(|a| !a.is_same_grant(user_id, role, scope_type, scope_id));
        (before - self.assignments.len()) as u64
    }
}

#[derive(Debug, Default)]
struct Faults {
    writes: VecDeque<Option<StoreError>>,
    reads: VecDeque<Option<StoreError>>,
    audit: Option<StoreError>,
}

#[derive(Debug, Clone)]
enum Op {
    Insert(RoleAssignment),
    Delete {
        user_id: String,
        role: String,
        scope_type: String,
        scope_id: String,
    },
    Audit(AuditEntry),
}

/// Assignment store held entirely in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    faults: Arc<Mutex<Faults>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `parent` as the parent of `child` in the scope hierarchy
    pub fn set_parent(&self, child: ScopeRef, parent: ScopeRef) {
        self.state.lock().hierarchy.insert(child, parent);
    }

    /// Snapshot of every stored assignment
    pub fn assignments(&self) -> Vec<RoleAssignment> {
        self.state.lock().assignments.clone()
    }

    /// Snapshot of the audit log, oldest first
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.state.lock().audit.clone()
    }

    /// Number of rows for the exact grant (0 or 1)
    pub fn count(&self, user_id: &str, role: &str, scope_type: &str, scope_id: &str) -> usize {
        self.state
            .lock()
            .assignments
            .iter()
            .filter(|a| a.is_same_grant(user_id, role, scope_type, scope_id))
            .count()
    }

    /// Fail the next `times` write calls with `error`
    pub fn fail_writes(&self, times: usize, error: StoreError) {
        self.fail_writes_after(0, times, error);
    }

    /// Let `skip` write calls through, then fail the following `times`
    pub fn fail_writes_after(&self, skip: usize, times: usize, error: StoreError) {
        let mut faults = self.faults.lock();
        queue_faults(&mut faults.writes, skip, times, error);
    }

    /// Fail the next `times` read calls with `error`
    pub fn fail_reads(&self, times: usize, error: StoreError) {
        self.fail_reads_after(0, times, error);
    }

    /// Let `skip` read calls through, then fail the following `times`
    pub fn fail_reads_after(&self, skip: usize, times: usize, error: StoreError) {
        let mut faults = self.faults.lock();
        queue_faults(&mut faults.reads, skip, times, error);
    }

    /// Fail every audit append with `error` until cleared with `None`
    pub fn fail_audit(&self, error: Option<StoreError>) {
        self.faults.lock().audit = error;
    }

    fn next_write_fault(&self) -> StoreResult<()> {
        take_fault(&self.faults, |f| f.writes.pop_front().flatten())
    }

    fn next_read_fault(&self) -> StoreResult<()> {
        take_fault(&self.faults, |f| f.reads.pop_front().flatten())
    }

    fn audit_fault(&self) -> StoreResult<()> {
        take_fault(&self.faults, |f| f.audit.clone())
    }
}

fn queue_faults(
    queue: &mut VecDeque<Option<StoreError>>,
    skip: usize,
    times: usize,
    error: StoreError,
) {
    queue.extend(std::iter::repeat(None).take(skip));
    queue.extend(std::iter::repeat(Some(error)).take(times));
}

fn take_fault(
    faults: &Mutex<Faults>,
    pick: impl FnOnce(&mut Faults) -> Option<StoreError>,
) -> StoreResult<()> {
    match pick(&mut faults.lock()) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[async_trait]
impl AssignmentStore for MemoryStore {
    async fn user_assignments(&self, user_id: &str) -> StoreResult<Vec<RoleAssignment>> {
        self.next_read_fault()?;
        Ok(self
            .state
            .lock()
            .assignments
            .iter()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn role_names(
        &self,
        user_id: &str,
        scope_type: &str,
        scope_id: &str,
    ) -> StoreResult<Vec<String>> {
        self.next_read_fault()?;
        Ok(self.state.lock().role_names(user_id, scope_type, scope_id))
    }

    async fn insert_assignment(&self, assignment: &RoleAssignment) -> StoreResult<()> {
        self.next_write_fault()?;
        self.state.lock().insert(assignment)
    }

    async fn insert_assignment_ignore(&self, assignment: &RoleAssignment) -> StoreResult<u64> {
        self.next_write_fault()?;
        match self.state.lock().insert(assignment) {
            Ok(()) => Ok(1),
            Err(StoreError::Duplicate(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    async fn delete_assignment(
        &self,
        user_id: &str,
        role: &str,
        scope_type: &str,
        scope_id: &str,
    ) -> StoreResult<u64> {
        self.next_write_fault()?;
        Ok(self.state.lock().delete(user_id, role, scope_type, scope_id))
    }

    async fn parent_scope(&self, scope_type: &str, scope_id: &str) -> StoreResult<Option<ScopeRef>> {
        self.next_read_fault()?;
        Ok(self
            .state
            .lock()
            .hierarchy
            .get(&ScopeRef::new(scope_type, scope_id))
            .cloned())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> StoreResult<()> {
        self.audit_fault()?;
        self.state.lock().audit.push(entry.clone());
        Ok(())
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        self.next_write_fault()?;
        let working = self.state.lock().clone();
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            working,
            journal: Vec::new(),
            savepoints: Vec::new(),
        }))
    }
}

/// Transaction over a [`MemoryStore`]
pub struct MemoryTransaction {
    store: MemoryStore,
    working: State,
    journal: Vec<Op>,
    savepoints: Vec<(String, usize, State)>,
}

impl MemoryTransaction {
    fn find_savepoint(&self, name: &str) -> StoreResult<usize> {
        self.savepoints
            .iter()
            .rposition(|(n, _, _)| n == name)
            .ok_or_else(|| StoreError::Other(format!("savepoint '{}' does not exist", name)))
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn role_names(
        &mut self,
        user_id: &str,
        scope_type: &str,
        scope_id: &str,
    ) -> StoreResult<Vec<String>> {
        self.store.next_read_fault()?;
        Ok(self.working.role_names(user_id, scope_type, scope_id))
    }

    async fn batch_insert(&mut self, rows: &[RoleAssignment], batch_size: usize) -> StoreResult<u64> {
        self.store.next_write_fault()?;

        // All-or-nothing across chunks
        let mut staged = self.working.clone();
        for chunk in rows.chunks(batch_size.max(1)) {
            for row in chunk {
                staged.insert(row)?;
            }
        }

        self.working = staged;
        self.journal.extend(rows.iter().cloned().map(Op::Insert));
        Ok(rows.len() as u64)
    }

    async fn delete_assignment(
        &mut self,
        user_id: &str,
        role: &str,
        scope_type: &str,
        scope_id: &str,
    ) -> StoreResult<u64> {
        self.store.next_write_fault()?;
        let affected = self.working.delete(user_id, role, scope_type, scope_id);
        if affected > 0 {
            self.journal.push(Op::Delete {
                user_id: user_id.to_string(),
                role: role.to_string(),
                scope_type: scope_type.to_string(),
                scope_id: scope_id.to_string(),
            });
        }
        Ok(affected)
    }

    async fn append_audit(&mut self, entry: &AuditEntry) -> StoreResult<()> {
        self.store.audit_fault()?;
        self.working.audit.push(entry.clone());
        self.journal.push(Op::Audit(entry.clone()));
        Ok(())
    }

    async fn savepoint(&mut self, name: &str) -> StoreResult<()> {
        self.savepoints
            .push((name.to_string(), self.journal.len(), self.working.clone()));
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> StoreResult<()> {
        let idx = self.find_savepoint(name)?;
        self.savepoints.truncate(idx);
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> StoreResult<()> {
        let idx = self.find_savepoint(name)?;
        let (_, journal_len, snapshot) = self.savepoints[idx].clone();
        self.journal.truncate(journal_len);
        self.working = snapshot;
        // The savepoint itself survives a rollback to it
        self.savepoints.truncate(idx + 1);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTransaction { store, journal, .. } = *self;
        let mut shared = store.state.lock();
        let mut next = shared.clone();

        for op in journal {
            match op {
                Op::Insert(row) => next.insert(&row)?,
                Op::Delete {
                    user_id,
                    role,
                    scope_type,
                    scope_id,
                } => {
                    next.delete(&user_id, &role, &scope_type, &scope_id);
                }
                Op::Audit(entry) => next.audit.push(entry),
            }
        }

        *shared = next;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
