//! Fault-injecting store wrapper.
//!
//! Wraps any [`StoreProvider`] and lets a test (or the CLI's chaos flags)
//! make a scope unreachable or script the outcome of its next transactions.
//! This is how crashes between protocol steps are reproduced: the engine sees
//! exactly the errors a dead network or a lost commit acknowledgement would
//! produce.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

use super::{Compare, MapStore, Query, Rows, StoreError, StoreOp, StoreProvider, StoreResult, StoreScope};

/// Injected outcome for one transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Fails before anything is written.
    Unavailable,
    /// Fails before anything is written, reported as a timeout.
    Timeout,
    /// Commits, then reports a timeout to the caller.
    CommitThenTimeout,
}

#[derive(Default)]
struct FaultPlan {
    unreachable: bool,
    /// One entry per upcoming transaction; `None` passes through.
    script: VecDeque<Option<Fault>>,
}

type Plans = Arc<Mutex<HashMap<StoreScope, FaultPlan>>>;

pub struct FaultyStoreProvider {
    inner: Arc<dyn StoreProvider>,
    plans: Plans,
}

impl FaultyStoreProvider {
    pub fn new(inner: Arc<dyn StoreProvider>) -> Self {
        Self {
            inner,
            plans: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Reads, writes and new connections to `scope` fail while set.
    pub fn set_unreachable(&self, scope: &StoreScope, unreachable: bool) {
        self.plans.lock().entry(scope.clone()).or_default().unreachable = unreachable;
    }

    /// Fails the next `count` transactions on `scope` with `fault`.
    pub fn fail_next(&self, scope: &StoreScope, count: usize, fault: Fault) {
        let mut plans = self.plans.lock();
        let plan = plans.entry(scope.clone()).or_default();
        plan.script.clear();
        plan.script.extend(std::iter::repeat(Some(fault)).take(count));
    }

    /// Replaces the per-transaction script for `scope`.
    pub fn script(&self, scope: &StoreScope, outcomes: Vec<Option<Fault>>) {
        let mut plans = self.plans.lock();
        plans.entry(scope.clone()).or_default().script = outcomes.into();
    }

    /// Drops every injected fault.
    pub fn heal(&self) {
        self.plans.lock().clear();
    }
}

fn unreachable(plans: &Plans, scope: &StoreScope) -> bool {
    plans.lock().get(scope).map_or(false, |p| p.unreachable)
}

impl StoreProvider for FaultyStoreProvider {
    fn connect(&self, scope: &StoreScope) -> StoreResult<Arc<dyn MapStore>> {
        if unreachable(&self.plans, scope) {
            return Err(StoreError::Unavailable(format!("{} is unreachable", scope)));
        }
        Ok(Arc::new(FaultyStore {
            inner: self.inner.connect(scope)?,
            plans: self.plans.clone(),
        }))
    }
}

struct FaultyStore {
    inner: Arc<dyn MapStore>,
    plans: Plans,
}

impl FaultyStore {
    fn next_fault(&self) -> StoreResult<Option<Fault>> {
        let scope = self.inner.scope();
        let mut plans = self.plans.lock();
        let Some(plan) = plans.get_mut(scope) else {
            return Ok(None);
        };
        if plan.unreachable {
            return Err(StoreError::Unavailable(format!("{} is unreachable", scope)));
        }
        Ok(plan.script.pop_front().flatten())
    }
}

impl MapStore for FaultyStore {
    fn scope(&self) -> &StoreScope {
        self.inner.scope()
    }

    fn read(&self, query: Query) -> StoreResult<Rows> {
        if unreachable(&self.plans, self.inner.scope()) {
            return Err(StoreError::Unavailable(format!(
                "{} is unreachable",
                self.inner.scope()
            )));
        }
        self.inner.read(query)
    }

    fn txn(&self, compares: Vec<Compare>, ops: Vec<StoreOp>) -> StoreResult<()> {
        let scope = self.inner.scope();
        match self.next_fault()? {
            None => self.inner.txn(compares, ops),
            Some(Fault::Unavailable) => {
                debug!(scope = %scope, "Injected unavailable fault");
                Err(StoreError::Unavailable(format!("injected fault on {}", scope)))
            }
            Some(Fault::Timeout) => {
                debug!(scope = %scope, "Injected timeout fault");
                Err(StoreError::Timeout(format!("injected fault on {}", scope)))
            }
            Some(Fault::CommitThenTimeout) => {
                self.inner.txn(compares, ops)?;
                debug!(scope = %scope, "Injected timeout after commit");
                Err(StoreError::Timeout(format!("injected fault on {} after commit", scope)))
            }
        }
    }
}
