//! An in-memory rule table.
//!
//! Rules are kept per table in the order they were appended, and every operation is recorded in
//! a journal so that the sequence of changes can be inspected after the fact. This backs the
//! balancer's dry-run mode and its tests.

use crate::{RuleSpec, RuleTable, Table};
use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default)]
pub struct MemoryTable {
    state: Mutex<State>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Add(Table, RuleSpec),
    Delete(Table, RuleSpec),
}

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<Table, Vec<RuleSpec>>,
    journal: Vec<Op>,
    fail_adds: bool,
    fail_adds_to: BTreeSet<Table>,
    fail_deletes: bool,
}

// === impl MemoryTable ===

impl MemoryTable {
    /// Returns the rules currently installed in `table`, in order.
    pub fn rules(&self, table: Table) -> Vec<RuleSpec> {
        self.state
            .lock()
            .tables
            .get(&table)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the total number of rules installed across all tables.
    pub fn len(&self) -> usize {
        self.state.lock().tables.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns every successful operation applied so far.
    pub fn journal(&self) -> Vec<Op> {
        self.state.lock().journal.clone()
    }

    /// Returns the operations applied since the last call, clearing the journal.
    pub fn take_journal(&self) -> Vec<Op> {
        std::mem::take(&mut self.state.lock().journal)
    }

    /// Causes subsequent adds to fail while set.
    pub fn fail_adds(&self, fail: bool) {
        self.state.lock().fail_adds = fail;
    }

    /// Causes subsequent adds to `table` to fail while set. Other tables are unaffected.
    pub fn fail_adds_to(&self, table: Table, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.fail_adds_to.insert(table);
        } else {
            state.fail_adds_to.remove(&table);
        }
    }

    /// Causes subsequent deletes to fail while set.
    pub fn fail_deletes(&self, fail: bool) {
        self.state.lock().fail_deletes = fail;
    }
}

#[async_trait::async_trait]
impl RuleTable for MemoryTable {
    async fn add_rule(&self, table: Table, rule: &RuleSpec) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_adds || state.fail_adds_to.contains(&table) {
            bail!("rejected add to {table}: {rule}");
        }
        tracing::debug!(%table, %rule, "Adding rule");
        state.tables.entry(table).or_default().push(rule.clone());
        state.journal.push(Op::Add(table, rule.clone()));
        Ok(())
    }

    async fn delete_rule(&self, table: Table, rule: &RuleSpec) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_deletes {
            bail!("rejected delete from {table}: {rule}");
        }
        let rules = state.tables.entry(table).or_default();
        let Some(idx) = rules.iter().position(|r| r == rule) else {
            bail!("no such rule in {table}: {rule}");
        };
        tracing::debug!(%table, %rule, "Deleting rule");
        rules.remove(idx);
        state.journal.push(Op::Delete(table, rule.clone()));
        Ok(())
    }
}

// === impl Op ===

impl Op {
    pub fn table(&self) -> Table {
        match self {
            Self::Add(table, _) | Self::Delete(table, _) => *table,
        }
    }

    pub fn rule(&self) -> &RuleSpec {
        match self {
            Self::Add(_, rule) | Self::Delete(_, rule) => rule,
        }
    }

    pub fn is_add(&self) -> bool {
        matches!(self, Self::Add(..))
    }
}
