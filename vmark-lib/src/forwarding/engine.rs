use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{NodeError, Result};
use crate::forwarding::dataplane::Dataplane;
use crate::forwarding::reconcile::{reconcile, ReconcileReport};
use crate::forwarding::rule::{Rule, RuleParams};
use crate::forwarding::store::SnapshotStore;
use crate::forwarding::table::ForwardingTable;

/// Filter accepted by `show_forwarding`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShowFilter {
    All,
    Json,
    Simple,
    Name(String),
}

impl ShowFilter {
    /// `json` and `simple` are keywords; anything else names a rule
    /// (including `egress-<name>` rows).
    pub fn parse(raw: Option<&str>) -> ShowFilter {
        match raw {
            None => ShowFilter::All,
            Some("json") => ShowFilter::Json,
            Some("simple") => ShowFilter::Simple,
            Some(name) => ShowFilter::Name(name.to_string()),
        }
    }
}

/// One rule as reported to callers: the rule fields plus whether the
/// kernel currently carries its map entry.
#[derive(Debug, Clone, Serialize)]
pub struct RuleView {
    #[serde(flatten)]
    pub rule: Rule,
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleBrief {
    pub name: String,
    pub active: bool,
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ShowOutput {
    Rules(Vec<RuleView>),
    Brief(Vec<RuleBrief>),
    Json(serde_json::Value),
}

/// Result of a mutating rule command.
#[derive(Debug, Clone, Serialize)]
pub struct RuleSummary {
    pub name: String,
    pub active: bool,
    pub applied: bool,
}

struct EngineState<D> {
    table: ForwardingTable,
    store: SnapshotStore,
    dataplane: D,
    last_report: ReconcileReport,
}

/// Command surface over the forwarding table. One mutex guards the whole
/// create-validate-persist-reconcile sequence, so every externally
/// visible mutation is atomic; a dataplane failure rolls both the
/// in-memory table and the on-disk snapshot back to the pre-mutation
/// state.
pub struct RuleEngine<D: Dataplane> {
    state: Mutex<EngineState<D>>,
}

impl<D: Dataplane> RuleEngine<D> {
    pub fn new(store: SnapshotStore, dataplane: D) -> Self {
        Self {
            state: Mutex::new(EngineState {
                table: ForwardingTable::new(),
                store,
                dataplane,
                last_report: ReconcileReport::default(),
            }),
        }
    }

    /// Load the persisted snapshot and converge the kernel onto it.
    /// Persisted-active rules reattach; rules whose interfaces are gone
    /// are kept on disk and reported as not applied.
    pub fn startup(&self) -> Result<ReconcileReport> {
        let mut state = self.lock();
        let state = &mut *state;
        state.table = state.store.load()?;
        let report = reconcile(&state.table, &mut state.dataplane)?;
        info!(
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            "startup reconciliation complete"
        );
        state.last_report = report.clone();
        Ok(report)
    }

    /// Construct, validate and insert a rule. New rules default to
    /// inactive; an active-on-create rule is installed immediately.
    pub fn create_rule(&self, params: RuleParams) -> Result<RuleSummary> {
        let rule = params.into_rule()?;
        let name = rule.name.clone();
        self.mutate(move |table| {
            if table.get(&name).is_some() {
                return Err(NodeError::StateViolation(format!("rule '{name}' already exists")));
            }
            table.upsert(rule)?;
            Ok(name)
        })
    }

    /// Remove an inactive rule and its inverse from table, snapshot and
    /// kernel.
    pub fn delete_rule(&self, name: &str) -> Result<RuleSummary> {
        let name = name.to_string();
        let summary = self.mutate(move |table| {
            table.delete(&name)?;
            Ok(name)
        })?;
        Ok(summary)
    }

    pub fn enable_rule(&self, name: &str) -> Result<RuleSummary> {
        let name = name.to_string();
        self.mutate(move |table| {
            table.enable(&name)?;
            Ok(name)
        })
    }

    pub fn disable_rule(&self, name: &str) -> Result<RuleSummary> {
        let name = name.to_string();
        self.mutate(move |table| {
            table.disable(&name)?;
            Ok(name)
        })
    }

    /// Targeted update of an existing inverse rule; clears its
    /// auto-generated status and pins the supplied parameters.
    pub fn override_inverse(&self, rule: Rule) -> Result<RuleSummary> {
        let name = rule.name.clone();
        self.mutate(move |table| {
            table.upsert(rule)?;
            Ok(name)
        })
    }

    pub fn show_forwarding(&self, filter: &ShowFilter) -> Result<ShowOutput> {
        let state = self.lock();
        let views: Vec<RuleView> = state
            .table
            .list()
            .iter()
            .map(|rule| RuleView {
                rule: rule.clone(),
                applied: state.last_report.is_applied(&rule.name),
            })
            .collect();
        match filter {
            ShowFilter::All => Ok(ShowOutput::Rules(views)),
            ShowFilter::Name(name) => {
                let found: Vec<RuleView> =
                    views.into_iter().filter(|v| v.rule.name == *name).collect();
                if found.is_empty() {
                    return Err(NodeError::NotFound(format!("rule '{name}'")));
                }
                Ok(ShowOutput::Rules(found))
            }
            ShowFilter::Simple => Ok(ShowOutput::Brief(
                views
                    .into_iter()
                    .map(|v| RuleBrief {
                        name: v.rule.name.clone(),
                        active: v.rule.active,
                        applied: v.applied,
                    })
                    .collect(),
            )),
            ShowFilter::Json => {
                // The persisted shape, augmented with activity and the
                // computed inverse rows.
                let value = serde_json::to_value(serde_json::json!({ "rules": views }))
                    .map_err(|e| NodeError::Persistence(format!("serialize show output: {e}")))?;
                Ok(ShowOutput::Json(value))
            }
        }
    }

    /// Inspect the dataplane (primarily for tests and diagnostics).
    pub fn with_dataplane<R>(&self, f: impl FnOnce(&D) -> R) -> R {
        f(&self.lock().dataplane)
    }

    pub fn with_dataplane_mut<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        f(&mut self.lock().dataplane)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState<D>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shared mutation sequence: apply to the table, persist, reconcile.
    /// Validation errors leave no side effect; persistence or kernel
    /// failures restore the pre-mutation table (and snapshot) before
    /// surfacing.
    fn mutate(
        &self,
        op: impl FnOnce(&mut ForwardingTable) -> Result<String>,
    ) -> Result<RuleSummary> {
        let mut state = self.lock();
        let state = &mut *state;
        let before = state.table.clone();

        let name = match op(&mut state.table) {
            Ok(name) => name,
            Err(e) => {
                state.table = before;
                return Err(e);
            }
        };

        if let Err(e) = state.store.save(state.table.list()) {
            state.table = before;
            return Err(e);
        }

        match reconcile(&state.table, &mut state.dataplane) {
            Ok(report) => {
                state.last_report = report;
                let (active, applied) = match state.table.get(&name) {
                    Some(rule) => (rule.active, state.last_report.is_applied(&name)),
                    None => (false, false),
                };
                Ok(RuleSummary { name, active, applied })
            }
            Err(e) => {
                warn!(error = %e, "dataplane reconcile failed, rolling back mutation");
                state.table = before;
                if let Err(persist_err) = state.store.save(state.table.list()) {
                    warn!(error = %persist_err, "rollback snapshot write failed");
                }
                // Converge the kernel back onto the prior state; a failure
                // here is logged, the original error is surfaced.
                match reconcile(&state.table, &mut state.dataplane) {
                    Ok(report) => state.last_report = report,
                    Err(rollback_err) => {
                        warn!(error = %rollback_err, "rollback reconcile failed")
                    }
                }
                Err(e)
            }
        }
    }
}
