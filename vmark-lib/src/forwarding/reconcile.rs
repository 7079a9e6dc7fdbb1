//! Convergence of table state onto the kernel data plane.
//!
//! The reconciler is the only component that issues dataplane writes. It
//! computes the desired per-interface map contents from the active rules,
//! attaches/detaches the program to match the referenced interface set,
//! and applies the minimum put/delete set to each map. Rules whose
//! interfaces cannot be resolved (e.g. a NIC that disappeared across a
//! restart) are skipped with a warning and reported, never treated as
//! fatal.

use std::collections::HashMap;

use tracing::{debug, warn};
use vmark_ebpf_common::{FwKey, FwValue};

use crate::error::Result;
use crate::forwarding::codec::{encode_key, encode_value};
use crate::forwarding::dataplane::Dataplane;
use crate::forwarding::table::ForwardingTable;

/// Outcome of one reconcile pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Names of rules whose map entries are installed.
    pub applied: Vec<String>,
    /// Rules that could not be applied, with the reason.
    pub skipped: Vec<SkippedRule>,
}

#[derive(Debug, Clone)]
pub struct SkippedRule {
    pub name: String,
    pub reason: String,
}

impl ReconcileReport {
    pub fn is_applied(&self, name: &str) -> bool {
        self.applied.iter().any(|n| n == name)
    }
}

struct DesiredInterface {
    iface: String,
    entries: HashMap<FwKey, FwValue>,
}

/// Drive the dataplane to match the table's active rules. Any kernel
/// failure aborts the pass and propagates; the engine rolls the mutation
/// back.
pub fn reconcile<D: Dataplane>(table: &ForwardingTable, dp: &mut D) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();
    let mut desired: HashMap<u32, DesiredInterface> = HashMap::new();

    // 1. Desired set: encode every active rule whose interfaces resolve.
    for rule in table.active_rules() {
        let ingress = match dp.resolve_ifindex(&rule.in_interface) {
            Ok(ifindex) => ifindex,
            Err(e) => {
                warn!(rule = %rule.name, interface = %rule.in_interface, error = %e,
                    "skipping rule: ingress interface not present");
                report.skipped.push(SkippedRule { name: rule.name.clone(), reason: e.to_string() });
                continue;
            }
        };
        let egress = match dp.resolve_ifindex(&rule.out_interface) {
            Ok(ifindex) => ifindex,
            Err(e) => {
                warn!(rule = %rule.name, interface = %rule.out_interface, error = %e,
                    "skipping rule: egress interface not present");
                report.skipped.push(SkippedRule { name: rule.name.clone(), reason: e.to_string() });
                continue;
            }
        };
        let key = encode_key(rule, ingress);
        let value = encode_value(rule, egress)?;
        desired
            .entry(ingress)
            .or_insert_with(|| DesiredInterface {
                iface: rule.in_interface.clone(),
                entries: HashMap::new(),
            })
            .entries
            .insert(key, value);
        report.applied.push(rule.name.clone());
    }

    // 2. Attach + map for every referenced ingress interface. Idempotent,
    //    so a persisted-active rule reattaches after a restart.
    for (ifindex, want) in &desired {
        dp.attach(&want.iface, *ifindex)?;
        dp.ensure_map(*ifindex)?;
    }

    // 3. Detach interfaces no active rule references anymore.
    for ifindex in dp.attached()? {
        if !desired.contains_key(&ifindex) {
            debug!(ifindex, "detaching: no active rules remain");
            dp.detach(ifindex)?;
        }
    }

    // 4. Minimal diff per map.
    for (ifindex, want) in &desired {
        let current = dp.map_entries(*ifindex)?;
        for (key, _) in &current {
            if !want.entries.contains_key(key) {
                dp.map_delete(*ifindex, *key)?;
            }
        }
        let current: HashMap<FwKey, FwValue> = current.into_iter().collect();
        for (key, value) in &want.entries {
            if current.get(key) != Some(value) {
                dp.map_put(*ifindex, *key, *value)?;
            }
        }
    }

    Ok(report)
}
