//! Projection of [`Rule`]s into the kernel map ABI.
//!
//! The byte layouts live in `vmark-ebpf-common`; this module owns the
//! rule-to-steps projection and its validation. Step order is canonical:
//! pops first, then pushes, then the terminal forward. Steps apply
//! sequentially in the data plane and each PUSH inserts the new outermost
//! tag, so the C-VLAN push is emitted before the S-VLAN push to leave the
//! S-VLAN outermost on the wire.

use vmark_ebpf_common::{action, tag, FwKey, FwStep, FwValue, MAX_STEPS};

use crate::error::{NodeError, Result};
use crate::forwarding::rule::{Rule, VLAN_MAX, VLAN_MIN};

/// Decoded form of one forwarding step, for introspection and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Pop,
    PushSvlan(u16),
    PushCvlan(u16),
    Forward(u32),
}

/// Project the match side of a rule onto a map key. Absent tags encode 0;
/// the B-MAC field is reserved and zero-filled.
pub fn encode_key(rule: &Rule, ingress_ifindex: u32) -> FwKey {
    FwKey::new(ingress_ifindex, rule.cvlan.unwrap_or(0), rule.svlan.unwrap_or(0))
}

/// Recover `(ingress_ifindex, svlan, cvlan)` from a map key.
pub fn decode_key(key: &FwKey) -> (u32, Option<u16>, Option<u16>) {
    let svlan = (key.svlan_id != 0).then_some(key.svlan_id);
    let cvlan = (key.vlan_id != 0).then_some(key.vlan_id);
    (key.ingress_ifindex, svlan, cvlan)
}

/// Project the action side of a rule onto a map value, given the resolved
/// egress ifindex. Rejects projections whose step count exceeds the map
/// layout or whose tag IDs fall outside 1..4094.
pub fn encode_value(rule: &Rule, target_ifindex: u32) -> Result<FwValue> {
    for (field, value) in [("push_svlan", rule.push_svlan), ("push_cvlan", rule.push_cvlan)] {
        if let Some(id) = value {
            if !(VLAN_MIN..=VLAN_MAX).contains(&id) {
                return Err(NodeError::invalid(format!(
                    "rule '{}': {field} {id} outside {VLAN_MIN}..{VLAN_MAX}",
                    rule.name
                )));
            }
        }
    }

    let mut steps = Vec::with_capacity(MAX_STEPS);
    for _ in 0..rule.pop_tags {
        steps.push(FwStep::pop());
    }
    if let Some(id) = rule.push_cvlan {
        steps.push(FwStep::push(tag::CVLAN, id));
    }
    if let Some(id) = rule.push_svlan {
        steps.push(FwStep::push(tag::SVLAN, id));
    }
    steps.push(FwStep::forward(target_ifindex));

    FwValue::from_steps(&steps).ok_or_else(|| {
        NodeError::invalid(format!(
            "rule '{}': projects {} steps, map layout holds {MAX_STEPS}",
            rule.name,
            steps.len()
        ))
    })
}

/// Decode a map value back into its action list.
pub fn decode_value(value: &FwValue) -> Vec<Action> {
    let steps = value.active_steps();
    steps[..value.num_actions()]
        .iter()
        .filter_map(|step| match (step.action, step.tag_type) {
            (action::POP, _) => Some(Action::Pop),
            (action::PUSH, tag::SVLAN) => Some(Action::PushSvlan(step.vlan_id)),
            (action::PUSH, tag::CVLAN) => Some(Action::PushCvlan(step.vlan_id)),
            (action::FORWARD, _) => Some(Action::Forward(step.target_ifindex)),
            _ => None,
        })
        .collect()
}
