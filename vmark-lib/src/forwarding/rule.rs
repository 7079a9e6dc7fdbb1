use serde::{Deserialize, Serialize};

use crate::error::{NodeError, Result};

pub const VLAN_MIN: u16 = 1;
pub const VLAN_MAX: u16 = 4094;
pub const NAME_MAX_LEN: usize = 31;

/// Names of auto-generated inverse rules are `egress-<origin>`; the prefix
/// is reserved and user rules may not claim it.
pub const INVERSE_PREFIX: &str = "egress-";

/// A named forwarding entry: match on ingress interface plus optional
/// S-VLAN/C-VLAN, act via pop/push/forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub in_interface: String,
    pub svlan: Option<u16>,
    pub cvlan: Option<u16>,
    pub out_interface: String,
    pub pop_tags: u8,
    pub push_svlan: Option<u16>,
    pub push_cvlan: Option<u16>,
    pub active: bool,
    /// True for auto-generated inverse siblings.
    #[serde(default)]
    pub auto_inverse: bool,
    /// For an inverse rule, the user rule it was derived from.
    #[serde(default)]
    pub origin_name: Option<String>,
}

/// Caller-supplied parameters for rule creation; becomes a [`Rule`] after
/// validation.
#[derive(Debug, Clone, Default)]
pub struct RuleParams {
    pub name: String,
    pub in_interface: String,
    pub svlan: Option<u16>,
    pub cvlan: Option<u16>,
    pub out_interface: String,
    pub pop_tags: u8,
    pub push_svlan: Option<u16>,
    pub push_cvlan: Option<u16>,
    pub active: bool,
    /// Permit `in_interface == out_interface` (hairpin).
    pub allow_same_interface: bool,
}

impl RuleParams {
    /// Validate and build a user [`Rule`].
    pub fn into_rule(self) -> Result<Rule> {
        validate_name(&self.name)?;
        if self.name.starts_with(INVERSE_PREFIX) {
            return Err(NodeError::invalid(format!(
                "rule name '{}' uses the reserved prefix '{INVERSE_PREFIX}'",
                self.name
            )));
        }
        let rule = Rule {
            name: self.name,
            in_interface: self.in_interface,
            svlan: self.svlan,
            cvlan: self.cvlan,
            out_interface: self.out_interface,
            pop_tags: self.pop_tags,
            push_svlan: self.push_svlan,
            push_cvlan: self.push_cvlan,
            active: self.active,
            auto_inverse: false,
            origin_name: None,
        };
        rule.validate(self.allow_same_interface)?;
        Ok(rule)
    }
}

impl Rule {
    /// Schema validation shared by create, load and inverse override.
    pub fn validate(&self, allow_same_interface: bool) -> Result<()> {
        if self.in_interface.is_empty() {
            return Err(NodeError::invalid("in_interface must not be empty"));
        }
        if self.out_interface.is_empty() {
            return Err(NodeError::invalid("out_interface must not be empty"));
        }
        if !allow_same_interface && self.in_interface == self.out_interface {
            return Err(NodeError::invalid(format!(
                "rule '{}': in_interface and out_interface are both '{}'",
                self.name, self.in_interface
            )));
        }
        for (field, value) in [
            ("svlan", self.svlan),
            ("cvlan", self.cvlan),
            ("push_svlan", self.push_svlan),
            ("push_cvlan", self.push_cvlan),
        ] {
            if let Some(id) = value {
                if !(VLAN_MIN..=VLAN_MAX).contains(&id) {
                    return Err(NodeError::invalid(format!(
                        "rule '{}': {field} {id} outside {VLAN_MIN}..{VLAN_MAX}",
                        self.name
                    )));
                }
            }
        }
        // Cannot pop more tags than the match guarantees are present.
        if self.pop_tags > self.match_tag_count() {
            return Err(NodeError::invalid(format!(
                "rule '{}': pop_tags {} exceeds the {} matched tag(s)",
                self.name,
                self.pop_tags,
                self.match_tag_count()
            )));
        }
        Ok(())
    }

    /// Number of VLAN tags the match requires on the frame.
    pub fn match_tag_count(&self) -> u8 {
        u8::from(self.svlan.is_some()) + u8::from(self.cvlan.is_some())
    }

    /// Conflict identity: two active rules collide iff they agree on this
    /// tuple (equivalent to projecting the same map key, without needing
    /// the interface to exist).
    pub fn match_key(&self) -> (&str, u16, u16) {
        (self.in_interface.as_str(), self.svlan.unwrap_or(0), self.cvlan.unwrap_or(0))
    }

    /// The inverse rule name for a user rule name.
    pub fn inverse_name(name: &str) -> String {
        format!("{INVERSE_PREFIX}{name}")
    }

    fn svlan_popped(&self) -> bool {
        self.svlan.is_some() && self.pop_tags >= 1
    }

    fn cvlan_popped(&self) -> bool {
        // Pops consume outer-first: with both tags matched the first pop
        // takes the S-VLAN, so the C-VLAN needs a second pop.
        self.cvlan.is_some() && self.pop_tags >= 1 + u8::from(self.svlan.is_some())
    }

    /// Tag set carried by frames after this rule's actions ran. A push of
    /// a tag type replaces any surviving tag of that type.
    pub fn egress_tags(&self) -> (Option<u16>, Option<u16>) {
        let svlan =
            self.push_svlan.or(if self.svlan_popped() { None } else { self.svlan });
        let cvlan =
            self.push_cvlan.or(if self.cvlan_popped() { None } else { self.cvlan });
        (svlan, cvlan)
    }

    /// Derive the auto-generated inverse: match the egress tag set on the
    /// far interface, undo the pushes, and restore every original match
    /// tag this rule consumed (popped or replaced).
    pub fn inverse(&self) -> Rule {
        let (egress_svlan, egress_cvlan) = self.egress_tags();
        let svlan_consumed =
            self.svlan.is_some() && (self.svlan_popped() || self.push_svlan.is_some());
        let cvlan_consumed =
            self.cvlan.is_some() && (self.cvlan_popped() || self.push_cvlan.is_some());
        Rule {
            name: Self::inverse_name(&self.name),
            in_interface: self.out_interface.clone(),
            svlan: egress_svlan,
            cvlan: egress_cvlan,
            out_interface: self.in_interface.clone(),
            pop_tags: u8::from(self.push_svlan.is_some()) + u8::from(self.push_cvlan.is_some()),
            push_svlan: if svlan_consumed { self.svlan } else { None },
            push_cvlan: if cvlan_consumed { self.cvlan } else { None },
            active: self.active,
            auto_inverse: true,
            origin_name: Some(self.name.clone()),
        }
    }
}

/// User rule names: `[A-Za-z0-9_-]{1,31}`.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > NAME_MAX_LEN {
        return Err(NodeError::invalid(format!(
            "rule name must be 1..={NAME_MAX_LEN} characters, got {}",
            name.len()
        )));
    }
    if let Some(bad) = name.chars().find(|c| !c.is_ascii_alphanumeric() && *c != '_' && *c != '-')
    {
        return Err(NodeError::invalid(format!(
            "rule name '{name}' contains invalid character '{bad}'"
        )));
    }
    Ok(())
}
