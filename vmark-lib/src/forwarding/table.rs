use crate::error::{NodeError, Result};
use crate::forwarding::rule::{Rule, INVERSE_PREFIX};

/// Authoritative in-memory rule set. Holds user rules and their
/// materialized inverse siblings in one namespace, in insertion order.
///
/// Inverse rows exist only while their origin is active: `enable`
/// materializes the inverse, `disable` removes it. Inverses are computed
/// state; persistence stores user rules only and [`rebuild_inverses`]
/// regenerates the rest at load time.
///
/// [`rebuild_inverses`]: ForwardingTable::rebuild_inverses
#[derive(Debug, Clone, Default)]
pub struct ForwardingTable {
    rules: Vec<Rule>,
}

impl ForwardingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> &[Rule] {
        &self.rules
    }

    pub fn get(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn user_rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| !is_inverse(r))
    }

    pub fn active_rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| r.active)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.rules.iter().position(|r| r.name == name)
    }

    /// Insert or replace a rule. A name under the `egress-` prefix is a
    /// targeted update of an existing inverse: its parameters are replaced
    /// and `auto_inverse` is cleared, pinning them until the origin is
    /// disabled. User-rule upserts regenerate auto inverse siblings.
    pub fn upsert(&mut self, rule: Rule) -> Result<()> {
        if rule.name.starts_with(INVERSE_PREFIX) {
            return self.override_inverse(rule);
        }
        rule.validate(true)?;

        let inverse = rule.inverse();
        let inverse_pos = self.position(&inverse.name);
        let keeps_override =
            inverse_pos.is_some_and(|j| !self.rules[j].auto_inverse);
        if rule.active {
            if keeps_override {
                self.check_conflicts(&[&rule])?;
            } else {
                self.check_conflicts(&[&rule, &inverse])?;
            }
        }
        match self.position(&rule.name) {
            Some(i) => self.rules[i] = rule.clone(),
            None => self.rules.push(rule.clone()),
        }
        if rule.active {
            match inverse_pos {
                // An operator override (auto_inverse=false) keeps its
                // parameters; only auto-generated rows are regenerated.
                Some(j) if self.rules[j].auto_inverse => self.rules[j] = inverse,
                Some(j) => self.rules[j].active = true,
                None => {
                    let at = self.position(&rule.name).map(|i| i + 1).unwrap_or(self.rules.len());
                    self.rules.insert(at, inverse);
                }
            }
        } else if let Some(j) = inverse_pos {
            self.rules.remove(j);
        }
        Ok(())
    }

    fn override_inverse(&mut self, mut rule: Rule) -> Result<()> {
        let Some(i) = self.position(&rule.name) else {
            return Err(NodeError::invalid(format!(
                "'{}' does not name an existing inverse rule; the '{INVERSE_PREFIX}' \
                 namespace cannot be created directly",
                rule.name
            )));
        };
        rule.validate(true)?;
        let current = &self.rules[i];
        // Lifecycle stays tied to the origin.
        rule.origin_name = current.origin_name.clone();
        rule.active = current.active;
        rule.auto_inverse = false;
        if rule.active {
            self.check_conflicts(&[&rule])?;
        }
        self.rules[i] = rule;
        Ok(())
    }

    /// Flip a user rule to active and materialize its inverse.
    pub fn enable(&mut self, name: &str) -> Result<()> {
        let i = self.user_position(name, "enable")?;
        if self.rules[i].active {
            return Err(NodeError::StateViolation(format!("rule '{name}' is already enabled")));
        }
        let mut candidate = self.rules[i].clone();
        candidate.active = true;
        let inverse = candidate.inverse();
        self.check_conflicts(&[&candidate, &inverse])?;

        self.rules[i] = candidate;
        self.rules.insert(i + 1, inverse);
        Ok(())
    }

    /// Flip a user rule to inactive and drop its inverse row.
    pub fn disable(&mut self, name: &str) -> Result<()> {
        let i = self.user_position(name, "disable")?;
        if !self.rules[i].active {
            return Err(NodeError::StateViolation(format!("rule '{name}' is already disabled")));
        }
        self.rules[i].active = false;
        if let Some(j) = self.position(&Rule::inverse_name(name)) {
            self.rules.remove(j);
        }
        Ok(())
    }

    /// Remove an inactive user rule (and any stale inverse row).
    pub fn delete(&mut self, name: &str) -> Result<()> {
        let i = self.user_position(name, "delete")?;
        if self.rules[i].active {
            return Err(NodeError::StateViolation(format!(
                "rule '{name}' is active; disable it before deleting"
            )));
        }
        self.rules.remove(i);
        if let Some(j) = self.position(&Rule::inverse_name(name)) {
            self.rules.remove(j);
        }
        Ok(())
    }

    /// Drop all inverse rows and regenerate them from active user rules.
    /// Used after loading a snapshot: stored inverses are never trusted.
    pub fn rebuild_inverses(&mut self) {
        self.rules.retain(|r| !is_inverse(r));
        let mut i = 0;
        while i < self.rules.len() {
            if self.rules[i].active && !is_inverse(&self.rules[i]) {
                let inverse = self.rules[i].inverse();
                self.rules.insert(i + 1, inverse);
                i += 1;
            }
            i += 1;
        }
    }

    fn user_position(&self, name: &str, op: &str) -> Result<usize> {
        if name.starts_with(INVERSE_PREFIX) {
            return Err(NodeError::StateViolation(format!(
                "cannot {op} '{name}': inverse rules are managed through their origin"
            )));
        }
        self.position(name).ok_or_else(|| NodeError::NotFound(format!("rule '{name}'")))
    }

    /// Reject candidates whose match key collides with another active rule
    /// (or with each other). Candidates replace any same-named rows, so
    /// those rows are excluded from the comparison.
    fn check_conflicts(&self, candidates: &[&Rule]) -> Result<()> {
        for (i, candidate) in candidates.iter().enumerate() {
            if !candidate.active {
                continue;
            }
            let key = candidate.match_key();
            for existing in self.rules.iter().filter(|r| r.active) {
                let replaced = candidates.iter().any(|c| c.name == existing.name);
                if !replaced && existing.match_key() == key {
                    return Err(NodeError::Conflict {
                        existing: existing.name.clone(),
                        candidate: candidate.name.clone(),
                    });
                }
            }
            for other in &candidates[i + 1..] {
                if other.active && other.match_key() == key {
                    return Err(NodeError::Conflict {
                        existing: candidate.name.clone(),
                        candidate: other.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Inverse rows carry their origin; loaded snapshots may only have the
/// name prefix to go by.
fn is_inverse(rule: &Rule) -> bool {
    rule.origin_name.is_some() || rule.name.starts_with(INVERSE_PREFIX)
}
