//! Per-source-address access control.
//!
//! The engine is pure policy: it maps a candidate peer address to a
//! [`Verdict`] given the current mode, rule set and global flags. When a rule
//! requires a challenge the engine does not perform the exchange itself; it
//! returns `Verdict::Challenge` and the connection pipeline runs the
//! handshake over the already-established stream (see [`crate::challenge`]).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

/// Policy for addresses that do not appear in the rule set: whitelist denies
/// them, blacklist allows them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessControlMode {
    #[default]
    Whitelist,
    Blacklist,
}

/// One rule, keyed by IP address. At most one rule exists per address.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessControlRule {
    pub addr: IpAddr,
    /// A disabled rule has no effect in either mode.
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    /// When set, admission additionally depends on the challenge exchange.
    #[serde(default)]
    pub is_challenge_enabled: bool,
    /// The value the remote end must produce during the challenge exchange.
    #[serde(default)]
    pub challenge: Option<String>,
}

fn default_true() -> bool {
    true
}

impl AccessControlRule {
    pub fn new(addr: IpAddr) -> Self {
        Self {
            addr,
            is_enabled: true,
            is_challenge_enabled: false,
            challenge: None,
        }
    }

    pub fn with_challenge(addr: IpAddr, challenge: impl Into<String>) -> Self {
        Self {
            addr,
            is_enabled: true,
            is_challenge_enabled: true,
            challenge: Some(challenge.into()),
        }
    }
}

/// Outcome of a policy evaluation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
    /// Run the challenge exchange; admit the peer when the exchange outcome
    /// equals `allow_on_match`. Whitelist rules admit on a match. Blacklist
    /// rules admit on a mismatch: failing the challenge proves the peer is
    /// not the identity the blacklist entry names.
    Challenge {
        expected: String,
        allow_on_match: bool,
    },
}

pub struct AccessControlEngine {
    mode: AccessControlMode,
    enabled: bool,
    challenge_enabled: bool,
    rules: HashMap<IpAddr, AccessControlRule>,
}

impl AccessControlEngine {
    pub fn new(
        mode: AccessControlMode,
        enabled: bool,
        challenge_enabled: bool,
        initial_rules: Vec<AccessControlRule>,
    ) -> Self {
        let mut engine = Self {
            mode,
            enabled,
            challenge_enabled,
            rules: HashMap::new(),
        };
        for rule in initial_rules {
            engine.add_rule(rule);
        }
        engine
    }

    /// Evaluate a candidate address against the current policy.
    ///
    /// `skip_challenge` is used when bulk re-checking already-connected peers
    /// after a policy change: re-running an interactive handshake against an
    /// open session that is not expecting one is unsafe, so only the static
    /// rule fields are applied and a challenge-requiring rule collapses to
    /// its static outcome (whitelist: allow, blacklist: deny).
    pub fn evaluate(&self, addr: IpAddr, skip_challenge: bool) -> Verdict {
        if !self.enabled {
            return Verdict::Allow;
        }
        match self.mode {
            AccessControlMode::Whitelist => self.evaluate_whitelist(addr, skip_challenge),
            AccessControlMode::Blacklist => self.evaluate_blacklist(addr, skip_challenge),
        }
    }

    fn evaluate_whitelist(&self, addr: IpAddr, skip_challenge: bool) -> Verdict {
        // No rule (and in particular an empty rule set) means the address is
        // not trusted. A disabled entry permits its address unconditionally.
        let Some(rule) = self.rules.get(&addr) else {
            return Verdict::Deny;
        };
        if !rule.is_enabled {
            return Verdict::Allow;
        }
        if rule.is_challenge_enabled && self.challenge_enabled && !skip_challenge {
            return match &rule.challenge {
                Some(expected) => Verdict::Challenge {
                    expected: expected.clone(),
                    allow_on_match: true,
                },
                // A challenge-requiring rule with no value can never be
                // satisfied.
                None => Verdict::Deny,
            };
        }
        Verdict::Allow
    }

    fn evaluate_blacklist(&self, addr: IpAddr, skip_challenge: bool) -> Verdict {
        let Some(rule) = self.rules.get(&addr) else {
            return Verdict::Allow;
        };
        if !rule.is_enabled {
            return Verdict::Allow;
        }
        if rule.is_challenge_enabled && self.challenge_enabled {
            if skip_challenge {
                return Verdict::Deny;
            }
            return match &rule.challenge {
                Some(expected) => Verdict::Challenge {
                    expected: expected.clone(),
                    allow_on_match: false,
                },
                // An unsatisfiable challenge can never prove the blacklisted
                // identity, so the peer passes.
                None => Verdict::Allow,
            };
        }
        Verdict::Deny
    }

    /// Insert a rule. A rule already present for the address is left
    /// untouched; returns whether the rule was inserted.
    pub fn add_rule(&mut self, rule: AccessControlRule) -> bool {
        if self.rules.contains_key(&rule.addr) {
            return false;
        }
        self.rules.insert(rule.addr, rule);
        true
    }

    /// Replace the whole rule for an address already present; returns whether
    /// a rule was replaced.
    pub fn update_rule(&mut self, rule: AccessControlRule) -> bool {
        if !self.rules.contains_key(&rule.addr) {
            return false;
        }
        self.rules.insert(rule.addr, rule);
        true
    }

    pub fn remove_rule(&mut self, addr: IpAddr) -> bool {
        self.rules.remove(&addr).is_some()
    }

    pub fn set_mode(&mut self, mode: AccessControlMode) {
        self.mode = mode;
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn set_challenge_enabled(&mut self, enabled: bool) {
        self.challenge_enabled = enabled;
    }

    pub fn mode(&self) -> AccessControlMode {
        self.mode
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_challenge_enabled(&self) -> bool {
        self.challenge_enabled
    }

    pub fn rules(&self) -> Vec<AccessControlRule> {
        self.rules.values().cloned().collect()
    }
}
