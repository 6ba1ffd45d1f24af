//! Blacklist of blocked domains.
//!
//! Rules come in two forms: exact domains and wildcard rules ("*.ads.com"),
//! where a wildcard blocks the suffix domain itself and all of its
//! subdomains. Matching is case-insensitive.

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use crate::error::ProxyError;

/// Prefix marking a wildcard rule.
const WILDCARD_PREFIX: &str = "*.";

#[derive(Default)]
struct Rules {
    exact: HashSet<String>,
    wildcards: HashSet<String>,
}

/// Mutable rule set deciding which domains get sinkholed.
pub struct Blacklist {
    rules: RwLock<Rules>,
}

fn normalize(raw: &str) -> String {
    raw.trim().to_lowercase()
}

impl Blacklist {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Rules::default()),
        }
    }

    /// Add a rule, exact or wildcard.
    ///
    /// Adding a rule that is already present changes nothing.
    pub fn add(&self, raw: &str) -> Result<(), ProxyError> {
        let domain = normalize(raw);
        if domain.is_empty() {
            return Err(ProxyError::InvalidArgument("domain cannot be empty".into()));
        }

        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(suffix) = domain.strip_prefix(WILDCARD_PREFIX) {
            if suffix.is_empty() {
                return Err(ProxyError::InvalidArgument(format!(
                    "invalid wildcard rule: {raw:?}"
                )));
            }
            rules.wildcards.insert(suffix.to_owned());
        } else {
            rules.exact.insert(domain);
        }
        Ok(())
    }

    /// Remove a rule. Removing a rule that was never added is not an error.
    pub fn remove(&self, raw: &str) -> Result<(), ProxyError> {
        let domain = normalize(raw);
        if domain.is_empty() {
            return Err(ProxyError::InvalidArgument("domain cannot be empty".into()));
        }

        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(suffix) = domain.strip_prefix(WILDCARD_PREFIX) {
            rules.wildcards.remove(suffix);
        } else {
            rules.exact.remove(&domain);
        }
        Ok(())
    }

    /// Check whether a domain is blocked.
    ///
    /// Wildcard suffixes match on label boundaries only: "*.example.com"
    /// blocks "example.com" and "a.b.example.com" but never
    /// "notexample.com".
    pub fn is_blocked(&self, raw: &str) -> bool {
        let domain = normalize(raw);
        if domain.is_empty() {
            return false;
        }

        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);

        if rules.exact.contains(&domain) {
            return true;
        }

        // Walk the domain one label at a time so every suffix is a single
        // set probe rather than a scan over all wildcard rules.
        let mut current = domain.as_str();
        loop {
            if rules.wildcards.contains(current) {
                return true;
            }
            match current.find('.') {
                Some(pos) => current = &current[pos + 1..],
                None => return false,
            }
        }
    }

    /// All exact rules.
    pub fn domains(&self) -> Vec<String> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .exact
            .iter()
            .cloned()
            .collect()
    }

    /// All wildcard rules, in their "*.suffix" display form.
    pub fn wildcards(&self) -> Vec<String> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .wildcards
            .iter()
            .map(|suffix| format!("{WILDCARD_PREFIX}{suffix}"))
            .collect()
    }

    /// Total rule count, exact and wildcard combined.
    pub fn len(&self) -> usize {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        rules.exact.len() + rules.wildcards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every rule.
    pub fn clear(&self) {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        rules.exact.clear();
        rules.wildcards.clear();
    }
}

impl Default for Blacklist {
    fn default() -> Self {
        Self::new()
    }
}
