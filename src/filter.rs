//! URL Filter: static per-source rules plus a runtime-accumulated deny set
//! (spec §4.2).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::config::DomainFilter;

/// Pure admission logic over a fixed rule set, plus an additive runtime deny
/// set mutated by [`crate::discover::detect_auth_redirect`].
///
/// The runtime deny set is a single `Mutex`-guarded map: writers only ever
/// add patterns, so a reader that misses a just-added entry for one request
/// is not a correctness bug (spec §5 "Shared-resource policy") — a later
/// request against the same host will see it.
pub struct UrlFilter {
    allowed_domains: HashMap<String, DomainFilter>,
    runtime_denies: Mutex<HashMap<String, HashSet<String>>>,
}

impl UrlFilter {
    pub fn new(allowed_domains: HashMap<String, DomainFilter>) -> Self {
        Self {
            allowed_domains,
            runtime_denies: Mutex::new(HashMap::new()),
        }
    }

    /// Host admission: some configured domain `D` such that `host == D` or
    /// `host` ends in `.D` (with `www.` stripped from `D` before matching).
    /// No domains configured ⇒ every host is admissible.
    pub fn host_allowed(&self, host: &str) -> bool {
        if self.allowed_domains.is_empty() {
            return true;
        }
        let host = host.to_ascii_lowercase();
        self.allowed_domains.keys().any(|raw_domain| {
            let domain = normalize_domain(raw_domain);
            !domain.is_empty() && host_matches_domain(&host, &domain)
        })
    }

    /// Path admission given a host already known to be allowed. See spec
    /// §4.2 for the four-step algorithm.
    pub fn path_allowed(&self, host: &str, path: &str) -> bool {
        let host = host.to_ascii_lowercase();
        let candidate = if path.is_empty() { "/" } else { path };

        let rules = self.match_domain_rules(&host);

        let mut deny: Vec<&str> = rules
            .map(|r| r.deny_paths.iter().map(String::as_str).collect())
            .unwrap_or_default();
        let runtime = self.match_runtime_denies(&host);
        let runtime_refs: Vec<&str> = runtime.iter().map(String::as_str).collect();
        deny.extend(runtime_refs.iter());

        // Runtime denies apply even with no configured domain rules at all
        // (spec §8 scenario 5: an auth-redirect deny must bite regardless
        // of whether `allowed_domains` names this host).
        if deny.iter().any(|pattern| path_matches(candidate, pattern)) {
            return false;
        }

        let Some(rules) = rules else {
            return true;
        };

        if !rules.allow_paths.is_empty() {
            return rules
                .allow_paths
                .iter()
                .any(|pattern| path_matches(candidate, pattern));
        }
        true
    }

    /// Convenience: host_allowed && path_allowed.
    pub fn is_admissible(&self, host: &str, path: &str) -> bool {
        self.host_allowed(host) && self.path_allowed(host, path)
    }

    fn match_domain_rules(&self, host: &str) -> Option<&DomainFilter> {
        let mut best_len = -1isize;
        let mut best: Option<&DomainFilter> = None;
        for (raw_domain, rules) in &self.allowed_domains {
            let domain = normalize_domain(raw_domain);
            if domain.is_empty() {
                continue;
            }
            if host_matches_domain(host, &domain) && domain.len() as isize > best_len {
                best_len = domain.len() as isize;
                best = Some(rules);
            }
        }
        best
    }

    fn match_runtime_denies(&self, host: &str) -> HashSet<String> {
        let guard = self.runtime_denies.lock().expect("runtime deny lock poisoned");
        let mut best_len = -1isize;
        let mut best: HashSet<String> = HashSet::new();
        for (raw_domain, patterns) in guard.iter() {
            let domain = normalize_domain(raw_domain);
            if domain.is_empty() {
                continue;
            }
            if host_matches_domain(host, &domain) && domain.len() as isize > best_len {
                best_len = domain.len() as isize;
                best = patterns.clone();
            }
        }
        best
    }

    /// Adds a runtime deny pattern for `host`. Returns `true` if the pattern
    /// was newly added (not already present).
    pub fn add_runtime_deny(&self, host: &str, pattern: &str) -> bool {
        if pattern.is_empty() {
            return false;
        }
        let host = host.to_ascii_lowercase();
        let mut guard = self.runtime_denies.lock().expect("runtime deny lock poisoned");
        let set = guard.entry(host).or_default();
        set.insert(pattern.to_string())
    }

    /// Returns the accumulated runtime deny set, sorted, for end-of-run
    /// reporting as a suggested configuration patch (spec §4.6).
    pub fn runtime_denies_snapshot(&self) -> HashMap<String, Vec<String>> {
        let guard = self.runtime_denies.lock().expect("runtime deny lock poisoned");
        guard
            .iter()
            .map(|(host, patterns)| {
                let mut sorted: Vec<String> = patterns.iter().cloned().collect();
                sorted.sort();
                (host.clone(), sorted)
            })
            .collect()
    }
}

fn normalize_domain(raw: &str) -> String {
    let domain = raw.to_ascii_lowercase();
    domain
        .strip_prefix("www.")
        .map(str::to_string)
        .unwrap_or(domain)
}

fn host_matches_domain(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{domain}"))
}

/// Pattern semantics (spec §4.2): `prefix/**`, `prefix/*`, shell-style glob
/// when the pattern contains `*`, `?`, or `[`, otherwise strict equality.
pub fn path_matches(path: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    if let Some(prefix) = pattern.strip_suffix("/**") {
        let prefix = ensure_trailing_slash(prefix);
        return path.starts_with(&prefix);
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        let prefix = ensure_trailing_slash(prefix);
        return path.starts_with(&prefix);
    }
    if pattern.contains(['*', '?', '[']) {
        return glob::Pattern::new(pattern)
            .map(|p| p.matches(path))
            .unwrap_or(false);
    }
    path == pattern
}

fn ensure_trailing_slash(prefix: &str) -> String {
    if prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}
