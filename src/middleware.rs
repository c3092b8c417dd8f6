//! C5 — rule parsing and the middleware pipeline.
//!
//! A `Rule` classifies a module as middleware and decides, per-route,
//! whether that middleware runs. The precedence oddity noted in the
//! design notes (once `all` is set by any `-token`, `except` wins over
//! `only`) is intentional and must be preserved exactly.

use std::collections::HashSet;

use crate::module::Module;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rule {
    pub all: bool,
    pub only: HashSet<String>,
    pub except: HashSet<String>,
}

impl Rule {
    /// Parses the trimmed content of a `rule.txt` file.
    ///
    /// Grammar: `*` or empty means "match everything"; otherwise a
    /// comma-separated list of tokens, each either a bare route name
    /// (added to `only`) or `-name` (sets `all = true` and adds `name`
    /// to `except`).
    pub fn parse(src: &str) -> Rule {
        let trimmed = src.trim();
        if trimmed.is_empty() || trimmed == "*" {
            return Rule {
                all: true,
                only: HashSet::new(),
                except: HashSet::new(),
            };
        }

        let mut rule = Rule::default();
        for token in trimmed.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if let Some(name) = token.strip_prefix('-') {
                rule.all = true;
                rule.except.insert(name.to_string());
            } else {
                rule.only.insert(token.to_string());
            }
        }
        rule
    }

    /// `stringify` is the inverse of `parse`, used only to verify the
    /// round-trip property: a rule stringified and re-parsed matches
    /// the identical route sets (it need not produce byte-identical
    /// text, since `only`/`except` are unordered sets).
    pub fn stringify(&self) -> String {
        if self.all && self.except.is_empty() {
            return "*".to_string();
        }
        let mut tokens: Vec<String> = self.only.iter().cloned().collect();
        tokens.extend(self.except.iter().map(|e| format!("-{}", e)));
        tokens.join(",")
    }

    /// `Matches` semantics: once `all` is true, the `except` set takes
    /// precedence and `only` is effectively overridden by the universal
    /// match. This must be preserved exactly for compatibility.
    pub fn matches(&self, route: &str) -> bool {
        if self.all {
            !self.except.contains(route)
        } else {
            self.only.contains(route)
        }
    }
}

/// A `(Module, Rule)` pair: a module classified as middleware.
pub struct MiddlewareModule {
    pub module: std::sync::Arc<Module>,
    pub rule: Rule,
}

/// Returns the subsequence of `mws` (order preserved) whose rule matches
/// `route`.
pub fn apply_pipeline<'a>(
    route: &str,
    mws: &'a [MiddlewareModule],
) -> Vec<&'a MiddlewareModule> {
    mws.iter().filter(|mw| mw.rule.matches(route)).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_or_star_matches_all() {
        let r = Rule::parse("");
        assert!(r.matches("anything"));
        let r = Rule::parse("*");
        assert!(r.matches("anything"));
    }

    #[test]
    fn only_list_restricts_matches() {
        let r = Rule::parse("users,accounts");
        assert!(r.matches("users"));
        assert!(r.matches("accounts"));
        assert!(!r.matches("other"));
    }

    #[test]
    fn except_token_sets_all_and_excludes() {
        let r = Rule::parse("-admin");
        assert!(!r.matches("admin"));
        assert!(r.matches("users"));
    }

    #[test]
    fn mixed_only_and_except_prefers_all_branch() {
        // "users,-admin" yields only=[users] AND all=true, except=[admin].
        // Matches must take the `all` branch: match everything except admin.
        let r = Rule::parse("users,-admin");
        assert!(r.all);
        assert!(r.only.contains("users"));
        assert!(!r.matches("admin"));
        assert!(r.matches("users"));
        assert!(r.matches("some_other_route"));
    }

    #[test]
    fn round_trip_preserves_match_semantics() {
        for src in ["*", "", "users,accounts", "-admin", "users,-admin"] {
            let parsed = Rule::parse(src);
            let reparsed = Rule::parse(&parsed.stringify());
            for route in ["users", "accounts", "admin", "other"] {
                assert_eq!(
                    parsed.matches(route),
                    reparsed.matches(route),
                    "route {} mismatched for rule {:?}",
                    route,
                    src
                );
            }
        }
    }

    #[test]
    fn apply_pipeline_preserves_order_and_filters() {
        // apply_pipeline is exercised at the MiddlewareModule level in
        // server.rs's integration tests, since constructing a Module
        // requires a live wasmtime engine; here we only verify the
        // pure routing-predicate logic used above.
        let a = Rule::parse("users");
        let b = Rule::parse("-admin");
        let c = Rule::parse("accounts");
        assert!(a.matches("users") && !b.matches("admin") && c.matches("accounts"));
    }
}
