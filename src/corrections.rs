//! Rule-driven address rewriting for addresses every provider missed. The
//! cascade sends a corrected query back through its own adapter chain.

use regex::Regex;
use serde::Serialize;

use crate::errors::{AppError, AppResult};
use crate::normalize::canonical_key;

#[derive(Debug, Clone)]
pub struct CorrectionRule {
    pub name: String,
    pub pattern: Regex,
    pub replacement: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Correction {
    pub text: String,
    pub applied: Vec<String>,
}

/// Ordered rewrite rules plus whole-address special cases. Rules apply in
/// sequence, each to the output of the previous one.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: Vec<CorrectionRule>,
    exact: Vec<(String, String)>,
}

impl RuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> AppResult<Self> {
        let mut table = Self::new();
        for (name, pattern, replacement) in [
            ("strasse_spelling", r"([Ss])trasse\b", "${1}traße"),
            ("straae_typo", r"([Ss])tra(?:ae|\?e)\b", "${1}traße"),
            ("str_abbreviation", r"(\w)str\.", "${1}straße"),
            ("str_word", r"\bStr\.", "Straße"),
            ("pl_abbreviation", r"([a-zäöüß])pl\.", "${1}platz"),
            ("opposite_prefix", r"(?i)^gegenüber\s+", ""),
            ("hall_suffix", r"\s*/\s*Halle\s+\w+", ""),
            ("ot_qualifier", r"\s*(?:[/-]\s*)?\bOT\s+[^,]+", ""),
            ("number_range", r"\b(\d+[a-zA-Z]?)\s*-\s*\d+[a-zA-Z]?\b", "${1}"),
            ("trailing_separator", r"[,\s]+$", ""),
        ] {
            table.push_rule(name, pattern, replacement)?;
        }
        table.push_exact(
            "Naumannstr. 12, 01809 Heidenau",
            "Naumannstraße 12, 01809 Heidenau",
        );
        table.push_exact(
            "Gewerbegebiet Am Wasserwerk, 01640 Coswig",
            "Am Wasserwerk 5, 01640 Coswig",
        );
        Ok(table)
    }

    pub fn push_rule(&mut self, name: &str, pattern: &str, replacement: &str) -> AppResult<()> {
        let pattern = Regex::new(pattern)
            .map_err(|err| AppError::Config(format!("correction rule {name}: {err}")))?;
        self.rules.push(CorrectionRule {
            name: name.to_string(),
            pattern,
            replacement: replacement.to_string(),
        });
        Ok(())
    }

    pub fn push_exact(&mut self, from: &str, to: &str) {
        self.exact.push((canonical_key(from), to.to_string()));
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|rule| rule.name.as_str()).collect()
    }

    /// Rewritten query, or `None` when no rule changes anything.
    pub fn correct(&self, query: &str) -> Option<Correction> {
        let key = canonical_key(query);
        if let Some((_, to)) = self.exact.iter().find(|(from, _)| *from == key) {
            return Some(Correction {
                text: to.clone(),
                applied: vec!["exact".to_string()],
            });
        }

        let mut text = query.to_string();
        let mut applied = Vec::new();
        for rule in &self.rules {
            let rewritten = rule.pattern.replace_all(&text, rule.replacement.as_str());
            if rewritten != text {
                applied.push(rule.name.clone());
                text = rewritten.into_owned();
            }
        }
        let text = text.trim().to_string();

        if applied.is_empty() || text.is_empty() || text == query {
            None
        } else {
            Some(Correction { text, applied })
        }
    }
}
