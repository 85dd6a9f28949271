use std::collections::HashMap;

use serde::Serialize;

/// A fixed internal location that resolves without touching a provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynonymEntry {
    pub key: String,
    pub resolved_address: String,
    pub lat: f64,
    pub lon: f64,
    pub customer_number: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SynonymHit {
    pub key: String,
    pub resolved_address: String,
    pub lat: f64,
    pub lon: f64,
}

/// Lookup table keyed by a token signature: upper-cased alphanumeric tokens,
/// sorted. `"Jochen - PF"`, `"PF JOCHEN"` and `"pf:jochen"` share one key.
#[derive(Debug, Clone, Default)]
pub struct SynonymTable {
    entries: Vec<SynonymEntry>,
    by_signature: HashMap<String, usize>,
}

impl SynonymTable {
    pub fn new(entries: Vec<SynonymEntry>) -> Self {
        let mut table = Self::default();
        for entry in entries {
            table.insert(entry);
        }
        table
    }

    /// Depot codes used by dispatch.
    pub fn builtin() -> Self {
        Self::new(vec![
            SynonymEntry {
                key: "PF:JOCHEN".into(),
                resolved_address: "Pf-Depot Jochen, Dresden".into(),
                lat: 51.05,
                lon: 13.7373,
                customer_number: Some(9999),
            },
            SynonymEntry {
                key: "PF:SVEN".into(),
                resolved_address: "Pf-Depot Sven, Dresden".into(),
                lat: 51.06,
                lon: 13.73,
                customer_number: Some(9998),
            },
        ])
    }

    pub fn insert(&mut self, entry: SynonymEntry) {
        let signature = signature(&entry.key);
        if let Some(index) = self.by_signature.get(&signature).copied() {
            self.entries[index] = entry;
            return;
        }
        self.entries.push(entry);
        self.by_signature.insert(signature, self.entries.len() - 1);
    }

    pub fn resolve(&self, name_or_address: &str) -> Option<SynonymHit> {
        self.lookup(name_or_address).map(|entry| SynonymHit {
            key: entry.key.clone(),
            resolved_address: entry.resolved_address.clone(),
            lat: entry.lat,
            lon: entry.lon,
        })
    }

    pub fn customer_number(&self, name: &str) -> Option<u32> {
        self.lookup(name).and_then(|entry| entry.customer_number)
    }

    pub fn entries(&self) -> &[SynonymEntry] {
        &self.entries
    }

    fn lookup(&self, text: &str) -> Option<&SynonymEntry> {
        let signature = signature(text);
        if signature.is_empty() {
            return None;
        }
        self.by_signature
            .get(&signature)
            .and_then(|index| self.entries.get(*index))
    }
}

fn signature(text: &str) -> String {
    let mut tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_uppercase)
        .collect();
    tokens.sort();
    tokens.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_spelling_variants_of_depot_codes() {
        let table = SynonymTable::builtin();
        for input in ["Jochen - PF", "PF JOCHEN", "pf:jochen", "  jochen   pf "] {
            let hit = table.resolve(input).unwrap();
            assert_eq!(hit.key, "PF:JOCHEN", "input {input:?}");
            assert_eq!(hit.lat, 51.05);
            assert_eq!(hit.lon, 13.7373);
        }
        assert_eq!(table.resolve("Sven - PF").unwrap().resolved_address, "Pf-Depot Sven, Dresden");
    }

    #[test]
    fn ignores_partial_and_unknown_names() {
        let table = SynonymTable::builtin();
        assert!(table.resolve("Jochen").is_none());
        assert!(table.resolve("PF Jochen Sven").is_none());
        assert!(table.resolve("").is_none());
        assert!(table.resolve(" - ").is_none());
    }

    #[test]
    fn exposes_customer_numbers() {
        let table = SynonymTable::builtin();
        assert_eq!(table.customer_number("PF JOCHEN"), Some(9999));
        assert_eq!(table.customer_number("Sven - PF"), Some(9998));
        assert_eq!(table.customer_number("Fröbelstraße 1"), None);
    }

    #[test]
    fn insert_replaces_same_signature() {
        let mut table = SynonymTable::builtin();
        table.insert(SynonymEntry {
            key: "JOCHEN PF".into(),
            resolved_address: "Neues Depot, Freital".into(),
            lat: 51.0,
            lon: 13.65,
            customer_number: None,
        });
        assert_eq!(table.entries().len(), 2);
        assert_eq!(table.resolve("PF:JOCHEN").unwrap().resolved_address, "Neues Depot, Freital");
    }
}
