//! Canonicalization and identity resolution: currencies, investors, funds,
//! periods.

use std::collections::HashSet;

use captrace_model::FundId;
use tracing::debug;

/// Similarity floor for accepting an existing fund as the same identity.
/// Below it the resolver creates a new fund rather than silently merging.
pub const FUND_MATCH_THRESHOLD: f64 = 0.90;

/// Map a raw currency string to ISO-4217. Returns `(code, known)`; unknown
/// inputs fall back to `reporting_currency` with `known = false`, which the
/// caller records as a medium-severity audit entry.
pub fn normalize_currency(raw: Option<&str>, reporting_currency: &str) -> (String, bool) {
    let Some(raw) = raw else {
        return (reporting_currency.to_string(), true);
    };
    let cleaned = raw.trim();
    if cleaned.is_empty() {
        return (reporting_currency.to_string(), true);
    }
    let lowered = cleaned.to_lowercase();
    let mapped = match lowered.as_str() {
        "eur" | "euro" | "euros" | "€" => Some("EUR"),
        "usd" | "dollar" | "dollars" | "us dollar" | "us dollars" | "$" | "us$" => Some("USD"),
        "gbp" | "pound" | "pounds" | "pound sterling" | "£" => Some("GBP"),
        "chf" | "franken" | "swiss franc" | "swiss francs" => Some("CHF"),
        "jpy" | "yen" | "¥" => Some("JPY"),
        "sek" => Some("SEK"),
        "nok" => Some("NOK"),
        "dkk" => Some("DKK"),
        _ => None,
    };
    if let Some(code) = mapped {
        return (code.to_string(), true);
    }
    // Already a plausible ISO code?
    if cleaned.len() == 3 && cleaned.chars().all(|c| c.is_ascii_alphabetic()) {
        return (cleaned.to_ascii_uppercase(), true);
    }
    debug!(raw = cleaned, fallback = reporting_currency, "unknown currency");
    (reporting_currency.to_string(), false)
}

/// An existing fund the resolver can match against.
#[derive(Debug, Clone, PartialEq)]
pub struct FundCandidate {
    pub id: FundId,
    pub name: String,
    pub code: String,
}

/// Outcome of fund resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum FundMatch {
    /// Case-insensitive Jaro-Winkler >= 0.90 against an existing fund.
    Existing { id: FundId, similarity: f64 },
    /// No plausible match: create with a generated code.
    New { name: String, code: String },
}

/// Resolve an extracted fund name against the funds already known for the
/// investor. The resolver never invents a new identity when a plausible
/// match exists at or above the threshold.
pub fn resolve_fund(extracted_name: &str, existing: &[FundCandidate]) -> FundMatch {
    let needle = extracted_name.trim().to_lowercase();
    let mut best: Option<(&FundCandidate, f64)> = None;
    for candidate in existing {
        let similarity = strsim::jaro_winkler(&needle, &candidate.name.trim().to_lowercase());
        match best {
            Some((_, current)) if current >= similarity => {}
            _ => best = Some((candidate, similarity)),
        }
    }
    if let Some((candidate, similarity)) = best {
        if similarity >= FUND_MATCH_THRESHOLD {
            debug!(
                name = extracted_name,
                matched = %candidate.name,
                similarity,
                "fund resolved to existing identity"
            );
            return FundMatch::Existing {
                id: candidate.id,
                similarity,
            };
        }
    }
    let taken: HashSet<String> = existing.iter().map(|c| c.code.clone()).collect();
    FundMatch::New {
        name: extracted_name.trim().to_string(),
        code: generate_fund_code(extracted_name, &taken),
    }
}

/// Fund code from word initials, uniquified with a numeric suffix:
/// "Alpha Growth Fund II" -> "AGFI", then "AGFI2", "AGFI3", ...
pub fn generate_fund_code(name: &str, taken: &HashSet<String>) -> String {
    let base: String = name
        .split_whitespace()
        .filter_map(|word| word.chars().find(|c| c.is_alphanumeric()))
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let base = if base.is_empty() { "FUND".to_string() } else { base };
    if !taken.contains(&base) {
        return base;
    }
    let mut suffix = 2u32;
    loop {
        let candidate = format!("{base}{suffix}");
        if !taken.contains(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}

/// Whether an extracted investor name conflicts with the one the discovery
/// path dictates. The path wins; the conflict is only recorded.
pub fn investor_name_conflicts(extracted: Option<&str>, canonical_name: &str) -> bool {
    let Some(extracted) = extracted else {
        return false;
    };
    let extracted = extracted.trim();
    if extracted.is_empty() {
        return false;
    }
    let similarity =
        strsim::jaro_winkler(&extracted.to_lowercase(), &canonical_name.to_lowercase());
    similarity < 0.75
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_aliases_normalize() {
        assert_eq!(normalize_currency(Some("Euro"), "EUR"), ("EUR".into(), true));
        assert_eq!(normalize_currency(Some("€"), "EUR"), ("EUR".into(), true));
        assert_eq!(normalize_currency(Some("$"), "EUR"), ("USD".into(), true));
        assert_eq!(normalize_currency(Some("usd"), "EUR"), ("USD".into(), true));
        assert_eq!(normalize_currency(Some("SEK"), "EUR"), ("SEK".into(), true));
    }

    #[test]
    fn unknown_currency_falls_back_flagged() {
        let (code, known) = normalize_currency(Some("doubloons"), "EUR");
        assert_eq!(code, "EUR");
        assert!(!known);
        // Absent input is not a data-quality event.
        assert_eq!(normalize_currency(None, "USD"), ("USD".into(), true));
    }

    #[test]
    fn close_names_resolve_to_existing_fund() {
        let id = FundId::new();
        let existing = vec![FundCandidate {
            id,
            name: "Alpha Growth Fund II".into(),
            code: "AGFI".into(),
        }];
        match resolve_fund("alpha growth fund ii", &existing) {
            FundMatch::Existing { id: matched, similarity } => {
                assert_eq!(matched, id);
                assert!(similarity >= 0.99);
            }
            other => panic!("expected existing match, got {other:?}"),
        }
        // A typo'd variant still clears 0.90.
        match resolve_fund("Alpha Growth Fund I1", &existing) {
            FundMatch::Existing { .. } => {}
            other => panic!("expected existing match, got {other:?}"),
        }
    }

    #[test]
    fn distant_names_create_a_new_fund() {
        let existing = vec![FundCandidate {
            id: FundId::new(),
            name: "Alpha Growth Fund II".into(),
            code: "AGFI".into(),
        }];
        match resolve_fund("Mezzanine Credit Opportunities", &existing) {
            FundMatch::New { name, code } => {
                assert_eq!(name, "Mezzanine Credit Opportunities");
                assert_eq!(code, "MCO");
            }
            other => panic!("expected new fund, got {other:?}"),
        }
    }

    #[test]
    fn fund_codes_uniquify_with_suffix() {
        let mut taken = HashSet::new();
        assert_eq!(generate_fund_code("Alpha Growth Fund II", &taken), "AGFI");
        taken.insert("AGFI".into());
        assert_eq!(generate_fund_code("Alpine Global Fund I", &taken), "AGFI2");
        taken.insert("AGFI2".into());
        assert_eq!(generate_fund_code("Atlas Green Farm Invest", &taken), "AGFI3");
    }

    #[test]
    fn investor_conflicts_only_on_distant_names() {
        assert!(!investor_name_conflicts(
            Some("Brainweb Invest GmbH"),
            "Brainweb Invest"
        ));
        assert!(investor_name_conflicts(
            Some("Completely Different Family Office"),
            "Brainweb Invest"
        ));
        assert!(!investor_name_conflicts(None, "Brainweb Invest"));
    }
}
