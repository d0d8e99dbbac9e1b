//! Document classification: deterministic anchors first, LLM as fallback.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use captrace_model::DocType;

use crate::llm::LlmClient;
use crate::metrics::Metrics;
use crate::parse::ParsedDoc;

/// Pages of text the anchor pass looks at.
const CLASSIFY_PAGES: usize = 3;
/// Confidence ceiling for LLM answers; deterministic evidence keeps
/// precedence.
const LLM_CONFIDENCE_CAP: f64 = 0.85;
/// Confidence ceiling when ambiguous anchors are all we have (LLM failed).
const WEAK_ANCHOR_CAP: f64 = 0.6;
/// Confidence when nothing matched at all.
const FALLBACK_CONFIDENCE: f64 = 0.1;

struct Anchor {
    pattern: Regex,
    weight: f64,
}

fn anchor(pattern: &str, weight: f64) -> Anchor {
    Anchor {
        pattern: Regex::new(&format!("(?i){pattern}")).expect("valid anchor regex"),
        weight,
    }
}

/// Ordered anchor sets. Phrases cover EN plus the DE/ES variants seen in
/// investor folders.
static ANCHORS: Lazy<Vec<(DocType, Vec<Anchor>)>> = Lazy::new(|| {
    vec![
        (
            DocType::CapitalAccountStatement,
            vec![
                anchor(r"capital\s+account\s+statement", 1.0),
                anchor(r"statement\s+of\s+capital\s+account", 1.0),
                anchor(r"kapitalkontoauszug", 1.0),
                anchor(r"kapitalkonto", 0.7),
                anchor(r"estado\s+de\s+cuenta\s+de\s+capital", 1.0),
                anchor(r"capital\s+account", 0.5),
                anchor(r"beginning\s+balance", 0.4),
                anchor(r"ending\s+balance", 0.4),
                anchor(r"partner'?s?\s+capital", 0.4),
            ],
        ),
        (
            DocType::CapitalCallNotice,
            vec![
                anchor(r"capital\s+call\s+notice", 1.0),
                anchor(r"capital\s+call", 0.8),
                anchor(r"drawdown\s+notice", 0.9),
                anchor(r"kapitalabruf", 0.9),
                anchor(r"solicitud\s+de\s+capital", 0.9),
                anchor(r"payment\s+due\s+date", 0.3),
            ],
        ),
        (
            DocType::DistributionNotice,
            vec![
                anchor(r"distribution\s+notice", 1.0),
                anchor(r"notice\s+of\s+distribution", 1.0),
                anchor(r"aussch(ü|u)ttung", 0.8),
                anchor(r"distribuci(ó|o)n", 0.7),
                anchor(r"return\s+of\s+capital", 0.4),
            ],
        ),
        (
            DocType::QuarterlyReport,
            vec![
                anchor(r"quarterly\s+report", 1.0),
                anchor(r"quarterly\s+update", 0.8),
                anchor(r"quartalsbericht", 0.9),
                anchor(r"informe\s+trimestral", 0.9),
                anchor(r"q[1-4]\s+20\d{2}\s+report", 0.6),
            ],
        ),
        (
            DocType::AnnualReport,
            vec![
                anchor(r"annual\s+report", 1.0),
                anchor(r"jahresbericht", 0.9),
                anchor(r"informe\s+anual", 0.9),
                anchor(r"audited\s+financial\s+statements", 0.7),
            ],
        ),
        (
            DocType::Subscription,
            vec![
                anchor(r"subscription\s+agreement", 1.0),
                anchor(r"subscription\s+form", 0.8),
                anchor(r"zeichnungsschein", 0.9),
            ],
        ),
        (
            DocType::Lpa,
            vec![
                anchor(r"limited\s+partnership\s+agreement", 1.0),
                anchor(r"\blpa\b", 0.6),
                anchor(r"gesellschaftsvertrag", 0.7),
            ],
        ),
        (
            DocType::Ppm,
            vec![
                anchor(r"private\s+placement\s+memorandum", 1.0),
                anchor(r"\bppm\b", 0.6),
                anchor(r"offering\s+memorandum", 0.8),
            ],
        ),
    ]
});

/// How a classification was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifyMethod {
    Anchor,
    Llm,
    WeakAnchor,
    Fallback,
}

impl ClassifyMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ClassifyMethod::Anchor => "anchor",
            ClassifyMethod::Llm => "llm",
            ClassifyMethod::WeakAnchor => "weak_anchor",
            ClassifyMethod::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierOutcome {
    pub doc_type: DocType,
    pub confidence: f64,
    pub method: ClassifyMethod,
}

/// Anchor voting plus LLM fallback.
pub struct Classifier {
    llm: Arc<dyn LlmClient>,
    metrics: Arc<Metrics>,
    /// Winner's normalized share must lead the runner-up by this much.
    margin: f64,
    /// Winner's cumulative raw weight must exceed this.
    threshold: f64,
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier")
            .field("margin", &self.margin)
            .field("threshold", &self.threshold)
            .finish()
    }
}

impl Classifier {
    pub fn new(llm: Arc<dyn LlmClient>, metrics: Arc<Metrics>) -> Self {
        Self {
            llm,
            metrics,
            margin: 0.2,
            threshold: 1.0,
        }
    }

    pub async fn classify(&self, filename: &str, doc: &ParsedDoc) -> ClassifierOutcome {
        let haystack = format!("{filename}\n{}", doc.head_text(CLASSIFY_PAGES));
        let votes = anchor_votes(&haystack);

        if let Some(outcome) = self.decide_deterministic(&votes) {
            return outcome;
        }

        Metrics::incr(&self.metrics.llm_calls);
        match self
            .llm
            .classify(&doc.head_text(CLASSIFY_PAGES), filename)
            .await
        {
            Ok(answer) => ClassifierOutcome {
                doc_type: answer.doc_type,
                confidence: answer.confidence.min(LLM_CONFIDENCE_CAP),
                method: ClassifyMethod::Llm,
            },
            Err(err) => {
                warn!(error = %err, filename, "llm classification failed");
                self.decide_after_llm_failure(&votes)
            }
        }
    }

    fn decide_deterministic(&self, votes: &[(DocType, f64)]) -> Option<ClassifierOutcome> {
        let total: f64 = votes.iter().map(|(_, w)| w).sum();
        if total <= 0.0 {
            return None;
        }
        let ranked = rank(votes);
        let (winner, winner_weight) = ranked[0];
        let runner_weight = ranked.get(1).map(|(_, w)| *w).unwrap_or(0.0);
        let winner_share = winner_weight / total;
        let runner_share = runner_weight / total;

        if winner_weight > self.threshold && winner_share - runner_share > self.margin {
            debug!(doc_type = %winner, share = winner_share, "deterministic classification");
            Some(ClassifierOutcome {
                doc_type: winner,
                confidence: winner_share,
                method: ClassifyMethod::Anchor,
            })
        } else {
            None
        }
    }

    /// Ambiguous anchors and a dead LLM: use the tie-broken anchor winner
    /// with a reduced ceiling; with no anchors at all, `other` at 0.1.
    fn decide_after_llm_failure(&self, votes: &[(DocType, f64)]) -> ClassifierOutcome {
        let total: f64 = votes.iter().map(|(_, w)| w).sum();
        if total <= 0.0 {
            return ClassifierOutcome {
                doc_type: DocType::Other,
                confidence: FALLBACK_CONFIDENCE,
                method: ClassifyMethod::Fallback,
            };
        }
        let ranked = rank(votes);
        let (winner, weight) = ranked[0];
        ClassifierOutcome {
            doc_type: winner,
            confidence: (weight / total).min(WEAK_ANCHOR_CAP),
            method: ClassifyMethod::WeakAnchor,
        }
    }
}

/// Sum anchor weights per type over the haystack.
fn anchor_votes(haystack: &str) -> Vec<(DocType, f64)> {
    ANCHORS
        .iter()
        .map(|(ty, anchors)| {
            let weight = anchors
                .iter()
                .filter(|a| a.pattern.is_match(haystack))
                .map(|a| a.weight)
                .sum::<f64>();
            (*ty, weight)
        })
        .filter(|(_, w)| *w > 0.0)
        .collect()
}

/// Sort by weight, breaking exact ties toward the more specific type.
fn rank(votes: &[(DocType, f64)]) -> Vec<(DocType, f64)> {
    let mut ranked = votes.to_vec();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.specificity_rank().cmp(&b.0.specificity_rank()))
    });
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Classification, LlmError, MockLlmClient};
    use crate::parse::Page;

    fn doc_with_text(text: &str) -> ParsedDoc {
        ParsedDoc {
            pages: vec![Page {
                no: 1,
                text: text.to_string(),
            }],
            tables: vec![],
            metadata: Default::default(),
        }
    }

    fn classifier(llm: MockLlmClient) -> Classifier {
        Classifier::new(Arc::new(llm), Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn strong_anchors_skip_the_llm() {
        let mut llm = MockLlmClient::new();
        llm.expect_classify().never();
        let c = classifier(llm);

        let doc = doc_with_text(
            "Capital Account Statement\nBeginning Balance: 1\nEnding Balance: 2",
        );
        let outcome = c.classify("cas_q4.pdf", &doc).await;
        assert_eq!(outcome.doc_type, DocType::CapitalAccountStatement);
        assert_eq!(outcome.method, ClassifyMethod::Anchor);
        assert!(outcome.confidence > 0.8);
    }

    #[tokio::test]
    async fn ambiguous_text_falls_back_to_llm_with_capped_confidence() {
        let mut llm = MockLlmClient::new();
        llm.expect_classify().returning(|_, _| {
            Ok(Classification {
                doc_type: DocType::QuarterlyReport,
                confidence: 0.99,
            })
        });
        let c = classifier(llm);

        let outcome = c.classify("scan0001.pdf", &doc_with_text("some plain letter")).await;
        assert_eq!(outcome.doc_type, DocType::QuarterlyReport);
        assert_eq!(outcome.method, ClassifyMethod::Llm);
        assert!(outcome.confidence <= 0.85);
    }

    #[tokio::test]
    async fn no_anchors_and_llm_error_yields_other() {
        let mut llm = MockLlmClient::new();
        llm.expect_classify()
            .returning(|_, _| Err(LlmError::Transient("down".into())));
        let c = classifier(llm);

        let outcome = c.classify("scan.pdf", &doc_with_text("nothing useful")).await;
        assert_eq!(outcome.doc_type, DocType::Other);
        assert_eq!(outcome.confidence, 0.1);
        assert_eq!(outcome.method, ClassifyMethod::Fallback);
    }

    #[tokio::test]
    async fn deterministic_tie_prefers_the_more_specific_type() {
        let mut llm = MockLlmClient::new();
        llm.expect_classify()
            .returning(|_, _| Err(LlmError::Transient("down".into())));
        let c = classifier(llm);

        // One 1.0-weight anchor each: equal votes, below the deterministic
        // gates.
        let doc = doc_with_text("Quarterly Report\nEstado de cuenta de capital");
        let outcome = c.classify("scan.pdf", &doc).await;
        // Equal votes, LLM dead: the weak-anchor path must tie-break to the
        // more specific capital account statement.
        assert_eq!(outcome.doc_type, DocType::CapitalAccountStatement);
        assert_eq!(outcome.method, ClassifyMethod::WeakAnchor);
    }

    #[test]
    fn votes_ignore_unmatched_types() {
        let votes = anchor_votes("capital call notice issued today");
        assert!(votes.iter().any(|(t, _)| *t == DocType::CapitalCallNotice));
        assert!(votes.iter().all(|(t, _)| *t != DocType::AnnualReport));
    }
}
