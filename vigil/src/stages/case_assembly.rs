//! Stage 1: case assembly.
//!
//! Extracts structured enforcement cases from each pending enforcement
//! document. Documents fan out to the model under the concurrency bound;
//! each document's cases and its marker commit atomically, so a crash
//! mid-stage loses at most in-flight documents, never halves of one.

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::delta::{content_hash, Pending};
use crate::errors::StageError;
use crate::model::PromptTemplate;
use crate::store::entities::{Case, Document, MarkerScope, ProcessedMarker};
use crate::store::{EntityWrite, StageCommit};

use super::{ItemError, Stage, StageContext, StageOutcome, StageReport};

const EXTRACTION_PROMPT: &str = "\
You are analyzing a government enforcement document. Extract every \
distinct fraud or abuse case it describes.

Document ({file_name}):
{document}

Respond with ONLY a JSON array. Each element:
{\"case_name\": str, \"scheme_mechanics\": str, \"exploited_policy\": str, \
\"enabling_condition\": str, \"scale_dollars\": str or null, \
\"scale_defendants\": int or null, \"scale_duration\": str or null, \
\"detection_method\": str or null}

enabling_condition must name the structural design feature of the policy \
that made the scheme possible, not the criminal act itself. \
scale_dollars is the raw dollar figure as written in the document.";

#[derive(Debug, Deserialize)]
struct ExtractedCase {
    case_name: String,
    scheme_mechanics: String,
    exploited_policy: String,
    enabling_condition: String,
    scale_dollars: Option<String>,
    scale_defendants: Option<u32>,
    scale_duration: Option<String>,
    detection_method: Option<String>,
}

fn dollar_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::unwrap_used)] // pattern is a tested constant
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\$?\s*([0-9]+(?:\.[0-9]+)?)\s*(billion|bn|b|million|mm|m|thousand|k)?$")
            .unwrap()
    })
}

/// Parses a dollar figure as written in source text into a numeric
/// value. Anything that does not parse cleanly, including trailing
/// footnote markers, returns `None`: an explicit unknown beats a wrong
/// number in every downstream consumer.
#[must_use]
pub fn parse_dollars(raw: &str) -> Option<f64> {
    let cleaned = raw.trim().replace(',', "");
    let caps = dollar_regex().captures(&cleaned)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let multiplier = match caps.get(2).map(|m| m.as_str().to_lowercase()) {
        Some(s) if s == "billion" || s == "bn" || s == "b" => 1e9,
        Some(s) if s == "million" || s == "mm" || s == "m" => 1e6,
        Some(s) if s == "thousand" || s == "k" => 1e3,
        Some(_) => return None,
        None => 1.0,
    };
    Some(value * multiplier)
}

/// Stage 1 implementation.
#[derive(Debug, Default)]
pub struct CaseAssemblyStage;

impl CaseAssemblyStage {
    fn cases_from(doc: &Document, extracted: Vec<ExtractedCase>) -> Vec<Case> {
        extracted
            .into_iter()
            .map(|e| Case {
                case_id: format!(
                    "case_{}",
                    content_hash(&format!("{}|{}", doc.file_name, e.case_name))
                ),
                source_document: doc.file_name.clone(),
                case_name: e.case_name,
                scheme_mechanics: e.scheme_mechanics,
                exploited_policy: e.exploited_policy,
                enabling_condition: e.enabling_condition,
                scale_dollars: e.scale_dollars.as_deref().and_then(parse_dollars),
                scale_defendants: e.scale_defendants,
                scale_duration: e.scale_duration,
                detection_method: e.detection_method,
                extracted_at: Utc::now(),
            })
            .collect()
    }
}

#[async_trait]
impl Stage for CaseAssemblyStage {
    fn number(&self) -> u32 {
        1
    }

    fn name(&self) -> &'static str {
        "case-assembly"
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageReport, StageError> {
        let set = ctx.delta.pending_documents_for_extraction().await?;
        if set.is_empty() {
            return Ok(StageReport {
                items_processed: 0,
                skipped: set.skipped,
                item_errors: Vec::new(),
                outcome: StageOutcome::Completed,
            });
        }

        let template = PromptTemplate::new("case-extraction", EXTRACTION_PROMPT);
        let limit = ctx.config.pipeline.max_concurrency;

        let results = crate::parallel::map_bounded(set.pending, limit, |pending| {
            let client = ctx.client.clone();
            let template = template.clone();
            async move {
                let mut vars = HashMap::new();
                vars.insert("file_name", pending.item.file_name.clone());
                vars.insert("document", pending.item.text.clone());
                let extracted: Result<Vec<ExtractedCase>, _> =
                    client.submit(&template, &vars).await;
                (pending, extracted)
            }
        })
        .await;

        let mut processed = 0u64;
        let mut item_errors = Vec::new();

        for (pending, extracted) in results {
            let Pending {
                item: doc,
                item_id,
                input_hash,
            } = pending;
            match extracted {
                Ok(extracted) => {
                    let cases = Self::cases_from(&doc, extracted);
                    let mut commit = StageCommit::new(&ctx.run_id, 1);
                    commit.writes = cases.into_iter().map(EntityWrite::Case).collect();
                    commit.markers.push(ProcessedMarker::new(
                        1,
                        MarkerScope::Global,
                        &item_id,
                        &input_hash,
                        &ctx.run_id,
                    ));
                    ctx.store.commit(commit).await?;
                    processed += 1;
                }
                Err(e) => {
                    warn!(doc = %item_id, error = %e, "case extraction failed");
                    item_errors.push(ItemError {
                        item_id,
                        detail: e.to_string(),
                    });
                }
            }
        }

        info!(
            processed,
            skipped = set.skipped,
            failed = item_errors.len(),
            "case assembly finished"
        );
        Ok(StageReport {
            items_processed: processed,
            skipped: set.skipped,
            item_errors,
            outcome: StageOutcome::Completed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_suffixed_amounts() {
        assert_eq!(parse_dollars("$10.6 billion"), Some(10_600_000_000.0));
        assert_eq!(parse_dollars("$3,400,000"), Some(3_400_000.0));
        assert_eq!(parse_dollars("2.5M"), Some(2_500_000.0));
        assert_eq!(parse_dollars("$900k"), Some(900_000.0));
        assert_eq!(parse_dollars("47"), Some(47.0));
    }

    #[test]
    fn malformed_amounts_are_unknown_not_wrong() {
        // Footnote markers and prose must not round-trip into numbers.
        assert_eq!(parse_dollars("$1.2 million*"), None);
        assert_eq!(parse_dollars("approximately $5 million"), None);
        assert_eq!(parse_dollars("unknown"), None);
        assert_eq!(parse_dollars(""), None);
        assert_eq!(parse_dollars("$1.2.3 million"), None);
    }

    #[test]
    fn case_ids_are_stable_per_document_and_name() {
        let doc = Document {
            doc_id: "doc_a".to_string(),
            file_name: "doj_2024.txt".to_string(),
            doc_type: crate::store::entities::DocType::Enforcement,
            text: String::new(),
            ingested_at: Utc::now(),
        };
        let extract = || ExtractedCase {
            case_name: "Phantom Clinic".to_string(),
            scheme_mechanics: "billed no-shows".to_string(),
            exploited_policy: "fee-for-service".to_string(),
            enabling_condition: "unverified visits".to_string(),
            scale_dollars: Some("$1.2 million*".to_string()),
            scale_defendants: Some(3),
            scale_duration: None,
            detection_method: None,
        };

        let first = CaseAssemblyStage::cases_from(&doc, vec![extract()]);
        let second = CaseAssemblyStage::cases_from(&doc, vec![extract()]);
        assert_eq!(first[0].case_id, second[0].case_id);
        // The starred figure lands as the unknown sentinel.
        assert_eq!(first[0].scale_dollars, None);
    }
}
