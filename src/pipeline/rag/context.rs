use serde::Serialize;

use super::retrieval::rank_evidence;
use crate::config::ContextConfig;
use crate::models::*;
use crate::pipeline::text::text_similarity;

/// Latin text averages ~4 chars/token for subword tokenizers.
const CHARS_PER_TOKEN: usize = 4;

fn is_cjk(c: char) -> bool {
    matches!(c, '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}' | '\u{3000}'..='\u{303F}' | '\u{FF00}'..='\u{FFEF}')
}

/// Estimate tokens for a given text. CJK characters count one token each,
/// everything else at 4 chars/token.
pub fn estimate_tokens(text: &str) -> usize {
    let (cjk, other) = text.chars().fold((0usize, 0usize), |(cjk, other), c| {
        if is_cjk(c) {
            (cjk + 1, other)
        } else {
            (cjk, other + 1)
        }
    });
    cjk + other.div_ceil(CHARS_PER_TOKEN)
}

/// One retained evidence item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextItem {
    pub provenance: String,
    /// Provenance of near-duplicates folded into this item.
    pub merged_provenance: Vec<String>,
    pub origin: EvidenceOrigin,
    pub content: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AssembledContext {
    pub text: String,
    pub items: Vec<ContextItem>,
    pub estimated_tokens: usize,
    /// Items cut by the token budget.
    pub dropped: usize,
    /// Items folded into a higher-ranked near-duplicate.
    pub merged: usize,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Every provenance id behind the context, merged ones included.
    pub fn provenance(&self) -> Vec<String> {
        self.items
            .iter()
            .flat_map(|item| {
                std::iter::once(item.provenance.clone()).chain(item.merged_provenance.iter().cloned())
            })
            .collect()
    }
}

fn render_item(item: &ContextItem) -> String {
    let label = match item.origin {
        EvidenceOrigin::Knowledge => "KNOWLEDGE",
        EvidenceOrigin::Profile => "PROFILE",
    };
    format!("<{label}>\n[{}] {}\n</{label}>", item.provenance, item.content)
}

/// Turns ranked evidence into a deduplicated, token-bounded context block.
pub struct ContextAssembler {
    max_tokens: usize,
    dedup_threshold: f64,
}

impl ContextAssembler {
    pub fn new(config: &ContextConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            dedup_threshold: config.dedup_threshold,
        }
    }

    pub fn assemble(&self, evidence: &[EvidenceItem]) -> AssembledContext {
        let mut ranked = evidence.to_vec();
        rank_evidence(&mut ranked);

        let mut unique: Vec<ContextItem> = Vec::with_capacity(ranked.len());
        let mut merged = 0;
        for item in ranked {
            let duplicate_of = unique
                .iter_mut()
                .find(|kept| text_similarity(&kept.content, &item.content) > self.dedup_threshold);
            match duplicate_of {
                Some(kept) => {
                    kept.merged_provenance.push(item.provenance_id);
                    merged += 1;
                }
                None => unique.push(ContextItem {
                    provenance: item.provenance_id,
                    merged_provenance: Vec::new(),
                    origin: item.origin,
                    content: item.content,
                    score: item.score,
                }),
            }
        }

        // Keep the longest ranked prefix that fits. Items are never cut.
        let total = unique.len();
        let mut sections: Vec<String> = Vec::new();
        let mut items = Vec::new();
        let mut used_tokens = 0;
        for item in unique {
            let section = render_item(&item);
            let separator = if sections.is_empty() { 0 } else { 1 };
            let cost = estimate_tokens(&section) + separator;
            if used_tokens + cost > self.max_tokens {
                break;
            }
            used_tokens += cost;
            sections.push(section);
            items.push(item);
        }
        let dropped = total - items.len();

        let text = sections.join("\n\n");
        let estimated_tokens = estimate_tokens(&text);

        if dropped > 0 {
            tracing::debug!(
                kept = items.len(),
                dropped,
                budget = self.max_tokens,
                "Context truncated to token budget"
            );
        }

        AssembledContext {
            text,
            items,
            estimated_tokens,
            dropped,
            merged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(origin: EvidenceOrigin, provenance: &str, content: &str, score: f64) -> EvidenceItem {
        EvidenceItem {
            origin,
            content: content.into(),
            score,
            provenance_id: provenance.into(),
            deviation: 0.0,
            recorded_at: None,
            metrics: vec![],
        }
    }

    fn assembler(max_tokens: usize) -> ContextAssembler {
        ContextAssembler::new(&ContextConfig {
            max_tokens,
            ..Default::default()
        })
    }

    #[test]
    fn token_estimate_counts_cjk_per_char() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens("高血压"), 3);
    }

    #[test]
    fn renders_labelled_sections_with_provenance() {
        let ctx = assembler(2000).assemble(&[
            item(EvidenceOrigin::Knowledge, "knowledge:htn.md#1", "High blood pressure guidance.", 0.9),
            item(EvidenceOrigin::Profile, "profile:2025-01-01T00:00:00+00:00#blood_pressure", "2025-01-01 blood pressure: 135/88", 0.3),
        ]);
        assert_eq!(ctx.items.len(), 2);
        assert!(ctx.text.starts_with("<KNOWLEDGE>\n[knowledge:htn.md#1] High blood pressure guidance.\n</KNOWLEDGE>"));
        assert!(ctx.text.contains("<PROFILE>\n[profile:2025-01-01T00:00:00+00:00#blood_pressure]"));
        assert!(ctx.estimated_tokens <= 2000);
    }

    #[test]
    fn near_duplicates_merge_into_higher_ranked() {
        let text = "Hypertension is blood pressure at or above 140/90 mmHg.";
        let ctx = assembler(2000).assemble(&[
            item(EvidenceOrigin::Knowledge, "knowledge:b.md#2", text, 0.4),
            item(EvidenceOrigin::Knowledge, "knowledge:a.md#1", text, 0.8),
            item(EvidenceOrigin::Knowledge, "knowledge:c.md#3", "Fasting glucose guidance.", 0.5),
        ]);
        assert_eq!(ctx.merged, 1);
        assert_eq!(ctx.items.len(), 2);
        assert_eq!(ctx.items[0].provenance, "knowledge:a.md#1");
        assert_eq!(ctx.items[0].merged_provenance, vec!["knowledge:b.md#2".to_string()]);
        assert_eq!(ctx.provenance().len(), 3);
    }

    #[test]
    fn budget_drops_lowest_ranked_whole_items() {
        let evidence: Vec<_> = (0..5)
            .map(|i| {
                item(
                    EvidenceOrigin::Knowledge,
                    &format!("knowledge:doc.md#{i}"),
                    &format!("topic{i} ").repeat(40),
                    1.0 - i as f64 * 0.1,
                )
            })
            .collect();
        let ctx = assembler(200).assemble(&evidence);

        assert!(ctx.dropped > 0);
        assert!(ctx.estimated_tokens <= 200);
        assert_eq!(ctx.items.len() + ctx.dropped, 5);
        for (i, kept) in ctx.items.iter().enumerate() {
            assert_eq!(kept.provenance, format!("knowledge:doc.md#{i}"));
            assert!(ctx.text.contains(&kept.content));
        }
    }

    #[test]
    fn oversized_top_item_yields_empty_context() {
        let ctx = assembler(10).assemble(&[item(
            EvidenceOrigin::Knowledge,
            "knowledge:big.md#0",
            &"x".repeat(400),
            1.0,
        )]);
        assert!(ctx.is_empty());
        assert_eq!(ctx.text, "");
        assert_eq!(ctx.dropped, 1);
    }
}
