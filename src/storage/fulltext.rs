//! Derived full-text index over searchable entity text.
//!
//! The index is never a source of truth: it is maintained on commit and can be
//! rebuilt from the entity table at any time. Scoring is Okapi BM25 computed
//! against per-branch statistics, so one branch's documents never influence
//! another branch's ranking.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::entity::{Entity, EntityId};

const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;

static TOKEN_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// Lowercased word tokens (unicode letters and digits).
pub(crate) fn tokens(text: &str) -> Vec<String> {
    let re = TOKEN_RE.get_or_init(|| Regex::new(r"[\p{L}\p{N}]+").ok());
    match re {
        Some(re) => re
            .find_iter(text)
            .map(|m| m.as_str().to_lowercase())
            .collect(),
        None => crate::embedding::tokenize(text)
            .map(str::to_lowercase)
            .collect(),
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct BranchStats {
    docs: u32,
    total_len: u64,
}

#[derive(Debug, Clone)]
struct DocInfo {
    branch: String,
    len: u32,
}

/// Inverted index: token -> (entity -> term frequency).
#[derive(Debug, Default)]
pub(crate) struct FullTextIndex {
    postings: HashMap<String, HashMap<EntityId, u32>>,
    docs: HashMap<EntityId, DocInfo>,
    branches: HashMap<String, BranchStats>,
}

impl FullTextIndex {
    pub(crate) fn clear(&mut self) {
        self.postings.clear();
        self.docs.clear();
        self.branches.clear();
    }

    /// Indexes an entity if it carries text. Re-adding the same id is a no-op.
    pub(crate) fn add(&mut self, entity: &Entity) {
        let Some(text) = entity.text() else {
            return;
        };
        if self.docs.contains_key(&entity.id) {
            return;
        }

        let toks = tokens(text);
        let len = u32::try_from(toks.len()).unwrap_or(u32::MAX);
        for tok in toks {
            *self
                .postings
                .entry(tok)
                .or_default()
                .entry(entity.id)
                .or_insert(0) += 1;
        }

        let stats = self.branches.entry(entity.branch_name.clone()).or_default();
        stats.docs += 1;
        stats.total_len += u64::from(len);
        self.docs.insert(
            entity.id,
            DocInfo {
                branch: entity.branch_name.clone(),
                len,
            },
        );
    }

    /// BM25 scores for documents on `branch`, best first, ties by id.
    pub(crate) fn search(&self, branch: &str, query: &str) -> Vec<(EntityId, f32)> {
        let Some(stats) = self.branches.get(branch).copied() else {
            return Vec::new();
        };
        if stats.docs == 0 {
            return Vec::new();
        }

        #[allow(clippy::cast_precision_loss)]
        let n = stats.docs as f32;
        #[allow(clippy::cast_precision_loss)]
        let avgdl = (stats.total_len as f32 / n).max(1.0);

        let mut query_tokens = tokens(query);
        query_tokens.sort();
        query_tokens.dedup();

        let mut scores: HashMap<EntityId, f32> = HashMap::new();
        for tok in &query_tokens {
            let Some(postings) = self.postings.get(tok) else {
                continue;
            };
            let on_branch: Vec<(EntityId, u32, u32)> = postings
                .iter()
                .filter_map(|(id, tf)| {
                    let doc = self.docs.get(id)?;
                    (doc.branch == branch).then_some((*id, *tf, doc.len))
                })
                .collect();
            if on_branch.is_empty() {
                continue;
            }

            #[allow(clippy::cast_precision_loss)]
            let df = on_branch.len() as f32;
            let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();

            for (id, tf, len) in on_branch {
                #[allow(clippy::cast_precision_loss)]
                let tf = tf as f32;
                #[allow(clippy::cast_precision_loss)]
                let dl = len as f32;
                let denom = tf + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / avgdl);
                *scores.entry(id).or_insert(0.0) += idf * tf * (BM25_K1 + 1.0) / denom;
            }
        }

        let mut ranked: Vec<(EntityId, f32)> = scores.into_iter().filter(|(_, s)| *s > 0.0).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityPayload, Fact};

    fn fact(branch: &str, text: &str) -> Entity {
        Entity::new(branch, EntityPayload::Fact(Fact::new(text, "general", 0.5).unwrap()))
    }

    #[test]
    fn tokens_are_lowercased_words() {
        assert_eq!(tokens("Deploy to STAGING, v2!"), vec!["deploy", "to", "staging", "v2"]);
    }

    #[test]
    fn bm25_prefers_denser_match_and_scopes_by_branch() {
        let mut index = FullTextIndex::default();
        let dense = fact("main", "rust rust rust compiler");
        let sparse = fact("main", "rust is a language with a long description of many words");
        let other = fact("t1", "rust rust rust rust");
        index.add(&dense);
        index.add(&sparse);
        index.add(&other);

        let hits = index.search("main", "rust");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, dense.id);
        assert!(hits.iter().all(|(id, _)| *id != other.id));

        assert!(index.search("main", "python").is_empty());
        assert!(index.search("missing", "rust").is_empty());
    }
}
