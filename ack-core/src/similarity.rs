//! Lexical similarity over rendered evidence summaries.
//!
//! TF-IDF weighted cosine similarity computed per query over a small corpus
//! (one incident's evidence), so no index is persisted.

use std::collections::{HashMap, HashSet};

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "show", "that", "the", "this", "to", "was", "what", "which", "with",
];

pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() > 1)
        .map(str::to_lowercase)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .map(stem)
        .collect()
}

/// Folds simple plurals so "errors" matches "error".
fn stem(term: String) -> String {
    match term.strip_suffix('s') {
        Some(base) if base.len() > 2 && !base.ends_with('s') => base.to_string(),
        _ => term,
    }
}

/// Scores each document against `query`. The result is parallel to
/// `documents`; a score of 0.0 means no shared terms.
pub fn rank(query: &str, documents: &[&str]) -> Vec<f64> {
    let query_terms = tokenize(query);
    if query_terms.is_empty() || documents.is_empty() {
        return vec![0.0; documents.len()];
    }

    let doc_terms: Vec<Vec<String>> = documents.iter().map(|d| tokenize(d)).collect();
    let mut document_frequency: HashMap<&str, usize> = HashMap::new();
    for terms in &doc_terms {
        let unique: HashSet<&str> = terms.iter().map(String::as_str).collect();
        for term in unique {
            *document_frequency.entry(term).or_default() += 1;
        }
    }

    let n = documents.len() as f64;
    let idf = |term: &str| {
        let df = document_frequency.get(term).copied().unwrap_or(0) as f64;
        ((n + 1.0) / (df + 1.0)).ln() + 1.0
    };

    let query_vec = weigh(&query_terms, &idf);
    doc_terms
        .iter()
        .map(|terms| cosine(&query_vec, &weigh(terms, &idf)))
        .collect()
}

fn weigh(terms: &[String], idf: &impl Fn(&str) -> f64) -> HashMap<String, f64> {
    let mut tf: HashMap<String, f64> = HashMap::new();
    for term in terms {
        *tf.entry(term.clone()).or_default() += 1.0;
    }
    for (term, weight) in tf.iter_mut() {
        *weight *= idf(term);
    }
    tf
}

fn cosine(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    let dot: f64 = a
        .iter()
        .filter_map(|(term, wa)| b.get(term).map(|wb| wa * wb))
        .sum();
    let norm_a = a.values().map(|w| w * w).sum::<f64>().sqrt();
    let norm_b = b.values().map(|w| w * w).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_drops_stopwords_and_punctuation() {
        assert_eq!(
            tokenize("What logs show this? 5xx on payments-api"),
            vec!["log", "5xx", "payment", "api"]
        );
    }

    #[test]
    fn closer_summary_ranks_higher() {
        let docs = [
            "Splunk: 42 error logs for payments-api, top pattern connection refused",
            "Kubernetes node ip-10-0-1-5 is NotReady",
            "Prometheus db_connections_active spiked to 3x baseline",
        ];
        let scores = rank("error logs", &docs);
        assert!(scores[0] > scores[1]);
        assert!(scores[0] > scores[2]);
        assert_eq!(scores[1], 0.0);
    }

    #[test]
    fn empty_query_scores_zero() {
        assert_eq!(rank("the", &["anything"]), vec![0.0]);
    }
}
