//! Word and sentence statistics behind the "AI-likeness" meter
//!
//! This is a display heuristic, not a classifier. Machine-written answers
//! tend to have evenly sized sentences, stock transition phrases and
//! medium-length sentences, so those push the score up.

use std::collections::HashSet;

use serde::Serialize;

const STOCK_PHRASES: &[&str] = &[
    "furthermore",
    "moreover",
    "additionally",
    "in conclusion",
    "in summary",
    "overall,",
    "it is important to note",
    "it's important to note",
    "it is worth noting",
    "plays a crucial role",
    "delve",
    "as an ai",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextStats {
    pub words: usize,
    pub sentences: usize,
    pub average_sentence_length: f64,
    pub sentence_length_variance: f64,
    /// Unique words divided by total words
    pub lexical_diversity: f64,
    pub stock_phrases: usize,
    /// 0 to 100
    pub ai_likeness: u8,
}

pub fn analyze(text: &str) -> TextStats {
    let words = tokenize(text);
    if words.is_empty() {
        return TextStats {
            words: 0,
            sentences: 0,
            average_sentence_length: 0.0,
            sentence_length_variance: 0.0,
            lexical_diversity: 0.0,
            stock_phrases: 0,
            ai_likeness: 0,
        };
    }

    let lengths: Vec<f64> = text
        .split(['.', '!', '?'])
        .map(|s| tokenize(s).len())
        .filter(|&n| n > 0)
        .map(|n| n as f64)
        .collect();

    let sentences = lengths.len().max(1);
    let mean = words.len() as f64 / sentences as f64;
    let variance = if lengths.is_empty() {
        0.0
    } else {
        lengths.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / lengths.len() as f64
    };

    let unique: HashSet<&str> = words.iter().map(String::as_str).collect();
    let diversity = unique.len() as f64 / words.len() as f64;

    let lowered = text.to_lowercase();
    let stock_phrases: usize = STOCK_PHRASES
        .iter()
        .map(|p| lowered.matches(p).count())
        .sum();

    let uniformity = if lengths.len() < 2 {
        0.5
    } else {
        (1.0 - variance.sqrt() / mean).clamp(0.0, 1.0)
    };
    let repetition = (1.0 - diversity).clamp(0.0, 1.0);
    let length_fit = if (12.0..=28.0).contains(&mean) {
        1.0
    } else if mean < 12.0 {
        mean / 12.0
    } else {
        (28.0 / mean).clamp(0.0, 1.0)
    };
    let phrases = (stock_phrases as f64 / 3.0).min(1.0);

    let score = 0.35 * uniformity + 0.2 * repetition + 0.2 * length_fit + 0.25 * phrases;

    TextStats {
        words: words.len(),
        sentences,
        average_sentence_length: mean,
        sentence_length_variance: variance,
        lexical_diversity: diversity,
        stock_phrases,
        ai_likeness: (score * 100.0).round().clamp(0.0, 100.0) as u8,
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'')
                .to_lowercase()
        })
        .filter(|w| w.chars().any(char::is_alphanumeric))
        .collect()
}
