//! Lexical helpers shared by embedding, retrieval scoring and deduplication.

use std::collections::HashMap;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "that", "the", "this", "to", "was", "were", "with", "your", "you",
];

fn is_cjk(c: char) -> bool {
    matches!(c, '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}')
}

/// Lowercased word tokens. Runs of CJK ideographs are split into
/// overlapping character bigrams since they carry no whitespace.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut cjk_run: Vec<char> = Vec::new();

    let flush_word = |word: &mut String, tokens: &mut Vec<String>| {
        if !word.is_empty() && !STOPWORDS.contains(&word.as_str()) {
            tokens.push(std::mem::take(word));
        }
        word.clear();
    };
    let flush_cjk = |run: &mut Vec<char>, tokens: &mut Vec<String>| {
        match run.len() {
            0 => {}
            1 => tokens.push(run[0].to_string()),
            _ => tokens.extend(run.windows(2).map(|w| w.iter().collect::<String>())),
        }
        run.clear();
    };

    for c in text.chars() {
        if is_cjk(c) {
            flush_word(&mut word, &mut tokens);
            cjk_run.push(c);
        } else if c.is_alphanumeric() {
            flush_cjk(&mut cjk_run, &mut tokens);
            word.extend(c.to_lowercase());
        } else {
            flush_word(&mut word, &mut tokens);
            flush_cjk(&mut cjk_run, &mut tokens);
        }
    }
    flush_word(&mut word, &mut tokens);
    flush_cjk(&mut cjk_run, &mut tokens);

    tokens
}

fn term_frequencies(text: &str) -> HashMap<String, f64> {
    let mut tf = HashMap::new();
    for token in tokenize(text) {
        *tf.entry(token).or_insert(0.0) += 1.0;
    }
    tf
}

/// Cosine similarity of term-frequency vectors, in [0, 1].
pub fn text_similarity(a: &str, b: &str) -> f64 {
    let ta = term_frequencies(a);
    let tb = term_frequencies(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }

    let dot: f64 = ta
        .iter()
        .filter_map(|(term, wa)| tb.get(term).map(|wb| wa * wb))
        .sum();
    let norm_a: f64 = ta.values().map(|w| w * w).sum::<f64>().sqrt();
    let norm_b: f64 = tb.values().map(|w| w * w).sum::<f64>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_drops_stopwords_and_punctuation() {
        assert_eq!(
            tokenize("The Blood-Pressure of 140/90!"),
            vec!["blood", "pressure", "140", "90"]
        );
    }

    #[test]
    fn tokenize_cjk_bigrams() {
        assert_eq!(tokenize("空腹血糖"), vec!["空腹", "腹血", "血糖"]);
        assert_eq!(tokenize("ALT 高"), vec!["alt", "高"]);
    }

    #[test]
    fn identical_texts_are_similar() {
        let s = text_similarity("fasting glucose 6.8 mmol", "fasting glucose 6.8 mmol");
        assert!((s - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unrelated_texts_score_zero() {
        assert_eq!(text_similarity("liver enzymes ALT", "blood pressure"), 0.0);
        assert_eq!(text_similarity("", "blood pressure"), 0.0);
    }

    #[test]
    fn partial_overlap_is_between() {
        let s = text_similarity("blood pressure elevated", "blood pressure normal");
        assert!(s > 0.3 && s < 1.0);
    }
}
