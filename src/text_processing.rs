use regex::Regex;
use std::collections::HashMap;

/// Cleans up a transcript before it is handed on
///
/// - Word overrides: replace specific words/phrases (case-insensitive, whole words)
/// - Whitespace: collapse runs and trim
pub struct TranscriptFilter {
    word_overrides: Vec<(Regex, String)>,
    whitespace: Regex,
}

impl TranscriptFilter {
    pub fn new(overrides: &HashMap<String, String>) -> Self {
        let mut word_overrides: Vec<(Regex, String)> = overrides
            .iter()
            .filter(|(k, _)| !k.trim().is_empty())
            .filter_map(|(k, v)| {
                match Regex::new(&format!(r"(?i)\b{}\b", regex::escape(k.trim()))) {
                    Ok(re) => Some((re, v.clone())),
                    Err(e) => {
                        tracing::warn!("Ignoring word override {:?}: {}", k, e);
                        None
                    }
                }
            })
            .collect();

        // Longest phrases first so "new york city" beats "new york"
        word_overrides.sort_by_key(|(re, _)| std::cmp::Reverse(re.as_str().len()));

        Self {
            word_overrides,
            whitespace: Regex::new(r"\s+").expect("static regex"),
        }
    }

    pub fn apply(&self, text: &str) -> String {
        let mut result = text.to_string();

        for (re, replacement) in &self.word_overrides {
            result = re
                .replace_all(&result, regex::NoExpand(replacement.as_str()))
                .into_owned();
        }

        self.whitespace.replace_all(result.trim(), " ").into_owned()
    }
}

impl Default for TranscriptFilter {
    fn default() -> Self {
        Self::new(&HashMap::new())
    }
}
