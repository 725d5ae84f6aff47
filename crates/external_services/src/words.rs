//! Embedded word bank.
//!
//! Serves the default word lists without any backing storage. Lists are
//! keyed by `(list id, language)`; sampling is uniform with replacement so
//! any requested count can be served from a finite bank.

use crate::error::{ProviderError, Result};
use crate::traits::{WordRequest, WordSource};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::collections::HashMap;

/// The default English list: common short words, lowercase, no punctuation.
const ENGLISH_COMMON: &[&str] = &[
    "the", "be", "of", "and", "a", "to", "in", "he", "have", "it", "that", "for", "they", "with",
    "as", "not", "on", "she", "at", "by", "this", "we", "you", "do", "but", "from", "or", "which",
    "one", "would", "all", "will", "there", "say", "who", "make", "when", "can", "more", "if",
    "no", "man", "out", "other", "so", "what", "time", "up", "go", "about", "than", "into", "could",
    "state", "only", "new", "year", "some", "take", "come", "these", "know", "see", "use", "get",
    "like", "then", "first", "any", "work", "now", "may", "such", "give", "over", "think", "most",
    "even", "find", "day", "also", "after", "way", "many", "must", "look", "before", "great",
    "back", "through", "long", "where", "much", "should", "well", "people", "down", "own", "just",
    "because", "good", "each", "those", "feel", "seem", "how", "high", "too", "place", "little",
    "world", "very", "still", "nation", "hand", "old", "life", "tell", "write", "become", "here",
    "show", "house", "both", "between", "need", "mean", "call", "develop", "under", "last",
    "right", "move", "thing", "general", "school", "never", "same", "another", "begin", "while",
    "number", "part", "turn", "real", "leave", "might", "want", "point", "form", "off", "child",
    "few", "small", "since", "against", "ask", "late", "home", "interest", "large", "person",
    "end", "open", "public", "follow", "during", "present", "without", "again", "hold", "govern",
    "around", "possible", "head", "consider", "word", "program", "problem", "however", "lead",
    "system", "set", "order", "eye", "plan", "run", "keep", "face", "fact", "group", "play",
    "stand", "increase", "early", "course", "change", "help", "line",
];

/// In-process word source backed by compiled-in lists.
pub struct BuiltinWordSource {
    lists: HashMap<(String, String), Vec<String>>,
}

impl BuiltinWordSource {
    pub fn new() -> Self {
        let mut lists = HashMap::new();
        lists.insert(
            ("common".to_string(), "en".to_string()),
            ENGLISH_COMMON.iter().map(|w| w.to_string()).collect(),
        );
        Self { lists }
    }

    /// Register an additional list, replacing any existing one with the same
    /// key.
    pub fn with_list(
        mut self,
        list_id: impl Into<String>,
        language: impl Into<String>,
        words: Vec<String>,
    ) -> Self {
        self.lists.insert((list_id.into(), language.into()), words);
        self
    }
}

impl Default for BuiltinWordSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WordSource for BuiltinWordSource {
    async fn fetch(&self, req: &WordRequest) -> Result<Vec<String>> {
        let list_id = req.list_id.clone().unwrap_or_else(|| "common".to_string());
        let key = (list_id.clone(), req.language.clone());

        let bank = self.lists.get(&key).ok_or_else(|| {
            ProviderError::WordListUnavailable(format!("{}/{}", list_id, req.language))
        })?;
        if bank.is_empty() || req.count == 0 {
            return Err(ProviderError::WordListUnavailable(format!(
                "{}/{}",
                list_id, req.language
            )));
        }

        let mut rng = rand::thread_rng();
        let words = (0..req.count)
            .map(|_| bank.choose(&mut rng).expect("non-empty bank").clone())
            .collect();
        Ok(words)
    }
}
