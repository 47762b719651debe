//! Tokenizer contract and the file-backed vocabulary
//!
//! The engine consumes a tokenizer, it never implements one: callers bring
//! BPE or SentencePiece and the decode loop only needs ids in, ids out. The
//! vocabulary table stored in the model file backs `decode` and the eos id;
//! its `encode` is a greedy longest-match fallback good enough for
//! diagnostics, not a production tokenizer.

use crate::model::format::VocabEntry;

pub type TokenId = u32;

/// The tokenizer interface the engine consumes.
pub trait Tokenizer {
    fn encode(&self, text: &str) -> Vec<TokenId>;
    fn decode(&self, ids: &[TokenId]) -> String;
    fn eos_id(&self) -> TokenId;
}

/// Vocabulary table read from the model file.
#[derive(Debug, Clone)]
pub struct Vocab {
    entries: Vec<VocabEntry>,
    eos: TokenId,
}

impl Vocab {
    pub fn new(entries: Vec<VocabEntry>, eos: TokenId) -> Self {
        Self { entries, eos }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn token_text(&self, id: TokenId) -> Option<&str> {
        self.entries.get(id as usize).map(|e| e.text.as_str())
    }

    pub fn score(&self, id: TokenId) -> Option<f32> {
        self.entries.get(id as usize).map(|e| e.score)
    }
}

impl Tokenizer for Vocab {
    fn encode(&self, text: &str) -> Vec<TokenId> {
        let mut out = Vec::new();
        let mut rest = text;
        while !rest.is_empty() {
            let mut best: Option<(usize, TokenId)> = None;
            for (id, entry) in self.entries.iter().enumerate() {
                if !entry.text.is_empty()
                    && rest.starts_with(&entry.text)
                    && best.map_or(true, |(len, _)| entry.text.len() > len)
                {
                    best = Some((entry.text.len(), id as TokenId));
                }
            }
            match best {
                Some((len, id)) => {
                    out.push(id);
                    rest = &rest[len..];
                }
                None => {
                    // No token covers this byte; skip one char
                    let mut chars = rest.chars();
                    chars.next();
                    rest = chars.as_str();
                }
            }
        }
        out
    }

    fn decode(&self, ids: &[TokenId]) -> String {
        let mut out = String::new();
        for &id in ids {
            if let Some(text) = self.token_text(id) {
                out.push_str(text);
            }
        }
        out
    }

    fn eos_id(&self) -> TokenId {
        self.eos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> Vocab {
        let entries = ["<s>", "</s>", "he", "hello", "l", "o"]
            .iter()
            .map(|t| VocabEntry {
                text: t.to_string(),
                score: 0.0,
            })
            .collect();
        Vocab::new(entries, 1)
    }

    #[test]
    fn greedy_encode_prefers_longest() {
        let v = vocab();
        assert_eq!(v.encode("hello"), vec![3]);
        assert_eq!(v.encode("hel"), vec![2, 4]);
    }

    #[test]
    fn decode_concatenates() {
        let v = vocab();
        assert_eq!(v.decode(&[3, 5]), "helloo");
        assert_eq!(v.eos_id(), 1);
    }
}
