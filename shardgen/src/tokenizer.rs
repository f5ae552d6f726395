//! Tokenizer interface and a byte-level tokenizer

use serde::{Deserialize, Serialize};

/// Ids with special meaning to the sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    pub pad: u32,
    pub eos: u32,
    pub bos: u32,
}

/// Text to token ids and back
pub trait Tokenizer: Send + Sync {
    /// Encode text without adding special tokens
    fn encode(&self, text: &str) -> Vec<u32>;

    /// Decode ids, skipping special tokens
    fn decode(&self, tokens: &[u32]) -> String;

    fn special_tokens(&self) -> SpecialTokens;

    fn vocab_size(&self) -> usize;
}

/// One token per UTF-8 byte
///
/// Ids 0, 1 and 2 are PAD, EOS and BOS; byte `b` is id `b + 3`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const PAD: u32 = 0;
    pub const EOS: u32 = 1;
    pub const BOS: u32 = 2;
    const BYTE_OFFSET: u32 = 3;

    pub fn new() -> Self {
        Self
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.bytes().map(|b| b as u32 + Self::BYTE_OFFSET).collect()
    }

    fn decode(&self, tokens: &[u32]) -> String {
        let bytes: Vec<u8> = tokens
            .iter()
            .filter_map(|&t| t.checked_sub(Self::BYTE_OFFSET))
            .filter_map(|b| u8::try_from(b).ok())
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn special_tokens(&self) -> SpecialTokens {
        SpecialTokens {
            pad: Self::PAD,
            eos: Self::EOS,
            bos: Self::BOS,
        }
    }

    fn vocab_size(&self) -> usize {
        256 + Self::BYTE_OFFSET as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let tok = ByteTokenizer::new();
        let ids = tok.encode("hi");
        assert_eq!(ids, vec![b'h' as u32 + 3, b'i' as u32 + 3]);
        assert_eq!(tok.decode(&ids), "hi");
        assert_eq!(tok.vocab_size(), 259);
    }

    #[test]
    fn test_decode_skips_special_and_out_of_range() {
        let tok = ByteTokenizer::new();
        let mut ids = vec![ByteTokenizer::BOS];
        ids.extend(tok.encode("ok"));
        ids.extend([ByteTokenizer::EOS, ByteTokenizer::PAD, 9999]);
        assert_eq!(tok.decode(&ids), "ok");
    }

    #[test]
    fn test_multibyte_roundtrip() {
        let tok = ByteTokenizer::new();
        let text = "héllo ✓";
        assert_eq!(tok.decode(&tok.encode(text)), text);
        assert_eq!(tok.encode("é").len(), 2);
    }
}
