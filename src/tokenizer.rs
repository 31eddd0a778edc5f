//! Byte-pair tokenizer for LLaMA2 `tokenizer.bin` vocabularies
//!
//! Encoding follows the sentencepiece conventions the checkpoints were
//! trained with: an optional BOS token, a dummy `" "` prefix, one token per
//! UTF-8 code point (falling back to raw byte tokens for code points that
//! are not in the vocabulary), then repeated greedy merging of the adjacent
//! pair whose concatenation has the highest score.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tinyinfer::tokenizer::{Tokenizer, BOS};
//!
//! let tokenizer = Tokenizer::from_file("tokenizer.bin", 32000)?;
//! let tokens = tokenizer.encode("Once upon a time", true, false)?;
//! assert_eq!(tokens[0], BOS);
//! let piece = tokenizer.decode(tokens[0], tokens[1])?;
//! assert!(!piece.is_empty());
//! # Ok::<(), tinyinfer::InferError>(())
//! ```
//!
//! ## File format
//!
//! `max_token_length: i32`, then for every token `score: f32`, `len: i32`
//! and `len` raw bytes, all little-endian.

use std::{collections::HashMap, fs, path::Path};

use tracing::{debug, info};

use crate::error::{InferError, Result};

/// Beginning-of-sequence token id
pub const BOS: usize = 1;

/// End-of-sequence token id
pub const EOS: usize = 2;

/// Id of the token for byte `0x00`; ids 0..3 are `<unk>`, `<s>`, `</s>`
const BYTE_TOKEN_OFFSET: usize = 3;

/// BPE vocabulary with merge scores
#[derive(Debug, Clone)]
pub struct Tokenizer {
    /// Token pieces indexed by id
    vocab: Vec<Vec<u8>>,
    /// Merge score per id
    scores: Vec<f32>,
    /// Piece to id
    lookup: HashMap<Vec<u8>, usize>,
    max_token_length: usize,
}

impl Tokenizer {
    /// Create a tokenizer from pieces and their scores
    ///
    /// When a piece appears more than once, lookups resolve to its first id.
    ///
    /// # Errors
    ///
    /// Returns `FormatError` if `vocab` is empty or `scores` has a different
    /// length.
    pub fn new(vocab: Vec<Vec<u8>>, scores: Vec<f32>, max_token_length: usize) -> Result<Self> {
        if vocab.is_empty() {
            return Err(InferError::FormatError {
                reason: "Vocabulary cannot be empty".to_string(),
            });
        }
        if vocab.len() != scores.len() {
            return Err(InferError::FormatError {
                reason: format!(
                    "Vocabulary has {} pieces but {} scores",
                    vocab.len(),
                    scores.len()
                ),
            });
        }

        let mut lookup = HashMap::with_capacity(vocab.len());
        for (id, piece) in vocab.iter().enumerate() {
            lookup.entry(piece.clone()).or_insert(id);
        }

        Ok(Self {
            vocab,
            scores,
            lookup,
            max_token_length,
        })
    }

    /// Load the first `vocab_size` tokens of a `tokenizer.bin` file
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the file cannot be read and `FormatError` if it
    /// is truncated or malformed.
    pub fn from_file<P: AsRef<Path>>(path: P, vocab_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| InferError::IoError {
            message: format!("Failed to read tokenizer {}: {e}", path.display()),
        })?;
        let tokenizer = Self::from_bytes(&bytes, vocab_size)?;
        info!(
            path = %path.display(),
            vocab_size,
            max_token_length = tokenizer.max_token_length,
            "Loaded tokenizer"
        );
        Ok(tokenizer)
    }

    /// Parse `tokenizer.bin` contents
    ///
    /// # Errors
    ///
    /// Returns `FormatError` if `bytes` is truncated or holds a negative
    /// length.
    pub fn from_bytes(bytes: &[u8], vocab_size: usize) -> Result<Self> {
        let mut reader = ByteReader { bytes, offset: 0 };

        let max_token_length = reader.read_len("max_token_length")?;
        let mut vocab = Vec::with_capacity(vocab_size);
        let mut scores = Vec::with_capacity(vocab_size);
        for _ in 0..vocab_size {
            scores.push(f32::from_le_bytes(reader.read_array()?));
            let len = reader.read_len("token length")?;
            vocab.push(reader.read_bytes(len)?.to_vec());
        }
        debug!(
            consumed = reader.offset,
            total = bytes.len(),
            "Parsed tokenizer vocabulary"
        );

        Self::new(vocab, scores, max_token_length)
    }

    /// Number of tokens
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Longest piece length declared by the file
    #[must_use]
    pub fn max_token_length(&self) -> usize {
        self.max_token_length
    }

    /// Raw bytes of token `id`
    #[must_use]
    pub fn piece(&self, id: usize) -> Option<&[u8]> {
        self.vocab.get(id).map(Vec::as_slice)
    }

    /// Merge score of token `id`
    #[must_use]
    pub fn score(&self, id: usize) -> Option<f32> {
        self.scores.get(id).copied()
    }

    /// Id of the token whose piece is exactly `piece`
    #[must_use]
    pub fn token_id(&self, piece: &[u8]) -> Option<usize> {
        self.lookup.get(piece).copied()
    }

    /// Encode `text` into token ids
    ///
    /// # Arguments
    ///
    /// * `text` - Input text
    /// * `bos` - Prepend [`BOS`]
    /// * `eos` - Append [`EOS`]
    ///
    /// # Errors
    ///
    /// Returns `FormatError` if the vocabulary has no `" "` piece for the
    /// dummy prefix, and `TokenOutOfRange` if byte fallback needs a byte
    /// token the vocabulary does not have.
    pub fn encode(&self, text: &str, bos: bool, eos: bool) -> Result<Vec<usize>> {
        let mut tokens = Vec::with_capacity(text.len() + 3);
        if bos {
            tokens.push(BOS);
        }

        if !text.is_empty() {
            let prefix = self.token_id(b" ").ok_or_else(|| InferError::FormatError {
                reason: "Vocabulary has no ' ' piece for the dummy prefix".to_string(),
            })?;
            tokens.push(prefix);
        }

        let mut buf = [0u8; 4];
        for ch in text.chars() {
            let encoded = ch.encode_utf8(&mut buf).as_bytes();
            if let Some(id) = self.token_id(encoded) {
                tokens.push(id);
                continue;
            }
            for &byte in encoded {
                let id = usize::from(byte) + BYTE_TOKEN_OFFSET;
                if id >= self.vocab_size() {
                    return Err(InferError::TokenOutOfRange {
                        token: id,
                        vocab_size: self.vocab_size(),
                    });
                }
                tokens.push(id);
            }
        }

        self.merge_pairs(&mut tokens);

        if eos {
            tokens.push(EOS);
        }
        Ok(tokens)
    }

    /// Repeatedly merge the adjacent pair with the best-scoring concatenation
    fn merge_pairs(&self, tokens: &mut Vec<usize>) {
        let mut pair = Vec::with_capacity(self.max_token_length * 2);
        loop {
            let mut best: Option<(f32, usize, usize)> = None;
            for (i, window) in tokens.windows(2).enumerate() {
                pair.clear();
                pair.extend_from_slice(&self.vocab[window[0]]);
                pair.extend_from_slice(&self.vocab[window[1]]);
                if let Some(id) = self.token_id(&pair) {
                    let score = self.scores[id];
                    if best.map_or(true, |(s, _, _)| score > s) {
                        best = Some((score, id, i));
                    }
                }
            }

            let Some((_, id, i)) = best else {
                break;
            };
            tokens[i] = id;
            tokens.remove(i + 1);
        }
    }

    /// Bytes to emit for `token` following `prev`
    ///
    /// After [`BOS`] a leading space is stripped, and byte tokens such as
    /// `<0x0A>` decode to the raw byte they name.
    ///
    /// # Errors
    ///
    /// Returns `TokenOutOfRange` if `token` is not in the vocabulary
    pub fn decode(&self, prev: usize, token: usize) -> Result<Vec<u8>> {
        let mut piece = self.piece(token).ok_or(InferError::TokenOutOfRange {
            token,
            vocab_size: self.vocab_size(),
        })?;

        if prev == BOS && piece.first() == Some(&b' ') {
            piece = &piece[1..];
        }
        if let Some(byte) = parse_byte_piece(piece) {
            return Ok(vec![byte]);
        }
        Ok(piece.to_vec())
    }
}

/// `<0xHH>` → `0xHH`
fn parse_byte_piece(piece: &[u8]) -> Option<u8> {
    let hex = piece.strip_prefix(b"<0x")?.strip_suffix(b">")?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(std::str::from_utf8(hex).ok()?, 16).ok()
}

/// Filter a decoded piece for printing
///
/// Returns `None` for empty pieces and for single bytes that are neither
/// printable ASCII nor whitespace (control codes from byte tokens).
#[must_use]
pub fn safe_piece(piece: &[u8]) -> Option<&[u8]> {
    match piece {
        [] => None,
        [byte] if !(byte.is_ascii_graphic() || byte.is_ascii_whitespace() || *byte == 0x0b) => {
            None
        }
        _ => Some(piece),
    }
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.offset + len;
        let slice = self
            .bytes
            .get(self.offset..end)
            .ok_or_else(|| InferError::FormatError {
                reason: format!(
                    "Tokenizer truncated: need bytes {}..{end}, have {}",
                    self.offset,
                    self.bytes.len()
                ),
            })?;
        self.offset = end;
        Ok(slice)
    }

    fn read_array(&mut self) -> Result<[u8; 4]> {
        let slice = self.read_bytes(4)?;
        Ok([slice[0], slice[1], slice[2], slice[3]])
    }

    fn read_len(&mut self, what: &str) -> Result<usize> {
        let value = i32::from_le_bytes(self.read_array()?);
        usize::try_from(value).map_err(|_| InferError::FormatError {
            reason: format!("Negative {what} {value} in tokenizer"),
        })
    }
}
