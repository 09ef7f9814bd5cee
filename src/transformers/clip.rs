//! Contrastive Language-Image Pre-Training
//!
//! The text encoder itself is an opaque TorchScript module, only the byte-pair
//! encoding that produces its input ids lives here.
//!
//! https://github.com/openai/CLIP
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::BufRead;
use tch::{Device, Tensor};

/// Which CLIP flavor the text encoder was trained with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipVersion {
    V1_5,
    #[default]
    V2_1,
}

#[derive(Debug, Clone)]
pub struct Config {
    max_position_embeddings: usize,
    // The character to use for padding, use EOS when not set.
    pad_with: Option<String>,
}

impl Config {
    // https://huggingface.co/openai/clip-vit-large-patch14/blob/main/config.json
    pub fn v1_5() -> Self {
        Self { max_position_embeddings: 77, pad_with: None }
    }

    // https://huggingface.co/stabilityai/stable-diffusion-2-1-base/blob/main/tokenizer/special_tokens_map.json
    pub fn v2_1() -> Self {
        Self { max_position_embeddings: 77, pad_with: Some("!".to_string()) }
    }

    pub fn for_version(version: ClipVersion) -> Self {
        match version {
            ClipVersion::V1_5 => Self::v1_5(),
            ClipVersion::V2_1 => Self::v2_1(),
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_position_embeddings
    }
}

// Number of merge rules used by CLIP, the vocabulary then has 49408 entries.
const MAX_MERGES: usize = 49152 - 256 - 2;

/// The reversible byte to printable character mapping of GPT-2 style BPE,
/// printable latin-1 bytes map to themselves and the others are shifted past 255.
fn bytes_to_unicode() -> Vec<(u8, char)> {
    let printable = |b: u8| (b'!'..=b'~').contains(&b) || (0xa1..=0xac).contains(&b) || b >= 0xae;
    let mut mapping: Vec<(u8, char)> =
        (0..=255u8).filter(|&b| printable(b)).map(|b| (b, char::from(b))).collect();
    let mut shift = 0u32;
    for b in (0..=255u8).filter(|&b| !printable(b)) {
        let c = char::from_u32(256 + shift).unwrap_or(char::REPLACEMENT_CHARACTER);
        mapping.push((b, c));
        shift += 1;
    }
    mapping
}

const PAT: &str =
    r"<\|startoftext\|>|<\|endoftext\|>|'s|'t|'re|'ve|'m|'ll|'d|[\p{L}]+|[\p{N}]|[^\s\p{L}\p{N}]+";

// This is mostly a Rust rewrite of the original Python CLIP code.
// https://github.com/openai/CLIP/blob/main/clip/simple_tokenizer.py
/// A tokenizer for CLIP.
pub struct Tokenizer {
    re: regex::Regex,
    encoder: HashMap<String, usize>,
    decoder: HashMap<usize, String>,
    bpe_ranks: HashMap<(String, String), usize>,
    start_of_text_token: usize,
    end_of_text_token: usize,
    config: Config,
}

impl Tokenizer {
    /// Creates a new CLIP tokenizer, this takes as input the path for the bpe vocabulary file.
    pub fn create<T: AsRef<std::path::Path>>(bpe_path: T, c: &Config) -> Result<Tokenizer> {
        let bpe_file = crate::utils::file_open(bpe_path)?;
        // The first line is a version header.
        let lines: Vec<String> = std::io::BufReader::new(bpe_file)
            .lines()
            .skip(1)
            .take(MAX_MERGES)
            .collect::<std::io::Result<_>>()?;
        Self::from_merges(lines.iter().map(String::as_str), c)
    }

    /// Builds a tokenizer from merge rules, one `first second` pair per line.
    pub fn from_merges<'a, I: IntoIterator<Item = &'a str>>(merges: I, c: &Config) -> Result<Self> {
        let merges: Vec<(String, String)> = merges
            .into_iter()
            .map(|line| {
                let vs: Vec<_> = line.split_whitespace().collect();
                match vs.as_slice() {
                    [first, second] => Ok((first.to_string(), second.to_string())),
                    _ => Err(Error::invalid(format!(
                        "expected two items got {} '{}'",
                        vs.len(),
                        line
                    ))),
                }
            })
            .collect::<Result<_>>()?;
        let byte_chars = bytes_to_unicode();
        let mut vocab: Vec<String> = byte_chars.iter().map(|(_, c)| c.to_string()).collect();
        vocab.extend(byte_chars.iter().map(|(_, c)| format!("{c}</w>")));
        vocab.extend(merges.iter().map(|(first, second)| format!("{first}{second}")));
        let start_of_text_token = vocab.len();
        vocab.push("<|startoftext|>".to_string());
        let end_of_text_token = vocab.len();
        vocab.push("<|endoftext|>".to_string());
        let encoder: HashMap<_, _> = vocab.into_iter().enumerate().map(|(i, v)| (v, i)).collect();
        let decoder: HashMap<_, _> = encoder.iter().map(|(k, v)| (*v, k.clone())).collect();
        let bpe_ranks: HashMap<_, _> = merges.into_iter().enumerate().map(|(i, v)| (v, i)).collect();
        let re = regex::Regex::new(PAT).map_err(|e| Error::invalid(e.to_string()))?;
        Ok(Tokenizer {
            encoder,
            re,
            bpe_ranks,
            decoder,
            start_of_text_token,
            end_of_text_token,
            config: c.clone(),
        })
    }

    fn get_pairs(word: &[String]) -> HashSet<(String, String)> {
        word.windows(2).map(|w| (w[0].clone(), w[1].clone())).collect()
    }

    fn bpe(&self, token: &str) -> Vec<usize> {
        let mut word: Vec<String> = token.chars().map(|x| x.to_string()).collect();
        let Some(last) = word.last_mut() else {
            return Vec::new();
        };
        *last = format!("{last}</w>");
        while word.len() > 1 {
            let best = Self::get_pairs(&word)
                .into_iter()
                .filter_map(|p| self.bpe_ranks.get(&p).map(|rank| (*rank, p)))
                .min_by_key(|(rank, _)| *rank);
            let Some((_, (first, second))) = best else {
                break;
            };
            let mut new_word = Vec::with_capacity(word.len());
            let mut index = 0;
            while index < word.len() {
                if index + 1 < word.len() && word[index] == first && word[index + 1] == second {
                    new_word.push(format!("{first}{second}"));
                    index += 2
                } else {
                    new_word.push(word[index].clone());
                    index += 1
                }
            }
            word = new_word
        }
        word.iter().filter_map(|x| self.encoder.get(x)).copied().collect()
    }

    pub fn encode_pad(&self, s: &str, pad_size_to: Option<usize>) -> Result<Vec<usize>> {
        let s = s.to_lowercase();
        let mut bpe_tokens: Vec<usize> = vec![self.start_of_text_token];
        for token in self.re.find_iter(&s) {
            bpe_tokens.extend(self.bpe(token.as_str()))
        }
        bpe_tokens.push(self.end_of_text_token);
        if let Some(pad_size_to) = pad_size_to {
            if bpe_tokens.len() > pad_size_to {
                // Truncate but keep the end of text marker.
                bpe_tokens.truncate(pad_size_to - 1);
                bpe_tokens.push(self.end_of_text_token);
            }
            let pad_with = match &self.config.pad_with {
                None => self.end_of_text_token,
                Some(pad_with) => match self.encoder.get(pad_with) {
                    None => {
                        return Err(Error::invalid(format!(
                            "no encoding for padding character {pad_with}"
                        )))
                    }
                    Some(v) => *v,
                },
            };
            bpe_tokens.resize(pad_size_to, pad_with);
        }
        Ok(bpe_tokens)
    }

    /// The main tokenization entry point, takes as input a string and returns the list of tokens.
    pub fn encode(&self, s: &str) -> Result<Vec<usize>> {
        self.encode_pad(s, Some(self.config.max_position_embeddings))
    }

    /// Token ids as a `[1, max_len]` int64 tensor, ready for the text encoder.
    pub fn encode_tensor(&self, s: &str, device: Device) -> Result<Tensor> {
        let tokens: Vec<i64> = self.encode(s)?.into_iter().map(|x| x as i64).collect();
        Ok(Tensor::from_slice(&tokens).view((1, -1)).to(device))
    }

    /// The inverse of the tokenization process, takes as input a list of tokens and returns a
    /// string that produces this tokenization.
    pub fn decode(&self, tokens: &[usize]) -> String {
        let s: String =
            tokens.iter().filter_map(|token| self.decoder.get(token).map(String::as_str)).collect();
        s.replace("</w>", " ")
    }
}
