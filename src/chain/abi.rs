//! Minimal Solidity ABI encoding for the escrow and stake-registry calls.
//!
//! Only static types are needed: `bytes32`, `address`, `uint256`, `bool` and
//! tuples of those.

use super::ChainError;
use crate::hashing::{keccak256, parse_hex32};

pub type Word = [u8; 32];

/// A static ABI argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Address([u8; 20]),
    Bytes32([u8; 32]),
    Uint(u128),
}

impl Token {
    pub fn address(value: &str) -> Result<Self, ChainError> {
        let normalized = super::normalize_address(value)?;
        let bytes = hex::decode(&normalized[2..])
            .map_err(|_| ChainError::InvalidAddress(value.to_string()))?;
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(Token::Address(out))
    }

    pub fn bytes32_hex(value: &str) -> Result<Self, ChainError> {
        parse_hex32(value)
            .map(Token::Bytes32)
            .ok_or_else(|| ChainError::Decode(format!("not a bytes32 value: {}", value)))
    }

    fn encode(&self) -> Word {
        let mut word = [0u8; 32];
        match self {
            Token::Address(bytes) => word[12..].copy_from_slice(bytes),
            Token::Bytes32(bytes) => word.copy_from_slice(bytes),
            Token::Uint(value) => word[16..].copy_from_slice(&value.to_be_bytes()),
        }
        word
    }
}

/// First four bytes of keccak256 of the canonical signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let digest = keccak256(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Calldata for `signature(args...)`.
pub fn encode_call(signature: &str, args: &[Token]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 32 * args.len());
    data.extend_from_slice(&selector(signature));
    for arg in args {
        data.extend_from_slice(&arg.encode());
    }
    data
}

/// `0x`-prefixed hex of arbitrary bytes.
pub fn to_hex_data(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Split hex return data into 32-byte words.
pub fn decode_words(data: &str) -> Result<Vec<Word>, ChainError> {
    let raw = data.strip_prefix("0x").unwrap_or(data);
    let bytes = hex::decode(raw).map_err(|e| ChainError::Decode(e.to_string()))?;
    if bytes.len() % 32 != 0 {
        return Err(ChainError::Decode(format!(
            "return data length {} is not a multiple of 32",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks(32)
        .map(|chunk| {
            let mut word = [0u8; 32];
            word.copy_from_slice(chunk);
            word
        })
        .collect())
}

pub fn word_to_u128(word: &Word) -> Result<u128, ChainError> {
    if word[..16].iter().any(|b| *b != 0) {
        return Err(ChainError::Decode("uint256 value exceeds u128".to_string()));
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(low))
}

pub fn word_to_bool(word: &Word) -> Result<bool, ChainError> {
    match word_to_u128(word)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ChainError::Decode(format!("invalid bool word {}", other))),
    }
}

pub fn word_to_address(word: &Word) -> String {
    format!("0x{}", hex::encode(&word[12..]))
}

pub fn word_to_hex(word: &Word) -> String {
    format!("0x{}", hex::encode(word))
}

/// Decode a single `bool` return value.
pub fn decode_bool(data: &str) -> Result<bool, ChainError> {
    let words = decode_words(data)?;
    let first = words
        .first()
        .ok_or_else(|| ChainError::Decode("empty return data".to_string()))?;
    word_to_bool(first)
}

/// `0x`-prefixed hex quantity as used by JSON-RPC.
pub fn quantity(value: u128) -> String {
    format!("0x{:x}", value)
}

pub fn parse_quantity(value: &str) -> Result<u128, ChainError> {
    let raw = value
        .strip_prefix("0x")
        .ok_or_else(|| ChainError::Decode(format!("quantity without 0x prefix: {}", value)))?;
    if raw.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(raw, 16).map_err(|e| ChainError::Decode(format!("{}: {}", value, e)))
}
