//! Deterministic content hashes used as settlement anchors.
//!
//! Both hashes are keccak256 over a canonical JSON encoding with a fixed
//! field order. Numbers in the task tuple are written the way JavaScript's
//! `JSON.stringify` writes them, so the bytes match a browser-side hash of
//! the same tuple.

use crate::types::ProofArtifact;
use serde::Serialize;
use sha3::{Digest, Keccak256};

/// Inputs to the task hash, in canonical order.
#[derive(Debug, Clone)]
pub struct TaskHashInput<'a> {
    pub capability: &'a str,
    pub goal: &'a str,
    pub budget_amount: f64,
    pub currency: &'a str,
    pub sla_seconds: i64,
    pub urgent: bool,
}

#[derive(Serialize)]
struct ProofHashInput<'a> {
    artifacts: &'a [ProofArtifact],
    notes: &'a str,
}

/// Format a number as JavaScript's `Number.prototype.toString` does.
///
/// Integral values below 1e21 print in full (`1e17` becomes
/// `100000000000000000`), small magnitudes down to 1e-6 print as plain
/// decimals, and everything else uses `d.ddde+n` notation.
pub fn js_number(value: f64) -> String {
    if !value.is_finite() {
        return "null".to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }

    let sign = if value < 0.0 { "-" } else { "" };
    // `{:e}` yields the shortest round-trip digits, e.g. `1.2345e3`.
    let sci = format!("{:e}", value.abs());
    let (mantissa, exponent) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let k = digits.len() as i32;
    let n = exponent.parse::<i32>().unwrap_or(0) + 1;

    let body = if k <= n && n <= 21 {
        format!("{}{}", digits, "0".repeat((n - k) as usize))
    } else if 0 < n && n <= 21 {
        let (int, frac) = digits.split_at(n as usize);
        format!("{}.{}", int, frac)
    } else if -6 < n && n <= 0 {
        format!("0.{}{}", "0".repeat((-n) as usize), digits)
    } else {
        let e = n - 1;
        let e_sign = if e < 0 { '-' } else { '+' };
        let (first, rest) = digits.split_at(1);
        if rest.is_empty() {
            format!("{}e{}{}", first, e_sign, e.abs())
        } else {
            format!("{}.{}e{}{}", first, rest, e_sign, e.abs())
        }
    };
    format!("{}{}", sign, body)
}

fn json_str(value: &str) -> String {
    // Serializing a str cannot fail.
    serde_json::to_string(value).unwrap_or_default()
}

/// keccak256 digest of `bytes`.
pub fn keccak256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// `0x`-prefixed lowercase hex of a 32-byte digest.
pub fn to_hex32(digest: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(digest))
}

fn hash_canonical<T: Serialize>(value: &T) -> String {
    // Serializing plain structs of strings/numbers/bools cannot fail.
    let canonical = serde_json::to_vec(value).unwrap_or_default();
    to_hex32(&keccak256(&canonical))
}

/// Canonical JSON for a task tuple (exposed for diagnostics).
pub fn canonical_task_json(input: &TaskHashInput<'_>) -> String {
    format!(
        r#"{{"capability":{},"goal":{},"budgetAmount":{},"currency":{},"slaSeconds":{},"urgent":{}}}"#,
        json_str(input.capability),
        json_str(input.goal),
        js_number(input.budget_amount),
        json_str(input.currency),
        input.sla_seconds,
        input.urgent,
    )
}

pub fn compute_task_hash(input: &TaskHashInput<'_>) -> String {
    to_hex32(&keccak256(canonical_task_json(input).as_bytes()))
}

pub fn compute_proof_hash(artifacts: &[ProofArtifact], notes: &str) -> String {
    hash_canonical(&ProofHashInput { artifacts, notes })
}

/// On-chain escrow key for a task id.
pub fn task_id_to_bytes32(task_id: &str) -> [u8; 32] {
    keccak256(task_id.as_bytes())
}

/// Parse a `0x`-prefixed 32-byte hex string.
pub fn parse_hex32(value: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(value.strip_prefix("0x")?).ok()?;
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TaskHashInput<'static> {
        TaskHashInput {
            capability: "restaurant_booking",
            goal: "Book a table for two",
            budget_amount: 10.0,
            currency: "MON",
            sla_seconds: 3600,
            urgent: false,
        }
    }

    #[test]
    fn keccak_of_empty_input() {
        assert_eq!(
            to_hex32(&keccak256(b"")),
            "0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn canonical_task_json_matches_js_encoding() {
        assert_eq!(
            canonical_task_json(&sample()),
            r#"{"capability":"restaurant_booking","goal":"Book a table for two","budgetAmount":10,"currency":"MON","slaSeconds":3600,"urgent":false}"#
        );
    }

    #[test]
    fn fractional_budget_keeps_decimal() {
        let input = TaskHashInput {
            budget_amount: 0.5,
            ..sample()
        };
        assert!(canonical_task_json(&input).contains(r#""budgetAmount":0.5"#));
    }

    #[test]
    fn large_integral_budget_prints_in_full() {
        let input = TaskHashInput {
            budget_amount: 1e17,
            ..sample()
        };
        assert!(canonical_task_json(&input).contains(r#""budgetAmount":100000000000000000,"#));
    }

    #[test]
    fn js_number_formatting() {
        assert_eq!(js_number(10.0), "10");
        assert_eq!(js_number(-3.0), "-3");
        assert_eq!(js_number(123.456), "123.456");
        assert_eq!(js_number(0.5), "0.5");
        assert_eq!(js_number(0.000001), "0.000001");
        assert_eq!(js_number(1e-7), "1e-7");
        assert_eq!(js_number(2.5e-8), "2.5e-8");
        assert_eq!(js_number(9_007_199_254_740_993.0), "9007199254740992");
        assert_eq!(js_number(1_152_921_504_606_846_976.0), "1152921504606847000");
        assert_eq!(js_number(1e21), "1e+21");
        assert_eq!(js_number(3.4e20), "340000000000000000000");
        assert_eq!(js_number(0.0), "0");
    }

    #[test]
    fn task_hash_is_deterministic() {
        assert_eq!(compute_task_hash(&sample()), compute_task_hash(&sample()));
        assert_eq!(compute_task_hash(&sample()).len(), 66);
    }

    #[test]
    fn every_task_field_changes_the_hash() {
        let base = compute_task_hash(&sample());
        let variants = [
            TaskHashInput { capability: "other", ..sample() },
            TaskHashInput { goal: "Book a table for three", ..sample() },
            TaskHashInput { budget_amount: 11.0, ..sample() },
            TaskHashInput { currency: "USDC", ..sample() },
            TaskHashInput { sla_seconds: 60, ..sample() },
            TaskHashInput { urgent: true, ..sample() },
        ];
        for variant in &variants {
            assert_ne!(compute_task_hash(variant), base);
        }
    }

    #[test]
    fn proof_hash_depends_on_artifacts_and_notes() {
        let artifacts = vec![ProofArtifact {
            kind: "confirmation_code".to_string(),
            value: "XYZ".to_string(),
            label: None,
        }];
        let a = compute_proof_hash(&artifacts, "done");
        assert_eq!(a, compute_proof_hash(&artifacts, "done"));
        assert_ne!(a, compute_proof_hash(&artifacts, "done!"));
        assert_ne!(a, compute_proof_hash(&[], "done"));
    }

    #[test]
    fn parse_hex32_round_trip() {
        let digest = task_id_to_bytes32("task-1");
        assert_eq!(parse_hex32(&to_hex32(&digest)), Some(digest));
        assert_eq!(parse_hex32("0x1234"), None);
        assert_eq!(parse_hex32("deadbeef"), None);
    }
}
