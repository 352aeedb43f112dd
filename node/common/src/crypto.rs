use ethers::types::H256;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Largest integer an IEEE-754 double represents exactly (2^53 - 1)
pub const MAX_SAFE_INTEGER: u64 = 9_007_199_254_740_991;

/// Compute SHA256 hash
pub fn sha256(data: &[u8]) -> H256 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    H256::from_slice(&hasher.finalize())
}

/// Deterministic JSON text: object keys sorted, no whitespace, integers
/// wider than double precision written as decimal strings.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            // literal text is exact under `arbitrary_precision`
            let literal = n.to_string();
            if is_wide_integer(&literal) {
                out.push('"');
                out.push_str(&literal);
                out.push('"');
            } else {
                out.push_str(&literal);
            }
        }
        Value::String(s) => push_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                push_string(key, out);
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

/// Integer literal whose magnitude exceeds `MAX_SAFE_INTEGER`, of any width
fn is_wide_integer(literal: &str) -> bool {
    let digits = literal.strip_prefix('-').unwrap_or(literal);
    !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && digits
            .parse::<u64>()
            .map_or(true, |magnitude| magnitude > MAX_SAFE_INTEGER)
}

fn push_string(s: &str, out: &mut String) {
    // serializing a str cannot fail
    out.push_str(&serde_json::to_string(s).unwrap_or_default());
}

/// Digest of the canonical JSON form
pub fn hash_canonical(value: &Value) -> H256 {
    sha256(canonical_json(value).as_bytes())
}

/// Canonical digest of any serializable value
pub fn hash_serializable<T: Serialize>(value: &T) -> serde_json::Result<H256> {
    Ok(hash_canonical(&serde_json::to_value(value)?))
}
