//! DER form of entitlements (special slot 7).
//!
//! Newer iOS releases read entitlements from the DER blob rather than the
//! XML one. The layout is:
//!
//! ```text
//! [APPLICATION 16] {
//!     INTEGER 1,
//!     [CONTEXT 16] { SEQUENCE { UTF8String key, value } ... }
//! }
//! ```
//!
//! Dictionaries nest as `[CONTEXT 16]` sets with keys in byte order, arrays
//! as SEQUENCE. Only booleans, integers, strings, arrays and dictionaries
//! may appear.

use crate::{Error, Result};
use plist::Value;

const TAG_BOOLEAN: u8 = 0x01;
const TAG_INTEGER: u8 = 0x02;
const TAG_UTF8_STRING: u8 = 0x0c;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_APPLICATION_16: u8 = 0x70;
const TAG_CONTEXT_16: u8 = 0xb0;

/// Encode an entitlements plist (any plist format) to DER.
pub fn entitlements_to_der(plist_data: &[u8]) -> Result<Vec<u8>> {
    let value: Value = plist::from_bytes(plist_data)
        .map_err(|e| Error::Entitlements(format!("unreadable plist: {e}")))?;
    let dict = value
        .as_dictionary()
        .ok_or_else(|| Error::Entitlements("root is not a dictionary".into()))?;

    let mut body = Vec::new();
    write_tlv(&mut body, TAG_INTEGER, &[1]);
    write_tlv(&mut body, TAG_CONTEXT_16, &encode_dict(dict)?);

    let mut out = Vec::with_capacity(body.len() + 6);
    write_tlv(&mut out, TAG_APPLICATION_16, &body);
    Ok(out)
}

fn encode_value(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match value {
        Value::Boolean(b) => write_tlv(&mut out, TAG_BOOLEAN, &[if *b { 0xff } else { 0x00 }]),
        Value::Integer(i) => {
            let n = i
                .as_signed()
                .ok_or_else(|| Error::Entitlements(format!("integer {i} out of range")))?;
            write_tlv(&mut out, TAG_INTEGER, &integer_content(n));
        }
        Value::String(s) => write_tlv(&mut out, TAG_UTF8_STRING, s.as_bytes()),
        Value::Array(items) => {
            let mut content = Vec::new();
            for item in items {
                content.extend(encode_value(item)?);
            }
            write_tlv(&mut out, TAG_SEQUENCE, &content);
        }
        Value::Dictionary(dict) => write_tlv(&mut out, TAG_CONTEXT_16, &encode_dict(dict)?),
        other => {
            return Err(Error::Entitlements(format!(
                "unsupported value in entitlements: {other:?}"
            )))
        }
    }
    Ok(out)
}

fn encode_dict(dict: &plist::Dictionary) -> Result<Vec<u8>> {
    let mut entries: Vec<(&String, &Value)> = dict.iter().collect();
    entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    let mut content = Vec::new();
    for (key, value) in entries {
        let mut pair = Vec::new();
        write_tlv(&mut pair, TAG_UTF8_STRING, key.as_bytes());
        pair.extend(encode_value(value)?);
        write_tlv(&mut content, TAG_SEQUENCE, &pair);
    }
    Ok(content)
}

/// Minimal two's complement big-endian bytes.
fn integer_content(n: i64) -> Vec<u8> {
    let bytes = n.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

fn write_tlv(out: &mut Vec<u8>, tag: u8, content: &[u8]) {
    out.push(tag);
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = (len as u64).to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (8 - skip) as u8);
        out.extend(&bytes[skip..]);
    }
    out.extend(content);
}
