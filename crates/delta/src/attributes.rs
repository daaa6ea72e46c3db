//! Attribute maps attached to insert/retain operations.
//!
//! A `null` value inside a map means "remove this attribute"; whether nulls
//! survive a composition depends on whether the left-hand operation is a
//! retain (nulls must be kept so they can cancel formatting downstream).

use serde_json::{Map, Value};

pub type AttributeMap = Map<String, Value>;

/// Merge `b` over `a`. When `keep_null` is false, `null` entries are dropped
/// from the result.
pub fn compose(
    a: Option<&AttributeMap>,
    b: Option<&AttributeMap>,
    keep_null: bool,
) -> Option<AttributeMap> {
    let mut merged = b.cloned().unwrap_or_default();
    if let Some(a) = a {
        for (key, value) in a {
            if !merged.contains_key(key) {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    if !keep_null {
        merged.retain(|_, value| !value.is_null());
    }
    if merged.is_empty() {
        None
    } else {
        Some(merged)
    }
}

/// Attributes that undo applying `attr` on top of `base`.
pub fn invert(attr: Option<&AttributeMap>, base: Option<&AttributeMap>) -> Option<AttributeMap> {
    let empty = AttributeMap::new();
    let attr = attr.unwrap_or(&empty);
    let base = base.unwrap_or(&empty);

    let mut inverted = AttributeMap::new();
    for (key, base_value) in base {
        if attr.contains_key(key) && attr.get(key) != Some(base_value) {
            inverted.insert(key.clone(), base_value.clone());
        }
    }
    for key in attr.keys() {
        if !base.contains_key(key) {
            inverted.insert(key.clone(), Value::Null);
        }
    }
    if inverted.is_empty() {
        None
    } else {
        Some(inverted)
    }
}

/// Transform `b` against concurrently applied `a`. With `priority`, `a` wins
/// conflicting keys; otherwise `b` passes through untouched.
pub fn transform(
    a: Option<&AttributeMap>,
    b: Option<&AttributeMap>,
    priority: bool,
) -> Option<AttributeMap> {
    let Some(a) = a else {
        return b.cloned();
    };
    let Some(b) = b else {
        return None;
    };
    if !priority {
        return Some(b.clone());
    }
    let surviving: AttributeMap = b
        .iter()
        .filter(|(key, _)| !a.contains_key(*key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    if surviving.is_empty() {
        None
    } else {
        Some(surviving)
    }
}
