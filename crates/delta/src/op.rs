use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::attributes::AttributeMap;

/// A single delta operation. Lengths are counted in runes; an embed counts
/// as exactly one rune.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Insert {
        text: String,
        attributes: Option<AttributeMap>,
    },
    InsertEmbed {
        value: Value,
        attributes: Option<AttributeMap>,
    },
    Retain {
        len: usize,
        attributes: Option<AttributeMap>,
    },
    Delete {
        len: usize,
    },
}

impl Op {
    pub fn len(&self) -> usize {
        match self {
            Op::Insert { text, .. } => text.chars().count(),
            Op::InsertEmbed { .. } => 1,
            Op::Retain { len, .. } | Op::Delete { len } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn attributes(&self) -> Option<&AttributeMap> {
        match self {
            Op::Insert { attributes, .. }
            | Op::InsertEmbed { attributes, .. }
            | Op::Retain { attributes, .. } => attributes.as_ref(),
            Op::Delete { .. } => None,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Op::Insert { .. } | Op::InsertEmbed { .. })
    }

    pub fn is_retain(&self) -> bool {
        matches!(self, Op::Retain { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Op::Delete { .. })
    }

    /// A sub-operation covering `length` runes starting at rune `offset`.
    /// Embeds are indivisible; callers never split them because their
    /// length is 1.
    pub(crate) fn take(&self, offset: usize, length: usize) -> Op {
        match self {
            Op::Insert { text, attributes } => Op::Insert {
                text: char_range(text, offset, length),
                attributes: attributes.clone(),
            },
            Op::InsertEmbed { value, attributes } => Op::InsertEmbed {
                value: value.clone(),
                attributes: attributes.clone(),
            },
            Op::Retain { attributes, .. } => Op::Retain {
                len: length,
                attributes: attributes.clone(),
            },
            Op::Delete { .. } => Op::Delete { len: length },
        }
    }
}

fn char_range(text: &str, start: usize, len: usize) -> String {
    text.chars().skip(start).take(len).collect()
}

// Wire form matching Quill JSON: exactly one of insert/retain/delete is set.
#[derive(Serialize, Deserialize)]
struct OpRepr {
    #[serde(skip_serializing_if = "Option::is_none")]
    insert: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retain: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    delete: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attributes: Option<AttributeMap>,
}

impl Serialize for Op {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let repr = match self.clone() {
            Op::Insert { text, attributes } => OpRepr {
                insert: Some(Value::String(text)),
                retain: None,
                delete: None,
                attributes,
            },
            Op::InsertEmbed { value, attributes } => OpRepr {
                insert: Some(value),
                retain: None,
                delete: None,
                attributes,
            },
            Op::Retain { len, attributes } => OpRepr {
                insert: None,
                retain: Some(len),
                delete: None,
                attributes,
            },
            Op::Delete { len } => OpRepr {
                insert: None,
                retain: None,
                delete: Some(len),
                attributes: None,
            },
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Op {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = OpRepr::deserialize(deserializer)?;
        match (repr.insert, repr.retain, repr.delete) {
            (Some(Value::String(text)), None, None) => Ok(Op::Insert {
                text,
                attributes: repr.attributes,
            }),
            (Some(value), None, None) => Ok(Op::InsertEmbed {
                value,
                attributes: repr.attributes,
            }),
            (None, Some(len), None) => Ok(Op::Retain {
                len,
                attributes: repr.attributes,
            }),
            (None, None, Some(len)) => Ok(Op::Delete { len }),
            _ => Err(D::Error::custom(
                "op must set exactly one of insert/retain/delete",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_length_counts_runes_not_bytes() {
        let op = Op::Insert {
            text: "héllo".to_string(),
            attributes: None,
        };
        assert_eq!(op.len(), 5);
    }

    #[test]
    fn embed_length_is_one() {
        let op = Op::InsertEmbed {
            value: json!({"image": "x.png"}),
            attributes: None,
        };
        assert_eq!(op.len(), 1);
    }

    #[test]
    fn take_splits_insert_on_rune_boundaries() {
        let op = Op::Insert {
            text: "héllo".to_string(),
            attributes: None,
        };
        assert_eq!(
            op.take(1, 3),
            Op::Insert {
                text: "éll".to_string(),
                attributes: None
            }
        );
    }

    #[test]
    fn json_round_trip() {
        let ops = vec![
            Op::Insert {
                text: "abc".to_string(),
                attributes: None,
            },
            Op::Retain {
                len: 2,
                attributes: serde_json::from_value(json!({"bold": true})).ok(),
            },
            Op::Delete { len: 4 },
            Op::InsertEmbed {
                value: json!({"image": "i.png"}),
                attributes: None,
            },
        ];
        for op in ops {
            let encoded = serde_json::to_string(&op).unwrap();
            let decoded: Op = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, op);
        }
    }

    #[test]
    fn rejects_ambiguous_op() {
        let err = serde_json::from_str::<Op>(r#"{"retain": 1, "delete": 2}"#);
        assert!(err.is_err());
    }
}
