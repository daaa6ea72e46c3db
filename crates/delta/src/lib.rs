//! Rich-text deltas: ordered retain/insert/delete operations over a rune
//! stream, with the composition algebra collaborative editing needs.
//!
//! The algebra follows the Quill delta model: `compose` is associative,
//! `transform` satisfies TP1, and `invert(base)` produces the exact undo of
//! a delta applied on top of `base`.

pub mod attributes;
mod op;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use attributes::AttributeMap;
pub use op::Op;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    ops: Vec<Op>,
}

impl Delta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Sum of all operation lengths, deletes and retains included. For a
    /// document delta (inserts only) this is the document length in runes.
    pub fn length(&self) -> usize {
        self.ops.iter().map(Op::len).sum()
    }

    pub fn insert(mut self, text: impl Into<String>, attributes: Option<AttributeMap>) -> Self {
        let text = text.into();
        if !text.is_empty() {
            self.push(Op::Insert { text, attributes });
        }
        self
    }

    pub fn insert_embed(mut self, value: Value, attributes: Option<AttributeMap>) -> Self {
        self.push(Op::InsertEmbed { value, attributes });
        self
    }

    pub fn retain(mut self, len: usize, attributes: Option<AttributeMap>) -> Self {
        if len > 0 {
            self.push(Op::Retain { len, attributes });
        }
        self
    }

    pub fn delete(mut self, len: usize) -> Self {
        if len > 0 {
            self.push(Op::Delete { len });
        }
        self
    }

    /// Append an operation, merging with the tail where the result is
    /// equivalent. Inserts sort before an immediately preceding delete so
    /// equal documents have equal op sequences.
    pub fn push(&mut self, new_op: Op) {
        if new_op.is_empty() {
            return;
        }
        let mut index = self.ops.len();
        if let Some(Op::Delete { len }) = self.ops.last_mut() {
            if let Op::Delete { len: add } = &new_op {
                *len += add;
                return;
            }
            if new_op.is_insert() {
                index -= 1;
            }
        }
        if index > 0 {
            let merged = match (&mut self.ops[index - 1], &new_op) {
                (
                    Op::Insert { text, attributes },
                    Op::Insert {
                        text: add,
                        attributes: new_attributes,
                    },
                ) if *attributes == *new_attributes => {
                    text.push_str(add);
                    true
                }
                (
                    Op::Retain { len, attributes },
                    Op::Retain {
                        len: add,
                        attributes: new_attributes,
                    },
                ) if *attributes == *new_attributes => {
                    *len += add;
                    true
                }
                _ => false,
            };
            if merged {
                return;
            }
        }
        self.ops.insert(index, new_op);
    }

    /// Drop a trailing attribute-less retain; it never changes meaning.
    pub fn chop(mut self) -> Self {
        if let Some(Op::Retain {
            attributes: None, ..
        }) = self.ops.last()
        {
            self.ops.pop();
        }
        self
    }

    pub fn concat(mut self, other: Delta) -> Self {
        let mut ops = other.ops.into_iter();
        if let Some(first) = ops.next() {
            self.push(first);
        }
        self.ops.extend(ops);
        self
    }

    /// Operations covering runes `[start, end)` of this delta.
    pub fn slice(&self, start: usize, end: usize) -> Delta {
        let mut result = Delta::new();
        let mut iter = OpIter::new(&self.ops);
        let mut index = 0;
        while index < end && iter.has_next() {
            let available = iter.peek_len();
            if index < start {
                let skipped = available.min(start - index);
                iter.next(skipped);
                index += skipped;
            } else {
                let taken = available.min(end - index);
                result.push(iter.next(taken));
                index += taken;
            }
        }
        result
    }

    /// The delta equivalent to applying `self` then `other`.
    pub fn compose(&self, other: &Delta) -> Delta {
        let mut this_iter = OpIter::new(&self.ops);
        let mut other_iter = OpIter::new(&other.ops);
        let mut result = Delta::new();

        while this_iter.has_next() || other_iter.has_next() {
            if other_iter.peek_is_insert() {
                result.push(other_iter.next(usize::MAX));
            } else if this_iter.peek_is_delete() {
                result.push(this_iter.next(usize::MAX));
            } else {
                let length = this_iter.peek_len().min(other_iter.peek_len());
                let this_op = this_iter.next(length);
                let other_op = other_iter.next(length);
                match other_op {
                    Op::Retain {
                        attributes: other_attributes,
                        ..
                    } => {
                        let attributes = attributes::compose(
                            this_op.attributes(),
                            other_attributes.as_ref(),
                            this_op.is_retain(),
                        );
                        let composed = match this_op {
                            Op::Retain { .. } => Op::Retain {
                                len: length,
                                attributes,
                            },
                            Op::Insert { text, .. } => Op::Insert { text, attributes },
                            Op::InsertEmbed { value, .. } => Op::InsertEmbed { value, attributes },
                            Op::Delete { .. } => unreachable!("delete handled above"),
                        };
                        result.push(composed);
                    }
                    Op::Delete { len } => {
                        if this_op.is_retain() {
                            result.push(Op::Delete { len });
                        }
                        // Insert followed by delete cancels out.
                    }
                    _ => unreachable!("insert handled above"),
                }
            }
        }
        result.chop()
    }

    /// Transform `other` so it applies after `self`. With `priority`, ties at
    /// equal positions resolve in favor of `self`.
    pub fn transform(&self, other: &Delta, priority: bool) -> Delta {
        let mut this_iter = OpIter::new(&self.ops);
        let mut other_iter = OpIter::new(&other.ops);
        let mut result = Delta::new();

        while this_iter.has_next() || other_iter.has_next() {
            if this_iter.peek_is_insert() && (priority || !other_iter.peek_is_insert()) {
                let length = this_iter.next(usize::MAX).len();
                result.push(Op::Retain {
                    len: length,
                    attributes: None,
                });
            } else if other_iter.peek_is_insert() {
                result.push(other_iter.next(usize::MAX));
            } else {
                let length = this_iter.peek_len().min(other_iter.peek_len());
                let this_op = this_iter.next(length);
                let other_op = other_iter.next(length);
                if this_op.is_delete() {
                    // This side already removed the range.
                    continue;
                }
                if other_op.is_delete() {
                    result.push(other_op);
                } else {
                    result.push(Op::Retain {
                        len: length,
                        attributes: attributes::transform(
                            this_op.attributes(),
                            other_op.attributes(),
                            priority,
                        ),
                    });
                }
            }
        }
        result.chop()
    }

    /// The delta that undoes `self` when `self` was applied on top of `base`.
    pub fn invert(&self, base: &Delta) -> Delta {
        let mut inverted = Delta::new();
        let mut base_index = 0;
        for op in &self.ops {
            match op {
                Op::Insert { .. } | Op::InsertEmbed { .. } => {
                    inverted = inverted.delete(op.len());
                }
                Op::Retain {
                    len,
                    attributes: None,
                } => {
                    inverted = inverted.retain(*len, None);
                    base_index += len;
                }
                Op::Retain {
                    len,
                    attributes: Some(op_attributes),
                } => {
                    for base_op in base.slice(base_index, base_index + len).ops {
                        let length = base_op.len();
                        let restored =
                            attributes::invert(Some(op_attributes), base_op.attributes());
                        inverted = inverted.retain(length, restored);
                    }
                    base_index += len;
                }
                Op::Delete { len } => {
                    for base_op in base.slice(base_index, base_index + len).ops {
                        inverted.push(base_op);
                    }
                    base_index += len;
                }
            }
        }
        inverted.chop()
    }
}

/// Cursor over an op list that can split operations at rune granularity.
/// Past the end it yields plain retains, matching the implicit "rest of the
/// document is untouched" suffix.
struct OpIter<'a> {
    ops: &'a [Op],
    index: usize,
    offset: usize,
}

impl<'a> OpIter<'a> {
    fn new(ops: &'a [Op]) -> Self {
        Self {
            ops,
            index: 0,
            offset: 0,
        }
    }

    fn has_next(&self) -> bool {
        self.index < self.ops.len()
    }

    fn peek_len(&self) -> usize {
        match self.ops.get(self.index) {
            Some(op) => op.len() - self.offset,
            None => usize::MAX,
        }
    }

    fn peek_is_insert(&self) -> bool {
        self.ops.get(self.index).is_some_and(Op::is_insert)
    }

    fn peek_is_delete(&self) -> bool {
        self.ops.get(self.index).is_some_and(Op::is_delete)
    }

    fn next(&mut self, max: usize) -> Op {
        let Some(op) = self.ops.get(self.index) else {
            return Op::Retain {
                len: max,
                attributes: None,
            };
        };
        let remaining = op.len() - self.offset;
        let taken = remaining.min(max);
        let result = if self.offset == 0 && taken == op.len() {
            op.clone()
        } else {
            op.take(self.offset, taken)
        };
        if taken == remaining {
            self.index += 1;
            self.offset = 0;
        } else {
            self.offset += taken;
        }
        result
    }
}
