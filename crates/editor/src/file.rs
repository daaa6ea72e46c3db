use std::io::Read;

use paguridae_delta::{Delta, Op};

/// An editable buffer with a selection (dot) and an accumulated change
/// delta relative to the content the buffer was constructed from.
///
/// Embed operations are represented as NUL runes so offsets stay aligned
/// with delta rune positions.
pub struct File {
    runes: Vec<char>,
    dot: (usize, usize),
    changes: Delta,
}

impl File {
    pub fn from_delta(content: &Delta) -> Self {
        let mut runes = Vec::new();
        for op in content.ops() {
            match op {
                Op::Insert { text, .. } => runes.extend(text.chars()),
                Op::InsertEmbed { .. } => runes.push('\0'),
                _ => {}
            }
        }
        Self {
            runes,
            dot: (0, 0),
            changes: Delta::new(),
        }
    }

    pub fn from_reader<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let text = String::from_utf8_lossy(&bytes);
        Ok(Self {
            runes: text.chars().collect(),
            dot: (0, 0),
            changes: Delta::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.runes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runes.is_empty()
    }

    pub fn select(&mut self, q0: usize, q1: usize) {
        let q0 = q0.min(self.runes.len());
        let q1 = q1.clamp(q0, self.runes.len());
        self.dot = (q0, q1);
    }

    pub fn dot(&self) -> (usize, usize) {
        self.dot
    }

    /// The accumulated delta transforming the original content into the
    /// current buffer.
    pub fn changes(&self) -> Delta {
        self.changes.clone()
    }

    pub fn text(&self, q0: usize, q1: usize) -> String {
        let q0 = q0.min(self.runes.len());
        let q1 = q1.clamp(q0, self.runes.len());
        self.runes[q0..q1].iter().collect()
    }

    /// Replace runes `[q0, q1)` with `text` and record the edit.
    pub(crate) fn replace(&mut self, q0: usize, q1: usize, text: &str) {
        let q0 = q0.min(self.runes.len());
        let q1 = q1.clamp(q0, self.runes.len());
        let edit = Delta::new()
            .retain(q0, None)
            .delete(q1 - q0)
            .insert(text, None);
        self.changes = self.changes.compose(&edit);
        let tail = self.runes.split_off(q1);
        self.runes.truncate(q0);
        self.runes.extend(text.chars());
        self.runes.extend(tail);
    }

    /// Rune range of 1-based line `number`; line 0 addresses the file start.
    /// The range includes the trailing newline when present.
    pub(crate) fn line_range(&self, number: usize) -> (usize, usize) {
        if number == 0 {
            return (0, 0);
        }
        let mut line = 1;
        let mut start = 0;
        for (index, rune) in self.runes.iter().enumerate() {
            if line == number && *rune == '\n' {
                return (start, index + 1);
            }
            if *rune == '\n' {
                line += 1;
                start = index + 1;
            }
        }
        if line == number {
            (start, self.runes.len())
        } else {
            (self.runes.len(), self.runes.len())
        }
    }

    pub(crate) fn runes(&self) -> &[char] {
        &self.runes
    }
}
