//! Delta rendering and diffing helpers.
//!
//! `diff` runs a Myers diff over rune sequences and emits a minimal
//! retain/insert/delete delta, so `old.compose(&diff(old, new)) == new`
//! for text content. Embeds render as NUL runes to keep positions
//! aligned while diffing.

use paguridae_delta::{Delta, Op};

pub fn delta_to_runes(delta: &Delta, include_embeds: bool) -> Vec<char> {
    let mut runes = Vec::new();
    for op in delta.ops() {
        match op {
            Op::Insert { text, .. } => runes.extend(text.chars()),
            Op::InsertEmbed { .. } if include_embeds => runes.push('\0'),
            _ => {}
        }
    }
    runes
}

pub fn delta_to_string(delta: &Delta, include_embeds: bool) -> String {
    delta_to_runes(delta, include_embeds).into_iter().collect()
}

pub fn diff(old: &Delta, new: &Delta) -> Delta {
    let old_runes = delta_to_runes(old, true);
    let new_runes = delta_to_runes(new, true);
    let mut result = Delta::new();
    for edit in myers_edits(&old_runes, &new_runes) {
        match edit {
            Edit::Equal(_) => result.push(Op::Retain {
                len: 1,
                attributes: None,
            }),
            Edit::Insert(rune) => result.push(Op::Insert {
                text: rune.to_string(),
                attributes: None,
            }),
            Edit::Delete(_) => result.push(Op::Delete { len: 1 }),
        }
    }
    result.chop()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit {
    Equal(char),
    Insert(char),
    Delete(char),
}

fn myers_edits(old: &[char], new: &[char]) -> Vec<Edit> {
    let old_len = old.len();
    let new_len = new.len();

    if old_len == 0 {
        return new.iter().copied().map(Edit::Insert).collect();
    }
    if new_len == 0 {
        return old.iter().copied().map(Edit::Delete).collect();
    }

    let max = old_len + new_len;
    let offset = max as isize;
    let mut v = vec![0isize; 2 * max + 1];
    let mut trace: Vec<Vec<isize>> = Vec::with_capacity(max + 1);
    let mut solved_d = 0usize;

    'outer: for d in 0..=max {
        trace.push(v.clone());

        let d_isize = d as isize;
        let mut k = -d_isize;
        while k <= d_isize {
            let k_idx = (k + offset) as usize;
            let mut x = if k == -d_isize
                || (k != d_isize && v[(k - 1 + offset) as usize] < v[(k + 1 + offset) as usize])
            {
                v[(k + 1 + offset) as usize]
            } else {
                v[(k - 1 + offset) as usize] + 1
            };
            let mut y = x - k;

            while x < old_len as isize
                && y < new_len as isize
                && old[x as usize] == new[y as usize]
            {
                x += 1;
                y += 1;
            }

            v[k_idx] = x;

            if x >= old_len as isize && y >= new_len as isize {
                solved_d = d;
                break 'outer;
            }

            k += 2;
        }
    }

    backtrack(old, new, &trace, solved_d, offset)
}

fn backtrack(
    old: &[char],
    new: &[char],
    trace: &[Vec<isize>],
    solved_d: usize,
    offset: isize,
) -> Vec<Edit> {
    let mut edits = Vec::new();
    let mut x = old.len() as isize;
    let mut y = new.len() as isize;

    for d in (0..=solved_d).rev() {
        let v = &trace[d];
        let k = x - y;
        let d_isize = d as isize;

        let prev_k = if d == 0 {
            0
        } else if k == -d_isize
            || (k != d_isize && v[(k - 1 + offset) as usize] < v[(k + 1 + offset) as usize])
        {
            k + 1
        } else {
            k - 1
        };
        let prev_x = if d == 0 { 0 } else { v[(prev_k + offset) as usize] };
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            edits.push(Edit::Equal(old[(x - 1) as usize]));
            x -= 1;
            y -= 1;
        }

        if d == 0 {
            break;
        }

        if x == prev_x {
            edits.push(Edit::Insert(new[(y - 1) as usize]));
            y -= 1;
        } else {
            edits.push(Edit::Delete(old[(x - 1) as usize]));
            x -= 1;
        }
    }

    edits.reverse();
    edits
}
