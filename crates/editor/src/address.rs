//! Sam address expressions: where in the buffer a command applies.

use regex::Regex;

use crate::file::File;
use crate::RunError;

#[derive(Debug, Clone)]
pub(crate) enum Term {
    Dot,
    End,
    Rune(usize),
    Line(usize),
    Forward(String),
    Backward(String),
    Plus(Box<Term>),
    Minus(Box<Term>),
}

#[derive(Debug, Clone)]
pub(crate) enum Address {
    One(Vec<Term>),
    Range(Option<Vec<Term>>, Option<Vec<Term>>),
}

impl Address {
    pub(crate) fn resolve(&self, file: &File) -> Result<(usize, usize), RunError> {
        match self {
            Address::One(terms) => eval_terms(terms, file, file.dot()),
            Address::Range(lo, hi) => {
                let (q0, _) = match lo {
                    Some(terms) => eval_terms(terms, file, file.dot())?,
                    None => (0, 0),
                };
                let (_, q1) = match hi {
                    Some(terms) => eval_terms(terms, file, (q0, q0))?,
                    None => (file.len(), file.len()),
                };
                Ok((q0, q1.max(q0)))
            }
        }
    }
}

fn eval_terms(
    terms: &[Term],
    file: &File,
    start: (usize, usize),
) -> Result<(usize, usize), RunError> {
    let mut current = start;
    for term in terms {
        current = eval_term(term, file, current)?;
    }
    Ok(current)
}

fn eval_term(term: &Term, file: &File, dot: (usize, usize)) -> Result<(usize, usize), RunError> {
    match term {
        Term::Dot => Ok(dot),
        Term::End => Ok((file.len(), file.len())),
        Term::Rune(n) => {
            let n = (*n).min(file.len());
            Ok((n, n))
        }
        Term::Line(n) => Ok(file.line_range(*n)),
        Term::Forward(pattern) => search_forward(file, pattern, dot.1),
        Term::Backward(pattern) => search_backward(file, pattern, dot.0),
        Term::Plus(inner) => match inner.as_ref() {
            Term::Line(n) => Ok(line_offset(file, dot.1, *n as isize)),
            Term::Rune(n) => {
                let pos = (dot.1 + n).min(file.len());
                Ok((pos, pos))
            }
            other => eval_term(other, file, dot),
        },
        Term::Minus(inner) => match inner.as_ref() {
            Term::Line(n) => Ok(line_offset(file, dot.0, -(*n as isize))),
            Term::Rune(n) => {
                let pos = dot.0.saturating_sub(*n);
                Ok((pos, pos))
            }
            Term::Forward(pattern) => search_backward(file, pattern, dot.0),
            other => eval_term(other, file, dot),
        },
    }
}

/// The whole line `count` lines away from the line containing `pos`.
fn line_offset(file: &File, pos: usize, count: isize) -> (usize, usize) {
    let runes = file.runes();
    let mut line = 1;
    for rune in runes.iter().take(pos) {
        if *rune == '\n' {
            line += 1;
        }
    }
    let target = line as isize + count;
    if target < 1 {
        return (0, 0);
    }
    file.line_range(target as usize)
}

pub(crate) fn search_forward(
    file: &File,
    pattern: &str,
    from: usize,
) -> Result<(usize, usize), RunError> {
    let re = compile_pattern(pattern)?;
    let text: String = file.runes().iter().collect();
    let byte_from = rune_to_byte(&text, from);
    if let Some(found) = re.find_at(&text, byte_from) {
        return Ok((
            byte_to_rune(&text, found.start()),
            byte_to_rune(&text, found.end()),
        ));
    }
    // Wrap to the beginning.
    if let Some(found) = re.find(&text) {
        return Ok((
            byte_to_rune(&text, found.start()),
            byte_to_rune(&text, found.end()),
        ));
    }
    Err(RunError::NoMatch(pattern.to_string()))
}

pub(crate) fn search_backward(
    file: &File,
    pattern: &str,
    before: usize,
) -> Result<(usize, usize), RunError> {
    let re = compile_pattern(pattern)?;
    let text: String = file.runes().iter().collect();
    let limit = rune_to_byte(&text, before);
    let mut last = None;
    for found in re.find_iter(&text) {
        if found.end() <= limit {
            last = Some(found);
        }
    }
    // Wrap to the last match in the file.
    let found = match last {
        Some(found) => found,
        None => re
            .find_iter(&text)
            .last()
            .ok_or_else(|| RunError::NoMatch(pattern.to_string()))?,
    };
    Ok((
        byte_to_rune(&text, found.start()),
        byte_to_rune(&text, found.end()),
    ))
}

pub(crate) fn compile_pattern(pattern: &str) -> Result<Regex, RunError> {
    Regex::new(pattern).map_err(|error| RunError::BadPattern(error.to_string()))
}

pub(crate) fn rune_to_byte(text: &str, rune: usize) -> usize {
    text.char_indices()
        .nth(rune)
        .map(|(index, _)| index)
        .unwrap_or(text.len())
}

pub(crate) fn byte_to_rune(text: &str, byte: usize) -> usize {
    text[..byte].chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::File;
    use paguridae_delta::Delta;

    fn file(text: &str) -> File {
        File::from_delta(&Delta::new().insert(text, None))
    }

    #[test]
    fn forward_search_starts_at_dot_and_wraps() {
        let f = file("foo bar foo");
        assert_eq!(search_forward(&f, "foo", 0).unwrap(), (0, 3));
        assert_eq!(search_forward(&f, "foo", 1).unwrap(), (8, 11));
        assert_eq!(search_forward(&f, "foo", 9).unwrap(), (0, 3));
    }

    #[test]
    fn backward_search_finds_match_before_dot() {
        let f = file("foo bar foo");
        assert_eq!(search_backward(&f, "foo", 11).unwrap(), (8, 11));
        assert_eq!(search_backward(&f, "foo", 5).unwrap(), (0, 3));
    }

    #[test]
    fn range_defaults_to_whole_file() {
        let f = file("abc\ndef\n");
        let address = Address::Range(None, None);
        assert_eq!(address.resolve(&f).unwrap(), (0, 8));
    }

    #[test]
    fn line_addresses_compose_with_ranges() {
        let f = file("one\ntwo\nthree\n");
        let address = Address::Range(
            Some(vec![Term::Line(1)]),
            Some(vec![Term::Line(2)]),
        );
        assert_eq!(address.resolve(&f).unwrap(), (0, 8));
    }

    #[test]
    fn rune_offsets_count_multibyte_chars() {
        let f = file("héllo");
        let (q0, q1) = search_forward(&f, "llo", 0).unwrap();
        assert_eq!((q0, q1), (2, 5));
    }
}
