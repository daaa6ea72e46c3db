//! Script compilation and execution.

use std::io::Write;

use crate::address::{compile_pattern, Address, Term};
use crate::file::File;
use crate::{CompileError, RunError};

/// One compiled command: an optional address and a verb.
#[derive(Debug, Clone)]
pub(crate) struct Command {
    pub(crate) address: Option<Address>,
    pub(crate) verb: Verb,
}

#[derive(Debug, Clone)]
pub(crate) enum Verb {
    Substitute {
        pattern: String,
        replacement: String,
        global: bool,
    },
    Delete,
    Append(String),
    Insert(String),
    Change(String),
    Print,
    PrintAddress,
    /// A bare address: only moves dot.
    Locate,
}

/// A compiled edit script.
#[derive(Debug, Clone)]
pub struct Program {
    pub(crate) commands: Vec<Command>,
}

/// Everything a program needs while running.
pub struct Context<'a> {
    pub file: &'a mut File,
    pub printer: Option<&'a mut dyn Write>,
}

impl Program {
    pub fn run(&self, mut ctx: Context<'_>) -> Result<(), RunError> {
        for command in &self.commands {
            if let Some(address) = &command.address {
                let (q0, q1) = address.resolve(ctx.file)?;
                ctx.file.select(q0, q1);
            }
            run_verb(&command.verb, &mut ctx)?;
        }
        Ok(())
    }
}

fn run_verb(verb: &Verb, ctx: &mut Context<'_>) -> Result<(), RunError> {
    let (q0, q1) = ctx.file.dot();
    match verb {
        Verb::Substitute {
            pattern,
            replacement,
            global,
        } => {
            let re = compile_pattern(pattern)?;
            let text = ctx.file.text(q0, q1);
            let mut replaced = String::new();
            let mut cursor = 0;
            let mut changed = false;
            for captures in re.captures_iter(&text) {
                let whole = captures.get(0).expect("match 0 always present");
                replaced.push_str(&text[cursor..whole.start()]);
                expand_replacement(replacement, &captures, &mut replaced);
                cursor = whole.end();
                changed = true;
                if !global {
                    break;
                }
            }
            if !changed {
                return Err(RunError::NoMatch(pattern.clone()));
            }
            replaced.push_str(&text[cursor..]);
            let new_len = replaced.chars().count();
            ctx.file.replace(q0, q1, &replaced);
            ctx.file.select(q0, q0 + new_len);
        }
        Verb::Delete => {
            ctx.file.replace(q0, q1, "");
            ctx.file.select(q0, q0);
        }
        Verb::Append(text) => {
            ctx.file.replace(q1, q1, text);
            ctx.file.select(q1, q1 + text.chars().count());
        }
        Verb::Insert(text) => {
            ctx.file.replace(q0, q0, text);
            ctx.file.select(q0, q0 + text.chars().count());
        }
        Verb::Change(text) => {
            ctx.file.replace(q0, q1, text);
            ctx.file.select(q0, q0 + text.chars().count());
        }
        Verb::Print => {
            if let Some(printer) = ctx.printer.as_mut() {
                let text = ctx.file.text(q0, q1);
                printer.write_all(text.as_bytes())?;
            }
        }
        Verb::PrintAddress => {
            if let Some(printer) = ctx.printer.as_mut() {
                writeln!(printer, "#{q0},#{q1}")?;
            }
        }
        Verb::Locate => {}
    }
    Ok(())
}

fn expand_replacement(template: &str, captures: &regex::Captures<'_>, out: &mut String) {
    let mut chars = template.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '&' => out.push_str(captures.get(0).map_or("", |m| m.as_str())),
            '\\' => match chars.next() {
                Some(digit @ '0'..='9') => {
                    let group = digit as usize - '0' as usize;
                    out.push_str(captures.get(group).map_or("", |m| m.as_str()));
                }
                Some(other) => out.push(other),
                None => out.push('\\'),
            },
            other => out.push(other),
        }
    }
}

/// Compile a sam-style edit script.
pub fn compile(script: &str) -> Result<Program, CompileError> {
    let mut parser = Parser {
        chars: script.chars().collect(),
        position: 0,
    };
    let mut commands = Vec::new();
    loop {
        parser.skip_blank();
        if parser.at_end() {
            break;
        }
        commands.push(parser.parse_command()?);
    }
    Ok(Program { commands })
}

struct Parser {
    chars: Vec<char>,
    position: usize,
}

impl Parser {
    fn at_end(&self) -> bool {
        self.position >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.position).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek();
        if ch.is_some() {
            self.position += 1;
        }
        ch
    }

    fn skip_blank(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t' | '\n' | '\r')) {
            self.position += 1;
        }
    }

    fn parse_command(&mut self) -> Result<Command, CompileError> {
        let address = self.parse_address()?;
        self.skip_spaces();
        let verb = match self.peek() {
            None | Some('\n') => {
                if address.is_none() {
                    return Err(CompileError::EmptyCommand);
                }
                Verb::Locate
            }
            Some('s') => {
                self.bump();
                let delimiter = self.bump().ok_or(CompileError::MissingDelimiter('s'))?;
                let pattern = self.read_delimited(delimiter)?;
                let replacement = self.read_delimited(delimiter)?;
                let global = if self.peek() == Some('g') {
                    self.bump();
                    true
                } else {
                    false
                };
                Verb::Substitute {
                    pattern,
                    replacement,
                    global,
                }
            }
            Some('d') => {
                self.bump();
                Verb::Delete
            }
            Some('p') => {
                self.bump();
                Verb::Print
            }
            Some('=') => {
                self.bump();
                Verb::PrintAddress
            }
            Some(kind @ ('a' | 'i' | 'c')) => {
                self.bump();
                let delimiter = self.bump().ok_or(CompileError::MissingDelimiter(kind))?;
                let text = self.read_delimited(delimiter)?;
                match kind {
                    'a' => Verb::Append(text),
                    'i' => Verb::Insert(text),
                    _ => Verb::Change(text),
                }
            }
            Some(other) => return Err(CompileError::UnknownCommand(other)),
        };
        Ok(Command { address, verb })
    }

    fn skip_spaces(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t')) {
            self.position += 1;
        }
    }

    fn parse_address(&mut self) -> Result<Option<Address>, CompileError> {
        let first = self.parse_terms()?;
        self.skip_spaces();
        if self.peek() == Some(',') {
            self.bump();
            self.skip_spaces();
            let second = self.parse_terms()?;
            return Ok(Some(Address::Range(
                if first.is_empty() { None } else { Some(first) },
                if second.is_empty() { None } else { Some(second) },
            )));
        }
        if first.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Address::One(first)))
        }
    }

    fn parse_terms(&mut self) -> Result<Vec<Term>, CompileError> {
        let mut terms = Vec::new();
        loop {
            match self.peek() {
                Some('.') => {
                    self.bump();
                    terms.push(Term::Dot);
                }
                Some('$') => {
                    self.bump();
                    terms.push(Term::End);
                }
                Some('#') => {
                    self.bump();
                    terms.push(Term::Rune(self.read_number()?));
                }
                Some('0'..='9') => {
                    terms.push(Term::Line(self.read_number()?));
                }
                Some('/') => {
                    self.bump();
                    terms.push(Term::Forward(self.read_delimited('/')?));
                }
                Some('?') => {
                    self.bump();
                    terms.push(Term::Backward(self.read_delimited('?')?));
                }
                Some(sign @ ('+' | '-')) => {
                    self.bump();
                    let inner = match self.peek() {
                        Some('#') => {
                            self.bump();
                            Term::Rune(self.read_number()?)
                        }
                        Some('0'..='9') => Term::Line(self.read_number()?),
                        Some('/') => {
                            self.bump();
                            Term::Forward(self.read_delimited('/')?)
                        }
                        _ => Term::Line(1),
                    };
                    terms.push(if sign == '+' {
                        Term::Plus(Box::new(inner))
                    } else {
                        Term::Minus(Box::new(inner))
                    });
                }
                _ => break,
            }
        }
        Ok(terms)
    }

    fn read_number(&mut self) -> Result<usize, CompileError> {
        let mut digits = String::new();
        while let Some(ch @ '0'..='9') = self.peek() {
            digits.push(ch);
            self.bump();
        }
        digits.parse().map_err(|_| CompileError::BadNumber)
    }

    /// Read text until the unescaped `delimiter`; an escaped delimiter is
    /// unescaped, every other escape passes through for the regex engine.
    /// Newlines are ordinary characters, so `a/line\n/` blocks work.
    fn read_delimited(&mut self, delimiter: char) -> Result<String, CompileError> {
        let mut text = String::new();
        loop {
            match self.bump() {
                None => return Err(CompileError::UnterminatedText(delimiter)),
                Some(ch) if ch == delimiter => return Ok(text),
                Some('\\') => match self.bump() {
                    Some(ch) if ch == delimiter => text.push(ch),
                    Some(ch) => {
                        text.push('\\');
                        text.push(ch);
                    }
                    None => return Err(CompileError::UnterminatedText(delimiter)),
                },
                Some(ch) => text.push(ch),
            }
        }
    }
}
