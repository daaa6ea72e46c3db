//! Window label grammar.
//!
//! The first whitespace-delimited token of a label is the path, optionally
//! prefixed by `(start,length)` or `(start,length,file_length)` for
//! partial-load windows, and optionally suffixed after `:` by a sam-style
//! address expression.

use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use paguridae_delta::Delta;

use crate::deltautil::delta_to_string;

pub const DEFAULT_LABEL: &str = " | New Del Put";
pub const META_FILE_ID: u32 = 0;

pub static ABSOLUTE_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[,\d\(\)]*/").expect("absolute path pattern is valid"));
static PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\((\d+),(\d+)(?:,(\d+))?\))?(.*)$").expect("path pattern is valid")
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathInfo {
    pub path: String,
    pub location: String,
    pub start: Option<i64>,
    pub length: Option<i64>,
    pub file_length: Option<i64>,
}

impl PathInfo {
    pub fn partial_load(&self) -> bool {
        self.start.is_some() && self.length.is_some()
    }

    /// Identity used for window lookup: path, sam-address suffix, and
    /// partial range; the recorded file length does not participate.
    pub fn same(&self, other: &PathInfo) -> bool {
        if self.path != other.path
            || self.location != other.location
            || self.partial_load() != other.partial_load()
        {
            return false;
        }
        if self.partial_load() && (self.start != other.start || self.length != other.length) {
            return false;
        }
        true
    }

    pub fn serialize_path(&self) -> String {
        let prefix = if self.partial_load() {
            match self.file_length {
                Some(file_length) => format!(
                    "({},{},{})",
                    self.start.unwrap_or(0),
                    self.length.unwrap_or(0),
                    file_length
                ),
                None => format!("({},{})", self.start.unwrap_or(0), self.length.unwrap_or(0)),
            }
        } else {
            String::new()
        };
        format!("{prefix}{}", self.path)
    }
}

/// The label's full first token, partial-load prefix and address suffix
/// included.
pub fn extract_full_path(label: &Delta) -> String {
    let text = delta_to_string(label, false);
    text.split(' ').next().unwrap_or_default().to_string()
}

pub fn parse_full_path(full_path: &str) -> PathInfo {
    let mut info = PathInfo::default();
    let (token, location) = match full_path.split_once(':') {
        Some((token, location)) => (token, Some(location)),
        None => (full_path, None),
    };
    let Some(captures) = PATH_RE.captures(token) else {
        warn!(full_path, "error extracting path from label");
        return info;
    };
    info.path = clean_path(captures.get(4).map_or("", |m| m.as_str()));
    if let Some(location) = location {
        info.location = location.to_string();
    }
    let start = captures.get(1).and_then(|m| m.as_str().parse::<i64>().ok());
    let length = captures.get(2).and_then(|m| m.as_str().parse::<i64>().ok());
    if let (Some(start), Some(length)) = (start, length) {
        info.start = Some(start);
        info.length = Some(length);
    }
    info.file_length = captures.get(3).and_then(|m| m.as_str().parse::<i64>().ok());
    info
}

pub fn extract_path(label: &Delta) -> PathInfo {
    parse_full_path(&extract_full_path(label))
}

/// Lexical path cleanup: collapse repeated separators, resolve `.` and
/// `..` components, keep the result rooted the way the input was.
pub fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if let Some(last) = parts.last() {
                    if *last != ".." {
                        parts.pop();
                        continue;
                    }
                }
                if !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}
