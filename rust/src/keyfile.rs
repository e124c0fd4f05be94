//! Textual editing of ostree remote configuration files.
//!
//! Unlike a real keyfile parser this never normalizes anything: lines
//! we don't touch are written back byte for byte, so comments and odd
//! formatting that admins put into `/etc/ostree/remotes.d` survive.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

/// Section headers, e.g. `[section]`.
static SECTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\[\s*([^\]]*)\s*\]\s*$").unwrap());
/// Parameters, e.g. `key=value`.
static PARAM: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*([\w._-]+)\s*=\s*(.*?)\s*$").unwrap());
static LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\r\n|\r|\n").unwrap());

/// A top level value or a whole section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Value(String),
    Section(BTreeMap<String, String>),
}

/// Parsed configuration: keys before the first section header stay at
/// the top level, alongside the named sections.
pub type KeyFileData = BTreeMap<String, Entry>;

fn split_lines(text: Option<&str>) -> Vec<&str> {
    match text {
        Some(t) if !t.is_empty() => LINES.split(t).collect(),
        _ => Vec::new(),
    }
}

fn section_name(line: &str) -> Option<String> {
    SECTION
        .captures(line)
        .map(|m| m[1].trim().to_string())
}

fn param(line: &str) -> Option<(&str, &str)> {
    PARAM.captures(line).map(|m| {
        let (k, v) = (m.get(1).unwrap(), m.get(2).unwrap());
        (k.as_str(), v.as_str())
    })
}

/// Parse configuration text.  Lines that are neither a section header
/// nor a `key = value` pair are ignored.
pub fn parse(text: Option<&str>) -> KeyFileData {
    let mut data = KeyFileData::new();
    let mut section: Option<String> = None;
    for line in split_lines(text) {
        if let Some((k, v)) = param(line) {
            let (k, v) = (k.to_string(), v.to_string());
            match section.as_ref() {
                Some(s) => {
                    if let Some(Entry::Section(m)) = data.get_mut(s) {
                        m.insert(k, v);
                    }
                }
                None => {
                    data.insert(k, Entry::Value(v));
                }
            }
        } else if let Some(name) = section_name(line) {
            data.insert(name.clone(), Entry::Section(BTreeMap::new()));
            section = Some(name);
        }
    }
    data
}

/// Return the named section of parsed data, if present.
pub fn section<'a>(data: &'a KeyFileData, name: &str) -> Option<&'a BTreeMap<String, String>> {
    match data.get(name) {
        Some(Entry::Section(m)) => Some(m),
        _ => None,
    }
}

/// A change to one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Set(String),
    Bool(bool),
    Remove,
}

impl Change {
    fn render(&self) -> Option<String> {
        match self {
            Change::Set(s) if s.is_empty() => None,
            Change::Set(s) => Some(s.clone()),
            Change::Bool(b) => Some(b.to_string()),
            Change::Remove => None,
        }
    }
}

/// An ordered set of changes to apply to one section.  New keys are
/// appended in the order they were added here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes(Vec<(String, Change)>);

impl Changes {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, key: &str, change: Change) -> Self {
        self.0.retain(|(k, _)| k != key);
        self.0.push((key.to_string(), change));
        self
    }

    pub fn set(self, key: &str, value: impl Into<String>) -> Self {
        self.push(key, Change::Set(value.into()))
    }

    pub fn set_bool(self, key: &str, value: bool) -> Self {
        self.push(key, Change::Bool(value))
    }

    pub fn remove(self, key: &str) -> Self {
        self.push(key, Change::Remove)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn take(&mut self, key: &str) -> Option<Change> {
        let i = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(i).1)
    }
}

fn format_option(key: &str, value: &str) -> String {
    format!("{key} = {value}")
}

/// Apply `changes` to `section` of the configuration `text`.
///
/// Existing keys in the section are replaced in place or deleted; keys
/// not already present are appended to the end of the section, which is
/// created at the end of the text if missing.  Everything after the
/// section is kept verbatim.
pub fn rewrite(text: Option<&str>, section: &str, changes: &Changes) -> String {
    let lines = split_lines(text);
    let mut remaining = changes.clone();
    let mut in_section = false;
    let mut output = String::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let mut replaced: Option<Option<String>> = None;
        if let Some(name) = section_name(line) {
            // Leaving our section; the rest is copied below
            if in_section {
                break;
            }
            in_section = name == section;
        } else if in_section {
            if let Some((k, _)) = param(line) {
                replaced = match remaining.take(k) {
                    Some(Change::Remove) => Some(None),
                    Some(c) => Some(Some(format_option(k, &c.render().unwrap_or_default()))),
                    None => None,
                };
            }
        }

        match replaced {
            Some(Some(l)) => {
                output.push_str(&l);
                output.push('\n');
            }
            Some(None) => {}
            None => {
                output.push_str(line);
                output.push('\n');
            }
        }
        i += 1;
    }

    if !in_section {
        output.push_str(&format!("\n[{section}]\n"));
    }

    let appended: Vec<String> = remaining
        .0
        .iter()
        .filter_map(|(k, c)| c.render().map(|v| format_option(k, &v)))
        .collect();
    output.push_str(&appended.join("\n"));
    output.push_str("\n\n");

    if i < lines.len() {
        output.push_str(&lines[i..].join("\n"));
    }

    output
}
