//! The persisted `key=value` configuration/state file format described in
//! spec.md §6, grounded on `daemonlib/conf_file.c`.
//!
//! Lines are either blank, a `#`-prefixed comment, or a `key=value` pair.
//! Unknown keys round-trip unchanged; when a key appears more than once
//! the last occurrence wins on read, and is the one rewritten on write.

use std::fs;
use std::io;
use std::path::Path;

#[cfg(windows)]
const EOL: &str = "\r\n";
#[cfg(not(windows))]
const EOL: &str = "\n";

#[derive(Debug, Clone)]
enum Line {
    Blank,
    Comment(String),
    Entry { key: String, value: String },
}

/// An in-memory, order-preserving view of a conf file.
#[derive(Debug, Clone, Default)]
pub struct ConfFile {
    lines: Vec<Line>,
}

impl ConfFile {
    pub fn new() -> ConfFile {
        ConfFile { lines: Vec::new() }
    }

    /// Reads and parses a conf file. A missing file parses as empty, the
    /// same way `conf_file_read` tolerates a fresh install with no state
    /// yet written.
    pub fn read<P: AsRef<Path>>(path: P) -> io::Result<ConfFile> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(ConfFile::new()),
            Err(err) => return Err(err),
        };

        let mut conf = ConfFile::new();

        for raw_line in contents.lines() {
            let trimmed = raw_line.trim();

            if trimmed.is_empty() {
                conf.lines.push(Line::Blank);
            } else if trimmed.starts_with('#') {
                conf.lines.push(Line::Comment(raw_line.to_string()));
            } else if let Some(pos) = trimmed.find('=') {
                let key = trimmed[..pos].trim().to_string();
                let value = trimmed[pos + 1..].trim().to_string();
                conf.lines.push(Line::Entry { key, value });
            } else {
                // Unparseable line, preserve it verbatim as a comment so
                // it survives a rewrite instead of being silently lost.
                conf.lines.push(Line::Comment(raw_line.to_string()));
            }
        }

        Ok(conf)
    }

    /// Returns the value for `key`, the last occurrence winning if the
    /// key was set more than once.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines
            .iter()
            .rev()
            .find_map(|line| match line {
                Line::Entry { key: k, value } if k == key => Some(value.as_str()),
                _ => None,
            })
    }

    /// Sets `key` to `value`, updating the last existing occurrence in
    /// place or appending a new entry if the key is not present yet.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();

        if let Some(line) = self.lines.iter_mut().rev().find(|line| {
            matches!(line, Line::Entry { key: k, .. } if k == key)
        }) {
            if let Line::Entry { value: v, .. } = line {
                *v = value;
            }
            return;
        }

        self.lines.push(Line::Entry {
            key: key.to_string(),
            value,
        });
    }

    /// Writes the file back out, preserving comments, blank lines and
    /// unrecognized keys exactly as they were read.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut out = String::new();

        for line in &self.lines {
            match line {
                Line::Blank => {}
                Line::Comment(text) => out.push_str(text),
                Line::Entry { key, value } => {
                    out.push_str(key);
                    out.push('=');
                    out.push_str(value);
                }
            }
            out.push_str(EOL);
        }

        fs::write(path, out)
    }
}
