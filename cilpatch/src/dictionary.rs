//! Translation dictionary and pending-key log formats.
//!
//! These are the flat files the runtime hook consumes and produces; the
//! patcher itself never reads them, but any tooling around the hook must
//! stay byte-compatible:
//!
//! - **Dictionary**: line-oriented UTF-8, `#` comment lines and blank lines
//!   ignored, first `\t` splits key from value (`=` accepted as a fallback
//!   separator), keys trimmed, later duplicates win, `\n`/`\\` escapes in
//!   values, raw embedded newlines disallowed.
//! - **Pending log**: append-only `key<TAB>raw` lines with `\r`/`\n`/`\\`
//!   escaped, one line per previously-unseen key.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::Result;

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\r', "\\r")
        .replace('\n', "\\n")
}

/// An in-memory translation dictionary.
#[derive(Debug, Default)]
pub struct TranslationDictionary {
    entries: HashMap<String, String>,
}

impl TranslationDictionary {
    /// An empty dictionary.
    #[must_use]
    pub fn new() -> TranslationDictionary {
        TranslationDictionary::default()
    }

    /// Parse dictionary text.
    #[must_use]
    pub fn from_str(text: &str) -> TranslationDictionary {
        let mut entries = HashMap::new();
        for line in text.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once('\t') {
                Some(pair) => pair,
                None => match line.split_once('=') {
                    Some(pair) => pair,
                    None => continue,
                },
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            // Later duplicates win, matching reload-in-place semantics.
            entries.insert(key.to_string(), unescape(value));
        }
        TranslationDictionary { entries }
    }

    /// Load a dictionary file.
    pub fn load(path: &Path) -> Result<TranslationDictionary> {
        let text = fs::read_to_string(path)?;
        let dict = Self::from_str(&text);
        log::info!("loaded {} translations from {}", dict.len(), path.display());
        Ok(dict)
    }

    /// Look up a translation by key.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Insert or replace an entry.
    pub fn insert(&mut self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize as sorted `key<TAB>value` lines with escapes applied.
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut keys: Vec<&String> = self.entries.keys().collect();
        keys.sort();
        let mut out = String::new();
        for key in keys {
            out.push_str(&escape(key));
            out.push('\t');
            out.push_str(&escape(&self.entries[key]));
            out.push('\n');
        }
        out
    }

    /// Write a sorted snapshot to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_text())?;
        Ok(())
    }
}

/// Append-only log of untranslated keys, deduplicated in memory.
#[derive(Debug)]
pub struct PendingLog {
    path: PathBuf,
    seen: HashSet<String>,
}

impl PendingLog {
    /// Open a pending log, loading already-recorded keys for dedup.
    pub fn open(path: &Path) -> Result<PendingLog> {
        let mut seen = HashSet::new();
        if path.is_file() {
            for line in fs::read_to_string(path)?.lines() {
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let key = line.split('\t').next().unwrap_or(line);
                seen.insert(unescape(key));
            }
        }
        Ok(PendingLog {
            path: path.to_path_buf(),
            seen,
        })
    }

    /// Record an untranslated key with its raw text. Returns true when the
    /// key was new and a line was appended.
    pub fn record(&mut self, key: &str, raw: &str) -> Result<bool> {
        if !self.seen.insert(key.to_string()) {
            return Ok(false);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}\t{}", escape(key), escape(raw))?;
        Ok(true)
    }

    /// Keys recorded so far (including ones loaded at open).
    #[must_use]
    pub fn keys(&self) -> &HashSet<String> {
        &self.seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tab_and_equals_separators() {
        let dict = TranslationDictionary::from_str(
            "# comment line\n\
             Hello\t안녕하세요\n\
             Goodbye=안녕히 가세요\n\
             \n\
             Malformed line without separator\n",
        );
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.lookup("Hello"), Some("안녕하세요"));
        assert_eq!(dict.lookup("Goodbye"), Some("안녕히 가세요"));
    }

    #[test]
    fn test_later_duplicate_wins_and_keys_are_trimmed() {
        let dict = TranslationDictionary::from_str("Key\tfirst\n  Key \tsecond\n");
        assert_eq!(dict.lookup("Key"), Some("second"));
    }

    #[test]
    fn test_multiline_value_never_emits_raw_newlines() {
        let mut dict = TranslationDictionary::new();
        dict.insert("Key", "줄 하나\n줄 둘\\끝");
        let text = dict.to_text();
        // One line per entry; the embedded newline must come out escaped.
        assert_eq!(text.matches('\n').count(), 1);

        let reloaded = TranslationDictionary::from_str(&text);
        assert_eq!(reloaded.lookup("Key"), Some("줄 하나\n줄 둘\\끝"));
    }

    #[test]
    fn test_value_unescaping_on_load() {
        let dict = TranslationDictionary::from_str("K\t줄 하나\\n줄 둘\\\\끝\n");
        assert_eq!(dict.lookup("K"), Some("줄 하나\n줄 둘\\끝"));
    }

    #[test]
    fn test_pending_log_dedupes_and_escapes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pending.tsv");

        let mut log = PendingLog::open(&path)?;
        assert!(log.record("Hello", "Hello\r\nWorld")?);
        assert!(!log.record("Hello", "Hello")?);
        assert!(log.record("Second", "Second")?);

        let text = fs::read_to_string(&path)?;
        assert_eq!(text, "Hello\tHello\\r\\nWorld\nSecond\tSecond\n");

        // Reopening restores the dedup set.
        let mut reopened = PendingLog::open(&path)?;
        assert!(!reopened.record("Hello", "again")?);
        assert_eq!(reopened.keys().len(), 2);
        Ok(())
    }
}
