//! Watch-list matching.
//!
//! Watched domains are stored in a [`DomainTrie`] keyed by reversed labels
//! (`a.example.com` is stored as `com -> example -> a`). A query matches when
//! any node on its reversed path is terminal, so a watched domain covers itself
//! and every subdomain below it.
//!
//! [`DomainMatcher`] owns the active trie behind an [`ArcSwap`]. A reload
//! builds a complete new trie off to the side and swaps it in with one store;
//! readers load a snapshot `Arc` and traverse it without taking any lock.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use hickory_proto::rr::Name;
use tracing::{debug, trace};

use crate::error::LoadError;

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<Box<str>, TrieNode>,
    terminal: bool,
}

/// Immutable-once-built set of watched domains.
#[derive(Debug, Default)]
pub struct DomainTrie {
    root: TrieNode,
    len: usize,
}

impl DomainTrie {
    /// Create an empty trie.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a domain given as normalized labels in natural order
    /// (`["a", "example", "com"]`). Returns `false` if it was already present.
    pub fn insert<S: AsRef<str>>(&mut self, labels: &[S]) -> bool {
        let mut node = &mut self.root;
        for label in labels.iter().rev() {
            node = node.children.entry(label.as_ref().into()).or_default();
        }

        if node.terminal {
            return false;
        }
        node.terminal = true;
        self.len += 1;
        true
    }

    /// Whether `domain` equals a watched domain or is a subdomain of one.
    ///
    /// `domain` must already be lowercase without a trailing dot.
    pub fn covers(&self, domain: &str) -> bool {
        if domain.is_empty() {
            return false;
        }

        let mut node = &self.root;
        for label in domain.rsplit('.') {
            match node.children.get(label) {
                Some(next) if next.terminal => return true,
                Some(next) => node = next,
                None => return false,
            }
        }
        false
    }

    /// Number of distinct watched domains.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Outcome of a successful watch-list load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    /// Distinct domains now active.
    pub accepted: usize,
    /// Blank, comment, malformed and duplicate lines.
    pub skipped: usize,
}

/// Classification of a single watch-list line.
#[derive(Debug, PartialEq, Eq)]
pub enum Line {
    /// Empty or `#` comment.
    Blank,
    /// A valid domain as lowercase labels in natural order.
    Domain(Vec<String>),
    /// Not a usable domain name.
    Invalid,
}

/// Parse one watch-list line.
pub fn parse_line(line: &str) -> Line {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Line::Blank;
    }
    if line.contains(char::is_whitespace) {
        return Line::Invalid;
    }

    let name = match Name::from_ascii(line) {
        Ok(name) => name,
        Err(_) => return Line::Invalid,
    };
    if name.is_root() || name.is_wildcard() {
        return Line::Invalid;
    }

    let mut labels = Vec::with_capacity(name.num_labels() as usize);
    for label in name.iter() {
        let label = String::from_utf8_lossy(label).to_ascii_lowercase();
        if label.is_empty() || label.contains('.') {
            return Line::Invalid;
        }
        labels.push(label);
    }
    Line::Domain(labels)
}

/// Lowercase a queried domain and strip a trailing dot.
pub fn normalize(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Hot-reloadable watch-list matcher.
#[derive(Debug, Default)]
pub struct DomainMatcher {
    active: ArcSwap<DomainTrie>,
}

impl DomainMatcher {
    /// Create a matcher with an empty watch-list. Nothing matches.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a matcher from an in-memory list.
    pub fn from_domains<S: AsRef<str>>(domains: &[S]) -> Self {
        let matcher = Self::new();
        // Infallible: no IO is involved.
        let _ = matcher.load(domains.iter().map(|d| Ok::<_, io::Error>(d.as_ref())));
        matcher
    }

    /// Replace the active watch-list with `lines`.
    ///
    /// The new trie is published only if every line could be read; on an
    /// error the previous trie keeps serving.
    pub fn load<I, S>(&self, lines: I) -> Result<LoadStats, LoadError>
    where
        I: IntoIterator<Item = io::Result<S>>,
        S: AsRef<str>,
    {
        let mut trie = DomainTrie::new();
        let mut skipped = 0;

        for line in lines {
            let line = line?;
            match parse_line(line.as_ref()) {
                Line::Domain(labels) => {
                    if !trie.insert(&labels) {
                        trace!(line = line.as_ref(), "duplicate watch-list entry");
                        skipped += 1;
                    }
                }
                Line::Blank => skipped += 1,
                Line::Invalid => {
                    debug!(line = line.as_ref(), "skipping malformed watch-list entry");
                    skipped += 1;
                }
            }
        }

        let stats = LoadStats {
            accepted: trie.len(),
            skipped,
        };
        self.active.store(Arc::new(trie));
        Ok(stats)
    }

    /// Replace the active watch-list with the contents of a file.
    pub fn load_file(&self, path: &Path) -> Result<LoadStats, LoadError> {
        let file = File::open(path)?;
        self.load(BufReader::new(file).lines())
    }

    /// Whether `domain` is watched, directly or via an ancestor.
    pub fn is_match(&self, domain: &str) -> bool {
        let trie = self.active.load();
        trie.covers(&normalize(domain))
    }

    /// Number of distinct watched domains currently active.
    pub fn count(&self) -> usize {
        self.active.load().len()
    }
}
