use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex, PoisonError,
};

use async_trait::async_trait;
use dirsearch_domain::{
    error::Result,
    filter::SearchFilter,
    types::{AttributeName, DirectoryEntry, RawEntry},
};
use dirsearch_domain_handlers::handler::{DirectoryGateway, SearchOptions};

// Attributes that match against the entry's own DN when the entry does not
// carry them explicitly.
const DN_ATTRIBUTES: [&str; 3] = ["distinguishedName", "entryDN", "dn"];

/// A directory held in memory that evaluates filters the way a server would
/// and records every query it answers.
#[derive(Default)]
pub struct InMemoryDirectory {
    entries: Vec<DirectoryEntry>,
    queries: Mutex<Vec<String>>,
    query_count: AtomicUsize,
}

impl InMemoryDirectory {
    pub fn new(entries: impl IntoIterator<Item = DirectoryEntry>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::SeqCst)
    }

    /// Rendered filters of the queries answered so far, in order.
    pub fn queries(&self) -> Vec<String> {
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset_queries(&self) {
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.query_count.store(0, Ordering::SeqCst);
    }

    pub fn matches(&self, entry: &DirectoryEntry, filter: &SearchFilter) -> bool {
        match filter {
            SearchFilter::And(filters) => filters.iter().all(|f| self.matches(entry, f)),
            SearchFilter::Or(filters) => filters.iter().any(|f| self.matches(entry, f)),
            SearchFilter::Not(filter) => !self.matches(entry, filter),
            SearchFilter::Equality(attribute, value) => values(entry, attribute)
                .iter()
                .any(|v| v.to_lowercase() == value.to_lowercase()),
            SearchFilter::Present(attribute) => !values(entry, attribute).is_empty(),
            SearchFilter::Raw(_) => parse_filter(&filter.to_string())
                .is_some_and(|parsed| self.matches(entry, &parsed)),
        }
    }
}

fn values<'a>(entry: &'a DirectoryEntry, attribute: &AttributeName) -> Vec<&'a str> {
    match entry.attribute_values(attribute) {
        Some(values) => values.iter().map(String::as_str).collect(),
        None if DN_ATTRIBUTES
            .iter()
            .any(|dn| AttributeName::from(*dn) == *attribute) =>
        {
            vec![entry.distinguished_name()]
        }
        None => Vec::new(),
    }
}

fn project(entry: &DirectoryEntry, attributes: &[AttributeName]) -> DirectoryEntry {
    if attributes.is_empty() {
        return entry.clone();
    }
    DirectoryEntry {
        dn: entry.dn.clone(),
        attributes: entry
            .attributes
            .iter()
            .filter(|(name, _)| attributes.contains(name))
            .map(|(name, values)| (name.clone(), values.clone()))
            .collect(),
    }
}

#[async_trait]
impl DirectoryGateway for InMemoryDirectory {
    type Entry = DirectoryEntry;

    async fn search(
        &self,
        filter: &SearchFilter,
        attributes: &[AttributeName],
        options: &SearchOptions,
    ) -> Result<Vec<DirectoryEntry>> {
        options.check_cancelled()?;
        self.query_count.fetch_add(1, Ordering::SeqCst);
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(filter.to_string());
        let mut found: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| self.matches(entry, filter))
            .map(|entry| project(entry, attributes))
            .collect();
        if let Some(limit) = options.size_limit {
            found.truncate(limit);
        }
        Ok(found)
    }
}

/// Parses a rendered filter such as `(&(objectClass=group)(cn=a\2ab))`.
/// Escaped values are decoded. Returns `None` on malformed input.
pub fn parse_filter(raw: &str) -> Option<SearchFilter> {
    let mut parser = Parser { input: raw.trim(), pos: 0 };
    let filter = parser.filter()?;
    (parser.pos == parser.input.len()).then_some(filter)
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn expect(&mut self, c: char) -> Option<()> {
        (self.peek()? == c).then(|| self.pos += c.len_utf8())
    }

    fn filter(&mut self) -> Option<SearchFilter> {
        self.expect('(')?;
        let filter = match self.peek()? {
            '&' => {
                self.pos += 1;
                SearchFilter::And(self.list()?)
            }
            '|' => {
                self.pos += 1;
                SearchFilter::Or(self.list()?)
            }
            '!' => {
                self.pos += 1;
                SearchFilter::Not(Box::new(self.filter()?))
            }
            _ => self.item()?,
        };
        self.expect(')')?;
        Some(filter)
    }

    fn list(&mut self) -> Option<Vec<SearchFilter>> {
        let mut filters = Vec::new();
        while self.peek()? == '(' {
            filters.push(self.filter()?);
        }
        Some(filters)
    }

    fn item(&mut self) -> Option<SearchFilter> {
        let rest = &self.input[self.pos..];
        let end = rest.find(')')?;
        let (attribute, value) = rest[..end].split_once('=')?;
        self.pos += end;
        if value == "*" {
            Some(SearchFilter::Present(attribute.into()))
        } else {
            Some(SearchFilter::equality(attribute, unescape(value)?))
        }
    }
}

fn unescape(value: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(value.len());
    let mut iter = value.bytes();
    while let Some(b) = iter.next() {
        if b == b'\\' {
            let hex = [iter.next()?, iter.next()?];
            let hex = std::str::from_utf8(&hex).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
        } else {
            bytes.push(b);
        }
    }
    String::from_utf8(bytes).ok()
}
