use serde::{Deserialize, Serialize};

use crate::types::AttributeName;

/// Escapes a value before it is interpolated into a filter.
///
/// Done in a single pass so that the backslashes introduced for one character
/// are never escaped again.
pub fn escape_filter_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' => escaped.push_str("\\2a"),
            '(' => escaped.push_str("\\28"),
            ')' => escaped.push_str("\\29"),
            '\\' => escaped.push_str("\\5c"),
            '\0' => escaped.push_str("\\00"),
            '/' => escaped.push_str("\\2f"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// A directory search predicate.
///
/// Values are kept unescaped; escaping happens once, when the filter is
/// rendered. Two filters are considered the same cache key iff their rendered
/// strings are equal.
#[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
pub enum SearchFilter {
    And(Vec<SearchFilter>),
    Or(Vec<SearchFilter>),
    Not(Box<SearchFilter>),
    Equality(AttributeName, String),
    Present(AttributeName),
    // Pre-rendered filter coming from configuration, used verbatim.
    Raw(String),
}

impl SearchFilter {
    pub fn equality(attribute: impl Into<AttributeName>, value: impl Into<String>) -> Self {
        Self::Equality(attribute.into(), value.into())
    }

    /// Disjunction of `filters`; a single filter is returned as is.
    pub fn any_of(filters: impl IntoIterator<Item = SearchFilter>) -> Self {
        let mut filters: Vec<_> = filters.into_iter().collect();
        if filters.len() == 1 {
            filters.pop().unwrap_or(Self::Or(Vec::new()))
        } else {
            Self::Or(filters)
        }
    }

    /// Conjunction of `filters`, flattening nested conjunctions. A single
    /// filter is returned as is.
    pub fn all_of(filters: impl IntoIterator<Item = SearchFilter>) -> Self {
        let mut flattened = Vec::new();
        for filter in filters {
            match filter {
                Self::And(inner) => flattened.extend(inner),
                other => flattened.push(other),
            }
        }
        if flattened.len() == 1 {
            flattened.pop().unwrap_or(Self::And(Vec::new()))
        } else {
            Self::And(flattened)
        }
    }

    /// Restricts `self` to the entries selected by a configured base filter.
    pub fn merged_with_base(self, base: &str) -> Self {
        if base.trim().is_empty() {
            self
        } else {
            Self::all_of([Self::Raw(base.to_owned()), self])
        }
    }
}

impl std::fmt::Display for SearchFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchFilter::And(filters) => {
                f.write_str("(&")?;
                for filter in filters {
                    write!(f, "{filter}")?;
                }
                f.write_str(")")
            }
            SearchFilter::Or(filters) => {
                f.write_str("(|")?;
                for filter in filters {
                    write!(f, "{filter}")?;
                }
                f.write_str(")")
            }
            SearchFilter::Not(filter) => write!(f, "(!{filter})"),
            SearchFilter::Equality(attribute, value) => {
                write!(f, "({}={})", attribute, escape_filter_value(value))
            }
            SearchFilter::Present(attribute) => write!(f, "({attribute}=*)"),
            SearchFilter::Raw(raw) => {
                let raw = raw.trim();
                if raw.starts_with('(') {
                    f.write_str(raw)
                } else {
                    write!(f, "({raw})")
                }
            }
        }
    }
}

/// Checks that a configured filter has balanced, non-empty parentheses.
pub fn is_well_formed(raw: &str) -> bool {
    let raw = raw.trim();
    if raw.is_empty() {
        return false;
    }
    let mut depth = 0usize;
    let mut previous = None;
    for c in raw.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                if depth == 0 || previous == Some('(') {
                    return false;
                }
                depth -= 1;
            }
            _ => {}
        }
        previous = Some(c);
    }
    depth == 0
}
