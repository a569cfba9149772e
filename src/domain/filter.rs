//! Opaque filter predicates
//!
//! The federation core never looks inside a filter: it only hands it to
//! sources and to the cache store, which evaluate it against metacards.

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;

use super::types::Metacard;

/// Predicate over metacards
pub trait Filter: Debug + Send + Sync {
    fn matches(&self, metacard: &Metacard) -> bool;
}

/// Matches every metacard
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchAll;

impl Filter for MatchAll {
    fn matches(&self, _metacard: &Metacard) -> bool {
        true
    }
}

/// Matches metacards whose id is in the set
#[derive(Debug, Clone)]
pub struct IdIn {
    ids: BTreeSet<String>,
}

impl IdIn {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }
}

impl Filter for IdIn {
    fn matches(&self, metacard: &Metacard) -> bool {
        self.ids.contains(&metacard.id)
    }
}

/// Exact attribute match
#[derive(Debug, Clone)]
pub struct AttributeEquals {
    name: String,
    value: serde_json::Value,
}

impl AttributeEquals {
    pub fn new(name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

impl Filter for AttributeEquals {
    fn matches(&self, metacard: &Metacard) -> bool {
        metacard.attribute(&self.name).as_ref() == Some(&self.value)
    }
}

/// Case-insensitive substring match on the title
#[derive(Debug, Clone)]
pub struct TitleContains {
    needle: String,
}

impl TitleContains {
    pub fn new(needle: impl AsRef<str>) -> Self {
        Self {
            needle: needle.as_ref().to_lowercase(),
        }
    }
}

impl Filter for TitleContains {
    fn matches(&self, metacard: &Metacard) -> bool {
        metacard
            .title
            .as_deref()
            .map(|t| t.to_lowercase().contains(&self.needle))
            .unwrap_or(false)
    }
}

/// Conjunction; an empty conjunction matches everything
#[derive(Debug, Clone)]
pub struct And {
    filters: Vec<Arc<dyn Filter>>,
}

impl And {
    pub fn new(filters: Vec<Arc<dyn Filter>>) -> Self {
        Self { filters }
    }
}

impl Filter for And {
    fn matches(&self, metacard: &Metacard) -> bool {
        self.filters.iter().all(|f| f.matches(metacard))
    }
}

/// Shared match-all filter
pub fn match_all() -> Arc<dyn Filter> {
    Arc::new(MatchAll)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attribute_equals_resolves_well_known_fields() {
        let card = Metacard::new("doc-1", "alpha").with_attribute("format", json!("pdf"));

        assert!(AttributeEquals::new("source-id", json!("alpha")).matches(&card));
        assert!(AttributeEquals::new("format", json!("pdf")).matches(&card));
        assert!(!AttributeEquals::new("format", json!("xml")).matches(&card));
        assert!(!AttributeEquals::new("missing", json!("pdf")).matches(&card));
    }

    #[test]
    fn test_title_contains_ignores_case() {
        let card = Metacard::new("doc-1", "alpha").with_title("Harbor Survey 2024");
        assert!(TitleContains::new("harbor").matches(&card));
        assert!(!TitleContains::new("river").matches(&card));
        assert!(!TitleContains::new("x").matches(&Metacard::new("untitled", "alpha")));
    }

    #[test]
    fn test_and_combines() {
        let card = Metacard::new("doc-1", "alpha").with_title("Harbor");
        let both = And::new(vec![
            Arc::new(IdIn::new(["doc-1"])),
            Arc::new(TitleContains::new("harb")),
        ]);
        assert!(both.matches(&card));

        let one_fails = And::new(vec![Arc::new(IdIn::new(["doc-2"])), match_all()]);
        assert!(!one_fails.matches(&card));

        assert!(And::new(vec![]).matches(&card));
    }
}
