//! Content categories and their ordered source endpoints.

use crate::gateway::validator::MediaKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Position of an endpoint inside its category's chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    /// First endpoint, tried with the full retry budget
    Primary,
    /// Alternate endpoint; the index is its position among fallbacks
    Fallback(usize),
}

/// One upstream endpoint of a category
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEndpoint {
    /// Endpoint URL, fetched with HTTP GET
    pub url: String,
    /// Primary or fallback
    pub role: EndpointRole,
    /// Whether results must pass the content validator
    pub requires_format_check: bool,
}

/// A named content bucket mapping to a fixed endpoint list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Category {
    /// Name used in `/fetch <name>`
    pub name: String,
    /// Media kind delivered resources must have
    #[serde(default)]
    pub kind: MediaKind,
    /// Endpoints, primary first
    pub endpoints: Vec<String>,
    /// Static resource returned when every endpoint fails
    #[serde(default)]
    pub last_resort: Option<String>,
    /// Caption attached on delivery
    #[serde(default)]
    pub caption: Option<String>,
}

impl Category {
    /// Ordered endpoint chain: `[primary, fallback_1 .. fallback_n]`
    #[must_use]
    pub fn chain(&self) -> Vec<SourceEndpoint> {
        let requires_format_check = self.kind.requires_check();
        self.endpoints
            .iter()
            .enumerate()
            .map(|(index, url)| SourceEndpoint {
                url: url.clone(),
                role: if index == 0 {
                    EndpointRole::Primary
                } else {
                    EndpointRole::Fallback(index - 1)
                },
                requires_format_check,
            })
            .collect()
    }

    /// Caption used on delivery, falling back to the category name
    #[must_use]
    pub fn caption(&self) -> &str {
        self.caption.as_deref().unwrap_or(&self.name)
    }
}

/// Immutable set of categories, keyed by lowercase name
#[derive(Debug, Clone, Default)]
pub struct SourceCatalog {
    categories: BTreeMap<String, Category>,
}

impl SourceCatalog {
    /// Build a catalog; later duplicates replace earlier ones
    pub fn new(categories: impl IntoIterator<Item = Category>) -> Self {
        let categories = categories
            .into_iter()
            .map(|category| (category.name.to_lowercase(), category))
            .collect();
        Self { categories }
    }

    /// Look up a category by name, case-insensitively
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Category> {
        self.categories.get(&name.trim().to_lowercase())
    }

    /// Category names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.categories.values().map(|c| c.name.as_str())
    }

    /// Number of configured categories
    #[must_use]
    pub fn len(&self) -> usize {
        self.categories.len()
    }

    /// Whether the catalog has no categories
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn category(kind: MediaKind) -> Category {
        Category {
            name: "Hug".to_string(),
            kind,
            endpoints: vec![
                "https://a.test/hug".to_string(),
                "https://b.test/hug".to_string(),
                "https://c.test/hug".to_string(),
            ],
            last_resort: None,
            caption: None,
        }
    }

    #[test]
    fn test_chain_order_is_fixed() {
        let chain = category(MediaKind::Animated).chain();

        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].role, EndpointRole::Primary);
        assert_eq!(chain[1].role, EndpointRole::Fallback(0));
        assert_eq!(chain[2].role, EndpointRole::Fallback(1));
        assert_eq!(chain[2].url, "https://c.test/hug");
        assert!(chain.iter().all(|e| e.requires_format_check));
    }

    #[test]
    fn test_static_category_skips_format_check() {
        let chain = category(MediaKind::Static).chain();
        assert!(chain.iter().all(|e| !e.requires_format_check));
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let catalog = SourceCatalog::new([category(MediaKind::Animated)]);

        assert!(catalog.get("hug").is_some());
        assert!(catalog.get(" HUG ").is_some());
        assert!(catalog.get("pat").is_none());
        assert_eq!(catalog.names().collect::<Vec<_>>(), vec!["Hug"]);
    }

    #[test]
    fn test_caption_defaults_to_name() {
        assert_eq!(category(MediaKind::Any).caption(), "Hug");
    }
}
