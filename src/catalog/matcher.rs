//! Implicit collection membership derived from shared tags.

use std::collections::HashSet;

use serde::Serialize;

use super::TagCase;
use crate::models::Collection;

/// A published collection sharing at least one tag with a product.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionMatch {
    pub collection: Collection,
    /// Shared tags, in the collection's tag order.
    pub matching_tags: Vec<String>,
}

/// Find the published collections whose tags intersect `product_tags`.
///
/// Input order is kept; there is no ranking. Empty inputs give an empty result.
pub fn match_collections(
    product_tags: &[String],
    collections: &[Collection],
    case: TagCase,
) -> Vec<CollectionMatch> {
    if product_tags.is_empty() {
        return Vec::new();
    }

    let wanted: HashSet<_> = product_tags.iter().map(|t| case.key(t)).collect();

    collections
        .iter()
        .filter(|c| c.published)
        .filter_map(|collection| {
            let mut seen = HashSet::new();
            let mut matching_tags = Vec::new();
            for tag in &collection.tags {
                let key = case.key(tag);
                if wanted.contains(&key) && seen.insert(key) {
                    matching_tags.push(tag.clone());
                }
            }

            (!matching_tags.is_empty()).then(|| CollectionMatch {
                collection: collection.clone(),
                matching_tags,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collection(id: &str, published: bool, tags: &[&str]) -> Collection {
        Collection {
            id: id.to_string(),
            title: id.to_uppercase(),
            slug: id.to_string(),
            icon: "box".to_string(),
            description: None,
            published,
            sort_order: 0,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
            version: 1,
        }
    }

    fn tags(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn ids(matches: &[CollectionMatch]) -> Vec<&str> {
        matches.iter().map(|m| m.collection.id.as_str()).collect()
    }

    #[test]
    fn test_product_matches_published_overlapping_collections() {
        let collections = vec![
            collection("a", true, &["stem", "robotics"]),
            collection("b", true, &["age-5", "crafts"]),
            collection("c", true, &["crafts"]),
            collection("d", false, &["stem"]),
        ];

        let matches =
            match_collections(&tags(&["stem", "age-5"]), &collections, TagCase::Sensitive);

        assert_eq!(ids(&matches), vec!["a", "b"]);
        assert_eq!(matches[0].matching_tags, tags(&["stem"]));
        assert_eq!(matches[1].matching_tags, tags(&["age-5"]));
    }

    #[test]
    fn test_empty_inputs_yield_nothing() {
        let collections = vec![collection("a", true, &["stem"])];
        assert!(match_collections(&[], &collections, TagCase::Sensitive).is_empty());
        assert!(match_collections(&tags(&["stem"]), &[], TagCase::Sensitive).is_empty());

        let unpublished = vec![collection("a", false, &["stem"])];
        assert!(match_collections(&tags(&["stem"]), &unpublished, TagCase::Sensitive).is_empty());
    }

    #[test]
    fn test_case_policy() {
        let collections = vec![collection("a", true, &["STEM"])];

        assert!(match_collections(&tags(&["stem"]), &collections, TagCase::Sensitive).is_empty());

        let matches = match_collections(&tags(&["stem"]), &collections, TagCase::Insensitive);
        assert_eq!(ids(&matches), vec!["a"]);
        assert_eq!(matches[0].matching_tags, tags(&["STEM"]));
    }

    #[test]
    fn test_repeated_collection_tags_reported_once() {
        let collections = vec![collection("a", true, &["stem", "stem", "art"])];
        let matches = match_collections(&tags(&["stem", "art"]), &collections, TagCase::Sensitive);
        assert_eq!(matches[0].matching_tags, tags(&["stem", "art"]));
    }

    #[test]
    fn test_matching_is_repeatable() {
        let collections = vec![
            collection("b", true, &["crafts"]),
            collection("a", true, &["crafts", "stem"]),
        ];
        let product = tags(&["crafts"]);

        let first = match_collections(&product, &collections, TagCase::Sensitive);
        let second = match_collections(&product, &collections, TagCase::Sensitive);

        assert_eq!(ids(&first), vec!["b", "a"]);
        assert_eq!(ids(&first), ids(&second));
    }
}
