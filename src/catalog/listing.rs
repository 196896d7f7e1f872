//! Collection product listing helpers.

use serde::Serialize;

use crate::models::ProductImage;

pub const DEFAULT_PER_PAGE: usize = 12;
pub const MAX_PER_PAGE: usize = 100;

/// The image shown for a product: the first flagged primary, else the first one.
pub fn primary_image(images: &[ProductImage]) -> Option<&ProductImage> {
    images
        .iter()
        .find(|img| img.is_primary)
        .or_else(|| images.first())
}

/// One page of an already fetched list.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub total_pages: usize,
}

/// Slice `items` into 1-based pages.
///
/// Pages past the end come back empty; `per_page` is clamped to
/// `1..=MAX_PER_PAGE`.
pub fn paginate<T>(items: Vec<T>, page: Option<usize>, per_page: Option<usize>) -> Page<T> {
    let per_page = per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
    let page = page.unwrap_or(1).max(1);
    let total = items.len();
    let total_pages = total.div_ceil(per_page);

    let start = (page - 1).saturating_mul(per_page);
    let items = items.into_iter().skip(start).take(per_page).collect();

    Page {
        items,
        page,
        per_page,
        total,
        total_pages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(id: &str, is_primary: bool, position: i64) -> ProductImage {
        ProductImage {
            id: id.to_string(),
            url: format!("https://cdn.example.com/{}.jpg", id),
            is_primary,
            position,
        }
    }

    #[test]
    fn test_primary_image_prefers_flag() {
        let images = vec![image("a", false, 0), image("b", true, 1), image("c", true, 2)];
        assert_eq!(primary_image(&images).unwrap().id, "b");
    }

    #[test]
    fn test_primary_image_falls_back_to_first() {
        let images = vec![image("a", false, 0), image("b", false, 1)];
        assert_eq!(primary_image(&images).unwrap().id, "a");
        assert!(primary_image(&[]).is_none());
    }

    #[test]
    fn test_paginate() {
        let items: Vec<u32> = (1..=25).collect();

        let first = paginate(items.clone(), None, Some(10));
        assert_eq!(first.items, (1..=10).collect::<Vec<_>>());
        assert_eq!(first.total, 25);
        assert_eq!(first.total_pages, 3);

        let last = paginate(items.clone(), Some(3), Some(10));
        assert_eq!(last.items, (21..=25).collect::<Vec<_>>());

        let beyond = paginate(items.clone(), Some(9), Some(10));
        assert!(beyond.items.is_empty());
        assert_eq!(beyond.page, 9);
    }

    #[test]
    fn test_paginate_clamps() {
        let items: Vec<u32> = (1..=5).collect();

        let page = paginate(items.clone(), Some(0), Some(0));
        assert_eq!(page.page, 1);
        assert_eq!(page.per_page, 1);
        assert_eq!(page.items, vec![1]);

        let page = paginate(items, None, Some(10_000));
        assert_eq!(page.per_page, MAX_PER_PAGE);
        assert_eq!(page.total_pages, 1);

        let empty = paginate(Vec::<u32>::new(), None, None);
        assert_eq!(empty.total_pages, 0);
    }
}
