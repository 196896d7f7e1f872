//! Data models for the catalog backend.
//!
//! Field names serialize in camelCase to match the storefront and admin clients.

mod collection;
mod meta;
mod product;

pub use collection::*;
pub use meta::*;
pub use product::*;

use serde::{Deserialize, Deserializer};

/// Reads a present field as `Some`, so an explicit `null` becomes `Some(None)`.
///
/// Paired with `#[serde(default)]`, an absent field stays `None`.
fn nullable<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
