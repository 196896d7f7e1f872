//! Catalog domain logic.
//!
//! Pure rules over collections, products and tags. Nothing in here talks to
//! HTTP; the only store access goes through the [`LinkStore`] trait.

mod confirm;
mod linked;
mod listing;
mod matcher;
mod slug;
mod tags;

pub use confirm::*;
pub use linked::*;
pub use listing::*;
pub use matcher::*;
pub use slug::*;
pub use tags::*;
