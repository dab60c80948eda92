// src/services/mod.rs

//! Service layer for the collection daemon.
//!
//! This module contains the provider-facing machinery:
//! - Egress address routing (`EgressRouter`)
//! - Classified HTTP transport (`ProviderTransport`)
//! - Feed walking and review extraction (`FeedCollector`)

mod collector;
mod egress;
mod transport;

pub use collector::{FeedCollector, ReviewCollector};
pub use egress::EgressRouter;
pub use transport::ProviderTransport;

/// Trim upstream error text to a storable length, on a char boundary.
pub(crate) fn truncate_detail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
