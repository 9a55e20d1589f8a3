//! # PanSou Core
//!
//! The foundational types and pure functions for the PanSou search
//! aggregator.
//!
//! This crate is deliberately free of I/O: everything here is a deterministic
//! function over its inputs, so the execution kernel, the aggregator and
//! every upstream adapter can share one definition of the canonical result
//! shape and of what counts as a cloud-storage link.
//!
//! ## Core Components
//!
//! ### Result model
//! - [`SearchResult`], [`Link`]: the canonical hit and its share links
//! - [`PluginSearchResult`]: what a plugin hands back to the kernel
//! - [`SearchResponse`], [`MergedLink`]: the two response shapes
//!
//! ### Link classification
//! - [`CloudType`]: the provider classes plus `others`
//! - [`classify_url`]: URL → provider class, total and pure
//! - [`extract_cloud_links`]: mine every provider URL out of free text
//! - [`extract_password`]: share-password recovery from URLs and prose
//!
//! ### Filtering
//! - [`filter_results_by_keyword`]: AND-of-tokens keyword filter

pub mod classify;
pub mod extract;
pub mod filter;
pub mod model;

pub use classify::{classify_url, CloudType};
pub use extract::{extract_cloud_links, extract_password};
pub use filter::filter_results_by_keyword;
pub use model::{
    Ext, Link, MergedLink, MergedLinks, PluginSearchResult, SearchResponse, SearchResult,
};
