//! Upstream source access for hackcrawl.
//!
//! This crate provides:
//! - [`SourceClient`]: the paged listing + detail contract the engine consumes
//! - [`GraphqlSource`]: the production client (GraphQL listings, HTML detail pages)

pub mod graphql;
pub mod source;

pub use graphql::GraphqlSource;
pub use source::SourceClient;
