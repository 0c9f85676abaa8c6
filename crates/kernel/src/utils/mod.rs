//! This mod is a wrapper around the [`portal_utils`] crate
//! with a few kernel-side additions

pub mod locks;

pub use portal_utils::types;
