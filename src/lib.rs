//! Generates perceptually distinct variants of source images.
//!
//! Each source is transformed repeatedly with small randomized recipes; a
//! candidate is kept only when its perceptual fingerprint is far enough from
//! the original and from every variant accepted before it.

pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod fingerprint;
pub mod hasher;
pub mod inspect;
pub mod io;
pub mod manifest;
pub mod post;
pub mod recipe;
pub mod transform;

pub use error::{Result, VariantError};
