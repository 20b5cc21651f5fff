//! # deckforge
//!
//! Backend that renders illustrated slide decks through pluggable image
//! providers.
//!
//! ## Flow
//! 1. A client posts the deck pages to `/api/generate`
//! 2. The cover is rendered first and kept as reference image
//! 3. Content pages are rendered one by one or through a bounded worker pool
//! 4. Progress streams back as server-sent events
//! 5. The task directory is synced into the deck's history record
//!
//! ## Modules
//! - `generation`: the page pipeline and its retries
//! - `generator`: image provider adapters
//! - `providers`: provider configuration and runtime overrides
//! - `tasks`: in-memory task state with idle eviction
//! - `history`: history records (local files or Supabase) and exports
//! - `api`: HTTP surface

pub mod api;
pub mod config;
pub mod generation;
pub mod generator;
pub mod history;
pub mod imaging;
pub mod providers;
pub mod supabase;
pub mod tasks;

pub use config::Config;
