//! zimage_daemon - HTTP server for image generation
//!
//! This crate provides the daemon server that:
//! - Loads the model once before accepting traffic
//! - Exposes `POST /generate`, `GET /status` and `GET /health`
//! - Maps each core error kind to its own status code

pub mod api;
pub mod server;
pub mod state;

pub use server::{run_server, serve};
pub use state::AppState;
