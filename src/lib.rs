// ABOUTME: Root library module for the tether binary
// ABOUTME: Exposes the MCP layer and re-exports the engine crate

pub mod mcp;

pub use tether_core::{Config, Engine, Error, HttpHomeserver};
