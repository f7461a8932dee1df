//! Chat backend for models that speak the harmony format
//!
//! The model writes plain text interleaved with control tokens. This crate
//! turns that stream into typed conversation turns, forwards visible content
//! as it arrives, runs tool calls the model makes and feeds their results
//! back until the model gives a final answer.

pub mod config;
pub mod conversation;
pub mod core;
pub mod harmony;
pub mod providers;
pub mod routes;
pub mod tools;
