//! Streaming inference providers for Rosiwit.
//!
//! All providers implement the `rosiwit_core::Provider` trait and emit
//! raw, unassembled chunks.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;
