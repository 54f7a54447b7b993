//! imgshield library
//!
//! An image-fetch proxy for attacker-influenced URLs: every hop of a fetch is
//! validated against private address space before any connection is made,
//! and only bounded, signature-checked image bytes are relayed back.

pub mod cli;
pub mod config;
pub mod logging;
pub mod media;
pub mod server;
pub mod ssrf;
