// ABOUTME: Configuration constants shared across Sandcastle packages
// ABOUTME: Re-exports the environment variable names recognised by the orchestration core

pub mod constants;

pub use constants::*;
