//! Speech synthesis engines.
//!
//! This module contains implementations of text-to-speech engines.
//!
//! # Available Engines
//!
//! Enable engines via Cargo features:
//! - `vits` - VITS / Piper voices (ONNX format, libespeak-ng loaded at runtime)

#[cfg(feature = "vits")]
pub mod vits;
