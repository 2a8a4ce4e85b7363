//! Segmentation backends
//!
//! - Tract (pure Rust ONNX inference, default)
//! - ONNX Runtime (optional, GPU acceleration)
//! - Remote HTTP endpoint
//! - Scripted (preset results)

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "tract")]
pub mod tract;

pub mod remote;
pub mod scripted;

#[cfg(feature = "onnx")]
pub use self::onnx::OnnxBackend;

#[cfg(feature = "tract")]
pub use self::tract::TractBackend;

pub use self::remote::RemoteBackend;
pub use self::scripted::ScriptedBackend;
