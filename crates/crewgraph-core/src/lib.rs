//! Core types and error definitions for the crewgraph engine.
//!
//! This crate provides the foundational types shared across all crewgraph crates,
//! including the type registry, error handling, transcript messages, and tool
//! call abstractions.
//!
//! # Main types
//!
//! - [`Kind`] — Closed registry of semantic payload kinds with alias resolution.
//! - [`CrewError`] — Unified error enum for all crewgraph layers.
//! - [`CrewResult`] — Convenience alias for `Result<T, CrewError>`.
//! - [`Message`] — A transcript entry exchanged with the model.
//! - [`ToolCall`] / [`ToolResult`] — Tool invocation request and its typed result.

/// Error type shared by every crate.
pub mod error;
/// Type registry.
pub mod kind;
/// Transcript messages.
pub mod message;
/// Tracing subscriber setup.
pub mod telemetry;
/// Truncation helpers.
pub mod text;
/// Tool call and result types.
pub mod tool;

pub use error::{CrewError, CrewResult};
pub use kind::{categories, Kind, KindDef};
pub use message::{Message, Role};
pub use telemetry::{init_tracing, TelemetryConfig};
pub use text::{truncate_chars, TRUNCATION_MARKER};
pub use tool::{ToolCall, ToolResult};
