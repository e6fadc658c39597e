//! devroom-agent: the AI collaborator.
//!
//! The persona answers every prompt with a [`devroom_sdk::Directive`]: some
//! explanatory text, optionally a whole file-tree snapshot and the commands
//! to build and start it. The model sits behind [`llm::GenerativeModel`] so
//! tests can substitute a stub.

pub mod generator;
pub mod llm;
pub mod persona;

pub use generator::{DirectiveGenerator, UnconfiguredModel, UpstreamError, parse_directive};
pub use llm::{GeminiClient, GenerationRequest, GenerativeModel};
pub use persona::PersonaConfig;
