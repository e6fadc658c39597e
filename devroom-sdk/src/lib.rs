//! devroom-sdk: wire types shared by the devroom server, agent and sandbox.
//!
//! - [`directive`]: the structured AI answer (text + file tree + commands)
//! - [`tree`]: whole-snapshot file trees
//! - [`event`]: realtime frames exchanged over the project channel

pub mod directive;
pub mod event;
pub mod tree;

pub use directive::{CommandSpec, Directive};
pub use event::{ClientEvent, ProjectMessage, SandboxStatus, SenderInfo, ServerEvent};
pub use tree::{FileNode, FileTree, TreeError};
