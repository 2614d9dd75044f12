//! Conversation documents
//!
//! Parses chat documents into ordered conversation units and renders them back.
//! Prompt text is kept verbatim, so a document can be completed several times:
//! units that already carry a completion are left untouched and only missing
//! completions are filled in.

pub mod types;
pub mod parser;
pub mod render;

// Re-export main types, the parser and the renderer
pub use types::*;
pub use parser::{ConversationParser, normalize_content};
pub use render::{render_document, failure_marker};
