//! Server-side call chain: tagging, logging and panic recovery as tower layers.

pub mod chain;
pub mod logging;
pub mod recovery;
pub mod tagging;

pub use chain::{CallChain, ServerLayer, ServerService};
pub use logging::{LogLayer, code_to_level};
pub use recovery::RecoveryLayer;
pub use tagging::{CallTags, REQUEST_ID_HEADER, TagLayer};
