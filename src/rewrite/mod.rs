//! Rewrite engine
//!
//! Pure transformations applied by a rule to requests and responses:
//! - URL-scoped body and prefix substitution
//! - Header injection
//! - Content-encoding aware body transcoding

pub mod encoding;
pub mod headers;
pub mod substitute;

pub use encoding::ContentEncoding;
pub use headers::{apply_headers, HeaderOp, HeaderRule, HeaderValueSource};
pub use substitute::{substitute, substitute_bytes, ReplaceMode, Replacement};
