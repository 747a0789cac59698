//! Recording session built on the encoding pipeline.
//!
//! Data Flow:
//! ```text
//! TestPatternSource ──(pull)──┐
//!                             ├─► Pipeline ─► Encoder ─► read() ─► output file
//! surface producer ──(push)───┘
//! ```

pub mod session;
pub mod synthetic;
pub mod types;
