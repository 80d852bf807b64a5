//! Protocol implementations.
//!
//! - `echo`: length-prefixed echo protocol served by the runtime

pub mod echo;
