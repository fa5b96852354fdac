//! # skiff platform
//!
//! Core platform types shared by the skiff crates.
//!
//! This crate provides:
//! - Unified error type (`SkiffError`, `SkiffResult`) with fatal/scoped classification
//! - Disconnect reason constants used when an error ends a connection
//!
//! # Examples
//!
//! ```
//! use skiff_platform::{SkiffError, SkiffResult};
//!
//! fn example_function() -> SkiffResult<String> {
//!     Ok("Hello, skiff!".to_string())
//! }
//!
//! # fn main() -> SkiffResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, skiff!");
//! assert!(SkiffError::Protocol("bad packet".into()).is_fatal());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{
    SkiffError, SkiffResult, DISCONNECT_CONNECTION_LOST, DISCONNECT_MAC_ERROR,
    DISCONNECT_PROTOCOL_ERROR,
};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
