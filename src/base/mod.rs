//! Base types and error handling.
//!
//! - [`neterror::NetError`]: error list with numeric codes
//! - [`context::IoResultExt`]: attaches connection/bind context to I/O errors
//! - [`uri`]: socket URI parsing and destination keys
//! - [`address`]: socket name formatting

pub mod address;
pub mod context;
pub mod neterror;
pub mod uri;

#[cfg(test)]
mod tests;
