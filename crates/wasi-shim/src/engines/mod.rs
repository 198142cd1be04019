//! Host-call implementations and the engines that drive them.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

pub mod common;
pub mod strace;
#[cfg(feature = "std")]
pub mod wasmtime;
