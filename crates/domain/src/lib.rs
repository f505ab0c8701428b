//! `wsp-domain` — configuration, validation and build metadata shared by
//! every workspace-proxy crate.

pub mod buildinfo;
pub mod config;
pub mod error;
pub mod hostname;

pub use error::{Error, Result};
