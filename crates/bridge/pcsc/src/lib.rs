//! PC/SC backend for the CEN/XFS card reader bridge
//!
//! Implements [`xfs_bridge_core::ResourceManager`] on top of the `pcsc`
//! crate, so the bridge talks to pcsc-lite on Unix and WinSCard on Windows.
//!
//! ```no_run
//! use std::sync::Arc;
//! use xfs_bridge_core::ResourceManager;
//! use xfs_bridge_pcsc::PcscResourceManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let resources = Arc::new(PcscResourceManager::new()?);
//! for reader in resources.list_readers()? {
//!     println!("{}", reader);
//! }
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![warn(missing_docs)]

mod card;
mod config;
mod error;
mod manager;

pub use card::PcscCard;
pub use config::{disposition, share_mode};
pub use error::scard_error;
pub use manager::PcscResourceManager;
