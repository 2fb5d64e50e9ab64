//! Core of a CEN/XFS identification card service backed by PC/SC
//!
//! XFS clients issue asynchronous requests such as "wait for a card and read
//! it" against logical services. This crate keeps those requests in a
//! [`RequestRegistry`] ordered by deadline, watches every attached reader
//! from a single [`ReaderMonitor`] thread, and routes reader changes,
//! timeouts and cancellations to the right request through the
//! [`Dispatcher`]. Completions and events are delivered through a
//! [`MessageSink`].
//!
//! The smart card resource manager is abstracted behind [`ResourceManager`]
//! so the coordination logic runs against any backend.
//!
//! # Examples
//!
//! ```no_run
//! # fn run<R: xfs_bridge_core::ResourceManager>(resources: std::sync::Arc<R>)
//! # -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use xfs_bridge_core::{BridgeConfig, ChannelSink, ExecuteCommand, ServiceProvider};
//! use xfs_bridge_core::xfs::idc::DataSources;
//!
//! let sink = Arc::new(ChannelSink::new());
//! let (window, messages) = sink.open_window();
//!
//! let config = BridgeConfig::load("xfs-bridge.toml")?;
//! let provider = ServiceProvider::new(resources, config, sink)?;
//! provider.open(1, "IDC30", 0, window, 1);
//! provider.execute(
//!     1,
//!     ExecuteCommand::ReadRawData { sources: DataSources::CHIP },
//!     None,
//!     window,
//!     2,
//! );
//!
//! for message in messages.iter() {
//!     println!("{:?}", message);
//! }
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![warn(missing_docs)]

mod binding;
mod dispatcher;
mod error;
mod events;
mod monitor;
mod reader_state;
mod registry;
mod request;
mod resource;
mod service;
mod settings;
mod sink;
mod spi;

pub mod xfs;

pub use binding::ReaderBinding;
pub use dispatcher::Dispatcher;
pub use error::{BridgeError, RegistryError, ScardError, SettingsError};
pub use events::EventNotifier;
pub use monitor::{ReaderChangeHandler, ReaderMonitor, WAIT_SLICE, WakeReason};
pub use reader_state::{ChangeKind, PNP_NOTIFICATION, ReaderFlags, ReaderStateSnapshot};
pub use registry::RequestRegistry;
pub use request::{PendingRequest, RequestId, RequestKey, RequestKind, ServiceHandle, WindowHandle};
pub use resource::{
    CardConnection, CardState, CardStatus, Disposition, Protocol, ResourceManager, ShareMode,
    WaitStatus,
};
pub use service::Service;
pub use settings::{BridgeConfig, ENV_PREFIX, LogicalService, ProviderConfig, Settings, Workarounds};
pub use sink::{ChannelSink, MessageReceiver, MessageSender, MessageSink};
pub use spi::{ExecuteCommand, ServiceProvider, xfs_timeout};
