//! XFS service provider entry points
//!
//! Each call answers synchronously with a [`ResultCode`] that only says
//! whether the call was accepted. The outcome arrives later as a completion
//! message posted to the calling window.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::{BridgeError, ScardError};
use crate::request::{PendingRequest, RequestId, RequestKey, ServiceHandle, WindowHandle};
use crate::resource::ResourceManager;
use crate::service::Service;
use crate::settings::{BridgeConfig, Settings};
use crate::sink::MessageSink;
use crate::xfs::idc::{CommandCode, DataSources, InfoCategory, PowerAction};
use crate::xfs::{EventClass, Message, MessageType, Payload, ResultCode};

/// Convert an XFS timeout in milliseconds. Zero waits indefinitely.
pub const fn xfs_timeout(millis: u32) -> Option<Duration> {
    if millis == 0 {
        None
    } else {
        Some(Duration::from_millis(millis as u64))
    }
}

/// Commands accepted by [`ServiceProvider::execute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteCommand {
    /// Wait for a card and read the requested sources
    ReadRawData {
        /// Sources to read
        sources: DataSources,
    },
    /// Send an APDU to the chip
    ChipIo {
        /// Command APDU
        data: Bytes,
    },
    /// Change chip power
    ChipPower(PowerAction),
    /// Reset the device
    Reset,
    /// Eject the card
    EjectCard,
    /// A known command the device cannot perform
    Unsupported(CommandCode),
    /// A command code outside the card reader class
    Unknown(u32),
}

impl ExecuteCommand {
    /// Decode a raw `WFPExecute` command and its data buffer.
    ///
    /// Read and power commands carry a little endian `WORD`, chip I/O the
    /// command APDU. Reset ignores its data. Codes outside the card reader
    /// class decode to [`ExecuteCommand::Unknown`].
    pub fn decode(code: u32, data: &[u8]) -> Result<Self, BridgeError> {
        let Some(command) = CommandCode::from_u32(code) else {
            return Ok(Self::Unknown(code));
        };
        let malformed = || BridgeError::InvalidCommandData(code);

        Ok(match command {
            CommandCode::ReadRawData => Self::ReadRawData {
                sources: DataSources::from_bits_truncate(word(data).ok_or_else(malformed)?),
            },
            CommandCode::ChipIo => Self::ChipIo {
                data: Bytes::copy_from_slice(data),
            },
            CommandCode::ChipPower => Self::ChipPower(
                word(data)
                    .and_then(PowerAction::from_u16)
                    .ok_or_else(malformed)?,
            ),
            CommandCode::Reset => Self::Reset,
            CommandCode::EjectCard => Self::EjectCard,
            other => Self::Unsupported(other),
        })
    }

    /// Command code echoed in completions
    pub const fn code(&self) -> u32 {
        match self {
            Self::ReadRawData { .. } => CommandCode::ReadRawData as u32,
            Self::ChipIo { .. } => CommandCode::ChipIo as u32,
            Self::ChipPower(_) => CommandCode::ChipPower as u32,
            Self::Reset => CommandCode::Reset as u32,
            Self::EjectCard => CommandCode::EjectCard as u32,
            Self::Unsupported(code) => *code as u32,
            Self::Unknown(code) => *code,
        }
    }
}

fn word(data: &[u8]) -> Option<u16> {
    let bytes: [u8; 2] = data.get(..2)?.try_into().ok()?;
    Some(u16::from_le_bytes(bytes))
}

/// The card reader service provider
pub struct ServiceProvider<R: ResourceManager> {
    dispatcher: Dispatcher<R>,
    config: RwLock<BridgeConfig>,
    sink: Arc<dyn MessageSink>,
}

impl<R: ResourceManager> fmt::Debug for ServiceProvider<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProvider")
            .field("dispatcher", &self.dispatcher)
            .field("config", &*self.config.read())
            .finish_non_exhaustive()
    }
}

impl<R: ResourceManager> ServiceProvider<R> {
    /// Start a provider over `resources`
    pub fn new(
        resources: Arc<R>,
        config: BridgeConfig,
        sink: Arc<dyn MessageSink>,
    ) -> Result<Self, BridgeError> {
        let dispatcher = Dispatcher::new(resources, Arc::clone(&sink))?;
        Ok(Self {
            dispatcher,
            config: RwLock::new(config),
            sink,
        })
    }

    /// The underlying dispatcher
    pub const fn dispatcher(&self) -> &Dispatcher<R> {
        &self.dispatcher
    }

    /// Replace the configuration and re-read the settings of open services
    pub fn reload(&self, config: BridgeConfig) {
        *self.config.write() = config;
        let config = self.config.read();
        for handle in self.dispatcher.service_handles() {
            if let Some(service) = self.dispatcher.service(handle) {
                service.reread(&config);
            }
        }
        info!("Configuration reloaded");
    }

    /// Open `logical_name` under `service`
    pub fn open(
        &self,
        service: ServiceHandle,
        logical_name: &str,
        trace_level: u32,
        window: WindowHandle,
        request_id: RequestId,
    ) -> ResultCode {
        let result = Settings::resolve(&self.config.read(), logical_name)
            .map_err(BridgeError::from)
            .and_then(|mut settings| {
                if trace_level != 0 {
                    settings.trace_level = trace_level;
                }
                self.dispatcher.create_service(service, settings)
            });

        let code = match result {
            Ok(_) => ResultCode::Success,
            Err(e) => {
                error!(service, logical_name, "Failed to open service: {}", e);
                e.result_code()
            }
        };
        self.complete(MessageType::OpenComplete, service, window, request_id, 0, code, Payload::None);
        ResultCode::Success
    }

    /// Close `service`, cancelling its pending requests
    pub fn close(&self, service: ServiceHandle, window: WindowHandle, request_id: RequestId) -> ResultCode {
        if let Err(e) = self.dispatcher.remove_service(service) {
            return e.result_code();
        }
        self.complete(
            MessageType::CloseComplete,
            service,
            window,
            request_id,
            0,
            ResultCode::Success,
            Payload::None,
        );
        ResultCode::Success
    }

    /// Take exclusive access to the card
    pub fn lock(&self, service: ServiceHandle, window: WindowHandle, request_id: RequestId) -> ResultCode {
        let Some(session) = self.dispatcher.service(service) else {
            return ResultCode::InvalidHService;
        };
        let code = outcome(session.lock());
        self.complete(MessageType::LockComplete, service, window, request_id, 0, code, Payload::None);
        ResultCode::Success
    }

    /// Release exclusive access
    pub fn unlock(&self, service: ServiceHandle, window: WindowHandle, request_id: RequestId) -> ResultCode {
        let Some(session) = self.dispatcher.service(service) else {
            return ResultCode::InvalidHService;
        };
        let code = match session.unlock() {
            Ok(()) => ResultCode::Success,
            Err(e) => e.result_code(),
        };
        self.complete(MessageType::UnlockComplete, service, window, request_id, 0, code, Payload::None);
        ResultCode::Success
    }

    /// Subscribe `registered` to the event classes in `classes`
    pub fn register(
        &self,
        service: ServiceHandle,
        classes: u32,
        registered: WindowHandle,
        window: WindowHandle,
        request_id: RequestId,
    ) -> ResultCode {
        let Some(session) = self.dispatcher.service(service) else {
            return ResultCode::InvalidHService;
        };
        let Some(classes) = EventClass::from_bits(classes) else {
            return ResultCode::InvalidEventClass;
        };
        session.register(registered, classes);
        self.complete(
            MessageType::RegisterComplete,
            service,
            window,
            request_id,
            0,
            ResultCode::Success,
            Payload::None,
        );
        ResultCode::Success
    }

    /// Unsubscribe `registered` (every window if `None`) from `classes`
    pub fn deregister(
        &self,
        service: ServiceHandle,
        classes: u32,
        registered: Option<WindowHandle>,
        window: WindowHandle,
        request_id: RequestId,
    ) -> ResultCode {
        let Some(session) = self.dispatcher.service(service) else {
            return ResultCode::InvalidHService;
        };
        let Some(classes) = EventClass::from_bits(classes) else {
            return ResultCode::InvalidEventClass;
        };
        let code = if session.deregister(registered, classes) {
            ResultCode::Success
        } else {
            ResultCode::NotRegistered
        };
        self.complete(MessageType::DeregisterComplete, service, window, request_id, 0, code, Payload::None);
        ResultCode::Success
    }

    /// Query device information
    pub fn get_info(
        &self,
        service: ServiceHandle,
        category: u32,
        window: WindowHandle,
        request_id: RequestId,
    ) -> ResultCode {
        let Some(session) = self.dispatcher.service(service) else {
            return ResultCode::InvalidHService;
        };

        let (code, payload) = match InfoCategory::from_u32(category) {
            Some(InfoCategory::Status) => match session.status() {
                Ok(status) => (ResultCode::Success, Payload::Status(status)),
                Err(e) => (e.translate(), Payload::None),
            },
            Some(InfoCategory::Capabilities) => {
                (ResultCode::Success, Payload::Capabilities(session.caps()))
            }
            Some(InfoCategory::FormList | InfoCategory::QueryForm) => {
                return ResultCode::UnsuppCommand;
            }
            None => return ResultCode::InvalidCategory,
        };
        self.complete(MessageType::GetInfoComplete, service, window, request_id, category, code, payload);
        ResultCode::Success
    }

    /// Execute a device command
    pub fn execute(
        &self,
        service: ServiceHandle,
        command: ExecuteCommand,
        timeout: Option<Duration>,
        window: WindowHandle,
        request_id: RequestId,
    ) -> ResultCode {
        let Some(session) = self.dispatcher.service(service) else {
            return ResultCode::InvalidHService;
        };
        let code = command.code();
        debug!(service, request_id, ?command, ?timeout, "Execute");

        let (result, payload) = match command {
            ExecuteCommand::ReadRawData { sources } => {
                return self.read_raw_data(&session, sources, timeout, window, request_id);
            }
            ExecuteCommand::ChipIo { data } => match session.chip_io(&data) {
                Ok(io) => (ResultCode::Success, Payload::ChipIo(io)),
                Err(e) => (e.translate(), Payload::None),
            },
            ExecuteCommand::ChipPower(action) => match session.chip_power(action) {
                Ok(atr) => (ResultCode::Success, Payload::ChipPower(atr)),
                Err(e) => (e.translate(), Payload::None),
            },
            ExecuteCommand::Reset => (outcome(session.reset().map(|_| ())), Payload::None),
            ExecuteCommand::EjectCard => {
                if session.settings().workarounds.can_eject {
                    (ResultCode::Success, Payload::None)
                } else {
                    (ResultCode::UnsuppCommand, Payload::None)
                }
            }
            ExecuteCommand::Unsupported(_) => return ResultCode::UnsuppCommand,
            ExecuteCommand::Unknown(_) => return ResultCode::InvalidCommand,
        };

        self.complete(MessageType::ExecuteComplete, service, window, request_id, code, result, payload);
        ResultCode::Success
    }

    /// Execute a raw command code with its data buffer
    pub fn execute_raw(
        &self,
        service: ServiceHandle,
        code: u32,
        data: &[u8],
        timeout: Option<Duration>,
        window: WindowHandle,
        request_id: RequestId,
    ) -> ResultCode {
        if self.dispatcher.service(service).is_none() {
            return ResultCode::InvalidHService;
        }
        match ExecuteCommand::decode(code, data) {
            Ok(command) => self.execute(service, command, timeout, window, request_id),
            Err(e) => {
                debug!(service, request_id, "Rejected command: {}", e);
                e.result_code()
            }
        }
    }

    /// Cancel one pending request, or all of the service's when `request_id` is `None`
    pub fn cancel_async_request(&self, service: ServiceHandle, request_id: Option<RequestId>) -> ResultCode {
        if self.dispatcher.service(service).is_none() {
            return ResultCode::InvalidHService;
        }
        match request_id {
            None => {
                let cancelled = self.dispatcher.cancel_service_requests(service);
                debug!(service, cancelled, "Cancelled all requests");
                ResultCode::Success
            }
            Some(id) if self.dispatcher.cancel_request(service, id) => ResultCode::Success,
            Some(id) => {
                debug!(service, request_id = id, "No such pending request");
                ResultCode::InvalidReqId
            }
        }
    }

    /// Change the trace level of `service`
    pub fn set_trace_level(&self, service: ServiceHandle, level: u32) -> ResultCode {
        let Some(session) = self.dispatcher.service(service) else {
            return ResultCode::InvalidHService;
        };
        session.set_trace_level(level);
        ResultCode::Success
    }

    /// Whether the provider may be unloaded
    pub fn unload_service(&self) -> ResultCode {
        let open = self.dispatcher.service_handles().len();
        if open > 0 {
            warn!(open, "Unload refused while services are open");
            ResultCode::NotOkToUnload
        } else {
            ResultCode::Success
        }
    }

    fn read_raw_data(
        &self,
        session: &Service<R>,
        sources: DataSources,
        timeout: Option<Duration>,
        window: WindowHandle,
        request_id: RequestId,
    ) -> ResultCode {
        let service = session.handle();
        let code = CommandCode::ReadRawData as u32;

        if sources.is_empty() {
            self.complete(
                MessageType::ExecuteComplete,
                service,
                window,
                request_id,
                code,
                ResultCode::InvalidData,
                Payload::None,
            );
            return ResultCode::Success;
        }

        // A card already in the bound reader is read right away
        if session.binding().is_bound() {
            match session.read(sources) {
                Ok(data) => {
                    self.complete(
                        MessageType::ExecuteComplete,
                        service,
                        window,
                        request_id,
                        code,
                        ResultCode::Success,
                        Payload::CardData(data),
                    );
                    return ResultCode::Success;
                }
                Err(ScardError::NoSmartcard | ScardError::RemovedCard) => {}
                Err(e) => {
                    self.complete(
                        MessageType::ExecuteComplete,
                        service,
                        window,
                        request_id,
                        code,
                        e.translate(),
                        Payload::None,
                    );
                    return ResultCode::Success;
                }
            }
        }

        let request = PendingRequest::card_insertion(
            RequestKey::new(service, request_id),
            window,
            Instant::now(),
            timeout,
            sources,
            Arc::clone(session.binding()),
        );
        match self.dispatcher.add_request(request) {
            Ok(()) => ResultCode::Success,
            Err(e) => e.result_code(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn complete(
        &self,
        kind: MessageType,
        service: ServiceHandle,
        window: WindowHandle,
        request_id: RequestId,
        code: u32,
        result: ResultCode,
        payload: Payload,
    ) {
        debug!(service, request_id, ?kind, %result, "Completing");
        let message = Message::completion(kind, service, request_id, code, result, payload);
        self.sink.post(window, message);
    }
}

fn outcome(result: Result<(), ScardError>) -> ResultCode {
    match result {
        Ok(()) => ResultCode::Success,
        Err(e) => e.translate(),
    }
}
