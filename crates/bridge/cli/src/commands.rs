//! Command implementations

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use eyre::{Result, bail, eyre};
use tracing::{debug, info};
use xfs_bridge_core::xfs::idc::{DataSources, InfoCategory};
use xfs_bridge_core::xfs::{EventClass, Message, Payload};
use xfs_bridge_core::{
    BridgeConfig, ChannelSink, ExecuteCommand, MessageReceiver, ReaderStateSnapshot,
    RequestId, ResourceManager, ServiceHandle, ServiceProvider, WindowHandle, xfs_timeout,
};
use xfs_bridge_pcsc::PcscResourceManager;

use crate::display::{key_value_box, message_line, result_code, success, warning};

/// Service handle used by the CLI session
const SERVICE: ServiceHandle = 1;

/// Longest wait for a completion that is not a card wait
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(10);

/// List available readers and whether a card is present
pub(crate) fn list_readers(resources: &PcscResourceManager) -> Result<()> {
    let readers = resources.list_readers()?;

    if readers.is_empty() {
        println!("No readers found!");
        return Ok(());
    }

    // A zero timeout poll reports the current state of every reader
    let mut states: Vec<_> = readers.iter().map(ReaderStateSnapshot::unaware).collect();
    resources.wait_for_change(Some(Duration::ZERO), &mut states)?;

    println!("Available readers:");
    for (i, state) in states.iter().enumerate() {
        let status = if state.card_present() {
            "card present"
        } else {
            "no card"
        };
        println!("{}. {} ({})", i + 1, state.name(), status);
    }

    Ok(())
}

/// A provider with one open logical service
pub(crate) struct Session {
    provider: ServiceProvider<PcscResourceManager>,
    window: WindowHandle,
    messages: MessageReceiver,
    next_request: RequestId,
}

impl Session {
    /// Start the provider and open `logical_name`
    pub(crate) fn open(config: BridgeConfig, logical_name: &str) -> Result<Self> {
        let resources = Arc::new(PcscResourceManager::new()?);
        let sink = Arc::new(ChannelSink::new());
        let (window, messages) = sink.open_window();
        let provider = ServiceProvider::new(resources, config, sink)?;

        let mut session = Self {
            provider,
            window,
            messages,
            next_request: 1,
        };

        let request = session.next_request();
        session
            .provider
            .open(SERVICE, logical_name, 0, session.window, request);
        let completion = session.completion(request, COMPLETION_TIMEOUT)?;
        if !completion.result_code().is_success() {
            bail!(
                "failed to open {}: {}",
                logical_name,
                completion.result_code()
            );
        }
        info!(logical_name, "Service opened");
        Ok(session)
    }

    fn next_request(&mut self) -> RequestId {
        let request = self.next_request;
        self.next_request += 1;
        request
    }

    /// Wait for the completion of `request`, printing events received meanwhile
    fn completion(&self, request: RequestId, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let remaining = deadline.map_or(Duration::MAX, |deadline| {
                deadline.saturating_duration_since(Instant::now())
            });
            match self.messages.recv_timeout(remaining) {
                Ok(message)
                    if message.kind.event_class().is_none()
                        && message.result.request_id == request =>
                {
                    return Ok(message);
                }
                Ok(message) => println!("{}", message_line(&message)),
                Err(RecvTimeoutError::Timeout) => {
                    bail!("no completion for request {} within {:?}", request, timeout)
                }
                Err(RecvTimeoutError::Disconnected) => bail!("message queue closed"),
            }
        }
    }

    /// Print the device status
    pub(crate) fn status(&mut self) -> Result<()> {
        let request = self.next_request();
        let code = self.provider.get_info(
            SERVICE,
            InfoCategory::Status as u32,
            self.window,
            request,
        );
        if !code.is_success() {
            bail!("status query rejected: {}", code);
        }

        let completion = self.completion(request, COMPLETION_TIMEOUT)?;
        let Payload::Status(status) = completion.result.payload else {
            bail!("status query failed: {}", completion.result_code());
        };
        println!(
            "{}",
            key_value_box(
                "Device status",
                vec![
                    ("Device", format!("{:?}", status.device)),
                    ("Media", format!("{:?}", status.media)),
                    ("Chip power", format!("{:?}", status.chip_power)),
                ],
            )
        );
        Ok(())
    }

    /// Wait for a card and print its ATR
    pub(crate) fn wait_card(&mut self, timeout_ms: u32) -> Result<()> {
        let request = self.next_request();
        let timeout = xfs_timeout(timeout_ms);
        let code = self.provider.execute(
            SERVICE,
            ExecuteCommand::ReadRawData {
                sources: DataSources::CHIP,
            },
            timeout,
            self.window,
            request,
        );
        if !code.is_success() {
            bail!("read rejected: {}", code);
        }
        println!("Waiting for a card...");

        // The provider enforces the timeout; only bound our own wait loosely
        let wait = timeout.map_or(Duration::MAX, |timeout| timeout + COMPLETION_TIMEOUT);
        let completion = self.completion(request, wait)?;
        match completion.result.payload {
            Payload::CardData(data) => {
                let chip = data
                    .iter()
                    .find(|item| item.source == DataSources::CHIP)
                    .ok_or_else(|| eyre!("no chip data in read result"))?;
                println!("{}", success("Card inserted"));
                println!("{}", key_value_box("Chip", vec![("ATR", hex::encode(&chip.data))]));
            }
            _ => println!(
                "{} {}",
                warning("No card read:"),
                result_code(completion.result_code())
            ),
        }
        Ok(())
    }

    /// Print every event for `duration`
    pub(crate) fn watch(&mut self, duration: Duration) -> Result<()> {
        let request = self.next_request();
        self.provider.register(
            SERVICE,
            EventClass::all().bits(),
            self.window,
            self.window,
            request,
        );
        self.completion(request, COMPLETION_TIMEOUT)?;
        println!("Watching events for {:?}...", duration);

        let deadline = Instant::now() + duration;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.messages.recv_timeout(remaining) {
                Ok(message) => println!("{}", message_line(&message)),
                Err(RecvTimeoutError::Timeout) => return Ok(()),
                Err(RecvTimeoutError::Disconnected) => bail!("message queue closed"),
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let request = self.next_request();
        let code = self.provider.close(SERVICE, self.window, request);
        debug!(%code, "Service closed");
    }
}

