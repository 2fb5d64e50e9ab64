use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::{Condvar, Mutex};
use xfs_bridge_core::xfs::{Message, MessageType};
use xfs_bridge_core::{
    BridgeConfig, CardConnection, CardState, CardStatus, ChannelSink, Disposition,
    LogicalService, MessageReceiver, Protocol, ProviderConfig, ReaderFlags, ReaderStateSnapshot,
    ResourceManager, ScardError, ServiceHandle, ServiceProvider, ShareMode, WaitStatus, WindowHandle,
};

pub(crate) const READER_A: &str = "Mock Reader A";
pub(crate) const READER_B: &str = "Mock Reader B";
pub(crate) const ATR: &[u8] = &[0x3B, 0x8F, 0x80, 0x01, 0x80, 0x4F];

/// How long a test waits for something it expects
pub(crate) const RECV_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct MockCardInfo {
    atr: Bytes,
    protocol: Protocol,
    generation: u64,
}

#[derive(Debug, Default)]
struct MockReader {
    card: Option<MockCardInfo>,
    events: u16,
}

impl MockReader {
    fn flags(&self) -> ReaderFlags {
        let state = if self.card.is_some() {
            ReaderFlags::PRESENT
        } else {
            ReaderFlags::EMPTY
        };
        state | ReaderFlags::from_bits_retain(u32::from(self.events) << 16)
    }
}

#[derive(Debug, Default)]
struct MockState {
    readers: BTreeMap<String, MockReader>,
    list_events: u16,
    cancelled: bool,
    /// Cancel only interrupts a wait that is already blocked
    lossy_cancel: bool,
    waiting: bool,
    fail_waits: usize,
    fail_lists: usize,
    wait_timeouts: Vec<Option<Duration>>,
    generation: u64,
    transmitted: Vec<Vec<u8>>,
    connects: Vec<(String, ShareMode)>,
}

impl MockState {
    fn flags(&self, name: &str) -> (ReaderFlags, Bytes) {
        if name == xfs_bridge_core::PNP_NOTIFICATION {
            return (
                ReaderFlags::from_bits_retain(u32::from(self.list_events) << 16),
                Bytes::new(),
            );
        }
        match self.readers.get(name) {
            Some(reader) => (
                reader.flags(),
                reader
                    .card
                    .as_ref()
                    .map(|card| card.atr.clone())
                    .unwrap_or_default(),
            ),
            None => (ReaderFlags::UNKNOWN, Bytes::new()),
        }
    }

    fn changed(&self, states: &[ReaderStateSnapshot]) -> bool {
        states.iter().any(|entry| {
            let (flags, _) = self.flags(entry.name());
            flags != entry.current().difference(ReaderFlags::CHANGED)
        })
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<MockState>,
    changed: Condvar,
    /// Handshake run at the start of the next wait
    gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

/// In-memory resource manager. By default cancellation is sticky: a cancel
/// issued while no wait is running interrupts the next wait.
#[derive(Debug, Default)]
pub(crate) struct MockResources {
    shared: Arc<Shared>,
}

/// Holds the monitor at the start of a wait until resumed or dropped
pub(crate) struct WaitGate {
    paused: Receiver<()>,
    resume: Sender<()>,
}

impl WaitGate {
    /// Block until the monitor reached the gate
    pub(crate) fn wait_paused(&self) {
        self.paused
            .recv_timeout(RECV_TIMEOUT)
            .expect("monitor never started another wait");
    }

    /// Let the held wait go on
    pub(crate) fn resume(self) {
        let _ = self.resume.send(());
    }
}

impl MockResources {
    pub(crate) fn with_readers(names: &[&str]) -> Arc<Self> {
        let resources = Self::default();
        {
            let mut state = resources.shared.state.lock();
            for name in names {
                state.readers.insert((*name).to_owned(), MockReader::default());
            }
        }
        Arc::new(resources)
    }

    fn update(&self, f: impl FnOnce(&mut MockState)) {
        f(&mut self.shared.state.lock());
        self.shared.changed.notify_all();
    }

    /// Behave like PC/SC: a cancel with no wait in progress is lost
    pub(crate) fn set_lossy_cancel(&self) {
        self.shared.state.lock().lossy_cancel = true;
    }

    /// Hold the next wait before it blocks
    pub(crate) fn pause_next_wait(&self) -> WaitGate {
        let (paused_tx, paused) = bounded(1);
        let (resume, resume_rx) = bounded(1);
        *self.shared.gate.lock() = Some((paused_tx, resume_rx));
        WaitGate { paused, resume }
    }

    /// Fail the next wait with a communication error
    pub(crate) fn fail_next_wait(&self) {
        self.shared.state.lock().fail_waits += 1;
    }

    /// Fail the next reader enumeration
    pub(crate) fn fail_next_list(&self) {
        self.shared.state.lock().fail_lists += 1;
    }

    /// Timeouts of every wait so far
    pub(crate) fn wait_timeouts(&self) -> Vec<Option<Duration>> {
        self.shared.state.lock().wait_timeouts.clone()
    }

    pub(crate) fn add_reader(&self, name: &str) {
        self.update(|state| {
            state.readers.insert(name.to_owned(), MockReader::default());
            state.list_events += 1;
        });
    }

    pub(crate) fn remove_reader(&self, name: &str) {
        self.update(|state| {
            state.readers.remove(name);
            state.list_events += 1;
        });
    }

    pub(crate) fn insert_card(&self, reader: &str, protocol: Protocol) {
        self.update(|state| {
            state.generation += 1;
            let generation = state.generation;
            let reader = state.readers.entry(reader.to_owned()).or_default();
            reader.card = Some(MockCardInfo {
                atr: Bytes::from_static(ATR),
                protocol,
                generation,
            });
            reader.events += 1;
        });
    }

    pub(crate) fn remove_card(&self, reader: &str) {
        self.update(|state| {
            if let Some(reader) = state.readers.get_mut(reader) {
                reader.card = None;
                reader.events += 1;
            }
        });
    }

    pub(crate) fn transmitted(&self) -> Vec<Vec<u8>> {
        self.shared.state.lock().transmitted.clone()
    }

    pub(crate) fn connects(&self) -> Vec<(String, ShareMode)> {
        self.shared.state.lock().connects.clone()
    }
}

impl ResourceManager for MockResources {
    type Card = MockCard;

    fn list_readers(&self) -> Result<Vec<String>, ScardError> {
        let mut state = self.shared.state.lock();
        if state.fail_lists > 0 {
            state.fail_lists -= 1;
            return Err(ScardError::NoService);
        }
        Ok(state.readers.keys().cloned().collect())
    }

    fn wait_for_change(
        &self,
        timeout: Option<Duration>,
        states: &mut [ReaderStateSnapshot],
    ) -> Result<WaitStatus, ScardError> {
        let gate = self.shared.gate.lock().take();
        if let Some((paused, resume)) = gate {
            let _ = paused.send(());
            let _ = resume.recv();
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.shared.state.lock();
        state.wait_timeouts.push(timeout);
        if state.fail_waits > 0 {
            state.fail_waits -= 1;
            return Err(ScardError::CommError);
        }

        state.waiting = true;
        let status = loop {
            if state.cancelled {
                state.cancelled = false;
                break WaitStatus::Cancelled;
            }

            if state.changed(states) {
                for entry in states.iter_mut() {
                    let (flags, atr) = state.flags(entry.name());
                    let event = if flags != entry.current().difference(ReaderFlags::CHANGED) {
                        flags | ReaderFlags::CHANGED
                    } else {
                        flags
                    };
                    entry.set_event(event, atr);
                }
                break WaitStatus::Changed;
            }

            match deadline {
                Some(deadline) => {
                    if self.shared.changed.wait_until(&mut state, deadline).timed_out() {
                        break WaitStatus::TimedOut;
                    }
                }
                None => self.shared.changed.wait(&mut state),
            }
        };
        state.waiting = false;
        Ok(status)
    }

    fn cancel_wait(&self) -> Result<(), ScardError> {
        self.update(|state| {
            if !state.lossy_cancel || state.waiting {
                state.cancelled = true;
            }
        });
        Ok(())
    }

    fn connect(&self, reader: &str, mode: ShareMode) -> Result<MockCard, ScardError> {
        let mut state = self.shared.state.lock();
        state.connects.push((reader.to_owned(), mode));
        let card = state
            .readers
            .get(reader)
            .ok_or(ScardError::UnknownReader)?
            .card
            .clone()
            .ok_or(ScardError::NoSmartcard)?;

        Ok(MockCard {
            shared: Arc::clone(&self.shared),
            reader: reader.to_owned(),
            generation: card.generation,
        })
    }
}

/// Connection to a card in a [`MockResources`] reader
#[derive(Debug)]
pub(crate) struct MockCard {
    shared: Arc<Shared>,
    reader: String,
    generation: u64,
}

impl MockCard {
    fn card(&self) -> Result<MockCardInfo, ScardError> {
        let state = self.shared.state.lock();
        let reader = state.readers.get(&self.reader).ok_or(ScardError::ReaderUnavailable)?;
        match &reader.card {
            Some(card) if card.generation == self.generation => Ok(card.clone()),
            _ => Err(ScardError::RemovedCard),
        }
    }
}

impl CardConnection for MockCard {
    fn status(&mut self) -> Result<CardStatus, ScardError> {
        let card = self.card()?;
        Ok(CardStatus {
            state: CardState::PRESENT | CardState::POWERED | CardState::SPECIFIC,
            protocol: Some(card.protocol),
            atr: card.atr,
        })
    }

    fn transmit(&mut self, command: &[u8]) -> Result<Bytes, ScardError> {
        self.card()?;
        self.shared.state.lock().transmitted.push(command.to_vec());
        Ok(Bytes::from_static(&[0x90, 0x00]))
    }

    fn lock(&mut self) -> Result<(), ScardError> {
        self.card().map(|_| ())
    }

    fn unlock(&mut self) -> Result<(), ScardError> {
        self.card().map(|_| ())
    }

    fn reconnect(&mut self, _initialization: Disposition) -> Result<(), ScardError> {
        self.card().map(|_| ())
    }
}

/// Configuration with one logical service `IDC30`
pub(crate) fn config(reader: Option<&str>) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.logical_services.insert(
        "IDC30".into(),
        LogicalService {
            provider: "pcsc".into(),
        },
    );
    config.service_providers.insert(
        "pcsc".into(),
        ProviderConfig {
            reader_name: reader.map(str::to_owned),
            ..ProviderConfig::default()
        },
    );
    config
}

/// Provider over `resources` with one client window
pub(crate) struct Harness {
    pub(crate) resources: Arc<MockResources>,
    pub(crate) provider: ServiceProvider<MockResources>,
    pub(crate) window: WindowHandle,
    pub(crate) messages: MessageReceiver,
}

impl Harness {
    pub(crate) fn new(resources: Arc<MockResources>, config: BridgeConfig) -> Self {
        let sink = Arc::new(ChannelSink::new());
        let (window, messages) = sink.open_window();
        let provider = ServiceProvider::new(Arc::clone(&resources), config, sink).unwrap();
        Self {
            resources,
            provider,
            window,
            messages,
        }
    }

    /// Open `IDC30` as `service` and consume the open completion
    pub(crate) fn open_as(&self, service: ServiceHandle) {
        let code = self.provider.open(service, "IDC30", 0, self.window, 1);
        assert!(code.is_success());
        let message = self.recv();
        assert_eq!(message.kind, MessageType::OpenComplete);
        assert!(message.result_code().is_success());
    }

    /// Open `IDC30` as service 1
    pub(crate) fn open(&self) {
        self.open_as(1);
    }

    pub(crate) fn recv(&self) -> Message {
        recv(&self.messages)
    }
}

pub(crate) fn recv(messages: &MessageReceiver) -> Message {
    messages
        .recv_timeout(RECV_TIMEOUT)
        .expect("timed out waiting for a message")
}

pub(crate) fn assert_quiet(messages: &MessageReceiver, period: Duration) {
    if let Ok(message) = messages.recv_timeout(period) {
        panic!("unexpected message {:?}", message);
    }
}

/// Poll `condition` until it holds or [`RECV_TIMEOUT`] passes
pub(crate) fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + RECV_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
