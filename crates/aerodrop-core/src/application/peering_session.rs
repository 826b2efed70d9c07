//! Peering session actor.
//!
//! Owns an established [`DirectLink`]: the control channel for messages and
//! file offers, plus one transfer task per accepted file. The signaling
//! relay is not involved any more.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::PeeringConfig;
use crate::domain::error::AerodropError;
use crate::domain::identity::Identity;
use crate::domain::peering::{
    file_id_from_label, transfer_label, ControlCommand, FileDescriptor, FileMetadata,
};

use super::negotiation::DirectLink;
use super::ports::{
    ChannelEvent, ChannelMessage, ChannelOptions, ChannelState, ConnectionEvent, DataChannel,
    FileSource, PeerConnection,
};
use super::transfer::{self, Direction, Transfer, TransferEnd, TransferReport};

const COMMAND_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeeringState {
    Connecting,
    Open,
    Disconnected,
}

#[derive(Debug)]
pub enum PeeringEvent {
    StateChanged(PeeringState),
    Message(String),
    FileOffered(FileDescriptor),
    /// The peer requested one of our offers.
    UploadStarted { file_id: String },
    Progress {
        file_id: String,
        direction: Direction,
        percent: u8,
    },
    FileReceived {
        file_id: String,
        metadata: FileMetadata,
        data: Bytes,
        saved_to: Option<PathBuf>,
    },
    TransferCompleted { file_id: String, direction: Direction },
    TransferCancelled { file_id: String, direction: Direction },
    TransferFailed {
        file_id: String,
        direction: Direction,
        error: AerodropError,
    },
    Error(AerodropError),
}

enum Command {
    SendMessage {
        text: String,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    OfferFile {
        source: Arc<dyn FileSource>,
        reply: oneshot::Sender<anyhow::Result<String>>,
    },
    AcceptFile {
        file_id: String,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    CancelTransfer {
        file_id: String,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    WatchProgress {
        file_id: String,
        reply: oneshot::Sender<Option<watch::Receiver<u8>>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PeeringHandle {
    peer: Identity,
    commands: mpsc::Sender<Command>,
}

impl PeeringHandle {
    pub fn peer(&self) -> &Identity {
        &self.peer
    }

    pub async fn send_message(&self, text: impl Into<String>) -> anyhow::Result<()> {
        let text = text.into();
        self.call(|reply| Command::SendMessage { text, reply }).await?
    }

    /// Offer a file; returns the id the peer will accept it by.
    pub async fn offer_file(&self, source: Arc<dyn FileSource>) -> anyhow::Result<String> {
        self.call(|reply| Command::OfferFile { source, reply }).await?
    }

    pub async fn accept_file(&self, file_id: impl Into<String>) -> anyhow::Result<()> {
        let file_id = file_id.into();
        self.call(|reply| Command::AcceptFile { file_id, reply }).await?
    }

    pub async fn cancel_transfer(&self, file_id: impl Into<String>) -> anyhow::Result<()> {
        let file_id = file_id.into();
        self.call(|reply| Command::CancelTransfer { file_id, reply }).await?
    }

    /// Percent-complete stream of a running transfer.
    pub async fn watch_progress(
        &self,
        file_id: impl Into<String>,
    ) -> anyhow::Result<Option<watch::Receiver<u8>>> {
        let file_id = file_id.into();
        self.call(|reply| Command::WatchProgress { file_id, reply }).await
    }

    /// Close the direct connection. Idempotent.
    pub async fn close(&self) {
        let _ = self.call(|reply| Command::Close { reply }).await;
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| AerodropError::Closed("peering session"))?;
        Ok(rx.await.map_err(|_| AerodropError::Closed("peering session"))?)
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct ActiveTransfer {
    generation: u64,
    cancel: CancellationToken,
    progress: watch::Receiver<u8>,
}

enum Input {
    Command(Option<Command>),
    Connection(Option<ConnectionEvent>),
    Control(Option<ChannelEvent>),
    Report(Option<TransferReport>),
}

enum Flow {
    Continue,
    Stop,
}

pub struct PeeringSession {
    peer: Identity,
    config: Arc<PeeringConfig>,
    connection: Arc<dyn PeerConnection>,
    connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    control: Arc<dyn DataChannel>,
    control_events: mpsc::Receiver<ChannelEvent>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<PeeringEvent>,
    state: PeeringState,
    /// Our offers, by file id.
    offers: HashMap<String, Arc<dyn FileSource>>,
    /// The peer's offers, by file id.
    incoming: HashMap<String, FileMetadata>,
    transfers: HashMap<(Direction, String), ActiveTransfer>,
    next_generation: u64,
    reports_tx: mpsc::UnboundedSender<TransferReport>,
    reports_rx: mpsc::UnboundedReceiver<TransferReport>,
}

impl PeeringSession {
    /// Start the actor on the current runtime.
    pub fn spawn(
        link: DirectLink,
        config: PeeringConfig,
    ) -> (PeeringHandle, mpsc::UnboundedReceiver<PeeringEvent>) {
        let (session, handle, events) = Self::new(link, config);
        info!(peer = %handle.peer, "Peering session starting");
        tokio::spawn(session.run());
        (handle, events)
    }

    fn new(
        link: DirectLink,
        config: PeeringConfig,
    ) -> (Self, PeeringHandle, mpsc::UnboundedReceiver<PeeringEvent>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let peer = link.peer.clone();

        let session = Self {
            peer: link.peer,
            config: Arc::new(config),
            connection: link.connection,
            connection_events: link.connection_events,
            control: link.control,
            control_events: link.control_events,
            commands: command_rx,
            events: event_tx,
            state: PeeringState::Connecting,
            offers: HashMap::new(),
            incoming: HashMap::new(),
            transfers: HashMap::new(),
            next_generation: 0,
            reports_tx,
            reports_rx,
        };

        (
            session,
            PeeringHandle {
                peer,
                commands: command_tx,
            },
            event_rx,
        )
    }

    async fn run(mut self) {
        if self.control.state() == ChannelState::Open {
            self.set_state(PeeringState::Open);
        }

        loop {
            let input = tokio::select! {
                command = self.commands.recv() => Input::Command(command),
                event = self.connection_events.recv() => Input::Connection(event),
                event = self.control_events.recv() => Input::Control(event),
                report = self.reports_rx.recv() => Input::Report(report),
            };
            let flow = match input {
                Input::Command(None) => Flow::Stop,
                Input::Command(Some(command)) => self.on_command(command).await,
                Input::Connection(event) => self.on_connection_event(event).await,
                Input::Control(event) => self.on_control_event(event),
                Input::Report(Some(report)) => {
                    self.on_report(report);
                    Flow::Continue
                }
                Input::Report(None) => Flow::Continue,
            };
            if let Flow::Stop = flow {
                break;
            }
        }

        self.shutdown().await;
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn on_command(&mut self, command: Command) -> Flow {
        match command {
            Command::SendMessage { text, reply } => {
                let result = self.send_control(&ControlCommand::Message { message: text }).await;
                let _ = reply.send(result);
            }
            Command::OfferFile { source, reply } => {
                let _ = reply.send(self.offer(source).await);
            }
            Command::AcceptFile { file_id, reply } => {
                let _ = reply.send(self.accept(file_id).await);
            }
            Command::CancelTransfer { file_id, reply } => {
                let mut found = false;
                for ((_, id), transfer) in &self.transfers {
                    if *id == file_id {
                        transfer.cancel.cancel();
                        found = true;
                    }
                }
                let result = if found {
                    debug!(%file_id, "Cancelling transfer");
                    Ok(())
                } else {
                    Err(AerodropError::transfer(&file_id, "no such transfer").into())
                };
                let _ = reply.send(result);
            }
            Command::WatchProgress { file_id, reply } => {
                let progress = [Direction::Download, Direction::Upload]
                    .into_iter()
                    .find_map(|direction| self.transfers.get(&(direction, file_id.clone())))
                    .map(|transfer| transfer.progress.clone());
                let _ = reply.send(progress);
            }
            Command::Close { reply } => {
                info!(peer = %self.peer, "Closing peering session");
                let _ = reply.send(());
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    async fn offer(&mut self, source: Arc<dyn FileSource>) -> anyhow::Result<String> {
        let id = Uuid::new_v4().to_string();
        let metadata = source.metadata();
        self.send_control(&ControlCommand::File {
            file: FileDescriptor {
                id: id.clone(),
                metadata: metadata.clone(),
            },
        })
        .await?;
        info!(file_id = %id, name = %metadata.name, size = metadata.size, "Offered file");
        self.offers.insert(id.clone(), source);
        Ok(id)
    }

    async fn accept(&mut self, file_id: String) -> anyhow::Result<()> {
        let Some(metadata) = self.incoming.get(&file_id).cloned() else {
            return Err(AerodropError::transfer(&file_id, "no such offer").into());
        };
        if self.transfers.contains_key(&(Direction::Download, file_id.clone())) {
            return Err(AerodropError::transfer(&file_id, "already downloading").into());
        }

        let channel = self
            .connection
            .create_data_channel(&transfer_label(&file_id), ChannelOptions { ordered: true })
            .await?;
        let transfer = self.register(Direction::Download, &file_id, channel)?;
        info!(%file_id, name = %metadata.name, "Accepted file");
        transfer::spawn_download(transfer, metadata);
        Ok(())
    }

    /// Track a new transfer, replacing any previous one for the same file.
    fn register(
        &mut self,
        direction: Direction,
        file_id: &str,
        channel: Arc<dyn DataChannel>,
    ) -> anyhow::Result<Transfer> {
        let events = channel
            .take_events()
            .ok_or_else(|| anyhow::anyhow!("transfer channel events already taken"))?;
        self.next_generation += 1;
        let generation = self.next_generation;
        let cancel = CancellationToken::new();
        let (progress_tx, progress_rx) = watch::channel(0);

        let previous = self.transfers.insert(
            (direction, file_id.to_owned()),
            ActiveTransfer {
                generation,
                cancel: cancel.clone(),
                progress: progress_rx,
            },
        );
        if let Some(previous) = previous {
            debug!(%file_id, ?direction, "Replacing previous transfer");
            previous.cancel.cancel();
        }

        Ok(Transfer {
            file_id: file_id.to_owned(),
            generation,
            channel,
            events,
            config: Arc::clone(&self.config),
            cancel,
            progress: progress_tx,
            reports: self.reports_tx.clone(),
        })
    }

    async fn send_control(&self, command: &ControlCommand) -> anyhow::Result<()> {
        if self.state == PeeringState::Disconnected {
            return Err(AerodropError::Closed("peering session").into());
        }
        self.control.send(ChannelMessage::Text(command.encode())).await
    }

    // -----------------------------------------------------------------------
    // Connection and control channel
    // -----------------------------------------------------------------------

    async fn on_connection_event(&mut self, event: Option<ConnectionEvent>) -> Flow {
        match event {
            None => {
                warn!(peer = %self.peer, "Connection event stream ended");
                Flow::Stop
            }
            Some(ConnectionEvent::DataChannel(channel)) => {
                self.on_incoming_channel(channel).await;
                Flow::Continue
            }
            Some(ConnectionEvent::StateChanged(state)) if state.is_terminal() => {
                info!(peer = %self.peer, ?state, "Connection ended");
                Flow::Stop
            }
            Some(ConnectionEvent::StateChanged(state)) => {
                debug!(peer = %self.peer, ?state, "Connection state");
                Flow::Continue
            }
            Some(ConnectionEvent::LocalCandidate(_)) => {
                trace!("Ignoring late local candidate");
                Flow::Continue
            }
        }
    }

    async fn on_incoming_channel(&mut self, channel: Arc<dyn DataChannel>) {
        let known = file_id_from_label(channel.label())
            .and_then(|id| self.offers.get(id).map(|source| (id.to_owned(), Arc::clone(source))));
        let Some((file_id, source)) = known else {
            warn!(peer = %self.peer, label = channel.label(), "Closing channel for an unknown file");
            channel.close().await;
            return;
        };
        match self.register(Direction::Upload, &file_id, channel) {
            Ok(transfer) => transfer::spawn_upload(transfer, source),
            Err(e) => self.emit(PeeringEvent::Error(AerodropError::transfer(&file_id, e.to_string()))),
        }
    }

    fn on_control_event(&mut self, event: Option<ChannelEvent>) -> Flow {
        match event {
            Some(ChannelEvent::Open) => {
                self.set_state(PeeringState::Open);
                Flow::Continue
            }
            Some(ChannelEvent::Message(ChannelMessage::Text(text))) => {
                match ControlCommand::decode(&text) {
                    Ok(ControlCommand::Message { message }) => {
                        debug!(peer = %self.peer, len = message.len(), "Message received");
                        self.emit(PeeringEvent::Message(message));
                    }
                    Ok(ControlCommand::File { file }) => {
                        info!(peer = %self.peer, file_id = %file.id, name = %file.metadata.name, "File offered");
                        self.incoming.insert(file.id.clone(), file.metadata.clone());
                        self.emit(PeeringEvent::FileOffered(file));
                    }
                    Err(e) => warn!(peer = %self.peer, "Dropping control message: {e}"),
                }
                Flow::Continue
            }
            Some(ChannelEvent::Message(ChannelMessage::Binary(_))) => {
                warn!(peer = %self.peer, "Dropping binary frame on the control channel");
                Flow::Continue
            }
            Some(ChannelEvent::Error(e)) => {
                self.emit(PeeringEvent::Error(AerodropError::Transport(e)));
                Flow::Stop
            }
            Some(ChannelEvent::Closed) | None => {
                info!(peer = %self.peer, "Control channel closed");
                Flow::Stop
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transfer reports
    // -----------------------------------------------------------------------

    fn on_report(&mut self, report: TransferReport) {
        let event = match report {
            TransferReport::UploadStarted { file_id } => PeeringEvent::UploadStarted { file_id },
            TransferReport::Progress {
                file_id,
                direction,
                percent,
            } => PeeringEvent::Progress {
                file_id,
                direction,
                percent,
            },
            TransferReport::Received {
                file_id,
                metadata,
                data,
                saved_to,
            } => PeeringEvent::FileReceived {
                file_id,
                metadata,
                data,
                saved_to,
            },
            TransferReport::Finished {
                file_id,
                direction,
                generation,
                end,
            } => {
                let key = (direction, file_id);
                if self
                    .transfers
                    .get(&key)
                    .is_some_and(|t| t.generation == generation)
                {
                    self.transfers.remove(&key);
                }
                let (direction, file_id) = key;
                finished_event(file_id, direction, end)
            }
        };
        self.emit(event);
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn shutdown(mut self) {
        for transfer in self.transfers.values() {
            transfer.cancel.cancel();
        }
        self.control.close().await;
        self.connection.close().await;
        self.set_state(PeeringState::Disconnected);

        // Pass on how the cancelled transfers ended. Reports from replaced
        // generations may still be queued and do not count.
        let mut pending: HashMap<(Direction, String), u64> = std::mem::take(&mut self.transfers)
            .into_iter()
            .map(|(key, transfer)| (key, transfer.generation))
            .collect();
        while !pending.is_empty() {
            match self.reports_rx.recv().await {
                Some(TransferReport::Finished {
                    file_id,
                    direction,
                    generation,
                    end,
                }) => {
                    let key = (direction, file_id);
                    if pending.get(&key) == Some(&generation) {
                        pending.remove(&key);
                    }
                    let (direction, file_id) = key;
                    self.emit(finished_event(file_id, direction, end));
                }
                Some(_) => {}
                None => break,
            }
        }
        info!(peer = %self.peer, "Peering session stopped");
    }

    fn set_state(&mut self, state: PeeringState) {
        if self.state != state {
            debug!(peer = %self.peer, ?state, "Peering state");
            self.state = state;
            self.emit(PeeringEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: PeeringEvent) {
        let _ = self.events.send(event);
    }
}

fn finished_event(file_id: String, direction: Direction, end: TransferEnd) -> PeeringEvent {
    match end {
        TransferEnd::Complete => PeeringEvent::TransferCompleted { file_id, direction },
        TransferEnd::Cancelled => PeeringEvent::TransferCancelled { file_id, direction },
        TransferEnd::Failed(error) => PeeringEvent::TransferFailed {
            file_id,
            direction,
            error,
        },
    }
}
