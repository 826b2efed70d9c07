//! Transfer channel tasks, one per file per direction.
//!
//! ```text
//! receiver                         sender
//!    | -- file-request{fileId} -->   |
//!    | <-- ready-to-upload{size} --  |
//!    | -- begin-binary ----------->  |
//!    | <== binary frames ==========  |   (paced by buffered_amount)
//!    | close once size bytes seen    |
//! ```
//!
//! Both sides stop at the first of: cancellation, channel close, an
//! `error` command, or `transfer_idle_timeout` without a frame.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::PeeringConfig;
use crate::domain::error::AerodropError;
use crate::domain::peering::{
    progress_percent, sanitize_file_name, FileMetadata, TransferCommand, TransferState,
};

use super::ports::{ChannelEvent, ChannelMessage, ChannelState, DataChannel, FileSource};

/// Cap on the up-front allocation for an incoming file.
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEnd {
    Complete,
    Cancelled,
    Failed(AerodropError),
}

impl TransferEnd {
    pub fn state(&self) -> TransferState {
        match self {
            Self::Complete => TransferState::Complete,
            Self::Cancelled => TransferState::Cancelled,
            Self::Failed(_) => TransferState::Errored,
        }
    }
}

/// What a transfer task tells its session.
#[derive(Debug)]
pub enum TransferReport {
    UploadStarted {
        file_id: String,
    },
    Progress {
        file_id: String,
        direction: Direction,
        percent: u8,
    },
    Received {
        file_id: String,
        metadata: FileMetadata,
        data: Bytes,
        saved_to: Option<PathBuf>,
    },
    Finished {
        file_id: String,
        direction: Direction,
        generation: u64,
        end: TransferEnd,
    },
}

/// Everything a transfer task owns.
pub struct Transfer {
    pub file_id: String,
    /// Distinguishes a replaced transfer from its successor.
    pub generation: u64,
    pub channel: Arc<dyn DataChannel>,
    pub events: mpsc::Receiver<ChannelEvent>,
    pub config: Arc<PeeringConfig>,
    pub cancel: CancellationToken,
    pub progress: watch::Sender<u8>,
    pub reports: mpsc::UnboundedSender<TransferReport>,
}

enum Step {
    Cancelled,
    Stalled,
    Event(Option<ChannelEvent>),
}

pub fn spawn_download(transfer: Transfer, metadata: FileMetadata) {
    tokio::spawn(async move {
        let (file_id, generation) = (transfer.file_id.clone(), transfer.generation);
        let (channel, reports) = (Arc::clone(&transfer.channel), transfer.reports.clone());
        let end = download(transfer, metadata).await;
        channel.close().await;
        log_end(&file_id, Direction::Download, &end);
        let _ = reports.send(TransferReport::Finished {
            file_id,
            direction: Direction::Download,
            generation,
            end,
        });
    });
}

pub fn spawn_upload(transfer: Transfer, source: Arc<dyn FileSource>) {
    tokio::spawn(async move {
        let (file_id, generation) = (transfer.file_id.clone(), transfer.generation);
        let (channel, reports) = (Arc::clone(&transfer.channel), transfer.reports.clone());
        let end = upload(transfer, source).await;
        channel.close().await;
        log_end(&file_id, Direction::Upload, &end);
        let _ = reports.send(TransferReport::Finished {
            file_id,
            direction: Direction::Upload,
            generation,
            end,
        });
    });
}

fn log_end(file_id: &str, direction: Direction, end: &TransferEnd) {
    let state = end.state();
    match end {
        TransferEnd::Failed(e) => warn!(%file_id, ?direction, ?state, "Transfer failed: {e}"),
        _ => info!(%file_id, ?direction, ?state, "Transfer finished"),
    }
}

// ---------------------------------------------------------------------------
// Receiving side
// ---------------------------------------------------------------------------

async fn download(mut t: Transfer, metadata: FileMetadata) -> TransferEnd {
    let mut state = TransferState::Opening;
    if t.channel.state() != ChannelState::Open {
        debug!(file_id = %t.file_id, ?state, "Waiting for the channel to open");
        if let Err(end) = t.wait_open().await {
            return end;
        }
    }
    let request = TransferCommand::FileRequest {
        file_id: t.file_id.clone(),
    };
    if let Err(e) = t.send_command(&request).await {
        return t.fail(e);
    }
    state = TransferState::AwaitReady;
    debug!(file_id = %t.file_id, ?state, "Requested file");

    let mut expected = 0u64;
    let mut data = BytesMut::new();
    let mut chunks = 0usize;

    loop {
        let event = match t.next_event().await {
            Step::Cancelled => return TransferEnd::Cancelled,
            Step::Stalled => return t.fail("transfer stalled"),
            Step::Event(event) => event,
        };
        match event {
            None | Some(ChannelEvent::Closed) => {
                debug!(file_id = %t.file_id, received = data.len(), "Sender closed the channel");
                return t.closed_during(state);
            }
            Some(ChannelEvent::Open) => {}
            Some(ChannelEvent::Error(e)) => return t.fail(e),
            Some(ChannelEvent::Message(ChannelMessage::Text(text))) => {
                match TransferCommand::decode(&text) {
                    Ok(TransferCommand::ReadyToUpload { buffer_size })
                        if state == TransferState::AwaitReady =>
                    {
                        if buffer_size != metadata.size {
                            warn!(file_id = %t.file_id, offered = metadata.size, buffer_size, "Size differs from offer");
                        }
                        expected = buffer_size;
                        state = TransferState::Streaming;
                        data.reserve(expected.min(MAX_PREALLOCATION) as usize);
                        if let Err(e) = t.send_command(&TransferCommand::BeginBinary).await {
                            return t.fail(e);
                        }
                        if expected == 0 {
                            break;
                        }
                    }
                    Ok(TransferCommand::Error { message }) => return t.fail(message),
                    Ok(other) => warn!(file_id = %t.file_id, ?other, "Unexpected transfer command"),
                    Err(e) => warn!(file_id = %t.file_id, "{e}"),
                }
            }
            Some(ChannelEvent::Message(ChannelMessage::Binary(chunk))) => {
                if state != TransferState::Streaming {
                    warn!(file_id = %t.file_id, "Binary frame before begin-binary");
                    continue;
                }
                data.extend_from_slice(&chunk);
                chunks += 1;
                let received = data.len() as u64;
                trace!(file_id = %t.file_id, received, expected, "Chunk");
                if received > expected {
                    return t.fail("received more bytes than advertised");
                }
                t.report_progress(Direction::Download, received, expected);
                if received == expected {
                    break;
                }
            }
        }
    }

    if expected == 0 {
        t.report_progress(Direction::Download, 0, 0);
    }
    let data = data.freeze();
    debug!(file_id = %t.file_id, bytes = data.len(), chunks, "Download complete");

    let mut saved_to = None;
    let mut save_error = None;
    if let Some(dir) = &t.config.download_dir {
        match save_received(dir, &metadata, &data).await {
            Ok(path) => saved_to = Some(path),
            Err(e) => save_error = Some(e),
        }
    }
    let _ = t.reports.send(TransferReport::Received {
        file_id: t.file_id.clone(),
        metadata,
        data,
        saved_to,
    });
    match save_error {
        Some(e) => {
            error!(file_id = %t.file_id, "Could not save download: {e:#}");
            t.fail(format!("could not save file: {e}"))
        }
        None => TransferEnd::Complete,
    }
}

/// Write a received file into `dir` under its sanitized name.
pub async fn save_received(dir: &Path, metadata: &FileMetadata, data: &[u8]) -> anyhow::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(sanitize_file_name(&metadata.name));
    tokio::fs::write(&path, data).await?;
    Ok(path)
}

// ---------------------------------------------------------------------------
// Sending side
// ---------------------------------------------------------------------------

async fn upload(mut t: Transfer, source: Arc<dyn FileSource>) -> TransferEnd {
    let size = source.metadata().size;
    let mut state = TransferState::AwaitRequest;

    loop {
        let event = match t.next_event().await {
            Step::Cancelled => return TransferEnd::Cancelled,
            Step::Stalled => return t.fail("no file request"),
            Step::Event(event) => event,
        };
        match event {
            None | Some(ChannelEvent::Closed) => return t.closed_during(state),
            Some(ChannelEvent::Error(e)) => return t.fail(e),
            Some(ChannelEvent::Message(ChannelMessage::Text(text))) => {
                match TransferCommand::decode(&text) {
                    Ok(TransferCommand::FileRequest { file_id }) if file_id == t.file_id => break,
                    Ok(TransferCommand::FileRequest { file_id }) => {
                        let _ = t
                            .send_command(&TransferCommand::Error {
                                message: "File not found".into(),
                            })
                            .await;
                        return t.fail(format!("request for unknown file {file_id}"));
                    }
                    Ok(other) => warn!(file_id = %t.file_id, ?other, "Unexpected transfer command"),
                    Err(e) => warn!(file_id = %t.file_id, "{e}"),
                }
            }
            Some(_) => {}
        }
    }

    let _ = t.reports.send(TransferReport::UploadStarted {
        file_id: t.file_id.clone(),
    });
    if let Err(e) = t
        .send_command(&TransferCommand::ReadyToUpload { buffer_size: size })
        .await
    {
        return t.fail(e);
    }

    // Await begin-binary.
    loop {
        let event = match t.next_event().await {
            Step::Cancelled => return TransferEnd::Cancelled,
            Step::Stalled => return t.fail("receiver never began"),
            Step::Event(event) => event,
        };
        match event {
            None | Some(ChannelEvent::Closed) => return t.closed_during(state),
            Some(ChannelEvent::Error(e)) => return t.fail(e),
            Some(ChannelEvent::Message(ChannelMessage::Text(text))) => {
                match TransferCommand::decode(&text) {
                    Ok(TransferCommand::BeginBinary) => break,
                    Ok(TransferCommand::Error { message }) => return t.fail(message),
                    Ok(other) => warn!(file_id = %t.file_id, ?other, "Unexpected transfer command"),
                    Err(e) => warn!(file_id = %t.file_id, "{e}"),
                }
            }
            Some(_) => {}
        }
    }

    state = TransferState::Streaming;
    debug!(file_id = %t.file_id, size, ?state, "Receiver began");
    let chunk_size = t.config.chunk_size.max(1) as u64;
    let mut offset = 0u64;
    while offset < size {
        if let Some(end) = t.interruption() {
            return end;
        }

        let len = (size - offset).min(chunk_size) as usize;
        let read = tokio::select! {
            biased;
            _ = t.cancel.cancelled() => return TransferEnd::Cancelled,
            read = source.read_chunk(offset, len) => read,
        };
        let chunk = match read {
            Ok(chunk) if !chunk.is_empty() => chunk,
            Ok(_) => return t.read_failed("unexpected end of file").await,
            Err(e) => return t.read_failed(e).await,
        };

        offset += chunk.len() as u64;
        if let Err(e) = t.channel.send(ChannelMessage::Binary(chunk)).await {
            if t.channel.state() == ChannelState::Closed {
                return t.closed_during(state);
            }
            return t.fail(e);
        }
        t.report_progress(Direction::Upload, offset, size);

        if t.channel.buffered_amount() > t.config.buffered_amount_high {
            trace!(file_id = %t.file_id, buffered = t.channel.buffered_amount(), "Waiting for the channel to drain");
            tokio::select! {
                biased;
                _ = t.cancel.cancelled() => return TransferEnd::Cancelled,
                _ = t.channel.wait_buffered_below(t.config.buffered_amount_low) => {}
            }
        }
    }
    if size == 0 {
        t.report_progress(Direction::Upload, 0, 0);
    }

    // The receiver closes the channel once it holds every byte.
    loop {
        match t.next_event().await {
            Step::Cancelled => return TransferEnd::Cancelled,
            Step::Stalled => {
                warn!(file_id = %t.file_id, "Receiver never closed the channel");
                return TransferEnd::Complete;
            }
            Step::Event(None | Some(ChannelEvent::Closed)) => return TransferEnd::Complete,
            Step::Event(Some(ChannelEvent::Error(e))) => return t.fail(e),
            Step::Event(Some(ChannelEvent::Message(ChannelMessage::Text(text)))) => {
                if let Ok(TransferCommand::Error { message }) = TransferCommand::decode(&text) {
                    return t.fail(message);
                }
            }
            Step::Event(Some(_)) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Shared plumbing
// ---------------------------------------------------------------------------

impl Transfer {
    async fn next_event(&mut self) -> Step {
        let Self {
            events,
            cancel,
            config,
            ..
        } = self;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Step::Cancelled,
            event = timeout(config.transfer_idle_timeout, events.recv()) => match event {
                Ok(event) => Step::Event(event),
                Err(_) => Step::Stalled,
            },
        }
    }

    async fn wait_open(&mut self) -> Result<(), TransferEnd> {
        let Self {
            events,
            cancel,
            config,
            ..
        } = self;
        let opened = async {
            loop {
                match events.recv().await {
                    Some(ChannelEvent::Open) => return true,
                    Some(ChannelEvent::Closed | ChannelEvent::Error(_)) | None => return false,
                    Some(ChannelEvent::Message(_)) => {}
                }
            }
        };
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferEnd::Cancelled),
            opened = timeout(config.channel_open_timeout, opened) => opened,
        };
        match opened {
            Ok(true) => Ok(()),
            Ok(false) => Err(self.fail("channel closed before opening")),
            Err(_) => Err(self.fail("timed out opening channel")),
        }
    }

    /// Cancellation, closure or an error command seen without waiting.
    fn interruption(&mut self) -> Option<TransferEnd> {
        if self.cancel.is_cancelled() {
            return Some(TransferEnd::Cancelled);
        }
        loop {
            match self.events.try_recv() {
                Ok(ChannelEvent::Closed) | Err(TryRecvError::Disconnected) => {
                    return Some(TransferEnd::Cancelled)
                }
                Ok(ChannelEvent::Error(e)) => return Some(self.fail(e)),
                Ok(ChannelEvent::Message(ChannelMessage::Text(text))) => {
                    if let Ok(TransferCommand::Error { message }) = TransferCommand::decode(&text) {
                        return Some(self.fail(message));
                    }
                }
                Ok(_) => {}
                Err(TryRecvError::Empty) => return None,
            }
        }
    }

    async fn send_command(&self, command: &TransferCommand) -> anyhow::Result<()> {
        self.channel.send(ChannelMessage::Text(command.encode())).await
    }

    async fn read_failed(&self, reason: impl std::fmt::Display) -> TransferEnd {
        error!(file_id = %self.file_id, "Error reading file: {reason}");
        let _ = self
            .send_command(&TransferCommand::Error {
                message: "Error reading file".into(),
            })
            .await;
        self.fail(format!("error reading file: {reason}"))
    }

    fn report_progress(&self, direction: Direction, done: u64, total: u64) {
        let percent = progress_percent(done, total);
        self.progress.send_replace(percent);
        let _ = self.reports.send(TransferReport::Progress {
            file_id: self.file_id.clone(),
            direction,
            percent,
        });
    }

    /// The peer closed the channel before the transfer completed.
    fn closed_during(&self, state: TransferState) -> TransferEnd {
        debug!(file_id = %self.file_id, ?state, "Channel closed early");
        TransferEnd::Cancelled
    }

    fn fail(&self, reason: impl std::fmt::Display) -> TransferEnd {
        TransferEnd::Failed(AerodropError::transfer(&self.file_id, reason.to_string()))
    }
}
