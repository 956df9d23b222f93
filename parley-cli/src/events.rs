//! Client side of the NDJSON event stream served by `/api/chat`.
//!
//! [`EventStreamClient`] pulls byte chunks, splits them into lines and hands
//! typed [`StreamEvent`]s to the listeners registered with
//! [`EventStreamClient::on`]. Every run ends in a single [`Terminal`]: the
//! terminal event (if it is not `end` itself) is dispatched, then `end`, and
//! only then does [`Completion::wait`] resolve.

use futures_util::{Stream, StreamExt};
use parley_shared::event::WireDecodeError;
use parley_shared::{EventKind, LineDecoder, StreamEvent, StreamingError, WireEvent};
use std::collections::HashMap;
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type Listener = Box<dyn FnMut(&StreamEvent) + Send>;

#[derive(Debug, Clone, PartialEq)]
pub enum Terminal {
    End,
    Error(StreamingError),
    Abort,
}

/// Resolves once the stream reached its terminal state.
#[derive(Clone)]
pub struct Completion {
    rx: watch::Receiver<Option<Terminal>>,
}

impl Completion {
    /// `None` when the client was dropped without being run.
    pub async fn wait(mut self) -> Option<Terminal> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(terminal) => terminal.clone(),
            Err(_) => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

pub struct EventStreamClient<S> {
    stream: Pin<Box<S>>,
    cancel: CancellationToken,
    listeners: HashMap<EventKind, Vec<Listener>>,
    read_timeout: Option<Duration>,
    decoder: LineDecoder,
    done: watch::Sender<Option<Terminal>>,
}

impl<S, B, E> EventStreamClient<S>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    pub fn new(stream: S, cancel: CancellationToken) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            stream: Box::pin(stream),
            cancel,
            listeners: HashMap::new(),
            read_timeout: None,
            decoder: LineDecoder::new(),
            done,
        }
    }

    /// Fails the stream when a single read takes longer than `limit`.
    pub fn with_read_timeout(mut self, limit: Duration) -> Self {
        self.read_timeout = Some(limit);
        self
    }

    /// Listeners for the same kind run in registration order.
    pub fn on(mut self, kind: EventKind, listener: impl FnMut(&StreamEvent) + Send + 'static) -> Self {
        self.listeners
            .entry(kind)
            .or_default()
            .push(Box::new(listener));
        self
    }

    pub fn done(&self) -> Completion {
        Completion {
            rx: self.done.subscribe(),
        }
    }

    pub async fn run(mut self) -> Terminal {
        let terminal = self.pump().await;
        self.finish(terminal.clone());
        terminal
    }

    async fn pump(&mut self) -> Terminal {
        let cancel = self.cancel.clone();
        loop {
            if cancel.is_cancelled() {
                return Terminal::Abort;
            }

            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Terminal::Abort,
                read = read_chunk(&mut self.stream, self.read_timeout) => read,
            };

            let lines = match read {
                Err(limit) => return Terminal::Error(StreamingError::timeout(limit)),
                Ok(Some(Ok(bytes))) => self.decoder.decode_line(bytes.as_ref()),
                Ok(Some(Err(_))) if cancel.is_cancelled() => return Terminal::Abort,
                Ok(Some(Err(e))) => return Terminal::Error(StreamingError::generic(e.to_string())),
                Ok(None) => {
                    let rest = self.decoder.flush();
                    return self.dispatch(rest).unwrap_or_else(|| {
                        debug!("stream ended without an end event");
                        Terminal::End
                    });
                }
            };
            if let Some(terminal) = self.dispatch(lines) {
                return terminal;
            }
        }
    }

    /// Dispatches non-terminal events; returns the terminal one if a line
    /// carried it, leaving the lines after it unread.
    fn dispatch(&mut self, lines: Vec<String>) -> Option<Terminal> {
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let wire = match serde_json::from_str::<WireEvent>(&line) {
                Ok(wire) => wire,
                Err(e) => {
                    warn!(error = %e, line = %line, "malformed event line");
                    return Some(Terminal::Error(StreamingError::generic(format!(
                        "Malformed event line: {e}"
                    ))));
                }
            };
            match wire.decode() {
                Ok(StreamEvent::End) => return Some(Terminal::End),
                Ok(StreamEvent::Error(error)) => return Some(Terminal::Error(error)),
                Ok(event) => self.emit(&event),
                Err(WireDecodeError::UnknownEvent(name)) => {
                    debug!(event = %name, "skipping unknown event");
                }
                Err(e) => return Some(Terminal::Error(StreamingError::generic(e.to_string()))),
            }
        }
        None
    }

    fn emit(&mut self, event: &StreamEvent) {
        if let Some(listeners) = self.listeners.get_mut(&event.kind()) {
            for listener in listeners.iter_mut() {
                listener(event);
            }
        }
    }

    fn finish(&mut self, terminal: Terminal) {
        debug!(terminal = ?terminal, "event stream finished");
        match &terminal {
            Terminal::End => {}
            Terminal::Error(error) => self.emit(&StreamEvent::Error(error.clone())),
            Terminal::Abort => self.emit(&StreamEvent::Abort),
        }
        self.emit(&StreamEvent::End);
        self.done.send_replace(Some(terminal));
    }
}

async fn read_chunk<S: Stream + ?Sized>(
    stream: &mut Pin<Box<S>>,
    limit: Option<Duration>,
) -> Result<Option<S::Item>, Duration> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, stream.next())
            .await
            .map_err(|_| limit),
        None => Ok(stream.next().await),
    }
}
