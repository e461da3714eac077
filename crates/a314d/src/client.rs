//! Client connections.
//!
//! Each connected client gets a reader task and a writer task; both talk to
//! the driver exclusively through message passing, so all daemon state
//! stays owned by the driver. The single event channel from all clients
//! preserves per-client ordering, and the egress queue per client preserves
//! outbound ordering.

use std::collections::HashSet;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use a314_wire::{MessageHeader, encode_message};

use crate::framing::Framed;

/// Stable identifier the driver assigns to a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u32);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client:{}", self.0)
    }
}

/// What a client's I/O tasks report back to the driver.
#[derive(Debug)]
pub(crate) enum ClientEvent {
    /// A complete framed message arrived.
    Message {
        client: ClientId,
        header: MessageHeader,
        payload: Vec<u8>,
    },
    /// The client went away (EOF or connection reset).
    Disconnected { client: ClientId },
    /// An I/O error the daemon does not tolerate.
    Fatal { client: ClientId, error: io::Error },
}

/// Driver-side state for one client connection.
pub(crate) struct Client {
    egress: mpsc::UnboundedSender<Vec<u8>>,
    next_stream_id: u32,
    /// Channels currently associated with this client.
    pub(crate) channels: HashSet<u8>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Client {
    /// Take ownership of a connected stream, spawning its I/O tasks.
    pub(crate) fn spawn<S>(
        id: ClientId,
        stream: S,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let (egress, mut egress_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let reader_events = events.clone();
        let reader = tokio::spawn(async move {
            let mut framed = Framed::new(read_half);
            loop {
                match framed.recv().await {
                    Ok(Some(msg)) => {
                        let sent = reader_events.send(ClientEvent::Message {
                            client: id,
                            header: msg.header,
                            payload: msg.payload,
                        });
                        if sent.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        let _ = reader_events.send(ClientEvent::Disconnected { client: id });
                        return;
                    }
                    Err(error) => {
                        let event = match error.kind() {
                            io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof => {
                                ClientEvent::Disconnected { client: id }
                            }
                            _ => ClientEvent::Fatal { client: id, error },
                        };
                        let _ = reader_events.send(event);
                        return;
                    }
                }
            }
        });

        let writer = tokio::spawn(async move {
            while let Some(buf) = egress_rx.recv().await {
                if let Err(error) = write_half.write_all(&buf).await {
                    let event = match error.kind() {
                        io::ErrorKind::ConnectionReset => {
                            ClientEvent::Disconnected { client: id }
                        }
                        _ => ClientEvent::Fatal { client: id, error },
                    };
                    let _ = events.send(event);
                    return;
                }
            }
        });

        Self {
            egress,
            next_stream_id: 1,
            channels: HashSet::new(),
            reader,
            writer,
        }
    }

    /// Allocate the next stream id for an association. Daemon-allocated ids
    /// are odd and step by two; the peer-allocated namespace is even.
    pub(crate) fn alloc_stream_id(&mut self) -> u32 {
        let id = self.next_stream_id;
        self.next_stream_id += 2;
        id
    }

    /// Queue a framed message for this client.
    ///
    /// A failed send means the writer is already gone; the disconnect event
    /// is on its way, so the message is simply dropped.
    pub(crate) fn send_msg(&self, msg_type: u8, stream_id: u32, payload: &[u8]) {
        let _ = self.egress.send(encode_message(msg_type, stream_id, payload));
    }

    /// Stop both I/O tasks. Called on teardown; the writer is past caring
    /// about queued output at this point.
    pub(crate) fn abort_io(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}
