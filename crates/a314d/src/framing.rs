//! Length-prefixed message framing for client sockets.
//!
//! Generic over the stream type: the daemon uses it for accepted TCP
//! clients and for the Unix socketpair of an on-demand service alike, and
//! service programs use it for their own end of the connection.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use a314_wire::{MSG_HEADER_LEN, MessageHeader, encode_message};

/// A complete client-protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

/// A message-framed byte stream.
pub struct Framed<S> {
    stream: S,
}

impl<S> Framed<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S> Framed<S>
where
    S: AsyncRead + Unpin,
{
    /// Receive one message.
    ///
    /// Returns `Ok(None)` on a clean end-of-stream at a message boundary;
    /// an end-of-stream inside a message is an `UnexpectedEof` error.
    pub async fn recv(&mut self) -> io::Result<Option<Message>> {
        let mut header_buf = [0u8; MSG_HEADER_LEN];
        let mut read = 0;
        while read < MSG_HEADER_LEN {
            let n = self.stream.read(&mut header_buf[read..]).await?;
            if n == 0 {
                return if read == 0 {
                    Ok(None)
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "end of stream inside a message header",
                    ))
                };
            }
            read += n;
        }

        let header = MessageHeader::decode(&header_buf);
        let mut payload = vec![0u8; header.length as usize];
        self.stream.read_exact(&mut payload).await?;

        Ok(Some(Message { header, payload }))
    }
}

impl<S> Framed<S>
where
    S: AsyncWrite + Unpin,
{
    /// Send one framed message.
    pub async fn send(&mut self, msg_type: u8, stream_id: u32, payload: &[u8]) -> io::Result<()> {
        self.stream
            .write_all(&encode_message(msg_type, stream_id, payload))
            .await
    }
}
