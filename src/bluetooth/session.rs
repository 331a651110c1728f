// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Message exchange over one established connection.

use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::protocol::{FrameError, Framing, Message};
use super::radio::RadioSocket;
use super::reassembler::FrameAssembler;
use crate::devices::Peer;

/// Why the inbound message sequence ended.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The underlying connection failed or was closed.
    #[error("Session terminated: {0}")]
    Terminated(String),

    /// The peer sent a frame that could not be decoded.
    #[error("Session aborted: {0}")]
    Malformed(#[from] FrameError),
}

/// State carried between reads of the inbound sequence.
struct Reader {
    socket: Arc<dyn RadioSocket>,
    framing: Framing,
    buf: Vec<u8>,
    assembler: FrameAssembler,
    pending: VecDeque<Vec<u8>>,
    finished: bool,
}

impl Reader {
    fn finish(mut self, err: SessionError) -> Option<(Result<Message, SessionError>, Self)> {
        if self.assembler.is_in_progress() {
            warn!(
                "Discarding {} bytes of an incomplete frame",
                self.assembler.buffer_size()
            );
            self.assembler.reset();
        }
        self.finished = true;
        Some((Err(err), self))
    }
}

/// One live connection to a peer.
pub struct SessionTransport {
    socket: Arc<dyn RadioSocket>,
    framing: Framing,
    read_buffer_size: usize,
}

impl SessionTransport {
    /// Wrap an established socket.
    pub fn new(socket: Arc<dyn RadioSocket>, framing: Framing, read_buffer_size: usize) -> Self {
        info!("Session opened with {}", socket.peer());
        Self {
            socket,
            framing,
            read_buffer_size: read_buffer_size.max(1),
        }
    }

    /// The remote peer.
    pub fn peer(&self) -> &Peer {
        self.socket.peer()
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_open()
    }

    /// Inbound messages from the peer.
    ///
    /// Ends with exactly one error: [`SessionError::Terminated`] when the
    /// connection fails, or [`SessionError::Malformed`] on an undecodable
    /// frame. Only one sequence should be consumed per connection.
    pub fn receive(&self) -> BoxStream<'static, Result<Message, SessionError>> {
        let reader = Reader {
            socket: Arc::clone(&self.socket),
            framing: self.framing,
            buf: vec![0u8; self.read_buffer_size],
            assembler: FrameAssembler::new(),
            pending: VecDeque::new(),
            finished: false,
        };

        stream::unfold(reader, |mut reader| async move {
            if reader.finished {
                return None;
            }

            loop {
                if let Some(frame) = reader.pending.pop_front() {
                    return match Message::decode(&frame, false) {
                        Ok(message) => {
                            debug!("Received message from {}", message.sender_name);
                            Some((Ok(message), reader))
                        }
                        Err(e) => {
                            error!("Dropping session on undecodable frame: {}", e);
                            reader.finish(SessionError::Malformed(e))
                        }
                    };
                }

                if !reader.socket.is_open() {
                    return reader.finish(SessionError::Terminated("connection closed".to_string()));
                }

                match reader.socket.read(&mut reader.buf).await {
                    Ok(0) => {
                        info!("Connection closed by remote");
                        return reader.finish(SessionError::Terminated("end of stream".to_string()));
                    }
                    Ok(n) => match reader.framing {
                        Framing::Raw => reader.pending.push_back(reader.buf[..n].to_vec()),
                        Framing::LengthPrefixed => {
                            let frames = reader.assembler.push(&reader.buf[..n]);
                            reader.pending.extend(frames);
                        }
                    },
                    Err(e) => {
                        info!("Read error, session over: {}", e);
                        return reader.finish(SessionError::Terminated(e.to_string()));
                    }
                }
            }
        })
        .boxed()
    }

    /// Send a message. Returns `false` if it could not be written.
    pub async fn send(&self, message: &Message) -> bool {
        let frame = match message.encode().and_then(|frame| self.framing.wrap(frame)) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to frame message: {}", e);
                return false;
            }
        };

        match self.socket.write(&frame).await {
            Ok(()) => {
                debug!("Sent {} bytes to {}", frame.len(), self.socket.peer());
                true
            }
            Err(e) => {
                error!("Failed to send message: {}", e);
                false
            }
        }
    }

    /// Close the underlying connection.
    pub fn close(&self) {
        self.socket.close();
    }
}
