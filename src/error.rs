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

//! User-visible controller errors and the transient error feed.

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

/// Failures reported to the user. The display text is the message shown.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerError {
    #[error("Bluetooth is off. Turn it on and try again.")]
    RadioDisabled,

    #[error("Missing Bluetooth permissions. Grant them and try again.")]
    Unauthorized,

    #[error("Timed out waiting for a peer to connect.")]
    AcceptTimeout,

    #[error("Could not start listening for connections.")]
    ListenFailed,

    #[error("Could not connect. Make sure the device is in range and accepts pairing.")]
    ConnectFailed,

    #[error("Timed out connecting to the device.")]
    ConnectTimeout,

    #[error("Communication session terminated.")]
    SessionTerminated,

    #[error("Received a message that could not be read.")]
    MalformedFrame,

    #[error("Sending the message failed.")]
    SendFailed,
}

/// Fire-and-forget broadcast of transient error messages.
///
/// Messages are not retained for later subscribers. A subscriber that falls
/// more than `capacity` messages behind loses the oldest ones.
#[derive(Debug, Clone)]
pub struct ErrorFeed {
    tx: broadcast::Sender<String>,
}

impl ErrorFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an error. Never blocks and never fails.
    pub fn emit(&self, error: ControllerError) {
        warn!("{}", error);
        let _ = self.tx.send(error.to_string());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_is_harmless() {
        let feed = ErrorFeed::new(20);
        feed.emit(ControllerError::SendFailed);
    }

    #[test]
    fn test_subscriber_receives_display_text() {
        let feed = ErrorFeed::new(20);
        let mut rx = feed.subscribe();

        feed.emit(ControllerError::RadioDisabled);

        assert_eq!(
            rx.try_recv().unwrap(),
            ControllerError::RadioDisabled.to_string()
        );
    }

    #[test]
    fn test_slow_subscriber_drops_oldest() {
        let feed = ErrorFeed::new(2);
        let mut rx = feed.subscribe();

        feed.emit(ControllerError::AcceptTimeout);
        feed.emit(ControllerError::ConnectFailed);
        feed.emit(ControllerError::SendFailed);

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(1))
        ));
        assert_eq!(rx.try_recv().unwrap(), ControllerError::ConnectFailed.to_string());
        assert_eq!(rx.try_recv().unwrap(), ControllerError::SendFailed.to_string());
    }
}
