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

//! Peer-to-peer Bluetooth chat.
//!
//! [`bluetooth::Controller`] discovers nearby devices, listens for or dials
//! a peer on the chat service and exchanges `sender^text` messages with it.

pub mod bluetooth;
pub mod config;
pub mod devices;
pub mod error;
pub mod state;
pub mod timer;

pub use bluetooth::{ConnectionAttempt, ConnectionOutcome, Controller, Message};
pub use config::Config;
pub use devices::Peer;
pub use error::ControllerError;
pub use state::{ConnectionStatus, ControllerState};
