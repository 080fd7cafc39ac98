// Simulator UDP circuits for virtual-world clients driven by a poll reactor.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::os::unix::io::AsRawFd;
use std::{io, net};

use crate::packet::EncodeError;
use crate::poller::IoType;
use crate::Timestamp;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Io {
    Read,
    Write,
}

pub trait ResourceId: Copy + Eq + Ord + Hash + Send + Debug + Display {}

impl ResourceId for net::SocketAddr {}

/// I/O resource which can be registered with the reactor.
pub trait Resource: AsRawFd + WriteAtomic + Send {
    type Id: ResourceId;
    type Event;
    /// Outbound unit the resource knows how to serialize and write out.
    type Message;

    fn id(&self) -> Self::Id;
    fn interests(&self) -> IoType;

    /// Processes I/O readiness, returning resource-specific events (possibly none).
    fn handle_io(&mut self, io: Io) -> Vec<Self::Event>;

    /// Time-driven housekeeping, called by the reactor each time any of its timers fires.
    fn handle_timer(&mut self, time: Timestamp) -> Vec<Self::Event>;

    fn send(&mut self, msg: Self::Message, time: Timestamp) -> Result<(), WriteError>;

    fn disconnect(self) -> io::Result<()>;
}

/// Failure to hand a datagram over to a resource.
#[derive(Debug, Display, Error, From)]
pub enum WriteError {
    /// Resource has no socket or its circuit is over. Handlers get it only when sending to a
    /// circuit they should have considered closed.
    #[display("resource not ready to accept the data")]
    NotReady,

    /// Message can't be serialized; nothing was written.
    #[display(inner)]
    #[from]
    Encode(EncodeError),

    /// OS error from the underlying socket.
    #[display(inner)]
    #[from]
    Io(io::Error),
}

/// Writes which either deliver a whole unit of data or none of it.
///
/// Data which can't be written right away is buffered by the implementor and flushed, in the
/// original order, on the next write readiness.
pub trait WriteAtomic: io::Write {
    fn write_atomic(&mut self, buf: &[u8]) -> Result<(), WriteError> {
        if !self.is_ready_to_write() {
            return Err(WriteError::NotReady);
        }
        self.write_or_buf(buf).map_err(WriteError::from)
    }

    fn is_ready_to_write(&self) -> bool;

    /// Flushes buffered data without blocking; [`io::ErrorKind::WouldBlock`] means the rest stays
    /// buffered.
    ///
    /// # Returns
    ///
    /// Whether there was anything buffered.
    fn empty_write_buf(&mut self) -> io::Result<bool>;

    /// Writes the data or buffers it if the resource would block.
    fn write_or_buf(&mut self, buf: &[u8]) -> io::Result<()>;
}
