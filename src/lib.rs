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

#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code,
    //missing_docs
)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Client side of simulator UDP circuits for virtual-world protocols.
//!
//! Every circuit is a [`SimConnection`]: a record owning a UDP socket connected to a simulator
//! endpoint, a fixed-size receive buffer and the outgoing sequence counter, plus the reliability
//! state of the circuit (acks, resends and duplicate suppression).
//!
//! Circuits are driven by a poll [`Reactor`] running in a dedicated thread. The reactor calls
//! the [`SimService`] for every event the circuits generate; the application talks to the
//! service with [`Command`]s sent via [`Controller`] and receives [`SimEvent`]s from a channel.
//!
//! All resources under the reactor must be representable as file descriptors.

#[macro_use]
extern crate amplify;

pub mod acks;
mod config;
mod connection;
pub mod messages;
pub mod packet;
pub mod poller;
mod reactor;
mod resource;
mod runtime;
mod service;
mod timeouts;
pub mod zerocode;

pub use config::SimConfig;
pub use connection::{ConnectionEvent, SimConnection, BUFFER_SIZE};
pub use resource::{Io, Resource, ResourceId, WriteAtomic, WriteError};
pub use service::{Command, DisconnectReason, SimEvent, SimService};
pub use timeouts::{Timer, Timestamp};

pub use self::reactor::{Controller, Reactor};
pub use self::runtime::{Action, Error, Handler, Runtime, WAIT_TIMEOUT};
