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

//! Service running all simulator circuits of a client inside a reactor.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crossbeam_channel as chan;

use crate::messages::{self, SessionKeys, START_PING_CHECK};
use crate::packet::Packet;
use crate::{Action, ConnectionEvent, Error, Handler, Resource, SimConfig, SimConnection, Timestamp};

/// Commands accepted by [`SimService`] through a [`crate::Controller`].
#[derive(Clone, Debug)]
pub enum Command {
    /// Open a circuit to a simulator.
    Connect { endpoint: SocketAddr, code: u32 },
    /// Send a packet over an open circuit.
    Send { endpoint: SocketAddr, packet: Packet },
    /// Close a circuit.
    Disconnect(SocketAddr),
    /// Close all circuits and stop the reactor.
    Shutdown,
}

/// Reason a circuit has ended.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum DisconnectReason {
    #[display("client initiated")]
    ClientInitiated,
    #[display("server initiated")]
    ServerInitiated,
    #[display("network timeout")]
    NetworkTimeout,
    #[display("socket error")]
    SocketError,
}

/// Events delivered to the application.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum SimEvent {
    /// The simulator has answered on the circuit.
    Connected(SocketAddr),
    /// Application-level packet received from the simulator.
    Packet(SocketAddr, Packet),
    /// Circuit is closed; no further events for the endpoint follow.
    Disconnected(SocketAddr, DisconnectReason),
}

#[derive(Copy, Clone, Debug)]
struct Circuit {
    code: u32,
    closing: Option<DisconnectReason>,
}

/// [`Handler`] owning the state of all simulator circuits.
///
/// Circuits are identified by the simulator endpoint, so at most one circuit per endpoint exists
/// at any time. Pings are answered by the service; everything else received from the simulators
/// is forwarded to the application as [`SimEvent`]s.
pub struct SimService {
    config: SimConfig,
    keys: SessionKeys,
    circuits: BTreeMap<SocketAddr, Circuit>,
    actions: VecDeque<Action<SimConnection>>,
    events: chan::Sender<SimEvent>,
    terminating: bool,
}

impl SimService {
    pub fn new(config: SimConfig, keys: SessionKeys, events: chan::Sender<SimEvent>) -> Self {
        let mut actions = VecDeque::new();
        actions.push_back(Action::SetTimer(config.housekeeping_interval));
        SimService {
            config,
            keys,
            circuits: empty!(),
            actions,
            events,
            terminating: false,
        }
    }

    /// Endpoints of the circuits which are open or being closed.
    pub fn endpoints(&self) -> impl Iterator<Item = &SocketAddr> { self.circuits.keys() }

    /// Circuit code of the circuit to the endpoint.
    pub fn circuit_code(&self, endpoint: SocketAddr) -> Option<u32> {
        self.circuits.get(&endpoint).map(|circuit| circuit.code)
    }

    fn emit(&self, event: SimEvent) {
        if self.events.send(event).is_err() {
            #[cfg(feature = "log")]
            log::warn!(target: "sim-service", "Application has dropped the event receiver");
        }
    }

    fn connect(&mut self, endpoint: SocketAddr, code: u32) {
        if self.terminating {
            #[cfg(feature = "log")]
            log::warn!(target: "sim-service", "Ignoring connection to {endpoint} during shutdown");
            return;
        }
        if let Some(circuit) = self.circuits.get(&endpoint) {
            #[cfg(feature = "log")]
            log::warn!(target: "sim-service", "Circuit {} to {endpoint} already exists, ignoring circuit {code}", circuit.code);
            return;
        }

        let mut sim = SimConnection::with_config(endpoint, code, self.config);
        let res = sim.connect().map_err(Into::into).and_then(|_| {
            sim.send_packet(messages::use_circuit_code(code, self.keys), Timestamp::now())
        });
        if let Err(err) = res {
            #[cfg(feature = "log")]
            log::error!(target: "sim-service", "Unable to open circuit {code} to {endpoint}: {err}");
            self.emit(SimEvent::Disconnected(endpoint, DisconnectReason::SocketError));
            return;
        }

        self.circuits.insert(endpoint, Circuit {
            code,
            closing: None,
        });
        self.actions.push_back(Action::RegisterTransport(sim));
    }

    fn close(&mut self, endpoint: SocketAddr, reason: DisconnectReason) {
        let Some(circuit) = self.circuits.get_mut(&endpoint) else {
            #[cfg(feature = "log")]
            log::warn!(target: "sim-service", "No circuit to {endpoint}");
            return;
        };
        if circuit.closing.is_some() {
            return;
        }
        #[cfg(feature = "log")]
        log::debug!(target: "sim-service", "Closing circuit {} to {endpoint} ({reason})", circuit.code);
        circuit.closing = Some(reason);
        self.actions.push_back(Action::UnregisterTransport(endpoint));
    }

    fn closed(&mut self, endpoint: SocketAddr, reason: DisconnectReason) {
        #[cfg(feature = "log")]
        log::info!(target: "sim-service", "Circuit to {endpoint} is closed ({reason})");

        self.emit(SimEvent::Disconnected(endpoint, reason));
        if self.terminating && self.circuits.is_empty() {
            self.actions.push_back(Action::Terminate);
        }
    }

    fn handle_packet(&mut self, endpoint: SocketAddr, packet: Packet) {
        if packet.message != START_PING_CHECK {
            self.emit(SimEvent::Packet(endpoint, packet));
            return;
        }
        match messages::parse_start_ping_check(&packet.body) {
            Ok((ping_id, oldest_unacked)) => {
                #[cfg(feature = "log")]
                log::trace!(target: "sim-service", "Ping {ping_id} from {endpoint}, oldest unacked #{oldest_unacked}");
                self.actions
                    .push_back(Action::Send(endpoint, messages::complete_ping_check(ping_id)));
            }
            Err(err) => {
                #[cfg(feature = "log")]
                log::warn!(target: "sim-service", "Invalid ping from {endpoint}: {err}");
            }
        }
    }
}

impl Iterator for SimService {
    type Item = Action<SimConnection>;

    fn next(&mut self) -> Option<Self::Item> { self.actions.pop_front() }
}

impl Handler for SimService {
    type Transport = SimConnection;
    type Command = Command;

    fn tick(&mut self, time: Timestamp) {}

    fn handle_timer(&mut self) {
        if !self.terminating {
            self.actions.push_back(Action::SetTimer(self.config.housekeeping_interval));
        }
    }

    fn handle_transport_event(&mut self, id: SocketAddr, event: ConnectionEvent, time: Timestamp) {
        match event {
            ConnectionEvent::Established => self.emit(SimEvent::Connected(id)),
            ConnectionEvent::Packets(packets) => {
                for packet in packets {
                    self.handle_packet(id, packet);
                }
            }
            ConnectionEvent::Closed => self.close(id, DisconnectReason::ServerInitiated),
            ConnectionEvent::TimedOut => self.close(id, DisconnectReason::NetworkTimeout),
            ConnectionEvent::Failed(err) => {
                #[cfg(feature = "log")]
                log::error!(target: "sim-service", "Circuit to {id} has failed: {err}");
                self.close(id, DisconnectReason::SocketError)
            }
        }
    }

    fn handle_registered(&mut self, fd: RawFd, id: SocketAddr) {
        #[cfg(feature = "log")]
        log::debug!(target: "sim-service", "Circuit to {id} is polled (fd={fd})");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { endpoint, code } => self.connect(endpoint, code),
            Command::Send { endpoint, packet } => match self.circuits.get(&endpoint) {
                Some(Circuit { closing: None, .. }) => {
                    self.actions.push_back(Action::Send(endpoint, packet))
                }
                _ => {
                    #[cfg(feature = "log")]
                    log::warn!(target: "sim-service", "Dropping {} packet to {endpoint}: no open circuit", packet.message);
                }
            },
            Command::Disconnect(endpoint) => self.close(endpoint, DisconnectReason::ClientInitiated),
            Command::Shutdown => {
                #[cfg(feature = "log")]
                log::info!(target: "sim-service", "Shutting down {} circuit(s)", self.circuits.len());

                self.terminating = true;
                let endpoints = self.circuits.keys().copied().collect::<Vec<_>>();
                for endpoint in endpoints {
                    self.close(endpoint, DisconnectReason::ClientInitiated);
                }
                if self.circuits.is_empty() {
                    self.actions.push_back(Action::Terminate);
                }
            }
        }
    }

    fn handle_error(&mut self, err: Error<SimConnection>) {
        match err {
            Error::TransportDisconnect(id, sim) => {
                #[cfg(feature = "log")]
                log::error!(target: "sim-service", "Circuit {} to {id} is lost", sim.code());
                self.circuits.remove(&id);
                drop(sim);
                self.closed(id, DisconnectReason::SocketError);
            }
            Error::Poll(err) => {
                #[cfg(feature = "log")]
                log::error!(target: "sim-service", "Polling has failed: {err}");
            }
        }
    }

    fn handover_transport(&mut self, id: SocketAddr, sim: SimConnection) {
        let Some(circuit) = self.circuits.remove(&id) else {
            #[cfg(feature = "log")]
            log::warn!(target: "sim-service", "Dropping unknown circuit to {id}");
            return;
        };
        let reason = circuit.closing.unwrap_or(DisconnectReason::ClientInitiated);
        if reason == DisconnectReason::ClientInitiated {
            if let Err(err) = sim.disconnect() {
                #[cfg(feature = "log")]
                log::warn!(target: "sim-service", "Unable to notify {id} about closed circuit: {err}");
            }
        }
        self.closed(id, reason);
    }
}
