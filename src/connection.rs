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

//! Connection to a single simulator.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::io::{self, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::acks::AckTracker;
use crate::messages::{self, CLOSE_CIRCUIT, PACKET_ACK};
use crate::packet::{Packet, MAX_APPENDED_ACKS};
use crate::poller::IoType;
use crate::{Io, Resource, SimConfig, Timestamp, WriteAtomic, WriteError};

/// Size of the staging buffer for inbound datagrams.
pub const BUFFER_SIZE: usize = 2048;

/// Events generated by a [`SimConnection`] for the service running it.
#[derive(Debug, Display)]
pub enum ConnectionEvent {
    /// The first datagram from the simulator has arrived.
    #[display("established")]
    Established,

    /// Fresh packets received from the simulator, with duplicates and acks already processed.
    #[display("packets({0:?})")]
    Packets(Vec<Packet>),

    /// Simulator has closed the circuit.
    #[display("closed")]
    Closed,

    /// Nothing was received from the simulator for too long.
    #[display("timed_out")]
    TimedOut,

    /// Socket has failed.
    #[display("failed({0})")]
    Failed(io::Error),
}

/// UDP circuit to a simulator.
///
/// Two connections are equal when they point to the same endpoint; circuit code, socket,
/// sequence and delivery state do not participate in the comparison.
///
/// The socket, if opened, and the buffer are owned by the connection and released when it is
/// dropped or [`Resource::disconnect`]ed.
///
/// Acks for inbound reliable packets are piggybacked on the next outgoing packet; those still
/// pending at the next housekeeping round leave in a dedicated `PacketAck`.
pub struct SimConnection {
    endpoint: SocketAddr,
    code: u32,
    socket: Option<UdpSocket>,
    buffer: Box<[u8; BUFFER_SIZE]>,
    sequence: u16,
    running: bool,
    connected: bool,
    config: SimConfig,
    acks: AckTracker,
    outbox: VecDeque<Vec<u8>>,
    last_received: Timestamp,
}

impl Debug for SimConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimConnection")
            .field("endpoint", &self.endpoint)
            .field("code", &self.code)
            .field("socket", &self.socket)
            .field("sequence", &self.sequence)
            .field("running", &self.running)
            .field("connected", &self.connected)
            .field("unacked", &self.acks.unacked_len())
            .field("queued", &self.outbox.len())
            .finish()
    }
}

impl Default for SimConnection {
    fn default() -> Self { SimConnection::new() }
}

impl PartialEq for SimConnection {
    fn eq(&self, other: &Self) -> bool { self.endpoint == other.endpoint }
}

impl Eq for SimConnection {}

impl SimConnection {
    /// Creates unconnected record with an unspecified endpoint and zero circuit code.
    pub fn new() -> Self {
        SimConnection::with(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)), 0)
    }

    pub fn with(endpoint: SocketAddr, code: u32) -> Self {
        SimConnection::with_config(endpoint, code, SimConfig::default())
    }

    pub fn with_config(endpoint: SocketAddr, code: u32, config: SimConfig) -> Self {
        SimConnection {
            endpoint,
            code,
            socket: None,
            buffer: Box::new([0u8; BUFFER_SIZE]),
            sequence: 1,
            running: true,
            connected: false,
            config,
            acks: AckTracker::new(config.inbox_window),
            outbox: empty!(),
            last_received: Timestamp::now(),
        }
    }

    pub fn endpoint(&self) -> SocketAddr { self.endpoint }
    pub fn code(&self) -> u32 { self.code }
    /// Sequence number the next outgoing packet will get.
    pub fn sequence(&self) -> u16 { self.sequence }
    pub fn is_running(&self) -> bool { self.running }
    /// Whether anything was received from the simulator yet.
    pub fn is_connected(&self) -> bool { self.connected }
    pub fn has_socket(&self) -> bool { self.socket.is_some() }
    pub fn config(&self) -> &SimConfig { &self.config }
    /// Staging buffer for inbound datagrams.
    pub fn buffer(&self) -> &[u8] { &self.buffer[..] }
    pub fn acks(&self) -> &AckTracker { &self.acks }

    /// Opens a non-blocking UDP socket connected to the endpoint. Does nothing if the socket is
    /// already open.
    pub fn connect(&mut self) -> io::Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        let local = match self.endpoint {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(self.endpoint)?;
        socket.set_nonblocking(true)?;

        #[cfg(feature = "log")]
        log::debug!(target: "simconn", "Opened circuit {} to {} from {}", self.code, self.endpoint, socket.local_addr()?);

        self.socket = Some(socket);
        self.running = true;
        self.last_received = Timestamp::now();
        Ok(())
    }

    /// Local address of the socket, if opened.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|socket| socket.local_addr().ok())
    }

    /// Returns the current sequence number and advances the counter.
    pub fn next_sequence(&mut self) -> u16 {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        sequence
    }

    /// Sends packet to the simulator.
    ///
    /// Assigns the packet the next sequence number, piggybacks pending acks and, if the packet is
    /// reliable, keeps it for resending until acknowledged.
    ///
    /// # Returns
    ///
    /// Sequence number given to the packet.
    ///
    /// # Errors
    ///
    /// [`WriteError::Encode`] for a message id which can't be written; neither the sequence number
    /// nor pending acks are consumed then. On an I/O error the acks taken for the packet are put
    /// back for the next one.
    pub fn send_packet(&mut self, mut packet: Packet, now: Timestamp) -> Result<u16, WriteError> {
        if !self.is_ready_to_write() {
            return Err(WriteError::NotReady);
        }
        packet.message.validate()?;
        packet.sequence = self.next_sequence();
        if packet.message != PACKET_ACK {
            packet.acks =
                self.acks.take_acks(self.config.max_appended_acks.min(MAX_APPENDED_ACKS));
        }
        let datagram = packet.encode()?;

        #[cfg(feature = "log")]
        log::trace!(target: "simconn", "Sending {} packet #{} ({}) to {}", packet.message, packet.sequence, packet.flags, self.endpoint);

        if packet.is_reliable() {
            self.acks.track(packet.sequence, datagram.clone(), now);
        }
        if let Err(err) = self.write_atomic(&datagram) {
            // Piggybacked acks did not leave
            self.acks.requeue_acks(packet.acks);
            return Err(err);
        }
        Ok(packet.sequence)
    }

    /// Sends pending acks in a dedicated `PacketAck` packet, if there are any.
    fn flush_acks(&mut self, now: Timestamp) -> Result<(), WriteError> {
        while self.acks.pending_acks() > 0 {
            let ids = self.acks.take_acks(u8::MAX as usize);
            self.send_packet(messages::packet_ack(&ids), now)?;
        }
        Ok(())
    }

    /// Processes a single datagram received from the simulator.
    fn process_datagram(&mut self, len: usize, packets: &mut Vec<Packet>) {
        let packet = match Packet::decode(&self.buffer[..len]) {
            Ok(packet) => packet,
            Err(err) => {
                #[cfg(feature = "log")]
                log::warn!(target: "simconn", "Dropping malformed datagram of {len} bytes from {}: {err}", self.endpoint);
                return;
            }
        };

        #[cfg(feature = "log")]
        log::trace!(target: "simconn", "Received {} packet #{} ({}) from {}", packet.message, packet.sequence, packet.flags, self.endpoint);

        for ack in &packet.acks {
            self.acks.acknowledge(*ack as u16);
        }

        if packet.is_reliable() {
            // Duplicates are acknowledged again since the previous ack may have been lost
            self.acks.queue_ack(packet.sequence);
            if !self.acks.receive(packet.sequence) {
                #[cfg(feature = "log")]
                log::debug!(target: "simconn", "Duplicate {} packet #{} from {} (resent: {})", packet.message, packet.sequence, self.endpoint, packet.is_resent());
                return;
            }
        }

        if packet.message == PACKET_ACK {
            match messages::parse_packet_ack(&packet.body) {
                Ok(ids) => {
                    for id in ids {
                        self.acks.acknowledge(id as u16);
                    }
                }
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::warn!(target: "simconn", "Invalid ack from {}: {err}", self.endpoint);
                }
            }
            return;
        }

        packets.push(packet);
    }

    fn read_datagrams(&mut self) -> Vec<ConnectionEvent> {
        let mut events = vec![];
        let mut packets = vec![];
        let mut failure = None;

        loop {
            let Some(socket) = self.socket.as_ref() else {
                break;
            };
            match socket.recv(&mut self.buffer[..]) {
                Ok(len) => {
                    self.last_received = Timestamp::now();
                    if !self.connected {
                        #[cfg(feature = "log")]
                        log::info!(target: "simconn", "Circuit {} to {} is established", self.code, self.endpoint);
                        self.connected = true;
                        events.push(ConnectionEvent::Established);
                    }
                    self.process_datagram(len, &mut packets);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::error!(target: "simconn", "Failed receiving from {}: {err}", self.endpoint);
                    failure = Some(err);
                    break;
                }
            }
        }

        let closed = packets.iter().any(|packet| packet.message == CLOSE_CIRCUIT);
        packets.retain(|packet| packet.message != CLOSE_CIRCUIT);
        if !packets.is_empty() {
            events.push(ConnectionEvent::Packets(packets));
        }
        if closed {
            #[cfg(feature = "log")]
            log::info!(target: "simconn", "Simulator {} has closed circuit {}", self.endpoint, self.code);
            self.running = false;
            events.push(ConnectionEvent::Closed);
        } else if let Some(err) = failure {
            self.running = false;
            events.push(ConnectionEvent::Failed(err));
        }
        events
    }
}

impl AsRawFd for SimConnection {
    /// Raw descriptor of the socket; `-1` (ignored by `poll`) when the socket is not open, so only
    /// [`SimConnection::connect`]ed records should be registered with a reactor.
    fn as_raw_fd(&self) -> RawFd { self.socket.as_ref().map(AsRawFd::as_raw_fd).unwrap_or(-1) }
}

impl Write for SimConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &self.socket {
            Some(socket) => socket.send(buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

impl WriteAtomic for SimConnection {
    fn is_ready_to_write(&self) -> bool { self.socket.is_some() && self.running }

    fn empty_write_buf(&mut self) -> io::Result<bool> {
        let had_data = !self.outbox.is_empty();
        let Some(socket) = self.socket.as_ref() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        while let Some(datagram) = self.outbox.front() {
            socket.send(datagram)?;
            self.outbox.pop_front();
        }
        Ok(had_data)
    }

    fn write_or_buf(&mut self, buf: &[u8]) -> io::Result<()> {
        if !self.outbox.is_empty() {
            self.outbox.push_back(buf.to_vec());
            return Ok(());
        }
        match self.write(buf) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                #[cfg(feature = "log")]
                log::trace!(target: "simconn", "Socket to {} is busy, queueing datagram", self.endpoint);
                self.outbox.push_back(buf.to_vec());
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

impl Resource for SimConnection {
    type Id = SocketAddr;
    type Event = ConnectionEvent;
    type Message = Packet;

    fn id(&self) -> SocketAddr { self.endpoint }

    fn interests(&self) -> IoType {
        if self.outbox.is_empty() {
            IoType::read_only()
        } else {
            IoType::read_write()
        }
    }

    fn handle_io(&mut self, io: Io) -> Vec<ConnectionEvent> {
        match io {
            Io::Read => self.read_datagrams(),
            Io::Write => match self.empty_write_buf() {
                Ok(_) => vec![],
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => vec![],
                Err(err) => {
                    self.running = false;
                    vec![ConnectionEvent::Failed(err)]
                }
            },
        }
    }

    fn handle_timer(&mut self, time: Timestamp) -> Vec<ConnectionEvent> {
        if !self.running || self.socket.is_none() {
            return vec![];
        }

        if time.duration_since(self.last_received) >= self.config.disconnect_timeout {
            #[cfg(feature = "log")]
            log::warn!(target: "simconn", "No data from {} for {:?}, circuit {} timed out", self.endpoint, self.config.disconnect_timeout, self.code);
            self.running = false;
            return vec![ConnectionEvent::TimedOut];
        }

        let resends =
            self.acks.resend_due(time, self.config.resend_timeout, self.config.max_resends);
        for seq in &resends.abandoned {
            #[cfg(feature = "log")]
            log::warn!(target: "simconn", "Giving up on packet #{seq} to {} after {} resends", self.endpoint, self.config.max_resends);
        }
        let mut res = Ok(());
        for datagram in resends.datagrams {
            #[cfg(feature = "log")]
            log::debug!(target: "simconn", "Resending {} bytes to {}", datagram.len(), self.endpoint);
            res = res.and(self.write_or_buf(&datagram).map_err(WriteError::from));
        }
        match res.and_then(|_| self.flush_acks(time)) {
            Err(WriteError::Io(err)) => {
                self.running = false;
                vec![ConnectionEvent::Failed(err)]
            }
            _ => vec![],
        }
    }

    fn send(&mut self, msg: Packet, time: Timestamp) -> Result<(), WriteError> {
        self.send_packet(msg, time).map(|_| ())
    }

    /// Notifies the simulator that the circuit is closed, if it is still running, and releases
    /// the socket.
    fn disconnect(mut self) -> io::Result<()> {
        #[cfg(feature = "log")]
        log::debug!(target: "simconn", "Disconnecting circuit {} to {}", self.code, self.endpoint);

        let res = if self.is_ready_to_write() {
            self.send_packet(messages::close_circuit(), Timestamp::now()).map(|_| ()).map_err(
                |err| match err {
                    WriteError::Io(err) => err,
                    WriteError::NotReady => io::ErrorKind::NotConnected.into(),
                    WriteError::Encode(err) => io::Error::new(io::ErrorKind::InvalidInput, err),
                },
            )
        } else {
            Ok(())
        };
        self.running = false;
        self.socket = None;
        res
    }
}

#[cfg(feature = "log")]
impl Drop for SimConnection {
    fn drop(&mut self) {
        log::trace!(target: "simconn", "Releasing connection record for {}", self.endpoint);
    }
}

#[cfg(test)]
mod tests {
    use std::thread::sleep;
    use std::time::Duration;

    use super::*;
    use crate::messages::{SessionKeys, COMPLETE_PING_CHECK, USE_CIRCUIT_CODE};
    use crate::packet::{Flags, MessageId};

    fn simulator() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        socket
    }

    fn connected(sim: &UdpSocket, config: SimConfig) -> SimConnection {
        let mut conn = SimConnection::with_config(sim.local_addr().unwrap(), 77, config);
        conn.connect().unwrap();
        conn
    }

    /// Address nobody listens on; datagrams sent there are refused.
    fn closed_port() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap()
    }

    fn client_addr(conn: &SimConnection) -> SocketAddr {
        let port = conn.local_addr().unwrap().port();
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    }

    fn recv_packet(sim: &UdpSocket) -> (Packet, SocketAddr) {
        let mut buf = [0u8; BUFFER_SIZE];
        let (len, from) = sim.recv_from(&mut buf).unwrap();
        (Packet::decode(&buf[..len]).unwrap(), from)
    }

    fn read_events(conn: &mut SimConnection) -> Vec<ConnectionEvent> {
        for _ in 0..200 {
            let events = conn.handle_io(Io::Read);
            if !events.is_empty() {
                return events;
            }
            sleep(Duration::from_millis(10));
        }
        panic!("no events from the connection")
    }

    fn packet(message: MessageId, sequence: u16, body: Vec<u8>) -> Packet {
        let mut packet = Packet::new(message, body);
        packet.sequence = sequence;
        packet
    }

    #[test]
    fn default_record() {
        let conn = SimConnection::default();
        assert_eq!(conn.sequence(), 1);
        assert!(conn.is_running());
        assert!(!conn.is_connected());
        assert!(!conn.has_socket());
        assert_eq!(conn.code(), 0);
        assert_eq!(conn.buffer().len(), BUFFER_SIZE);
        assert_eq!(conn.endpoint(), SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
        assert_eq!(conn.as_raw_fd(), -1);
        assert_eq!(conn.local_addr(), None);
    }

    #[test]
    fn identity_is_endpoint() {
        let endpoint = SocketAddr::from(([10, 0, 0, 1], 13000));
        let a = SimConnection::with(endpoint, 1);
        let mut b = SimConnection::with(endpoint, 2);
        b.next_sequence();
        let c = SimConnection::with(SocketAddr::from(([10, 0, 0, 1], 13001)), 1);

        assert_eq!(a, b);
        assert!(!(a != b));
        assert_ne!(a, c);
        assert_eq!(a != c, !(a == c));
        assert_eq!(SimConnection::new(), SimConnection::default());
    }

    #[test]
    fn sequence_wraps() {
        let mut conn = SimConnection::new();
        assert_eq!(conn.next_sequence(), 1);
        assert_eq!(conn.next_sequence(), 2);
        conn.sequence = u16::MAX;
        assert_eq!(conn.next_sequence(), u16::MAX);
        assert_eq!(conn.sequence(), 0);
    }

    #[test]
    fn unconnected_send() {
        let mut conn = SimConnection::with(SocketAddr::from(([127, 0, 0, 1], 9)), 1);
        let res = conn.send_packet(messages::close_circuit(), Timestamp::now());
        assert!(matches!(res, Err(WriteError::NotReady)));
        assert_eq!(conn.sequence(), 1, "sequence is not consumed");
        assert!(conn.handle_timer(Timestamp::now()).is_empty());
    }

    #[test]
    fn reliable_exchange() {
        let sim = simulator();
        let mut conn = connected(&sim, SimConfig::default());
        let keys = SessionKeys::default();

        let seq = conn.send_packet(messages::use_circuit_code(77, keys), Timestamp::now()).unwrap();
        assert_eq!(seq, 1);
        assert_eq!(conn.acks().unacked_len(), 1);

        let (received, from) = recv_packet(&sim);
        assert_eq!(from, client_addr(&conn));
        assert_eq!(received.message, USE_CIRCUIT_CODE);
        assert_eq!(received.sequence, 1);
        assert!(received.is_reliable());
        assert_eq!(messages::parse_use_circuit_code(&received.body).unwrap().0, 77);

        // Simulator acks our packet in the trailer of its own reliable one
        let mut reply = packet(MessageId::Medium(9), 5, vec![1, 2, 3]).reliable();
        reply.acks = vec![1];
        sim.send_to(&reply.encode().unwrap(), from).unwrap();

        let events = read_events(&mut conn);
        assert!(matches!(events[0], ConnectionEvent::Established));
        match &events[1] {
            ConnectionEvent::Packets(packets) => {
                assert_eq!(packets.len(), 1);
                assert_eq!(packets[0].message, MessageId::Medium(9));
                assert_eq!(packets[0].body, vec![1, 2, 3]);
            }
            other => panic!("unexpected event {other}"),
        }
        assert!(conn.is_connected());
        assert_eq!(conn.acks().unacked_len(), 0);
        assert_eq!(conn.acks().pending_acks(), 1);

        // Pending ack is piggybacked on the next outgoing packet
        conn.send_packet(messages::complete_ping_check(3), Timestamp::now()).unwrap();
        let (received, _) = recv_packet(&sim);
        assert_eq!(received.message, COMPLETE_PING_CHECK);
        assert_eq!(received.sequence, 2);
        assert_eq!(received.acks, vec![5]);
        assert_eq!(conn.acks().pending_acks(), 0);
    }

    #[test]
    fn duplicates_and_ack_flush() {
        let sim = simulator();
        let mut conn = connected(&sim, SimConfig::default());
        let local = client_addr(&conn);

        let datagram = packet(MessageId::High(4), 11, vec![0xCC]).reliable().encode().unwrap();
        sim.send_to(&datagram, local).unwrap();
        sim.send_to(&datagram, local).unwrap();
        sleep(Duration::from_millis(50));

        let events = read_events(&mut conn);
        let packets = events
            .iter()
            .filter_map(|event| match event {
                ConnectionEvent::Packets(packets) => Some(packets.len()),
                _ => None,
            })
            .sum::<usize>();
        assert_eq!(packets, 1, "duplicate is not delivered");
        assert_eq!(conn.acks().pending_acks(), 2, "duplicate is acknowledged again");

        assert!(conn.handle_timer(Timestamp::now()).is_empty());
        let (ack, _) = recv_packet(&sim);
        assert_eq!(ack.message, PACKET_ACK);
        assert!(!ack.is_reliable());
        assert_eq!(messages::parse_packet_ack(&ack.body).unwrap(), vec![11, 11]);
        assert_eq!(conn.acks().pending_acks(), 0);
    }

    #[test]
    fn packet_ack_message() {
        let sim = simulator();
        let mut conn = connected(&sim, SimConfig::default());
        let now = Timestamp::now();
        conn.send_packet(packet(MessageId::High(1), 0, vec![]).reliable(), now).unwrap();
        conn.send_packet(packet(MessageId::High(1), 0, vec![]).reliable(), now).unwrap();
        assert_eq!(conn.acks().unacked_len(), 2);
        let (_, from) = recv_packet(&sim);

        let mut ack = messages::packet_ack(&[1, 2]);
        ack.sequence = 1;
        sim.send_to(&ack.encode().unwrap(), from).unwrap();

        let events = read_events(&mut conn);
        assert!(
            events.iter().all(|event| !matches!(event, ConnectionEvent::Packets(_))),
            "acks are consumed by the connection"
        );
        assert_eq!(conn.acks().unacked_len(), 0);
    }

    #[test]
    fn resend_unacked() {
        let sim = simulator();
        let config = SimConfig {
            resend_timeout: Duration::from_secs(1),
            max_resends: 1,
            ..SimConfig::default()
        };
        let mut conn = connected(&sim, config);
        let now = Timestamp::now();
        conn.send_packet(packet(MessageId::Low(400), 0, vec![9]).reliable(), now).unwrap();
        let (original, _) = recv_packet(&sim);
        assert!(!original.is_resent());

        assert!(conn.handle_timer(now + Duration::from_secs(1)).is_empty());
        let (resent, _) = recv_packet(&sim);
        assert!(resent.flags.contains(Flags::RESENT | Flags::RELIABLE));
        assert_eq!(resent.sequence, original.sequence);
        assert_eq!(resent.body, vec![9]);

        assert!(conn.handle_timer(now + Duration::from_secs(2)).is_empty());
        assert_eq!(conn.acks().unacked_len(), 0, "packet is given up");
    }

    #[test]
    fn inactivity_timeout() {
        let sim = simulator();
        let mut conn = connected(&sim, SimConfig::default());
        let now = Timestamp::now();

        assert!(conn.handle_timer(now + Duration::from_secs(5)).is_empty());
        let events = conn.handle_timer(now + Duration::from_secs(16));
        assert!(matches!(events[..], [ConnectionEvent::TimedOut]));
        assert!(!conn.is_running());
        assert!(conn.handle_timer(now + Duration::from_secs(17)).is_empty());
    }

    #[test]
    fn closed_by_simulator() {
        let sim = simulator();
        let mut conn = connected(&sim, SimConfig::default());
        let local = client_addr(&conn);

        sim.send_to(&packet(CLOSE_CIRCUIT, 1, vec![]).encode().unwrap(), local).unwrap();
        let events = read_events(&mut conn);
        assert!(matches!(events[..], [ConnectionEvent::Established, ConnectionEvent::Closed]));
        assert!(!conn.is_running());
        assert!(matches!(
            conn.send_packet(messages::close_circuit(), Timestamp::now()),
            Err(WriteError::NotReady)
        ));
    }

    #[test]
    fn malformed_datagram_is_skipped() {
        let sim = simulator();
        let mut conn = connected(&sim, SimConfig::default());
        let local = client_addr(&conn);

        sim.send_to(&[0x10, 0, 0, 1, 7], local).unwrap();
        let events = read_events(&mut conn);
        assert!(matches!(events[..], [ConnectionEvent::Established]));
        assert!(conn.is_running());
    }

    #[test]
    fn disconnect_closes_circuit() {
        let sim = simulator();
        let conn = connected(&sim, SimConfig::default());
        conn.disconnect().unwrap();

        let (close, _) = recv_packet(&sim);
        assert_eq!(close.message, CLOSE_CIRCUIT);
        assert_eq!(close.sequence, 1);
    }

    #[test]
    fn drop_releases_socket() {
        let sim = simulator();
        let conn = connected(&sim, SimConfig::default());
        let local = conn.local_addr().unwrap();
        drop(conn);

        // The port is free again once the record is gone
        UdpSocket::bind(local).unwrap();
    }

    #[test]
    fn queued_datagrams_flush_in_order() {
        let sim = simulator();
        let mut conn = connected(&sim, SimConfig::default());
        assert_eq!(conn.interests(), IoType::read_only());

        // Datagram the OS refused earlier with `WouldBlock`
        conn.outbox.push_back(packet(MessageId::High(6), 40, vec![1]).encode().unwrap());
        assert_eq!(conn.interests(), IoType::read_write());

        let seq = conn.send_packet(Packet::new(MessageId::High(7), vec![2]), Timestamp::now()).unwrap();
        assert_eq!(conn.outbox.len(), 2, "new datagram waits behind the queued one");

        assert!(conn.handle_io(Io::Write).is_empty());
        assert!(conn.outbox.is_empty());
        assert_eq!(conn.interests(), IoType::read_only());

        let (first, _) = recv_packet(&sim);
        assert_eq!(first.sequence, 40);
        let (second, _) = recv_packet(&sim);
        assert_eq!(second.sequence, seq);
        assert_eq!(second.message, MessageId::High(7));
    }

    #[test]
    fn refused_datagrams_fail_circuit() {
        let mut conn = SimConnection::with(closed_port(), 3);
        conn.connect().unwrap();
        conn.send_packet(Packet::new(MessageId::High(1), vec![]), Timestamp::now()).unwrap();

        let events = read_events(&mut conn);
        assert!(matches!(
            &events[..],
            [ConnectionEvent::Failed(err)] if err.kind() == io::ErrorKind::ConnectionRefused
        ));
        assert!(!conn.is_running());
        assert!(conn.handle_timer(Timestamp::now()).is_empty());
    }

    #[test]
    fn acks_survive_failed_write() {
        let mut conn = SimConnection::with(closed_port(), 3);
        conn.connect().unwrap();

        let mut failure = None;
        for _ in 0..100 {
            conn.acks.queue_ack(5);
            match conn.send_packet(Packet::new(MessageId::High(3), vec![]), Timestamp::now()) {
                Ok(_) => sleep(Duration::from_millis(10)),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        assert!(matches!(
            failure,
            Some(WriteError::Io(ref err)) if err.kind() == io::ErrorKind::ConnectionRefused
        ));
        assert_eq!(conn.acks.take_acks(10), vec![5]);
    }

    #[test]
    fn marker_id_is_not_sent() {
        let sim = simulator();
        let mut conn = connected(&sim, SimConfig::default());
        conn.acks.queue_ack(8);

        let res = conn.send_packet(Packet::new(MessageId::High(0xFF), vec![7, 8]), Timestamp::now());
        assert!(matches!(res, Err(WriteError::Encode(_))));
        assert_eq!(conn.sequence(), 1);
        assert_eq!(conn.acks().pending_acks(), 1);

        sim.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let mut buf = [0u8; BUFFER_SIZE];
        assert!(sim.recv_from(&mut buf).is_err());
    }

    #[test]
    fn wrapped_sequence_keeps_newest_packet() {
        let sim = simulator();
        let config = SimConfig {
            resend_timeout: Duration::from_secs(1),
            ..SimConfig::default()
        };
        let mut conn = connected(&sim, config);
        let now = Timestamp::now();

        let first =
            conn.send_packet(packet(MessageId::High(1), 0, vec![1]).reliable(), now).unwrap();
        for _ in 0..u16::MAX {
            conn.next_sequence();
        }
        let second =
            conn.send_packet(packet(MessageId::High(1), 0, vec![2]).reliable(), now).unwrap();
        assert_eq!(first, second);
        assert_eq!(conn.acks().unacked_len(), 1);
        let _ = recv_packet(&sim);
        let _ = recv_packet(&sim);

        assert!(conn.handle_timer(now + Duration::from_secs(1)).is_empty());
        let (resent, _) = recv_packet(&sim);
        assert!(resent.is_resent());
        assert_eq!(resent.body, vec![2], "newer packet is the one resent");
    }
}
