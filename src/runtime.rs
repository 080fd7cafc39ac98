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

//! Reactor runtime driving simulator circuits.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::collections::HashMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crossbeam_channel as chan;

use crate::poller::{Poll, Waker, WakerRecv};
use crate::reactor::Ctl;
use crate::resource::WriteError;
use crate::{Resource, Timer, Timestamp};

/// Maximum amount of time to wait for I/O.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Reactor errors
#[derive(Error, Display, From)]
#[display(doc_comments)]
pub enum Error<T: Resource> {
    /// transport {0} got disconnected during poll operation.
    TransportDisconnect(T::Id, T),

    /// polling multiple resources has failed. Details: {0:?}
    #[from]
    Poll(io::Error),
}

impl<T: Resource> Debug for Error<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result { Display::fmt(self, f) }
}

/// Requests from the [`Handler`] to the reactor, drained from the handler iterator on every loop
/// iteration.
#[derive(Display)]
pub enum Action<T: Resource> {
    /// Start polling an already opened transport.
    #[display("register_transport")]
    RegisterTransport(T),

    /// Stop polling the transport and give it back via [`Handler::handover_transport`]. The
    /// transport is not closed by the reactor.
    #[display("unregister_transport({0})")]
    UnregisterTransport(T::Id),

    /// Write a message to the transport.
    #[display("send_to({0})")]
    Send(T::Id, T::Message),

    /// Arm a one-shot timer. On expiry every transport gets [`Resource::handle_timer`], followed
    /// by [`Handler::handle_timer`].
    #[display("set_timer({0:?})")]
    SetTimer(Duration),

    /// End the event loop after the current batch of actions.
    #[display("terminate")]
    Terminate,
}

/// Service living inside the [`crate::Reactor`] thread.
pub trait Handler: Send + Iterator<Item = Action<Self::Transport>> {
    /// Type for a transport resource.
    type Transport: Resource;

    /// Command accepted from other threads through [`crate::Controller`].
    type Command: Debug + Send;

    /// Called once per loop iteration right after the poll returns.
    fn tick(&mut self, time: Timestamp);

    /// Called after an [`Action::SetTimer`] timer has expired.
    fn handle_timer(&mut self);

    /// Called for each event a transport generates.
    fn handle_transport_event(
        &mut self,
        id: <Self::Transport as Resource>::Id,
        event: <Self::Transport as Resource>::Event,
        time: Timestamp,
    );

    /// Called when a transport has been added to the poll.
    fn handle_registered(&mut self, fd: RawFd, id: <Self::Transport as Resource>::Id);

    fn handle_command(&mut self, cmd: Self::Command);

    /// Called on poll failures and on transports dropped from the poll due to I/O errors.
    fn handle_error(&mut self, err: Error<Self::Transport>);

    /// Receives the transport removed by [`Action::UnregisterTransport`], or a duplicate of an
    /// already registered one. The handler decides whether to close it.
    fn handover_transport(
        &mut self,
        id: <Self::Transport as Resource>::Id,
        transport: Self::Transport,
    );
}

/// Blocking event loop run by the [`crate::Reactor`] thread.
pub struct Runtime<H: Handler, P: Poll> {
    service: H,
    poller: P,
    ctl_recv: chan::Receiver<Ctl<H::Command>>,
    transports: HashMap<<H::Transport as Resource>::Id, H::Transport>,
    fds: HashMap<RawFd, <H::Transport as Resource>::Id>,
    waker: <P::Waker as Waker>::Recv,
    timeouts: Timer,
}

impl<H: Handler, P: Poll> Runtime<H, P> {
    pub(crate) fn with(
        service: H,
        poller: P,
        ctl_recv: chan::Receiver<Ctl<H::Command>>,
        waker: <P::Waker as Waker>::Recv,
    ) -> Self {
        Runtime {
            service,
            poller,
            ctl_recv,
            transports: empty!(),
            fds: empty!(),
            waker,
            timeouts: Timer::new(),
        }
    }

    /// Executes reactor event loop until [`Action::Terminate`] or a shutdown request.
    pub fn run(mut self) {
        loop {
            let before_poll = Timestamp::now();
            let timeout = self.timeouts.next_expiring_from(before_poll).unwrap_or(WAIT_TIMEOUT);

            for transport in self.transports.values() {
                self.poller.set_interest(transport, transport.interests());
            }

            // Blocking
            #[cfg(feature = "log")]
            log::trace!(target: "reactor", "Polling with timeout {timeout:?}");

            let res = self.poller.poll(Some(timeout));
            let now = Timestamp::now();
            self.service.tick(now);

            // Nb. Individual timers are not distinguished: as long as *something* timed out,
            // transports run their housekeeping and the service is woken.
            let timers_fired = self.timeouts.remove_expired_by(now);
            if timers_fired > 0 {
                #[cfg(feature = "log")]
                log::trace!(target: "reactor", "Timer has fired");
                self.handle_timer(now);
            }

            match res {
                Ok(0) if timers_fired == 0 => {
                    #[cfg(feature = "log")]
                    log::trace!(target: "reactor", "Poll timeout; no I/O events had happened");
                }
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::error!(target: "reactor", "Error during polling: {err}");
                    self.service.handle_error(Error::Poll(err));
                }
                _ => {}
            }

            let awoken = self.handle_events(now);

            // Process the commands only if we awaken by the waker
            if awoken {
                loop {
                    match self.ctl_recv.try_recv() {
                        Err(chan::TryRecvError::Empty) => break,
                        Err(chan::TryRecvError::Disconnected) => {
                            panic!("control channel is broken")
                        }
                        Ok(Ctl::Shutdown) => return self.handle_shutdown(),
                        Ok(Ctl::Cmd(cmd)) => self.service.handle_command(cmd),
                    }
                }
            }

            if !self.handle_actions(now) {
                break;
            }
        }

        #[cfg(feature = "log")]
        log::info!(target: "reactor", "Reactor terminated by the service");
    }

    fn handle_timer(&mut self, time: Timestamp) {
        for (id, transport) in self.transports.iter_mut() {
            for event in transport.handle_timer(time) {
                self.service.handle_transport_event(*id, event, time);
            }
        }
        self.service.handle_timer();
    }

    /// # Returns
    ///
    /// Whether it was awakened by a waker
    fn handle_events(&mut self, time: Timestamp) -> bool {
        let mut awoken = false;

        while let Some((fd, res)) = self.poller.next() {
            if fd == self.waker.as_raw_fd() {
                if let Err(err) = res {
                    #[cfg(feature = "log")]
                    log::error!(target: "reactor", "Polling waker has failed: {err}");
                    panic!("waker failure: {err}");
                };

                #[cfg(feature = "log")]
                log::trace!(target: "reactor", "Awoken by the controller");

                self.waker.reset();
                awoken = true;
                continue;
            }

            let Some(id) = self.fds.get(&fd).copied() else {
                // The transport was unregistered by an action after this poll round had started
                #[cfg(feature = "log")]
                log::debug!(target: "reactor", "Skipping event for unregistered fd {fd}");
                continue;
            };

            match res {
                Ok(io) => {
                    #[cfg(feature = "log")]
                    log::trace!(target: "reactor", "Got `{io}` event from transport {id}");

                    let Some(transport) = self.transports.get_mut(&id) else {
                        continue;
                    };
                    for io in io {
                        for event in transport.handle_io(io) {
                            self.service.handle_transport_event(id, event, time);
                        }
                    }
                }
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::trace!(target: "reactor", "Transport {id} {err}");
                    if let Some(transport) = self.unregister_transport(id) {
                        self.service.handle_error(Error::TransportDisconnect(id, transport));
                    }
                }
            }
        }

        awoken
    }

    /// Handles the actions from the queue.
    ///
    /// # Return
    ///
    /// Return value indicates whether the reactor must proceed operating (`true`) or should
    /// terminate (`false`).
    fn handle_actions(&mut self, time: Timestamp) -> bool {
        let mut result = true;
        while let Some(action) = self.service.next() {
            #[cfg(feature = "log")]
            log::trace!(target: "reactor", "Handling action {action} from the service");

            // NB: Deadlock may happen here if the service will generate events over and over
            // in the handle_* calls we may never get out of this loop
            match self.handle_action(action, time) {
                Ok(ret) => result &= ret,
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::error!(target: "reactor", "Error: {err}");
                    self.service.handle_error(err);
                }
            }
        }
        result
    }

    fn handle_action(
        &mut self,
        action: Action<H::Transport>,
        time: Timestamp,
    ) -> Result<bool, Error<H::Transport>> {
        match action {
            Action::RegisterTransport(transport) => {
                let fd = transport.as_raw_fd();
                let id = transport.id();

                if self.transports.contains_key(&id) {
                    #[cfg(feature = "log")]
                    log::warn!(target: "reactor", "Transport {id} is already registered, handing the duplicate back");
                    self.service.handover_transport(id, transport);
                    return Ok(true);
                }

                #[cfg(feature = "log")]
                log::debug!(target: "reactor", "Registering transport {id} with fd={fd}");

                self.poller.register(&transport, transport.interests());
                self.fds.insert(fd, id);
                self.transports.insert(id, transport);
                self.service.handle_registered(fd, id);
            }
            Action::UnregisterTransport(id) => {
                let Some(transport) = self.unregister_transport(id) else {
                    return Ok(true);
                };
                #[cfg(feature = "log")]
                log::debug!(target: "reactor", "Handing over transport {id}");
                self.service.handover_transport(id, transport);
            }
            Action::Send(id, msg) => {
                let Some(transport) = self.transports.get_mut(&id) else {
                    #[cfg(feature = "log")]
                    log::error!(target: "reactor", "Transport {id} is not in the reactor");

                    return Ok(true);
                };
                match transport.send(msg, time) {
                    Err(WriteError::NotReady) => {
                        #[cfg(feature = "log")]
                        log::warn!(target: "reactor", "Transport {id} is not ready for writing, message dropped");
                    }
                    Err(WriteError::Encode(err)) => {
                        #[cfg(feature = "log")]
                        log::error!(target: "reactor", "Message to transport {id} is dropped: {err}");
                    }
                    Err(WriteError::Io(e)) => {
                        #[cfg(feature = "log")]
                        log::error!(target: "reactor", "Fatal error writing to transport {id}, disconnecting. Error details: {e:?}");
                        if let Some(transport) = self.unregister_transport(id) {
                            return Err(Error::TransportDisconnect(id, transport));
                        }
                    }
                    Ok(_) => {}
                }
            }
            Action::SetTimer(duration) => {
                #[cfg(feature = "log")]
                log::debug!(target: "reactor", "Adding timer {duration:?} from now");

                self.timeouts.set_timeout(duration, time);
            }
            Action::Terminate => return Ok(false),
        }
        Ok(true)
    }

    fn handle_shutdown(self) {
        #[cfg(feature = "log")]
        log::info!(target: "reactor", "Shutdown with {} transport(s) registered", self.transports.len());

        // Transports are dropped together with the runtime, closing their sockets
    }

    fn unregister_transport(
        &mut self,
        id: <H::Transport as Resource>::Id,
    ) -> Option<H::Transport> {
        let Some(transport) = self.transports.remove(&id) else {
            #[cfg(feature = "log")]
            log::warn!(target: "reactor", "Unregistering non-registered transport {id}");
            return None;
        };

        #[cfg(feature = "log")]
        log::debug!(target: "reactor", "Unregistering transport {id} (fd={})", transport.as_raw_fd());

        self.fds.remove(&transport.as_raw_fd());
        self.poller.unregister(&transport);

        Some(transport)
    }
}
