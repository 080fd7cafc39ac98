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

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::fmt::Debug;
use std::thread::JoinHandle;
use std::{io, thread};

use crossbeam_channel as chan;

use crate::poller::{Poll, Waker, WakerSend};
use crate::runtime::{Handler, Runtime};

pub(crate) enum Ctl<C> {
    Cmd(C),
    Shutdown,
}

/// Reactor thread running a [`Runtime`].
///
/// The application reaches the [`Handler`] inside the thread through a [`Controller`].
pub struct Reactor<H: Handler, P: Poll> {
    thread: JoinHandle<()>,
    controller: Controller<H::Command, <P::Waker as Waker>::Send>,
}

impl<H: Handler + 'static, P: Poll + 'static> Reactor<H, P> {
    /// Moves the service and the poll engine into a new thread running the event loop.
    ///
    /// # Error
    ///
    /// OS error if the waker can't be created or the thread can't be spawned.
    pub fn new(service: H, poller: P) -> Result<Self, io::Error> {
        Reactor::with(service, poller, thread::Builder::new())
    }

    /// Same as [`Reactor::new`], with a name for the thread.
    pub fn named(service: H, poller: P, thread_name: String) -> Result<Self, io::Error> {
        Reactor::with(service, poller, thread::Builder::new().name(thread_name))
    }

    /// Same as [`Reactor::new`], spawning the thread with a custom builder.
    pub fn with(service: H, mut poller: P, builder: thread::Builder) -> Result<Self, io::Error> {
        let (ctl_send, ctl_recv) = chan::unbounded();

        let (waker_writer, waker_reader) = P::Waker::pair()?;

        let controller = Controller::new(ctl_send, waker_writer);

        #[cfg(feature = "log")]
        log::debug!(target: "reactor-controller", "Initializing reactor thread...");

        let thread = builder.spawn(move || {
            #[cfg(feature = "log")]
            {
                use std::os::unix::io::AsRawFd;
                log::debug!(target: "reactor", "Registering waker (fd {})", waker_reader.as_raw_fd());
            }
            poller.register_waker(&waker_reader);

            let runtime = Runtime::with(service, poller, ctl_recv, waker_reader);

            #[cfg(feature = "log")]
            log::info!(target: "reactor", "Entering reactor event loop");

            runtime.run();
        })?;

        // Actions queued by the service before the start are applied on the first wake
        controller.wake()?;
        Ok(Self { thread, controller })
    }

    /// Handle for sending commands to the service.
    pub fn controller(&self) -> Controller<H::Command, <P::Waker as Waker>::Send> {
        self.controller.clone()
    }

    /// Waits for the event loop to end.
    pub fn join(self) -> thread::Result<()> { self.thread.join() }
}

/// Cloneable handle passing [`Handler::Command`]s to the service inside a [`Reactor`] from any
/// thread.
pub struct Controller<C, W: WakerSend> {
    ctl_send: chan::Sender<Ctl<C>>,
    waker: W,
}

impl<C, W: WakerSend> Clone for Controller<C, W> {
    fn clone(&self) -> Self {
        Controller {
            ctl_send: self.ctl_send.clone(),
            waker: self.waker.clone(),
        }
    }
}

impl<C: Debug, W: WakerSend> Controller<C, W> {
    fn new(ctl_send: chan::Sender<Ctl<C>>, waker: W) -> Self { Self { ctl_send, waker } }

    /// Queues the command and wakes the reactor.
    pub fn cmd(&self, command: C) -> Result<(), io::Error> {
        #[cfg(feature = "log")]
        log::debug!(target: "reactor-controller", "Sending command {command:?} to the reactor");

        self.ctl_send.send(Ctl::Cmd(command)).map_err(|_| io::ErrorKind::BrokenPipe)?;
        self.wake()?;
        Ok(())
    }

    /// Stops the event loop without involving the service.
    ///
    /// Circuits still registered are dropped with the runtime, without notifying simulators; send
    /// the service its own shutdown command to close them.
    pub fn shutdown(self) -> Result<(), Self> {
        #[cfg(feature = "log")]
        log::info!(target: "reactor-controller", "Initiating reactor shutdown...");

        let res1 = self.ctl_send.send(Ctl::Shutdown);
        let res2 = self.wake();
        match (res1, res2) {
            (Ok(()), Ok(())) => Ok(()),
            _ => Err(self),
        }
    }

    fn wake(&self) -> io::Result<()> {
        #[cfg(feature = "log")]
        log::trace!(target: "reactor-controller", "Wakening the reactor");
        self.waker.wake()
    }
}
