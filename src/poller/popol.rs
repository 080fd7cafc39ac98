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

//! Poll engine backed by the [`popol`] library.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use crate::poller::{IoFail, IoType, Poll, Waker, WakerRecv, WakerSend};

/// Manager for a set of resources which are polled for an event loop by the
/// reactor by using [`popol`] library.
pub struct Poller {
    poll: popol::Sources<RawFd>,
    events: VecDeque<(RawFd, Result<IoType, IoFail>)>,
    fired: Vec<popol::Event<RawFd>>,
}

impl Default for Poller {
    fn default() -> Self { Self::new() }
}

impl Poller {
    pub fn new() -> Self {
        Self {
            poll: popol::Sources::new(),
            events: empty!(),
            fired: empty!(),
        }
    }
}

impl Poll for Poller {
    type Waker = PopolWaker;

    fn register_waker(&mut self, fd: &impl AsRawFd) {
        let fd = fd.as_raw_fd();

        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Registering waker {fd}");

        self.poll.register(fd, &fd, popol::interest::READ);
    }

    fn register(&mut self, fd: &impl AsRawFd, interest: IoType) {
        let fd = fd.as_raw_fd();

        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Registering {fd} with interest `{interest}`");

        self.poll.register(fd, &fd, interest.into());
    }

    fn unregister(&mut self, fd: &impl AsRawFd) {
        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Unregistering {}", fd.as_raw_fd());

        self.poll.unregister(&fd.as_raw_fd());
    }

    fn set_interest(&mut self, fd: &impl AsRawFd, interest: IoType) -> bool {
        let fd = fd.as_raw_fd();

        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Setting interest `{interest}` on {fd}");

        self.poll.unset(&fd, (!interest).into());
        self.poll.set(&fd, interest.into())
    }

    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let len = self.events.len();

        #[cfg(feature = "log")]
        log::trace!(target: "popol",
            "Polling {} resources with timeout {timeout:?} (pending event queue is {len})",
            self.poll.len(),
        );

        let timeout = match timeout {
            Some(duration) => popol::Timeout::After(duration),
            None => popol::Timeout::Never,
        };

        // Blocking call
        self.fired.clear();
        match self.poll.poll(&mut self.fired, timeout) {
            Ok(_) => {}
            Err(err)
                if err.kind() == io::ErrorKind::TimedOut
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                #[cfg(feature = "log")]
                log::trace!(target: "popol", "Poll timed out with zero events generated");
                return Ok(0);
            }
            Err(err) => return Err(err),
        }

        for event in self.fired.drain(..) {
            let fd = event.key;
            let source = event.source;
            let res = if source.is_invalid() {
                Err(IoFail::Invalid)
            } else if source.is_error() {
                Err(IoFail::Os)
            } else if source.is_hangup() {
                Err(IoFail::Connectivity)
            } else {
                Ok(IoType {
                    read: source.is_readable(),
                    write: source.is_writable(),
                })
            };

            #[cfg(feature = "log")]
            log::trace!(target: "popol", "Got `{res:?}` for {fd}");

            self.events.push_back((fd, res))
        }

        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Poll resulted in {} new event(s)", self.events.len() - len);

        Ok(self.events.len() - len)
    }
}

impl Iterator for Poller {
    type Item = (RawFd, Result<IoType, IoFail>);

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.events.pop_front();

        #[cfg(feature = "log")]
        match &next {
            Some((fd, Ok(io))) => {
                log::trace!(target: "popol", "Popped event `{io}` for {fd} from the queue")
            }
            Some((fd, Err(err))) => {
                log::trace!(target: "popol", "Popped error `{err}` for {fd} from the queue")
            }
            None => log::trace!(target: "popol", "Popol queue emptied"),
        }

        next
    }
}

impl From<IoType> for popol::Interest {
    fn from(ev: IoType) -> Self {
        let mut e = popol::Interest::default();
        if ev.read {
            e |= popol::interest::READ;
        }
        if ev.write {
            e |= popol::interest::WRITE;
        }
        e
    }
}

/// Waker backed by [`popol::Waker`], shared between the controllers and the reactor thread.
pub struct PopolWaker;

impl Waker for PopolWaker {
    type Send = Arc<popol::Waker>;
    type Recv = Arc<popol::Waker>;

    fn pair() -> Result<(Self::Send, Self::Recv), io::Error> {
        let waker = Arc::new(popol::Waker::new()?);
        Ok((waker.clone(), waker))
    }
}

impl WakerSend for Arc<popol::Waker> {
    fn wake(&self) -> io::Result<()> { self.as_ref().wake() }
}

impl WakerRecv for Arc<popol::Waker> {
    fn reset(&self) {
        if let Err(err) = popol::Waker::reset(self.as_ref()) {
            #[cfg(feature = "log")]
            log::error!(target: "popol", "Unable to reset waker: {err}");
        }
    }
}
