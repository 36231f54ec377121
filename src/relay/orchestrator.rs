//-
// Copyright (c) 2022, The Mettmail Developers
//
// This file is part of Mettmail.
//
// Mettmail is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, version 3 of the License.
//
// Mettmail is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mettmail. If not, see <http://www.gnu.org/licenses/>.

//! The relay state machine.
//!
//! A message is only ever flagged after the LMTP server accepted exactly the
//! bytes fetched for it, and nothing is retried after a failure: the run
//! ends, and the next run picks up whatever is still unflagged. A crash can
//! therefore cause a duplicate delivery but never a lost message.

use std::time::Duration;

use log::{debug, error, info, warn};

use super::scanner::MailboxScanner;
use super::{MailSink, MailSource};
use crate::imap::session::IdleEvent;
use crate::lmtp::session::Delivery;
use crate::model::{Envelope, Keyword, Uid};
use crate::support::error::Error;
use crate::support::shutdown::Shutdown;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Scanning,
    Processing(Uid),
    Delivering(Uid),
    Flagging(Uid),
    /// Ended cleanly.
    Stopped,
    /// Ended by an error.
    Failed,
}

/// What a run did, for the log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub relayed: usize,
    pub vanished: usize,
    pub already_done: usize,
}

pub struct Relay<'a, S, C> {
    source: &'a mut S,
    connect_sink: C,
    scanner: MailboxScanner,
    envelope: Envelope,
    idle_refresh: Duration,
    shutdown: Shutdown,
    state: State,
    stats: Stats,
}

impl<'a, S, K, C> Relay<'a, S, C>
where
    S: MailSource,
    K: MailSink,
    C: FnMut() -> Result<K, Error>,
{
    /// `connect_sink` is called to open an LMTP session whenever there is
    /// something to deliver; the session is closed again once the batch is
    /// done.
    pub fn new(
        source: &'a mut S,
        connect_sink: C,
        flag: Keyword,
        envelope: Envelope,
        idle_refresh: Duration,
        shutdown: Shutdown,
    ) -> Self {
        Relay {
            source,
            connect_sink,
            scanner: MailboxScanner::new(flag),
            envelope,
            idle_refresh,
            shutdown,
            state: State::Idle,
            stats: Stats::default(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Relay until shutdown is requested or something fails.
    ///
    /// Returns `Ok` if the run stopped cleanly; the error otherwise. Either
    /// way the relay is in a terminal state afterwards.
    pub fn run(&mut self) -> Result<(), Error> {
        let result = self.run_until_stopped();
        match result {
            Ok(()) => self.transition(State::Stopped),
            Err(ref e) => {
                error!("Relay failed ({:?}): {}", e.kind(), e);
                self.transition(State::Failed);
            }
        }

        info!(
            "Relayed {} message(s); {} vanished, {} already done",
            self.stats.relayed, self.stats.vanished, self.stats.already_done
        );
        result
    }

    fn run_until_stopped(&mut self) -> Result<(), Error> {
        loop {
            self.transition(State::Scanning);
            let candidates = self.scanner.scan(&mut *self.source)?;
            if !candidates.is_empty() && !self.process(&candidates)? {
                return Ok(());
            }

            self.transition(State::Idle);
            if !self.source.has_idle() {
                info!("Server cannot IDLE; stopping after the scan");
                return Ok(());
            }

            loop {
                let event =
                    self.source.idle_wait(self.idle_refresh, &self.shutdown)?;
                match event {
                    IdleEvent::NewActivity => break,
                    IdleEvent::Timeout => debug!("Refreshing IDLE"),
                    IdleEvent::Interrupted => {
                        info!("Shutdown requested");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Relay every candidate in order. Returns `false` if shutdown was
    /// requested partway through.
    fn process(&mut self, candidates: &[Uid]) -> Result<bool, Error> {
        let mut sink = (self.connect_sink)()?;
        let result = self.process_with(&mut sink, candidates);
        sink.quit();
        result
    }

    fn process_with(
        &mut self,
        sink: &mut K,
        candidates: &[Uid],
    ) -> Result<bool, Error> {
        for &uid in candidates {
            if self.shutdown.is_requested() {
                info!("Shutdown requested; leaving the rest for later");
                return Ok(false);
            }

            self.transition(State::Processing(uid));
            let message = match self.source.fetch(uid) {
                Ok(message) => message,
                Err(Error::NotFound(_)) => {
                    warn!(
                        "Message {} vanished before it could be fetched",
                        uid
                    );
                    self.stats.vanished += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if self.scanner.is_done(&message) {
                info!(
                    "Message {} already has {}; skipping",
                    uid,
                    self.scanner.flag()
                );
                self.stats.already_done += 1;
                continue;
            }

            self.transition(State::Delivering(uid));
            match sink.deliver(&self.envelope, &message.data)? {
                Delivery::Accepted => (),
                Delivery::Rejected { code, text } => {
                    return Err(Error::Rejected { uid, code, text })
                }
            }

            self.transition(State::Flagging(uid));
            self.source.set_done_flag(uid, self.scanner.flag())?;
            self.stats.relayed += 1;
            info!("Relayed message {} ({} bytes)", uid, message.data.len());
        }

        Ok(true)
    }

    fn transition(&mut self, to: State) {
        debug!("{:?} -> {:?}", self.state, to);
        self.state = to;
    }
}
