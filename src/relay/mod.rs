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

//! Moving messages from the mailbox to the LMTP server.
//!
//! The logic here only sees the two ends through `MailSource` and
//! `MailSink`, implemented by the real sessions below and by in-memory fakes
//! in tests.

use std::time::Duration;

use crate::imap::session::{IdleEvent, ImapSession};
use crate::lmtp::session::{Delivery, LmtpSession};
use crate::model::{Envelope, Keyword, RawMessage, Uid};
use crate::support::error::Error;
use crate::support::shutdown::Shutdown;

pub mod orchestrator;
pub mod scanner;

pub trait MailSource {
    fn has_idle(&self) -> bool;

    fn search_unflagged(&mut self, flag: &Keyword) -> Result<Vec<Uid>, Error>;

    fn fetch(&mut self, uid: Uid) -> Result<RawMessage, Error>;

    fn set_done_flag(
        &mut self,
        uid: Uid,
        flag: &Keyword,
    ) -> Result<(), Error>;

    fn idle_wait(
        &mut self,
        timeout: Duration,
        shutdown: &Shutdown,
    ) -> Result<IdleEvent, Error>;
}

pub trait MailSink {
    fn deliver(
        &mut self,
        envelope: &Envelope,
        data: &[u8],
    ) -> Result<Delivery, Error>;

    /// End the session. Errors are the implementation's to log.
    fn quit(self);
}

impl MailSource for ImapSession {
    fn has_idle(&self) -> bool {
        ImapSession::has_idle(self)
    }

    fn search_unflagged(&mut self, flag: &Keyword) -> Result<Vec<Uid>, Error> {
        ImapSession::search_unflagged(self, flag)
    }

    fn fetch(&mut self, uid: Uid) -> Result<RawMessage, Error> {
        ImapSession::fetch(self, uid)
    }

    fn set_done_flag(
        &mut self,
        uid: Uid,
        flag: &Keyword,
    ) -> Result<(), Error> {
        ImapSession::set_done_flag(self, uid, flag)
    }

    fn idle_wait(
        &mut self,
        timeout: Duration,
        shutdown: &Shutdown,
    ) -> Result<IdleEvent, Error> {
        ImapSession::idle_wait(self, timeout, shutdown)
    }
}

impl MailSink for LmtpSession {
    fn deliver(
        &mut self,
        envelope: &Envelope,
        data: &[u8],
    ) -> Result<Delivery, Error> {
        LmtpSession::deliver(self, envelope, data)
    }

    fn quit(self) {
        LmtpSession::quit(self)
    }
}
