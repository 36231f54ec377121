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

//! Turns a mailbox wake-up into the ordered set of UIDs still to relay.

use log::debug;

use super::MailSource;
use crate::model::{Keyword, RawMessage, Uid};
use crate::support::error::Error;

/// Decides which messages still need relaying.
#[derive(Clone, Debug)]
pub struct MailboxScanner {
    flag: Keyword,
}

impl MailboxScanner {
    pub fn new(flag: Keyword) -> Self {
        MailboxScanner { flag }
    }

    pub fn flag(&self) -> &Keyword {
        &self.flag
    }

    /// Find every message lacking the done-flag, in the order they are to be
    /// processed.
    pub fn scan(
        &self,
        source: &mut impl MailSource,
    ) -> Result<Vec<Uid>, Error> {
        let mut candidates = source.search_unflagged(&self.flag)?;
        candidates.sort_unstable();
        candidates.dedup();
        debug!(
            "{} message(s) without {}: {:?}",
            candidates.len(),
            self.flag,
            candidates
        );
        Ok(candidates)
    }

    /// Whether `message` already carries the done-flag, in any case.
    pub fn is_done(&self, message: &RawMessage) -> bool {
        message.has_flag(&self.flag)
    }
}
