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

//! Process exit statuses from `sysexits.h`.
//!
//! The relay has no internal retry loop. Whatever supervises the process
//! (systemd, a container restart policy, ...) decides what to do next, and
//! the exit status is the only thing it gets to look at, so every way the
//! relay can stop maps onto exactly one of these.

use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Sysexit(pub i32);

pub const EX_OK: Sysexit = Sysexit(0);
pub const EX_USAGE: Sysexit = Sysexit(64);
pub const EX_UNAVAILABLE: Sysexit = Sysexit(69);
pub const EX_SOFTWARE: Sysexit = Sysexit(70);
pub const EX_OSERR: Sysexit = Sysexit(71);
pub const EX_TEMPFAIL: Sysexit = Sysexit(75);
pub const EX_PROTOCOL: Sysexit = Sysexit(76);
pub const EX_NOPERM: Sysexit = Sysexit(77);
pub const EX_CONFIG: Sysexit = Sysexit(78);

impl Sysexit {
    pub fn exit(self) -> ! {
        std::process::exit(self.0)
    }

    fn name(self) -> &'static str {
        match self {
            EX_OK => "EX_OK",
            EX_USAGE => "EX_USAGE",
            EX_UNAVAILABLE => "EX_UNAVAILABLE",
            EX_SOFTWARE => "EX_SOFTWARE",
            EX_OSERR => "EX_OSERR",
            EX_TEMPFAIL => "EX_TEMPFAIL",
            EX_PROTOCOL => "EX_PROTOCOL",
            EX_NOPERM => "EX_NOPERM",
            EX_CONFIG => "EX_CONFIG",
            _ => "unknown",
        }
    }
}

impl fmt::Display for Sysexit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.name())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_names_the_code() {
        assert_eq!("75 (EX_TEMPFAIL)", EX_TEMPFAIL.to_string());
        assert_eq!("3 (unknown)", Sysexit(3).to_string());
    }
}
