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

//! LMTP reply codes, which are the SMTP ones from RFC 5321.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum PrimaryCode {
    ServiceReady = 220,
    ServiceClosing = 221,
    Ok = 250,
    StartMailInput = 354,
}

pub mod pc {
    pub use super::PrimaryCode::*;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ClassCode {
    Success = 2,
    Intermediate = 3,
    TempFail = 4,
    PermFail = 5,
}

pub mod cc {
    pub use super::ClassCode::*;
}

impl ClassCode {
    pub fn of(code: u16) -> Option<Self> {
        match code / 100 {
            2 => Some(cc::Success),
            3 => Some(cc::Intermediate),
            4 => Some(cc::TempFail),
            5 => Some(cc::PermFail),
            _ => None,
        }
    }
}

/// A complete, possibly multi-line, reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    /// The text of all lines, joined by spaces.
    pub text: String,
}

impl Reply {
    pub fn class(&self) -> Option<ClassCode> {
        ClassCode::of(self.code)
    }

    pub fn is(&self, code: PrimaryCode) -> bool {
        code as u16 == self.code
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(Some(cc::Success), ClassCode::of(250));
        assert_eq!(Some(cc::Intermediate), ClassCode::of(354));
        assert_eq!(Some(cc::TempFail), ClassCode::of(452));
        assert_eq!(Some(cc::PermFail), ClassCode::of(550));
        assert_eq!(None, ClassCode::of(199));
        assert_eq!(None, ClassCode::of(600));

        let reply = Reply {
            code: 354,
            text: "Go ahead".to_owned(),
        };
        assert!(reply.is(pc::StartMailInput));
        assert!(!reply.is(pc::Ok));
        assert_eq!("354 Go ahead", reply.to_string());
    }
}
