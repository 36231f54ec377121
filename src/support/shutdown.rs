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

//! Operator-requested shutdown.
//!
//! SIGINT and SIGTERM only raise a flag. Nothing is interrupted directly; the
//! IDLE wait polls the flag and the orchestrator checks it between messages,
//! so a signal never lands in the middle of a delivery or a flag update.

use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(test)]
use std::sync::Arc;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_: nix::libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

/// Install the SIGINT/SIGTERM handlers backing `Shutdown::signals()`.
pub fn install_signal_handlers() -> nix::Result<()> {
    // SA_RESTART so that a signal arriving while a delivery is in flight
    // doesn't turn into a spurious I/O error.
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for &sig in &[Signal::SIGINT, Signal::SIGTERM] {
        unsafe {
            signal::sigaction(sig, &action)?;
        }
    }
    Ok(())
}

/// A handle on whether shutdown has been requested.
#[derive(Clone, Debug)]
pub enum Shutdown {
    /// Set by the process signal handlers.
    Signals,
    /// Set explicitly through `request()`.
    #[cfg(test)]
    Manual(Arc<AtomicBool>),
}

impl Shutdown {
    pub fn signals() -> Self {
        Shutdown::Signals
    }

    #[cfg(test)]
    pub fn manual() -> Self {
        Shutdown::Manual(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_requested(&self) -> bool {
        match *self {
            Shutdown::Signals => SIGNALLED.load(Ordering::SeqCst),
            #[cfg(test)]
            Shutdown::Manual(ref flag) => flag.load(Ordering::SeqCst),
        }
    }

    #[cfg(test)]
    pub fn request(&self) {
        match *self {
            Shutdown::Signals => SIGNALLED.store(true, Ordering::SeqCst),
            #[cfg(test)]
            Shutdown::Manual(ref flag) => flag.store(true, Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn manual_shutdown_is_shared_between_clones() {
        let shutdown = Shutdown::manual();
        let other = shutdown.clone();
        assert!(!other.is_requested());
        shutdown.request();
        assert!(other.is_requested());
    }
}
