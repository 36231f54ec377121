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


use log::{error, info};

use super::main::{CommonOptions, RunSubcommand};
use crate::imap::session::ImapSession;
use crate::lmtp::session::LmtpSession;
use crate::relay::orchestrator::Relay;
use crate::relay::scanner::MailboxScanner;
use crate::support::config::RelayConfig;
use crate::support::error::{Error, ErrorKind};
use crate::support::shutdown::{self, Shutdown};
use crate::support::sysexits::*;

pub(super) fn run(cmd: RunSubcommand) -> Sysexit {
    let trace = cmd.common.trace;
    let config = match RelayConfig::load(&cmd.common.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return e.exit_code();
        }
    };

    if let Err(e) = shutdown::install_signal_handlers() {
        error!("Failed to install signal handlers: {}", e);
        return EX_OSERR;
    }

    info!(
        "Relaying {}@{}/{} to {} for {}",
        config.imap.user,
        config.imap.host,
        config.imap.mailbox,
        config.lmtp.endpoint(),
        config.lmtp.envelope_recipient
    );

    let mut imap =
        match ImapSession::connect(&config.imap, &config.done_flag, trace) {
            Ok(imap) => imap,
            Err(e) => {
                error!("Connecting to {} failed: {}", config.imap.host, e);
                return e.exit_code();
            }
        };

    let lmtp_config = &config.lmtp;
    let mut relay = Relay::new(
        &mut imap,
        || LmtpSession::connect(lmtp_config, trace),
        config.done_flag.clone(),
        config.envelope(),
        config.imap.idle_refresh(),
        Shutdown::signals(),
    );
    let result = relay.run();
    drop(relay);

    match result {
        Ok(()) => {
            imap.logout();
            EX_OK
        }
        Err(e) => {
            // A dead connection would only make LOGOUT wait for the timeout.
            if ErrorKind::Connection != e.kind() {
                imap.logout();
            }
            e.exit_code()
        }
    }
}

pub(super) fn check(cmd: CommonOptions) -> Sysexit {
    match try_check(&cmd) {
        Ok(()) => EX_OK,
        Err(e) => {
            eprintln!("{}", e);
            e.exit_code()
        }
    }
}

fn try_check(cmd: &CommonOptions) -> Result<(), Error> {
    let config = RelayConfig::load(&cmd.config)?;
    println!("Configuration in '{}' is valid", cmd.config.display());

    let mut imap =
        ImapSession::connect(&config.imap, &config.done_flag, cmd.trace)?;
    println!(
        "IMAP: logged in to {} as {}; IDLE {}supported",
        config.imap.host,
        config.imap.user,
        if imap.has_idle() { "" } else { "NOT " }
    );

    let waiting =
        MailboxScanner::new(config.done_flag.clone()).scan(&mut imap)?;
    println!(
        "IMAP: {} message(s) in {} without {}",
        waiting.len(),
        config.imap.mailbox,
        config.done_flag
    );

    let lmtp = LmtpSession::connect(&config.lmtp, cmd.trace)?;
    println!("LMTP: connected to {}", config.lmtp.endpoint());
    lmtp.quit();
    imap.logout();

    Ok(())
}
