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

//! The client end of an LMTP (RFC 2033) connection.
//!
//! Every message goes in its own transaction with exactly one recipient, so
//! the single per-recipient reply after the data is the whole outcome.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};

use log::{debug, trace, warn};

use super::codes::*;
use crate::model::Envelope;
use crate::support::config::{LmtpConfig, TlsMode};
use crate::support::error::{timeout_as, Error};
use crate::support::transport::Transport;

const MAX_LINE: u64 = 4096;
const MAX_REPLY_LINES: usize = 1000;

/// The outcome of a transaction that got as far as a definite answer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    /// The recipient or the message was refused for good.
    Rejected { code: u16, text: String },
}

pub struct LmtpSession {
    io: BufReader<Transport>,
    log_prefix: String,
    trace: bool,
    /// Upper-cased keywords from the LHLO reply.
    extensions: Vec<String>,
}

impl LmtpSession {
    /// Connect to the configured endpoint and complete the LHLO exchange.
    pub fn connect(config: &LmtpConfig, trace: bool) -> Result<Self, Error> {
        let transport = match (&config.host, &config.socket) {
            (_, Some(socket)) => Transport::connect_unix(socket)?,
            (Some(host), None) => {
                let transport = Transport::connect_tcp(
                    host,
                    config.port(),
                    config.connect_timeout(),
                )?;
                if TlsMode::Tls == config.tls {
                    transport
                        .set_read_timeout(Some(config.command_timeout()))?;
                    transport.start_tls(host, config.allow_insecure_tls)?
                } else {
                    transport
                }
            }
            (None, None) => {
                return Err(Error::Config("no LMTP endpoint".to_owned()))
            }
        };

        Self::handshake(
            transport,
            config,
            format!("lmtp[{}]", config.endpoint()),
            trace,
        )
    }

    fn handshake(
        transport: Transport,
        config: &LmtpConfig,
        log_prefix: String,
        trace: bool,
    ) -> Result<Self, Error> {
        transport.set_read_timeout(Some(config.command_timeout()))?;
        transport.set_write_timeout(Some(config.command_timeout()))?;

        let mut session = LmtpSession {
            io: BufReader::new(transport),
            log_prefix,
            trace,
            extensions: Vec::new(),
        };

        let greeting = session.read_reply()?;
        if !greeting.is(pc::ServiceReady) {
            return Err(Error::Refused(greeting.to_string()));
        }

        session.lhlo(&config.local_hostname)?;

        if TlsMode::StartTls == config.tls {
            session = session.start_tls(config)?;
            session.lhlo(&config.local_hostname)?;
        }

        debug!(
            "{} Connected; extensions: {}",
            session.log_prefix,
            session.extensions.join(" ")
        );
        Ok(session)
    }

    fn lhlo(&mut self, local_hostname: &str) -> Result<(), Error> {
        self.send_command(&format!("LHLO {}", local_hostname))?;

        let mut extensions = Vec::new();
        let reply = self.read_reply_lines(|text| {
            if let Some(keyword) = text.split(' ').next() {
                extensions.push(keyword.to_ascii_uppercase());
            }
        })?;
        if !reply.is(pc::Ok) {
            return Err(Error::Protocol(format!("LHLO rejected: {}", reply)));
        }

        // The first line is the server's name, not an extension.
        if !extensions.is_empty() {
            extensions.remove(0);
        }
        self.extensions = extensions;
        Ok(())
    }

    fn start_tls(mut self, config: &LmtpConfig) -> Result<Self, Error> {
        if !self.extensions.iter().any(|e| "STARTTLS" == e) {
            return Err(Error::Unsupported("STARTTLS over LMTP".to_owned()));
        }

        self.send_command("STARTTLS")?;
        let reply = self.read_reply()?;
        if !reply.is(pc::ServiceReady) {
            return Err(Error::Protocol(format!(
                "STARTTLS rejected: {}",
                reply
            )));
        }
        if !self.io.buffer().is_empty() {
            return Err(Error::Protocol(
                "Server sent data ahead of TLS handshake".to_owned(),
            ));
        }

        let host = config.host.as_deref().unwrap_or_default();
        let LmtpSession {
            io,
            log_prefix,
            trace,
            ..
        } = self;
        let transport =
            io.into_inner().start_tls(host, config.allow_insecure_tls)?;
        debug!("{} TLS established", log_prefix);
        Ok(LmtpSession {
            io: BufReader::new(transport),
            log_prefix,
            trace,
            extensions: Vec::new(),
        })
    }

    /// Run one complete transaction delivering `data` to the envelope
    /// recipient.
    ///
    /// Anything other than a definite answer is an `LmtpTransient` or
    /// `LmtpPermanent` error; in particular, losing the connection after the
    /// data was sent is transient, since the message may or may not have
    /// been delivered.
    pub fn deliver(
        &mut self,
        envelope: &Envelope,
        data: &[u8],
    ) -> Result<Delivery, Error> {
        let mut completed = false;
        let result = self.transact(envelope, data, &mut completed);

        if !completed {
            self.reset();
        }

        result.map_err(|e| match e {
            e @ Error::LmtpTransient(..) | e @ Error::LmtpPermanent(..) => e,
            e => Error::LmtpTransient(e.to_string()),
        })
    }

    fn transact(
        &mut self,
        envelope: &Envelope,
        data: &[u8],
        completed: &mut bool,
    ) -> Result<Delivery, Error> {
        self.send_command(&format!("MAIL FROM:<{}>", envelope.sender))?;
        let reply = self.read_reply()?;
        match reply.class() {
            Some(cc::Success) => (),
            Some(cc::PermFail) => {
                return Err(Error::LmtpPermanent(format!(
                    "MAIL FROM: {}",
                    reply
                )))
            }
            _ => return Err(unexpected("MAIL FROM", &reply)),
        }

        self.send_command(&format!("RCPT TO:<{}>", envelope.recipient))?;
        let reply = self.read_reply()?;
        match reply.class() {
            Some(cc::Success) => (),
            Some(cc::PermFail) => return Ok(rejected(reply)),
            _ => return Err(unexpected("RCPT TO", &reply)),
        }

        self.send_command("DATA")?;
        let reply = self.read_reply()?;
        match reply.class() {
            _ if reply.is(pc::StartMailInput) => (),
            Some(cc::PermFail) => {
                return Err(Error::LmtpPermanent(format!("DATA: {}", reply)))
            }
            _ => return Err(unexpected("DATA", &reply)),
        }

        self.send_body(data)?;

        // One reply per accepted recipient, and there is exactly one.
        let reply = self.read_reply()?;
        *completed = true;
        match reply.class() {
            Some(cc::Success) => Ok(Delivery::Accepted),
            Some(cc::PermFail) => Ok(rejected(reply)),
            _ => Err(unexpected("message data", &reply)),
        }
    }

    /// Abandon whatever transaction is open. Failure is only logged; the
    /// next command will fail too if the session is dead.
    fn reset(&mut self) {
        let result = self
            .send_command("RSET")
            .and_then(|_| self.read_reply());
        match result {
            Ok(ref reply) if reply.is(pc::Ok) => (),
            Ok(reply) => {
                warn!("{} RSET rejected: {}", self.log_prefix, reply)
            }
            Err(e) => warn!("{} RSET failed: {}", self.log_prefix, e),
        }
    }

    /// Say goodbye. Failures are only logged.
    pub fn quit(mut self) {
        let result = self
            .send_command("QUIT")
            .and_then(|_| self.read_reply());
        match result {
            Ok(ref reply) if reply.is(pc::ServiceClosing) => {
                debug!("{} Closed", self.log_prefix)
            }
            Ok(reply) => debug!("{} QUIT answered: {}", self.log_prefix, reply),
            Err(e) => debug!("{} QUIT failed: {}", self.log_prefix, e),
        }
    }

    fn send_command(&mut self, command: &str) -> Result<(), Error> {
        if self.trace {
            trace!("{} WIRE >> {}", self.log_prefix, command);
        }

        let w = self.io.get_mut();
        write!(w, "{}\r\n", command)
            .and_then(|_| w.flush())
            .map_err(|e| timeout_as(e, "LMTP server to accept data"))
    }

    fn send_body(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.trace {
            trace!("{} WIRE >> <{} bytes>", self.log_prefix, data.len());
        }

        let mut w = BufWriter::new(self.io.get_mut());
        copy_with_dot_stuffing(&mut w, data)
            .and_then(|_| w.flush())
            .map_err(|e| timeout_as(e, "LMTP server to accept data"))
    }

    fn read_reply(&mut self) -> Result<Reply, Error> {
        self.read_reply_lines(|_| ())
    }

    /// Read reply lines up to and including the last one, calling `on_line`
    /// with the text of each.
    fn read_reply_lines(
        &mut self,
        mut on_line: impl FnMut(&str),
    ) -> Result<Reply, Error> {
        let mut text = String::new();
        for _ in 0..MAX_REPLY_LINES {
            let line = self.read_line()?;
            let parsed = parse_line(&line).ok_or_else(|| {
                Error::Protocol(format!("Bad LMTP reply: {:?}", line))
            })?;

            on_line(parsed.text);
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(parsed.text);

            if parsed.last {
                return Ok(Reply {
                    code: parsed.code,
                    text,
                });
            }
        }

        Err(Error::Protocol("Too many LMTP reply lines".to_owned()))
    }

    fn read_line(&mut self) -> Result<String, Error> {
        let mut line = Vec::new();
        (&mut self.io)
            .take(MAX_LINE)
            .read_until(b'\n', &mut line)
            .map_err(|e| timeout_as(e, "LMTP reply"))?;

        if line.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Connection closed by LMTP server",
            )));
        }
        if !line.ends_with(b"\n") {
            return Err(Error::Protocol(
                "LMTP reply line too long or truncated".to_owned(),
            ));
        }

        let line = String::from_utf8_lossy(&line).into_owned();
        if self.trace {
            trace!("{} WIRE << {}", self.log_prefix, line.trim_end());
        }
        Ok(line)
    }
}

fn rejected(reply: Reply) -> Delivery {
    Delivery::Rejected {
        code: reply.code,
        text: reply.text,
    }
}

/// A reply that is neither success nor permanent failure. 4xx is an honest
/// temporary failure; anything else leaves the outcome unknown, which is
/// treated the same way.
fn unexpected(stage: &str, reply: &Reply) -> Error {
    Error::LmtpTransient(format!("{}: {}", stage, reply))
}

struct ParsedLine<'a> {
    code: u16,
    last: bool,
    text: &'a str,
}

fn parse_line(s: &str) -> Option<ParsedLine<'_>> {
    let s = s.trim_end_matches(&['\r', '\n'][..]);
    let code = s.get(0..3)?;
    // A bare code with nothing after it is tolerated as a last line.
    let last = s.get(3..4).unwrap_or(" ");
    let text = s.get(4..).unwrap_or("");

    if !code.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let code: u16 = code.parse().ok()?;
    let last = match last {
        " " => true,
        "-" => false,
        _ => return None,
    };

    Some(ParsedLine { code, last, text })
}

/// Copy `src` into `dst`, applying CRLF-strict dot stuffing. The copy includes
/// the terminating ".\r\n".
fn copy_with_dot_stuffing(
    dst: &mut impl Write,
    mut src: &[u8],
) -> io::Result<()> {
    let mut start_of_line = true;
    let mut prev_end = 0u8;

    while !src.is_empty() {
        let end = memchr::memchr(b'\n', src).map_or(src.len(), |eol| eol + 1);
        let (chunk, rest) = src.split_at(end);

        if start_of_line && Some(&b'.') == chunk.first() {
            dst.write_all(b".")?;
        }
        dst.write_all(chunk)?;

        let last = chunk[chunk.len() - 1];
        let prev = chunk
            .get(chunk.len().wrapping_sub(2))
            .copied()
            .unwrap_or(prev_end);
        start_of_line = b'\r' == prev && b'\n' == last;
        prev_end = last;
        src = rest;
    }

    if !start_of_line {
        dst.write_all(b"\r\n")?;
    }
    dst.write_all(b".\r\n")?;

    Ok(())
}

#[cfg(test)]
mod test {
    use std::os::unix::net::UnixStream;
    use std::thread::{self, JoinHandle};

    use proptest::prelude::*;

    use super::*;
    use crate::support::error::ErrorKind;

    proptest! {
        #[test]
        fn binary_dot_stuffing_encodes_properly(
            content in "[x.\r\n]{1,100}",
        ) {
            let mut stuffed = content.replace("\r\n.", "\r\n..");
            if stuffed.starts_with('.') {
                stuffed = format!(".{}", stuffed);
            }
            if !stuffed.ends_with("\r\n") {
                stuffed.push_str("\r\n");
            }
            stuffed.push_str(".\r\n");

            let mut actual = Vec::new();
            copy_with_dot_stuffing(&mut actual, content.as_bytes()).unwrap();
            prop_assert_eq!(stuffed, String::from_utf8(actual).unwrap());
        }
    }

    #[derive(Clone, Copy, Debug)]
    enum Step {
        /// Send this verbatim.
        Send(&'static str),
        /// Expect a command line starting with this.
        Expect(&'static str),
        /// Read message data up to the terminating dot.
        Data,
    }

    use self::Step::*;

    /// Run a fake LMTP server. The result is everything received as message
    /// data, still dot-stuffed.
    fn serve(script: Vec<Step>) -> (Transport, JoinHandle<Vec<u8>>) {
        crate::init_test_log();

        let (client_io, server_io) = UnixStream::pair().unwrap();
        let server = thread::spawn(move || {
            let mut reader = BufReader::new(server_io.try_clone().unwrap());
            let mut writer = server_io;
            let mut data = Vec::new();

            for step in script {
                match step {
                    Send(s) => writer.write_all(s.as_bytes()).unwrap(),
                    Expect(prefix) => {
                        let mut line = String::new();
                        reader.read_line(&mut line).unwrap();
                        assert!(
                            line.starts_with(prefix),
                            "Expected {:?}, got {:?}",
                            prefix,
                            line
                        );
                    }
                    Data => loop {
                        let start = data.len();
                        if 0 == reader.read_until(b'\n', &mut data).unwrap()
                            || b".\r\n" == &data[start..]
                        {
                            break;
                        }
                    },
                }
            }

            data
        });

        (Transport::from(client_io), server)
    }

    fn config() -> LmtpConfig {
        toml::from_str(
            "socket = \"/run/lmtp\"\n\
             envelope_recipient = \"user@localhost\"\n",
        )
        .unwrap()
    }

    fn envelope() -> Envelope {
        Envelope {
            sender: "mettmail@localhost".to_owned(),
            recipient: "user@localhost".to_owned(),
        }
    }

    fn connected(
        mut steps: Vec<Step>,
    ) -> (LmtpSession, JoinHandle<Vec<u8>>) {
        let mut script = vec![
            Send("220 lmtp.test LMTP ready\r\n"),
            Expect("LHLO localhost\r\n"),
            Send(
                "250-lmtp.test\r\n\
                 250-PIPELINING\r\n\
                 250 ENHANCEDSTATUSCODES\r\n",
            ),
        ];
        script.append(&mut steps);

        let (transport, server) = serve(script);
        let session = LmtpSession::handshake(
            transport,
            &config(),
            "lmtp[test]".to_owned(),
            true,
        )
        .unwrap();
        (session, server)
    }

    fn transaction_start() -> Vec<Step> {
        vec![
            Expect("MAIL FROM:<mettmail@localhost>\r\n"),
            Send("250 2.1.0 OK\r\n"),
            Expect("RCPT TO:<user@localhost>\r\n"),
            Send("250 2.1.5 OK\r\n"),
            Expect("DATA\r\n"),
            Send("354 Go ahead\r\n"),
            Data,
        ]
    }

    #[test]
    fn accepted_delivery_is_dot_stuffed() {
        let mut steps = transaction_start();
        steps.extend(vec![
            Send("250 2.0.0 <user@localhost> Saved\r\n"),
            Expect("QUIT"),
            Send("221 Bye\r\n"),
        ]);
        let (mut session, server) = connected(steps);

        assert_eq!(
            vec!["PIPELINING", "ENHANCEDSTATUSCODES"],
            session.extensions
        );
        assert_eq!(
            Delivery::Accepted,
            session
                .deliver(&envelope(), b"Subject: x\r\n\r\n.hidden\r\n")
                .unwrap()
        );
        session.quit();

        assert_eq!(
            b"Subject: x\r\n\r\n..hidden\r\n.\r\n".to_vec(),
            server.join().unwrap()
        );
    }

    #[test]
    fn final_permanent_failure_is_a_rejection() {
        let mut steps = transaction_start();
        steps.push(Send("552 5.2.2 <user@localhost> Mailbox full\r\n"));
        let (mut session, server) = connected(steps);

        assert_eq!(
            Delivery::Rejected {
                code: 552,
                text: "5.2.2 <user@localhost> Mailbox full".to_owned(),
            },
            session.deliver(&envelope(), b"hello\r\n").unwrap()
        );
        server.join().unwrap();
    }

    #[test]
    fn recipient_rejection_resets_transaction() {
        let (mut session, server) = connected(vec![
            Expect("MAIL FROM"),
            Send("250 OK\r\n"),
            Expect("RCPT TO"),
            Send("550 5.1.1 No such user\r\n"),
            Expect("RSET"),
            Send("250 OK\r\n"),
        ]);

        assert_eq!(
            Delivery::Rejected {
                code: 550,
                text: "5.1.1 No such user".to_owned(),
            },
            session.deliver(&envelope(), b"hello\r\n").unwrap()
        );
        server.join().unwrap();
    }

    #[test]
    fn sender_rejection_is_permanent_error() {
        let (mut session, server) = connected(vec![
            Expect("MAIL FROM"),
            Send("553 Bad sender\r\n"),
            Expect("RSET"),
            Send("250 OK\r\n"),
        ]);

        match session.deliver(&envelope(), b"hello\r\n") {
            Err(e @ Error::LmtpPermanent(..)) => {
                assert_eq!(ErrorKind::Permanent, e.kind())
            }
            r => panic!("Unexpected result: {:?}", r),
        }
        server.join().unwrap();
    }

    #[test]
    fn temporary_failure_is_transient() {
        let mut steps = transaction_start();
        steps.push(Send("451 4.3.0 Try later\r\n"));
        let (mut session, server) = connected(steps);

        match session.deliver(&envelope(), b"hello\r\n") {
            Err(e @ Error::LmtpTransient(..)) => {
                assert_eq!(ErrorKind::Transient, e.kind())
            }
            r => panic!("Unexpected result: {:?}", r),
        }
        server.join().unwrap();
    }

    #[test]
    fn connection_drop_after_data_is_transient() {
        // The server reads the data and hangs up without answering.
        let (mut session, server) = connected(transaction_start());

        assert_matches!(
            Err(Error::LmtpTransient(..)),
            session.deliver(&envelope(), b"hello\r\n")
        );
        server.join().unwrap();
    }

    #[test]
    fn garbage_reply_is_transient() {
        let (mut session, server) = connected(vec![
            Expect("MAIL FROM"),
            Send("OK whatever\r\n"),
        ]);

        assert_matches!(
            Err(Error::LmtpTransient(..)),
            session.deliver(&envelope(), b"hello\r\n")
        );
        server.join().unwrap();
    }

    #[test]
    fn refused_greeting() {
        let (transport, server) =
            serve(vec![Send("554 No service for you\r\n")]);
        match LmtpSession::handshake(
            transport,
            &config(),
            "lmtp[test]".to_owned(),
            false,
        ) {
            Err(e @ Error::Refused(..)) => {
                assert_eq!(ErrorKind::Connection, e.kind())
            }
            Err(e) => panic!("Unexpected error: {}", e),
            Ok(_) => panic!("Connected unexpectedly"),
        }
        server.join().unwrap();
    }

    #[test]
    fn reply_parsing() {
        let line = parse_line("250-PIPELINING\r\n").unwrap();
        assert_eq!(250, line.code);
        assert!(!line.last);
        assert_eq!("PIPELINING", line.text);

        let line = parse_line("221\r\n").unwrap();
        assert_eq!(221, line.code);
        assert!(line.last);

        assert!(parse_line("2x0 OK\r\n").is_none());
        assert!(parse_line("250_OK\r\n").is_none());
        assert!(parse_line("25\r\n").is_none());
    }
}
