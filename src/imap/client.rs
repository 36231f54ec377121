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

//! Line-level IMAP client.
//!
//! This knows how to frame commands and responses (tags, literals, CRLF) and
//! nothing about what they mean; `session.rs` builds the relay's operations
//! on top of it.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::str;
use std::time::Duration;

use lazy_static::lazy_static;
use log::trace;
use regex::bytes::Regex;

use super::response::{self, Response};
use crate::support::error::{is_timeout, timeout_as, Error};
use crate::support::transport::Transport;

lazy_static! {
    static ref LITERAL_AT_EOL: Regex =
        Regex::new(r#"~?\{([0-9]+)\+?\}\r\n$"#).unwrap();
}

pub struct Client {
    io: BufReader<Transport>,
    log_prefix: String,
    trace: bool,
    next_tag: u64,
    command_timeout: Duration,
}

impl Client {
    pub fn new(
        transport: Transport,
        log_prefix: String,
        trace: bool,
        command_timeout: Duration,
    ) -> Result<Self, Error> {
        transport.set_read_timeout(Some(command_timeout))?;
        transport.set_write_timeout(Some(command_timeout))?;
        Ok(Client {
            io: BufReader::new(transport),
            log_prefix,
            trace,
            next_tag: 1,
            command_timeout,
        })
    }

    pub fn log_prefix(&self) -> &str {
        &self.log_prefix
    }

    pub fn is_tls(&self) -> bool {
        self.io.get_ref().is_tls()
    }

    /// Replace the underlying transport with a TLS session over it.
    ///
    /// Fails if the server has already sent anything past the STARTTLS
    /// response, since that data would have been injected before the
    /// handshake.
    pub fn start_tls(
        self,
        host: &str,
        allow_insecure: bool,
    ) -> Result<Self, Error> {
        if !self.io.buffer().is_empty() {
            return Err(Error::Protocol(
                "Server sent data ahead of TLS handshake".to_owned(),
            ));
        }

        let Client {
            io,
            log_prefix,
            trace,
            next_tag,
            command_timeout,
        } = self;
        let transport = io.into_inner().start_tls(host, allow_insecure)?;
        Ok(Client {
            io: BufReader::new(transport),
            log_prefix,
            trace,
            next_tag,
            command_timeout,
        })
    }

    pub fn set_read_timeout(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        self.io.get_ref().set_read_timeout(timeout)?;
        Ok(())
    }

    pub fn restore_read_timeout(&mut self) -> Result<(), Error> {
        let timeout = self.command_timeout;
        self.set_read_timeout(Some(timeout))
    }

    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.trace(false, ">>[raw]", bytes);
        self.write_all(bytes)
    }

    /// Like `write_raw`, but never puts the data into the trace.
    pub fn write_raw_censored(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.trace(false, ">>[raw]", b"<censored>");
        self.write_all(bytes)
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let w = self.io.get_mut();
        w.write_all(bytes)
            .and_then(|_| w.flush())
            .map_err(|e| timeout_as(e, "IMAP server to accept data"))
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    pub fn allocate_tag(&mut self) -> String {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;
        tag
    }

    /// Allocate a tag and send `command` with it.
    pub fn send_command(&mut self, command: &str) -> Result<String, Error> {
        let tag = self.allocate_tag();
        let line = format!("{} {}\r\n", tag, command);
        self.trace(false, ">>[cmd]", line.as_bytes());
        self.write_all(line.as_bytes())?;
        Ok(tag)
    }

    /// Send `command` and read every response up to and including its
    /// tagged completion, which is the last element of the result.
    pub fn command<'a>(
        &mut self,
        command: &str,
        response_buffer: &'a mut Vec<u8>,
    ) -> Result<Vec<Response<'a>>, Error> {
        response_buffer.clear();
        let tag = self.send_command(command)?;
        self.read_responses_until_tagged(&tag, response_buffer)
    }

    pub fn read_line_raw(&mut self, dst: &mut Vec<u8>) -> Result<usize, Error> {
        let start = dst.len();
        let nread = self
            .io
            .read_until(b'\n', dst)
            .map_err(|e| timeout_as(e, "IMAP server response"))?;
        if 0 == nread {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Connection closed by IMAP server",
            )));
        }
        self.trace(false, "<<[eol]", &dst[start..]);
        Ok(nread)
    }

    pub fn read_data_raw(
        &mut self,
        dst: &mut Vec<u8>,
        n: u32,
    ) -> Result<usize, Error> {
        let start = dst.len();
        let nread = self
            .io
            .by_ref()
            .take(n.into())
            .read_to_end(dst)
            .map_err(|e| timeout_as(e, "IMAP literal"))?;
        self.trace(true, "<<[lit]", &dst[start..]);
        if n > nread as u32 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Hit EOF before end of literal",
            )));
        }

        Ok(nread)
    }

    /// Read one response line including any literals it contains.
    pub fn read_logical_line(
        &mut self,
        dst: &mut Vec<u8>,
    ) -> Result<(), Error> {
        let start = dst.len();
        self.read_line_raw(dst)?;
        self.finish_logical_line(dst, start)
    }

    /// Like `read_logical_line`, but returns `false` instead of failing if
    /// the read timeout fires before anything arrives.
    ///
    /// Partial data stays in `dst`, so calling this again with the same
    /// buffer resumes where it left off.
    pub fn poll_logical_line(
        &mut self,
        dst: &mut Vec<u8>,
    ) -> Result<bool, Error> {
        let line_start = memchr::memrchr(b'\n', dst).map_or(0, |ix| ix + 1);
        match self.io.read_until(b'\n', dst) {
            Ok(0) => Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Connection closed by IMAP server",
            ))),
            Ok(_) => {
                self.trace(false, "<<[eol]", &dst[line_start..]);
                // Literals during IDLE are not expected, but if one does
                // show up it is read under the normal command timeout.
                self.restore_read_timeout()?;
                self.finish_logical_line(dst, line_start)?;
                Ok(true)
            }
            Err(e) if is_timeout(&e) => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn finish_logical_line(
        &mut self,
        dst: &mut Vec<u8>,
        mut line_start: usize,
    ) -> Result<(), Error> {
        loop {
            if !dst.ends_with(b"\r\n") {
                return Err(Error::Protocol(
                    "Line didn't end with CRLF".to_owned(),
                ));
            }

            let literal_len = LITERAL_AT_EOL
                .captures(&dst[line_start..])
                .and_then(|cap| cap.get(1))
                .and_then(|len| str::from_utf8(len.as_bytes()).ok())
                .and_then(|len| len.parse::<u32>().ok());

            if let Some(literal_len) = literal_len {
                self.read_data_raw(dst, literal_len)?;
                line_start = dst.len();
                self.read_line_raw(dst)?;
            } else {
                break;
            }
        }

        Ok(())
    }

    /// Read and parse one response.
    pub fn read_one_response<'a>(
        &mut self,
        dst: &'a mut Vec<u8>,
    ) -> Result<Response<'a>, Error> {
        let start = dst.len();
        self.read_logical_line(dst)?;
        let dst: &'a Vec<u8> = dst;
        let end = dst.len() - 2;
        response::parse(&dst[start..end])
    }

    /// Read responses until one tagged with `tag` arrives; that one is last
    /// in the result.
    pub fn read_responses_until_tagged<'a>(
        &mut self,
        tag: &str,
        dst: &'a mut Vec<u8>,
    ) -> Result<Vec<Response<'a>>, Error> {
        let mut boundaries = vec![dst.len()];
        loop {
            let start = dst.len();
            self.read_logical_line(dst)?;
            boundaries.push(dst.len());

            if b'*' != dst[start] {
                break;
            }
        }

        let dst: &'a Vec<u8> = &*dst;

        let responses = boundaries
            .windows(2)
            .map(|w| response::parse(&dst[w[0]..w[1] - 2]))
            .collect::<Result<Vec<_>, Error>>()?;

        match responses.last() {
            Some(&Response::Tagged(ref t, _)) if t == tag => Ok(responses),
            Some(&Response::Continuation(_)) => Err(Error::Protocol(format!(
                "Unexpected continuation request in response to {}",
                tag
            ))),
            _ => Err(Error::Protocol(format!(
                "Expected completion of {}, got: {}",
                tag,
                response::excerpt(&dst[boundaries[boundaries.len() - 2]..])
            ))),
        }
    }

    fn trace(&self, truncate: bool, what: &str, data: &[u8]) {
        if !self.trace {
            return;
        }

        if data.is_empty() {
            trace!("{} WIRE {}<empty>", self.log_prefix, what);
            return;
        }

        let (data, truncated) = if truncate {
            data.split_at(data.len().min(128))
        } else {
            (data, &[] as &[u8])
        };

        let mut start = 0;
        for split in memchr::memchr_iter(b'\n', data)
            .chain(std::iter::once(data.len() - 1))
        {
            if split < start {
                continue;
            }

            let data = &data[start..=split];
            start = split + 1;

            trace!("{} WIRE {} {}", self.log_prefix, what, visible(data));
        }

        if !truncated.is_empty() {
            trace!(
                "{} WIRE {}<{} more bytes>",
                self.log_prefix,
                what,
                truncated.len()
            );
        }
    }
}

fn visible(data: &[u8]) -> String {
    let mut vis = String::new();
    for &byte in data {
        match byte {
            b' '..=b'~' => vis.push(byte as char),
            b'\n' => vis.push_str("\\n"),
            b'\r' => vis.push_str("\\r"),
            b => vis.push_str(&format!("\\x{:02X}", b)),
        }
    }
    vis
}

#[cfg(test)]
mod test {
    use std::os::unix::net::UnixStream;
    use std::thread;

    use super::*;
    use crate::imap::response::{Cond, Untagged};

    fn client_with_server(
        script: &'static [u8],
    ) -> (Client, thread::JoinHandle<Vec<u8>>) {
        crate::init_test_log();

        let (client_io, mut server_io) = UnixStream::pair().unwrap();
        let server = thread::spawn(move || {
            server_io.write_all(script).unwrap();
            server_io
                .set_read_timeout(Some(Duration::from_millis(200)))
                .unwrap();
            let mut received = Vec::new();
            let _ = server_io.read_to_end(&mut received);
            received
        });

        let client = Client::new(
            Transport::from(client_io),
            "imap[test]".to_owned(),
            true,
            Duration::from_secs(5),
        )
        .unwrap();
        (client, server)
    }

    #[test]
    fn command_collects_responses_until_tagged() {
        let (mut client, _server) = client_with_server(
            b"* SEARCH 3 4\r\n\
              * 5 EXISTS\r\n\
              A1 OK Search completed\r\n",
        );

        let mut buffer = Vec::new();
        let responses =
            client.command("UID SEARCH ALL", &mut buffer).unwrap();
        assert_eq!(3, responses.len());
        assert_eq!(
            Response::Untagged(Untagged::Search(vec![3, 4])),
            responses[0]
        );
        assert_eq!(Response::Untagged(Untagged::Exists(5)), responses[1]);
        match responses[2] {
            Response::Tagged(ref tag, ref status) => {
                assert_eq!("A1", &**tag);
                assert_eq!(Cond::Ok, status.cond);
            }
            ref r => panic!("Unexpected response: {:?}", r),
        }
    }

    #[test]
    fn literals_are_read_inline() {
        let (mut client, _server) = client_with_server(
            b"* 1 FETCH (UID 7 BODY[] {8}\r\nab\r\ncd\r\n FLAGS ())\r\n\
              A1 OK done\r\n",
        );

        let mut buffer = Vec::new();
        let responses =
            client.command("UID FETCH 7 BODY.PEEK[]", &mut buffer).unwrap();
        assert_eq!(2, responses.len());
        match responses[0] {
            Response::Untagged(Untagged::Fetch(1, ref atts)) => {
                assert_eq!(3, atts.len());
            }
            ref r => panic!("Unexpected response: {:?}", r),
        }
    }

    #[test]
    fn mismatched_tag_is_a_protocol_error() {
        let (mut client, _server) =
            client_with_server(b"A7 OK what\r\n");

        let mut buffer = Vec::new();
        assert_matches!(
            Err(Error::Protocol(_)),
            client.command("NOOP", &mut buffer).map(|_| ())
        );
    }

    #[test]
    fn truncated_line_is_a_protocol_error() {
        let (mut client, _server) = client_with_server(b"* OK partial");

        let mut buffer = Vec::new();
        assert_matches!(
            Err(Error::Protocol(_)),
            client.command("NOOP", &mut buffer).map(|_| ())
        );
    }

    #[test]
    fn polling_resumes_partial_lines() {
        let (client_io, mut server_io) = UnixStream::pair().unwrap();
        let mut client = Client::new(
            Transport::from(client_io),
            "imap[test]".to_owned(),
            false,
            Duration::from_secs(5),
        )
        .unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();

        let mut line = Vec::new();
        assert!(!client.poll_logical_line(&mut line).unwrap());

        server_io.write_all(b"* 3 EXI").unwrap();
        assert!(!client.poll_logical_line(&mut line).unwrap());
        assert_eq!(b"* 3 EXI", &line[..]);

        server_io.write_all(b"STS\r\n").unwrap();
        assert!(client.poll_logical_line(&mut line).unwrap());
        assert_eq!(b"* 3 EXISTS\r\n", &line[..]);
    }

    #[test]
    fn sent_commands_are_tagged_sequentially() {
        let (mut client, server) = client_with_server(b"");
        assert_eq!("A1", client.send_command("NOOP").unwrap());
        assert_eq!("A2", client.send_command("IDLE").unwrap());
        client.write_raw_censored(b"secret\r\n").unwrap();
        drop(client);

        assert_eq!(
            b"A1 NOOP\r\nA2 IDLE\r\nsecret\r\n".to_vec(),
            server.join().unwrap()
        );
    }
}
