//! Blocking session to the migration destination.
//!
//! The migrator is a plain redis client of the destination: it connects,
//! optionally authenticates, drives the per-slot import status, streams
//! pipelined command bytes, and then counts exactly N replies. Reply parsing
//! is a small pushdown automaton over a carry-over buffer: reads use a 1 s
//! socket timeout and retry, polling the stop flag between attempts so a
//! silent peer cannot wedge a canceled job.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;

use crate::command_encoder::resp_command;
use crate::slot::SlotId;

/// Destination-side import status codes for `CLUSTER IMPORT`.
pub const IMPORT_START: i64 = 0;
pub const IMPORT_SUCCESS: i64 = 1;
pub const IMPORT_FAILED: i64 = 2;
/// Reserved by the wire protocol; never sent by the migrator.
pub const IMPORT_ERROR: i64 = 3;

const RECV_TIMEOUT: Duration = Duration::from_secs(1);

const ERR_STOPPED: &str = "reply wait aborted by stop flag";

/// Reply parser state. One reply is a scalar line, a bulk payload, or an
/// array whose elements are counted line by line (bulk payloads included).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParserState {
    ArrayLen,
    BulkData,
    ArrayData,
    OneRspEnd,
}

pub struct DstClient {
    stream: TcpStream,
    /// Unconsumed reply bytes carried between pipeline rounds.
    buf: Vec<u8>,
}

impl DstClient {
    pub fn connect(host: &str, port: u16) -> anyhow::Result<Self> {
        let addr = (host, port)
            .to_socket_addrs()
            .with_context(|| format!("resolve destination {host}:{port}"))?
            .next()
            .with_context(|| format!("no address for destination {host}:{port}"))?;
        let stream = TcpStream::connect(addr)
            .with_context(|| format!("connect to destination {host}:{port}"))?;
        stream.set_read_timeout(Some(RECV_TIMEOUT))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            buf: Vec::new(),
        })
    }

    pub fn send(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.stream
            .write_all(bytes)
            .context("write to destination socket")
    }

    pub fn auth(&mut self, password: &str, stop: &AtomicBool) -> anyhow::Result<()> {
        let cmd = resp_command(&[b"AUTH".to_vec(), password.as_bytes().to_vec()]);
        self.send(&cmd).context("send AUTH command")?;
        self.check_single_response(stop)
            .context("check the response of AUTH command")
    }

    pub fn set_import_status(
        &mut self,
        slot: SlotId,
        status: i64,
        stop: &AtomicBool,
    ) -> anyhow::Result<()> {
        let cmd = resp_command(&[
            b"CLUSTER".to_vec(),
            b"IMPORT".to_vec(),
            slot.to_string().into_bytes(),
            status.to_string().into_bytes(),
        ]);
        self.send(&cmd).context("send import status command")?;
        self.check_single_response(stop)
            .context("check the import status response")
    }

    pub fn check_single_response(&mut self, stop: &AtomicBool) -> anyhow::Result<()> {
        self.check_multiple_responses(1, stop)
    }

    /// Parses exactly `total` successful replies off the socket.
    ///
    /// Accepts simple strings, integers, bulk strings (nil included), and
    /// arrays with arbitrary scalar nesting. A top-level error reply fails
    /// the whole pipeline.
    pub fn check_multiple_responses(
        &mut self,
        total: u64,
        stop: &AtomicBool,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(total > 0, "invalid reply count {total}");

        let mut count = 0u64;
        let mut state = ParserState::ArrayLen;
        let mut bulk_len = 0usize;
        let mut array_remaining = 0u64;

        loop {
            let mut progressed = true;
            while progressed {
                progressed = false;
                match state {
                    ParserState::ArrayLen => {
                        let Some((line, consumed)) = peek_line(&self.buf) else {
                            break;
                        };
                        anyhow::ensure!(!line.is_empty(), "empty reply line");
                        match line[0] {
                            b'-' => {
                                let msg = String::from_utf8_lossy(&line[1..]).to_string();
                                anyhow::bail!("destination replied with error: {msg}");
                            }
                            b'+' | b':' => {
                                self.buf.drain(..consumed);
                                state = ParserState::OneRspEnd;
                            }
                            b'$' => {
                                let len = parse_len(&line[1..])?;
                                self.buf.drain(..consumed);
                                if len < 0 {
                                    state = ParserState::OneRspEnd;
                                } else {
                                    bulk_len = len as usize;
                                    state = ParserState::BulkData;
                                }
                            }
                            b'*' => {
                                let len = parse_len(&line[1..])?;
                                self.buf.drain(..consumed);
                                if len <= 0 {
                                    state = ParserState::OneRspEnd;
                                } else {
                                    array_remaining = len as u64;
                                    state = ParserState::ArrayData;
                                }
                            }
                            other => {
                                anyhow::bail!("unexpected reply prefix {:?}", other as char)
                            }
                        }
                        progressed = true;
                    }
                    ParserState::BulkData => {
                        if self.buf.len() < bulk_len + 2 {
                            break;
                        }
                        anyhow::ensure!(
                            &self.buf[bulk_len..bulk_len + 2] == b"\r\n",
                            "bulk payload not terminated by CRLF"
                        );
                        self.buf.drain(..bulk_len + 2);
                        bulk_len = 0;
                        state = ParserState::OneRspEnd;
                        progressed = true;
                    }
                    ParserState::ArrayData => {
                        if array_remaining == 0 {
                            state = ParserState::OneRspEnd;
                            progressed = true;
                            continue;
                        }
                        let Some((line, consumed)) = peek_line(&self.buf) else {
                            break;
                        };
                        anyhow::ensure!(!line.is_empty(), "empty array element line");
                        if line[0] == b'$' {
                            let len = parse_len(&line[1..])?;
                            if len >= 0 {
                                // Consume the header line and its payload
                                // together so a partial payload rewinds clean.
                                let need = consumed + len as usize + 2;
                                if self.buf.len() < need {
                                    break;
                                }
                                anyhow::ensure!(
                                    &self.buf[need - 2..need] == b"\r\n",
                                    "bulk payload not terminated by CRLF"
                                );
                                self.buf.drain(..need);
                            } else {
                                self.buf.drain(..consumed);
                            }
                        } else {
                            if line[0] == b'*' {
                                let nested = parse_len(&line[1..])?;
                                if nested > 0 {
                                    array_remaining += nested as u64;
                                }
                            }
                            self.buf.drain(..consumed);
                        }
                        array_remaining -= 1;
                        progressed = true;
                    }
                    ParserState::OneRspEnd => {
                        count += 1;
                        if count >= total {
                            return Ok(());
                        }
                        state = ParserState::ArrayLen;
                        progressed = true;
                    }
                }
            }

            self.fill_buf(stop)?;
        }
    }

    /// Reads at least one more byte, retrying timeouts until the stop flag
    /// is raised or the socket errors.
    fn fill_buf(&mut self, stop: &AtomicBool) -> anyhow::Result<()> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => anyhow::bail!("destination closed the connection"),
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if stop.load(Ordering::Acquire) {
                        anyhow::bail!(ERR_STOPPED);
                    }
                }
                Err(err) => return Err(err).context("read reply from destination"),
            }
        }
    }
}

/// Returns the next CRLF-terminated line (without the CRLF) and the number
/// of buffer bytes it occupies, or `None` when no full line is buffered.
fn peek_line(buf: &[u8]) -> Option<(&[u8], usize)> {
    let pos = buf.windows(2).position(|w| w == b"\r\n")?;
    Some((&buf[..pos], pos + 2))
}

fn parse_len(digits: &[u8]) -> anyhow::Result<i64> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .context("protocol error: expected integer length")
}
