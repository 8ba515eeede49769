//! Shared helpers for integration tests.
//!
//! The centerpiece is a scriptable mock destination: a real TCP RESP server
//! that records every command a migration sends, applies data commands to an
//! in-memory model (so tests can compare final states), tracks `CLUSTER
//! IMPORT` transitions, decodes raw `APPLYBATCH` frames, and can inject
//! failures (error replies, dropped connections, per-command delays).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use opal_store::batch_sender::{decode_apply_batch, RawRecord};
use opal_store::engine::SlotEngine;

/// Bound on any wait inside a test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Stream counters tracked by the destination model.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamModel {
    pub entries: Vec<(String, Vec<String>)>,
    pub last_id: String,
    pub entries_added: u64,
    pub max_deleted: String,
}

/// Destination-side view of the migrated data.
#[derive(Debug, Default)]
pub struct Model {
    pub strings: HashMap<String, String>,
    pub hashes: HashMap<String, BTreeMap<String, String>>,
    pub lists: HashMap<String, Vec<String>>,
    pub sets: HashMap<String, BTreeSet<String>>,
    pub zsets: HashMap<String, BTreeMap<String, String>>,
    pub sortedints: HashMap<String, BTreeSet<u64>>,
    pub bitmaps: HashMap<String, BTreeSet<u64>>,
    pub streams: HashMap<String, StreamModel>,
    pub expires: HashMap<String, u64>,
}

#[derive(Debug, Default)]
pub struct DestState {
    /// Every command received, in order, as lossy strings.
    pub commands: Vec<Vec<String>>,
    /// `(slot, status)` pairs from CLUSTER IMPORT.
    pub import_events: Vec<(u16, i64)>,
    /// Records decoded from APPLYBATCH frames, in order.
    pub raw_records: Vec<RawRecord>,
    pub model: Model,
}

#[derive(Default)]
pub struct MockDestinationBuilder {
    fail_after: Option<usize>,
    drop_after: Option<usize>,
    delay_per_command: Option<Duration>,
}

impl MockDestinationBuilder {
    /// Reply `-ERR` to every data command after the first `n`.
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Close the connection without replying after `n` data commands.
    pub fn drop_after(mut self, n: usize) -> Self {
        self.drop_after = Some(n);
        self
    }

    /// Sleep before answering each command, to widen test windows.
    pub fn delay_per_command(mut self, delay: Duration) -> Self {
        self.delay_per_command = Some(delay);
        self
    }

    pub fn start(self) -> MockDestination {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock destination");
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(DestState::default()));

        let thread_state = Arc::clone(&state);
        let handle = std::thread::spawn(move || {
            let Ok((socket, _)) = listener.accept() else {
                return;
            };
            serve_connection(socket, &thread_state, &self);
        });

        MockDestination {
            port,
            state,
            handle: Some(handle),
        }
    }
}

/// One-shot mock destination serving a single migration session.
pub struct MockDestination {
    pub port: u16,
    state: Arc<Mutex<DestState>>,
    handle: Option<JoinHandle<()>>,
}

impl MockDestination {
    pub fn start() -> Self {
        MockDestinationBuilder::default().start()
    }

    pub fn builder() -> MockDestinationBuilder {
        MockDestinationBuilder::default()
    }

    pub fn host_port(&self) -> (String, u16) {
        ("127.0.0.1".to_string(), self.port)
    }

    pub fn state(&self) -> Arc<Mutex<DestState>> {
        Arc::clone(&self.state)
    }

    /// Waits for the migration session to disconnect and returns the state.
    pub fn join(mut self) -> DestState {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        std::mem::take(&mut self.state.lock().expect("dest state poisoned"))
    }
}

impl Drop for MockDestination {
    fn drop(&mut self) {
        // Join only a finished server thread; one still parked in accept()
        // would wedge test cleanup after an unrelated assertion failure.
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

fn serve_connection(
    socket: TcpStream,
    state: &Arc<Mutex<DestState>>,
    script: &MockDestinationBuilder,
) {
    socket.set_nodelay(true).ok();
    let mut reader = BufReader::new(socket.try_clone().expect("clone socket"));
    let mut writer = socket;
    let mut data_commands = 0usize;

    loop {
        let args = match read_command(&mut reader) {
            Ok(Some(args)) => args,
            Ok(None) | Err(_) => return,
        };
        if args.is_empty() {
            continue;
        }
        if let Some(delay) = script.delay_per_command {
            std::thread::sleep(delay);
        }

        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
        let is_control = name == "AUTH" || name == "CLUSTER";
        if !is_control {
            data_commands += 1;
            if let Some(limit) = script.drop_after {
                if data_commands > limit {
                    return;
                }
            }
        }

        let reply = {
            let mut state = state.lock().expect("dest state poisoned");
            state
                .commands
                .push(args.iter().map(|a| String::from_utf8_lossy(a).to_string()).collect());
            if !is_control && script.fail_after.is_some_and(|limit| data_commands > limit) {
                "-ERR injected failure\r\n".to_string()
            } else {
                apply_command(&name, &args, &mut state)
            }
        };

        if writer.write_all(reply.as_bytes()).is_err() {
            return;
        }
    }
}

/// Applies one command to the destination model and returns its RESP reply.
fn apply_command(name: &str, args: &[Vec<u8>], state: &mut DestState) -> String {
    let text = |index: usize| String::from_utf8_lossy(&args[index]).to_string();
    match name {
        "AUTH" => "+OK\r\n".to_string(),
        "CLUSTER" => {
            if args.len() == 4 && args[1].eq_ignore_ascii_case(b"import") {
                let slot = text(2).parse().unwrap_or(u16::MAX);
                let status = text(3).parse().unwrap_or(-1);
                state.import_events.push((slot, status));
            }
            "+OK\r\n".to_string()
        }
        "APPLYBATCH" => match decode_apply_batch(&args[1]) {
            Ok(mut records) => {
                state.raw_records.append(&mut records);
                "+OK\r\n".to_string()
            }
            Err(err) => format!("-ERR bad batch frame: {err}\r\n"),
        },
        "SET" => {
            state.model.strings.insert(text(1), text(2));
            if args.len() >= 5 && args[3].eq_ignore_ascii_case(b"pxat") {
                let at = text(4).parse().unwrap_or(0);
                state.model.expires.insert(text(1), at);
            }
            "+OK\r\n".to_string()
        }
        "DEL" => {
            let key = text(1);
            state.model.strings.remove(&key);
            state.model.hashes.remove(&key);
            state.model.lists.remove(&key);
            state.model.sets.remove(&key);
            state.model.zsets.remove(&key);
            state.model.sortedints.remove(&key);
            state.model.bitmaps.remove(&key);
            state.model.streams.remove(&key);
            state.model.expires.remove(&key);
            ":1\r\n".to_string()
        }
        "PEXPIREAT" => {
            let at = text(2).parse().unwrap_or(0);
            state.model.expires.insert(text(1), at);
            ":1\r\n".to_string()
        }
        "HMSET" | "HSET" => {
            let entry = state.model.hashes.entry(text(1)).or_default();
            let mut added = 0i64;
            for pair in args[2..].chunks(2) {
                if pair.len() == 2 {
                    let field = String::from_utf8_lossy(&pair[0]).to_string();
                    let value = String::from_utf8_lossy(&pair[1]).to_string();
                    if entry.insert(field, value).is_none() {
                        added += 1;
                    }
                }
            }
            if name == "HMSET" {
                "+OK\r\n".to_string()
            } else {
                format!(":{added}\r\n")
            }
        }
        "HDEL" => {
            if let Some(entry) = state.model.hashes.get_mut(&text(1)) {
                entry.remove(&text(2));
            }
            ":1\r\n".to_string()
        }
        "RPUSH" => {
            let entry = state.model.lists.entry(text(1)).or_default();
            for value in &args[2..] {
                entry.push(String::from_utf8_lossy(value).to_string());
            }
            format!(":{}\r\n", entry.len())
        }
        "LPUSH" => {
            let entry = state.model.lists.entry(text(1)).or_default();
            for value in &args[2..] {
                entry.insert(0, String::from_utf8_lossy(value).to_string());
            }
            format!(":{}\r\n", entry.len())
        }
        "SADD" => {
            let entry = state.model.sets.entry(text(1)).or_default();
            let mut added = 0i64;
            for member in &args[2..] {
                if entry.insert(String::from_utf8_lossy(member).to_string()) {
                    added += 1;
                }
            }
            format!(":{added}\r\n")
        }
        "SREM" => {
            if let Some(entry) = state.model.sets.get_mut(&text(1)) {
                entry.remove(&text(2));
            }
            ":1\r\n".to_string()
        }
        "ZADD" => {
            let entry = state.model.zsets.entry(text(1)).or_default();
            let mut added = 0i64;
            for pair in args[2..].chunks(2) {
                if pair.len() == 2 {
                    let score = String::from_utf8_lossy(&pair[0]).to_string();
                    let member = String::from_utf8_lossy(&pair[1]).to_string();
                    if entry.insert(member, score).is_none() {
                        added += 1;
                    }
                }
            }
            format!(":{added}\r\n")
        }
        "ZREM" => {
            if let Some(entry) = state.model.zsets.get_mut(&text(1)) {
                entry.remove(&text(2));
            }
            ":1\r\n".to_string()
        }
        "SIADD" => {
            let entry = state.model.sortedints.entry(text(1)).or_default();
            let mut added = 0i64;
            for id in &args[2..] {
                let id: u64 = String::from_utf8_lossy(id).parse().unwrap_or(0);
                if entry.insert(id) {
                    added += 1;
                }
            }
            format!(":{added}\r\n")
        }
        "SIREM" => {
            if let Some(entry) = state.model.sortedints.get_mut(&text(1)) {
                let id: u64 = text(2).parse().unwrap_or(0);
                entry.remove(&id);
            }
            ":1\r\n".to_string()
        }
        "SETBIT" => {
            let offset: u64 = text(2).parse().unwrap_or(0);
            let entry = state.model.bitmaps.entry(text(1)).or_default();
            if args[3] == b"1" {
                entry.insert(offset);
            } else {
                entry.remove(&offset);
            }
            ":0\r\n".to_string()
        }
        "XADD" => {
            let id = text(2);
            let fields: Vec<String> = args[3..]
                .iter()
                .map(|a| String::from_utf8_lossy(a).to_string())
                .collect();
            let entry = state.model.streams.entry(text(1)).or_default();
            entry.entries.push((id.clone(), fields));
            entry.last_id = id.clone();
            entry.entries_added += 1;
            format!("${}\r\n{id}\r\n", id.len())
        }
        "XDEL" => {
            if let Some(entry) = state.model.streams.get_mut(&text(1)) {
                let id = text(2);
                entry.entries.retain(|(entry_id, _)| *entry_id != id);
            }
            ":1\r\n".to_string()
        }
        "XSETID" => {
            let entry = state.model.streams.entry(text(1)).or_default();
            entry.last_id = text(2);
            for pair in args[3..].chunks(2) {
                if pair.len() != 2 {
                    continue;
                }
                let option = String::from_utf8_lossy(&pair[0]).to_ascii_uppercase();
                let value = String::from_utf8_lossy(&pair[1]).to_string();
                match option.as_str() {
                    "ENTRIESADDED" => entry.entries_added = value.parse().unwrap_or(0),
                    "MAXDELETEDID" => entry.max_deleted = value,
                    _ => {}
                }
            }
            "+OK\r\n".to_string()
        }
        _ => "+OK\r\n".to_string(),
    }
}

/// Reads one RESP command (array of bulk strings). `None` on a clean EOF.
fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Option<Vec<Vec<u8>>>> {
    let Some(header) = read_line(reader)? else {
        return Ok(None);
    };
    if header.is_empty() || header[0] != b'*' {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "expected array header",
        ));
    }
    let count: usize = std::str::from_utf8(&header[1..])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "bad array length")
        })?;

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let Some(bulk_header) = read_line(reader)? else {
            return Ok(None);
        };
        if bulk_header.is_empty() || bulk_header[0] != b'$' {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "expected bulk header",
            ));
        }
        let len: usize = std::str::from_utf8(&bulk_header[1..])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "bad bulk length")
            })?;
        let mut payload = vec![0u8; len + 2];
        reader.read_exact(&mut payload)?;
        payload.truncate(len);
        args.push(payload);
    }
    Ok(Some(args))
}

/// Reads one CRLF-terminated line, without the terminator. `None` on EOF.
fn read_line(reader: &mut BufReader<TcpStream>) -> std::io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => {
                return if line.is_empty() {
                    Ok(None)
                } else {
                    Err(std::io::ErrorKind::UnexpectedEof.into())
                };
            }
            Ok(_) => {
                if byte[0] == b'\n' {
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    return Ok(Some(line));
                }
                line.push(byte[0]);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Fresh engine in a temp directory.
pub fn test_engine() -> (tempfile::TempDir, Arc<SlotEngine>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Arc::new(SlotEngine::open(dir.path()).expect("open engine"));
    (dir, engine)
}

/// Polls `predicate` until it holds or the test timeout elapses.
pub fn wait_until(what: &str, predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {what}");
}
