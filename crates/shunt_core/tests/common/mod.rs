//! Shared harness for the integration tests: a minimal line-oriented
//! "memo" protocol, in-process TCP backend servers and a blocking test
//! client. Wire protocols are out of the core's scope, so the codec here
//! is deliberately trivial: one line is one packet, a reply is zero or
//! more `ROW` lines followed by `DONE <conn-id>`.
#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use bytes::Bytes;

use shunt_common::buffer::ReadQueue;
use shunt_common::config::{ProxyConfig, SessionLimits};
use shunt_common::error::{Failure, ProtocolError, RouteError};
use shunt_common::types::TargetId;
use shunt_core::{AssignPolicy, Runtime, TargetSpec};
use shunt_protocol::{
    AuthProgress, BackendCodec, Classification, ClientCodec, Packet, ParseInfo, ProtocolModule,
    Recovery, ReplyShape, ReplyStep, ReuseScore, RoutePlan, RouterModule, RouterPolicy,
    SessionProfile, SharedParse, StatementKind,
};

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Poll a condition until it holds or the deadline passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

// ── Memo protocol helpers ───────────────────────────────────────────────

fn take_line(input: &mut ReadQueue) -> Option<String> {
    let pos = input.find(b'\n')?;
    let line = input.take(pos + 1).expect("length checked");
    Some(String::from_utf8_lossy(&line[..pos]).into_owned())
}

/// Canonical form: lowercased, digits stripped to `?`, whitespace
/// collapsed.
fn canonicalize(line: &str) -> String {
    let folded: String = line
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_digit() { '?' } else { c })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

struct MemoParse {
    canonical: String,
}

impl ParseInfo for MemoParse {
    fn size_bytes(&self) -> usize {
        self.canonical.len() + 40
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

// ── Client codec ────────────────────────────────────────────────────────

pub struct MemoClientCodec {
    user: String,
    authenticated: bool,
}

impl MemoClientCodec {
    fn new() -> Self {
        Self {
            user: String::new(),
            authenticated: false,
        }
    }
}

impl ClientCodec for MemoClientCodec {
    fn greeting(&mut self) -> Option<Bytes> {
        None
    }

    fn advance_auth(
        &mut self,
        input: &mut ReadQueue,
    ) -> Result<(AuthProgress, Option<Bytes>), ProtocolError> {
        let Some(line) = take_line(input) else {
            return Ok((AuthProgress::InProgress, None));
        };
        match line.strip_prefix("HELLO ") {
            Some(user) if !user.is_empty() => {
                self.user = user.to_string();
                self.authenticated = true;
                Ok((AuthProgress::Done, Some(Bytes::from_static(b"READY\n"))))
            }
            _ => Ok((
                AuthProgress::Failed(format!("bad hello: {line}")),
                Some(Bytes::from_static(b"ERR bad hello\n")),
            )),
        }
    }

    fn next_packet(&mut self, input: &mut ReadQueue) -> Result<Option<Packet>, ProtocolError> {
        let Some(pos) = input.find(b'\n') else {
            return Ok(None);
        };
        let payload = input.take(pos + 1).expect("length checked");
        Ok(Some(Packet::new(payload)))
    }

    fn classify(&mut self, packet: &Packet) -> Classification {
        let line = String::from_utf8_lossy(&packet.payload);
        let line = line.trim();
        let verb = line
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        match verb.as_str() {
            "PING" => Classification::ignorable(),
            "SET" => Classification {
                kind: StatementKind::Command,
                fingerprint: canonicalize(line),
                is_write: false,
                touches_session_state: true,
            },
            "INSERT" | "UPDATE" | "DELETE" => Classification {
                kind: StatementKind::Query,
                fingerprint: canonicalize(line),
                is_write: true,
                touches_session_state: false,
            },
            _ => Classification {
                kind: StatementKind::Query,
                fingerprint: canonicalize(line),
                is_write: false,
                touches_session_state: false,
            },
        }
    }

    fn parse(&mut self, fingerprint: &str) -> SharedParse {
        Arc::new(MemoParse {
            canonical: fingerprint.to_string(),
        })
    }

    fn profile(&self) -> SessionProfile {
        SessionProfile {
            user: self.user.clone(),
            database: "memo".into(),
            attributes: Vec::new(),
        }
    }

    fn error_packet(&self, message: &str) -> Bytes {
        Bytes::from(format!("ERR {message}\n"))
    }
}

// ── Backend codec ───────────────────────────────────────────────────────

pub struct MemoBackendCodec {
    user: String,
    established: bool,
    in_txn: bool,
}

impl MemoBackendCodec {
    fn new(profile: &SessionProfile) -> Self {
        Self {
            user: profile.user.clone(),
            established: false,
            in_txn: false,
        }
    }
}

impl BackendCodec for MemoBackendCodec {
    fn connect_greeting(&mut self) -> Option<Bytes> {
        Some(Bytes::from(format!("HELLO {}\n", self.user)))
    }

    fn advance_auth(
        &mut self,
        input: &mut ReadQueue,
    ) -> Result<(AuthProgress, Option<Bytes>), ProtocolError> {
        let Some(line) = take_line(input) else {
            return Ok((AuthProgress::InProgress, None));
        };
        if line == "READY" {
            self.established = true;
            Ok((AuthProgress::Done, None))
        } else {
            Ok((AuthProgress::Failed(format!("bad backend hello: {line}")), None))
        }
    }

    fn established(&self) -> bool {
        self.established
    }

    fn serialize_statement(&mut self, packet: &Packet, transform: Option<&Bytes>) -> Bytes {
        let bytes = transform.cloned().unwrap_or_else(|| packet.payload.clone());
        let line = String::from_utf8_lossy(&bytes);
        let verb = line
            .trim()
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        match verb.as_str() {
            "BEGIN" => self.in_txn = true,
            "COMMIT" | "ROLLBACK" => self.in_txn = false,
            _ => {}
        }
        bytes
    }

    fn on_reply(
        &mut self,
        input: &mut ReadQueue,
        _shape: ReplyShape,
    ) -> Result<Option<ReplyStep>, ProtocolError> {
        let Some(pos) = input.find(b'\n') else {
            return Ok(None);
        };
        let bytes = input.take(pos + 1).expect("length checked");
        let terminal = bytes.starts_with(b"DONE");
        Ok(Some(ReplyStep {
            forward: Some(bytes),
            terminal,
        }))
    }

    fn is_safe_to_reuse(&self) -> bool {
        self.established && !self.in_txn
    }

    fn in_transaction(&self) -> bool {
        self.in_txn
    }

    fn reuse_score(&self, profile: &SessionProfile) -> ReuseScore {
        if self.user == profile.user {
            ReuseScore::Optimal
        } else {
            ReuseScore::NotPossible
        }
    }

    fn reset_for_pooling(&mut self) -> Option<Bytes> {
        None
    }

    fn adopt(&mut self, profile: &SessionProfile) -> bool {
        self.user == profile.user
    }

    fn classify_failure(&self, _error: &ProtocolError) -> Failure {
        Failure::Transient
    }
}

// ── Modules ─────────────────────────────────────────────────────────────

pub struct MemoProtocol;

impl ProtocolModule for MemoProtocol {
    fn client_codec(&self) -> Box<dyn ClientCodec> {
        Box::new(MemoClientCodec::new())
    }

    fn backend_codec(&self, profile: &SessionProfile) -> Box<dyn BackendCodec> {
        Box::new(MemoBackendCodec::new(profile))
    }
}

/// Routes every statement to one configured target.
pub struct MemoRouter {
    pub target: TargetId,
}

impl RouterModule for MemoRouter {
    fn session_policy(&self) -> Box<dyn RouterPolicy> {
        Box::new(MemoPolicy {
            target: self.target,
        })
    }
}

struct MemoPolicy {
    target: TargetId,
}

impl RouterPolicy for MemoPolicy {
    fn on_statement(
        &mut self,
        class: &Classification,
        _parse: Option<&SharedParse>,
    ) -> Result<RoutePlan, RouteError> {
        if class.fingerprint.contains("notarget") {
            return Err(RouteError::NoTarget("no target for statement".into()));
        }
        Ok(RoutePlan::single(self.target))
    }

    fn on_reply(&mut self, _target: TargetId, _terminal: bool) {}

    fn on_failure(&mut self, _target: TargetId, failure: Failure) -> Recovery {
        match failure {
            Failure::Transient => Recovery::Retry,
            Failure::Permanent => Recovery::Surface,
        }
    }
}

// ── Test backend server ─────────────────────────────────────────────────

/// An in-process backend speaking the memo wire format. Each accepted
/// connection gets a process-unique id, echoed in every `DONE` line so
/// tests can observe connection reuse.
pub struct TestBackend {
    pub addr: SocketAddr,
    pub accepted: Arc<AtomicU32>,
    stop: Arc<AtomicBool>,
}

static NEXT_CONN_ID: AtomicU32 = AtomicU32::new(1);

impl TestBackend {
    pub fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind backend");
        let addr = listener.local_addr().unwrap();
        listener.set_nonblocking(true).unwrap();
        let accepted = Arc::new(AtomicU32::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let accepted2 = accepted.clone();
        let stop2 = stop.clone();
        std::thread::spawn(move || {
            while !stop2.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        accepted2.fetch_add(1, Ordering::Relaxed);
                        let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
                        std::thread::spawn(move || serve_conn(stream, conn_id));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });
        Self {
            addr,
            accepted,
            stop,
        }
    }

    pub fn accepted_count(&self) -> u32 {
        self.accepted.load(Ordering::Relaxed)
    }
}

impl Drop for TestBackend {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn serve_conn(stream: TcpStream, conn_id: u32) {
    stream.set_nodelay(true).ok();
    let mut writer = stream.try_clone().expect("clone backend stream");
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let Ok(line) = line else { return };
        if let Some(_user) = line.strip_prefix("HELLO ") {
            if writer.write_all(b"READY\n").is_err() {
                return;
            }
            continue;
        }
        let upper = line.to_ascii_uppercase();
        if let Some(rest) = upper.strip_prefix("SELECT SLEEP(") {
            if let Some(ms) = rest
                .strip_suffix(')')
                .and_then(|v| v.parse::<u64>().ok())
            {
                std::thread::sleep(Duration::from_millis(ms));
            }
            if writer
                .write_all(format!("DONE {conn_id}\n").as_bytes())
                .is_err()
            {
                return;
            }
            continue;
        }
        let reply = format!("ROW {line}\nDONE {conn_id}\n");
        if writer.write_all(reply.as_bytes()).is_err() {
            return;
        }
    }
}

// ── Test client ─────────────────────────────────────────────────────────

pub struct TestClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl TestClient {
    /// Connect and run the memo auth exchange.
    pub fn connect(addr: SocketAddr, user: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true).ok();
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        let writer = stream.try_clone()?;
        let mut client = Self {
            reader: BufReader::new(stream),
            writer,
        };
        client.send_line(&format!("HELLO {user}"))?;
        let ready = client.read_line()?;
        if ready != "READY" {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unexpected auth reply: {ready}"),
            ));
        }
        Ok(client)
    }

    pub fn send_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(format!("{line}\n").as_bytes())
    }

    pub fn read_line(&mut self) -> std::io::Result<String> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed",
            ));
        }
        Ok(line.trim_end().to_string())
    }

    /// Send one statement and collect lines through the terminal `DONE`
    /// (or a leading `ERR`).
    pub fn query(&mut self, statement: &str) -> std::io::Result<Vec<String>> {
        self.send_line(statement)?;
        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let terminal = line.starts_with("DONE") || line.starts_with("ERR");
            lines.push(line);
            if terminal {
                return Ok(lines);
            }
        }
    }

    /// Run a query and return the backend connection id from `DONE <id>`.
    pub fn query_conn_id(&mut self, statement: &str) -> std::io::Result<u32> {
        let lines = self.query(statement)?;
        let done = lines.last().expect("at least one line");
        done.strip_prefix("DONE ")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("not a DONE line: {done}"),
                )
            })
    }
}

// ── Harness ─────────────────────────────────────────────────────────────

pub struct HarnessOpts {
    pub workers: usize,
    pub cache_max_bytes: u64,
    pub pool_capacity_per_target: usize,
    pub pool_idle_max_age: Duration,
    pub multiplex_timeout: Duration,
    pub max_connections_per_target: u32,
    pub waiter_limit: usize,
    pub limits: SessionLimits,
    pub assign: AssignPolicy,
}

impl Default for HarnessOpts {
    fn default() -> Self {
        Self {
            workers: 1,
            cache_max_bytes: 0,
            pool_capacity_per_target: 0,
            pool_idle_max_age: Duration::from_secs(300),
            multiplex_timeout: Duration::from_secs(60),
            max_connections_per_target: 0,
            waiter_limit: 0,
            limits: SessionLimits::default(),
            assign: AssignPolicy::RoundRobin,
        }
    }
}

pub struct Harness {
    pub runtime: Runtime,
    pub backend: TestBackend,
    pub proxy_addr: SocketAddr,
}

impl Harness {
    pub fn start(opts: HarnessOpts) -> Self {
        init_tracing();
        let backend = TestBackend::spawn();
        let config = ProxyConfig {
            worker_count: opts.workers,
            cache_max_bytes: opts.cache_max_bytes,
            pool_capacity_per_target: opts.pool_capacity_per_target,
            pool_idle_max_age: opts.pool_idle_max_age,
            multiplex_timeout: opts.multiplex_timeout,
            ..Default::default()
        };
        let runtime = Runtime::builder(config)
            .limits(opts.limits)
            .assign(opts.assign)
            .protocol(Arc::new(MemoProtocol))
            .router(Arc::new(MemoRouter {
                target: TargetId(0),
            }))
            .target(
                TargetSpec::new("backend0", backend.addr)
                    .max_connections(opts.max_connections_per_target)
                    .waiter_limit(opts.waiter_limit),
            )
            .listen("127.0.0.1:0".parse().unwrap())
            .start()
            .expect("runtime start");
        let proxy_addr = runtime.listen_addrs()[0];
        Self {
            runtime,
            backend,
            proxy_addr,
        }
    }

    pub fn client(&self) -> TestClient {
        TestClient::connect(self.proxy_addr, "alice").expect("client connect")
    }
}
