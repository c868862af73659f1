//! Per-invocation guest state.
//!
//! One [`GuestState`] lives behind an `Rc<RefCell<..>>` on the guest's worker
//! thread for the lifetime of a single invocation. Bridge closures mutate it;
//! the event loop drains its queues; the dispatcher consumes what is left
//! after teardown. Nothing in here outlives the invocation.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::TcpStream;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rquickjs::{Function, Persistent};

use crate::store::{ConsoleEntry, LogLevel};

/// Shared handle to the invocation's guest state.
pub type GuestCell = Rc<RefCell<GuestState>>;

/// Deadline bookkeeping shared with the engine's interrupt handler, which
/// runs on QuickJS's terms and therefore only sees `Send` data.
pub struct DeadlineState {
    /// Absolute wall-clock deadline for the invocation
    pub wall: Instant,
    /// Tighter deadline active while a synchronous module load runs
    pub load_until: parking_lot::Mutex<Option<Instant>>,
    /// Set once the interrupt handler has fired on an expired deadline
    pub expired: AtomicBool,
}

impl DeadlineState {
    pub fn new(wall: Instant) -> Arc<Self> {
        Arc::new(Self {
            wall,
            load_until: parking_lot::Mutex::new(None),
            expired: AtomicBool::new(false),
        })
    }

    /// The deadline currently in force.
    pub fn effective(&self) -> Instant {
        match *self.load_until.lock() {
            Some(load) if load < self.wall => load,
            _ => self.wall,
        }
    }
}

/// A host-made argument for a deferred guest callback. Only copy-only data
/// crosses the bridge: JSON-shaped values or raw bytes.
#[derive(Debug, Clone)]
pub enum BridgeArg {
    Null,
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl BridgeArg {
    pub fn str(s: impl Into<String>) -> Self {
        BridgeArg::Json(serde_json::Value::String(s.into()))
    }
}

/// A callback reference scheduled to run on the guest's event loop.
pub struct PendingCall {
    pub callback: Persistent<Function<'static>>,
    pub args: Vec<BridgeArg>,
}

/// One armed timer.
pub struct TimerEntry {
    pub id: u64,
    pub due: Instant,
    /// `Some` keeps the timer rearming (setInterval)
    pub repeat: Option<Duration>,
    pub callback: Persistent<Function<'static>>,
    pub args: Vec<BridgeArg>,
}

/// Host-side timer wheel. `ref`/`unref` have no effect on host liveness, so
/// the heap only tracks what is armed and what was cleared.
#[derive(Default)]
pub struct TimerTable {
    next_id: u64,
    pub armed: Vec<TimerEntry>,
    pub cleared: HashSet<u64>,
}

impl TimerTable {
    pub fn arm(
        &mut self,
        due: Instant,
        repeat: Option<Duration>,
        callback: Persistent<Function<'static>>,
        args: Vec<BridgeArg>,
    ) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.armed.push(TimerEntry {
            id,
            due,
            repeat,
            callback,
            args,
        });
        id
    }

    pub fn clear(&mut self, id: u64) {
        self.cleared.insert(id);
        self.armed.retain(|t| t.id != id);
    }

    /// Earliest due instant among armed timers.
    pub fn next_due(&self) -> Option<Instant> {
        self.armed.iter().map(|t| t.due).min()
    }

    /// Pop one timer that is due at `now`, if any.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerEntry> {
        let index = self
            .armed
            .iter()
            .enumerate()
            .filter(|(_, t)| t.due <= now)
            .min_by_key(|(_, t)| t.due)
            .map(|(i, _)| i)?;
        Some(self.armed.remove(index))
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

/// An outgoing bridged socket (net / tls).
pub struct GuestSocket {
    pub stream: SocketStream,
    pub on_data: Option<Persistent<Function<'static>>>,
    pub on_end: Option<Persistent<Function<'static>>>,
    pub on_error: Option<Persistent<Function<'static>>>,
    pub open: bool,
    /// DER-encoded peer certificate, for `tls` sockets
    pub peer_cert_der: Option<Vec<u8>>,
}

pub enum SocketStream {
    Tcp(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

/// An outgoing bridged WebSocket.
pub struct GuestWebSocket {
    pub socket: tungstenite::WebSocket<tungstenite::stream::MaybeTlsStream<TcpStream>>,
    pub on_message: Option<Persistent<Function<'static>>>,
    pub on_close: Option<Persistent<Function<'static>>>,
    pub on_error: Option<Persistent<Function<'static>>>,
    pub open: bool,
}

/// Numeric-fd table backing `fs.open`/`read`/`write`.
#[derive(Default)]
pub struct FdTable {
    next_fd: i32,
    pub files: HashMap<i32, std::fs::File>,
}

impl FdTable {
    pub fn insert(&mut self, file: std::fs::File) -> i32 {
        // 0-2 belong to the fictional stdio.
        if self.next_fd < 3 {
            self.next_fd = 3;
        }
        let fd = self.next_fd;
        self.next_fd += 1;
        self.files.insert(fd, file);
        fd
    }
}

/// Outgoing response body, as the accumulator last wrote it.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyPayload {
    None,
    Json(serde_json::Value),
    Text(String),
    Bytes(Vec<u8>),
    File(PathBuf),
}

impl BodyPayload {
    pub fn is_none(&self) -> bool {
        matches!(self, BodyPayload::None)
    }
}

/// Host-side response accumulator the guest writes through `res`.
#[derive(Debug, Clone)]
pub struct ResponseState {
    pub status: Option<u16>,
    /// Lower-cased header map
    pub headers: BTreeMap<String, String>,
    pub body: BodyPayload,
    /// Set once any write method ran (json/send/sendStatus/end/sendFile)
    pub written: bool,
    /// Set by `end()`; later writes are ignored
    pub ended: bool,
}

impl Default for ResponseState {
    fn default() -> Self {
        Self {
            status: None,
            headers: BTreeMap::new(),
            body: BodyPayload::None,
            written: false,
            ended: false,
        }
    }
}

/// How the handler finished, as reported through the bridge.
#[derive(Debug, Clone)]
pub enum Settled {
    /// Handler returned (possibly `undefined`, carried as `None`)
    Return(Option<serde_json::Value>),
    /// No callable export was found
    BadExport,
    /// Handler threw or its promise rejected
    Threw { message: String, stack: Option<String> },
}

/// Everything one invocation's bridge closures read and write.
pub struct GuestState {
    pub function_id: String,
    /// Canonicalized package root; the guest's `/`
    pub package_root: PathBuf,
    /// Function-scoped env vars exposed via `process.env`
    pub env: Vec<(String, String)>,
    pub start: Instant,
    pub deadline: Arc<DeadlineState>,
    /// Sub-deadline budget for synchronous module loads
    pub load_budget: Duration,
    pub console: Vec<ConsoleEntry>,
    pub response: ResponseState,
    pub settled: Option<Settled>,
    pub timers: TimerTable,
    pub immediates: VecDeque<PendingCall>,
    pub sockets: HashMap<u64, GuestSocket>,
    pub websockets: HashMap<u64, GuestWebSocket>,
    pub next_io_id: u64,
    pub fds: FdTable,
    /// Per-guest keep-alive pool; dies with the guest
    pub http_client: Option<reqwest::blocking::Client>,
    /// Nesting depth of synchronous module loads; while non-zero the
    /// tighter load deadline is in force
    pub load_depth: u32,
}

impl GuestState {
    pub fn new(
        function_id: String,
        package_root: PathBuf,
        env: Vec<(String, String)>,
        deadline: Arc<DeadlineState>,
        load_budget: Duration,
    ) -> GuestCell {
        Rc::new(RefCell::new(Self {
            function_id,
            package_root,
            env,
            start: Instant::now(),
            deadline,
            load_budget,
            console: Vec::new(),
            response: ResponseState::default(),
            settled: None,
            timers: TimerTable::default(),
            immediates: VecDeque::new(),
            sockets: HashMap::new(),
            websockets: HashMap::new(),
            next_io_id: 0,
            fds: FdTable::default(),
            http_client: None,
            load_depth: 0,
        }))
    }

    /// Time left before the effective deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline
            .effective()
            .saturating_duration_since(Instant::now())
    }

    /// Append a captured console line.
    pub fn push_console(&mut self, level: LogLevel, message: String) {
        self.console.push(ConsoleEntry {
            level,
            message,
            timestamp: Utc::now(),
        });
    }

    /// Per-guest blocking HTTP client, built on first use. The pool is keyed
    /// by host:port inside reqwest and dropped with the guest.
    pub fn http_client(&mut self) -> crate::error::Result<reqwest::blocking::Client> {
        if self.http_client.is_none() {
            let client = reqwest::blocking::Client::builder()
                .user_agent(format!("runlet-guest/{}", env!("CARGO_PKG_VERSION")))
                .pool_max_idle_per_host(4)
                .build()
                .map_err(|e| {
                    crate::error::Error::Sandbox(format!("guest http client: {}", e))
                })?;
            self.http_client = Some(client);
        }
        Ok(self.http_client.as_ref().expect("just built").clone())
    }

    pub fn next_io_id(&mut self) -> u64 {
        self.next_io_id += 1;
        self.next_io_id
    }
}
