//! In-memory RESP nodes for tests and local experiments.
//!
//! A [`MemCluster`] binds N loopback listeners, splits the hash-slot space
//! evenly across them, and answers the subset of commands rowslot issues:
//! `PING AUTH SELECT CLUSTER GET SET DEL EXPIRE TTL HSET HGETALL HMGET SCAN
//! KEYS DBSIZE FLUSHALL`. Keys sent to a node that does not own their slot get
//! a `MOVED` error, like a real cluster. Standalone mode answers
//! `CLUSTER SLOTS` with "cluster support disabled".
//!
//! Replies to pipelined commands are batched: the connection keeps executing
//! frames that are already buffered and flushes once the socket would block.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{FutureExt, SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::config::ConnectionConfig;
use crate::topology::{hash_slot, SLOT_COUNT};

/// How a [`MemCluster`] is laid out.
#[derive(Debug, Clone)]
pub struct MemClusterConfig {
    /// Number of nodes; slots are split evenly in bind order.
    pub nodes: usize,
    /// `false` starts one standalone node that rejects cluster commands.
    pub cluster_mode: bool,
    /// Password every connection must `AUTH` with.
    pub auth: Option<String>,
    /// First port to bind; `0` picks ephemeral ports.
    pub base_port: u16,
}

impl Default for MemClusterConfig {
    fn default() -> Self {
        Self {
            nodes: 1,
            cluster_mode: true,
            auth: None,
            base_port: 0,
        }
    }
}

/// Running set of in-memory nodes. Dropping it stops every node.
pub struct MemCluster {
    nodes: Vec<Arc<MemNode>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MemCluster {
    /// Starts a clustered set of `nodes` nodes on ephemeral ports.
    pub async fn start(nodes: usize) -> anyhow::Result<Self> {
        Self::start_with(MemClusterConfig {
            nodes,
            ..MemClusterConfig::default()
        })
        .await
    }

    /// Starts one node with cluster support disabled.
    pub async fn start_standalone() -> anyhow::Result<Self> {
        Self::start_with(MemClusterConfig {
            nodes: 1,
            cluster_mode: false,
            ..MemClusterConfig::default()
        })
        .await
    }

    pub async fn start_with(config: MemClusterConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(config.nodes > 0, "mem cluster needs at least one node");
        anyhow::ensure!(
            config.cluster_mode || config.nodes == 1,
            "standalone mode supports exactly one node"
        );

        let mut listeners = Vec::with_capacity(config.nodes);
        for idx in 0..config.nodes {
            let port = if config.base_port == 0 {
                0
            } else {
                config.base_port + idx as u16
            };
            listeners.push(TcpListener::bind(("127.0.0.1", port)).await?);
        }
        let addrs = listeners
            .iter()
            .map(|listener| listener.local_addr())
            .collect::<std::io::Result<Vec<_>>>()?;

        let slot_map = config
            .cluster_mode
            .then(|| Arc::new(split_slots(&addrs)));

        let mut nodes = Vec::with_capacity(addrs.len());
        let mut tasks = Vec::with_capacity(addrs.len());
        for (listener, addr) in listeners.into_iter().zip(addrs) {
            let node = Arc::new(MemNode {
                addr,
                slot_map: slot_map.clone(),
                auth: config.auth.clone(),
                dbs: Mutex::new(HashMap::new()),
            });
            tasks.push(tokio::spawn(serve(listener, node.clone())));
            nodes.push(node);
        }
        Ok(Self { nodes, tasks })
    }

    /// Node addresses in slot order.
    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.nodes.iter().map(|node| node.addr).collect()
    }

    /// Connection settings pointing at the first node.
    pub fn connection(&self) -> ConnectionConfig {
        let seed = self.nodes[0].addr;
        ConnectionConfig {
            host: seed.ip().to_string(),
            port: seed.port(),
            auth: self.nodes[0].auth.clone(),
            ..ConnectionConfig::default()
        }
    }

    /// Live keys stored on node `idx` in database `db`.
    pub fn node_keys(&self, idx: usize, db: u32) -> Vec<String> {
        self.nodes[idx].live_keys(db)
    }

    /// Waits until every node task exits, which only happens on abort.
    pub async fn wait(mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for MemCluster {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[derive(Debug, Clone)]
struct SlotOwner {
    start: u16,
    end: u16,
    addr: SocketAddr,
}

fn split_slots(addrs: &[SocketAddr]) -> Vec<SlotOwner> {
    let per_node = SLOT_COUNT as usize / addrs.len();
    addrs
        .iter()
        .enumerate()
        .map(|(idx, addr)| {
            let start = idx * per_node;
            let end = if idx + 1 == addrs.len() {
                SLOT_COUNT as usize - 1
            } else {
                start + per_node - 1
            };
            SlotOwner {
                start: start as u16,
                end: end as u16,
                addr: *addr,
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
enum Stored {
    Str(Vec<u8>),
    Hash(BTreeMap<Vec<u8>, Vec<u8>>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

type Db = BTreeMap<Vec<u8>, Entry>;

struct MemNode {
    addr: SocketAddr,
    slot_map: Option<Arc<Vec<SlotOwner>>>,
    auth: Option<String>,
    dbs: Mutex<HashMap<u32, Db>>,
}

/// Per-connection state.
struct Session {
    db: u32,
    authed: bool,
}

async fn serve(listener: TcpListener, node: Arc<MemNode>) {
    loop {
        let Ok((socket, _)) = listener.accept().await else {
            continue;
        };
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, node).await {
                tracing::debug!(error = ?err, "mem node connection closed");
            }
        });
    }
}

async fn handle_conn(socket: TcpStream, node: Arc<MemNode>) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, Resp2::default());
    let mut session = Session {
        db: 0,
        authed: node.auth.is_none(),
    };

    while let Some(frame) = framed.next().await {
        let reply = node.execute(&mut session, frame?);
        framed.feed(reply).await?;

        // Keep answering frames that are already buffered, then flush once.
        loop {
            match framed.next().now_or_never() {
                Some(Some(Ok(frame))) => {
                    let reply = node.execute(&mut session, frame);
                    framed.feed(reply).await?;
                }
                Some(Some(Err(err))) => anyhow::bail!("failed to read RESP frame: {err}"),
                Some(None) => {
                    <Framed<TcpStream, Resp2> as SinkExt<BytesFrame>>::flush(&mut framed).await?;
                    return Ok(());
                }
                None => break,
            }
        }
        <Framed<TcpStream, Resp2> as SinkExt<BytesFrame>>::flush(&mut framed).await?;
    }
    Ok(())
}

fn ok() -> BytesFrame {
    BytesFrame::SimpleString(Bytes::from_static(b"OK"))
}

fn err(msg: impl Into<String>) -> BytesFrame {
    let msg: String = msg.into();
    BytesFrame::Error(msg.into())
}

fn bulk(value: &[u8]) -> BytesFrame {
    BytesFrame::BulkString(Bytes::copy_from_slice(value))
}

fn int(value: i64) -> BytesFrame {
    BytesFrame::Integer(value)
}

fn wrong_args(cmd: &str) -> BytesFrame {
    err(format!("ERR wrong number of arguments for '{}' command", cmd.to_ascii_lowercase()))
}

fn wrong_type() -> BytesFrame {
    err("WRONGTYPE Operation against a key holding the wrong kind of value")
}

impl MemNode {
    fn execute(&self, session: &mut Session, frame: BytesFrame) -> BytesFrame {
        let BytesFrame::Array(parts) = frame else {
            return err("ERR expected array frame");
        };
        let mut args = Vec::with_capacity(parts.len());
        for part in &parts {
            match part {
                BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => args.push(b.to_vec()),
                _ => return err("ERR invalid argument frame"),
            }
        }
        let Some(first) = args.first() else {
            return err("ERR empty command");
        };
        let cmd = String::from_utf8_lossy(first).to_ascii_uppercase();
        let args = &args[1..];

        if cmd == "AUTH" {
            return self.auth(session, args);
        }
        if !session.authed {
            return err("NOAUTH Authentication required.");
        }

        match cmd.as_str() {
            "PING" => BytesFrame::SimpleString(Bytes::from_static(b"PONG")),
            "SELECT" => match args {
                [db] => match std::str::from_utf8(db).ok().and_then(|s| s.parse().ok()) {
                    Some(db) => {
                        session.db = db;
                        ok()
                    }
                    None => err("ERR invalid DB index"),
                },
                _ => wrong_args(&cmd),
            },
            "CLUSTER" => self.cluster(args),
            "DBSIZE" => int(self.live_keys(session.db).len() as i64),
            "FLUSHALL" => {
                self.lock().clear();
                ok()
            }
            "KEYS" => match args {
                [pattern] => BytesFrame::Array(
                    self.live_keys(session.db)
                        .into_iter()
                        .filter(|key| glob_match(pattern, key.as_bytes()))
                        .map(|key| bulk(key.as_bytes()))
                        .collect(),
                ),
                _ => wrong_args(&cmd),
            },
            "SCAN" => self.scan(session.db, args),
            _ => self.keyed(session.db, &cmd, args),
        }
    }

    fn auth(&self, session: &mut Session, args: &[Vec<u8>]) -> BytesFrame {
        let Some(expected) = self.auth.as_deref() else {
            return err("ERR AUTH called without any password configured");
        };
        // Accept both `AUTH password` and `AUTH username password`.
        let supplied = match args {
            [password] | [_, password] => password.as_slice(),
            _ => return wrong_args("AUTH"),
        };
        if supplied == expected.as_bytes() {
            session.authed = true;
            ok()
        } else {
            err("WRONGPASS invalid username-password pair")
        }
    }

    fn cluster(&self, args: &[Vec<u8>]) -> BytesFrame {
        let Some(owners) = self.slot_map.as_deref() else {
            return err("ERR This instance has cluster support disabled");
        };
        let sub = args
            .first()
            .map(|s| String::from_utf8_lossy(s).to_ascii_uppercase())
            .unwrap_or_default();
        if sub != "SLOTS" {
            return err(format!("ERR unknown CLUSTER subcommand '{sub}'"));
        }
        BytesFrame::Array(
            owners
                .iter()
                .map(|owner| {
                    BytesFrame::Array(vec![
                        int(owner.start.into()),
                        int(owner.end.into()),
                        BytesFrame::Array(vec![
                            bulk(owner.addr.ip().to_string().as_bytes()),
                            int(owner.addr.port().into()),
                        ]),
                    ])
                })
                .collect(),
        )
    }

    /// Commands whose first argument is a key subject to slot ownership.
    fn keyed(&self, db: u32, cmd: &str, args: &[Vec<u8>]) -> BytesFrame {
        let Some(key) = args.first() else {
            return wrong_args(cmd);
        };
        if let Some(moved) = self.moved(key) {
            return moved;
        }
        let now = Instant::now();
        let mut dbs = self.lock();
        let db = dbs.entry(db).or_default();
        if db.get(key).is_some_and(|entry| entry.is_expired(now)) {
            db.remove(key);
        }

        match cmd {
            "GET" => match args {
                [_] => match db.get(key) {
                    None => BytesFrame::Null,
                    Some(Entry {
                        value: Stored::Str(value),
                        ..
                    }) => bulk(value),
                    Some(_) => wrong_type(),
                },
                _ => wrong_args(cmd),
            },
            "SET" => {
                let (value, ttl) = match args {
                    [_, value] => (value, None),
                    [_, value, ex, secs] if ex.eq_ignore_ascii_case(b"EX") => {
                        match parse_u64(secs) {
                            Some(secs) if secs > 0 => (value, Some(Duration::from_secs(secs))),
                            _ => return err("ERR invalid expire time in 'set' command"),
                        }
                    }
                    _ => return err("ERR syntax error"),
                };
                db.insert(
                    key.clone(),
                    Entry {
                        value: Stored::Str(value.clone()),
                        expires_at: ttl.map(|ttl| now + ttl),
                    },
                );
                ok()
            }
            "DEL" => {
                let mut removed = 0;
                for key in args {
                    if db.remove(key).is_some() {
                        removed += 1;
                    }
                }
                int(removed)
            }
            "EXPIRE" => match args {
                [_, secs] => match parse_u64(secs) {
                    Some(secs) => match db.get_mut(key) {
                        Some(entry) => {
                            entry.expires_at = Some(now + Duration::from_secs(secs));
                            int(1)
                        }
                        None => int(0),
                    },
                    None => err("ERR value is not an integer or out of range"),
                },
                _ => wrong_args(cmd),
            },
            "TTL" => match db.get(key) {
                None => int(-2),
                Some(Entry {
                    expires_at: None, ..
                }) => int(-1),
                Some(Entry {
                    expires_at: Some(at),
                    ..
                }) => {
                    let remaining = at.saturating_duration_since(now).as_millis() as i64;
                    int((remaining + 500) / 1000)
                }
            },
            "HSET" => {
                if args.len() < 3 || args.len() % 2 == 0 {
                    return wrong_args(cmd);
                }
                let entry = db.entry(key.clone()).or_insert_with(|| Entry {
                    value: Stored::Hash(BTreeMap::new()),
                    expires_at: None,
                });
                let Stored::Hash(fields) = &mut entry.value else {
                    return wrong_type();
                };
                let mut added = 0;
                for pair in args[1..].chunks(2) {
                    if fields.insert(pair[0].clone(), pair[1].clone()).is_none() {
                        added += 1;
                    }
                }
                int(added)
            }
            "HGETALL" => match db.get(key) {
                None => BytesFrame::Array(Vec::new()),
                Some(Entry {
                    value: Stored::Hash(fields),
                    ..
                }) => BytesFrame::Array(
                    fields
                        .iter()
                        .flat_map(|(name, value)| [bulk(name), bulk(value)])
                        .collect(),
                ),
                Some(_) => wrong_type(),
            },
            "HMGET" => {
                if args.len() < 2 {
                    return wrong_args(cmd);
                }
                match db.get(key) {
                    None => BytesFrame::Array(args[1..].iter().map(|_| BytesFrame::Null).collect()),
                    Some(Entry {
                        value: Stored::Hash(fields),
                        ..
                    }) => BytesFrame::Array(
                        args[1..]
                            .iter()
                            .map(|name| fields.get(name).map_or(BytesFrame::Null, |v| bulk(v)))
                            .collect(),
                    ),
                    Some(_) => wrong_type(),
                }
            }
            other => err(format!("ERR unknown command '{other}'")),
        }
    }

    fn scan(&self, db: u32, args: &[Vec<u8>]) -> BytesFrame {
        let Some(cursor) = args.first().and_then(|c| parse_u64(c)) else {
            return err("ERR invalid cursor");
        };
        let mut pattern: Option<&[u8]> = None;
        let mut count = 10usize;
        for pair in args[1..].chunks(2) {
            match pair {
                [opt, value] if opt.eq_ignore_ascii_case(b"MATCH") => pattern = Some(value.as_slice()),
                [opt, value] if opt.eq_ignore_ascii_case(b"COUNT") => {
                    match parse_u64(value) {
                        Some(n) if n > 0 => count = n as usize,
                        _ => return err("ERR syntax error"),
                    }
                }
                _ => return err("ERR syntax error"),
            }
        }

        let keys = self.live_keys(db);
        let start = (cursor as usize).min(keys.len());
        let end = start.saturating_add(count).min(keys.len());
        let page = keys[start..end]
            .iter()
            .filter(|key| pattern.map_or(true, |p| glob_match(p, key.as_bytes())))
            .map(|key| bulk(key.as_bytes()))
            .collect();
        let next = if end >= keys.len() { 0 } else { end };
        BytesFrame::Array(vec![
            bulk(next.to_string().as_bytes()),
            BytesFrame::Array(page),
        ])
    }

    fn moved(&self, key: &[u8]) -> Option<BytesFrame> {
        let owners = self.slot_map.as_deref()?;
        let slot = hash_slot(key);
        let owner = owners
            .iter()
            .find(|owner| slot >= owner.start && slot <= owner.end)?;
        (owner.addr != self.addr).then(|| err(format!("MOVED {slot} {}", owner.addr)))
    }

    fn live_keys(&self, db: u32) -> Vec<String> {
        let now = Instant::now();
        self.lock()
            .get(&db)
            .map(|db| {
                db.iter()
                    .filter(|(_, entry)| !entry.is_expired(now))
                    .map(|(key, _)| String::from_utf8_lossy(key).into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Db>> {
        self.dbs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn parse_u64(raw: &[u8]) -> Option<u64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

/// Glob match supporting `*`, `?`, and `\` escapes.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                star = Some((p, t));
                p += 1;
                continue;
            }
            Some(b'?') => {
                p += 1;
                t += 1;
                continue;
            }
            Some(b'\\') if p + 1 < pattern.len() && pattern[p + 1] == text[t] => {
                p += 2;
                t += 1;
                continue;
            }
            Some(&c) if c != b'\\' && c == text[t] => {
                p += 1;
                t += 1;
                continue;
            }
            _ => {}
        }
        match star {
            Some((star_p, star_t)) => {
                p = star_p + 1;
                t = star_t + 1;
                star = Some((star_p, star_t + 1));
            }
            None => return false,
        }
    }
    pattern[p.min(pattern.len())..].iter().all(|&c| c == b'*')
}
