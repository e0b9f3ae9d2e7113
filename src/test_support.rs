//! In-memory host used by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use tokio::sync::Semaphore;
use tokio::time::sleep;

use crate::identity::Identity;
use crate::protocols::{ConnectionId, IdentifyHost, PushStream, StreamOptions};

pub(crate) fn make_identity(index: u32) -> Identity {
    let mut seed = [0u8; 32];
    seed[..4].copy_from_slice(&index.to_be_bytes());
    let signing_key = SigningKey::from_bytes(&seed);
    Identity::from_bytes(signing_key.verifying_key().to_bytes())
}

/// Poll `cond` until it holds, giving up after roughly two seconds.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[derive(Clone, Debug)]
pub(crate) struct SentPush {
    pub peer: Identity,
    pub conn: ConnectionId,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug)]
pub(crate) struct Negotiation {
    pub peer: Identity,
    pub protocols: Vec<String>,
    pub options: StreamOptions,
}

#[derive(Default)]
struct HostState {
    conns: HashMap<Identity, Vec<ConnectionId>>,
    protocols: HashMap<Identity, Vec<String>>,
    lookup_failures: HashSet<Identity>,
    negotiation_delay: Option<Duration>,
}

pub(crate) struct TestHost {
    state: Mutex<HostState>,
    hang: AtomicBool,
    gated: AtomicBool,
    fail_writes: AtomicBool,
    gate: Semaphore,
    pub negotiations: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    negotiation_log: Mutex<Vec<Negotiation>>,
    sent: Arc<Mutex<Vec<SentPush>>>,
    resets: Arc<AtomicUsize>,
}

impl Default for TestHost {
    fn default() -> Self {
        Self {
            state: Mutex::new(HostState::default()),
            hang: AtomicBool::new(false),
            gated: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            gate: Semaphore::new(0),
            negotiations: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            negotiation_log: Mutex::new(Vec::new()),
            sent: Arc::new(Mutex::new(Vec::new())),
            resets: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl TestHost {
    pub(crate) fn add_connection(&self, peer: Identity, conn: ConnectionId) {
        self.state.lock().unwrap().conns.entry(peer).or_default().push(conn);
    }

    pub(crate) fn remove_connection(&self, peer: Identity, conn: ConnectionId) {
        let mut state = self.state.lock().unwrap();
        if let Some(conns) = state.conns.get_mut(&peer) {
            conns.retain(|c| *c != conn);
            if conns.is_empty() {
                state.conns.remove(&peer);
            }
        }
    }

    pub(crate) fn set_protocols(&self, peer: Identity, protocols: Vec<String>) {
        self.state.lock().unwrap().protocols.insert(peer, protocols);
    }

    pub(crate) fn fail_lookup(&self, peer: Identity) {
        self.state.lock().unwrap().lookup_failures.insert(peer);
    }

    pub(crate) fn set_negotiation_delay(&self, delay: Duration) {
        self.state.lock().unwrap().negotiation_delay = Some(delay);
    }

    /// Negotiations never complete while set.
    pub(crate) fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    /// Negotiations wait for [`TestHost::open_gate`] while set.
    pub(crate) fn set_gated(&self, gated: bool) {
        self.gated.store(gated, Ordering::SeqCst);
    }

    pub(crate) fn open_gate(&self, permits: usize) {
        self.gate.add_permits(permits);
    }

    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn sent(&self) -> Vec<SentPush> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn negotiation_log(&self) -> Vec<Negotiation> {
        self.negotiation_log.lock().unwrap().clone()
    }

    pub(crate) fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl IdentifyHost for TestHost {
    type Stream = TestStream;

    fn conns_to_peer(&self, peer: &Identity) -> Vec<ConnectionId> {
        self.state.lock().unwrap().conns.get(peer).cloned().unwrap_or_default()
    }

    async fn new_stream(&self, peer: &Identity, protocols: &[String], options: StreamOptions) -> Result<TestStream> {
        self.negotiations.fetch_add(1, Ordering::SeqCst);
        self.negotiation_log.lock().unwrap().push(Negotiation {
            peer: *peer,
            protocols: protocols.to_vec(),
            options,
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        if self.gated.load(Ordering::SeqCst) {
            self.gate.acquire().await.map_err(|_| anyhow!("gate closed"))?.forget();
        }
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let delay = self.state.lock().unwrap().negotiation_delay;
        if let Some(delay) = delay {
            sleep(delay).await;
        }

        let Some(conn) = self.conns_to_peer(peer).first().copied() else {
            bail!("no connection to peer and dialing is disabled");
        };
        let Some(protocol) = protocols.first().cloned() else {
            bail!("no protocols to negotiate");
        };

        Ok(TestStream {
            peer: *peer,
            conn,
            protocol,
            buf: Vec::new(),
            fail_writes: self.fail_writes.load(Ordering::SeqCst),
            sent: self.sent.clone(),
            resets: self.resets.clone(),
        })
    }

    fn supports_protocols(&self, peer: &Identity, protocols: &[String]) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        if state.lookup_failures.contains(peer) {
            bail!("peerstore unavailable");
        }
        let known = state.protocols.get(peer).cloned().unwrap_or_default();
        Ok(protocols.iter().filter(|p| known.contains(*p)).cloned().collect())
    }
}

pub(crate) struct TestStream {
    peer: Identity,
    conn: ConnectionId,
    protocol: String,
    buf: Vec<u8>,
    fail_writes: bool,
    sent: Arc<Mutex<Vec<SentPush>>>,
    resets: Arc<AtomicUsize>,
}

#[async_trait]
impl PushStream for TestStream {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn connection(&self) -> ConnectionId {
        self.conn
    }

    fn remote_addr(&self) -> Option<String> {
        Some(format!("192.0.2.1:{}", self.conn.0))
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if self.fail_writes {
            bail!("injected write failure");
        }
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.sent.lock().unwrap().push(SentPush {
            peer: self.peer,
            conn: self.conn,
            bytes: std::mem::take(&mut self.buf),
        });
        Ok(())
    }

    async fn reset(&mut self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}
