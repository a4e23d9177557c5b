//! Session-draining TCP reverse proxy.
//!
//! One proxy owns one public port for the whole run. Each accepted
//! connection is routed to whichever destination is *current* at accept
//! time and keeps that destination for its whole lifetime, so retargeting
//! never moves an in-flight stream.
//!
//! When a destination stops being current, a drain check watches its
//! session count. Once it reaches zero the destination is removed and the
//! caller's `on_drained` callback fires, which is how the restart
//! coordinator knows the old backend can be stopped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::error::ProxyError;
use crate::proxy_protocol::{DecodeOutcome, ProxyHeader};

/// Upper bound for writing and flushing the PROXY preamble to a backend.
pub const PREAMBLE_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval between drain checks of a retired destination.
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_secs(10);

/// Default time to wait for an inbound PROXY header when accepting them.
pub const DEFAULT_READ_HEADER_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive accept failures after which the listener is considered broken.
const MAX_CONSECUTIVE_ACCEPT_FAILURES: usize = 5;

type DrainCallback = Box<dyn FnOnce() + Send + 'static>;

/// A backend address and the number of sessions routed to it.
struct Destination {
    addr: SocketAddr,
    sessions: AtomicUsize,
    /// Notified when the last session ends.
    idle: Notify,
}

impl Destination {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            sessions: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

/// Counts one proxied session against its destination.
///
/// Increments on creation, decrements on drop, so the count can never go
/// negative and always returns to zero once every connection has closed.
struct SessionGuard {
    destination: Arc<Destination>,
}

impl SessionGuard {
    fn new(destination: Arc<Destination>) -> Self {
        destination.sessions.fetch_add(1, Ordering::SeqCst);
        Self { destination }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let prev = self.destination.sessions.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.destination.idle.notify_waiters();
        }
    }
}

/// Destinations by name plus the name new connections are routed to.
///
/// `current`, when set, always names an entry of `destinations`.
#[derive(Default)]
struct DestinationTable {
    destinations: HashMap<String, Arc<Destination>>,
    current: Option<String>,
}

/// TCP reverse proxy with per-destination session draining.
///
/// Cloning is cheap; clones share the destination table.
#[derive(Clone)]
pub struct ReverseProxy {
    listen_addr: String,
    table: Arc<RwLock<DestinationTable>>,
    drain_interval: Duration,
    inbound_header_timeout: Option<Duration>,
    /// Cancelled when `serve` returns; parents every connection and drain check.
    shutdown: CancellationToken,
    span: Span,
}

impl ReverseProxy {
    /// Create an idle proxy for `listen_addr` with no destination.
    pub fn new(listen_addr: impl Into<String>) -> Self {
        let listen_addr = listen_addr.into();
        let span = info_span!("reverse_proxy", listen = %listen_addr);
        Self {
            listen_addr,
            table: Arc::new(RwLock::new(DestinationTable::default())),
            drain_interval: DEFAULT_DRAIN_INTERVAL,
            inbound_header_timeout: None,
            shutdown: CancellationToken::new(),
            span,
        }
    }

    /// Change how often retired destinations are checked for drain.
    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    /// Accept PROXY v2 headers from clients, waiting at most `timeout` for one.
    ///
    /// A client-supplied header replaces the peer address in the preamble
    /// sent to the backend.
    pub fn with_inbound_proxy_header(mut self, timeout: Duration) -> Self {
        self.inbound_header_timeout = Some(timeout);
        self
    }

    /// The configured listen address.
    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    /// Name of the destination new connections are routed to.
    pub fn current(&self) -> Option<String> {
        self.read_table().current.clone()
    }

    /// Names of every registered destination, current or draining.
    pub fn destination_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_table().destinations.keys().cloned().collect();
        names.sort();
        names
    }

    /// Live session count of a destination.
    pub fn sessions(&self, name: &str) -> Option<usize> {
        self.read_table()
            .destinations
            .get(name)
            .map(|d| d.sessions())
    }

    /// Register `name` at `addr` and make it the routing target for new
    /// connections.
    ///
    /// The previously current destination starts draining; `on_drained`
    /// fires exactly once when it has no sessions left (or no longer
    /// exists). With no previous destination it fires immediately.
    pub async fn renew_destination<F>(
        &self,
        name: &str,
        addr: &str,
        on_drained: F,
    ) -> Result<(), ProxyError>
    where
        F: FnOnce() + Send + 'static,
    {
        let resolved = tokio::net::lookup_host(addr)
            .await
            .map_err(|source| ProxyError::Resolve {
                addr: addr.to_string(),
                source,
            })?
            .next()
            .ok_or_else(|| ProxyError::Unresolvable(addr.to_string()))?;

        self.renew_resolved(name, resolved, on_drained);
        Ok(())
    }

    /// [`renew_destination`](Self::renew_destination) for an address that
    /// is already resolved. Cannot fail.
    pub fn renew_resolved<F>(&self, name: &str, resolved: SocketAddr, on_drained: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let previous = {
            let mut table = self.write_table();
            let previous = table.current.take().map(|prev| {
                let destination = table.destinations.get(&prev).cloned();
                (prev, destination)
            });
            table
                .destinations
                .insert(name.to_string(), Arc::new(Destination::new(resolved)));
            table.current = Some(name.to_string());
            previous
        };

        info!(
            parent: &self.span,
            name,
            addr = %resolved,
            previous = ?previous.as_ref().map(|(prev, _)| prev),
            "Renewed destination"
        );

        match previous {
            Some((prev, Some(destination))) => {
                self.schedule_drain(prev, destination, Box::new(on_drained));
            }
            _ => on_drained(),
        }
    }

    /// Remove a destination unconditionally.
    ///
    /// Connections already routed to it keep running. If it was current, new
    /// connections are refused until the next renewal.
    pub fn remove_destination(&self, name: &str) {
        let mut table = self.write_table();
        table.destinations.remove(name);
        if table.current.as_deref() == Some(name) {
            table.current = None;
        }
        debug!(parent: &self.span, name, "Removed destination");
    }

    /// Bind the listen socket.
    pub async fn bind(&self) -> Result<TcpListener, ProxyError> {
        TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: self.listen_addr.clone(),
                source,
            })
    }

    /// Bind and serve until `cancel` fires or the listener breaks.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ProxyError> {
        let listener = self.bind().await?;
        self.serve(listener, cancel).await
    }

    /// Accept connections on `listener` until `cancel` fires.
    ///
    /// Returns an error after five consecutive accept failures. Every
    /// connection and drain check spawned by this proxy is cancelled when
    /// this returns.
    pub async fn serve(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), ProxyError> {
        let _shutdown = self.shutdown.clone().drop_guard();
        let listen_addr = listener.local_addr()?;
        info!(parent: &self.span, addr = %listen_addr, "Reverse proxy listening");

        let mut failures = AcceptFailures::default();
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(parent: &self.span, "Reverse proxy stopping");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(conn) => {
                    failures.reset();
                    conn
                }
                Err(e) => {
                    let exhausted = failures.record();
                    error!(
                        parent: &self.span,
                        error = %e,
                        failures = failures.count(),
                        "Failed to accept connection"
                    );
                    if exhausted {
                        return Err(ProxyError::Accept {
                            attempts: failures.count(),
                            source: e,
                        });
                    }
                    continue;
                }
            };

            debug!(parent: &self.span, peer = %peer, "Accepted connection");

            let proxy = self.clone();
            let token = self.shutdown.child_token();
            let span = info_span!(
                parent: &self.span,
                "proxy.connection",
                client_ip = %peer,
                destination = tracing::field::Empty,
            );
            tokio::spawn(
                async move {
                    if let Err(e) = proxy.handle_connection(stream, peer, listen_addr, token).await {
                        match e {
                            ProxyError::Io(ref io) if is_disconnect(io) => {
                                debug!(error = %e, "Connection closed early");
                            }
                            _ => error!(error = %e, "Connection failed"),
                        }
                    }
                }
                .instrument(span),
            );
        }
    }

    async fn handle_connection(
        &self,
        mut client: TcpStream,
        peer: SocketAddr,
        listen_addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<(), ProxyError> {
        let mut source = peer;
        let mut early = Vec::new();
        if let Some(limit) = self.inbound_header_timeout {
            let (header, rest) = read_inbound_header(&mut client, limit).await?;
            if let Some(header) = header {
                debug!(original = %header.source, "Client sent PROXY header");
                source = header.source;
            }
            early = rest;
        }

        // The guard is taken under the read lock so a drain check can never
        // observe zero sessions for a destination this connection just chose.
        let (name, destination, _session) = {
            let table = self.read_table();
            let name = table.current.clone().ok_or(ProxyError::NoDestination)?;
            let destination = table
                .destinations
                .get(&name)
                .cloned()
                .ok_or(ProxyError::NoDestination)?;
            let guard = SessionGuard::new(Arc::clone(&destination));
            (name, destination, guard)
        };
        Span::current().record("destination", name.as_str());

        let mut backend = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            dialed = TcpStream::connect(destination.addr) => dialed.map_err(|source| ProxyError::Dial {
                addr: destination.addr,
                source,
            })?,
        };

        let preamble = ProxyHeader::new(source, listen_addr).encode();
        write_preamble(&mut backend, &preamble, &early, destination.addr).await?;

        let (mut client_rd, mut client_wr) = client.into_split();
        let (mut backend_rd, mut backend_wr) = backend.into_split();

        let mut upstream = tokio::spawn(
            async move { tokio::io::copy(&mut client_rd, &mut backend_wr).await }
                .instrument(Span::current()),
        );
        let mut downstream = tokio::spawn(
            async move { tokio::io::copy(&mut backend_rd, &mut client_wr).await }
                .instrument(Span::current()),
        );

        tokio::select! {
            _ = cancel.cancelled() => debug!("Connection cancelled"),
            res = &mut upstream => log_relay("upstream", res),
            res = &mut downstream => log_relay("downstream", res),
        }

        // Dropping the halves closes both sockets.
        upstream.abort();
        downstream.abort();

        Ok(())
    }

    /// Watch a retired destination until it has no sessions, then remove it
    /// and fire `on_drained`.
    fn schedule_drain(&self, name: String, destination: Arc<Destination>, on_drained: DrainCallback) {
        let table = Arc::clone(&self.table);
        let interval = self.drain_interval;
        let cancel = self.shutdown.child_token();
        let span = info_span!(parent: &self.span, "proxy.drain", destination = %name);

        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!("Drain check cancelled");
                            return;
                        }
                        _ = ticker.tick() => {}
                        _ = destination.idle.notified() => {}
                    }

                    if reclaim_if_drained(&table, &name, &destination) {
                        info!("Destination drained");
                        on_drained();
                        return;
                    }

                    debug!(sessions = destination.sessions(), "Destination still draining");
                }
            }
            .instrument(span),
        );
    }

    fn read_table(&self) -> RwLockReadGuard<'_, DestinationTable> {
        self.table.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_table(&self) -> RwLockWriteGuard<'_, DestinationTable> {
        self.table.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Consecutive accept failures; any success starts the count over.
#[derive(Debug, Default)]
struct AcceptFailures(usize);

impl AcceptFailures {
    fn reset(&mut self) {
        self.0 = 0;
    }

    /// Count one failure. Returns `true` once the listener should be given up.
    fn record(&mut self) -> bool {
        self.0 += 1;
        self.0 >= MAX_CONSECUTIVE_ACCEPT_FAILURES
    }

    fn count(&self) -> usize {
        self.0
    }
}

/// Write the preamble and any early client bytes under
/// [`PREAMBLE_WRITE_TIMEOUT`].
async fn write_preamble<W>(
    backend: &mut W,
    preamble: &[u8],
    early: &[u8],
    addr: SocketAddr,
) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        backend.write_all(preamble).await?;
        if !early.is_empty() {
            backend.write_all(early).await?;
        }
        backend.flush().await
    };
    tokio::time::timeout(PREAMBLE_WRITE_TIMEOUT, write)
        .await
        .map_err(|_| ProxyError::PreambleTimeout(addr))??;
    Ok(())
}

/// Remove `name` if it is still the entry we are draining and has no
/// sessions. Returns `true` once the drain is complete.
fn reclaim_if_drained(
    table: &RwLock<DestinationTable>,
    name: &str,
    destination: &Arc<Destination>,
) -> bool {
    let mut table = table.write().unwrap_or_else(|e| e.into_inner());
    match table.destinations.get(name) {
        Some(entry) if Arc::ptr_eq(entry, destination) => {
            if destination.sessions() != 0 || table.current.as_deref() == Some(name) {
                return false;
            }
            table.destinations.remove(name);
            true
        }
        // Already reclaimed or replaced by a newer registration.
        _ => true,
    }
}

/// Read an optional PROXY v2 header sent by the client.
///
/// Returns the header (if any) and the bytes read past it, which must be
/// forwarded to the backend. Running out of time or seeing plain traffic
/// means there is no header.
async fn read_inbound_header(
    stream: &mut TcpStream,
    limit: Duration,
) -> Result<(Option<ProxyHeader>, Vec<u8>), ProxyError> {
    let deadline = Instant::now() + limit;
    let mut buf = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];

    loop {
        match ProxyHeader::decode(&buf)? {
            DecodeOutcome::NotProxy => return Ok((None, buf)),
            DecodeOutcome::Header { header, consumed } => {
                let rest = buf.split_off(consumed);
                return Ok((header, rest));
            }
            DecodeOutcome::Incomplete => {}
        }

        let n = match tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await {
            Ok(read) => read?,
            Err(_) => {
                debug!("No PROXY header before timeout");
                return Ok((None, buf));
            }
        };
        if n == 0 {
            return Ok((None, buf));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn log_relay(direction: &'static str, res: Result<std::io::Result<u64>, JoinError>) {
    match res {
        Ok(Ok(bytes)) => debug!(direction, bytes, "Relay finished"),
        Ok(Err(e)) if is_disconnect(&e) => debug!(direction, error = %e, "Relay closed by peer"),
        Ok(Err(e)) => warn!(direction, error = %e, "Relay failed"),
        Err(e) => error!(direction, error = %e, "Relay task failed"),
    }
}

fn is_disconnect(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    )
}
