//! Test utilities for proxy and restart integration tests.
//!
//! Provides tagged echo backends that record the PROXY preamble they
//! receive, a proxy launcher, and a `Workload` that serves such a backend
//! on the port handed to it through the environment.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use revolver_ecdysis::{
    CommandError, DecodeOutcome, Invocation, ProxyHeader, ReverseProxy, Step, Workload,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Drain interval used by test proxies.
pub const FAST_DRAIN: Duration = Duration::from_millis(50);

/// Initialize test logging once.
pub fn init_test() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

/// PROXY headers seen by a backend, in arrival order.
pub type SeenHeaders = Arc<Mutex<Vec<ProxyHeader>>>;

/// An echo server that greets each connection with `tag\n`.
pub struct Backend {
    pub addr: SocketAddr,
    pub headers: SeenHeaders,
    cancel: CancellationToken,
}

impl Backend {
    pub async fn spawn(tag: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let headers = SeenHeaders::default();
        let cancel = CancellationToken::new();

        tokio::spawn(accept_loop(
            listener,
            tag.to_string(),
            headers.clone(),
            cancel.clone(),
        ));

        Self {
            addr,
            headers,
            cancel,
        }
    }

    pub fn headers(&self) -> Vec<ProxyHeader> {
        self.headers.lock().unwrap().clone()
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    tag: String,
    headers: SeenHeaders,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let Ok((stream, _)) = accepted else { continue };

        let tag = tag.clone();
        let headers = headers.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = serve_echo(stream, &tag, &headers) => {}
            }
        });
    }
}

/// Read the preamble, greet, then echo until the peer closes.
async fn serve_echo(
    mut stream: TcpStream,
    tag: &str,
    headers: &SeenHeaders,
) -> std::io::Result<()> {
    let mut preamble = vec![0u8; 16];
    stream.read_exact(&mut preamble).await?;
    let len = u16::from_be_bytes([preamble[14], preamble[15]]) as usize;
    preamble.resize(16 + len, 0);
    stream.read_exact(&mut preamble[16..]).await?;

    if let Ok(DecodeOutcome::Header {
        header: Some(header),
        ..
    }) = ProxyHeader::decode(&preamble)
    {
        headers.lock().unwrap().push(header);
    }

    stream.write_all(format!("{}\n", tag).as_bytes()).await?;
    let (mut rd, mut wr) = stream.split();
    tokio::io::copy(&mut rd, &mut wr).await?;
    Ok(())
}

/// Serve `proxy` on an ephemeral loopback port.
pub async fn start_proxy(
    proxy: &ReverseProxy,
    cancel: CancellationToken,
) -> (SocketAddr, JoinHandle<Result<(), revolver_ecdysis::ProxyError>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let proxy = proxy.clone();
    let handle = tokio::spawn(async move { proxy.serve(listener, cancel).await });
    (addr, handle)
}

/// A client connection through a proxy.
pub struct Client {
    reader: BufReader<TcpStream>,
}

impl Client {
    /// Connect and read the backend's greeting.
    pub async fn connect(addr: SocketAddr) -> (Self, String) {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self::greeted(stream).await
    }

    /// Read the greeting on an already connected stream.
    pub async fn greeted(stream: TcpStream) -> (Self, String) {
        let mut client = Self {
            reader: BufReader::new(stream),
        };
        let tag = tokio::time::timeout(DEFAULT_TIMEOUT, client.read_line())
            .await
            .expect("backend greeting");
        (client, tag)
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        self.reader.get_mut()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.reader.get_ref().local_addr().unwrap()
    }

    /// Send one line and read the echo back.
    pub async fn echo(&mut self, line: &str) -> String {
        self.reader
            .get_mut()
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();
        tokio::time::timeout(DEFAULT_TIMEOUT, self.read_line())
            .await
            .expect("echo reply")
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }
}

/// A service double: binds the port named by `env_name` and serves a
/// tagged echo backend there until cancelled. The tag is the port number.
pub struct EchoWorkload {
    env_name: String,
    fail_next: AtomicBool,
    pub launches: AtomicUsize,
    pub stops: AtomicUsize,
    pub headers: SeenHeaders,
}

impl EchoWorkload {
    pub fn new(env_name: &str) -> Arc<Self> {
        Arc::new(Self {
            env_name: env_name.to_string(),
            fail_next: AtomicBool::new(false),
            launches: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            headers: SeenHeaders::default(),
        })
    }

    /// Make the next run fail before launching, like a broken build.
    pub fn fail_next_run(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Workload for EchoWorkload {
    async fn run(&self, invocation: Invocation) -> Result<(), CommandError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(CommandError::Failed {
                step: Step::Preload,
                status: ExitStatus::from_raw(1 << 8),
            });
        }

        let port: u16 = invocation
            .env
            .get(&self.env_name)
            .and_then(|p| p.parse().ok())
            .ok_or(CommandError::Empty)?;
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;

        invocation.mark_launched();
        self.launches.fetch_add(1, Ordering::SeqCst);

        accept_loop(
            listener,
            port.to_string(),
            self.headers.clone(),
            invocation.cancel.clone(),
        )
        .await;

        self.stops.fetch_add(1, Ordering::SeqCst);
        Err(CommandError::Cancelled(Step::Run))
    }
}
