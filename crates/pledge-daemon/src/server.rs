//! The server: TLS accept loop, per-connection request handling and the
//! live-upgrade lifecycle.
//!
//! The accept loop and every per-connection task are tracked by one task
//! group with structured cancellation. Requests on a connection are handled
//! serially; different connections are independent. During an evaluation
//! the reporter output is teed over the connection's back-channel as
//! `Output` frames, then exactly one `Response` frame terminates the
//! request.
//!
//! External control is by signal: SIGTERM/SIGINT drain and exit, SIGUSR2
//! starts a live upgrade (spawn a replacement inheriting the listening
//! socket, wait for its readiness signal, then drain).

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use pledge_core::Promise;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::framing::FrameCodec;
use crate::proto::{Message, ProtocolError, Request, Response};
use crate::upgrade;

/// How often the accept loop polls the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_secs(1);

/// Server address and behaviour knobs.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub server_version: String,
    /// Keep evaluation output on the server's own sink instead of teeing
    /// it to the client stream.
    pub no_redirect: bool,
}

/// Evaluation seam the server dispatches decoded requests into.
///
/// `Ok(())` covers both boolean outcomes of the tree - only fatal
/// evaluation failures surface as `Err` and become a non-empty response
/// error.
pub trait RequestHandler: Send + Sync {
    fn handle(
        &self,
        tree: Promise,
        verbose: bool,
        debug: bool,
        sink: Box<dyn Write + Send>,
    ) -> Result<(), String>;
}

/// Server failure.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("server task failed: {0}")]
    Task(String),
}

type ServerFramed = Framed<tokio_rustls::server::TlsStream<TcpStream>, FrameCodec>;

/// The pledge server. Cheap to clone; connection tasks carry their own
/// handle.
#[derive(Clone)]
pub struct Server {
    settings: Arc<ServerSettings>,
    tls: Arc<rustls::ServerConfig>,
    handler: Arc<dyn RequestHandler>,
}

impl Server {
    #[must_use]
    pub fn new(
        settings: ServerSettings,
        tls: Arc<rustls::ServerConfig>,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            tls,
            handler,
        }
    }

    /// Run with full lifecycle support: bind (or adopt an upgrade parent's
    /// listener), serve, and react to SIGTERM/SIGINT (drain) and SIGUSR2
    /// (live upgrade). `pre_fork` runs before the replacement process is
    /// spawned; it must release exclusive resources such as the
    /// certificate store.
    ///
    /// # Errors
    ///
    /// Returns a [`ServerError`] when binding, signal registration or the
    /// accept loop fails.
    pub async fn serve(&self, pre_fork: impl Fn() + Send) -> Result<(), ServerError> {
        let std_listener = match upgrade::inherited_listener() {
            Some(listener) => {
                info!(addr = ?listener.local_addr().ok(), "reusing listener from upgrade parent");
                listener
            },
            None => {
                let addr = format!("{}:{}", self.settings.host, self.settings.port);
                let listener =
                    std::net::TcpListener::bind(&addr).map_err(|source| ServerError::Bind {
                        addr: addr.clone(),
                        source,
                    })?;
                info!(%addr, "listening");
                listener
            },
        };
        // A second handle to the same socket, kept aside for the upgrade
        // fork while the accept loop owns the async listener.
        let upgrade_handle = std_listener.try_clone()?;
        std_listener.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(std_listener)?;

        if upgrade::notify_parent_ready() {
            info!("upgrade complete, previous server draining");
        }

        let shutdown = CancellationToken::new();
        let mut accept_task = {
            let server = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.run(listener, shutdown).await })
        };

        let mut sigusr2 = signal(SignalKind::user_defined2())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let replacement_args: Vec<String> = std::env::args().skip(1).collect();

        loop {
            tokio::select! {
                _ = sigusr2.recv() => {
                    info!("live upgrade requested");
                    pre_fork();
                    match upgrade::spawn_replacement(&upgrade_handle, &replacement_args) {
                        Ok(pid) => info!(pid, "replacement spawned, waiting for readiness"),
                        Err(e) => error!(error = %e, "spawn replacement"),
                    }
                    // The replacement signals SIGTERM once it is serving;
                    // the branch below then drains this generation.
                },
                _ = sigterm.recv() => {
                    info!("SIGTERM received, draining");
                    break;
                },
                _ = sigint.recv() => {
                    info!("SIGINT received, draining");
                    break;
                },
                result = &mut accept_task => {
                    return result.map_err(|e| ServerError::Task(e.to_string()))?;
                },
            }
        }

        shutdown.cancel();
        accept_task
            .await
            .map_err(|e| ServerError::Task(e.to_string()))?
    }

    /// The accept loop: poll the shutdown flag every second, spawn one
    /// tracked task per connection, and on shutdown stop accepting and
    /// wait for every in-flight connection to finish.
    ///
    /// # Errors
    ///
    /// Accept errors are retried, not surfaced; the loop only fails on
    /// task-group level problems.
    pub async fn run(
        &self,
        listener: tokio::net::TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), ServerError> {
        let acceptor = TlsAcceptor::from(Arc::clone(&self.tls));
        let tracker = TaskTracker::new();
        let first_error: Arc<std::sync::Mutex<Option<ServerError>>> =
            Arc::new(std::sync::Mutex::new(None));

        while !shutdown.is_cancelled() {
            match tokio::time::timeout(ACCEPT_POLL, listener.accept()).await {
                Err(_) => {}, // deadline; re-check the shutdown flag
                Ok(Err(e)) => {
                    // Temporary accept failures are retried.
                    warn!(error = %e, "accept");
                },
                Ok(Ok((stream, peer))) => {
                    let server = self.clone();
                    let acceptor = acceptor.clone();
                    let first_error = Arc::clone(&first_error);
                    tracker.spawn(async move {
                        match server.handle_connection(stream, acceptor).await {
                            Ok(()) => debug!(%peer, "connection closed"),
                            Err(e) => {
                                warn!(%peer, error = %e, "connection failed");
                                if let Ok(mut slot) = first_error.lock() {
                                    slot.get_or_insert(e);
                                }
                            },
                        }
                    });
                },
            }
        }

        drop(listener);
        tracker.close();
        tracker.wait().await;
        info!("all connections drained");

        // The drain surfaces the first connection error encountered over
        // the server's lifetime; cancellation itself is not an error.
        match first_error.lock().ok().and_then(|mut slot| slot.take()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Handle one connection: TLS handshake, then a serial receive loop
    /// until EOF. Failures are fatal to this connection only.
    async fn handle_connection(
        &self,
        stream: TcpStream,
        acceptor: TlsAcceptor,
    ) -> Result<(), ServerError> {
        let tls = acceptor.accept(stream).await?;
        let mut framed = Framed::new(tls, FrameCodec::new());

        while let Some(frame) = framed.next().await {
            let frame = frame?;
            let response = match Message::decode(frame) {
                Ok(Message::Request(request)) => self.evaluate(request, &mut framed).await?,
                Ok(_) => {
                    warn!("peer sent a non-request message");
                    Response::decode_failure(
                        &self.settings.server_version,
                        "unexpected message kind",
                    )
                },
                Err(e) => {
                    warn!(error = %e, "request decode failed");
                    Response::decode_failure(&self.settings.server_version, e.to_string())
                },
            };
            framed.send(Message::Response(response).encode()?).await?;
        }
        Ok(())
    }

    /// Evaluate one decoded request on the blocking pool, streaming
    /// reporter output to the client until the evaluation completes.
    async fn evaluate(
        &self,
        request: Request,
        framed: &mut ServerFramed,
    ) -> Result<Response, ServerError> {
        if request.client_version != self.settings.server_version {
            warn!(
                client = %request.client_version,
                server = %self.settings.server_version,
                "client version mismatch"
            );
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let sink: Box<dyn Write + Send> = if self.settings.no_redirect {
            Box::new(std::io::stdout())
        } else {
            Box::new(ChannelWriter { tx })
        };

        let handler = Arc::clone(&self.handler);
        let Request {
            verbose,
            debug,
            tree,
            ..
        } = request;
        let evaluation =
            tokio::task::spawn_blocking(move || handler.handle(tree, verbose, debug, sink));

        // The sink is dropped when the handler returns, which ends this
        // stream; output is fully flushed before the response goes out.
        while let Some(chunk) = rx.recv().await {
            framed.send(Message::Output(chunk.into()).encode()?).await?;
        }

        let version = self.settings.server_version.clone();
        Ok(match evaluation.await {
            Ok(Ok(())) => Response::ok(version),
            Ok(Err(message)) => Response::aborted(version, message),
            Err(e) => Response::aborted(version, format!("evaluation task failed: {e}")),
        })
    }
}

/// `Write` adapter feeding reporter output into the connection task.
struct ChannelWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // A gone receiver means the connection died; evaluation continues
        // and the outcome still lands in the run log.
        let _ = self.tx.send(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use pledge_core::{Argument, ExecKind, ExecPromise};
    use rustls::pki_types::ServerName;
    use rustls::RootCertStore;
    use tokio_rustls::TlsConnector;

    use super::*;
    use crate::tls::{client_config, server_config, CertificateSource, PemFileSource, TlsIdentity};

    const SERVER_CERT: &str = include_str!("testdata/server.cert.pem");
    const SERVER_KEY: &str = include_str!("testdata/server.privkey.pem");
    const CLIENT_CERT: &str = include_str!("testdata/client.cert.pem");
    const CLIENT_KEY: &str = include_str!("testdata/client.privkey.pem");

    fn identity(cert: &str, key: &str) -> TlsIdentity {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("c.pem");
        let key_path = dir.path().join("k.pem");
        std::fs::write(&cert_path, cert).unwrap();
        std::fs::write(&key_path, key).unwrap();
        PemFileSource::new(cert_path, key_path).identity().unwrap()
    }

    fn pool_of(pem: &str) -> RootCertStore {
        let mut pool = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut pem.as_bytes()) {
            pool.add(cert.unwrap()).unwrap();
        }
        pool
    }

    struct EchoHandler;

    impl RequestHandler for EchoHandler {
        fn handle(
            &self,
            tree: Promise,
            _verbose: bool,
            _debug: bool,
            mut sink: Box<dyn Write + Send>,
        ) -> Result<(), String> {
            writeln!(sink, "evaluating {}", tree.describe(&[])).unwrap();
            match tree {
                Promise::Exec(exec) if exec.kind == ExecKind::Test => Ok(()),
                _ => Err("unsupported tree in test".to_string()),
            }
        }
    }

    fn test_server(handler: Arc<dyn RequestHandler>) -> Server {
        let tls = server_config(
            identity(SERVER_CERT, SERVER_KEY),
            pool_of(CLIENT_CERT),
        )
        .unwrap();
        Server::new(
            ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 0,
                server_version: "0.4.0".to_string(),
                no_redirect: false,
            },
            tls,
            handler,
        )
    }

    fn request(tree: Promise) -> Request {
        Request {
            verbose: false,
            debug: false,
            client_version: "0.4.0".to_string(),
            tree,
        }
    }

    fn test_tree() -> Promise {
        Promise::Exec(ExecPromise {
            kind: ExecKind::Test,
            args: vec![Argument::constant("/bin/true")],
        })
    }

    async fn connect(
        addr: std::net::SocketAddr,
        cert: &str,
        key: &str,
    ) -> std::io::Result<Framed<tokio_rustls::client::TlsStream<TcpStream>, FrameCodec>> {
        let config = client_config(identity(cert, key), pool_of(SERVER_CERT)).unwrap();
        let connector = TlsConnector::from(config);
        let tcp = TcpStream::connect(addr).await?;
        let name = ServerName::try_from("localhost").unwrap();
        let tls = connector.connect(name, tcp).await?;
        Ok(Framed::new(tls, FrameCodec::new()))
    }

    async fn spawn_server(server: Server) -> (std::net::SocketAddr, CancellationToken) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move { server.run(listener, token).await });
        (addr, shutdown)
    }

    #[tokio::test]
    async fn request_gets_output_then_single_response() {
        let (addr, shutdown) = spawn_server(test_server(Arc::new(EchoHandler))).await;
        let mut framed = connect(addr, CLIENT_CERT, CLIENT_KEY).await.unwrap();

        let payload = Message::Request(request(test_tree())).encode().unwrap();
        framed.send(payload).await.unwrap();

        let mut outputs = Vec::new();
        let response = loop {
            let frame = framed.next().await.unwrap().unwrap();
            match Message::decode(frame).unwrap() {
                Message::Output(chunk) => outputs.push(chunk),
                Message::Response(response) => break response,
                Message::Request(_) => panic!("server must not send requests"),
            }
        };

        assert_eq!(response.status, crate::proto::STATUS_OK);
        assert!(response.error.is_empty());
        let teed: Vec<u8> = outputs.concat();
        assert!(String::from_utf8_lossy(&teed).contains("evaluating"));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn handler_failure_becomes_aborted_response() {
        let (addr, shutdown) = spawn_server(test_server(Arc::new(EchoHandler))).await;
        let mut framed = connect(addr, CLIENT_CERT, CLIENT_KEY).await.unwrap();

        // The echo handler rejects anything that is not a plain test exec.
        let tree = Promise::Not(Box::new(test_tree()));
        framed
            .send(Message::Request(request(tree)).encode().unwrap())
            .await
            .unwrap();

        let response = loop {
            let frame = framed.next().await.unwrap().unwrap();
            if let Message::Response(response) = Message::decode(frame).unwrap() {
                break response;
            }
        };
        assert_eq!(response.status, crate::proto::STATUS_ABORTED);
        assert!(!response.error.is_empty());

        shutdown.cancel();
    }

    #[tokio::test]
    async fn undecodable_request_gets_decode_status() {
        let (addr, shutdown) = spawn_server(test_server(Arc::new(EchoHandler))).await;
        let mut framed = connect(addr, CLIENT_CERT, CLIENT_KEY).await.unwrap();

        framed.send(Bytes::from_static(&[99, 1, 2, 3])).await.unwrap();

        let frame = framed.next().await.unwrap().unwrap();
        let Message::Response(response) = Message::decode(frame).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(response.status, crate::proto::STATUS_DECODE);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn requests_on_one_connection_are_serial() {
        let (addr, shutdown) = spawn_server(test_server(Arc::new(EchoHandler))).await;
        let mut framed = connect(addr, CLIENT_CERT, CLIENT_KEY).await.unwrap();

        for _ in 0..3 {
            framed
                .send(Message::Request(request(test_tree())).encode().unwrap())
                .await
                .unwrap();
            let response = loop {
                let frame = framed.next().await.unwrap().unwrap();
                if let Message::Response(response) = Message::decode(frame).unwrap() {
                    break response;
                }
            };
            assert_eq!(response.status, crate::proto::STATUS_OK);
        }

        shutdown.cancel();
    }

    #[tokio::test]
    async fn unpinned_client_fails_the_handshake() {
        let (addr, shutdown) = spawn_server(test_server(Arc::new(EchoHandler))).await;

        // The "other" identity is not in the server's pinned-client pool.
        let result = async {
            let mut framed = connect(addr, OTHER_CERT, OTHER_KEY).await?;
            framed
                .send(Message::Request(request(test_tree())).encode().unwrap())
                .await
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            match framed.next().await {
                Some(Ok(frame)) => Ok(Some(frame)),
                Some(Err(e)) => Err(std::io::Error::other(e.to_string())),
                None => Ok(None),
            }
        }
        .await;

        // Rejection may surface at connect, at the first write, or as EOF.
        match result {
            Err(_) | Ok(None) => {},
            Ok(Some(_)) => panic!("unpinned client must not complete a request"),
        }

        shutdown.cancel();
    }

    const OTHER_CERT: &str = include_str!("testdata/other.cert.pem");
    const OTHER_KEY: &str = include_str!("testdata/other.privkey.pem");

    #[tokio::test]
    async fn shutdown_drains_and_stops_accepting() {
        let (addr, shutdown) = spawn_server(test_server(Arc::new(EchoHandler))).await;

        // Healthy request first.
        let mut framed = connect(addr, CLIENT_CERT, CLIENT_KEY).await.unwrap();
        framed
            .send(Message::Request(request(test_tree())).encode().unwrap())
            .await
            .unwrap();
        loop {
            let frame = framed.next().await.unwrap().unwrap();
            if matches!(Message::decode(frame).unwrap(), Message::Response(_)) {
                break;
            }
        }
        drop(framed);

        shutdown.cancel();
        // Give the accept loop time to observe the flag and drop the
        // listener.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(connect(addr, CLIENT_CERT, CLIENT_KEY).await.is_err());
    }
}
