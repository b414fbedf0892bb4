//! Client side of the transport: dial, send, stream, await.
//!
//! One request per call: dial TLS against the pinned-server pool, send the
//! request frame, relay `Output` frames to our stdout as they arrive, and
//! finish on the single `Response` frame. A non-empty response error
//! becomes the command's failure.

use std::io::Write;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use futures::{SinkExt, StreamExt};
use pledge_core::Promise;
use pledge_daemon::{FrameCodec, Message, Request, Response};
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::{debug, info};

/// A dialer bound to one server address and TLS configuration.
pub struct Client {
    config: Arc<rustls::ClientConfig>,
    host: String,
    port: u16,
    client_version: String,
}

impl Client {
    #[must_use]
    pub fn new(config: Arc<rustls::ClientConfig>, host: String, port: u16) -> Self {
        Self {
            config,
            host,
            port,
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Send one tree for remote evaluation and await its terminal
    /// response.
    ///
    /// # Errors
    ///
    /// Fails on dial/TLS/protocol errors, on connection loss before the
    /// response, and when the response carries a non-empty error.
    pub async fn send(&self, tree: Promise, verbose: bool, debug: bool) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let tcp = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("dial {addr}"))?;

        let server_name = ServerName::try_from(self.host.as_str())
            .map(|name| name.to_owned())
            .with_context(|| format!("invalid server name {:?}", self.host))?;
        let tls = TlsConnector::from(Arc::clone(&self.config))
            .connect(server_name, tcp)
            .await
            .context("TLS handshake")?;
        debug!(%addr, "connected");

        let mut framed = Framed::new(tls, FrameCodec::new());
        let request = Message::Request(Request {
            verbose,
            debug,
            client_version: self.client_version.clone(),
            tree,
        });
        info!("send promise");
        framed.send(request.encode()?).await.context("send request")?;

        let response = self.await_response(&mut framed).await?;
        info!("{}", response.status);
        if !response.error.is_empty() {
            bail!(response.error);
        }
        Ok(())
    }

    /// Relay output frames until the response arrives.
    async fn await_response(
        &self,
        framed: &mut Framed<tokio_rustls::client::TlsStream<TcpStream>, FrameCodec>,
    ) -> Result<Response> {
        let mut stdout = std::io::stdout();
        loop {
            let frame = framed
                .next()
                .await
                .ok_or_else(|| anyhow!("connection closed before the response"))?
                .context("receive")?;
            match Message::decode(frame)? {
                Message::Output(chunk) => {
                    stdout.write_all(&chunk).context("relay output")?;
                    stdout.flush().ok();
                },
                Message::Response(response) => return Ok(response),
                Message::Request(_) => bail!("server sent a request frame"),
            }
        }
    }
}
