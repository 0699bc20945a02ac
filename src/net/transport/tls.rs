// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! TLS transport (§4.8): identical framing and read/write-loop shape to
//! [`super::tcp`], with the stream wrapped in a `rustls` session before
//! the loops start.
//!
//! Trust-store policy (§9 Open Question 4, resolved in `DESIGN.md`):
//! `rustls-native-certs` on every platform, one code path rather than the
//! three-named-Windows-store split the original's "default paths" policy
//! implies elsewhere.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::Mutex,
};
use tokio_rustls::{
    TlsAcceptor, TlsConnector,
    client::TlsStream as ClientTlsStream,
    rustls::{
        ClientConfig, ServerConfig,
        pki_types::{CertificateDer, ServerName},
    },
    server::TlsStream as ServerTlsStream,
};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::net::{facade::Facade, header::NetHeader};

/// Builds a client config trusting the OS-native certificate store.
pub fn native_client_config() -> Result<Arc<ClientConfig>> {
    let mut roots = tokio_rustls::rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Builds a server config from a PEM certificate chain and private key.
pub fn server_config_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<ServerConfig>> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<std::result::Result<_, _>>()
        .context("failed to parse certificate chain")?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .context("failed to parse private key")?
        .ok_or_else(|| anyhow::anyhow!("no private key found in PEM"))?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid certificate/key pair")?;
    Ok(Arc::new(config))
}

enum Half {
    Client(ClientTlsStream<TcpStream>),
    Server(ServerTlsStream<TcpStream>),
}

/// One TLS connection, the TLS analogue of [`super::tcp::TcpLink`].
pub struct TlsLink {
    pub socket_id: u64,
    writer: Mutex<Half>,
    cancel: CancellationToken,
}

impl TlsLink {
    /// Connects over TCP, then performs the TLS client handshake against
    /// `server_name` before spawning the read loop.
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        config: Arc<ClientConfig>,
        socket_id: u64,
        facade: Arc<Facade>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let tcp = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .context("connect timed out")??;
        tcp.set_nodelay(true)?;
        let connector = TlsConnector::from(config);
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| anyhow::anyhow!("invalid server name {server_name:?}"))?;
        let stream = connector.connect(name, tcp).await.context("tls handshake failed")?;

        let local = stream.get_ref().0.local_addr().ok();
        let remote = stream.get_ref().0.peer_addr().ok();
        facade.register(socket_id, local, remote);

        let link = Arc::new(Self {
            socket_id,
            writer: Mutex::new(Half::Client(stream)),
            cancel,
        });
        Self::spawn_read_loop(Arc::clone(&link), facade);
        Ok(link)
    }

    /// Accepts one already-connected TCP stream and performs the TLS
    /// server handshake.
    pub async fn accept(
        tcp: TcpStream,
        acceptor: TlsAcceptor,
        socket_id: u64,
        facade: Arc<Facade>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        tcp.set_nodelay(true)?;
        let local = tcp.local_addr().ok();
        let remote = tcp.peer_addr().ok();
        let stream = acceptor.accept(tcp).await.context("tls handshake failed")?;
        facade.register(socket_id, local, remote);

        let link = Arc::new(Self {
            socket_id,
            writer: Mutex::new(Half::Server(stream)),
            cancel,
        });
        Self::spawn_read_loop(Arc::clone(&link), facade);
        Ok(link)
    }

    fn spawn_read_loop(link: Arc<Self>, facade: Arc<Facade>) {
        tokio::spawn(async move {
            if let Err(e) = link.read_loop(facade).await {
                warn!(socket_id = link.socket_id, "tls read loop exited: {e}");
            }
        });
    }

    async fn read_loop(&self, facade: Arc<Facade>) -> Result<()> {
        let mut staging = vec![0u8; 1024];
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let n = {
                let mut guard = self.writer.lock().await;
                match &mut *guard {
                    Half::Client(s) => s.read(&mut staging).await?,
                    Half::Server(s) => s.read(&mut staging).await?,
                }
            };
            if n == 0 {
                facade.mark_closed(self.socket_id, Some("eof"));
                break;
            }
            facade.push_data(self.socket_id, &staging[..n]);
        }
        Ok(())
    }

    pub async fn write_frame(&self, header: &NetHeader, payload: &[u8]) -> Result<()> {
        if self.cancel.is_cancelled() {
            bail!("write on closed tls link {}", self.socket_id);
        }
        let mut guard = self.writer.lock().await;
        match &mut *guard {
            Half::Client(s) => {
                s.write_all(&header.to_bytes()).await?;
                if !payload.is_empty() {
                    s.write_all(payload).await?;
                }
            }
            Half::Server(s) => {
                s.write_all(&header.to_bytes()).await?;
                if !payload.is_empty() {
                    s.write_all(payload).await?;
                }
            }
        }
        Ok(())
    }

    pub fn kill_now(&self) {
        self.cancel.cancel();
    }
}
