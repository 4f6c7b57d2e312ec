//! SSH tunnel supervisor.
//!
//! Opens a loopback TCP listener on an OS-assigned port and forwards every
//! inbound connection through an authenticated SSH session to the database
//! endpoint, via a direct-tcpip channel. The owning session rewrites the
//! adapter's effective host/port to the tunnel's local address.
//!
//! One SSH session is established per inbound socket; the listener itself
//! never speaks SSH. Errors while connecting or forwarding are terminal: they
//! are published on the tunnel's error channel and the supervisor shuts the
//! listener and all in-flight sockets down.

use std::net::SocketAddr;
use std::sync::Arc;

use russh::client;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{GatewayError, Result};
use crate::models::server::SshConfig;

/// Local endpoint of the loopback listener.
const LOCAL_HOST: &str = "127.0.0.1";

struct Acceptor;

#[async_trait::async_trait]
impl client::Handler for Acceptor {
    type Error = russh::Error;

    // Host-key verification is the caller's trust decision; the tunnel
    // accepts the key the way the bundled ssh clients of the original
    // stack did.
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// A running tunnel. Dropping it does not stop the forwarder; call
/// [`close`](SshTunnel::close).
pub struct SshTunnel {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    errors: Option<mpsc::UnboundedReceiver<GatewayError>>,
}

impl SshTunnel {
    /// Start forwarding `dst_host:dst_port` (as seen from the SSH server)
    /// through the hop described by `ssh`.
    pub async fn open(ssh: &SshConfig, dst_host: &str, dst_port: u16) -> Result<SshTunnel> {
        let listener = TcpListener::bind((LOCAL_HOST, 0))
            .await
            .map_err(|e| GatewayError::tunnel(format!("failed to bind local listener: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| GatewayError::tunnel(e.to_string()))?;

        let (error_tx, errors) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let supervisor = Supervisor {
            ssh: ssh.clone(),
            dst_host: dst_host.to_string(),
            dst_port,
            error_tx,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(supervisor.run(listener));

        info!(
            local = %local_addr,
            dst = %format!("{dst_host}:{dst_port}"),
            "SSH tunnel listening"
        );
        Ok(SshTunnel {
            local_addr,
            shutdown,
            errors: Some(errors),
        })
    }

    pub fn local_host(&self) -> &'static str {
        LOCAL_HOST
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Receive the next terminal tunnel error, if any. Resolves `None` once
    /// the tunnel closed without (further) errors, or after
    /// [`take_errors`](Self::take_errors) moved the receiver out.
    pub async fn next_error(&mut self) -> Option<GatewayError> {
        match &mut self.errors {
            Some(errors) => errors.recv().await,
            None => None,
        }
    }

    /// Move the error receiver out, for a supervisor task that outlives this
    /// handle.
    pub fn take_errors(&mut self) -> Option<mpsc::UnboundedReceiver<GatewayError>> {
        self.errors.take()
    }

    /// Stop the listener and terminate every in-flight socket and SSH
    /// session.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

struct Supervisor {
    ssh: SshConfig,
    dst_host: String,
    dst_port: u16,
    error_tx: mpsc::UnboundedSender<GatewayError>,
    shutdown: CancellationToken,
}

impl Supervisor {
    async fn run(self, listener: TcpListener) {
        let supervisor = Arc::new(self);
        loop {
            let inbound = tokio::select! {
                _ = supervisor.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match inbound {
                Ok((socket, peer)) => {
                    debug!(peer = %peer, "Tunnel accepted connection");
                    let supervisor = supervisor.clone();
                    tokio::spawn(async move {
                        let shutdown = supervisor.shutdown.clone();
                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            result = supervisor.forward(socket) => {
                                if let Err(err) = result {
                                    supervisor.fail(err);
                                }
                            }
                        }
                    });
                }
                Err(err) => {
                    supervisor.fail(GatewayError::tunnel(format!("accept failed: {err}")));
                    break;
                }
            }
        }
        debug!("SSH tunnel listener stopped");
    }

    /// Report a terminal error and bring the whole tunnel down.
    fn fail(&self, err: GatewayError) {
        error!(error = %err, "SSH tunnel failed");
        let _ = self.error_tx.send(err);
        self.shutdown.cancel();
    }

    /// Open one SSH session and pipe `socket` through a direct-tcpip channel.
    async fn forward(&self, mut socket: TcpStream) -> Result<()> {
        let config = Arc::new(client::Config::default());
        let mut handle =
            client::connect(config, (self.ssh.host.as_str(), self.ssh.port), Acceptor)
                .await
                .map_err(|e| GatewayError::tunnel(format!("ssh connect failed: {e}")))?;

        let authenticated = if let Some(key_path) = &self.ssh.private_key {
            let passphrase = if self.ssh.use_passphrase {
                self.ssh.passphrase.as_deref()
            } else {
                None
            };
            let key = russh_keys::load_secret_key(key_path, passphrase)
                .map_err(|e| GatewayError::tunnel(format!("cannot load private key: {e}")))?;
            handle
                .authenticate_publickey(&self.ssh.user, Arc::new(key))
                .await
                .map_err(|e| GatewayError::tunnel(format!("ssh key auth failed: {e}")))?
        } else {
            let password = self.ssh.password.as_deref().unwrap_or_default();
            handle
                .authenticate_password(&self.ssh.user, password)
                .await
                .map_err(|e| GatewayError::tunnel(format!("ssh password auth failed: {e}")))?
        };
        if !authenticated {
            return Err(GatewayError::tunnel("ssh authentication rejected"));
        }

        let channel = handle
            .channel_open_direct_tcpip(
                self.dst_host.clone(),
                u32::from(self.dst_port),
                "localhost".to_string(),
                0,
            )
            .await
            .map_err(|e| GatewayError::tunnel(format!("direct-tcpip open failed: {e}")))?;

        let mut stream = channel.into_stream();
        match copy_bidirectional(&mut socket, &mut stream).await {
            Ok((sent, received)) => {
                debug!(sent, received, "Tunnel connection finished");
                Ok(())
            }
            // A reset mid-stream ends one forwarded socket, not the tunnel.
            Err(err) if err.kind() == std::io::ErrorKind::ConnectionReset => Ok(()),
            Err(err) => Err(GatewayError::tunnel(format!("tunnel pipe failed: {err}"))),
        }
    }
}
