//! TCP acceptor
//!
//! Binds a listener with socket2 so the configured socket options apply,
//! resolves the default device once, then hands every accepted connection
//! to a fresh [`Session`]. Connections are served one at a time unless
//! `concurrent` is set, in which case each gets its own thread.

use crate::config::{LimitsConfig, ServerConfig};
use crate::device::{Device, DeviceError, DeviceRegistry};
use crate::protocol::FramedStream;
use crate::session::{Session, SessionEnd};
use log::{error, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid listen address {0}")]
    InvalidAddress(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("Default device unavailable: {0}")]
    Device(#[from] DeviceError),
}

pub struct Server {
    listener: TcpListener,
    registry: Arc<DeviceRegistry>,
    default_device: Arc<dyn Device>,
    limits: LimitsConfig,
    nodelay: bool,
    concurrent: bool,
    next_session: AtomicU64,
}

impl Server {
    /// Bind the configured address and resolve the default device
    pub fn bind(config: &ServerConfig, registry: Arc<DeviceRegistry>) -> Result<Self, ServerError> {
        let default_device = registry.get(&config.device.default)?;
        let listener = create_listener(config)?;
        info!(
            "listening on {} (default device {})",
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| config.bind_address()),
            default_device.name()
        );

        Ok(Self {
            listener,
            registry,
            default_device,
            limits: config.limits,
            nodelay: config.server.nodelay,
            concurrent: config.server.concurrent,
            next_session: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever
    pub fn serve(&self) -> Result<(), ServerError> {
        loop {
            let (stream, peer) = self.accept()?;
            if self.concurrent {
                let ctx = self.context();
                let spawned = thread::Builder::new()
                    .name(format!("rdev-session-{}", ctx.id))
                    .spawn(move || ctx.serve(stream, peer));
                if let Err(e) = spawned {
                    error!("failed to spawn session thread for {}: {}", peer, e);
                }
            } else {
                self.context().serve(stream, peer);
            }
        }
    }

    /// Accept and serve exactly one connection on the calling thread
    pub fn serve_one(&self) -> Result<(), ServerError> {
        let (stream, peer) = self.accept()?;
        self.context().serve(stream, peer);
        Ok(())
    }

    fn accept(&self) -> Result<(TcpStream, SocketAddr), ServerError> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.nodelay {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("TCP_NODELAY failed for {}: {}", peer, e);
                        }
                    }
                    return Ok((stream, peer));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => {
                    warn!("connection aborted before accept: {}", e);
                    continue;
                }
                Err(e) => return Err(ServerError::Accept(e)),
            }
        }
    }

    fn context(&self) -> SessionContext {
        SessionContext {
            id: self.next_session.fetch_add(1, Ordering::Relaxed),
            registry: Arc::clone(&self.registry),
            device: Arc::clone(&self.default_device),
            limits: self.limits,
        }
    }
}

/// Everything a session thread needs, detached from the listener
struct SessionContext {
    id: u64,
    registry: Arc<DeviceRegistry>,
    device: Arc<dyn Device>,
    limits: LimitsConfig,
}

impl SessionContext {
    fn serve(self, stream: TcpStream, peer: SocketAddr) {
        info!("session {}: connected from {}", self.id, peer);
        let framed = match FramedStream::from_tcp(stream) {
            Ok(framed) => framed,
            Err(e) => {
                error!("session {}: failed to split stream: {}", self.id, e);
                return;
            }
        };

        let mut session = Session::new(self.id, framed, self.registry, self.device, self.limits);
        match session.run() {
            Ok(SessionEnd::Exit) => {}
            Ok(SessionEnd::PeerClosed) => info!("session {}: peer closed", self.id),
            Err(e) if e.is_disconnect() => info!("session {}: disconnected: {}", self.id, e),
            Err(e) => error!("session {}: terminated: {}", self.id, e),
        }
        info!(
            "session {}: served {} commands, releasing {} buffers",
            self.id,
            session.commands(),
            session.buffers().len()
        );
    }
}

fn create_listener(config: &ServerConfig) -> Result<TcpListener, ServerError> {
    let addr = config.bind_address();
    let socket_addr = addr
        .to_socket_addrs()
        .map_err(|_| ServerError::InvalidAddress(addr.clone()))?
        .next()
        .ok_or_else(|| ServerError::InvalidAddress(addr.clone()))?;
    let bind_err = |source| ServerError::Bind {
        addr: addr.clone(),
        source,
    };

    let domain = if socket_addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;

    if config.server.reuse_address {
        socket.set_reuse_address(true).map_err(bind_err)?;
    }

    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
    {
        if config.server.reuse_port {
            if let Err(e) = socket.set_reuse_port(true) {
                warn!("SO_REUSEPORT not available: {}", e);
            }
        }
    }

    socket.bind(&socket_addr.into()).map_err(bind_err)?;
    socket.listen(config.server.backlog).map_err(bind_err)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Opcode;
    use std::io::{Read, Write};

    fn local_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let server = Server::bind(&local_config(), Arc::new(DeviceRegistry::with_builtin())).unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_unknown_default_device() {
        let mut config = local_config();
        config.device.default = "TPU".to_string();
        let err = Server::bind(&config, Arc::new(DeviceRegistry::with_builtin()))
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::Device(DeviceError::UnknownDevice(_))));
    }

    #[test]
    fn test_bad_address() {
        let mut config = local_config();
        config.server.host = "not an address".to_string();
        assert!(matches!(
            Server::bind(&config, Arc::new(DeviceRegistry::with_builtin())),
            Err(ServerError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_serve_one_sync_exit() {
        let server = Server::bind(&local_config(), Arc::new(DeviceRegistry::with_builtin())).unwrap();
        let addr = server.local_addr().unwrap();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(&[Opcode::Synchronize.as_u8()]).unwrap();
            let mut ack = [0xFFu8; 1];
            stream.read_exact(&mut ack).unwrap();
            stream.write_all(&[Opcode::Exit.as_u8()]).unwrap();
            let mut rest = Vec::new();
            stream.read_to_end(&mut rest).unwrap();
            (ack[0], rest)
        });

        server.serve_one().unwrap();
        let (ack, rest) = client.join().unwrap();
        assert_eq!(ack, 0x00);
        assert!(rest.is_empty());
    }
}
