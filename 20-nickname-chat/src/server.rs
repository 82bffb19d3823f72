use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::Result;
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    error::ChatError,
    protocol,
    registry::SessionRegistry,
    router::MessageRouter,
    session::{Session, SessionId, run_session},
};

/// Owns the listening socket and spawns one task per accepted connection.
pub struct Server {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    registry: Arc<SessionRegistry>,
    router: MessageRouter,
    next_id: AtomicU64,
}

impl Server {
    /// Binds the configured address. Failure here is fatal to startup.
    pub async fn bind(config: ServerConfig) -> Result<Self, ChatError> {
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|source| ChatError::Bind {
                addr: config.listen,
                source,
            })?;
        Ok(Self::new(listener, config))
    }

    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        Self {
            listener,
            config: Arc::new(config),
            router: MessageRouter::new(Arc::clone(&registry)),
            registry,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared registry, for inspecting who is connected.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accepts connections until `shutdown` resolves.
    ///
    /// On shutdown the listener is dropped first so no new session can start,
    /// then every registered session is told and asked to close.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            config,
            router,
            next_id,
            ..
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            let id = next_id.fetch_add(1, Ordering::Relaxed);
                            spawn_session(id, stream, peer, &router, &config);
                        }
                        Err(err) => warn!(error = ?err, "failed to accept connection"),
                    }
                }
            }
        }

        drop(listener);
        info!("server shutting down");
        router.close_all(protocol::SHUTDOWN_NOTICE).await;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn spawn_session(
    id: SessionId,
    stream: TcpStream,
    peer: SocketAddr,
    router: &MessageRouter,
    config: &Arc<ServerConfig>,
) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = ?err, "failed to set TCP_NODELAY");
    }

    let (reader, writer) = stream.into_split();
    let session = Arc::new(Session::new(id, Some(peer), writer, config.write_timeout));
    let router = router.clone();
    let config = Arc::clone(config);

    debug!(session = id, peer = %peer, "connection accepted");
    tokio::spawn(async move {
        match run_session(session, BufReader::new(reader), router, config).await {
            Ok(()) => debug!(session = id, peer = %peer, "session closed"),
            Err(ChatError::PeerDisconnected) => {
                debug!(session = id, peer = %peer, "peer disconnected")
            }
            Err(err) => {
                warn!(session = id, peer = %peer, error = %err, "session ended with error")
            }
        }
    });
}
