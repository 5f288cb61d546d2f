use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::connection;
use crate::db::Database;
use crate::dispatcher::Dispatcher;
use crate::session::ConnId;

/// The accept loop: binds the listener, gates on `max_clients`, assigns
/// connection ids and spawns one task per client.
pub struct Server {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    max_clients: usize,
}

impl Server {
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let db = Arc::new(Database::open(&config.db_path)?);
        let dispatcher = Arc::new(Dispatcher::new(db, config));
        dispatcher
            .ensure_storage()
            .context("failed to create storage directories")?;

        let addr = tokio::net::lookup_host((config.bind_host.as_str(), config.port))
            .await?
            .next()
            .with_context(|| format!("cannot resolve bind_host {}", config.bind_host))?;
        let listener = build_listener(addr)?;

        Ok(Self {
            listener,
            dispatcher,
            max_clients: config.max_clients,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> Result<()> {
        let mut next_conn_id: ConnId = 0;
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("accept failed: {}", e);
                    continue;
                }
            };

            if self.dispatcher.registry().connection_count() >= self.max_clients {
                warn!("connection limit reached, rejecting {}", addr);
                drop(stream);
                continue;
            }

            next_conn_id += 1;
            let conn_id = next_conn_id;
            info!("client connected conn={} addr={}", conn_id, addr);

            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                connection::handle_connection(stream, conn_id, dispatcher).await;
            });
        }
    }
}

/// Listener built through socket2 so accepted connections inherit NODELAY
/// and the port can be rebound promptly after a restart.
fn build_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nodelay(true)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into())?)
}
