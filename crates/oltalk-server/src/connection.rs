use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};

use oltalk_proto::wire::{self, Packet};

use crate::dispatcher::Dispatcher;
use crate::session::ConnId;

/// Capacity of the per-connection write queue. The owning connection task
/// awaits its own sends; cross-connection fanout drops the frame (and logs)
/// when a recipient's queue is full rather than stalling the sender.
const WRITE_QUEUE_CAPACITY: usize = 1024;

/// Handle the dispatcher uses to answer the connection that owns a packet.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub conn_id: ConnId,
    sender: mpsc::Sender<Bytes>,
}

impl ConnectionHandle {
    /// Enqueue a packet on this connection's write queue, waiting for space.
    /// A closed queue means the peer is gone; the read loop notices on its
    /// own, so the error is dropped here.
    pub async fn send(&self, packet: &Packet) {
        let _ = self.sender.send(wire::encode(packet)).await;
    }
}

/// Own one client connection: drain the socket into the read buffer, decode
/// and dispatch frames in arrival order, and tear the session down on EOF,
/// error, or a framing violation.
pub async fn handle_connection(stream: TcpStream, conn_id: ConnId, dispatcher: Arc<Dispatcher>) {
    if let Err(e) = configure_socket(&stream) {
        warn!("conn {}: failed to set socket options: {}", conn_id, e);
    }

    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_CAPACITY);

    dispatcher.registry().add_connection(conn_id, tx.clone());

    let write_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let handle = ConnectionHandle {
        conn_id,
        sender: tx,
    };
    if let Err(e) = read_loop(&mut reader, &handle, &dispatcher).await {
        warn!("conn {}: {}", conn_id, e);
    }

    write_task.abort();
    dispatcher.handle_disconnect(conn_id);
    info!("client disconnected conn={}", conn_id);
}

async fn read_loop(
    reader: &mut OwnedReadHalf,
    handle: &ConnectionHandle,
    dispatcher: &Dispatcher,
) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        // Drain every complete frame before reading again. A handler's
        // response is enqueued before the next frame is decoded, which keeps
        // per-connection request/response ordering.
        loop {
            match wire::decode(&mut buf) {
                Ok(Some(packet)) => dispatcher.dispatch(handle, packet).await,
                Ok(None) => break,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn configure_socket(stream: &TcpStream) -> std::io::Result<()> {
    let sock = socket2::SockRef::from(stream);
    sock.set_nodelay(true)?;
    sock.set_keepalive(true)
}
