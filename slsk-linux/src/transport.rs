//! Peer transport: accept TCP peer connections, require PeerInit, then feed
//! frames to the client and write its outbound actions back.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use slsk_core::protocol::init::CONNECTION_TYPE_PEER;
use slsk_core::protocol::PeerInit;
use slsk_core::{Client, FrameCodec, OutboundAction, WireMessage};
use tokio::net::{tcp::OwnedReadHalf, TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outbound queue per connected username.
pub type PeerSenders = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Bytes>>>>;

/// Accept peer connections on `listener` until `shutdown` is cancelled.
pub async fn run_transport(
    client: Arc<Client>,
    listener: TcpListener,
    max_frame_len: usize,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let peer_senders: PeerSenders = Arc::new(Mutex::new(HashMap::new()));
    loop {
        let (stream, addr) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        let client = client.clone();
        let senders = peer_senders.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = run_connection(stream, addr, client, senders, max_frame_len) => {
                    if let Err(e) = result {
                        debug!(%addr, error = %e, "peer connection closed");
                    }
                }
            }
        });
    }
}

async fn run_connection(
    stream: TcpStream,
    addr: SocketAddr,
    client: Arc<Client>,
    peer_senders: PeerSenders,
    max_frame_len: usize,
) -> anyhow::Result<()> {
    let codec = FrameCodec::new(max_frame_len);
    let (reader, writer) = stream.into_split();
    let mut frames = FramedRead::new(reader, codec);

    let first = frames
        .next()
        .await
        .context("connection closed before PeerInit")??;
    let init = PeerInit::from_bytes(first)?;
    if init.connection_type != CONNECTION_TYPE_PEER {
        bail!(
            "unsupported connection type {:?} from {}",
            init.connection_type,
            init.username
        );
    }
    let username = init.username;
    info!(%addr, %username, "peer connected");

    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let ours = tx.clone();
    peer_senders.lock().await.insert(username.clone(), tx);

    let mut sink = FramedWrite::new(writer, codec);
    let write_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    let result = read_frames(&mut frames, &username, &client, &peer_senders).await;

    // a newer connection from the same user owns the sender and the transfers
    let superseded = {
        let mut senders = peer_senders.lock().await;
        let current = senders
            .get(&username)
            .is_some_and(|tx| tx.same_channel(&ours));
        if current {
            senders.remove(&username);
        }
        !current
    };
    write_task.abort();
    if superseded {
        info!(%addr, %username, "superseded peer connection closed");
    } else {
        let removed = client.on_peer_disconnected(&username);
        info!(%addr, %username, removed, "peer disconnected");
    }
    result
}

async fn read_frames(
    frames: &mut FramedRead<OwnedReadHalf, FrameCodec>,
    username: &str,
    client: &Client,
    peer_senders: &PeerSenders,
) -> anyhow::Result<()> {
    while let Some(frame) = frames.next().await {
        // malformed messages are logged by the client; the connection stays up
        if let Ok(actions) = client.on_message_received(username, frame?) {
            dispatch(actions, peer_senders).await;
        }
    }
    Ok(())
}

async fn dispatch(actions: Vec<OutboundAction>, peer_senders: &PeerSenders) {
    if actions.is_empty() {
        return;
    }
    let senders = peer_senders.lock().await;
    for action in actions {
        match action {
            OutboundAction::SendMessage(peer, bytes) => match senders.get(&peer) {
                Some(tx) => {
                    let _ = tx.send(bytes.into());
                }
                None => warn!(%peer, "no connection for outbound message"),
            },
        }
    }
}
