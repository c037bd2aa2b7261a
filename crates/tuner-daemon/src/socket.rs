use crate::core::{SessionEvent, SharedSnapshot};
use crate::BroadcastMessage;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tuner_proto::protocol::{Broadcast, Frame, Message, PROTOCOL_VERSION};

pub fn start_server(
    bind_address: String,
    port: u16,
    snapshot: SharedSnapshot,
    event_tx: mpsc::Sender<SessionEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);

        let mut client_id = 0usize;
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;
                    info!("Client {} connected from {}", id, peer);

                    let snapshot = snapshot.clone();
                    let event_tx = event_tx.clone();
                    let broadcast_rx = broadcast_tx.subscribe();
                    tokio::spawn(async move {
                        handle_client(stream, snapshot, id, event_tx, broadcast_rx).await;
                        info!("Client {} disconnected", id);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    })
}

async fn handle_client(
    stream: TcpStream,
    snapshot: SharedSnapshot,
    client_id: usize,
    event_tx: mpsc::Sender<SessionEvent>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    let hello = {
        let state = snapshot.read().await.clone();
        Message::Broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            rev: state.rev,
            state,
        })
    };
    if send(&mut write_half, hello).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            match Message::next_frame(&read_buf) {
                                Frame::Incomplete => break,
                                Frame::Message(msg, consumed) => {
                                    read_buf.drain(..consumed);
                                    let Message::Command(cmd) = msg else {
                                        continue;
                                    };
                                    info!("Client {} sent command: {:?}", client_id, cmd);
                                    if event_tx.send(SessionEvent::Command(cmd)).await.is_err() {
                                        warn!("SessionEvent channel closed");
                                        return;
                                    }
                                }
                                Frame::Malformed { len, reason } => {
                                    read_buf.drain(..len);
                                    warn!("Client {} sent a malformed frame: {}", client_id, reason);
                                    let reply = Broadcast::Error {
                                        message: format!("malformed command: {}", reason),
                                    };
                                    if send(&mut write_half, Message::Broadcast(reply)).await.is_err() {
                                        return;
                                    }
                                }
                                Frame::Oversized(len) => {
                                    warn!("Client {} announced a {} byte frame, closing", client_id, len);
                                    let reply = Broadcast::Error {
                                        message: format!("frame of {} bytes exceeds the limit", len),
                                    };
                                    let _ = send(&mut write_half, Message::Broadcast(reply)).await;
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                let outgoing = match msg {
                    Ok(BroadcastMessage::StateUpdated) => state_message(&snapshot).await,
                    Ok(BroadcastMessage::Error(message)) => {
                        Message::Broadcast(Broadcast::Error { message })
                    }
                    Ok(BroadcastMessage::Log(message)) => {
                        Message::Broadcast(Broadcast::Log { message })
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        state_message(&snapshot).await
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if send(&mut write_half, outgoing).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn state_message(snapshot: &SharedSnapshot) -> Message {
    let data = snapshot.read().await.clone();
    Message::Broadcast(Broadcast::State { data })
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, msg: Message) -> anyhow::Result<()> {
    let encoded = msg.encode()?;
    writer.write_all(&encoded).await?;
    Ok(())
}
