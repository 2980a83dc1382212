use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use fabload_core::Endpoint;
use fabload_transport::{Connector, TransportError};
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::frame::{read_frame, write_frame, ClientFrame, ServerFrame, Service};

const RESPONSE_QUEUE_CAPACITY: usize = 1024;

/// Serves any [`Connector`] over the fabload TCP framing.
pub struct LedgerServer {
    listener: TcpListener,
    connector: Arc<dyn Connector>,
}

impl std::fmt::Debug for LedgerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerServer")
            .field("local_addr", &self.listener.local_addr().ok())
            .finish()
    }
}

impl LedgerServer {
    pub async fn bind(addr: &str, connector: Arc<dyn Connector>) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            connector,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` resolves. Each connection is
    /// served on its own task.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), TransportError> {
        let local_addr = self.local_addr()?;
        info!(%local_addr, "ledger server listening");
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    let connector = self.connector.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_connection(stream, connector, local_addr).await {
                            debug!(%remote, error = %err, "connection ended with error");
                        }
                    });
                }
            }
        }
        info!(%local_addr, "ledger server stopped");
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    connector: Arc<dyn Connector>,
    local_addr: SocketAddr,
) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let (service, authority) = match read_frame::<_, ClientFrame>(&mut reader).await? {
        Some(ClientFrame::Hello { service, authority }) => (service, authority),
        Some(_) => return Err(TransportError::UnexpectedFrame("expected hello")),
        None => return Ok(()),
    };
    let endpoint = Endpoint::new(local_addr.to_string(), authority);
    debug!(endpoint = %endpoint, ?service, "serving connection");
    match service {
        Service::Endorser => serve_endorser(reader, writer, connector, endpoint).await,
        Service::Broadcast => serve_broadcast(reader, writer, connector, endpoint).await,
        Service::Deliver => serve_deliver(reader, writer, connector, endpoint).await,
    }
}

async fn write_responses(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<ServerFrame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(err) = write_frame(&mut writer, &frame).await {
            debug!(error = %err, "response write failed");
            break;
        }
    }
}

async fn serve_endorser(
    mut reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    connector: Arc<dyn Connector>,
    endpoint: Endpoint,
) -> Result<(), TransportError> {
    let client = connector.endorser(&endpoint).await?;
    let (out_tx, out_rx) = mpsc::channel(RESPONSE_QUEUE_CAPACITY);
    let writer_task = tokio::spawn(write_responses(writer, out_rx));

    while let Some(frame) = read_frame::<_, ClientFrame>(&mut reader).await? {
        let ClientFrame::Proposal { id, signed } = frame else {
            return Err(TransportError::UnexpectedFrame("expected proposal"));
        };
        let client = client.clone();
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            let frame = match client.process_proposal(&signed).await {
                Ok(response) => ServerFrame::ProposalResponse { id, response },
                Err(err) => ServerFrame::RpcError {
                    id: Some(id),
                    message: err.to_string(),
                },
            };
            let _ = out_tx.send(frame).await;
        });
    }
    drop(out_tx);
    let _ = writer_task.await;
    Ok(())
}

async fn serve_broadcast(
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    connector: Arc<dyn Connector>,
    endpoint: Endpoint,
) -> Result<(), TransportError> {
    let stream = connector.broadcast(&endpoint).await?;
    let mut sink = stream.sink;
    let mut acks = stream.acks;

    let forward_acks = tokio::spawn(async move {
        loop {
            let frame = match acks.recv().await {
                Ok(Some(ack)) => ServerFrame::BroadcastAck(ack),
                Ok(None) => break,
                Err(err) => ServerFrame::RpcError {
                    id: None,
                    message: err.to_string(),
                },
            };
            let stream_failed = matches!(frame, ServerFrame::RpcError { .. });
            if write_frame(&mut writer, &frame).await.is_err() || stream_failed {
                break;
            }
        }
    });

    while let Some(frame) = read_frame::<_, ClientFrame>(&mut reader).await? {
        let ClientFrame::Envelope(envelope) = frame else {
            return Err(TransportError::UnexpectedFrame("expected envelope"));
        };
        if sink.send(envelope).await.is_err() {
            break;
        }
    }
    drop(sink);
    let _ = forward_acks.await;
    Ok(())
}

async fn serve_deliver(
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    connector: Arc<dyn Connector>,
    endpoint: Endpoint,
) -> Result<(), TransportError> {
    let mut deliver = connector.deliver(&endpoint).await?;
    let seek = match read_frame::<_, ClientFrame>(&mut reader).await? {
        Some(ClientFrame::Envelope(envelope)) => envelope,
        Some(_) => return Err(TransportError::UnexpectedFrame("expected seek envelope")),
        None => return Ok(()),
    };
    deliver.send(seek).await?;

    // Nothing else is expected from the client; any read completion means it
    // went away.
    let client_gone = read_frame::<_, ClientFrame>(&mut reader);
    tokio::pin!(client_gone);
    loop {
        tokio::select! {
            _ = &mut client_gone => break,
            next = deliver.recv() => {
                let frame = match next {
                    Ok(Some(response)) => ServerFrame::Deliver(response),
                    Ok(None) => break,
                    Err(err) => {
                        let message = err.to_string();
                        write_frame(&mut writer, &ServerFrame::RpcError { id: None, message }).await?;
                        break;
                    }
                };
                write_frame(&mut writer, &frame).await?;
            }
        }
    }
    Ok(())
}
