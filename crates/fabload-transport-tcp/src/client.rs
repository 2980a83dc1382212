use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fabload_codec::{BroadcastResponse, DeliverResponse, Envelope, ProposalResponse, SignedProposal};
use fabload_core::Endpoint;
use fabload_transport::{
    AckSource, BroadcastStream, Connector, DeliverStream, EndorserClient, EnvelopeSink,
    TransportError,
};
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::frame::{read_frame, write_frame, ClientFrame, ServerFrame, Service};

type CallResult = Result<Option<ProposalResponse>, String>;
type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<CallResult>>>>;

/// Opens TCP connections to ledger endpoints served by a `LedgerServer`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(5))
    }
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }

    async fn open(
        &self,
        endpoint: &Endpoint,
        service: Service,
    ) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf), TransportError> {
        let connect_err = |reason: String| TransportError::Connect {
            addr: endpoint.addr.clone(),
            reason,
        };
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&endpoint.addr))
            .await
            .map_err(|_| connect_err("connect timed out".to_string()))?
            .map_err(|err| connect_err(err.to_string()))?;
        stream.set_nodelay(true)?;
        let (reader, mut writer) = stream.into_split();
        write_frame(
            &mut writer,
            &ClientFrame::Hello {
                service,
                authority: endpoint.authority().to_string(),
            },
        )
        .await?;
        debug!(endpoint = %endpoint, ?service, "connected");
        Ok((BufReader::new(reader), writer))
    }

    async fn open_endorser(&self, endpoint: &Endpoint) -> Result<TcpEndorser, TransportError> {
        let (reader, writer) = self.open(endpoint, Service::Endorser).await?;
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let reader_task = tokio::spawn(read_responses(reader, pending.clone(), endpoint.clone()));
        Ok(TcpEndorser {
            endpoint: endpoint.clone(),
            writer: tokio::sync::Mutex::new(writer),
            pending,
            next_id: AtomicU64::new(0),
            request_timeout: self.request_timeout,
            reader_task,
        })
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn endorser(&self, endpoint: &Endpoint) -> Result<Arc<dyn EndorserClient>, TransportError> {
        Ok(Arc::new(self.open_endorser(endpoint).await?))
    }

    async fn broadcast(&self, endpoint: &Endpoint) -> Result<BroadcastStream, TransportError> {
        let (reader, writer) = self.open(endpoint, Service::Broadcast).await?;
        Ok(BroadcastStream {
            sink: Box::new(TcpSink { writer }),
            acks: Box::new(TcpAcks { reader }),
        })
    }

    async fn deliver(&self, endpoint: &Endpoint) -> Result<Box<dyn DeliverStream>, TransportError> {
        let (reader, writer) = self.open(endpoint, Service::Deliver).await?;
        Ok(Box::new(TcpDeliver { reader, writer }))
    }
}

fn lock_pending(
    pending: &Mutex<HashMap<u64, oneshot::Sender<CallResult>>>,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<CallResult>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Routes responses to their waiting callers until the connection ends.
/// Outstanding calls observe the dropped sender as a closed connection.
async fn read_responses(mut reader: BufReader<OwnedReadHalf>, pending: PendingCalls, endpoint: Endpoint) {
    loop {
        match read_frame::<_, ServerFrame>(&mut reader).await {
            Ok(Some(ServerFrame::ProposalResponse { id, response })) => {
                if let Some(waiter) = lock_pending(&pending).remove(&id) {
                    let _ = waiter.send(Ok(response));
                }
            }
            Ok(Some(ServerFrame::RpcError { id: Some(id), message })) => {
                if let Some(waiter) = lock_pending(&pending).remove(&id) {
                    let _ = waiter.send(Err(message));
                }
            }
            Ok(Some(ServerFrame::RpcError { id: None, message })) => {
                warn!(endpoint = %endpoint, %message, "endorser connection failed");
                break;
            }
            Ok(Some(_)) => {
                warn!(endpoint = %endpoint, "unexpected frame on endorser connection");
                break;
            }
            Ok(None) => break,
            Err(err) => {
                warn!(endpoint = %endpoint, error = %err, "endorser connection read failed");
                break;
            }
        }
    }
    lock_pending(&pending).clear();
}

/// Owns a call's slot in the pending table and frees it however the call
/// ends, including when the caller's future is dropped mid-flight.
struct PendingCall<'a> {
    pending: &'a PendingCalls,
    id: u64,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        lock_pending(self.pending).remove(&self.id);
    }
}

struct TcpEndorser {
    endpoint: Endpoint,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: PendingCalls,
    next_id: AtomicU64,
    request_timeout: Duration,
    reader_task: JoinHandle<()>,
}

impl Drop for TcpEndorser {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[async_trait]
impl EndorserClient for TcpEndorser {
    async fn process_proposal(
        &self,
        signed: &SignedProposal,
    ) -> Result<Option<ProposalResponse>, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);
        let _call = PendingCall {
            pending: &self.pending,
            id,
        };

        let frame = ClientFrame::Proposal {
            id,
            signed: signed.clone(),
        };
        let written = {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &frame).await
        };
        written?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(message))) => Err(TransportError::Rpc(message)),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout { op: "endorsement" }),
        }
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

struct TcpSink {
    writer: OwnedWriteHalf,
}

#[async_trait]
impl EnvelopeSink for TcpSink {
    async fn send(&mut self, envelope: Envelope) -> Result<(), TransportError> {
        write_frame(&mut self.writer, &ClientFrame::Envelope(envelope)).await
    }
}

struct TcpAcks {
    reader: BufReader<OwnedReadHalf>,
}

#[async_trait]
impl AckSource for TcpAcks {
    async fn recv(&mut self) -> Result<Option<BroadcastResponse>, TransportError> {
        match read_frame::<_, ServerFrame>(&mut self.reader).await? {
            Some(ServerFrame::BroadcastAck(ack)) => Ok(Some(ack)),
            Some(ServerFrame::RpcError { message, .. }) => Err(TransportError::Rpc(message)),
            Some(_) => Err(TransportError::UnexpectedFrame("expected broadcast ack")),
            None => Ok(None),
        }
    }
}

struct TcpDeliver {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

#[async_trait]
impl DeliverStream for TcpDeliver {
    async fn send(&mut self, envelope: Envelope) -> Result<(), TransportError> {
        write_frame(&mut self.writer, &ClientFrame::Envelope(envelope)).await
    }

    async fn recv(&mut self) -> Result<Option<DeliverResponse>, TransportError> {
        match read_frame::<_, ServerFrame>(&mut self.reader).await? {
            Some(ServerFrame::Deliver(response)) => Ok(Some(response)),
            Some(ServerFrame::RpcError { message, .. }) => Err(TransportError::Rpc(message)),
            Some(_) => Err(TransportError::UnexpectedFrame("expected deliver response")),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fabload_codec::{create_proposal, sign_proposal};
    use fabload_core::Endpoint;
    use fabload_crypto::{Identity, Signer, SigningAlgorithm};
    use fabload_transport::{Connector, EndorserClient, TransportError};

    use super::{lock_pending, TcpConnector};

    #[tokio::test]
    async fn connect_to_closed_port_reports_address() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("listener addr");
        drop(listener);

        let connector = TcpConnector::new(Duration::from_secs(1), Duration::from_secs(1));
        let err = connector
            .broadcast(&Endpoint::new(addr.to_string(), ""))
            .await
            .expect_err("closed port must fail");
        match err {
            TransportError::Connect { addr: failed, .. } => assert_eq!(failed, addr.to_string()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn abandoned_calls_release_their_pending_slot() {
        // Accepts the connection but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let endpoint = Endpoint::new(listener.local_addr().expect("listener addr").to_string(), "");
        let connector = TcpConnector::new(Duration::from_secs(1), Duration::from_secs(30));
        let endorser = connector.open_endorser(&endpoint).await.expect("endorser connects");
        let (_socket, _) = listener.accept().await.expect("accept");

        let client = Identity::ephemeral("Org1MSP", SigningAlgorithm::Ecdsa).expect("identity");
        let proposal = create_proposal(client.identity(), "mychannel", "cc", "fn", Vec::new());
        let signed = sign_proposal(&proposal, &client).expect("sign");

        for _ in 0..3 {
            let call = endorser.process_proposal(&signed);
            let outcome = tokio::time::timeout(Duration::from_millis(50), call).await;
            assert!(outcome.is_err(), "silent peer must not answer");
        }
        assert!(lock_pending(&endorser.pending).is_empty());
    }
}
