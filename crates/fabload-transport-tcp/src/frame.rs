use fabload_codec::{
    decode, encode, BroadcastResponse, DeliverResponse, Envelope, ProposalResponse, SignedProposal,
};
use fabload_transport::TransportError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Service {
    Endorser,
    Broadcast,
    Deliver,
}

/// Frames sent by the benchmarking client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// First frame on every connection.
    Hello { service: Service, authority: String },
    Proposal { id: u64, signed: SignedProposal },
    Envelope(Envelope),
}

/// Frames sent by the ledger side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    ProposalResponse {
        id: u64,
        response: Option<ProposalResponse>,
    },
    /// Call-level failure when `id` is set, stream-level otherwise.
    RpcError { id: Option<u64>, message: String },
    BroadcastAck(BroadcastResponse),
    Deliver(DeliverResponse),
}

/// Writes one `u32` big-endian length prefix followed by the CBOR body.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = encode(frame)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_LEN,
        });
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. Returns `Ok(None)` when the peer closed the connection
/// before the next length prefix.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, TransportError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut prefix = [0_u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    let mut body = vec![0_u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(decode(&body)?))
}
