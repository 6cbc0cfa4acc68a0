//! # tcp transport
//!
//! why: carry raft rpc between processes
//! relations: client side implements Transport for node.rs, serve() feeds inbound frames to NodeHandle
//! what: newline-delimited json framing, TcpTransport with one persistent connection per peer, serve loop

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use raft_core::{
    AppendEntriesArgs, AppendEntriesReply, NodeId, RaftMessage, RequestVoteArgs, RequestVoteReply,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Transport, TransportError};
use crate::node::{wait_shutdown, NodeHandle};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Longest frame accepted from a peer, newline included
const MAX_FRAME_BYTES: u64 = 8 * 1024 * 1024;

/// Reply frame: the peer's answer or the reason it refused
type WireReply = Result<RaftMessage, String>;

pub(crate) async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    read_frame_capped(reader, MAX_FRAME_BYTES).await
}

async fn read_frame_capped<R, T>(reader: &mut R, limit: u64) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = (&mut *reader).take(limit).read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }
        if bytes as u64 >= limit && !line.ends_with('\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {limit} bytes"),
            ));
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub(crate) async fn write_frame<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn exchange(&mut self, request: &RaftMessage) -> Result<RaftMessage, TransportError> {
        write_frame(&mut self.writer, request).await?;
        let reply: WireReply = read_frame(&mut self.reader)
            .await?
            .ok_or(TransportError::Io("connection closed by peer".into()))?;
        reply.map_err(TransportError::Remote)
    }
}

struct PeerLink {
    addr: SocketAddr,
    conn: Mutex<Option<Connection>>,
}

/// Client side of the tcp transport.
///
/// Requests to one peer are serialized over a single connection. A
/// connection is taken out of its slot for the duration of an exchange, so
/// an exchange abandoned by a timeout never leaves a half-read stream behind;
/// the next call simply dials again.
pub struct TcpTransport {
    peers: HashMap<NodeId, PeerLink>,
}

impl TcpTransport {
    pub fn new(peers: impl IntoIterator<Item = (NodeId, SocketAddr)>) -> Self {
        let peers = peers
            .into_iter()
            .map(|(id, addr)| {
                (
                    id,
                    PeerLink {
                        addr,
                        conn: Mutex::new(None),
                    },
                )
            })
            .collect();
        Self { peers }
    }

    async fn call(
        &self,
        peer: NodeId,
        request: RaftMessage,
    ) -> Result<RaftMessage, TransportError> {
        let link = self
            .peers
            .get(&peer)
            .ok_or(TransportError::Unreachable(peer))?;
        let mut slot = link.conn.lock().await;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => Connection::open(link.addr).await.map_err(|err| {
                debug!(peer, addr = %link.addr, error = %err, "dial failed");
                TransportError::Unreachable(peer)
            })?,
        };
        let reply = conn.exchange(&request).await?;
        *slot = Some(conn);
        Ok(reply)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send_request_vote(
        &self,
        peer: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, TransportError> {
        match self.call(peer, RaftMessage::VoteRequest(args)).await? {
            RaftMessage::VoteResponse(reply) => Ok(reply),
            other => Err(TransportError::Codec(format!("expected vote response, got {other:?}"))),
        }
    }

    async fn send_append_entries(
        &self,
        peer: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError> {
        match self.call(peer, RaftMessage::AppendEntries(args)).await? {
            RaftMessage::AppendEntriesResponse(reply) => Ok(reply),
            other => Err(TransportError::Codec(format!(
                "expected append entries response, got {other:?}"
            ))),
        }
    }
}

/// Accept peer connections and answer their rpc until the node shuts down
pub async fn serve(listener: TcpListener, node: NodeHandle) -> io::Result<()> {
    let mut shutdown = node.shutdown_signal();
    info!(node = node.id(), addr = %listener.local_addr()?, "accepting peer connections");
    loop {
        tokio::select! {
            _ = wait_shutdown(&mut shutdown) => return Ok(()),
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                let node = node.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, node).await {
                        debug!(%addr, error = %err, "peer connection closed");
                    }
                });
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, node: NodeHandle) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut shutdown = node.shutdown_signal();
    loop {
        let request: RaftMessage = tokio::select! {
            _ = wait_shutdown(&mut shutdown) => return Ok(()),
            frame = read_frame(&mut reader) => match frame? {
                Some(request) => request,
                None => return Ok(()),
            },
        };
        let reply: WireReply = node.handle_message(request).map_err(|err| {
            debug!(node = node.id(), error = %err, "refusing peer request");
            err.to_string()
        });
        write_frame(&mut writer, &reply).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_survive_a_stream() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);
        let reply: WireReply =
            Ok(RaftMessage::AppendEntriesResponse(AppendEntriesReply::rejected(7)));

        write_frame(&mut writer, &reply).await.unwrap();
        let parsed: WireReply = read_frame(&mut reader).await.unwrap().unwrap();

        assert_eq!(parsed, reply);
    }

    #[tokio::test]
    async fn garbage_frame_is_invalid_data() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);
        writer.write_all(b"\n{not json}\n").await.unwrap();

        let err = read_frame::<_, RaftMessage>(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(matches!(TransportError::from(err), TransportError::Codec(_)));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);
        writer.write_all(&[b'x'; 100]).await.unwrap();
        writer.write_all(b"\n").await.unwrap();

        let err = read_frame_capped::<_, RaftMessage>(&mut reader, 64).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(matches!(TransportError::from(err), TransportError::Codec(_)));
    }

    #[tokio::test]
    async fn frame_at_the_limit_is_accepted() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);
        let reply: WireReply = Err("busy".into());
        let mut encoded = serde_json::to_vec(&reply).unwrap();
        encoded.push(b'\n');
        writer.write_all(&encoded).await.unwrap();

        let parsed: WireReply = read_frame_capped(&mut reader, encoded.len() as u64)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parsed, reply);
    }

    #[tokio::test]
    async fn closed_stream_reads_as_none() {
        let (writer, reader) = tokio::io::duplex(64);
        drop(writer);
        let mut reader = tokio::io::BufReader::new(reader);
        assert!(read_frame::<_, RaftMessage>(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_peer_is_unreachable() {
        let transport = TcpTransport::new(Vec::new());
        let err = transport
            .send_append_entries(
                9,
                AppendEntriesArgs {
                    term: 1,
                    leader_id: 1,
                    prev_log_index: 0,
                    prev_log_term: 0,
                    entries: vec![],
                    leader_commit: 0,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Unreachable(9));
    }
}
