use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::join_all;
use futures_util::{FutureExt, SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use crate::command::Reply;
use crate::error::KvError;
use crate::node::Node;
use crate::read_env_usize;

const MAX_PIPELINED_WRITES: usize = 64;

pub async fn run(addr: SocketAddr, node: Arc<Node>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    loop {
        let (socket, _) = listener.accept().await?;
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, node).await {
                tracing::debug!(error = ?err, "redis connection closed");
            }
        });
    }
}

async fn handle_conn(socket: TcpStream, node: Arc<Node>) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, Resp2::default());
    let max_pipelined = read_env_usize("REPLIKV_REDIS_WRITE_BATCH_MAX", MAX_PIPELINED_WRITES).max(1);

    async fn feed_resp(framed: &mut Framed<TcpStream, Resp2>, resp: BytesFrame) -> anyhow::Result<()> {
        framed.feed(resp).await?;
        Ok(())
    }

    async fn flush_resp(framed: &mut Framed<TcpStream, Resp2>) -> anyhow::Result<()> {
        <Framed<TcpStream, Resp2> as SinkExt<BytesFrame>>::flush(framed).await?;
        Ok(())
    }

    let mut pending_cmd: Option<Vec<Vec<u8>>> = None;
    let mut pending_resp: Option<BytesFrame> = None;
    let mut stream_closed = false;

    while !stream_closed || pending_cmd.is_some() || pending_resp.is_some() {
        if let Some(resp) = pending_resp.take() {
            feed_resp(&mut framed, resp).await?;
            flush_resp(&mut framed).await?;
            continue;
        }

        let parts = if let Some(parts) = pending_cmd.take() {
            parts
        } else {
            let Some(frame) = framed.next().await else {
                stream_closed = true;
                continue;
            };
            match parse_command(frame?) {
                Ok(Some(parts)) => parts,
                Ok(None) => continue,
                Err(err) => {
                    feed_resp(&mut framed, BytesFrame::Error(format!("ERR {err}").into())).await?;
                    flush_resp(&mut framed).await?;
                    continue;
                }
            }
        };

        if !node.is_write(&parts) {
            let resp = reply_frame(node.execute(parts).await);
            feed_resp(&mut framed, resp).await?;
            flush_resp(&mut framed).await?;
            continue;
        }

        // Writes already sitting in the read buffer are proposed together so
        // they can land in one batch. Reads break the run to keep
        // read-your-writes ordering on the connection.
        let mut writes = vec![parts];
        while writes.len() < max_pipelined && !stream_closed {
            match framed.next().now_or_never() {
                Some(Some(Ok(frame))) => match parse_command(frame) {
                    Ok(Some(parts)) if node.is_write(&parts) => writes.push(parts),
                    Ok(Some(other)) => {
                        pending_cmd = Some(other);
                        break;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        pending_resp = Some(BytesFrame::Error(format!("ERR {err}").into()));
                        break;
                    }
                },
                Some(Some(Err(err))) => anyhow::bail!("failed to read RESP frame: {err}"),
                Some(None) => {
                    stream_closed = true;
                    break;
                }
                None => break,
            }
        }

        let results = join_all(writes.into_iter().map(|parts| node.execute(parts))).await;
        for result in results {
            feed_resp(&mut framed, reply_frame(result)).await?;
        }
        flush_resp(&mut framed).await?;
    }

    flush_resp(&mut framed).await?;
    Ok(())
}

fn parse_command(frame: BytesFrame) -> anyhow::Result<Option<Vec<Vec<u8>>>> {
    let BytesFrame::Array(frames) = frame else {
        anyhow::bail!("expected array frame");
    };
    if frames.is_empty() {
        return Ok(None);
    }
    let parts = frames
        .iter()
        .map(frame_bytes)
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| anyhow::anyhow!("command arguments must be strings"))?;
    Ok(Some(parts))
}

fn frame_bytes(frame: &BytesFrame) -> Option<Vec<u8>> {
    match frame {
        BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => Some(b.to_vec()),
        _ => None,
    }
}

fn reply_frame(result: Result<Reply, KvError>) -> BytesFrame {
    match result {
        Ok(reply) => to_frame(reply),
        Err(err) => BytesFrame::Error(format!("ERR {err}").into()),
    }
}

fn to_frame(reply: Reply) -> BytesFrame {
    match reply {
        Reply::Status(s) => BytesFrame::SimpleString(Bytes::from(s.into_bytes())),
        Reply::Int(n) => BytesFrame::Integer(n),
        Reply::Bulk(b) => BytesFrame::BulkString(Bytes::from(b)),
        Reply::Nil => BytesFrame::Null,
        Reply::Array(items) => BytesFrame::Array(items.into_iter().map(to_frame).collect()),
    }
}
