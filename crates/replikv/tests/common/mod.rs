//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use clap::Parser;
use replikv::NodeArgs;
use tokio::sync::oneshot;

/// Timeout for node startup and command round-trips.
pub const IO_TIMEOUT: Duration = Duration::from_secs(20);
/// Timeout for individual RESP read/write operations.
pub const RESP_TIMEOUT: Duration = Duration::from_secs(10);

/// Parsed RESP2 reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resp {
    Simple(String),
    Error(String),
    Int(i64),
    Bulk(Option<Vec<u8>>),
    Array(Vec<Resp>),
}

impl Resp {
    pub fn text(&self) -> String {
        match self {
            Resp::Simple(s) | Resp::Error(s) => s.clone(),
            Resp::Bulk(Some(b)) => String::from_utf8_lossy(b).into_owned(),
            Resp::Int(n) => n.to_string(),
            other => panic!("no text in {other:?}"),
        }
    }

    pub fn items(&self) -> &[Resp] {
        match self {
            Resp::Array(items) => items,
            other => panic!("expected array, got {other:?}"),
        }
    }

    pub fn bulk(s: &str) -> Self {
        Resp::Bulk(Some(s.as_bytes().to_vec()))
    }

    pub fn ok() -> Self {
        Resp::Simple("OK".to_string())
    }
}

/// A node running in-process on its own runtime thread.
pub struct TestNode {
    pub redis_addr: SocketAddr,
    pub snapshot_addr: SocketAddr,
    data_dir: PathBuf,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<anyhow::Result<()>>>,
}

impl TestNode {
    /// Start a node serving `namespaces` out of `data_dir`. `peers` are the
    /// snapshot-service addresses of the other nodes.
    pub fn start(node_id: u64, data_dir: &Path, namespaces: &str, peers: &[SocketAddr]) -> Self {
        let redis_addr = free_addr();
        let snapshot_addr = free_addr();
        let peers = peers.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(",");
        let mut argv = vec![
            "node".to_string(),
            "--node-id".to_string(),
            node_id.to_string(),
            "--redis-addr".to_string(),
            redis_addr.to_string(),
            "--snapshot-addr".to_string(),
            snapshot_addr.to_string(),
            "--data-dir".to_string(),
            data_dir.display().to_string(),
            "--namespaces".to_string(),
            namespaces.to_string(),
        ];
        if !peers.is_empty() {
            argv.push("--peers".to_string());
            argv.push(peers);
        }
        let args = NodeArgs::parse_from(argv);

        let (tx, rx) = oneshot::channel::<()>();
        let thread = std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(replikv::run_node_with_shutdown(args, async move {
                let _ = rx.await;
                Ok(())
            }))
        });

        let node = Self {
            redis_addr,
            snapshot_addr,
            data_dir: data_dir.to_path_buf(),
            shutdown: Some(tx),
            thread: Some(thread),
        };
        assert!(
            wait_for_redis_ready(redis_addr, IO_TIMEOUT),
            "node {node_id} did not answer PING"
        );
        node
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn connect(&self) -> RespConn {
        RespConn::connect(self.redis_addr)
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Pick an available local address by binding to port 0.
pub fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local addr")
}

/// Wait for the Redis port to answer a PING.
pub fn wait_for_redis_ready(addr: SocketAddr, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if let Ok(stream) = TcpStream::connect(addr) {
            let mut conn = RespConn::from_stream(stream);
            if let Ok(Resp::Simple(pong)) = conn.try_command(&["PING"]) {
                if pong == "PONG" {
                    return true;
                }
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

/// Poll `check` until it returns true or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

/// Value of `field` in an `INFO` reply, first occurrence.
pub fn info_field(info: &str, field: &str) -> Option<u64> {
    info.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        (name == field).then(|| value.trim().parse().ok()).flatten()
    })
}

/// RESP connection wrapper that preserves buffered reads between commands.
pub struct RespConn {
    reader: BufReader<TcpStream>,
}

impl RespConn {
    /// Connect to the Redis port with read/write timeouts.
    pub fn connect(addr: SocketAddr) -> Self {
        Self::from_stream(TcpStream::connect(addr).expect("connect redis"))
    }

    fn from_stream(stream: TcpStream) -> Self {
        stream.set_read_timeout(Some(RESP_TIMEOUT)).ok();
        stream.set_write_timeout(Some(RESP_TIMEOUT)).ok();
        Self {
            reader: BufReader::new(stream),
        }
    }

    pub fn command(&mut self, parts: &[&str]) -> Resp {
        self.try_command(parts)
            .unwrap_or_else(|err| panic!("{parts:?} failed: {err}"))
    }

    pub fn try_command(&mut self, parts: &[&str]) -> std::io::Result<Resp> {
        self.write_commands(&[parts])?;
        read_resp(&mut self.reader)
    }

    /// Write every command before reading any reply.
    pub fn pipeline(&mut self, cmds: &[&[&str]]) -> Vec<Resp> {
        self.write_commands(cmds).expect("write pipeline");
        cmds.iter()
            .map(|_| read_resp(&mut self.reader).expect("read pipelined reply"))
            .collect()
    }

    fn write_commands(&mut self, cmds: &[&[&str]]) -> std::io::Result<()> {
        let mut buf = Vec::new();
        for parts in cmds {
            buf.extend_from_slice(format!("*{}\r\n", parts.len()).as_bytes());
            for part in *parts {
                buf.extend_from_slice(format!("${}\r\n", part.len()).as_bytes());
                buf.extend_from_slice(part.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
        }
        let stream = self.reader.get_mut();
        stream.write_all(&buf)?;
        stream.flush()
    }
}

fn read_line(reader: &mut BufReader<TcpStream>) -> std::io::Result<String> {
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line)? == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "stream closed",
        ));
    }
    let text = String::from_utf8_lossy(&line);
    Ok(text.trim_end_matches(['\r', '\n']).to_string())
}

fn parse_len(line: &str) -> std::io::Result<i64> {
    line.parse::<i64>().map_err(|err| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, format!("bad length {line:?}: {err}"))
    })
}

fn read_resp(reader: &mut BufReader<TcpStream>) -> std::io::Result<Resp> {
    let mut first = [0u8; 1];
    reader.read_exact(&mut first)?;
    let line = read_line(reader)?;
    match first[0] {
        b'+' => Ok(Resp::Simple(line)),
        b'-' => Ok(Resp::Error(line)),
        b':' => Ok(Resp::Int(parse_len(&line)?)),
        b'$' => {
            let len = parse_len(&line)?;
            if len < 0 {
                return Ok(Resp::Bulk(None));
            }
            let mut data = vec![0u8; len as usize + 2];
            reader.read_exact(&mut data)?;
            data.truncate(len as usize);
            Ok(Resp::Bulk(Some(data)))
        }
        b'*' => {
            let len = parse_len(&line)?;
            if len < 0 {
                return Ok(Resp::Bulk(None));
            }
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                items.push(read_resp(reader)?);
            }
            Ok(Resp::Array(items))
        }
        other => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected resp prefix {other}"),
        )),
    }
}
