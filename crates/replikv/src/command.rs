//! Command payloads and the handler table.

use std::collections::HashMap;

use crate::codec::{self, read_u32};
use crate::engine::{KvStore, Partition, WriteBatch};
use crate::error::KvError;
use crate::index::IndexManager;
use crate::{geo, hash};

const CMD_ARGS: u8 = 1;

/// A decoded command. `args[0]` is the primary key for every keyed command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<Vec<u8>>,
}

impl Command {
    pub fn new(name: &str, args: Vec<Vec<u8>>) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            args,
        }
    }

    pub fn pk(&self) -> &[u8] {
        self.args.first().map(Vec::as_slice).unwrap_or_default()
    }

    pub fn arg_str(&self, idx: usize) -> Result<&str, KvError> {
        let raw = self.args.get(idx).ok_or_else(|| KvError::wrong_args(&self.name))?;
        std::str::from_utf8(raw)
            .map_err(|_| KvError::InvalidCommand(format!("argument {idx} of '{}' is not utf-8", self.name)))
    }

    pub fn arg_f64(&self, idx: usize) -> Result<f64, KvError> {
        let raw = self.arg_str(idx)?;
        raw.parse::<f64>()
            .map_err(|_| KvError::InvalidCommand(format!("value is not a valid float: {raw}")))
    }

    pub fn arg_i64(&self, idx: usize) -> Result<i64, KvError> {
        let raw = self.arg_str(idx)?;
        raw.parse::<i64>()
            .map_err(|_| KvError::InvalidCommand(format!("value is not an integer or out of range: {raw}")))
    }
}

pub fn encode_command(cmd: &Command) -> Vec<u8> {
    let mut size = 1 + 4 + 4 + cmd.name.len();
    for arg in &cmd.args {
        size += 4 + arg.len();
    }
    let mut out = Vec::with_capacity(size);
    out.push(CMD_ARGS);
    out.extend_from_slice(&((cmd.args.len() + 1) as u32).to_be_bytes());
    out.extend_from_slice(&(cmd.name.len() as u32).to_be_bytes());
    out.extend_from_slice(cmd.name.as_bytes());
    for arg in &cmd.args {
        out.extend_from_slice(&(arg.len() as u32).to_be_bytes());
        out.extend_from_slice(arg);
    }
    out
}

pub fn decode_command(data: &[u8]) -> anyhow::Result<Command> {
    anyhow::ensure!(!data.is_empty(), "empty command");
    anyhow::ensure!(data[0] == CMD_ARGS, "unknown command tag {}", data[0]);
    let mut offset = 1usize;
    let count = read_u32(data, &mut offset)? as usize;
    anyhow::ensure!(count > 0, "command without a name");
    let mut parts = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let len = read_u32(data, &mut offset)? as usize;
        anyhow::ensure!(offset + len <= data.len(), "short command argument");
        parts.push(data[offset..offset + len].to_vec());
        offset += len;
    }
    anyhow::ensure!(offset == data.len(), "trailing bytes after command");
    let name = String::from_utf8(parts.remove(0))?;
    Ok(Command::new(&name, parts))
}

#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Status(String),
    Int(i64),
    Bulk(Vec<u8>),
    Nil,
    Array(Vec<Reply>),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Status("OK".to_string())
    }

    pub fn bulk(value: impl Into<Vec<u8>>) -> Self {
        Reply::Bulk(value.into())
    }

    pub fn optional(value: Option<Vec<u8>>) -> Self {
        value.map_or(Reply::Nil, Reply::Bulk)
    }
}

pub struct HandlerCtx<'a> {
    pub store: &'a KvStore,
    pub indexes: &'a IndexManager,
}

pub type Handler = fn(&HandlerCtx<'_>, &Command, &mut WriteBatch) -> Result<Reply, KvError>;

#[derive(Clone, Copy)]
pub struct CommandSpec {
    pub handler: Handler,
    pub write: bool,
    /// Can share a physical transaction with other writes.
    pub batchable: bool,
    /// Minimum argument count, key included.
    pub min_args: usize,
}

impl CommandSpec {
    fn read(handler: Handler, min_args: usize) -> Self {
        Self {
            handler,
            write: false,
            batchable: false,
            min_args,
        }
    }

    fn write(handler: Handler, min_args: usize, batchable: bool) -> Self {
        Self {
            handler,
            write: true,
            batchable,
            min_args,
        }
    }
}

pub struct CommandRouter {
    table: HashMap<&'static str, CommandSpec>,
}

impl Default for CommandRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRouter {
    pub fn new() -> Self {
        let mut table = HashMap::new();
        table.insert("get", CommandSpec::read(string_get, 1));
        table.insert("set", CommandSpec::write(string_set, 2, true));
        table.insert("del", CommandSpec::write(string_del, 1, true));

        table.insert("hget", CommandSpec::read(hash::hget, 2));
        table.insert("hmget", CommandSpec::read(hash::hmget, 2));
        table.insert("hgetall", CommandSpec::read(hash::hgetall, 1));
        table.insert("hkeys", CommandSpec::read(hash::hkeys, 1));
        table.insert("hvals", CommandSpec::read(hash::hvals, 1));
        table.insert("hlen", CommandSpec::read(hash::hlen, 1));
        table.insert("hexists", CommandSpec::read(hash::hexists, 2));
        table.insert("hset", CommandSpec::write(hash::hset, 3, true));
        table.insert("hmset", CommandSpec::write(hash::hmset, 3, true));
        table.insert("hdel", CommandSpec::write(hash::hdel, 2, true));
        table.insert("hincrby", CommandSpec::write(hash::hincrby, 3, true));
        table.insert("hclear", CommandSpec::write(hash::hclear, 1, false));

        table.insert("geoadd", CommandSpec::write(geo::geoadd, 4, true));
        table.insert("geohash", CommandSpec::read(geo::geohash, 1));
        table.insert("geopos", CommandSpec::read(geo::geopos, 1));
        table.insert("geodist", CommandSpec::read(geo::geodist, 3));
        table.insert("georadius", CommandSpec::read(geo::georadius, 5));
        table.insert("georadiusbymember", CommandSpec::read(geo::georadiusbymember, 4));
        Self { table }
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.table.get(name)
    }

    pub fn is_batchable_write(&self, name: &str) -> bool {
        self.table.get(name).is_some_and(|spec| spec.write && spec.batchable)
    }

    pub fn is_write(&self, name: &str) -> bool {
        self.table.get(name).is_some_and(|spec| spec.write)
    }

    /// Validate arity and run the handler against `batch`.
    pub fn dispatch(&self, ctx: &HandlerCtx<'_>, cmd: &Command, batch: &mut WriteBatch) -> Result<Reply, KvError> {
        let spec = self
            .get(&cmd.name)
            .ok_or_else(|| KvError::InvalidCommand(format!("unknown command '{}'", cmd.name)))?;
        if cmd.args.len() < spec.min_args || cmd.pk().is_empty() {
            return Err(KvError::wrong_args(&cmd.name));
        }
        (spec.handler)(ctx, cmd, batch)
    }
}

fn string_get(ctx: &HandlerCtx<'_>, cmd: &Command, batch: &mut WriteBatch) -> Result<Reply, KvError> {
    let key = codec::encode_string_key(cmd.pk());
    Ok(Reply::optional(ctx.store.get_in(batch, Partition::Data, &key)?))
}

fn string_set(_ctx: &HandlerCtx<'_>, cmd: &Command, batch: &mut WriteBatch) -> Result<Reply, KvError> {
    if cmd.args.len() != 2 {
        return Err(KvError::wrong_args(&cmd.name));
    }
    batch.put(Partition::Data, codec::encode_string_key(cmd.pk()), cmd.args[1].clone());
    Ok(Reply::ok())
}

fn string_del(ctx: &HandlerCtx<'_>, cmd: &Command, batch: &mut WriteBatch) -> Result<Reply, KvError> {
    let key = codec::encode_string_key(cmd.pk());
    let existed = ctx.store.get_in(batch, Partition::Data, &key)?.is_some();
    if existed {
        batch.delete(Partition::Data, key);
    }
    Ok(Reply::Int(i64::from(existed)))
}
