//! Hash commands. Writes keep the hash's field count and any secondary
//! index entries in the same batch as the field mutation.

use crate::codec;
use crate::command::{Command, HandlerCtx, Reply};
use crate::engine::{Partition, WriteBatch};
use crate::error::KvError;
use crate::index::{table_of, HsetIndex};

fn field_count(ctx: &HandlerCtx<'_>, pk: &[u8], batch: &WriteBatch) -> Result<i64, KvError> {
    match ctx.store.get_in(batch, Partition::Data, &codec::encode_hash_size_key(pk))? {
        Some(raw) if raw.len() == 8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&raw);
            Ok(i64::from_be_bytes(buf))
        }
        Some(_) => Err(KvError::Decode("corrupt hash size".to_string())),
        None => Ok(0),
    }
}

fn set_field_count(pk: &[u8], count: i64, batch: &mut WriteBatch) {
    let key = codec::encode_hash_size_key(pk);
    if count <= 0 {
        batch.delete(Partition::Data, key);
    } else {
        batch.put(Partition::Data, key, count.to_be_bytes().to_vec());
    }
}

fn indexes_for(ctx: &HandlerCtx<'_>, pk: &[u8]) -> Vec<HsetIndex> {
    table_of(pk).map(|table| ctx.indexes.table_indexes(table)).unwrap_or_default()
}

/// Write one field and its index entries. Returns true when the field is new.
fn put_field(
    ctx: &HandlerCtx<'_>,
    indexes: &[HsetIndex],
    pk: &[u8],
    field: &[u8],
    value: &[u8],
    batch: &mut WriteBatch,
) -> Result<bool, KvError> {
    let key = codec::encode_hash_field_key(pk, field);
    let old = ctx.store.get_in(batch, Partition::Data, &key)?;
    for def in indexes.iter().filter(|d| d.index_field.as_bytes() == field) {
        if let Some(old) = &old {
            ctx.indexes.remove_index_record(pk, &def.index_field, old, batch)?;
        }
        ctx.indexes.add_index_record(pk, &def.index_field, value, batch)?;
    }
    batch.put(Partition::Data, key, value.to_vec());
    Ok(old.is_none())
}

/// Delete one field and its index entries. Returns true when it existed.
fn delete_field(
    ctx: &HandlerCtx<'_>,
    indexes: &[HsetIndex],
    pk: &[u8],
    field: &[u8],
    batch: &mut WriteBatch,
) -> Result<bool, KvError> {
    let key = codec::encode_hash_field_key(pk, field);
    let Some(old) = ctx.store.get_in(batch, Partition::Data, &key)? else {
        return Ok(false);
    };
    for def in indexes.iter().filter(|d| d.index_field.as_bytes() == field) {
        ctx.indexes.remove_index_record(pk, &def.index_field, &old, batch)?;
    }
    batch.delete(Partition::Data, key);
    Ok(true)
}

fn fields(ctx: &HandlerCtx<'_>, pk: &[u8], batch: &WriteBatch) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError> {
    let pairs = ctx
        .store
        .prefix_in(batch, Partition::Data, &codec::hash_field_prefix(pk))?;
    let mut out = Vec::with_capacity(pairs.len());
    for (key, value) in pairs {
        let (_, field) = codec::decode_hash_field_key(&key)?;
        out.push((field, value));
    }
    Ok(out)
}

pub fn hset(ctx: &HandlerCtx<'_>, cmd: &Command, batch: &mut WriteBatch) -> Result<Reply, KvError> {
    if cmd.args.len() != 3 {
        return Err(KvError::wrong_args(&cmd.name));
    }
    let pk = cmd.pk();
    let indexes = indexes_for(ctx, pk);
    let created = put_field(ctx, &indexes, pk, &cmd.args[1], &cmd.args[2], batch)?;
    if created {
        set_field_count(pk, field_count(ctx, pk, batch)? + 1, batch);
    }
    Ok(Reply::Int(i64::from(created)))
}

pub fn hmset(ctx: &HandlerCtx<'_>, cmd: &Command, batch: &mut WriteBatch) -> Result<Reply, KvError> {
    if cmd.args.len() % 2 != 1 {
        return Err(KvError::wrong_args(&cmd.name));
    }
    let pk = cmd.pk();
    let indexes = indexes_for(ctx, pk);
    let mut created = 0;
    for pair in cmd.args[1..].chunks(2) {
        if put_field(ctx, &indexes, pk, &pair[0], &pair[1], batch)? {
            created += 1;
        }
    }
    if created > 0 {
        set_field_count(pk, field_count(ctx, pk, batch)? + created, batch);
    }
    Ok(Reply::ok())
}

pub fn hdel(ctx: &HandlerCtx<'_>, cmd: &Command, batch: &mut WriteBatch) -> Result<Reply, KvError> {
    let pk = cmd.pk();
    let indexes = indexes_for(ctx, pk);
    let mut removed = 0;
    for field in &cmd.args[1..] {
        if delete_field(ctx, &indexes, pk, field, batch)? {
            removed += 1;
        }
    }
    if removed > 0 {
        set_field_count(pk, field_count(ctx, pk, batch)? - removed, batch);
    }
    Ok(Reply::Int(removed))
}

pub fn hincrby(ctx: &HandlerCtx<'_>, cmd: &Command, batch: &mut WriteBatch) -> Result<Reply, KvError> {
    if cmd.args.len() != 3 {
        return Err(KvError::wrong_args(&cmd.name));
    }
    let pk = cmd.pk();
    let delta = cmd.arg_i64(2)?;
    let key = codec::encode_hash_field_key(pk, &cmd.args[1]);
    let current = match ctx.store.get_in(batch, Partition::Data, &key)? {
        Some(raw) => std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| KvError::WrongType("hash value is not an integer".to_string()))?,
        None => 0,
    };
    let next = current
        .checked_add(delta)
        .ok_or_else(|| KvError::WrongType("increment or decrement would overflow".to_string()))?;
    let indexes = indexes_for(ctx, pk);
    if put_field(ctx, &indexes, pk, &cmd.args[1], next.to_string().as_bytes(), batch)? {
        set_field_count(pk, field_count(ctx, pk, batch)? + 1, batch);
    }
    Ok(Reply::Int(next))
}

pub fn hclear(ctx: &HandlerCtx<'_>, cmd: &Command, batch: &mut WriteBatch) -> Result<Reply, KvError> {
    let pk = cmd.pk();
    let indexes = indexes_for(ctx, pk);
    let existing = fields(ctx, pk, batch)?;
    for (field, _) in &existing {
        delete_field(ctx, &indexes, pk, field, batch)?;
    }
    set_field_count(pk, 0, batch);
    Ok(Reply::Int(i64::from(!existing.is_empty())))
}

pub fn hget(ctx: &HandlerCtx<'_>, cmd: &Command, batch: &mut WriteBatch) -> Result<Reply, KvError> {
    let key = codec::encode_hash_field_key(cmd.pk(), &cmd.args[1]);
    Ok(Reply::optional(ctx.store.get_in(batch, Partition::Data, &key)?))
}

pub fn hmget(ctx: &HandlerCtx<'_>, cmd: &Command, batch: &mut WriteBatch) -> Result<Reply, KvError> {
    let pk = cmd.pk();
    let mut out = Vec::with_capacity(cmd.args.len() - 1);
    for field in &cmd.args[1..] {
        let key = codec::encode_hash_field_key(pk, field);
        out.push(Reply::optional(ctx.store.get_in(batch, Partition::Data, &key)?));
    }
    Ok(Reply::Array(out))
}

pub fn hgetall(ctx: &HandlerCtx<'_>, cmd: &Command, batch: &mut WriteBatch) -> Result<Reply, KvError> {
    let mut out = Vec::new();
    for (field, value) in fields(ctx, cmd.pk(), batch)? {
        out.push(Reply::Bulk(field));
        out.push(Reply::Bulk(value));
    }
    Ok(Reply::Array(out))
}

pub fn hkeys(ctx: &HandlerCtx<'_>, cmd: &Command, batch: &mut WriteBatch) -> Result<Reply, KvError> {
    let keys = fields(ctx, cmd.pk(), batch)?
        .into_iter()
        .map(|(field, _)| Reply::Bulk(field))
        .collect();
    Ok(Reply::Array(keys))
}

pub fn hvals(ctx: &HandlerCtx<'_>, cmd: &Command, batch: &mut WriteBatch) -> Result<Reply, KvError> {
    let values = fields(ctx, cmd.pk(), batch)?
        .into_iter()
        .map(|(_, value)| Reply::Bulk(value))
        .collect();
    Ok(Reply::Array(values))
}

pub fn hlen(ctx: &HandlerCtx<'_>, cmd: &Command, batch: &mut WriteBatch) -> Result<Reply, KvError> {
    Ok(Reply::Int(field_count(ctx, cmd.pk(), batch)?))
}

pub fn hexists(ctx: &HandlerCtx<'_>, cmd: &Command, batch: &mut WriteBatch) -> Result<Reply, KvError> {
    let key = codec::encode_hash_field_key(cmd.pk(), &cmd.args[1]);
    let exists = ctx.store.get_in(batch, Partition::Data, &key)?.is_some();
    Ok(Reply::Int(i64::from(exists)))
}
