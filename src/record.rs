// Copyright 2024 The Reftable Authors.
// Licensed under the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT> or the Apache
// License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed except according to those terms.

//! Polymorphic record kinds: ref, object-index, internal-index and log.
//!
//! Every kind shares the same block-entry shape (`key`, a 3-bit
//! `value_type`, and a `value` payload) but encodes/decodes its payload
//! differently. Dispatch is a plain match over a tagged enum rather than a
//! vtable, so the compiler checks every kind is handled everywhere.

use crate::error::{Error, Result};
use crate::varint::{
	get_u64, get_uvarint, get_varint_zigzag, put_u64, put_uvarint, put_varint_zigzag,
};

/// Values a ref record's `value_kind` (the entry's `value_type` bits) can
/// take.
pub const VALUE_DELETION: u8 = 0;
pub const VALUE_DIRECT: u8 = 1;
pub const VALUE_SYMBOLIC: u8 = 2;
pub const VALUE_PEELED: u8 = 3;

/// Parameters needed to encode/decode a record's value payload that are not
/// part of the record itself: the caller-defined digest width and the
/// table's `min_update_index` (ref/log update indices are delta-encoded
/// against it).
#[derive(Clone, Copy)]
pub struct RecordContext {
	pub hash_size: usize,
	pub min_update_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefValue {
	Deletion,
	Direct(Vec<u8>),
	Symbolic(String),
	Peeled { value: Vec<u8>, peeled: Vec<u8> },
}

impl RefValue {
	fn value_type(&self) -> u8 {
		match self {
			RefValue::Deletion => VALUE_DELETION,
			RefValue::Direct(_) => VALUE_DIRECT,
			RefValue::Symbolic(_) => VALUE_SYMBOLIC,
			RefValue::Peeled { .. } => VALUE_PEELED,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefRecord {
	pub ref_name: String,
	pub update_index: u64,
	pub value: RefValue,
}

impl RefRecord {
	pub fn is_tombstone(&self) -> bool {
		matches!(self.value, RefValue::Deletion)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjRecord {
	/// Truncated to the table's `object_id_len`.
	pub digest: Vec<u8>,
	pub offsets: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
	pub last_key: Vec<u8>,
	pub block_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
	pub ref_name: String,
	pub update_index: u64,
	pub old: Vec<u8>,
	pub new: Vec<u8>,
	pub name: String,
	pub email: String,
	pub time: u64,
	pub tz: i16,
	pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
	Ref(RefRecord),
	Obj(ObjRecord),
	Index(IndexRecord),
	Log(LogRecord),
}

impl Record {
	/// The primary key, compared lexicographically as raw bytes.
	pub fn key(&self) -> Vec<u8> {
		match self {
			Record::Ref(r) => r.ref_name.as_bytes().to_vec(),
			Record::Obj(r) => r.digest.clone(),
			Record::Index(r) => r.last_key.clone(),
			Record::Log(r) => log_key(&r.ref_name, r.update_index),
		}
	}

	/// The 3-bit tag carried alongside `suffix_len` in the entry header.
	/// Only ref records use more than one value; everything else is 0.
	pub fn value_type(&self) -> u8 {
		match self {
			Record::Ref(r) => r.value.value_type(),
			_ => 0,
		}
	}

	pub fn encode_value(&self, ctx: &RecordContext, out: &mut Vec<u8>) -> Result<()> {
		match self {
			Record::Ref(r) => encode_ref_value(r, ctx, out),
			Record::Obj(r) => encode_obj_value(r, out),
			Record::Index(r) => {
				put_uvarint(out, r.block_offset);
				Ok(())
			}
			Record::Log(r) => encode_log_value(r, ctx, out),
		}
	}

	/// Decodes a record given the section's block type, the entry's
	/// `value_type` bits, and the already-reconstructed key. Every payload
	/// is self-delimiting (fixed-width digests, varint-prefixed strings,
	/// self-terminating varints), so this also reports how many bytes of
	/// `buf` the value occupied — the block iterator uses that to find the
	/// next entry, since the block codec itself carries no value-length
	/// field.
	pub fn decode_with_len(
		block_type: u8,
		value_type: u8,
		key: &[u8],
		buf: &[u8],
		ctx: &RecordContext,
	) -> Result<(Record, usize)> {
		match block_type {
			b'r' => {
				let (r, n) = decode_ref(value_type, key, buf, ctx)?;
				Ok((Record::Ref(r), n))
			}
			b'o' => {
				let (r, n) = decode_obj(key, buf)?;
				Ok((Record::Obj(r), n))
			}
			b'i' => {
				let (r, n) = decode_index(key, buf)?;
				Ok((Record::Index(r), n))
			}
			b'l' => {
				let (r, n) = decode_log(key, buf, ctx)?;
				Ok((Record::Log(r), n))
			}
			_ => Err(Error::FormatError(format!("unknown block type {}", block_type))),
		}
	}

	#[cfg(test)]
	pub fn decode(block_type: u8, value_type: u8, key: &[u8], buf: &[u8], ctx: &RecordContext) -> Result<Record> {
		Record::decode_with_len(block_type, value_type, key, buf, ctx).map(|(r, _)| r)
	}
}

/// Log keys sort newest-first within a ref name: the update index is
/// stored inverted (`!update_index`) after the name.
pub fn log_key(ref_name: &str, update_index: u64) -> Vec<u8> {
	let mut key = Vec::with_capacity(ref_name.len() + 8);
	key.extend_from_slice(ref_name.as_bytes());
	key.extend_from_slice(&(!update_index).to_be_bytes());
	key
}

fn encode_ref_value(r: &RefRecord, ctx: &RecordContext, out: &mut Vec<u8>) -> Result<()> {
	if r.update_index < ctx.min_update_index {
		return Err(Error::OutOfRange(format!(
			"update_index {} below min_update_index {}",
			r.update_index, ctx.min_update_index
		)));
	}
	put_uvarint(out, r.update_index - ctx.min_update_index);
	match &r.value {
		RefValue::Deletion => {}
		RefValue::Direct(digest) => {
			debug_assert_eq!(digest.len(), ctx.hash_size);
			out.extend_from_slice(digest);
		}
		RefValue::Symbolic(target) => {
			put_uvarint(out, target.len() as u64);
			out.extend_from_slice(target.as_bytes());
		}
		RefValue::Peeled { value, peeled } => {
			debug_assert_eq!(value.len(), ctx.hash_size);
			debug_assert_eq!(peeled.len(), ctx.hash_size);
			out.extend_from_slice(value);
			out.extend_from_slice(peeled);
		}
	}
	Ok(())
}

fn decode_ref(value_type: u8, key: &[u8], buf: &[u8], ctx: &RecordContext) -> Result<(RefRecord, usize)> {
	let ref_name = String::from_utf8(key.to_vec())
		.map_err(|_| Error::FormatError("ref name is not valid utf-8".into()))?;
	let (delta, mut off) = get_uvarint(buf)?;
	let update_index = ctx.min_update_index + delta;
	let value = match value_type {
		VALUE_DELETION => RefValue::Deletion,
		VALUE_DIRECT => {
			let digest = read_digest(buf, &mut off, ctx.hash_size)?;
			RefValue::Direct(digest)
		}
		VALUE_SYMBOLIC => {
			let (len, n) = get_uvarint(&buf[off..])?;
			off += n;
			let end = off + len as usize;
			let target = buf
				.get(off..end)
				.ok_or_else(|| Error::FormatError("truncated symbolic target".into()))?;
			let target = std::str::from_utf8(target)
				.map_err(|_| Error::FormatError("symbolic target is not valid utf-8".into()))?
				.to_owned();
			off = end;
			RefValue::Symbolic(target)
		}
		VALUE_PEELED => {
			let value = read_digest(buf, &mut off, ctx.hash_size)?;
			let peeled = read_digest(buf, &mut off, ctx.hash_size)?;
			RefValue::Peeled { value, peeled }
		}
		other => return Err(Error::FormatError(format!("unknown ref value_type {}", other))),
	};
	Ok((RefRecord { ref_name, update_index, value }, off))
}

fn read_digest(buf: &[u8], off: &mut usize, hash_size: usize) -> Result<Vec<u8>> {
	let end = *off + hash_size;
	let digest = buf
		.get(*off..end)
		.ok_or_else(|| Error::FormatError("truncated digest".into()))?
		.to_vec();
	*off = end;
	Ok(digest)
}

fn encode_obj_value(r: &ObjRecord, out: &mut Vec<u8>) -> Result<()> {
	put_uvarint(out, r.offsets.len() as u64);
	let mut prev = 0u64;
	for (i, &offset) in r.offsets.iter().enumerate() {
		if i > 0 && offset <= prev {
			return Err(Error::OrderError("object-index offsets must be strictly increasing".into()));
		}
		put_uvarint(out, offset);
		prev = offset;
	}
	Ok(())
}

fn decode_obj(key: &[u8], buf: &[u8]) -> Result<(ObjRecord, usize)> {
	let (count, mut off) = get_uvarint(buf)?;
	let mut offsets = Vec::with_capacity(count as usize);
	for _ in 0..count {
		let (offset, n) = get_uvarint(&buf[off..])?;
		off += n;
		offsets.push(offset);
	}
	Ok((ObjRecord { digest: key.to_vec(), offsets }, off))
}

fn decode_index(key: &[u8], buf: &[u8]) -> Result<(IndexRecord, usize)> {
	let (block_offset, n) = get_uvarint(buf)?;
	Ok((IndexRecord { last_key: key.to_vec(), block_offset }, n))
}

fn encode_log_value(r: &LogRecord, ctx: &RecordContext, out: &mut Vec<u8>) -> Result<()> {
	if r.old.len() != ctx.hash_size || r.new.len() != ctx.hash_size {
		return Err(Error::FormatError("log digest length mismatch".into()));
	}
	out.extend_from_slice(&r.old);
	out.extend_from_slice(&r.new);
	put_uvarint(out, r.name.len() as u64);
	out.extend_from_slice(r.name.as_bytes());
	put_uvarint(out, r.email.len() as u64);
	out.extend_from_slice(r.email.as_bytes());
	put_u64(out, r.time);
	put_varint_zigzag(out, r.tz as i64);
	put_uvarint(out, r.message.len() as u64);
	out.extend_from_slice(r.message.as_bytes());
	Ok(())
}

fn decode_log(key: &[u8], buf: &[u8], ctx: &RecordContext) -> Result<(LogRecord, usize)> {
	if key.len() < 8 {
		return Err(Error::FormatError("truncated log key".into()));
	}
	let (name_key, inverted) = key.split_at(key.len() - 8);
	let ref_name = String::from_utf8(name_key.to_vec())
		.map_err(|_| Error::FormatError("ref name is not valid utf-8".into()))?;
	let mut inv = [0u8; 8];
	inv.copy_from_slice(inverted);
	let update_index = !u64::from_be_bytes(inv);

	let mut off = 0usize;
	let old = read_digest(buf, &mut off, ctx.hash_size)?;
	let new = read_digest(buf, &mut off, ctx.hash_size)?;
	let (name_len, n) = get_uvarint(&buf[off..])?;
	off += n;
	let name = take_utf8(buf, &mut off, name_len as usize)?;
	let (email_len, n) = get_uvarint(&buf[off..])?;
	off += n;
	let email = take_utf8(buf, &mut off, email_len as usize)?;
	let time = get_u64(&buf[off..])?;
	off += 8;
	let (tz, n) = get_varint_zigzag(&buf[off..])?;
	off += n;
	let (msg_len, n) = get_uvarint(&buf[off..])?;
	off += n;
	let message = take_utf8(buf, &mut off, msg_len as usize)?;

	Ok((
		LogRecord {
			ref_name,
			update_index,
			old,
			new,
			name,
			email,
			time,
			tz: tz as i16,
			message,
		},
		off,
	))
}

fn take_utf8(buf: &[u8], off: &mut usize, len: usize) -> Result<String> {
	let end = *off + len;
	let raw = buf
		.get(*off..end)
		.ok_or_else(|| Error::FormatError("truncated string field".into()))?;
	let s = std::str::from_utf8(raw)
		.map_err(|_| Error::FormatError("field is not valid utf-8".into()))?
		.to_owned();
	*off = end;
	Ok(s)
}

#[cfg(test)]
mod test {
	use super::*;

	fn ctx() -> RecordContext {
		RecordContext { hash_size: 20, min_update_index: 1 }
	}

	#[test]
	fn ref_direct_roundtrip() {
		let r = RefRecord {
			ref_name: "refs/heads/main".into(),
			update_index: 5,
			value: RefValue::Direct(vec![7u8; 20]),
		};
		let rec = Record::Ref(r.clone());
		let mut buf = Vec::new();
		rec.encode_value(&ctx(), &mut buf).unwrap();
		let decoded = Record::decode(b'r', rec.value_type(), &rec.key(), &buf, &ctx()).unwrap();
		assert_eq!(decoded, Record::Ref(r));
	}

	#[test]
	fn ref_symbolic_roundtrip() {
		let r = RefRecord {
			ref_name: "HEAD".into(),
			update_index: 2,
			value: RefValue::Symbolic("refs/heads/main".into()),
		};
		let rec = Record::Ref(r.clone());
		let mut buf = Vec::new();
		rec.encode_value(&ctx(), &mut buf).unwrap();
		let decoded = Record::decode(b'r', rec.value_type(), &rec.key(), &buf, &ctx()).unwrap();
		assert_eq!(decoded, Record::Ref(r));
	}

	#[test]
	fn ref_tombstone_roundtrip() {
		let r = RefRecord {
			ref_name: "refs/heads/gone".into(),
			update_index: 3,
			value: RefValue::Deletion,
		};
		assert!(r.is_tombstone());
		let rec = Record::Ref(r.clone());
		let mut buf = Vec::new();
		rec.encode_value(&ctx(), &mut buf).unwrap();
		let decoded = Record::decode(b'r', rec.value_type(), &rec.key(), &buf, &ctx()).unwrap();
		assert_eq!(decoded, Record::Ref(r));
	}

	#[test]
	fn obj_roundtrip() {
		let r = ObjRecord { digest: vec![1, 2, 3, 4], offsets: vec![10, 20, 500] };
		let rec = Record::Obj(r.clone());
		let mut buf = Vec::new();
		rec.encode_value(&ctx(), &mut buf).unwrap();
		let decoded = Record::decode(b'o', 0, &rec.key(), &buf, &ctx()).unwrap();
		assert_eq!(decoded, Record::Obj(r));
	}

	#[test]
	fn log_key_sorts_newest_first() {
		let k1 = log_key("refs/heads/main", 1);
		let k2 = log_key("refs/heads/main", 2);
		assert!(k2 < k1);
	}

	#[test]
	fn log_roundtrip() {
		let r = LogRecord {
			ref_name: "refs/heads/main".into(),
			update_index: 9,
			old: vec![0u8; 20],
			new: vec![9u8; 20],
			name: "J Doe".into(),
			email: "j@example.com".into(),
			time: 1_700_000_000,
			tz: -420,
			message: "commit".into(),
		};
		let rec = Record::Log(r.clone());
		let mut buf = Vec::new();
		rec.encode_value(&ctx(), &mut buf).unwrap();
		let decoded = Record::decode(b'l', 0, &rec.key(), &buf, &ctx()).unwrap();
		assert_eq!(decoded, Record::Log(r));
	}
}
