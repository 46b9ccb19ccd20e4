// Copyright 2024 The Reftable Authors.
// Licensed under the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT> or the Apache
// License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed except according to those terms.

//! Assembles a table file: a 24-byte header, the ref section, a
//! digest-derived object-index section, the log section, and a 68-byte
//! footer, writing each section's blocks through a shared [`BlockWriter`].

use std::collections::BTreeMap;
use std::io::Write;

use crate::block::{AddOutcome, BlockType, BlockWriter};
use crate::bytes::compare;
use crate::error::{Error, Result};
use crate::record::{IndexRecord, LogRecord, ObjRecord, Record, RecordContext, RefRecord};
use crate::varint::put_u24;
use crate::varint::put_u64;

pub const MAGIC: &[u8; 4] = b"REFT";
pub const HEADER_LEN: usize = 24;
pub const FOOTER_LEN: usize = 68;

/// Picks the digest width and the header's version byte; mirrors the
/// caller's hash function, not something this crate computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashId {
	Sha1,
	Sha256,
}

impl HashId {
	pub fn size(self) -> usize {
		match self {
			HashId::Sha1 => 20,
			HashId::Sha256 => 32,
		}
	}

	fn version_byte(self) -> u8 {
		match self {
			HashId::Sha1 => 1,
			HashId::Sha256 => 2,
		}
	}

	pub(crate) fn from_version_byte(b: u8) -> Result<HashId> {
		match b {
			1 => Ok(HashId::Sha1),
			2 => Ok(HashId::Sha256),
			other => Err(Error::FormatError(format!("unsupported version byte {}", other))),
		}
	}
}

/// Object IDs indexed in the object-index section are truncated to this
/// many bytes; the field is packed into 5 bits of the footer, so it must
/// fall in `2..=31`.
pub const MIN_OBJECT_ID_LEN: usize = 2;
pub const MAX_OBJECT_ID_LEN: usize = 31;

#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
	pub block_size: u32,
	pub restart_interval: usize,
	pub min_update_index: u64,
	pub max_update_index: u64,
	/// Byte width digests are truncated to before being stored in the
	/// object-index section. Must be in `2..=31` (`MIN_OBJECT_ID_LEN..=MAX_OBJECT_ID_LEN`).
	pub object_id_len: usize,
}

impl Default for WriterOptions {
	fn default() -> WriterOptions {
		WriterOptions {
			block_size: 4096,
			restart_interval: crate::block::DEFAULT_RESTART_INTERVAL,
			min_update_index: 0,
			max_update_index: 0,
			object_id_len: 20,
		}
	}
}

/// Per-section block/entry/restart counts, exposed to tooling the way
/// `Column::histogram` is in the value-table engine this crate is built
/// from.
#[derive(Debug, Default, Clone, Copy)]
pub struct SectionStats {
	pub blocks: u64,
	pub entries: u64,
	pub restarts: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WriterStats {
	pub refs: SectionStats,
	pub objs: SectionStats,
	pub logs: SectionStats,
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum Phase {
	Ref,
	Log,
	Closed,
}

struct Section {
	stats: SectionStats,
	index: Vec<IndexRecord>,
}

impl Section {
	fn new() -> Section {
		Section { stats: SectionStats::default(), index: Vec::new() }
	}
}

/// Builds one table file onto a `Write` sink. Records must be added in
/// strictly increasing key order within each section; `add_log` closes the
/// ref section (and synthesizes the object-index section from the digests
/// seen so far) on its first call.
pub struct Writer<W> {
	out: W,
	offset: u64,
	opts: WriterOptions,
	hash_id: HashId,
	ctx: RecordContext,
	phase: Phase,
	block: BlockWriter,
	last_key: Vec<u8>,
	ref_section: Section,
	obj_section: Section,
	log_section: Section,
	obj_index: BTreeMap<Vec<u8>, Vec<u64>>,
	ref_index_offset: u64,
	obj_offset: u64,
	obj_index_offset: u64,
	log_offset: u64,
	log_index_offset: u64,
}

impl<W: Write> Writer<W> {
	pub fn new(mut out: W, hash_id: HashId, opts: WriterOptions) -> Result<Writer<W>> {
		if !(MIN_OBJECT_ID_LEN..=MAX_OBJECT_ID_LEN).contains(&opts.object_id_len) {
			return Err(Error::OutOfRange(format!(
				"object_id_len {} outside [{}, {}]",
				opts.object_id_len, MIN_OBJECT_ID_LEN, MAX_OBJECT_ID_LEN
			)));
		}
		let header = encode_header(hash_id, &opts);
		out.write_all(&header)?;
		log::debug!(target: "reftable", "wrote table header, block_size={}", opts.block_size);
		let block = BlockWriter::new(BlockType::Ref, opts.block_size as usize, opts.restart_interval, HEADER_LEN);
		Ok(Writer {
			out,
			offset: HEADER_LEN as u64,
			ctx: RecordContext { hash_size: hash_id.size(), min_update_index: opts.min_update_index },
			opts,
			hash_id,
			phase: Phase::Ref,
			block,
			last_key: Vec::new(),
			ref_section: Section::new(),
			obj_section: Section::new(),
			log_section: Section::new(),
			obj_index: BTreeMap::new(),
			ref_index_offset: 0,
			obj_offset: 0,
			obj_index_offset: 0,
			log_offset: 0,
			log_index_offset: 0,
		})
	}

	/// Appends one ref record. `ref_name` must sort strictly after every
	/// previously added ref.
	pub fn add_ref(&mut self, r: RefRecord) -> Result<()> {
		if self.phase != Phase::Ref {
			return Err(Error::OrderError("ref records must precede log records".into()));
		}
		if !(self.opts.min_update_index..=self.opts.max_update_index).contains(&r.update_index) {
			return Err(Error::OutOfRange(format!(
				"update_index {} outside [{}, {}]",
				r.update_index, self.opts.min_update_index, self.opts.max_update_index
			)));
		}
		let key = r.ref_name.as_bytes().to_vec();
		self.check_order(&key)?;
		self.remember_digests(&r, &key);
		let rec = Record::Ref(r);
		self.write_entry(SectionKind::Ref, rec)
	}

	/// Appends one log record. `ref_name`/`update_index` must sort
	/// strictly after every previously added log entry (newest update
	/// first within a ref name, names ascending).
	pub fn add_log(&mut self, r: LogRecord) -> Result<()> {
		if self.phase == Phase::Ref {
			self.finish_ref_section()?;
			self.build_obj_section()?;
			self.phase = Phase::Log;
			self.last_key.clear();
			self.block = BlockWriter::new(BlockType::Log, self.opts.block_size as usize, self.opts.restart_interval, 0);
		}
		if self.phase != Phase::Log {
			return Err(Error::OrderError("log records must be added last".into()));
		}
		let key = crate::record::log_key(&r.ref_name, r.update_index);
		self.check_order(&key)?;
		let rec = Record::Log(r);
		self.write_entry(SectionKind::Log, rec)
	}

	/// Finishes the current section(s), writes any section indexes, the
	/// footer, and returns the total file length.
	pub fn close(mut self) -> Result<u64> {
		match self.phase {
			Phase::Ref => {
				self.finish_ref_section()?;
				self.build_obj_section()?;
				self.finish_log_section()?;
			}
			Phase::Log => self.finish_log_section()?,
			Phase::Closed => return Err(Error::OrderError("writer already closed".into())),
		}
		self.write_footer()?;
		self.phase = Phase::Closed;
		log::debug!(target: "reftable", "closed table, {} bytes", self.offset);
		Ok(self.offset)
	}

	pub fn stats(&self) -> WriterStats {
		WriterStats { refs: self.ref_section.stats, objs: self.obj_section.stats, logs: self.log_section.stats }
	}

	fn check_order(&mut self, key: &[u8]) -> Result<()> {
		if !self.last_key.is_empty() && compare(key, &self.last_key) != std::cmp::Ordering::Greater {
			return Err(Error::OrderError("records must be added in strictly increasing key order".into()));
		}
		self.last_key.clear();
		self.last_key.extend_from_slice(key);
		Ok(())
	}

	/// Digests are truncated to `object_id_len` before entering the
	/// object-index map, matching how the footer records that width so a
	/// reader can truncate its own lookup key the same way.
	fn truncate_digest(&self, digest: &[u8]) -> Vec<u8> {
		digest[..digest.len().min(self.opts.object_id_len)].to_vec()
	}

	fn remember_digests(&mut self, r: &RefRecord, _key: &[u8]) {
		match &r.value {
			crate::record::RefValue::Direct(d) => {
				let d = self.truncate_digest(d);
				log::trace!(target: "reftable", "indexing object {} -> block at {}", hex::encode(&d), self.offset);
				self.obj_index.entry(d).or_default().push(self.offset);
			}
			crate::record::RefValue::Peeled { value, peeled } => {
				let value = self.truncate_digest(value);
				let peeled = self.truncate_digest(peeled);
				log::trace!(target: "reftable", "indexing objects {} {} -> block at {}", hex::encode(&value), hex::encode(&peeled), self.offset);
				self.obj_index.entry(value).or_default().push(self.offset);
				self.obj_index.entry(peeled).or_default().push(self.offset);
			}
			_ => {}
		}
	}

	fn section_mut(&mut self, which: SectionKind) -> &mut Section {
		match which {
			SectionKind::Ref => &mut self.ref_section,
			SectionKind::Log => &mut self.log_section,
		}
	}

	fn write_entry(&mut self, which: SectionKind, rec: Record) -> Result<()> {
		let block_type = which.block_type();
		let key = rec.key();
		let value_type = rec.value_type();
		let mut value = Vec::new();
		rec.encode_value(&self.ctx, &mut value)?;

		if self.block.add(&key, value_type, &value) == AddOutcome::Full {
			let old = std::mem::replace(
				&mut self.block,
				BlockWriter::new(block_type, self.opts.block_size as usize, self.opts.restart_interval, 0),
			);
			let flushed = self.flush_block(old)?;
			log::trace!(target: "reftable", "flushed {:?} block at {} ({} bytes key)", block_type, flushed.block_offset, flushed.last_key.len());
			let section = self.section_mut(which);
			section.index.push(flushed);
			section.stats.blocks += 1;
			if self.block.add(&key, value_type, &value) == AddOutcome::Full {
				return Err(Error::FormatError("entry does not fit in an empty block".into()));
			}
		}
		Ok(())
	}

	/// Serializes `block`, pads it (unless it is a log block), writes it to
	/// the sink, and advances `self.offset`. Returns the `(last_key,
	/// offset)` pair the containing section's index should remember.
	fn flush_block(&mut self, block: BlockWriter) -> Result<IndexRecord> {
		let block_offset = self.offset;
		let last_key = block.last_key().to_vec();
		let entry_count = block.entry_count() as u64;
		let restart_count = block.restart_count() as u64;
		let pads = block.block_type() != BlockType::Log;
		let bytes = block.finish();
		self.out.write_all(&bytes)?;
		let mut written = bytes.len();
		if pads && written < self.opts.block_size as usize {
			let pad = self.opts.block_size as usize - written;
			self.out.write_all(&vec![0u8; pad])?;
			written += pad;
		}
		self.offset += written as u64;
		let stats = match BlockType::from_tag(bytes[0]) {
			Ok(BlockType::Ref) => Some(&mut self.ref_section.stats),
			Ok(BlockType::Obj) => Some(&mut self.obj_section.stats),
			Ok(BlockType::Log) => Some(&mut self.log_section.stats),
			_ => None,
		};
		if let Some(stats) = stats {
			stats.entries += entry_count;
			stats.restarts += restart_count;
		}
		Ok(IndexRecord { last_key, block_offset })
	}

	fn finish_ref_section(&mut self) -> Result<()> {
		if !self.block.is_empty() {
			let rec = self.flush_block_swap(BlockType::Ref)?;
			self.ref_section.index.push(rec);
			self.ref_section.stats.blocks += 1;
		}
		if self.ref_section.index.len() > 1 {
			self.ref_index_offset = self.write_index_chain(self.ref_section.index.clone())?;
		}
		Ok(())
	}

	fn finish_log_section(&mut self) -> Result<()> {
		if !self.block.is_empty() && self.block.block_type() == BlockType::Log {
			let rec = self.flush_block_swap(BlockType::Log)?;
			self.log_section.index.push(rec);
			self.log_section.stats.blocks += 1;
		}
		if self.log_section.index.len() > 1 {
			self.log_index_offset = self.write_index_chain(self.log_section.index.clone())?;
		}
		Ok(())
	}

	fn flush_block_swap(&mut self, block_type: BlockType) -> Result<IndexRecord> {
		let old = std::mem::replace(
			&mut self.block,
			BlockWriter::new(block_type, self.opts.block_size as usize, self.opts.restart_interval, 0),
		);
		self.flush_block(old)
	}

	fn build_obj_section(&mut self) -> Result<()> {
		if self.obj_index.is_empty() {
			return Ok(());
		}
		self.obj_offset = self.offset;
		let entries = std::mem::take(&mut self.obj_index);
		let mut block = BlockWriter::new(BlockType::Obj, self.opts.block_size as usize, self.opts.restart_interval, 0);
		for (digest, mut offsets) in entries {
			offsets.sort_unstable();
			offsets.dedup();
			let rec = Record::Obj(ObjRecord { digest: digest.clone(), offsets });
			let value_type = rec.value_type();
			let mut value = Vec::new();
			rec.encode_value(&self.ctx, &mut value)?;
			if block.add(&digest, value_type, &value) == AddOutcome::Full {
				let old = std::mem::replace(
					&mut block,
					BlockWriter::new(BlockType::Obj, self.opts.block_size as usize, self.opts.restart_interval, 0),
				);
				let rec = self.flush_block(old)?;
				self.obj_section.index.push(rec);
				self.obj_section.stats.blocks += 1;
				if block.add(&digest, value_type, &value) == AddOutcome::Full {
					return Err(Error::FormatError("object-index entry does not fit in an empty block".into()));
				}
			}
		}
		if !block.is_empty() {
			let rec = self.flush_block(block)?;
			self.obj_section.index.push(rec);
			self.obj_section.stats.blocks += 1;
		}
		if self.obj_section.index.len() > 1 {
			self.obj_index_offset = self.write_index_chain(self.obj_section.index.clone())?;
		}
		self.log_offset = self.offset;
		self.last_key.clear();
		Ok(())
	}

	/// Writes `entries` as one or more internal-index blocks, recursing
	/// over its own output until a single root block remains, and returns
	/// that root's offset.
	fn write_index_chain(&mut self, entries: Vec<IndexRecord>) -> Result<u64> {
		let mut level = entries;
		loop {
			let produced = self.write_index_level(&level)?;
			if produced.len() == 1 {
				return Ok(produced[0].block_offset);
			}
			level = produced;
		}
	}

	fn write_index_level(&mut self, entries: &[IndexRecord]) -> Result<Vec<IndexRecord>> {
		let mut out = Vec::new();
		let mut block = BlockWriter::new(BlockType::Index, self.opts.block_size as usize, self.opts.restart_interval, 0);
		for rec in entries {
			let value_rec = Record::Index(rec.clone());
			let mut value = Vec::new();
			value_rec.encode_value(&self.ctx, &mut value)?;
			if block.add(&rec.last_key, 0, &value) == AddOutcome::Full {
				let old = std::mem::replace(
					&mut block,
					BlockWriter::new(BlockType::Index, self.opts.block_size as usize, self.opts.restart_interval, 0),
				);
				out.push(self.flush_block(old)?);
				if block.add(&rec.last_key, 0, &value) == AddOutcome::Full {
					return Err(Error::FormatError("index entry does not fit in an empty block".into()));
				}
			}
		}
		if !block.is_empty() {
			out.push(self.flush_block(block)?);
		}
		Ok(out)
	}

	fn write_footer(&mut self) -> Result<()> {
		let mut footer = encode_header(self.hash_id, &self.opts);
		put_u64(&mut footer, self.ref_index_offset);
		put_u64(&mut footer, (self.obj_offset << 5) | self.opts.object_id_len as u64);
		put_u64(&mut footer, self.obj_index_offset);
		put_u64(&mut footer, self.log_offset);
		put_u64(&mut footer, self.log_index_offset);
		debug_assert_eq!(footer.len(), FOOTER_LEN - 4);
		let mut hasher = crc32fast::Hasher::new();
		hasher.update(&footer);
		footer.extend_from_slice(&hasher.finalize().to_be_bytes());
		self.out.write_all(&footer)?;
		self.offset += footer.len() as u64;
		Ok(())
	}
}

#[derive(Clone, Copy)]
enum SectionKind {
	Ref,
	Log,
}

impl SectionKind {
	fn block_type(self) -> BlockType {
		match self {
			SectionKind::Ref => BlockType::Ref,
			SectionKind::Log => BlockType::Log,
		}
	}
}

fn encode_header(hash_id: HashId, opts: &WriterOptions) -> Vec<u8> {
	let mut h = Vec::with_capacity(HEADER_LEN);
	h.extend_from_slice(MAGIC);
	h.push(hash_id.version_byte());
	put_u24(&mut h, opts.block_size);
	put_u64(&mut h, opts.min_update_index);
	put_u64(&mut h, opts.max_update_index);
	h
}
