// Copyright 2024 The Reftable Authors.
// Licensed under the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT> or the Apache
// License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed except according to those terms.

//! The block codec: prefix-compressed entries with a restart table,
//! shared verbatim by ref, object-index, internal-index and log sections.

use crate::bytes::{common_prefix_len, rebuild_key};
use crate::error::{Error, Result};
use crate::record::{Record, RecordContext};
use crate::varint::{binary_search_by, get_u16, get_u24, get_uvarint, put_u16, put_u24, put_uvarint, uvarint_len};

/// Default spacing between restart points (every k-th entry).
pub const DEFAULT_RESTART_INTERVAL: usize = 16;

/// Caps the restart table so the count fits a u16 and offsets fit a u24.
const MAX_RESTARTS: usize = u16::MAX as usize;

/// The fixed set of block type bytes this format recognizes. `Generic` ('g')
/// is reserved: no record kind in this crate maps to it, but a reader must
/// still accept it as a known type rather than treat it as corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
	Ref,
	Obj,
	Index,
	Log,
	Generic,
}

impl BlockType {
	pub fn tag(self) -> u8 {
		match self {
			BlockType::Ref => b'r',
			BlockType::Obj => b'o',
			BlockType::Index => b'i',
			BlockType::Log => b'l',
			BlockType::Generic => b'g',
		}
	}

	pub fn from_tag(tag: u8) -> Result<BlockType> {
		match tag {
			b'r' => Ok(BlockType::Ref),
			b'o' => Ok(BlockType::Obj),
			b'i' => Ok(BlockType::Index),
			b'l' => Ok(BlockType::Log),
			b'g' => Ok(BlockType::Generic),
			other => Err(Error::FormatError(format!("unknown block type byte {:#x}", other))),
		}
	}
}

#[derive(Debug, PartialEq, Eq)]
pub enum AddOutcome {
	Accepted,
	Full,
}

/// Assembles prefix-compressed entries into one block, registering restart
/// points every `restart_interval` entries.
pub struct BlockWriter {
	block_type: BlockType,
	block_size: usize,
	restart_interval: usize,
	/// Bytes reserved ahead of this block in the file (24 for the file's
	/// first block, which carries the header in-line; 0 otherwise).
	header_offset: usize,
	entries: Vec<u8>,
	restarts: Vec<u32>,
	last_key: Vec<u8>,
	entry_count: usize,
}

impl BlockWriter {
	pub fn new(block_type: BlockType, block_size: usize, restart_interval: usize, header_offset: usize) -> BlockWriter {
		BlockWriter {
			block_type,
			block_size,
			restart_interval: restart_interval.max(1),
			header_offset,
			entries: Vec::new(),
			restarts: Vec::new(),
			last_key: Vec::new(),
			entry_count: 0,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.entry_count == 0
	}

	pub fn entry_count(&self) -> usize {
		self.entry_count
	}

	pub fn block_type(&self) -> BlockType {
		self.block_type
	}

	pub fn last_key(&self) -> &[u8] {
		&self.last_key
	}

	pub fn restart_count(&self) -> usize {
		self.restarts.len()
	}

	fn restart_table_worst_case(&self, extra_restart: bool) -> usize {
		2 + 3 * (self.restarts.len() + if extra_restart { 1 } else { 0 })
	}

	fn projected_total(&self, entry_len: usize, extra_restart: bool) -> usize {
		self.header_offset + 4 + self.entries.len() + entry_len + self.restart_table_worst_case(extra_restart)
	}

	fn encode_entry(shared: usize, value_type: u8, suffix: &[u8], value: &[u8], out: &mut Vec<u8>) {
		put_uvarint(out, shared as u64);
		put_uvarint(out, ((suffix.len() as u64) << 3) | (value_type as u64 & 0x7));
		out.extend_from_slice(suffix);
		out.extend_from_slice(value);
	}

	/// Attempts to append one entry. Returns `Full` without mutating any
	/// state when the block has no room left; the caller flushes and
	/// retries exactly once per spec.
	pub fn add(&mut self, key: &[u8], value_type: u8, value: &[u8]) -> AddOutcome {
		let mut wants_restart = self.entry_count % self.restart_interval == 0;
		if wants_restart && self.restarts.len() >= MAX_RESTARTS {
			// Demoted: still encoded, just not registered as a restart point.
			wants_restart = false;
		}
		let shared = if wants_restart { 0 } else { common_prefix_len(&self.last_key, key) };
		let suffix = &key[shared..];
		let entry_len = uvarint_len(shared as u64)
			+ uvarint_len(((suffix.len() as u64) << 3) | (value_type as u64 & 0x7))
			+ suffix.len()
			+ value.len();

		if self.projected_total(entry_len, wants_restart) > self.block_size {
			return AddOutcome::Full;
		}

		if wants_restart {
			self.restarts.push(self.entries.len() as u32);
		}
		Self::encode_entry(shared, value_type, suffix, value, &mut self.entries);
		self.last_key.clear();
		self.last_key.extend_from_slice(key);
		self.entry_count += 1;
		AddOutcome::Accepted
	}

	/// Finishes the block: appends the restart table and count, and returns
	/// the complete, unpadded block bytes (type byte through restart
	/// count). The table writer is responsible for block_size padding.
	pub fn finish(self) -> Vec<u8> {
		let mut payload = self.entries;
		for &offset in &self.restarts {
			put_u24(&mut payload, offset);
		}
		put_u16(&mut payload, self.restarts.len() as u16);

		let mut out = Vec::with_capacity(4 + payload.len());
		out.push(self.block_type.tag());
		put_u24(&mut out, payload.len() as u32);
		out.extend_from_slice(&payload);
		out
	}
}

/// Parses one block's header and restart table. Entry values are decoded
/// lazily, in order, by a [`BlockIter`] built from this reader. Every field
/// is `Copy` so a `BlockIter` can hold its own copy instead of borrowing —
/// that lets callers own a block and an iterator over it in the same
/// struct without running into a self-referential borrow.
#[derive(Clone, Copy)]
pub struct BlockReader<'a> {
	data: &'a [u8],
	block_type: BlockType,
	/// Offset, within `data`, of the first byte past the entry area (the
	/// start of the restart table).
	entries_end: usize,
	restarts_start: usize,
	restart_count: usize,
}

impl<'a> BlockReader<'a> {
	/// `data` must start at this block's type byte; it may extend past the
	/// block's true end (e.g. zero padding up to `block_size`).
	pub fn parse(data: &'a [u8]) -> Result<BlockReader<'a>> {
		if data.len() < 6 {
			return Err(Error::FormatError("block shorter than header".into()));
		}
		let block_type = BlockType::from_tag(data[0])?;
		let payload_len = get_u24(&data[1..4])? as usize;
		let total_len = 4 + payload_len;
		if data.len() < total_len || total_len < 6 {
			return Err(Error::FormatError("block shorter than declared length".into()));
		}
		let restart_count = get_u16(&data[total_len - 2..total_len])? as usize;
		let restarts_start = total_len
			.checked_sub(2 + 3 * restart_count)
			.ok_or_else(|| Error::FormatError("restart table overruns block".into()))?;
		if restarts_start < 4 {
			return Err(Error::FormatError("restart table overruns entries".into()));
		}
		Ok(BlockReader {
			data: &data[..total_len],
			block_type,
			entries_end: restarts_start,
			restarts_start,
			restart_count,
		})
	}

	pub fn block_type(&self) -> BlockType {
		self.block_type
	}

	/// Total meaningful length of this block (excludes any trailing
	/// padding zero bytes beyond it).
	pub fn total_len(&self) -> usize {
		self.data.len()
	}

	pub fn restart_count(&self) -> usize {
		self.restart_count
	}

	fn restart_offset(&self, idx: usize) -> Result<usize> {
		let at = self.restarts_start + idx * 3;
		Ok(get_u24(&self.data[at..at + 3])? as usize)
	}

	/// The key of the entry at `offset` (entry-area-relative), assuming it
	/// is a restart point (`shared_prefix_len == 0`, so the key is exactly
	/// the suffix).
	fn restart_key(&self, offset: usize) -> Result<Vec<u8>> {
		let start = 4 + offset;
		if start >= self.entries_end {
			return Err(Error::FormatError("restart offset past entry area".into()));
		}
		let mut p = start;
		let (shared, n) = get_uvarint(&self.data[p..self.entries_end])?;
		p += n;
		let (tagged, n) = get_uvarint(&self.data[p..self.entries_end])?;
		p += n;
		if shared != 0 {
			return Err(Error::FormatError("restart point has nonzero shared prefix".into()));
		}
		let suffix_len = (tagged >> 3) as usize;
		let suffix_end = p + suffix_len;
		if suffix_end > self.entries_end {
			return Err(Error::FormatError("truncated restart entry".into()));
		}
		Ok(self.data[p..suffix_end].to_vec())
	}
}

/// Streams decoded records out of one block, growing/shrinking an internal
/// `last_key` from each entry's `shared_prefix_len` + suffix. Does not
/// mutate the underlying block.
pub struct BlockIter<'a> {
	reader: BlockReader<'a>,
	ctx: RecordContext,
	/// Offset into the entry area (0-based from byte 4) of the next entry
	/// to decode; equals `entries_end - 4` once exhausted.
	next_offset: usize,
	last_key: Vec<u8>,
}

impl<'a> BlockIter<'a> {
	pub fn new(reader: BlockReader<'a>, ctx: RecordContext) -> BlockIter<'a> {
		BlockIter { reader, ctx, next_offset: 0, last_key: Vec::new() }
	}

	pub fn block_type(&self) -> BlockType {
		self.reader.block_type
	}

	pub fn total_len(&self) -> usize {
		self.reader.total_len()
	}

	fn entry_area_len(&self) -> usize {
		self.reader.entries_end - 4
	}

	/// Decodes and returns the next record, or `Ok(None)` at end of block.
	pub fn next(&mut self) -> Result<Option<Record>> {
		if self.next_offset >= self.entry_area_len() {
			return Ok(None);
		}
		let entries_end = self.reader.entries_end;
		let mut p = 4 + self.next_offset;
		let (shared, n) = get_uvarint(&self.reader.data[p..entries_end])?;
		p += n;
		let (tagged, n) = get_uvarint(&self.reader.data[p..entries_end])?;
		p += n;
		let suffix_len = (tagged >> 3) as usize;
		let value_type = (tagged & 0x7) as u8;
		let suffix_end = p + suffix_len;
		if suffix_end > entries_end {
			return Err(Error::FormatError("truncated entry suffix".into()));
		}
		let shared = shared as usize;
		if shared > self.last_key.len() {
			return Err(Error::FormatError("shared prefix exceeds last key".into()));
		}
		rebuild_key(&mut self.last_key, shared, &self.reader.data[p..suffix_end]);

		let value_tail = &self.reader.data[suffix_end..entries_end];
		let (record, consumed) =
			Record::decode_with_len(self.reader.block_type.tag(), value_type, &self.last_key, value_tail, &self.ctx)?;
		self.next_offset = (suffix_end - 4) + consumed;
		Ok(Some(record))
	}

	/// Positions the iterator so the next [`next`](Self::next) call yields
	/// the smallest stored key `>= want_key` (or `None` at end of block).
	/// Binary-searches the restart table, then scans linearly.
	pub fn seek(&mut self, want_key: &[u8]) -> Result<()> {
		let count = self.reader.restart_count();
		let mut start_offset = 0usize;
		if count > 0 {
			let found = binary_search_by(count, |i| {
				let offset = self.reader.restart_offset(i).unwrap_or(0);
				match self.reader.restart_key(offset) {
					Ok(key) => key.as_slice().cmp(want_key),
					Err(_) => std::cmp::Ordering::Greater,
				}
			});
			if let Some(idx) = found {
				start_offset = self.reader.restart_offset(idx)?;
			}
		}
		self.next_offset = start_offset;
		self.last_key.clear();

		loop {
			let before_offset = self.next_offset;
			let before_last_key = self.last_key.clone();
			match self.next()? {
				None => return Ok(()),
				Some(record) => {
					if record.key().as_slice() >= want_key {
						self.next_offset = before_offset;
						self.last_key = before_last_key;
						return Ok(());
					}
				}
			}
		}
	}
}
