// Copyright 2024 The Reftable Authors.
// Licensed under the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT> or the Apache
// License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed except according to those terms.

//! Opens a table file footer-first, locates its sections, and seeks into
//! them via each section's internal index (or a linear scan when a
//! section is small enough to need none).

use std::convert::TryInto;
use std::fs::File;
use std::path::Path;

use crate::block::{BlockIter, BlockReader, BlockType};
use crate::error::{Error, Result};
use crate::record::{Record, RecordContext};
use crate::varint::get_u64;
use crate::writer::{HashId, FOOTER_LEN, HEADER_LEN, MAGIC};

#[derive(Debug, Default, Clone, Copy)]
pub struct SectionStats {
	pub blocks: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReaderStats {
	pub refs: SectionStats,
	pub objs: SectionStats,
	pub logs: SectionStats,
}

/// The reader's configuration surface. Unlike [`WriterOptions`](crate::writer::WriterOptions),
/// almost nothing here is load-bearing: the footer is self-describing
/// (hash algorithm, block size, update-index range all travel with the
/// file), so the only knob is whether to pay for the CRC-32 check.
#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
	/// Verify the footer's CRC-32 on open. Disabling this is only useful
	/// when the caller already trusts the bytes (e.g. re-opening a file
	/// this process just wrote) and wants to skip the hash pass.
	pub verify_crc: bool,
}

impl Default for ReaderOptions {
	fn default() -> ReaderOptions {
		ReaderOptions { verify_crc: true }
	}
}

/// A table opened over a borrowed byte slice. Holds only the footer's
/// parsed offsets; every lookup re-parses blocks on demand. `Copy` because
/// every field is a borrowed slice or a plain integer.
#[derive(Clone, Copy)]
pub struct Reader<'a> {
	data: &'a [u8],
	hash_id: HashId,
	block_size: u32,
	min_update_index: u64,
	max_update_index: u64,
	ref_index_offset: u64,
	obj_offset: u64,
	object_id_len: usize,
	obj_index_offset: u64,
	log_offset: u64,
	log_index_offset: u64,
}

/// Owns a `memmap2` mapping so a [`Reader`] can be built over a file path
/// without the caller managing the mapping's lifetime directly.
pub struct MappedTable {
	map: memmap2::Mmap,
}

impl MappedTable {
	pub fn open(path: &Path) -> Result<MappedTable> {
		let file = File::open(path)?;
		let map = unsafe { memmap2::Mmap::map(&file)? };
		Ok(MappedTable { map })
	}

	pub fn reader(&self) -> Result<Reader<'_>> {
		Reader::open(&self.map)
	}
}

impl<'a> Reader<'a> {
	/// Parses the 24-byte header and the trailing 68-byte footer, verifying
	/// the magic, that header and footer agree, and (unless disabled via
	/// [`ReaderOptions`]) the footer's CRC-32.
	pub fn open(data: &'a [u8]) -> Result<Reader<'a>> {
		Reader::open_with_options(data, ReaderOptions::default())
	}

	/// As [`open`](Self::open), with explicit [`ReaderOptions`].
	pub fn open_with_options(data: &'a [u8], opts: ReaderOptions) -> Result<Reader<'a>> {
		if data.len() < HEADER_LEN + FOOTER_LEN {
			return Err(Error::FormatError("file shorter than header+footer".into()));
		}
		if &data[0..4] != MAGIC {
			return Err(Error::FormatError("bad magic".into()));
		}
		let hash_id = HashId::from_version_byte(data[4])?;
		let block_size = u32::from_be_bytes([0, data[5], data[6], data[7]]);
		let min_update_index = get_u64(&data[8..16])?;
		let max_update_index = get_u64(&data[16..24])?;

		let footer_start = data.len() - FOOTER_LEN;
		let footer = &data[footer_start..];
		if &footer[0..HEADER_LEN] != &data[0..HEADER_LEN] {
			return Err(Error::FormatError("footer does not match header".into()));
		}
		if opts.verify_crc {
			let crc_region = &footer[0..FOOTER_LEN - 4];
			let mut hasher = crc32fast::Hasher::new();
			hasher.update(crc_region);
			let want_crc = u32::from_be_bytes(footer[FOOTER_LEN - 4..].try_into().unwrap());
			if hasher.finalize() != want_crc {
				return Err(Error::FormatError("footer CRC mismatch".into()));
			}
		}

		let mut off = HEADER_LEN;
		let ref_index_offset = get_u64(&footer[off..off + 8])?;
		off += 8;
		let packed_obj_offset = get_u64(&footer[off..off + 8])?;
		let obj_offset = packed_obj_offset >> 5;
		let object_id_len = (packed_obj_offset & 0x1f) as usize;
		off += 8;
		let obj_index_offset = get_u64(&footer[off..off + 8])?;
		off += 8;
		let log_offset = get_u64(&footer[off..off + 8])?;
		off += 8;
		let log_index_offset = get_u64(&footer[off..off + 8])?;

		log::debug!(target: "reftable", "opened table, {} bytes, block_size={}", data.len(), block_size);
		Ok(Reader {
			data,
			hash_id,
			block_size,
			min_update_index,
			max_update_index,
			ref_index_offset,
			obj_offset,
			object_id_len,
			obj_index_offset,
			log_offset,
			log_index_offset,
		})
	}

	pub fn min_update_index(&self) -> u64 {
		self.min_update_index
	}

	pub fn max_update_index(&self) -> u64 {
		self.max_update_index
	}

	fn ctx(&self) -> RecordContext {
		RecordContext { hash_size: self.hash_id.size(), min_update_index: self.min_update_index }
	}

	fn footer_start(&self) -> u64 {
		(self.data.len() - FOOTER_LEN) as u64
	}

	fn ref_section_bounds(&self) -> (u64, u64) {
		let end = if self.obj_offset != 0 { self.obj_offset } else { self.log_offset };
		(HEADER_LEN as u64, end)
	}

	fn obj_section_bounds(&self) -> (u64, u64) {
		(self.obj_offset, self.log_offset)
	}

	fn log_section_bounds(&self) -> (u64, u64) {
		(self.log_offset, self.footer_start())
	}

	fn block_at(&self, offset: u64) -> Result<BlockReader<'a>> {
		BlockReader::parse(&self.data[offset as usize..])
	}

	/// Walks an internal-index chain rooted at `index_root` (if nonzero) to
	/// find the data block that would contain `want_key`; falls back to the
	/// section's sole data block when there is no index. Returns `None`
	/// when `want_key` sorts past every entry covered by the index, else
	/// the block together with its file offset.
	fn locate_block(&self, index_root: u64, start: u64, end: u64, want_key: &[u8]) -> Result<Option<(u64, BlockReader<'a>)>> {
		if start >= end {
			return Ok(None);
		}
		if index_root == 0 {
			return Ok(Some((start, self.block_at(start)?)));
		}
		let mut offset = index_root;
		loop {
			let block = self.block_at(offset)?;
			if block.block_type() != BlockType::Index {
				return Ok(Some((offset, block)));
			}
			let mut it = BlockIter::new(block, self.ctx());
			it.seek(want_key)?;
			match it.next()? {
				Some(Record::Index(rec)) => offset = rec.block_offset,
				Some(_) => return Err(Error::FormatError("index block contains a non-index record".into())),
				None => return Ok(None),
			}
		}
	}

	/// Positions a [`SectionIter`] at the smallest key `>= want_key` within
	/// `[start, end)`, using `index_root` to descend if nonzero.
	fn seek_section(&self, index_root: u64, start: u64, end: u64, want_key: &[u8]) -> Result<SectionIter<'a>> {
		match self.locate_block(index_root, start, end, want_key)? {
			None => Ok(SectionIter { reader: *self, iter: None, current_offset: 0, section_end: end }),
			Some((offset, block)) => {
				let mut iter = BlockIter::new(block, self.ctx());
				iter.seek(want_key)?;
				Ok(SectionIter { reader: *self, iter: Some(iter), current_offset: offset, section_end: end })
			}
		}
	}

	/// Returns an iterator over ref records starting at the smallest
	/// ref name `>= name`.
	pub fn seek_ref(&self, name: &str) -> Result<RefIter<'a>> {
		let (start, end) = self.ref_section_bounds();
		Ok(RefIter(self.seek_section(self.ref_index_offset, start, end, name.as_bytes())?))
	}

	/// Returns an iterator over every ref in the table, in key order.
	pub fn refs(&self) -> Result<RefIter<'a>> {
		self.seek_ref("")
	}

	/// Positions a log iterator at `name`'s newest entry. The iterator does
	/// not stop at the end of `name`'s entries on its own — callers walk
	/// forward and stop once a yielded record's `ref_name` no longer
	/// matches, the same way the section as a whole has no per-name
	/// delimiter.
	pub fn seek_log(&self, name: &str) -> Result<LogIter<'a>> {
		let (start, end) = self.log_section_bounds();
		let key = crate::record::log_key(name, u64::MAX);
		Ok(LogIter(self.seek_section(self.log_index_offset, start, end, &key)?))
	}

	/// Looks up the object-index entry for `digest`, if the table carries
	/// an object-index section and has an entry for it. `digest` is
	/// truncated to the footer's `object_id_len` before the search, since
	/// that's the width the index was built at.
	pub fn lookup_obj(&self, digest: &[u8]) -> Result<Option<Vec<u64>>> {
		let digest = &digest[..digest.len().min(self.object_id_len)];
		log::trace!(target: "reftable", "looking up object {}", hex::encode(digest));
		let (start, end) = self.obj_section_bounds();
		let mut it = match self.locate_block(self.obj_index_offset, start, end, digest)? {
			None => return Ok(None),
			Some((_, block)) => {
				let mut iter = BlockIter::new(block, self.ctx());
				iter.seek(digest)?;
				iter
			}
		};
		match it.next()? {
			Some(Record::Obj(r)) if r.digest == digest => Ok(Some(r.offsets)),
			_ => Ok(None),
		}
	}

	/// Byte width object digests were truncated to before being stored in
	/// the object-index section.
	pub fn object_id_len(&self) -> usize {
		self.object_id_len
	}

	/// Per-section block counts, recomputed from the section indexes (or a
	/// single-block assumption when a section carries no index).
	pub fn stats(&self) -> ReaderStats {
		let count_blocks = |index_root: u64, start: u64, end: u64| -> u64 {
			if start >= end {
				0
			} else if index_root == 0 {
				1
			} else {
				self.count_leaf_blocks(index_root).unwrap_or(0)
			}
		};
		let (rs, re) = self.ref_section_bounds();
		let (os, oe) = self.obj_section_bounds();
		let (ls, le) = self.log_section_bounds();
		ReaderStats {
			refs: SectionStats { blocks: count_blocks(self.ref_index_offset, rs, re) },
			objs: SectionStats { blocks: count_blocks(self.obj_index_offset, os, oe) },
			logs: SectionStats { blocks: count_blocks(self.log_index_offset, ls, le) },
		}
	}

	fn count_leaf_blocks(&self, index_root: u64) -> Result<u64> {
		let block = self.block_at(index_root)?;
		if block.block_type() != BlockType::Index {
			return Ok(1);
		}
		let mut it = BlockIter::new(block, self.ctx());
		let mut count = 0u64;
		while let Some(Record::Index(rec)) = it.next()? {
			count += self.count_child_blocks(rec.block_offset)?;
		}
		Ok(count)
	}

	fn count_child_blocks(&self, offset: u64) -> Result<u64> {
		let block = self.block_at(offset)?;
		if block.block_type() == BlockType::Index {
			self.count_leaf_blocks(offset)
		} else {
			Ok(1)
		}
	}
}

/// Crosses block boundaries within one section, advancing to the next
/// physically adjacent block (`block_size`-strided for padded sections,
/// exactly `total_len`-strided for the unpadded log section) once the
/// current block's iterator is exhausted.
struct SectionIter<'a> {
	reader: Reader<'a>,
	iter: Option<BlockIter<'a>>,
	/// File offset of the block `iter` is currently reading.
	current_offset: u64,
	section_end: u64,
}

impl<'a> SectionIter<'a> {
	fn next(&mut self) -> Result<Option<Record>> {
		loop {
			let iter = match &mut self.iter {
				Some(it) => it,
				None => return Ok(None),
			};
			if let Some(record) = iter.next()? {
				return Ok(Some(record));
			}
			let stride = if iter.block_type() == BlockType::Log {
				iter.total_len() as u64
			} else {
				self.reader.block_size as u64
			};
			let next_offset = self.current_offset + stride;
			if next_offset >= self.section_end {
				self.iter = None;
				return Ok(None);
			}
			let block = self.reader.block_at(next_offset)?;
			self.current_offset = next_offset;
			self.iter = Some(BlockIter::new(block, self.reader.ctx()));
		}
	}
}

pub struct RefIter<'a>(SectionIter<'a>);

impl<'a> RefIter<'a> {
	pub fn next_ref(&mut self) -> Result<Option<crate::record::RefRecord>> {
		match self.0.next()? {
			Some(Record::Ref(r)) => Ok(Some(r)),
			Some(_) => Err(Error::FormatError("ref section contains a non-ref record".into())),
			None => Ok(None),
		}
	}
}

impl<'a> Iterator for RefIter<'a> {
	type Item = Result<crate::record::RefRecord>;
	fn next(&mut self) -> Option<Self::Item> {
		self.next_ref().transpose()
	}
}

pub struct LogIter<'a>(SectionIter<'a>);

impl<'a> LogIter<'a> {
	pub fn next_log(&mut self) -> Result<Option<crate::record::LogRecord>> {
		match self.0.next()? {
			Some(Record::Log(r)) => Ok(Some(r)),
			Some(_) => Err(Error::FormatError("log section contains a non-log record".into())),
			None => Ok(None),
		}
	}
}

impl<'a> Iterator for LogIter<'a> {
	type Item = Result<crate::record::LogRecord>;
	fn next(&mut self) -> Option<Self::Item> {
		self.next_log().transpose()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::record::{LogRecord, RefValue};
	use crate::writer::{Writer, WriterOptions};

	fn opts() -> WriterOptions {
		WriterOptions { block_size: 256, restart_interval: 4, min_update_index: 1, max_update_index: 1000, object_id_len: 20 }
	}

	fn direct(b: u8) -> RefValue {
		RefValue::Direct(vec![b; 20])
	}

	#[test]
	fn writer_reader_roundtrip_single_block() {
		let mut buf = Vec::new();
		let mut w = Writer::new(&mut buf, HashId::Sha1, opts()).unwrap();
		for i in 1..=4u64 {
			w.add_ref(RefRecord { ref_name: format!("refs/heads/b{}", i), update_index: i, value: direct(i as u8) }).unwrap();
		}
		w.close().unwrap();

		let r = Reader::open(&buf).unwrap();
		let names: Vec<_> = r.refs().unwrap().map(|rec| rec.unwrap().ref_name).collect();
		assert_eq!(names, vec!["refs/heads/b1", "refs/heads/b2", "refs/heads/b3", "refs/heads/b4"]);

		let mut it = r.seek_ref("refs/heads/b3").unwrap();
		let found = it.next_ref().unwrap().unwrap();
		assert_eq!(found.ref_name, "refs/heads/b3");
		assert_eq!(found.update_index, 3);
	}

	#[test]
	fn writer_reader_roundtrip_many_blocks_uses_index() {
		env_logger::try_init().ok();
		let mut buf = Vec::new();
		let mut w = Writer::new(&mut buf, HashId::Sha1, opts()).unwrap();
		for i in 1..=200u64 {
			w.add_ref(RefRecord {
				ref_name: format!("refs/heads/branch-{:04}", i),
				update_index: 1,
				value: direct((i % 255) as u8),
			})
			.unwrap();
		}
		w.close().unwrap();

		let r = Reader::open(&buf).unwrap();
		let all: Vec<_> = r.refs().unwrap().map(|rec| rec.unwrap().ref_name).collect();
		assert_eq!(all.len(), 200);
		assert_eq!(all[0], "refs/heads/branch-0001");
		assert_eq!(all[199], "refs/heads/branch-0200");

		let mut it = r.seek_ref("refs/heads/branch-0150").unwrap();
		assert_eq!(it.next_ref().unwrap().unwrap().ref_name, "refs/heads/branch-0150");
	}

	#[test]
	fn seek_past_last_ref_yields_nothing() {
		let mut buf = Vec::new();
		let mut w = Writer::new(&mut buf, HashId::Sha1, opts()).unwrap();
		w.add_ref(RefRecord { ref_name: "refs/heads/a".into(), update_index: 1, value: direct(1) }).unwrap();
		w.close().unwrap();

		let r = Reader::open(&buf).unwrap();
		let mut it = r.seek_ref("refs/heads/z").unwrap();
		assert!(it.next_ref().unwrap().is_none());
	}

	#[test]
	fn obj_index_lookup_finds_ref_offsets() {
		let mut buf = Vec::new();
		let mut w = Writer::new(&mut buf, HashId::Sha1, opts()).unwrap();
		w.add_ref(RefRecord { ref_name: "refs/heads/a".into(), update_index: 1, value: direct(42) }).unwrap();
		w.add_ref(RefRecord { ref_name: "refs/heads/b".into(), update_index: 1, value: direct(42) }).unwrap();
		w.close().unwrap();

		let r = Reader::open(&buf).unwrap();
		let offsets = r.lookup_obj(&[42u8; 20]).unwrap().unwrap();
		assert!(!offsets.is_empty());
		assert!(r.lookup_obj(&[7u8; 20]).unwrap().is_none());
	}

	#[test]
	fn obj_index_lookup_truncates_to_object_id_len() {
		let mut truncated_opts = opts();
		truncated_opts.object_id_len = 4;
		let mut buf = Vec::new();
		let mut w = Writer::new(&mut buf, HashId::Sha1, truncated_opts).unwrap();
		w.add_ref(RefRecord {
			ref_name: "refs/heads/a".into(),
			update_index: 1,
			value: RefValue::Direct(vec![9, 8, 7, 6, 5, 4, 3, 2, 1, 0]),
		})
		.unwrap();
		w.close().unwrap();

		let r = Reader::open(&buf).unwrap();
		assert_eq!(r.object_id_len(), 4);
		let offsets = r.lookup_obj(&[9, 8, 7, 6]).unwrap().unwrap();
		assert!(!offsets.is_empty());
		let also = r.lookup_obj(&[9, 8, 7, 6, 5, 4, 3, 2, 1, 0]).unwrap().unwrap();
		assert_eq!(also, offsets);
	}

	#[test]
	fn log_section_seeks_to_newest_entry_first() {
		let mut buf = Vec::new();
		let mut w = Writer::new(&mut buf, HashId::Sha1, opts()).unwrap();
		w.add_ref(RefRecord { ref_name: "refs/heads/main".into(), update_index: 1, value: direct(1) }).unwrap();
		for i in (1..=3u64).rev() {
			w.add_log(LogRecord {
				ref_name: "refs/heads/main".into(),
				update_index: i,
				old: vec![0u8; 20],
				new: vec![i as u8; 20],
				name: "J Doe".into(),
				email: "j@example.com".into(),
				time: 1_700_000_000 + i,
				tz: 0,
				message: format!("commit {}", i),
			})
			.unwrap();
		}
		w.close().unwrap();

		let r = Reader::open(&buf).unwrap();
		let mut it = r.seek_log("refs/heads/main").unwrap();
		let newest = it.next_log().unwrap().unwrap();
		assert_eq!(newest.update_index, 3);
		let next = it.next_log().unwrap().unwrap();
		assert_eq!(next.update_index, 2);
	}

	#[test]
	fn footer_bit_flip_is_rejected_as_format_error() {
		let mut buf = Vec::new();
		let mut w = Writer::new(&mut buf, HashId::Sha1, opts()).unwrap();
		w.add_ref(RefRecord { ref_name: "refs/heads/a".into(), update_index: 1, value: direct(1) }).unwrap();
		w.close().unwrap();

		let footer_start = buf.len() - FOOTER_LEN;
		buf[footer_start + 30] ^= 0xff;
		let err = Reader::open(&buf);
		assert!(matches!(err, Err(Error::FormatError(_))));
	}

	fn digest_for(i: u32) -> Vec<u8> {
		blake2_rfc::blake2b::blake2b(20, &[], &i.to_le_bytes()).as_bytes().to_vec()
	}

	#[test]
	fn round_trip_survives_many_refs_with_derived_digests() {
		let mut buf = Vec::new();
		let mut w = Writer::new(&mut buf, HashId::Sha1, opts()).unwrap();
		let mut expected = Vec::new();
		for i in 0..300u32 {
			let ref_name = format!("refs/heads/b{:05}", i);
			let value = RefValue::Direct(digest_for(i));
			w.add_ref(RefRecord { ref_name: ref_name.clone(), update_index: 1, value: value.clone() }).unwrap();
			expected.push((ref_name, value));
		}
		w.close().unwrap();

		let r = Reader::open(&buf).unwrap();
		let got: Vec<_> = r.refs().unwrap().map(|rec| rec.unwrap()).map(|rec| (rec.ref_name, rec.value)).collect();
		assert_eq!(got, expected);

		use rand::seq::SliceRandom;
		let mut rng = rand::thread_rng();
		let mut sample: Vec<_> = (0..300u32).collect();
		sample.shuffle(&mut rng);
		for i in sample.into_iter().take(20) {
			let name = format!("refs/heads/b{:05}", i);
			let mut it = r.seek_ref(&name).unwrap();
			let found = it.next_ref().unwrap().unwrap();
			assert_eq!(found.ref_name, name);
			assert_eq!(found.value, RefValue::Direct(digest_for(i)));
		}
	}

	#[test]
	fn verify_crc_false_skips_the_footer_check() {
		let mut buf = Vec::new();
		let mut w = Writer::new(&mut buf, HashId::Sha1, opts()).unwrap();
		w.add_ref(RefRecord { ref_name: "refs/heads/a".into(), update_index: 1, value: direct(1) }).unwrap();
		w.close().unwrap();

		let footer_start = buf.len() - FOOTER_LEN;
		buf[footer_start + 30] ^= 0xff;
		let r = Reader::open_with_options(&buf, ReaderOptions { verify_crc: false }).unwrap();
		assert_eq!(r.min_update_index(), 1);
	}

	#[test]
	fn stats_reports_block_counts() {
		let mut buf = Vec::new();
		let mut w = Writer::new(&mut buf, HashId::Sha1, opts()).unwrap();
		for i in 1..=100u64 {
			w.add_ref(RefRecord { ref_name: format!("refs/heads/b{:04}", i), update_index: 1, value: direct(1) }).unwrap();
		}
		w.close().unwrap();

		let r = Reader::open(&buf).unwrap();
		let stats = r.stats();
		assert!(stats.refs.blocks > 1);
		assert_eq!(stats.logs.blocks, 0);
	}
}
