// Copyright 2024 The Reftable Authors.
// Licensed under the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT> or the Apache
// License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed except according to those terms.

//! Merges a stack of readers (oldest first) into a single sorted stream,
//! shadowing older tables' entries for keys a newer table also holds.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::{Error, Result};
use crate::record::RefRecord;
use crate::reader::{Reader, RefIter};

/// One live sub-iterator's current head, ordered so a `BinaryHeap` (a
/// max-heap) pops the smallest key first and, on a key tie, the entry from
/// the highest source index (the newest table).
struct Head {
	key: Vec<u8>,
	source: usize,
	record: RefRecord,
}

impl PartialEq for Head {
	fn eq(&self, other: &Self) -> bool {
		self.key == other.key && self.source == other.source
	}
}
impl Eq for Head {}

impl Ord for Head {
	fn cmp(&self, other: &Self) -> Ordering {
		// Reverse key order (smallest key first out of the max-heap); on a
		// tie, the larger source index (newest table) should come out
		// first too.
		other.key.cmp(&self.key).then(self.source.cmp(&other.source))
	}
}
impl PartialOrd for Head {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

/// K-way merge over a stack of ref iterators, oldest table first. Shadowed
/// entries (an older table's record for a key a newer table also has) are
/// dropped; deletion tombstones are yielded as any other record — callers
/// that want them filtered use [`with_tombstones_suppressed`].
pub struct MergeIterator<'a> {
	sources: Vec<RefIter<'a>>,
	heap: BinaryHeap<Head>,
}

impl<'a> MergeIterator<'a> {
	/// Builds a merge over `readers`, which must be ordered oldest first;
	/// `source_index` in the merge (and therefore shadowing priority)
	/// follows the readers' position in this slice.
	pub fn new(readers: &[Reader<'a>]) -> Result<MergeIterator<'a>> {
		for pair in readers.windows(2) {
			let (a, b) = (&pair[0], &pair[1]);
			if a.max_update_index() >= b.min_update_index() {
				return Err(Error::FormatError(format!(
					"reader stack out of order: max_update_index {} >= next min_update_index {}",
					a.max_update_index(),
					b.min_update_index()
				)));
			}
		}
		let mut sources = Vec::with_capacity(readers.len());
		for r in readers {
			sources.push(r.refs()?);
		}
		let mut heap = BinaryHeap::with_capacity(sources.len());
		for (i, it) in sources.iter_mut().enumerate() {
			if let Some(record) = it.next_ref()? {
				heap.push(Head { key: record.ref_name.as_bytes().to_vec(), source: i, record });
			}
		}
		Ok(MergeIterator { sources, heap })
	}

	/// Pops the next record in the merged stream, skipping every entry
	/// shadowed by a newer table that also holds its key.
	pub fn next(&mut self) -> Result<Option<RefRecord>> {
		let top = match self.heap.pop() {
			Some(h) => h,
			None => return Ok(None),
		};
		self.advance(top.source)?;
		while let Some(next_top) = self.heap.peek() {
			if next_top.key != top.key {
				break;
			}
			let shadowed = self.heap.pop().unwrap();
			self.advance(shadowed.source)?;
		}
		Ok(Some(top.record))
	}

	fn advance(&mut self, source: usize) -> Result<()> {
		if let Some(record) = self.sources[source].next_ref()? {
			self.heap.push(Head { key: record.ref_name.as_bytes().to_vec(), source, record });
		}
		Ok(())
	}

	/// Wraps this merge so deletion tombstones are filtered out of the
	/// stream instead of being handed to the caller.
	pub fn with_tombstones_suppressed(self) -> TombstoneFilter<'a> {
		TombstoneFilter(self)
	}
}

impl<'a> Iterator for MergeIterator<'a> {
	type Item = Result<RefRecord>;
	fn next(&mut self) -> Option<Self::Item> {
		MergeIterator::next(self).transpose()
	}
}

/// Filters deletion tombstones out of a [`MergeIterator`]'s stream. The
/// base iterator still sees every shadowed entry get suppressed the same
/// way; this layer only drops the tombstones that survive that pass.
pub struct TombstoneFilter<'a>(MergeIterator<'a>);

impl<'a> TombstoneFilter<'a> {
	pub fn next(&mut self) -> Result<Option<RefRecord>> {
		loop {
			match self.0.next()? {
				Some(r) if r.is_tombstone() => continue,
				other => return Ok(other),
			}
		}
	}
}

impl<'a> Iterator for TombstoneFilter<'a> {
	type Item = Result<RefRecord>;
	fn next(&mut self) -> Option<Self::Item> {
		TombstoneFilter::next(self).transpose()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::record::RefValue;
	use crate::writer::{HashId, Writer, WriterOptions};

	fn opts(min_update_index: u64, max_update_index: u64) -> WriterOptions {
		WriterOptions { block_size: 256, restart_interval: 4, min_update_index, max_update_index, object_id_len: 20 }
	}

	fn table(update_index_range: (u64, u64), refs: &[(&str, u64, RefValue)]) -> Vec<u8> {
		let mut buf = Vec::new();
		let mut w = Writer::new(&mut buf, HashId::Sha1, opts(update_index_range.0, update_index_range.1)).unwrap();
		for (name, idx, value) in refs {
			w.add_ref(RefRecord { ref_name: (*name).to_string(), update_index: *idx, value: value.clone() }).unwrap();
		}
		w.close().unwrap();
		buf
	}

	fn direct(b: u8) -> RefValue {
		RefValue::Direct(vec![b; 20])
	}

	#[test]
	fn newer_table_shadows_older_one() {
		let t0 = table((1, 1), &[("refs/heads/main", 1, direct(1)), ("refs/heads/other", 1, direct(9))]);
		let t1 = table((2, 2), &[("refs/heads/main", 2, direct(2))]);
		let r0 = Reader::open(&t0).unwrap();
		let r1 = Reader::open(&t1).unwrap();
		let merged: Vec<_> = MergeIterator::new(&[r0, r1]).unwrap().map(|r| r.unwrap()).collect();

		assert_eq!(merged.len(), 2);
		let main = merged.iter().find(|r| r.ref_name == "refs/heads/main").unwrap();
		assert_eq!(main.update_index, 2);
		assert_eq!(main.value, direct(2));
	}

	#[test]
	fn deletion_tombstone_from_newest_table_wins_by_default() {
		let t0 = table((1, 1), &[("refs/heads/main", 1, direct(1))]);
		let t1 = table((2, 2), &[("refs/heads/main", 2, RefValue::Deletion)]);
		let r0 = Reader::open(&t0).unwrap();
		let r1 = Reader::open(&t1).unwrap();
		let merged: Vec<_> = MergeIterator::new(&[r0, r1]).unwrap().map(|r| r.unwrap()).collect();

		assert_eq!(merged.len(), 1);
		assert!(merged[0].is_tombstone());
	}

	#[test]
	fn tombstone_filter_drops_deletions() {
		let t0 = table((1, 1), &[("refs/heads/a", 1, direct(1)), ("refs/heads/b", 1, direct(2))]);
		let t1 = table((2, 2), &[("refs/heads/a", 2, RefValue::Deletion)]);
		let r0 = Reader::open(&t0).unwrap();
		let r1 = Reader::open(&t1).unwrap();
		let visible: Vec<_> =
			MergeIterator::new(&[r0, r1]).unwrap().with_tombstones_suppressed().map(|r| r.unwrap()).collect();

		assert_eq!(visible.len(), 1);
		assert_eq!(visible[0].ref_name, "refs/heads/b");
	}

	#[test]
	fn disjoint_keys_from_both_tables_all_survive() {
		let t0 = table((1, 1), &[("refs/heads/a", 1, direct(1))]);
		let t1 = table((2, 2), &[("refs/heads/b", 2, direct(2))]);
		let r0 = Reader::open(&t0).unwrap();
		let r1 = Reader::open(&t1).unwrap();
		let merged: Vec<_> = MergeIterator::new(&[r0, r1]).unwrap().map(|r| r.unwrap()).collect();

		let names: Vec<_> = merged.iter().map(|r| r.ref_name.as_str()).collect();
		assert_eq!(names, vec!["refs/heads/a", "refs/heads/b"]);
	}

	#[test]
	fn overlapping_update_index_ranges_are_rejected() {
		let t0 = table((1, 5), &[("refs/heads/a", 1, direct(1))]);
		let t1 = table((3, 10), &[("refs/heads/b", 3, direct(2))]);
		let r0 = Reader::open(&t0).unwrap();
		let r1 = Reader::open(&t1).unwrap();
		let err = MergeIterator::new(&[r0, r1]);
		assert!(matches!(err, Err(Error::FormatError(_))));
	}
}
