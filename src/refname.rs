// Copyright 2024 The Reftable Authors.
// Licensed under the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT> or the Apache
// License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed except according to those terms.

//! Lexical and hierarchical validation for ref names, checked before a
//! modification (a bundle of names to add and delete) is committed to a
//! new table.

use crate::error::{Error, Result};
use crate::reader::Reader;
use crate::varint::binary_search_by;

/// Checks `name` has no empty path component and no component equal to
/// `.` or `..`, and does not end with `/`.
pub fn validate_lexical(name: &str) -> Result<()> {
	if name.is_empty() || name.ends_with('/') {
		return Err(Error::RefnameError(format!("{:?} is empty or ends with '/'", name)));
	}
	for component in name.split('/') {
		if component.is_empty() || component == "." || component == ".." {
			return Err(Error::RefnameError(format!("{:?} has an invalid path component", name)));
		}
	}
	Ok(())
}

fn contains(sorted: &[String], name: &str) -> bool {
	match binary_search_by(sorted.len(), |i| sorted[i].as_str().cmp(name)) {
		Some(idx) => sorted[idx] == name,
		None => false,
	}
}

/// Strict prefixes of `name` that end at a `/` boundary, e.g. `"refs"` and
/// `"refs/heads"` for `"refs/heads/main"`.
fn ancestors(name: &str) -> impl Iterator<Item = &str> {
	name.match_indices('/').map(move |(i, _)| &name[..i])
}

/// A pending batch of ref name changes, validated against a table
/// snapshot before it is written.
pub struct Modification<'a, 'r> {
	reader: &'a Reader<'r>,
	/// Must be sorted; duplicates are tolerated.
	add: &'a [String],
	/// Must be sorted; duplicates are tolerated.
	del: &'a [String],
}

impl<'a, 'r> Modification<'a, 'r> {
	pub fn new(reader: &'a Reader<'r>, add: &'a [String], del: &'a [String]) -> Modification<'a, 'r> {
		Modification { reader, add, del }
	}

	/// Lexically validates every added name, then checks each against the
	/// snapshot's existing refs for hierarchical conflicts: an added name
	/// may not sit underneath an existing, non-deleted ref, nor above one.
	pub fn validate(&self) -> Result<()> {
		for name in self.add {
			validate_lexical(name)?;
		}
		for name in self.add {
			self.check_ancestors(name)?;
			self.check_descendants(name)?;
		}
		Ok(())
	}

	fn check_ancestors(&self, name: &str) -> Result<()> {
		for ancestor in ancestors(name) {
			if self.del.is_empty() || !contains(self.del, ancestor) {
				if self.existing_ref(ancestor)? {
					return Err(Error::NameConflict(format!(
						"{:?} cannot be added: {:?} already exists as a ref",
						name, ancestor
					)));
				}
			}
		}
		Ok(())
	}

	fn check_descendants(&self, name: &str) -> Result<()> {
		let prefix = format!("{}/", name);
		let mut it = self.reader.seek_ref(&prefix)?;
		while let Some(existing) = it.next_ref()? {
			if !existing.ref_name.starts_with(&prefix) {
				break;
			}
			if !contains(self.del, &existing.ref_name) {
				return Err(Error::NameConflict(format!(
					"{:?} cannot be added: {:?} already exists underneath it",
					name, existing.ref_name
				)));
			}
		}
		Ok(())
	}

	fn existing_ref(&self, name: &str) -> Result<bool> {
		let mut it = self.reader.seek_ref(name)?;
		Ok(matches!(it.next_ref()?, Some(r) if r.ref_name == name))
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::record::{RefRecord, RefValue};
	use crate::writer::{HashId, Writer, WriterOptions};

	fn opts() -> WriterOptions {
		WriterOptions { block_size: 256, restart_interval: 4, min_update_index: 1, max_update_index: 100, object_id_len: 20 }
	}

	fn table(refs: &[&str]) -> Vec<u8> {
		let mut buf = Vec::new();
		let mut w = Writer::new(&mut buf, HashId::Sha1, opts()).unwrap();
		for name in refs {
			w.add_ref(RefRecord {
				ref_name: (*name).to_string(),
				update_index: 1,
				value: RefValue::Direct(vec![1u8; 20]),
			})
			.unwrap();
		}
		w.close().unwrap();
		buf
	}

	#[test]
	fn rejects_empty_and_dot_components() {
		assert!(matches!(validate_lexical(""), Err(Error::RefnameError(_))));
		assert!(matches!(validate_lexical("refs/heads/"), Err(Error::RefnameError(_))));
		assert!(matches!(validate_lexical("refs//heads"), Err(Error::RefnameError(_))));
		assert!(matches!(validate_lexical("refs/./heads"), Err(Error::RefnameError(_))));
		assert!(matches!(validate_lexical("refs/../heads"), Err(Error::RefnameError(_))));
		assert!(validate_lexical("refs/heads/main").is_ok());
	}

	#[test]
	fn adding_child_of_existing_leaf_conflicts() {
		let buf = table(&["refs/heads/a"]);
		let reader = Reader::open(&buf).unwrap();
		let add = vec!["refs/heads/a/b".to_string()];
		let del = vec![];
		let err = Modification::new(&reader, &add, &del).validate();
		assert!(matches!(err, Err(Error::NameConflict(_))));
	}

	#[test]
	fn adding_parent_of_existing_leaf_conflicts() {
		let buf = table(&["refs/heads/a/b"]);
		let reader = Reader::open(&buf).unwrap();
		let add = vec!["refs/heads/a".to_string()];
		let del = vec![];
		let err = Modification::new(&reader, &add, &del).validate();
		assert!(matches!(err, Err(Error::NameConflict(_))));
	}

	#[test]
	fn deleting_the_conflicting_ref_first_allows_the_add() {
		let buf = table(&["refs/heads/a"]);
		let reader = Reader::open(&buf).unwrap();
		let add = vec!["refs/heads/a/b".to_string()];
		let del = vec!["refs/heads/a".to_string()];
		assert!(Modification::new(&reader, &add, &del).validate().is_ok());
	}

	#[test]
	fn unrelated_sibling_names_do_not_conflict() {
		let buf = table(&["refs/heads/a"]);
		let reader = Reader::open(&buf).unwrap();
		let add = vec!["refs/heads/b".to_string()];
		let del = vec![];
		assert!(Modification::new(&reader, &add, &del).validate().is_ok());
	}
}
