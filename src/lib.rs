// Copyright 2024 The Reftable Authors.
// Licensed under the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT> or the Apache
// License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed except according to those terms.

//! A log-structured, append-only table store for named references and
//! their history.
//!
//! Each table is an immutable file holding sorted, prefix-compressed
//! records: refs, an object-to-ref-block index derived from the refs
//! written, and a reflog. A stack of tables (newest last) forms the
//! logical database; [`merge`] provides the merged, shadow-suppressing
//! view across a stack, and [`refname`] checks a pending batch of ref
//! name changes for hierarchical conflicts before it is committed.
//!
//! ```no_run
//! use reftable::record::{RefRecord, RefValue};
//! use reftable::writer::{HashId, Writer, WriterOptions};
//! use reftable::reader::Reader;
//!
//! let mut buf = Vec::new();
//! let mut w = Writer::new(&mut buf, HashId::Sha1, WriterOptions::default()).unwrap();
//! w.add_ref(RefRecord {
//!     ref_name: "refs/heads/main".into(),
//!     update_index: 1,
//!     value: RefValue::Direct(vec![0u8; 20]),
//! }).unwrap();
//! w.close().unwrap();
//!
//! let r = Reader::open(&buf).unwrap();
//! for rec in r.refs().unwrap() {
//!     println!("{}", rec.unwrap().ref_name);
//! }
//! ```

pub mod block;
pub mod bytes;
pub mod error;
pub mod merge;
pub mod reader;
pub mod record;
pub mod refname;
pub mod varint;
pub mod writer;

pub use error::{Error, Result};
pub use merge::MergeIterator;
pub use reader::{MappedTable, Reader, ReaderOptions};
pub use record::{LogRecord, RefRecord, RefValue};
pub use refname::Modification;
pub use writer::{HashId, Writer, WriterOptions};
