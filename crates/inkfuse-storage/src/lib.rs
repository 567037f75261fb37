//! Columnar row store backing table scans.
//!
//! Relations hold typed columns of contiguous POD data plus arena-backed
//! string columns; scans read them through raw base pointers.  Ingest
//! accepts the `|`-delimited text dialect with a required trailing `|`.

pub mod column;
pub mod relation;

pub use column::{BaseColumn, StringColumn};
pub use relation::Relation;
