mod db;
mod record;
mod segment;

pub use db::{Db, DbError, MAX_SEGMENT_SIZE, SEGMENT_BASE};
pub use record::{Record, RecordError, RecordIter, KIND_PUT, KIND_TOMBSTONE};
