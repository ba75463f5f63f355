use std::collections::HashMap;
use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::record::{Record, RecordError};
use super::segment::Segment;

pub const SEGMENT_BASE: &str = "current-data-";
pub const MAX_SEGMENT_SIZE: u64 = 10 * 1024 * 1024;

/// Rotation compacts the store first once it already holds this many
/// segments, the retiring active one included.
const MERGE_THRESHOLD: usize = 3;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("record does not exist")]
    NotFound,

    #[error("store has shut down")]
    Closed,

    #[error("invalid segment file {0}")]
    InvalidSegmentFile(PathBuf),

    #[error(transparent)]
    RecordErrors(#[from] RecordError),

    #[error(transparent)]
    IOError(#[from] io::Error),
}

/// Where the most recent record for a key lives: the position of its
/// segment in the ordered segment list and the byte offset inside it.
#[derive(Debug, Clone, Copy)]
struct SegmentRef {
    segment: usize,
    offset: u64,
}

/// Log-structured key-value store over a directory of append-only
/// segments.
///
/// The index is kept purely in memory and rebuilt by scanning every
/// segment at open. Tombstoned keys stay in the index pointing at their
/// tombstone record so that merge sees them; `get` hides them.
///
/// Not internally synchronized. All access must go through a single
/// owner, in production the [`SafeStore`](crate::gateway::SafeStore)
/// worker.
pub struct Db {
    dir: PathBuf,
    segments: Vec<Segment>,
    index: HashMap<Vec<u8>, SegmentRef>,
    next_id: u64,
    max_segment_size: u64,
}

impl Db {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Db, DbError> {
        Self::open_with(dir, MAX_SEGMENT_SIZE)
    }

    /// Opens the store with a custom segment size limit.
    pub fn open_with<P: AsRef<Path>>(dir: P, max_segment_size: u64) -> Result<Db, DbError> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            DirBuilder::new().mode(0o700).create(&dir)?;
        }

        let mut db = Db {
            dir,
            segments: vec![],
            index: HashMap::new(),
            next_id: 0,
            max_segment_size,
        };
        db.setup()?;
        Ok(db)
    }

    fn setup(&mut self) -> Result<(), DbError> {
        let mut ids: Vec<u64> = vec![];
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(suffix) = name.strip_prefix(SEGMENT_BASE) {
                let id = suffix
                    .parse::<u64>()
                    .map_err(|_| DbError::InvalidSegmentFile(entry.path()))?;
                ids.push(id);
            }
        }

        // the numeric suffix is the canonical ordering, not the file name
        ids.sort_unstable();

        for id in ids {
            let segment = Segment::open(self.segment_path(id), id)?;
            let position = self.segments.len();
            for (offset, record) in segment.iter() {
                self.index.insert(
                    record.key().to_vec(),
                    SegmentRef {
                        segment: position,
                        offset,
                    },
                );
            }
            self.next_id = id + 1;
            self.segments.push(segment);
        }

        if self.segments.is_empty() {
            self.rotate()?;
        }
        Ok(())
    }

    fn segment_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{}{}", SEGMENT_BASE, id))
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, DbError> {
        let entry = self.index.get(key).ok_or(DbError::NotFound)?;
        let (record, _) = self.segments[entry.segment].read_record(entry.offset)?;
        match record {
            Record::Put { value, .. } => Ok(value),
            Record::Tombstone { .. } => Err(DbError::NotFound),
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        self.write_record(Record::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    /// Appends a tombstone for `key`. A key the index has never seen is a
    /// no-op, there is nothing to hide.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), DbError> {
        if !self.index.contains_key(key) {
            return Ok(());
        }
        self.write_record(Record::Tombstone { key: key.to_vec() })
    }

    /// Sum of the current byte sizes of all segments.
    pub fn size(&self) -> u64 {
        self.segments.iter().map(|segment| segment.size).sum()
    }

    /// Flushes and releases every segment handle, reporting the first
    /// failure after attempting all of them.
    pub fn close(mut self) -> Result<(), DbError> {
        let mut first_error = None;
        for segment in self.segments.drain(..) {
            if let Err(e) = segment.sync() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(DbError::IOError(e)),
            None => Ok(()),
        }
    }

    fn write_record(&mut self, record: Record) -> Result<(), DbError> {
        let active = self.segments.len() - 1;
        if self.segments[active].size >= self.max_segment_size {
            if self.segments.len() >= MERGE_THRESHOLD {
                self.merge()?;
            }
            self.rotate()?;
        }

        let data = record.encode();
        let active = self.segments.len() - 1;
        let offset = self.segments[active].append(&data)?;
        // index entry only after the bytes are on disk
        self.index.insert(
            record.key().to_vec(),
            SegmentRef {
                segment: active,
                offset,
            },
        );
        Ok(())
    }

    /// Seals the current active segment and starts a fresh one.
    fn rotate(&mut self) -> Result<(), DbError> {
        if let Some(active) = self.segments.last() {
            active.sync()?;
        }
        let segment = self.new_segment()?;
        self.segments.push(segment);
        Ok(())
    }

    fn new_segment(&mut self) -> Result<Segment, DbError> {
        let segment = Segment::create(self.segment_path(self.next_id), self.next_id)?;
        self.next_id += 1;
        Ok(segment)
    }

    /// Rewrites the latest surviving record of every key into fresh
    /// segments, swaps them in, then unlinks the inputs.
    ///
    /// Takes all current segments, the active one included, so a
    /// tombstone-heavy tail gets compacted too. On any error before the
    /// swap the partial outputs are removed and the store is untouched.
    fn merge(&mut self) -> Result<(), DbError> {
        log::info!(
            "merging {} segments in {}",
            self.segments.len(),
            self.dir.display()
        );

        // last write per key wins: segments in id order, offsets ascending
        let mut latest: HashMap<Vec<u8>, Record> = HashMap::new();
        for segment in &self.segments {
            for (_, record) in segment.iter() {
                latest.insert(record.key().to_vec(), record);
            }
        }

        let (outputs, index) = self.write_merged(latest)?;

        for old in self.segments.drain(..) {
            if let Err(e) = std::fs::remove_file(&old.path) {
                log::warn!("cannot unlink merged segment {}: {}", old.path.display(), e);
            }
        }
        self.segments = outputs;
        self.index = index;
        Ok(())
    }

    fn write_merged(
        &mut self,
        latest: HashMap<Vec<u8>, Record>,
    ) -> Result<(Vec<Segment>, HashMap<Vec<u8>, SegmentRef>), DbError> {
        let mut outputs: Vec<Segment> = vec![];
        let mut index = HashMap::new();
        match self.fill_merged(latest, &mut outputs, &mut index) {
            Ok(()) => Ok((outputs, index)),
            Err(e) => {
                for output in outputs {
                    let _ = std::fs::remove_file(&output.path);
                }
                Err(e)
            }
        }
    }

    fn fill_merged(
        &mut self,
        latest: HashMap<Vec<u8>, Record>,
        outputs: &mut Vec<Segment>,
        index: &mut HashMap<Vec<u8>, SegmentRef>,
    ) -> Result<(), DbError> {
        outputs.push(self.new_segment()?);

        for (key, record) in latest {
            if let Record::Tombstone { .. } = record {
                continue;
            }
            let data = record.encode();

            let tail = &outputs[outputs.len() - 1];
            if tail.size > 0 && tail.size + data.len() as u64 > self.max_segment_size {
                outputs.push(self.new_segment()?);
            }

            let position = outputs.len() - 1;
            let offset = outputs[position].append(&data)?;
            index.insert(
                key,
                SegmentRef {
                    segment: position,
                    offset,
                },
            );
        }
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        for segment in &self.segments {
            let _ = segment.sync();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn segment_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn put_get_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Db::open(dir.path()).unwrap();

        let pairs = [
            ("k1", "v1"),
            ("k2", "v2"),
            ("k3", "v3"),
            ("k2", "v2.1"),
        ];
        for (key, value) in pairs {
            db.put(key.as_bytes(), value.as_bytes()).unwrap();
        }

        assert_eq!(db.get(b"k2").unwrap(), b"v2.1");
        assert_eq!(db.get(b"k1").unwrap(), b"v1");
        assert_eq!(db.get(b"k3").unwrap(), b"v3");
        assert_eq!(segment_files(dir.path()), vec!["current-data-0"]);
    }

    #[test]
    fn get_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path()).unwrap();
        assert!(matches!(db.get(b"nope"), Err(DbError::NotFound)));
    }

    #[test]
    fn reopen_recovers_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Db::open(dir.path()).unwrap();
        for (key, value) in [("k1", "v1"), ("k2", "v2"), ("k3", "v3"), ("k2", "v2.1")] {
            db.put(key.as_bytes(), value.as_bytes()).unwrap();
        }
        db.close().unwrap();

        let db = Db::open(dir.path()).unwrap();
        assert_eq!(db.get(b"k1").unwrap(), b"v1");
        assert_eq!(db.get(b"k2").unwrap(), b"v2.1");
        assert_eq!(db.get(b"k3").unwrap(), b"v3");
    }

    #[test]
    fn delete_hides_and_put_resurrects() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Db::open(dir.path()).unwrap();

        db.put(b"k5", b"v1").unwrap();
        db.put(b"k5", b"v2").unwrap();
        db.delete(b"k5").unwrap();
        assert!(matches!(db.get(b"k5"), Err(DbError::NotFound)));

        db.put(b"k5", b"v3").unwrap();
        assert_eq!(db.get(b"k5").unwrap(), b"v3");
    }

    #[test]
    fn delete_of_absent_key_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Db::open(dir.path()).unwrap();
        db.put(b"k1", b"v1").unwrap();

        let before = db.size();
        db.delete(b"ghost").unwrap();
        assert_eq!(db.size(), before);
    }

    #[test]
    fn tombstones_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Db::open(dir.path()).unwrap();
        db.put(b"kept", b"v").unwrap();
        db.put(b"gone", b"v").unwrap();
        db.delete(b"gone").unwrap();
        db.close().unwrap();

        let db = Db::open(dir.path()).unwrap();
        assert_eq!(db.get(b"kept").unwrap(), b"v");
        assert!(matches!(db.get(b"gone"), Err(DbError::NotFound)));
    }

    #[test]
    fn size_grows_with_puts() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Db::open(dir.path()).unwrap();

        let mut previous = db.size();
        for i in 0..10 {
            db.put(format!("key-{}", i).as_bytes(), b"value").unwrap();
            let current = db.size();
            assert!(current > previous);
            previous = current;
        }
    }

    #[test]
    fn full_active_segment_rotates() {
        let dir = tempfile::tempdir().unwrap();
        // every record is 19 bytes, so the second put rotates
        let mut db = Db::open_with(dir.path(), 16).unwrap();

        db.put(b"k1", b"00000000").unwrap();
        db.put(b"k2", b"11111111").unwrap();

        assert_eq!(
            segment_files(dir.path()),
            vec!["current-data-0", "current-data-1"]
        );
        assert_eq!(db.get(b"k1").unwrap(), b"00000000");
        assert_eq!(db.get(b"k2").unwrap(), b"11111111");
    }

    #[test]
    fn merge_keeps_last_values_and_drops_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Db::open_with(dir.path(), 64).unwrap();

        db.put(b"doomed", b"payload").unwrap();
        db.delete(b"doomed").unwrap();
        for round in 0..30 {
            for key in ["k1", "k2", "k3"] {
                let value = format!("{}-{}", key, round);
                db.put(key.as_bytes(), value.as_bytes()).unwrap();
            }
        }

        assert_eq!(db.get(b"k1").unwrap(), b"k1-29");
        assert_eq!(db.get(b"k2").unwrap(), b"k2-29");
        assert_eq!(db.get(b"k3").unwrap(), b"k3-29");
        assert!(matches!(db.get(b"doomed"), Err(DbError::NotFound)));

        // merged repeatedly: far fewer files on disk than records written
        assert!(segment_files(dir.path()).len() < 8);

        // the tombstoned key is physically gone from the merged segments
        let mut all_bytes = vec![];
        for name in segment_files(dir.path()) {
            all_bytes.extend(std::fs::read(dir.path().join(name)).unwrap());
        }
        let needle = b"doomed";
        let found = all_bytes
            .windows(needle.len())
            .any(|window| window == needle);
        assert!(!found);
    }

    #[test]
    fn merge_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Db::open_with(dir.path(), 64).unwrap();
        for round in 0..30 {
            for key in ["a", "b", "c", "d"] {
                let value = format!("{}{}", key, round);
                db.put(key.as_bytes(), value.as_bytes()).unwrap();
            }
        }
        db.delete(b"d").unwrap();
        db.close().unwrap();

        let db = Db::open_with(dir.path(), 64).unwrap();
        assert_eq!(db.get(b"a").unwrap(), b"a29");
        assert_eq!(db.get(b"b").unwrap(), b"b29");
        assert_eq!(db.get(b"c").unwrap(), b"c29");
        assert!(matches!(db.get(b"d"), Err(DbError::NotFound)));
    }

    #[test]
    fn torn_tail_is_discarded_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Db::open(dir.path()).unwrap();
        db.put(b"k1", b"v1").unwrap();
        let whole = db.size();
        db.put(b"k2", b"v2").unwrap();
        db.close().unwrap();

        // chop the second record in half, as a crash mid-append would
        let path = dir.path().join("current-data-0");
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap();
        file.set_len(whole + 3).unwrap();
        drop(file);

        let db = Db::open(dir.path()).unwrap();
        assert_eq!(db.get(b"k1").unwrap(), b"v1");
        assert!(matches!(db.get(b"k2"), Err(DbError::NotFound)));
    }

    #[test]
    fn open_rejects_bad_segment_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("current-data-zzz"), b"junk").unwrap();

        let result = Db::open(dir.path());
        assert!(matches!(result, Err(DbError::InvalidSegmentFile(_))));
    }
}
