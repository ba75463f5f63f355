use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::PathBuf;

use super::record::{Record, RecordError, RecordIter};

/// One `current-data-<id>` file.
///
/// Does not enforce any size limit itself; the owning store decides when
/// a segment is full. Appends go through the tracked size so record
/// boundaries stay implicit in the length-prefixed framing.
pub(crate) struct Segment {
    pub file: File,
    pub path: PathBuf,
    pub id: u64,
    pub size: u64,
}

impl Segment {
    pub fn create(path: PathBuf, id: u64) -> io::Result<Segment> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;
        Ok(Segment {
            file,
            path,
            id,
            size: 0,
        })
    }

    pub fn open(path: PathBuf, id: u64) -> io::Result<Segment> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len();
        Ok(Segment {
            file,
            path,
            id,
            size,
        })
    }

    /// Appends `data` at the current tail and returns the offset it
    /// starts at.
    pub fn append(&mut self, data: &[u8]) -> io::Result<u64> {
        let offset = self.size;
        self.file.write_all_at(data, offset)?;
        self.size += data.len() as u64;
        Ok(offset)
    }

    pub fn read_record(&self, offset: u64) -> Result<(Record, u64), RecordError> {
        Record::read_at(&self.file, offset)
    }

    pub fn iter(&self) -> RecordIter<'_> {
        RecordIter::new(&self.file)
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }
}
