use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::os::unix::fs::FileExt;
use thiserror::Error;

pub const KIND_PUT: u8 = 0;
pub const KIND_TOMBSTONE: u8 = 1;

const KIND_WIDTH: usize = 1; // leading kind byte
const LEN_WIDTH: usize = 4; // u32 length prefix for keys and values

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("unknown record kind {0:#04x}")]
    UnknownKind(u8),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// A single entry in a segment file.
///
/// ```text
/// 0      1        5     5+kl       9+kl      <-- offset
/// (kind) (key_len) (key) (value_len) (value)
/// 1      4        kl    4          vl        <-- length
/// ```
///
/// Tombstones stop after the key. Lengths are little-endian u32.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Put { key: Vec<u8>, value: Vec<u8> },
    Tombstone { key: Vec<u8> },
}

impl Record {
    pub fn key(&self) -> &[u8] {
        match self {
            Record::Put { key, .. } => key,
            Record::Tombstone { key } => key,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Record::Put { key, value } => KIND_WIDTH + LEN_WIDTH + key.len() + LEN_WIDTH + value.len(),
            Record::Tombstone { key } => KIND_WIDTH + LEN_WIDTH + key.len(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        match self {
            Record::Put { key, value } => {
                buf[0] = KIND_PUT;
                LittleEndian::write_u32(&mut buf[1..5], key.len() as u32);
                buf[5..5 + key.len()].copy_from_slice(key);
                let at = 5 + key.len();
                LittleEndian::write_u32(&mut buf[at..at + 4], value.len() as u32);
                buf[at + 4..].copy_from_slice(value);
            }
            Record::Tombstone { key } => {
                buf[0] = KIND_TOMBSTONE;
                LittleEndian::write_u32(&mut buf[1..5], key.len() as u32);
                buf[5..].copy_from_slice(key);
            }
        }
        buf
    }

    /// Reads the record starting at `offset`, returning it together with
    /// the number of bytes it occupies on disk so callers can advance.
    pub fn read_at(file: &File, offset: u64) -> Result<(Record, u64), RecordError> {
        let mut kind = [0u8; KIND_WIDTH];
        file.read_exact_at(&mut kind, offset)?;
        match kind[0] {
            KIND_PUT | KIND_TOMBSTONE => {}
            other => return Err(RecordError::UnknownKind(other)),
        }

        let key = read_chunk(file, offset + KIND_WIDTH as u64)?;
        let consumed = (KIND_WIDTH + LEN_WIDTH + key.len()) as u64;
        if kind[0] == KIND_TOMBSTONE {
            return Ok((Record::Tombstone { key }, consumed));
        }

        let value = read_chunk(file, offset + consumed)?;
        let consumed = consumed + (LEN_WIDTH + value.len()) as u64;
        Ok((Record::Put { key, value }, consumed))
    }
}

// One length-prefixed byte string at `offset`.
fn read_chunk(file: &File, offset: u64) -> Result<Vec<u8>, RecordError> {
    let mut len_buf = [0u8; LEN_WIDTH];
    file.read_exact_at(&mut len_buf, offset)?;
    let len = LittleEndian::read_u32(&len_buf) as usize;

    let mut data = vec![0u8; len];
    file.read_exact_at(&mut data, offset + LEN_WIDTH as u64)?;
    Ok(data)
}

/// Lazy forward scan over the records of one file.
///
/// Terminates silently on the first read or framing error, so a record
/// torn by a crash at the tail of a segment is simply not yielded.
pub struct RecordIter<'a> {
    file: &'a File,
    offset: u64,
}

impl<'a> RecordIter<'a> {
    pub fn new(file: &'a File) -> RecordIter<'a> {
        RecordIter { file, offset: 0 }
    }
}

impl Iterator for RecordIter<'_> {
    type Item = (u64, Record);

    fn next(&mut self) -> Option<Self::Item> {
        match Record::read_at(self.file, self.offset) {
            Ok((record, consumed)) => {
                let start = self.offset;
                self.offset += consumed;
                Some((start, record))
            }
            Err(_) => None,
        }
    }
}
