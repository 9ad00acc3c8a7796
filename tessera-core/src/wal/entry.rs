//! Framing of one log record
//!
//! `len: u32 | kind: u8 | payload | crc32: u32`, little endian. `len` counts
//! every byte after itself; the checksum covers kind and payload.

use super::LogRecord;
use crate::{Result, TesseraError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const LEN_FIELD: usize = 4;
const CRC_FIELD: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    Insert = 1,
    Update = 2,
    Delete = 3,
}

impl EntryKind {
    fn of(record: &LogRecord) -> Self {
        match record {
            LogRecord::Insert(_) => EntryKind::Insert,
            LogRecord::Update { .. } => EntryKind::Update,
            LogRecord::Delete { .. } => EntryKind::Delete,
        }
    }
}

impl TryFrom<u8> for EntryKind {
    type Error = TesseraError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(EntryKind::Insert),
            2 => Ok(EntryKind::Update),
            3 => Ok(EntryKind::Delete),
            other => Err(TesseraError::InvalidFormat(format!(
                "unknown log entry kind {}",
                other
            ))),
        }
    }
}

/// Outcome of decoding the bytes at one offset of a segment
#[derive(Debug)]
pub enum Decoded {
    /// A valid entry and the bytes it occupied
    Entry(WalEntry, usize),
    /// The frame runs past the end of the data: a write cut short by a crash
    Torn,
    Corrupt(String),
}

/// One framed record
#[derive(Debug, Clone)]
pub struct WalEntry {
    pub kind: EntryKind,
    /// bincode of the [`LogRecord`]
    pub payload: Bytes,
}

impl WalEntry {
    pub fn new(record: &LogRecord) -> Result<Self> {
        Ok(Self {
            kind: EntryKind::of(record),
            payload: Bytes::from(bincode::serialize(record)?),
        })
    }

    pub fn record(&self) -> Result<LogRecord> {
        let record: LogRecord = bincode::deserialize(&self.payload)?;
        if EntryKind::of(&record) != self.kind {
            return Err(TesseraError::Corruption(format!(
                "log entry marked {:?} holds a {:?} record",
                self.kind,
                EntryKind::of(&record)
            )));
        }
        Ok(record)
    }

    pub fn encode(&self) -> Bytes {
        let body_len = 1 + self.payload.len();
        let mut buf = BytesMut::with_capacity(LEN_FIELD + body_len + CRC_FIELD);
        buf.put_u32_le((body_len + CRC_FIELD) as u32);
        buf.put_u8(self.kind as u8);
        buf.put_slice(&self.payload);
        let crc = crc32fast::hash(&buf[LEN_FIELD..]);
        buf.put_u32_le(crc);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Decoded {
        if data.len() < LEN_FIELD {
            return Decoded::Torn;
        }
        let mut header = &data[..LEN_FIELD];
        let len = header.get_u32_le() as usize;
        if len < 1 + CRC_FIELD {
            return Decoded::Corrupt(format!("frame length {}", len));
        }
        let Some(frame) = data.get(LEN_FIELD..LEN_FIELD + len) else {
            return Decoded::Torn;
        };

        let (body, mut trailer) = frame.split_at(len - CRC_FIELD);
        let expected = trailer.get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Decoded::Corrupt(format!(
                "checksum {:#010x}, computed {:#010x}",
                expected, actual
            ));
        }
        match EntryKind::try_from(body[0]) {
            Ok(kind) => Decoded::Entry(
                WalEntry {
                    kind,
                    payload: Bytes::copy_from_slice(&body[1..]),
                },
                LEN_FIELD + len,
            ),
            Err(e) => Decoded::Corrupt(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SeriesPath, TsRecord};

    fn insert() -> LogRecord {
        LogRecord::Insert(TsRecord::new("root.sg.d1", 100).with_point("s1", 1.5f64))
    }

    #[test]
    fn test_decode_frame() {
        let encoded = WalEntry::new(&insert()).unwrap().encode();
        match WalEntry::decode(&encoded) {
            Decoded::Entry(entry, used) => {
                assert_eq!(used, encoded.len());
                assert_eq!(entry.kind, EntryKind::Insert);
                assert_eq!(entry.record().unwrap(), insert());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_flipped_byte_is_corrupt() {
        let record = LogRecord::Delete {
            path: SeriesPath::new("root.sg.d1", "s1"),
            timestamp: 10,
        };
        let mut encoded = WalEntry::new(&record).unwrap().encode().to_vec();
        encoded[6] ^= 0xff;
        assert!(matches!(WalEntry::decode(&encoded), Decoded::Corrupt(_)));
    }

    #[test]
    fn test_short_frame_is_torn() {
        let encoded = WalEntry::new(&insert()).unwrap().encode();
        assert!(matches!(
            WalEntry::decode(&encoded[..encoded.len() - 3]),
            Decoded::Torn
        ));
        assert!(matches!(WalEntry::decode(&encoded[..2]), Decoded::Torn));
    }

    #[test]
    fn test_kind_must_match_record() {
        let mut entry = WalEntry::new(&insert()).unwrap();
        entry.kind = EntryKind::Update;
        assert!(matches!(entry.record(), Err(TesseraError::Corruption(_))));
    }
}
