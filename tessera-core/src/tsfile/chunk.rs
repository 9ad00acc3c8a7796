//! Chunk encoding: the points of one measurement written by one flush

use crate::{DataType, Result, TesseraError, TimeValuePair, Timestamp};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Fixed part of a chunk ahead of the measurement name:
/// name length u16
const NAME_LEN_SIZE: usize = 2;

/// Fixed part after the name: type u8, count u32, start i64, end i64,
/// lz4 flag u8, data length u32
const META_SIZE: usize = 1 + 4 + 8 + 8 + 1 + 4;

/// A decoded chunk
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub measurement: String,
    pub data_type: DataType,
    /// Points in ascending time order
    pub points: Vec<TimeValuePair>,
}

impl Chunk {
    pub fn new(
        measurement: impl Into<String>,
        data_type: DataType,
        points: Vec<TimeValuePair>,
    ) -> Self {
        Self {
            measurement: measurement.into(),
            data_type,
            points,
        }
    }

    pub fn start_time(&self) -> Timestamp {
        self.points.first().map_or(Timestamp::MAX, |p| p.timestamp)
    }

    pub fn end_time(&self) -> Timestamp {
        self.points.last().map_or(Timestamp::MIN, |p| p.timestamp)
    }

    /// Serialize to bytes with optional LZ4 compression
    ///
    /// Format:
    /// - 2 bytes: measurement name length, N bytes: name
    /// - 1 byte: data type
    /// - 4 bytes: point count
    /// - 8 bytes: first timestamp, 8 bytes: last timestamp
    /// - 1 byte: LZ4 flag
    /// - 4 bytes: data length, N bytes: bincode-encoded points
    /// - 4 bytes: CRC32 of everything before it
    pub fn to_bytes(&self, use_lz4: bool) -> Result<Bytes> {
        let encoded = bincode::serialize(&self.points)?;
        let data = if use_lz4 {
            lz4_flex::compress_prepend_size(&encoded)
        } else {
            encoded
        };

        let mut buf = BytesMut::with_capacity(
            NAME_LEN_SIZE + self.measurement.len() + META_SIZE + data.len() + 4,
        );
        buf.put_u16_le(self.measurement.len() as u16);
        buf.put_slice(self.measurement.as_bytes());

        buf.put_u8(self.data_type as u8);
        buf.put_u32_le(self.points.len() as u32);
        buf.put_i64_le(self.start_time());
        buf.put_i64_le(self.end_time());

        buf.put_u8(u8::from(use_lz4));
        buf.put_u32_le(data.len() as u32);
        buf.put_slice(&data);

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);

        Ok(buf.freeze())
    }

    /// Deserialize from bytes, validating the checksum
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < NAME_LEN_SIZE + META_SIZE + 4 {
            return Err(TesseraError::InvalidFormat("Chunk too short".into()));
        }

        let mut cursor = std::io::Cursor::new(data);

        let name_len = cursor.get_u16_le() as usize;
        let pos = cursor.position() as usize;
        if pos + name_len + META_SIZE + 4 > data.len() {
            return Err(TesseraError::Corruption("Chunk name overruns chunk".into()));
        }
        let measurement = String::from_utf8(data[pos..pos + name_len].to_vec())
            .map_err(|e| TesseraError::InvalidFormat(e.to_string()))?;
        cursor.set_position((pos + name_len) as u64);

        let data_type = DataType::try_from(cursor.get_u8())?;
        let count = cursor.get_u32_le() as usize;
        let _start = cursor.get_i64_le();
        let _end = cursor.get_i64_le();

        let lz4_flag = cursor.get_u8();
        let data_len = cursor.get_u32_le() as usize;
        let pos = cursor.position() as usize;

        let checksum_pos = pos + data_len;
        if checksum_pos + 4 > data.len() {
            return Err(TesseraError::InvalidFormat("Missing checksum".into()));
        }
        let expected_checksum = {
            let mut c = std::io::Cursor::new(&data[checksum_pos..]);
            c.get_u32_le()
        };
        let actual_checksum = crc32fast::hash(&data[..checksum_pos]);
        if expected_checksum != actual_checksum {
            return Err(TesseraError::ChecksumMismatch {
                expected: expected_checksum,
                actual: actual_checksum,
            });
        }

        let raw = &data[pos..checksum_pos];
        let decoded = if lz4_flag == 1 {
            lz4_flex::decompress_size_prepended(raw)
                .map_err(|e| TesseraError::Compression(e.to_string()))?
        } else {
            raw.to_vec()
        };
        let points: Vec<TimeValuePair> = bincode::deserialize(&decoded)?;
        if points.len() != count {
            return Err(TesseraError::Corruption(format!(
                "chunk {} declares {} points, holds {}",
                measurement,
                count,
                points.len()
            )));
        }

        Ok(Self {
            measurement,
            data_type,
            points,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    fn chunk() -> Chunk {
        let points = (0..50)
            .map(|i| TimeValuePair::new(i * 1000, Value::Double(i as f64)))
            .collect();
        Chunk::new("value", DataType::Double, points)
    }

    #[test]
    fn test_chunk_serialization() {
        for use_lz4 in [true, false] {
            let bytes = chunk().to_bytes(use_lz4).unwrap();
            let restored = Chunk::from_bytes(&bytes).unwrap();
            assert_eq!(restored, chunk());
            assert_eq!(restored.start_time(), 0);
            assert_eq!(restored.end_time(), 49_000);
        }
    }

    #[test]
    fn test_corrupt_chunk() {
        let mut bytes = chunk().to_bytes(false).unwrap().to_vec();
        let last = bytes.len() - 10;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            Chunk::from_bytes(&bytes),
            Err(TesseraError::ChecksumMismatch { .. })
        ));
    }
}
