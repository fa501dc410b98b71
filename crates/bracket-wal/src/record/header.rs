//! Log record framing.
//!
//! Every record is a fixed 44-byte header followed by the encoded
//! [`LogOperation`]:
//!
//! ```text
//! +---------+----------+-----------+---------------+-------+----------+--------+----------+
//! | LSN (8) | Prev (8) | TxnId (8) | UndoNext (8)  | Flags | Reserved | Length | Checksum |
//! +---------+----------+-----------+---------------+-------+----------+--------+----------+
//! |                         Operation (tag + payload, Length bytes)                        |
//! +----------------------------------------------------------------------------------------+
//! ```
//!
//! `UndoNext` is only meaningful for compensation records: it names the next
//! record of the transaction that still has to be undone.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use bracket_common::types::{Lsn, TxnId};

use super::operation::LogOperation;
use crate::error::{LogError, LogResult};

bitflags::bitflags! {
    /// Flags for log records.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RecordFlags: u8 {
        /// Record carries redo information.
        const REDO = 0b0000_0001;
        /// Record carries undo information.
        const UNDO = 0b0000_0010;
        /// Record is a compensation log record (CLR).
        const CLR = 0b0000_0100;
    }
}

/// A complete log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Log Sequence Number of this record.
    pub lsn: Lsn,
    /// Previous record of the same transaction (undo chain).
    pub prev_lsn: Lsn,
    /// Transaction that wrote the record.
    pub txn_id: TxnId,
    /// For CLRs: next record to undo. `Lsn::INVALID` ends the chain.
    pub undo_next: Lsn,
    /// Record flags.
    pub flags: RecordFlags,
    /// The logged operation.
    pub op: LogOperation,
}

impl LogRecord {
    /// Size of the fixed header in bytes.
    pub const HEADER_SIZE: usize = 44;

    /// Creates an undoable update record.
    pub fn update(lsn: Lsn, prev_lsn: Lsn, txn_id: TxnId, op: LogOperation) -> Self {
        Self {
            lsn,
            prev_lsn,
            txn_id,
            undo_next: Lsn::INVALID,
            flags: RecordFlags::REDO | RecordFlags::UNDO,
            op,
        }
    }

    /// Creates a redo-only record.
    pub fn redo_only(lsn: Lsn, prev_lsn: Lsn, txn_id: TxnId, op: LogOperation) -> Self {
        Self {
            lsn,
            prev_lsn,
            txn_id,
            undo_next: Lsn::INVALID,
            flags: RecordFlags::REDO,
            op,
        }
    }

    /// Creates a compensation record.
    pub fn clr(lsn: Lsn, prev_lsn: Lsn, txn_id: TxnId, undo_next: Lsn, op: LogOperation) -> Self {
        Self {
            lsn,
            prev_lsn,
            txn_id,
            undo_next,
            flags: RecordFlags::REDO | RecordFlags::CLR,
            op,
        }
    }

    /// Returns true if this is a compensation record.
    pub fn is_clr(&self) -> bool {
        self.flags.contains(RecordFlags::CLR)
    }

    /// Returns true if rollback must undo this record.
    pub fn is_undoable(&self) -> bool {
        self.flags.contains(RecordFlags::UNDO) && !self.is_clr()
    }

    /// Total encoded size (header + operation).
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE + self.op.encoded_len()
    }

    /// Encodes the record with its checksum.
    pub fn encode(&self) -> Bytes {
        let payload = self.op.encode();
        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + payload.len());
        self.put_header_fields(&mut buf, payload.len() as u32);
        let checksum = Self::checksum(&buf, &payload);
        buf.put_u32(checksum);
        buf.put_slice(&payload);
        buf.freeze()
    }

    /// Decodes one record from the start of `bytes`.
    ///
    /// Returns the record and the number of bytes it occupied.
    pub fn decode(bytes: &[u8]) -> LogResult<(Self, usize)> {
        if bytes.len() < Self::HEADER_SIZE {
            return Err(LogError::truncated(
                "record header",
                Self::HEADER_SIZE,
                bytes.len(),
            ));
        }

        let mut buf = bytes;
        let lsn = Lsn::new(buf.get_u64());
        let prev_lsn = Lsn::new(buf.get_u64());
        let txn_id = TxnId::new(buf.get_u64());
        let undo_next = Lsn::new(buf.get_u64());
        let flags = RecordFlags::from_bits_truncate(buf.get_u8());
        buf.advance(3);
        let len = buf.get_u32() as usize;
        let expected = buf.get_u32();

        if buf.len() < len {
            return Err(LogError::truncated("record payload", len, buf.len()));
        }
        let payload = &buf[..len];
        let computed = Self::checksum(&bytes[..Self::HEADER_SIZE - 4], payload);
        if computed != expected {
            return Err(LogError::checksum_mismatch(lsn, expected, computed));
        }

        let op = LogOperation::decode(payload)?;
        Ok((
            Self {
                lsn,
                prev_lsn,
                txn_id,
                undo_next,
                flags,
                op,
            },
            Self::HEADER_SIZE + len,
        ))
    }

    fn put_header_fields(&self, buf: &mut BytesMut, len: u32) {
        buf.put_u64(self.lsn.as_u64());
        buf.put_u64(self.prev_lsn.as_u64());
        buf.put_u64(self.txn_id.as_u64());
        buf.put_u64(self.undo_next.as_u64());
        buf.put_u8(self.flags.bits());
        buf.put_slice(&[0u8; 3]); // reserved
        buf.put_u32(len);
    }

    fn checksum(header: &[u8], payload: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(header);
        hasher.update(payload);
        hasher.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bracket_common::types::{PageId, UnitId};

    fn allocate() -> LogOperation {
        LogOperation::Allocate {
            page: PageId::new(1, 3),
            unit: UnitId::new(1),
        }
    }

    #[test]
    fn test_record_round_trip() {
        let record = LogRecord::update(Lsn::new(7), Lsn::new(5), TxnId::new(2), allocate());
        let bytes = record.encode();
        assert_eq!(bytes.len(), record.encoded_len());

        let (decoded, used) = LogRecord::decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, record);
        assert!(decoded.is_undoable());
    }

    #[test]
    fn test_clr_flags() {
        let record = LogRecord::clr(
            Lsn::new(9),
            Lsn::new(8),
            TxnId::new(2),
            Lsn::new(4),
            LogOperation::SmoEnd,
        );
        assert!(record.is_clr());
        assert!(!record.is_undoable());

        let (decoded, _) = LogRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded.undo_next, Lsn::new(4));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let record = LogRecord::redo_only(Lsn::new(1), Lsn::INVALID, TxnId::new(1), allocate());
        let mut bytes = record.encode().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x40;

        let err = LogRecord::decode(&bytes).unwrap_err();
        assert!(matches!(err, LogError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_torn_record() {
        let record = LogRecord::update(Lsn::new(1), Lsn::INVALID, TxnId::new(1), allocate());
        let bytes = record.encode();
        assert!(LogRecord::decode(&bytes[..bytes.len() - 2]).is_err());
        assert!(LogRecord::decode(&bytes[..10]).is_err());
    }
}
