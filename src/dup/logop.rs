//! Serialization and replay-side merging of combined lease + tablet-set
//! snapshot log entries.
//!
//! An entry is one rmp-serde encoded body behind a fixed header carrying a
//! magic and the body length, so the log stream may split it across
//! multiple physical records; the replay side merges fragments keyed by
//! the entry's lsn until the declared length is complete.

use crate::dup::lease::LeaseGrant;
use crate::dup::tablets::TabletSetSnapshot;
use crate::dup::{Lsn, ReplicaAddr, Scn};
use crate::utils::DuplicaError;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use serde::{Deserialize, Serialize};

/// Magic leading every serialized snapshot entry.
const DUP_LOG_MAGIC: u16 = 0xD1B1;

/// Header bytes: magic (2) + body length (8).
const HEADER_LEN: usize = 10;

/// Logical payload of one replicated snapshot entry.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub(crate) struct DupTableLogBody {
    /// Granted lease per follower address at submission time.
    pub(crate) lease_grants: Vec<(ReplicaAddr, LeaseGrant)>,

    /// Readable/pending tablet sets at submission time.
    pub(crate) tablet_set: TabletSetSnapshot,
}

/// Serializes a snapshot body into the on-log byte form.
pub(crate) fn serialize_entry(
    body: &DupTableLogBody,
) -> Result<Bytes, DuplicaError> {
    let payload = rmp_serde::encode::to_vec(body)?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u16(DUP_LOG_MAGIC);
    buf.put_u64(payload.len() as u64);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Accumulation state of one partially delivered entry.
struct PendingEntry {
    lsn: Lsn,
    expected_len: usize,
    buf: BytesMut,
}

/// Replay-side merger of possibly fragmented snapshot entries.
pub(crate) struct LogEntryMerger {
    pending: Option<PendingEntry>,

    /// Highest lsn already merged to completion; duplicate delivery at or
    /// below it is skipped.
    last_completed: Option<Lsn>,
}

impl LogEntryMerger {
    pub(crate) fn new() -> Self {
        LogEntryMerger {
            pending: None,
            last_completed: None,
        }
    }

    /// Feeds one physical record's bytes. Returns the decoded body once an
    /// entry completes. A record that does not continue the pending entry
    /// and does not start with a valid header is a replay cursor landing
    /// mid-entry; it is skipped, not treated as corruption.
    pub(crate) fn feed(
        &mut self,
        record: &[u8],
        lsn: Lsn,
        _scn: Scn,
    ) -> Result<Option<DupTableLogBody>, DuplicaError> {
        if let Some(done) = self.last_completed {
            if lsn <= done {
                pf_trace!("skipping duplicate record at {:?}", lsn);
                return Ok(None);
            }
        }

        match &mut self.pending {
            Some(pending) if pending.lsn == lsn => {
                pending.buf.put_slice(record);
            }
            _ => {
                if self.pending.is_some() {
                    // fragments of the previous entry stopped arriving;
                    // abandon it in favor of the new one
                    pf_warn!(
                        "abandoning incomplete entry at {:?}",
                        self.pending.as_ref().unwrap().lsn
                    );
                    self.pending = None;
                }
                if record.len() < HEADER_LEN {
                    pf_debug!("short record at {:?}, skipped", lsn);
                    return Ok(None);
                }
                let mut header = &record[..HEADER_LEN];
                if header.get_u16() != DUP_LOG_MAGIC {
                    // replay started from the middle of an entry
                    pf_debug!("mid-entry record at {:?}, skipped", lsn);
                    return Ok(None);
                }
                let expected_len = header.get_u64() as usize;
                let mut buf = BytesMut::with_capacity(expected_len);
                buf.put_slice(&record[HEADER_LEN..]);
                self.pending = Some(PendingEntry {
                    lsn,
                    expected_len,
                    buf,
                });
            }
        }

        let pending = self.pending.as_ref().unwrap();
        if pending.buf.len() < pending.expected_len {
            return Ok(None);
        }
        if pending.buf.len() > pending.expected_len {
            pf_warn!(
                "entry at {:?} overran declared length {} > {}, dropped",
                pending.lsn,
                pending.buf.len(),
                pending.expected_len
            );
            self.pending = None;
            return Ok(None);
        }

        let pending = self.pending.take().unwrap();
        let body: DupTableLogBody =
            rmp_serde::decode::from_slice(&pending.buf)?;
        self.last_completed = Some(pending.lsn);
        Ok(Some(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dup::TabletId;

    fn sample_body() -> DupTableLogBody {
        DupTableLogBody {
            lease_grants: vec![(
                "127.0.0.1:7701".parse().unwrap(),
                LeaseGrant {
                    grant_ts_us: 1_000_000,
                    lease_interval_us: 10_000_000,
                },
            )],
            tablet_set: TabletSetSnapshot {
                readable: vec![TabletId(101)],
                need_confirm: vec![TabletId(102)],
            },
        }
    }

    #[test]
    fn whole_record_roundtrip() -> Result<(), DuplicaError> {
        let body = sample_body();
        let bytes = serialize_entry(&body)?;

        let mut merger = LogEntryMerger::new();
        let merged = merger.feed(&bytes, Lsn(10), Scn(100))?;
        assert_eq!(merged, Some(body));
        Ok(())
    }

    #[test]
    fn fragmented_delivery() -> Result<(), DuplicaError> {
        let body = sample_body();
        let bytes = serialize_entry(&body)?;
        let cut1 = bytes.len() / 3;
        let cut2 = 2 * bytes.len() / 3;

        let mut merger = LogEntryMerger::new();
        assert_eq!(merger.feed(&bytes[..cut1], Lsn(10), Scn(100))?, None);
        assert_eq!(
            merger.feed(&bytes[cut1..cut2], Lsn(10), Scn(100))?,
            None
        );
        assert_eq!(
            merger.feed(&bytes[cut2..], Lsn(10), Scn(100))?,
            Some(body)
        );
        Ok(())
    }

    #[test]
    fn mid_entry_start_skipped() -> Result<(), DuplicaError> {
        let body = sample_body();
        let bytes = serialize_entry(&body)?;
        let cut = bytes.len() / 2;

        // replay begins at the tail fragment of an entry: skipped, and the
        // next complete entry still merges fine
        let mut merger = LogEntryMerger::new();
        assert_eq!(merger.feed(&bytes[cut..], Lsn(10), Scn(100))?, None);
        assert_eq!(
            merger.feed(&bytes, Lsn(11), Scn(101))?,
            Some(body)
        );
        Ok(())
    }

    #[test]
    fn duplicate_delivery_idempotent() -> Result<(), DuplicaError> {
        let body = sample_body();
        let bytes = serialize_entry(&body)?;

        let mut merger = LogEntryMerger::new();
        assert!(merger.feed(&bytes, Lsn(10), Scn(100))?.is_some());
        // same record delivered again
        assert_eq!(merger.feed(&bytes, Lsn(10), Scn(100))?, None);
        // older record delivered late
        assert_eq!(merger.feed(&bytes, Lsn(9), Scn(99))?, None);
        Ok(())
    }

    #[test]
    fn stale_pending_abandoned() -> Result<(), DuplicaError> {
        let body = sample_body();
        let bytes = serialize_entry(&body)?;
        let cut = bytes.len() / 2;

        let mut merger = LogEntryMerger::new();
        assert_eq!(merger.feed(&bytes[..cut], Lsn(10), Scn(100))?, None);
        // fragments for lsn 10 never finish; a fresh entry at lsn 12 takes over
        assert_eq!(
            merger.feed(&bytes, Lsn(12), Scn(102))?,
            Some(body)
        );
        Ok(())
    }
}
