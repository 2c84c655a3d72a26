//! Log frames and their on-disk envelope.
//!
//! ```text
//! magic (4) | version u16 LE (2) | payload length u32 LE (4) | CBOR payload | crc32 LE (4)
//! ```
//!
//! The CRC covers header and payload.

use crate::backend::StorageBackend;
use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use vaultsync_protocol::{ChangeRecord, Cursor, OwnerId};

/// Magic bytes opening every frame.
pub(crate) const FRAME_MAGIC: [u8; 4] = *b"VSLG";

/// Current frame format version.
pub(crate) const FRAME_VERSION: u16 = 1;

/// magic (4) + version (2) + length (4)
pub(crate) const HEADER_SIZE: usize = 10;

pub(crate) const CRC_SIZE: usize = 4;

/// One entry of either log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum LogEntry {
    /// A record received from elsewhere (download or sibling broadcast).
    Change { record: ChangeRecord },
    /// A record produced on this device, pending upload for `owner`.
    LocalChange { owner: OwnerId, record: ChangeRecord },
    /// The remote log accepted these ids.
    Acknowledged { owner: OwnerId, ids: Vec<String> },
    /// The remote log holds a different payload under these ids.
    Rejected { owner: OwnerId, ids: Vec<String> },
    /// Cursor reached by the last successful download.
    Cursor { owner: OwnerId, cursor: Cursor },
}

impl LogEntry {
    /// Returns the record carried by change entries.
    pub(crate) fn into_record(self) -> Option<ChangeRecord> {
        match self {
            LogEntry::Change { record } | LogEntry::LocalChange { record, .. } => Some(record),
            _ => None,
        }
    }
}

/// Encodes an entry into a complete frame.
pub(crate) fn encode_frame(entry: &LogEntry) -> StoreResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(entry, &mut payload).map_err(|e| StoreError::Codec(e.to_string()))?;

    let len = u32::try_from(payload.len())
        .map_err(|_| StoreError::Codec(format!("frame payload too large: {} bytes", payload.len())))?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    buf.extend_from_slice(&FRAME_MAGIC);
    buf.extend_from_slice(&FRAME_VERSION.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&payload);
    let crc = compute_crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());

    Ok(buf)
}

/// Decodes a complete frame previously produced by [`encode_frame`].
pub(crate) fn decode_frame(bytes: &[u8]) -> StoreResult<LogEntry> {
    if bytes.len() < HEADER_SIZE + CRC_SIZE {
        return Err(StoreError::corrupted("frame shorter than its envelope"));
    }
    let header = parse_header(&bytes[..HEADER_SIZE])?;
    if bytes.len() != header.frame_len() {
        return Err(StoreError::corrupted(format!(
            "frame length {} does not match header length {}",
            bytes.len(),
            header.frame_len()
        )));
    }

    let body_end = HEADER_SIZE + header.payload_len;
    let stored = read_u32(&bytes[body_end..])?;
    let computed = compute_crc32(&bytes[..body_end]);
    if stored != computed {
        return Err(StoreError::ChecksumMismatch {
            expected: stored,
            actual: computed,
        });
    }

    ciborium::from_reader(&bytes[HEADER_SIZE..body_end])
        .map_err(|e| StoreError::Codec(e.to_string()))
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHeader {
    pub(crate) payload_len: usize,
}

impl FrameHeader {
    pub(crate) fn frame_len(self) -> usize {
        HEADER_SIZE + self.payload_len + CRC_SIZE
    }
}

/// Parses a frame header.
///
/// Fails on bad magic or an unsupported version.
pub(crate) fn parse_header(header: &[u8]) -> StoreResult<FrameHeader> {
    if header.len() < HEADER_SIZE || header[0..4] != FRAME_MAGIC {
        return Err(StoreError::corrupted("invalid frame magic"));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version > FRAME_VERSION {
        return Err(StoreError::corrupted(format!(
            "unsupported frame version {version}"
        )));
    }
    let payload_len = read_u32(&header[6..10])? as usize;
    Ok(FrameHeader { payload_len })
}

fn read_u32(bytes: &[u8]) -> StoreResult<u32> {
    let arr: [u8; 4] = bytes
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| StoreError::corrupted("unexpected end of frame"))?;
    Ok(u32::from_le_bytes(arr))
}

/// A frame read back from a log during a scan.
#[derive(Debug)]
pub(crate) enum ScanItem {
    /// A well-formed frame.
    Entry {
        offset: u64,
        len: u64,
        entry: LogEntry,
    },
    /// Bytes that do not form a verifiable frame, up to the next one that
    /// does (or the end of the log).
    Damaged {
        offset: u64,
        len: u64,
        error: StoreError,
    },
}

/// How a scan stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScanEnd {
    /// Every byte up to the end of the log was accounted for.
    Clean,
    /// The log ends in a partially written frame starting at `offset`, and
    /// no verifiable frame follows it.
    TornTail { offset: u64 },
}

impl ScanEnd {
    /// Length the log can be cut to without losing a readable frame.
    pub(crate) fn valid_len(self, size: u64) -> u64 {
        match self {
            ScanEnd::Clean => size,
            ScanEnd::TornTail { offset } => offset,
        }
    }
}

/// Streams frames out of a backend one at a time.
///
/// Unreadable stretches are yielded as [`ScanItem::Damaged`] and the scan
/// picks up again at the next offset holding a frame whose checksum
/// verifies, so one bad byte costs at most the frame it landed in. Only a
/// frame cut short at the very end of the log stops the scan early;
/// [`FrameScanner::end`] reports it.
pub(crate) struct FrameScanner<'a> {
    backend: &'a dyn StorageBackend,
    size: u64,
    offset: u64,
    end: Option<ScanEnd>,
}

impl<'a> FrameScanner<'a> {
    pub(crate) fn new(backend: &'a dyn StorageBackend) -> StoreResult<Self> {
        let size = backend.size()?;
        Ok(Self {
            backend,
            size,
            offset: 0,
            end: None,
        })
    }

    /// Returns how the scan stopped, once it has.
    pub(crate) fn end(&self) -> Option<ScanEnd> {
        self.end
    }

    /// Total size of the log when the scan started.
    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    fn read_next(&mut self) -> StoreResult<Option<ScanItem>> {
        let offset = self.offset;
        let remaining = self.size - offset;

        if remaining == 0 {
            self.end = Some(ScanEnd::Clean);
            return Ok(None);
        }
        if remaining < HEADER_SIZE as u64 {
            self.end = Some(ScanEnd::TornTail { offset });
            return Ok(None);
        }

        let header = parse_header(&self.backend.read_at(offset, HEADER_SIZE)?);
        if let Ok(header) = &header {
            let len = header.frame_len() as u64;
            if len <= remaining {
                let bytes = self.backend.read_at(offset, header.frame_len())?;
                return match decode_frame(&bytes) {
                    Ok(entry) => {
                        self.offset += len;
                        Ok(Some(ScanItem::Entry { offset, len, entry }))
                    }
                    Err(error) => {
                        // The length field may be the damaged part.
                        let next = offset + len;
                        let resume = if self.frame_starts_at(next)? {
                            next
                        } else {
                            self.resync(offset + 1)?.unwrap_or(self.size)
                        };
                        Ok(Some(self.skip_to(offset, resume, error)))
                    }
                };
            }
        }

        match (self.resync(offset + 1)?, header) {
            (Some(next), Ok(_)) => Ok(Some(self.skip_to(
                offset,
                next,
                StoreError::corrupted("frame length runs into the next frame"),
            ))),
            (Some(next), Err(error)) => Ok(Some(self.skip_to(offset, next, error))),
            (None, Ok(_)) => {
                self.end = Some(ScanEnd::TornTail { offset });
                Ok(None)
            }
            (None, Err(error)) => Ok(Some(self.skip_to(offset, self.size, error))),
        }
    }

    fn skip_to(&mut self, offset: u64, resume: u64, error: StoreError) -> ScanItem {
        self.offset = resume;
        ScanItem::Damaged {
            offset,
            len: resume - offset,
            error,
        }
    }

    /// True at the end of the log, or where a frame header parses.
    fn frame_starts_at(&self, at: u64) -> StoreResult<bool> {
        if self.size - at < HEADER_SIZE as u64 {
            return Ok(true);
        }
        Ok(parse_header(&self.backend.read_at(at, HEADER_SIZE)?).is_ok())
    }

    /// First offset at or after `from` holding a frame that decodes and
    /// whose checksum verifies.
    fn resync(&self, from: u64) -> StoreResult<Option<u64>> {
        if from >= self.size {
            return Ok(None);
        }
        let len = usize::try_from(self.size - from)
            .map_err(|_| StoreError::corrupted("log too large to rescan"))?;
        let tail = self.backend.read_at(from, len)?;

        let mut pos = 0;
        while let Some(hit) = tail[pos..]
            .windows(FRAME_MAGIC.len())
            .position(|w| w == FRAME_MAGIC)
        {
            let at = pos + hit;
            let verified = parse_header(&tail[at..]).is_ok_and(|header| {
                tail.get(at..at + header.frame_len())
                    .is_some_and(|frame| decode_frame(frame).is_ok())
            });
            if verified {
                return Ok(Some(from + at as u64));
            }
            pos = at + 1;
        }
        Ok(None)
    }
}

impl Iterator for FrameScanner<'_> {
    type Item = StoreResult<ScanItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.end.is_some() {
            return None;
        }
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(e) => {
                self.end = Some(ScanEnd::TornTail {
                    offset: self.offset,
                });
                Some(Err(e))
            }
        }
    }
}

/// Computes a CRC32 (IEEE polynomial) checksum.
pub(crate) fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
