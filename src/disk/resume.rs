//! The bencoded resume record: how a torrent's download state survives
//! restarts, and how it is validated against the files actually on disk.
//!
//! Validation is deliberately forgiving in outcome: any mismatch merely
//! demotes the torrent to a full recheck, it never fails the load. The
//! checks themselves are strict, since trusting stale resume data means
//! serving corrupt pieces to the swarm.

use serde_bytes::ByteBuf;

use crate::{
    conf::DiskConf,
    disk::{
        error::{DiskError, ErrorKind, Result},
        storage::Storage,
    },
    Bitfield, BLOCK_LEN,
};

/// The recognized keys of a resume record. Unknown keys are ignored on load;
/// absent optional keys are omitted when writing.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ResumeData {
    /// One `[size, mtime]` pair per file. Required on load.
    #[serde(
        rename = "file sizes",
        skip_serializing_if = "Option::is_none"
    )]
    pub file_sizes: Option<Vec<(i64, i64)>>,
    /// Per-file replacement relative paths; an empty string leaves the name
    /// unchanged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapped_files: Option<Vec<String>>,
    /// Per-file priorities in 0..=7; 0 disables preallocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_priority: Option<Vec<u8>>,
    /// One byte per piece; bit 0 set means the piece is complete.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pieces: Option<ByteBuf>,
    /// Deprecated compact-mode slot table: `slots[i]` is the slot the i-th
    /// piece occupies on disk, or -1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slots: Option<Vec<i64>>,
    /// "sparse", "full" or "compact"; anything but "compact" selects the
    /// modern semantics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation: Option<String>,
    /// Must equal `piece_length / 16384` when present.
    #[serde(
        rename = "blocks per piece",
        skip_serializing_if = "Option::is_none"
    )]
    pub blocks_per_piece: Option<i64>,
}

impl ResumeData {
    /// Decodes a resume record. Anything that is not a bencoded dictionary
    /// of the expected shape is rejected.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        serde_bencode::from_bytes(buf).map_err(|e| {
            log::warn!("Undecodable resume data: {}", e);
            DiskError::new(ErrorKind::NotADictionary)
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_bencode::to_bytes(self)
            .map_err(|_| DiskError::new(ErrorKind::Io))
    }

    /// Whether the record's block size matches ours, when it states one.
    pub fn valid_blocks_per_piece(&self, piece_len: u32) -> bool {
        match self.blocks_per_piece {
            Some(blocks) => blocks == (piece_len / BLOCK_LEN) as i64,
            None => true,
        }
    }

    pub fn is_compact_allocation(&self) -> bool {
        self.allocation.as_deref() == Some("compact")
    }

    /// Whether the record claims the whole torrent is present.
    pub fn is_seed(&self, piece_count: usize) -> bool {
        if let Some(pieces) = &self.pieces {
            return pieces.len() == piece_count
                && pieces.iter().all(|b| b & 1 == 1);
        }
        if let Some(slots) = &self.slots {
            return slots.len() == piece_count
                && slots.iter().all(|s| *s >= 0);
        }
        false
    }

    /// The completed-piece set the record describes, if its length matches
    /// the torrent. Falls back to the legacy `slots` list, where any
    /// non-negative slot means the piece exists.
    pub fn have_pieces(&self, piece_count: usize) -> Option<Bitfield> {
        if let Some(pieces) = &self.pieces {
            if pieces.len() != piece_count {
                return None;
            }
            let mut have = Bitfield::repeat(false, piece_count);
            for (i, byte) in pieces.iter().enumerate() {
                if byte & 1 == 1 {
                    have.set(i, true);
                }
            }
            return Some(have);
        }
        let slots = self.slots.as_ref()?;
        if slots.len() != piece_count {
            return None;
        }
        let mut have = Bitfield::repeat(false, piece_count);
        for (i, slot) in slots.iter().enumerate() {
            if *slot >= 0 {
                have.set(i, true);
            }
        }
        Some(have)
    }
}

/// Validates the resume record against the manifest and the files on disk,
/// applying its renames and priorities as a side effect (they are valid
/// regardless of whether the piece state can be trusted).
///
/// An error means the caller must fall back to a full check.
pub(crate) fn verify_resume(
    storage: &Storage,
    rd: &ResumeData,
    conf: &DiskConf,
) -> Result<()> {
    if let Some(mapped) = &rd.mapped_files {
        storage.apply_mapped_files(mapped);
    }
    if let Some(priorities) = &rd.file_priority {
        if priorities.len() == storage.orig_files().num_files() {
            storage.set_file_priority(priorities.clone());
        }
    }

    let file_sizes = rd
        .file_sizes
        .as_ref()
        .filter(|sizes| !sizes.is_empty())
        .ok_or_else(|| DiskError::new(ErrorKind::MissingFileSizes))?;

    if rd.pieces.is_none() && rd.slots.is_none() {
        return Err(DiskError::new(ErrorKind::MissingPieces));
    }

    let compact = rd.is_compact_allocation();
    // legacy compact-mode records may remap pieces into arbitrary slots;
    // those placements are not honored here, so the piece state cannot be
    // trusted and the torrent gets a full check
    if compact {
        if let Some(slots) = &rd.slots {
            let remapped = slots
                .iter()
                .enumerate()
                .any(|(i, s)| *s >= 0 && *s != i as i64);
            if remapped {
                log::warn!(
                    "Refusing compact resume data with remapped slots"
                );
                return Err(DiskError::new(ErrorKind::MissingPieces));
            }
        }
    }

    let piece_count = storage.orig_files().piece_count();
    if rd.is_seed(piece_count) {
        // a seed's files must match the manifest byte for byte
        if file_sizes.len() != storage.orig_files().num_files() {
            return Err(DiskError::new(
                ErrorKind::MismatchingNumberOfFiles,
            ));
        }
        let mismatch = storage.with_files(|files, _| {
            files
                .files()
                .iter()
                .zip(file_sizes.iter())
                .enumerate()
                .find(|(_, (file, (size, _)))| {
                    !file.pad_file && file.len as i64 != *size
                })
                .map(|(i, _)| i)
        });
        if let Some(file) = mismatch {
            return Err(DiskError::new(ErrorKind::MismatchingFileSize)
                .with_file(file));
        }
    } else if conf.no_recheck_incomplete_resume {
        return Ok(());
    }

    match_filesizes(storage, file_sizes, compact)
}

/// Compares recorded sizes and timestamps against the disk. In compact mode
/// sizes must match exactly and mtimes within one second; in sparse/full
/// mode files may have grown, and mtimes may be up to five minutes newer
/// (full allocation never moves pieces, so newer data is still a superset).
fn match_filesizes(
    storage: &Storage,
    sizes: &[(i64, i64)],
    compact: bool,
) -> Result<()> {
    if sizes.len() != storage.orig_files().num_files() {
        return Err(DiskError::new(ErrorKind::MismatchingNumberOfFiles));
    }

    let on_disk = storage.stat_files();
    let pad = storage.with_files(|files, _| {
        files
            .files()
            .iter()
            .map(|f| f.pad_file)
            .collect::<Vec<_>>()
    });

    for (i, ((size, time), (disk_size, disk_time))) in
        sizes.iter().zip(on_disk.iter()).enumerate()
    {
        if pad[i] {
            continue;
        }

        if (compact && disk_size != size)
            || (!compact && disk_size < size)
        {
            log::warn!(
                "File {} size mismatch: resume {} vs disk {}",
                i,
                size,
                disk_size
            );
            return Err(DiskError::new(ErrorKind::MismatchingFileSize)
                .with_file(i));
        }

        // a missing timestamp in the resume data is not checked; allow one
        // second of slack for filesystems with coarse timestamps
        if *time == 0 {
            continue;
        }
        let stale = if compact {
            *disk_time > time + 1 || *disk_time < time - 1
        } else {
            *disk_time > time + 5 * 60 || *disk_time < time - 1
        };
        if stale {
            log::warn!(
                "File {} timestamp mismatch: resume {} vs disk {}",
                i,
                time,
                disk_time
            );
            return Err(DiskError::new(
                ErrorKind::MismatchingFileTimestamp,
            )
            .with_file(i));
        }
    }
    Ok(())
}

/// Builds the resume record for the torrent's current state, with freshly
/// stat-ed file sizes.
pub(crate) fn write_resume(
    storage: &Storage,
    completed: &Bitfield,
    conf: &DiskConf,
) -> ResumeData {
    let pieces: Vec<u8> = completed
        .iter()
        .map(|have| if *have { 1 } else { 0 })
        .collect();
    let file_priority = storage.file_priority();
    ResumeData {
        file_sizes: Some(storage.stat_files()),
        mapped_files: storage.mapped_files(),
        file_priority: if file_priority.is_empty() {
            None
        } else {
            Some(file_priority)
        },
        pieces: Some(ByteBuf::from(pieces)),
        slots: None,
        allocation: Some(String::from(if conf.allocate_files {
            "full"
        } else {
            "sparse"
        })),
        blocks_per_piece: Some(
            (storage.orig_files().piece_len() / BLOCK_LEN) as i64,
        ),
    }
}
