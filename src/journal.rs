//! Durable log of booking store transactions.
//!
//! Each committed store write is one [`JournalRecord`], framed as
//! `[u32 le: payload len][bincode payload][u32 le: crc32 of payload]`. Replaying the frames in
//! order rebuilds the store's tables. The first frame that is cut short or fails its checksum
//! ends the replay, and [`Journal::open`] cuts the file back to the last good frame so new
//! appends are never stranded behind damage.
//!
//! Compaction replaces the log with a snapshot of live state: one `BookingRestored` per
//! booking carrying its whole status history, followed by working hours and open
//! unavailability windows.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::model::JournalRecord;

/// Length prefix plus checksum.
const FRAME_OVERHEAD: u64 = 8;

/// Larger length prefixes are treated as corruption rather than allocated.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

fn encode_record(out: &mut Vec<u8>, record: &JournalRecord) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(())
}

/// `false` when the reader ran out before `buf` was filled.
fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Payload of the next intact frame; `None` at end of file or at the first damaged frame.
fn read_frame(reader: &mut impl Read, path: &Path) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        warn!(path = %path.display(), len, "journal frame length out of range, stopping replay");
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut payload)? || !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        warn!(path = %path.display(), "journal crc mismatch, stopping replay");
        return Ok(None);
    }
    Ok(Some(payload))
}

/// Decoded records plus the byte length they occupy.
fn scan(path: &Path) -> io::Result<(Vec<JournalRecord>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut valid_len = 0u64;
    while let Some(payload) = read_frame(&mut reader, path)? {
        match bincode::deserialize::<JournalRecord>(&payload) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "undecodable journal record, stopping replay");
                break;
            }
        }
        valid_len += FRAME_OVERHEAD + payload.len() as u64;
    }
    Ok((records, valid_len))
}

/// Append side of the store journal. Owned by [`writer_loop`]; nothing else writes the file.
pub struct Journal {
    file: File,
    path: PathBuf,
    /// Encoded frames waiting for the next [`Journal::sync`].
    pending: Vec<u8>,
    pending_records: u64,
    /// File length through the last synced frame.
    synced_len: u64,
    appends_since_compact: u64,
}

impl Journal {
    /// Open (or create) the journal at `path`, returning the records already in it.
    /// A damaged tail is truncated away.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<JournalRecord>)> {
        let (records, valid_len) = scan(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            warn!(
                path = %path.display(),
                discarded_bytes = on_disk - valid_len,
                "truncating damaged journal tail"
            );
            file.set_len(valid_len)?;
        }
        let journal = Self {
            file,
            path: path.to_path_buf(),
            pending: Vec::new(),
            pending_records: 0,
            synced_len: valid_len,
            appends_since_compact: 0,
        };
        Ok((journal, records))
    }

    /// Records in the journal at `path`, without opening it for writing.
    pub fn replay(path: &Path) -> io::Result<Vec<JournalRecord>> {
        scan(path).map(|(records, _)| records)
    }

    #[cfg(test)]
    pub fn append(&mut self, record: &JournalRecord) -> io::Result<()> {
        self.append_buffered(record)?;
        self.sync()
    }

    /// Queue a record for the next sync. Not durable until then.
    pub fn append_buffered(&mut self, record: &JournalRecord) -> io::Result<()> {
        encode_record(&mut self.pending, record)?;
        self.pending_records += 1;
        Ok(())
    }

    /// Write and fsync every queued frame. On failure the file is cut back to its last
    /// synced length, so none of the queued records can reappear on replay.
    pub fn sync(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let result = self
            .file
            .write_all(&self.pending)
            .and_then(|()| self.file.sync_data());
        match &result {
            Ok(()) => {
                self.synced_len += self.pending.len() as u64;
                self.appends_since_compact += self.pending_records;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "journal sync failed, rolling back batch");
                if let Err(e) = self.file.set_len(self.synced_len) {
                    warn!(path = %self.path.display(), error = %e, "journal rollback failed");
                }
            }
        }
        self.pending.clear();
        self.pending_records = 0;
        result
    }

    /// Replace the journal's contents with `records`: write a sibling file, fsync it,
    /// rename it over the journal and continue appending to the new file.
    pub fn rewrite(&mut self, records: &[JournalRecord]) -> io::Result<()> {
        let mut encoded = Vec::new();
        for record in records {
            encode_record(&mut encoded, record)?;
        }
        let tmp_path = self.path.with_extension("journal.compact");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&encoded)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.synced_len = encoded.len() as u64;
        self.appends_since_compact = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }
}

// ── Writer task ─────────────────────────────────────────────

type Ack = oneshot::Sender<io::Result<()>>;

pub(crate) enum JournalCommand {
    Append {
        record: JournalRecord,
        response: Ack,
    },
    Compact {
        records: Vec<JournalRecord>,
        response: Ack,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Sole owner of the journal file. Appends that queue up while one batch is being synced
/// go out together in the next batch, under a single fsync. Compaction requests are served
/// between batches, in arrival order.
pub(crate) async fn writer_loop(mut journal: Journal, mut rx: mpsc::Receiver<JournalCommand>) {
    let mut deferred = None;
    loop {
        let cmd = match deferred.take() {
            Some(cmd) => cmd,
            None => match rx.recv().await {
                Some(cmd) => cmd,
                None => break,
            },
        };
        match cmd {
            JournalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];
                while let Ok(next) = rx.try_recv() {
                    match next {
                        JournalCommand::Append { record, response } => batch.push((record, response)),
                        other => {
                            deferred = Some(other);
                            break;
                        }
                    }
                }
                commit_batch(&mut journal, batch);
            }
            JournalCommand::Compact { records, response } => {
                let _ = response.send(journal.rewrite(&records));
            }
            JournalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(journal.appends_since_compact());
            }
        }
    }
}

fn commit_batch(journal: &mut Journal, batch: Vec<(JournalRecord, Ack)>) {
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (record, _) in &batch {
        if let Err(e) = journal.append_buffered(record) {
            result = Err(e);
            break;
        }
    }
    // A batch is all or nothing: drop what was queued if encoding failed part way.
    result = match result {
        Ok(()) => journal.sync(),
        Err(e) => {
            journal.pending.clear();
            journal.pending_records = 0;
            Err(e)
        }
    };
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, ack) in batch {
        let outcome = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = ack.send(outcome);
    }
}
