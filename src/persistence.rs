use base64;
use log::{debug, error, info};
use parking_lot::Mutex;
use ron;
use serde::{Deserialize, Serialize};
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::str;
use uuid::Uuid;

use crate::error::{BrokerError, Result};
use crate::message_store::{InMemoryMessageStore, OfflineMessageStore};
use crate::structure::{DeliveryState, PendingMessage};
use crate::ClientId;

#[derive(Debug)]
pub struct FileLog {
    full_path: PathBuf,
    file: File,
}

const NEWLINE: &[u8] = &[b'\n'];

/// Every Line is a new "state change" entry
/// Each line starts with one of the following keywords
/// that indicate the type of entry
const STORED: u8 = 1;
const UPDATED: u8 = 2;
const REMOVED: u8 = 3;
const CLEARED: u8 = 4;

/// UpdatedEntry moves a stored message to a new delivery state
#[derive(Debug, Serialize, Deserialize)]
pub struct UpdatedEntry {
    pub owner: ClientId,
    pub id: Uuid,
    pub state: DeliveryState,
}

/// RemovedEntry tells us that the QoS flow of a message is finished
/// for its owner
#[derive(Debug, Serialize, Deserialize)]
pub struct RemovedEntry {
    pub owner: ClientId,
    pub id: Uuid,
}

/// ClearedEntry is written when a session is wiped
#[derive(Debug, Serialize, Deserialize)]
pub struct ClearedEntry {
    pub owner: ClientId,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Entry {
    Stored(PendingMessage),
    Updated(UpdatedEntry),
    Removed(RemovedEntry),
    Cleared(ClearedEntry),
}

fn storage_err(context: &str, e: impl std::fmt::Display) -> BrokerError {
    BrokerError::Storage(format!("{}: {}", context, e))
}

fn decode<T: for<'de> Deserialize<'de>>(data: &str) -> Result<T> {
    ron::from_str::<T>(data).map_err(|e| storage_err("corrupted journal entry", e))
}

/// Each line will start with 1 byte that indicates type of entry followed by a
/// base64 encoded string of a RON object
impl FileLog {
    pub fn open(cwd: impl AsRef<Path>, file_name: &str) -> Result<FileLog> {
        let cwd = cwd.as_ref();
        DirBuilder::new().recursive(true).create(cwd)?;
        let full_path = cwd.join(file_name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full_path)?;
        Ok(FileLog { full_path, file })
    }

    pub fn path(&self) -> &Path {
        &self.full_path
    }

    pub fn append_stored(&mut self, message: &PendingMessage) -> Result<()> {
        let data = ron::to_string(message).map_err(|e| storage_err("encode", e))?;
        self.append(STORED, data.as_bytes())
    }

    pub fn append_updated(&mut self, owner: &str, id: Uuid, state: DeliveryState) -> Result<()> {
        let data = ron::to_string(&UpdatedEntry {
            owner: owner.to_string(),
            id,
            state,
        })
        .map_err(|e| storage_err("encode", e))?;
        self.append(UPDATED, data.as_bytes())
    }

    pub fn append_removed(&mut self, owner: &str, id: Uuid) -> Result<()> {
        let data = ron::to_string(&RemovedEntry {
            owner: owner.to_string(),
            id,
        })
        .map_err(|e| storage_err("encode", e))?;
        self.append(REMOVED, data.as_bytes())
    }

    pub fn append_cleared(&mut self, owner: &str) -> Result<()> {
        let data = ron::to_string(&ClearedEntry {
            owner: owner.to_string(),
        })
        .map_err(|e| storage_err("encode", e))?;
        self.append(CLEARED, data.as_bytes())
    }

    pub fn append(&mut self, header: u8, data: &[u8]) -> Result<()> {
        let encoded = base64::encode(data);
        let buf = [&[header], encoded.as_bytes(), NEWLINE].concat();
        if let Err(why) = self.file.write_all(&buf) {
            error!(
                "[FileLog {:?}] couldn't write to file: {}",
                self.full_path, why
            );
            return Err(why.into());
        }
        debug!(
            "[FileLog {:?}] Successfully appended log to file",
            self.full_path
        );
        Ok(())
    }

    /// Replaces the journal with one `Stored` entry per live message.
    pub fn rewrite(&mut self, messages: &[PendingMessage]) -> Result<()> {
        let tmp_path = self.full_path.with_extension("compact");
        {
            let mut tmp = File::create(&tmp_path)?;
            for message in messages {
                let data = ron::to_string(message).map_err(|e| storage_err("encode", e))?;
                let encoded = base64::encode(data.as_bytes());
                tmp.write_all(&[&[STORED], encoded.as_bytes(), NEWLINE].concat())?;
            }
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.full_path)?;
        self.file = OpenOptions::new().append(true).open(&self.full_path)?;
        info!(
            "[FileLog {:?}] compacted to {} entries",
            self.full_path,
            messages.len()
        );
        Ok(())
    }

    /// Reads every entry of the journal, a missing file is an empty journal.
    pub fn read_file(cwd: impl AsRef<Path>, file_name: &str) -> Result<Vec<Entry>> {
        let full_path = cwd.as_ref().join(file_name);
        let file = match File::open(&full_path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("[persistence] no journal at {:?}", full_path);
                return Ok(vec![]);
            }
            Err(e) => return Err(e.into()),
        };
        debug!("[persistence] successfully opened file {:?}", full_path);
        let mut res = Vec::with_capacity(200);
        for line in BufReader::new(file).split(b'\n') {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let decoded =
                base64::decode(&line[1..]).map_err(|e| storage_err("corrupted base64", e))?;
            let decoded = str::from_utf8(&decoded).map_err(|e| storage_err("corrupted utf8", e))?;
            res.push(match line[0] {
                STORED => Entry::Stored(decode(decoded)?),
                UPDATED => Entry::Updated(decode(decoded)?),
                REMOVED => Entry::Removed(decode(decoded)?),
                CLEARED => Entry::Cleared(decode(decoded)?),
                other => {
                    return Err(BrokerError::Storage(format!(
                        "corrupted file entry, begins with {:?}",
                        other
                    )))
                }
            });
        }
        Ok(res)
    }
}

/// Offline message store that journals every change before applying it in
/// memory, and replays the journal when opened.
pub struct FileMessageStore {
    memory: InMemoryMessageStore,
    log: Mutex<FileLog>,
}

impl FileMessageStore {
    pub fn open(cwd: impl AsRef<Path>, file_name: &str) -> Result<FileMessageStore> {
        let cwd = cwd.as_ref();
        let memory = InMemoryMessageStore::new();
        let entries = FileLog::read_file(cwd, file_name)?;
        let replayed = entries.len();
        for entry in entries {
            match entry {
                Entry::Stored(message) => memory.store(message)?,
                Entry::Updated(u) => {
                    memory.update(&u.owner, u.id, u.state)?;
                }
                Entry::Removed(r) => {
                    memory.remove(&r.owner, r.id)?;
                }
                Entry::Cleared(c) => {
                    memory.clear(&c.owner)?;
                }
            }
        }
        info!(
            "[persistence] replayed {} journal entries, {} messages pending",
            replayed,
            memory.len()
        );
        Ok(FileMessageStore {
            memory,
            log: Mutex::new(FileLog::open(cwd, file_name)?),
        })
    }

    pub fn compact(&self) -> Result<()> {
        let mut log = self.log.lock();
        log.rewrite(&self.memory.snapshot())
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }
}

impl OfflineMessageStore for FileMessageStore {
    fn list_pending(&self, owner: &str) -> Result<Vec<PendingMessage>> {
        self.memory.list_pending(owner)
    }

    fn store(&self, message: PendingMessage) -> Result<()> {
        let mut log = self.log.lock();
        log.append_stored(&message)?;
        self.memory.store(message)
    }

    fn update(&self, owner: &str, id: Uuid, state: DeliveryState) -> Result<bool> {
        let mut log = self.log.lock();
        log.append_updated(owner, id, state)?;
        self.memory.update(owner, id, state)
    }

    fn remove(&self, owner: &str, id: Uuid) -> Result<Option<PendingMessage>> {
        let mut log = self.log.lock();
        log.append_removed(owner, id)?;
        self.memory.remove(owner, id)
    }

    fn clear(&self, owner: &str) -> Result<usize> {
        let mut log = self.log.lock();
        log.append_cleared(owner)?;
        self.memory.clear(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::QoS;
    use crate::structure::{InboundState, OutboundState, PublishEvent};
    use bytes::Bytes;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("mqtt-broker-core-{}", Uuid::new_v4()))
    }

    fn pending(owner: &str, payload: &'static [u8]) -> PendingMessage {
        let event = PublishEvent::new(
            "sensors/temp".to_string(),
            QoS::ExactlyOnce,
            Bytes::from_static(payload),
            true,
            "pub".to_string(),
            Some(42),
        );
        PendingMessage::outbound(owner, event, OutboundState::Queued)
    }

    #[test]
    fn journal_replays_after_reopen() {
        let dir = temp_dir();
        let first = pending("dev-1", b"one");
        let second = pending("dev-1", b"two");
        let third = pending("dev-2", b"three");
        {
            let store = FileMessageStore::open(&dir, "backup.log").unwrap();
            store.store(first.clone()).unwrap();
            store.store(second.clone()).unwrap();
            store.store(third.clone()).unwrap();
            store
                .update(
                    "dev-1",
                    second.id,
                    DeliveryState::Outbound(OutboundState::Released),
                )
                .unwrap();
            store.remove("dev-1", first.id).unwrap();
            store.clear("dev-2").unwrap();
        }
        let store = FileMessageStore::open(&dir, "backup.log").unwrap();
        let listed = store.list_pending("dev-1").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[0].event, second.event);
        assert_eq!(
            listed[0].state,
            DeliveryState::Outbound(OutboundState::Released)
        );
        assert!(store.list_pending("dev-2").unwrap().is_empty());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn compaction_keeps_live_messages() {
        let dir = temp_dir();
        let kept = pending("c", b"kept");
        {
            let store = FileMessageStore::open(&dir, "backup.log").unwrap();
            for _ in 0..5 {
                let dropped = pending("c", b"dropped");
                store.store(dropped.clone()).unwrap();
                store.remove("c", dropped.id).unwrap();
            }
            store.store(kept.clone()).unwrap();
            store
                .update(
                    "c",
                    kept.id,
                    DeliveryState::Inbound(InboundState::PubrecSent),
                )
                .unwrap();
            store.compact().unwrap();
        }
        let entries = FileLog::read_file(&dir, "backup.log").unwrap();
        assert_eq!(entries.len(), 1);
        let store = FileMessageStore::open(&dir, "backup.log").unwrap();
        assert_eq!(store.list_pending("c").unwrap()[0].id, kept.id);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_journal_is_empty() {
        let dir = temp_dir();
        assert!(FileLog::read_file(&dir, "none.log").unwrap().is_empty());
    }

    #[test]
    fn corrupted_header_is_an_error() {
        let dir = temp_dir();
        let mut log = FileLog::open(&dir, "backup.log").unwrap();
        log.append(9, b"()").unwrap();
        assert!(matches!(
            FileLog::read_file(&dir, "backup.log"),
            Err(BrokerError::Storage(_))
        ));
        fs::remove_dir_all(&dir).unwrap();
    }
}
