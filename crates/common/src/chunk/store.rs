//! Bounded on-disk chunk store.
//!
//! One pre-allocated backing file holds `max_chunks` slots of
//! `HEADER_SIZE + chunk_size` bytes. Each slot starts with a header
//! `{ id: u64, size: u32, crc32: u32 }` (little endian) followed by the body.
//! The `chunk_id -> slot` map, the reverse `slot -> chunk_id` array and the
//! LRU order live in memory behind one mutex that is held only to look up,
//! assign or release a slot. Bodies are read and written under a per-slot
//! reader/writer lock taken after that mutex is released, so slot ownership
//! is checked again once the slot lock is held. Slot locks are always taken
//! before the index mutex.
//!
//! With `mmap` the memory map is only the I/O path: bodies are copied out of
//! it, because an evicted slot is rewritten in place.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use memmap2::MmapRaw;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use super::lru::LruList;
use super::ChunkId;
use crate::error::{Error, Result};

/// Bytes of header in front of each slot body.
pub const HEADER_SIZE: usize = 16;

const BACKING_FILE_NAME: &str = "chunks.bin";

enum Backing {
    Mapped(MmapRaw),
    File(File),
}

#[derive(Debug)]
struct Index {
    slots: HashMap<ChunkId, usize>,
    owners: Vec<Option<ChunkId>>,
    // false between a slot's assignment and the end of its first write
    filled: Vec<bool>,
    lru: LruList,
}

impl Index {
    fn new(max_chunks: usize) -> Self {
        Self {
            slots: HashMap::with_capacity(max_chunks),
            owners: vec![None; max_chunks],
            filled: vec![false; max_chunks],
            lru: LruList::new(max_chunks),
        }
    }

    /// Drop the mapping for `slot` if it still belongs to `id`.
    fn release(&mut self, slot: usize, id: &ChunkId) -> bool {
        if self.owners[slot].as_ref() != Some(id) {
            return false;
        }
        self.owners[slot] = None;
        self.filled[slot] = false;
        self.slots.remove(id);
        self.lru.demote(slot);
        true
    }
}

#[derive(Debug, Clone, Copy)]
struct Header {
    id: u64,
    size: u32,
    crc32: u32,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.crc32.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        let mut id = [0u8; 8];
        let mut size = [0u8; 4];
        let mut crc32 = [0u8; 4];
        id.copy_from_slice(&buf[0..8]);
        size.copy_from_slice(&buf[8..12]);
        crc32.copy_from_slice(&buf[12..16]);
        Self {
            id: u64::from_le_bytes(id),
            size: u32::from_le_bytes(size),
            crc32: u32::from_le_bytes(crc32),
        }
    }
}

/// Bounded chunk cache backed by a single pre-allocated file.
pub struct ChunkStore {
    path: PathBuf,
    chunk_size: usize,
    max_chunks: usize,
    backing: Backing,
    // keeps the descriptor alive for the lifetime of the mapping
    _file: File,
    index: Mutex<Index>,
    slot_locks: Vec<RwLock<()>>,
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("path", &self.path)
            .field("chunk_size", &self.chunk_size)
            .field("max_chunks", &self.max_chunks)
            .field("mmap", &matches!(self.backing, Backing::Mapped(_)))
            .finish()
    }
}

impl ChunkStore {
    /// Open (or create) the backing file under `dir`, size it for
    /// `max_chunks` slots and wipe every header.
    pub fn open(dir: &Path, chunk_size: u64, max_chunks: usize, mmap: bool) -> Result<Self> {
        if max_chunks == 0 {
            return Err(Error::InvalidConfig("chunk store needs at least one slot".into()));
        }
        std::fs::create_dir_all(dir)?;

        let path = dir.join(BACKING_FILE_NAME);
        let chunk_size = chunk_size as usize;
        let slot_size = HEADER_SIZE + chunk_size;
        let total = (slot_size as u64) * (max_chunks as u64);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.set_len(total)?;

        let backing = if mmap {
            Backing::Mapped(MmapRaw::map_raw(&file)?)
        } else {
            Backing::File(file.try_clone()?)
        };

        tracing::info!(
            path = %path.display(),
            chunk_size,
            max_chunks,
            mmap,
            "opened chunk store"
        );

        let store = Self {
            path,
            chunk_size,
            max_chunks,
            backing,
            _file: file,
            index: Mutex::new(Index::new(max_chunks)),
            slot_locks: (0..max_chunks).map(|_| RwLock::new(())).collect(),
        };
        store.clear()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn max_chunks(&self) -> usize {
        self.max_chunks
    }

    /// Number of resident chunks.
    pub fn len(&self) -> usize {
        self.index.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `id` is resident, without touching the LRU order.
    pub fn contains(&self, id: &ChunkId) -> bool {
        self.index.lock().slots.contains_key(id)
    }

    /// Body of a resident chunk. Marks it most recently used. A header or
    /// CRC mismatch frees the slot and reports a miss.
    pub fn load(&self, id: &ChunkId) -> Option<Bytes> {
        let slot = {
            let mut index = self.index.lock();
            let slot = *index.slots.get(id)?;
            index.lru.touch(slot);
            slot
        };

        let guard = self.slot_locks[slot].read();
        {
            let index = self.index.lock();
            // evicted while waiting for the slot, or not written yet
            if index.owners[slot].as_ref() != Some(id) || !index.filled[slot] {
                return None;
            }
        }
        let result = self.read_slot(slot, id, &guard);
        drop(guard);

        match result {
            Ok(body) => Some(body),
            Err(e) => {
                tracing::warn!(chunk = %id, slot, "evicting unreadable chunk: {}", e);
                self.index.lock().release(slot, id);
                None
            }
        }
    }

    /// Write `data` for `id`, reusing its slot if resident or evicting the
    /// least recently used one.
    pub fn store(&self, id: &ChunkId, data: &[u8]) -> Result<()> {
        if data.len() > self.chunk_size {
            return Err(Error::Integrity(format!(
                "chunk {} has {} bytes, slot holds {}",
                id,
                data.len(),
                self.chunk_size
            )));
        }

        let slot = {
            let mut index = self.index.lock();
            let resident = index.slots.get(id).copied();
            let slot = match resident {
                Some(slot) => slot,
                None => {
                    let slot = index
                        .lru
                        .lru()
                        .ok_or_else(|| Error::InvalidConfig("chunk store has no slots".into()))?;
                    if let Some(evicted) = index.owners[slot].take() {
                        tracing::trace!(chunk = %evicted, slot, "evicting chunk");
                        index.slots.remove(&evicted);
                    }
                    index.slots.insert(id.clone(), slot);
                    index.owners[slot] = Some(id.clone());
                    index.filled[slot] = false;
                    slot
                }
            };
            index.lru.touch(slot);
            slot
        };

        let guard = self.slot_locks[slot].write();
        if self.index.lock().owners[slot].as_ref() != Some(id) {
            tracing::trace!(chunk = %id, slot, "slot reassigned before write, dropping chunk");
            return Ok(());
        }

        let header = Header {
            id: id.fingerprint(),
            size: data.len() as u32,
            crc32: crc32fast::hash(data),
        };
        let base = self.slot_offset(slot);
        let written = self
            .write_at(base + HEADER_SIZE, data)
            .and_then(|_| self.write_at(base, &header.encode()));

        let mut index = self.index.lock();
        if let Err(e) = written {
            index.release(slot, id);
            return Err(e.into());
        }
        // the slot may already be promised to another chunk
        if index.owners[slot].as_ref() == Some(id) {
            index.filled[slot] = true;
        }
        drop(index);
        drop(guard);
        tracing::trace!(chunk = %id, slot, size = data.len(), "stored chunk");
        Ok(())
    }

    /// Zero every header and forget all resident chunks.
    pub fn clear(&self) -> Result<()> {
        let zero = [0u8; HEADER_SIZE];
        let mut guards = Vec::with_capacity(self.max_chunks);
        for slot in 0..self.max_chunks {
            let guard = self.slot_locks[slot].write();
            self.write_at(self.slot_offset(slot), &zero)?;
            guards.push(guard);
        }
        *self.index.lock() = Index::new(self.max_chunks);
        Ok(())
    }

    fn read_slot(&self, slot: usize, id: &ChunkId, _guard: &RwLockReadGuard<'_, ()>) -> Result<Bytes> {
        let base = self.slot_offset(slot);
        let mut raw = [0u8; HEADER_SIZE];
        self.read_at(base, &mut raw)?;
        let header = Header::decode(&raw);

        if header.id != id.fingerprint() {
            return Err(Error::Integrity(format!("slot {} holds a different chunk", slot)));
        }

        let mut size = header.size as usize;
        let oversized = size > self.chunk_size;
        if oversized {
            size = self.chunk_size;
        }

        let mut body = vec![0u8; size];
        self.read_at(base + HEADER_SIZE, &mut body)?;
        let crc32 = crc32fast::hash(&body);

        if oversized {
            return Err(Error::Integrity(format!(
                "header size {} exceeds chunk size {}",
                header.size, self.chunk_size
            )));
        }
        if crc32 != header.crc32 {
            return Err(Error::Integrity(format!(
                "crc32 mismatch: header {:08x}, body {:08x}",
                header.crc32, crc32
            )));
        }
        Ok(Bytes::from(body))
    }

    fn slot_offset(&self, slot: usize) -> usize {
        slot * (HEADER_SIZE + self.chunk_size)
    }

    fn read_at(&self, pos: usize, buf: &mut [u8]) -> io::Result<()> {
        match &self.backing {
            Backing::Mapped(map) => {
                check_bounds(map.len(), pos, buf.len())?;
                // SAFETY: the range lies inside the mapping and the caller
                // holds the slot lock, so no writer touches these bytes.
                unsafe {
                    std::ptr::copy_nonoverlapping(map.as_ptr().add(pos), buf.as_mut_ptr(), buf.len());
                }
                Ok(())
            }
            Backing::File(file) => file.read_exact_at(buf, pos as u64),
        }
    }

    fn write_at(&self, pos: usize, data: &[u8]) -> io::Result<()> {
        match &self.backing {
            Backing::Mapped(map) => {
                check_bounds(map.len(), pos, data.len())?;
                // SAFETY: the range lies inside the mapping and the caller
                // holds the slot's exclusive lock.
                unsafe {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), map.as_mut_ptr().add(pos), data.len());
                }
                Ok(())
            }
            Backing::File(file) => file.write_all_at(data, pos as u64),
        }
    }

    #[cfg(test)]
    fn slot_of(&self, id: &ChunkId) -> Option<usize> {
        self.index.lock().slots.get(id).copied()
    }

    #[cfg(test)]
    fn lru_position(&self, id: &ChunkId) -> Option<usize> {
        let index = self.index.lock();
        let slot = *index.slots.get(id)?;
        Some(index.lru.position(slot))
    }
}

fn check_bounds(len: usize, pos: usize, n: usize) -> io::Result<()> {
    if pos.checked_add(n).is_some_and(|end| end <= len) {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("range {}..{} outside backing file of {} bytes", pos, pos + n, len),
        ))
    }
}
