use std::fs;
use std::future::Future;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, warn};
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::{DatabaseConfig, StringEncoding};
use crate::engine::buffer::{self, PooledBuffer};
use crate::engine::codec::{self, FormatError, ENTRY_OVERHEAD, HEADER_SIZE};
use crate::engine::map::{KeyComparer, StoreMap};
use crate::engine::cipher::BLOCK_SIZE;
use crate::engine::CipherProvider;
use crate::{Error, Result};

/// Extra bytes reserved on top of the size estimate when rendering a snapshot.
pub const RESERVED_HEADROOM: usize = 1024;
const READ_CHUNK: usize = 8 * 1024;

/// Handles disk I/O for a [`Database`](crate::engine::Database).
///
/// The variant is chosen once from the configuration: no path means [`Serializer::Disabled`],
/// otherwise whole-file encryption and case sensitivity pick one of the four file-backed
/// variants. Every snapshot contains the entire map.
///
/// Snapshots are written to a temporary file next to the target and renamed over it, so a
/// reader never sees a half-written file. A snapshot rendered before the last committed one
/// is discarded instead of overwriting newer data.
#[derive(Debug)]
pub enum Serializer {
    Disabled,
    Plain(FileTarget),
    PlainIgnoreCase(FileTarget),
    Encrypted(FileTarget, CipherProvider),
    EncryptedIgnoreCase(FileTarget, CipherProvider),
}

/// The file a serializer reads and writes, with its ordering state.
#[derive(Debug)]
pub struct FileTarget {
    path: PathBuf,
    encoding: StringEncoding,
    strict_decryption: bool,
    rendered: AtomicU64,
    committed: Mutex<u64>,
    /// Set when the file was loaded as empty because it could not be decrypted.
    degraded: AtomicBool,
}

/// A rendered, possibly encrypted, image of the map waiting to be written.
pub struct Snapshot {
    sequence: u64,
    bytes: PooledBuffer<'static, u8>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl FileTarget {
    fn new(path: &Path, encoding: StringEncoding, strict_decryption: bool) -> Result<Self> {
        if let Some(dir) = parent_dir(path) {
            if !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            encoding,
            strict_decryption,
            rendered: AtomicU64::new(0),
            committed: Mutex::new(0),
            degraded: AtomicBool::new(false),
        })
    }

    fn temp_file(&self) -> Result<NamedTempFile> {
        let dir = parent_dir(&self.path).unwrap_or_else(|| Path::new("."));
        Ok(NamedTempFile::new_in(dir)?)
    }

    /// A file we could not decrypt still holds someone's data; never replace it.
    fn ensure_writable(&self) -> Result<()> {
        if self.degraded.load(Ordering::SeqCst) {
            return Err(self.corrupt(FormatError::Undecryptable));
        }
        Ok(())
    }

    fn commit(&self, sequence: u64, file: NamedTempFile) -> Result<()> {
        let mut committed = self.committed.lock();
        if sequence < *committed {
            debug!(
                "Discarding stale snapshot {} of {:?} (already at {})",
                sequence, self.path, *committed
            );
            return Ok(());
        }
        file.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        *committed = sequence;
        Ok(())
    }

    fn corrupt(&self, source: FormatError) -> Error {
        Error::Deserialization {
            path: self.path.clone(),
            source,
        }
    }
}

fn parent_dir(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}

impl Serializer {
    /// Picks the variant for `config`, deriving the whole-file key if one is set.
    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        let Some(path) = config.file_path() else {
            return Ok(Serializer::Disabled);
        };
        let target = FileTarget::new(path, config.string_encoding, config.strict_decryption)?;
        let serializer = match (config.encryption_key(), config.ignore_case) {
            (None, false) => Serializer::Plain(target),
            (None, true) => Serializer::PlainIgnoreCase(target),
            (Some(key), false) => Serializer::Encrypted(target, CipherProvider::new(key)?),
            (Some(key), true) => Serializer::EncryptedIgnoreCase(target, CipherProvider::new(key)?),
        };
        Ok(serializer)
    }

    /// Key comparer of the maps this serializer produces.
    ///
    /// A disabled serializer has no file to speak for, so the caller's choice applies.
    pub fn comparer(&self, ignore_case: bool) -> KeyComparer {
        match self {
            Serializer::Plain(_) | Serializer::Encrypted(..) => KeyComparer::Ordinal,
            Serializer::PlainIgnoreCase(_) | Serializer::EncryptedIgnoreCase(..) => {
                KeyComparer::IgnoreCase
            }
            Serializer::Disabled if ignore_case => KeyComparer::IgnoreCase,
            Serializer::Disabled => KeyComparer::Ordinal,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.target().map(|t| t.path.as_path())
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, Serializer::Disabled)
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher().is_some()
    }

    /// True after a lenient load fell back to an empty map; writes are refused until a
    /// later load succeeds.
    pub fn is_degraded(&self) -> bool {
        self.target()
            .is_some_and(|t| t.degraded.load(Ordering::SeqCst))
    }

    fn target(&self) -> Option<&FileTarget> {
        match self {
            Serializer::Disabled => None,
            Serializer::Plain(t)
            | Serializer::PlainIgnoreCase(t)
            | Serializer::Encrypted(t, _)
            | Serializer::EncryptedIgnoreCase(t, _) => Some(t),
        }
    }

    fn cipher(&self) -> Option<&CipherProvider> {
        match self {
            Serializer::Encrypted(_, c) | Serializer::EncryptedIgnoreCase(_, c) => Some(c),
            _ => None,
        }
    }

    /// Renders `map` into a pooled buffer sized from `estimated_size`.
    ///
    /// Returns `None` for a disabled serializer. Callers render while holding the map's
    /// read lock so the snapshot sequence follows the order of map states.
    pub fn render(&self, map: &StoreMap, estimated_size: usize) -> Result<Option<Snapshot>> {
        let Some(target) = self.target() else {
            return Ok(None);
        };
        let sequence = target.rendered.fetch_add(1, Ordering::SeqCst) + 1;

        let reserve = estimated_size + HEADER_SIZE + map.len() * ENTRY_OVERHEAD + RESERVED_HEADROOM;
        let mut plain = buffer::bytes().rent(reserve);
        codec::encode(map, target.encoding, &mut plain)?;

        let bytes = match self.cipher() {
            None => plain,
            Some(cipher) => {
                let mut sealed = buffer::bytes().rent(CipherProvider::encrypted_len(plain.len()));
                let written = cipher.encrypt_into(plain.written(), sealed.tail_mut())?;
                sealed.advance(written)?;
                plain.written_mut().fill(0);
                sealed
            }
        };
        Ok(Some(Snapshot { sequence, bytes }))
    }

    /// Writes a rendered snapshot to the target file.
    pub fn write(&self, snapshot: Snapshot) -> Result<()> {
        let Some(target) = self.target() else {
            return Ok(());
        };
        target.ensure_writable()?;
        let mut file = target.temp_file()?;
        file.write_all(snapshot.bytes.written())?;
        file.flush()?;
        target.commit(snapshot.sequence, file)?;
        debug!("Serialized {} bytes to {:?}", snapshot.len(), target.path);
        Ok(())
    }

    /// Writes a rendered snapshot without blocking the runtime; resolving `cancel` aborts
    /// the write and leaves the previous file untouched.
    pub async fn write_async<C>(&self, snapshot: Snapshot, cancel: C) -> Result<()>
    where
        C: Future<Output = ()>,
    {
        let Some(target) = self.target() else {
            return Ok(());
        };
        target.ensure_writable()?;
        let temp = target.temp_file()?;
        let mut file = tokio::fs::File::from_std(temp.as_file().try_clone()?);
        let bytes = snapshot.bytes.written();
        let write = async {
            file.write_all(bytes).await?;
            file.flush().await?;
            Ok::<(), io::Error>(())
        };
        tokio::select! {
            biased;
            _ = cancel => {
                debug!("Cancelled snapshot write to {:?}", target.path);
                return Err(Error::Cancelled);
            }
            res = write => res?,
        }
        drop(file);
        target.commit(snapshot.sequence, temp)?;
        debug!("Serialized {} bytes to {:?}", snapshot.len(), target.path);
        Ok(())
    }

    /// Renders and writes `map` in one step.
    pub fn serialize(&self, map: &StoreMap, estimated_size: usize) -> Result<()> {
        match self.render(map, estimated_size)? {
            Some(snapshot) => self.write(snapshot),
            None => Ok(()),
        }
    }

    /// Async twin of [`serialize`](Self::serialize).
    pub async fn serialize_async(&self, map: &StoreMap, estimated_size: usize) -> Result<()> {
        match self.render(map, estimated_size)? {
            Some(snapshot) => self.write_async(snapshot, std::future::pending()).await,
            None => Ok(()),
        }
    }

    /// Loads the map from the target file.
    ///
    /// A missing or empty file yields an empty map; so does a disabled serializer.
    pub fn deserialize(&self, estimated_size: usize, ignore_case: bool) -> Result<StoreMap> {
        let comparer = self.comparer(ignore_case);
        let Some(target) = self.target() else {
            return Ok(StoreMap::new(comparer));
        };
        target.degraded.store(false, Ordering::SeqCst);
        let mut file = match fs::File::open(&target.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(StoreMap::new(comparer)),
            Err(e) => return Err(e.into()),
        };

        let mut raw = buffer::bytes().rent(estimated_size.max(READ_CHUNK));
        loop {
            let n = file.read(raw.tail_with(READ_CHUNK))?;
            if n == 0 {
                break;
            }
            raw.advance(n)?;
        }
        self.decode_file(target, raw.written(), comparer)
    }

    /// Async twin of [`deserialize`](Self::deserialize); resolving `cancel` aborts the read.
    pub async fn deserialize_async<C>(
        &self,
        estimated_size: usize,
        ignore_case: bool,
        cancel: C,
    ) -> Result<StoreMap>
    where
        C: Future<Output = ()>,
    {
        let comparer = self.comparer(ignore_case);
        let Some(target) = self.target() else {
            return Ok(StoreMap::new(comparer));
        };
        target.degraded.store(false, Ordering::SeqCst);
        let mut file = match tokio::fs::File::open(&target.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(StoreMap::new(comparer)),
            Err(e) => return Err(e.into()),
        };

        let mut raw = buffer::bytes().rent(estimated_size.max(READ_CHUNK));
        let read = async {
            loop {
                let n = file.read(raw.tail_with(READ_CHUNK)).await?;
                if n == 0 {
                    break;
                }
                raw.advance(n)?;
            }
            Ok::<(), Error>(())
        };
        tokio::select! {
            biased;
            _ = cancel => return Err(Error::Cancelled),
            res = read => res?,
        }
        self.decode_file(target, raw.written(), comparer)
    }

    fn decode_file(&self, target: &FileTarget, raw: &[u8], comparer: KeyComparer) -> Result<StoreMap> {
        if raw.is_empty() {
            warn!("Database file {:?} is empty; starting with an empty map", target.path);
            return Ok(StoreMap::new(comparer));
        }

        let Some(cipher) = self.cipher() else {
            return codec::decode(raw, target.encoding, comparer).map_err(|e| target.corrupt(e));
        };

        // Snapshots are whole cipher blocks; a ragged tail means the file was cut short.
        if raw.len() % BLOCK_SIZE != 0 {
            return Err(target.corrupt(FormatError::Truncated {
                offset: raw.len(),
                needed: BLOCK_SIZE - raw.len() % BLOCK_SIZE,
            }));
        }

        let mut plain = buffer::bytes().rent(raw.len());
        let decrypted = match cipher.decrypt_into(raw, plain.tail_mut()) {
            Ok(n) => plain.advance(n).map(|_| true),
            Err(e) => {
                debug!("Decrypting {:?} failed: {}", target.path, e);
                Ok(false)
            }
        };
        let decoded = match decrypted {
            Ok(true) => Some(codec::decode(plain.written(), target.encoding, comparer)),
            Ok(false) => None,
            Err(e) => {
                plain.written_mut().fill(0);
                return Err(e);
            }
        };
        plain.written_mut().fill(0);

        match decoded {
            Some(result) => result.map_err(|e| target.corrupt(e)),
            None if target.strict_decryption => Err(target.corrupt(FormatError::Undecryptable)),
            None => {
                // Without a MAC a wrong key and a damaged last block look alike.
                warn!(
                    "Could not decrypt {:?}; starting with an empty map and leaving the file untouched",
                    target.path
                );
                target.degraded.store(true, Ordering::SeqCst);
                Ok(StoreMap::new(comparer))
            }
        }
    }
}
