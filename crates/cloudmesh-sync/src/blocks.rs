//! Block-level file sync.
//!
//! Files under a shared directory are compared in fixed 4096-byte blocks.
//! Only blocks whose digests differ are transferred:
//!
//! ```text
//! Holder                                   Receiver
//!   |-------- FileInfo(name, size, hash) ---->|  (size or hash differs)
//!   |<------- FileHashRequest(name) ----------|
//!   |-------- FileHashReply(name, i, h) x N ->|  (block i differs)
//!   |<------- FileBlockRequest(name, i) ------|
//!   |-------- FileBlockReply(name, i, data) ->|  write at i * 4096
//! ```
//!
//! When both sides hold a file, only the side whose `(size, hash)` sorts
//! lower pulls, so two differing copies converge on the higher one. The
//! higher side answers a lower announcement with its own `FileInfo` if it
//! has not announced the file yet.
//!
//! Disk work runs on the blocking pool. Writes never truncate; the pulling
//! side is never longer than the copy it pulls.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;

use cloudmesh_core::{Sha1Hash, Sha1Hasher};

use crate::error::{Result, SyncError};
use crate::messages::Message;

/// Size of one block.
pub const BLOCK_SIZE: usize = 4096;

/// Number of blocks covering `size` bytes.
pub fn block_count(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE as u64)
}

/// Whole-file and per-block digests of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub size: u64,
    pub hash: Sha1Hash,
    pub blocks: Vec<Sha1Hash>,
}

impl FileDigest {
    /// Digest of a file with no content.
    pub fn empty() -> Self {
        Self {
            size: 0,
            hash: Sha1Hash::hash(&[]),
            blocks: Vec::new(),
        }
    }

    /// Digest everything a reader yields.
    pub fn of_reader(mut reader: impl Read) -> io::Result<Self> {
        let mut whole = Sha1Hasher::new();
        let mut blocks = Vec::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; BLOCK_SIZE];

        loop {
            let n = read_full(&mut reader, &mut buf)?;
            if n == 0 {
                break;
            }
            whole.update(&buf[..n]);
            blocks.push(Sha1Hash::hash(&buf[..n]));
            size += n as u64;
            if n < BLOCK_SIZE {
                break;
            }
        }

        Ok(Self {
            size,
            hash: whole.finalize(),
            blocks,
        })
    }

    /// Digest a file on disk.
    pub fn of_path(path: &Path) -> io::Result<Self> {
        Self::of_reader(File::open(path)?)
    }

    /// Digest a file on disk, treating a missing file as empty.
    pub fn of_path_or_empty(path: &Path) -> io::Result<Self> {
        match Self::of_path(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::empty()),
            other => other,
        }
    }
}

/// Fill `buf` as far as the reader allows. Returns the bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn block_offset(index: u64) -> io::Result<u64> {
    index
        .checked_mul(BLOCK_SIZE as u64)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "block index out of range"))
}

/// Read block `index` of a file. The final block may be short.
pub fn read_block(path: &Path, index: u64) -> io::Result<Bytes> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(block_offset(index)?))?;
    let mut buf = vec![0u8; BLOCK_SIZE];
    let n = read_full(&mut file, &mut buf)?;
    buf.truncate(n);
    Ok(Bytes::from(buf))
}

/// Overwrite block `index` of a file, creating the file if needed.
pub fn write_block(path: &Path, index: u64, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    file.seek(SeekFrom::Start(block_offset(index)?))?;
    file.write_all(data)?;
    file.flush()
}

/// Map a wire file name onto a path under `root`.
///
/// Names are relative and `/`-separated. Empty names, absolute paths and
/// `..` components are rejected.
pub fn resolve_name(root: &Path, name: &str) -> io::Result<PathBuf> {
    let relative = Path::new(name);
    let valid = !name.is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        && relative.components().any(|c| matches!(c, Component::Normal(_)));

    if !valid {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsafe file name {:?}", name),
        ));
    }
    Ok(root.join(relative))
}

/// Every regular file under `root`, as sorted `/`-separated relative names.
pub fn list_files(root: &Path) -> io::Result<Vec<String>> {
    fn walk(dir: &Path, prefix: &str, out: &mut Vec<String>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                tracing::debug!(path = %entry.path().display(), "skipping non UTF-8 name");
                continue;
            };
            let relative = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };

            if file_type.is_dir() {
                walk(&entry.path(), &relative, out)?;
            } else if file_type.is_file() {
                out.push(relative);
            }
        }
        Ok(())
    }

    let mut out = Vec::new();
    walk(root, "", &mut out)?;
    out.sort();
    Ok(out)
}

/// Local block digests of a file whose hashes we asked for.
#[derive(Debug)]
struct PendingFile {
    local_blocks: Vec<Sha1Hash>,
    remote_blocks: u64,
}

/// Drives the block exchange for one session.
///
/// Owned by the session task; results of disk work are only applied while
/// that task is alive.
#[derive(Debug)]
pub struct BlockDiffer {
    root: PathBuf,
    pending: HashMap<String, PendingFile>,
    requested: HashSet<(String, u64)>,
    announced: HashSet<String>,
}

impl BlockDiffer {
    /// Sync files under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pending: HashMap::new(),
            requested: HashSet::new(),
            announced: HashSet::new(),
        }
    }

    /// The shared directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        resolve_name(&self.root, name).map_err(|e| SyncError::file(name, e))
    }

    async fn blocking<T, F>(name: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| SyncError::file(name, io::Error::new(io::ErrorKind::Other, e)))?
            .map_err(|e| SyncError::file(name, e))
    }

    /// Names of every file under the shared directory.
    pub async fn shared_files(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        let label = self.root.display().to_string();
        Self::blocking(&label, move || match list_files(&root) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            other => other,
        })
        .await
    }

    /// Build the `FileInfo` announcing a local file.
    pub async fn announce(&mut self, name: &str) -> Result<Message> {
        let path = self.path(name)?;
        let digest = Self::blocking(name, move || FileDigest::of_path(&path)).await?;
        self.announced.insert(name.to_string());
        Ok(Message::FileInfo {
            name: name.to_string(),
            size: digest.size,
            hash: digest.hash,
        })
    }

    /// A peer announced a file.
    ///
    /// Returns a hash request if our copy differs and sorts lower, or our own
    /// `FileInfo` if our copy wins and the peer has not heard of it yet.
    pub async fn on_file_info(
        &mut self,
        name: &str,
        size: u64,
        hash: Sha1Hash,
    ) -> Result<Option<Message>> {
        let path = self.path(name)?;
        let local = Self::blocking(name, move || FileDigest::of_path_or_empty(&path)).await?;

        if local.size == size && local.hash == hash {
            tracing::debug!(file = name, "file already in sync");
            self.pending.remove(name);
            return Ok(None);
        }

        if (local.size, local.hash) > (size, hash) {
            tracing::debug!(
                file = name,
                local_size = local.size,
                remote_size = size,
                "local copy wins"
            );
            if local.size == 0 || self.announced.contains(name) {
                return Ok(None);
            }
            return self.announce(name).await.map(Some);
        }

        let remote_blocks = block_count(size);
        if remote_blocks == 0 {
            return Ok(None);
        }

        tracing::debug!(
            file = name,
            local_size = local.size,
            remote_size = size,
            "file differs, requesting block hashes"
        );
        self.pending.insert(
            name.to_string(),
            PendingFile {
                local_blocks: local.blocks,
                remote_blocks,
            },
        );
        Ok(Some(Message::FileHashRequest {
            name: name.to_string(),
        }))
    }

    /// A peer wants our block digests. Returns one reply per block, in order.
    pub async fn on_hash_request(&self, name: &str) -> Result<Vec<Message>> {
        let path = self.path(name)?;
        let digest = Self::blocking(name, move || FileDigest::of_path(&path)).await?;

        Ok(digest
            .blocks
            .into_iter()
            .enumerate()
            .map(|(index, hash)| Message::FileHashReply {
                name: name.to_string(),
                index: index as u64,
                hash,
            })
            .collect())
    }

    /// Compare one remote block digest against ours.
    ///
    /// A block we do not have counts as a mismatch. Replies for files we
    /// never asked about are ignored.
    pub fn on_hash_reply(&mut self, name: &str, index: u64, hash: Sha1Hash) -> Option<Message> {
        let Some(pending) = self.pending.get(name) else {
            tracing::debug!(file = name, index, "unsolicited block hash");
            return None;
        };

        let matches = usize::try_from(index)
            .ok()
            .and_then(|i| pending.local_blocks.get(i))
            .is_some_and(|local| *local == hash);

        if index.saturating_add(1) >= pending.remote_blocks {
            self.pending.remove(name);
        }

        if matches {
            None
        } else {
            self.requested.insert((name.to_string(), index));
            Some(Message::FileBlockRequest {
                name: name.to_string(),
                index,
            })
        }
    }

    /// A peer wants one of our blocks.
    pub async fn on_block_request(&self, name: &str, index: u64) -> Result<Message> {
        let path = self.path(name)?;
        let data = Self::blocking(name, move || read_block(&path, index)).await?;
        Ok(Message::FileBlockReply {
            name: name.to_string(),
            index,
            data,
        })
    }

    /// Write a received block into place. Only blocks we requested are
    /// accepted.
    pub async fn on_block_reply(&mut self, name: &str, index: u64, data: Bytes) -> Result<()> {
        if !self.requested.remove(&(name.to_string(), index)) {
            return Err(SyncError::Protocol(format!(
                "unrequested block {} of {}",
                index, name
            )));
        }
        if data.len() > BLOCK_SIZE {
            return Err(SyncError::Protocol(format!(
                "block {} of {} is {} bytes",
                index,
                name,
                data.len()
            )));
        }
        let path = self.path(name)?;
        Self::blocking(name, move || write_block(&path, index, &data)).await
    }
}
