use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use drv_lib::{ChunkDescriptor, ChunkMgr, DrvError, DrvResult};
use fs_meta::{FsPath, MetaStore, NodeId, NodeKind, NodeRecord};

use crate::{FileHandle, HandleState, OpenMode};

/// Virtual filesystem over the chunk store: paths and directory structure
/// live in the metadata store, file bytes live behind the chunk manager.
///
/// Writers stage bytes locally and commit them as a whole chunk list on
/// flush, so readers always see either the previous content or the new
/// content, never a mix.
pub struct Dfs {
    meta: Arc<MetaStore>,
    chunks: Arc<ChunkMgr>,
    locks: Mutex<HashMap<NodeId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Dfs {
    pub fn new(meta: Arc<MetaStore>, chunks: Arc<ChunkMgr>) -> Self {
        Self {
            meta,
            chunks,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn node_lock(&self, id: NodeId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn drop_node_lock(&self, id: NodeId) {
        self.locks.lock().unwrap().remove(&id);
    }

    /// Open a file for reading or writing.
    ///
    /// `Read` requires the file to exist and snapshots its chunk list: the
    /// handle keeps serving that version even if a writer replaces the
    /// content later. `Write` and `Append` create the file if it is missing
    /// (the parent directory must exist) and take the node's exclusive write
    /// lock; a second writer waits until the first closes.
    pub async fn open(&self, path: &str, mode: OpenMode) -> DrvResult<FileHandle> {
        let path = FsPath::parse(path)?;
        match mode {
            OpenMode::Read => {
                let node = self.meta.resolve_path(&path)?;
                if node.is_dir() {
                    return Err(DrvError::Invalid(format!(
                        "cannot open directory for reading: {}",
                        path
                    )));
                }
                let chunks = self.meta.get_chunk_list(node.id)?;
                Ok(FileHandle {
                    node,
                    mode,
                    state: HandleState::Opened,
                    chunks,
                    staging: Vec::new(),
                    write_guard: None,
                })
            }
            OpenMode::Write | OpenMode::Append => self.open_for_write(&path, mode).await,
        }
    }

    async fn open_for_write(&self, path: &FsPath, mode: OpenMode) -> DrvResult<FileHandle> {
        let node = match self.meta.resolve_path(path) {
            Ok(node) => {
                if node.is_dir() {
                    return Err(DrvError::Invalid(format!(
                        "cannot open directory for writing: {}",
                        path
                    )));
                }
                node
            }
            Err(e) if e.is_not_found() => {
                let (parent_path, name) = path.split_parent_name().ok_or_else(|| {
                    DrvError::Invalid("cannot open root as a file".to_string())
                })?;
                let parent = self.meta.resolve_path(&parent_path)?;
                match self.meta.create_node(parent.id, &name, NodeKind::File) {
                    Ok(node) => node,
                    // another writer created it in the meantime
                    Err(e) if e.is_conflict() => self.meta.resolve_path(path)?,
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        let guard = self.node_lock(node.id).lock_owned().await;
        // re-read under the lock: an earlier writer may have flushed or the
        // node may have been removed while we waited
        let node = self
            .meta
            .get_node(node.id)?
            .ok_or_else(|| DrvError::NotFound(format!("file removed while opening: {}", path)))?;
        let chunks = match mode {
            OpenMode::Append => self.meta.get_chunk_list(node.id)?,
            _ => Vec::new(),
        };
        Ok(FileHandle {
            node,
            mode,
            state: HandleState::Opened,
            chunks,
            staging: Vec::new(),
            write_guard: Some(guard),
        })
    }

    /// Read up to `len` bytes at `offset` from the handle's snapshot.
    pub async fn read(
        &self,
        handle: &mut FileHandle,
        offset: u64,
        len: u64,
    ) -> DrvResult<Vec<u8>> {
        handle.ensure_readable()?;
        self.chunks.get(&handle.chunks, offset, len).await
    }

    /// Stage `data` at `offset` in the handle's buffer. Offsets beyond the
    /// staged end zero-fill the gap. Nothing is uploaded until flush.
    pub fn write(&self, handle: &mut FileHandle, offset: u64, data: &[u8]) -> DrvResult<()> {
        handle.stage_write(offset, data)
    }

    /// Upload the staged bytes and commit the new chunk list. On failure the
    /// staged bytes are kept, the handle stays writable and the committed
    /// content is untouched.
    ///
    /// Chunks of a replaced version are left on the remote so handles that
    /// opened the old version keep reading it.
    pub async fn flush(&self, handle: &mut FileHandle) -> DrvResult<()> {
        if handle.mode == OpenMode::Read {
            return Err(DrvError::Invalid(
                "handle is not open for writing".to_string(),
            ));
        }
        match handle.state {
            HandleState::Opened | HandleState::Writing => {}
            _ => {
                return Err(DrvError::Invalid(format!(
                    "cannot flush in state {:?}",
                    handle.state
                )))
            }
        }
        if handle.mode == OpenMode::Append && handle.staging.is_empty() {
            handle.state = HandleState::Opened;
            return Ok(());
        }

        handle.state = HandleState::Flushing;
        let uploaded = match self.chunks.put(handle.staging.as_slice()).await {
            Ok(uploaded) => uploaded,
            Err(e) => {
                warn!("flush of node {} failed: {}", handle.node.id, e);
                handle.state = HandleState::Writing;
                return Err(e);
            }
        };

        let list = match handle.mode {
            OpenMode::Append => {
                let base = handle.chunks.len() as u32;
                let mut list = handle.chunks.clone();
                for (i, mut desc) in uploaded.into_iter().enumerate() {
                    desc.seq = base + i as u32;
                    list.push(desc);
                }
                list
            }
            _ => uploaded,
        };

        let replaced = match self.meta.replace_chunk_list(handle.node.id, &list) {
            Ok(replaced) => replaced,
            Err(e) => {
                handle.state = HandleState::Writing;
                return Err(e);
            }
        };
        if !replaced.is_empty() && handle.mode != OpenMode::Append {
            debug!(
                "node {}: {} chunks of the previous version left for open readers",
                handle.node.id,
                replaced.len()
            );
        }

        handle.node = self
            .meta
            .get_node(handle.node.id)?
            .ok_or_else(|| DrvError::Internal("flushed node disappeared".to_string()))?;
        handle.chunks = list;
        handle.staging.clear();
        handle.state = HandleState::Opened;
        Ok(())
    }

    /// Close the handle, flushing pending writes first. The write lock is
    /// released and the handle marked closed even when the flush fails.
    pub async fn close(&self, handle: &mut FileHandle) -> DrvResult<()> {
        let result = if handle.state == HandleState::Writing {
            self.flush(handle).await
        } else {
            Ok(())
        };
        handle.write_guard = None;
        handle.state = HandleState::Closed;
        result
    }

    pub fn stat(&self, path: &str) -> DrvResult<NodeRecord> {
        let path = FsPath::parse(path)?;
        self.meta.resolve_path(&path)
    }

    /// List a directory's children, sorted by name.
    pub fn list(&self, path: &str) -> DrvResult<Vec<NodeRecord>> {
        let path = FsPath::parse(path)?;
        let node = self.meta.resolve_path(&path)?;
        self.meta.list_children(node.id)
    }

    pub fn mkdir(&self, path: &str) -> DrvResult<NodeRecord> {
        let path = FsPath::parse(path)?;
        let (parent_path, name) = path
            .split_parent_name()
            .ok_or_else(|| DrvError::Conflict("root directory already exists".to_string()))?;
        let parent = self.meta.resolve_path(&parent_path)?;
        self.meta.create_node(parent.id, &name, NodeKind::Dir)
    }

    /// Remove a file or directory subtree. Metadata goes first in a single
    /// transaction; remote chunks are deleted in the background afterwards,
    /// so a failed remote cleanup never resurrects the path.
    pub async fn remove(&self, path: &str) -> DrvResult<()> {
        let path = FsPath::parse(path)?;
        let node = self.meta.resolve_path(&path)?;
        let orphaned = self.meta.delete_node(node.id)?;
        self.drop_node_lock(node.id);
        if !orphaned.is_empty() {
            self.spawn_remote_cleanup(orphaned);
        }
        Ok(())
    }

    fn spawn_remote_cleanup(&self, orphaned: Vec<ChunkDescriptor>) {
        let chunks = self.chunks.clone();
        tokio::spawn(async move {
            debug!("cleaning up {} orphaned chunks", orphaned.len());
            chunks.delete(&orphaned).await;
        });
    }

    pub fn rename(&self, from: &str, to: &str) -> DrvResult<()> {
        let from = FsPath::parse(from)?;
        let to = FsPath::parse(to)?;
        let node = self.meta.resolve_path(&from)?;
        let (parent_path, name) = to
            .split_parent_name()
            .ok_or_else(|| DrvError::Invalid("cannot rename to root".to_string()))?;
        let parent = self.meta.resolve_path(&parent_path)?;
        self.meta.rename(node.id, parent.id, &name)
    }

    /// Shrink a file to `new_size` bytes. Whole chunks below the boundary
    /// are kept as-is; the chunk straddling it is downloaded, cut and
    /// re-uploaded. Growing a file this way is rejected.
    pub async fn truncate(&self, path: &str, new_size: u64) -> DrvResult<()> {
        let path = FsPath::parse(path)?;
        let node = self.meta.resolve_path(&path)?;
        if node.is_dir() {
            return Err(DrvError::Invalid(format!(
                "cannot truncate directory: {}",
                path
            )));
        }

        let _guard = self.node_lock(node.id).lock_owned().await;
        let node = self
            .meta
            .get_node(node.id)?
            .ok_or_else(|| DrvError::NotFound(format!("file removed: {}", path)))?;
        if new_size == node.size {
            return Ok(());
        }
        if new_size > node.size {
            return Err(DrvError::Invalid(format!(
                "truncate cannot grow a file: {} < {}",
                node.size, new_size
            )));
        }

        let old = self.meta.get_chunk_list(node.id)?;
        let mut kept: Vec<ChunkDescriptor> = Vec::new();
        let mut covered: u64 = 0;
        let mut boundary: Option<ChunkDescriptor> = None;
        for desc in old {
            if covered + desc.size <= new_size {
                covered += desc.size;
                kept.push(desc);
            } else if covered < new_size {
                boundary = Some(desc);
                break;
            } else {
                break;
            }
        }

        if let Some(desc) = boundary {
            // fetch the surviving prefix of the straddling chunk and store
            // it as a fresh chunk
            let mut single = desc.clone();
            single.seq = 0;
            let prefix = self
                .chunks
                .get(std::slice::from_ref(&single), 0, new_size - covered)
                .await?;
            let uploaded = self.chunks.put(prefix.as_slice()).await?;
            let base = kept.len() as u32;
            for (i, mut d) in uploaded.into_iter().enumerate() {
                d.seq = base + i as u32;
                kept.push(d);
            }
        }

        let replaced = self.meta.replace_chunk_list(node.id, &kept)?;
        debug!(
            "truncated node {} to {} bytes, {} chunks replaced",
            node.id,
            new_size,
            replaced.len()
        );
        Ok(())
    }
}
