use drv_lib::{ChunkDescriptor, DrvError, DrvResult};
use fs_meta::{NodeId, NodeRecord};
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Replace the file content on flush.
    Write,
    /// Keep the committed chunk list and add the staged bytes after it.
    Append,
}

/// Write handles move `Opened -> Writing* -> Flushing -> Closed`,
/// read handles `Opened -> Reading* -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Opened,
    Reading,
    Writing,
    Flushing,
    Closed,
}

/// An open file. Read handles carry the chunk list as of open and keep
/// serving that snapshot; write handles hold the node's exclusive lock until
/// their flush completes.
#[derive(Debug)]
pub struct FileHandle {
    pub(crate) node: NodeRecord,
    pub(crate) mode: OpenMode,
    pub(crate) state: HandleState,
    pub(crate) chunks: Vec<ChunkDescriptor>,
    /// Staged bytes for write handles. For `Append` this is the appended
    /// tail only; offsets passed to write are relative to it.
    pub(crate) staging: Vec<u8>,
    pub(crate) write_guard: Option<OwnedMutexGuard<()>>,
}

impl FileHandle {
    pub fn node_id(&self) -> NodeId {
        self.node.id
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    /// Committed size for read handles, committed plus staged for writers.
    pub fn size(&self) -> u64 {
        match self.mode {
            OpenMode::Read => self.node.size,
            OpenMode::Write => self.staging.len() as u64,
            OpenMode::Append => self.node.size + self.staging.len() as u64,
        }
    }

    pub(crate) fn ensure_readable(&mut self) -> DrvResult<()> {
        if self.mode != OpenMode::Read {
            return Err(DrvError::Invalid(
                "handle is not open for reading".to_string(),
            ));
        }
        match self.state {
            HandleState::Opened | HandleState::Reading => {
                self.state = HandleState::Reading;
                Ok(())
            }
            _ => Err(DrvError::Invalid(format!(
                "cannot read in state {:?}",
                self.state
            ))),
        }
    }

    pub(crate) fn ensure_writable(&mut self) -> DrvResult<()> {
        if self.mode == OpenMode::Read {
            return Err(DrvError::Invalid(
                "handle is not open for writing".to_string(),
            ));
        }
        match self.state {
            HandleState::Opened | HandleState::Writing => {
                self.state = HandleState::Writing;
                Ok(())
            }
            _ => Err(DrvError::Invalid(format!(
                "cannot write in state {:?}",
                self.state
            ))),
        }
    }

    /// Copy `data` into the staging buffer at `offset`, zero-filling any gap
    /// before it. Offsets the buffer cannot address are rejected.
    pub(crate) fn stage_write(&mut self, offset: u64, data: &[u8]) -> DrvResult<()> {
        self.ensure_writable()?;
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= usize::MAX as u64)
            .ok_or_else(|| {
                DrvError::Invalid(format!(
                    "write of {} bytes at offset {} is out of range",
                    data.len(),
                    offset
                ))
            })?;
        let offset = offset as usize;
        let end = end as usize;
        if end > self.staging.len() {
            self.staging.resize(end, 0);
        }
        self.staging[offset..end].copy_from_slice(data);
        Ok(())
    }
}
