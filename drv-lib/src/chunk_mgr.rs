use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::{
    chunk_checksum, plan_range, ChunkDescriptor, ChunkTransport, DrvError, DrvResult,
    EndpointPool,
};

#[derive(Debug, Clone)]
pub struct ChunkMgrConfig {
    /// Ordered list of endpoint URLs; rotation starts from the first.
    pub endpoints: Vec<String>,
    /// Maximum chunk size in bytes. Must not exceed the platform's
    /// per-message attachment limit.
    pub chunk_size: usize,
    /// Concurrent transfers per Put/Get call.
    pub parallelism: usize,
    /// Attempts per chunk transfer before the error surfaces.
    pub retry_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Consecutive failures before an endpoint starts cooling down.
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for ChunkMgrConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            // just under the usual 25MB attachment limit
            chunk_size: 24 * 1024 * 1024,
            parallelism: 4,
            retry_attempts: 3,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(5),
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// The sole path through which bytes reach or leave remote storage. Splits
/// streams into bounded chunks, uploads them against the rotating endpoint
/// pool and reassembles them on read.
pub struct ChunkMgr {
    chunk_size: usize,
    parallelism: usize,
    retry_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    pool: Arc<EndpointPool>,
    transport: Arc<dyn ChunkTransport>,
}

fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16)).min(max)
}

impl ChunkMgr {
    pub fn new(config: ChunkMgrConfig, transport: Arc<dyn ChunkTransport>) -> DrvResult<Self> {
        if config.chunk_size == 0 {
            return Err(DrvError::Invalid("chunk size must be positive".to_string()));
        }
        if config.parallelism == 0 {
            return Err(DrvError::Invalid("parallelism must be positive".to_string()));
        }
        if config.retry_attempts == 0 {
            return Err(DrvError::Invalid(
                "retry attempt count must be positive".to_string(),
            ));
        }
        let pool = EndpointPool::new(
            config.endpoints,
            config.failure_threshold,
            config.cooldown,
        )?;
        Ok(Self {
            chunk_size: config.chunk_size,
            parallelism: config.parallelism,
            retry_attempts: config.retry_attempts,
            backoff_base: config.backoff_base,
            backoff_max: config.backoff_max,
            pool: Arc::new(pool),
            transport,
        })
    }

    pub fn max_chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn healthy_endpoints(&self) -> usize {
        self.pool.healthy_count()
    }

    /// Split `reader` into chunks of at most the configured size and upload
    /// them with bounded parallelism. The returned list is ordered by
    /// sequence number regardless of upload completion order.
    ///
    /// Dropping the future aborts outstanding transfers; chunks uploaded
    /// before that are orphaned and never referenced by committed metadata.
    pub async fn put<R>(&self, mut reader: R) -> DrvResult<Vec<ChunkDescriptor>>
    where
        R: AsyncRead + Unpin,
    {
        let sem = Arc::new(Semaphore::new(self.parallelism));
        let mut tasks: JoinSet<(u32, DrvResult<ChunkDescriptor>)> = JoinSet::new();
        let mut seq: u32 = 0;

        loop {
            let mut buf = vec![0u8; self.chunk_size];
            let mut filled = 0usize;
            while filled < self.chunk_size {
                let n = reader.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            buf.truncate(filled);

            let permit = sem
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| DrvError::Internal(e.to_string()))?;
            let this_seq = seq;
            let transport = self.transport.clone();
            let pool = self.pool.clone();
            let retry_attempts = self.retry_attempts;
            let backoff_base = self.backoff_base;
            let backoff_max = self.backoff_max;
            tasks.spawn(async move {
                let result = upload_chunk(
                    transport,
                    pool,
                    this_seq,
                    buf,
                    retry_attempts,
                    backoff_base,
                    backoff_max,
                )
                .await;
                drop(permit);
                (this_seq, result)
            });
            seq += 1;

            if filled < self.chunk_size {
                // final partial chunk
                break;
            }
        }

        // slot array indexed by sequence number: completion order never
        // determines output order
        let mut slots: Vec<Option<ChunkDescriptor>> = Vec::new();
        slots.resize(seq as usize, None);
        while let Some(joined) = tasks.join_next().await {
            let (chunk_seq, result) = joined
                .map_err(|e| DrvError::Internal(format!("upload task failed: {}", e)))?;
            match result {
                Ok(desc) => slots[chunk_seq as usize] = Some(desc),
                Err(e) => {
                    warn!("put: chunk {} upload failed: {}", chunk_seq, e);
                    return Err(e);
                }
            }
        }

        let mut chunks = Vec::with_capacity(slots.len());
        for slot in slots {
            chunks.push(
                slot.ok_or_else(|| DrvError::Internal("missing chunk slot".to_string()))?,
            );
        }
        debug!("put: uploaded {} chunks", chunks.len());
        Ok(chunks)
    }

    /// Read `[offset, offset+len)` from an ordered chunk list, issuing
    /// per-chunk range downloads with bounded parallelism. The result is
    /// trimmed to the requested range and clamped to the total size.
    pub async fn get(
        &self,
        chunks: &[ChunkDescriptor],
        offset: u64,
        len: u64,
    ) -> DrvResult<Vec<u8>> {
        let slices = plan_range(chunks, offset, len)?;
        if slices.is_empty() {
            return Ok(Vec::new());
        }

        let sem = Arc::new(Semaphore::new(self.parallelism));
        let mut tasks: JoinSet<(usize, DrvResult<Vec<u8>>)> = JoinSet::new();
        for (slot_idx, slice) in slices.iter().enumerate() {
            let chunk = chunks[slice.index].clone();
            let inner = slice.inner.clone();
            let permit = sem
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| DrvError::Internal(e.to_string()))?;
            let transport = self.transport.clone();
            let pool = self.pool.clone();
            let retry_attempts = self.retry_attempts;
            let backoff_base = self.backoff_base;
            let backoff_max = self.backoff_max;
            tasks.spawn(async move {
                let result = download_chunk(
                    transport,
                    pool,
                    chunk,
                    inner,
                    retry_attempts,
                    backoff_base,
                    backoff_max,
                )
                .await;
                drop(permit);
                (slot_idx, result)
            });
        }

        let mut slots: Vec<Option<Vec<u8>>> = vec![None; slices.len()];
        while let Some(joined) = tasks.join_next().await {
            let (slot_idx, result) = joined
                .map_err(|e| DrvError::Internal(format!("download task failed: {}", e)))?;
            slots[slot_idx] = Some(result?);
        }

        let total: u64 = slices.iter().map(|s| s.len()).sum();
        let mut out = Vec::with_capacity(total as usize);
        for slot in slots {
            let data =
                slot.ok_or_else(|| DrvError::Internal("missing download slot".to_string()))?;
            out.extend_from_slice(&data);
        }
        Ok(out)
    }

    /// Best-effort remote deletion, one request per chunk. The remote object
    /// may already be gone or the endpoint unreachable; failures are logged,
    /// never propagated.
    pub async fn delete(&self, chunks: &[ChunkDescriptor]) {
        for chunk in chunks {
            if let Err(e) = self.transport.delete(&chunk.remote_ref).await {
                warn!(
                    "delete chunk {} ({}) failed: {}",
                    chunk.seq, chunk.remote_ref, e
                );
            }
        }
    }
}

async fn upload_chunk(
    transport: Arc<dyn ChunkTransport>,
    pool: Arc<EndpointPool>,
    seq: u32,
    data: Vec<u8>,
    retry_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
) -> DrvResult<ChunkDescriptor> {
    let checksum = chunk_checksum(&data);
    let size = data.len() as u64;
    let mut last_err = DrvError::Transient("no upload attempted".to_string());

    for attempt in 0..retry_attempts {
        let endpoint = pool.select()?;
        match transport.upload(&endpoint, &data).await {
            Ok(remote_ref) => {
                pool.record_success(&endpoint);
                debug!("chunk {} => {} ({} bytes)", seq, endpoint, size);
                return Ok(ChunkDescriptor {
                    seq,
                    size,
                    remote_ref,
                    checksum,
                    endpoint,
                });
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    "chunk {} upload via {} failed (attempt {}): {}",
                    seq,
                    endpoint,
                    attempt + 1,
                    e
                );
                pool.record_failure(&endpoint);
                if e.is_rate_limited() {
                    tokio::time::sleep(backoff_delay(backoff_base, backoff_max, attempt)).await;
                }
                last_err = e;
            }
            // non-retryable: fail without consuming the remaining budget
            Err(e) => return Err(e),
        }
    }
    Err(last_err)
}

async fn download_chunk(
    transport: Arc<dyn ChunkTransport>,
    pool: Arc<EndpointPool>,
    chunk: ChunkDescriptor,
    inner: std::ops::Range<u64>,
    retry_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
) -> DrvResult<Vec<u8>> {
    let full = inner.start == 0 && inner.end == chunk.size;
    let range = if full { None } else { Some(inner.clone()) };
    let want = inner.end - inner.start;
    let mut last_err = DrvError::Transient("no download attempted".to_string());

    for attempt in 0..retry_attempts {
        match transport.download(&chunk.remote_ref, range.clone()).await {
            Ok(data) => {
                if data.len() as u64 != want {
                    pool.record_failure(&chunk.endpoint);
                    last_err = DrvError::Transient(format!(
                        "short read for chunk {}: got {} bytes, want {}",
                        chunk.seq,
                        data.len(),
                        want
                    ));
                    continue;
                }
                // the checksum covers the whole chunk, so only full
                // downloads can verify it
                if full && chunk_checksum(&data) != chunk.checksum {
                    pool.record_failure(&chunk.endpoint);
                    return Err(DrvError::Permanent(format!(
                        "checksum mismatch for chunk {} ({})",
                        chunk.seq, chunk.remote_ref
                    )));
                }
                pool.record_success(&chunk.endpoint);
                return Ok(data);
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    "chunk {} download failed (attempt {}): {}",
                    chunk.seq,
                    attempt + 1,
                    e
                );
                pool.record_failure(&chunk.endpoint);
                if e.is_rate_limited() {
                    tokio::time::sleep(backoff_delay(backoff_base, backoff_max, attempt)).await;
                }
                last_err = e;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err)
}
