#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use rand::RngCore;

    use crate::{chunk_list_size, ChunkMgr, ChunkMgrConfig, MemoryTransport};

    fn endpoints(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| format!("http://endpoint{}.test/hook", i))
            .collect()
    }

    fn test_config(chunk_size: usize, n_endpoints: usize) -> ChunkMgrConfig {
        ChunkMgrConfig {
            endpoints: endpoints(n_endpoints),
            chunk_size,
            parallelism: 1,
            retry_attempts: 3,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
            failure_threshold: 2,
            cooldown: Duration::from_millis(40),
        }
    }

    fn new_mgr(config: ChunkMgrConfig) -> (ChunkMgr, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let mgr = ChunkMgr::new(config, transport.clone()).unwrap();
        (mgr, transport)
    }

    fn random_bytes(size: u64) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        let mut buffer = vec![0u8; size as usize];
        rng.fill_bytes(&mut buffer);
        buffer
    }

    #[tokio::test]
    async fn test_round_trip() {
        let mut config = test_config(1024, 2);
        config.parallelism = 4;
        let (mgr, _transport) = new_mgr(config);

        let data = random_bytes(10 * 1024 + 321);
        let chunks = mgr.put(&data[..]).await.unwrap();
        assert_eq!(chunks.len(), 11);
        assert_eq!(chunk_list_size(&chunks), data.len() as u64);

        let read = mgr.get(&chunks, 0, data.len() as u64).await.unwrap();
        assert_eq!(read, data);
    }

    #[tokio::test]
    async fn test_chunk_count_law() {
        for size in [1u64, 1023, 1024, 1025, 4096, 5000] {
            let (mgr, _transport) = new_mgr(test_config(1024, 1));
            let data = random_bytes(size);
            let chunks = mgr.put(&data[..]).await.unwrap();
            let expect = (size + 1023) / 1024;
            assert_eq!(chunks.len() as u64, expect, "size {}", size);
            assert_eq!(chunk_list_size(&chunks), size);
            for (i, chunk) in chunks.iter().enumerate() {
                assert_eq!(chunk.seq as usize, i);
                assert!(chunk.size <= 1024);
            }
        }
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let (mgr, _transport) = new_mgr(test_config(1024, 1));
        let chunks = mgr.put(&[][..]).await.unwrap();
        assert!(chunks.is_empty());
        assert!(mgr.get(&chunks, 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_round_robin_assignment() {
        let (mgr, _transport) = new_mgr(test_config(25, 3));
        let data = random_bytes(60);
        let chunks = mgr.put(&data[..]).await.unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].size, 25);
        assert_eq!(chunks[1].size, 25);
        assert_eq!(chunks[2].size, 10);
        assert_eq!(chunks[0].endpoint, "http://endpoint0.test/hook");
        assert_eq!(chunks[1].endpoint, "http://endpoint1.test/hook");
        assert_eq!(chunks[2].endpoint, "http://endpoint2.test/hook");
    }

    #[tokio::test]
    async fn test_ordering_independent_of_completion() {
        let mut config = test_config(512, 3);
        config.parallelism = 8;
        let (mgr, _transport) = new_mgr(config);

        let data = random_bytes(64 * 1024);
        let chunks = mgr.put(&data[..]).await.unwrap();
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.seq as usize, i);
        }
        let read = mgr.get(&chunks, 0, data.len() as u64).await.unwrap();
        assert_eq!(read, data);
    }

    #[tokio::test]
    async fn test_get_sub_ranges() {
        let (mgr, _transport) = new_mgr(test_config(100, 2));
        let data = random_bytes(1000);
        let chunks = mgr.put(&data[..]).await.unwrap();
        assert_eq!(chunks.len(), 10);

        let read = mgr.get(&chunks, 250, 300).await.unwrap();
        assert_eq!(read, &data[250..550]);

        let read = mgr.get(&chunks, 950, 500).await.unwrap();
        assert_eq!(read, &data[950..]);

        assert!(mgr.get(&chunks, 1000, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_advances_endpoint() {
        let (mgr, transport) = new_mgr(test_config(1024, 2));
        transport.fail_endpoint("http://endpoint0.test/hook", 1);

        let data = random_bytes(10);
        let chunks = mgr.put(&data[..]).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].endpoint, "http://endpoint1.test/hook");
        assert_eq!(transport.upload_attempts(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_backoff_then_success() {
        let (mgr, transport) = new_mgr(test_config(1024, 1));
        transport.rate_limit_next(1);

        let data = random_bytes(10);
        let chunks = mgr.put(&data[..]).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(transport.upload_attempts(), 2);
    }

    #[tokio::test]
    async fn test_cooldown_excludes_endpoint_until_recovery() {
        let (mgr, transport) = new_mgr(test_config(1024, 1));
        // two consecutive failures hit the threshold and arm the cooldown
        transport.fail_endpoint("http://endpoint0.test/hook", 2);

        let data = random_bytes(10);
        let err = mgr.put(&data[..]).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(mgr.healthy_endpoints(), 0);

        // while cooling down, selection fails without any upload attempt
        let attempts = transport.upload_attempts();
        assert!(mgr.put(&data[..]).await.is_err());
        assert_eq!(transport.upload_attempts(), attempts);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(mgr.healthy_endpoints(), 1);
        let chunks = mgr.put(&data[..]).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(mgr.healthy_endpoints(), 1);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_permanent() {
        let (mgr, transport) = new_mgr(test_config(1024, 1));
        let data = random_bytes(100);
        let chunks = mgr.put(&data[..]).await.unwrap();
        transport.corrupt(&chunks[0].remote_ref);

        let before = transport.download_attempts();
        let err = mgr.get(&chunks, 0, 100).await.unwrap_err();
        assert!(!err.is_retryable());
        // non-retryable errors do not consume the retry budget
        assert_eq!(transport.download_attempts(), before + 1);
    }

    #[tokio::test]
    async fn test_download_retry() {
        let (mgr, transport) = new_mgr(test_config(1024, 1));
        let data = random_bytes(100);
        let chunks = mgr.put(&data[..]).await.unwrap();

        transport.fail_next_downloads(1);
        let read = mgr.get(&chunks, 0, 100).await.unwrap();
        assert_eq!(read, data);
        assert_eq!(transport.download_attempts(), 2);
    }

    #[tokio::test]
    async fn test_delete_best_effort() {
        let (mgr, transport) = new_mgr(test_config(100, 1));
        let data = random_bytes(250);
        let chunks = mgr.put(&data[..]).await.unwrap();
        assert_eq!(transport.blob_count(), 3);

        mgr.delete(&chunks).await;
        assert_eq!(transport.blob_count(), 0);

        // deleting again must not propagate anything
        mgr.delete(&chunks).await;
    }

    #[tokio::test]
    async fn test_rejects_bad_config() {
        let transport = Arc::new(MemoryTransport::new());
        let mut config = test_config(0, 1);
        assert!(ChunkMgr::new(config.clone(), transport.clone()).is_err());
        config.chunk_size = 1024;
        config.parallelism = 0;
        assert!(ChunkMgr::new(config.clone(), transport.clone()).is_err());
        config.parallelism = 1;
        config.endpoints.clear();
        assert!(ChunkMgr::new(config, transport).is_err());
    }
}
