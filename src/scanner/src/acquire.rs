//! Concurrent, memory-bounded layer acquisition.
//!
//! Layers are fetched in parallel, one worker per unique layer, under a
//! budget on the declared tar bytes that may be scheduled or in flight at
//! once. Layers are sorted largest-first so a handful of big blobs cannot
//! pile up behind dozens of small ones, and each worker extracts its tar
//! straight into the layer's own directory under the image scratch path.
//!
//! Admission accounting: a layer's declared size is added to the running
//! counter before its worker spawns, and the admission loop stalls while
//! the counter exceeds the budget. At most one over-budget layer can
//! therefore be admitted before admission pauses, which bounds the
//! in-flight total strictly below twice the budget.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use layersift_core::config::ScanConfig;
use layersift_core::error::{Result, ScanError};
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, Notify};
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::archive;

/// Sentinel written inside a layer directory once extraction completed.
/// A directory without it is residue from an interrupted attempt.
pub const EXTRACT_SENTINEL: &str = ".ok";

/// Byte stream of one layer tar.
pub type LayerStream = Box<dyn AsyncRead + Send + Unpin>;

/// Opens the tar stream of a single layer, by digest or tar ID.
#[async_trait]
pub trait LayerReader: Send + Sync {
    /// Returns the stream and the declared tar size, or -1 when unknown.
    async fn open(&self, cancel: &CancellationToken, layer: &str) -> Result<(LayerStream, i64)>;
}

/// Outcome of one layer download and extraction.
#[derive(Debug)]
pub struct DownloadResult {
    pub layer: String,
    /// Decompressed bytes written into the layer directory
    pub size: i64,
    /// Declared tar size used for admission accounting
    pub tar_size: i64,
    pub err: Option<ScanError>,
}

/// Download and extract every layer into `<img_path>/<layer>/`.
///
/// `sizes` carries the declared tar sizes when the manifest provides them
/// (registry schema v2); an empty map means no size information. Returns
/// the per-layer results plus one aggregate error when any layer failed -
/// successful layers keep their data either way.
pub async fn download_layers(
    cancel: &CancellationToken,
    layers: &[String],
    sizes: &HashMap<String, i64>,
    img_path: &Path,
    reader: Arc<dyn LayerReader>,
    config: &ScanConfig,
) -> (HashMap<String, DownloadResult>, Option<ScanError>) {
    let has_size_info = !sizes.is_empty();

    // unique layers, first occurrence wins, empty IDs dropped
    let mut unique: Vec<(String, i64)> = Vec::new();
    for layer in layers {
        if layer.is_empty() || unique.iter().any(|(l, _)| l == layer) {
            continue;
        }
        let size = if has_size_info {
            sizes.get(layer).copied().unwrap_or(0)
        } else {
            0
        };
        unique.push((layer.clone(), size));
    }
    // largest first; the sort is stable so equal sizes keep their order
    unique.sort_by_key(|(_, size)| std::cmp::Reverse(*size));

    let expected = unique.len();
    let accumulated = Arc::new(AtomicI64::new(0));
    let released = Arc::new(Notify::new());
    let (tx, mut rx) = mpsc::channel::<DownloadResult>(expected.max(1));

    let monitor = tokio::spawn(async move {
        let mut results = HashMap::with_capacity(expected);
        let mut aggregate: Option<ScanError> = None;
        for _ in 0..expected {
            let Some(res) = rx.recv().await else { break };
            debug!(
                layer = %res.layer,
                size = res.size,
                tar_size = res.tar_size,
                ok = res.err.is_none(),
                "layer download settled"
            );
            if let Some(err) = &res.err {
                aggregate = Some(err.clone());
            }
            results.insert(res.layer.clone(), res);
        }
        (results, aggregate)
    });

    for (layer, tar_size) in unique {
        accumulated.fetch_add(tar_size, Ordering::AcqRel);

        let tx = tx.clone();
        let cancel = cancel.clone();
        let reader = Arc::clone(&reader);
        let accumulated_worker = Arc::clone(&accumulated);
        let released_worker = Arc::clone(&released);
        let layer_path = img_path.join(&layer);
        let retry_limit = config.retry_limit;

        tokio::spawn(async move {
            let res = fetch_layer(
                &cancel,
                reader.as_ref(),
                &layer,
                tar_size,
                &layer_path,
                has_size_info,
                retry_limit,
            )
            .await;
            accumulated_worker.fetch_sub(tar_size, Ordering::AcqRel);
            released_worker.notify_waiters();
            let _ = tx.send(res).await;
        });

        // stall until the scheduled-or-in-flight bytes drop under budget
        while accumulated.load(Ordering::Acquire) > config.throttle_volume {
            let _ = tokio::time::timeout(Duration::from_secs(1), released.notified()).await;
        }
    }
    drop(tx);

    match monitor.await {
        Ok(settled) => settled,
        Err(err) => (
            HashMap::new(),
            Some(ScanError::FileSystem(format!("download monitor failed: {}", err))),
        ),
    }
}

/// Fetch and extract one layer, with up to `retry_limit` attempts.
async fn fetch_layer(
    cancel: &CancellationToken,
    reader: &dyn LayerReader,
    layer: &str,
    tar_size: i64,
    layer_path: &Path,
    has_size_info: bool,
    retry_limit: u32,
) -> DownloadResult {
    let mut result = DownloadResult {
        layer: layer.to_string(),
        size: 0,
        tar_size,
        err: None,
    };

    // a declared-zero layer produces no filesystem diff; nothing to fetch
    if has_size_info && tar_size == 0 {
        debug!(layer, "skip zero-sized layer");
        if let Err(err) = tokio::fs::create_dir_all(layer_path).await {
            result.err = Some(ScanError::FileSystem(format!(
                "create layer dir {}: {}",
                layer_path.display(),
                err
            )));
        }
        result.tar_size = 0;
        return result;
    }

    // a completed earlier extraction is reusable as-is
    if layer_path.join(EXTRACT_SENTINEL).is_file() {
        debug!(layer, "layer already extracted");
        return result;
    }

    let mut attempt = 0;
    while attempt < retry_limit {
        attempt += 1;

        if cancel.is_cancelled() {
            result.err = Some(ScanError::Cancelled);
            return result;
        }

        let stream = match reader.open(cancel, layer).await {
            Ok((stream, _declared)) => stream,
            Err(err) => {
                warn!(layer, attempt, %err, "open layer stream failed");
                let cancelled = matches!(err, ScanError::Cancelled) || cancel.is_cancelled();
                result.err = Some(err);
                if cancelled {
                    return result;
                }
                continue;
            }
        };

        // discard residue from an interrupted extraction
        if layer_path.exists() {
            if let Err(err) = tokio::fs::remove_dir_all(layer_path).await {
                error!(layer, %err, "failed to clear stale layer dir");
                result.err = Some(ScanError::FileSystem(format!(
                    "clear layer dir {}: {}",
                    layer_path.display(),
                    err
                )));
                return result;
            }
        }
        if let Err(err) = tokio::fs::create_dir_all(layer_path).await {
            error!(layer, path = %layer_path.display(), %err, "failed to make dir");
            // local filesystem error, no retry
            result.err = Some(ScanError::FileSystem(format!(
                "create layer dir {}: {}",
                layer_path.display(),
                err
            )));
            return result;
        }

        let dest = layer_path.to_path_buf();
        let bridge = SyncIoBridge::new(stream);
        match tokio::task::spawn_blocking(move || archive::extract_all(bridge, &dest, -1)).await {
            Ok(Ok(written)) => {
                if let Err(err) = tokio::fs::write(layer_path.join(EXTRACT_SENTINEL), b"").await {
                    result.err = Some(ScanError::FileSystem(format!(
                        "mark layer dir {}: {}",
                        layer_path.display(),
                        err
                    )));
                    return result;
                }
                result.size = written as i64;
                result.err = None;
                return result;
            }
            Ok(Err(err)) => {
                error!(layer, path = %layer_path.display(), %err, "failed to unpack layer");
                let _ = tokio::fs::remove_dir_all(layer_path).await;
                result.err = Some(err);
                if cancel.is_cancelled() {
                    return result;
                }
            }
            Err(err) => {
                result.err = Some(ScanError::FileSystem(format!(
                    "layer extraction task failed: {}",
                    err
                )));
                return result;
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::tar_bytes;
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct MockReader {
        /// layer -> tar bytes; a missing key makes `open` fail
        blobs: HashMap<String, Vec<u8>>,
        opens: AtomicUsize,
        /// concurrently executing `open` calls and the high-water mark
        current: AtomicI64,
        peak: AtomicI64,
        /// declared bytes concurrently held open and the high-water mark
        current_bytes: AtomicI64,
        peak_bytes: AtomicI64,
        delay: Duration,
        sizes: HashMap<String, i64>,
    }

    impl MockReader {
        fn new(blobs: HashMap<String, Vec<u8>>) -> Self {
            Self {
                blobs,
                opens: AtomicUsize::new(0),
                current: AtomicI64::new(0),
                peak: AtomicI64::new(0),
                current_bytes: AtomicI64::new(0),
                peak_bytes: AtomicI64::new(0),
                delay: Duration::ZERO,
                sizes: HashMap::new(),
            }
        }

        fn with_delay(mut self, delay: Duration, sizes: HashMap<String, i64>) -> Self {
            self.delay = delay;
            self.sizes = sizes;
            self
        }

        fn bump(current: &AtomicI64, peak: &AtomicI64, amount: i64) {
            let now = current.fetch_add(amount, Ordering::AcqRel) + amount;
            peak.fetch_max(now, Ordering::AcqRel);
        }
    }

    #[async_trait]
    impl LayerReader for MockReader {
        async fn open(
            &self,
            _cancel: &CancellationToken,
            layer: &str,
        ) -> Result<(LayerStream, i64)> {
            self.opens.fetch_add(1, Ordering::AcqRel);
            let declared = self.sizes.get(layer).copied().unwrap_or(0);
            Self::bump(&self.current, &self.peak, 1);
            Self::bump(&self.current_bytes, &self.peak_bytes, declared);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.current.fetch_sub(1, Ordering::AcqRel);
            self.current_bytes.fetch_sub(declared, Ordering::AcqRel);

            let data = self
                .blobs
                .get(layer)
                .cloned()
                .ok_or_else(|| ScanError::RegistryApi(format!("no blob for {}", layer)))?;
            let len = data.len() as i64;
            Ok((Box::new(Cursor::new(data)), len))
        }
    }

    fn test_config() -> ScanConfig {
        ScanConfig::default()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_download_extracts_layers() {
        let tmp = TempDir::new().unwrap();
        let mut blobs = HashMap::new();
        blobs.insert("aaa".to_string(), tar_bytes(&[("etc/hosts", b"127.0.0.1")]));
        blobs.insert("bbb".to_string(), tar_bytes(&[("usr/bin/sh", b"#!")]));
        let reader = Arc::new(MockReader::new(blobs));

        let layers = vec!["aaa".to_string(), "bbb".to_string()];
        let (results, err) = download_layers(
            &CancellationToken::new(),
            &layers,
            &HashMap::new(),
            tmp.path(),
            reader,
            &test_config(),
        )
        .await;

        assert!(err.is_none());
        assert_eq!(results.len(), 2);
        assert!(results["aaa"].err.is_none());
        assert_eq!(results["aaa"].size, 9);
        assert!(tmp.path().join("aaa/etc/hosts").is_file());
        assert!(tmp.path().join("aaa").join(EXTRACT_SENTINEL).is_file());
        assert!(tmp.path().join("bbb/usr/bin/sh").is_file());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_download_dedup_and_empty_ids() {
        let tmp = TempDir::new().unwrap();
        let mut blobs = HashMap::new();
        blobs.insert("aaa".to_string(), tar_bytes(&[("f", b"x")]));
        let reader = Arc::new(MockReader::new(blobs));

        let layers = vec![
            "aaa".to_string(),
            String::new(),
            "aaa".to_string(),
            "aaa".to_string(),
        ];
        let (results, err) = download_layers(
            &CancellationToken::new(),
            &layers,
            &HashMap::new(),
            tmp.path(),
            Arc::clone(&reader) as Arc<dyn LayerReader>,
            &test_config(),
        )
        .await;

        assert!(err.is_none());
        assert_eq!(results.len(), 1);
        assert_eq!(reader.opens.load(Ordering::Acquire), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_zero_declared_size_skips_fetch() {
        let tmp = TempDir::new().unwrap();
        let reader = Arc::new(MockReader::new(HashMap::new()));

        let layers = vec!["zero".to_string()];
        let mut sizes = HashMap::new();
        sizes.insert("zero".to_string(), 0i64);

        let (results, err) = download_layers(
            &CancellationToken::new(),
            &layers,
            &sizes,
            tmp.path(),
            Arc::clone(&reader) as Arc<dyn LayerReader>,
            &test_config(),
        )
        .await;

        assert!(err.is_none());
        assert!(results["zero"].err.is_none());
        assert_eq!(results["zero"].size, 0);
        assert!(tmp.path().join("zero").is_dir());
        // no network round trip for skip markers
        assert_eq!(reader.opens.load(Ordering::Acquire), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retry_exhaustion_reports_error() {
        let tmp = TempDir::new().unwrap();
        let reader = Arc::new(MockReader::new(HashMap::new()));

        let layers = vec!["gone".to_string()];
        let (results, err) = download_layers(
            &CancellationToken::new(),
            &layers,
            &HashMap::new(),
            tmp.path(),
            Arc::clone(&reader) as Arc<dyn LayerReader>,
            &test_config(),
        )
        .await;

        assert!(err.is_some());
        assert!(results["gone"].err.is_some());
        assert_eq!(reader.opens.load(Ordering::Acquire), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_partial_failure_keeps_successes() {
        let tmp = TempDir::new().unwrap();
        let mut blobs = HashMap::new();
        blobs.insert("good".to_string(), tar_bytes(&[("f", b"ok")]));
        let reader = Arc::new(MockReader::new(blobs));

        let layers = vec!["good".to_string(), "bad".to_string()];
        let (results, err) = download_layers(
            &CancellationToken::new(),
            &layers,
            &HashMap::new(),
            tmp.path(),
            reader,
            &test_config(),
        )
        .await;

        assert!(err.is_some());
        assert!(results["good"].err.is_none());
        assert!(results["bad"].err.is_some());
        assert!(tmp.path().join("good/f").is_file());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_existing_extraction_is_reused() {
        let tmp = TempDir::new().unwrap();
        let layer_dir = tmp.path().join("aaa");
        std::fs::create_dir_all(&layer_dir).unwrap();
        std::fs::write(layer_dir.join("kept"), b"old").unwrap();
        std::fs::write(layer_dir.join(EXTRACT_SENTINEL), b"").unwrap();

        let reader = Arc::new(MockReader::new(HashMap::new()));
        let layers = vec!["aaa".to_string()];
        let (results, err) = download_layers(
            &CancellationToken::new(),
            &layers,
            &HashMap::new(),
            tmp.path(),
            Arc::clone(&reader) as Arc<dyn LayerReader>,
            &test_config(),
        )
        .await;

        assert!(err.is_none());
        assert!(results["aaa"].err.is_none());
        // no reads at all once a completed directory is present
        assert_eq!(reader.opens.load(Ordering::Acquire), 0);
        assert_eq!(std::fs::read(layer_dir.join("kept")).unwrap(), b"old");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_residue_without_sentinel_is_reextracted() {
        let tmp = TempDir::new().unwrap();
        let layer_dir = tmp.path().join("aaa");
        std::fs::create_dir_all(&layer_dir).unwrap();
        std::fs::write(layer_dir.join("stale"), b"partial").unwrap();

        let mut blobs = HashMap::new();
        blobs.insert("aaa".to_string(), tar_bytes(&[("fresh", b"new")]));
        let reader = Arc::new(MockReader::new(blobs));

        let layers = vec!["aaa".to_string()];
        let (results, err) = download_layers(
            &CancellationToken::new(),
            &layers,
            &HashMap::new(),
            tmp.path(),
            Arc::clone(&reader) as Arc<dyn LayerReader>,
            &test_config(),
        )
        .await;

        assert!(err.is_none());
        assert!(results["aaa"].err.is_none());
        assert_eq!(reader.opens.load(Ordering::Acquire), 1);
        assert!(!layer_dir.join("stale").exists());
        assert!(layer_dir.join("fresh").is_file());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancellation_stops_retries() {
        let tmp = TempDir::new().unwrap();
        let reader = Arc::new(MockReader::new(HashMap::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let layers = vec!["aaa".to_string()];
        let (results, err) = download_layers(
            &cancel,
            &layers,
            &HashMap::new(),
            tmp.path(),
            Arc::clone(&reader) as Arc<dyn LayerReader>,
            &test_config(),
        )
        .await;

        assert!(err.is_some());
        assert_eq!(results["aaa"].err, Some(ScanError::Cancelled));
        assert_eq!(reader.opens.load(Ordering::Acquire), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_throttling_admission() {
        let tmp = TempDir::new().unwrap();
        // declared sizes 120/80/80 against a budget of 100: the biggest
        // layer must run alone; the two others may overlap afterwards
        let mut blobs = HashMap::new();
        let mut sizes = HashMap::new();
        for (layer, declared) in [("big", 120i64), ("mid1", 80), ("mid2", 80)] {
            blobs.insert(layer.to_string(), tar_bytes(&[("f", b"x")]));
            sizes.insert(layer.to_string(), declared);
        }
        let reader = Arc::new(
            MockReader::new(blobs).with_delay(Duration::from_millis(100), sizes.clone()),
        );

        let mut config = test_config();
        config.throttle_volume = 100;

        let layers = vec!["mid1".to_string(), "big".to_string(), "mid2".to_string()];
        let (results, err) = download_layers(
            &CancellationToken::new(),
            &layers,
            &sizes,
            tmp.path(),
            Arc::clone(&reader) as Arc<dyn LayerReader>,
            &config,
        )
        .await;

        assert!(err.is_none());
        assert_eq!(results.len(), 3);
        // never all three at once
        assert!(reader.peak.load(Ordering::Acquire) <= 2);
        // in-flight declared bytes stay strictly under twice the budget
        assert!(reader.peak_bytes.load(Ordering::Acquire) < 200);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mkdir_failure_not_retried() {
        let tmp = TempDir::new().unwrap();
        // the layer path collides with an existing file, so the worker can
        // neither clear nor create the directory
        std::fs::write(tmp.path().join("aaa"), b"in the way").unwrap();

        let mut blobs = HashMap::new();
        blobs.insert("aaa".to_string(), tar_bytes(&[("f", b"x")]));
        let reader = Arc::new(MockReader::new(blobs));

        let layers = vec!["aaa".to_string()];
        let (results, err) = download_layers(
            &CancellationToken::new(),
            &layers,
            &HashMap::new(),
            tmp.path(),
            Arc::clone(&reader) as Arc<dyn LayerReader>,
            &test_config(),
        )
        .await;

        assert!(err.is_some());
        assert!(results["aaa"].err.is_some());
        assert_eq!(reader.opens.load(Ordering::Acquire), 1);
    }
}
