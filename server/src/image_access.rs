use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use moka::sync::Cache;
use tracing::{debug, info};

use crate::error::AppError;
use crate::transcode::{content_type_for, is_wavelet_format, ImageTranscoder};
use crate::volume_index::VolumeIndex;

/// Image bytes ready to send, with their content type.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub bytes: Bytes,
    pub content_type: &'static str,
}

/// Resolves `(volume, filename)` through the index and reads the file,
/// converting wavelet-compressed images to JPEG on the way out.
pub struct ImageGateway {
    index: Arc<VolumeIndex>,
    transcoder: Arc<dyn ImageTranscoder>,
    converted: Option<Cache<PathBuf, Bytes>>,
}

impl ImageGateway {
    pub fn new(index: Arc<VolumeIndex>, transcoder: Arc<dyn ImageTranscoder>) -> Self {
        Self {
            index,
            transcoder,
            converted: None,
        }
    }

    /// Keep up to `entries` converted images in memory. 0 disables caching.
    pub fn with_cache(mut self, entries: u64) -> Self {
        self.converted = (entries > 0).then(|| {
            Cache::builder()
                .max_capacity(entries)
                .time_to_idle(Duration::from_secs(300))
                .build()
        });
        self
    }

    pub fn fetch(
        &self,
        volume: Option<&str>,
        filename: Option<&str>,
    ) -> Result<ImagePayload, AppError> {
        let volume = volume
            .filter(|v| !v.is_empty())
            .ok_or(AppError::MissingParameter("volume or filename"))?;
        let filename = filename
            .filter(|f| !f.is_empty())
            .ok_or(AppError::MissingParameter("volume or filename"))?;

        let path = self
            .index
            .resolve_path(volume, filename)
            .ok_or_else(|| AppError::VolumeNotFound(volume.to_string()))?;
        if !stays_in_directory(filename) || !path.is_file() {
            return Err(AppError::ImageNotFound(filename.to_string()));
        }

        if is_wavelet_format(filename) {
            return self.convert(volume, &path);
        }
        let bytes = fs::read(&path).map_err(|_| AppError::ImageNotFound(filename.to_string()))?;
        debug!(
            "image sent volume={} path={} bytes={}",
            volume,
            path.display(),
            bytes.len()
        );
        Ok(ImagePayload {
            bytes: Bytes::from(bytes),
            content_type: content_type_for(filename),
        })
    }

    fn convert(&self, volume: &str, path: &Path) -> Result<ImagePayload, AppError> {
        if let Some(bytes) = self.converted.as_ref().and_then(|c| c.get(path)) {
            debug!("image cache_hit volume={} path={}", volume, path.display());
            return Ok(jpeg_payload(bytes));
        }
        let start = Instant::now();
        let jpeg = self
            .transcoder
            .to_jpeg(path)
            .map_err(|e| AppError::ConversionFailed(format!("{:#}", e)))?;
        let bytes = Bytes::from(jpeg);
        if let Some(cache) = &self.converted {
            cache.insert(path.to_path_buf(), bytes.clone());
        }
        info!(
            "image converted volume={} path={} bytes={} ms={}",
            volume,
            path.display(),
            bytes.len(),
            start.elapsed().as_millis()
        );
        Ok(jpeg_payload(bytes))
    }
}

fn jpeg_payload(bytes: Bytes) -> ImagePayload {
    ImagePayload {
        bytes,
        content_type: "image/jpeg",
    }
}

/// Only plain relative names may be joined onto a volume directory.
fn stays_in_directory(filename: &str) -> bool {
    Path::new(filename)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::{anyhow, Result};

    use crate::volume_index::IndexColumns;

    /// Counts conversions and returns a fixed body.
    #[derive(Default)]
    struct FakeTranscoder {
        calls: AtomicUsize,
        fail: bool,
    }

    impl ImageTranscoder for FakeTranscoder {
        fn to_jpeg(&self, _path: &Path) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(anyhow!("codestream truncated"))
            } else {
                Ok(vec![0xFF, 0xD8, 0xFF, 0xD9])
            }
        }

        fn dimensions(&self, _path: &Path) -> Result<(u32, u32)> {
            Ok((1, 1))
        }
    }

    fn setup(transcoder: Arc<FakeTranscoder>) -> (tempfile::TempDir, ImageGateway) {
        let dir = tempfile::tempdir().unwrap();
        let vol = dir.path().join("vol1");
        fs::create_dir_all(&vol).unwrap();
        fs::write(vol.join("a.png"), b"png-bytes").unwrap();
        fs::write(vol.join("b.j2k"), b"j2k-bytes").unwrap();
        let csv = format!(
            "id,ImageNumber,file_path_coris\nV1,1,{}\nV1,2,{}\n",
            vol.join("a.png").display(),
            vol.join("b.j2k").display()
        );
        let index = VolumeIndex::from_reader(csv.as_bytes(), &IndexColumns::default()).unwrap();
        let gateway = ImageGateway::new(Arc::new(index), transcoder);
        (dir, gateway)
    }

    #[test]
    fn test_missing_parameters() {
        let (_dir, gw) = setup(Arc::default());
        for (v, f) in [(None, Some("a.png")), (Some("V1"), None), (Some(""), Some("a.png"))] {
            assert!(matches!(gw.fetch(v, f), Err(AppError::MissingParameter(_))));
        }
    }

    #[test]
    fn test_unknown_volume() {
        let (_dir, gw) = setup(Arc::default());
        assert!(matches!(
            gw.fetch(Some("nope"), Some("a.png")),
            Err(AppError::VolumeNotFound(_))
        ));
    }

    #[test]
    fn test_missing_or_escaping_file() {
        let (_dir, gw) = setup(Arc::default());
        assert!(matches!(
            gw.fetch(Some("V1"), Some("zzz.png")),
            Err(AppError::ImageNotFound(_))
        ));
        assert!(matches!(
            gw.fetch(Some("V1"), Some("../vol1/a.png")),
            Err(AppError::ImageNotFound(_))
        ));
    }

    #[test]
    fn test_plain_file_served_unmodified() {
        let fake = Arc::new(FakeTranscoder::default());
        let (_dir, gw) = setup(fake.clone());
        let payload = gw.fetch(Some("V1"), Some("a.png")).unwrap();
        assert_eq!(&payload.bytes[..], b"png-bytes");
        assert_eq!(payload.content_type, "image/png");
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wavelet_file_converted_and_cached() {
        let fake = Arc::new(FakeTranscoder::default());
        let (_dir, gw) = setup(fake.clone());
        let gw = gw.with_cache(8);
        for _ in 0..3 {
            let payload = gw.fetch(Some("V1"), Some("b.j2k")).unwrap();
            assert_eq!(payload.content_type, "image/jpeg");
            assert_eq!(&payload.bytes[..], &[0xFF, 0xD8, 0xFF, 0xD9]);
        }
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_conversion_failure_carries_cause() {
        let fake = Arc::new(FakeTranscoder {
            fail: true,
            ..Default::default()
        });
        let (_dir, gw) = setup(fake);
        match gw.fetch(Some("V1"), Some("b.j2k")) {
            Err(AppError::ConversionFailed(msg)) => assert!(msg.contains("truncated")),
            other => panic!("unexpected {:?}", other.map(|p| p.content_type)),
        }
    }
}
