//! Barcode resolution: local cache first, then the external product database
//!
//! The barcode is the highest-priority but entirely optional source, so a
//! failed lookup degrades to absence instead of failing the session. The
//! local cache is write-through with a 30-day TTL, persisted to a JSON
//! file in the engine's cache directory with advisory file locking so
//! concurrent engine processes don't corrupt it.

use crate::error::{UpstreamError, UpstreamKind};
use crate::record::NutritionFacts;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration as StdDuration, Instant};
use tracing::{debug, warn};

const CACHE_FILE: &str = "barcode_cache.json";
const LOCK_TIMEOUT_SECS: u64 = 5;
const LOCK_RETRY_MS: u64 = 50;

/// Where a lookup result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarcodeOrigin {
    LocalCache,
    ExternalDb,
}

impl BarcodeOrigin {
    pub fn label(&self) -> &'static str {
        match self {
            BarcodeOrigin::LocalCache => "local cache",
            BarcodeOrigin::ExternalDb => "external product database",
        }
    }
}

/// Resolved product nutrition for a scanned barcode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarcodeLookupResult {
    pub barcode: String,
    pub product_name: String,
    pub nutrition_per_serving: NutritionFacts,
    pub origin: BarcodeOrigin,
}

/// Product data as returned by the external database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub name: String,
    pub nutrition_per_serving: NutritionFacts,
}

/// Outbound product database. `Ok(None)` is a definitive not-found;
/// errors are transient and degrade to absence after retries.
#[async_trait]
pub trait ProductDatabase: Send + Sync {
    async fn lookup(&self, barcode: &str) -> Result<Option<ProductRecord>, UpstreamError>;
}

// ───────────────────────────────────────────────────────────────────────────
//  Local write-through cache
// ───────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    product: ProductRecord,
    cached_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    entries: HashMap<String, CacheEntry>,
}

/// Disk-persisted barcode cache with concurrent in-process access
pub struct BarcodeCache {
    dir: PathBuf,
    ttl: ChronoDuration,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

struct CacheLock {
    file: std::fs::File,
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl BarcodeCache {
    /// Open (or create) the cache under `dir` with the given TTL in days
    pub fn open(dir: &Path, ttl_days: i64) -> Self {
        let cache = Self {
            dir: dir.to_path_buf(),
            ttl: ChronoDuration::days(ttl_days),
            entries: RwLock::new(HashMap::new()),
        };
        if let Some(loaded) = cache.load_from_disk() {
            if let Ok(mut entries) = cache.entries.write() {
                *entries = loaded.entries;
            }
        }
        cache
    }

    fn cache_path(&self) -> PathBuf {
        self.dir.join(CACHE_FILE)
    }

    fn lock(&self, exclusive: bool) -> anyhow::Result<CacheLock> {
        if exclusive && !self.dir.exists() {
            fs::create_dir_all(&self.dir)?;
        }

        let lock_path = self.dir.join(".lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        let start = Instant::now();
        loop {
            let result = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match result {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(err.into());
                    }
                    if start.elapsed() >= StdDuration::from_secs(LOCK_TIMEOUT_SECS) {
                        return Err(anyhow::anyhow!(
                            "timed out waiting for barcode cache lock ({}s)",
                            LOCK_TIMEOUT_SECS
                        ));
                    }
                    std::thread::sleep(StdDuration::from_millis(LOCK_RETRY_MS));
                }
            }
        }

        Ok(CacheLock { file })
    }

    fn load_from_disk(&self) -> Option<CacheFile> {
        let path = self.cache_path();
        if !path.exists() {
            return None;
        }
        let _lock = self.lock(false).ok()?;
        let content = fs::read_to_string(&path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Persist the current entries. Best-effort: the cache regenerates
    /// from the external database on loss.
    fn save_to_disk(&self) -> anyhow::Result<()> {
        let _lock = self.lock(true)?;
        let entries = self
            .entries
            .read()
            .map_err(|_| anyhow::anyhow!("barcode cache lock poisoned"))?;
        let file = CacheFile {
            entries: entries.clone(),
        };
        let content = serde_json::to_string(&file)?;
        write_atomic(&self.cache_path(), &content)
    }

    /// Get a non-expired entry
    pub fn get(&self, barcode: &str) -> Option<ProductRecord> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(barcode)?;
        if Utc::now().signed_duration_since(entry.cached_at) > self.ttl {
            return None;
        }
        Some(entry.product.clone())
    }

    /// Write-through insert: update memory, then persist
    pub fn put(&self, barcode: &str, product: ProductRecord) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                barcode.to_string(),
                CacheEntry {
                    product,
                    cached_at: Utc::now(),
                },
            );
        }
        if let Err(err) = self.save_to_disk() {
            warn!(error = %err, "failed to persist barcode cache");
        }
    }
}

/// Write content atomically by writing to a temp file first, then renaming
fn write_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600));
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

/// Resolve a barcode: local cache first, then the external database
/// through `RetryPolicy`, populating the cache on success. Any failure
/// degrades to `None`: the barcode source never blocks a session.
pub async fn resolve_barcode(
    products: &dyn ProductDatabase,
    cache: &BarcodeCache,
    retry: &RetryPolicy,
    barcode: &str,
) -> Option<BarcodeLookupResult> {
    if let Some(product) = cache.get(barcode) {
        debug!(barcode, "barcode cache hit");
        return Some(BarcodeLookupResult {
            barcode: barcode.to_string(),
            product_name: product.name.clone(),
            nutrition_per_serving: product.nutrition_per_serving,
            origin: BarcodeOrigin::LocalCache,
        });
    }

    match retry.run(|_| products.lookup(barcode)).await {
        Ok(Some(product)) => {
            cache.put(barcode, product.clone());
            Some(BarcodeLookupResult {
                barcode: barcode.to_string(),
                product_name: product.name,
                nutrition_per_serving: product.nutrition_per_serving,
                origin: BarcodeOrigin::ExternalDb,
            })
        }
        Ok(None) => {
            debug!(barcode, "barcode not found in product database");
            None
        }
        Err(err) => {
            warn!(barcode, error = %err, "barcode lookup failed, continuing without it");
            None
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────
//  Open Food Facts client
// ───────────────────────────────────────────────────────────────────────────

const OFF_REQUEST_TIMEOUT: StdDuration = StdDuration::from_secs(10);

/// Product database backed by the Open Food Facts v2 API
pub struct OpenFoodFacts {
    client: reqwest::Client,
    base_url: String,
}

impl OpenFoodFacts {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(OFF_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[derive(Deserialize)]
struct OffResponse {
    #[serde(default)]
    status: u8,
    product: Option<OffProduct>,
}

#[derive(Deserialize)]
struct OffProduct {
    #[serde(default)]
    product_name: String,
    #[serde(default)]
    nutriments: OffNutriments,
}

#[derive(Default, Deserialize)]
struct OffNutriments {
    #[serde(rename = "energy-kcal_serving", default)]
    energy_kcal_serving: f64,
    #[serde(rename = "proteins_serving", default)]
    proteins_serving: f64,
    #[serde(rename = "carbohydrates_serving", default)]
    carbohydrates_serving: f64,
    #[serde(rename = "fat_serving", default)]
    fat_serving: f64,
    #[serde(rename = "fiber_serving", default)]
    fiber_serving: f64,
}

#[async_trait]
impl ProductDatabase for OpenFoodFacts {
    async fn lookup(&self, barcode: &str) -> Result<Option<ProductRecord>, UpstreamError> {
        let url = format!("{}/api/v2/product/{}.json", self.base_url, barcode);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        // Open Food Facts answers 404 for unknown products
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(crate::error::classify_status(status.as_u16(), &body));
        }

        let parsed: OffResponse = response.json().await.map_err(|e| {
            UpstreamError::new(
                UpstreamKind::InvalidPayload,
                format!("unexpected product payload: {}", e),
            )
        })?;

        if parsed.status != 1 {
            return Ok(None);
        }
        let Some(product) = parsed.product else {
            return Ok(None);
        };

        Ok(Some(ProductRecord {
            name: if product.product_name.trim().is_empty() {
                format!("product {}", barcode)
            } else {
                product.product_name.trim().to_string()
            },
            nutrition_per_serving: NutritionFacts {
                calories: product.nutriments.energy_kcal_serving,
                protein_g: product.nutriments.proteins_serving,
                carbs_g: product.nutriments.carbohydrates_serving,
                fat_g: product.nutriments.fat_serving,
                fiber_g: product.nutriments.fiber_serving,
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingProducts, StaticProducts};
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        }
    }

    fn granola() -> ProductRecord {
        ProductRecord {
            name: "Granola Crunch".to_string(),
            nutrition_per_serving: NutritionFacts::new(110.0, 4.0, 23.0, 1.0, 3.0),
        }
    }

    #[tokio::test]
    async fn test_external_hit_populates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BarcodeCache::open(dir.path(), 30);
        let products = StaticProducts::with("0123456789012", granola());

        let first = resolve_barcode(&products, &cache, &fast_retry(), "0123456789012")
            .await
            .unwrap();
        assert_eq!(first.origin, BarcodeOrigin::ExternalDb);
        assert_eq!(first.product_name, "Granola Crunch");

        let second = resolve_barcode(&products, &cache, &fast_retry(), "0123456789012")
            .await
            .unwrap();
        assert_eq!(second.origin, BarcodeOrigin::LocalCache);
        assert_eq!(products.calls(), 1);
    }

    #[tokio::test]
    async fn test_cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = BarcodeCache::open(dir.path(), 30);
            cache.put("111", granola());
        }
        let reopened = BarcodeCache::open(dir.path(), 30);
        assert_eq!(reopened.get("111").unwrap().name, "Granola Crunch");
    }

    #[tokio::test]
    async fn test_expired_entry_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BarcodeCache::open(dir.path(), 0);
        cache.put("111", granola());
        // TTL of zero days expires immediately
        assert!(cache.get("111").is_none());
    }

    #[tokio::test]
    async fn test_miss_is_absence() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BarcodeCache::open(dir.path(), 30);
        let products = StaticProducts::default();
        assert!(
            resolve_barcode(&products, &cache, &fast_retry(), "404")
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_external_failure_degrades_to_absence() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BarcodeCache::open(dir.path(), 30);
        let products = FailingProducts;
        assert!(
            resolve_barcode(&products, &cache, &fast_retry(), "123")
                .await
                .is_none()
        );
    }
}
