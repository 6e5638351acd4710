use crate::dataset::model::{DatasetError, DatasetSpec, PriceSeries};
use crate::dataset::source::PriceSource;
use log::{info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

type Slot = Arc<OnceCell<Arc<PriceSeries>>>;

/// Shared, read-mostly series cache.
///
/// Each `DatasetSpec` gets one slot; the first caller populates it while
/// concurrent callers for the same key wait on that population instead of
/// fetching again. A failed population leaves the slot empty so a later call
/// can retry. Populated series are also written to `cache_dir` as JSON and
/// served from there on the next process start.
pub struct DatasetProvider {
    sources: HashMap<String, Arc<dyn PriceSource>>,
    cache_dir: Option<PathBuf>,
    slots: Mutex<HashMap<DatasetSpec, Slot>>,
}

impl DatasetProvider {
    pub fn new(cache_dir: Option<PathBuf>) -> Self {
        Self {
            sources: HashMap::new(),
            cache_dir,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_source(mut self, name: &str, source: Arc<dyn PriceSource>) -> Self {
        self.sources.insert(name.to_ascii_lowercase(), source);
        self
    }

    pub async fn get(&self, spec: &DatasetSpec) -> Result<Arc<PriceSeries>, DatasetError> {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots.entry(spec.clone()).or_default().clone()
        };
        let series = slot.get_or_try_init(|| self.populate(spec)).await?;
        Ok(series.clone())
    }

    async fn populate(&self, spec: &DatasetSpec) -> Result<Arc<PriceSeries>, DatasetError> {
        if let Some(path) = self.cache_path(spec) {
            if let Some(series) = read_cached(&path).await {
                info!("dataset {} served from disk cache ({} bars)", spec, series.len());
                return Ok(Arc::new(series));
            }
        }

        let source = self
            .sources
            .get(&spec.source.to_ascii_lowercase())
            .ok_or_else(|| DatasetError::UnknownSource(spec.source.clone()))?;
        let series = source.fetch(spec).await?;
        if series.is_empty() {
            return Err(DatasetError::Empty(spec.to_string()));
        }
        info!("✓ dataset {} fetched ({} bars)", spec, series.len());

        if let Some(path) = self.cache_path(spec) {
            if let Err(e) = write_cached(&path, &series).await {
                warn!("⚠ could not write dataset cache {}: {}", path.display(), e);
            }
        }
        Ok(Arc::new(series))
    }

    fn cache_path(&self, spec: &DatasetSpec) -> Option<PathBuf> {
        let dir = self.cache_dir.as_ref()?;
        let symbol = spec.symbol.replace(['/', '\\', ':'], "-");
        Some(dir.join(&spec.source).join(format!(
            "{}_{}_{}d.json",
            symbol, spec.timeframe, spec.lookback_days
        )))
    }
}

async fn read_cached(path: &Path) -> Option<PriceSeries> {
    let raw = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice::<PriceSeries>(&raw) {
        Ok(s) if !s.is_empty() => Some(s),
        Ok(_) => None,
        Err(e) => {
            warn!("⚠ ignoring corrupt dataset cache {}: {}", path.display(), e);
            None
        }
    }
}

async fn write_cached(path: &Path, series: &PriceSeries) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec(series)?;
    // Write-then-rename so concurrent readers never see a partial file.
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await
}
