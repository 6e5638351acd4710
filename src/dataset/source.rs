use crate::dataset::model::{Bar, DatasetError, DatasetSpec, PriceSeries};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use log::debug;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

/// Remote or local origin of OHLCV bars for one `source` name.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch(&self, spec: &DatasetSpec) -> Result<PriceSeries, DatasetError>;
}

const BINANCE_MAX_LIMIT: i64 = 1000;

/// Public Binance spot klines.
pub struct BinanceSource {
    client: reqwest::Client,
    base_url: String,
}

impl BinanceSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DatasetError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DatasetError::Http(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn from_env(timeout: Duration) -> Result<Self, DatasetError> {
        let base = std::env::var("BINANCE_BASE_URL")
            .unwrap_or_else(|_| "https://api.binance.com".to_string());
        Self::new(base, timeout)
    }
}

#[async_trait]
impl PriceSource for BinanceSource {
    async fn fetch(&self, spec: &DatasetSpec) -> Result<PriceSeries, DatasetError> {
        let bar_secs = spec
            .timeframe_secs()
            .ok_or_else(|| DatasetError::Parse(format!("unsupported timeframe {}", spec.timeframe)))?;
        let wanted = (spec.lookback_secs() / bar_secs).clamp(1, BINANCE_MAX_LIMIT);
        let start_ms = (Utc::now().timestamp() - spec.lookback_secs()) * 1000;
        let url = format!("{}/api/v3/klines", self.base_url.trim_end_matches('/'));
        let symbol = spec.symbol.replace(['/', '-'], "").to_ascii_uppercase();

        debug!("fetching {} bars of {} from binance", wanted, spec);
        let resp = self
            .client
            .get(url)
            .query(&[
                ("symbol", symbol),
                ("interval", spec.timeframe.clone()),
                ("startTime", start_ms.to_string()),
                ("limit", wanted.to_string()),
            ])
            .send()
            .await
            .map_err(|e| DatasetError::Http(e.to_string()))?;

        let status = resp.status();
        let raw = resp
            .text()
            .await
            .map_err(|e| DatasetError::Http(e.to_string()))?;
        if status == StatusCode::BAD_REQUEST {
            return Err(DatasetError::Http(format!("rejected {}: {}", spec, raw)));
        }
        if !status.is_success() {
            return Err(DatasetError::Http(format!("{} {}", status.as_u16(), raw)));
        }

        let rows: Vec<Vec<Value>> = serde_json::from_str(&raw)
            .map_err(|e| DatasetError::Parse(format!("klines json: {e}")))?;
        let bars = rows
            .iter()
            .map(|row| parse_kline(row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PriceSeries::from_bars(bars))
    }
}

fn parse_kline(row: &[Value]) -> Result<Bar, DatasetError> {
    let num = |i: usize| -> Result<f64, DatasetError> {
        match row.get(i) {
            Some(Value::String(s)) => s
                .parse::<f64>()
                .map_err(|_| DatasetError::Parse(format!("bad kline field {i}: {s}"))),
            Some(Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| DatasetError::Parse(format!("bad kline field {i}"))),
            _ => Err(DatasetError::Parse(format!("missing kline field {i}"))),
        }
    };
    let open_ms = row
        .first()
        .and_then(|v| v.as_i64())
        .ok_or_else(|| DatasetError::Parse("missing kline open time".to_string()))?;
    Ok(Bar {
        timestamp: open_ms / 1000,
        open: num(1)?,
        high: num(2)?,
        low: num(3)?,
        close: num(4)?,
        volume: num(5)?,
    })
}

/// Local files named `<SYMBOL>-<timeframe>.csv` under one directory.
pub struct CsvSource {
    dir: PathBuf,
}

impl CsvSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, spec: &DatasetSpec) -> PathBuf {
        self.dir
            .join(format!("{}-{}.csv", spec.symbol.replace('/', "-"), spec.timeframe))
    }
}

#[async_trait]
impl PriceSource for CsvSource {
    async fn fetch(&self, spec: &DatasetSpec) -> Result<PriceSeries, DatasetError> {
        let path = self.path_for(spec);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| DatasetError::Io(format!("{}: {}", path.display(), e)))?;
        let series = parse_csv(&text)?;
        Ok(series.trim_to_window(spec.lookback_secs()))
    }
}

#[derive(Deserialize)]
struct CsvRow {
    #[serde(alias = "date", alias = "time", alias = "timestamp")]
    datetime: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

/// Parses OHLCV CSV with a header row. Column names are matched
/// case-insensitively; the time column may be `datetime`, `date`, `time` or
/// `timestamp`. Quoted fields and extra columns are accepted.
pub fn parse_csv(text: &str) -> Result<PriceSeries, DatasetError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let headers: csv::StringRecord = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_ascii_lowercase())
        .collect();
    if headers.iter().all(|h| h.is_empty()) {
        return Err(DatasetError::Parse("empty csv".to_string()));
    }
    reader.set_headers(headers);

    let mut bars = Vec::new();
    for (n, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.map_err(|e| DatasetError::Parse(format!("row {}: {}", n + 2, e)))?;
        bars.push(Bar {
            timestamp: parse_timestamp(&row.datetime).ok_or_else(|| {
                DatasetError::Parse(format!("row {}: bad time '{}'", n + 2, row.datetime))
            })?,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
        });
    }
    Ok(PriceSeries::from_bars(bars))
}

fn parse_timestamp(raw: &str) -> Option<i64> {
    if let Ok(n) = raw.parse::<i64>() {
        // Millisecond epochs are 13 digits.
        return Some(if n > 100_000_000_000 { n / 1000 } else { n });
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt.and_utc().timestamp());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
}
