use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(thiserror::Error, Debug, Clone)]
pub enum DatasetError {
    #[error("unknown dataset source: {0}")]
    UnknownSource(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("no bars returned for {0}")]
    Empty(String),
}

impl From<csv::Error> for DatasetError {
    fn from(e: csv::Error) -> Self {
        match e.kind() {
            csv::ErrorKind::Io(io) => DatasetError::Io(io.to_string()),
            _ => DatasetError::Parse(format!("csv: {}", e)),
        }
    }
}

/// One market series: `SYMBOL:TIMEFRAME:LOOKBACKd:SOURCE`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub symbol: String,
    pub timeframe: String,
    pub lookback_days: u32,
    pub source: String,
}

impl DatasetSpec {
    pub fn new(symbol: &str, timeframe: &str, lookback_days: u32, source: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            lookback_days,
            source: source.to_string(),
        }
    }

    /// Bar length in seconds, for timeframes like `15m`, `1h`, `4h`, `1d`, `1w`.
    pub fn timeframe_secs(&self) -> Option<i64> {
        let tf = self.timeframe.trim();
        let split = tf.find(|c: char| !c.is_ascii_digit())?;
        let (num, unit) = tf.split_at(split);
        let n: i64 = num.parse().ok()?;
        let mul = match unit {
            "s" => 1,
            "m" => 60,
            "h" | "H" => 3_600,
            "d" | "D" => 86_400,
            "w" | "W" => 7 * 86_400,
            _ => return None,
        };
        Some(n * mul)
    }

    pub fn lookback_secs(&self) -> i64 {
        self.lookback_days as i64 * 86_400
    }
}

impl fmt::Display for DatasetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}d:{}",
            self.symbol, self.timeframe, self.lookback_days, self.source
        )
    }
}

impl FromStr for DatasetSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').map(|p| p.trim()).collect();
        if parts.len() != 4 || parts.iter().any(|p| p.is_empty()) {
            return Err(format!(
                "expected SYMBOL:TIMEFRAME:LOOKBACKd:SOURCE, got '{}'",
                s.trim()
            ));
        }
        let lookback = parts[2].trim_end_matches(|c| c == 'd' || c == 'D');
        let lookback_days = lookback
            .parse::<u32>()
            .map_err(|_| format!("invalid lookback '{}' in '{}'", parts[2], s.trim()))?;
        if lookback_days == 0 {
            return Err(format!("lookback must be positive in '{}'", s.trim()));
        }
        Ok(Self {
            symbol: parts[0].to_string(),
            timeframe: parts[1].to_string(),
            lookback_days,
            source: parts[3].to_ascii_lowercase(),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Time-ordered OHLCV bars.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceSeries {
    pub bars: Vec<Bar>,
}

impl PriceSeries {
    /// Sorts by timestamp and drops duplicate timestamps (first wins).
    pub fn from_bars(mut bars: Vec<Bar>) -> Self {
        bars.sort_by_key(|b| b.timestamp);
        bars.dedup_by_key(|b| b.timestamp);
        Self { bars }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Keeps only bars within `secs` of the last bar.
    pub fn trim_to_window(mut self, secs: i64) -> Self {
        if let Some(last) = self.bars.last().map(|b| b.timestamp) {
            let cutoff = last - secs;
            self.bars.retain(|b| b.timestamp >= cutoff);
        }
        self
    }

    /// Deterministic CSV rendering handed to generated strategies.
    pub fn to_csv(&self) -> Result<String, DatasetError> {
        let mut writer = csv::Writer::from_writer(Vec::with_capacity(self.bars.len() * 64 + 40));
        writer.write_record(["datetime", "open", "high", "low", "close", "volume"])?;
        for b in &self.bars {
            let dt = DateTime::from_timestamp(b.timestamp, 0)
                .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| b.timestamp.to_string());
            writer.write_record([
                dt,
                b.open.to_string(),
                b.high.to_string(),
                b.low.to_string(),
                b.close.to_string(),
                b.volume.to_string(),
            ])?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| DatasetError::Io(e.error().to_string()))?;
        String::from_utf8(bytes).map_err(|e| DatasetError::Parse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(ts: i64, close: f64) -> Bar {
        Bar {
            timestamp: ts,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn parses_and_displays_spec() {
        let spec: DatasetSpec = "BTCUSDT:1h:30d:Binance".parse().unwrap();
        assert_eq!(spec, DatasetSpec::new("BTCUSDT", "1h", 30, "binance"));
        assert_eq!(spec.to_string(), "BTCUSDT:1h:30d:binance");
        assert_eq!(spec.timeframe_secs(), Some(3_600));
    }

    #[test]
    fn rejects_malformed_spec() {
        assert!("BTCUSDT:1h:30d".parse::<DatasetSpec>().is_err());
        assert!("BTCUSDT:1h:abc:csv".parse::<DatasetSpec>().is_err());
        assert!("BTCUSDT:1h:0d:csv".parse::<DatasetSpec>().is_err());
        assert!(":1h:30d:csv".parse::<DatasetSpec>().is_err());
    }

    #[test]
    fn timeframe_units() {
        assert_eq!(DatasetSpec::new("X", "15m", 1, "csv").timeframe_secs(), Some(900));
        assert_eq!(DatasetSpec::new("X", "1d", 1, "csv").timeframe_secs(), Some(86_400));
        assert_eq!(DatasetSpec::new("X", "1M", 1, "csv").timeframe_secs(), None);
    }

    #[test]
    fn from_bars_sorts_and_dedups() {
        let s = PriceSeries::from_bars(vec![bar(30, 3.0), bar(10, 1.0), bar(20, 2.0), bar(10, 9.0)]);
        let ts: Vec<i64> = s.bars.iter().map(|b| b.timestamp).collect();
        assert_eq!(ts, vec![10, 20, 30]);
    }

    #[test]
    fn trim_keeps_tail_window() {
        let s = PriceSeries::from_bars((0..10).map(|i| bar(i * 100, i as f64)).collect());
        let t = s.trim_to_window(250);
        // cutoff is 900 - 250 = 650, so 700 is the first bar kept
        assert_eq!(t.bars.first().map(|b| b.timestamp), Some(700));
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn csv_is_deterministic() {
        let s = PriceSeries::from_bars(vec![bar(0, 1.5), bar(3_600, 2.0)]);
        let csv = s.to_csv().unwrap();
        assert_eq!(csv, s.clone().to_csv().unwrap());
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "datetime,open,high,low,close,volume");
        assert_eq!(lines[1], "1970-01-01 00:00:00,1.5,1.5,1.5,1.5,1");
        assert_eq!(lines[2], "1970-01-01 01:00:00,2,2,2,2,1");
    }
}
