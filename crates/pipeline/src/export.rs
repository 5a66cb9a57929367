//! CSV export of snapshots and bars, and CSV tick and bar input for replay.

use chrono::{DateTime, NaiveDateTime, SecondsFormat};
use pairs_core::{
    ts_to_datetime, AnalyticsSnapshot, Bar, Error, Result, Tick, Timeframe, TimestampMs, MAX_TIMESTAMP_MS,
};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::{debug, warn};

/// Column order of the snapshot export.
pub const SNAPSHOT_HEADER: [&str; 16] = [
    "symbol_a",
    "symbol_b",
    "timeframe",
    "open_time",
    "datetime",
    "close_a",
    "close_b",
    "window_len",
    "hedge_ratio",
    "spread",
    "z_score",
    "correlation",
    "adf_stat",
    "adf_pvalue",
    "adf_computed_at",
    "computed_at",
];

/// Column order of the bar export.
pub const BAR_HEADER: [&str; 11] = [
    "symbol",
    "timeframe",
    "open_time",
    "datetime",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "vwap",
    "trade_count",
];

fn csv_error(e: csv::Error) -> Error {
    if e.is_io_error() {
        match e.into_kind() {
            csv::ErrorKind::Io(io) => Error::Io(io),
            other => Error::data(format!("{other:?}")),
        }
    } else {
        Error::data(e.to_string())
    }
}

fn iso_datetime(ts_ms: TimestampMs) -> String {
    ts_to_datetime(ts_ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

#[derive(Serialize)]
struct SnapshotRow<'a> {
    symbol_a: &'a str,
    symbol_b: &'a str,
    timeframe: String,
    open_time: TimestampMs,
    datetime: String,
    close_a: f64,
    close_b: f64,
    window_len: usize,
    hedge_ratio: Option<f64>,
    spread: Option<f64>,
    z_score: Option<f64>,
    correlation: Option<f64>,
    adf_stat: Option<f64>,
    adf_pvalue: Option<f64>,
    adf_computed_at: Option<TimestampMs>,
    computed_at: TimestampMs,
}

impl<'a> From<&'a AnalyticsSnapshot> for SnapshotRow<'a> {
    fn from(s: &'a AnalyticsSnapshot) -> Self {
        Self {
            symbol_a: &s.pair.leg_a,
            symbol_b: &s.pair.leg_b,
            timeframe: s.timeframe.to_string(),
            open_time: s.open_time,
            datetime: iso_datetime(s.open_time),
            close_a: s.close_a,
            close_b: s.close_b,
            window_len: s.window_len,
            hedge_ratio: s.hedge_ratio,
            spread: s.spread,
            z_score: s.z_score,
            correlation: s.correlation,
            adf_stat: s.adf_stat,
            adf_pvalue: s.adf_pvalue,
            adf_computed_at: s.adf_computed_at,
            computed_at: s.computed_at,
        }
    }
}

#[derive(Serialize)]
struct BarRow<'a> {
    symbol: &'a str,
    timeframe: String,
    open_time: TimestampMs,
    datetime: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    vwap: Option<f64>,
    trade_count: u32,
}

impl<'a> From<&'a Bar> for BarRow<'a> {
    fn from(b: &'a Bar) -> Self {
        Self {
            symbol: &b.symbol,
            timeframe: b.timeframe.to_string(),
            open_time: b.open_time,
            datetime: iso_datetime(b.open_time),
            open: b.open,
            high: b.high,
            low: b.low,
            close: b.close,
            volume: b.volume,
            vwap: b.vwap,
            trade_count: b.trade_count,
        }
    }
}

/// Writes analytics snapshots as CSV; undefined statistics are empty cells.
pub struct SnapshotCsvWriter<W: Write> {
    writer: csv::Writer<W>,
    rows: u64,
}

impl<W: Write> SnapshotCsvWriter<W> {
    /// Wrap a writer and emit the header row.
    pub fn new(inner: W) -> Result<Self> {
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(inner);
        writer.write_record(SNAPSHOT_HEADER).map_err(csv_error)?;
        Ok(Self { writer, rows: 0 })
    }

    pub fn write(&mut self, snapshot: &AnalyticsSnapshot) -> Result<()> {
        self.writer.serialize(SnapshotRow::from(snapshot)).map_err(csv_error)?;
        self.rows += 1;
        Ok(())
    }

    /// Data rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn flush(&mut self) -> Result<()> {
        Ok(self.writer.flush()?)
    }

    /// Flush and return the underlying writer.
    pub fn into_inner(self) -> Result<W> {
        self.writer.into_inner().map_err(|e| Error::Io(e.into_error()))
    }
}

/// Writes finalized bars as CSV.
pub struct BarCsvWriter<W: Write> {
    writer: csv::Writer<W>,
    rows: u64,
}

impl<W: Write> BarCsvWriter<W> {
    pub fn new(inner: W) -> Result<Self> {
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(inner);
        writer.write_record(BAR_HEADER).map_err(csv_error)?;
        Ok(Self { writer, rows: 0 })
    }

    pub fn write(&mut self, bar: &Bar) -> Result<()> {
        self.writer.serialize(BarRow::from(bar)).map_err(csv_error)?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn flush(&mut self) -> Result<()> {
        Ok(self.writer.flush()?)
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer.into_inner().map_err(|e| Error::Io(e.into_error()))
    }
}

#[derive(Deserialize)]
struct TickRecord {
    symbol: String,
    ts_ms: TimestampMs,
    price: f64,
    quantity: f64,
}

/// Parse `symbol,ts_ms,price,quantity` rows (with header) in file order.
///
/// Rows are not validated here; the resampler counts invalid ticks.
pub fn read_ticks_csv<R: Read>(reader: R) -> Result<Vec<Tick>> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut ticks = Vec::new();
    for (i, record) in reader.deserialize::<TickRecord>().enumerate() {
        let record = record.map_err(|e| Error::data(format!("tick row {}: {e}", i + 1)))?;
        ticks.push(Tick::new(record.symbol, record.ts_ms, record.price, record.quantity));
    }
    Ok(ticks)
}

/// Columns a bar file must carry besides `timestamp` or `datetime`.
pub const BAR_INPUT_COLUMNS: [&str; 5] = ["open", "high", "low", "close", "volume"];

#[derive(Deserialize)]
struct BarRecord {
    #[serde(default, deserialize_with = "csv::invalid_option")]
    timestamp: Option<TimestampMs>,
    #[serde(default)]
    datetime: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    open: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    high: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    low: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    close: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    volume: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    vwap: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    trade_count: Option<u32>,
}

/// Parse `2024-01-01T00:01:00Z` style or naive `2024-01-01 00:01:00` (UTC) text.
fn parse_datetime_ms(text: &str) -> Option<TimestampMs> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis());
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|dt| dt.and_utc().timestamp_millis())
}

impl BarRecord {
    fn into_bar(self, symbol: &str, timeframe: Timeframe) -> Option<Bar> {
        let ts = match (self.timestamp, self.datetime.as_deref()) {
            (Some(ts), _) => ts,
            (None, Some(text)) => parse_datetime_ms(text)?,
            (None, None) => return None,
        };
        let (open, high, low, close, volume) = (self.open?, self.high?, self.low?, self.close?, self.volume?);
        let prices_ok = [open, high, low, close].iter().all(|p| p.is_finite() && *p > 0.0);
        if !prices_ok || !volume.is_finite() || volume < 0.0 || !(0..=MAX_TIMESTAMP_MS).contains(&ts) {
            return None;
        }
        let bar = Bar {
            symbol: symbol.to_string(),
            timeframe,
            open_time: timeframe.floor(ts),
            open,
            high,
            low,
            close,
            volume,
            vwap: self.vwap.or((volume > 0.0).then_some(close)),
            trade_count: self.trade_count.unwrap_or(u32::from(volume > 0.0)),
        };
        bar.is_consistent().then_some(bar)
    }
}

/// Parse an OHLCV file for one symbol at one timeframe.
///
/// Time comes from a `timestamp` (epoch ms) or `datetime` column and is
/// floored to the interval start. `vwap` and `trade_count` are optional.
/// Rows with missing, non-numeric or inconsistent values are skipped; the
/// result is sorted by open time with the first row of each interval kept.
pub fn read_bars_csv<R: Read>(reader: R, symbol: &str, timeframe: Timeframe) -> Result<Vec<Bar>> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let headers = reader.headers().map_err(csv_error)?.clone();
    let has = |name: &str| headers.iter().any(|h| h == name);
    let missing: Vec<&str> = BAR_INPUT_COLUMNS.into_iter().filter(|c| !has(c)).collect();
    if !missing.is_empty() {
        return Err(Error::data(format!("bar file is missing columns: {}", missing.join(", "))));
    }
    if !has("timestamp") && !has("datetime") {
        return Err(Error::data("bar file needs a 'timestamp' or 'datetime' column"));
    }

    let mut bars = Vec::new();
    let mut rejected = 0usize;
    for (i, record) in reader.deserialize::<BarRecord>().enumerate() {
        let bar = record.map_err(csv_error)?.into_bar(symbol, timeframe);
        match bar {
            Some(bar) => bars.push(bar),
            None => {
                rejected += 1;
                debug!(symbol, row = i + 1, "bar row rejected");
            }
        }
    }

    bars.sort_by_key(|b| b.open_time);
    let before = bars.len();
    bars.dedup_by_key(|b| b.open_time);
    rejected += before - bars.len();

    if rejected > 0 {
        warn!(symbol, %timeframe, rejected, kept = bars.len(), "skipped unusable bar rows");
    }
    if bars.is_empty() {
        return Err(Error::data(format!("no valid bars for {symbol} @ {timeframe}")));
    }
    Ok(bars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairs_core::{PairId, Timeframe};

    fn snapshot(z: Option<f64>) -> AnalyticsSnapshot {
        AnalyticsSnapshot {
            pair: PairId::new("BTCUSDT", "ETHUSDT"),
            timeframe: Timeframe::ONE_MINUTE,
            open_time: 60_000,
            close_a: 50_000.5,
            close_b: 3_000.25,
            window_len: 12,
            hedge_ratio: z.map(|_| 15.0),
            spread: z.map(|_| 4.5),
            z_score: z,
            correlation: None,
            adf_stat: None,
            adf_pvalue: None,
            adf_computed_at: None,
            computed_at: 120_000,
        }
    }

    #[test]
    fn test_snapshot_header_and_empty_cells() {
        let mut writer = SnapshotCsvWriter::new(Vec::new()).unwrap();
        writer.write(&snapshot(None)).unwrap();
        writer.write(&snapshot(Some(1.5))).unwrap();
        assert_eq!(writer.rows(), 2);
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], SNAPSHOT_HEADER.join(","));
        assert_eq!(
            lines[1],
            "BTCUSDT,ETHUSDT,1m,60000,1970-01-01T00:01:00.000Z,50000.5,3000.25,12,,,,,,,,120000"
        );
        assert_eq!(
            lines[2],
            "BTCUSDT,ETHUSDT,1m,60000,1970-01-01T00:01:00.000Z,50000.5,3000.25,12,15.0,4.5,1.5,,,,,120000"
        );
    }

    #[test]
    fn test_snapshot_carries_adf_computed_at() {
        let mut snap = snapshot(Some(1.5));
        snap.adf_stat = Some(-3.5);
        snap.adf_pvalue = Some(0.01);
        snap.adf_computed_at = Some(0);
        let mut writer = SnapshotCsvWriter::new(Vec::new()).unwrap();
        writer.write(&snap).unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let row: Vec<&str> = text.lines().nth(1).unwrap().split(',').collect();
        assert_eq!(row.len(), SNAPSHOT_HEADER.len());
        let col = SNAPSHOT_HEADER.iter().position(|h| *h == "adf_computed_at").unwrap();
        assert_eq!(row[col], "0");
        assert_eq!(row[col - 1], "0.01");
    }

    #[test]
    fn test_header_written_without_rows() {
        let writer = BarCsvWriter::new(Vec::new()).unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        assert_eq!(text.trim_end(), BAR_HEADER.join(","));
    }

    #[test]
    fn test_bar_row() {
        let bar = Bar {
            symbol: "ETHUSDT".to_string(),
            timeframe: Timeframe::ONE_SECOND,
            open_time: 1_000,
            open: 100.0,
            high: 101.0,
            low: 99.5,
            close: 100.5,
            volume: 0.0,
            vwap: None,
            trade_count: 0,
        };
        let mut writer = BarCsvWriter::new(Vec::new()).unwrap();
        writer.write(&bar).unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        assert_eq!(
            text.lines().nth(1),
            Some("ETHUSDT,1s,1000,1970-01-01T00:00:01.000Z,100.0,101.0,99.5,100.5,0.0,,0")
        );
    }

    #[test]
    fn test_read_ticks_csv() {
        let data = "symbol,ts_ms,price,quantity\nBTCUSDT,1000,50000.5,0.25\n ETHUSDT , 1500 , 3000 , 1\n";
        let ticks = read_ticks_csv(data.as_bytes()).unwrap();
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0], Tick::new("BTCUSDT", 1_000, 50_000.5, 0.25));
        assert_eq!(ticks[1], Tick::new("ETHUSDT", 1_500, 3_000.0, 1.0));
    }

    #[test]
    fn test_read_ticks_csv_reports_bad_row() {
        let data = "symbol,ts_ms,price,quantity\nBTCUSDT,abc,1,1\n";
        let err = read_ticks_csv(data.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::Data(msg) if msg.contains("tick row 1")));
    }

    #[test]
    fn test_read_bars_csv_with_datetime() {
        let data = "datetime,open,high,low,close,volume\n\
                    2024-01-01 00:01:00,100.5,102.0,100.0,101.0,1200.0\n\
                    2024-01-01 00:00:00,100.0,101.5,99.5,100.5,1000.0\n\
                    2024-01-01 00:02:00,101.0,101.5,100.5,101.2,0\n";
        let bars = read_bars_csv(data.as_bytes(), "BTCUSDT", Timeframe::ONE_MINUTE).unwrap();
        let opens: Vec<_> = bars.iter().map(|b| b.open_time).collect();
        assert_eq!(opens, vec![1704067200000, 1704067260000, 1704067320000]);
        assert_eq!(bars[0].close, 100.5);
        assert_eq!(bars[0].vwap, Some(100.5));
        assert_eq!(bars[0].trade_count, 1);
        assert!(bars.iter().all(|b| b.symbol == "BTCUSDT" && b.timeframe == Timeframe::ONE_MINUTE));
        // zero volume reads as an empty interval
        assert!(bars[2].is_gap_fill());
        assert_eq!(bars[2].vwap, None);
    }

    #[test]
    fn test_read_bars_csv_skips_bad_rows() {
        let data = "timestamp,open,high,low,close,volume,vwap\n\
                    60500,10,11,9,10.5,5,10.2\n\
                    120000,abc,11,9,10.5,5,\n\
                    180000,10,9,11,10.5,5,\n\
                    240000,10,11,9,,5,\n\
                    60000,12,12,12,12,1,\n\
                    300000,10,11,9,10,2,\n";
        let bars = read_bars_csv(data.as_bytes(), "ETHUSDT", Timeframe::ONE_MINUTE).unwrap();
        let opens: Vec<_> = bars.iter().map(|b| b.open_time).collect();
        assert_eq!(opens, vec![60_000, 300_000]);
        // the first row for an interval wins
        assert_eq!(bars[0].vwap, Some(10.2));
        assert_eq!(bars[1].vwap, Some(10.0));
    }

    #[test]
    fn test_read_bars_csv_requires_columns() {
        let err = read_bars_csv("timestamp,open,high,low,close\n0,1,1,1,1\n".as_bytes(), "X", Timeframe::ONE_MINUTE)
            .unwrap_err();
        assert!(matches!(err, Error::Data(msg) if msg.contains("volume")));

        let err = read_bars_csv("open,high,low,close,volume\n1,1,1,1,1\n".as_bytes(), "X", Timeframe::ONE_MINUTE)
            .unwrap_err();
        assert!(matches!(err, Error::Data(msg) if msg.contains("datetime")));

        let err = read_bars_csv("timestamp,open,high,low,close,volume\n0,x,1,1,1,1\n".as_bytes(), "X", Timeframe::ONE_MINUTE)
            .unwrap_err();
        assert!(matches!(err, Error::Data(msg) if msg.contains("no valid bars")));
    }
}
