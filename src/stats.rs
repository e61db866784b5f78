//! Container statistics.
//!
//! One-shot tables and a live view fed by one producer task per container.
//! Producers forward samples over a bounded channel; the renderer owns the
//! latest sample per container and redraws on a fixed interval.

use crate::engine::{short_id, Engine, EngineError, StatsSample};
use futures::StreamExt;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Redraw interval of the live view.
pub const RENDER_INTERVAL: Duration = Duration::from_secs(1);

/// How long producers get to stop after cancellation.
pub const STOP_TIMEOUT: Duration = Duration::from_millis(500);

/// Clear screen and move the cursor home.
const CLEAR_SCREEN: &str = "\x1b[H\x1b[2J";

const HEADERS: [&str; 8] = [
    "CONTAINER ID",
    "NAME",
    "CPU %",
    "MEM USAGE / LIMIT",
    "MEM %",
    "NET I/O",
    "BLOCK I/O",
    "PIDS",
];

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("{op}: {source}")]
    Engine {
        op: String,
        #[source]
        source: EngineError,
    },

    #[error("failed to get stats for {}", format_failures(.0))]
    Partial(Vec<(String, EngineError)>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_failures(failures: &[(String, EngineError)]) -> String {
    failures
        .iter()
        .map(|(name, e)| format!("{name} ({e})"))
        .collect::<Vec<_>>()
        .join(", ")
}

// -----------------------------------------------------------------------
// Arithmetic
// -----------------------------------------------------------------------

/// CPU usage across all cores, as a percentage of one core.
///
/// Zero unless both the container and the system CPU counters advanced.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn cpu_percent(sample: &StatsSample) -> f64 {
    let cpu_delta = sample
        .cpu_stats
        .cpu_usage
        .total_usage
        .saturating_sub(sample.precpu_stats.cpu_usage.total_usage);
    let system_delta = sample
        .cpu_stats
        .system_cpu_usage
        .unwrap_or(0)
        .saturating_sub(sample.precpu_stats.system_cpu_usage.unwrap_or(0));

    if cpu_delta == 0 || system_delta == 0 {
        return 0.0;
    }

    let cpus = sample
        .cpu_stats
        .online_cpus
        .filter(|&n| n > 0)
        .or_else(|| {
            sample
                .cpu_stats
                .cpu_usage
                .percpu_usage
                .as_ref()
                .and_then(|v| u32::try_from(v.len()).ok())
                .filter(|&n| n > 0)
        })
        .unwrap_or(1);

    (cpu_delta as f64 / system_delta as f64) * f64::from(cpus) * 100.0
}

/// Memory usage as a percentage of the limit; zero without a limit.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn memory_percent(sample: &StatsSample) -> f64 {
    match (sample.memory_stats.usage, sample.memory_stats.limit) {
        (Some(usage), Some(limit)) if limit > 0 => usage as f64 / limit as f64 * 100.0,
        _ => 0.0,
    }
}

/// Format a byte count with 1024-based units.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes}B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2}{}", UNITS[unit])
}

// -----------------------------------------------------------------------
// Rows
// -----------------------------------------------------------------------

/// One rendered line of the stats table.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsRow {
    pub id: String,
    pub name: String,
    pub cpu_percent: f64,
    pub mem_usage: u64,
    pub mem_limit: u64,
    pub mem_percent: f64,
    pub net_rx: u64,
    pub net_tx: u64,
    pub block_read: u64,
    pub block_write: u64,
    pub pids: u64,
}

impl StatsRow {
    /// Build a row. `id` and `name` fill in when the sample lacks them.
    #[must_use]
    pub fn from_sample(sample: &StatsSample, id: &str, name: &str) -> Self {
        let (net_rx, net_tx) = sample
            .networks
            .iter()
            .flat_map(|nets| nets.values())
            .fold((0u64, 0u64), |(rx, tx), n| {
                (rx.saturating_add(n.rx_bytes), tx.saturating_add(n.tx_bytes))
            });

        let (block_read, block_write) = sample
            .blkio_stats
            .io_service_bytes_recursive
            .iter()
            .flatten()
            .fold((0u64, 0u64), |(r, w), entry| {
                if entry.op.eq_ignore_ascii_case("read") {
                    (r.saturating_add(entry.value), w)
                } else if entry.op.eq_ignore_ascii_case("write") {
                    (r, w.saturating_add(entry.value))
                } else {
                    (r, w)
                }
            });

        let sample_name = sample.name.strip_prefix('/').unwrap_or(&sample.name);
        Self {
            id: if sample.id.is_empty() { id } else { sample.id.as_str() }.to_string(),
            name: if sample_name.is_empty() { name } else { sample_name }.to_string(),
            cpu_percent: cpu_percent(sample),
            mem_usage: sample.memory_stats.usage.unwrap_or(0),
            mem_limit: sample.memory_stats.limit.unwrap_or(0),
            mem_percent: memory_percent(sample),
            net_rx,
            net_tx,
            block_read,
            block_write,
            pids: sample.pids_stats.current.unwrap_or(0),
        }
    }

    fn cells(&self, no_trunc: bool) -> [String; 8] {
        [
            if no_trunc {
                self.id.clone()
            } else {
                short_id(&self.id).to_string()
            },
            self.name.clone(),
            format!("{:.2}%", self.cpu_percent),
            format!(
                "{} / {}",
                format_bytes(self.mem_usage),
                format_bytes(self.mem_limit)
            ),
            format!("{:.2}%", self.mem_percent),
            format!("{} / {}", format_bytes(self.net_rx), format_bytes(self.net_tx)),
            format!(
                "{} / {}",
                format_bytes(self.block_read),
                format_bytes(self.block_write)
            ),
            self.pids.to_string(),
        ]
    }
}

/// Render rows as an aligned table with a header line.
#[must_use]
pub fn render_table(rows: &[StatsRow], no_trunc: bool) -> String {
    let cells: Vec<[String; 8]> = rows.iter().map(|r| r.cells(no_trunc)).collect();
    let mut widths = HEADERS.map(str::len);
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    let mut push_line = |line: &[&str]| {
        let last = line.len() - 1;
        for (i, cell) in line.iter().enumerate() {
            if i == last {
                out.push_str(cell);
            } else {
                let _ = write!(out, "{cell:<width$}   ", width = widths[i]);
            }
        }
        out.push('\n');
    };

    push_line(&HEADERS[..]);
    for row in &cells {
        let refs: Vec<&str> = row.iter().map(String::as_str).collect();
        push_line(&refs);
    }
    out
}

// -----------------------------------------------------------------------
// One-shot
// -----------------------------------------------------------------------

/// Print one stats table for `targets`.
///
/// Containers whose stats cannot be read are skipped; the failures are
/// returned together after the table is written.
pub async fn stats_once<W>(
    engine: &dyn Engine,
    targets: &[String],
    no_trunc: bool,
    out: &mut W,
) -> Result<(), StatsError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut rows = Vec::with_capacity(targets.len());
    let mut failures = Vec::new();

    for target in targets {
        match engine.stats_once(target).await {
            Ok(sample) => rows.push(StatsRow::from_sample(&sample, target, target)),
            Err(e) => {
                warn!(container = %target, "stats failed: {e}");
                failures.push((target.clone(), e));
            }
        }
    }

    out.write_all(render_table(&rows, no_trunc).as_bytes()).await?;
    out.flush().await?;

    if failures.is_empty() {
        Ok(())
    } else {
        Err(StatsError::Partial(failures))
    }
}

// -----------------------------------------------------------------------
// Streaming
// -----------------------------------------------------------------------

/// Options for the live view.
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    pub no_trunc: bool,
    pub interval: Duration,
    pub stop_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            no_trunc: false,
            interval: RENDER_INTERVAL,
            stop_timeout: STOP_TIMEOUT,
        }
    }
}

/// Live stats view. Renders until `cancel` fires.
///
/// Each target is resolved to its ID once. A producer that fails logs the
/// error and stops; the last sample it delivered stays on screen.
pub async fn stats_stream<W>(
    engine: Arc<dyn Engine>,
    targets: &[String],
    options: StreamOptions,
    out: &mut W,
    cancel: &CancellationToken,
) -> Result<(), StatsError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut containers = Vec::with_capacity(targets.len());
    for target in targets {
        let container = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            result = engine.inspect_container(target) => result.map_err(|source| StatsError::Engine {
                op: format!("inspecting container {target}"),
                source,
            })?,
        };
        containers.push(container);
    }

    let (tx, mut rx) = mpsc::channel::<(usize, StatsSample)>((2 * containers.len()).max(1));
    let producer_cancel = cancel.child_token();
    let mut producers: Vec<JoinHandle<()>> = containers
        .iter()
        .enumerate()
        .map(|(index, container)| {
            tokio::spawn(produce(
                Arc::clone(&engine),
                index,
                container.id.clone(),
                tx.clone(),
                producer_cancel.clone(),
            ))
        })
        .collect();
    drop(tx);

    let mut latest: Vec<Option<StatsRow>> = vec![None; containers.len()];
    let mut ticker = tokio::time::interval_at(Instant::now() + options.interval, options.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut producers_done = false;

    let result = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break Ok(()),
            received = rx.recv(), if !producers_done => match received {
                Some((index, sample)) => {
                    let container = &containers[index];
                    latest[index] = Some(StatsRow::from_sample(&sample, &container.id, &container.name));
                }
                None => {
                    debug!("all stats producers stopped");
                    producers_done = true;
                }
            },
            _ = ticker.tick() => {
                let rows: Vec<StatsRow> = latest.iter().flatten().cloned().collect();
                let frame = format!("{CLEAR_SCREEN}{}", render_table(&rows, options.no_trunc));
                if let Err(e) = write_frame(out, &frame).await {
                    break Err(StatsError::Io(e));
                }
            }
        }
    };

    producer_cancel.cancel();
    drop(rx);
    let deadline = Instant::now() + options.stop_timeout;
    for handle in &mut producers {
        if tokio::time::timeout_at(deadline, &mut *handle).await.is_err() {
            handle.abort();
        }
    }
    result
}

async fn write_frame<W>(out: &mut W, frame: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    out.write_all(frame.as_bytes()).await?;
    out.flush().await
}

/// Forward samples for one container until cancelled or the stream ends.
async fn produce(
    engine: Arc<dyn Engine>,
    index: usize,
    id: String,
    tx: mpsc::Sender<(usize, StatsSample)>,
    cancel: CancellationToken,
) {
    let opened = tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        result = engine.stats_stream(&id) => result,
    };
    let mut samples = match opened {
        Ok(stream) => stream,
        Err(e) => {
            warn!(container = %id, "opening stats stream failed: {e}");
            return;
        }
    };

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = samples.next() => next,
        };
        match next {
            Some(Ok(sample)) => match tx.try_send((index, sample)) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            },
            Some(Err(e)) => {
                warn!(container = %id, "stats stream failed: {e}");
                break;
            }
            None => {
                debug!(container = %id, "stats stream ended");
                break;
            }
        }
    }
    debug!(container = %id, "stats producer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CpuStats, CpuUsage, MemoryStats};

    fn cpu_sample(pre_cpu: u64, cpu: u64, pre_sys: u64, sys: u64, cpus: u32) -> StatsSample {
        StatsSample {
            cpu_stats: CpuStats {
                cpu_usage: CpuUsage {
                    total_usage: cpu,
                    percpu_usage: None,
                },
                system_cpu_usage: Some(sys),
                online_cpus: Some(cpus),
            },
            precpu_stats: CpuStats {
                cpu_usage: CpuUsage {
                    total_usage: pre_cpu,
                    percpu_usage: None,
                },
                system_cpu_usage: Some(pre_sys),
                online_cpus: None,
            },
            ..StatsSample::default()
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_cpu_percent_fixtures() {
        // no cpu delta
        assert!(approx(cpu_percent(&cpu_sample(5, 5, 0, 1_000, 1)), 0.0));
        // no system delta
        assert!(approx(cpu_percent(&cpu_sample(0, 1_000, 7, 7, 1)), 0.0));
        // 1e9 of 1e10 on one core
        assert!(approx(
            cpu_percent(&cpu_sample(1_000_000_000, 2_000_000_000, 10_000_000_000, 20_000_000_000, 1)),
            10.0
        ));
        assert!(approx(
            cpu_percent(&cpu_sample(1_000_000_000, 2_000_000_000, 10_000_000_000, 20_000_000_000, 4)),
            40.0
        ));
        assert!(approx(
            cpu_percent(&cpu_sample(1_000_000_000, 2_000_000_000, 1_000_000_000, 2_000_000_000, 1)),
            100.0
        ));
        assert!(approx(
            cpu_percent(&cpu_sample(0, 4_000_000_000, 0, 8_000_000_000, 8)),
            400.0
        ));
    }

    #[test]
    fn test_cpu_count_falls_back_to_percpu() {
        let mut sample = cpu_sample(0, 1_000, 0, 10_000, 0);
        sample.cpu_stats.online_cpus = None;
        sample.cpu_stats.cpu_usage.percpu_usage = Some(vec![0, 0]);
        assert!(approx(cpu_percent(&sample), 20.0));
    }

    #[test]
    fn test_memory_percent() {
        let mut sample = StatsSample {
            memory_stats: MemoryStats {
                usage: Some(1024),
                limit: Some(4096),
            },
            ..StatsSample::default()
        };
        assert!(approx(memory_percent(&sample), 25.0));
        sample.memory_stats.limit = Some(0);
        assert!(approx(memory_percent(&sample), 0.0));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0B");
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1024), "1.00KB");
        assert_eq!(format_bytes(1536), "1.50KB");
        assert_eq!(format_bytes(1_048_576), "1.00MB");
        assert_eq!(format_bytes(1_073_741_824), "1.00GB");
        assert_eq!(format_bytes(1_099_511_627_776), "1.00TB");
    }

    #[test]
    fn test_table_layout() {
        let sample = cpu_sample(1_000_000_000, 2_000_000_000, 10_000_000_000, 20_000_000_000, 4);
        let row = StatsRow::from_sample(&sample, "0123456789abcdef0123", "web");
        let table = render_table(&[row], false);
        let mut lines = table.lines();

        let header = lines.next().unwrap();
        assert!(header.starts_with("CONTAINER ID   NAME"));
        assert!(header.ends_with("PIDS"));

        let line = lines.next().unwrap();
        assert!(line.starts_with("0123456789ab   web"));
        assert!(line.contains("40.00%"));
        assert!(line.contains("0B / 0B"));
        assert!(lines.next().is_none());
    }

    #[test]
    fn test_no_trunc_keeps_full_id() {
        let row = StatsRow::from_sample(&StatsSample::default(), "0123456789abcdef0123", "web");
        assert!(render_table(&[row], true).contains("0123456789abcdef0123"));
    }
}
