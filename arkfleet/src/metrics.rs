//! Parsers for the host-wide metric probes.
//!
//! The monitoring loop samples `/proc/stat`, `/proc/meminfo`, `df -P` and
//! `/proc/net/dev` on the remote host. CPU and network figures are rates,
//! so they need two consecutive samples; the loop keeps the previous tick's
//! sample and feeds both in.

use crate::errors::ParseError;

/// Aggregate CPU counters from the first line of `/proc/stat`, in jiffies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuSample {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuSample {
    /// Parse the aggregate `cpu ` line out of `/proc/stat` content.
    pub fn parse(content: &str) -> Result<Self, ParseError> {
        let line = content
            .lines()
            .find(|line| line.starts_with("cpu "))
            .ok_or_else(|| ParseError::new("/proc/stat", "no aggregate cpu line"))?;

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 {
            return Err(ParseError::new(
                "/proc/stat",
                format!("cpu line too short: {line}"),
            ));
        }

        let field = |idx: usize| -> u64 { parts.get(idx).and_then(|s| s.parse().ok()).unwrap_or(0) };

        Ok(Self {
            user: field(1),
            nice: field(2),
            system: field(3),
            idle: field(4),
            iowait: field(5),
            irq: field(6),
            softirq: field(7),
            steal: field(8),
        })
    }

    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    pub fn active(&self) -> u64 {
        self.total()
            .saturating_sub(self.idle)
            .saturating_sub(self.iowait)
    }

    /// CPU usage percentage between two samples. Returns 0 when the samples
    /// do not advance (same tick, counter wrap).
    pub fn percent_since(&self, previous: &CpuSample) -> f64 {
        let total = self.total().saturating_sub(previous.total());
        if total == 0 {
            return 0.0;
        }
        let active = self.active().saturating_sub(previous.active());
        (active as f64 / total as f64) * 100.0
    }
}

/// Memory totals from `/proc/meminfo`, in kilobytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySample {
    pub total_kb: u64,
    pub available_kb: u64,
}

impl MemorySample {
    pub fn parse(content: &str) -> Result<Self, ParseError> {
        let mut total_kb = None;
        let mut available_kb = None;

        for line in content.lines() {
            if let Some((key, value)) = line.split_once(':') {
                let value = value.trim().trim_end_matches(" kB").trim();
                match key {
                    "MemTotal" => total_kb = value.parse().ok(),
                    "MemAvailable" => available_kb = value.parse().ok(),
                    _ => {}
                }
            }
        }

        match (total_kb, available_kb) {
            (Some(total_kb), Some(available_kb)) => Ok(Self {
                total_kb,
                available_kb,
            }),
            _ => Err(ParseError::new(
                "/proc/meminfo",
                "missing MemTotal or MemAvailable",
            )),
        }
    }

    pub fn used_mb(&self) -> u64 {
        self.total_kb.saturating_sub(self.available_kb) / 1024
    }

    pub fn total_mb(&self) -> u64 {
        self.total_kb / 1024
    }

    pub fn percent(&self) -> f64 {
        if self.total_kb == 0 {
            return 0.0;
        }
        (self.total_kb.saturating_sub(self.available_kb)) as f64 / self.total_kb as f64 * 100.0
    }
}

/// Parse the use% column of POSIX `df -P` output for a single filesystem.
pub fn parse_disk_percent(content: &str) -> Result<f64, ParseError> {
    let line = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .next_back()
        .ok_or_else(|| ParseError::new("df", "empty output"))?;

    let capacity = line
        .split_whitespace()
        .find(|field| field.ends_with('%'))
        .ok_or_else(|| ParseError::new("df", format!("no capacity column: {line}")))?;

    capacity
        .trim_end_matches('%')
        .parse()
        .map_err(|_| ParseError::new("df", format!("bad capacity value: {capacity}")))
}

/// Total rx/tx byte counters from `/proc/net/dev`, loopback excluded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetSample {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl NetSample {
    pub fn parse(content: &str) -> Result<Self, ParseError> {
        let mut rx_bytes = 0u64;
        let mut tx_bytes = 0u64;
        let mut interfaces = 0usize;

        for line in content.lines() {
            let Some((name, counters)) = line.split_once(':') else {
                continue;
            };
            if name.trim() == "lo" {
                continue;
            }
            let fields: Vec<&str> = counters.split_whitespace().collect();
            // rx bytes is field 0; tx bytes is field 8.
            if fields.len() < 9 {
                return Err(ParseError::new(
                    "/proc/net/dev",
                    format!("short counter row: {line}"),
                ));
            }
            rx_bytes += fields[0].parse::<u64>().unwrap_or(0);
            tx_bytes += fields[8].parse::<u64>().unwrap_or(0);
            interfaces += 1;
        }

        if interfaces == 0 {
            return Err(ParseError::new("/proc/net/dev", "no interface rows"));
        }
        Ok(Self { rx_bytes, tx_bytes })
    }

    /// Receive/transmit rates in KiB/s between two samples taken
    /// `elapsed_secs` apart.
    pub fn rates_since(&self, previous: &NetSample, elapsed_secs: f64) -> (f64, f64) {
        if elapsed_secs <= 0.0 {
            return (0.0, 0.0);
        }
        let rx = self.rx_bytes.saturating_sub(previous.rx_bytes) as f64 / 1024.0 / elapsed_secs;
        let tx = self.tx_bytes.saturating_sub(previous.tx_bytes) as f64 / 1024.0 / elapsed_secs;
        (rx, tx)
    }
}
