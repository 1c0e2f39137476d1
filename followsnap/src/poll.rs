use std::time::Duration;

use tracing::{debug, info};

use crate::error::ScrapeError;
use crate::page::DomHandle;

/// Knobs for the populated-table wait.
///
/// A freshly rendered dashboard table often shows a full grid of zeros
/// before the real counts stream in, so "has rows" is not enough. The table
/// counts as populated once enough count cells are non-zero:
/// `max(min_nonzero, ceil(nonzero_fraction * row_count))`.
#[derive(Debug, Clone)]
pub struct PollSettings {
    /// Probes before giving up.
    pub max_attempts: u32,
    /// Sleep between probes.
    pub interval: Duration,
    /// Absolute floor of non-zero cells.
    pub min_nonzero: u32,
    /// Fraction of rows that must carry a non-zero cell.
    pub nonzero_fraction: f64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            interval: Duration::from_secs(3),
            min_nonzero: 10,
            nonzero_fraction: 0.05,
        }
    }
}

/// Result of a single populated-table probe.
#[derive(Debug)]
pub enum PollOutcome {
    /// Enough non-zero data rendered; these are the data rows seen.
    Populated(Vec<DomHandle>),
    /// Still rendering, counters for logging.
    NotYetReady {
        rows: usize,
        nonzero: usize,
        needed: usize,
    },
}

/// Non-zero cells required for `row_count` rows to count as populated.
pub fn required_nonzero(settings: &PollSettings, row_count: usize) -> usize {
    let scaled = (settings.nonzero_fraction * row_count as f64).ceil() as usize;
    scaled.max(settings.min_nonzero as usize)
}

/// Data rows of the table. Prefers `tbody tr`; tables rendered without a
/// tbody fall back to every `tr` that carries at least one data cell.
pub async fn collect_rows(table: &DomHandle) -> Result<Vec<DomHandle>, ScrapeError> {
    let rows = table.find_all("tbody tr").await?;
    if !rows.is_empty() {
        return Ok(rows);
    }

    let mut data_rows = Vec::new();
    for row in table.find_all("tr").await? {
        if !row.find_all("td").await?.is_empty() {
            data_rows.push(row);
        }
    }
    Ok(data_rows)
}

/// Probe the table once.
///
/// Counts cells after the first in every row (the first holds the location)
/// whose text is a positive integer once commas are stripped.
pub async fn attempt(
    table: &DomHandle,
    settings: &PollSettings,
) -> Result<PollOutcome, ScrapeError> {
    let rows = collect_rows(table).await?;

    let mut nonzero = 0usize;
    for row in &rows {
        let cells = row.find_all("td").await?;
        for cell in cells.iter().skip(1) {
            let text = cell.text().await?;
            let cleaned = text.trim().replace(',', "");
            if is_positive_count(&cleaned) {
                nonzero += 1;
            }
        }
    }

    let needed = required_nonzero(settings, rows.len());
    if !rows.is_empty() && nonzero >= needed {
        Ok(PollOutcome::Populated(rows))
    } else {
        Ok(PollOutcome::NotYetReady {
            rows: rows.len(),
            nonzero,
            needed,
        })
    }
}

/// Probe the table until it is populated, up to the configured budget.
///
/// Returns the data rows seen by the successful probe so the caller
/// extracts exactly what was judged populated. Driver failures propagate
/// immediately rather than burning the remaining budget.
pub async fn wait_for_rows(
    table: &DomHandle,
    settings: &PollSettings,
) -> Result<Vec<DomHandle>, ScrapeError> {
    let mut last_seen = (0usize, required_nonzero(settings, 0));

    for probe in 1..=settings.max_attempts {
        match attempt(table, settings).await? {
            PollOutcome::Populated(rows) => {
                info!(probe, rows = rows.len(), "table populated with real data");
                return Ok(rows);
            }
            PollOutcome::NotYetReady {
                rows,
                nonzero,
                needed,
            } => {
                debug!(
                    probe,
                    max = settings.max_attempts,
                    rows,
                    nonzero,
                    needed,
                    "table not populated yet"
                );
                last_seen = (nonzero, needed);
            }
        }
        if probe < settings.max_attempts {
            tokio::time::sleep(settings.interval).await;
        }
    }

    Err(ScrapeError::TableNotPopulated {
        attempts: settings.max_attempts,
        nonzero: last_seen.0,
        needed: last_seen.1,
    })
}

fn is_positive_count(cleaned: &str) -> bool {
    !cleaned.is_empty()
        && cleaned.bytes().all(|b| b.is_ascii_digit())
        && cleaned.bytes().any(|b| b != b'0')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_nonzero_floor_dominates_small_tables() {
        let settings = PollSettings::default();
        assert_eq!(required_nonzero(&settings, 0), 10);
        assert_eq!(required_nonzero(&settings, 30), 10);
        assert_eq!(required_nonzero(&settings, 200), 10);
    }

    #[test]
    fn test_required_nonzero_scales_with_large_tables() {
        let settings = PollSettings::default();
        assert_eq!(required_nonzero(&settings, 400), 20);
        assert_eq!(required_nonzero(&settings, 1000), 50);
    }

    #[test]
    fn test_required_nonzero_rounds_up() {
        let settings = PollSettings::default();
        // 201 * 0.05 = 10.05, which must round up past the floor
        assert_eq!(required_nonzero(&settings, 201), 11);
    }

    #[test]
    fn test_is_positive_count() {
        assert!(is_positive_count("7"));
        assert!(is_positive_count("1234"));
        assert!(!is_positive_count("0"));
        assert!(!is_positive_count("000"));
        assert!(!is_positive_count(""));
        assert!(!is_positive_count("12a"));
        assert!(!is_positive_count("-3"));
    }
}
