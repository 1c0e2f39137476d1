use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ScrapeError;
use crate::page::DomHandle;

/// One snapshot row: a location and its outstanding counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FollowupRecord {
    pub location: String,
    pub followups: u32,
    pub unprocessed: u32,
}

/// Zero-based cell indices of the three required columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMap {
    pub location: usize,
    pub followups: usize,
    pub unprocessed: usize,
}

impl ColumnMap {
    /// Minimum number of cells a row needs for every mapped column to exist.
    pub fn min_cells(&self) -> usize {
        self.location.max(self.followups).max(self.unprocessed) + 1
    }
}

/// Map header texts to column indices.
///
/// Header text is matched case-insensitively with newlines collapsed, so a
/// two-line "Follow-\nUps" header still resolves. All three columns are
/// required; anything less fails with the full header list for diagnosis.
pub fn resolve_columns(headers: &[String]) -> Result<ColumnMap, ScrapeError> {
    let mut location = None;
    let mut followups = None;
    let mut unprocessed = None;

    for (idx, header) in headers.iter().enumerate() {
        let clean = header.replace('\n', " ").trim().to_uppercase();
        if clean.contains("LOCATION") {
            location = Some(idx);
        }
        if clean.contains("FOLLOW-UP") || clean.contains("FOLLOW UP") {
            followups = Some(idx);
        }
        if clean.contains("UNPROCESSED") {
            unprocessed = Some(idx);
        }
    }

    match (location, followups, unprocessed) {
        (Some(location), Some(followups), Some(unprocessed)) => {
            debug!(location, followups, unprocessed, "resolved column indices");
            Ok(ColumnMap {
                location,
                followups,
                unprocessed,
            })
        }
        _ => Err(ScrapeError::MissingColumns {
            headers: headers.to_vec(),
        }),
    }
}

/// Parse a rendered count cell. Commas and whitespace are stripped first,
/// so "1,234" and " 56 " both parse; placeholders like "--" or "N/A" do not.
pub fn clean_count(raw: &str) -> Option<u32> {
    let cleaned: String = raw
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

/// Turn table rows into records using the resolved column map.
///
/// Rows too short to carry every mapped column are skipped silently; rows
/// whose count cells do not parse are skipped with a warning. An empty
/// result is an error since a populated table should always yield data.
pub async fn extract_records(
    rows: &[DomHandle],
    columns: &ColumnMap,
) -> Result<Vec<FollowupRecord>, ScrapeError> {
    let mut records = Vec::new();

    for row in rows {
        let cells = row.find_all("td").await?;
        if cells.len() < columns.min_cells() {
            debug!(cells = cells.len(), "skipping row with too few cells");
            continue;
        }

        let location = location_name(&cells[columns.location]).await?;
        if location.is_empty() {
            warn!("skipping row with empty location cell");
            continue;
        }

        let followups_raw = cells[columns.followups].text().await?;
        let unprocessed_raw = cells[columns.unprocessed].text().await?;
        let (Some(followups), Some(unprocessed)) = (
            clean_count(&followups_raw),
            clean_count(&unprocessed_raw),
        ) else {
            warn!(
                location = %location,
                followups = %followups_raw,
                unprocessed = %unprocessed_raw,
                "skipping row with unparseable counts"
            );
            continue;
        };

        records.push(FollowupRecord {
            location,
            followups,
            unprocessed,
        });
    }

    if records.is_empty() {
        return Err(ScrapeError::NoValidData(
            "no rows with parseable counts in follow-up table".to_string(),
        ));
    }

    debug!(records = records.len(), "extracted follow-up records");
    Ok(records)
}

/// The location name lives in a nested `p.location-name` when the dashboard
/// renders the styled cell; older layouts put it straight in the cell.
async fn location_name(cell: &DomHandle) -> Result<String, ScrapeError> {
    let raw = match cell.find_first("p.location-name").await? {
        Some(tag) => tag.text().await?,
        None => cell.text().await?,
    };
    Ok(raw.split_whitespace().collect::<Vec<_>>().join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_clean_count_strips_commas() {
        assert_eq!(clean_count("1,234"), Some(1234));
        assert_eq!(clean_count("12,345,678"), Some(12_345_678));
    }

    #[test]
    fn test_clean_count_strips_whitespace() {
        assert_eq!(clean_count(" 56 "), Some(56));
        assert_eq!(clean_count("1 234"), Some(1234));
        assert_eq!(clean_count("\n7\n"), Some(7));
    }

    #[test]
    fn test_clean_count_rejects_placeholders() {
        assert_eq!(clean_count("--"), None);
        assert_eq!(clean_count(""), None);
        assert_eq!(clean_count("N/A"), None);
        assert_eq!(clean_count("   "), None);
    }

    #[test]
    fn test_clean_count_rejects_negatives() {
        assert_eq!(clean_count("-5"), None);
    }

    #[test]
    fn test_resolve_columns_happy_path() {
        let map = resolve_columns(&headers(&["Location", "Follow-Ups", "Unprocessed"])).unwrap();
        assert_eq!(
            map,
            ColumnMap {
                location: 0,
                followups: 1,
                unprocessed: 2,
            }
        );
        assert_eq!(map.min_cells(), 3);
    }

    #[test]
    fn test_resolve_columns_handles_multiline_headers() {
        let map = resolve_columns(&headers(&["Store\nLocation", "follow up\ncount", "UNPROCESSED"]))
            .unwrap();
        assert_eq!(map.location, 0);
        assert_eq!(map.followups, 1);
        assert_eq!(map.unprocessed, 2);
    }

    #[test]
    fn test_resolve_columns_ignores_column_order() {
        let map =
            resolve_columns(&headers(&["Unprocessed", "Location", "Follow-Ups"])).unwrap();
        assert_eq!(map.location, 1);
        assert_eq!(map.followups, 2);
        assert_eq!(map.unprocessed, 0);
    }

    #[test]
    fn test_resolve_columns_keeps_last_duplicate_header() {
        let map = resolve_columns(&headers(&[
            "Location",
            "Location Group",
            "Follow-Ups",
            "Unprocessed",
        ]))
        .unwrap();
        assert_eq!(map.location, 1);
        assert_eq!(map.followups, 2);
        assert_eq!(map.unprocessed, 3);
    }

    #[test]
    fn test_resolve_columns_reports_all_headers_on_miss() {
        let result = resolve_columns(&headers(&["Location", "Calls", "Emails"]));
        match result {
            Err(ScrapeError::MissingColumns { headers }) => {
                assert_eq!(headers, vec!["Location", "Calls", "Emails"]);
            }
            other => panic!("expected MissingColumns, got {other:?}"),
        }
    }
}
