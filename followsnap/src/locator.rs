use tracing::{debug, info};

use crate::error::ScrapeError;
use crate::page::{DomHandle, PageSession};

/// Find the outstanding follow-ups table.
///
/// Scans every document frame in natural order and returns the first table
/// whose concatenated header text mentions both LOCATION and FOLLOW. The
/// dashboard renders several widget tables, so header matching is the only
/// reliable way to tell them apart.
pub async fn find_followup_table(session: &dyn PageSession) -> Result<DomHandle, ScrapeError> {
    let frames = session.frames().await?;
    debug!(frames = frames.len(), "scanning frames for follow-up table");

    for (frame_idx, frame) in frames.iter().enumerate() {
        let tables = frame.find_all("table").await?;
        debug!(frame = frame_idx, tables = tables.len(), "checking frame");

        for table in tables {
            let headers = header_texts(&table).await?;
            if headers.is_empty() {
                continue;
            }
            if header_matches(&headers.join(" ")) {
                info!(frame = frame_idx, headers = ?headers, "found follow-up table");
                return Ok(table);
            }
        }
    }

    Err(ScrapeError::TableNotFound(format!(
        "no table with LOCATION and FOLLOW headers in {} frames",
        frames.len()
    )))
}

/// Header cell texts of a table, in column order.
pub async fn header_texts(table: &DomHandle) -> Result<Vec<String>, ScrapeError> {
    let mut texts = Vec::new();
    for th in table.find_all("th").await? {
        texts.push(th.text().await?);
    }
    Ok(texts)
}

fn header_matches(joined: &str) -> bool {
    let upper = joined.to_uppercase();
    upper.contains("LOCATION") && upper.contains("FOLLOW")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_matches_requires_both_tokens() {
        assert!(header_matches("Location Follow-Ups Unprocessed"));
        assert!(header_matches("LOCATION FOLLOW UP"));
        assert!(!header_matches("Location Calls Emails"));
        assert!(!header_matches("Follow-Ups Unprocessed"));
        assert!(!header_matches(""));
    }
}
