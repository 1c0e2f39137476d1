//! Snapshot scraping of the outstanding follow-ups dashboard table
//!
//! This crate logs into the dashboard through a headless browser, finds the
//! one table that reports per-location follow-up counts, waits for it to
//! render real data instead of placeholder zeros, and extracts each row
//! into a typed record. The browser boundary is a trait, so the pipeline
//! runs against the bundled DevTools backend or a scripted fake.

pub mod auth;
pub mod cdp;
pub mod error;
pub mod extract;
pub mod locator;
pub mod page;
pub mod poll;

pub use auth::{login, Credentials};
pub use cdp::{BrowserConfig, ChromeSession};
pub use error::ScrapeError;
pub use extract::{clean_count, extract_records, resolve_columns, ColumnMap, FollowupRecord};
pub use locator::{find_followup_table, header_texts};
pub use page::{DomHandle, DomNode, PageSession};
pub use poll::{attempt, collect_rows, wait_for_rows, PollOutcome, PollSettings};
