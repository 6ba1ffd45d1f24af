//! Hosts-format blacklist ingestion.
//!
//! Published blocklists (e.g. the Steven Black lists) use the hosts file
//! format: one "address domain" pair per line, `#` comments, blank lines.
//! Only the domain column matters here; the address is discarded.

use std::io;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use super::Blacklist;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Failure to obtain blacklist content from a file or URL.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to fetch blacklist")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),

    #[error("failed to read blacklist file")]
    Io(#[from] io::Error),
}

/// Extract the candidate domain from one hosts-format line.
///
/// Returns `None` for blanks, comments, lines without a second field and
/// fields without a dot.
fn parse_line(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let mut fields = line.split_whitespace();
    let _address = fields.next()?;
    let domain = fields.next()?;

    if !domain.contains('.') {
        return None;
    }
    Some(domain)
}

/// Feed hosts-format text into the blacklist.
///
/// Malformed lines and rejected rules are skipped, never fatal. Returns the
/// number of rules accepted.
pub fn ingest(blacklist: &Blacklist, content: &str) -> usize {
    let mut added = 0;
    for line in content.lines() {
        if let Some(domain) = parse_line(line) {
            if blacklist.add(domain).is_ok() {
                added += 1;
            }
        }
    }
    added
}

/// Load hosts-format rules from a local file.
pub fn load_from_file(blacklist: &Blacklist, path: &Path) -> Result<usize, LoadError> {
    let content = std::fs::read_to_string(path)?;
    Ok(ingest(blacklist, &content))
}

/// Download hosts-format rules over HTTP(S) and ingest them.
pub async fn load_from_url(blacklist: &Blacklist, url: &str) -> Result<usize, LoadError> {
    let client = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;

    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(LoadError::Status(response.status()));
    }

    let body = response.text().await?;
    Ok(ingest(blacklist, &body))
}
