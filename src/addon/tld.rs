//! Top-level domain list handling for the resolver-directory addon

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_TLDS_URL: &str = "https://publicsuffix.org/list/effective_tld_names.dat";

/// Downloads and normalizes the public-suffix data
pub fn fetch_tlds(url: &str) -> crate::Result<Vec<String>> {
    let body = ureq::get(url)
        .timeout(Duration::from_secs(10))
        .call()?
        .into_string()?;
    Ok(parse_tlds(&body))
}

/// Reduces the public-suffix format to a deduplicated list of bare TLDs
fn parse_tlds(body: &str) -> Vec<String> {
    let mut tlds: Vec<String> = Vec::new();
    for line in body.lines() {
        let entry = line.split("//").next().unwrap_or("").trim();
        let domain = match entry.rsplit('.').next() {
            Some(domain) => domain,
            None => continue,
        };
        if domain.is_empty() || !domain.chars().all(|c| c.is_ascii_alphabetic()) {
            continue;
        }
        let domain = domain.to_ascii_lowercase();
        if !tlds.contains(&domain) {
            tlds.push(domain);
        }
    }
    tlds
}

pub fn save_tlds(path: &Path, tlds: &[String]) -> crate::Result<()> {
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let mut content = format!("# TLDs generated at {}\n", epoch);
    for tld in tlds {
        content.push_str(tld);
        content.push('\n');
    }
    fs::write(path, content)?;
    Ok(())
}

/// Reads a TLD list file: one entry per line, `#` starts a comment
pub fn load_tlds(path: &Path) -> crate::Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("cannot read TLD list {}: {}", path.display(), e))?;
    Ok(content
        .lines()
        .filter_map(|line| {
            let entry = line.split('#').next().unwrap_or("").trim();
            if entry.is_empty() {
                None
            } else {
                Some(entry.to_string())
            }
        })
        .collect())
}
