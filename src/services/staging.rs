//! Timestamp-named scratch directories.
//!
//! A staging directory is `<root>/<epoch-millis>`. The cleaner parses the
//! name back into its creation instant, so the format must not change.

use chrono::{DateTime, TimeZone, Utc};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::fs;

/// Create a fresh staging directory named after `now`.
///
/// If another request already claimed that millisecond the name is bumped
/// until an unused one is found.
pub async fn create_staging_dir(root: &Path, now: DateTime<Utc>) -> io::Result<PathBuf> {
    fs::create_dir_all(root).await?;
    let mut millis = now.timestamp_millis();
    loop {
        let candidate = root.join(millis.to_string());
        match fs::create_dir(&candidate).await {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => millis += 1,
            Err(err) => return Err(err),
        }
    }
}

/// Creation instant encoded in a staging directory name.
pub fn parse_staging_name(name: &str) -> Option<DateTime<Utc>> {
    let millis = name.parse::<i64>().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}
