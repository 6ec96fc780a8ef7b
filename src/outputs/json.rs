//! JSON digest files.
//!
//! One file per subscriber per run, grouped by the local date the digest was
//! generated on:
//!
//! ```text
//! {output_dir}/{YYYY-MM-DD}/{subscriber}_{HHMM}.json
//! ```

use crate::models::Digest;
use crate::utils::slugify;
use std::error::Error;
use std::path::PathBuf;
use tokio::fs;
use tracing::{error, info, instrument};

/// Where `digest` lands under `output_dir`.
pub fn digest_path(digest: &Digest, output_dir: &str) -> PathBuf {
    let date = digest.generated_at.format("%Y-%m-%d").to_string();
    let file = format!(
        "{}_{}.json",
        slugify(&digest.subscriber),
        digest.generated_at.format("%H%M")
    );
    PathBuf::from(output_dir).join(date).join(file)
}

/// Serialize `digest` and write it to its dated directory.
///
/// # Arguments
///
/// * `digest` - The subscriber's digest
/// * `output_dir` - Root directory; the dated subdirectory is created if missing
///
/// # Returns
///
/// The path written, see [`digest_path`]. A later run in the same minute
/// overwrites it.
#[instrument(level = "info", skip_all, fields(subscriber = %digest.subscriber, output_dir = %output_dir))]
pub async fn write_digest(
    digest: &Digest,
    output_dir: &str,
) -> Result<PathBuf, Box<dyn Error + Send + Sync>> {
    let json = serde_json::to_string_pretty(digest)?;
    let path = digest_path(digest, output_dir);

    if let Some(dir) = path.parent() {
        if let Err(e) = fs::create_dir_all(dir).await {
            error!(dir = %dir.display(), error = %e, "Failed to create digest dir");
            return Err(e.into());
        }
    }

    fs::write(&path, json).await?;
    info!(path = %path.display(), articles = digest.article_count(), "Wrote digest");
    Ok(path)
}
