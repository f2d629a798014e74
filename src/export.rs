//! Crawl data export
//!
//! Serializes a task's stored posts to JSON or CSV under the configured
//! export directory. File writing is blocking I/O and runs on the blocking
//! executor.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::crawl::CrawlTask;
use crate::error::{HarvestError, Result};
use crate::posts::{CrawledPost, PostStore};

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
        }
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(HarvestError::InvalidResponse(format!(
                "unsupported export format {other}"
            ))),
        }
    }
}

/// Result of a completed export.
#[derive(Debug, Clone, Serialize)]
pub struct ExportReceipt {
    pub file_path: PathBuf,
    pub exported_count: usize,
}

/// Export a task's posts, optionally restricted to a time range.
pub async fn export_task(
    posts: &PostStore,
    task: &CrawlTask,
    export_dir: &Path,
    format: ExportFormat,
    time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
) -> Result<ExportReceipt> {
    let (from, to) = time_range.unwrap_or_else(|| {
        (
            Utc.timestamp_opt(0, 0).single().unwrap_or_else(Utc::now),
            Utc::now(),
        )
    });

    let selected = posts.range(task.task_id, from, to).await?;
    if selected.is_empty() {
        return Err(HarvestError::NoData);
    }

    let file_path = export_dir.join(format!(
        "crawl-{}.{}",
        task.task_id,
        format.extension()
    ));

    let exported_count = selected.len();
    let dir = export_dir.to_path_buf();
    let path = file_path.clone();
    tokio::task::spawn_blocking(move || write_file(&dir, &path, format, &selected))
        .await
        .map_err(|e| HarvestError::Serialization(format!("export task join: {e}")))??;

    Ok(ExportReceipt {
        file_path,
        exported_count,
    })
}

fn write_file(
    dir: &Path,
    path: &Path,
    format: ExportFormat,
    posts: &[CrawledPost],
) -> Result<()> {
    std::fs::create_dir_all(dir)
        .map_err(|e| HarvestError::Serialization(format!("create export dir: {e}")))?;

    match format {
        ExportFormat::Json => {
            let file = std::fs::File::create(path)
                .map_err(|e| HarvestError::Serialization(format!("create {}: {e}", path.display())))?;
            serde_json::to_writer_pretty(std::io::BufWriter::new(file), posts)?;
        }
        ExportFormat::Csv => {
            let mut writer = csv::Writer::from_path(path)
                .map_err(|e| HarvestError::Serialization(format!("create {}: {e}", path.display())))?;
            writer
                .write_record(["post_id", "published_at", "author", "content", "extra"])
                .map_err(|e| HarvestError::Serialization(e.to_string()))?;
            for post in posts {
                let extra = serde_json::to_string(&post.extra)?;
                writer
                    .write_record([
                        post.post_id.as_str(),
                        &post.published_at.to_rfc3339(),
                        post.author.as_str(),
                        post.content.as_str(),
                        &extra,
                    ])
                    .map_err(|e| HarvestError::Serialization(e.to_string()))?;
            }
            writer
                .flush()
                .map_err(|e| HarvestError::Serialization(e.to_string()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use uuid::Uuid;

    fn sample_posts(task_id: Uuid) -> Vec<CrawledPost> {
        (0..3)
            .map(|i| CrawledPost {
                post_id: format!("p{i}"),
                task_id,
                published_at: Utc.timestamp_opt(1_715_300_000 + i, 0).single().unwrap(),
                content: format!("content {i}"),
                author: "alice".to_string(),
                extra: Map::new(),
            })
            .collect()
    }

    #[test]
    fn csv_export_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let task_id = Uuid::new_v4();
        let path = dir.path().join("out.csv");
        write_file(dir.path(), &path, ExportFormat::Csv, &sample_posts(task_id)).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("post_id,published_at"));
        assert!(lines[1].starts_with("p0,"));
    }

    #[test]
    fn json_export_round_trips_count() {
        let dir = tempfile::tempdir().unwrap();
        let task_id = Uuid::new_v4();
        let path = dir.path().join("out.json");
        write_file(dir.path(), &path, ExportFormat::Json, &sample_posts(task_id)).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let back: Vec<CrawledPost> = serde_json::from_str(&contents).unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back[0].post_id, "p0");
    }

    #[test]
    fn format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert_eq!("csv".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert!("xml".parse::<ExportFormat>().is_err());
    }
}
