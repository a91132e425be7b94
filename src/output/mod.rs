use anyhow::Result;
use std::path::Path;

use crate::cli::OutputFormat;
use crate::jobs::{JobStatus, JobView};

/// Render a finished job in the requested format
pub fn render(view: &JobView, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(view.text.clone().unwrap_or_default()),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(view)?),
    }
}

/// Save a job's transcript to file
pub async fn save_to_file(view: &JobView, path: &Path, format: OutputFormat) -> Result<()> {
    let content = render(view, format)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs_err::create_dir_all(parent)?;
    }
    fs_err::write(path, content)?;
    Ok(())
}

/// Print a job's transcript to the console
pub fn print_to_console(view: &JobView, format: OutputFormat) -> Result<()> {
    let content = render(view, format)?;
    println!("{}", content);
    Ok(())
}

/// One-line summary for status displays
pub fn summary(view: &JobView) -> String {
    let marker = match view.status {
        JobStatus::Completed => "done",
        JobStatus::Failed => "failed",
        JobStatus::Processing => "running",
        JobStatus::Queued => "queued",
    };
    format!("[{}] {} ({}, {})", marker, view.id, view.filename, view.provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderKind;
    use chrono::Utc;

    fn view(status: JobStatus, text: Option<&str>) -> JobView {
        JobView {
            id: "job-9".parse().unwrap(),
            filename: "talk.mp4".to_string(),
            provider: ProviderKind::Gemini,
            status,
            text: text.map(str::to_string),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn test_text_format_prints_transcript_only() {
        let rendered = render(&view(JobStatus::Completed, Some("hello there")), OutputFormat::Text).unwrap();
        assert_eq!(rendered, "hello there");
    }

    #[test]
    fn test_json_format_carries_lowercase_status_and_null_text() {
        let rendered = render(&view(JobStatus::Queued, None), OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["status"], "queued");
        assert_eq!(value["provider"], "gemini");
        assert!(value["text"].is_null());
        assert!(value["completed_at"].is_null());
    }

    #[tokio::test]
    async fn test_save_creates_parent_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out").join("talk.txt");
        save_to_file(&view(JobStatus::Completed, Some("saved")), &path, OutputFormat::Text)
            .await
            .unwrap();
        assert_eq!(fs_err::read_to_string(&path).unwrap(), "saved");
    }

    #[test]
    fn test_summary_line() {
        let line = summary(&view(JobStatus::Failed, Some("Error: boom")));
        assert_eq!(line, "[failed] job-9 (talk.mp4, gemini)");
    }
}
