use anyhow::Result;
use std::path::Path;

use crate::config::FfmpegConfig;

/// Format file size in human-readable format
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: f64 = 1024.0;

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f = bytes as f64;
    let unit_index = (bytes_f.log10() / THRESHOLD.log10()).floor() as usize;
    let unit_index = unit_index.min(UNITS.len() - 1);

    let size = bytes_f / THRESHOLD.powi(unit_index as i32);

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

/// Format duration in human-readable format
pub fn format_duration(seconds: f64) -> String {
    let total_seconds = seconds as u64;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let secs = total_seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Sanitize an uploaded file name so it can be embedded in a scratch path
pub fn sanitize_filename(filename: &str) -> String {
    let base = Path::new(filename)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();

    base.chars()
        .map(|c| match c {
            c if c.is_alphanumeric() || c == ' ' || c == '-' || c == '_' || c == '.' => c,
            _ => '_',
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Check if a file exists and is readable
pub fn check_file_accessible(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("File does not exist: {}", path.display());
    }

    if !path.is_file() {
        anyhow::bail!("Path is not a file: {}", path.display());
    }

    fs_err::metadata(path)?;

    Ok(())
}

/// Report the external tools the pipeline needs but cannot find
pub async fn check_dependencies(ffmpeg: &FfmpegConfig) -> Vec<String> {
    let mut missing = Vec::new();

    if !check_command_available(&ffmpeg.ffmpeg_bin, "-version").await {
        missing.push(format!("{} - required for audio extraction", ffmpeg.ffmpeg_bin));
    }

    if !check_command_available(&ffmpeg.ffprobe_bin, "-version").await {
        missing.push(format!("{} - required for splitting long audio", ffmpeg.ffprobe_bin));
    }

    missing
}

/// Check if a command is available in PATH
async fn check_command_available(command: &str, version_flag: &str) -> bool {
    use tokio::process::Command;

    Command::new(command)
        .arg(version_flag)
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}
