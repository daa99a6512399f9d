use std::path::PathBuf;
use std::time::Duration;

/// Progress of a full download to disk, sent over the engine's progress channel.
#[derive(Debug, Clone)]
pub enum TransferProgress {
    Started {
        url: String,
        output_path: PathBuf,
        resume_from: u64,
    },
    Progress {
        bytes_downloaded: u64,
        total_bytes: u64,
        speed_bps: u64,
    },
    Completed {
        bytes_downloaded: u64,
    },
    Cancelled,
}

pub struct ProgressFormatter;

impl ProgressFormatter {
    pub fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        if unit_index == 0 {
            format!("{} {}", size as u64, UNITS[unit_index])
        } else {
            format!("{:.1} {}", size, UNITS[unit_index])
        }
    }

    /// Measured speeds use decimal units, one decimal place.
    pub fn format_speed(bytes_per_second: f64) -> String {
        const UNITS: &[&str] = &[
            "B/s", "KB/s", "MB/s", "GB/s", "TB/s", "PB/s", "EB/s", "ZB/s", "YB/s",
        ];
        let mut speed = bytes_per_second.max(0.0);
        let mut unit_index = 0;

        while speed >= 1e3 && unit_index < UNITS.len() - 1 {
            speed /= 1e3;
            unit_index += 1;
        }

        format!("{:.1} {}", speed, UNITS[unit_index])
    }

    pub fn format_duration(duration: Duration) -> String {
        let total_seconds = duration.as_secs();
        let hours = total_seconds / 3600;
        let minutes = (total_seconds % 3600) / 60;
        let seconds = total_seconds % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }
}
