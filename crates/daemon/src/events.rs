//! Progress events published to subscribers of a job
//!
//! Events go out on a `tokio::sync::broadcast` channel owned by the job
//! manager; lagging subscribers drop old events rather than slowing encoders.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Capacity of the broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Unix time in milliseconds
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Where a finished job's output can be fetched
pub fn download_url(task_id: &str) -> String {
    format!("/api/jobs/{}/download", task_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Progress,
    Log,
    Done,
    Error,
}

/// Encoder statistics attached to progress samples
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncodeStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    /// Realtime multiple, e.g. 2.5 for `speed=2.5x`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate_kbps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_time_secs: Option<f64>,
}

impl EncodeStats {
    pub fn is_empty(&self) -> bool {
        self == &EncodeStats::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<EncodeStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl ProgressEvent {
    fn bare(kind: EventKind, task_id: &str) -> Self {
        Self {
            kind,
            task_id: task_id.to_string(),
            progress: None,
            message: None,
            stats: None,
            download_url: None,
        }
    }

    pub fn progress(task_id: &str, progress: f64, stats: Option<EncodeStats>) -> Self {
        Self {
            progress: Some(progress),
            stats: stats.filter(|s| !s.is_empty()),
            ..Self::bare(EventKind::Progress, task_id)
        }
    }

    pub fn log(task_id: &str, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::bare(EventKind::Log, task_id)
        }
    }

    pub fn done(task_id: &str, final_size_mb: f64) -> Self {
        Self {
            progress: Some(100.0),
            message: Some(format!("Compression complete ({:.2} MB)", final_size_mb)),
            download_url: Some(download_url(task_id)),
            ..Self::bare(EventKind::Done, task_id)
        }
    }

    pub fn error(task_id: &str, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::bare(EventKind::Error, task_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_done_event_carries_download_url() {
        let event = ProgressEvent::done("abc", 9.5);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["download_url"], "/api/jobs/abc/download");
        assert_eq!(json["progress"], 100.0);
    }

    #[test]
    fn test_absent_fields_are_omitted() {
        let json = serde_json::to_value(ProgressEvent::log("t", "finalizing")).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 3);
        assert_eq!(obj["type"], "log");
        assert_eq!(obj["message"], "finalizing");
    }

    #[test]
    fn test_empty_stats_dropped() {
        let event = ProgressEvent::progress("t", 12.0, Some(EncodeStats::default()));
        assert_eq!(event.stats, None);

        let stats = EncodeStats {
            speed: Some(1.5),
            ..Default::default()
        };
        let event = ProgressEvent::progress("t", 12.0, Some(stats.clone()));
        assert_eq!(event.stats, Some(stats));
    }

    #[test]
    fn test_timestamp_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(current_timestamp_ms() > 1_577_836_800_000);
    }
}
