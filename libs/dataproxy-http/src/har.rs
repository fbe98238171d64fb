//! HAR 1.2 capture files.
//!
//! A [`HarRecorder`] owns one output file and rewrites the whole document
//! every time an entry is added, so the file on disk is always a complete
//! HAR log.

use crate::sanitize::sanitize_label_name;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

const HAR_VERSION: &str = "1.2";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Har {
    pub log: HarLog,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarLog {
    pub version: String,
    pub creator: HarCreator,
    pub entries: Vec<HarEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarCreator {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarEntry {
    pub started_date_time: String,
    /// Total elapsed time in milliseconds
    pub time: f64,
    pub request: HarRequest,
    pub response: HarResponse,
    pub cache: HarCache,
    pub timings: HarTimings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarRequest {
    pub method: String,
    pub url: String,
    pub http_version: String,
    pub cookies: Vec<HarNameValue>,
    pub headers: Vec<HarNameValue>,
    pub query_string: Vec<HarNameValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_data: Option<HarPostData>,
    pub headers_size: i64,
    pub body_size: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarResponse {
    pub status: u16,
    pub status_text: String,
    pub http_version: String,
    pub cookies: Vec<HarNameValue>,
    pub headers: Vec<HarNameValue>,
    pub content: HarContent,
    #[serde(rename = "redirectURL")]
    pub redirect_url: String,
    pub headers_size: i64,
    pub body_size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarNameValue {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarPostData {
    pub mime_type: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarContent {
    pub size: i64,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarCache {}

/// Phase timings in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarTimings {
    pub send: f64,
    pub wait: f64,
    pub receive: f64,
}

impl Har {
    #[must_use]
    pub fn new() -> Self {
        Self {
            log: HarLog {
                version: HAR_VERSION.to_owned(),
                creator: HarCreator {
                    name: env!("CARGO_PKG_NAME").to_owned(),
                    version: env!("CARGO_PKG_VERSION").to_owned(),
                },
                entries: Vec::new(),
            },
        }
    }
}

impl Default for Har {
    fn default() -> Self {
        Self::new()
    }
}

/// `RFC 3339` timestamp for `startedDateTime`.
#[must_use]
pub fn format_started(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_default()
}

/// `<temp dir>/<sanitized datasource>_<unix millis>.har`
#[must_use]
pub fn default_path(datasource_name: &str) -> PathBuf {
    let stem = sanitize_label_name(datasource_name).unwrap_or_else(|_| "datasource".to_owned());
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    std::env::temp_dir().join(format!("{stem}_{millis}.har"))
}

/// Accumulates entries for one client and persists them to `path`.
///
/// Capture is an opt-in debugging aid and its writes are synchronous: every
/// completed entry serializes the whole document and rewrites the file while
/// holding the lock, on whichever runtime thread finishes the response body.
/// Expect added latency per request that grows with the number of entries.
#[derive(Debug)]
pub struct HarRecorder {
    path: PathBuf,
    har: Mutex<Har>,
}

impl HarRecorder {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            har: Mutex::new(Har::new()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `entry` and rewrite the file. Write failures are logged.
    ///
    /// Blocks the calling thread for the serialization and the file write.
    pub fn record(&self, entry: HarEntry) {
        let mut har = self.har.lock();
        har.log.entries.push(entry);
        if let Err(e) = write_har(&self.path, &har) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to write HAR file");
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.har.lock().log.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn write_har(path: &Path, har: &Har) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(har)?;
    std::fs::write(path, json)
}
