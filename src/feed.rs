//! Detection feed polling.
//!
//! The feed is an HTTP GET that answers with an empty body (nothing new), a
//! backend-busy message, or a JSON document naming the newest detection file
//! and its detections. The file name doubles as the poll cursor: a response
//! naming the file we already saw carries no new data.

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info, warn};
use serde::{Deserialize, Deserializer};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Substring the backend emits while its database is locked or busy.
const BACKEND_BUSY_MARKER: &str = "Database";

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("feed returned HTTP {0}")]
    Status(u16),
    #[error("backend busy")]
    BackendBusy,
    #[error("malformed feed body: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("feed worker stopped")]
    WorkerGone,
}

// ─── Wire format ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DetectionRecord {
    pub common_name: String,
    pub confidence: f64,
    #[serde(default)]
    pub start: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FeedResponse {
    #[serde(default)]
    pub file_name: String,
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub delay: f64,
    #[serde(default)]
    pub detections: Vec<DetectionRecord>,
}

/// Seconds as a JSON number or a numeric string. Anything else reads as 0.
fn lenient_seconds<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    let secs = match value {
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    Ok(if secs.is_finite() { secs } else { 0.0 })
}

/// Interpret a raw response body. `Ok(None)` means "no new data".
pub fn parse_feed_body(body: &str) -> Result<Option<FeedResponse>, FeedError> {
    if body.trim().is_empty() {
        return Ok(None);
    }
    if body.contains(BACKEND_BUSY_MARKER) {
        return Err(FeedError::BackendBusy);
    }
    let resp: FeedResponse = serde_json::from_str(body)?;
    Ok(Some(resp))
}

// ─── Cursor ─────────────────────────────────────────────────────────────────

/// Last-seen detection file name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollCursor {
    last: Option<String>,
}

impl PollCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> Option<&str> {
        self.last.as_deref()
    }

    /// Advance to `file_name` if it is new. Returns false for a repeat or an
    /// empty name, in which case the response must be discarded.
    pub fn advance(&mut self, file_name: &str) -> bool {
        if file_name.is_empty() || self.last.as_deref() == Some(file_name) {
            return false;
        }
        self.last = Some(file_name.to_string());
        true
    }
}

// ─── Transport ──────────────────────────────────────────────────────────────

/// Fetches one raw feed body for the given cursor.
pub trait FeedTransport: Send {
    fn fetch(&mut self, cursor: Option<&str>) -> Result<String, FeedError>;
}

/// `GET {url}?ajax_csv=true&newest_file={cursor}`
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, FeedError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl FeedTransport for HttpTransport {
    fn fetch(&mut self, cursor: Option<&str>) -> Result<String, FeedError> {
        let resp = self
            .client
            .get(&self.url)
            .query(&[("ajax_csv", "true"), ("newest_file", cursor.unwrap_or(""))])
            .send()?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FeedError::Status(status.as_u16()));
        }
        Ok(resp.text()?)
    }
}

// ─── Worker ─────────────────────────────────────────────────────────────────

/// Result of one poll, handed back to the scheduler thread.
pub type PollOutcome = Result<String, FeedError>;

/// Runs fetches off the scheduler thread. One request in, one outcome out.
///
/// Dropping the worker closes the request channel; the thread exits after
/// any fetch already in progress and its outcome is discarded.
pub struct PollWorker {
    request_tx: Option<Sender<Option<String>>>,
    outcome_rx: Receiver<PollOutcome>,
    handle: Option<JoinHandle<()>>,
    in_flight: bool,
}

impl PollWorker {
    pub fn spawn(mut transport: Box<dyn FeedTransport>) -> Self {
        let (request_tx, request_rx) = bounded::<Option<String>>(1);
        let (outcome_tx, outcome_rx) = bounded::<PollOutcome>(1);
        let handle = thread::Builder::new()
            .name("feed-poll".into())
            .spawn(move || {
                for cursor in request_rx {
                    let outcome = transport.fetch(cursor.as_deref());
                    if outcome_tx.send(outcome).is_err() {
                        break;
                    }
                }
                debug!("Feed worker exiting");
            });
        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                warn!("Could not spawn feed worker: {}; polling disabled", e);
                None
            }
        };
        info!("Feed worker started");
        Self {
            request_tx: Some(request_tx),
            outcome_rx,
            handle,
            in_flight: false,
        }
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Queue a fetch unless one is already running. Never blocks.
    pub fn request(&mut self, cursor: Option<&str>) -> bool {
        if self.in_flight || self.handle.is_none() {
            return false;
        }
        let Some(tx) = &self.request_tx else {
            return false;
        };
        match tx.try_send(cursor.map(str::to_string)) {
            Ok(()) => {
                self.in_flight = true;
                true
            }
            Err(_) => false,
        }
    }

    /// Channel the scheduler selects on for finished fetches.
    pub fn outcomes(&self) -> &Receiver<PollOutcome> {
        &self.outcome_rx
    }

    /// Record that an outcome was received.
    pub fn complete(&mut self) {
        self.in_flight = false;
    }
}

impl Drop for PollWorker {
    fn drop(&mut self) {
        self.request_tx.take();
        // Do not join: a slow HTTP request must not hold up shutdown.
        self.handle.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_body_is_no_data() {
        assert_eq!(parse_feed_body("").unwrap(), None);
        assert_eq!(parse_feed_body("  \n").unwrap(), None);
    }

    #[test]
    fn test_database_marker_is_busy() {
        let err = parse_feed_body("Database is locked").unwrap_err();
        assert!(matches!(err, FeedError::BackendBusy));
        // Even if it would otherwise parse
        let err = parse_feed_body(r#"{"file_name":"Database.json"}"#).unwrap_err();
        assert!(matches!(err, FeedError::BackendBusy));
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let err = parse_feed_body("{not json").unwrap_err();
        assert!(matches!(err, FeedError::Parse(_)));
    }

    #[test]
    fn test_parse_full_response() {
        let body = r#"{"file_name":"a.json","delay":2.5,
            "detections":[{"common_name":"Owl","confidence":0.9,"start":1.0}]}"#;
        let resp = parse_feed_body(body).unwrap().unwrap();
        assert_eq!(resp.file_name, "a.json");
        assert_eq!(resp.delay, 2.5);
        assert_eq!(resp.detections.len(), 1);
        assert_eq!(resp.detections[0].common_name, "Owl");
    }

    #[test]
    fn test_parse_defaults_missing_fields() {
        let resp = parse_feed_body(r#"{"file_name":"b.json"}"#).unwrap().unwrap();
        assert_eq!(resp.delay, 0.0);
        assert!(resp.detections.is_empty());
    }

    #[test]
    fn test_delay_as_string_is_accepted() {
        let body = r#"{"file_name":"a.wav.json","delay":"12",
            "detections":[{"common_name":"Owl","confidence":0.9,"start":0}]}"#;
        let resp = parse_feed_body(body).unwrap().unwrap();
        assert_eq!(resp.delay, 12.0);
        assert_eq!(resp.detections.len(), 1);
    }

    #[test]
    fn test_odd_delay_falls_back_to_zero() {
        for delay in [r#""soon""#, "null", "true", "[]", r#""""#] {
            let body = format!(r#"{{"file_name":"a.json","delay":{}}}"#, delay);
            let resp = parse_feed_body(&body).unwrap().unwrap();
            assert_eq!(resp.delay, 0.0, "delay {}", delay);
        }
    }

    #[test]
    fn test_cursor_dedup() {
        let mut c = PollCursor::new();
        assert_eq!(c.token(), None);
        assert!(c.advance("a.json"));
        assert!(!c.advance("a.json"));
        assert!(c.advance("b.json"));
        assert_eq!(c.token(), Some("b.json"));
        assert!(!c.advance(""));
        assert_eq!(c.token(), Some("b.json"));
    }

    struct Canned(Vec<&'static str>);

    impl FeedTransport for Canned {
        fn fetch(&mut self, cursor: Option<&str>) -> Result<String, FeedError> {
            self.0.push(if cursor.is_some() { "with-cursor" } else { "no-cursor" });
            Ok(format!("{}", self.0.len()))
        }
    }

    #[test]
    fn test_worker_one_request_at_a_time() {
        let mut w = PollWorker::spawn(Box::new(Canned(Vec::new())));
        assert!(w.request(None));
        assert!(!w.request(Some("a.json")), "second request while in flight");
        let body = w
            .outcomes()
            .recv_timeout(Duration::from_secs(2))
            .expect("outcome")
            .expect("fetch ok");
        assert_eq!(body, "1");
        w.complete();
        assert!(w.request(Some("a.json")));
        let body = w.outcomes().recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(body, "2");
    }
}
