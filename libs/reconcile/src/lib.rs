//! Reconciliation primitives.
//!
//! This library provides the deterministic pieces of the build-apply-prune
//! loop:
//!
//! - **Generation token**: a content hash of one rendered resource set, used
//!   both as change fingerprint and as the garbage-collection marker.
//! - **Substitution**: flat `${var}` expansion over rendered manifests.
//! - **Retry budget and backoff**: per-object failure accounting.
//!
//! # Invariants
//!
//! - Token computation is deterministic given the same resource set
//! - A token never depends on itself (it is computed from a token-free build)
//! - Nothing in this crate performs I/O

pub mod subst;

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

pub use subst::{substitute, SubstituteError};

/// Number of digest bytes kept in a token. 20 bytes render as 40 hex
/// characters, inside the 63 character label value limit.
const TOKEN_BYTES: usize = 20;

/// Content-derived label value stamped on every resource of one pass.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenerationToken(String);

impl GenerationToken {
    /// Hash a resource set in the given order.
    ///
    /// Each resource is rendered as canonical JSON (sorted keys, no
    /// whitespace) and terminated by a newline, so both field order and
    /// formatting of the source documents are irrelevant.
    pub fn from_resources<'a, I>(resources: I) -> Self
    where
        I: IntoIterator<Item = &'a serde_json::Value>,
    {
        let mut hasher = Sha256::new();
        let mut buf = String::new();
        for resource in resources {
            buf.clear();
            write_canonical(&mut buf, resource);
            buf.push('\n');
            hasher.update(buf.as_bytes());
        }
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..TOKEN_BYTES]))
    }

    /// Wrap an existing token value, e.g. read back from a label.
    pub fn from_label(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GenerationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn write_canonical(out: &mut String, value: &serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                write_canonical(out, &map[key]);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        serde_json::Value::String(s) => write_string(out, s),
        serde_json::Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        serde_json::Value::Bool(b) => {
            let _ = write!(out, "{b}");
        }
        serde_json::Value::Null => out.push_str("null"),
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Split items into those stamped with `current` and stale ones.
///
/// Items without a token count as stale; callers decide whether unlabelled
/// items are eligible for deletion at all.
pub fn partition_by_token<I, F>(
    items: I,
    current: &GenerationToken,
    get_token: F,
) -> (Vec<I::Item>, Vec<I::Item>)
where
    I: IntoIterator,
    F: Fn(&I::Item) -> Option<&str>,
{
    let mut matching = Vec::new();
    let mut stale = Vec::new();

    for item in items {
        if get_token(&item) == Some(current.as_str()) {
            matching.push(item);
        } else {
            stale.push(item);
        }
    }

    (matching, stale)
}

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 2.0_f64.powi(attempt.min(30) as i32);
        let delay = (self.base.as_secs_f64() * exp).min(self.max.as_secs_f64());

        let jitter = if self.jitter > 0.0 {
            let unit: f64 = rand::random();
            delay * self.jitter * (unit * 2.0 - 1.0)
        } else {
            0.0
        };

        Duration::from_secs_f64((delay + jitter).clamp(0.0, self.max.as_secs_f64()))
    }
}

#[derive(Debug, Clone)]
struct FailureRecord {
    /// Source revision the failures were recorded against.
    revision: String,
    count: u32,
    first: Instant,
}

/// Retry budget for failed reconciliations.
///
/// Failures are counted per object and per source revision: a failure
/// against a new revision starts a fresh budget, so a fix pushed upstream is
/// always attempted even if the previous revision exhausted its retries.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Failures tolerated inside the window before the budget is exhausted.
    max_retries: u32,

    window: Duration,

    failures: BTreeMap<String, FailureRecord>,
}

impl RetryTracker {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure of `key` at `revision`.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, key: &str, revision: &str) -> bool {
        let now = Instant::now();
        let record = self
            .failures
            .entry(key.to_string())
            .or_insert_with(|| FailureRecord {
                revision: revision.to_string(),
                count: 0,
                first: now,
            });

        if record.revision != revision || now.duration_since(record.first) > self.window {
            record.revision = revision.to_string();
            record.count = 0;
            record.first = now;
        }

        record.count += 1;
        record.count > self.max_retries
    }

    /// Failures recorded inside the current window.
    pub fn failures(&self, key: &str) -> u32 {
        match self.failures.get(key) {
            Some(record) if record.first.elapsed() <= self.window => record.count,
            _ => 0,
        }
    }

    pub fn is_exhausted(&self, key: &str) -> bool {
        self.failures(key) > self.max_retries
    }

    /// Forget failures of `key`, e.g. after a successful attempt.
    pub fn clear(&mut self, key: &str) {
        self.failures.remove(key);
    }
}

/// Default retry limit per object before it is marked stalled.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes
