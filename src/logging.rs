use chrono::{DateTime, Utc};
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::config::ProbeFilterConfig;

const MAX_LOG_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            component: component.into(),
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, ctx: serde_json::Value) -> Self {
        self.context = Some(ctx);
        self
    }
}

/// Suppresses scanner noise: any log line matching the compiled set is
/// dropped at emit time. The set is rebuilt wholesale on config change.
#[derive(Debug)]
pub struct ProbeLogFilter {
    patterns: RegexSet,
}

const DEFAULT_LOG_PATTERNS: &[&str] = &[
    r"GET / HTTP",
    r"GET /favicon\.ico",
    r"GET /\.well-known/",
    r"GET /locales/",
    r"UNKNOWN / HTTP",
    r"CensysInspect",
    r"Go-http-client",
    r"BadHttpMessage",
    r"BadStatusLine",
    r"Invalid method encountered",
    r"\\x16\\x03\\x01",
];

const DEFAULT_IP_PATTERNS: &[&str] = &[
    r"193\.34\.212\.110",
    r"185\.191\.127\.222",
    r"162\.142\.125\.124",
    r"194\.62\.248\.69",
    r"209\.38\.219\.203",
];

impl ProbeLogFilter {
    pub fn from_config(config: &ProbeFilterConfig) -> Self {
        let mut patterns: Vec<String> = Vec::new();

        if !config.disable_default_patterns {
            patterns.extend(DEFAULT_LOG_PATTERNS.iter().map(|p| (*p).to_string()));
        }
        if !config.disable_default_ip_patterns {
            patterns.extend(DEFAULT_IP_PATTERNS.iter().map(|p| (*p).to_string()));
        }
        patterns.extend(config.patterns.iter().cloned());
        patterns.extend(config.ip_patterns.iter().cloned());
        patterns.extend(config.custom_patterns.iter().cloned());
        patterns.extend(config.custom_ip_patterns.iter().cloned());

        // An invalid user pattern disables nothing but itself
        let patterns = RegexSet::new(
            patterns
                .iter()
                .filter(|p| regex::Regex::new(p).is_ok())
                .map(String::as_str),
        )
        .unwrap_or_else(|_| RegexSet::empty());

        Self { patterns }
    }

    pub fn suppresses(&self, message: &str) -> bool {
        self.patterns.is_match(message)
    }
}

impl Default for ProbeLogFilter {
    fn default() -> Self {
        Self::from_config(&ProbeFilterConfig::default())
    }
}

/// Ring-buffer logger that persists entries to a JSONL file.
pub struct Logger {
    entries: VecDeque<LogEntry>,
    filter: ProbeLogFilter,
    writer: Option<BufWriter<File>>,
}

impl Logger {
    pub fn new(file_path: impl AsRef<Path>, filter: ProbeLogFilter) -> std::io::Result<Self> {
        let file_path = file_path.as_ref().to_path_buf();

        if let Some(parent) = file_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)?;
        let writer = BufWriter::new(file);

        Ok(Self {
            entries: VecDeque::with_capacity(MAX_LOG_ENTRIES),
            filter,
            writer: Some(writer),
        })
    }

    pub fn log(&mut self, entry: LogEntry) {
        if self.filter.suppresses(&entry.message) {
            return;
        }
        if let Some(ref mut writer) = self.writer {
            if let Ok(json) = serde_json::to_string(&entry) {
                let _ = writeln!(writer, "{}", json);
                let _ = writer.flush();
            }
        }
        if self.entries.len() >= MAX_LOG_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn set_filter(&mut self, filter: ProbeLogFilter) {
        self.filter = filter;
    }
}

/// Cloneable handle shared across tasks. Emission never blocks on I/O
/// visible to a request handler beyond a buffered line write.
#[derive(Clone)]
pub struct SharedLogger(Arc<Mutex<Logger>>);

impl SharedLogger {
    pub fn new(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        Self::with_filter(file_path, ProbeLogFilter::default())
    }

    pub fn with_filter(
        file_path: impl AsRef<Path>,
        filter: ProbeLogFilter,
    ) -> std::io::Result<Self> {
        Ok(Self(Arc::new(Mutex::new(Logger::new(file_path, filter)?))))
    }

    pub fn log(&self, entry: LogEntry) {
        if let Ok(mut logger) = self.0.lock() {
            logger.log(entry);
        }
    }

    pub fn info(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Info, component, message));
    }

    pub fn warn(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Warn, component, message));
    }

    pub fn error(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Error, component, message));
    }

    pub fn debug(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Debug, component, message));
    }

    pub fn log_with_context(
        &self,
        level: LogLevel,
        component: impl Into<String>,
        message: impl Into<String>,
        context: serde_json::Value,
    ) {
        self.log(LogEntry::new(level, component, message).with_context(context));
    }

    /// Swap the probe filter in place (config reload).
    pub fn set_filter(&self, filter: ProbeLogFilter) {
        if let Ok(mut logger) = self.0.lock() {
            logger.set_filter(filter);
        }
    }

    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.0.lock().map(|l| l.recent(limit)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_probe_filter_suppresses_scanner_lines() {
        let filter = ProbeLogFilter::default();
        assert!(filter.suppresses("GET /favicon.ico HTTP/1.1 404"));
        assert!(filter.suppresses("request from 185.191.127.222 rejected"));
        assert!(filter.suppresses("CensysInspect/1.1 probing"));
        assert!(!filter.suppresses("POST /api.openai.com/v1/chat/completions 200"));
    }

    #[test]
    fn test_disable_defaults_and_custom_patterns() {
        let config = ProbeFilterConfig {
            disable_default_patterns: true,
            disable_default_ip_patterns: true,
            custom_patterns: vec!["internal-scanner".to_string()],
            ..Default::default()
        };
        let filter = ProbeLogFilter::from_config(&config);
        assert!(!filter.suppresses("GET /favicon.ico HTTP/1.1"));
        assert!(filter.suppresses("internal-scanner sweep started"));
    }

    #[test]
    fn test_filtered_entries_never_reach_the_buffer() {
        let dir = tempdir().unwrap();
        let logger = SharedLogger::new(dir.path().join("proxy.log")).unwrap();

        logger.info("access", "GET /favicon.ico HTTP/1.1");
        logger.info("access", "POST /api.openai.com/v1/embeddings 200");

        let recent = logger.recent(10);
        assert_eq!(recent.len(), 1);
        assert!(recent[0].message.contains("/v1/embeddings"));
    }
}
