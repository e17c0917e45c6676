//! Structured scan events for dashboards and log stores.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Debug;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Discovery,
    Evaluation,
    Quote,
    CycleSummary,
    Error,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Evaluation => "evaluation",
            Self::Quote => "quote",
            Self::CycleSummary => "cycle_summary",
            Self::Error => "error",
        }
    }
}

/// One log entry of a scan cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanEvent {
    pub level: EventLevel,
    pub message: String,
    pub category: EventCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ScanEvent {
    pub fn new(level: EventLevel, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            category,
            protocol: None,
            timestamp: Utc::now(),
        }
    }

    pub fn info(category: EventCategory, message: impl Into<String>) -> Self {
        Self::new(EventLevel::Info, category, message)
    }

    /// An `error`-category event.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventLevel::Error, EventCategory::Error, message)
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }
}

/// Receiver of scan events. Must not block.
pub trait EventSink: Send + Sync + Debug {
    fn emit(&self, event: ScanEvent);
}

/// Emits events as `tracing` records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: ScanEvent) {
        let category = event.category.as_str();
        let protocol = event.protocol.as_deref().unwrap_or("-");
        match event.level {
            EventLevel::Debug => debug!(category, protocol, "{}", event.message),
            EventLevel::Info => info!(category, protocol, "{}", event.message),
            EventLevel::Warn => warn!(category, protocol, "{}", event.message),
            EventLevel::Error => error!(category, protocol, "{}", event.message),
        }
    }
}

/// Forwards events over a bounded channel. Events are dropped when the
/// consumer falls behind.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::Sender<ScanEvent>,
}

impl ChannelEventSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ScanEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: ScanEvent) {
        if let Err(e) = self.tx.try_send(event) {
            debug!(error = %e, "Dropping scan event");
        }
    }
}

/// Sends every event to each inner sink.
#[derive(Debug, Clone, Default)]
pub struct FanoutEventSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new(sinks: Vec<std::sync::Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutEventSink {
    fn emit(&self, event: ScanEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}
