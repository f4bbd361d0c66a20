//! Event system for UI decoupling.
//!
//! The session reports everything operator-visible through these events;
//! CLI/GUI layers subscribe without coupling to the lifecycle logic. The
//! log channel is append-only and never drives control flow.

use std::fmt;

use crate::state::ConnectionState;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Events emitted by the DFU session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Lifecycle transition.
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Status line text; empty string clears it.
    Status(String),
    /// The single dedicated error banner was populated.
    Banner(String),
    /// The error banner was cleared.
    BannerCleared,
    /// dfu-util style identity summary of the connected interface.
    DeviceSummary(String),
    /// Capabilities summary after a successful probe.
    Capabilities(String),
    /// Whether the firmware picker is usable (DFU-mode interfaces only).
    FirmwarePicker { enabled: bool },
    /// Transfer progress; consumers derive percent as
    /// `done * 100 / total`.
    Progress { done: u64, total: u64 },
    /// Download finished and the session closed itself.
    DownloadComplete,
    /// Log message.
    Log { level: LogLevel, message: String },
}

/// Observer trait for receiving session events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait SessionObserver {
    fn on_event(&self, event: &SessionEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl SessionObserver for NullObserver {
    fn on_event(&self, _event: &SessionEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn on_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::StateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "State changed");
            }
            SessionEvent::Status(text) if text.is_empty() => {}
            SessionEvent::Status(text) => {
                tracing::info!(status = %text, "Status");
            }
            SessionEvent::Banner(message) => {
                tracing::error!("{}", message);
            }
            SessionEvent::BannerCleared => {}
            SessionEvent::DeviceSummary(summary) => {
                tracing::info!("{}", summary);
            }
            SessionEvent::Capabilities(summary) => {
                tracing::info!("{}", summary);
            }
            SessionEvent::FirmwarePicker { enabled } => {
                tracing::debug!(enabled = enabled, "Firmware picker");
            }
            SessionEvent::Progress { done, total } => {
                let pct = if *total > 0 { done * 100 / total } else { 0 };
                tracing::debug!(progress = %format!("{}%", pct), "Progress");
            }
            SessionEvent::DownloadComplete => {
                tracing::info!("Done!");
            }
            SessionEvent::Log { level, message } => match level {
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warning"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}
