//! Observable connection state.
//!
//! The connection kernel owns a `watch::Sender<ConnectionState>`; the broker
//! handle, the availability supervisor and the readiness probe all read the
//! same channel.

use std::fmt;

/// Lifecycle of one broker connection.
///
/// ```text
/// Connecting -> Connected -> Disconnected -> Reconnecting -> Connecting ...
///                    \
///                     -> Closed   (client-initiated disconnect, terminal)
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// CONNECT sent, waiting for CONNACK.
    Connecting,

    Connected,

    /// Connection lost. Carries the reason.
    Disconnected(String),

    /// Sleeping before the next attempt; seconds until it starts.
    Reconnecting(f64),

    /// Disconnected on request. No further reconnects happen.
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnected(_) => "Disconnected",
            ConnectionState::Reconnecting(_) => "Reconnecting",
            ConnectionState::Closed => "Closed",
        }
    }

    pub fn details(&self) -> String {
        match self {
            ConnectionState::Disconnected(reason) => reason.clone(),
            ConnectionState::Reconnecting(seconds) => format!("in {seconds} seconds"),
            _ => String::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting(_)
        )
    }

    /// True once the kernel has stopped for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())?;
        let details = self.details();
        if !details.is_empty() {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}
