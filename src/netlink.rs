//! The network link the engine watches.
//!
//! The engine brings its resolver up only while a usable link exists, and
//! tears it down when the link goes away. What "the link" is stays behind the
//! [`LinkWatcher`] trait: configurations are enumerated by bearer type, and a
//! session on one configuration reports open/close through a channel.
//! [`SystemLink`] is the default implementation, classifying host interfaces
//! by name.

use flume::Sender;
use if_addrs::get_if_addrs;
use std::fmt;

/// The link type of a network configuration.
///
/// Discovery sessions are only opened on [`Ethernet`](Bearer::Ethernet),
/// [`Wlan`](Bearer::Wlan) and [`Unknown`](Bearer::Unknown) bearers; unknown
/// is usually ethernet or some other local network. Cellular links are never
/// used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bearer {
    Ethernet,
    Wlan,
    Cellular,
    Unknown,
}

impl fmt::Display for Bearer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ethernet => write!(f, "ethernet"),
            Self::Wlan => write!(f, "wlan"),
            Self::Cellular => write!(f, "cellular"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// One network configuration a session can be opened on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkConfig {
    name: String,
    bearer: Bearer,
}

impl LinkConfig {
    pub fn new(name: &str, bearer: Bearer) -> Self {
        Self {
            name: name.to_string(),
            bearer,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bearer(&self) -> Bearer {
        self.bearer
    }
}

/// Signals from an open session.
#[derive(Clone, Debug)]
pub enum LinkEvent {
    /// The session is open; the network is usable.
    Opened,

    /// The link went away.
    Closed,

    /// A session error. Diagnostic only.
    Error(String),
}

/// Watches network configurations and carries at most one open session.
///
/// `poll` is called from the engine's periodic network check (every 3
/// seconds); implementations use it to notice a lost link and emit
/// [`LinkEvent::Closed`]. Opening a session while one is already open
/// replaces it.
pub trait LinkWatcher: Send {
    /// Enumerates the currently available configurations.
    fn configurations(&mut self) -> Vec<LinkConfig>;

    /// Opens a session on `config`; signals are delivered through `events`.
    fn open_session(&mut self, config: &LinkConfig, events: Sender<LinkEvent>);

    /// Closes the open session, if any.
    fn close_session(&mut self);

    /// Periodic liveness check driven by the engine.
    fn poll(&mut self) {}
}

/// Default [`LinkWatcher`] backed by the host's interface list.
///
/// A session is simply a claim on one interface: it opens immediately if the
/// interface exists and closes when a later poll no longer finds it.
pub struct SystemLink {
    session: Option<(String, Sender<LinkEvent>)>,
}

impl SystemLink {
    pub fn new() -> Self {
        Self { session: None }
    }

    fn interface_names() -> Vec<String> {
        let mut names: Vec<String> = get_if_addrs()
            .unwrap_or_default()
            .into_iter()
            .filter(|intf| !intf.is_loopback())
            .map(|intf| intf.name)
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

impl Default for SystemLink {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkWatcher for SystemLink {
    fn configurations(&mut self) -> Vec<LinkConfig> {
        Self::interface_names()
            .iter()
            .map(|name| LinkConfig::new(name, classify_interface(name)))
            .collect()
    }

    fn open_session(&mut self, config: &LinkConfig, events: Sender<LinkEvent>) {
        if Self::interface_names().iter().any(|n| n == config.name()) {
            self.session = Some((config.name().to_string(), events.clone()));
            let _ = events.send(LinkEvent::Opened);
        } else {
            let _ = events.send(LinkEvent::Error(format!(
                "interface {} is gone",
                config.name()
            )));
        }
    }

    fn close_session(&mut self) {
        if let Some((_, events)) = self.session.take() {
            let _ = events.send(LinkEvent::Closed);
        }
    }

    fn poll(&mut self) {
        let Some((name, _)) = &self.session else {
            return;
        };

        if !Self::interface_names().iter().any(|n| n == name) {
            if let Some((_, events)) = self.session.take() {
                let _ = events.send(LinkEvent::Closed);
            }
        }
    }
}

/// Guesses the bearer of an interface from its name.
fn classify_interface(name: &str) -> Bearer {
    let lower = name.to_ascii_lowercase();
    if lower.starts_with("wl") || lower.starts_with("wifi") || lower.starts_with("ath") {
        Bearer::Wlan
    } else if lower.starts_with("eth") || lower.starts_with("en") || lower.starts_with("em") {
        Bearer::Ethernet
    } else if lower.starts_with("wwan") || lower.starts_with("rmnet") || lower.starts_with("ppp") {
        Bearer::Cellular
    } else {
        Bearer::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_classification() {
        assert_eq!(classify_interface("eth0"), Bearer::Ethernet);
        assert_eq!(classify_interface("en0"), Bearer::Ethernet);
        assert_eq!(classify_interface("wlan0"), Bearer::Wlan);
        assert_eq!(classify_interface("wlp3s0"), Bearer::Wlan);
        assert_eq!(classify_interface("wwan0"), Bearer::Cellular);
        assert_eq!(classify_interface("ppp0"), Bearer::Cellular);
        assert_eq!(classify_interface("br-lan"), Bearer::Unknown);
    }

    #[test]
    fn open_session_on_missing_interface_reports_error() {
        let mut link = SystemLink::new();
        let (tx, rx) = flume::unbounded();
        let config = LinkConfig::new("no-such-interface-0", Bearer::Ethernet);
        link.open_session(&config, tx);

        match rx.try_recv() {
            Ok(LinkEvent::Error(_)) => {}
            other => panic!("expected session error, got {:?}", other),
        }
    }

    #[test]
    fn close_without_session_is_a_noop() {
        let mut link = SystemLink::new();
        link.close_session();
        link.poll();
    }
}
