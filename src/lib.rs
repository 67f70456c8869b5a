//! A small and safe library for discovering network services via DNS-SD
//! (DNS-based Service Discovery), over either Multicast DNS or conventional
//! unicast DNS.
//!
//! This library creates one new thread to run a discovery engine, and exposes
//! an API that interacts with the engine via a
//! [`flume`](https://crates.io/crates/flume) channel. The channel supports
//! both `recv()` and `recv_async()`.
//!
//! A client declaring a query behaves like this:
//!```text
//!  Client       <channel>       discovery engine thread
//!    |                             | waits for the network link.
//!    |     --- AddQuery -->        |
//!    |     --- UpdateServices -->  | starts a PTR scan
//!    |                             | resolves instance A (TXT, SRV, A)
//!    |     <-- [A] --              |
//!    |                             | instance A says goodbye
//!    |     <-- [] --               |
//!    |          ...                |
//!```
//! All commands in the public API are sent to the engine using the unblocking
//! `try_send()` so that the caller can use it with both sync and async code,
//! with no dependency on any particular async runtime.
//!
//! # Usage
//!
//! The user starts by creating a [`ServiceDiscovery`] handle from a
//! [`LookupBackend`] (the DNS engine that owns the sockets) and a
//! [`LinkWatcher`] (usually [`SystemLink`]). Queries are declared with
//! [`add_query`](ServiceDiscovery::add_query) and applied with
//! [`update_services`](ServiceDiscovery::update_services); each query's
//! receiver then yields a fresh snapshot of resolved instances whenever the
//! filtered list changes.
//!
//! ```rust,ignore
//! use svc_discovery::{ServiceDiscovery, ServiceQuery};
//!
//! let sd = ServiceDiscovery::new(my_backend)?;
//! let (token, receiver) = sd.add_query(ServiceQuery::new("_http._tcp.local"))?;
//! sd.update_services()?;
//! sd.set_running(true)?;
//!
//! std::thread::spawn(move || {
//!     while let Ok(instances) = receiver.recv() {
//!         for item in &instances {
//!             println!("{} at {}:{}", item.name(), item.host_address(), item.port());
//!         }
//!     }
//! });
//! ```
//!
//! # Scope
//!
//! This implementation follows the discovery side of:
//! - mDNS:   [RFC 6762](https://tools.ietf.org/html/rfc6762)
//! - DNS-SD: [RFC 6763](https://tools.ietf.org/html/rfc6763)
//!
//! The wire-level DNS engine is not part of this crate: it is supplied by the
//! caller through the [`LookupBackend`] trait. This crate owns everything
//! above it: the PTR → TXT/SRV → A resolution pipeline, instance
//! deduplication and pruning, result filtering, and the network-link
//! lifecycle that tears the resolver down and rebuilds it as connectivity
//! comes and goes. Publishing (announcing) local services is out of scope.

#![forbid(unsafe_code)]
#![allow(clippy::single_component_path_imports)]

// log for logging (optional).
#[cfg(feature = "logging")]
use log;

#[cfg(not(feature = "logging"))]
#[macro_use]
mod log {
    macro_rules! trace    ( ($($tt:tt)*) => {{}} );
    macro_rules! debug    ( ($($tt:tt)*) => {{}} );
    macro_rules! info     ( ($($tt:tt)*) => {{}} );
    macro_rules! warn     ( ($($tt:tt)*) => {{}} );
    macro_rules! error    ( ($($tt:tt)*) => {{}} );
}

mod discovery;
mod error;
mod filter;
mod instance;
mod lookup;
mod netlink;
mod registry;

pub use discovery::{
    DiscoveryEvent, EngineState, EngineStatus, Metrics, QueryToken, ServiceDiscovery, ServiceQuery,
    UNICAST_ERROR_THRESHOLD_DEFAULT, UNICAST_LOOKUP_INTERVAL_DEFAULT,
};
pub use error::{Error, Result};
pub use filter::Filter;
pub use instance::ServiceInstance;
pub use lookup::{
    AnswerRecord, LookupBackend, LookupError, LookupEvent, LookupMode, NameServer, QueryId,
    RecordType, DNS_PORT,
};
pub use netlink::{Bearer, LinkConfig, LinkEvent, LinkWatcher, SystemLink};

/// A handler to receive messages from [ServiceDiscovery]. Re-export from `flume` crate.
pub use flume::Receiver;
