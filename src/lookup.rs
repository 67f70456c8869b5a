//! The lookup backend: the capability set the engine needs from a DNS engine.
//!
//! The engine does not originate DNS packets itself. Everything at the wire
//! level, multicast group membership included, lives behind [`LookupBackend`].
//! The backend delivers answers and errors asynchronously over a `flume`
//! channel handed to it at [`init`](LookupBackend::init) time; the engine
//! thread drains that channel in its run loop, so backend implementations may
//! send from any thread.

use crate::error::{Error, Result};
use flume::Sender;
use std::fmt;
use std::net::IpAddr;

/// Identifier of one outstanding query in the backend.
///
/// Allocated by [`LookupBackend::query_start`] and unique among the live
/// queries of one backend instance.
pub type QueryId = u32;

/// How lookups are performed on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LookupMode {
    /// Multicast DNS (mDNS) on the link-local group. The default.
    #[default]
    Multicast,

    /// Conventional unicast DNS against configured name servers.
    Unicast,
}

impl fmt::Display for LookupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Multicast => write!(f, "multicast"),
            Self::Unicast => write!(f, "unicast"),
        }
    }
}

/// The DNS resource record types used by service discovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordType {
    /// PTR record: service type to instance names.
    Ptr,
    /// TXT record: instance attributes.
    Txt,
    /// SRV record: instance target host and port.
    Srv,
    /// A record: IPv4 address.
    A,
    /// AAAA record: IPv6 address.
    Aaaa,
}

impl RecordType {
    /// The standard RFC 1035 / RFC 3596 type code.
    pub const fn code(self) -> u16 {
        match self {
            Self::A => 1,
            Self::Ptr => 12,
            Self::Txt => 16,
            Self::Aaaa => 28,
            Self::Srv => 33,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ptr => write!(f, "PTR"),
            Self::Txt => write!(f, "TXT"),
            Self::Srv => write!(f, "SRV"),
            Self::A => write!(f, "A"),
            Self::Aaaa => write!(f, "AAAA"),
        }
    }
}

/// One name server used for unicast lookups.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameServer {
    address: IpAddr,
    port: u16,
}

/// The standard DNS port.
pub const DNS_PORT: u16 = 53;

impl NameServer {
    pub const fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    /// Parses a textual host address, using [`DNS_PORT`] when `port` is `None`.
    pub fn parse(host: &str, port: Option<u16>) -> Result<Self> {
        let address: IpAddr = host
            .parse()
            .map_err(|e| Error::ParseAddr(format!("{}: {}", host, e)))?;
        Ok(Self {
            address,
            port: port.unwrap_or(DNS_PORT),
        })
    }

    pub const fn address(&self) -> IpAddr {
        self.address
    }

    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for NameServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// One answer record delivered by the backend.
///
/// The payload fields are populated per `record_type`: `texts` for TXT,
/// `name` and `port` for SRV, `address` for A/AAAA. For PTR, `name` is the
/// record target, i.e. the full service instance name.
#[derive(Clone, Debug)]
pub struct AnswerRecord {
    /// The owner name the record was returned for.
    pub owner: String,

    /// The record target: instance fullname (PTR) or target host (SRV).
    pub name: String,

    pub record_type: RecordType,

    /// Remaining time-to-live in seconds. Zero withdraws the record.
    pub ttl: u32,

    /// TXT strings, in answer order.
    pub texts: Vec<String>,

    /// SRV target port.
    pub port: u16,

    /// A/AAAA address.
    pub address: Option<IpAddr>,
}

impl AnswerRecord {
    pub fn ptr(owner: &str, target: &str, ttl: u32) -> Self {
        Self {
            owner: owner.to_string(),
            name: target.to_string(),
            record_type: RecordType::Ptr,
            ttl,
            texts: Vec::new(),
            port: 0,
            address: None,
        }
    }

    pub fn txt(owner: &str, ttl: u32, texts: &[&str]) -> Self {
        Self {
            owner: owner.to_string(),
            name: String::new(),
            record_type: RecordType::Txt,
            ttl,
            texts: texts.iter().map(|t| t.to_string()).collect(),
            port: 0,
            address: None,
        }
    }

    pub fn srv(owner: &str, ttl: u32, target: &str, port: u16) -> Self {
        Self {
            owner: owner.to_string(),
            name: target.to_string(),
            record_type: RecordType::Srv,
            ttl,
            texts: Vec::new(),
            port,
            address: None,
        }
    }

    pub fn addr(owner: &str, ttl: u32, address: IpAddr) -> Self {
        let record_type = if address.is_ipv4() {
            RecordType::A
        } else {
            RecordType::Aaaa
        };
        Self {
            owner: owner.to_string(),
            name: String::new(),
            record_type,
            ttl,
            texts: Vec::new(),
            port: 0,
            address: Some(address),
        }
    }
}

/// Error kinds reported by the backend for one query.
///
/// These are diagnostic: the engine logs them and leaves its tables alone.
/// Stale entries age out via the unicast purge pass instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupError {
    Generic,
    NxDomain,
    Timeout,
    Conflict,
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generic => write!(f, "Generic"),
            Self::NxDomain => write!(f, "NXDomain"),
            Self::Timeout => write!(f, "Timeout"),
            Self::Conflict => write!(f, "Conflict"),
        }
    }
}

/// Asynchronous deliveries from the backend to the engine.
#[derive(Clone, Debug)]
pub enum LookupEvent {
    /// Answer records arrived for a query.
    Results {
        query_id: QueryId,
        answers: Vec<AnswerRecord>,
    },

    /// A query failed. Diagnostic only.
    Failure {
        query_id: QueryId,
        error: LookupError,
    },
}

/// The DNS engine the resolver drives.
///
/// A single backend instance is reused across init/shutdown cycles: a
/// re-init after [`shutdown`](LookupBackend::shutdown) must behave like a
/// fresh backend. On shutdown the backend must drop the event sender it was
/// given, so that results still in flight die with the channel.
pub trait LookupBackend: Send {
    /// Brings the backend up in `mode`, bound to `bind_addr`.
    ///
    /// In multicast mode the backend joins the mDNS group; in unicast mode it
    /// only binds. Events for all queries of this init cycle are delivered
    /// through `events`.
    fn init(
        &mut self,
        mode: LookupMode,
        bind_addr: IpAddr,
        events: Sender<LookupEvent>,
    ) -> Result<()>;

    /// Tears the backend down, cancelling all live queries.
    fn shutdown(&mut self);

    /// Replaces the name servers used for unicast lookups.
    fn set_name_servers(&mut self, servers: &[NameServer]);

    /// Starts a query for `name` and returns its id.
    fn query_start(&mut self, name: &str, record_type: RecordType) -> QueryId;

    /// Cancels a query. Unknown ids are a no-op.
    fn query_cancel(&mut self, query_id: QueryId);

    /// The name servers configured on the host, used as a fallback when the
    /// caller supplied none.
    fn system_name_servers(&self) -> Vec<NameServer>;
}
