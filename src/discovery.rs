//! The discovery engine and its public facade.
//!
//! How DNS-based Service Discovery works in a nutshell:
//!
//! A client discovers the instances of a service type with a PTR query for
//! `<Service>.<Domain>`, which returns one name of the form
//! `<Instance>.<Service>.<Domain>` per instance. The instance is then
//! described by a SRV record (target host and port) and a TXT record
//! (attributes) of that name, and the target host finally resolves through an
//! address record. See RFC 6763 section 4.
//!
//! The engine runs this pipeline continuously for every declared service
//! type, correlating the in-flight sub-queries per instance, and projects the
//! fully resolved instances through the user-declared queries. A network
//! watchdog brings the lookup backend up when a usable link appears and tears
//! it down again on link loss or a lookup-mode change.
//!
//! Some naming conventions in this source code:
//!
//! `service_type` refers to the full PTR query name, e.g.
//! `_my-service._sub._http._tcp.local`. It is opaque to the engine.
//!
//! `scan` refers to the long-running per-service-type query; `sub-query`
//! refers to a TXT/SRV/A/AAAA query resolving one instance. A scan is never
//! cancelled by one of its results; sub-queries are one-shot.

#[cfg(feature = "logging")]
use crate::log::{debug, trace, warn};
use crate::{
    error::{Error, Result},
    filter::Filter,
    instance::{InstanceEntry, ServiceInstance},
    lookup::{
        AnswerRecord, LookupBackend, LookupEvent, LookupMode, NameServer, QueryId, RecordType,
    },
    netlink::{Bearer, LinkEvent, LinkWatcher, SystemLink},
    registry::{InstanceKey, QueryRegistry},
};
use flume::{bounded, unbounded, Receiver, Selector, Sender, TrySendError};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    net::{IpAddr, Ipv4Addr},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// A simple macro to report all kinds of errors.
macro_rules! e_fmt {
  ($($arg:tt)+) => {
      Error::Msg(format!($($arg)+))
  };
}

/// The default interval between unicast lookup refreshes, in milliseconds.
pub const UNICAST_LOOKUP_INTERVAL_DEFAULT: u64 = 5000;

/// The default number of missed refresh cycles after which a unicast
/// instance is dropped.
pub const UNICAST_ERROR_THRESHOLD_DEFAULT: u32 = 2;

/// Interval of the network watchdog.
const NET_CHECK_INTERVAL_MILLIS: u64 = 3000;

/// Status code for the discovery engine.
#[derive(Debug, PartialEq, Clone, Eq)]
#[non_exhaustive]
pub enum EngineStatus {
    /// The engine is running as normal.
    Running,

    /// The engine has been shut down.
    Shutdown,
}

/// Different counters included in the metrics.
#[derive(Hash, Eq, PartialEq)]
enum Counter {
    ScanStart,
    ScanRefresh,
    Subquery,
    AnswerIngested,
    AnswerDiscarded,
    InstancePurged,
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ScanStart => write!(f, "scan-start"),
            Self::ScanRefresh => write!(f, "scan-refresh"),
            Self::Subquery => write!(f, "subquery"),
            Self::AnswerIngested => write!(f, "answer-ingested"),
            Self::AnswerDiscarded => write!(f, "answer-discarded"),
            Self::InstancePurged => write!(f, "instance-purged"),
        }
    }
}

/// The metrics is a HashMap of (name_key, i64_value).
/// The main purpose is to help monitoring the engine's query traffic.
pub type Metrics = HashMap<String, i64>;

/// Identifies one declared query on a [`ServiceDiscovery`] handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueryToken(u32);

/// A user-declared query: a service type plus an optional secondary filter.
///
/// Declared queries take effect on the next
/// [`update_services`](ServiceDiscovery::update_services) call.
#[derive(Clone, Debug)]
pub struct ServiceQuery {
    service_type: String,
    record_type: RecordType,
    filter: Filter,
}

impl ServiceQuery {
    /// A discovery query for a DNS-SD service type, e.g. `_http._tcp.local`.
    pub fn new(service_type: &str) -> Self {
        Self {
            service_type: service_type.to_string(),
            record_type: RecordType::Ptr,
            filter: Filter::default(),
        }
    }

    /// A plain host name lookup.
    ///
    /// The engine scans address records for `host_name` directly and
    /// surfaces a single entry named after the host, carrying the resolved
    /// address. Results bypass all filtering.
    pub fn host_lookup(host_name: &str) -> Self {
        Self {
            service_type: host_name.to_string(),
            record_type: RecordType::A,
            filter: Filter::default(),
        }
    }

    /// Attaches a secondary filter, applied in conjunction with the
    /// engine-wide filter.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }
}

/// Observable engine changes, received via [`ServiceDiscovery::monitor`].
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum DiscoveryEvent {
    RunningChanged(bool),
    NetworkReadyChanged(bool),
    LookupReadyChanged(bool),
    LookupModeChanged(LookupMode),
    FilterChanged,
    UnicastLookupIntervalChanged(u64),
    UnicastErrorThresholdChanged(u32),
    NameServersChanged(Vec<NameServer>),

    /// The engine encountered an error. Diagnostic only.
    Error(Error),
}

/// A snapshot of the engine's observable properties.
#[derive(Clone, Debug)]
pub struct EngineState {
    pub running: bool,
    pub network_ready: bool,
    pub lookup_ready: bool,
    pub lookup_mode: LookupMode,
    pub unicast_lookup_interval: u64,
    pub unicast_error_threshold: u32,
    pub name_servers: Vec<NameServer>,
}

/// Commands supported by the engine.
enum Command {
    SetRunning(bool),

    SetLookupMode(LookupMode),

    /// Replace the engine-wide primary filter.
    SetFilter(Filter),

    /// Re-project all instance tables after an in-place filter edit.
    UpdateFilter,

    /// Declare a query. Takes effect on the next `UpdateServices`.
    AddQuery(QueryToken, ServiceQuery, Sender<Vec<ServiceInstance>>),

    /// Revoke a query. Takes effect on the next `UpdateServices`.
    RemoveQuery(QueryToken),

    /// Reconcile scans with the declared queries.
    UpdateServices,

    SetUnicastLookupInterval(u64),

    SetUnicastErrorThreshold(u32),

    AddNameServer(NameServer),

    RemoveNameServer(usize),

    ClearNameServers,

    /// Push the effective name server list to the backend.
    UpdateNameServers,

    /// Monitor observable property changes.
    Monitor(Sender<DiscoveryEvent>),

    GetState(Sender<EngineState>),

    /// Read the current values of the counters.
    GetMetrics(Sender<Metrics>),

    GetStatus(Sender<EngineStatus>),

    Exit(Sender<EngineStatus>),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetRunning(_) => write!(f, "Command SetRunning"),
            Self::SetLookupMode(_) => write!(f, "Command SetLookupMode"),
            Self::SetFilter(_) => write!(f, "Command SetFilter"),
            Self::UpdateFilter => write!(f, "Command UpdateFilter"),
            Self::AddQuery(_, _, _) => write!(f, "Command AddQuery"),
            Self::RemoveQuery(_) => write!(f, "Command RemoveQuery"),
            Self::UpdateServices => write!(f, "Command UpdateServices"),
            Self::SetUnicastLookupInterval(_) => write!(f, "Command SetUnicastLookupInterval"),
            Self::SetUnicastErrorThreshold(_) => write!(f, "Command SetUnicastErrorThreshold"),
            Self::AddNameServer(_) => write!(f, "Command AddNameServer"),
            Self::RemoveNameServer(_) => write!(f, "Command RemoveNameServer"),
            Self::ClearNameServers => write!(f, "Command ClearNameServers"),
            Self::UpdateNameServers => write!(f, "Command UpdateNameServers"),
            Self::Monitor(_) => write!(f, "Command Monitor"),
            Self::GetState(_) => write!(f, "Command GetState"),
            Self::GetMetrics(_) => write!(f, "Command GetMetrics"),
            Self::GetStatus(_) => write!(f, "Command GetStatus"),
            Self::Exit(_) => write!(f, "Command Exit"),
        }
    }
}

/// A discovery engine on its own thread.
///
/// This struct provides a handle and an API to the engine. It is cloneable.
#[derive(Clone)]
pub struct ServiceDiscovery {
    /// Sender handle of the channel to the engine.
    sender: Sender<Command>,

    /// Allocator for query tokens.
    next_token: Arc<AtomicU32>,
}

impl ServiceDiscovery {
    /// Creates a new engine watching the host's network interfaces and spawns
    /// a thread to run it.
    ///
    /// The engine starts in multicast mode with `running == false`; the
    /// network watchdog begins immediately.
    pub fn new(backend: Box<dyn LookupBackend>) -> Result<Self> {
        Self::with_link(backend, Box::new(SystemLink::new()))
    }

    /// Creates a new engine with an explicit link watcher.
    pub fn with_link(backend: Box<dyn LookupBackend>, link: Box<dyn LinkWatcher>) -> Result<Self> {
        let (sender, receiver) = bounded(100);
        let engine = Engine::new(backend, link);

        thread::Builder::new()
            .name("svc-discovery".to_string())
            .spawn(move || Self::engine_thread(engine, receiver))
            .map_err(|e| e_fmt!("thread builder failed to spawn: {}", e))?;

        Ok(Self {
            sender,
            next_token: Arc::new(AtomicU32::new(1)),
        })
    }

    /// Sends `cmd` to the engine via its channel.
    fn send_cmd(&self, cmd: Command) -> Result<()> {
        self.sender.try_send(cmd).map_err(|e| match e {
            TrySendError::Full(_) => Error::Again,
            e => e_fmt!("flume::channel::send failed: {}", e),
        })
    }

    /// Starts or stops the engine's queries.
    ///
    /// Setting `running` to false empties every declared query's list. The
    /// flag has no visible effect until the network link and the lookup
    /// backend are ready.
    pub fn set_running(&self, running: bool) -> Result<()> {
        self.send_cmd(Command::SetRunning(running))
    }

    /// Switches between multicast and unicast lookups.
    ///
    /// If the backend is up it is torn down and re-initialized in the new
    /// mode; all discovered instances are dropped in the process and the
    /// prior running state resumes against the new backend.
    pub fn set_lookup_mode(&self, mode: LookupMode) -> Result<()> {
        self.send_cmd(Command::SetLookupMode(mode))
    }

    /// Replaces the engine-wide primary filter and re-projects all results.
    pub fn set_filter(&self, filter: Filter) -> Result<()> {
        self.send_cmd(Command::SetFilter(filter))
    }

    /// Re-projects all results against the current filters.
    pub fn update_filter(&self) -> Result<()> {
        self.send_cmd(Command::UpdateFilter)
    }

    /// Declares a query for a service type.
    ///
    /// Returns a token identifying the query and a channel `Receiver`
    /// yielding a fresh snapshot of the resolved instances whenever the
    /// filtered list changes. The caller can use `.recv_async().await` in an
    /// async environment or `.recv()` in a sync environment.
    ///
    /// The query only takes effect once [`update_services`] is called.
    ///
    /// [`update_services`]: ServiceDiscovery::update_services
    pub fn add_query(
        &self,
        query: ServiceQuery,
    ) -> Result<(QueryToken, Receiver<Vec<ServiceInstance>>)> {
        let token = QueryToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let (resp_s, resp_r) = unbounded();
        self.send_cmd(Command::AddQuery(token, query, resp_s))?;
        Ok((token, resp_r))
    }

    /// Revokes a declared query. Takes effect on the next
    /// [`update_services`](ServiceDiscovery::update_services) call.
    pub fn remove_query(&self, token: QueryToken) -> Result<()> {
        self.send_cmd(Command::RemoveQuery(token))
    }

    /// Reconciles the running scans with the declared queries and refills
    /// every query with a freshly filtered snapshot.
    ///
    /// Needs to be called after adding or removing queries.
    pub fn update_services(&self) -> Result<()> {
        self.send_cmd(Command::UpdateServices)
    }

    /// Changes the interval between unicast lookup refreshes, in
    /// milliseconds. A running refresh timer is re-armed.
    pub fn set_unicast_lookup_interval(&self, millis: u64) -> Result<()> {
        self.send_cmd(Command::SetUnicastLookupInterval(millis))
    }

    /// Changes how many missed unicast refresh cycles remove an instance.
    pub fn set_unicast_error_threshold(&self, threshold: u32) -> Result<()> {
        self.send_cmd(Command::SetUnicastErrorThreshold(threshold))
    }

    /// Appends a name server for unicast lookups and applies the new list.
    pub fn add_name_server(&self, name_server: NameServer) -> Result<()> {
        self.send_cmd(Command::AddNameServer(name_server))
    }

    /// Removes the name server at `index` and applies the new list.
    pub fn remove_name_server(&self, index: usize) -> Result<()> {
        self.send_cmd(Command::RemoveNameServer(index))
    }

    /// Clears the name server list; unicast lookups fall back to the
    /// system-provided name servers.
    pub fn clear_name_servers(&self) -> Result<()> {
        self.send_cmd(Command::ClearNameServers)
    }

    /// Pushes the effective name server list to the backend.
    ///
    /// This happens automatically when the list is edited through this
    /// handle; the method exists for callers that need to re-apply it.
    pub fn update_name_servers(&self) -> Result<()> {
        self.send_cmd(Command::UpdateNameServers)
    }

    /// Starts to monitor observable property changes of the engine.
    ///
    /// Returns a channel [`Receiver`] of [`DiscoveryEvent`].
    pub fn monitor(&self) -> Result<Receiver<DiscoveryEvent>> {
        let (resp_s, resp_r) = unbounded();
        self.send_cmd(Command::Monitor(resp_s))?;
        Ok(resp_r)
    }

    /// Returns a channel receiver for a snapshot of the engine's observable
    /// properties.
    pub fn state(&self) -> Result<Receiver<EngineState>> {
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::GetState(resp_s))?;
        Ok(resp_r)
    }

    /// Returns a channel receiver for the metrics, e.g. query counters.
    ///
    /// The metrics returned is a snapshot. Hence the caller should call
    /// this method repeatedly if they want to monitor the metrics
    /// continuously.
    pub fn get_metrics(&self) -> Result<Receiver<Metrics>> {
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::GetMetrics(resp_s))?;
        Ok(resp_r)
    }

    /// Returns the status of the engine.
    ///
    /// When an error is returned, the caller should retry only when the
    /// error is `Error::Again`, otherwise should consider the engine
    /// stopped working and move on.
    pub fn status(&self) -> Result<Receiver<EngineStatus>> {
        let (resp_s, resp_r) = bounded(1);

        if self.sender.is_disconnected() {
            resp_s
                .send(EngineStatus::Shutdown)
                .map_err(|e| e_fmt!("failed to send engine status to the client: {}", e))?;
        } else {
            self.send_cmd(Command::GetStatus(resp_s))?;
        }

        Ok(resp_r)
    }

    /// Shuts down the engine thread and returns a channel to receive the
    /// status.
    ///
    /// When an error is returned, the caller should retry only when
    /// the error is `Error::Again`, otherwise should log and move on.
    pub fn shutdown(&self) -> Result<Receiver<EngineStatus>> {
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::Exit(resp_s))?;
        Ok(resp_r)
    }

    fn engine_thread(engine: Engine, receiver: Receiver<Command>) {
        if let Some(cmd) = Engine::run(engine, receiver) {
            match cmd {
                Command::Exit(resp_s) => {
                    if let Err(e) = resp_s.send(EngineStatus::Shutdown) {
                        debug!("exit: failed to send response of shutdown: {}", e);
                    }
                }
                other => {
                    debug!("Unexpected command: {}", other);
                }
            }
        }
    }
}

/// What woke the engine's run loop.
enum Wakeup {
    Cmd(Command),
    CmdClosed,
    Lookup(LookupEvent),
    LookupClosed,
    Link(LinkEvent),
    Idle,
}

/// One declared query with its last delivered snapshot.
struct UserQuery {
    query: ServiceQuery,
    sender: Sender<Vec<ServiceInstance>>,
    resolved: Vec<ServiceInstance>,
}

/// A struct holding the state of the discovery engine.
struct Engine {
    backend: Box<dyn LookupBackend>,

    link: Box<dyn LinkWatcher>,

    /// Handed to every session the watchdog opens.
    link_tx: Sender<LinkEvent>,
    link_rx: Receiver<LinkEvent>,

    /// Event channel of the current backend init cycle.
    lookup_rx: Option<Receiver<LookupEvent>>,

    running: bool,
    network_ready: bool,
    lookup_ready: bool,
    lookup_mode: LookupMode,
    unicast_lookup_interval: u64,
    unicast_error_threshold: u32,

    /// The engine-wide primary filter.
    filter: Filter,

    name_servers: Vec<NameServer>,

    /// Declared queries, keyed by their token.
    user_queries: HashMap<QueryToken, UserQuery>,

    /// Correlation of live backend query ids.
    registry: QueryRegistry,

    /// Discovered instances per service type.
    instances: HashMap<String, Vec<InstanceEntry>>,

    /// Declared record type per service type. Fixed for the lifetime of the
    /// service type entry.
    type_table: HashMap<String, RecordType>,

    /// Channels to notify of property changes.
    monitors: Vec<Sender<DiscoveryEvent>>,

    counters: Metrics,

    /// Next watchdog tick, UNIX millis.
    next_net_check: u64,

    /// Next unicast refresh, UNIX millis. `None` while the timer is stopped.
    next_refresh: Option<u64>,

    status: EngineStatus,
}

impl Engine {
    fn new(backend: Box<dyn LookupBackend>, link: Box<dyn LinkWatcher>) -> Self {
        let (link_tx, link_rx) = unbounded();

        Self {
            backend,
            link,
            link_tx,
            link_rx,
            lookup_rx: None,
            running: false,
            network_ready: false,
            lookup_ready: false,
            lookup_mode: LookupMode::Multicast,
            unicast_lookup_interval: UNICAST_LOOKUP_INTERVAL_DEFAULT,
            unicast_error_threshold: UNICAST_ERROR_THRESHOLD_DEFAULT,
            filter: Filter::default(),
            name_servers: Vec::new(),
            user_queries: HashMap::new(),
            registry: QueryRegistry::new(),
            instances: HashMap::new(),
            type_table: HashMap::new(),
            monitors: Vec::new(),
            counters: HashMap::new(),
            next_net_check: 0,
            next_refresh: None,
            status: EngineStatus::Running,
        }
    }

    /// The main event loop of the engine thread.
    ///
    /// In each round, it will:
    /// 1. run the timers that are due (network watchdog, unicast refresh).
    /// 2. wait for a command, a backend event or a link event, with a
    ///    timeout at the earliest timer.
    /// 3. execute whatever woke it.
    fn run(mut engine: Engine, receiver: Receiver<Command>) -> Option<Command> {
        // The first watchdog tick fires immediately and begins the link-up
        // sequence.
        engine.next_net_check = current_time_millis();

        loop {
            let now = current_time_millis();

            if now >= engine.next_net_check {
                engine.net_check();
                engine.next_net_check = now + NET_CHECK_INTERVAL_MILLIS;
            }

            if let Some(next) = engine.next_refresh {
                if now >= next {
                    engine.unicast_lookup();
                    engine.next_refresh = Some(now + engine.unicast_lookup_interval);
                }
            }

            let deadline = match engine.next_refresh {
                Some(refresh) => engine.next_net_check.min(refresh),
                None => engine.next_net_check,
            };
            let timeout = deadline.saturating_sub(current_time_millis()).max(1);

            let wakeup = {
                let mut selector = Selector::new()
                    .recv(&receiver, |res| match res {
                        Ok(cmd) => Wakeup::Cmd(cmd),
                        Err(_) => Wakeup::CmdClosed,
                    })
                    .recv(&engine.link_rx, |res| match res {
                        Ok(event) => Wakeup::Link(event),
                        Err(_) => Wakeup::Idle,
                    });
                if let Some(lookup_rx) = &engine.lookup_rx {
                    selector = selector.recv(lookup_rx, |res| match res {
                        Ok(event) => Wakeup::Lookup(event),
                        Err(_) => Wakeup::LookupClosed,
                    });
                }

                selector
                    .wait_timeout(Duration::from_millis(timeout))
                    .unwrap_or(Wakeup::Idle)
            };

            match wakeup {
                Wakeup::Cmd(cmd) => {
                    trace!("engine: {}", &cmd);
                    if matches!(cmd, Command::Exit(_)) {
                        engine.status = EngineStatus::Shutdown;
                        engine.deinit_lookup();
                        engine.link.close_session();
                        return Some(cmd);
                    }
                    engine.exec_command(cmd);
                }
                Wakeup::CmdClosed => {
                    // All handles dropped: nobody can reach us anymore.
                    debug!("command channel closed, engine exits");
                    engine.deinit_lookup();
                    engine.link.close_session();
                    return None;
                }
                Wakeup::Lookup(event) => engine.handle_lookup_event(event),
                Wakeup::LookupClosed => {
                    // The backend dropped its sender outside of a teardown.
                    debug!("lookup event channel closed");
                    engine.lookup_rx = None;
                }
                Wakeup::Link(event) => engine.handle_link_event(event),
                Wakeup::Idle => {}
            }
        }
    }

    /// The entry point that executes all commands received by the engine.
    fn exec_command(&mut self, command: Command) {
        match command {
            Command::SetRunning(running) => self.set_running(running),

            Command::SetLookupMode(mode) => self.set_lookup_mode(mode),

            Command::SetFilter(filter) => self.set_filter(filter),

            Command::UpdateFilter => self.update_all_service_types(),

            Command::AddQuery(token, query, sender) => {
                trace!("declared query for {}", query.service_type());
                self.user_queries.insert(
                    token,
                    UserQuery {
                        query,
                        sender,
                        resolved: Vec::new(),
                    },
                );
            }

            Command::RemoveQuery(token) => {
                if self.user_queries.remove(&token).is_none() {
                    debug!("RemoveQuery: unknown token {:?}", token);
                }
            }

            Command::UpdateServices => self.update_services(),

            Command::SetUnicastLookupInterval(millis) => {
                if self.unicast_lookup_interval != millis {
                    self.unicast_lookup_interval = millis;
                    if self.next_refresh.is_some() {
                        self.next_refresh = Some(current_time_millis() + millis);
                    }
                    self.notify_monitors(DiscoveryEvent::UnicastLookupIntervalChanged(millis));
                }
            }

            Command::SetUnicastErrorThreshold(threshold) => {
                if self.unicast_error_threshold != threshold {
                    self.unicast_error_threshold = threshold;
                    self.notify_monitors(DiscoveryEvent::UnicastErrorThresholdChanged(threshold));
                }
            }

            Command::AddNameServer(name_server) => {
                self.name_servers.push(name_server);
                self.notify_monitors(DiscoveryEvent::NameServersChanged(self.name_servers.clone()));
                self.update_name_servers();
            }

            Command::RemoveNameServer(index) => {
                if index < self.name_servers.len() {
                    self.name_servers.remove(index);
                    self.notify_monitors(DiscoveryEvent::NameServersChanged(
                        self.name_servers.clone(),
                    ));
                    self.update_name_servers();
                } else {
                    debug!("RemoveNameServer: index {} out of bounds", index);
                }
            }

            Command::ClearNameServers => {
                if !self.name_servers.is_empty() {
                    self.name_servers.clear();
                    self.notify_monitors(DiscoveryEvent::NameServersChanged(Vec::new()));
                }
                self.update_name_servers();
            }

            Command::UpdateNameServers => self.update_name_servers(),

            Command::Monitor(resp_s) => {
                self.monitors.push(resp_s);
            }

            Command::GetState(resp_s) => {
                let state = EngineState {
                    running: self.running,
                    network_ready: self.network_ready,
                    lookup_ready: self.lookup_ready,
                    lookup_mode: self.lookup_mode,
                    unicast_lookup_interval: self.unicast_lookup_interval,
                    unicast_error_threshold: self.unicast_error_threshold,
                    name_servers: self.name_servers.clone(),
                };
                if let Err(e) = resp_s.send(state) {
                    debug!("Failed to send state: {}", e);
                }
            }

            Command::GetMetrics(resp_s) => match resp_s.send(self.counters.clone()) {
                Ok(()) => trace!("Sent metrics to the client"),
                Err(e) => debug!("Failed to send metrics: {}", e),
            },

            Command::GetStatus(resp_s) => match resp_s.send(self.status.clone()) {
                Ok(()) => trace!("Sent status to the client"),
                Err(e) => debug!("Failed to send status: {}", e),
            },

            Command::Exit(_) => {
                debug!("unexpected command: {}", &command);
            }
        }
    }

    fn notify_monitors(&mut self, event: DiscoveryEvent) {
        // Only retain the monitors that are still connected.
        self.monitors.retain(|sender| {
            if let Err(e) = sender.try_send(event.clone()) {
                debug!("notify_monitors: try_send: {}", &e);
                if matches!(e, TrySendError::Disconnected(_)) {
                    return false; // This monitor is dropped.
                }
            }
            true
        });
    }

    fn increase_counter(&mut self, counter: Counter, count: i64) {
        let key = counter.to_string();
        match self.counters.get_mut(&key) {
            Some(v) => *v += count,
            None => {
                self.counters.insert(key, count);
            }
        }
    }

    fn set_network_ready(&mut self, ready: bool) {
        if self.network_ready != ready {
            self.network_ready = ready;
            self.notify_monitors(DiscoveryEvent::NetworkReadyChanged(ready));
        }
    }

    /// Whether scans should be live in the backend right now.
    fn queries_live(&self) -> bool {
        self.running && self.network_ready && self.lookup_ready
    }

    // ---- network watchdog ----

    /// Periodic network check: let the link watcher notice a lost link, and
    /// while no session is open keep trying to open one.
    fn net_check(&mut self) {
        self.link.poll();

        if !self.network_ready {
            self.open_network_session();
        }
    }

    /// Opens a session on the first configuration with a usable bearer.
    fn open_network_session(&mut self) {
        let configs = self.link.configurations();
        trace!("number of configs: {}", configs.len());

        for config in configs {
            match config.bearer() {
                // unknown is usually ethernet or any other local network
                Bearer::Ethernet | Bearer::Wlan | Bearer::Unknown => {
                    debug!("network config: {} ({})", config.name(), config.bearer());
                    self.link.open_session(&config, self.link_tx.clone());
                    return;
                }
                other => {
                    debug!("unsupported network config: {} ({})", config.name(), other);
                }
            }
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened => {
                self.set_network_ready(true);

                if !self.init_lookup() {
                    // if the initialization fails we reset network ready to
                    // retrigger the watchdog after a certain period
                    self.set_network_ready(false);
                }
            }
            LinkEvent::Closed => {
                self.deinit_lookup();
                self.set_network_ready(false);
            }
            LinkEvent::Error(msg) => {
                warn!("network session error: {}", msg);
            }
        }
    }

    // ---- lookup backend lifecycle ----

    /// Brings the lookup backend up in the current mode.
    fn init_lookup(&mut self) -> bool {
        if self.lookup_ready {
            // already initialized
            return true;
        }

        debug!("initializing lookup backend ({})", self.lookup_mode);

        let (event_tx, event_rx) = unbounded();
        let bind_addr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

        if let Err(e) = self.backend.init(self.lookup_mode, bind_addr, event_tx) {
            debug!("initializing lookup backend failed: {}", e);
            self.notify_monitors(DiscoveryEvent::Error(e));
            return false;
        }

        self.lookup_rx = Some(event_rx);
        self.lookup_ready = true;

        if self.lookup_mode == LookupMode::Unicast {
            self.update_name_servers();
        }

        if self.running {
            self.update_services();

            if self.lookup_mode == LookupMode::Unicast {
                self.start_refresh_timer();
            }
        }

        self.notify_monitors(DiscoveryEvent::LookupReadyChanged(true));
        true
    }

    /// Tears the lookup backend down.
    ///
    /// Every instance table and the whole query registry are flushed: after
    /// this no callback can find a binding anymore.
    fn deinit_lookup(&mut self) {
        if !self.lookup_ready {
            return;
        }

        debug!("deinitializing lookup backend");

        self.stop_refresh_timer();
        self.remove_all_service_types();
        self.registry.clear();

        self.backend.shutdown();
        self.lookup_rx = None;

        self.lookup_ready = false;
        self.notify_monitors(DiscoveryEvent::LookupReadyChanged(false));
    }

    // ---- facade operations ----

    fn set_running(&mut self, running: bool) {
        if self.running == running {
            return;
        }

        self.running = running;
        self.notify_monitors(DiscoveryEvent::RunningChanged(running));

        if !(self.network_ready && self.lookup_ready) {
            return;
        }

        if running {
            self.start_queries();

            if self.lookup_mode == LookupMode::Unicast {
                self.start_refresh_timer();
            }
        } else {
            if self.lookup_mode == LookupMode::Unicast {
                self.stop_refresh_timer();
            }

            self.stop_queries();
        }
    }

    fn set_lookup_mode(&mut self, mode: LookupMode) {
        if self.lookup_mode == mode {
            return;
        }

        let was_ready = self.lookup_ready;
        if was_ready {
            self.deinit_lookup();
        }

        self.lookup_mode = mode;
        self.notify_monitors(DiscoveryEvent::LookupModeChanged(mode));

        if was_ready && !self.init_lookup() {
            // in case init fails we reset the network state to retrigger the
            // initialization
            self.set_network_ready(false);
        }
    }

    fn set_filter(&mut self, filter: Filter) {
        if self.filter != filter {
            self.filter = filter;
            self.notify_monitors(DiscoveryEvent::FilterChanged);

            self.update_all_service_types();
        }
    }

    /// Rebuilds the set of required service types from the declared queries,
    /// then refills all queries with fresh snapshots.
    fn update_services(&mut self) {
        let mut stale: HashSet<String> = self.instances.keys().cloned().collect();

        let declared: Vec<(String, RecordType)> = self
            .user_queries
            .values()
            .filter(|uq| !uq.query.service_type().is_empty())
            .map(|uq| (uq.query.service_type().to_string(), uq.query.record_type()))
            .collect();

        for (service_type, record_type) in declared {
            self.add_service_type(&service_type, record_type);
            stale.remove(&service_type);
            if self.queries_live() {
                self.start_query(&service_type);
            }
        }

        // whatever is left over is no longer demanded by any query
        for service_type in stale {
            if self.queries_live() {
                self.stop_query(&service_type);
            }
            self.remove_service_type(&service_type);
        }

        self.update_all_service_types(); // now we need to refill all queries with fresh data
    }

    /// Pushes the effective name server list to the backend.
    fn update_name_servers(&mut self) {
        if !self.lookup_ready || self.lookup_mode != LookupMode::Unicast {
            return;
        }

        let mut servers = self.name_servers.clone();

        if servers.is_empty() {
            servers = self.backend.system_name_servers();
        }

        if servers.is_empty() {
            warn!("no name servers available for unicast lookup");
            self.notify_monitors(DiscoveryEvent::Error(e_fmt!(
                "no name servers available for unicast lookup"
            )));
        }

        self.backend.set_name_servers(&servers);

        if self.running {
            self.unicast_lookup();
        }
    }

    // ---- unicast refresh ----

    fn start_refresh_timer(&mut self) {
        self.next_refresh = Some(current_time_millis() + self.unicast_lookup_interval);
    }

    fn stop_refresh_timer(&mut self) {
        self.next_refresh = None;
    }

    /// One unicast refresh pass over every tracked service type.
    fn unicast_lookup(&mut self) {
        let service_types: Vec<String> = self.instances.keys().cloned().collect();
        for service_type in service_types {
            self.refresh_query(&service_type);
        }
    }

    // ---- scan management ----

    fn start_queries(&mut self) {
        let service_types: Vec<String> = self.instances.keys().cloned().collect();
        for service_type in service_types {
            self.start_query(&service_type);
        }
    }

    fn stop_queries(&mut self) {
        let service_types: Vec<String> = self.instances.keys().cloned().collect();
        for service_type in service_types {
            self.stop_query(&service_type);
        }
    }

    fn start_query(&mut self, service_type: &str) {
        if self.registry.scan_for_type(service_type).is_some() {
            // query with the type already running
            return;
        }

        let Some(&record_type) = self.type_table.get(service_type) else {
            return;
        };

        let query_id = self.backend.query_start(service_type, record_type);
        self.registry
            .insert_scan(query_id, record_type, service_type.to_string());
        self.increase_counter(Counter::ScanStart, 1);

        debug!("started query {} {} {}", query_id, service_type, record_type);
    }

    fn stop_query(&mut self, service_type: &str) {
        let Some(query_id) = self.registry.scan_for_type(service_type) else {
            return;
        };

        self.backend.query_cancel(query_id);
        self.registry.remove(query_id);
        self.clear_items(service_type);

        debug!("stopped query {} {}", query_id, service_type);
    }

    /// Cancels and restarts the scan for `service_type`, purging outdated
    /// instances in between.
    fn refresh_query(&mut self, service_type: &str) {
        let Some(query_id) = self.registry.scan_for_type(service_type) else {
            return;
        };

        let Some(&record_type) = self.type_table.get(service_type) else {
            return;
        };

        self.backend.query_cancel(query_id); // stop old query
        self.registry.remove(query_id);

        self.purge_items(service_type); // purge outdated items

        let new_id = self.backend.query_start(service_type, record_type); // start a new query
        self.registry
            .insert_scan(new_id, record_type, service_type.to_string());
        self.increase_counter(Counter::ScanRefresh, 1);

        trace!("refreshed query {} {}", new_id, service_type);
    }

    /// Cancels every sub-query currently resolving `key`.
    fn stop_instance_queries(&mut self, key: &InstanceKey) {
        for query_id in self.registry.resolve_ids_for(key) {
            self.backend.query_cancel(query_id);
            self.registry.remove(query_id);
        }
    }

    // ---- type table ----

    fn add_service_type(&mut self, service_type: &str, record_type: RecordType) {
        if self.instances.contains_key(service_type) {
            return;
        }

        self.instances.insert(service_type.to_string(), Vec::new());
        self.type_table
            .insert(service_type.to_string(), record_type);
    }

    fn remove_service_type(&mut self, service_type: &str) {
        if !self.instances.contains_key(service_type) {
            return;
        }

        self.clear_items(service_type);
        self.instances.remove(service_type);
        self.type_table.remove(service_type);
    }

    fn remove_all_service_types(&mut self) {
        let service_types: Vec<String> = self.instances.keys().cloned().collect();
        for service_type in service_types {
            self.remove_service_type(&service_type);
        }
    }

    // ---- instance table ----

    /// Returns whether `(name, service_type)` exists, creating it if the
    /// service type is tracked. Returns false for untracked types.
    fn add_item(&mut self, name: &str, service_type: &str) -> bool {
        let Some(entries) = self.instances.get_mut(service_type) else {
            return false;
        };

        if entries.iter().any(|entry| entry.info.name() == name) {
            return true;
        }

        entries.push(InstanceEntry::new(name, service_type));
        true
    }

    fn entry_mut(&mut self, key: &InstanceKey) -> Option<&mut InstanceEntry> {
        self.instances
            .get_mut(&key.service_type)?
            .iter_mut()
            .find(|entry| entry.info.name() == key.name)
    }

    fn remove_item(&mut self, name: &str, service_type: &str) {
        let key = InstanceKey::new(service_type, name);
        let Some(entries) = self.instances.get(service_type) else {
            return;
        };

        if !entries.iter().any(|entry| entry.info.name() == name) {
            return;
        }

        // cancel the sub-queries first, so that a queued callback finds no
        // binding and is dropped
        self.stop_instance_queries(&key);

        if let Some(entries) = self.instances.get_mut(service_type) {
            entries.retain(|entry| entry.info.name() != name);
        }

        self.update_service_type(service_type);
    }

    fn clear_items(&mut self, service_type: &str) {
        let Some(entries) = self.instances.get(service_type) else {
            return;
        };

        let keys: Vec<InstanceKey> = entries
            .iter()
            .map(|entry| InstanceKey::new(service_type, entry.info.name()))
            .collect();

        for key in &keys {
            self.stop_instance_queries(key);
        }

        if let Some(entries) = self.instances.get_mut(service_type) {
            entries.clear();
        }

        self.update_service_type(service_type);
    }

    /// Removes items that have not been updated and flags the others as not
    /// updated, arming the next cycle.
    fn purge_items(&mut self, service_type: &str) {
        let Some(entries) = self.instances.get_mut(service_type) else {
            return;
        };

        let threshold = self.unicast_error_threshold;
        let mut removals: Vec<String> = Vec::new();

        for entry in entries.iter_mut() {
            if !entry.updated {
                entry.error_count += 1;
                if entry.error_count > threshold {
                    removals.push(entry.info.name().to_string());
                }
            } else {
                entry.updated = false;
            }
        }

        if removals.is_empty() {
            return;
        }

        for name in &removals {
            let key = InstanceKey::new(service_type, name);
            self.stop_instance_queries(&key);
        }

        if let Some(entries) = self.instances.get_mut(service_type) {
            entries.retain(|entry| !removals.iter().any(|name| name == entry.info.name()));
        }

        self.increase_counter(Counter::InstancePurged, removals.len() as i64);
        debug!(
            "purged {} instance(s) of {}",
            removals.len(),
            service_type
        );

        self.update_service_type(service_type);
    }

    // ---- projection to user queries ----

    /// Refills every query declared for `service_type` with the current
    /// fully resolved instances, filtered.
    fn update_service_type(&mut self, service_type: &str) {
        let Some(entries) = self.instances.get(service_type) else {
            return;
        };

        let resolved: Vec<ServiceInstance> = entries
            .iter()
            .filter(|entry| entry.is_resolved())
            .map(|entry| entry.info.clone())
            .collect();

        let primary = self.filter.clone();

        for user_query in self
            .user_queries
            .values_mut()
            .filter(|uq| uq.query.service_type() == service_type)
        {
            // do not filter host name lookups
            let items = if user_query.query.record_type() == RecordType::A {
                resolved.clone()
            } else {
                resolved
                    .iter()
                    .filter(|item| primary.matches(item) && user_query.query.filter().matches(item))
                    .cloned()
                    .collect()
            };

            if user_query.resolved != items {
                user_query.resolved = items.clone();
                if let Err(e) = user_query.sender.send(items) {
                    debug!("failed to send query snapshot: {}", e);
                }
            }
        }
    }

    fn update_all_service_types(&mut self) {
        let service_types: Vec<String> = self.instances.keys().cloned().collect();
        for service_type in service_types {
            self.update_service_type(&service_type);
        }
    }

    // ---- answer ingestion ----

    fn handle_lookup_event(&mut self, event: LookupEvent) {
        match event {
            LookupEvent::Results { query_id, answers } => {
                for answer in answers {
                    self.ingest_answer(query_id, answer);
                }
            }
            LookupEvent::Failure { query_id, error } => {
                // diagnostic only; stale entries age out via the purge pass
                warn!("query {} failed: {}", query_id, error);
            }
        }
    }

    /// Processes one answer record, dispatched on the record type the query
    /// id was registered with.
    fn ingest_answer(&mut self, query_id: QueryId, answer: AnswerRecord) {
        let Some(record_type) = self.registry.record_type(query_id) else {
            // late answer after cancellation
            trace!("discarding answer for unknown query {}", query_id);
            self.increase_counter(Counter::AnswerDiscarded, 1);
            return;
        };

        self.increase_counter(Counter::AnswerIngested, 1);

        match record_type {
            RecordType::Ptr => self.ingest_ptr(query_id, answer),
            RecordType::Txt => self.ingest_txt(query_id, answer),
            RecordType::Srv => self.ingest_srv(query_id, answer),
            RecordType::A | RecordType::Aaaa => self.ingest_addr(query_id, answer),
        }
    }

    fn ingest_ptr(&mut self, query_id: QueryId, answer: AnswerRecord) {
        let Some(service_type) = self.registry.service_type(query_id).map(str::to_string) else {
            self.increase_counter(Counter::AnswerDiscarded, 1);
            return;
        };

        // the instance name is the left-most label of the PTR target
        let Some(split) = answer.name.find("._") else {
            debug!("ignoring malformed PTR target {}", answer.name);
            self.increase_counter(Counter::AnswerDiscarded, 1);
            return;
        };
        let name = answer.name[..split].to_string();

        trace!(
            "PTR record: {} {} {} TTL: {}",
            answer.owner,
            answer.name,
            service_type,
            answer.ttl
        );

        if answer.ttl == 0 {
            // a goodbye message withdraws the instance
            self.remove_item(&name, &service_type);
            return;
        }

        if !self.add_item(&name, &service_type) {
            return;
        }

        let key = InstanceKey::new(&service_type, &name);

        // An instance that is fully resolved and has already refreshed this
        // cycle does not need its sub-queries started again; every other
        // state does.
        let start_subqueries = match self.entry_mut(&key) {
            Some(entry) => !(entry.is_resolved() && entry.updated),
            None => false,
        };

        if start_subqueries {
            // We have to do 3 requests before the item is fully resolved:
            // TXT, SRV and A (or AAAA).
            let txt_id = self.backend.query_start(&answer.name, RecordType::Txt);
            self.registry
                .insert_resolve(txt_id, RecordType::Txt, key.clone());

            let srv_id = self.backend.query_start(&answer.name, RecordType::Srv);
            self.registry
                .insert_resolve(srv_id, RecordType::Srv, key.clone());

            self.increase_counter(Counter::Subquery, 2);

            if let Some(entry) = self.entry_mut(&key) {
                entry.outstanding.insert(txt_id);
                entry.outstanding.insert(srv_id);
            }
        }

        self.check_resolved(&key);
    }

    fn ingest_txt(&mut self, query_id: QueryId, answer: AnswerRecord) {
        let Some(key) = self.registry.instance_key(query_id).cloned() else {
            self.increase_counter(Counter::AnswerDiscarded, 1);
            return;
        };

        self.backend.query_cancel(query_id); // we have our results
        self.registry.remove(query_id);

        if let Some(entry) = self.entry_mut(&key) {
            entry.outstanding.remove(&query_id);
            entry.info.set_txt_records(answer.texts.clone());

            trace!("TXT record {} {}: {:?}", key.service_type, key.name, answer.texts);
        }

        self.check_resolved(&key);
    }

    fn ingest_srv(&mut self, query_id: QueryId, answer: AnswerRecord) {
        let Some(key) = self.registry.instance_key(query_id).cloned() else {
            self.increase_counter(Counter::AnswerDiscarded, 1);
            return;
        };

        self.backend.query_cancel(query_id); // we have our results
        self.registry.remove(query_id);

        // the SRV target still needs an address lookup
        let addr_id = self.backend.query_start(&answer.name, RecordType::A);
        self.registry
            .insert_resolve(addr_id, RecordType::A, key.clone());
        self.increase_counter(Counter::Subquery, 1);

        if let Some(entry) = self.entry_mut(&key) {
            entry.outstanding.remove(&query_id);
            entry.outstanding.insert(addr_id);
            entry.info.set_host_name(&answer.name);
            entry.info.set_port(answer.port);

            trace!(
                "SRV record {} {}: {}:{}",
                key.service_type,
                key.name,
                answer.name,
                answer.port
            );
        }

        self.check_resolved(&key);
    }

    fn ingest_addr(&mut self, query_id: QueryId, answer: AnswerRecord) {
        // an instance sub-query resolves through its registry binding
        if let Some(key) = self.registry.instance_key(query_id).cloned() {
            self.backend.query_cancel(query_id); // we have our results
            self.registry.remove(query_id);

            if let Some(entry) = self.entry_mut(&key) {
                entry.outstanding.remove(&query_id);
                if let Some(address) = answer.address {
                    entry.info.set_host_address(&address.to_string());
                }

                trace!(
                    "address record {} {}: {:?}",
                    key.service_type,
                    key.name,
                    answer.address
                );
            }

            self.check_resolved(&key);
            return;
        }

        // otherwise this is a host lookup scan delivering addresses directly
        let Some(host) = self.registry.service_type(query_id).map(str::to_string) else {
            self.increase_counter(Counter::AnswerDiscarded, 1);
            return;
        };
        self.ingest_host_addr(&host, answer);
    }

    /// Applies an address answer of a host lookup scan.
    ///
    /// The looked-up host shows up in its own table as a single entry named
    /// after the host. The scan itself keeps running, like a PTR scan does,
    /// so later address changes and withdrawals stream in the same way.
    fn ingest_host_addr(&mut self, host: &str, answer: AnswerRecord) {
        trace!("host address record {}: {:?} TTL: {}", host, answer.address, answer.ttl);

        if answer.ttl == 0 {
            self.remove_item(host, host);
            return;
        }

        if !self.add_item(host, host) {
            return;
        }

        let key = InstanceKey::new(host, host);
        if let Some(entry) = self.entry_mut(&key) {
            entry.info.set_host_name(host);
            if let Some(address) = answer.address {
                entry.info.set_host_address(&address.to_string());
            }
        }

        self.check_resolved(&key);
    }

    /// If `key` has no outstanding sub-queries left, marks it refreshed and
    /// re-projects its service type.
    fn check_resolved(&mut self, key: &InstanceKey) {
        let Some(entry) = self.entry_mut(key) else {
            return;
        };

        if !entry.is_resolved() {
            return;
        }

        entry.updated = true;
        entry.error_count = 0;

        let service_type = key.service_type.clone();
        self.update_service_type(&service_type);
    }
}

/// Returns UNIX time in millis.
fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("failed to get current UNIX time")
        .as_millis() as u64
}
