//! Shared test infrastructure: an in-memory lookup backend that records
//! every query and lets tests inject synthetic answers, and a scripted link
//! watcher.

use flume::Sender;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use svc_discovery::{
    AnswerRecord, Bearer, Error, LinkConfig, LinkEvent, LinkWatcher, LookupBackend, LookupEvent,
    LookupMode, NameServer, QueryId, RecordType, Result,
};

#[derive(Default)]
pub struct RecordingState {
    next_id: QueryId,
    /// Live queries: (id, name, record type).
    pub started: Vec<(QueryId, String, RecordType)>,
    pub cancelled: Vec<QueryId>,
    pub events: Option<Sender<LookupEvent>>,
    pub init_count: usize,
    pub shutdown_count: usize,
    pub fail_init: bool,
    pub mode: Option<LookupMode>,
    pub pushed_name_servers: Vec<NameServer>,
    pub system_servers: Vec<NameServer>,
}

/// A lookup backend double: no sockets, everything scripted by the test.
pub struct RecordingLookup {
    shared: Arc<Mutex<RecordingState>>,
}

impl RecordingLookup {
    pub fn new() -> (Self, Arc<Mutex<RecordingState>>) {
        let shared = Arc::new(Mutex::new(RecordingState::default()));
        (
            Self {
                shared: shared.clone(),
            },
            shared,
        )
    }
}

impl LookupBackend for RecordingLookup {
    fn init(
        &mut self,
        mode: LookupMode,
        _bind_addr: IpAddr,
        events: Sender<LookupEvent>,
    ) -> Result<()> {
        let mut state = self.shared.lock().unwrap();
        state.init_count += 1;
        if state.fail_init {
            return Err(Error::Msg("init refused".to_string()));
        }
        state.mode = Some(mode);
        state.events = Some(events);
        Ok(())
    }

    fn shutdown(&mut self) {
        let mut state = self.shared.lock().unwrap();
        state.shutdown_count += 1;
        state.events = None;
        state.started.clear();
    }

    fn set_name_servers(&mut self, servers: &[NameServer]) {
        self.shared.lock().unwrap().pushed_name_servers = servers.to_vec();
    }

    fn query_start(&mut self, name: &str, record_type: RecordType) -> QueryId {
        let mut state = self.shared.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.started.push((id, name.to_string(), record_type));
        id
    }

    fn query_cancel(&mut self, query_id: QueryId) {
        let mut state = self.shared.lock().unwrap();
        state.cancelled.push(query_id);
        state.started.retain(|(id, _, _)| *id != query_id);
    }

    fn system_name_servers(&self) -> Vec<NameServer> {
        self.shared.lock().unwrap().system_servers.clone()
    }
}

#[derive(Default)]
pub struct ScriptedLinkState {
    pub configs: Vec<LinkConfig>,
    pub session: Option<Sender<LinkEvent>>,
    pub opened_on: Vec<String>,
}

/// A link watcher whose configurations are scripted by the test. Sessions
/// open immediately; the test can close them by dropping the stored sender
/// side or emitting `LinkEvent::Closed` itself.
pub struct ScriptedLink {
    shared: Arc<Mutex<ScriptedLinkState>>,
}

impl ScriptedLink {
    pub fn new(configs: Vec<LinkConfig>) -> (Self, Arc<Mutex<ScriptedLinkState>>) {
        let shared = Arc::new(Mutex::new(ScriptedLinkState {
            configs,
            ..Default::default()
        }));
        (
            Self {
                shared: shared.clone(),
            },
            shared,
        )
    }

    /// A watcher with one ethernet configuration.
    pub fn ethernet() -> (Self, Arc<Mutex<ScriptedLinkState>>) {
        Self::new(vec![LinkConfig::new("eth0", Bearer::Ethernet)])
    }
}

impl LinkWatcher for ScriptedLink {
    fn configurations(&mut self) -> Vec<LinkConfig> {
        self.shared.lock().unwrap().configs.clone()
    }

    fn open_session(&mut self, config: &LinkConfig, events: Sender<LinkEvent>) {
        let mut state = self.shared.lock().unwrap();
        state.opened_on.push(config.name().to_string());
        state.session = Some(events.clone());
        let _ = events.send(LinkEvent::Opened);
    }

    fn close_session(&mut self) {
        self.shared.lock().unwrap().session = None;
    }
}

/// Polls `predicate` until it holds or `timeout` expires.
pub fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}

/// The live query id for (name, record type), waiting for it to appear.
pub fn wait_for_query(
    lookup: &Arc<Mutex<RecordingState>>,
    name: &str,
    record_type: RecordType,
) -> QueryId {
    let found = wait_until(Duration::from_secs(3), || {
        lookup
            .lock()
            .unwrap()
            .started
            .iter()
            .any(|(_, n, rt)| n == name && *rt == record_type)
    });
    assert!(found, "no live {} query for {}", record_type, name);

    lookup
        .lock()
        .unwrap()
        .started
        .iter()
        .find(|(_, n, rt)| n == name && *rt == record_type)
        .map(|(id, _, _)| *id)
        .unwrap()
}

/// Injects answer records for one query.
pub fn inject_answers(
    lookup: &Arc<Mutex<RecordingState>>,
    query_id: QueryId,
    answers: Vec<AnswerRecord>,
) {
    let sender = lookup
        .lock()
        .unwrap()
        .events
        .clone()
        .expect("backend not initialized");
    sender
        .send(LookupEvent::Results { query_id, answers })
        .expect("engine dropped its event channel");
}
