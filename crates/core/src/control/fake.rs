//! Scriptable in-memory control channel for tests

use super::{
    CircuitHop, CircuitPurpose, CircuitState, CircuitStatus, ControlChannel, ControlError,
    ControlResult, ExtendCircuitOptions, Relay, RelayFlag, RelayInfo, StreamEvent,
};
use anonroute_common::{CircuitId, CountryCode, Fingerprint};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

pub(crate) fn fp(n: u8) -> Fingerprint {
    Fingerprint::from_bytes([n; 20])
}

fn relay(n: u8, flags: &[RelayFlag]) -> Relay {
    Relay::new(fp(n), format!("relay{}", n), IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)))
        .with_flags(flags.iter().cloned())
}

pub(crate) fn exit(n: u8, country: &str) -> Relay {
    relay(n, &[RelayFlag::Exit, RelayFlag::Fast, RelayFlag::Running, RelayFlag::Valid])
        .with_country(country)
}

pub(crate) fn bad_exit(n: u8, country: &str) -> Relay {
    relay(n, &[RelayFlag::Exit, RelayFlag::BadExit, RelayFlag::Running]).with_country(country)
}

pub(crate) fn guard(n: u8, country: &str) -> Relay {
    relay(n, &[RelayFlag::Guard, RelayFlag::Stable, RelayFlag::Running]).with_country(country)
}

pub(crate) fn middle(n: u8) -> Relay {
    relay(n, &[RelayFlag::Stable, RelayFlag::Running, RelayFlag::Fast]).with_country("nl")
}

/// Two US exits, one DE exit, five guards and ten middles
pub(crate) fn standard_relays() -> Vec<Relay> {
    let mut relays = vec![exit(1, "us"), exit(2, "us"), exit(3, "de")];
    relays.extend((10..15).map(|n| guard(n, "fr")));
    relays.extend((20..30).map(middle));
    relays
}

#[derive(Default)]
struct FakeState {
    relays: Vec<Relay>,
    circuits: Vec<CircuitStatus>,
    next_circuit_id: u64,

    status_errors: VecDeque<ControlError>,
    extend_errors: VecDeque<ControlError>,
    extend_delay: Option<Duration>,
    subscribe_errors: VecDeque<ControlError>,
    populate_failures: u32,
    relay_info_failures: u32,
    fail_relays: bool,
    fail_auth: bool,

    auth_calls: u32,
    status_calls: u32,
    populate_calls: u32,
    extended: Vec<Vec<Fingerprint>>,
    attached: Vec<(String, CircuitId)>,
    closed: Vec<CircuitId>,
    attachment_disabled: bool,
    unsubscribed: u32,
}

pub(crate) struct FakeControl {
    state: Mutex<FakeState>,
    events: Mutex<Option<mpsc::Sender<StreamEvent>>>,
}

impl FakeControl {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_circuit_id: 1,
                ..FakeState::default()
            }),
            events: Mutex::new(None),
        }
    }

    pub fn with_relays(self, relays: Vec<Relay>) -> Self {
        self.state.lock().unwrap().relays = relays;
        self
    }

    pub fn standard() -> Self {
        Self::new().with_relays(standard_relays())
    }

    pub fn fail_status_with(&self, errors: impl IntoIterator<Item = ControlError>) {
        self.state.lock().unwrap().status_errors.extend(errors);
    }

    pub fn fail_extend_with(&self, errors: impl IntoIterator<Item = ControlError>) {
        self.state.lock().unwrap().extend_errors.extend(errors);
    }

    /// Every later extend takes this long before the circuit exists
    pub fn delay_extend(&self, delay: Duration) {
        self.state.lock().unwrap().extend_delay = Some(delay);
    }

    pub fn fail_subscribe_with(&self, errors: impl IntoIterator<Item = ControlError>) {
        self.state.lock().unwrap().subscribe_errors.extend(errors);
    }

    pub fn fail_populate(&self, times: u32) {
        self.state.lock().unwrap().populate_failures = times;
    }

    pub fn fail_relay_info(&self, times: u32) {
        self.state.lock().unwrap().relay_info_failures = times;
    }

    pub fn fail_relays(&self) {
        self.state.lock().unwrap().fail_relays = true;
    }

    pub fn fail_auth(&self) {
        self.state.lock().unwrap().fail_auth = true;
    }

    /// Add a circuit that was not built through `extend_circuit`
    pub fn add_circuit(&self, status: CircuitStatus) {
        self.state.lock().unwrap().circuits.push(status);
    }

    pub fn set_circuit_state(&self, circuit_id: CircuitId, state: CircuitState) {
        let mut guard = self.state.lock().unwrap();
        if let Some(c) = guard.circuits.iter_mut().find(|c| c.circuit_id == circuit_id) {
            c.state = state;
        }
    }

    pub fn extended(&self) -> Vec<Vec<Fingerprint>> {
        self.state.lock().unwrap().extended.clone()
    }

    pub fn attached(&self) -> Vec<(String, CircuitId)> {
        self.state.lock().unwrap().attached.clone()
    }

    pub fn closed(&self) -> Vec<CircuitId> {
        self.state.lock().unwrap().closed.clone()
    }

    pub fn auth_calls(&self) -> u32 {
        self.state.lock().unwrap().auth_calls
    }

    pub fn status_calls(&self) -> u32 {
        self.state.lock().unwrap().status_calls
    }

    pub fn populate_calls(&self) -> u32 {
        self.state.lock().unwrap().populate_calls
    }

    pub fn attachment_disabled(&self) -> bool {
        self.state.lock().unwrap().attachment_disabled
    }

    pub fn unsubscribed(&self) -> u32 {
        self.state.lock().unwrap().unsubscribed
    }

    pub fn is_subscribed(&self) -> bool {
        self.events.lock().unwrap().is_some()
    }

    /// Push a stream event to the current subscriber
    pub async fn emit(&self, event: StreamEvent) -> bool {
        let sender = self.events.lock().unwrap().clone();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }
}

pub(crate) fn built_circuit(id: u64, hops: &[u8]) -> CircuitStatus {
    CircuitStatus {
        circuit_id: CircuitId(id),
        state: CircuitState::Built,
        purpose: CircuitPurpose::General,
        relays: hops
            .iter()
            .map(|n| CircuitHop {
                fingerprint: fp(*n),
                nickname: Some(format!("relay{}", n)),
            })
            .collect(),
    }
}

#[async_trait]
impl ControlChannel for FakeControl {
    async fn authenticate(&self) -> ControlResult<()> {
        let mut state = self.state.lock().unwrap();
        state.auth_calls += 1;
        if state.fail_auth {
            return Err(ControlError::rejected("515 Authentication failed"));
        }
        Ok(())
    }

    async fn get_relays(&self) -> ControlResult<Vec<Relay>> {
        let state = self.state.lock().unwrap();
        if state.fail_relays {
            return Err(ControlError::connection_lost("Connection refused"));
        }
        Ok(state
            .relays
            .iter()
            .cloned()
            .map(|mut r| {
                r.country = None;
                r
            })
            .collect())
    }

    async fn circuit_status(&self) -> ControlResult<Vec<CircuitStatus>> {
        let mut state = self.state.lock().unwrap();
        state.status_calls += 1;
        if let Some(err) = state.status_errors.pop_front() {
            return Err(err);
        }
        Ok(state.circuits.clone())
    }

    async fn get_relay_info(&self, fingerprint: &Fingerprint) -> ControlResult<RelayInfo> {
        let mut state = self.state.lock().unwrap();
        if state.relay_info_failures > 0 {
            state.relay_info_failures -= 1;
            return Err(ControlError::rejected("552 Unrecognized key"));
        }
        state
            .relays
            .iter()
            .find(|r| &r.fingerprint == fingerprint)
            .map(|r| RelayInfo {
                fingerprint: r.fingerprint,
                nickname: r.nickname.clone(),
                ip: r.ip,
            })
            .ok_or_else(|| ControlError::rejected(format!("552 Unknown relay {}", fingerprint)))
    }

    async fn extend_circuit(&self, options: ExtendCircuitOptions) -> ControlResult<CircuitId> {
        let delay = self.state.lock().unwrap().extend_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.extend_errors.pop_front() {
            return Err(err);
        }

        let circuit_id = CircuitId(state.next_circuit_id);
        state.next_circuit_id += 1;
        state.extended.push(options.server_specs.clone());
        state.circuits.push(CircuitStatus {
            circuit_id,
            state: CircuitState::Built,
            purpose: options.purpose,
            relays: options
                .server_specs
                .into_iter()
                .map(|fingerprint| CircuitHop {
                    fingerprint,
                    nickname: None,
                })
                .collect(),
        });
        Ok(circuit_id)
    }

    async fn close_circuit(&self, circuit_id: CircuitId) -> ControlResult<()> {
        let mut state = self.state.lock().unwrap();
        state.closed.push(circuit_id);
        state.circuits.retain(|c| c.circuit_id != circuit_id);
        Ok(())
    }

    async fn attach_stream(&self, stream_id: &str, circuit_id: CircuitId) -> ControlResult<()> {
        self.state
            .lock()
            .unwrap()
            .attached
            .push((stream_id.to_string(), circuit_id));
        Ok(())
    }

    async fn disable_stream_attachment(&self) -> ControlResult<()> {
        self.state.lock().unwrap().attachment_disabled = true;
        Ok(())
    }

    async fn enable_stream_attachment(&self) -> ControlResult<()> {
        self.state.lock().unwrap().attachment_disabled = false;
        Ok(())
    }

    async fn subscribe_stream_events(&self) -> ControlResult<mpsc::Receiver<StreamEvent>> {
        let error = self.state.lock().unwrap().subscribe_errors.pop_front();
        if let Some(err) = error {
            return Err(err);
        }
        let (tx, rx) = mpsc::channel(16);
        *self.events.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn unsubscribe_stream_events(&self) -> ControlResult<()> {
        self.events.lock().unwrap().take();
        self.state.lock().unwrap().unsubscribed += 1;
        Ok(())
    }

    async fn populate_countries(&self, relays: &mut [Relay]) -> ControlResult<()> {
        let mut state = self.state.lock().unwrap();
        state.populate_calls += 1;
        if state.populate_failures > 0 {
            state.populate_failures -= 1;
            return Err(ControlError::rejected("551 GeoIP data not loaded"));
        }

        let countries: HashMap<Fingerprint, CountryCode> = state
            .relays
            .iter()
            .filter_map(|r| r.country.clone().map(|c| (r.fingerprint, c)))
            .collect();
        for relay in relays.iter_mut() {
            relay.country = countries.get(&relay.fingerprint).cloned();
        }
        Ok(())
    }
}
