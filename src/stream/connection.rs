// ===============================
// src/stream/connection.rs
// ===============================
//
// One broker connection = one state machine + one driver task.
//
//   DISCONNECTED -start-> CONNECTING -ok-> CONNECTED -drop-> RECONNECTING
//   RECONNECTING -backoff-> CONNECTING ...; too many failures -> FAILED
//   stop() from anywhere -> DISCONNECTED
//
// All mutable state (state, tracked subscriptions, command sender) sits
// behind a single mutex. Callers and the driver both go through it; events
// are published while holding it so an unsubscribe is never overtaken by a
// late event for the same key. Each start() bumps `epoch`; a driver whose
// epoch is stale exits at its next checkpoint.
//
// Replay re-resolves every tracked key through the current contract table,
// so a refresh that moved a broker token is picked up on the next connect.
//
// A handshake alone does not clear the failure count. The session has to
// deliver an event or stay up for `max_backoff` first, so a peer that
// accepts and drops right away still runs out of retries.
//
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::bus::EventBus;
use super::protocol::StreamProtocol;
use crate::adapter::Capability;
use crate::config::StreamPolicy;
use crate::domain::{ConnectionState, StopMode, Subscription, SubscriptionKey, SubscriptionMode};
use crate::error::{BridgeError, Result};
use crate::metrics::{STREAM_DECODE_ERRORS, STREAM_DISCARDED, STREAM_RECONNECTS, STREAM_STATE, UNMAPPED_SYMBOL};
use crate::symbols::SymbolCache;
use crate::transport::{StreamConnection, StreamConnector};

enum Command {
    Send(Vec<String>),
    Shutdown,
}

struct Shared {
    state: ConnectionState,
    epoch: u64,
    tracked: BTreeMap<SubscriptionKey, Subscription>,
    commands: Option<mpsc::UnboundedSender<Command>>,
    driver: Option<JoinHandle<()>>,
    failures: u32,
    last_error: Option<String>,
}

struct Inner {
    broker: String,
    connector: Arc<dyn StreamConnector>,
    protocol: Arc<dyn StreamProtocol>,
    contracts: Arc<SymbolCache>,
    policy: StreamPolicy,
    bus: Arc<EventBus>,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Inner {
    fn label(&self) -> &str {
        self.protocol.label()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, sh: &mut Shared, next: ConnectionState) {
        if sh.state == next {
            return;
        }
        debug!(broker = %self.broker, connection = %self.label(), from = sh.state.as_str(), to = next.as_str(), "stream state");
        sh.state = next;
        self.state_tx.send_replace(next);
        STREAM_STATE.with_label_values(&[self.broker.as_str(), self.label()]).set(next.code());
    }

    async fn open(&self) -> Result<Box<dyn StreamConnection>> {
        let mut conn = timeout(self.policy.connect_timeout, self.connector.connect())
            .await
            .map_err(|_| BridgeError::ConnectionFailed(format!("connect timed out after {:?}", self.policy.connect_timeout)))??;
        match timeout(self.policy.handshake_timeout, self.protocol.handshake(conn.as_mut())).await {
            Ok(Ok(())) => Ok(conn),
            Ok(Err(e)) => {
                conn.close().await;
                Err(e)
            }
            Err(_) => {
                conn.close().await;
                Err(BridgeError::ConnectionFailed(format!(
                    "handshake timed out after {:?}",
                    self.policy.handshake_timeout
                )))
            }
        }
    }

    /// Tracked set for a replay, with instruments taken from the live
    /// table. Keys whose contract is gone are dropped, not sent.
    fn replay_set(&self, sh: &mut Shared) -> Vec<Subscription> {
        let table = self.contracts.snapshot();
        let mut vanished = Vec::new();
        for (key, sub) in sh.tracked.iter_mut() {
            match table.get(&key.symbol, &key.exchange) {
                Some(c) => {
                    let current = c.instrument();
                    if current != sub.instrument {
                        info!(
                            broker = %self.broker,
                            %key,
                            from = %sub.instrument.broker_token,
                            to = %current.broker_token,
                            "instrument changed since subscribe"
                        );
                        sub.instrument = current;
                    }
                }
                None => vanished.push(key.clone()),
            }
        }
        for key in vanished {
            sh.tracked.remove(&key);
            self.bus.prune(&key);
            UNMAPPED_SYMBOL.with_label_values(&[self.broker.as_str(), "subscription"]).inc();
            warn!(broker = %self.broker, %key, "contract no longer listed, subscription dropped");
        }
        sh.tracked.values().cloned().collect()
    }

    /// Decode + subscription filter + publish, under the lock. The first
    /// frame with events marks the session healthy.
    fn dispatch(&self, epoch: u64, frame: &str, healthy: &mut bool) {
        if frame.is_empty() {
            return;
        }
        let events = match self.protocol.decode(frame) {
            Ok(ev) => ev,
            Err(e) => {
                STREAM_DECODE_ERRORS.with_label_values(&[self.broker.as_str(), self.label()]).inc();
                warn!(broker = %self.broker, connection = %self.label(), error = %e, "undecodable frame skipped");
                return;
            }
        };
        if events.is_empty() {
            return;
        }
        let mut sh = self.lock();
        if sh.epoch != epoch {
            return;
        }
        if !*healthy {
            *healthy = true;
            sh.failures = 0;
        }
        for ev in events {
            match ev.key() {
                None => self.bus.publish(ev),
                Some(key) if sh.tracked.contains_key(&key) => self.bus.publish(ev),
                Some(key) => {
                    STREAM_DISCARDED.with_label_values(&[self.broker.as_str()]).inc();
                    debug!(broker = %self.broker, %key, "event for untracked key discarded");
                }
            }
        }
    }
}

/// Cloneable handle on one connection's state machine.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        broker: &str,
        connector: Arc<dyn StreamConnector>,
        protocol: Arc<dyn StreamProtocol>,
        contracts: Arc<SymbolCache>,
        policy: StreamPolicy,
        bus: Arc<EventBus>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Shared {
            state: ConnectionState::Disconnected,
            epoch: 0,
            tracked: BTreeMap::new(),
            commands: None,
            driver: None,
            failures: 0,
            last_error: None,
        };
        Self {
            inner: Arc::new(Inner {
                broker: broker.to_string(),
                connector,
                protocol,
                contracts,
                policy,
                bus,
                shared: Mutex::new(shared),
                state_tx,
            }),
        }
    }

    pub fn label(&self) -> &str {
        self.inner.label()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Consecutive failed attempts. Cleared once a session delivers an
    /// event or outlives `max_backoff`.
    pub fn failures(&self) -> u32 {
        self.inner.lock().failures
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    /// Tracked subscriptions, in key order.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.lock().tracked.values().cloned().collect()
    }

    pub fn is_tracked(&self, key: &SubscriptionKey) -> bool {
        self.inner.lock().tracked.contains_key(key)
    }

    pub fn supports(&self, mode: SubscriptionMode) -> bool {
        self.inner.protocol.supports(mode)
    }

    pub async fn wait_for_state(&self, target: ConnectionState, within: Duration) -> bool {
        let mut rx = self.watch_state();
        let reached = match timeout(within, rx.wait_for(|s| *s == target)).await {
            Ok(r) => r.is_ok(),
            Err(_) => false,
        };
        reached
    }

    /// Resolves once this connection is FAILED, with the error a caller
    /// would get from subscribe.
    pub async fn failure(&self) -> BridgeError {
        let mut rx = self.watch_state();
        let _ = rx.wait_for(|s| *s == ConnectionState::Failed).await;
        failed_error(&self.inner.lock())
    }

    /// DISCONNECTED or FAILED -> CONNECTING and spawns the driver. A no-op
    /// while a driver is already running.
    pub fn start(&self) {
        let mut sh = self.inner.lock();
        if !matches!(sh.state, ConnectionState::Disconnected | ConnectionState::Failed) {
            return;
        }
        sh.epoch += 1;
        sh.failures = 0;
        sh.last_error = None;
        let (tx, rx) = mpsc::unbounded_channel();
        sh.commands = Some(tx);
        self.inner.set_state(&mut sh, ConnectionState::Connecting);
        let epoch = sh.epoch;
        info!(broker = %self.inner.broker, connection = %self.label(), tracked = sh.tracked.len(), "stream starting");
        sh.driver = Some(tokio::spawn(drive(self.inner.clone(), epoch, rx)));
    }

    /// Adds to the tracked set. Sent right away only while CONNECTED;
    /// otherwise the replay after the next handshake covers it.
    pub fn subscribe(&self, sub: Subscription) -> Result<()> {
        if !self.inner.protocol.supports(sub.key.mode) {
            let cap = match sub.key.mode {
                SubscriptionMode::Depth => Capability::MarketDepth,
                _ => Capability::Streaming,
            };
            return Err(BridgeError::unsupported(&self.inner.broker, cap));
        }
        let frames = self.inner.protocol.subscribe_frames(std::slice::from_ref(&sub))?;

        let mut sh = self.inner.lock();
        if sh.state == ConnectionState::Failed {
            return Err(failed_error(&sh));
        }
        let unchanged = sh.tracked.get(&sub.key) == Some(&sub);
        sh.tracked.insert(sub.key.clone(), sub);
        let state = sh.state;
        match state {
            ConnectionState::Connected if !unchanged => {
                if let Some(tx) = &sh.commands {
                    let _ = tx.send(Command::Send(frames));
                }
            }
            ConnectionState::Disconnected if self.inner.policy.connect_on_subscribe => {
                drop(sh);
                self.start();
            }
            _ => {}
        }
        Ok(())
    }

    /// Removes from the tracked set; `false` if it was not tracked.
    pub fn unsubscribe(&self, key: &SubscriptionKey) -> Result<bool> {
        let mut sh = self.inner.lock();
        let Some(sub) = sh.tracked.remove(key) else {
            return Ok(false);
        };
        if sh.state == ConnectionState::Connected {
            let frames = self.inner.protocol.unsubscribe_frames(std::slice::from_ref(&sub))?;
            if let Some(tx) = &sh.commands {
                let _ = tx.send(Command::Send(frames));
            }
        }
        drop(sh);
        self.inner.bus.prune(key);
        Ok(true)
    }

    /// Any state -> DISCONNECTED. Waits for the driver up to the shutdown
    /// grace, then aborts it.
    pub async fn stop(&self, mode: StopMode) {
        let (commands, driver) = {
            let mut sh = self.inner.lock();
            sh.epoch += 1;
            sh.failures = 0;
            if mode == StopMode::Shutdown {
                sh.tracked.clear();
            }
            self.inner.set_state(&mut sh, ConnectionState::Disconnected);
            (sh.commands.take(), sh.driver.take())
        };
        if let Some(tx) = commands {
            let _ = tx.send(Command::Shutdown);
        }
        if let Some(mut handle) = driver {
            if timeout(self.inner.policy.shutdown_timeout, &mut handle).await.is_err() {
                warn!(broker = %self.inner.broker, connection = %self.label(), "driver did not stop in time, aborting");
                handle.abort();
            }
        }
        info!(broker = %self.inner.broker, connection = %self.label(), ?mode, "stream stopped");
    }

    /// Synchronous teardown for drop paths.
    pub(crate) fn abort(&self) {
        let mut sh = self.inner.lock();
        sh.epoch += 1;
        sh.commands = None;
        if let Some(h) = sh.driver.take() {
            h.abort();
        }
    }
}

fn failed_error(sh: &Shared) -> BridgeError {
    BridgeError::StreamFailed { attempts: sh.failures, last_error: sh.last_error.clone().unwrap_or_default() }
}

enum Step {
    Command(Option<Command>),
    Read(std::result::Result<Result<Option<String>>, tokio::time::error::Elapsed>),
}

/// Resolves when stop() asks for shutdown (or dropped the sender). Stale
/// Send commands are discarded; they only matter while CONNECTED.
async fn shutdown_requested(commands: &mut mpsc::UnboundedReceiver<Command>) {
    loop {
        match commands.recv().await {
            Some(Command::Send(_)) => continue,
            Some(Command::Shutdown) | None => return,
        }
    }
}

async fn drive(inner: Arc<Inner>, epoch: u64, mut commands: mpsc::UnboundedReceiver<Command>) {
    let backoff = Backoff {
        initial: inner.policy.initial_backoff,
        max: inner.policy.max_backoff,
        jitter: inner.policy.jitter,
    };
    let read_timeout = if inner.policy.read_timeout.is_zero() { Duration::MAX } else { inner.policy.read_timeout };

    loop {
        // ---- CONNECTING ----
        let opened = tokio::select! {
            biased;
            _ = shutdown_requested(&mut commands) => return,
            res = inner.open() => res,
        };

        let failure = match opened {
            Err(e) => e,
            Ok(mut conn) => {
                // ---- CONNECTED: snapshot + replay ----
                let replay = {
                    let mut sh = inner.lock();
                    if sh.epoch != epoch {
                        None
                    } else {
                        inner.set_state(&mut sh, ConnectionState::Connected);
                        sh.last_error = None;
                        // anything queued so far is covered by the snapshot
                        let mut stop = false;
                        loop {
                            match commands.try_recv() {
                                Ok(Command::Send(_)) => continue,
                                Ok(Command::Shutdown) | Err(mpsc::error::TryRecvError::Disconnected) => {
                                    stop = true;
                                    break;
                                }
                                Err(mpsc::error::TryRecvError::Empty) => break,
                            }
                        }
                        (!stop).then(|| inner.replay_set(&mut sh))
                    }
                };
                let Some(replay) = replay else {
                    conn.close().await;
                    return;
                };
                info!(broker = %inner.broker, connection = %inner.label(), replay = replay.len(), "stream connected");
                let connected_at = Instant::now();
                let mut healthy = false;

                let mut ended = None;
                if !replay.is_empty() {
                    match inner.protocol.subscribe_frames(&replay) {
                        Ok(frames) => {
                            for f in frames {
                                if let Err(e) = conn.send(&f).await {
                                    ended = Some(e);
                                    break;
                                }
                            }
                        }
                        Err(e) => error!(broker = %inner.broker, error = %e, "replay frames could not be built"),
                    }
                }

                // ---- session ----
                let e = match ended {
                    Some(e) => e,
                    None => loop {
                        let step = tokio::select! {
                            biased;
                            cmd = commands.recv() => Step::Command(cmd),
                            res = timeout(read_timeout, conn.recv()) => Step::Read(res),
                        };
                        match step {
                            Step::Command(Some(Command::Send(frames))) => {
                                let mut send_err = None;
                                for f in frames {
                                    if let Err(e) = conn.send(&f).await {
                                        send_err = Some(e);
                                        break;
                                    }
                                }
                                if let Some(e) = send_err {
                                    break e;
                                }
                            }
                            Step::Command(Some(Command::Shutdown)) | Step::Command(None) => {
                                conn.close().await;
                                return;
                            }
                            Step::Read(Err(_)) => {
                                break BridgeError::ConnectionFailed(format!("no data for {read_timeout:?}"));
                            }
                            Step::Read(Ok(Ok(Some(frame)))) => {
                                inner.dispatch(epoch, &frame, &mut healthy);
                            }
                            Step::Read(Ok(Ok(None))) => {
                                break BridgeError::ConnectionFailed("closed by peer".into());
                            }
                            Step::Read(Ok(Err(e))) if e.is_retryable() => break e,
                            Step::Read(Ok(Err(e))) => {
                                STREAM_DECODE_ERRORS.with_label_values(&[inner.broker.as_str(), inner.label()]).inc();
                                warn!(broker = %inner.broker, error = %e, "bad inbound frame skipped");
                            }
                        }
                    },
                };
                conn.close().await;
                if !healthy && connected_at.elapsed() >= inner.policy.max_backoff {
                    let mut sh = inner.lock();
                    if sh.epoch == epoch {
                        sh.failures = 0;
                    }
                }
                e
            }
        };

        // ---- RECONNECTING / FAILED ----
        let delay = {
            let mut sh = inner.lock();
            if sh.epoch != epoch {
                return;
            }
            sh.failures += 1;
            sh.last_error = Some(failure.to_string());
            let fatal = matches!(failure, BridgeError::AuthenticationFailed(_));
            if fatal || sh.failures >= inner.policy.max_retries {
                error!(
                    broker = %inner.broker,
                    connection = %inner.label(),
                    attempts = sh.failures,
                    error = %failure,
                    "stream failed, giving up"
                );
                inner.set_state(&mut sh, ConnectionState::Failed);
                sh.commands = None;
                sh.driver = None;
                return;
            }
            inner.set_state(&mut sh, ConnectionState::Reconnecting);
            STREAM_RECONNECTS.with_label_values(&[inner.broker.as_str(), inner.label()]).inc();
            let d = backoff.delay(sh.failures);
            warn!(
                broker = %inner.broker,
                connection = %inner.label(),
                attempt = sh.failures,
                delay_ms = d.as_millis() as u64,
                error = %failure,
                "stream dropped, reconnecting"
            );
            d
        };

        tokio::select! {
            biased;
            _ = shutdown_requested(&mut commands) => return,
            _ = sleep(delay) => {}
        }

        {
            let mut sh = inner.lock();
            if sh.epoch != epoch {
                return;
            }
            inner.set_state(&mut sh, ConnectionState::Connecting);
        }
    }
}
