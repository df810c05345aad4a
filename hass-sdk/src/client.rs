//! HassClient - main entry point for the SDK
//!
//! One client is one authenticated session: a connection, the entity
//! snapshot kept current by the event dispatcher, and a scheduler whose
//! solar triggers know where the server is.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use hass_api::{AttributeChange, Attributes, Command, Event, ServerConfig, StateChange, StateRecord};
use hass_event_manager::{CallbackError, EventDispatcher, EventFilter, SubscriptionId};
use hass_scheduler::{Location, Scheduler, SolarCalculator, SunriseCalculator, SystemClock};
use hass_stream::{Connection, ConnectionPhase, FrameHandler, Transport};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use state_store::{MergeSummary, StateStore};
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, SolarSource};
use crate::error::Result;
use crate::sun::{Sun, SunEntityCalculator};

struct ClientInner {
    config: ClientConfig,
    connection: Connection,
    dispatcher: Arc<EventDispatcher>,
    scheduler: Scheduler,
    server_config: RwLock<Option<ServerConfig>>,
    refreshing: AtomicBool,
    server_alive: AtomicBool,
    heartbeat: Mutex<Option<hass_scheduler::TaskHandle>>,
}

/// Handle to a Home Assistant session
///
/// Cloning is cheap and every clone talks to the same session.
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use hass_sdk::{ClientConfig, HassClient};
///
/// # async fn example() -> hass_sdk::Result<()> {
/// let client = HassClient::connect(ClientConfig::load()?).await?;
///
/// let porch = client.get_state("light.porch")?;
/// println!("porch light is {}", porch.state);
///
/// client
///     .call_service_and_wait("light", "turn_on", "light.porch", Default::default(), "on", Duration::from_secs(10))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct HassClient {
    inner: Arc<ClientInner>,
}

impl HassClient {
    /// Connect over WebSocket and bring the session up
    ///
    /// Returns once the snapshot is loaded, events are flowing and the
    /// scheduler is running.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(StateStore::new());
        let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&store)));
        let handler: Arc<dyn FrameHandler> = dispatcher.clone();

        let connection = Connection::open(config.connection.clone(), handler).await?;
        Self::initialize(config, connection, dispatcher).await
    }

    /// Bring the session up over an already established transport
    pub async fn with_transport(config: ClientConfig, transport: Box<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(StateStore::new());
        let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&store)));
        let handler: Arc<dyn FrameHandler> = dispatcher.clone();

        let connection = Connection::with_transport(config.connection.clone(), transport, handler).await?;
        Self::initialize(config, connection, dispatcher).await
    }

    async fn initialize(
        config: ClientConfig,
        connection: Connection,
        dispatcher: Arc<EventDispatcher>,
    ) -> Result<Self> {
        let solar: Arc<dyn SolarCalculator> = match config.solar_source {
            SolarSource::Calculated => Arc::new(SunriseCalculator::new()),
            SolarSource::SunEntity => {
                Arc::new(SunEntityCalculator::new(Arc::clone(dispatcher.store())))
            }
        };
        let scheduler = Scheduler::with_sources(solar, Arc::new(SystemClock));

        let client = Self {
            inner: Arc::new(ClientInner {
                config,
                connection,
                dispatcher,
                scheduler,
                server_config: RwLock::new(None),
                refreshing: AtomicBool::new(false),
                server_alive: AtomicBool::new(true),
                heartbeat: Mutex::new(None),
            }),
        };

        client.refresh_states().await?;
        client
            .send_command(Command::SubscribeEvents { event_type: None }, None)
            .await?;
        let server_config = client.refresh_server_config().await?;

        match client.inner.config.location.or_else(|| location_of(&server_config)) {
            Some(location) => client.inner.scheduler.set_location(location)?,
            None => warn!("Server reported no location; solar triggers are unavailable"),
        }
        client.inner.scheduler.start();

        info!(
            version = client.ha_version().as_deref().unwrap_or("unknown"),
            entities = client.store().len(),
            "Connected to Home Assistant"
        );
        Ok(client)
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Send any command and wait for its result
    pub async fn send_command(&self, command: Command, timeout: Option<Duration>) -> Result<Value> {
        Ok(self.inner.connection.call_command(command, timeout).await?)
    }

    /// Issue `domain.action` with `payload`
    ///
    /// `timeout` overrides the configured request timeout.
    pub async fn call_command(
        &self,
        domain: &str,
        action: &str,
        payload: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let command = Command::CallService {
            domain: domain.to_string(),
            service: action.to_string(),
            service_data: payload,
            target: None,
        };
        self.send_command(command, timeout).await
    }

    /// Call a service, optionally aimed at one entity
    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        entity_id: Option<&str>,
        data: Map<String, Value>,
    ) -> Result<Value> {
        debug!(domain, service, entity_id = ?entity_id, "Calling service");
        let command = Command::call_service(domain, service, entity_id, data);
        self.send_command(command, None).await
    }

    /// Call a service on `entity_id` and wait until it reports `expected_state`
    ///
    /// `timeout` bounds the wait for the state, not the service call.
    pub async fn call_service_and_wait(
        &self,
        domain: &str,
        service: &str,
        entity_id: &str,
        data: Map<String, Value>,
        expected_state: &str,
        timeout: Duration,
    ) -> Result<StateRecord> {
        self.call_service(domain, service, Some(entity_id), data).await?;
        Ok(self
            .inner
            .dispatcher
            .wait_for_state(entity_id, expected_state, timeout)
            .await?)
    }

    /// Round-trip a ping, returning the latency
    pub async fn ping(&self) -> Result<Duration> {
        Ok(self.inner.connection.ping(None).await?)
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Latest known state of an entity
    pub fn get_state(&self, entity_id: &str) -> Result<StateRecord> {
        self.refresh_if_stale();
        Ok(self.store().get_state(entity_id)?)
    }

    pub fn get_attributes(&self, entity_id: &str) -> Result<Attributes> {
        self.refresh_if_stale();
        Ok(self.store().get_attributes(entity_id)?)
    }

    /// All entities of one domain, e.g. every `light`
    pub fn domain_states(&self, domain: &str) -> Vec<StateRecord> {
        self.refresh_if_stale();
        self.store().domain_records(domain)
    }

    /// Bulk-fetch every entity and merge it into the snapshot
    ///
    /// Records changed by events while the fetch was in flight are kept, and
    /// entities removed by such events stay removed.
    pub async fn refresh_states(&self) -> Result<MergeSummary> {
        let since = self.store().watermark();
        let result = self.send_command(Command::GetStates, None).await?;
        let records: Vec<StateRecord> =
            serde_json::from_value(result).map_err(hass_api::CodecError::from)?;

        let count = records.len();
        let summary = self.store().merge_snapshot(records, since);
        debug!(entities = count, "Refreshed state snapshot");
        Ok(summary)
    }

    fn refresh_if_stale(&self) {
        if !self.store().is_stale(self.inner.config.snapshot_max_age) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self.inner.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }

        let client = self.clone();
        runtime.spawn(async move {
            if let Err(e) = client.refresh_states().await {
                warn!(error = %e, "Background snapshot refresh failed");
            }
            client.inner.refreshing.store(false, Ordering::Release);
        });
    }

    async fn refresh_server_config(&self) -> Result<ServerConfig> {
        let result = self.send_command(Command::GetConfig, None).await?;
        let server_config: ServerConfig =
            serde_json::from_value(result).map_err(hass_api::CodecError::from)?;
        *self.inner.server_config.write() = Some(server_config.clone());
        Ok(server_config)
    }

    pub fn store(&self) -> &Arc<StateStore> {
        self.inner.dispatcher.store()
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Register a persistent event subscription
    pub fn subscribe<F, Fut>(&self, filter: EventFilter, callback: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), CallbackError>> + Send + 'static,
    {
        self.inner.dispatcher.subscribe(filter, callback)
    }

    /// Register a subscription that fires at most once
    pub fn subscribe_once<F, Fut>(&self, filter: EventFilter, callback: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), CallbackError>> + Send + 'static,
    {
        self.inner.dispatcher.subscribe_once(filter, callback)
    }

    /// Be told about every state transition of one entity
    pub fn subscribe_state_changes<F, Fut>(&self, entity_id: &str, callback: F) -> SubscriptionId
    where
        F: Fn(StateChange) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), CallbackError>> + Send + 'static,
    {
        self.subscribe(
            EventFilter::state_changes_of(entity_id),
            move |event: Event| -> BoxFuture<'static, std::result::Result<(), CallbackError>> {
                match event.state_change() {
                    Some(change) => callback(change).boxed(),
                    None => futures::future::ready(Ok(())).boxed(),
                }
            },
        )
    }

    /// Run `callback` whenever attribute `key` of `entity_id` takes a new value
    ///
    /// Transitions that leave the attribute as it was, state-only changes
    /// included, are skipped.
    pub fn subscribe_attribute_changes<F, Fut>(
        &self,
        entity_id: &str,
        key: &str,
        callback: F,
    ) -> SubscriptionId
    where
        F: Fn(AttributeChange) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), CallbackError>> + Send + 'static,
    {
        let key = key.to_string();
        self.subscribe(
            EventFilter::state_changes_of(entity_id),
            move |event: Event| -> BoxFuture<'static, std::result::Result<(), CallbackError>> {
                match event.state_change().and_then(|change| change.attribute_change(&key)) {
                    Some(change) => callback(change).boxed(),
                    None => futures::future::ready(Ok(())).boxed(),
                }
            },
        )
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.dispatcher.unsubscribe(id)
    }

    /// Wait until `entity_id` satisfies `condition`, or fail after `timeout`
    pub async fn wait_until<C>(&self, entity_id: &str, condition: C, timeout: Duration) -> Result<StateRecord>
    where
        C: Fn(&StateRecord) -> bool + Send + Sync + 'static,
    {
        Ok(self
            .inner
            .dispatcher
            .wait_until(entity_id, condition, timeout)
            .await?)
    }

    /// Wait until attribute `key` of `entity_id` satisfies `condition`
    ///
    /// `condition` sees `None` while the attribute is absent.
    pub async fn wait_until_attribute<C>(
        &self,
        entity_id: &str,
        key: &str,
        condition: C,
        timeout: Duration,
    ) -> Result<StateRecord>
    where
        C: Fn(Option<&Value>) -> bool + Send + Sync + 'static,
    {
        let key = key.to_string();
        self.wait_until(entity_id, move |record| condition(record.raw_attribute(&key)), timeout)
            .await
    }

    /// Wait until `entity_id` reports exactly `state`
    pub async fn wait_for_state(&self, entity_id: &str, state: &str, timeout: Duration) -> Result<StateRecord> {
        Ok(self
            .inner
            .dispatcher
            .wait_for_state(entity_id, state, timeout)
            .await?)
    }

    // ========================================================================
    // Scheduling and the sun
    // ========================================================================

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// The `sun.sun` entity
    pub fn sun(&self) -> Sun {
        Sun::new(self.clone())
    }

    /// Location used for solar triggers
    pub fn location(&self) -> Option<Location> {
        self.inner.scheduler.location()
    }

    /// Ping the server every `interval` and log when it stops or resumes answering
    ///
    /// Replaces a heartbeat started earlier.
    pub fn start_heartbeat(&self, interval: Duration) -> Result<()> {
        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        let handle = self.inner.scheduler.run_every(interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    HassClient { inner }.heartbeat().await;
                }
                Ok::<(), hass_scheduler::TaskError>(())
            }
        })?;

        if let Some(previous) = self.inner.heartbeat.lock().replace(handle) {
            previous.cancel();
        }
        debug!(?interval, "Heartbeat started");
        Ok(())
    }

    async fn heartbeat(&self) {
        match self.ping().await {
            Ok(latency) => {
                if !self.inner.server_alive.swap(true, Ordering::AcqRel) {
                    info!(?latency, "Server is answering again");
                } else {
                    debug!(?latency, "Heartbeat");
                }
            }
            Err(e) => {
                if self.inner.server_alive.swap(false, Ordering::AcqRel) {
                    warn!(error = %e, "Server stopped answering heartbeats");
                }
            }
        }
    }

    pub(crate) fn heartbeat_interval(&self) -> Option<Duration> {
        self.inner.config.heartbeat_interval
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Server version from the handshake, or from `get_config`
    pub fn ha_version(&self) -> Option<String> {
        self.inner.connection.ha_version().or_else(|| {
            self.inner
                .server_config
                .read()
                .as_ref()
                .and_then(|config| config.version.clone())
        })
    }

    /// Configuration reported by the server at connect time
    pub fn server_config(&self) -> Option<ServerConfig> {
        self.inner.server_config.read().clone()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.inner.connection.phase()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.connection.is_ready()
    }

    /// No subscriptions and no scheduled tasks
    pub fn is_idle(&self) -> bool {
        self.inner.dispatcher.subscription_count() == 0 && self.inner.scheduler.is_empty()
    }

    /// Stop the scheduler and close the connection
    pub async fn close(&self) {
        info!("Closing Home Assistant client");
        self.inner.scheduler.shutdown();
        self.inner.scheduler.clear();
        self.inner.connection.close().await;
    }

    /// Wait until the session ends, for whatever reason
    pub async fn closed(&self) {
        self.inner.connection.closed().await;
    }
}

fn location_of(config: &ServerConfig) -> Option<Location> {
    let (latitude, longitude) = (config.latitude?, config.longitude?);
    match Location::new(latitude, longitude) {
        Ok(location) => Some(location),
        Err(e) => {
            warn!(error = %e, "Ignoring invalid server location");
            None
        }
    }
}

impl std::fmt::Debug for HassClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HassClient")
            .field("phase", &self.phase())
            .field("entities", &self.store().len())
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}
