//! Automations and the run loop
//!
//! An [`Automation`] sets itself up in [`Automation::initialize`]: it
//! subscribes to events, schedules tasks and calls services through the
//! client it is handed. [`run_automations`] initializes a set of them
//! concurrently and then keeps the session alive as long as the
//! [`RunMode`] asks for.

use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{error, info, warn};

use crate::client::HassClient;
use crate::error::{Result, SdkError};

/// Boxed error returned by [`Automation::initialize`]
pub type AutomationError = Box<dyn std::error::Error + Send + Sync>;

/// A unit of home automation logic
///
/// # Example
///
/// ```rust,ignore
/// struct PorchLight;
///
/// #[async_trait]
/// impl Automation for PorchLight {
///     fn name(&self) -> &str {
///         "porch light"
///     }
///
///     async fn initialize(&self, client: &HassClient) -> Result<(), AutomationError> {
///         let on = client.clone();
///         client.sun().on_sunset(move || {
///             let on = on.clone();
///             async move {
///                 on.call_service("light", "turn_on", Some("light.porch"), Default::default()).await?;
///                 Ok::<(), TaskError>(())
///             }
///         })?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Automation: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(&self, client: &HassClient) -> std::result::Result<(), AutomationError>;
}

/// What [`run_automations`] does once every automation is initialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Keep running while anything is subscribed or scheduled, otherwise close
    #[default]
    Automatic,
    /// Return right after initialization, leaving the session open
    JustInitialize,
    /// Keep running until the connection closes
    KeepRunning,
}

/// Outcome of initializing a set of automations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutomationReport {
    /// Names of automations that initialized
    pub initialized: Vec<String>,
    /// Automations that failed, with the reason
    pub failed: Vec<(String, String)>,
}

impl AutomationReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    /// The failures as [`SdkError::AutomationFailed`] values
    pub fn errors(&self) -> Vec<SdkError> {
        self.failed
            .iter()
            .map(|(name, message)| SdkError::AutomationFailed {
                name: name.clone(),
                message: message.clone(),
            })
            .collect()
    }
}

/// Initialize every automation concurrently
///
/// A failing or panicking automation is reported and does not stop the
/// others.
pub async fn initialize_automations(
    client: &HassClient,
    automations: &[Box<dyn Automation>],
) -> AutomationReport {
    let outcomes = futures::future::join_all(automations.iter().map(|automation| async move {
        let name = automation.name().to_string();
        let outcome = AssertUnwindSafe(automation.initialize(client))
            .catch_unwind()
            .await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("initialize panicked".to_string()),
        };
        (name, failure)
    }))
    .await;

    let mut report = AutomationReport::default();
    for (name, failure) in outcomes {
        match failure {
            None => {
                info!(automation = %name, "Automation initialized");
                report.initialized.push(name);
            }
            Some(message) => {
                error!(automation = %name, error = %message, "Automation failed to initialize");
                report.failed.push((name, message));
            }
        }
    }
    report
}

/// Initialize `automations`, then run according to `mode`
///
/// With [`RunMode::Automatic`] and nothing left subscribed or scheduled
/// after initialization the client is closed and this returns at once.
/// Otherwise, unless [`RunMode::JustInitialize`] is chosen, the heartbeat
/// is started and this returns when the connection closes.
pub async fn run_automations(
    client: &HassClient,
    automations: Vec<Box<dyn Automation>>,
    mode: RunMode,
) -> Result<AutomationReport> {
    info!(count = automations.len(), ?mode, "Initializing automations");
    let report = initialize_automations(client, &automations).await;

    match mode {
        RunMode::JustInitialize => return Ok(report),
        RunMode::Automatic if client.is_idle() => {
            info!("Nothing is subscribed or scheduled, closing");
            client.close().await;
            return Ok(report);
        }
        RunMode::Automatic | RunMode::KeepRunning => {}
    }

    info!(
        subscriptions_or_tasks = !client.is_idle(),
        scheduled = client.scheduler().len(),
        "Automations running"
    );
    if let Some(interval) = client.heartbeat_interval() {
        client.start_heartbeat(interval)?;
    }

    client.closed().await;
    warn!("Connection closed, automations stopped");
    Ok(report)
}
