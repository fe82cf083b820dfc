//! Reconciliation of the rule list against the gateway
//!
//! A pass walks the rules in order and makes one gateway round trip per
//! well-formed rule: active rules are forwarded, inactive rules are closed.
//! Every gateway failure is turned into an outcome for that rule alone, so
//! one bad rule never stops the rest of the pass.
//!
//! Rules are processed strictly one after another. With
//! [`DiscoveryPolicy::PerCall`] the worst case is `rules × discovery_timeout`.
//!
//! # Example
//!
//! ```no_run
//! use upnp_manager::core::engine::{EngineConfig, ReconciliationEngine};
//! use upnp_manager::core::gateway::UpnpGatewayClient;
//! use upnp_manager::core::mapping::{PortMappingRule, Protocol};
//!
//! # async fn run() -> upnp_manager::Result<()> {
//! let engine = ReconciliationEngine::new(UpnpGatewayClient::default(), EngineConfig::default());
//! let rules = vec![PortMappingRule::new("web", 8080, Protocol::Tcp, true)];
//!
//! let mut pass = engine.reconcile_all(&rules)?;
//! while let Some(outcome) = pass.next_outcome().await {
//!     println!("{outcome}");
//! }
//! println!("{}", pass.summary());
//! # Ok(())
//! # }
//! ```

use crate::core::error::{Error, Result};
use crate::core::gateway::{DEFAULT_DISCOVERY_TIMEOUT, GatewayClient};
use crate::core::mapping::{MappingAction, MappingKey, PortMappingRule};
use crate::core::store::RuleStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// When the engine looks for the gateway
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryPolicy {
    /// Discover before every gateway call
    #[default]
    #[strum(serialize = "per_call")]
    PerCall,
    /// Discover once per pass and reuse the handle; a call that fails on a
    /// reused handle triggers one re-discovery and a repeat of that call
    #[strum(serialize = "per_pass")]
    PerPass,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub discovery_timeout: Duration,
    pub discovery_policy: DiscoveryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            discovery_policy: DiscoveryPolicy::default(),
        }
    }
}

/// Terminal state of one rule within a pass
#[derive(Debug)]
pub enum MappingOutcome {
    /// Mapping now exists on the gateway
    Forwarded(MappingKey),
    /// Mapping is now absent from the gateway
    Closed(MappingKey),
    /// The gateway call for this rule failed
    Error {
        key: MappingKey,
        action: MappingAction,
        error: Error,
    },
}

impl MappingOutcome {
    pub fn key(&self) -> MappingKey {
        match self {
            MappingOutcome::Forwarded(key)
            | MappingOutcome::Closed(key)
            | MappingOutcome::Error { key, .. } => *key,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, MappingOutcome::Error { .. })
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            MappingOutcome::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    fn from_result(key: MappingKey, action: MappingAction, result: Result<()>) -> Self {
        match (result, action) {
            (Ok(()), MappingAction::Create) => MappingOutcome::Forwarded(key),
            (Ok(()), MappingAction::Delete) => MappingOutcome::Closed(key),
            (Err(error), action) => MappingOutcome::Error { key, action, error },
        }
    }
}

impl fmt::Display for MappingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingOutcome::Forwarded(key) => write!(f, "port {key} mapped"),
            MappingOutcome::Closed(key) => write!(f, "port {key} closed"),
            MappingOutcome::Error { error, .. } => write!(f, "error: {error}"),
        }
    }
}

/// Outcome of one rule, tagged with the rule's position in the list
#[derive(Debug)]
pub struct RuleOutcome {
    pub index: usize,
    pub name: String,
    pub outcome: MappingOutcome,
}

impl fmt::Display for RuleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.outcome.fmt(f)
    }
}

/// Whole-pass counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub forwarded: usize,
    pub closed: usize,
    pub failed: usize,
    /// Incomplete rows that were passed over without a gateway call
    pub skipped: usize,
}

impl PassSummary {
    fn record(&mut self, outcome: &MappingOutcome) {
        match outcome {
            MappingOutcome::Forwarded(_) => self.forwarded += 1,
            MappingOutcome::Closed(_) => self.closed += 1,
            MappingOutcome::Error { .. } => self.failed += 1,
        }
    }

    pub fn processed(&self) -> usize {
        self.forwarded + self.closed + self.failed
    }
}

impl fmt::Display for PassSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} mapped, {} closed, {} failed",
            self.forwarded, self.closed, self.failed
        )?;
        if self.skipped > 0 {
            write!(f, ", {} incomplete skipped", self.skipped)?;
        }
        Ok(())
    }
}

/// Result of the explicit remove path
#[derive(Debug)]
pub struct RemovedRule {
    pub rule: PortMappingRule,
    /// Gateway close attempt; `None` for incomplete rows, which are removed without one
    pub outcome: Option<MappingOutcome>,
}

/// Drives gateway state to match a rule list.
#[derive(Debug)]
pub struct ReconciliationEngine<G> {
    client: G,
    config: EngineConfig,
    in_flight: AtomicBool,
}

impl<G: GatewayClient> ReconciliationEngine<G> {
    pub fn new(client: G, config: EngineConfig) -> Self {
        Self {
            client,
            config,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> &G {
        &self.client
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// True while a pass or removal holds the engine
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn acquire(&self) -> Result<BusyGuard<'_>> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return Err(Error::Busy);
        }
        Ok(BusyGuard(&self.in_flight))
    }

    /// Starts a pass over `rules`.
    ///
    /// The pass is lazy: nothing touches the network until
    /// [`ReconcilePass::next_outcome`] is awaited. The engine stays busy
    /// until the returned pass is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Busy`] if another pass on this engine is still alive.
    pub fn reconcile_all<'a>(&'a self, rules: &'a [PortMappingRule]) -> Result<ReconcilePass<'a, G>> {
        let guard = self.acquire()?;
        info!("Starting reconciliation of {} rules", rules.len());
        Ok(ReconcilePass {
            engine: self,
            rules,
            position: 0,
            cached: None,
            summary: PassSummary::default(),
            _guard: guard,
        })
    }

    /// Closes the rule's mapping (best effort) and removes it from the store.
    ///
    /// The gateway close is attempted regardless of the active flag, but
    /// only for well-formed rows. The row is removed even when the close
    /// fails. Returns `Ok(None)` when `index` is out of range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Busy`] if a pass on this engine is still alive.
    pub async fn remove_rule(&self, store: &mut RuleStore, index: usize) -> Result<Option<RemovedRule>> {
        let _guard = self.acquire()?;

        let Some(key) = store.get(index).map(PortMappingRule::mapping_key) else {
            return Ok(None);
        };

        let outcome = match key {
            Some(key) => {
                let result = match self.client.discover(self.config.discovery_timeout).await {
                    Ok(handle) => {
                        self.client
                            .delete_mapping(&handle, key.port, key.protocol)
                            .await
                    }
                    Err(e) => Err(e),
                };
                if let Err(e) = &result {
                    warn!("Closing {key} before removal failed: {e}");
                }
                Some(MappingOutcome::from_result(key, MappingAction::Delete, result))
            }
            None => None,
        };

        let Some(rule) = store.remove(index) else {
            return Ok(None);
        };
        info!("Removed rule {index} ({rule})");
        Ok(Some(RemovedRule { rule, outcome }))
    }
}

/// Clears the engine's busy flag when dropped
#[derive(Debug)]
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One in-flight reconciliation pass.
///
/// Yields outcomes one at a time, in rule order, like an async iterator.
pub struct ReconcilePass<'a, G: GatewayClient> {
    engine: &'a ReconciliationEngine<G>,
    rules: &'a [PortMappingRule],
    position: usize,
    cached: Option<G::Handle>,
    summary: PassSummary,
    _guard: BusyGuard<'a>,
}

impl<G: GatewayClient> ReconcilePass<'_, G> {
    /// Processes the next well-formed rule and returns its outcome.
    ///
    /// Incomplete rows are skipped silently. Returns `None` once every rule
    /// has been visited.
    pub async fn next_outcome(&mut self) -> Option<RuleOutcome> {
        let rules = self.rules;
        while let Some(rule) = rules.get(self.position) {
            let index = self.position;
            self.position += 1;

            let Some(key) = rule.mapping_key() else {
                debug!("Skipping incomplete rule {index}");
                self.summary.skipped += 1;
                continue;
            };

            let action = if rule.active {
                MappingAction::Create
            } else {
                MappingAction::Delete
            };

            let result = self.call_gateway(key, action, &rule.name).await;
            let outcome = MappingOutcome::from_result(key, action, result);

            match &outcome {
                MappingOutcome::Error { error, .. } => warn!("Rule {index} ({key}): {error}"),
                _ => info!("Rule {index}: {outcome}"),
            }

            self.summary.record(&outcome);
            return Some(RuleOutcome {
                index,
                name: rule.name.clone(),
                outcome,
            });
        }
        None
    }

    /// Runs the rest of the pass and returns every outcome plus the summary.
    pub async fn run(mut self) -> (Vec<RuleOutcome>, PassSummary) {
        let mut outcomes = Vec::with_capacity(self.rules.len() - self.position);
        while let Some(outcome) = self.next_outcome().await {
            outcomes.push(outcome);
        }
        info!("Reconciliation finished: {}", self.summary);
        (outcomes, self.summary)
    }

    pub fn summary(&self) -> &PassSummary {
        &self.summary
    }

    pub fn is_finished(&self) -> bool {
        self.position >= self.rules.len()
    }

    async fn call_gateway(&mut self, key: MappingKey, action: MappingAction, name: &str) -> Result<()> {
        let engine = self.engine;
        let timeout = engine.config.discovery_timeout;

        match engine.config.discovery_policy {
            DiscoveryPolicy::PerCall => {
                let handle = engine.client.discover(timeout).await?;
                perform(&engine.client, &handle, key, action, name).await
            }
            DiscoveryPolicy::PerPass => {
                let reused = match &self.cached {
                    Some(handle) => Some(perform(&engine.client, handle, key, action, name).await),
                    None => None,
                };
                match reused {
                    Some(Ok(())) => return Ok(()),
                    Some(Err(e)) if !e.is_gateway_error() => return Err(e),
                    Some(Err(e)) => {
                        warn!("Call on cached gateway failed ({e}); re-discovering");
                        self.cached = None;
                    }
                    None => {}
                }

                let handle = engine.client.discover(timeout).await?;
                let result = perform(&engine.client, &handle, key, action, name).await;
                self.cached = Some(handle);
                result
            }
        }
    }
}

async fn perform<G: GatewayClient>(
    client: &G,
    handle: &G::Handle,
    key: MappingKey,
    action: MappingAction,
    description: &str,
) -> Result<()> {
    match action {
        MappingAction::Create => {
            client
                .create_mapping(handle, key.port, key.protocol, description)
                .await
        }
        MappingAction::Delete => client.delete_mapping(handle, key.port, key.protocol).await,
    }
}
