//! Shared test utilities for core module tests
//!
//! Provides an in-memory gateway and canned rules so tests never touch the
//! network. This module is only compiled in test mode.

use crate::core::error::{Error, Result};
use crate::core::gateway::GatewayClient;
use crate::core::mapping::{MappingAction, MappingKey, PortMappingRule, Protocol};
use crate::core::store::RuleStore;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
struct MockState {
    mappings: HashMap<MappingKey, String>,
    unreachable: bool,
    fail_next: usize,
    failing_ports: HashSet<u16>,
    discoveries: usize,
    calls: usize,
}

/// In-memory gateway with failure injection.
///
/// Create and delete are idempotent, like a real IGD.
#[derive(Debug, Default)]
pub struct MockGateway {
    state: Mutex<MockState>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discovery will time out until cleared
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    /// The next `count` mapping calls fail with a gateway error
    pub fn fail_next_calls(&self, count: usize) {
        self.state.lock().unwrap().fail_next = count;
    }

    /// Every mapping call for `port` fails
    pub fn fail_port(&self, port: u16) {
        self.state.lock().unwrap().failing_ports.insert(port);
    }

    pub fn mappings(&self) -> HashMap<MappingKey, String> {
        self.state.lock().unwrap().mappings.clone()
    }

    pub fn has_mapping(&self, port: u16, protocol: Protocol) -> bool {
        self.state
            .lock()
            .unwrap()
            .mappings
            .contains_key(&MappingKey::new(port, protocol))
    }

    pub fn discoveries(&self) -> usize {
        self.state.lock().unwrap().discoveries
    }

    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }

    fn check_call(state: &mut MockState, action: MappingAction, key: MappingKey) -> Result<()> {
        state.calls += 1;
        if state.fail_next > 0 || state.failing_ports.contains(&key.port) {
            state.fail_next = state.fail_next.saturating_sub(1);
            return Err(Error::Mapping {
                action,
                port: key.port,
                protocol: key.protocol,
                message: "UPnP error 501: Action Failed".to_string(),
            });
        }
        Ok(())
    }
}

impl GatewayClient for MockGateway {
    type Handle = ();

    async fn discover(&self, timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.discoveries += 1;
        if state.unreachable {
            return Err(Error::DiscoveryTimeout(timeout));
        }
        Ok(())
    }

    async fn create_mapping(
        &self,
        _handle: &(),
        port: u16,
        protocol: Protocol,
        description: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let key = MappingKey::new(port, protocol);
        Self::check_call(&mut state, MappingAction::Create, key)?;
        state.mappings.insert(key, description.to_string());
        Ok(())
    }

    async fn delete_mapping(&self, _handle: &(), port: u16, protocol: Protocol) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let key = MappingKey::new(port, protocol);
        Self::check_call(&mut state, MappingAction::Delete, key)?;
        state.mappings.remove(&key);
        Ok(())
    }
}

/// Two active rules: web 8080/TCP and game 27015/UDP.
pub fn sample_rules() -> Vec<PortMappingRule> {
    vec![
        PortMappingRule::new("web", 8080, Protocol::Tcp, true),
        PortMappingRule::new("game", 27015, Protocol::Udp, true),
    ]
}

pub fn sample_store() -> RuleStore {
    RuleStore::from_rules(sample_rules())
}

/// A row the user has started but not finished: no port.
pub fn incomplete_rule() -> PortMappingRule {
    PortMappingRule {
        name: "unfinished".to_string(),
        port: None,
        protocol: Some(Protocol::Tcp),
        active: true,
    }
}
