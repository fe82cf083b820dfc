use crate::core::mapping::{MappingAction, Protocol};
use std::time::Duration;
use thiserror::Error;

/// Core error types for UPnP Manager
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No gateway answered the discovery search in time
    #[error("No UPnP gateway responded within {} seconds", .0.as_secs_f64())]
    DiscoveryTimeout(Duration),

    /// Transport fault while searching for a gateway
    #[error("Gateway discovery failed: {0}")]
    Discovery(String),

    /// Gateway rejected or failed a create/delete request
    #[error("Failed to {action} mapping for port {port}/{protocol}: {message}")]
    Mapping {
        action: MappingAction,
        port: u16,
        protocol: Protocol,
        message: String,
    },

    /// Rule file content could not be parsed
    #[error("Invalid rule file: {0}")]
    Format(String),

    /// Rule file was produced by a different tool
    #[error("Rule file was not created by UPnP Manager")]
    OriginMismatch,

    /// A reconciliation pass is already running on this engine
    #[error("A reconciliation pass is already in progress")]
    Busy,
}

impl Error {
    /// Returns true for failures that came from talking to the gateway.
    pub fn is_gateway_error(&self) -> bool {
        matches!(
            self,
            Error::DiscoveryTimeout(_) | Error::Discovery(_) | Error::Mapping { .. }
        )
    }

    /// Translates this error into a user-facing message with suggestions.
    pub fn translate(&self) -> ErrorTranslation {
        match self {
            Error::DiscoveryTimeout(_) => GatewayErrorPattern::match_error("timed out"),
            Error::Discovery(msg) | Error::Mapping { message: msg, .. } => {
                GatewayErrorPattern::match_error(msg)
            }
            Error::OriginMismatch => {
                ErrorTranslation::new("This file does not contain UPnP Manager presets")
                    .with_suggestion("Choose a file previously saved by UPnP Manager")
                    .with_suggestion("The current rule list was left unchanged")
            }
            Error::Format(msg) => ErrorTranslation::new(format!("Rule file is unreadable: {msg}"))
                .with_suggestion("Check the file is a JSON array of presets"),
            Error::Io(e) => ErrorTranslation::new(format!("File error: {e}")),
            Error::Busy => ErrorTranslation::new("Port forwarding is already being applied")
                .with_suggestion("Wait for the current pass to finish"),
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of UPnP gateway error patterns and their translations.
///
/// Gateways report failures as numeric UPnP error codes, and the SOAP
/// client renders them as text, so both forms are matched.
pub struct GatewayErrorPattern;

impl GatewayErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // Discovery timeouts
        if lower.contains("timed out") || lower.contains("timeout") {
            return ErrorTranslation::new("No UPnP gateway answered on the local network")
                .with_suggestion("Check that UPnP is enabled in the router's settings")
                .with_suggestion("Make sure this machine is on the router's LAN, not behind a second NAT")
                .with_suggestion("Some firewalls block SSDP multicast on UDP port 1900");
        }

        // 606: Action not authorized
        if lower.contains("606") || lower.contains("not authorized") {
            return ErrorTranslation::new("The gateway refused to change port mappings")
                .with_suggestion("Enable 'Allow users to make port forwarding changes' on the router")
                .with_suggestion("Some routers only allow UPnP changes from specific hosts");
        }

        // 718: ConflictInMappingEntry
        if lower.contains("718") || lower.contains("already in use") || lower.contains("conflict")
        {
            return ErrorTranslation::new("The external port is already mapped to another host")
                .with_suggestion("Remove the existing mapping in the router's admin page")
                .with_suggestion("Or choose a different port for this rule");
        }

        // 725: OnlyPermanentLeasesSupported
        if lower.contains("725") || lower.contains("permanent lease") {
            return ErrorTranslation::new("The gateway only accepts permanent mappings")
                .with_suggestion("Set lease_duration_secs to 0 in the configuration");
        }

        // 724: SamePortValuesRequired
        if lower.contains("724") || lower.contains("same port") {
            return ErrorTranslation::new("The gateway requires identical internal and external ports")
                .with_suggestion("This should not happen for UPnP Manager rules; report the router model");
        }

        // 728: NoPortMapsAvailable
        if lower.contains("728") || lower.contains("no port maps") || lower.contains("table full")
        {
            return ErrorTranslation::new("The gateway's port mapping table is full")
                .with_suggestion("Deactivate rules you no longer need and apply again")
                .with_suggestion("Restarting the router usually clears stale mappings");
        }

        // 714: NoSuchEntryInArray
        if lower.contains("714") || lower.contains("no such") {
            return ErrorTranslation::new("The mapping does not exist on the gateway")
                .with_suggestion("Nothing to remove; the port is already closed");
        }

        // 726/727: wildcard restrictions
        if lower.contains("726") || lower.contains("727") || lower.contains("wildcard") {
            return ErrorTranslation::new("The gateway rejected the mapping's host restrictions")
                .with_suggestion("The router may only support wildcard remote hosts");
        }

        // 402/501: malformed request or generic failure
        if lower.contains("402") || lower.contains("invalid arg") {
            return ErrorTranslation::new("The gateway rejected the request arguments")
                .with_suggestion("Verify the port is between 1 and 65535")
                .with_suggestion("Very long rule names can exceed the router's description limit");
        }

        if lower.contains("description") && lower.contains("long") {
            return ErrorTranslation::new("The rule name is too long for the gateway")
                .with_suggestion("Shorten the rule name and apply again");
        }

        if lower.contains("501") || lower.contains("action failed") {
            return ErrorTranslation::new("The gateway failed to process the request")
                .with_suggestion("Try again in a moment")
                .with_suggestion("Restart the router if the error persists");
        }

        // Network-level failures reaching the gateway's control URL
        if lower.contains("connection refused")
            || lower.contains("unreachable")
            || lower.contains("connection reset")
        {
            return ErrorTranslation::new("Lost contact with the gateway")
                .with_suggestion("The router's address may have changed; apply again to re-discover it");
        }

        // Generic fallback
        ErrorTranslation::new(format!("Gateway error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
