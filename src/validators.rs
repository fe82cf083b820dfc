//! Input validation and sanitization functions for UPnP Manager
//!
//! Rule rows are edited as free text, so the port column is parsed leniently:
//! anything that is not a port number yields `None` and the row stays
//! incomplete instead of being rejected.

/// Maximum description length sent to the gateway.
///
/// Many consumer routers truncate or reject longer `NewPortMappingDescription`
/// values.
pub const MAX_DESCRIPTION_CHARS: usize = 64;

/// Sanitizes a rule name for use as a gateway mapping description.
///
/// Removes control characters and limits length to [`MAX_DESCRIPTION_CHARS`]
/// characters. Markup characters are left alone; the SOAP client escapes them.
///
/// # Examples
///
/// ```
/// use upnp_manager::validators::sanitize_description;
///
/// assert_eq!(sanitize_description("Minecraft"), "Minecraft");
/// assert_eq!(sanitize_description("Web\nServer"), "WebServer");
/// ```
pub fn sanitize_description(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_DESCRIPTION_CHARS)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Parses a port cell.
///
/// Returns `None` for empty, non-numeric, zero, or out-of-range input.
pub fn parse_port(input: &str) -> Option<u16> {
    input
        .trim()
        .parse::<u16>()
        .ok()
        .and_then(|p| validate_port(p).ok())
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Checks if a port is well-known and returns informational message.
///
/// This is informational only and does not block saving. Many gateways
/// refuse UPnP mappings for privileged external ports.
pub fn check_well_known_port(port: u16) -> Option<String> {
    if port < 1024 {
        let name = match port {
            22 => "SSH",
            80 => "HTTP",
            443 => "HTTPS",
            53 => "DNS",
            25 => "SMTP",
            21 => "FTP",
            _ => {
                return Some(format!(
                    "Privileged port {port} (some gateways refuse these)"
                ));
            }
        };
        Some(format!("Port {port}: {name} (exposed to the internet when active)"))
    } else if port == 3389 {
        Some("Port 3389: RDP (exposed to the internet when active)".to_string())
    } else {
        None
    }
}
