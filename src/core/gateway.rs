//! Gateway access
//!
//! [`GatewayClient`] is the seam between the reconciliation engine and the
//! network. [`UpnpGatewayClient`] implements it on top of `igd-next`, which
//! owns the SSDP search and the SOAP control calls.

use crate::core::error::{Error, Result};
use crate::core::mapping::{MappingAction, Protocol};
use crate::validators::sanitize_description;
use igd_next::aio::Gateway;
use igd_next::aio::tokio::{Tokio, search_gateway};
use igd_next::{AddPortError, PortMappingProtocol, RemovePortError, SearchError, SearchOptions};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long discovery waits for a gateway before giving up
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Extra time given to the library's own search timer so ours always fires first
const SEARCH_GRACE: Duration = Duration::from_secs(1);

/// Discovery and mapping operations against one gateway.
///
/// Implementations must make both mapping calls idempotent: creating a
/// mapping that already exists and deleting one that is already gone are
/// both successes.
pub trait GatewayClient {
    /// A discovered gateway, valid until the network changes
    type Handle;

    /// Finds a gateway on the local network.
    ///
    /// Fails with [`Error::DiscoveryTimeout`] when nothing answers within
    /// `timeout` and [`Error::Discovery`] on transport faults.
    fn discover(&self, timeout: Duration) -> impl Future<Output = Result<Self::Handle>>;

    /// Maps external `port` to the same internal `port` on this host.
    fn create_mapping(
        &self,
        handle: &Self::Handle,
        port: u16,
        protocol: Protocol,
        description: &str,
    ) -> impl Future<Output = Result<()>>;

    /// Removes the mapping for external `port`.
    fn delete_mapping(
        &self,
        handle: &Self::Handle,
        port: u16,
        protocol: Protocol,
    ) -> impl Future<Output = Result<()>>;
}

impl From<Protocol> for PortMappingProtocol {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Tcp => PortMappingProtocol::TCP,
            Protocol::Udp => PortMappingProtocol::UDP,
        }
    }
}

/// UPnP IGD client backed by `igd-next`.
#[derive(Debug, Clone, Default)]
pub struct UpnpGatewayClient {
    /// Requested lease in seconds; 0 asks for a permanent mapping
    lease_duration: u32,
}

impl UpnpGatewayClient {
    pub fn new(lease_duration: u32) -> Self {
        Self { lease_duration }
    }

    pub fn lease_duration(&self) -> u32 {
        self.lease_duration
    }
}

/// Returns the local address the OS would use to reach `gateway`.
///
/// Connecting a UDP socket sends nothing; it only resolves the route.
async fn local_addr_for(gateway: SocketAddr) -> std::io::Result<IpAddr> {
    let bind: SocketAddr = match gateway {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = tokio::net::UdpSocket::bind(bind).await?;
    socket.connect(gateway).await?;
    Ok(socket.local_addr()?.ip())
}

/// Runs a gateway search under our own timer.
///
/// Expiry of `timeout` is reported as [`Error::DiscoveryTimeout`]; any
/// error from the search itself becomes [`Error::Discovery`].
async fn bounded_search<T>(
    timeout: Duration,
    search: impl Future<Output = std::result::Result<T, SearchError>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, search).await {
        Ok(Ok(found)) => Ok(found),
        Ok(Err(e)) => {
            warn!("Gateway discovery failed: {e}");
            Err(Error::Discovery(e.to_string()))
        }
        Err(_) => {
            warn!("No UPnP gateway responded within {timeout:?}");
            Err(Error::DiscoveryTimeout(timeout))
        }
    }
}

fn mapping_error(action: MappingAction, port: u16, protocol: Protocol, message: impl ToString) -> Error {
    Error::Mapping {
        action,
        port,
        protocol,
        message: message.to_string(),
    }
}

impl GatewayClient for UpnpGatewayClient {
    type Handle = Gateway<Tokio>;

    async fn discover(&self, timeout: Duration) -> Result<Self::Handle> {
        let options = SearchOptions {
            timeout: Some(timeout + SEARCH_GRACE),
            ..Default::default()
        };

        debug!("Searching for UPnP gateway (timeout {timeout:?})");

        let gateway = bounded_search(timeout, search_gateway(options)).await?;
        info!("Found UPnP gateway at {}", gateway.addr);
        Ok(gateway)
    }

    async fn create_mapping(
        &self,
        handle: &Self::Handle,
        port: u16,
        protocol: Protocol,
        description: &str,
    ) -> Result<()> {
        let action = MappingAction::Create;
        let local_ip = local_addr_for(handle.addr)
            .await
            .map_err(|e| mapping_error(action, port, protocol, e))?;
        let local_addr = SocketAddr::new(local_ip, port);
        let description = sanitize_description(description);

        debug!("Requesting mapping {port}/{protocol} -> {local_addr} \"{description}\"");

        let result = handle
            .add_port(protocol.into(), port, local_addr, self.lease_duration, &description)
            .await;

        match result {
            Ok(()) => {}
            Err(AddPortError::OnlyPermanentLeasesSupported) if self.lease_duration != 0 => {
                warn!("Gateway only supports permanent leases; retrying {port}/{protocol} with lease 0");
                if let Err(e) = handle
                    .add_port(protocol.into(), port, local_addr, 0, &description)
                    .await
                {
                    warn!("Gateway refused permanent mapping {port}/{protocol}: {e}");
                    return Err(mapping_error(action, port, protocol, e));
                }
            }
            Err(e) => {
                warn!("Gateway refused mapping {port}/{protocol}: {e}");
                return Err(mapping_error(action, port, protocol, e));
            }
        }

        info!("Mapped {port}/{protocol} to {local_addr}");
        Ok(())
    }

    async fn delete_mapping(&self, handle: &Self::Handle, port: u16, protocol: Protocol) -> Result<()> {
        match handle.remove_port(protocol.into(), port).await {
            Ok(()) => {
                info!("Removed mapping {port}/{protocol}");
                Ok(())
            }
            Err(RemovePortError::NoSuchPortMapping) => {
                debug!("Mapping {port}/{protocol} was already absent");
                Ok(())
            }
            Err(e) => {
                warn!("Gateway failed to remove mapping {port}/{protocol}: {e}");
                Err(mapping_error(MappingAction::Delete, port, protocol, e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const ADD_ARGS: [&str; 8] = [
        "NewRemoteHost",
        "NewExternalPort",
        "NewProtocol",
        "NewInternalPort",
        "NewInternalClient",
        "NewEnabled",
        "NewPortMappingDescription",
        "NewLeaseDuration",
    ];
    const DELETE_ARGS: [&str; 3] = ["NewRemoteHost", "NewExternalPort", "NewProtocol"];

    fn soap_ok(action: &str) -> String {
        format!(
            r#"<?xml version="1.0"?><s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body><u:{action}Response xmlns:u="urn:schemas-upnp-org:service:WANIPConnection:1"/></s:Body></s:Envelope>"#
        )
    }

    fn soap_fault(code: u16, description: &str) -> String {
        format!(
            r#"<?xml version="1.0"?><s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body><s:Fault><faultcode>s:Client</faultcode><faultstring>UPnPError</faultstring><detail><UPnPError xmlns="urn:schemas-upnp-org:control-1-0"><errorCode>{code}</errorCode><errorDescription>{description}</errorDescription></UPnPError></detail></s:Fault></s:Body></s:Envelope>"#
        )
    }

    async fn read_request_body(stream: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return String::new();
            }
            data.extend_from_slice(&chunk[..n]);

            let text = String::from_utf8_lossy(&data);
            if let Some(split) = text.find("\r\n\r\n") {
                let length = text[..split]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                let start = split + 4;
                if text.len() >= start + length {
                    return text[start..start + length].to_string();
                }
            }
        }
    }

    /// Serves one scripted SOAP reply per connection on loopback and
    /// records each request body.
    async fn fake_gateway(replies: Vec<String>) -> (Gateway<Tokio>, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        tokio::spawn(async move {
            for reply in replies {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let body = read_request_body(&mut stream).await;
                seen.lock().unwrap().push(body);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{reply}",
                    reply.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        let schema = |args: &[&str]| args.iter().map(ToString::to_string).collect::<Vec<_>>();
        let gateway = Gateway {
            addr,
            root_url: "/rootDesc.xml".to_string(),
            control_url: "/ctl/IPConn".to_string(),
            control_schema_url: "/WANIPCn.xml".to_string(),
            control_schema: HashMap::from([
                ("AddPortMapping".to_string(), schema(&ADD_ARGS)),
                ("DeletePortMapping".to_string(), schema(&DELETE_ARGS)),
            ]),
            provider: Tokio,
        };
        (gateway, requests)
    }

    #[test]
    fn test_protocol_conversion() {
        assert_eq!(
            PortMappingProtocol::from(Protocol::Tcp),
            PortMappingProtocol::TCP
        );
        assert_eq!(
            PortMappingProtocol::from(Protocol::Udp),
            PortMappingProtocol::UDP
        );
    }

    #[test]
    fn test_default_client_requests_permanent_leases() {
        assert_eq!(UpnpGatewayClient::default().lease_duration(), 0);
        assert_eq!(UpnpGatewayClient::new(3600).lease_duration(), 3600);
    }

    #[tokio::test]
    async fn test_local_addr_for_loopback() {
        let ip = local_addr_for("127.0.0.1:1900".parse().unwrap()).await.unwrap();
        assert!(ip.is_loopback());
    }

    #[tokio::test]
    async fn test_create_sends_sanitized_description() {
        let (gateway, requests) = fake_gateway(vec![soap_ok("AddPortMapping")]).await;
        let client = UpnpGatewayClient::default();

        client
            .create_mapping(&gateway, 8080, Protocol::Tcp, "web\nserver\u{7}")
            .await
            .unwrap();

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let body = &requests[0];
        assert!(body.contains("<NewPortMappingDescription>webserver</NewPortMappingDescription>"));
        assert!(body.contains("<NewExternalPort>8080</NewExternalPort>"));
        assert!(body.contains("<NewInternalPort>8080</NewInternalPort>"));
        assert!(body.contains("<NewInternalClient>127.0.0.1</NewInternalClient>"));
        assert!(body.contains("<NewProtocol>TCP</NewProtocol>"));
        assert!(body.contains("<NewLeaseDuration>0</NewLeaseDuration>"));
    }

    #[tokio::test]
    async fn test_create_falls_back_to_permanent_lease_once() {
        let (gateway, requests) = fake_gateway(vec![
            soap_fault(725, "OnlyPermanentLeasesSupported"),
            soap_ok("AddPortMapping"),
        ])
        .await;
        let client = UpnpGatewayClient::new(3600);

        client
            .create_mapping(&gateway, 27015, Protocol::Udp, "game")
            .await
            .unwrap();

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].contains("<NewLeaseDuration>3600</NewLeaseDuration>"));
        assert!(requests[1].contains("<NewLeaseDuration>0</NewLeaseDuration>"));
    }

    #[tokio::test]
    async fn test_failed_permanent_fallback_is_mapping_error() {
        let (gateway, requests) = fake_gateway(vec![
            soap_fault(725, "OnlyPermanentLeasesSupported"),
            soap_fault(606, "Action not authorized"),
        ])
        .await;

        let err = UpnpGatewayClient::new(600)
            .create_mapping(&gateway, 25565, Protocol::Tcp, "minecraft")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Mapping {
                action: MappingAction::Create,
                port: 25565,
                ..
            }
        ));
        assert!(err.translate().user_message.contains("refused"));
        assert_eq!(requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_create_with_permanent_lease_does_not_retry_725() {
        let (gateway, requests) =
            fake_gateway(vec![soap_fault(725, "OnlyPermanentLeasesSupported")]).await;
        let client = UpnpGatewayClient::default();

        let err = client
            .create_mapping(&gateway, 27015, Protocol::Udp, "game")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Mapping {
                action: MappingAction::Create,
                port: 27015,
                protocol: Protocol::Udp,
                ..
            }
        ));
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_conflict_is_mapping_error() {
        let (gateway, _) = fake_gateway(vec![soap_fault(718, "ConflictInMappingEntry")]).await;

        let err = UpnpGatewayClient::default()
            .create_mapping(&gateway, 80, Protocol::Tcp, "http")
            .await
            .unwrap_err();

        assert!(err.is_gateway_error());
        assert!(matches!(err, Error::Mapping { port: 80, .. }));
    }

    #[tokio::test]
    async fn test_delete_missing_mapping_succeeds() {
        let (gateway, requests) = fake_gateway(vec![soap_fault(714, "NoSuchEntryInArray")]).await;

        UpnpGatewayClient::default()
            .delete_mapping(&gateway, 8080, Protocol::Tcp)
            .await
            .unwrap();

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].contains("<NewExternalPort>8080</NewExternalPort>"));
    }

    #[tokio::test]
    async fn test_delete_failure_is_mapping_error() {
        let (gateway, _) = fake_gateway(vec![soap_fault(501, "ActionFailed")]).await;

        let err = UpnpGatewayClient::default()
            .delete_mapping(&gateway, 8080, Protocol::Tcp)
            .await
            .unwrap_err();

        match err {
            Error::Mapping {
                action, message, ..
            } => {
                assert_eq!(action, MappingAction::Delete);
                assert!(message.contains("501"));
            }
            other => panic!("expected mapping error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_search_that_never_answers_times_out() {
        let timeout = Duration::from_millis(50);
        let search = std::future::pending::<std::result::Result<(), SearchError>>();

        let err = bounded_search(timeout, search).await.unwrap_err();

        assert!(matches!(err, Error::DiscoveryTimeout(t) if t == timeout));
    }

    #[tokio::test]
    async fn test_search_failure_is_discovery_error() {
        let search = async { Err::<(), _>(SearchError::InvalidResponse) };

        let err = bounded_search(Duration::from_secs(1), search).await.unwrap_err();

        assert!(matches!(err, Error::Discovery(_)));
    }

    #[tokio::test]
    async fn test_search_result_passes_through() {
        let found = bounded_search(Duration::from_secs(1), async { Ok::<_, SearchError>(7) })
            .await
            .unwrap();
        assert_eq!(found, 7);
    }
}
