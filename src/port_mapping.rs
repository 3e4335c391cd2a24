/**
 * port_mapping.rs
 *
 * UPnP forwarding of a host's listening port
 * Best effort: a missing gateway never fails the session
 */

#[cfg(feature = "upnp")]
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Gateway discovery, and separately removal of the mapping on close
#[cfg(feature = "upnp")]
const GATEWAY_TIMEOUT: Duration = Duration::from_secs(3);

/// Forward TCP `port` on the gateway until `token` fires, then remove it.
#[cfg(feature = "upnp")]
pub(crate) async fn forward(port: u16, token: CancellationToken) {
    use igd_next::aio::tokio::search_gateway;
    use igd_next::{PortMappingProtocol, SearchOptions};
    use std::net::SocketAddr;
    use tracing::info;

    let search = SearchOptions {
        timeout: Some(GATEWAY_TIMEOUT),
        ..Default::default()
    };
    let gateway = tokio::select! {
        biased;
        _ = token.cancelled() => return,
        found = search_gateway(search) => match found {
            Ok(gateway) => gateway,
            Err(e) => {
                warn!(port, error = %e, "no UPnP gateway, port not forwarded");
                return;
            }
        },
    };

    let local_ip = match local_ip_towards(gateway.addr).await {
        Ok(ip) => ip,
        Err(e) => {
            warn!(port, gateway = %gateway.addr, error = %e, "no route to UPnP gateway");
            return;
        }
    };

    let local = SocketAddr::new(local_ip, port);
    let mapping = gateway.add_port(PortMappingProtocol::TCP, port, local, 0, "NetPlay");
    match tokio::time::timeout(GATEWAY_TIMEOUT, mapping).await {
        Ok(Ok(())) => info!(port, gateway = %gateway.addr, "port forwarded through UPnP"),
        Ok(Err(e)) => {
            warn!(port, error = %e, "UPnP port mapping refused");
            return;
        }
        Err(_) => {
            warn!(port, "timed out asking the gateway for a port mapping");
            return;
        }
    }

    token.cancelled().await;
    let removal = gateway.remove_port(PortMappingProtocol::TCP, port);
    match tokio::time::timeout(GATEWAY_TIMEOUT, removal).await {
        Ok(Ok(())) => info!(port, "UPnP port mapping removed"),
        Ok(Err(e)) => warn!(port, error = %e, "failed to remove UPnP port mapping"),
        Err(_) => warn!(port, "timed out removing UPnP port mapping"),
    }
}

#[cfg(not(feature = "upnp"))]
pub(crate) async fn forward(port: u16, _token: CancellationToken) {
    warn!(port, "built without UPnP support, port not forwarded");
}

/// Address of the interface that routes to `gateway`
#[cfg(feature = "upnp")]
async fn local_ip_towards(gateway: std::net::SocketAddr) -> std::io::Result<std::net::IpAddr> {
    let any = if gateway.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = tokio::net::UdpSocket::bind(any).await?;
    socket.connect(gateway).await?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancelled_forward_returns_promptly() {
        let token = CancellationToken::new();
        token.cancel();
        let done = tokio::time::timeout(Duration::from_secs(1), forward(2626, token)).await;
        assert!(done.is_ok());
    }

    #[cfg(feature = "upnp")]
    #[tokio::test]
    async fn loopback_gateway_routes_through_loopback() {
        let ip = local_ip_towards("127.0.0.1:1900".parse().unwrap())
            .await
            .unwrap();
        assert!(ip.is_loopback());
    }
}
