use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

const PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Whether nothing accepts connections on the local port.
pub async fn is_port_free(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    !matches!(timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

/// First port of `min..=max` that is neither taken by a known cluster nor
/// accepting connections.
pub async fn allocate_port(min: u16, max: u16, taken: &HashSet<u16>) -> Option<u16> {
    for port in min..=max {
        if taken.contains(&port) {
            continue;
        }
        if is_port_free(port).await {
            return Some(port);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn listening_port_is_skipped() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let busy = listener.local_addr().unwrap().port();

        assert!(!is_port_free(busy).await);
        let allocated = allocate_port(busy, busy.saturating_add(20), &HashSet::new()).await;
        assert!(matches!(allocated, Some(port) if port != busy));
    }

    #[tokio::test]
    async fn ports_of_known_clusters_are_skipped() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let busy = listener.local_addr().unwrap().port();

        let taken = HashSet::from([busy.saturating_sub(1)]);
        assert_eq!(allocate_port(busy.saturating_sub(1), busy, &taken).await, None);
    }
}
