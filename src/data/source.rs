//! Video source descriptors

use std::fmt;
use std::net::{Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{RecorderError, RecorderResult};

const UNNAMED_SOURCE: &str = "Unnamed Video Source";

/// `host:port`, with IPv6 literals bracketed
fn authority(host: &str, port: u16) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Where a source's bytes come from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    /// Network stream addressed by host and port
    Network { host: String, port: u16 },
    /// Local file
    File { path: PathBuf },
}

impl Locator {
    /// Resolve a network locator to a socket address.
    ///
    /// Fails with [`RecorderError::InvalidAddress`] for file locators and for
    /// hosts that do not resolve.
    pub fn socket_addr(&self) -> RecorderResult<SocketAddr> {
        match self {
            Locator::Network { host, port } => (host.as_str(), *port)
                .to_socket_addrs()
                .map_err(|e| RecorderError::InvalidAddress {
                    address: authority(host, *port),
                    reason: e.to_string(),
                })?
                .next()
                .ok_or_else(|| RecorderError::InvalidAddress {
                    address: authority(host, *port),
                    reason: "host resolved to no addresses".to_string(),
                }),
            Locator::File { path } => Err(RecorderError::InvalidAddress {
                address: path.display().to_string(),
                reason: "file locator has no network address".to_string(),
            }),
        }
    }

    /// Render the locator as a URL the capture engine understands
    pub fn to_url(&self, scheme: &str) -> String {
        match self {
            Locator::Network { host, port } => format!("{}://@{}", scheme, authority(host, *port)),
            Locator::File { path } => path.display().to_string(),
        }
    }
}

/// A named video source. The id is assigned once at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VideoSource {
    id: Uuid,
    name: String,
    locator: Locator,
}

impl VideoSource {
    /// Create a network-addressed source.
    ///
    /// The port is taken as `u32` so out-of-range values coming from
    /// configuration are rejected here instead of silently truncated.
    pub fn network(name: &str, host: &str, port: u32) -> RecorderResult<Self> {
        if !(1..=65535).contains(&port) {
            return Err(RecorderError::InvalidPort(port));
        }
        // Hosts are stored bare; brackets are added back when rendering
        let host = host.trim();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(RecorderError::InvalidAddress {
                address: String::new(),
                reason: "host is empty".to_string(),
            });
        }

        Ok(Self::with_locator(
            name,
            Locator::Network {
                host: host.to_string(),
                port: port as u16,
            },
        ))
    }

    /// Create a file-addressed source
    pub fn file(name: &str, path: impl AsRef<Path>) -> Self {
        Self::with_locator(
            name,
            Locator::File {
                path: path.as_ref().to_path_buf(),
            },
        )
    }

    fn with_locator(name: &str, locator: Locator) -> Self {
        let name = if name.trim().is_empty() {
            UNNAMED_SOURCE.to_string()
        } else {
            name.to_string()
        };

        Self {
            id: Uuid::new_v4(),
            name,
            locator,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }
}

impl fmt::Display for VideoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.locator {
            Locator::Network { host, port } => {
                write!(f, "{} ({})", self.name, authority(host, *port))
            }
            Locator::File { path } => write!(f, "{} ({})", self.name, path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_range_is_validated() {
        assert!(matches!(
            VideoSource::network("cam", "239.0.0.1", 0),
            Err(RecorderError::InvalidPort(0))
        ));
        assert!(matches!(
            VideoSource::network("cam", "239.0.0.1", 65536),
            Err(RecorderError::InvalidPort(65536))
        ));
        assert!(VideoSource::network("cam", "239.0.0.1", 1).is_ok());
        assert!(VideoSource::network("cam", "239.0.0.1", 65535).is_ok());
    }

    #[test]
    fn test_empty_name_gets_default() {
        let source = VideoSource::file("", "/tmp/in.ts");
        assert_eq!(source.name(), UNNAMED_SOURCE);
    }

    #[test]
    fn test_equality_includes_id() {
        let a = VideoSource::network("cam", "239.0.0.1", 5000).unwrap();
        let b = VideoSource::network("cam", "239.0.0.1", 5000).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_locator_urls() {
        let net = VideoSource::network("cam", "239.0.0.1", 5000).unwrap();
        assert_eq!(net.locator().to_url("udp"), "udp://@239.0.0.1:5000");

        let file = VideoSource::file("clip", "/data/in.ts");
        assert_eq!(file.locator().to_url("udp"), "/data/in.ts");
    }

    #[test]
    fn test_ipv6_hosts_are_bracketed() {
        let bare = VideoSource::network("cam", "ff02::1", 5000).unwrap();
        let bracketed = VideoSource::network("cam", "[ff02::1]", 5000).unwrap();
        for source in [&bare, &bracketed] {
            assert_eq!(source.locator().to_url("udp"), "udp://@[ff02::1]:5000");
            assert_eq!(source.to_string(), "cam ([ff02::1]:5000)");
        }

        let loopback = VideoSource::network("cam", "[::1]", 1234).unwrap();
        let addr = loopback.locator().socket_addr().unwrap();
        assert!(addr.is_ipv6());
        assert_eq!(addr.port(), 1234);

        let named = VideoSource::network("cam", "localhost", 5000).unwrap();
        assert_eq!(named.locator().to_url("udp"), "udp://@localhost:5000");
    }

    #[test]
    fn test_socket_addr_resolution() {
        let net = VideoSource::network("cam", "239.1.2.3", 1234).unwrap();
        let addr = net.locator().socket_addr().unwrap();
        assert_eq!(addr.port(), 1234);

        let file = VideoSource::file("clip", "/data/in.ts");
        assert!(matches!(
            file.locator().socket_addr(),
            Err(RecorderError::InvalidAddress { .. })
        ));
    }
}
