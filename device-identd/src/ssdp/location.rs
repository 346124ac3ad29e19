use std::time::Duration;
use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use shared::types::{HostEvent, SsdpDescription};
use crate::config::SsdpConfig;

/// Description URL announced by a host whose SSDP bundle just changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationRequest {
    pub mac_address: String,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HttpUrl {
    host: String,
    port: u16,
    path: String,
}

impl HttpUrl {
    fn parse(location: &str) -> Result<Self> {
        let rest = location
            .strip_prefix("http://")
            .with_context(|| format!("Unsupported location URL: {}", location))?;

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .with_context(|| format!("Malformed IPv6 host in {}", location))?;
            (host, after.strip_prefix(':'))
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            bail!("Missing host in location URL: {}", location);
        }

        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .with_context(|| format!("Invalid port in location URL: {}", location))?,
            None => 80,
        };

        Ok(Self {
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }
}

/// Fetch the UPnP device description at `location`
pub async fn fetch_description(location: &str, timeout: Duration, max_bytes: usize) -> Result<SsdpDescription> {
    let url = HttpUrl::parse(location)?;
    let body = tokio::time::timeout(timeout, http_get(&url, max_bytes))
        .await
        .with_context(|| format!("Timed out fetching {}", location))??;

    Ok(parse_description(&body))
}

// HTTP/1.0 so the device answers without chunked encoding.
async fn http_get(url: &HttpUrl, max_bytes: usize) -> Result<String> {
    let mut stream = TcpStream::connect((url.host.as_str(), url.port))
        .await
        .with_context(|| format!("Failed to connect to {}:{}", url.host, url.port))?;

    let host_header = if url.host.contains(':') {
        format!("[{}]:{}", url.host, url.port)
    } else {
        format!("{}:{}", url.host, url.port)
    };
    let request = format!(
        "GET {} HTTP/1.0\r\nHost: {}\r\nUser-Agent: device-identd/{}\r\nConnection: close\r\n\r\n",
        url.path,
        host_header,
        env!("CARGO_PKG_VERSION")
    );
    stream
        .write_all(request.as_bytes())
        .await
        .context("Failed to send location request")?;

    let mut response = Vec::new();
    (&mut stream)
        .take(max_bytes as u64)
        .read_to_end(&mut response)
        .await
        .context("Failed to read location response")?;

    let response = String::from_utf8_lossy(&response);
    let (head, body) = response
        .split_once("\r\n\r\n")
        .context("Malformed HTTP response")?;

    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or_default();
    if status != "200" {
        bail!("Location request returned status {:?}", status);
    }

    Ok(body.to_string())
}

/// Extract device fields from a UPnP description document.
/// The first occurrence of each element wins, which is the root device's.
pub fn parse_description(xml: &str) -> SsdpDescription {
    SsdpDescription {
        friendly_name: element_text(xml, "friendlyName"),
        manufacturer: element_text(xml, "manufacturer"),
        manufacturer_url: element_text(xml, "manufacturerURL"),
        model_name: element_text(xml, "modelName"),
        model_url: element_text(xml, "modelURL"),
        serial_number: element_text(xml, "serialNumber"),
    }
}

fn element_text(xml: &str, name: &str) -> String {
    let open = format!("<{}>", name);
    let close = format!("</{}>", name);
    xml.find(&open)
        .map(|start| &xml[start + open.len()..])
        .and_then(|rest| rest.find(&close).map(|end| &rest[..end]))
        .map(|text| unescape(text.trim()))
        .unwrap_or_default()
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Fetch location descriptions as requests arrive and feed the results back as host events
pub async fn run_fetcher(
    mut rx: mpsc::Receiver<LocationRequest>,
    tx: mpsc::Sender<HostEvent>,
    config: SsdpConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let timeout = Duration::from_secs(config.fetch_timeout_secs);

    loop {
        tokio::select! {
            Some(request) = rx.recv() => {
                let tx = tx.clone();
                let max_bytes = config.max_description_bytes;
                tokio::spawn(async move {
                    match fetch_description(&request.location, timeout, max_bytes).await {
                        Ok(description) => {
                            let event = HostEvent::SsdpLocation {
                                mac_address: request.mac_address,
                                location: request.location,
                                description,
                            };
                            if let Err(e) = tx.send(event).await {
                                tracing::error!("Failed to send location event: {}", e);
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Failed to fetch SSDP location {}: {:#}", request.location, e);
                        }
                    }
                });
            }
            _ = cancel.cancelled() => {
                tracing::info!("SSDP location fetcher shutting down");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const DESCRIPTION: &str = r#"<?xml version="1.0" encoding="UTF-8" ?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <deviceType>urn:schemas-upnp-org:device:Basic:1</deviceType>
    <friendlyName>Philips hue (192.168.1.20)</friendlyName>
    <manufacturer>Royal Philips Electronics</manufacturer>
    <manufacturerURL>http://www.philips.com</manufacturerURL>
    <modelName>Philips hue bridge 2015</modelName>
    <modelURL>http://www.meethue.com</modelURL>
    <serialNumber>001788aabbcc</serialNumber>
    <deviceList>
      <device><friendlyName>Embedded &amp; ignored</friendlyName></device>
    </deviceList>
  </device>
</root>"#;

    #[test]
    fn test_parse_url() {
        assert_eq!(
            HttpUrl::parse("http://192.168.1.20:80/description.xml").unwrap(),
            HttpUrl {
                host: "192.168.1.20".to_string(),
                port: 80,
                path: "/description.xml".to_string(),
            }
        );
        assert_eq!(
            HttpUrl::parse("http://192.168.1.21").unwrap(),
            HttpUrl {
                host: "192.168.1.21".to_string(),
                port: 80,
                path: "/".to_string(),
            }
        );
        assert_eq!(HttpUrl::parse("http://[fe80::1]:49152/desc.xml").unwrap().host, "fe80::1");
        assert_eq!(HttpUrl::parse("http://[fe80::1]:49152/desc.xml").unwrap().port, 49152);

        assert!(HttpUrl::parse("https://192.168.1.20/desc.xml").is_err());
        assert!(HttpUrl::parse("http://192.168.1.20:notaport/").is_err());
        assert!(HttpUrl::parse("http:///desc.xml").is_err());
    }

    #[test]
    fn test_parse_description() {
        let description = parse_description(DESCRIPTION);
        assert_eq!(description.friendly_name, "Philips hue (192.168.1.20)");
        assert_eq!(description.manufacturer, "Royal Philips Electronics");
        assert_eq!(description.manufacturer_url, "http://www.philips.com");
        assert_eq!(description.model_name, "Philips hue bridge 2015");
        assert_eq!(description.model_url, "http://www.meethue.com");
        assert_eq!(description.serial_number, "001788aabbcc");
    }

    #[test]
    fn test_parse_description_missing_fields() {
        let description = parse_description("<root><device><modelName>A &amp; B</modelName></device></root>");
        assert_eq!(description.model_name, "A & B");
        assert_eq!(description.manufacturer, "");
    }

    #[tokio::test]
    async fn test_fetch_description_from_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            let response = format!(
                "HTTP/1.0 200 OK\r\nContent-Type: text/xml\r\n\r\n{}",
                DESCRIPTION
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        let location = format!("http://{}/description.xml", addr);
        let description = fetch_description(&location, Duration::from_secs(5), 65_536)
            .await
            .unwrap();
        assert_eq!(description.model_name, "Philips hue bridge 2015");
    }

    #[tokio::test]
    async fn test_fetch_description_rejects_error_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(b"HTTP/1.0 404 Not Found\r\n\r\n").await.unwrap();
        });

        let location = format!("http://{}/missing.xml", addr);
        assert!(fetch_description(&location, Duration::from_secs(5), 65_536).await.is_err());
    }
}
