use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Uri};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{client_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use tunneler_core::net::dial_tcp;
use tunneler_core::HostPort;

use crate::config::ClientConfig;
use crate::Result;

pub type ServerSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const MAX_PROXY_RESPONSE: usize = 8 * 1024;

/// Opens the websocket to the configured server, through the proxy when one
/// is configured, authenticating with the bearer token.
pub async fn connect(config: &ClientConfig) -> Result<ServerSocket> {
    let token = config.token().ok_or("need to specify Token in configuration")?;
    let request = build_request(config.server(), token)?;
    let server = server_address(request.uri())?;

    let stream = match config.proxy() {
        Some(proxy) => {
            info!("using proxy at {}", proxy);
            connect_via_proxy(proxy, &server).await?
        }
        None => dial_tcp(&server).await?,
    };

    let (socket, response) =
        client_async_tls_with_config(request, stream, Some(websocket_config(config)), None)
            .await?;

    info!("connected to {}", config.server());
    debug!("handshake answered with {}", response.status());

    Ok(socket)
}

pub fn build_request(server: &str, token: &str) -> Result<Request> {
    let mut request = server.into_client_request()?;
    let authorization = HeaderValue::from_str(&format!("Bearer {}", token))?;
    request.headers_mut().insert(AUTHORIZATION, authorization);

    Ok(request)
}

/// Host and port the TCP connection for `uri` goes to.
pub fn server_address(uri: &Uri) -> Result<HostPort> {
    let host = uri
        .host()
        .ok_or_else(|| format!("server url {} has no host", uri))?;
    let default_port = match uri.scheme_str() {
        Some("wss") | Some("https") => 443,
        _ => 80,
    };

    Ok(HostPort::new(
        host.trim_start_matches('[').trim_end_matches(']'),
        uri.port_u16().unwrap_or(default_port),
    ))
}

fn websocket_config(config: &ClientConfig) -> WebSocketConfig {
    let mut websocket = WebSocketConfig::default();
    if let Some(size) = config.read_buffer_size() {
        websocket = websocket.read_buffer_size(size);
    }
    if let Some(size) = config.write_buffer_size() {
        websocket = websocket.write_buffer_size(size);
    }

    websocket
}

/// Dials an HTTP proxy and tunnels to `target` with `CONNECT`.
pub async fn connect_via_proxy(proxy: &str, target: &HostPort) -> Result<TcpStream> {
    let uri: Uri = proxy.parse()?;
    match uri.scheme_str() {
        Some("http") | None => {}
        Some(scheme) => return Err(format!("unsupported proxy scheme {}", scheme).into()),
    }

    let host = uri
        .host()
        .ok_or_else(|| format!("proxy url {} has no host", proxy))?;
    let address = HostPort::new(
        host.trim_start_matches('[').trim_end_matches(']'),
        uri.port_u16().unwrap_or(80),
    );

    let mut stream = dial_tcp(&address).await?;
    proxy_handshake(&mut stream, target).await?;

    Ok(stream)
}

/// Sends `CONNECT` and consumes the proxy's response header, leaving the
/// stream positioned at the first tunnelled byte.
pub async fn proxy_handshake<S>(stream: &mut S, target: &HostPort) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", target);
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() >= MAX_PROXY_RESPONSE {
            return Err("proxy response header too large".into());
        }

        if 0 == stream.read(&mut byte).await? {
            return Err("proxy closed the connection during CONNECT".into());
        }
        response.push(byte[0]);
    }

    let response = String::from_utf8_lossy(&response);
    let status_line = response.lines().next().unwrap_or_default();
    match status_line.split_whitespace().nth(1) {
        Some(code) if code.starts_with('2') => {
            debug!("proxy tunnel to {} established", target);
            Ok(())
        }
        _ => Err(format!("proxy refused CONNECT to {}: {}", target, status_line).into()),
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::io::Builder;

    use super::*;

    #[test]
    fn request_carries_bearer_token() {
        // Act
        let request = build_request("ws://127.0.0.1:9000", "s3cret").unwrap();

        // Assert
        assert_eq!(
            "Bearer s3cret",
            request.headers().get(AUTHORIZATION).unwrap().to_str().unwrap()
        );
    }

    #[test]
    fn server_address_uses_scheme_default_port() {
        // Arrange
        let secure: Uri = "wss://tunnel.example.com/ws".parse().unwrap();
        let plain: Uri = "ws://[::1]:9000".parse().unwrap();

        // Act
        let secure = server_address(&secure).unwrap();
        let plain = server_address(&plain).unwrap();

        // Assert
        assert_eq!(HostPort::new("tunnel.example.com", 443), secure);
        assert_eq!(HostPort::new("::1", 9000), plain);
    }

    #[tokio::test]
    async fn proxy_handshake_accepts_200() {
        // Arrange
        let mut mock = Builder::new()
            .write(b"CONNECT tunnel.example.com:443 HTTP/1.1\r\nHost: tunnel.example.com:443\r\n\r\n")
            .read(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .build();

        // Act
        let result = proxy_handshake(&mut mock, &HostPort::new("tunnel.example.com", 443)).await;

        // Assert
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn proxy_handshake_rejects_error_status() {
        // Arrange
        let mut mock = Builder::new()
            .write(b"CONNECT 10.0.0.1:9000 HTTP/1.1\r\nHost: 10.0.0.1:9000\r\n\r\n")
            .read(b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n")
            .build();

        // Act
        let result = proxy_handshake(&mut mock, &HostPort::new("10.0.0.1", 9000)).await;

        // Assert
        let err = result.unwrap_err();
        assert!(err.to_string().contains("407"));
    }

    #[tokio::test]
    async fn proxy_closing_early_is_an_error() {
        // Arrange
        let mut mock = Builder::new()
            .write(b"CONNECT 10.0.0.1:9000 HTTP/1.1\r\nHost: 10.0.0.1:9000\r\n\r\n")
            .read(b"HTTP/1.1 200")
            .build();

        // Act
        let result = proxy_handshake(&mut mock, &HostPort::new("10.0.0.1", 9000)).await;

        // Assert
        assert!(result.is_err());
    }
}
