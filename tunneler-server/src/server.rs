use std::fmt::Debug;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use mockall::automock;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tunneler_core::net::accept_with_backoff;
use tunneler_core::session::{Role, Session};
use tunneler_core::transport::websocket_transport;
use tunneler_core::Responder;

use crate::{AppArguments, Result};

#[automock]
#[async_trait]
pub trait Listener: Debug + Sync + Send {
    fn listen_ip(&self) -> Result<SocketAddr>;
    async fn accept(&mut self) -> Result<(TcpStream, SocketAddr)>;
}

#[derive(Debug)]
pub struct DefaultListener {
    listener: TcpListener,
}

impl DefaultListener {
    pub async fn bind(ip: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(ip).await?;
        Ok(Self { listener })
    }
}

#[async_trait]
impl Listener for DefaultListener {
    fn listen_ip(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    async fn accept(&mut self) -> Result<(TcpStream, SocketAddr)> {
        Ok(accept_with_backoff(&self.listener).await?)
    }
}

/// Accepts websocket clients and serves each one with its own session.
#[derive(Debug)]
pub struct Server {
    args: Arc<AppArguments>,
    server_listener: Box<dyn Listener>,
}

impl Server {
    pub fn new(args: AppArguments, listener: Box<dyn Listener>) -> Self {
        Self {
            args: Arc::new(args),
            server_listener: listener,
        }
    }

    pub fn get_listen_ip(&self) -> Result<SocketAddr> {
        self.server_listener.listen_ip()
    }

    /// Serves clients until `shutdown_signal` resolves or accepting fails for good.
    pub async fn run(&mut self, shutdown_signal: impl Future) -> Result<()> {
        let cancellation_token = CancellationToken::new();
        let result = tokio::select! {
            result = self.start(cancellation_token.child_token()) => result,
            _ = shutdown_signal => {
                info!("server is being shut down.");
                Ok(())
            }
        };

        cancellation_token.cancel();
        result
    }

    async fn start(&mut self, cancellation_token: CancellationToken) -> Result<()> {
        info!("listening on {}", self.get_listen_ip()?);

        while !cancellation_token.is_cancelled() {
            let (socket, addr) = self.server_listener.accept().await?;

            let args = self.args.clone();
            let cancellation_token = cancellation_token.child_token();
            tokio::spawn(async move {
                match serve_client(socket, args, cancellation_token).await {
                    Ok(_) => debug!("client {} disconnected gracefully.", addr),
                    Err(err) => debug!("client {} disconnected with error.. {}", addr, err),
                };
            });
        }

        Ok(())
    }
}

async fn serve_client(
    socket: TcpStream,
    args: Arc<AppArguments>,
    cancellation_token: CancellationToken,
) -> Result<()> {
    let expected = format!("Bearer {}", args.token());
    let websocket = accept_hdr_async(socket, |request: &Request, response: Response| {
        if is_authorized(request, &expected) {
            Ok(response)
        } else {
            warn!("rejecting client with missing or invalid token.");
            Err(unauthorized())
        }
    })
    .await?;

    let (reader, writer) = websocket_transport(websocket);
    let session = Session::spawn(Role::Server, args.session_config(), reader, writer);
    info!("client session started.");

    let result = tokio::select! {
        result = Responder::new(session.clone()).run() => result,
        _ = cancellation_token.cancelled() => Ok(()),
    };

    session.close();
    info!("client session finished.");
    Ok(result?)
}

pub fn is_authorized(request: &Request, expected: &str) -> bool {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value == expected)
        .unwrap_or(false)
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("missing or invalid bearer token".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    fn request(authorization: Option<&str>) -> Request {
        let mut builder = Request::builder().uri("ws://127.0.0.1:9000/");
        if let Some(value) = authorization {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn should_authorize_matching_bearer() {
        assert!(is_authorized(&request(Some("Bearer abc")), "Bearer abc"));
    }

    #[test]
    fn should_refuse_wrong_or_missing_token() {
        assert!(!is_authorized(&request(Some("Bearer nope")), "Bearer abc"));
        assert!(!is_authorized(&request(Some("abc")), "Bearer abc"));
        assert!(!is_authorized(&request(None), "Bearer abc"));
    }

    #[test]
    fn unauthorized_response_is_401() {
        // Act
        let response = unauthorized();

        // Assert
        assert_eq!(StatusCode::UNAUTHORIZED, response.status());
    }

    #[tokio::test]
    async fn accept_failure_stops_the_server() {
        // Arrange
        let mut listener = MockListener::new();
        listener
            .expect_listen_ip()
            .returning(|| Ok("127.0.0.1:9000".parse().unwrap()));
        listener.expect_accept().times(1).returning(|| {
            Err(io::Error::new(io::ErrorKind::Other, "too many open files").into())
        });
        let args = AppArguments::new("127.0.0.1:9000".parse().unwrap(), "abc");
        let mut server = Server::new(args, Box::new(listener));

        // Act
        let result = server.run(std::future::pending::<()>()).await;

        // Assert
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_server() {
        // Arrange
        let listener = DefaultListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let args = AppArguments::new("127.0.0.1:0".parse().unwrap(), "abc");
        let mut server = Server::new(args, Box::new(listener));

        // Act
        let result = server.run(async {}).await;

        // Assert
        assert!(result.is_ok());
    }
}
