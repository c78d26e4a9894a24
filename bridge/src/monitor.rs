//! Liveness endpoint for the bridge process.

use std::convert::Infallible;
use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Incoming, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn handle_request(
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/") => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::new()))
            .unwrap(),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()))
            .unwrap(),
    };
    Ok(response)
}

/// Serves the monitoring endpoint until the token fires.
pub async fn serve(port: u16, token: CancellationToken) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "Monitoring server listening");
    serve_on(listener, token).await
}

async fn serve_on(listener: TcpListener, token: CancellationToken) -> std::io::Result<()> {
    loop {
        let (stream, remote_addr) = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            res = listener.accept() => res?,
        };
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            let service = service_fn(handle_request);
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(remote_addr = %remote_addr, error = %err, "Connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn answers_liveness_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();

        let serve_token = token.clone();
        tokio::spawn(async move { serve_on(listener, serve_token).await });

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        conn.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));

        token.cancel();
    }
}
