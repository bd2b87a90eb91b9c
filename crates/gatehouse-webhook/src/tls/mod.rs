//! HTTPS termination in front of the [`Router`] built by the
//! [`Dispatcher`](crate::dispatcher::Dispatcher).
use std::{net::SocketAddr, sync::Arc};

use axum::{Router, extract::Request};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use opentelemetry::trace::{FutureExt as _, SpanKind};
use snafu::{ResultExt, Snafu};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig,
        crypto::ring::default_provider,
        version::{TLS12, TLS13},
    },
};
use tower::ServiceExt as _;
use tracing::{Instrument as _, Span, debug, field::Empty, info, instrument, trace, warn};
use tracing_opentelemetry::OpenTelemetrySpanExt as _;

pub use cert_resolver::{CertificateResolver, CertificateResolverError};

mod cert_resolver;

#[derive(Debug, Snafu)]
pub enum TlsServerError {
    #[snafu(display("failed to bind TCP listener to {socket_addr}"))]
    BindTcpListener {
        source: std::io::Error,
        socket_addr: SocketAddr,
    },

    #[snafu(display("failed to restrict TLS protocol versions"))]
    SetTlsProtocolVersions { source: tokio_rustls::rustls::Error },
}

/// Serves a [`Router`] over HTTPS, speaking HTTP/1.1 and HTTP/2.
///
/// Every handshake asks the [`CertificateResolver`] for the certificate to
/// present, so rotated certificates are served without a restart.
pub struct TlsServer {
    acceptor: TlsAcceptor,
    socket_addr: SocketAddr,
    router: Router,
}

impl TlsServer {
    #[instrument(name = "create_tls_server", skip(router, resolver))]
    pub fn new(
        socket_addr: SocketAddr,
        router: Router,
        resolver: Arc<CertificateResolver>,
    ) -> Result<Self, TlsServerError> {
        let mut config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
            .with_protocol_versions(&[&TLS12, &TLS13])
            .context(SetTlsProtocolVersionsSnafu)?
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            socket_addr,
            router,
        })
    }

    /// Accepts connections until the returned future is dropped. Only fails if
    /// the socket cannot be bound, errors of single connections are logged.
    pub async fn run(self) -> Result<(), TlsServerError> {
        let listener = TcpListener::bind(self.socket_addr)
            .await
            .context(BindTcpListenerSnafu {
                socket_addr: self.socket_addr,
            })?;

        info!(server.address = %self.socket_addr, "webhook server listening");

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    trace!(%err, "failed to accept incoming TCP connection");
                    continue;
                }
            };

            let span = connection_span(&stream, remote_addr);
            tokio::spawn(
                serve_connection(self.acceptor.clone(), self.router.clone(), stream)
                    .instrument(span),
            );
        }
    }
}

async fn serve_connection(acceptor: TlsAcceptor, router: Router, stream: TcpStream) {
    let span = Span::current();

    let stream = match acceptor.accept(stream).await {
        Ok(stream) => stream,
        Err(err) => {
            span.record("otel.status_code", "Error")
                .record("otel.status_message", err.to_string());
            debug!(%err, "TLS handshake failed");
            return;
        }
    };

    // The request handlers run in spans of the TraceLayer, which need the
    // connection span as their OpenTelemetry parent.
    let service = service_fn(move |request: Request<Incoming>| {
        let context = Span::current().context();
        router.clone().oneshot(request).with_context(context)
    });

    if let Err(err) = auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
    {
        span.record("otel.status_code", "Error")
            .record("otel.status_message", err.to_string());
        warn!(%err, "failed to serve connection");
    }
}

fn connection_span(stream: &TcpStream, remote_addr: SocketAddr) -> Span {
    let span = tracing::debug_span!(
        "connection",
        "otel.kind" = ?SpanKind::Server,
        "otel.status_code" = Empty,
        "otel.status_message" = Empty,
        "client.address" = %remote_addr.ip(),
        "client.port" = remote_addr.port(),
        "server.address" = Empty,
        "server.port" = Empty,
        "network.transport" = "tcp",
        "network.type" = network_type(remote_addr),
    );

    if let Ok(local_addr) = stream.local_addr() {
        span.record("server.address", tracing::field::display(local_addr.ip()))
            .record("server.port", local_addr.port());
    }

    span
}

fn network_type(addr: SocketAddr) -> &'static str {
    match addr {
        SocketAddr::V4(_) => "ipv4",
        SocketAddr::V6(_) => "ipv6",
    }
}
