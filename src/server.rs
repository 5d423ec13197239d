//! Server bootstrap and outbound connect.
//!
//! Binds a listener per config entry and creates one session (TLS or
//! plain) per accepted connection, each owned by its own reactor task.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::comms::{CommsHandler, CommsHandlerFactory};
use crate::config::{ListenerConfig, TlsListenerConfig};
use crate::reactor::{spawn_plain_session, spawn_tls_session, HandlerRegistry};
use crate::rustls_config::{create_client_config, create_server_config};
use crate::rustls_engine::RustlsEngine;
use crate::session::Role;

/// Bind the configured address and serve connections with handlers from
/// the factory. Returns the accept loop's join handle.
pub async fn start_listener(
    config: ListenerConfig,
    factory: Arc<dyn CommsHandlerFactory>,
) -> std::io::Result<JoinHandle<()>> {
    let server_config = match config.tls {
        Some(TlsListenerConfig { ref cert, ref key }) => {
            let cert_bytes = tokio::fs::read(cert).await?;
            let key_bytes = tokio::fs::read(key).await?;
            Some(Arc::new(create_server_config(&cert_bytes, &key_bytes)?))
        }
        None => None,
    };

    let listener = TcpListener::bind(config.address).await?;
    let registry = HandlerRegistry::new(format!("listener {}", config.address));
    info!(
        "starting {} listener at {}",
        if server_config.is_some() { "tls" } else { "tcp" },
        config.address
    );

    Ok(tokio::spawn(run_accept_loop(
        listener,
        server_config,
        factory,
        registry,
    )))
}

async fn run_accept_loop(
    listener: TcpListener,
    server_config: Option<Arc<rustls::ServerConfig>>,
    factory: Arc<dyn CommsHandlerFactory>,
    registry: Arc<HandlerRegistry>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                error!("accept failed: {:?}", e);
                continue;
            }
        };
        debug!("accepted connection from {}:{}", addr.ip(), addr.port());
        let events = factory.create_handler();
        match server_config {
            Some(ref config) => match RustlsEngine::server(config.clone()) {
                Ok(engine) => spawn_tls_session(
                    stream,
                    Role::Server,
                    Box::new(engine),
                    events,
                    registry.clone(),
                ),
                Err(e) => {
                    error!("could not create tls engine for {}: {}", addr, e);
                }
            },
            None => spawn_plain_session(stream, Role::Server, events, registry.clone()),
        }
    }
}

/// Open an outbound TLS connection; the handler's `on_connect` fires once
/// the handshake completes.
pub async fn connect_tls(
    address: SocketAddr,
    domain: &str,
    verify: bool,
    events: Box<dyn CommsHandler>,
    registry: Arc<HandlerRegistry>,
) -> std::io::Result<()> {
    let stream = TcpStream::connect(address).await?;
    let server_name =
        rustls::pki_types::ServerName::try_from(domain.to_string()).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid server name {domain}: {e}"),
            )
        })?;
    let engine = RustlsEngine::client(create_client_config(verify), server_name)?;
    spawn_tls_session(stream, Role::Client, Box::new(engine), events, registry);
    Ok(())
}

/// Open an outbound plaintext connection; `on_connect` fires immediately.
pub async fn connect_plain(
    address: SocketAddr,
    events: Box<dyn CommsHandler>,
    registry: Arc<HandlerRegistry>,
) -> std::io::Result<()> {
    let stream = TcpStream::connect(address).await?;
    spawn_plain_session(stream, Role::Client, events, registry);
    Ok(())
}
