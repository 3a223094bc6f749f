//! TCP front end
//!
//! [`Bridge`] ties the pieces together: it spawns the bus task over the
//! chosen transport, accepts client connections and runs a [`Session`] for
//! each. A transport failure ends every session and is returned from
//! [`Bridge::serve`].

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusMultiplexer, SessionId};
use crate::config::{BridgeConfig, ConfigError};
use crate::device::GatewayDevice;
use crate::error::BridgeError;
use crate::router::AddressMap;
use crate::session::{Session, SessionContext};
use crate::transport::CanTransport;
use crate::translate::Translator;

/// A configured bridge, ready to serve
pub struct Bridge {
    config: BridgeConfig,
    address_map: Arc<AddressMap>,
    device: GatewayDevice,
    shutdown: CancellationToken,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let address_map = AddressMap::from_config(&config.gateway, &config.nodes)?;
        let device = GatewayDevice::from_config(&config.gateway)?;
        Ok(Self {
            config,
            address_map: Arc::new(address_map),
            device,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Cancelling this token stops the bridge
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept clients on `listener` and bridge them onto `transport`
    pub async fn serve(
        self,
        listener: TcpListener,
        transport: Box<dyn CanTransport>,
    ) -> Result<(), BridgeError> {
        let (mux, bus) = BusMultiplexer::new(
            transport,
            self.address_map.local_node(),
            self.config.bus.queue_depth,
            self.shutdown.child_token(),
        );
        let mut bus_task = tokio::spawn(mux.run());

        let ctx = Arc::new(SessionContext {
            translator: Translator::new(self.address_map.clone()),
            device: self.device,
            bus,
            config: self.config.session.clone(),
        });

        if let Ok(addr) = listener.local_addr() {
            tracing::info!(
                %addr,
                gateway = ctx.device.node_id(),
                nodes = self.address_map.len(),
                "Bridge listening"
            );
        }

        let mut sessions = JoinSet::new();
        let mut next_session: SessionId = 1;

        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Bridge shutting down");
                    break Ok(());
                }
                finished = &mut bus_task => {
                    break match finished {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(e),
                        Err(e) => Err(BridgeError::TransportFailure(format!("bus task panicked: {}", e))),
                    };
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                        let id = next_session;
                        next_session += 1;

                        let ctx = ctx.clone();
                        let token = self.shutdown.child_token();
                        sessions.spawn(async move {
                            let mut session = Session::new(id, peer.to_string(), stream, ctx);
                            session.run(token).await
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Session task panicked");
                    }
                }
            }
        };

        // On bus failure sessions report it and close on their own
        if result.is_ok() {
            self.shutdown.cancel();
        }
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Session task panicked");
            }
        }
        if !bus_task.is_finished() {
            let _ = bus_task.await;
        }

        match &result {
            Ok(()) => tracing::info!("Bridge stopped"),
            Err(e) => tracing::error!(error = %e, "Bridge stopped on error"),
        }
        result
    }
}
