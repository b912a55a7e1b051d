//! The CSI-facing surface of the plugin: one gRPC server exposing the
//! identity and node services on a local endpoint. Controller RPCs are out
//! of scope by contract; only the identity and node services are
//! registered.

mod identity;
mod node;

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use k8s_csi::v1_3_0::identity_server::IdentityServer;
use k8s_csi::v1_3_0::node_server::NodeServer;
use tokio::sync::Mutex;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::info;

use crate::grpc_sock;
use crate::image::clock::Clock;
use crate::image::volume::Volume;
use crate::image::Stager;

/// The driver name advertised over the CSI identity service.
pub const DRIVER_NAME: &str = "image.stager.csi.k8s.io";

pub(crate) struct DriverState {
    pub(crate) node_id: String,
    pub(crate) vendor_version: String,
    pub(crate) default_stage_in_image: String,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) stager: Stager,
    /// Registry of live volumes. The outer lock is held only for
    /// insert/lookup/remove; each volume's own lock is held for the
    /// duration of a state-machine drive, so distinct volume ids advance in
    /// parallel.
    pub(crate) volumes: Mutex<HashMap<String, Arc<Mutex<Volume>>>>,
}

/// The CSI service implementation. Cheap to clone; one clone is registered
/// as the identity service and one as the node service.
#[derive(Clone)]
pub struct StagerService {
    pub(crate) state: Arc<DriverState>,
}

impl StagerService {
    pub fn new(
        node_id: impl Into<String>,
        vendor_version: impl Into<String>,
        default_stage_in_image: impl Into<String>,
        clock: Arc<dyn Clock>,
        stager: Stager,
    ) -> Self {
        StagerService {
            state: Arc::new(DriverState {
                node_id: node_id.into(),
                vendor_version: vendor_version.into(),
                default_stage_in_image: default_stage_in_image.into(),
                clock,
                stager,
                volumes: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// The plugin's server: a CSI endpoint plus the service behind it.
pub struct Driver {
    endpoint: String,
    service: StagerService,
}

impl Driver {
    pub fn new(endpoint: impl Into<String>, service: StagerService) -> Self {
        Driver {
            endpoint: endpoint.into(),
            service,
        }
    }

    /// Serves the CSI endpoint until `shutdown` resolves, then stops
    /// accepting work and drains in-flight calls. The garbage collection
    /// task is spawned alongside and runs for the life of the process.
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        info!(
            driver = DRIVER_NAME,
            vendor_version = %self.service.state.vendor_version,
            node_id = %self.service.state.node_id,
            endpoint = %self.endpoint,
            "starting driver"
        );
        self.service.state.stager.start_garbage_collection();

        let (scheme, address) = parse_endpoint(&self.endpoint)?;
        let router = Server::builder()
            .add_service(IdentityServer::new(self.service.clone()))
            .add_service(NodeServer::new(self.service.clone()));

        match scheme {
            Scheme::Unix => {
                if let Some(parent) = Path::new(&address).parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("can't create socket directory for {}", address))?;
                }
                let socket = grpc_sock::server::Socket::bind(&address)
                    .with_context(|| format!("can't listen on {}", self.endpoint))?;
                info!(%address, "listening for connections");
                router
                    .serve_with_incoming_shutdown(socket, shutdown)
                    .await
                    .context("CSI server failed")?;
            }
            Scheme::Tcp => {
                let listener = tokio::net::TcpListener::bind(&address)
                    .await
                    .with_context(|| format!("can't listen on {}", self.endpoint))?;
                info!(%address, "listening for connections");
                router
                    .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
                    .await
                    .context("CSI server failed")?;
            }
        }

        info!("driver stopped");
        Ok(())
    }
}

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Scheme {
    Unix,
    Tcp,
}

/// Splits a CSI `scheme://address` endpoint.
pub(crate) fn parse_endpoint(endpoint: &str) -> anyhow::Result<(Scheme, String)> {
    let (scheme, address) = endpoint.split_once("://").ok_or_else(|| {
        anyhow::anyhow!(
            "endpoint {:?} must be of the form scheme://address",
            endpoint
        )
    })?;
    if address.is_empty() {
        anyhow::bail!("endpoint {:?} has an empty address", endpoint);
    }
    match scheme {
        "unix" => Ok((Scheme::Unix, address.to_owned())),
        "tcp" => Ok((Scheme::Tcp, address.to_owned())),
        other => anyhow::bail!("unsupported endpoint scheme {:?}", other),
    }
}
