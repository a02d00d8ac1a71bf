use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::Status;

use crate::apiv1::spanner_client::{Client, SpannerStub};
use crate::request_id::RequestIdGenerator;

pub const SPANNER: &str = "spanner.googleapis.com:443";

/// Opens transport channels to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn SpannerStub>, Status>;
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to connect: {0}")]
    Connect(#[source] Status),

    #[error("invalid database name {0}")]
    InvalidDatabaseName(String),

    #[error("at least one channel is required")]
    NoChannel,
}

pub struct ConnectionManager {
    index: AtomicUsize,
    conns: Vec<Client>,
}

impl ConnectionManager {
    pub async fn new(
        pool_size: usize,
        endpoint: &str,
        database: &str,
        connector: &dyn Connector,
        route_to_leader_enabled: bool,
        timeout: Option<Duration>,
    ) -> Result<Self, Error> {
        if pool_size == 0 {
            return Err(Error::NoChannel);
        }
        let resource_prefix: MetadataValue<Ascii> = database
            .parse()
            .map_err(|_| Error::InvalidDatabaseName(database.to_string()))?;
        let request_ids = Arc::new(RequestIdGenerator::new());
        let mut conns = Vec::with_capacity(pool_size);
        for i in 0..pool_size {
            let stub = connector.connect(endpoint).await.map_err(Error::Connect)?;
            tracing::debug!("gRPC Connection Created endpoint={endpoint}, channel={}", i + 1);
            let client = Client::new(stub, (i + 1) as u32, request_ids.clone(), resource_prefix.clone())
                .with_route_to_leader(route_to_leader_enabled)
                .with_timeout(timeout);
            conns.push(client);
        }
        Ok(ConnectionManager {
            index: AtomicUsize::new(0),
            conns,
        })
    }

    pub fn num(&self) -> usize {
        self.conns.len()
    }

    pub fn conn(&self) -> Client {
        let current = self.index.fetch_add(1, Ordering::SeqCst);
        //clone() reuses the channel
        self.conns[current % self.conns.len()].clone()
    }
}
