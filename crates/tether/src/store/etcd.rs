//! etcd v3 backend.

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, GetOptions as EtcdGetOptions, LeaseKeepAliveStream,
    PutOptions, Txn, TxnOp,
};
use std::time::Duration;

use tether_common::{KeepAliveAck, KeyValue, Lease, LeaseId, Result, TetherError};

use super::{GetOptions, KvStore, LeaseKeeper};

/// Session to an etcd cluster
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Dial the cluster and prove it answers, all within `dial_timeout`.
    ///
    /// No request timeout is set on the channel: keep-alive streams are
    /// long-lived and bounded calls carry their own deadline.
    pub async fn connect(
        endpoints: &[String],
        credentials: Option<(String, String)>,
        dial_timeout: Duration,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(TetherError::InvalidArgument("no endpoints given".to_string()));
        }

        let mut options = ConnectOptions::new().with_connect_timeout(dial_timeout);
        if let Some((user, password)) = credentials {
            options = options.with_user(user, password);
        }

        let dial = async {
            let mut client = Client::connect(endpoints, Some(options)).await?;
            client.status().await?;
            Ok::<_, etcd_client::Error>(client)
        };

        let client = tokio::time::timeout(dial_timeout, dial)
            .await
            .map_err(|_| {
                TetherError::Connection(format!(
                    "no endpoint in {:?} reachable within {:?}",
                    endpoints, dial_timeout
                ))
            })?
            .map_err(|e| TetherError::Connection(format!("failed to connect to {:?}: {}", endpoints, e)))?;

        Ok(Self { client })
    }
}

/// Translate an etcd client error into the Tether taxonomy
fn map_err(err: etcd_client::Error) -> TetherError {
    use etcd_client::Error;
    use tonic::Code;

    match err {
        Error::GRpcStatus(status) => {
            let message = status.message().to_string();
            match status.code() {
                Code::NotFound => TetherError::NotFound(message),
                Code::DeadlineExceeded => TetherError::Timeout(message),
                Code::Unavailable | Code::Cancelled | Code::Aborted => TetherError::Connection(message),
                Code::InvalidArgument => TetherError::InvalidArgument(message),
                _ => TetherError::Store(message),
            }
        }
        Error::TransportError(e) => TetherError::Connection(e.to_string()),
        Error::IoError(e) => TetherError::Connection(e.to_string()),
        Error::LeaseKeepAliveError(m) => TetherError::Connection(m),
        Error::InvalidArgs(m) => TetherError::InvalidArgument(m),
        other => TetherError::Store(other.to_string()),
    }
}

fn put_options(lease: LeaseId) -> Option<PutOptions> {
    (!lease.is_none()).then(|| PutOptions::new().with_lease(lease.value()))
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn status(&self) -> Result<()> {
        let mut maintenance = self.client.maintenance_client();
        maintenance.status().await.map_err(map_err)?;
        Ok(())
    }

    async fn create_if_absent(&self, key: &[u8], value: &[u8], lease: LeaseId) -> Result<bool> {
        let txn = Txn::new()
            .when([Compare::version(key, CompareOp::Equal, 0)])
            .and_then([TxnOp::put(key, value, put_options(lease))]);

        let mut kv = self.client.kv_client();
        let resp = kv.txn(txn).await.map_err(map_err)?;
        Ok(resp.succeeded())
    }

    async fn put(&self, key: &[u8], value: &[u8], lease: LeaseId) -> Result<()> {
        let mut kv = self.client.kv_client();
        kv.put(key, value, put_options(lease)).await.map_err(map_err)?;
        Ok(())
    }

    async fn get(&self, key: &[u8], options: GetOptions) -> Result<Vec<KeyValue>> {
        let mut etcd_options = EtcdGetOptions::new();
        if options.prefix {
            etcd_options = etcd_options.with_prefix();
        }
        if options.keys_only {
            etcd_options = etcd_options.with_keys_only();
        }

        let mut kv = self.client.kv_client();
        let resp = kv.get(key, Some(etcd_options)).await.map_err(map_err)?;

        Ok(resp
            .kvs()
            .iter()
            .map(|kv| KeyValue {
                key: kv.key().to_vec(),
                value: kv.value().to_vec(),
                version: kv.version(),
                create_revision: kv.create_revision(),
                mod_revision: kv.mod_revision(),
                lease: LeaseId::new(kv.lease()),
            })
            .collect())
    }

    async fn grant(&self, ttl: i64) -> Result<Lease> {
        let mut leases = self.client.lease_client();
        let resp = leases.grant(ttl, None).await.map_err(map_err)?;
        Ok(Lease {
            id: LeaseId::new(resp.id()),
            ttl: resp.ttl(),
        })
    }

    async fn revoke(&self, id: LeaseId) -> Result<()> {
        let mut leases = self.client.lease_client();
        leases.revoke(id.value()).await.map_err(map_err)?;
        Ok(())
    }

    async fn time_to_live(&self, id: LeaseId) -> Result<Option<i64>> {
        let mut leases = self.client.lease_client();
        let resp = leases.time_to_live(id.value(), None).await.map_err(map_err)?;

        // etcd reports -1 for expired or unknown leases
        Ok((resp.ttl() >= 0).then(|| resp.ttl()))
    }

    async fn keep_alive(&self, id: LeaseId) -> Result<Box<dyn LeaseKeeper>> {
        let mut leases = self.client.lease_client();
        let (keeper, stream) = leases.keep_alive(id.value()).await.map_err(map_err)?;
        Ok(Box::new(EtcdKeeper { keeper, stream }))
    }
}

/// Bidirectional LeaseKeepAlive stream for one lease
struct EtcdKeeper {
    keeper: etcd_client::LeaseKeeper,
    stream: LeaseKeepAliveStream,
}

#[async_trait]
impl LeaseKeeper for EtcdKeeper {
    async fn renew(&mut self) -> Result<KeepAliveAck> {
        self.keeper.keep_alive().await.map_err(map_err)?;

        match self.stream.message().await.map_err(map_err)? {
            Some(resp) => Ok(KeepAliveAck {
                id: LeaseId::new(resp.id()),
                ttl: resp.ttl(),
            }),
            None => Err(TetherError::Connection(
                "keep-alive stream closed by server".to_string(),
            )),
        }
    }
}
