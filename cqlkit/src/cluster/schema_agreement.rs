use itertools::Itertools;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::*;
use uuid::Uuid;

use crate::cluster::cluster_metadata_manager::send_query;
use crate::error::Result;
use crate::transport::CqlTransport;

const LOCAL_SCHEMA_QUERY: &str = "SELECT schema_version FROM system.local WHERE key='local'";
const PEERS_SCHEMA_QUERY: &str = "SELECT peer, rpc_address, schema_version FROM system.peers";

pub(crate) const DEFAULT_SCHEMA_AGREEMENT_INTERVAL: Duration = Duration::from_millis(200);
pub(crate) const DEFAULT_MAX_SCHEMA_AGREEMENT_WAIT: Duration = Duration::from_secs(10);

/// Polls schema versions once. Nodes agree if every reported version is the same; peers which
/// don't report any version are skipped.
pub(crate) async fn check_schema_agreement<T: CqlTransport>(transport: &T) -> Result<bool> {
    let local = send_query(LOCAL_SCHEMA_QUERY, transport).await?;
    let peers = send_query(PEERS_SCHEMA_QUERY, transport).await?;

    let versions = local
        .iter()
        .chain(peers.iter())
        .map(|row| row.get_by_name::<Uuid>("schema_version"))
        .filter_map_ok(|version| version)
        .collect::<Result<Vec<_>>>()?;

    debug!(?versions, "Schema versions.");
    Ok(versions.iter().all_equal())
}

/// Polls schema versions until all nodes agree or `max_wait` passes. A timeout or a failed
/// poll is reported as disagreement, not as an error.
pub(crate) async fn wait_for_schema_agreement<T, F>(
    transport: F,
    interval: Duration,
    max_wait: Duration,
) -> bool
where
    T: CqlTransport,
    F: Fn() -> Option<Arc<T>>,
{
    let poll = async {
        loop {
            if let Some(transport) = transport() {
                match check_schema_agreement(transport.as_ref()).await {
                    Ok(true) => return,
                    Ok(false) => {}
                    Err(error) => warn!(%error, "Error checking schema agreement."),
                }
            }

            sleep(interval).await;
        }
    };

    let agreed = timeout(max_wait, poll).await.is_ok();
    if !agreed {
        warn!(?max_wait, "Schema agreement not reached.");
    }

    agreed
}
