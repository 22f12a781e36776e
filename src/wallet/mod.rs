//! The wallet engine: four cooperating pipelines over a shared ledger.
//!
//! Pipelines are supervised in a `JoinSet`; a pipeline error or panic aborts
//! the whole group and surfaces as the engine error, and a shutdown signal
//! aborts all tasks and drains them.

use std::sync::Arc;

use eyre::Result;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::Config;
use crate::db;
use crate::node::{EthClient, HeaderTraversal, RpcEthClient};
use crate::signer::{LocalSigner, WalletSigner};

pub mod cold;
pub mod collection;
pub mod deposit;
pub mod withdraw;

pub use cold::ColdPipeline;
pub use collection::CollectionPipeline;
pub use deposit::DepositPipeline;
pub use withdraw::WithdrawPipeline;

pub struct WalletEngine {
    client: Arc<dyn EthClient>,
    deposit: DepositPipeline,
    withdraw: WithdrawPipeline,
    collection: CollectionPipeline,
    cold: ColdPipeline,
}

impl WalletEngine {
    /// Dial the chain node, seed the indexing cursor and wire the pipelines.
    pub async fn new(config: &Config, pool: PgPool) -> Result<Self> {
        let client: Arc<dyn EthClient> = Arc::new(RpcEthClient::dial(&config.chain.rpc_url).await?);
        let signer: Arc<dyn WalletSigner> = Arc::new(LocalSigner);

        // resume from the ledger's highest block; on an empty ledger start
        // indexing at starting_height
        let from_header = match db::latest_block(&pool).await? {
            Some(row) => match row.header() {
                Some(header) => Some(header),
                None => Some(
                    client
                        .block_header_by_number(Some(row.number as u64))
                        .await?,
                ),
            },
            None if config.chain.starting_height > 0 => Some(
                client
                    .block_header_by_number(Some(config.chain.starting_height - 1))
                    .await?,
            ),
            None => None,
        };
        info!(
            resume_from = from_header.as_ref().map(|h| h.number()),
            "Deposit cursor seeded"
        );
        let traversal =
            HeaderTraversal::new(client.clone(), from_header, config.chain.confirmations);

        let deposit = DepositPipeline::new(
            client.clone(),
            pool.clone(),
            traversal,
            config.chain.confirmations,
            config.chain.blocks_step,
            config.chain.deposit_interval,
        );
        let withdraw = WithdrawPipeline::new(
            client.clone(),
            signer.clone(),
            pool.clone(),
            config.chain.chain_id,
            config.gas.clone(),
            config.chain.withdraw_interval,
        );
        let collection = CollectionPipeline::new(
            client.clone(),
            signer.clone(),
            pool.clone(),
            config.chain.chain_id,
            config.gas.clone(),
            config.funding.clone(),
            config.chain.collect_interval,
        );
        let cold = ColdPipeline::new(
            client.clone(),
            signer,
            pool,
            config.chain.chain_id,
            config.gas.clone(),
            config.funding.clone(),
            config.chain.cold_interval,
        );

        Ok(Self {
            client,
            deposit,
            withdraw,
            collection,
            cold,
        })
    }

    /// Run all pipelines until one fails or the shutdown signal arrives.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let mut join_set = JoinSet::new();
        join_set.spawn(self.deposit.run());
        join_set.spawn(self.withdraw.run());
        join_set.spawn(self.collection.run());
        join_set.spawn(self.cold.run());
        info!("Wallet pipelines running");

        let result = tokio::select! {
            _ = shutdown.recv() => {
                info!("Shutdown signal received, stopping wallet pipelines");
                join_set.abort_all();
                Ok(())
            }
            maybe_done = join_set.join_next() => {
                let result = match maybe_done {
                    Some(Ok(Ok(()))) => {
                        error!("A pipeline exited unexpectedly without error");
                        Err(eyre::eyre!("pipeline exited unexpectedly"))
                    }
                    Some(Ok(Err(e))) => {
                        error!("A pipeline stopped with error: {:?}", e);
                        Err(e)
                    }
                    Some(Err(e)) => {
                        error!("A pipeline task panicked: {:?}", e);
                        Err(eyre::eyre!("pipeline task panicked: {}", e))
                    }
                    None => {
                        error!("All pipeline tasks exited unexpectedly");
                        Err(eyre::eyre!("all pipeline tasks exited unexpectedly"))
                    }
                };
                join_set.abort_all();
                result
            }
        };

        // wait for aborted tasks to drain before releasing the connection
        while join_set.join_next().await.is_some() {}
        self.client.close();
        result
    }
}
