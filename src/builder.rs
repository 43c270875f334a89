//! Builder for a [`ChainSync`] engine.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::chain::ChainConfig;
use crate::errors::SyncError;
use crate::rpc::{HttpRpc, RpcClient};
use crate::source::Source;
use crate::sync::{ChainRuntime, ChainSync};
use crate::store::{SqliteStore, SyncStore};

/// Configures chains, sources and the sync store, then validates the lot.
#[derive(Default)]
pub struct ChainSyncBuilder {
    chains: Vec<ChainConfig>,
    sources: Vec<Source>,
    database_path: Option<PathBuf>,
    store: Option<Arc<dyn SyncStore>>,
    clients: HashMap<u64, Arc<dyn RpcClient>>,
    merged_buffer: Option<usize>,
}

impl ChainSyncBuilder {
    /// Register a chain to sync.
    pub fn chain(mut self, config: ChainConfig) -> Self {
        self.chains.push(config);
        self
    }

    /// Register an event source.
    pub fn source(mut self, source: Source) -> Self {
        self.sources.push(source);
        self
    }

    pub fn sources(mut self, sources: impl IntoIterator<Item = Source>) -> Self {
        self.sources.extend(sources);
        self
    }

    /// Path of the SQLite sync store. Defaults to `chain_sync.db`.
    pub fn database(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Use a caller-provided store instead of SQLite.
    pub fn store(mut self, store: Arc<dyn SyncStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Substitute the RPC client for one chain. Tests use this to script
    /// chain data.
    pub fn rpc_client(mut self, chain_id: u64, client: Arc<dyn RpcClient>) -> Self {
        self.clients.insert(chain_id, client);
        self
    }

    pub fn merged_buffer(mut self, capacity: usize) -> Self {
        self.merged_buffer = Some(capacity);
        self
    }

    /// Validate the configuration and produce the engine.
    pub fn build(self) -> Result<ChainSync, SyncError> {
        let mut seen = Vec::new();
        for chain in &self.chains {
            if seen.contains(&chain.chain_id) {
                return Err(SyncError::Config(format!(
                    "chain {} configured twice",
                    chain.chain_id
                )));
            }
            seen.push(chain.chain_id);
        }

        for source in &self.sources {
            if !seen.contains(&source.chain_id()) {
                return Err(SyncError::ChainNotConfigured(source.chain_id()));
            }
        }

        let store: Arc<dyn SyncStore> = match self.store {
            Some(store) => store,
            None => {
                let path = self
                    .database_path
                    .unwrap_or_else(|| PathBuf::from("chain_sync.db"));
                Arc::new(SqliteStore::open(path)?)
            }
        };

        let mut runtimes = Vec::new();
        for config in self.chains {
            let chain_sources: Vec<Source> = self
                .sources
                .iter()
                .filter(|s| s.chain_id() == config.chain_id)
                .cloned()
                .collect();
            if chain_sources.is_empty() {
                return Err(SyncError::NoSources(config.chain_id));
            }
            let client: Arc<dyn RpcClient> = match self.clients.get(&config.chain_id) {
                Some(client) => client.clone(),
                None => Arc::new(HttpRpc::new(&config.rpc_url, config.chain_id)?),
            };
            runtimes.push(ChainRuntime {
                config,
                sources: Arc::new(chain_sources),
                store: store.clone(),
                client,
            });
        }

        Ok(ChainSync {
            chains: runtimes,
            merged_buffer: self.merged_buffer.unwrap_or(64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{BlockFilter, Filter};

    fn block_source(chain_id: u64) -> Source {
        Source::block(
            "Blocks",
            Filter::Block(BlockFilter {
                chain_id,
                from_block: 0,
                to_block: None,
                interval: 1,
                offset: 0,
                include: None,
            }),
        )
    }

    #[test]
    fn rejects_source_for_unconfigured_chain() {
        let result = ChainSyncBuilder::default()
            .chain(ChainConfig::new(1, "http://localhost:8545"))
            .source(block_source(2))
            .build();
        assert!(matches!(result, Err(SyncError::ChainNotConfigured(2))));
    }

    #[test]
    fn rejects_chain_without_sources() {
        let result = ChainSyncBuilder::default()
            .chain(ChainConfig::new(1, "http://localhost:8545"))
            .store(Arc::new(crate::store::MemoryStore::new()))
            .build();
        assert!(matches!(result, Err(SyncError::NoSources(1))));
    }

    #[test]
    fn builds_with_memory_store() {
        let engine = ChainSyncBuilder::default()
            .chain(ChainConfig::new(1, "http://localhost:8545"))
            .source(block_source(1))
            .store(Arc::new(crate::store::MemoryStore::new()))
            .build()
            .unwrap();
        assert_eq!(engine.chains.len(), 1);
    }
}
