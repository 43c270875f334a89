use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("rpc transport error: {0}")]
    Rpc(String),
    #[error("malformed rpc response: {0}")]
    MalformedResponse(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("chain {0} is not configured")]
    ChainNotConfigured(u64),
    #[error("no sources registered for chain {0}")]
    NoSources(u64),
    #[error("reorg on chain {chain_id} reached below the finalized block {finalized}")]
    UnrecoverableReorg { chain_id: u64, finalized: u64 },
    #[error("chain {chain_id} driver gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        chain_id: u64,
        attempts: u32,
        last: String,
    },
    #[error("sync was killed")]
    Killed,
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Store(e.to_string())
    }
}
