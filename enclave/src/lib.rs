pub mod attestation;
pub mod config;
pub mod http_client;
pub mod mock;
pub mod refresher;
pub mod server;
pub mod service;
pub mod test_helpers;
pub mod vault_client;
pub mod vault_hsm_client;

pub use attestation::{QuoteProducer, SecureReleaseAttestor};
pub use config::VaultConfig;
pub use refresher::{KeyRefresher, RefresherConfig};
pub use server::{RequestCallback, Server};
pub use service::{
    dispatch_callback, scoring_callback, Executor, ExecutorLoader, ModelService, RequestType,
};
pub use vault_client::VaultKeyStore;
pub use vault_hsm_client::VaultHsmKeyStore;
