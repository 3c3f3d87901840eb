//! Collaborator seams of the coordination engine
//!
//! The engine never touches disk, processes, or sockets for the payload, the
//! task runtime, address lookup, or the operator API directly. It consumes
//! them through the traits below; [`Collaborators::defaults`] wires up the
//! implementations shipped with gridsync.

pub mod address;
pub mod api;
pub mod payload;
pub mod tasks;

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::config::GridConfig;
use crate::error::GridResult;
use crate::protocol::{SyncOffer, TaskMeta, TriggerRequest};
use crate::transport::Discovery;

pub use address::LocalAddressResolver;
pub use api::StatusApi;
pub use payload::FilePayloadStore;
pub use tasks::ProcessTaskExecutor;

/// Result of persisting an offered payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Fingerprint of what is now held locally
    pub fingerprint: String,
    /// Folder the payload was unpacked into
    pub base_folder: Option<PathBuf>,
}

/// Storage of the replicated payload
#[async_trait]
pub trait PayloadStore: Send + Sync + 'static {
    /// Whether this node is the authoritative payload holder
    fn is_file_master(&self) -> bool;

    /// Whether a payload is loaded and ready to offer
    fn has_file_to_sync(&self) -> bool;

    /// Fingerprint of the payload currently held, if any
    fn current_fingerprint(&self) -> Option<String>;

    /// Bytes of the payload currently held, if any
    fn payload_bytes(&self) -> Option<Bytes>;

    /// Persist an offered payload and report what is now held
    async fn synchronize(&self, offer: &SyncOffer, attachment: Option<Bytes>) -> GridResult<SyncOutcome>;

    /// Replace the served payload with the contents of `source` (master only)
    async fn publish(&self, source: &Path) -> GridResult<String>;

    /// Discard the locally held payload
    async fn clear(&self) -> GridResult<()>;
}

/// Local task runtime
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    /// Replace the current task metadata
    fn set_task_meta(&self, meta: TaskMeta);

    /// Current task metadata
    fn task_meta(&self) -> TaskMeta;

    /// Materialize the task group described by `meta`
    async fn init_task_group(&self, meta: &TaskMeta) -> GridResult<()>;

    /// Run one task and return its result
    async fn trigger_task(&self, request: TriggerRequest) -> GridResult<Value>;

    /// Stop every running task
    async fn terminate(&self);
}

/// Addresses reported in the node identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAddresses {
    pub public_ip: IpAddr,
    pub private_ip: IpAddr,
}

/// Network address lookup
#[async_trait]
pub trait AddressResolver: Send + Sync + 'static {
    async fn resolve(&self) -> GridResult<ResolvedAddresses>;
}

/// Produces the status document served by the local API
pub type StatusProvider = Arc<dyn Fn() -> Value + Send + Sync>;

/// Operator-facing local API
#[async_trait]
pub trait LocalApi: Send + Sync + 'static {
    /// Bind and start serving; resolves once bound
    async fn start(&self, status: StatusProvider) -> GridResult<()>;

    /// Stop serving
    async fn close(&self);
}

/// Every collaborator a node needs
#[derive(Clone)]
pub struct Collaborators {
    pub discovery: Arc<dyn Discovery>,
    pub payload: Arc<dyn PayloadStore>,
    pub tasks: Arc<dyn TaskExecutor>,
    pub resolver: Arc<dyn AddressResolver>,
    pub api: Arc<dyn LocalApi>,
}

impl Collaborators {
    /// Default collaborators for `config` over the given discovery transport
    pub fn defaults(config: &GridConfig, discovery: Arc<dyn Discovery>) -> GridResult<Self> {
        Ok(Self {
            discovery,
            payload: Arc::new(FilePayloadStore::open(&config.files, config.test_mode)?),
            tasks: Arc::new(ProcessTaskExecutor::new(config)),
            resolver: Arc::new(LocalAddressResolver::from_env(config.test_mode)),
            api: Arc::new(StatusApi::new(config.api_port)),
        })
    }
}
