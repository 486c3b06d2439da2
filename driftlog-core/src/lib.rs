//! Driftlog Core - durable persistence of journal fragments into blob storage
//!
//! Brokers spool journal fragments on local disk. The persister moves each
//! fragment into a shared blob store exactly once across all brokers:
//! - content-addressed fragment names (`begin-end-sum`)
//! - owner-tagged, TTL-bounded leases in a coordination service
//! - atomic multipart uploads through `object_store`
//! - local spool cleanup once the remote copy is durable

pub mod config;
pub mod error;
pub mod fragment;
pub mod operations;
pub mod persister;
pub mod registry;
pub mod storage;

pub use config::PersisterConfig;
pub use error::{DriftError, Result};
pub use fragment::{
    ContentSum, Fragment, FragmentSource, SUM_LEN, content_name, parse_content_name,
};
pub use operations::{
    ConvergeFragmentOperation, ConvergeFragmentOperationRequest, ConvergeOutcome,
};
pub use persister::{ConvergeReport, ConvergeResult, Persister, PersisterStatus};
pub use registry::{
    EtcdLeaseRegistry, LeaseAction, LeaseCreate, LeaseDelete, LeaseEvent, LeaseKeeper,
    LeaseRefresh, LeaseRegistry, LeaseWatch, MemoryLeaseRegistry, RedisLeaseRegistry,
    RegistryBuilder,
};
pub use storage::{BlobStore, BlobWriter, FileSource, LocalSpool};
