//! Core traits and engine for sitepub.
//!
//! This crate holds everything that is independent of a storage provider:
//! - `PublishBackend`: the capability set every provider implements
//! - `BackendRegistry`: engine identifier to constructor lookup
//! - `LocalIndex`: one-shot walk of a rendered site directory
//! - `SyncPlanner`: local/remote diff into upload, unchanged and delete sets
//! - `Publisher`: bounded-concurrency upload, verification and deletion driver
//! - `VerificationProbe`: fetch-and-hash check of a public URL with retries

mod backend;
mod error;
mod hash;
mod index;
mod layout;
mod plan;
mod publish;
mod remote;
mod selftest;
mod target;
mod verify;

pub use backend::{BackendConstructor, BackendRegistry, PublishBackend};
pub use error::{PublishError, Result};
pub use hash::{
    base64_md5_to_hex, hash_bytes, hash_file, hex_md5_to_base64, strip_etag_quotes, ContentHasher,
    HASH_BLOCK_SIZE,
};
pub use index::{ExcludeFilter, LocalIndex};
pub use layout::{join_key, SiteLayout};
pub use plan::{SyncPlan, SyncPlanner};
pub use publish::{PublishOptions, PublishPhase, PublishReport, Publisher};
pub use remote::RemoteSnapshot;
pub use selftest::{run_self_test, SelfTestReport};
pub use target::{PublishTarget, TargetSet};
pub use verify::{RetryPolicy, VerificationProbe, CACHE_BUST_PARAM};
