//! Durable streaming backup, restore, live-migration, and garbage
//! collection for a content-addressed, immutable Datalog database.
//!
//! This crate is a library first: `backup`, `restore`, `verify`,
//! `cleanup_incomplete`, `start_migration`, and `gc` are the public
//! operations a host process wires up against its own [`SourceDb`] and
//! [`ObjectStore`]/[`ContentAddressedStore`] implementations. Nothing here
//! owns a CLI, a server loop, or a specific storage backend beyond the
//! filesystem and (optionally) S3 adapters in `store`.
//!
//! Every public operation returns [`BackupError`], a classified error
//! carrying an [`ErrorKind`] a caller can match on to decide retry vs.
//! abort policy, rather than a bag of opaque strings.

mod backup;
mod capture;
mod chunker;
mod cleanup;
mod codec;
mod content_store;
mod error;
mod gc;
mod metadata;
mod migration;
mod options;
mod progress;
mod restore;
mod store;
mod tools;
mod tuple;
mod verify;

pub use backup::{backup, BackupResult};
pub use capture::TxCapture;
pub use cleanup::{cleanup_incomplete, CleanupResult};
pub use content_store::{CommitId, CommitNode, ContentAddressedStore, Key};
pub use error::{BackupError, ErrorKind};
pub use gc::{gc, GcCheckpoint, GcResult};
pub use migration::{start_migration, FinalizeResult, MigrationState, Router};
pub use options::{
    BackupOptions, CleanupOptions, GcBackend, GcOptions, MigrationOptions, RestoreOptions, VerifyOptions,
};
pub use progress::{ProgressEvent, ProgressFn};
pub use restore::{restore, RestoreResult};
pub use store::{layout, ClassifiedError, FsStore, MultipartUpload, ObjectDescriptor, ObjectStore, MULTIPART_THRESHOLD_BYTES};
#[cfg(feature = "s3")]
pub use store::S3Store;
pub use tuple::{Attribute, Snapshot, SourceDb, SubscriptionKey, Tuple, TxReport, Value, TX_INSTANT_ATTR};
pub use verify::{verify, VerifyResult};
