pub mod error;
pub mod file_ops;
pub mod metadata;
pub mod pairing;
pub mod summary;
pub mod thumbnailer;

pub use error::{
    CancelReason, LockError, StoreError, SubmitError, TaskError, ThumbnailError, TransactionError,
    ValidationError,
};
pub use metadata::{JsonMetadataStore, Metadata, MetadataStore};
pub use pairing::{Classifier, FileKind, FilePair, Pairer, ScanReport};
pub use summary::{ItemDetail, ItemStatus, OperationSummary};
pub use thumbnailer::{ImageThumbnailer, Thumbnailer};
