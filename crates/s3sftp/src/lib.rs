//! s3sftp: SFTP over a flat object store
//!
//! Serves SFTP v3 sessions for public-key authenticated identities, each
//! confined to its own key prefix of an S3-style bucket. Directories are
//! emulated with zero-length `.dir` marker objects; uploads are streamed to
//! the store as they arrive and become durable when the handle is closed.

mod attrs;
mod auth;
mod callbacks;
mod gateway;
mod handle;
mod identity;
mod path;
mod protocol;
mod session;

pub mod storage;

pub use attrs::{EntryKind, FileAttrs, NameEntry, S_IFDIR, S_IFREG, S_IRWXUGO, longname};
pub use auth::{
    AuthDecision, AuthMethod, AuthRejected, AuthRequest, KeyProof, OfferedSignature,
    PublicKeyOffer,
};
pub use callbacks::{
    CallbackResult, Callbacks, DisconnectEvent, ErrorEvent, Hooks, ObjectEvent, UserEvent,
};
pub use gateway::{Connection, Gateway};
pub use identity::{Identity, IdentityRegistry, RegistryError};
pub use path::{DIR_MARKER, Namespace, basename, normalize};
pub use protocol::{HandleId, OpenFlags, Request, Response, StatusCode};
pub use session::{SessionConfig, SessionEngine, SessionError};
pub use storage::{MemoryStore, ObjectStore, StorageError, StorageObject, UploadChunk};
