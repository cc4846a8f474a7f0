//! Filedrop
//!
//! File ingestion service. Clients push files over a small length-prefixed
//! TCP protocol; every upload is streamed into an object store and can then
//! be listed and downloaded through a login-gated HTTP gateway.
//!
//! ## Features
//!
//! - **Streaming ingestion**: content is copied through a fixed-size buffer,
//!   so memory use does not grow with file size
//! - **Bounded header decoding**: length fields from untrusted peers are
//!   validated before anything is allocated
//! - **Pluggable storage**: S3-compatible object stores or an in-memory store
//! - **Session-based HTTP access**: cookie sessions with expiry and logout
//! - **Coordinated shutdown**: both listeners stop together, with an optional
//!   drain of in-flight uploads
//!
//! ## Architecture
//!
//! ```text
//! TCP clients                                        Browsers
//!      │                                                 │
//!      ▼                                                 ▼
//! ┌──────────────┐                               ┌──────────────┐
//! │ Acceptor     │                               │ HTTP Gateway │
//! └──────────────┘                               │ (login,      │
//!      │ one task per connection                 │  files,      │
//!      ▼                                         │  download)   │
//! ┌──────────────┐     ┌──────────────┐          └──────────────┘
//! │ Ingest       │────▶│ Frame        │                 │
//! │ Session      │     │ Decoder      │                 │
//! └──────────────┘     └──────────────┘                 │
//!      │ write                                    list / read
//!      ▼                                                 │
//! ┌────────────────────────────────────────────────────────────┐
//! │ Object Store (S3 or memory)                                │
//! └────────────────────────────────────────────────────────────┘
//! ```

pub mod acceptor;
pub mod client;
pub mod config;
pub mod frame;
pub mod http;
pub mod session;
pub mod storage;
pub mod supervisor;

pub use acceptor::Acceptor;
pub use config::{Config, FrameLayout};
pub use frame::{FrameDecoder, FrameError, UploadFrame};
pub use session::{IngestReport, IngestSession, SessionError};
pub use storage::{ObjectStore, StoreError};
pub use supervisor::Supervisor;
