//! `fieldcrypt` — driver-side coordination core for client-side field-level
//! encryption.
//!
//! A database driver uses this crate to encrypt selected fields of command
//! documents before they leave the client, and to decrypt encrypted fields in
//! results returned by the server. Data-encryption keys (DEKs) are stored
//! wrapped by a key-encryption key (KEK) held at a remote KMS (AWS, Azure,
//! GCP) or derived from a locally configured key.
//!
//! The crate performs no I/O. Each operation is driven by an [`ctx::Ctx`]
//! state machine: the context hands the host driver outbound documents
//! (collection-info queries, marking requests, key-vault filters) and KMS
//! request bodies, consumes the replies the driver feeds back, and — once all
//! referenced DEKs are unwrapped — produces the final encrypted or decrypted
//! payload.
//!
//! # Flow
//!
//! ```text
//! let crypt = Crypt::builder().options(opts).build()?;   // process handle
//! let mut ctx = crypt.ctx_encrypt("db.coll", cmd)?;
//! loop over ctx.state():
//!   NeedCollInfo | NeedMarkings | NeedKeys:
//!       send ctx.db_request()?, feed replies via ctx.db_feed(..),
//!       then ctx.db_done()?
//!   NeedKms:
//!       drain ctx.next_kms_request()?, performing each exchange,
//!       then ctx.kms_done()?
//!   Ready:  ctx.finalize()?  -> rewritten document
//! ```

pub mod broker;
pub mod crypt;
pub mod crypto;
pub mod ctx;
pub mod endpoint;
pub mod kek;
pub mod key;
pub mod kms;
pub mod options;
pub mod schema;

mod parse;
mod transform;

pub use common::{Error, ErrorKind, Result, Status};

pub use broker::KeyBroker;
pub use crypt::Crypt;
pub use crypto::{CryptoHooks, KeyMaterial};
pub use ctx::{Ctx, State};
pub use endpoint::Endpoint;
pub use kek::KekDescriptor;
pub use kms::KmsContext;
pub use options::{AwsCredentials, AzureCredentials, CryptOptions, GcpCredentials};
