//! # devmess-shared
//!
//! Types shared by the devmess store and server: domain enums, the
//! bidirectional wire event schema, timing constants and the credential
//! utilities (signed bearer tokens and password hashing).

pub mod constants;
pub mod credentials;
pub mod error;
pub mod password;
pub mod protocol;
pub mod types;

pub use error::{CredentialError, SharedError};
