pub mod asn1;
pub mod client;
pub mod codec;
pub mod error;
pub mod filter;
pub mod framing;
pub mod ldap;
pub mod search;
pub mod sync;
pub mod tls;
pub mod url;

pub use client::{ConnectOptions, Connection, SearchOpts};
pub use error::{ApiErrorKind, LdapError, Result};
pub use ldap::{DerefAliases, Entry, SearchScope};
pub use search::{SearchDone, SearchStream};
pub use sync::{SyncConnection, SyncSearch};
pub use tls::{CrlCheck, RequireCert, TlsOptions};
