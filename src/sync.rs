//! Blocking facade. Same state machine as the async surface; the only
//! difference is that the caller's thread blocks on completion instead of
//! registering a continuation.

use tokio::runtime::{Builder, Handle, Runtime};

use crate::client::{ConnectOptions, Connection, SearchOpts};
use crate::error::{ApiErrorKind, LdapError, Result};
use crate::ldap::Entry;
use crate::search::{SearchDone, SearchStream};
use crate::tls::TlsOptions;

/// A connection driven with plain blocking calls. Owns the runtime the async
/// core runs on.
pub struct SyncConnection {
    rt: Runtime,
    conn: Connection,
}

impl SyncConnection {
    pub fn connect(urls: &[&str], options: ConnectOptions) -> Result<SyncConnection> {
        let rt = Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .map_err(|e| LdapError::Api {
                kind: ApiErrorKind::Local,
                message: Some(format!("cannot start runtime: {}", e)),
            })?;
        let conn = rt.block_on(Connection::connect(urls, options))?;
        Ok(SyncConnection { rt, conn })
    }

    pub fn start_tls(&self, options: &TlsOptions) -> Result<()> {
        self.rt.block_on(self.conn.start_tls(options))
    }

    pub fn start_tls_with_pairs<'a, I>(&self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.rt.block_on(self.conn.start_tls_with_pairs(pairs))
    }

    pub fn simple_bind(&self, dn: Option<&str>, password: Option<&str>) -> Result<()> {
        self.rt.block_on(self.conn.simple_bind(dn, password))
    }

    pub fn search(&self, opts: SearchOpts) -> Result<SyncSearch> {
        let stream = self.rt.block_on(self.conn.search(opts))?;
        Ok(SyncSearch {
            handle: self.rt.handle().clone(),
            stream,
        })
    }

    pub fn abandon(&self, search: SyncSearch) -> Result<()> {
        self.rt.block_on(self.conn.abandon(search.stream))
    }

    pub fn unbind(&self) -> Result<()> {
        self.rt.block_on(self.conn.unbind())
    }

    pub fn close(&self) -> Result<()> {
        self.unbind()
    }

    pub fn is_secured(&self) -> bool {
        self.conn.is_secured()
    }

    pub fn is_bound(&self) -> bool {
        self.conn.is_bound()
    }

    /// The async connection underneath, for callers mixing both surfaces.
    pub fn as_async(&self) -> &Connection {
        &self.conn
    }
}

/// Blocking view of one search's result stream.
pub struct SyncSearch {
    handle: Handle,
    stream: SearchStream,
}

impl SyncSearch {
    pub fn next(&mut self) -> Result<Option<Entry>> {
        self.handle.block_on(self.stream.next())
    }

    pub fn next_n(&mut self, n: usize) -> Result<Vec<Entry>> {
        self.handle.block_on(self.stream.next_n(n))
    }

    pub fn collect(&mut self) -> Result<Vec<Entry>> {
        self.handle.block_on(self.stream.collect())
    }

    pub fn done(&self) -> Option<&SearchDone> {
        self.stream.done()
    }

    pub fn referrals(&self) -> &[String] {
        self.stream.referrals()
    }

    pub fn id(&self) -> u32 {
        self.stream.id()
    }
}
