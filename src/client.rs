use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::codec::{self, Framing};
use crate::error::{LdapError, Result};
use crate::filter;
use crate::ldap::{
    DerefAliases, Filter, Message, MessageParams, MsgBind, MsgExtendedRequest, MsgSearch,
    MsgUnbind, SearchScope, LDAP_VERSION, STARTTLS_OID,
};
use crate::search::{SearchItem, SearchStream};
use crate::tls::{self, TlsOptions};
use crate::url::{LdapUrl, Scheme};

/// Transport for one connection: plain TCP until StartTLS (or ldaps://)
/// wraps it.
enum ConnStream {
    Plain(TcpStream),
    Tls(Box<ClientTlsStream<TcpStream>>),
}

impl AsyncRead for ConnStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ConnStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ConnStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            ConnStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ConnStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ConnStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ConnStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ConnStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ConnStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

impl Unpin for ConnStream {}

/// Completion handle for one in-flight message id.
enum Handler {
    Single(oneshot::Sender<Result<Message>>),
    Search(mpsc::UnboundedSender<SearchItem>),
}

/// In-flight table: message id -> completion handle. The only structure
/// touched by concurrent logical operations; all access goes through the
/// mutex.
struct Contexts {
    contexts: Mutex<HashMap<u32, Handler>>,
}

impl Contexts {
    fn new() -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
        }
    }

    fn add(&self, id: u32, h: Handler) {
        let mut l = self.contexts.lock().unwrap();
        l.insert(id, h);
    }

    fn remove(&self, id: u32) {
        let mut l = self.contexts.lock().unwrap();
        l.remove(&id);
    }

    /// Deliver one decoded message to whoever is waiting on its id. Search
    /// ids stay registered until their Done message; everything else is a
    /// single response.
    fn route(&self, msg: Message) {
        let id = msg.id;
        let mut l = self.contexts.lock().unwrap();
        match msg.params {
            MessageParams::SearchEntry(e) => {
                if let Some(Handler::Search(tx)) = l.get(&id) {
                    let _ = tx.send(SearchItem::Entry(e));
                } else {
                    debug!("dropping entry for unknown message id {}", id);
                }
            }
            MessageParams::SearchRef(r) => {
                if let Some(Handler::Search(tx)) = l.get(&id) {
                    let _ = tx.send(SearchItem::Ref(r.urls));
                } else {
                    debug!("dropping referral for unknown message id {}", id);
                }
            }
            MessageParams::SearchDone(d) => {
                if let Some(Handler::Search(tx)) = l.remove(&id) {
                    let _ = tx.send(SearchItem::Done(d));
                } else {
                    debug!("dropping search done for unknown message id {}", id);
                }
            }
            params => match l.remove(&id) {
                Some(Handler::Single(tx)) => {
                    let _ = tx.send(Ok(Message { id, params }));
                }
                Some(Handler::Search(tx)) => {
                    let _ = tx.send(SearchItem::Error(LdapError::decoding(
                        "non-search response on a search message id",
                    )));
                }
                None => debug!("dropping response for unknown message id {}", id),
            },
        }
    }

    /// Fail one exchange, for a frame that would not decode.
    fn route_error(&self, id: u32, error: LdapError) {
        let mut l = self.contexts.lock().unwrap();
        match l.remove(&id) {
            Some(Handler::Single(tx)) => {
                let _ = tx.send(Err(error));
            }
            Some(Handler::Search(tx)) => {
                let _ = tx.send(SearchItem::Error(error));
            }
            None => debug!("dropping error for unknown message id {}", id),
        }
    }

    /// Dropping every handler wakes all waiters with a closed-channel error.
    fn fail_all(&self) {
        let mut l = self.contexts.lock().unwrap();
        l.clear();
    }
}

enum Cmd {
    Write(Vec<u8>),
    StartTls {
        connector: TlsConnector,
        name: ServerName<'static>,
        ack: oneshot::Sender<Result<()>>,
    },
    Close,
}

/// Connection driver task: sole owner of the transport. Writes are
/// serialized through the command channel; reads are demultiplexed onto the
/// in-flight table. StartTLS swaps the transport in place between commands.
async fn drive(stream: ConnStream, mut cmd_rx: mpsc::Receiver<Cmd>, contexts: Arc<Contexts>) {
    let (mut rd, mut wr) = tokio::io::split(stream);
    let mut buf = vec![0u8; 4096];
    let mut acc: Vec<u8> = Vec::new();

    'outer: loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Cmd::Write(data)) => {
                    if let Err(e) = wr.write_all(&data).await {
                        warn!("write failed: {}", e);
                        break 'outer;
                    }
                }
                Some(Cmd::StartTls { connector, name, ack }) => {
                    if !acc.is_empty() {
                        let _ = ack.send(Err(LdapError::decoding(
                            "unexpected bytes on the wire before TLS handshake",
                        )));
                        continue;
                    }
                    let stream = rd.unsplit(wr);
                    match stream {
                        ConnStream::Plain(tcp) => match connector.connect(name, tcp).await {
                            Ok(tls) => {
                                let halves = tokio::io::split(ConnStream::Tls(Box::new(tls)));
                                rd = halves.0;
                                wr = halves.1;
                                let _ = ack.send(Ok(()));
                            }
                            Err(e) => {
                                let _ = ack.send(Err(LdapError::connect(format!(
                                    "TLS handshake failed: {}",
                                    e
                                ))));
                                break 'outer;
                            }
                        },
                        already_tls => {
                            // state machine should prevent this; keep driving
                            let halves = tokio::io::split(already_tls);
                            rd = halves.0;
                            wr = halves.1;
                            let _ = ack.send(Err(LdapError::state("TLS already in place")));
                        }
                    }
                }
                Some(Cmd::Close) | None => break 'outer,
            },
            res = rd.read(&mut buf) => match res {
                Ok(0) => {
                    debug!("connection closed by peer");
                    break 'outer;
                }
                Ok(n) => {
                    acc.extend_from_slice(&buf[..n]);
                    loop {
                        match codec::parse_message(&acc) {
                            Ok(Framing::Complete(msg, consumed)) => {
                                acc.drain(..consumed);
                                contexts.route(msg);
                            }
                            Ok(Framing::Malformed { id, error, consumed }) => {
                                warn!("skipping malformed message: {}", error);
                                acc.drain(..consumed);
                                if let Some(id) = id {
                                    contexts.route_error(id, error);
                                }
                            }
                            Ok(Framing::Incomplete) => break,
                            Err(e) => {
                                warn!("unrecoverable stream corruption: {}", e);
                                break 'outer;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("read failed: {}", e);
                    break 'outer;
                }
            }
        }
    }
    contexts.fail_all();
}

#[derive(Debug, Default)]
struct StateFlags {
    secured: bool,
    negotiating: bool,
    bound: bool,
    closed: bool,
}

struct ConnInner {
    cmd_tx: mpsc::Sender<Cmd>,
    contexts: Arc<Contexts>,
    last_id: AtomicU32,
    state: Mutex<StateFlags>,
    host: String,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

impl ConnInner {
    /// Ids start at 1 and are never reused within a connection; 0 is the
    /// protocol's unsolicited-notification id.
    fn next_id(&self) -> u32 {
        self.last_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Options applied while establishing the transport.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Bound on each candidate's connect phase; `None` disables it.
    pub network_timeout: Option<Duration>,
    /// TLS settings used when a candidate URL is ldaps://.
    pub tls: TlsOptions,
}

/// Search parameters. `base_dn` is the one mandatory field; everything else
/// has protocol defaults.
#[derive(Debug, Clone)]
pub struct SearchOpts {
    pub base_dn: Option<String>,
    pub scope: SearchScope,
    pub deref: DerefAliases,
    pub filter: Option<String>,
    pub attributes: Vec<String>,
    pub size_limit: u32,
    pub time_limit: u32,
    pub types_only: bool,
}

impl Default for SearchOpts {
    fn default() -> Self {
        SearchOpts {
            base_dn: None,
            scope: SearchScope::WholeSubtree,
            deref: DerefAliases::Never,
            filter: None,
            attributes: Vec::new(),
            size_limit: 0,
            time_limit: 0,
            types_only: false,
        }
    }
}

impl SearchOpts {
    pub fn base(dn: impl Into<String>) -> Self {
        SearchOpts {
            base_dn: Some(dn.into()),
            ..SearchOpts::default()
        }
    }

    pub fn scope(mut self, scope: SearchScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn attributes(mut self, attrs: &[&str]) -> Self {
        self.attributes = attrs.iter().map(|a| (*a).to_owned()).collect();
        self
    }

    pub fn size_limit(mut self, n: u32) -> Self {
        self.size_limit = n;
        self
    }

    pub fn time_limit(mut self, seconds: u32) -> Self {
        self.time_limit = seconds;
        self
    }

    pub fn types_only(mut self, yes: bool) -> Self {
        self.types_only = yes;
        self
    }
}

/// One client connection to a directory server. All operations may be issued
/// concurrently from clones of the surrounding `Arc`; responses are matched
/// back by message id.
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    /// Try each candidate URL in listed order; the first transport that
    /// establishes wins. ldaps:// candidates negotiate TLS immediately.
    pub async fn connect(urls: &[&str], options: ConnectOptions) -> Result<Connection> {
        if urls.is_empty() {
            return Err(LdapError::param("at least one URL is required"));
        }
        let parsed = urls
            .iter()
            .map(|u| LdapUrl::parse(u))
            .collect::<Result<Vec<_>>>()?;

        let mut last_err = None;
        for url in &parsed {
            debug!("connecting to {}", url);
            let attempt = TcpStream::connect(url.addr());
            let res: Result<TcpStream> = match options.network_timeout {
                Some(t) => match tokio::time::timeout(t, attempt).await {
                    Ok(r) => r.map_err(Into::into),
                    Err(_) => Err(LdapError::Api {
                        kind: crate::error::ApiErrorKind::Timeout,
                        message: Some(format!("connect to {} timed out", url)),
                    }),
                },
                None => attempt.await.map_err(Into::into),
            };
            match res {
                Ok(tcp) => match Self::establish(tcp, url, &options).await {
                    Ok(conn) => {
                        info!("connected to {}", url);
                        return Ok(conn);
                    }
                    Err(e) => {
                        warn!("connection to {} failed: {}", url, e);
                        last_err = Some(e);
                    }
                },
                Err(e) => {
                    warn!("connect to {} failed: {}", url, e);
                    last_err = Some(e);
                }
            }
        }
        let detail = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no candidates".to_owned());
        Err(LdapError::connect(format!(
            "all {} endpoints failed, last error: {}",
            parsed.len(),
            detail
        )))
    }

    async fn establish(
        tcp: TcpStream,
        url: &LdapUrl,
        options: &ConnectOptions,
    ) -> Result<Connection> {
        let peer_addr = tcp.peer_addr().ok();
        let local_addr = tcp.local_addr().ok();
        let (stream, secured) = match url.scheme {
            Scheme::Ldap => (ConnStream::Plain(tcp), false),
            Scheme::Ldaps => {
                let config = tls::build_client_config(&options.tls)?;
                let connector = TlsConnector::from(config);
                let name = server_name(&url.host)?;
                let tls_stream = connector.connect(name, tcp).await.map_err(|e| {
                    LdapError::connect(format!("TLS handshake with {} failed: {}", url, e))
                })?;
                (ConnStream::Tls(Box::new(tls_stream)), true)
            }
        };

        let contexts = Arc::new(Contexts::new());
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        tokio::spawn(drive(stream, cmd_rx, contexts.clone()));
        Ok(Connection {
            inner: Arc::new(ConnInner {
                cmd_tx,
                contexts,
                last_id: AtomicU32::new(0),
                state: Mutex::new(StateFlags {
                    secured,
                    ..StateFlags::default()
                }),
                host: url.host.clone(),
                peer_addr,
                local_addr,
            }),
        })
    }

    /// Upgrade the connection to TLS in place via the StartTLS extended
    /// operation. Valid only while the transport is still plaintext.
    pub async fn start_tls(&self, options: &TlsOptions) -> Result<()> {
        {
            let mut st = self.inner.state.lock().unwrap();
            if st.closed {
                return Err(LdapError::state("connection is closed"));
            }
            if st.secured {
                return Err(LdapError::state("TLS already in place"));
            }
            if st.negotiating {
                return Err(LdapError::state("TLS negotiation already in progress"));
            }
            st.negotiating = true;
        }
        let result = self.start_tls_inner(options).await;
        let mut st = self.inner.state.lock().unwrap();
        st.negotiating = false;
        if result.is_ok() {
            st.secured = true;
        }
        result
    }

    /// String-keyed variant: non-`tls_` keys are skipped with a logged
    /// notice instead of failing, so option bags can be passed through.
    pub async fn start_tls_with_pairs<'a, I>(&self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let options = TlsOptions::from_pairs(pairs)?;
        self.start_tls(&options).await
    }

    async fn start_tls_inner(&self, options: &TlsOptions) -> Result<()> {
        // validate the option set before touching the wire
        let config = tls::build_client_config(options)?;
        debug!("starting TLS...");
        let resp = self
            .send_single(MessageParams::ExtendedReq(MsgExtendedRequest {
                name: STARTTLS_OID.to_owned(),
                value: None,
            }))
            .await?;
        let r = match resp.params {
            MessageParams::ExtendedResp(r) => r,
            _ => {
                return Err(LdapError::decoding(
                    "unexpected response to StartTLS request",
                ))
            }
        };
        if !r.res.is_success() {
            return Err(r.res.into_error());
        }

        let connector = TlsConnector::from(config);
        let name = server_name(&self.inner.host)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner
            .cmd_tx
            .send(Cmd::StartTls {
                connector,
                name,
                ack: ack_tx,
            })
            .await
            .map_err(|_| LdapError::server_down("connection task gone"))?;
        match ack_rx.await {
            Ok(res) => res,
            Err(_) => Err(LdapError::server_down("connection closed during handshake")),
        }?;
        debug!("TLS started");
        Ok(())
    }

    /// Simple bind; both arguments default to empty for an anonymous bind.
    /// On failure the connection state is unchanged and the caller may retry.
    pub async fn simple_bind(&self, dn: Option<&str>, password: Option<&str>) -> Result<()> {
        self.check_open()?;
        let resp = self
            .send_single(MessageParams::Bind(MsgBind {
                version: LDAP_VERSION,
                name: dn.unwrap_or("").to_owned(),
                password: password.unwrap_or("").to_owned(),
            }))
            .await?;
        let r = match resp.params {
            MessageParams::BindResponse(r) => r,
            _ => return Err(LdapError::decoding("unexpected response to bind request")),
        };
        if r.res.is_success() {
            self.inner.state.lock().unwrap().bound = true;
            debug!("bound as {:?}", dn.unwrap_or("(anonymous)"));
            Ok(())
        } else {
            Err(r.res.into_error())
        }
    }

    /// Issue a search and return its result stream without waiting for the
    /// first entry. A missing base DN fails immediately, before any network
    /// round trip.
    pub async fn search(&self, opts: SearchOpts) -> Result<SearchStream> {
        self.check_open()?;
        let base_object = opts
            .base_dn
            .ok_or_else(|| LdapError::param("search requires a base DN"))?;
        let filter = match &opts.filter {
            Some(f) => filter::parse_filter(f)?,
            None => Filter::present_all(),
        };
        let id = self.inner.next_id();
        let msg = Message {
            id,
            params: MessageParams::Search(MsgSearch {
                base_object,
                scope: opts.scope,
                deref: opts.deref,
                size_limit: opts.size_limit,
                time_limit: opts.time_limit,
                types_only: opts.types_only,
                filter,
                attributes: opts.attributes,
            }),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.contexts.add(id, Handler::Search(tx));
        let data = codec::encode_message(&msg)?;
        if self.inner.cmd_tx.send(Cmd::Write(data)).await.is_err() {
            self.inner.contexts.remove(id);
            return Err(LdapError::server_down("connection task gone"));
        }
        debug!("search {} started", id);
        Ok(SearchStream::new(id, rx))
    }

    /// Stop caring about an in-flight search. Buffered-but-undelivered
    /// entries are discarded; the server is told but not obliged to stop.
    pub async fn abandon(&self, stream: SearchStream) -> Result<()> {
        let target = stream.id();
        self.inner.contexts.remove(target);
        drop(stream);
        self.check_open()?;
        let id = self.inner.next_id();
        let data = codec::ldap_write_abandon_request(id, target);
        self.inner
            .cmd_tx
            .send(Cmd::Write(data))
            .await
            .map_err(|_| LdapError::server_down("connection task gone"))?;
        debug!("abandoned search {}", target);
        Ok(())
    }

    /// Send a best-effort Unbind and release the transport. Terminal: every
    /// operation after this fails with a state error.
    pub async fn unbind(&self) -> Result<()> {
        {
            let mut st = self.inner.state.lock().unwrap();
            if st.closed {
                return Err(LdapError::state("connection is closed"));
            }
            st.closed = true;
            st.bound = false;
        }
        let id = self.inner.next_id();
        let data = codec::encode_message(&Message {
            id,
            params: MessageParams::Unbind(MsgUnbind {}),
        })?;
        // not acknowledged by the server; failures only mean it was already gone
        let _ = self.inner.cmd_tx.send(Cmd::Write(data)).await;
        let _ = self.inner.cmd_tx.send(Cmd::Close).await;
        debug!("connection closed");
        Ok(())
    }

    /// Alias for `unbind`.
    pub async fn close(&self) -> Result<()> {
        self.unbind().await
    }

    pub fn is_secured(&self) -> bool {
        self.inner.state.lock().unwrap().secured
    }

    pub fn is_bound(&self) -> bool {
        self.inner.state.lock().unwrap().bound
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().closed
    }

    pub fn protocol_version(&self) -> u32 {
        LDAP_VERSION
    }

    /// Remote endpoint of the underlying socket.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Local endpoint of the underlying socket, for callers doing their own
    /// connection bookkeeping.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.state.lock().unwrap().closed {
            return Err(LdapError::state("connection is closed"));
        }
        Ok(())
    }

    async fn send_single(&self, params: MessageParams) -> Result<Message> {
        let id = self.inner.next_id();
        let msg = Message { id, params };
        let (tx, rx) = oneshot::channel();
        self.inner.contexts.add(id, Handler::Single(tx));
        let data = codec::encode_message(&msg)?;
        if self.inner.cmd_tx.send(Cmd::Write(data)).await.is_err() {
            self.inner.contexts.remove(id);
            return Err(LdapError::server_down("connection task gone"));
        }
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(LdapError::server_down(
                "connection closed while awaiting response",
            )),
        }
    }
}

fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_owned())
        .map_err(|_| LdapError::param(format!("'{}' is not a valid TLS server name", host)))
}
