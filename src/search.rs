use tokio::sync::mpsc;

use crate::error::{result_code, LdapError, Result};
use crate::ldap::{Entry, MsgSearchDone, MsgSearchEntry};

/// Items routed to a search's channel by the connection driver.
#[derive(Debug)]
pub(crate) enum SearchItem {
    Entry(MsgSearchEntry),
    Ref(Vec<String>),
    Done(MsgSearchDone),
    Error(LdapError),
}

/// Terminal status of a finished search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchDone {
    pub code: u32,
    pub referrals: Vec<String>,
}

impl SearchDone {
    pub fn is_complete(&self) -> bool {
        self.code == result_code::SUCCESS
    }

    /// Size/time/admin limit hit: the entries already delivered are valid,
    /// the result set is just not all of it.
    pub fn is_partial(&self) -> bool {
        matches!(
            self.code,
            result_code::TIME_LIMIT_EXCEEDED
                | result_code::SIZE_LIMIT_EXCEEDED
                | result_code::ADMIN_LIMIT_EXCEEDED
        )
    }
}

fn terminal_ok(code: u32) -> bool {
    matches!(
        code,
        result_code::SUCCESS
            | result_code::TIME_LIMIT_EXCEEDED
            | result_code::SIZE_LIMIT_EXCEEDED
            | result_code::ADMIN_LIMIT_EXCEEDED
    )
}

/// Lazy, single-pass sequence of entries for one search. Entries arrive as
/// the server sends them; the stream ends when the Done message arrives.
/// Restartable only by issuing a new search.
pub struct SearchStream {
    id: u32,
    rx: mpsc::UnboundedReceiver<SearchItem>,
    referrals: Vec<String>,
    done: Option<SearchDone>,
    pending_error: Option<LdapError>,
    errored: bool,
}

impl SearchStream {
    pub(crate) fn new(id: u32, rx: mpsc::UnboundedReceiver<SearchItem>) -> Self {
        SearchStream {
            id,
            rx,
            referrals: Vec::new(),
            done: None,
            pending_error: None,
            errored: false,
        }
    }

    /// The message id of the search request; also the handle `abandon` uses.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The next entry, or `None` once the stream has terminated. After the
    /// terminal Done every further call keeps returning `None`; a closed
    /// connection surfaces an error instead of blocking forever.
    pub async fn next(&mut self) -> Result<Option<Entry>> {
        loop {
            if let Some(e) = self.pending_error.take() {
                self.errored = true;
                return Err(e);
            }
            if self.done.is_some() || self.errored {
                return Ok(None);
            }
            match self.rx.recv().await {
                Some(item) => {
                    if let Some(entry) = self.absorb(item) {
                        return Ok(Some(entry));
                    }
                }
                None => {
                    self.errored = true;
                    return Err(LdapError::server_down("connection closed during search"));
                }
            }
        }
    }

    /// Up to `n` entries: blocks until at least one is available (or the
    /// stream terminates), then drains whatever else is already buffered.
    pub async fn next_n(&mut self, n: usize) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        if n == 0 {
            return Ok(out);
        }
        match self.next().await? {
            Some(e) => out.push(e),
            None => return Ok(out),
        }
        while out.len() < n && self.done.is_none() && self.pending_error.is_none() {
            match self.rx.try_recv() {
                Ok(item) => {
                    if let Some(entry) = self.absorb(item) {
                        out.push(entry);
                    }
                }
                Err(_) => break,
            }
        }
        Ok(out)
    }

    /// Drain the whole stream into a vector.
    pub async fn collect(&mut self) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        while let Some(e) = self.next().await? {
            out.push(e);
        }
        Ok(out)
    }

    /// Terminal status, present once the Done message has been consumed.
    pub fn done(&self) -> Option<&SearchDone> {
        self.done.as_ref()
    }

    /// Referral URLs collected from reference messages and the final result.
    pub fn referrals(&self) -> &[String] {
        &self.referrals
    }

    fn absorb(&mut self, item: SearchItem) -> Option<Entry> {
        match item {
            SearchItem::Entry(e) => return Some(e.into()),
            SearchItem::Ref(urls) => self.referrals.extend(urls),
            SearchItem::Done(d) => {
                if terminal_ok(d.res.code) {
                    self.referrals.extend(d.res.referrals.clone());
                    self.done = Some(SearchDone {
                        code: d.res.code,
                        referrals: self.referrals.clone(),
                    });
                } else {
                    self.pending_error = Some(d.res.into_error());
                }
            }
            SearchItem::Error(e) => self.pending_error = Some(e),
        }
        None
    }
}

/// Async-iteration view: yields `Ok(entry)` per entry and a final `Err` on
/// a hard failure; partial success still ends the stream cleanly.
impl futures::Stream for SearchStream {
    type Item = Result<Entry>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;
        let this = &mut *self;
        loop {
            if let Some(e) = this.pending_error.take() {
                this.errored = true;
                return Poll::Ready(Some(Err(e)));
            }
            if this.done.is_some() || this.errored {
                return Poll::Ready(None);
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(item)) => {
                    if let Some(entry) = this.absorb(item) {
                        return Poll::Ready(Some(Ok(entry)));
                    }
                }
                Poll::Ready(None) => {
                    this.errored = true;
                    return Poll::Ready(Some(Err(LdapError::server_down(
                        "connection closed during search",
                    ))));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl std::fmt::Debug for SearchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchStream")
            .field("id", &self.id)
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap::{LdapResult, PartialAttribute};

    fn entry_item(dn: &str) -> SearchItem {
        SearchItem::Entry(MsgSearchEntry {
            object_name: dn.to_owned(),
            attributes: vec![PartialAttribute::strings("cn", &["x"])],
        })
    }

    fn done_item(code: u32) -> SearchItem {
        SearchItem::Done(MsgSearchDone {
            res: LdapResult {
                code,
                ..LdapResult::default()
            },
        })
    }

    #[tokio::test]
    async fn count_independent_of_batch_size() {
        for n in [1usize, 10] {
            let (tx, rx) = mpsc::unbounded_channel();
            for i in 0..3 {
                tx.send(entry_item(&format!("cn={},dc=example,dc=com", i)))
                    .unwrap();
            }
            tx.send(done_item(result_code::SUCCESS)).unwrap();
            let mut stream = SearchStream::new(1, rx);
            let mut total = 0;
            loop {
                let batch = stream.next_n(n).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                total += batch.len();
            }
            assert_eq!(total, 3);
            assert!(stream.done().unwrap().is_complete());
            // terminated stream stays terminated
            assert!(stream.next().await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn size_limit_is_partial_success() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(entry_item("cn=only,dc=example,dc=com")).unwrap();
        tx.send(done_item(result_code::SIZE_LIMIT_EXCEEDED)).unwrap();
        let mut stream = SearchStream::new(1, rx);
        let entries = stream.collect().await.unwrap();
        assert_eq!(entries.len(), 1);
        let done = stream.done().unwrap();
        assert!(done.is_partial());
        assert!(!done.is_complete());
    }

    #[tokio::test]
    async fn hard_error_surfaces_after_delivered_entries() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(entry_item("cn=a,dc=example,dc=com")).unwrap();
        tx.send(done_item(result_code::NO_SUCH_OBJECT)).unwrap();
        let mut stream = SearchStream::new(1, rx);
        assert!(stream.next().await.unwrap().is_some());
        let err = stream.next().await.unwrap_err();
        assert!(matches!(err, LdapError::Name { code: 32, .. }));
        // after the error the stream is spent, not stuck
        assert!(stream.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn referral_urls_are_collected() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(SearchItem::Ref(vec![
            "ldap://other.example.com/dc=example,dc=com".to_owned(),
        ]))
        .unwrap();
        tx.send(done_item(result_code::SUCCESS)).unwrap();
        let mut stream = SearchStream::new(1, rx);
        assert!(stream.next().await.unwrap().is_none());
        assert_eq!(stream.referrals().len(), 1);
    }

    #[tokio::test]
    async fn usable_as_a_futures_stream() {
        use futures::StreamExt;
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(entry_item("cn=a,dc=example,dc=com")).unwrap();
        tx.send(entry_item("cn=b,dc=example,dc=com")).unwrap();
        tx.send(done_item(result_code::SUCCESS)).unwrap();
        let mut stream = SearchStream::new(1, rx);
        let mut dns = Vec::new();
        while let Some(item) = StreamExt::next(&mut stream).await {
            dns.push(item.unwrap().dn);
        }
        assert_eq!(dns, vec!["cn=a,dc=example,dc=com", "cn=b,dc=example,dc=com"]);
    }

    #[tokio::test]
    async fn closed_connection_errors_instead_of_blocking() {
        let (tx, rx) = mpsc::unbounded_channel::<SearchItem>();
        drop(tx);
        let mut stream = SearchStream::new(1, rx);
        let err = stream.next().await.unwrap_err();
        assert!(matches!(
            err,
            LdapError::Api {
                kind: crate::error::ApiErrorKind::ServerDown,
                ..
            }
        ));
    }
}
