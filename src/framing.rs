use tokio::io::AsyncReadExt;

use crate::codec::{self, Framing};
use crate::error::{LdapError, Result};
use crate::ldap::Message;

const INITIAL_BUFFER: usize = 4096;

/// Accumulates bytes from a transport and yields whole messages. A message
/// split across any number of reads decodes the same as one that arrives in
/// a single segment.
pub struct DecodeContext {
    buffer: Vec<u8>,
    have: usize,
}

impl DecodeContext {
    pub fn new() -> Self {
        Self {
            buffer: vec![0; INITIAL_BUFFER],
            have: 0,
        }
    }

    /// Bytes buffered but not yet consumed by a complete message.
    pub fn pending(&self) -> usize {
        self.have
    }

    fn consume(&mut self, n: usize) {
        if n != self.have {
            self.buffer.copy_within(n..self.have, 0);
        }
        self.have -= n;
    }

    /// Read until one whole message is decoded. A malformed-but-framed
    /// message consumes its bytes and surfaces the decode error, leaving the
    /// stream usable for the next message.
    pub async fn get_message<R: tokio::io::AsyncRead + Unpin>(
        &mut self,
        s: &mut R,
    ) -> Result<Message> {
        loop {
            match codec::parse_message(&self.buffer[..self.have])? {
                Framing::Complete(parsed, parsed_size) => {
                    self.consume(parsed_size);
                    return Ok(parsed);
                }
                Framing::Malformed {
                    error, consumed, ..
                } => {
                    self.consume(consumed);
                    return Err(error);
                }
                Framing::Incomplete => {
                    if self.have == self.buffer.len() {
                        self.buffer.resize(self.buffer.len() * 2, 0);
                    }
                    let res = s.read(&mut self.buffer[self.have..]).await?;
                    if res == 0 {
                        return Err(LdapError::server_down("connection closed by peer"));
                    }
                    self.have += res;
                }
            }
        }
    }
}

impl Default for DecodeContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap::MessageParams;

    #[tokio::test]
    async fn whole_and_split_reads_agree() {
        let unbind: &[u8] = &[0x30, 0x05, 0x02, 0x01, 0x03, 0x42, 0x00];
        let mut reader = tokio_test::io::Builder::new().read(unbind).build();
        let mut dec = DecodeContext::new();
        let m = dec.get_message(&mut reader).await.unwrap();
        assert_eq!(m.id, 3);
        assert!(matches!(m.params, MessageParams::Unbind(_)));

        for cut in 1..unbind.len() - 1 {
            let mut reader = tokio_test::io::Builder::new()
                .read(&unbind[..cut])
                .read(&unbind[cut..])
                .build();
            let mut dec = DecodeContext::new();
            let m = dec.get_message(&mut reader).await.unwrap();
            assert_eq!(m.id, 3);
            assert!(matches!(m.params, MessageParams::Unbind(_)));
            assert_eq!(dec.pending(), 0);
        }
    }

    #[tokio::test]
    async fn two_messages_in_one_segment() {
        let mut data = crate::codec::ldap_write_bind_response(1, &crate::ldap::LdapResult::success());
        data.extend_from_slice(&[0x30, 0x05, 0x02, 0x01, 0x02, 0x42, 0x00]);
        let mut reader = tokio_test::io::Builder::new().read(&data).build();
        let mut dec = DecodeContext::new();
        let m1 = dec.get_message(&mut reader).await.unwrap();
        assert_eq!(m1.id, 1);
        let m2 = dec.get_message(&mut reader).await.unwrap();
        assert_eq!(m2.id, 2);
        assert_eq!(dec.pending(), 0);
    }

    #[tokio::test]
    async fn eof_is_server_down() {
        let mut reader = tokio_test::io::Builder::new().read(&[0x30, 0x05]).build();
        let mut dec = DecodeContext::new();
        let err = dec.get_message(&mut reader).await.unwrap_err();
        assert!(matches!(
            err,
            LdapError::Api {
                kind: crate::error::ApiErrorKind::ServerDown,
                ..
            }
        ));
    }
}
