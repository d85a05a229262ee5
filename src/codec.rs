use std::io::Cursor;

use crate::asn1;
use crate::error::{LdapError, Result};
use crate::ldap::{
    DerefAliases, Filter, FilterAttributeValueAssertion, FilterPresent, FilterSubstrings,
    LdapResult, Message, MessageParams, MsgAbandon, MsgBind, MsgBindResponse, MsgExtendedRequest,
    MsgExtendedResponse, MsgSearch, MsgSearchDone, MsgSearchEntry, MsgSearchRef, MsgUnbind,
    PartialAttribute, SearchScope,
};

// application tags, RFC 4511
const TAG_BIND_REQUEST: u8 = 0x60;
const TAG_BIND_RESPONSE: u8 = 0x61;
const TAG_UNBIND_REQUEST: u8 = 0x42;
const TAG_SEARCH_REQUEST: u8 = 0x63;
const TAG_SEARCH_ENTRY: u8 = 0x64;
const TAG_SEARCH_DONE: u8 = 0x65;
const TAG_SEARCH_REF: u8 = 0x73;
const TAG_ABANDON_REQUEST: u8 = 0x50;
const TAG_EXTENDED_REQUEST: u8 = 0x77;
const TAG_EXTENDED_RESPONSE: u8 = 0x78;

// context-specific tags
const TAG_AUTH_SIMPLE: u8 = 0x80;
const TAG_REFERRAL: u8 = 0xa3;
const TAG_EXT_REQ_NAME: u8 = 0x80;
const TAG_EXT_REQ_VALUE: u8 = 0x81;
const TAG_EXT_RESP_NAME: u8 = 0x8a;
const TAG_EXT_RESP_VALUE: u8 = 0x8b;

const TAG_FILTER_AND: u8 = 0xa0;
const TAG_FILTER_OR: u8 = 0xa1;
const TAG_FILTER_NOT: u8 = 0xa2;
const TAG_FILTER_EQUALITY: u8 = 0xa3;
const TAG_FILTER_SUBSTRINGS: u8 = 0xa4;
const TAG_FILTER_PRESENT: u8 = 0x87;
const TAG_SUBSTRING_INITIAL: u8 = 0x80;
const TAG_SUBSTRING_ANY: u8 = 0x81;
const TAG_SUBSTRING_FINAL: u8 = 0x82;

const LDAP_MAX_PARAM_SIZE: usize = 1024;
const MAX_FILTER_DEPTH: usize = 64;
const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Outcome of one framing attempt over an accumulating buffer. `Incomplete`
/// asks the caller for more bytes. `Malformed` means the frame boundary is
/// known but the contents do not decode; the caller skips `consumed` bytes
/// and fails only the exchange identified by `id`. An `Err` from
/// `parse_message` means the boundary itself is unrecoverable.
#[derive(Debug)]
pub enum Framing {
    Complete(Message, usize),
    Incomplete,
    Malformed {
        id: Option<u32>,
        error: LdapError,
        consumed: usize,
    },
}

// ---------------------------------------------------------------- encoding

pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    match &msg.params {
        MessageParams::Bind(b) => Ok(ldap_write_bind_request(msg.id, &b.name, &b.password)),
        MessageParams::BindResponse(r) => Ok(ldap_write_bind_response(msg.id, &r.res)),
        MessageParams::Search(s) => Ok(ldap_write_search_request(msg.id, s)),
        MessageParams::SearchEntry(e) => {
            Ok(ldap_write_search_res_entry(msg.id, &e.object_name, &e.attributes))
        }
        MessageParams::SearchRef(r) => Ok(ldap_write_search_res_ref(msg.id, &r.urls)),
        MessageParams::SearchDone(d) => Ok(ldap_write_search_res_done(msg.id, &d.res)),
        MessageParams::ExtendedReq(e) => {
            Ok(ldap_write_extended_request(msg.id, &e.name, e.value.as_deref()))
        }
        MessageParams::ExtendedResp(e) => Ok(ldap_write_extended_response(msg.id, e)),
        MessageParams::Unbind(_) => Ok(ldap_write_unbind_request(msg.id)),
        MessageParams::Abandon(a) => Ok(ldap_write_abandon_request(msg.id, a.id)),
    }
}

pub fn ldap_write_bind_request(id: u32, name: &str, password: &str) -> Vec<u8> {
    let mut e = asn1::Encoder::new();
    e.start_seq(asn1::TAG_SEQUENCE);
    e.write_int(id);
    e.start_seq(TAG_BIND_REQUEST);
    e.write_int(crate::ldap::LDAP_VERSION);
    e.write_octet_string(name.as_bytes());
    e.write_octet_string_with_tag(TAG_AUTH_SIMPLE, password.as_bytes());
    e.encode()
}

pub fn ldap_write_search_request(id: u32, s: &MsgSearch) -> Vec<u8> {
    let mut e = asn1::Encoder::new();
    e.start_seq(asn1::TAG_SEQUENCE);
    e.write_int(id);
    e.start_seq(TAG_SEARCH_REQUEST);
    e.write_octet_string(s.base_object.as_bytes());
    e.write_enum(s.scope as u8);
    e.write_enum(s.deref as u8);
    e.write_int(s.size_limit);
    e.write_int(s.time_limit);
    e.write_bool(s.types_only);
    write_filter(&mut e, &s.filter);
    e.start_seq(asn1::TAG_SEQUENCE);
    for attr in &s.attributes {
        e.write_octet_string(attr.as_bytes());
    }
    e.encode()
}

fn write_filter(e: &mut asn1::Encoder, f: &Filter) {
    match f {
        Filter::And(items) => {
            e.start_seq(TAG_FILTER_AND);
            for i in items {
                write_filter(e, i);
            }
            e.end_seq();
        }
        Filter::Or(items) => {
            e.start_seq(TAG_FILTER_OR);
            for i in items {
                write_filter(e, i);
            }
            e.end_seq();
        }
        Filter::Not(inner) => {
            e.start_seq(TAG_FILTER_NOT);
            write_filter(e, inner);
            e.end_seq();
        }
        Filter::EqualityMatch(ava) => {
            e.start_seq(TAG_FILTER_EQUALITY);
            e.write_octet_string(ava.name.as_bytes());
            e.write_octet_string(ava.value.as_bytes());
            e.end_seq();
        }
        Filter::Present(p) => {
            e.write_octet_string_with_tag(TAG_FILTER_PRESENT, p.name.as_bytes());
        }
        Filter::Substrings(s) => {
            e.start_seq(TAG_FILTER_SUBSTRINGS);
            e.write_octet_string(s.name.as_bytes());
            e.start_seq(asn1::TAG_SEQUENCE);
            if let Some(i) = &s.initial {
                e.write_octet_string_with_tag(TAG_SUBSTRING_INITIAL, i.as_bytes());
            }
            for a in &s.any {
                e.write_octet_string_with_tag(TAG_SUBSTRING_ANY, a.as_bytes());
            }
            if let Some(f) = &s.fin {
                e.write_octet_string_with_tag(TAG_SUBSTRING_FINAL, f.as_bytes());
            }
            e.end_seq();
            e.end_seq();
        }
    }
}

fn write_ldap_result(e: &mut asn1::Encoder, res: &LdapResult) {
    e.write_tagged_uint(asn1::TAG_ENUMERATED, res.code);
    e.write_octet_string(res.matched_dn.as_bytes());
    e.write_octet_string(res.diagnostic.as_bytes());
    if !res.referrals.is_empty() {
        e.start_seq(TAG_REFERRAL);
        for url in &res.referrals {
            e.write_octet_string(url.as_bytes());
        }
        e.end_seq();
    }
}

pub fn ldap_write_bind_response(id: u32, res: &LdapResult) -> Vec<u8> {
    let mut e = asn1::Encoder::new();
    e.start_seq(asn1::TAG_SEQUENCE);
    e.write_int(id);
    e.start_seq(TAG_BIND_RESPONSE);
    write_ldap_result(&mut e, res);
    e.encode()
}

pub fn ldap_write_search_res_entry(id: u32, name: &str, attrs: &[PartialAttribute]) -> Vec<u8> {
    let mut e = asn1::Encoder::new();
    e.start_seq(asn1::TAG_SEQUENCE);
    e.write_int(id);
    e.start_seq(TAG_SEARCH_ENTRY);
    e.write_octet_string(name.as_bytes());
    e.start_seq(asn1::TAG_SEQUENCE);
    for attr in attrs {
        e.start_seq(asn1::TAG_SEQUENCE);
        e.write_octet_string(attr.name.as_bytes());
        e.start_seq(asn1::TAG_SET);
        for v in &attr.values {
            e.write_octet_string(v);
        }
        e.end_seq();
        e.end_seq();
    }
    e.encode()
}

pub fn ldap_write_search_res_ref(id: u32, urls: &[String]) -> Vec<u8> {
    let mut e = asn1::Encoder::new();
    e.start_seq(asn1::TAG_SEQUENCE);
    e.write_int(id);
    e.start_seq(TAG_SEARCH_REF);
    for url in urls {
        e.write_octet_string(url.as_bytes());
    }
    e.encode()
}

pub fn ldap_write_search_res_done(id: u32, res: &LdapResult) -> Vec<u8> {
    let mut e = asn1::Encoder::new();
    e.start_seq(asn1::TAG_SEQUENCE);
    e.write_int(id);
    e.start_seq(TAG_SEARCH_DONE);
    write_ldap_result(&mut e, res);
    e.encode()
}

pub fn ldap_write_extended_request(id: u32, name: &str, value: Option<&[u8]>) -> Vec<u8> {
    let mut e = asn1::Encoder::new();
    e.start_seq(asn1::TAG_SEQUENCE);
    e.write_int(id);
    e.start_seq(TAG_EXTENDED_REQUEST);
    e.write_octet_string_with_tag(TAG_EXT_REQ_NAME, name.as_bytes());
    if let Some(v) = value {
        e.write_octet_string_with_tag(TAG_EXT_REQ_VALUE, v);
    }
    e.encode()
}

pub fn ldap_write_extended_response(id: u32, resp: &MsgExtendedResponse) -> Vec<u8> {
    let mut e = asn1::Encoder::new();
    e.start_seq(asn1::TAG_SEQUENCE);
    e.write_int(id);
    e.start_seq(TAG_EXTENDED_RESPONSE);
    write_ldap_result(&mut e, &resp.res);
    if let Some(name) = &resp.name {
        e.write_octet_string_with_tag(TAG_EXT_RESP_NAME, name.as_bytes());
    }
    if let Some(value) = &resp.value {
        e.write_octet_string_with_tag(TAG_EXT_RESP_VALUE, value);
    }
    e.encode()
}

pub fn ldap_write_unbind_request(id: u32) -> Vec<u8> {
    let mut e = asn1::Encoder::new();
    e.start_seq(asn1::TAG_SEQUENCE);
    e.write_int(id);
    e.write_octet_string_with_tag(TAG_UNBIND_REQUEST, &[]);
    e.encode()
}

pub fn ldap_write_abandon_request(id: u32, abandoned_id: u32) -> Vec<u8> {
    let mut e = asn1::Encoder::new();
    e.start_seq(asn1::TAG_SEQUENCE);
    e.write_int(id);
    // AbandonRequest is a bare INTEGER under the application tag
    e.write_octet_string_with_tag(TAG_ABANDON_REQUEST, &asn1::uint_octets(abandoned_id));
    e.encode()
}

// ---------------------------------------------------------------- decoding

/// Framing-level length read. Unlike `asn1::read_size` this does not require
/// the advertised bytes to be present yet; `None` means the length field
/// itself is still arriving.
fn read_envelope_len(data: &[u8]) -> Result<Option<(usize, usize)>> {
    if data.len() < 2 {
        return Ok(None);
    }
    let b1 = data[1] as usize;
    if b1 & 0x80 == 0 {
        return Ok(Some((2, b1)));
    }
    let count = b1 & 0x7f;
    if count == 0 {
        return Err(LdapError::decoding("indefinite message length"));
    }
    if count > std::mem::size_of::<usize>() {
        return Err(LdapError::decoding("message length too wide"));
    }
    if data.len() < 2 + count {
        return Ok(None);
    }
    let mut len = 0usize;
    for &c in &data[2..2 + count] {
        len = (len << 8) + c as usize;
    }
    if len > MAX_MESSAGE_SIZE {
        return Err(LdapError::decoding(format!(
            "message of {} bytes exceeds the size cap",
            len
        )));
    }
    Ok(Some((2 + count, len)))
}

/// Try to frame and decode one message from the front of `data`.
pub fn parse_message(data: &[u8]) -> Result<Framing> {
    let (header_len, content_len) = match read_envelope_len(data)? {
        Some(v) => v,
        None => return Ok(Framing::Incomplete),
    };
    if data[0] != asn1::TAG_SEQUENCE {
        return Err(LdapError::decoding(format!(
            "bad message envelope tag 0x{:02x}",
            data[0]
        )));
    }
    let total = header_len + content_len;
    if data.len() < total {
        return Ok(Framing::Incomplete);
    }

    let frame = &data[..total];
    let mut cursor = Cursor::new(frame);
    cursor.set_position(header_len as u64);
    let message_id = match asn1::read_uint(&mut cursor) {
        Ok(id) => id,
        Err(error) => {
            return Ok(Framing::Malformed {
                id: None,
                error,
                consumed: total,
            })
        }
    };
    match parse_op(&mut cursor) {
        Ok(params) => Ok(Framing::Complete(
            Message {
                id: message_id,
                params,
            },
            total,
        )),
        Err(error) => Ok(Framing::Malformed {
            id: Some(message_id),
            error,
            consumed: total,
        }),
    }
}

fn parse_op(cursor: &mut Cursor<&[u8]>) -> Result<MessageParams> {
    let msg_tag = asn1::read_tag(cursor)?;
    let params = match msg_tag {
        TAG_BIND_REQUEST => {
            let _op_size = asn1::read_size(cursor)?;
            let version = asn1::read_uint(cursor)?;
            let name = asn1::read_string(cursor)?;
            let auth_tag = asn1::read_tag(cursor)?;
            if auth_tag != TAG_AUTH_SIMPLE {
                return Err(LdapError::decoding("unsupported bind authentication"));
            }
            let size = asn1::read_size(cursor)?;
            let password = String::from_utf8(asn1::read_contents(cursor, size)?)
                .map_err(|_| LdapError::decoding("password is not utf-8"))?;
            MessageParams::Bind(MsgBind {
                version,
                name,
                password,
            })
        }
        TAG_BIND_RESPONSE => {
            let op_size = asn1::read_size(cursor)?;
            let op_end = cursor.position() + op_size as u64;
            let res = read_ldap_result(cursor, op_end)?;
            MessageParams::BindResponse(MsgBindResponse { res })
        }
        TAG_SEARCH_REQUEST => {
            let op_size = asn1::read_size(cursor)?;
            let op_end = cursor.position() + op_size as u64;
            let base_object = asn1::read_string(cursor)?;
            let scope = SearchScope::try_from(asn1::read_uint(cursor)?)?;
            let deref = DerefAliases::try_from(asn1::read_uint(cursor)?)?;
            let size_limit = asn1::read_uint(cursor)?;
            let time_limit = asn1::read_uint(cursor)?;
            let types_only = asn1::read_bool(cursor)?;
            let filter = read_filter(cursor, 0)?;
            let mut attributes = Vec::new();
            if cursor.position() < op_end {
                let tag = asn1::read_tag(cursor)?;
                if tag == asn1::TAG_SEQUENCE {
                    let size = asn1::read_size(cursor)?;
                    let end = cursor.position() + size as u64;
                    while cursor.position() < end {
                        attributes.push(asn1::read_string(cursor)?);
                    }
                }
            }
            MessageParams::Search(MsgSearch {
                base_object,
                scope,
                deref,
                size_limit,
                time_limit,
                types_only,
                filter,
                attributes,
            })
        }
        TAG_SEARCH_ENTRY => {
            let _op_size = asn1::read_size(cursor)?;
            let object_name = asn1::read_string(cursor)?;
            let _attrs_tag = asn1::read_tag(cursor)?;
            let attrs_size = asn1::read_size(cursor)?;
            let attrs_end = cursor.position() + attrs_size as u64;
            let mut attributes = Vec::new();
            while cursor.position() < attrs_end {
                let _attr_tag = asn1::read_tag(cursor)?;
                let _attr_size = asn1::read_size(cursor)?;
                let name = asn1::read_string(cursor)?;
                let _set_tag = asn1::read_tag(cursor)?;
                let set_size = asn1::read_size(cursor)?;
                let set_end = cursor.position() + set_size as u64;
                let mut values = Vec::new();
                while cursor.position() < set_end {
                    values.push(asn1::read_bytes(cursor)?);
                }
                attributes.push(PartialAttribute { name, values });
            }
            MessageParams::SearchEntry(MsgSearchEntry {
                object_name,
                attributes,
            })
        }
        TAG_SEARCH_REF => {
            let op_size = asn1::read_size(cursor)?;
            let op_end = cursor.position() + op_size as u64;
            let mut urls = Vec::new();
            while cursor.position() < op_end {
                urls.push(asn1::read_string(cursor)?);
            }
            MessageParams::SearchRef(MsgSearchRef { urls })
        }
        TAG_SEARCH_DONE => {
            let op_size = asn1::read_size(cursor)?;
            let op_end = cursor.position() + op_size as u64;
            let res = read_ldap_result(cursor, op_end)?;
            MessageParams::SearchDone(MsgSearchDone { res })
        }
        TAG_EXTENDED_REQUEST => {
            let op_size = asn1::read_size(cursor)?;
            let op_end = cursor.position() + op_size as u64;
            let name_tag = asn1::read_tag(cursor)?;
            if name_tag != TAG_EXT_REQ_NAME {
                return Err(LdapError::decoding("extended request without name"));
            }
            let size = asn1::read_size(cursor)?;
            let name = String::from_utf8(asn1::read_contents(cursor, size)?)
                .map_err(|_| LdapError::decoding("oid is not utf-8"))?;
            let mut value = None;
            if cursor.position() < op_end && asn1::peek_tag(cursor) == Some(TAG_EXT_REQ_VALUE) {
                asn1::read_tag(cursor)?;
                let size = asn1::read_size(cursor)?;
                value = Some(asn1::read_contents(cursor, size)?);
            }
            MessageParams::ExtendedReq(MsgExtendedRequest { name, value })
        }
        TAG_EXTENDED_RESPONSE => {
            let op_size = asn1::read_size(cursor)?;
            let op_end = cursor.position() + op_size as u64;
            let res = read_ldap_result(cursor, op_end)?;
            let mut name = None;
            if cursor.position() < op_end && asn1::peek_tag(cursor) == Some(TAG_EXT_RESP_NAME) {
                asn1::read_tag(cursor)?;
                let size = asn1::read_size(cursor)?;
                name = Some(
                    String::from_utf8(asn1::read_contents(cursor, size)?)
                        .map_err(|_| LdapError::decoding("oid is not utf-8"))?,
                );
            }
            let mut value = None;
            if cursor.position() < op_end && asn1::peek_tag(cursor) == Some(TAG_EXT_RESP_VALUE) {
                asn1::read_tag(cursor)?;
                let size = asn1::read_size(cursor)?;
                value = Some(asn1::read_contents(cursor, size)?);
            }
            MessageParams::ExtendedResp(MsgExtendedResponse { res, name, value })
        }
        TAG_UNBIND_REQUEST => {
            let _op_size = asn1::read_size(cursor)?;
            MessageParams::Unbind(MsgUnbind {})
        }
        TAG_ABANDON_REQUEST => {
            let size = asn1::read_size(cursor)?;
            if size == 0 || size > 5 {
                return Err(LdapError::decoding("bad abandon id width"));
            }
            let mut id: u64 = 0;
            for b in asn1::read_contents(cursor, size)? {
                id = (id << 8) | b as u64;
            }
            let id =
                u32::try_from(id).map_err(|_| LdapError::decoding("abandon id out of range"))?;
            MessageParams::Abandon(MsgAbandon { id })
        }
        r => {
            return Err(LdapError::decoding(format!(
                "unknown protocol op 0x{:02x}",
                r
            )))
        }
    };
    Ok(params)
}

fn read_ldap_result(cursor: &mut Cursor<&[u8]>, op_end: u64) -> Result<LdapResult> {
    let code = asn1::read_uint(cursor)?;
    let matched_dn = asn1::read_string(cursor)?;
    let diagnostic = asn1::read_string(cursor)?;
    let mut referrals = Vec::new();
    if cursor.position() < op_end && asn1::peek_tag(cursor) == Some(TAG_REFERRAL) {
        asn1::read_tag(cursor)?;
        let size = asn1::read_size(cursor)?;
        let end = cursor.position() + size as u64;
        while cursor.position() < end {
            referrals.push(asn1::read_string(cursor)?);
        }
    }
    Ok(LdapResult {
        code,
        matched_dn,
        diagnostic,
        referrals,
    })
}

fn read_filter(cursor: &mut Cursor<&[u8]>, depth: usize) -> Result<Filter> {
    if depth > MAX_FILTER_DEPTH {
        return Err(LdapError::decoding("filter nesting too deep"));
    }
    let tag = asn1::read_tag(cursor)?;
    match tag {
        TAG_FILTER_AND | TAG_FILTER_OR => {
            let size = asn1::read_size(cursor)?;
            if size > LDAP_MAX_PARAM_SIZE {
                return Err(LdapError::decoding("filter component too large"));
            }
            let end = cursor.position() + size as u64;
            let mut items = Vec::new();
            while cursor.position() < end {
                items.push(read_filter(cursor, depth + 1)?);
            }
            if tag == TAG_FILTER_AND {
                Ok(Filter::And(items))
            } else {
                Ok(Filter::Or(items))
            }
        }
        TAG_FILTER_NOT => {
            let size = asn1::read_size(cursor)?;
            if size > LDAP_MAX_PARAM_SIZE {
                return Err(LdapError::decoding("filter component too large"));
            }
            Ok(Filter::Not(Box::new(read_filter(cursor, depth + 1)?)))
        }
        TAG_FILTER_EQUALITY => {
            let size = asn1::read_size(cursor)?;
            if size > LDAP_MAX_PARAM_SIZE {
                return Err(LdapError::decoding("filter component too large"));
            }
            let name = asn1::read_string(cursor)?;
            let value = asn1::read_string(cursor)?;
            Ok(Filter::EqualityMatch(FilterAttributeValueAssertion {
                name,
                value,
            }))
        }
        TAG_FILTER_PRESENT => {
            let size = asn1::read_size(cursor)?;
            if size > LDAP_MAX_PARAM_SIZE {
                return Err(LdapError::decoding("filter component too large"));
            }
            let name = String::from_utf8(asn1::read_contents(cursor, size)?)
                .map_err(|_| LdapError::decoding("attribute name is not utf-8"))?;
            Ok(Filter::Present(FilterPresent { name }))
        }
        TAG_FILTER_SUBSTRINGS => {
            let size = asn1::read_size(cursor)?;
            if size > LDAP_MAX_PARAM_SIZE {
                return Err(LdapError::decoding("filter component too large"));
            }
            let name = asn1::read_string(cursor)?;
            let _seq_tag = asn1::read_tag(cursor)?;
            let seq_size = asn1::read_size(cursor)?;
            let end = cursor.position() + seq_size as u64;
            let mut initial = None;
            let mut any = Vec::new();
            let mut fin = None;
            while cursor.position() < end {
                let part_tag = asn1::read_tag(cursor)?;
                let part_size = asn1::read_size(cursor)?;
                let part = String::from_utf8(asn1::read_contents(cursor, part_size)?)
                    .map_err(|_| LdapError::decoding("substring is not utf-8"))?;
                match part_tag {
                    TAG_SUBSTRING_INITIAL => initial = Some(part),
                    TAG_SUBSTRING_ANY => any.push(part),
                    TAG_SUBSTRING_FINAL => fin = Some(part),
                    t => {
                        return Err(LdapError::decoding(format!(
                            "unknown substring tag 0x{:02x}",
                            t
                        )))
                    }
                }
            }
            Ok(Filter::Substrings(FilterSubstrings {
                name,
                initial,
                any,
                fin,
            }))
        }
        t => Err(LdapError::decoding(format!("unknown filter tag 0x{:02x}", t))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap::MsgUnbind;

    fn parse_complete(data: &[u8]) -> (Message, usize) {
        match parse_message(data).unwrap() {
            Framing::Complete(m, n) => (m, n),
            other => panic!("expected complete, got {:?}", other),
        }
    }

    #[test]
    fn search_request_fixture() {
        let raw = hex::decode(
            "3029020102632404000a01020a0100020100020100010100a00f8703617861a30804027373040273733000",
        )
        .unwrap();
        let (m, consumed) = parse_complete(&raw);
        assert_eq!(consumed, 43);
        assert_eq!(m.id, 2);
        let s = match m.params {
            MessageParams::Search(s) => s,
            other => panic!("expected search, got {:?}", other),
        };
        assert_eq!(s.base_object, "");
        assert_eq!(s.scope, SearchScope::WholeSubtree);
        assert_eq!(s.deref, DerefAliases::Never);
        assert_eq!(s.size_limit, 0);
        assert_eq!(s.time_limit, 0);
        assert!(!s.types_only);
        assert!(s.attributes.is_empty());
        let items = match s.filter {
            Filter::And(items) => items,
            other => panic!("expected and, got {:?}", other),
        };
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[0],
            Filter::Present(FilterPresent {
                name: "axa".to_owned()
            })
        );
        assert_eq!(
            items[1],
            Filter::EqualityMatch(FilterAttributeValueAssertion {
                name: "ss".to_owned(),
                value: "ss".to_owned()
            })
        );
    }

    #[test]
    fn bind_request_fixture() {
        let raw = hex::decode("3013020101600e0201030402787880056865736c6f").unwrap();
        let (m, consumed) = parse_complete(&raw);
        assert_eq!(consumed, 21);
        assert_eq!(m.id, 1);
        match m.params {
            MessageParams::Bind(b) => {
                assert_eq!(b.version, 3);
                assert_eq!(b.name, "xx");
                assert_eq!(b.password, "heslo");
            }
            other => panic!("expected bind, got {:?}", other),
        }
    }

    #[test]
    fn incomplete_vs_malformed() {
        // short prefix of the bind fixture: need more bytes
        let raw = hex::decode("3013020101600e02").unwrap();
        assert!(matches!(parse_message(&raw).unwrap(), Framing::Incomplete));
        assert!(matches!(parse_message(&[0x30]).unwrap(), Framing::Incomplete));
        // bad envelope tag poisons the whole stream
        assert!(parse_message(&[0x31, 0x05, 0x02, 0x01, 0x03, 0x42, 0x00]).is_err());
        // an unknown protocol op is framed and skippable, routed by id
        match parse_message(&[0x30, 0x05, 0x02, 0x01, 0x03, 0x7f, 0x00]).unwrap() {
            Framing::Malformed { id, consumed, .. } => {
                assert_eq!(id, Some(3));
                assert_eq!(consumed, 7);
            }
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    fn roundtrip(msg: Message) {
        let raw = encode_message(&msg).unwrap();
        let (parsed, consumed) = parse_complete(&raw);
        assert_eq!(consumed, raw.len());
        assert_eq!(parsed, msg);
    }

    #[test]
    fn roundtrip_all_variants() {
        roundtrip(Message {
            id: 1,
            params: MessageParams::Bind(MsgBind {
                version: 3,
                name: "cn=admin,dc=example,dc=com".to_owned(),
                password: "secret".to_owned(),
            }),
        });
        roundtrip(Message {
            id: 1,
            params: MessageParams::BindResponse(MsgBindResponse {
                res: LdapResult {
                    code: 49,
                    matched_dn: String::new(),
                    diagnostic: "invalid credentials".to_owned(),
                    referrals: vec![],
                },
            }),
        });
        roundtrip(Message {
            id: 2,
            params: MessageParams::Search(MsgSearch {
                base_object: "dc=example,dc=com".to_owned(),
                scope: SearchScope::WholeSubtree,
                deref: DerefAliases::Never,
                size_limit: 100,
                time_limit: 30,
                types_only: false,
                filter: Filter::And(vec![
                    Filter::Present(FilterPresent {
                        name: "objectClass".to_owned(),
                    }),
                    Filter::Substrings(FilterSubstrings {
                        name: "cn".to_owned(),
                        initial: Some("ab".to_owned()),
                        any: vec!["cd".to_owned()],
                        fin: None,
                    }),
                    Filter::Not(Box::new(Filter::EqualityMatch(
                        FilterAttributeValueAssertion {
                            name: "uid".to_owned(),
                            value: "x".to_owned(),
                        },
                    ))),
                ]),
                attributes: vec!["cn".to_owned(), "mail".to_owned()],
            }),
        });
        roundtrip(Message {
            id: 2,
            params: MessageParams::SearchEntry(MsgSearchEntry {
                object_name: "cn=a,dc=example,dc=com".to_owned(),
                attributes: vec![
                    PartialAttribute::strings("cn", &["a"]),
                    PartialAttribute::strings("mail", &["a@example.com", "a2@example.com"]),
                ],
            }),
        });
        roundtrip(Message {
            id: 2,
            params: MessageParams::SearchRef(MsgSearchRef {
                urls: vec!["ldap://other.example.com/dc=example,dc=com".to_owned()],
            }),
        });
        roundtrip(Message {
            id: 2,
            params: MessageParams::SearchDone(MsgSearchDone {
                res: LdapResult {
                    code: 10,
                    matched_dn: String::new(),
                    diagnostic: String::new(),
                    referrals: vec!["ldap://other.example.com".to_owned()],
                },
            }),
        });
        roundtrip(Message {
            id: 3,
            params: MessageParams::ExtendedReq(MsgExtendedRequest {
                name: crate::ldap::STARTTLS_OID.to_owned(),
                value: None,
            }),
        });
        roundtrip(Message {
            id: 3,
            params: MessageParams::ExtendedResp(MsgExtendedResponse {
                res: LdapResult::success(),
                name: Some(crate::ldap::STARTTLS_OID.to_owned()),
                value: None,
            }),
        });
        roundtrip(Message {
            id: 4,
            params: MessageParams::Unbind(MsgUnbind {}),
        });
        roundtrip(Message {
            id: 5,
            params: MessageParams::Abandon(MsgAbandon { id: 2 }),
        });
        // ids that need multi-byte integer encodings
        roundtrip(Message {
            id: 0x1234_5678,
            params: MessageParams::Unbind(MsgUnbind {}),
        });
        roundtrip(Message {
            id: 6,
            params: MessageParams::Abandon(MsgAbandon { id: 0x8000 }),
        });
    }

    #[test]
    fn split_at_every_boundary() {
        let msg = Message {
            id: 7,
            params: MessageParams::SearchEntry(MsgSearchEntry {
                object_name: "uid=split,dc=example,dc=com".to_owned(),
                attributes: vec![PartialAttribute::strings("uid", &["split"])],
            }),
        };
        let raw = encode_message(&msg).unwrap();
        for cut in 0..raw.len() {
            let first = &raw[..cut];
            match parse_message(first).unwrap() {
                Framing::Incomplete => {}
                Framing::Complete(_, n) => panic!("complete at cut {} ({} consumed)", cut, n),
                Framing::Malformed { id, consumed, .. } => {
                    panic!("malformed at cut {} (id {:?}, {} consumed)", cut, id, consumed)
                }
            }
            let (parsed, consumed) = parse_complete(&raw);
            assert_eq!(consumed, raw.len());
            assert_eq!(parsed, msg);
        }
    }

    #[test]
    fn large_message_long_form_envelope() {
        let big = "x".repeat(4000);
        let msg = Message {
            id: 9,
            params: MessageParams::SearchEntry(MsgSearchEntry {
                object_name: "cn=big,dc=example,dc=com".to_owned(),
                attributes: vec![PartialAttribute::strings("description", &[big.as_str()])],
            }),
        };
        let raw = encode_message(&msg).unwrap();
        assert_eq!(raw[1], 0x82);
        let (parsed, consumed) = parse_complete(&raw);
        assert_eq!(consumed, raw.len());
        assert_eq!(parsed, msg);
    }
}
