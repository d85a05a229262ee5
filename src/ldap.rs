use crate::error::{LdapError, Result};

/// Extended operation OID for the in-place TLS upgrade.
pub const STARTTLS_OID: &str = "1.3.6.1.4.1.1466.20037";

pub const LDAP_VERSION: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<u32> for SearchScope {
    type Error = LdapError;
    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            v => Err(LdapError::decoding(format!("invalid search scope {}", v))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerefAliases {
    Never = 0,
    InSearching = 1,
    FindingBase = 2,
    Always = 3,
}

impl TryFrom<u32> for DerefAliases {
    type Error = LdapError;
    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(DerefAliases::Never),
            1 => Ok(DerefAliases::InSearching),
            2 => Ok(DerefAliases::FindingBase),
            3 => Ok(DerefAliases::Always),
            v => Err(LdapError::decoding(format!("invalid deref mode {}", v))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterAttributeValueAssertion {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterPresent {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSubstrings {
    pub name: String,
    pub initial: Option<String>,
    pub any: Vec<String>,
    pub fin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    EqualityMatch(FilterAttributeValueAssertion),
    Present(FilterPresent),
    Substrings(FilterSubstrings),
}

impl Filter {
    /// `(objectClass=*)`, the catch-all default.
    pub fn present_all() -> Filter {
        Filter::Present(FilterPresent {
            name: "objectClass".to_owned(),
        })
    }
}

/// Fields shared by every *Response shape, RFC 4511 LDAPResult.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LdapResult {
    pub code: u32,
    pub matched_dn: String,
    pub diagnostic: String,
    pub referrals: Vec<String>,
}

impl LdapResult {
    pub fn success() -> Self {
        LdapResult::default()
    }

    pub fn is_success(&self) -> bool {
        self.code == crate::error::result_code::SUCCESS
    }

    /// Turn a non-success result into the mapped taxonomy error.
    pub fn into_error(self) -> LdapError {
        if let Some(url) = self.referrals.first() {
            if self.code == crate::error::result_code::REFERRAL {
                return LdapError::Referral { url: url.clone() };
            }
        }
        let message = if self.diagnostic.is_empty() {
            None
        } else {
            Some(self.diagnostic)
        };
        LdapError::from_result_code(self.code, message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgBind {
    pub version: u32,
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgBindResponse {
    pub res: LdapResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgSearch {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref: DerefAliases,
    pub size_limit: u32,
    pub time_limit: u32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialAttribute {
    pub name: String,
    pub values: Vec<Vec<u8>>,
}

impl PartialAttribute {
    pub fn strings(name: impl Into<String>, values: &[&str]) -> Self {
        PartialAttribute {
            name: name.into(),
            values: values.iter().map(|v| v.as_bytes().to_vec()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgSearchEntry {
    pub object_name: String,
    pub attributes: Vec<PartialAttribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgSearchRef {
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgSearchDone {
    pub res: LdapResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgExtendedRequest {
    pub name: String,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgExtendedResponse {
    pub res: LdapResult,
    pub name: Option<String>,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgUnbind {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgAbandon {
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageParams {
    Bind(MsgBind),
    BindResponse(MsgBindResponse),
    Search(MsgSearch),
    SearchEntry(MsgSearchEntry),
    SearchRef(MsgSearchRef),
    SearchDone(MsgSearchDone),
    ExtendedReq(MsgExtendedRequest),
    ExtendedResp(MsgExtendedResponse),
    Unbind(MsgUnbind),
    Abandon(MsgAbandon),
}

/// One protocol exchange unit. Responses to a request share its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u32,
    pub params: MessageParams,
}

/// A directory entry as delivered by a search: a DN plus attributes in
/// server order, values kept as raw byte strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub dn: String,
    pub attrs: Vec<PartialAttribute>,
}

impl Entry {
    /// Attribute lookup; names compare case-insensitively per the protocol.
    pub fn attr(&self, name: &str) -> Option<&PartialAttribute> {
        self.attrs.iter().find(|a| a.name.eq_ignore_ascii_case(name))
    }

    /// Values of an attribute that happen to be valid UTF-8.
    pub fn attr_strings(&self, name: &str) -> Vec<String> {
        self.attr(name)
            .map(|a| {
                a.values
                    .iter()
                    .filter_map(|v| String::from_utf8(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl From<MsgSearchEntry> for Entry {
    fn from(e: MsgSearchEntry) -> Self {
        Entry {
            dn: e.object_name,
            attrs: e.attributes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_attr_lookup_is_case_insensitive() {
        let entry = Entry {
            dn: "cn=test,dc=example,dc=com".to_owned(),
            attrs: vec![PartialAttribute::strings("objectClass", &["person"])],
        };
        assert!(entry.attr("objectclass").is_some());
        assert!(entry.attr("OBJECTCLASS").is_some());
        assert!(entry.attr("cn").is_none());
        assert_eq!(entry.attr_strings("objectClass"), vec!["person"]);
    }

    #[test]
    fn result_into_error_prefers_referral_url() {
        let res = LdapResult {
            code: crate::error::result_code::REFERRAL,
            matched_dn: String::new(),
            diagnostic: String::new(),
            referrals: vec!["ldap://other.example.com".to_owned()],
        };
        match res.into_error() {
            LdapError::Referral { url } => assert_eq!(url, "ldap://other.example.com"),
            other => panic!("expected referral, got {:?}", other),
        }
    }
}
