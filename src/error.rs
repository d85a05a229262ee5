use thiserror::Error;

/// LDAP result codes, RFC 4511 section 4.1.9 naming.
pub mod result_code {
    pub const SUCCESS: u32 = 0;
    pub const OPERATIONS_ERROR: u32 = 1;
    pub const PROTOCOL_ERROR: u32 = 2;
    pub const TIME_LIMIT_EXCEEDED: u32 = 3;
    pub const SIZE_LIMIT_EXCEEDED: u32 = 4;
    pub const COMPARE_FALSE: u32 = 5;
    pub const COMPARE_TRUE: u32 = 6;
    pub const AUTH_METHOD_NOT_SUPPORTED: u32 = 7;
    pub const STRONGER_AUTH_REQUIRED: u32 = 8;
    pub const REFERRAL: u32 = 10;
    pub const ADMIN_LIMIT_EXCEEDED: u32 = 11;
    pub const UNAVAILABLE_CRITICAL_EXTENSION: u32 = 12;
    pub const CONFIDENTIALITY_REQUIRED: u32 = 13;
    pub const SASL_BIND_IN_PROGRESS: u32 = 14;

    pub const NO_SUCH_ATTRIBUTE: u32 = 16;
    pub const UNDEFINED_TYPE: u32 = 17;
    pub const INAPPROPRIATE_MATCHING: u32 = 18;
    pub const CONSTRAINT_VIOLATION: u32 = 19;
    pub const TYPE_OR_VALUE_EXISTS: u32 = 20;
    pub const INVALID_SYNTAX: u32 = 21;

    pub const NO_SUCH_OBJECT: u32 = 32;
    pub const ALIAS_PROBLEM: u32 = 33;
    pub const INVALID_DN_SYNTAX: u32 = 34;
    pub const IS_LEAF: u32 = 35;
    pub const ALIAS_DEREF_PROBLEM: u32 = 36;

    pub const INAPPROPRIATE_AUTH: u32 = 48;
    pub const INVALID_CREDENTIALS: u32 = 49;
    pub const INSUFFICIENT_ACCESS: u32 = 50;

    pub const BUSY: u32 = 51;
    pub const UNAVAILABLE: u32 = 52;
    pub const UNWILLING_TO_PERFORM: u32 = 53;
    pub const LOOP_DETECT: u32 = 54;

    pub const NAMING_VIOLATION: u32 = 64;
    pub const OBJECT_CLASS_VIOLATION: u32 = 65;
    pub const NOT_ALLOWED_ON_NONLEAF: u32 = 66;
    pub const NOT_ALLOWED_ON_RDN: u32 = 67;
    pub const ALREADY_EXISTS: u32 = 68;
    pub const NO_OBJECT_CLASS_MODS: u32 = 69;
    pub const RESULTS_TOO_LARGE: u32 = 70;
    pub const AFFECTS_MULTIPLE_DSAS: u32 = 71;

    pub const OTHER: u32 = 80;
}

/// Local (client-side) failure kinds, patterned after the draft LDAP C API codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ApiErrorKind {
    #[error("server down")]
    ServerDown,
    #[error("local error")]
    Local,
    #[error("encoding error")]
    Encoding,
    #[error("decoding error")]
    Decoding,
    #[error("timeout")]
    Timeout,
    #[error("bad search filter")]
    Filter,
    #[error("bad parameter")]
    Param,
    #[error("connect error")]
    Connect,
    #[error("not supported")]
    NotSupported,
    #[error("invalid connection state")]
    InvalidState,
}

/// One variant per result-code family. `Api` covers everything that never
/// reached the wire; `Other` is the total-mapping default.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LdapError {
    #[error("name error, code {code}: {}", .message.as_deref().unwrap_or("no diagnostic"))]
    Name { code: u32, message: Option<String> },
    #[error("attribute error, code {code}: {}", .message.as_deref().unwrap_or("no diagnostic"))]
    Attr { code: u32, message: Option<String> },
    #[error("security error, code {code}: {}", .message.as_deref().unwrap_or("no diagnostic"))]
    Security { code: u32, message: Option<String> },
    #[error("service error, code {code}: {}", .message.as_deref().unwrap_or("no diagnostic"))]
    Service { code: u32, message: Option<String> },
    #[error("update error, code {code}: {}", .message.as_deref().unwrap_or("no diagnostic"))]
    Update { code: u32, message: Option<String> },
    #[error("referral to {url}")]
    Referral { url: String },
    #[error("{kind}: {}", .message.as_deref().unwrap_or("no diagnostic"))]
    Api {
        kind: ApiErrorKind,
        message: Option<String>,
    },
    #[error("ldap error, code {code}: {}", .message.as_deref().unwrap_or("no diagnostic"))]
    Other { code: u32, message: Option<String> },
}

impl LdapError {
    /// Total mapping from a server result code. Unknown codes land in
    /// `Other`; the mapping itself never fails.
    pub fn from_result_code(code: u32, message: Option<String>) -> Self {
        use result_code as rc;
        match code {
            rc::REFERRAL => LdapError::Referral {
                url: message.unwrap_or_default(),
            },
            rc::NO_SUCH_ATTRIBUTE..=rc::INVALID_SYNTAX => LdapError::Attr { code, message },
            rc::NO_SUCH_OBJECT..=rc::ALIAS_DEREF_PROBLEM => LdapError::Name { code, message },
            rc::INAPPROPRIATE_AUTH..=rc::INSUFFICIENT_ACCESS => {
                LdapError::Security { code, message }
            }
            rc::BUSY..=rc::LOOP_DETECT => LdapError::Service { code, message },
            rc::NAMING_VIOLATION..=rc::AFFECTS_MULTIPLE_DSAS => LdapError::Update { code, message },
            _ => LdapError::Other { code, message },
        }
    }

    pub fn decoding(msg: impl Into<String>) -> Self {
        LdapError::Api {
            kind: ApiErrorKind::Decoding,
            message: Some(msg.into()),
        }
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        LdapError::Api {
            kind: ApiErrorKind::Encoding,
            message: Some(msg.into()),
        }
    }

    pub fn param(msg: impl Into<String>) -> Self {
        LdapError::Api {
            kind: ApiErrorKind::Param,
            message: Some(msg.into()),
        }
    }

    pub fn filter(msg: impl Into<String>) -> Self {
        LdapError::Api {
            kind: ApiErrorKind::Filter,
            message: Some(msg.into()),
        }
    }

    pub fn state(msg: impl Into<String>) -> Self {
        LdapError::Api {
            kind: ApiErrorKind::InvalidState,
            message: Some(msg.into()),
        }
    }

    pub fn connect(msg: impl Into<String>) -> Self {
        LdapError::Api {
            kind: ApiErrorKind::Connect,
            message: Some(msg.into()),
        }
    }

    pub fn server_down(msg: impl Into<String>) -> Self {
        LdapError::Api {
            kind: ApiErrorKind::ServerDown,
            message: Some(msg.into()),
        }
    }

    /// Result code carried by this error, if it came from the server.
    pub fn code(&self) -> Option<u32> {
        match self {
            LdapError::Name { code, .. }
            | LdapError::Attr { code, .. }
            | LdapError::Security { code, .. }
            | LdapError::Service { code, .. }
            | LdapError::Update { code, .. }
            | LdapError::Other { code, .. } => Some(*code),
            LdapError::Referral { .. } => Some(result_code::REFERRAL),
            LdapError::Api { .. } => None,
        }
    }
}

impl From<std::io::Error> for LdapError {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::TimedOut => ApiErrorKind::Timeout,
            std::io::ErrorKind::ConnectionRefused => ApiErrorKind::Connect,
            _ => ApiErrorKind::ServerDown,
        };
        LdapError::Api {
            kind,
            message: Some(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, LdapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_groups() {
        assert!(matches!(
            LdapError::from_result_code(result_code::INVALID_CREDENTIALS, None),
            LdapError::Security { code: 49, .. }
        ));
        assert!(matches!(
            LdapError::from_result_code(result_code::NO_SUCH_OBJECT, None),
            LdapError::Name { code: 32, .. }
        ));
        assert!(matches!(
            LdapError::from_result_code(result_code::NO_SUCH_ATTRIBUTE, None),
            LdapError::Attr { code: 16, .. }
        ));
        assert!(matches!(
            LdapError::from_result_code(result_code::UNWILLING_TO_PERFORM, None),
            LdapError::Service { code: 53, .. }
        ));
        assert!(matches!(
            LdapError::from_result_code(result_code::ALREADY_EXISTS, None),
            LdapError::Update { code: 68, .. }
        ));
    }

    #[test]
    fn mapping_is_total() {
        // unrecognized and implementation-specific codes must not fail
        assert!(matches!(
            LdapError::from_result_code(9000, None),
            LdapError::Other { code: 9000, .. }
        ));
        assert!(matches!(
            LdapError::from_result_code(result_code::OTHER, None),
            LdapError::Other { code: 80, .. }
        ));
        assert!(matches!(
            LdapError::from_result_code(result_code::PROTOCOL_ERROR, None),
            LdapError::Other { code: 2, .. }
        ));
    }

    #[test]
    fn referral_keeps_url() {
        let e = LdapError::from_result_code(
            result_code::REFERRAL,
            Some("ldap://other.example.com:389".to_owned()),
        );
        match e {
            LdapError::Referral { url } => assert_eq!(url, "ldap://other.example.com:389"),
            other => panic!("expected referral, got {:?}", other),
        }
    }
}
