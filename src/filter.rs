use crate::error::{LdapError, Result};
use crate::ldap::{Filter, FilterAttributeValueAssertion, FilterPresent, FilterSubstrings};

/// Parse an RFC 4515 search filter string into a `Filter` tree.
///
/// Supported forms: `(&(a=1)(b=2))`, `(|...)`, `(!(a=1))`, `(attr=*)`,
/// `(attr=value)` and substring patterns like `(cn=ab*cd*ef)`. Values may
/// escape arbitrary bytes as `\xx` hex pairs. A bare item without the outer
/// parentheses is accepted too.
pub fn parse_filter(input: &str) -> Result<Filter> {
    let mut p = Parser {
        data: input.as_bytes(),
        pos: 0,
    };
    let f = p.parse()?;
    p.skip_ws();
    if p.pos != p.data.len() {
        return Err(LdapError::filter(format!(
            "trailing characters at offset {} in {:?}",
            p.pos, input
        )));
    }
    Ok(f)
}

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn parse(&mut self) -> Result<Filter> {
        self.skip_ws();
        if self.peek() == Some(b'(') {
            self.filter()
        } else {
            self.item(self.data.len())
        }
    }

    fn filter(&mut self) -> Result<Filter> {
        self.expect(b'(')?;
        let out = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.filter_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.filter_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.filter()?))
            }
            Some(_) => {
                let end = self.find_close()?;
                self.item(end)?
            }
            None => return Err(LdapError::filter("unterminated filter")),
        };
        self.expect(b')')?;
        Ok(out)
    }

    fn filter_list(&mut self) -> Result<Vec<Filter>> {
        let mut items = Vec::new();
        while self.peek() == Some(b'(') {
            items.push(self.filter()?);
        }
        if items.is_empty() {
            return Err(LdapError::filter("empty filter list"));
        }
        Ok(items)
    }

    /// attr=value up to `end` (an exclusive offset, either the matching close
    /// paren or the end of a bare item).
    fn item(&mut self, end: usize) -> Result<Filter> {
        let eq = self.data[self.pos..end]
            .iter()
            .position(|&c| c == b'=')
            .map(|i| self.pos + i)
            .ok_or_else(|| LdapError::filter("missing '=' in filter item"))?;
        let name = std::str::from_utf8(&self.data[self.pos..eq])
            .map_err(|_| LdapError::filter("attribute name is not utf-8"))?
            .trim()
            .to_owned();
        if name.is_empty() {
            return Err(LdapError::filter("empty attribute name"));
        }
        if name.ends_with('>') || name.ends_with('<') || name.ends_with('~') {
            return Err(LdapError::Api {
                kind: crate::error::ApiErrorKind::NotSupported,
                message: Some("ordering and approx matches not supported".to_owned()),
            });
        }
        let raw = &self.data[eq + 1..end];
        self.pos = end;

        if raw == b"*" {
            return Ok(Filter::Present(FilterPresent { name }));
        }
        if !raw.contains(&b'*') {
            return Ok(Filter::EqualityMatch(FilterAttributeValueAssertion {
                name,
                value: unescape(raw)?,
            }));
        }

        // substring pattern: [initial]*any*...*[final]
        let mut parts = Vec::new();
        let mut start = 0;
        for (i, &c) in raw.iter().enumerate() {
            if c == b'*' {
                parts.push(&raw[start..i]);
                start = i + 1;
            }
        }
        parts.push(&raw[start..]);
        let initial = match parts.first() {
            Some(p) if !p.is_empty() => Some(unescape(p)?),
            _ => None,
        };
        let fin = match parts.last() {
            Some(p) if !p.is_empty() => Some(unescape(p)?),
            _ => None,
        };
        let mut any = Vec::new();
        for p in &parts[1..parts.len() - 1] {
            if !p.is_empty() {
                any.push(unescape(p)?);
            }
        }
        Ok(Filter::Substrings(FilterSubstrings {
            name,
            initial,
            any,
            fin,
        }))
    }

    /// Offset of the close paren for the current item. Items never nest.
    fn find_close(&self) -> Result<usize> {
        self.data[self.pos..]
            .iter()
            .position(|&c| c == b')')
            .map(|i| self.pos + i)
            .ok_or_else(|| LdapError::filter("missing ')'"))
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn expect(&mut self, c: u8) -> Result<()> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(LdapError::filter(format!(
                "expected {:?} at offset {}",
                c as char, self.pos
            )))
        }
    }

    fn skip_ws(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }
}

fn unescape(raw: &[u8]) -> Result<String> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\\' {
            let hex = raw
                .get(i + 1..i + 3)
                .ok_or_else(|| LdapError::filter("dangling escape"))?;
            let hex = std::str::from_utf8(hex).map_err(|_| LdapError::filter("bad escape"))?;
            let byte =
                u8::from_str_radix(hex, 16).map_err(|_| LdapError::filter("bad hex escape"))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(raw[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| LdapError::filter("filter value is not utf-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present() {
        let f = parse_filter("(objectClass=*)").unwrap();
        assert_eq!(
            f,
            Filter::Present(FilterPresent {
                name: "objectClass".to_owned()
            })
        );
    }

    #[test]
    fn equality() {
        let f = parse_filter("(cn=Barbara Jensen)").unwrap();
        assert_eq!(
            f,
            Filter::EqualityMatch(FilterAttributeValueAssertion {
                name: "cn".to_owned(),
                value: "Barbara Jensen".to_owned()
            })
        );
    }

    #[test]
    fn nested_boolean() {
        let f = parse_filter("(&(objectClass=person)(|(cn=a)(cn=b))(!(uid=x)))").unwrap();
        match f {
            Filter::And(items) => {
                assert_eq!(items.len(), 3);
                assert!(matches!(items[1], Filter::Or(ref l) if l.len() == 2));
                assert!(matches!(items[2], Filter::Not(_)));
            }
            other => panic!("expected and, got {:?}", other),
        }
    }

    #[test]
    fn substrings() {
        let f = parse_filter("(cn=ab*cd*ef)").unwrap();
        assert_eq!(
            f,
            Filter::Substrings(FilterSubstrings {
                name: "cn".to_owned(),
                initial: Some("ab".to_owned()),
                any: vec!["cd".to_owned()],
                fin: Some("ef".to_owned()),
            })
        );
        let f = parse_filter("(cn=*middle*)").unwrap();
        assert_eq!(
            f,
            Filter::Substrings(FilterSubstrings {
                name: "cn".to_owned(),
                initial: None,
                any: vec!["middle".to_owned()],
                fin: None,
            })
        );
    }

    #[test]
    fn escapes() {
        let f = parse_filter(r"(cn=open \28paren\29)").unwrap();
        assert_eq!(
            f,
            Filter::EqualityMatch(FilterAttributeValueAssertion {
                name: "cn".to_owned(),
                value: "open (paren)".to_owned()
            })
        );
    }

    #[test]
    fn bare_item() {
        let f = parse_filter("uid=jensen").unwrap();
        assert!(matches!(f, Filter::EqualityMatch(_)));
    }

    #[test]
    fn malformed() {
        assert!(parse_filter("(cn=x").is_err());
        assert!(parse_filter("(&)").is_err());
        assert!(parse_filter("()").is_err());
        assert!(parse_filter("(cn~=x)").is_err());
        assert!(parse_filter("(cn=a)(cn=b)").is_err());
    }
}
