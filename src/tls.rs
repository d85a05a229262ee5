//! TLS client configuration: map the connection's TLS option set onto a
//! rustls `ClientConfig` used for ldaps:// connects and StartTLS upgrades.

use std::fs;
use std::io::BufReader;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::{ClientConfig, RootCertStore, SignatureScheme};
use rustls_pemfile::{certs, crls, pkcs8_private_keys, rsa_private_keys};
use rustls_pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer, ServerName};
use tracing::{debug, info};

use crate::error::{LdapError, Result};

/// Peer certificate demand strategy. The numeric values are the ones the
/// OpenLDAP client library documents for `TLS_REQCERT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequireCert {
    Never = 0,
    Demand = 2,
    Allow = 3,
    Try = 4,
}

impl RequireCert {
    fn from_name(name: &str) -> Result<Self> {
        match name {
            "never" => Ok(RequireCert::Never),
            "allow" => Ok(RequireCert::Allow),
            "try" => Ok(RequireCert::Try),
            "demand" | "hard" => Ok(RequireCert::Demand),
            other => Err(LdapError::param(format!(
                "unknown TLS certificate-checking strategy {:?}",
                other
            ))),
        }
    }
}

/// Certificate revocation checking strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrlCheck {
    None = 0,
    Peer = 1,
    All = 2,
}

impl CrlCheck {
    fn from_name(name: &str) -> Result<Self> {
        match name {
            "none" => Ok(CrlCheck::None),
            "peer" => Ok(CrlCheck::Peer),
            "all" => Ok(CrlCheck::All),
            other => Err(LdapError::param(format!(
                "unknown TLS CRL evaluation strategy {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsProtocolMin {
    Tls12,
    Tls13,
}

/// The full TLS option set. Plain data; validated as a whole when a
/// handshake is about to happen, not per field.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub cacert_file: Option<String>,
    pub cacert_dir: Option<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub cipher_suite: Option<String>,
    pub crl_file: Option<String>,
    pub dh_file: Option<String>,
    pub protocol_min: Option<TlsProtocolMin>,
    pub require_cert: Option<RequireCert>,
    pub crl_check: Option<CrlCheck>,
}

impl TlsOptions {
    /// Build an option set from string key/value pairs. Keys that do not
    /// start with `tls_` are skipped with a logged notice rather than
    /// rejected, so callers can pass a mixed option bag forward-compatibly.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut out = TlsOptions::default();
        for (key, val) in pairs {
            if !key.starts_with("tls_") {
                info!("skipping non-TLS option {:?}", key);
                continue;
            }
            match key {
                "tls_cacertfile" => out.cacert_file = Some(val.to_owned()),
                "tls_cacertdir" => out.cacert_dir = Some(val.to_owned()),
                "tls_certfile" => out.cert_file = Some(val.to_owned()),
                "tls_keyfile" => out.key_file = Some(val.to_owned()),
                "tls_cipher_suite" => out.cipher_suite = Some(val.to_owned()),
                "tls_crlfile" => out.crl_file = Some(val.to_owned()),
                "tls_dhfile" => out.dh_file = Some(val.to_owned()),
                "tls_protocol_min" => {
                    out.protocol_min = Some(match val {
                        "1.2" => TlsProtocolMin::Tls12,
                        "1.3" => TlsProtocolMin::Tls13,
                        other => {
                            return Err(LdapError::param(format!(
                                "unknown TLS protocol version {:?}",
                                other
                            )))
                        }
                    })
                }
                "tls_require_cert" => out.require_cert = Some(RequireCert::from_name(val)?),
                "tls_crlcheck" => out.crl_check = Some(CrlCheck::from_name(val)?),
                unknown => info!("unknown TLS option {:?}: ignoring", unknown),
            }
        }
        Ok(out)
    }
}

/// Verifier installed for the `never` and `allow` strategies: the handshake
/// proceeds whatever certificate the server presents.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Validate the whole option set and build the rustls client configuration.
pub fn build_client_config(opts: &TlsOptions) -> Result<Arc<ClientConfig>> {
    if let Some(dh) = &opts.dh_file {
        info!(
            "ignoring tls_dhfile {:?}: key exchange is selected by the TLS provider",
            dh
        );
    }

    let versions: &[&rustls::SupportedProtocolVersion] = match opts.protocol_min {
        None | Some(TlsProtocolMin::Tls12) => rustls::ALL_VERSIONS,
        Some(TlsProtocolMin::Tls13) => &[&rustls::version::TLS13],
    };

    let provider = build_provider(opts)?;
    let builder = ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(versions)
        .map_err(|e| LdapError::param(format!("unusable TLS protocol selection: {}", e)))?;

    let require_cert = opts.require_cert.unwrap_or(RequireCert::Demand);
    let builder = match require_cert {
        RequireCert::Never | RequireCert::Allow => {
            debug!("peer certificate verification disabled ({:?})", require_cert);
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        }
        RequireCert::Try | RequireCert::Demand => {
            let roots = Arc::new(load_roots(opts)?);
            let crls = load_crls(opts)?;
            let verifier = WebPkiServerVerifier::builder(roots)
                .with_crls(crls)
                .build()
                .map_err(|e| LdapError::param(format!("cannot build TLS verifier: {}", e)))?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(verifier)
        }
    };

    let config = match (&opts.cert_file, &opts.key_file) {
        (Some(cert), Some(key)) => {
            let certs = load_certs_from_file(cert)?;
            let key = load_private_key_from_file(key)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| LdapError::param(format!("bad client certificate: {}", e)))?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(LdapError::param(
                "tls_certfile and tls_keyfile must be set together",
            ))
        }
    };
    Ok(Arc::new(config))
}

/// Restrict the crypto provider's suite list when a cipher suite string is
/// configured. Names match the rustls suite identifiers, colon-separated,
/// case-insensitively and by substring.
fn build_provider(opts: &TlsOptions) -> Result<rustls::crypto::CryptoProvider> {
    let mut provider = rustls::crypto::aws_lc_rs::default_provider();
    let selector = match &opts.cipher_suite {
        Some(s) if !s.is_empty() => s,
        _ => return Ok(provider),
    };
    let wanted: Vec<String> = selector.split(':').map(|p| p.trim().to_lowercase()).collect();
    provider.cipher_suites.retain(|suite| {
        let name = format!("{:?}", suite.suite()).to_lowercase();
        wanted.iter().any(|w| name.contains(w.as_str()))
    });
    if provider.cipher_suites.is_empty() {
        return Err(LdapError::param(format!(
            "cipher suite {:?} matches nothing the provider offers",
            selector
        )));
    }
    debug!(
        "cipher suite {:?} selected {} suites",
        selector,
        provider.cipher_suites.len()
    );
    Ok(provider)
}

fn load_roots(opts: &TlsOptions) -> Result<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    match (&opts.cacert_file, &opts.cacert_dir) {
        (None, None) => {
            for cert in rustls_native_certs::load_native_certs()
                .map_err(|e| LdapError::param(format!("cannot load system CA certs: {}", e)))?
            {
                let _ = root_store.add(cert);
            }
        }
        (file, dir) => {
            if let Some(path) = file {
                for cert in load_certs_from_file(path)? {
                    let _ = root_store.add(cert);
                }
            }
            if let Some(path) = dir {
                let entries = fs::read_dir(path)
                    .map_err(|e| LdapError::param(format!("cannot read {}: {}", path, e)))?;
                for entry in entries.flatten() {
                    let p = entry.path();
                    if p.extension().map_or(false, |e| e == "pem" || e == "crt") {
                        if let Some(s) = p.to_str() {
                            for cert in load_certs_from_file(s)? {
                                let _ = root_store.add(cert);
                            }
                        }
                    }
                }
            }
        }
    }
    if root_store.is_empty() {
        return Err(LdapError::param("no trusted CA certificates available"));
    }
    Ok(root_store)
}

fn load_crls(opts: &TlsOptions) -> Result<Vec<CertificateRevocationListDer<'static>>> {
    let check = opts.crl_check.unwrap_or(CrlCheck::None);
    if check == CrlCheck::None {
        return Ok(Vec::new());
    }
    let path = opts.crl_file.as_deref().ok_or_else(|| {
        LdapError::param("tls_crlcheck requires tls_crlfile to be set")
    })?;
    let file =
        fs::File::open(path).map_err(|e| LdapError::param(format!("open {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    let lists: Vec<_> = crls(&mut reader)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| LdapError::param(format!("parse CRLs from {}: {}", path, e)))?;
    if lists.is_empty() {
        return Err(LdapError::param(format!("no CRLs found in {}", path)));
    }
    Ok(lists)
}

fn load_certs_from_file(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file =
        fs::File::open(path).map_err(|e| LdapError::param(format!("open {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    let out: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| LdapError::param(format!("parse certificates from {}: {}", path, e)))?;
    if out.is_empty() {
        return Err(LdapError::param(format!("no certificates found in {}", path)));
    }
    Ok(out)
}

fn load_private_key_from_file(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file =
        fs::File::open(path).map_err(|e| LdapError::param(format!("open {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    let pkcs8: Vec<_> = pkcs8_private_keys(&mut reader)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| LdapError::param(format!("parse PKCS8 keys from {}: {}", path, e)))?;
    if let Some(key) = pkcs8.into_iter().next() {
        return Ok(key.into());
    }
    let file =
        fs::File::open(path).map_err(|e| LdapError::param(format!("open {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    let rsa: Vec<_> = rsa_private_keys(&mut reader)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| LdapError::param(format!("parse RSA keys from {}: {}", path, e)))?;
    rsa.into_iter()
        .next()
        .map(Into::into)
        .ok_or_else(|| LdapError::param(format!("no private key found in {}", path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_skip_non_tls_keys() {
        let opts = TlsOptions::from_pairs([
            ("tls_require_cert", "never"),
            ("timeout", "5"),
            ("tls_protocol_min", "1.3"),
            ("tls_frobnicate", "yes"),
        ])
        .unwrap();
        assert_eq!(opts.require_cert, Some(RequireCert::Never));
        assert_eq!(opts.protocol_min, Some(TlsProtocolMin::Tls13));
    }

    #[test]
    fn pairs_reject_bad_values() {
        assert!(TlsOptions::from_pairs([("tls_require_cert", "sometimes")]).is_err());
        assert!(TlsOptions::from_pairs([("tls_crlcheck", "maybe")]).is_err());
        assert!(TlsOptions::from_pairs([("tls_protocol_min", "0.9")]).is_err());
    }

    #[test]
    fn strategy_numeric_values_match_the_library() {
        assert_eq!(RequireCert::Never as i32, 0);
        assert_eq!(RequireCert::Demand as i32, 2);
        assert_eq!(RequireCert::Allow as i32, 3);
        assert_eq!(RequireCert::Try as i32, 4);
        assert_eq!(CrlCheck::None as i32, 0);
        assert_eq!(CrlCheck::Peer as i32, 1);
        assert_eq!(CrlCheck::All as i32, 2);
    }

    #[test]
    fn cert_and_key_must_pair() {
        let opts = TlsOptions {
            cert_file: Some("client.pem".to_owned()),
            ..TlsOptions::default()
        };
        assert!(matches!(
            build_client_config(&opts),
            Err(LdapError::Api { .. })
        ));
    }
}
