//! Root and per-host certificate minting.
//!
//! The root is a self-signed RSA-2048 CA; leaves are RSA-2048 certs
//! signed by that root, one per canonical host pattern. Issuance cost is
//! dominated by RSA key generation (around a second), which is why the
//! hijacker caches minted leaves and runs issuance off the async runtime
//! via `spawn_blocking`.

use std::net::IpAddr;

use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use time::OffsetDateTime;

use crate::error::{ProxyError, ProxyResult};

const RSA_BITS: usize = 2048;

/// Generates a fresh self-signed root certificate valid until
/// `valid_until`, returning `(cert_pem, key_pem)`. Clients must trust
/// this certificate (or disable verification) for interception to work.
pub fn sign_root(valid_until: OffsetDateTime) -> ProxyResult<(String, String)> {
    let (key_pair, key_pem) = new_rsa_key_pair()?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, env!("CARGO_PKG_NAME"));
    params.distinguished_name = dn;
    params.serial_number = Some(random_serial());
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = valid_until;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::DataEncipherment,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| ProxyError::Certificate(format!("failed to self-sign root: {e}")))?;

    Ok((cert.pem(), key_pem))
}

/// Signs a leaf certificate for `hostname` with the given root material,
/// returning `(cert_pem, key_pem)`.
///
/// `hostname` may be an IP literal (placed in the IP SAN) or a DNS name,
/// including a wildcard pattern such as `*.example.com`. The leaf keeps
/// the root's subject. The root PEM pair is parsed on every call so that
/// malformed material surfaces as an issuance error rather than at
/// construction time.
pub fn sign_host(
    hostname: &str,
    root_cert_pem: &str,
    root_key_pem: &str,
    valid_until: OffsetDateTime,
) -> ProxyResult<(String, String)> {
    let root_key = KeyPair::from_pem(root_key_pem)
        .map_err(|e| ProxyError::Certificate(format!("bad root key PEM: {e}")))?;
    let root_params = CertificateParams::from_ca_cert_pem(root_cert_pem)
        .map_err(|e| ProxyError::Certificate(format!("bad root cert PEM: {e}")))?;
    let subject = root_params.distinguished_name.clone();
    let issuer = root_params
        .self_signed(&root_key)
        .map_err(|e| ProxyError::Certificate(format!("failed to rebuild root issuer: {e}")))?;

    let (leaf_key, leaf_key_pem) = new_rsa_key_pair()?;

    let mut params = CertificateParams::default();
    params.distinguished_name = subject;
    params.serial_number = Some(random_serial());
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = valid_until;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::DataEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.subject_alt_names = vec![match hostname.parse::<IpAddr>() {
        Ok(ip) => SanType::IpAddress(ip),
        Err(_) => SanType::DnsName(
            hostname
                .try_into()
                .map_err(|e| ProxyError::Certificate(format!("bad SAN name {hostname:?}: {e}")))?,
        ),
    }];

    let cert = params
        .signed_by(&leaf_key, &issuer, &root_key)
        .map_err(|e| ProxyError::Certificate(format!("failed to sign leaf: {e}")))?;

    Ok((cert.pem(), leaf_key_pem))
}

/// Canonical cache/SAN key for an SNI name:
/// `host[:port]` drops the port; an IP literal stays verbatim; a name
/// with three or more labels has its leftmost label replaced by `*`
/// (covering one subdomain level); anything else stays verbatim.
pub fn host_pattern_of(hostname: &str) -> String {
    let host = strip_port(hostname);
    if host.parse::<IpAddr>().is_ok() {
        return host.to_string();
    }
    let mut labels: Vec<&str> = host.split('.').collect();
    if labels.len() > 2 {
        labels[0] = "*";
    }
    labels.join(".")
}

fn strip_port(hostname: &str) -> &str {
    // Bracketed IPv6 first: "[::1]:443" and "[::1]" both yield "::1".
    if let Some(rest) = hostname.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match hostname.rfind(':') {
        // A lone ":port" suffix; a second colon means a raw IPv6 address.
        Some(idx)
            if !hostname[..idx].contains(':')
                && !hostname[idx + 1..].is_empty()
                && hostname[idx + 1..].bytes().all(|b| b.is_ascii_digit()) =>
        {
            &hostname[..idx]
        }
        _ => hostname,
    }
}

fn new_rsa_key_pair() -> ProxyResult<(KeyPair, String)> {
    let key = RsaPrivateKey::new(&mut rand::rngs::OsRng, RSA_BITS)
        .map_err(|e| ProxyError::Certificate(format!("RSA key generation failed: {e}")))?;
    let der = key
        .to_pkcs8_der()
        .map_err(|e| ProxyError::Certificate(format!("PKCS#8 encoding failed: {e}")))?;
    let key_pair = KeyPair::try_from(der.as_bytes())
        .map_err(|e| ProxyError::Certificate(format!("unusable RSA key: {e}")))?;
    let key_pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| ProxyError::Certificate(format!("PEM encoding failed: {e}")))?
        .to_string();
    Ok((key_pair, key_pem))
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    SerialNumber::from(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::time::Duration;
    use std::sync::OnceLock;
    use x509_parser::prelude::*;

    // RSA keygen is slow enough that the signing tests share one root.
    fn test_root() -> &'static (String, String) {
        static ROOT: OnceLock<(String, String)> = OnceLock::new();
        ROOT.get_or_init(|| {
            sign_root(OffsetDateTime::now_utc() + Duration::days(365)).unwrap()
        })
    }

    fn pem_to_der(pem: &str) -> Vec<u8> {
        let (_, parsed) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).unwrap();
        parsed.contents.clone()
    }

    #[test]
    fn host_pattern_table() {
        assert_eq!(host_pattern_of("1.2.3.4:443"), "1.2.3.4");
        assert_eq!(host_pattern_of("1.2.3.4"), "1.2.3.4");
        assert_eq!(host_pattern_of("www.example.com"), "*.example.com");
        assert_eq!(host_pattern_of("www.example.com:8443"), "*.example.com");
        assert_eq!(host_pattern_of("example.com"), "example.com");
        assert_eq!(host_pattern_of("example.com:443"), "example.com");
        assert_eq!(host_pattern_of("localhost"), "localhost");
        assert_eq!(host_pattern_of("a.b.c.example.com"), "*.b.c.example.com");
        assert_eq!(host_pattern_of("[::1]:443"), "::1");
        assert_eq!(host_pattern_of("::1"), "::1");
    }

    #[test]
    fn host_pattern_is_idempotent() {
        for input in [
            "www.example.com",
            "example.com",
            "1.2.3.4:443",
            "a.b.c.d.e",
            "localhost:3128",
        ] {
            let once = host_pattern_of(input);
            assert_eq!(host_pattern_of(&once), once, "input {input:?}");
        }
    }

    #[test]
    fn root_and_leaf_round_trip_through_pem() {
        let now = OffsetDateTime::now_utc();
        let (root_cert, root_key) = test_root();
        assert!(root_cert.contains("BEGIN CERTIFICATE"));
        assert!(root_key.contains("BEGIN PRIVATE KEY"));

        let (leaf_cert, leaf_key) =
            sign_host("example.com", root_cert, root_key, now + Duration::days(14)).unwrap();

        let certs: Vec<_> = rustls_pemfile::certs(&mut leaf_cert.as_bytes())
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(certs.len(), 1);
        let key = rustls_pemfile::private_key(&mut leaf_key.as_bytes())
            .unwrap()
            .expect("leaf key present");
        rustls::crypto::ring::sign::any_supported_type(&key).expect("leaf key usable for TLS");

        let der = pem_to_der(&leaf_cert);
        let (_, leaf) = X509Certificate::from_der(&der).unwrap();
        let root_der = pem_to_der(root_cert);
        let (_, root) = X509Certificate::from_der(&root_der).unwrap();
        assert_eq!(leaf.issuer().to_string(), root.subject().to_string());
        assert!(!leaf.is_ca());
        assert!(root.is_ca());
    }

    #[test]
    fn dns_hostname_lands_in_dns_san() {
        let now = OffsetDateTime::now_utc();
        let (root_cert, root_key) = test_root();
        let (leaf_cert, _) = sign_host(
            "*.example.com",
            root_cert,
            root_key,
            now + Duration::days(14),
        )
        .unwrap();

        let der = pem_to_der(&leaf_cert);
        let (_, leaf) = X509Certificate::from_der(&der).unwrap();
        let san = leaf
            .subject_alternative_name()
            .unwrap()
            .expect("SAN extension present");
        assert_eq!(san.value.general_names.len(), 1);
        match &san.value.general_names[0] {
            GeneralName::DNSName(name) => assert_eq!(*name, "*.example.com"),
            other => panic!("expected DNS SAN, got {other:?}"),
        }
    }

    #[test]
    fn ip_hostname_lands_in_ip_san() {
        let now = OffsetDateTime::now_utc();
        let (root_cert, root_key) = test_root();
        let (leaf_cert, _) =
            sign_host("10.0.0.1", root_cert, root_key, now + Duration::days(14)).unwrap();

        let der = pem_to_der(&leaf_cert);
        let (_, leaf) = X509Certificate::from_der(&der).unwrap();
        let san = leaf
            .subject_alternative_name()
            .unwrap()
            .expect("SAN extension present");
        assert_eq!(san.value.general_names.len(), 1);
        match &san.value.general_names[0] {
            GeneralName::IPAddress(bytes) => assert_eq!(*bytes, [10, 0, 0, 1].as_slice()),
            other => panic!("expected IP SAN, got {other:?}"),
        }
    }

    #[test]
    fn malformed_root_pem_fails_cleanly() {
        let now = OffsetDateTime::now_utc();
        let err = sign_host("example.com", "not a pem", "also not a pem", now).unwrap_err();
        assert!(matches!(err, ProxyError::Certificate(_)));
    }
}
