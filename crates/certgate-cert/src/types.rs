//! Certificate material as it flows through the pipeline.

use ring::digest::{digest, SHA1_FOR_LEGACY_USE_ONLY};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

/// How a piece of material was encoded when it reached the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceEncoding {
    Pem,
    Der,
}

/// A parsed X.509 certificate. Immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
    encoding: SourceEncoding,
    subject: String,
    issuer: String,
    not_after: i64,
}

impl Certificate {
    pub(crate) fn new(
        der: Vec<u8>,
        encoding: SourceEncoding,
        subject: String,
        issuer: String,
        not_after: i64,
    ) -> Self {
        Self {
            der,
            encoding,
            subject,
            issuer,
            not_after,
        }
    }

    /// Raw DER bytes.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn encoding(&self) -> SourceEncoding {
        self.encoding
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// End of the validity period, seconds since the Unix epoch.
    pub fn not_after(&self) -> i64 {
        self.not_after
    }

    /// SHA-1 over the DER encoding, upper-case hex.
    pub fn thumbprint(&self) -> String {
        thumbprint_hex(&self.der)
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject)
            .field("issuer", &self.issuer)
            .field("encoding", &self.encoding)
            .field("der_len", &self.der.len())
            .finish()
    }
}

/// SHA-1 digest of a DER certificate.
pub fn sha1_fingerprint(der: &[u8]) -> Vec<u8> {
    digest(&SHA1_FOR_LEGACY_USE_ONLY, der).as_ref().to_vec()
}

/// SHA-1 digest of a DER certificate as upper-case hex, the form secret
/// stores report as a certificate thumbprint.
pub fn thumbprint_hex(der: &[u8]) -> String {
    sha1_fingerprint(der)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect()
}

/// Whether the key was protected when it arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyEncryption {
    Encrypted,
    Cleartext,
}

/// The structure the key was stored in before normalization to PKCS#8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStructure {
    Pkcs8,
    Pkcs1,
    Sec1,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    Rsa,
    Ec,
    Ed25519,
    /// Any other algorithm, identified by its dotted OID
    Other(String),
}

/// A private key in cleartext PKCS#8 form.
///
/// An encrypted input only becomes a `PrivateKey` after successful
/// decryption. The key bytes are wiped on drop and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey {
    pkcs8: Zeroizing<Vec<u8>>,
    encoding: SourceEncoding,
    encryption: KeyEncryption,
    structure: KeyStructure,
    algorithm: KeyAlgorithm,
}

impl PrivateKey {
    pub(crate) fn new(
        pkcs8: Vec<u8>,
        encoding: SourceEncoding,
        encryption: KeyEncryption,
        structure: KeyStructure,
        algorithm: KeyAlgorithm,
    ) -> Self {
        Self {
            pkcs8: Zeroizing::new(pkcs8),
            encoding,
            encryption,
            structure,
            algorithm,
        }
    }

    /// Cleartext PKCS#8 DER.
    pub fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8
    }

    pub fn encoding(&self) -> SourceEncoding {
        self.encoding
    }

    /// Encryption state of the original input.
    pub fn encryption(&self) -> KeyEncryption {
        self.encryption
    }

    pub fn structure(&self) -> KeyStructure {
        self.structure
    }

    pub fn algorithm(&self) -> &KeyAlgorithm {
        &self.algorithm
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("pkcs8", &"<redacted>")
            .field("encoding", &self.encoding)
            .field("encryption", &self.encryption)
            .field("structure", &self.structure)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

/// An ordered certificate chain: the leaf first, intermediates after it in
/// the order they were supplied. Duplicates and cycles are kept as given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateChain {
    certificates: Vec<Certificate>,
}

impl CertificateChain {
    pub fn new(leaf: Certificate, intermediates: Vec<Certificate>) -> Self {
        let mut certificates = Vec::with_capacity(intermediates.len() + 1);
        certificates.push(leaf);
        certificates.extend(intermediates);
        Self { certificates }
    }

    pub fn leaf(&self) -> &Certificate {
        &self.certificates[0]
    }

    /// Everything after the leaf.
    pub fn intermediates(&self) -> &[Certificate] {
        &self.certificates[1..]
    }

    pub fn certificates(&self) -> &[Certificate] {
        &self.certificates
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    /// Always false; a chain holds at least its leaf.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// A chain together with the private key of its leaf.
#[derive(Debug, Clone)]
pub struct AssembledChain {
    pub chain: CertificateChain,
    pub key: PrivateKey,
}

/// Protection applied to an encoded container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protection {
    /// PBES2 (PBKDF2-HMAC-SHA256, AES-256-CBC) with an HMAC integrity check
    Password,
    /// Cleartext bags and no integrity check
    None,
}

/// Password used to protect an exported container.
///
/// An empty string is not a password: [`ExportPassword::new`] returns `None`
/// for it, so callers cannot ask for encryption with an empty secret.
#[derive(Clone)]
pub struct ExportPassword(Zeroizing<String>);

impl ExportPassword {
    pub fn new(password: &str) -> Option<Self> {
        if password.is_empty() {
            None
        } else {
            Some(Self(Zeroizing::new(password.to_string())))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ExportPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExportPassword(<redacted>)")
    }
}

/// An encoded PKCS#12 container, owned by whoever receives it.
#[derive(Clone, PartialEq, Eq)]
pub struct Pkcs12Container {
    der: Vec<u8>,
    protection: Protection,
}

impl Pkcs12Container {
    pub(crate) fn new(der: Vec<u8>, protection: Protection) -> Self {
        Self { der, protection }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.der
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.der
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }

    pub fn is_encrypted(&self) -> bool {
        self.protection == Protection::Password
    }
}

impl fmt::Debug for Pkcs12Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs12Container")
            .field("protection", &self.protection)
            .field("len", &self.der.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert(subject: &str) -> Certificate {
        Certificate::new(
            subject.as_bytes().to_vec(),
            SourceEncoding::Der,
            subject.to_string(),
            "CN=issuer".to_string(),
            0,
        )
    }

    #[test]
    fn test_chain_keeps_order_and_duplicates() {
        let chain = CertificateChain::new(cert("a"), vec![cert("b"), cert("c"), cert("b")]);
        assert_eq!(chain.leaf().subject(), "a");
        let rest: Vec<_> = chain.intermediates().iter().map(|c| c.subject()).collect();
        assert_eq!(rest, vec!["b", "c", "b"]);
        assert_eq!(chain.len(), 4);
        assert!(!chain.is_empty());
    }

    #[test]
    fn test_export_password_rejects_empty() {
        assert!(ExportPassword::new("").is_none());
        let pw = ExportPassword::new("s3cret").unwrap();
        assert_eq!(pw.expose(), "s3cret");
        assert!(!format!("{:?}", pw).contains("s3cret"));
    }

    #[test]
    fn test_private_key_debug_is_redacted() {
        let key = PrivateKey::new(
            vec![0xde, 0xad, 0xbe, 0xef],
            SourceEncoding::Pem,
            KeyEncryption::Cleartext,
            KeyStructure::Pkcs8,
            KeyAlgorithm::Rsa,
        );
        let debug = format!("{:?}", key);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("222"));
        assert_eq!(key.pkcs8_der(), &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_thumbprint_format() {
        let tp = thumbprint_hex(b"abc");
        assert_eq!(tp, "A9993E364706816ABA3E25717850C26C9CD0D89D");
        assert_eq!(cert("abc").thumbprint(), tp);
    }
}
