//! Certificate and private key parsing.
//!
//! Each input is tried against an ordered list of decoders. Every failed
//! decoder yields a [`ParseAttemptFailed`]; the first success wins and the
//! collected failures only surface, summarized, when nothing matched.

use crate::pem::{self, PemBlock, ENCRYPTED_KEY_LABEL};
use crate::types::{Certificate, KeyAlgorithm, KeyEncryption, KeyStructure, PrivateKey, SourceEncoding};
use certgate_core::CertificateError;
use der::asn1::{AnyRef, ObjectIdentifier};
use der::{Decode, Encode};
use pkcs8::{AlgorithmIdentifierRef, EncryptedPrivateKeyInfo, PrivateKeyInfo};
use rustls::pki_types::PrivateKeyDer;
use std::fmt;
use std::io::{BufReader, Cursor};
use tracing::debug;

pub(crate) const RSA_ENCRYPTION: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
pub(crate) const EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
pub(crate) const ED25519: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.112");

/// A single decoding strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseAttempt {
    Pem,
    Der,
}

impl fmt::Display for ParseAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseAttempt::Pem => f.write_str("PEM"),
            ParseAttempt::Der => f.write_str("DER"),
        }
    }
}

/// Why one decoding strategy did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAttemptFailed {
    pub attempt: ParseAttempt,
    pub reason: String,
}

impl ParseAttemptFailed {
    fn new(attempt: ParseAttempt, reason: impl Into<String>) -> Self {
        Self {
            attempt,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ParseAttemptFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.attempt, self.reason)
    }
}

fn summarize(failures: &[ParseAttemptFailed]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Orders the attempts by what the input looks like: a leading SEQUENCE byte
/// puts DER first.
fn attempt_order(bytes: &[u8]) -> [ParseAttempt; 2] {
    if bytes.first() == Some(&0x30) {
        [ParseAttempt::Der, ParseAttempt::Pem]
    } else {
        [ParseAttempt::Pem, ParseAttempt::Der]
    }
}

// ---------------------------------------------------------------------------
// Certificates
// ---------------------------------------------------------------------------

/// Parses a single certificate, trying PEM and then DER.
///
/// For PEM input carrying several certificates, the first one is returned.
pub fn parse_certificate(bytes: &[u8]) -> Result<Certificate, CertificateError> {
    let mut failures = Vec::new();

    for attempt in [ParseAttempt::Pem, ParseAttempt::Der] {
        let result = match attempt {
            ParseAttempt::Pem => pem_certificates(bytes).and_then(|mut certs| {
                if certs.is_empty() {
                    Err(ParseAttemptFailed::new(attempt, "no CERTIFICATE block"))
                } else {
                    Ok(certs.remove(0))
                }
            }),
            ParseAttempt::Der => der_certificate(bytes),
        };

        match result {
            Ok(cert) => {
                debug!(attempt = %attempt, subject = %cert.subject(), "Parsed certificate");
                return Ok(cert);
            }
            Err(failure) => {
                debug!(%failure, "Certificate parse attempt failed");
                failures.push(failure);
            }
        }
    }

    Err(CertificateError::malformed_certificate(summarize(&failures)))
}

/// Parses every certificate in `bytes`: all PEM blocks in order, or a single
/// DER certificate.
pub fn parse_certificates(bytes: &[u8]) -> Result<Vec<Certificate>, CertificateError> {
    let pem_failure = match pem_certificates(bytes) {
        Ok(certs) if !certs.is_empty() => return Ok(certs),
        Ok(_) => ParseAttemptFailed::new(ParseAttempt::Pem, "no CERTIFICATE block"),
        Err(failure) => failure,
    };

    der_certificate(bytes).map(|cert| vec![cert]).map_err(|der_failure| {
        CertificateError::malformed_certificate(summarize(&[pem_failure, der_failure]))
    })
}

fn pem_certificates(bytes: &[u8]) -> Result<Vec<Certificate>, ParseAttemptFailed> {
    let mut reader = BufReader::new(Cursor::new(bytes));
    let ders = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ParseAttemptFailed::new(ParseAttempt::Pem, e.to_string()))?;

    ders.into_iter()
        .map(|der| certificate_from_der(der.as_ref().to_vec(), SourceEncoding::Pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|reason| ParseAttemptFailed::new(ParseAttempt::Pem, reason))
}

fn der_certificate(bytes: &[u8]) -> Result<Certificate, ParseAttemptFailed> {
    certificate_from_der(bytes.to_vec(), SourceEncoding::Der)
        .map_err(|reason| ParseAttemptFailed::new(ParseAttempt::Der, reason))
}

pub(crate) fn certificate_from_der(
    der: Vec<u8>,
    encoding: SourceEncoding,
) -> Result<Certificate, String> {
    let (subject, issuer, not_after) = {
        let (rest, parsed) =
            x509_parser::parse_x509_certificate(&der).map_err(|e| e.to_string())?;
        if !rest.is_empty() {
            return Err(format!("{} trailing bytes after certificate", rest.len()));
        }
        (
            parsed.subject().to_string(),
            parsed.issuer().to_string(),
            parsed.validity().not_after.timestamp(),
        )
    };
    Ok(Certificate::new(der, encoding, subject, issuer, not_after))
}

// ---------------------------------------------------------------------------
// Private keys
// ---------------------------------------------------------------------------

/// Parses a private key and normalizes it to cleartext PKCS#8.
///
/// Accepts PEM (`PRIVATE KEY`, `RSA PRIVATE KEY`, `EC PRIVATE KEY`,
/// `ENCRYPTED PRIVATE KEY`) and DER (PKCS#8, encrypted PKCS#8, PKCS#1,
/// SEC1). An empty passphrase counts as no passphrase.
///
/// # Errors
///
/// - `PassphraseRequired` when the key looks encrypted and no passphrase was given
/// - `PassphraseIncorrectOrMalformedKey` when a passphrase was given and nothing parsed
/// - `UnsupportedFormat` for legacy `Proc-Type` encrypted PEM with a passphrase
/// - `MalformedKey` otherwise
pub fn parse_private_key(
    bytes: &[u8],
    passphrase: Option<&str>,
) -> Result<PrivateKey, CertificateError> {
    let passphrase = passphrase.filter(|p| !p.is_empty());
    let text = String::from_utf8_lossy(bytes);
    let (blocks, pem_failure) = match pem::blocks(bytes) {
        Ok(blocks) => (blocks, None),
        Err(e) => (Vec::new(), Some(e.to_string())),
    };
    let key_block = blocks.iter().find(|b| b.is_key());

    let encrypted = text.contains("ENCRYPTED") || EncryptedPrivateKeyInfo::try_from(bytes).is_ok();

    if let Some(block) = key_block.filter(|b| b.is_legacy_encrypted()) {
        debug!(label = block.label(), "Legacy encrypted PEM key");
        return Err(legacy_encryption_error(passphrase));
    }

    let mut failures = Vec::new();
    for attempt in attempt_order(bytes) {
        let result = match attempt {
            ParseAttempt::Pem => match key_block {
                Some(block) => pem_key(block, passphrase),
                None => Err(ParseAttemptFailed::new(
                    attempt,
                    pem_failure.clone().unwrap_or_else(|| "no private key block".to_string()),
                )),
            },
            ParseAttempt::Der => der_key(bytes, passphrase, SourceEncoding::Der),
        };

        match result {
            Ok(key) => {
                debug!(
                    attempt = %attempt,
                    structure = ?key.structure(),
                    algorithm = ?key.algorithm(),
                    "Parsed private key"
                );
                return Ok(key);
            }
            Err(failure) => {
                debug!(%failure, "Private key parse attempt failed");
                failures.push(failure);
            }
        }
    }

    Err(match (encrypted, passphrase) {
        (true, None) => CertificateError::PassphraseRequired,
        (_, Some(_)) => CertificateError::PassphraseIncorrectOrMalformedKey,
        (false, None) => CertificateError::malformed_key(summarize(&failures)),
    })
}

/// Parses a key block already split out of a PEM document.
pub(crate) fn parse_key_block(
    block: &PemBlock,
    passphrase: Option<&str>,
) -> Result<PrivateKey, CertificateError> {
    let passphrase = passphrase.filter(|p| !p.is_empty());
    if block.is_legacy_encrypted() {
        return Err(legacy_encryption_error(passphrase));
    }

    pem_key(block, passphrase).map_err(|failure| {
        debug!(%failure, "Private key block unreadable");
        match (block.label() == ENCRYPTED_KEY_LABEL, passphrase) {
            (true, None) => CertificateError::PassphraseRequired,
            (_, Some(_)) => CertificateError::PassphraseIncorrectOrMalformedKey,
            (false, None) => CertificateError::malformed_key(failure.to_string()),
        }
    })
}

fn legacy_encryption_error(passphrase: Option<&str>) -> CertificateError {
    match passphrase {
        None => CertificateError::PassphraseRequired,
        Some(_) => CertificateError::unsupported(
            "legacy OpenSSL PEM encryption (Proc-Type/DEK-Info); convert the key to encrypted PKCS#8 first",
        ),
    }
}

fn pem_key(block: &PemBlock, passphrase: Option<&str>) -> Result<PrivateKey, ParseAttemptFailed> {
    let fail = |reason: String| ParseAttemptFailed::new(ParseAttempt::Pem, reason);

    if block.label() == ENCRYPTED_KEY_LABEL {
        return decrypt_pkcs8(block.contents(), passphrase, SourceEncoding::Pem).map_err(fail);
    }

    let key = block
        .cleartext_key()
        .ok_or_else(|| fail(format!("unreadable {} block", block.label())))?;

    match key {
        PrivateKeyDer::Pkcs8(k) => cleartext_pkcs8(k.secret_pkcs8_der(), SourceEncoding::Pem),
        PrivateKeyDer::Pkcs1(k) => pkcs1_to_pkcs8(k.secret_pkcs1_der(), SourceEncoding::Pem),
        PrivateKeyDer::Sec1(k) => sec1_to_pkcs8(k.secret_sec1_der(), SourceEncoding::Pem),
        _ => Err("unsupported private key structure".to_string()),
    }
    .map_err(fail)
}

/// DER sub-attempts, in order: cleartext PKCS#8, encrypted PKCS#8, PKCS#1, SEC1.
fn der_key(
    bytes: &[u8],
    passphrase: Option<&str>,
    encoding: SourceEncoding,
) -> Result<PrivateKey, ParseAttemptFailed> {
    let mut reasons = Vec::with_capacity(4);

    match cleartext_pkcs8(bytes, encoding) {
        Ok(key) => return Ok(key),
        Err(e) => reasons.push(format!("pkcs8: {}", e)),
    }
    match decrypt_pkcs8(bytes, passphrase, encoding) {
        Ok(key) => return Ok(key),
        Err(e) => reasons.push(format!("encrypted pkcs8: {}", e)),
    }
    match pkcs1_to_pkcs8(bytes, encoding) {
        Ok(key) => return Ok(key),
        Err(e) => reasons.push(format!("pkcs1: {}", e)),
    }
    match sec1_to_pkcs8(bytes, encoding) {
        Ok(key) => return Ok(key),
        Err(e) => reasons.push(format!("sec1: {}", e)),
    }

    Err(ParseAttemptFailed::new(ParseAttempt::Der, reasons.join(", ")))
}

fn algorithm_of(oid: ObjectIdentifier) -> KeyAlgorithm {
    if oid == RSA_ENCRYPTION {
        KeyAlgorithm::Rsa
    } else if oid == EC_PUBLIC_KEY {
        KeyAlgorithm::Ec
    } else if oid == ED25519 {
        KeyAlgorithm::Ed25519
    } else {
        KeyAlgorithm::Other(oid.to_string())
    }
}

fn cleartext_pkcs8(der: &[u8], encoding: SourceEncoding) -> Result<PrivateKey, String> {
    let info = PrivateKeyInfo::try_from(der).map_err(|e| e.to_string())?;
    Ok(PrivateKey::new(
        der.to_vec(),
        encoding,
        KeyEncryption::Cleartext,
        KeyStructure::Pkcs8,
        algorithm_of(info.algorithm.oid),
    ))
}

fn decrypt_pkcs8(
    der: &[u8],
    passphrase: Option<&str>,
    encoding: SourceEncoding,
) -> Result<PrivateKey, String> {
    let encrypted = EncryptedPrivateKeyInfo::try_from(der).map_err(|e| e.to_string())?;
    let passphrase = passphrase.ok_or_else(|| "encrypted key needs a passphrase".to_string())?;
    let document = encrypted
        .decrypt(passphrase)
        .map_err(|_| "decryption failed".to_string())?;
    let info = PrivateKeyInfo::try_from(document.as_bytes())
        .map_err(|_| "decrypted content is not PKCS#8".to_string())?;

    Ok(PrivateKey::new(
        document.as_bytes().to_vec(),
        encoding,
        KeyEncryption::Encrypted,
        KeyStructure::Pkcs8,
        algorithm_of(info.algorithm.oid),
    ))
}

fn pkcs1_to_pkcs8(der: &[u8], encoding: SourceEncoding) -> Result<PrivateKey, String> {
    pkcs1::RsaPrivateKey::try_from(der).map_err(|e| e.to_string())?;

    let algorithm = AlgorithmIdentifierRef {
        oid: RSA_ENCRYPTION,
        parameters: Some(AnyRef::NULL),
    };
    let pkcs8 = PrivateKeyInfo::new(algorithm, der)
        .to_der()
        .map_err(|e| e.to_string())?;

    Ok(PrivateKey::new(
        pkcs8,
        encoding,
        KeyEncryption::Cleartext,
        KeyStructure::Pkcs1,
        KeyAlgorithm::Rsa,
    ))
}

fn sec1_to_pkcs8(der: &[u8], encoding: SourceEncoding) -> Result<PrivateKey, String> {
    let ec_key = sec1::EcPrivateKey::try_from(der).map_err(|e| e.to_string())?;
    let curve = ec_key
        .parameters
        .and_then(|p| p.named_curve())
        .ok_or_else(|| "EC key does not name its curve".to_string())?;

    let curve_der = curve.to_der().map_err(|e| e.to_string())?;
    let curve_param = AnyRef::from_der(&curve_der).map_err(|e| e.to_string())?;
    let algorithm = AlgorithmIdentifierRef {
        oid: EC_PUBLIC_KEY,
        parameters: Some(curve_param),
    };
    let pkcs8 = PrivateKeyInfo::new(algorithm, der)
        .to_der()
        .map_err(|e| e.to_string())?;

    Ok(PrivateKey::new(
        pkcs8,
        encoding,
        KeyEncryption::Cleartext,
        KeyStructure::Sec1,
        KeyAlgorithm::Ec,
    ))
}
