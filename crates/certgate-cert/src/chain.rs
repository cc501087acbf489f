//! Chain assembly: a leaf, its key and intermediates, from separate inputs,
//! from a single bundle, or from a mix of paths and inline content.

use crate::parser::{
    certificate_from_der, parse_certificate, parse_certificates, parse_key_block, parse_private_key,
};
use crate::pem;
use crate::types::{AssembledChain, Certificate, CertificateChain, SourceEncoding};
use base64::prelude::*;
use certgate_core::CertificateError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

/// Builds a chain from a leaf, a key and intermediates supplied separately.
///
/// Each intermediate input is parsed on its own (PEM, then DER); a PEM input
/// carrying several certificates contributes all of them. Order is kept.
pub fn assemble_explicit(
    leaf: &[u8],
    key: &[u8],
    intermediates: &[Vec<u8>],
    passphrase: Option<&str>,
) -> Result<AssembledChain, CertificateError> {
    let leaf = parse_certificate(leaf)?;
    let key = parse_private_key(key, passphrase)?;

    let mut chain = Vec::new();
    for (index, input) in intermediates.iter().enumerate() {
        let certs = parse_certificates(input)?;
        debug!(index, count = certs.len(), "Parsed intermediate input");
        chain.extend(certs);
    }

    info!(
        subject = %leaf.subject(),
        intermediates = chain.len(),
        "Assembled chain from explicit inputs"
    );
    Ok(AssembledChain {
        chain: CertificateChain::new(leaf, chain),
        key,
    })
}

/// Builds a chain from one PEM document holding certificates and a key.
///
/// Blocks are taken in document order: the first certificate is the leaf,
/// later certificates form the chain, and the first private key block of any
/// supported label is the key.
pub fn assemble_bundle(
    bundle: &[u8],
    passphrase: Option<&str>,
) -> Result<AssembledChain, CertificateError> {
    let blocks = pem::blocks(bundle)
        .map_err(|e| CertificateError::malformed_certificate(format!("unreadable PEM bundle: {}", e)))?;

    let key_block = blocks
        .iter()
        .find(|b| b.is_key())
        .ok_or(CertificateError::NoPrivateKeyFound)?;

    let mut certs = Vec::new();
    for block in blocks.iter().filter(|b| b.is_certificate()) {
        let cert = certificate_from_der(block.contents().to_vec(), SourceEncoding::Pem)
            .map_err(CertificateError::malformed_certificate)?;
        certs.push(cert);
    }
    if certs.is_empty() {
        return Err(CertificateError::malformed_certificate(
            "bundle contains no CERTIFICATE block",
        ));
    }

    let key = parse_key_block(key_block, passphrase)?;
    let leaf = certs.remove(0);

    info!(
        subject = %leaf.subject(),
        intermediates = certs.len(),
        key_label = key_block.label(),
        "Assembled chain from bundle"
    );
    Ok(AssembledChain {
        chain: CertificateChain::new(leaf, certs),
        key,
    })
}

/// Where a chain member comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ChainSource {
    /// A file on disk, PEM or DER
    Path(PathBuf),
    /// PEM text, or base64 of PEM or DER
    Inline(String),
}

impl ChainSource {
    /// Reads the raw bytes behind this source.
    ///
    /// # Errors
    ///
    /// `ChainFileNotFound` for a path that cannot be read.
    pub fn load(&self) -> Result<Vec<u8>, CertificateError> {
        match self {
            ChainSource::Path(path) => std::fs::read(path)
                .map_err(|_| CertificateError::chain_file_not_found(path.display().to_string())),
            ChainSource::Inline(content) => Ok(decode_inline(content)),
        }
    }
}

/// PEM text is passed through; anything else is treated as base64 when it
/// decodes, and as raw text otherwise.
pub fn decode_inline(content: &str) -> Vec<u8> {
    if content.contains("-----BEGIN") {
        return content.as_bytes().to_vec();
    }
    let compact: String = content.split_whitespace().collect();
    BASE64_STANDARD
        .decode(compact.as_bytes())
        .unwrap_or_else(|_| content.as_bytes().to_vec())
}

/// Builds a chain where the leaf, the key and every intermediate may each be
/// a path or inline content.
pub fn assemble_from_sources(
    leaf: &ChainSource,
    key: &ChainSource,
    intermediates: &[ChainSource],
    passphrase: Option<&str>,
) -> Result<AssembledChain, CertificateError> {
    let leaf = leaf.load()?;
    let key = key.load()?;
    let intermediates = intermediates
        .iter()
        .map(ChainSource::load)
        .collect::<Result<Vec<_>, _>>()?;

    assemble_explicit(&leaf, &key, &intermediates, passphrase)
}

/// Subjects of the chain, leaf first. Handy for command responses.
pub fn chain_subjects(chain: &CertificateChain) -> Vec<String> {
    chain
        .certificates()
        .iter()
        .map(Certificate::subject)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};

    fn self_signed(name: &str) -> (rcgen::Certificate, KeyPair) {
        let kp = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec![name.to_string()])
            .unwrap()
            .self_signed(&kp)
            .unwrap();
        (cert, kp)
    }

    #[test]
    fn test_bundle_order() {
        let (a, a_kp) = self_signed("a.example");
        let (b, _) = self_signed("b.example");
        let (c, _) = self_signed("c.example");
        let bundle = format!("{}{}{}{}", a.pem(), a_kp.serialize_pem(), b.pem(), c.pem());

        let assembled = assemble_bundle(bundle.as_bytes(), None).unwrap();
        assert_eq!(assembled.chain.leaf().der(), a.der().as_ref());
        let rest: Vec<&[u8]> = assembled
            .chain
            .intermediates()
            .iter()
            .map(|c| c.der())
            .collect();
        assert_eq!(rest, vec![b.der().as_ref(), c.der().as_ref()]);
        assert_eq!(assembled.key.pkcs8_der(), a_kp.serialize_der().as_slice());
    }

    #[test]
    fn test_bundle_key_first() {
        let (a, a_kp) = self_signed("a.example");
        let bundle = format!("{}{}", a_kp.serialize_pem(), a.pem());
        let assembled = assemble_bundle(bundle.as_bytes(), None).unwrap();
        assert_eq!(assembled.chain.len(), 1);
    }

    #[test]
    fn test_bundle_without_key() {
        let (a, _) = self_signed("a.example");
        assert_eq!(
            assemble_bundle(a.pem().as_bytes(), None).unwrap_err(),
            CertificateError::NoPrivateKeyFound
        );
    }

    #[test]
    fn test_bundle_without_certificate() {
        let (_, kp) = self_signed("a.example");
        assert!(matches!(
            assemble_bundle(kp.serialize_pem().as_bytes(), None).unwrap_err(),
            CertificateError::MalformedCertificate { .. }
        ));
    }

    #[test]
    fn test_bundle_with_mismatched_markers() {
        let (a, a_kp) = self_signed("a.example");
        let broken = a.pem().replace("-----END CERTIFICATE-----", "-----END PRIVATE KEY-----");
        let bundle = format!("{}{}", broken, a_kp.serialize_pem());
        assert!(matches!(
            assemble_bundle(bundle.as_bytes(), None).unwrap_err(),
            CertificateError::MalformedCertificate { .. }
        ));
    }

    #[test]
    fn test_bundle_certificates_keep_pem_encoding() {
        let (a, a_kp) = self_signed("a.example");
        let bundle = format!("{}{}", a.pem(), a_kp.serialize_pem());
        let assembled = assemble_bundle(bundle.as_bytes(), None).unwrap();
        assert_eq!(assembled.chain.leaf().encoding(), SourceEncoding::Pem);
    }

    #[test]
    fn test_explicit_keeps_order() {
        let (leaf, kp) = self_signed("leaf.example");
        let (b, _) = self_signed("b.example");
        let (c, _) = self_signed("c.example");

        let intermediates = vec![c.der().to_vec(), b.pem().into_bytes()];
        let assembled = assemble_explicit(
            leaf.pem().as_bytes(),
            kp.serialize_pem().as_bytes(),
            &intermediates,
            None,
        )
        .unwrap();

        let subjects = chain_subjects(&assembled.chain);
        assert_eq!(subjects.len(), 3);
        assert_eq!(assembled.chain.intermediates()[0].der(), c.der().as_ref());
        assert_eq!(assembled.chain.intermediates()[1].der(), b.der().as_ref());
    }

    #[test]
    fn test_explicit_rejects_bad_intermediate() {
        let (leaf, kp) = self_signed("leaf.example");
        let result = assemble_explicit(
            leaf.pem().as_bytes(),
            kp.serialize_pem().as_bytes(),
            &[b"nonsense".to_vec()],
            None,
        );
        assert!(matches!(
            result.unwrap_err(),
            CertificateError::MalformedCertificate { .. }
        ));
    }

    #[test]
    fn test_sources_mix_paths_and_inline() {
        let dir = tempfile::tempdir().unwrap();
        let (leaf, kp) = self_signed("leaf.example");
        let (inter, _) = self_signed("inter.example");

        let leaf_path = dir.path().join("leaf.crt");
        std::fs::write(&leaf_path, leaf.pem()).unwrap();

        let assembled = assemble_from_sources(
            &ChainSource::Path(leaf_path),
            &ChainSource::Inline(kp.serialize_pem()),
            &[ChainSource::Inline(BASE64_STANDARD.encode(inter.der()))],
            None,
        )
        .unwrap();
        assert_eq!(assembled.chain.intermediates()[0].der(), inter.der().as_ref());
    }

    #[test]
    fn test_sources_missing_path() {
        let (_, kp) = self_signed("leaf.example");
        let err = assemble_from_sources(
            &ChainSource::Path(PathBuf::from("/nonexistent/leaf.crt")),
            &ChainSource::Inline(kp.serialize_pem()),
            &[],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CertificateError::ChainFileNotFound { .. }));
    }

    #[test]
    fn test_decode_inline() {
        assert_eq!(decode_inline("QUJD"), b"ABC");
        assert_eq!(decode_inline("QU\nJD"), b"ABC");
        assert_eq!(decode_inline("not base64!"), b"not base64!");
    }
}
