//! Input format classification.

use crate::pem::CERTIFICATE_MARKER;
use crate::pkcs12::looks_like_pfx;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Encoding family of a certificate input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertFormat {
    Pem,
    Der,
    Pkcs12,
    Unknown,
}

impl fmt::Display for CertFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CertFormat::Pem => "PEM",
            CertFormat::Der => "DER",
            CertFormat::Pkcs12 => "PKCS12",
            CertFormat::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Classifies `bytes`, using `filename` as a hint when given.
///
/// A `.pfx` or `.p12` extension wins without looking at the content. Then a
/// PEM certificate marker means PEM, and a leading ASN.1 SEQUENCE byte means
/// DER unless the whole buffer decodes as a PFX structure.
pub fn classify_format(bytes: &[u8], filename: Option<&str>) -> CertFormat {
    if filename.is_some_and(has_pkcs12_extension) {
        return CertFormat::Pkcs12;
    }

    if String::from_utf8_lossy(bytes).contains(CERTIFICATE_MARKER) {
        return CertFormat::Pem;
    }

    match bytes.first() {
        Some(0x30) if looks_like_pfx(bytes) => CertFormat::Pkcs12,
        Some(0x30) => CertFormat::Der,
        _ => CertFormat::Unknown,
    }
}

fn has_pkcs12_extension(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("pfx") || ext.eq_ignore_ascii_case("p12"))
        .unwrap_or(false)
}
