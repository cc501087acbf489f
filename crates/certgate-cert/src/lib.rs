//! Certificate normalization for certgate
//!
//! Takes certificates and keys in whatever shape they arrive (PEM, DER,
//! PKCS#1, SEC1, PKCS#8, encrypted PKCS#8, bundles, loose chain files) and
//! turns them into a single PKCS#12 container fit for a secret store or an
//! application gateway.
//!
//! ```no_run
//! use certgate_cert::{assemble_bundle, encode_pkcs12};
//!
//! # fn run(bundle: &[u8]) -> Result<(), certgate_core::CertificateError> {
//! let assembled = assemble_bundle(bundle, None)?;
//! let pfx = encode_pkcs12(
//!     assembled.chain.leaf(),
//!     Some(&assembled.key),
//!     assembled.chain.intermediates(),
//!     Some("export-password"),
//! )?;
//! assert!(pfx.is_encrypted());
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod discovery;
pub mod format;
pub mod parser;
pub mod pem;
pub mod pkcs12;
pub mod scratch;
pub mod types;

pub use chain::{assemble_bundle, assemble_explicit, assemble_from_sources, chain_subjects, ChainSource};
pub use discovery::{
    assemble_discovered, discover_chain_files, discover_in_contents, DiscoveredChain,
    DiscoveryRequest, NamedContent,
};
pub use format::{classify_format, CertFormat};
pub use parser::{parse_certificate, parse_certificates, parse_private_key, ParseAttempt, ParseAttemptFailed};
pub use pkcs12::{encode_pkcs12, read_container, ContainerContents};
pub use types::{
    thumbprint_hex, AssembledChain, Certificate, CertificateChain, KeyAlgorithm, KeyEncryption,
    KeyStructure, PrivateKey, Protection, Pkcs12Container, SourceEncoding,
};
