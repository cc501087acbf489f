//! PKCS#12 container encoding and decoding.
//!
//! Password-protected containers are produced by `p12-keystore` (PBES2 with
//! PBKDF2-HMAC-SHA256 and AES-256-CBC, HMAC integrity). Containers without a
//! password are assembled here: the key travels in a cleartext `keyBag`, the
//! certificates in `certBag`s, all inside plain `data` content and without a
//! MAC.

use crate::types::{
    sha1_fingerprint, Certificate, ExportPassword, Pkcs12Container, PrivateKey, Protection,
};
use certgate_core::CertificateError;
use der::asn1::{Any, ObjectIdentifier, OctetString};
use der::{Decode, Encode, Sequence, Tag};
use p12_keystore::{KeyStore, KeyStoreEntry, PrivateKeyChain};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Friendly name attached to the key and leaf certificate.
pub const FRIENDLY_NAME: &str = "certificate";

const PFX_VERSION: u8 = 3;

const ID_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");
const KEY_BAG: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.12.10.1.1");
const CERT_BAG: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.12.10.1.3");
const X509_CERTIFICATE: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.22.1");
const FRIENDLY_NAME_ATTR: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.20");
const LOCAL_KEY_ID_ATTR: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.21");

#[derive(Sequence)]
struct Pfx {
    version: u8,
    auth_safe: ContentInfo,
    #[asn1(optional = "true")]
    mac_data: Option<Any>,
}

#[derive(Sequence)]
struct ContentInfo {
    content_type: ObjectIdentifier,
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT")]
    content: Any,
}

#[derive(Sequence)]
struct SafeBag {
    bag_id: ObjectIdentifier,
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT")]
    bag_value: Any,
    #[asn1(optional = "true")]
    bag_attributes: Option<Any>,
}

#[derive(Sequence)]
struct CertBag {
    cert_id: ObjectIdentifier,
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT")]
    cert_value: OctetString,
}

#[derive(Sequence)]
struct Attribute {
    attr_id: ObjectIdentifier,
    attr_values: Any,
}

/// Contents recovered from a container.
#[derive(Clone)]
pub struct ContainerContents {
    /// Cleartext PKCS#8 DER of the first key found
    pub key: Option<Zeroizing<Vec<u8>>>,
    /// Certificate DER, leaf first
    pub certificates: Vec<Vec<u8>>,
}

impl std::fmt::Debug for ContainerContents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerContents")
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("certificates", &self.certificates.len())
            .finish()
    }
}

impl ContainerContents {
    pub fn leaf(&self) -> Option<&[u8]> {
        self.certificates.first().map(Vec::as_slice)
    }
}

/// Encodes a leaf certificate, its key and its chain into one container.
///
/// With a non-empty `export_password` the container is encrypted; with
/// `None` or an empty string it is explicitly unprotected.
///
/// # Errors
///
/// `NoKeyMaterial` when `key` is `None`; `EncodingFailed` if the ASN.1
/// encoder rejects the input.
pub fn encode_pkcs12(
    leaf: &Certificate,
    key: Option<&PrivateKey>,
    chain: &[Certificate],
    export_password: Option<&str>,
) -> Result<Pkcs12Container, CertificateError> {
    let key = key.ok_or(CertificateError::NoKeyMaterial)?;
    let password = export_password.and_then(ExportPassword::new);
    let local_key_id = sha1_fingerprint(leaf.der());

    let container = match password {
        Some(password) => {
            let der = encode_protected(leaf, key, chain, &local_key_id, &password)?;
            Pkcs12Container::new(der, Protection::Password)
        }
        None => {
            let der = encode_plain(leaf, key, chain, &local_key_id)
                .map_err(|e| CertificateError::encoding(e.to_string()))?;
            Pkcs12Container::new(der, Protection::None)
        }
    };

    info!(
        subject = %leaf.subject(),
        chain_len = chain.len(),
        protection = ?container.protection(),
        "Encoded PKCS#12 container"
    );
    Ok(container)
}

fn encode_protected(
    leaf: &Certificate,
    key: &PrivateKey,
    chain: &[Certificate],
    local_key_id: &[u8],
    password: &ExportPassword,
) -> Result<Vec<u8>, CertificateError> {
    let certs = std::iter::once(leaf)
        .chain(chain)
        .map(|c| p12_keystore::Certificate::from_der(c.der()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertificateError::encoding(format!("certificate rejected: {}", e)))?;

    let entry = PrivateKeyChain::new(key.pkcs8_der(), local_key_id, certs);
    let mut keystore = KeyStore::new();
    keystore.add_entry(FRIENDLY_NAME, KeyStoreEntry::PrivateKeyChain(entry));

    keystore
        .writer(password.expose())
        .write()
        .map_err(|e| CertificateError::encoding(e.to_string()))
}

fn encode_plain(
    leaf: &Certificate,
    key: &PrivateKey,
    chain: &[Certificate],
    local_key_id: &[u8],
) -> der::Result<Vec<u8>> {
    let attributes = bag_attributes(local_key_id)?;

    let mut bags = Vec::with_capacity(chain.len() + 2);
    bags.push(SafeBag {
        bag_id: KEY_BAG,
        bag_value: Any::from_der(key.pkcs8_der())?,
        bag_attributes: Some(attributes.clone()),
    });
    bags.push(cert_bag(leaf, Some(attributes))?);
    for cert in chain {
        bags.push(cert_bag(cert, None)?);
    }

    let safe_contents = bags.to_der()?;
    let authenticated_safe = vec![data_content(safe_contents)?].to_der()?;

    Pfx {
        version: PFX_VERSION,
        auth_safe: data_content(authenticated_safe)?,
        mac_data: None,
    }
    .to_der()
}

fn data_content(bytes: Vec<u8>) -> der::Result<ContentInfo> {
    Ok(ContentInfo {
        content_type: ID_DATA,
        content: to_any(&OctetString::new(bytes)?)?,
    })
}

fn cert_bag(cert: &Certificate, attributes: Option<Any>) -> der::Result<SafeBag> {
    let bag = CertBag {
        cert_id: X509_CERTIFICATE,
        cert_value: OctetString::new(cert.der())?,
    };
    Ok(SafeBag {
        bag_id: CERT_BAG,
        bag_value: to_any(&bag)?,
        bag_attributes: attributes,
    })
}

/// `SET OF Attribute` holding the friendly name (BMPString) and local key id.
fn bag_attributes(local_key_id: &[u8]) -> der::Result<Any> {
    let bmp: Vec<u8> = FRIENDLY_NAME
        .encode_utf16()
        .flat_map(|unit| unit.to_be_bytes())
        .collect();
    let friendly_name = Attribute {
        attr_id: FRIENDLY_NAME_ATTR,
        attr_values: set_of(&[Any::new(Tag::BmpString, bmp)?])?,
    };
    let key_id = Attribute {
        attr_id: LOCAL_KEY_ID_ATTR,
        attr_values: set_of(&[to_any(&OctetString::new(local_key_id)?)?])?,
    };

    // DER sorts SET OF members by encoding: the shorter localKeyId
    // attribute comes first.
    set_of(&[to_any(&key_id)?, to_any(&friendly_name)?])
}

fn set_of(items: &[Any]) -> der::Result<Any> {
    let mut value = Vec::new();
    for item in items {
        value.extend(item.to_der()?);
    }
    Any::new(Tag::Set, value)
}

fn to_any<T: Encode>(value: &T) -> der::Result<Any> {
    Any::from_der(&value.to_der()?)
}

fn from_any<'a, T: Decode<'a>>(any: &Any, scratch: &'a mut Vec<u8>) -> der::Result<T> {
    *scratch = any.to_der()?;
    T::from_der(scratch)
}

/// True when `bytes` decodes as a PFX structure (version 3).
pub fn looks_like_pfx(bytes: &[u8]) -> bool {
    matches!(Pfx::from_der(bytes), Ok(pfx) if pfx.version == PFX_VERSION)
}

/// Decodes a container produced by [`encode_pkcs12`] or any standard tool.
///
/// Without a password only unprotected containers can be read; an encrypted
/// one yields `PassphraseRequired`. With a password the container is opened
/// through `p12-keystore`.
pub fn read_container(
    bytes: &[u8],
    password: Option<&str>,
) -> Result<ContainerContents, CertificateError> {
    match password.and_then(ExportPassword::new) {
        Some(password) => read_protected(bytes, &password),
        None => read_plain(bytes),
    }
}

fn read_protected(
    bytes: &[u8],
    password: &ExportPassword,
) -> Result<ContainerContents, CertificateError> {
    let keystore = KeyStore::from_pkcs12(bytes, password.expose()).map_err(|e| {
        debug!(error = %e, "Failed to open protected container");
        CertificateError::PassphraseIncorrectOrMalformedKey
    })?;

    let mut contents = ContainerContents {
        key: None,
        certificates: Vec::new(),
    };
    for (_alias, entry) in keystore.entries() {
        match entry {
            KeyStoreEntry::PrivateKeyChain(chain) => {
                if contents.key.is_none() {
                    contents.key = Some(Zeroizing::new(chain.key().to_vec()));
                }
                contents
                    .certificates
                    .extend(chain.chain().iter().map(|c| c.as_der().to_vec()));
            }
            KeyStoreEntry::Certificate(cert) => {
                contents.certificates.push(cert.as_der().to_vec());
            }
            #[allow(unreachable_patterns)]
            _ => {}
        }
    }
    Ok(contents)
}

fn read_plain(bytes: &[u8]) -> Result<ContainerContents, CertificateError> {
    let malformed = |e: der::Error| CertificateError::unsupported(format!("not a PKCS#12 container: {}", e));

    let pfx = Pfx::from_der(bytes).map_err(malformed)?;
    if pfx.version != PFX_VERSION {
        return Err(CertificateError::unsupported(format!(
            "unexpected PKCS#12 version {}",
            pfx.version
        )));
    }

    let authenticated_safe = data_octets(&pfx.auth_safe).map_err(malformed)?;
    let infos = Vec::<ContentInfo>::from_der(&authenticated_safe).map_err(malformed)?;

    let mut contents = ContainerContents {
        key: None,
        certificates: Vec::new(),
    };
    for info in &infos {
        if info.content_type != ID_DATA {
            return Err(CertificateError::PassphraseRequired);
        }
        let safe_contents = data_octets(info).map_err(malformed)?;
        let bags = Vec::<SafeBag>::from_der(&safe_contents).map_err(malformed)?;

        for bag in bags {
            if bag.bag_id == KEY_BAG {
                if contents.key.is_none() {
                    contents.key = Some(Zeroizing::new(bag.bag_value.to_der().map_err(malformed)?));
                }
            } else if bag.bag_id == CERT_BAG {
                let mut scratch = Vec::new();
                let cert_bag: CertBag = from_any(&bag.bag_value, &mut scratch).map_err(malformed)?;
                if cert_bag.cert_id == X509_CERTIFICATE {
                    contents.certificates.push(cert_bag.cert_value.as_bytes().to_vec());
                }
            } else {
                // shrouded key bags only appear in protected containers
                return Err(CertificateError::PassphraseRequired);
            }
        }
    }

    Ok(contents)
}

fn data_octets(info: &ContentInfo) -> der::Result<Vec<u8>> {
    let mut scratch = Vec::new();
    let octets: OctetString = from_any(&info.content, &mut scratch)?;
    Ok(octets.as_bytes().to_vec())
}
