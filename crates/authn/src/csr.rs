//! PKCS#10 certificate signing request builder.
//!
//! Builds the DER encoding of a `CertificationRequest` over an RSA key without
//! going through a general X.509 toolkit, so that the exact bytes are under
//! our control:
//!
//! ```text
//! CertificationRequest ::= SEQUENCE {
//!     certificationRequestInfo SEQUENCE {
//!         version       INTEGER (0),
//!         subject       Name,                  -- CN=<client id>, DC=<tenant id>
//!         subjectPKInfo SubjectPublicKeyInfo,  -- rsaEncryption, RSAPublicKey
//!         attributes    [0] IMPLICIT SET OF Attribute  -- CuId attribute
//!     },
//!     signatureAlgorithm AlgorithmIdentifier,  -- sha256WithRSAEncryption | RSASSA-PSS
//!     signature          BIT STRING
//! }
//! ```
//!
//! Only SHA-256 is supported. PKCS#1 v1.5 output is byte-for-byte
//! reproducible for a given key and inputs; PSS output differs between runs
//! because of its random salt, but the signed `certificationRequestInfo` is
//! identical.

use rsa::{Pkcs1v15Sign, Pss, RsaPrivateKey, traits::PublicKeyParts};
use serde::Serialize;
use sha2::{Digest, Sha256};
use simple_asn1::{ASN1Block, ASN1Class, BigInt, BigUint, OID, oid};

use crate::error::{AuthError, Result};

/// Smallest RSA modulus accepted for a signing request.
pub const MIN_RSA_KEY_BITS: usize = 2048;

/// OID of the attribute carrying the serialized [`CuId`] payload.
pub const CUID_ATTRIBUTE_OID: &str = "1.3.6.1.4.1.311.90.2.10";

const SHA256_OUTPUT_LEN: u64 = 32;
const PEM_LABEL: &str = "CERTIFICATE REQUEST";

/// Digest algorithms a caller may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-256 (the only supported choice).
    Sha256,
    /// SHA-384 (rejected).
    Sha384,
    /// SHA-512 (rejected).
    Sha512,
}

/// RSA signature padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignaturePadding {
    /// RSASSA-PKCS1-v1_5.
    #[default]
    Pkcs1v15,
    /// RSASSA-PSS with MGF1-SHA256 and a 32-byte salt.
    Pss,
}

/// Subject of the signing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrSubject {
    /// Managed-identity client id, encoded as CN.
    pub client_id: String,
    /// Tenant id, encoded as DC.
    pub tenant_id: String,
}

/// Platform identifiers embedded in the CuId attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CuId {
    /// Virtual machine id.
    pub vm_id: String,
    /// Scale-set id, when the VM belongs to one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vmss_id: Option<String>,
}

/// A DER-encoded PKCS#10 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningRequest {
    der: Vec<u8>,
    info_der: Vec<u8>,
}

impl SigningRequest {
    /// DER encoding of the whole `CertificationRequest`.
    #[must_use]
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// DER encoding of the signed `certificationRequestInfo`.
    #[must_use]
    pub fn info_der(&self) -> &[u8] {
        &self.info_der
    }

    /// PEM (`CERTIFICATE REQUEST`) encoding.
    #[must_use]
    pub fn to_pem(&self) -> String {
        mtls_binding_storage::pem_encode(PEM_LABEL, &self.der)
    }
}

/// Builds and signs a certificate signing request.
///
/// # Errors
///
/// - [`AuthError::UnsupportedAlgorithm`] for any hash other than SHA-256
/// - [`AuthError::InvalidKey`] if the key is smaller than [`MIN_RSA_KEY_BITS`]
/// - [`AuthError::InvalidSigningRequest`] if the subject or attribute cannot be encoded
/// - [`AuthError::KeyUnusable`] if signing fails
pub fn build_signing_request(
    key: &RsaPrivateKey,
    subject: &CsrSubject,
    cuid: &CuId,
    padding: SignaturePadding,
    hash: HashAlgorithm,
) -> Result<SigningRequest> {
    if hash != HashAlgorithm::Sha256 {
        return Err(AuthError::unsupported_algorithm(format!("{hash:?}; only SHA-256 is supported")));
    }
    let bits = key.size() * 8;
    if bits < MIN_RSA_KEY_BITS {
        return Err(AuthError::invalid_key(format!(
            "RSA key is {bits} bits, at least {MIN_RSA_KEY_BITS} required"
        )));
    }

    let info = ASN1Block::Sequence(
        0,
        vec![
            ASN1Block::Integer(0, BigInt::from(0u8)),
            subject_name(subject)?,
            subject_public_key_info(key)?,
            attributes(cuid)?,
        ],
    );
    let info_der = encode(&info)?;

    let digest = Sha256::digest(&info_der);
    let signature = match padding {
        SignaturePadding::Pkcs1v15 => key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest),
        SignaturePadding::Pss => key.sign_with_rng(&mut rand::thread_rng(), Pss::new::<Sha256>(), &digest),
    }
    .map_err(|e| AuthError::key_unusable(format!("signing request signature failed: {e}")))?;

    let request = ASN1Block::Sequence(
        0,
        vec![
            info,
            signature_algorithm(padding),
            ASN1Block::BitString(0, signature.len() * 8, signature),
        ],
    );
    Ok(SigningRequest { der: encode(&request)?, info_der })
}

/// Hex SHA-256 of the key's DER `SubjectPublicKeyInfo`.
///
/// Identifies a key handle across processes without exposing key material;
/// used to key the attestation token cache.
///
/// # Errors
///
/// Returns [`AuthError::InvalidSigningRequest`] if the key cannot be encoded.
pub fn public_key_thumbprint(key: &RsaPrivateKey) -> Result<String> {
    let spki = encode(&subject_public_key_info(key)?)?;
    Ok(hex::encode(Sha256::digest(&spki)))
}

fn subject_name(subject: &CsrSubject) -> Result<ASN1Block> {
    if subject.client_id.trim().is_empty() {
        return Err(AuthError::invalid_signing_request("subject client id is empty"));
    }
    if subject.tenant_id.trim().is_empty() || !subject.tenant_id.is_ascii() {
        return Err(AuthError::invalid_signing_request("tenant id must be non-empty ASCII"));
    }

    let rdn = |oid: OID, value: ASN1Block| {
        ASN1Block::Set(0, vec![ASN1Block::Sequence(0, vec![ASN1Block::ObjectIdentifier(0, oid), value])])
    };
    Ok(ASN1Block::Sequence(
        0,
        vec![
            rdn(oid!(2, 5, 4, 3), ASN1Block::UTF8String(0, subject.client_id.clone())),
            rdn(
                oid!(0, 9, 2342, 19200300, 100, 1, 25),
                ASN1Block::IA5String(0, subject.tenant_id.clone()),
            ),
        ],
    ))
}

fn subject_public_key_info(key: &RsaPrivateKey) -> Result<ASN1Block> {
    let public_key = ASN1Block::Sequence(
        0,
        vec![
            ASN1Block::Integer(0, to_asn1_int(&key.n().to_bytes_be())),
            ASN1Block::Integer(0, to_asn1_int(&key.e().to_bytes_be())),
        ],
    );
    let public_key_der = encode(&public_key)?;

    Ok(ASN1Block::Sequence(
        0,
        vec![
            ASN1Block::Sequence(
                0,
                vec![ASN1Block::ObjectIdentifier(0, oid!(1, 2, 840, 113549, 1, 1, 1)), ASN1Block::Null(0)],
            ),
            ASN1Block::BitString(0, public_key_der.len() * 8, public_key_der),
        ],
    ))
}

fn attributes(cuid: &CuId) -> Result<ASN1Block> {
    if cuid.vm_id.trim().is_empty() {
        return Err(AuthError::invalid_signing_request("CuId vmId is empty"));
    }
    let payload = serde_json::to_string(cuid)
        .map_err(|e| AuthError::invalid_signing_request(format!("CuId payload: {e}")))?;

    let attribute = ASN1Block::Sequence(
        0,
        vec![
            ASN1Block::ObjectIdentifier(0, oid!(1, 3, 6, 1, 4, 1, 311, 90, 2, 10)),
            ASN1Block::Set(0, vec![ASN1Block::UTF8String(0, payload)]),
        ],
    );
    // [0] IMPLICIT SET OF Attribute: constructed context tag 0 around the
    // concatenated attribute encodings.
    Ok(ASN1Block::Unknown(ASN1Class::ContextSpecific, true, 0, BigUint::from(0u8), encode(&attribute)?))
}

fn signature_algorithm(padding: SignaturePadding) -> ASN1Block {
    match padding {
        SignaturePadding::Pkcs1v15 => ASN1Block::Sequence(
            0,
            vec![ASN1Block::ObjectIdentifier(0, oid!(1, 2, 840, 113549, 1, 1, 11)), ASN1Block::Null(0)],
        ),
        SignaturePadding::Pss => {
            let sha256 = || {
                ASN1Block::Sequence(
                    0,
                    vec![
                        ASN1Block::ObjectIdentifier(0, oid!(2, 16, 840, 1, 101, 3, 4, 2, 1)),
                        ASN1Block::Null(0),
                    ],
                )
            };
            let explicit = |tag: u8, inner: ASN1Block| {
                ASN1Block::Explicit(ASN1Class::ContextSpecific, 0, BigUint::from(tag), Box::new(inner))
            };
            let mgf1 = ASN1Block::Sequence(
                0,
                vec![ASN1Block::ObjectIdentifier(0, oid!(1, 2, 840, 113549, 1, 1, 8)), sha256()],
            );
            let params = ASN1Block::Sequence(
                0,
                vec![
                    explicit(0, sha256()),
                    explicit(1, mgf1),
                    explicit(2, ASN1Block::Integer(0, BigInt::from(SHA256_OUTPUT_LEN))),
                ],
            );
            ASN1Block::Sequence(
                0,
                vec![ASN1Block::ObjectIdentifier(0, oid!(1, 2, 840, 113549, 1, 1, 10)), params],
            )
        },
    }
}

fn to_asn1_int(big_endian: &[u8]) -> BigInt {
    BigInt::from(BigUint::from_bytes_be(big_endian))
}

fn encode(block: &ASN1Block) -> Result<Vec<u8>> {
    simple_asn1::to_der(block)
        .map_err(|e| AuthError::invalid_signing_request(format!("DER encoding failed: {e}")))
}
