//! Helpers shared by the storage integration tests.

#![allow(dead_code, clippy::expect_used)]

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use mtls_binding_storage::{ClientCertificate, RsaKeyHandle};
use rsa::{RsaPrivateKey, pkcs8::DecodePrivateKey};

pub const CLIENT_ID: &str = "0d9b7e3a-2c41-4f6e-8a5b-93c1d2e4f607";
pub const ENDPOINT: &str = "https://mtls.example.net";

const RSA_2048_PEM: &str = include_str!("../../testdata/rsa2048_pkcs8.pem");

pub fn rsa_key() -> RsaPrivateKey {
    RsaPrivateKey::from_pkcs8_pem(RSA_2048_PEM).expect("bundled test key")
}

/// Self-signed certificate for [`CLIENT_ID`], valid from an hour ago for
/// `hours` more hours, with a usable RSA key attached.
pub fn certificate(hours: i64) -> ClientCertificate {
    let now = Utc::now();
    certificate_between(now - Duration::hours(1), now + Duration::hours(hours))
}

pub fn certificate_between(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> ClientCertificate {
    let mut params =
        rcgen::CertificateParams::new(Vec::<String>::new()).expect("certificate params");
    let mut name = rcgen::DistinguishedName::new();
    name.push(rcgen::DnType::CommonName, CLIENT_ID);
    params.distinguished_name = name;
    params.not_before = offset(not_before);
    params.not_after = offset(not_after);

    let signer = rcgen::KeyPair::generate().expect("signer");
    let der = params.self_signed(&signer).expect("self-signed").der().to_vec();
    ClientCertificate::from_der(&der)
        .expect("parse certificate")
        .with_private_key(Arc::new(RsaKeyHandle::new(rsa_key())))
}

fn offset(at: DateTime<Utc>) -> time::OffsetDateTime {
    time::OffsetDateTime::from_unix_timestamp(at.timestamp()).expect("timestamp")
}
