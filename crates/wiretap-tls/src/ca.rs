//! CA key/certificate material (component C4, CA half).

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::CertificateDer;
use time::{Duration, OffsetDateTime};

use crate::error::TlsStoreError;

/// Subject fields for a freshly generated CA. Unset fields are omitted
/// from the distinguished name rather than defaulted to an empty string.
#[derive(Debug, Clone, Default)]
pub struct CaSubject<'a> {
    pub country: Option<&'a str>,
    pub state: Option<&'a str>,
    pub locality: Option<&'a str>,
    pub organization: Option<&'a str>,
    pub common_name: Option<&'a str>,
}

/// The CA's key and certificate, held for the process lifetime of a
/// [`crate::store::TlsStore`]. `signing_cert` is only ever used as the
/// rcgen `Issuer` argument when minting leaves; the bytes served to
/// clients in every leaf's chain come from `cert_der`/`cert_pem`, which
/// for a loaded CA are the caller's original bytes, unmodified.
pub struct CaMaterial {
    pub(crate) key_pair: KeyPair,
    pub(crate) signing_cert: Certificate,
    pub(crate) cert_der: CertificateDer<'static>,
    pub(crate) cert_pem: String,
}

impl CaMaterial {
    pub fn generate(subject: CaSubject<'_>) -> Result<Self, TlsStoreError> {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| TlsStoreError::CaGeneration(e.to_string()))?;
        let params = ca_params(subject, Duration::days(3650))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| TlsStoreError::CaGeneration(e.to_string()))?;

        let cert_der = CertificateDer::from(cert.der().to_vec());
        let cert_pem = cert.pem();
        Ok(Self {
            key_pair,
            signing_cert: cert,
            cert_der,
            cert_pem,
        })
    }

    /// Adopt a caller-supplied CA. Both the key and the cert must be
    /// provided; the key must be EC P-256 and the cert must carry
    /// `CA:TRUE`.
    pub fn load(key_pem: &str, cert_pem: &str) -> Result<Self, TlsStoreError> {
        let key_pair =
            KeyPair::from_pem(key_pem).map_err(|e| TlsStoreError::CaLoad(e.to_string()))?;
        if !std::ptr::eq(key_pair.algorithm(), &PKCS_ECDSA_P256_SHA256) {
            return Err(TlsStoreError::UnsupportedKeyAlgorithm);
        }

        let cert_der = der_from_pem(cert_pem)?;
        require_ca_basic_constraints(&cert_der)?;

        // rcgen needs an `Issuer`-shaped `Certificate` to sign leaves with.
        // We rebuild one from the loaded key purely for that purpose; it
        // is never itself presented to clients (see `cert_der`/`cert_pem`
        // above, which carry the caller's original bytes verbatim).
        let signing_params = ca_params(CaSubject::default(), Duration::days(3650))?;
        let signing_cert = signing_params
            .self_signed(&key_pair)
            .map_err(|e| TlsStoreError::CaLoad(e.to_string()))?;

        Ok(Self {
            key_pair,
            signing_cert,
            cert_der,
            cert_pem: cert_pem.to_string(),
        })
    }

    pub fn key_pem(&self) -> String {
        self.key_pair.serialize_pem()
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }
}

fn ca_params(subject: CaSubject<'_>, validity: Duration) -> Result<CertificateParams, TlsStoreError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    if let Some(c) = subject.country {
        dn.push(DnType::CountryName, c);
    }
    if let Some(s) = subject.state {
        dn.push(DnType::StateOrProvinceName, s);
    }
    if let Some(l) = subject.locality {
        dn.push(DnType::LocalityName, l);
    }
    dn.push(DnType::OrganizationName, subject.organization.unwrap_or("wiretap"));
    dn.push(
        DnType::CommonName,
        subject.common_name.unwrap_or("wiretap local CA"),
    );
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + validity;
    params.serial_number = Some(SerialNumber::from(random_serial()));

    Ok(params)
}

fn der_from_pem(cert_pem: &str) -> Result<CertificateDer<'static>, TlsStoreError> {
    let mut reader = cert_pem.as_bytes();
    let mut certs = rustls_pemfile::certs(&mut reader);
    certs
        .next()
        .ok_or_else(|| TlsStoreError::CaLoad("no certificate found in PEM input".into()))?
        .map_err(|e| TlsStoreError::CaLoad(e.to_string()))
}

fn require_ca_basic_constraints(cert_der: &CertificateDer<'_>) -> Result<(), TlsStoreError> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| TlsStoreError::CaLoad(e.to_string()))?;
    let is_ca = cert
        .basic_constraints()
        .map_err(|e| TlsStoreError::CaLoad(e.to_string()))?
        .map(|bc| bc.value.ca)
        .unwrap_or(false);
    if !is_ca {
        return Err(TlsStoreError::NotACertificateAuthority);
    }
    Ok(())
}

pub(crate) fn random_serial() -> [u8; 20] {
    let mut bytes = [0u8; 20];
    for b in bytes.iter_mut() {
        *b = rand::random();
    }
    // A DER INTEGER must not have its high bit set on the first byte, or
    // it would be read as negative; clear it like every other serial
    // generator does.
    bytes[0] &= 0x7f;
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ca_round_trips_through_load() {
        let ca = CaMaterial::generate(CaSubject::default()).unwrap();
        let key_pem = ca.key_pem();
        let cert_pem = ca.cert_pem().to_string();

        let loaded = CaMaterial::load(&key_pem, &cert_pem).unwrap();
        assert_eq!(loaded.cert_pem(), cert_pem);
    }

    #[test]
    fn load_rejects_a_non_ca_certificate() {
        // A leaf-shaped (non-CA) self-signed cert should be rejected.
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = CertificateParams::new(vec!["example.test".to_string()]).unwrap();
        params.is_ca = IsCa::NoCa;
        let cert = params.self_signed(&key_pair).unwrap();

        let err = CaMaterial::load(&key_pair.serialize_pem(), &cert.pem()).unwrap_err();
        assert!(matches!(err, TlsStoreError::NotACertificateAuthority));
    }
}
