//! rustls integration: verify RA-TLS evidence during the handshake.
//!
//! Both ends of the control channel authenticate with self-signed RA-TLS
//! certs, so the stock webpki verifiers don't apply. [`RatlsCertVerifier`]
//! accepts a peer iff its cert parses, is inside its validity window,
//! is correctly self-signed, and carries a quote that binds the cert key —
//! plus the full local DCAP checks unless fake quotes are allowed. Peers
//! failing any of this never complete the handshake, which is what keeps
//! application handlers free of "was the client attested?" checks.

use std::sync::Arc;

use rustls::{
    client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    },
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
    server::danger::{ClientCertVerified, ClientCertVerifier},
    DigitallySignedStruct, DistinguishedName,
};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::ratls::{self, RatlsMaterial};

/// A [`ClientCertVerifier`] and [`ServerCertVerifier`] for RA-TLS peers.
#[derive(Debug)]
pub struct RatlsCertVerifier {
    /// Accept structurally-valid quotes without an Intel chain. Only for
    /// development and tests.
    pub allow_fake_quote: bool,
    provider: Arc<CryptoProvider>,
}

impl RatlsCertVerifier {
    pub fn new(allow_fake_quote: bool) -> Self {
        Self {
            allow_fake_quote,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    fn check_peer(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<(), rustls::Error> {
        if !intermediates.is_empty() {
            return Err(rustls_err("ratls_unexpected_intermediates"));
        }

        let (_, cert) = X509Certificate::from_der(end_entity.as_ref())
            .map_err(|_| rustls_err("ratls_missing_peer_cert"))?;

        // Self-signed sanity: validity window + signature over itself.
        let at = x509_parser::time::ASN1Time::from_timestamp(now.as_secs() as i64)
            .map_err(|_| rustls_err("ratls_bad_time"))?;
        if !cert.validity().is_valid_at(at) {
            return Err(rustls_err("ratls_cert_expired"));
        }
        cert.verify_signature(None)
            .map_err(|_| rustls_err("ratls_bad_self_signature"))?;

        if self.allow_fake_quote {
            ratls::verify_ratls_binding(end_entity.as_ref())
                .map_err(|reason| rustls_err(format!("ratls_{reason}")))?;
            return Ok(());
        }

        let result = ratls::verify_ratls_cert(end_entity.as_ref(), None, false);
        if !result.verified {
            return Err(rustls_err(format!("ratls_{}", result.reason)));
        }
        Ok(())
    }
}

impl ClientCertVerifier for RatlsCertVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.check_peer(end_entity, intermediates, now)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

impl ServerCertVerifier for RatlsCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        // The server's identity is its attestation, not its DNS name.
        self.check_peer(end_entity, intermediates, now)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Server-side TLS config: present RA-TLS material; optionally require
/// clients to present valid RA-TLS certs of their own.
pub fn server_config(
    material: &RatlsMaterial,
    client_verifier: Option<Arc<RatlsCertVerifier>>,
) -> anyhow::Result<rustls::ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?;

    let cert_chain = vec![CertificateDer::from(material.cert_der.clone())];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(material.key_der.clone()));

    let config = match client_verifier {
        Some(verifier) => builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(cert_chain, key)?,
        None => builder
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)?,
    };
    Ok(config)
}

/// Client-side TLS config: trust the server through its RA-TLS evidence;
/// optionally authenticate ourselves with our own RA-TLS material.
pub fn client_config(
    server_verifier: Arc<RatlsCertVerifier>,
    material: Option<&RatlsMaterial>,
) -> anyhow::Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(server_verifier);

    let config = match material {
        Some(material) => {
            let cert_chain = vec![CertificateDer::from(material.cert_der.clone())];
            let key =
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(material.key_der.clone()));
            builder.with_client_auth_cert(cert_chain, key)?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(config)
}

fn rustls_err(message: impl std::fmt::Display) -> rustls::Error {
    rustls::Error::General(message.to_string())
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::{provider::FakeQuoteProvider, ratls::generate_material};

    fn material() -> RatlsMaterial {
        generate_material(&FakeQuoteProvider, "easyenclave-ratls", Duration::from_secs(60))
            .unwrap()
    }

    #[test]
    fn fake_quote_peer_accepted_when_allowed() {
        let material = material();
        let verifier = RatlsCertVerifier::new(true);
        let cert = CertificateDer::from(material.cert_der.clone());
        verifier
            .verify_client_cert(&cert, &[], UnixTime::now())
            .unwrap();
    }

    #[test]
    fn fake_quote_peer_rejected_when_strict() {
        let material = material();
        let verifier = RatlsCertVerifier::new(false);
        let cert = CertificateDer::from(material.cert_der.clone());
        let err = verifier
            .verify_client_cert(&cert, &[], UnixTime::now())
            .unwrap_err();
        assert!(
            err.to_string().contains("ratls_dcap_verification_failed"),
            "{err}"
        );
    }

    #[test]
    fn plain_cert_rejected() {
        let key_pair =
            rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let params =
            rcgen::CertificateParams::new(vec!["nope.example".to_owned()]).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        let verifier = RatlsCertVerifier::new(true);
        let cert_der = CertificateDer::from(cert.der().as_ref().to_vec());
        let err = verifier
            .verify_client_cert(&cert_der, &[], UnixTime::now())
            .unwrap_err();
        assert!(err.to_string().contains("ratls_missing_quote_extension"));
    }

    #[test]
    fn configs_build() {
        let material = material();
        let verifier = Arc::new(RatlsCertVerifier::new(true));
        server_config(&material, Some(verifier.clone())).unwrap();
        client_config(verifier, Some(&material)).unwrap();
    }
}
