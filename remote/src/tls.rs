//! TLS client configuration for FTPS control and data connections.
//!
//! One [`ClientConfig`] is built per run and shared by every session, so the TLS session cache
//! is shared too. Many FTPS servers refuse a data connection that does not resume the control
//! connection's TLS session.
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Creates the client config used for every FTPS connection of a run.
///
/// With `skip_verify` the server certificate is accepted without any chain or host name check;
/// otherwise it must chain to the bundled web PKI roots.
pub fn client_config(skip_verify: bool) -> anyhow::Result<Arc<ClientConfig>> {
    if skip_verify {
        tracing::warn!(
            "TLS certificate verification is disabled, the server's identity is not checked"
        );
        let provider = provider();
        let verifier = Arc::new(AcceptAnyServerCert::new(provider.clone()));
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();
        return Ok(Arc::new(config));
    }
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    client_config_with_roots(roots)
}

/// Creates a verifying client config trusting only `roots`.
pub fn client_config_with_roots(roots: RootCertStore) -> anyhow::Result<Arc<ClientConfig>> {
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// TLS server name for `host`, which may be a DNS name or an IP address.
pub fn server_name(host: &str) -> anyhow::Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|error| anyhow::anyhow!("invalid TLS server name {host:?}: {error}"))
}

/// Server certificate verifier that accepts any certificate.
///
/// Handshake signatures are still checked, so the peer must hold the key of the certificate it
/// presents.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyServerCert {
    fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
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
    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    struct ServerCert {
        cert_der: CertificateDer<'static>,
        acceptor: TlsAcceptor,
    }

    fn server_cert() -> anyhow::Result<ServerCert> {
        use rcgen::{CertificateParams, KeyPair};
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ED25519)?;
        let params = CertificateParams::new(vec!["localhost".to_string()])?;
        let cert = params.self_signed(&key_pair)?;
        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key = rustls::pki_types::PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| anyhow::anyhow!("invalid private key: {e}"))?;
        let config = rustls::ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone()], key)?;
        Ok(ServerCert {
            cert_der,
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    async fn handshake(
        acceptor: TlsAcceptor,
        client_config: Arc<ClientConfig>,
    ) -> anyhow::Result<Vec<u8>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            // fails when the client rejects the certificate
            if let Ok(mut tls_stream) = acceptor.accept(stream).await {
                tls_stream.write_all(b"220 ok").await?;
                tls_stream.shutdown().await?;
            }
            anyhow::Ok(())
        });
        let stream = TcpStream::connect(addr).await?;
        let connector = TlsConnector::from(client_config);
        let result = async {
            let mut tls_stream = connector.connect(server_name("localhost")?, stream).await?;
            let mut buf = Vec::new();
            tls_stream.read_to_end(&mut buf).await?;
            anyhow::Ok(buf)
        }
        .await;
        server_task.await??;
        result
    }

    #[test]
    fn server_name_accepts_hosts_and_addresses() {
        assert!(server_name("ftp.example.com").is_ok());
        assert!(server_name("10.1.2.3").is_ok());
        assert!(server_name("not a host").is_err());
    }

    #[tokio::test]
    async fn skip_verify_accepts_self_signed() -> anyhow::Result<()> {
        let server = server_cert()?;
        let data = handshake(server.acceptor, client_config(true)?).await?;
        assert_eq!(data, b"220 ok");
        Ok(())
    }

    #[tokio::test]
    async fn default_config_rejects_self_signed() -> anyhow::Result<()> {
        let server = server_cert()?;
        let result = handshake(server.acceptor, client_config(false)?).await;
        let err = result.err().ok_or_else(|| anyhow::anyhow!("handshake should fail"))?;
        assert!(
            format!("{err:#}").to_lowercase().contains("certificate"),
            "expected certificate error, got: {err:#}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn trusted_root_is_verified() -> anyhow::Result<()> {
        let server = server_cert()?;
        let mut roots = RootCertStore::empty();
        roots.add(server.cert_der.clone())?;
        let data = handshake(server.acceptor, client_config_with_roots(roots)?).await?;
        assert_eq!(data, b"220 ok");
        Ok(())
    }
}
