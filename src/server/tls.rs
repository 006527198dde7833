use crate::{
    errors::ErrorKind,
    limits::{TlsConfig, TlsVersion},
};
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    ServerConfig, SupportedProtocolVersion,
};
use rustls_pemfile::{certs, private_key};
use std::{fs::File, io::BufReader, path::Path, sync::Arc};
use tokio_rustls::TlsAcceptor;
use tracing::info;

fn open(path: &Path) -> Result<BufReader<File>, ErrorKind> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|err| ErrorKind::Config(format!("cannot open {}: {err}", path.display())))
}

/// Reads the certificate chain and private key named by `config`.
pub(crate) fn load_pem(
    config: &TlsConfig,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ErrorKind> {
    let chain = certs(&mut open(&config.cert)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| ErrorKind::Config(format!("bad certificate {}: {err}", config.cert.display())))?;

    if chain.is_empty() {
        return Err(ErrorKind::Config(format!(
            "no certificate in {}",
            config.cert.display()
        )));
    }

    let key = private_key(&mut open(&config.key)?)
        .map_err(|err| ErrorKind::Config(format!("bad private key {}: {err}", config.key.display())))?
        .ok_or_else(|| ErrorKind::Config(format!("no private key in {}", config.key.display())))?;

    Ok((chain, key))
}

#[inline]
fn versions(min: TlsVersion) -> &'static [&'static SupportedProtocolVersion] {
    static ALL: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13, &rustls::version::TLS12];
    static ONLY_13: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

    match min {
        TlsVersion::Tls12 => ALL,
        TlsVersion::Tls13 => ONLY_13,
    }
}

/// Builds the acceptor used by TLS listeners, advertising `http/1.1`.
pub(crate) fn acceptor(config: &TlsConfig) -> Result<TlsAcceptor, ErrorKind> {
    let (chain, key) = load_pem(config)?;

    let mut server_config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_protocol_versions(versions(config.min_version))?
            .with_no_client_auth()
            .with_single_cert(chain, key)?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    info!(
        "tls ready with {} (minimum {:?})",
        config.cert.display(),
        config.min_version
    );
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config(cert: &[u8], key: &[u8]) -> (tempfile::TempDir, TlsConfig) {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");

        File::create(&cert_path).unwrap().write_all(cert).unwrap();
        File::create(&key_path).unwrap().write_all(key).unwrap();

        let config = TlsConfig::new(cert_path, key_path);
        (dir, config)
    }

    #[test]
    fn rejects_missing_material() {
        let missing = TlsConfig::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(matches!(acceptor(&missing), Err(ErrorKind::Config(_))));

        let (_dir, empty) = config(b"", b"");
        match load_pem(&empty) {
            Err(ErrorKind::Config(message)) => assert!(message.starts_with("no certificate")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn self_signed_acceptor() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let (_dir, config) = config(
            cert.serialize_pem().unwrap().as_bytes(),
            cert.serialize_private_key_pem().as_bytes(),
        );

        let (chain, _) = load_pem(&config).unwrap();
        assert_eq!(chain.len(), 1);
        assert!(acceptor(&config).is_ok());
    }

    #[test]
    fn version_floor() {
        assert_eq!(versions(TlsVersion::Tls12).len(), 2);
        assert!(versions(TlsVersion::Tls13)
            .iter()
            .all(|v| v.version == rustls::ProtocolVersion::TLSv1_3));
    }
}
