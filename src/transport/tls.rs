//! rustls client configuration from PEM files

use crate::error::MqttError;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

/// Trust `ca_file`, optionally presenting a client certificate
pub fn build_client_config(
    ca_file: &Path,
    cert_file: Option<&Path>,
    key_file: Option<&Path>,
) -> Result<ClientConfig, MqttError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_file)? {
        roots
            .add(cert)
            .map_err(|e| MqttError::Tls(format!("invalid CA certificate: {e}")))?;
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    match (cert_file, key_file) {
        (Some(cert_file), Some(key_file)) => {
            let chain = load_certs(cert_file)?;
            let key = load_private_key(key_file)?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| MqttError::Tls(format!("invalid client certificate: {e}")))
        }
        _ => Ok(builder.with_no_client_auth()),
    }
}

/// SNI / verification name for the broker host
pub fn server_name(host: &str) -> Result<ServerName<'static>, MqttError> {
    ServerName::try_from(host)
        .map(|name| name.to_owned())
        .map_err(|_| MqttError::Tls(format!("invalid server name: {host}")))
}

fn open(path: &Path) -> Result<BufReader<File>, MqttError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| MqttError::Tls(format!("cannot open {}: {e}", path.display())))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, MqttError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| MqttError::Tls(format!("cannot parse {}: {e}", path.display())))?;

    if certs.is_empty() {
        return Err(MqttError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, MqttError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| MqttError::Tls(format!("cannot parse {}: {e}", path.display())))?
        .ok_or_else(|| MqttError::Tls(format!("no private key found in {}", path.display())))
}
