//! TLS client material for TLS and DoH upstreams.

use dnsteer_domain::{ForwardError, TlsConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::net::SocketAddr;
use std::sync::Arc;

fn load_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>, ForwardError> {
    let pem = std::fs::read(path)
        .map_err(|e| ForwardError::Config(format!("tls: cannot read {}: {}", path.display(), e)))?;
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ForwardError::Config(format!("tls: bad certificate in {}: {}", path.display(), e)))
}

fn load_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>, ForwardError> {
    let pem = std::fs::read(path)
        .map_err(|e| ForwardError::Config(format!("tls: cannot read {}: {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| ForwardError::Config(format!("tls: bad key in {}: {}", path.display(), e)))?
        .ok_or_else(|| ForwardError::Config(format!("tls: no private key in {}", path.display())))
}

/// Builds the shared rustls client config. Without explicit material this
/// is webpki roots and no client auth; `ca_cert` replaces the root store,
/// `client_cert`/`client_key` enable mutual TLS.
pub fn build_client_config(tls: Option<&TlsConfig>) -> Result<Arc<rustls::ClientConfig>, ForwardError> {
    let mut roots = rustls::RootCertStore::empty();
    match tls.and_then(|t| t.ca_cert.as_deref()) {
        Some(path) => {
            for cert in load_certs(path)? {
                roots.add(cert).map_err(|e| {
                    ForwardError::Config(format!("tls: cannot add CA from {}: {}", path.display(), e))
                })?;
            }
        }
        None => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);

    let config = match tls {
        Some(TlsConfig {
            client_cert: Some(cert_path),
            client_key: Some(key_path),
            ..
        }) => {
            let certs = load_certs(cert_path)?;
            let key = load_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ForwardError::Config(format!("tls: client auth: {}", e)))?
        }
        Some(TlsConfig {
            client_cert: Some(_),
            client_key: None,
            ..
        })
        | Some(TlsConfig {
            client_cert: None,
            client_key: Some(_),
            ..
        }) => {
            return Err(ForwardError::Config(
                "tls: client_cert and client_key must be given together".into(),
            ))
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

/// SNI for a TLS upstream: the configured server name when present, the
/// endpoint IP otherwise.
pub fn server_name_for(
    server_name: Option<&str>,
    addr: SocketAddr,
) -> Result<ServerName<'static>, ForwardError> {
    match server_name {
        Some(name) => ServerName::try_from(name.to_string())
            .map_err(|e| ForwardError::Config(format!("invalid TLS server name {:?}: {}", name, e))),
        None => Ok(ServerName::IpAddress(addr.ip().into())),
    }
}
