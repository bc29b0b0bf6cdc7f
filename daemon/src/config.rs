//! Turns [`crate::cli::RawArgs`] into a validated, mode-specific configuration.
//! Every rejection here happens before any socket, file, or thread exists, per
//! the "config/usage errors print usage and exit before any side effects" rule.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;
use tunsock_common::fingerprint::{parse_fingerprint_set, Fingerprint, FingerprintError};
use tunsock_reactor::MAXBINDS;

use crate::cli::RawArgs;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("-V is only valid when dialing out with -r")]
    NoVerifyRequiresDial,
    #[error("-b cannot be combined with -r")]
    BindRequiresListen,
    #[error("a TLS certificate and key are required when listening with TLS")]
    MissingServerCert,
    #[error("a certificate and key are only used when listening with TLS")]
    CertKeyWithoutListenTls,
    #[error("at most {MAXBINDS} -b addresses are allowed")]
    TooManyBinds,
    #[error("invalid bind address {0:?}: {1}")]
    BadBindAddr(String, std::net::AddrParseError),
    #[error("invalid socket mode {0:?}: not an octal number")]
    BadMode(String),
    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),
}

#[derive(Debug)]
pub enum TcpRole {
    Listen { binds: Vec<SocketAddr> },
    Dial { host: String, port: u16 },
}

#[derive(Debug)]
pub struct TlsConfig {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub fingerprints: Vec<Fingerprint>,
    pub verify_peer: bool,
}

#[derive(Debug)]
pub struct Config {
    pub socket_path: PathBuf,
    pub port: u16,
    pub is_socket_client: bool,
    pub tcp: TcpRole,
    pub tls: Option<TlsConfig>,
    pub foreground: bool,
    pub group: Option<String>,
    pub socket_mode: u32,
    pub numeric_hosts: bool,
    pub pidfile: PathBuf,
    pub user: Option<String>,
    pub verbose: bool,
}

const DEFAULT_PIDFILE: &str = "/var/run/tunsockd.pid";
const DEFAULT_SOCKET_MODE: u32 = 0o600;

impl Config {
    pub fn from_raw(raw: RawArgs) -> Result<Self, ConfigError> {
        let tls_enabled =
            raw.tls || raw.ca_file.is_some() || raw.fingerprints.is_some() || raw.no_verify;

        if raw.no_verify && raw.remote_host.is_none() {
            return Err(ConfigError::NoVerifyRequiresDial);
        }
        if !raw.bind.is_empty() && raw.remote_host.is_some() {
            return Err(ConfigError::BindRequiresListen);
        }
        if raw.remote_host.is_some() && (raw.cert.is_some() || raw.key.is_some()) {
            return Err(ConfigError::CertKeyWithoutListenTls);
        }

        let tcp = match raw.remote_host {
            Some(host) => TcpRole::Dial { host, port: raw.port },
            None => {
                if raw.bind.len() > MAXBINDS {
                    return Err(ConfigError::TooManyBinds);
                }
                let mut binds = Vec::with_capacity(raw.bind.len().max(1));
                if raw.bind.is_empty() {
                    binds.push(format!("0.0.0.0:{}", raw.port).parse().unwrap());
                } else {
                    for b in &raw.bind {
                        let addr = format!("{b}:{}", raw.port);
                        binds.push(
                            addr.parse()
                                .map_err(|e| ConfigError::BadBindAddr(b.clone(), e))?,
                        );
                    }
                }
                TcpRole::Listen { binds }
            }
        };

        let tls = if tls_enabled {
            if matches!(tcp, TcpRole::Listen { .. }) && (raw.cert.is_none() || raw.key.is_none()) {
                return Err(ConfigError::MissingServerCert);
            }
            let fingerprints = match &raw.fingerprints {
                Some(s) => parse_fingerprint_set(s)?,
                None => Vec::new(),
            };
            Some(TlsConfig {
                cert: raw.cert.map(PathBuf::from),
                key: raw.key.map(PathBuf::from),
                ca_file: raw.ca_file.map(PathBuf::from),
                fingerprints,
                verify_peer: !raw.no_verify,
            })
        } else {
            None
        };

        let socket_mode = match &raw.mode {
            Some(m) => u32::from_str_radix(m, 8).map_err(|_| ConfigError::BadMode(m.clone()))?,
            None => DEFAULT_SOCKET_MODE,
        };

        Ok(Self {
            socket_path: PathBuf::from(raw.socket),
            port: raw.port,
            is_socket_client: raw.socket_client,
            tcp,
            tls,
            foreground: raw.foreground,
            group: raw.group,
            socket_mode,
            numeric_hosts: raw.numeric_hosts,
            pidfile: raw.pidfile.map(PathBuf::from).unwrap_or_else(|| DEFAULT_PIDFILE.into()),
            user: raw.user,
            verbose: raw.verbose,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(socket: &str, port: u16) -> RawArgs {
        RawArgs {
            ca_file: None,
            fingerprints: None,
            no_verify: false,
            bind: Vec::new(),
            socket_client: false,
            foreground: false,
            group: None,
            mode: None,
            numeric_hosts: false,
            pidfile: None,
            remote_host: None,
            tls: false,
            user: None,
            verbose: false,
            socket: socket.to_string(),
            port,
            cert: None,
            key: None,
        }
    }

    #[test]
    fn no_verify_without_dial_is_rejected() {
        let mut r = raw("/tmp/s", 9000);
        r.no_verify = true;
        assert!(matches!(
            Config::from_raw(r),
            Err(ConfigError::NoVerifyRequiresDial)
        ));
    }

    #[test]
    fn bind_with_dial_is_rejected() {
        let mut r = raw("/tmp/s", 9000);
        r.remote_host = Some("example.com".into());
        r.bind.push("127.0.0.1".into());
        assert!(matches!(
            Config::from_raw(r),
            Err(ConfigError::BindRequiresListen)
        ));
    }

    #[test]
    fn listening_tls_without_cert_is_rejected() {
        let mut r = raw("/tmp/s", 9000);
        r.tls = true;
        assert!(matches!(
            Config::from_raw(r),
            Err(ConfigError::MissingServerCert)
        ));
    }

    #[test]
    fn plain_listen_defaults_to_all_interfaces() {
        let r = raw("/tmp/s", 9000);
        let config = Config::from_raw(r).unwrap();
        match config.tcp {
            TcpRole::Listen { binds } => assert_eq!(binds.len(), 1),
            TcpRole::Dial { .. } => panic!("expected listen"),
        }
        assert_eq!(config.socket_mode, DEFAULT_SOCKET_MODE);
    }

    #[test]
    fn octal_mode_is_parsed() {
        let mut r = raw("/tmp/s", 9000);
        r.mode = Some("640".into());
        let config = Config::from_raw(r).unwrap();
        assert_eq!(config.socket_mode, 0o640);
    }
}
