//! Command-line surface, parsed with `argh` for declarative, macro-light flag
//! definitions. This module only captures the raw flags; [`crate::config`]
//! turns them into a validated, mode-specific configuration.

use argh::FromArgs;

#[derive(FromArgs, Debug)]
/// tunnel a local domain socket over one TCP/TLS connection
pub struct RawArgs {
    /// CA file for verifying inbound client certs (listening); implies TLS
    #[argh(option, short = 'C')]
    pub ca_file: Option<String>,

    /// required SHA-512 fingerprint set for inbound client certs, colon-separated; implies TLS
    #[argh(option, short = 'H')]
    pub fingerprints: Option<String>,

    /// disable peer cert verification (dialing side only); implies TLS
    #[argh(switch, short = 'V')]
    pub no_verify: bool,

    /// bind address when listening; repeatable up to MAXBINDS
    #[argh(option, short = 'b')]
    pub bind: Vec<String>,

    /// operate as socket-client (dial the filesystem socket per remote client)
    #[argh(switch, short = 'c')]
    pub socket_client: bool,

    /// run in the foreground instead of daemonizing
    #[argh(switch, short = 'f')]
    pub foreground: bool,

    /// filesystem-socket group, name or numeric
    #[argh(option, short = 'g')]
    pub group: Option<String>,

    /// octal mode for the filesystem socket (default 0600)
    #[argh(option, short = 'm')]
    pub mode: Option<String>,

    /// numeric hosts: skip reverse DNS on TCP peers
    #[argh(switch, short = 'n')]
    pub numeric_hosts: bool,

    /// PID file path
    #[argh(option, short = 'p')]
    pub pidfile: Option<String>,

    /// dial this TCP host instead of listening
    #[argh(option, short = 'r')]
    pub remote_host: Option<String>,

    /// enable TLS
    #[argh(switch, short = 't')]
    pub tls: bool,

    /// drop privileges to this user, name or numeric, after binding
    #[argh(option, short = 'u')]
    pub user: Option<String>,

    /// verbose (debug) logging
    #[argh(switch, short = 'v')]
    pub verbose: bool,

    /// filesystem domain socket path
    #[argh(positional)]
    pub socket: String,

    /// TCP port
    #[argh(positional)]
    pub port: u16,

    /// TLS server certificate (listening with TLS only)
    #[argh(positional)]
    pub cert: Option<String>,

    /// TLS server private key (listening with TLS only)
    #[argh(positional)]
    pub key: Option<String>,
}

pub fn parse() -> RawArgs {
    argh::from_env()
}
