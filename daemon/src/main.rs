//! Entry point: parse arguments, validate them into a [`Config`], then wire
//! every piece (reactor, local socket, TCP/TLS side, worker pool, privilege
//! drop, daemonization) together before handing control to the reactor loop.

mod cli;
mod config;
mod daemonize;
mod dial;
mod listen;
mod logging;
mod pidfile;

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::process::ExitCode;
use std::rc::Rc;

use log::info;
use thiserror::Error;
use tunsock_proto::tls::TlsConfigError;
use tunsock_proto::{LocalDialer, Role, ServerListenerIo, TunnelSlot, DATA_HEADER_LEN};
use tunsock_reactor::privilege::{drop_privileges, resolve_group, resolve_user};
use tunsock_reactor::{IoHandler, Mode, Reactor, ReactorError, Server};
use tunsock_workers::{PoolResolver, WorkerPool, DEFAULT_POOL_SIZE, DEFAULT_QUEUE_SIZE};

use config::{Config, ConfigError, TcpRole};
use daemonize::DaemonizeError;
use dial::UnixDialer;
use listen::TlsRole;
use pidfile::{PidFile, PidFileError};

#[derive(Debug, Error)]
enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    PidFile(#[from] PidFileError),
    #[error(transparent)]
    Daemonize(#[from] DaemonizeError),
    #[error(transparent)]
    Tls(#[from] TlsConfigError),
    #[error(transparent)]
    Reactor(#[from] ReactorError),
    #[error("chowning {path}: {source}")]
    Chown { path: String, #[source] source: nix::Error },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn main() -> ExitCode {
    let raw = cli::parse();
    let config = match Config::from_raw(raw) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tunsockd: {e}");
            return ExitCode::FAILURE;
        }
    };

    logging::init(config.verbose);

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("tunsockd: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Forwards a worker pool pipe fd's readiness into
/// [`WorkerPool::on_pipe_readable`]; the pool itself decides whether that
/// means a finished job or a dead thread to restart.
struct PoolPipeIo {
    pool: Rc<RefCell<WorkerPool>>,
    fd: RawFd,
}

impl IoHandler for PoolPipeIo {
    fn on_readable(&mut self) {
        self.pool.borrow_mut().on_pipe_readable(self.fd);
    }
}

/// Binds the domain socket, registers its [`ServerListenerIo`] with the
/// reactor, and chowns it if `-g` was given. Returns the shared slot the TCP
/// side publishes its live tunnel into.
fn setup_local_server(
    config: &Config,
    reactor: &Rc<RefCell<Reactor>>,
) -> Result<TunnelSlot, DaemonError> {
    let server = Rc::new(RefCell::new(Server::bind_unix(
        &config.socket_path,
        config.socket_mode,
        DATA_HEADER_LEN,
        Mode::Wait,
    )?));

    if let Some(group) = &config.group {
        let group = resolve_group(group)?;
        nix::unistd::chown(&config.socket_path, None, Some(group.gid)).map_err(|source| {
            DaemonError::Chown {
                path: config.socket_path.display().to_string(),
                source,
            }
        })?;
    }

    let tunnel_slot: TunnelSlot = Rc::new(RefCell::new(None));
    let handler = Rc::new(RefCell::new(ServerListenerIo::new(
        server,
        tunnel_slot.clone(),
        reactor.clone(),
    )));
    let mut reactor_mut = reactor.borrow_mut();
    for fd in handler.borrow().listener_fds() {
        reactor_mut.register(fd, handler.clone());
        reactor_mut.register_read(fd);
    }
    Ok(tunnel_slot)
}

/// Spins up a worker pool and registers its pipe fds and tick handler with
/// the reactor, for reverse-DNS lookups on accepted TCP connections. Only
/// built when listening without `-n`; a dialing side already knows its
/// remote's hostname, and `-n` asks to skip this entirely.
fn setup_resolver(
    reactor: &Rc<RefCell<Reactor>>,
) -> Result<(Rc<RefCell<WorkerPool>>, Rc<RefCell<PoolResolver>>), DaemonError> {
    let pool = Rc::new(RefCell::new(WorkerPool::new(DEFAULT_POOL_SIZE, DEFAULT_QUEUE_SIZE)?));

    let mut reactor_mut = reactor.borrow_mut();
    for fd in pool.borrow().pipe_fds() {
        let handler = Rc::new(RefCell::new(PoolPipeIo { pool: pool.clone(), fd }));
        reactor_mut.register(fd, handler);
        reactor_mut.register_read(fd);
    }
    let tick_pool = pool.clone();
    reactor_mut.tick.register(move |_| {
        tick_pool.borrow_mut().on_tick();
    });
    drop(reactor_mut);

    let resolver = Rc::new(RefCell::new(PoolResolver::new(pool.clone())));
    Ok((pool, resolver))
}

fn build_tls_role(config: &Config) -> Result<TlsRole, DaemonError> {
    let Some(tls) = &config.tls else {
        return Ok(TlsRole::Plain);
    };
    match &config.tcp {
        TcpRole::Listen { .. } => {
            let cert = tls.cert.as_deref().expect("validated present for listening TLS");
            let key = tls.key.as_deref().expect("validated present for listening TLS");
            let fingerprints = if tls.fingerprints.is_empty() {
                None
            } else {
                Some(tls.fingerprints.as_slice())
            };
            let server_config = tunsock_proto::tls::build_server_config(
                cert,
                key,
                tls.ca_file.as_deref(),
                fingerprints,
            )?;
            Ok(TlsRole::Server(server_config))
        }
        TcpRole::Dial { .. } => {
            Ok(TlsRole::Client(tunsock_proto::tls::build_client_config(tls.verify_peer)))
        }
    }
}

fn run(config: Config) -> Result<(), DaemonError> {
    let mut pidfile = PidFile::acquire(&config.pidfile)?;
    let reactor = Rc::new(RefCell::new(Reactor::new()?));

    let is_socket_server = !config.is_socket_client;
    let own_role = if is_socket_server { Role::Server } else { Role::Client };

    let (dialer, tunnel_slot): (Option<Rc<RefCell<dyn LocalDialer>>>, Option<TunnelSlot>) =
        if is_socket_server {
            (None, Some(setup_local_server(&config, &reactor)?))
        } else {
            let dialer: Rc<RefCell<dyn LocalDialer>> =
                Rc::new(RefCell::new(UnixDialer::new(config.socket_path.clone())));
            (Some(dialer), None)
        };

    let tls_role = build_tls_role(&config)?;

    let wants_resolver = !config.numeric_hosts && matches!(config.tcp, TcpRole::Listen { .. });
    let (worker_pool, resolver) = if wants_resolver {
        let (pool, resolver) = setup_resolver(&reactor)?;
        (Some(pool), Some(resolver))
    } else {
        (None, None)
    };

    match config.tcp {
        TcpRole::Listen { ref binds } => listen::setup_listen(
            &reactor,
            binds,
            tls_role,
            own_role,
            is_socket_server,
            dialer,
            tunnel_slot,
            resolver,
            config.numeric_hosts,
        )?,
        TcpRole::Dial { ref host, port } => listen::setup_dial(
            &reactor,
            host.clone(),
            port,
            tls_role,
            own_role,
            is_socket_server,
            dialer,
            tunnel_slot,
        ),
    }

    if let Some(user_spec) = &config.user {
        let user = resolve_user(user_spec)?;
        drop_privileges(&user, Some(pidfile.path()))?;
    }

    if !config.foreground {
        daemonize::daemonize()?;
        pidfile.rewrite_pid()?;
    }

    reactor.borrow_mut().set_tick_interval(5000);

    info!("tunsockd running");
    reactor.borrow_mut().run()?;

    if let Some(pool) = worker_pool {
        pool.borrow_mut().shutdown();
    }

    Ok(())
}
