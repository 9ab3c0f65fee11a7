use clap::Parser;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use tunguard::{Config, Mode, RuntimeDir, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "tunguard")]
#[command(about = "Self-healing SSH tunnel with default-gateway failover")]
#[command(version, disable_version_flag = true)]
struct Cli {
    /// Seconds between supervision cycles (overrides the config file)
    #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..))]
    frequency: Option<u64>,

    /// light: only fail back on a broken tunnel; full: also build and repair it
    #[arg(short, long, value_enum)]
    mode: Mode,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long)]
    verbose: bool,

    /// Print version
    #[arg(short = 'V', long, short_alias = 'v', action = clap::ArgAction::Version)]
    version: Option<bool>,
}

#[derive(Error, Debug)]
enum StartupError {
    #[error("tunguard must run as root")]
    NotPrivileged,
}

#[cfg(unix)]
fn check_privileges() -> Result<(), StartupError> {
    if nix::unistd::geteuid().is_root() {
        Ok(())
    } else {
        Err(StartupError::NotPrivileged)
    }
}

#[cfg(not(unix))]
fn check_privileges() -> Result<(), StartupError> {
    Err(StartupError::NotPrivileged)
}

/// Resolve once Ctrl-C or SIGTERM arrives; `false` if neither can be received
async fn wait_for_signal() -> bool {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Cannot listen for Ctrl-C: {}", e);
                false
            }
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::pin!(ctrl_c);
                tokio::select! {
                    received = &mut ctrl_c => received || term.recv().await.is_some(),
                    received = term.recv() => received.is_some(),
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                ctrl_c.await
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await
    }
}

/// Flip `tx` once `signal` reports a delivered signal
///
/// Without any signal source the sender is held forever so the loop keeps
/// running instead of seeing a closed channel.
async fn forward_shutdown<F>(signal: F, tx: watch::Sender<bool>)
where
    F: std::future::Future<Output = bool>,
{
    if signal.await {
        info!("Shutdown requested, finishing current cycle");
        let _ = tx.send(true);
    } else {
        warn!("No shutdown signal available; stop the process with SIGKILL");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Err(e) = check_privileges() {
        error!("{}", e);
        std::process::exit(1);
    }

    let mut config = match Config::discover(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    if let Some(frequency) = cli.frequency {
        config.supervisor.frequency_secs = frequency;
    }

    let runtime = RuntimeDir::new(&config.supervisor.runtime_dir);
    if let Err(e) = runtime.ensure() {
        error!("{}", e);
        std::process::exit(1);
    }

    let routes = tunguard::platform::get_route_table()?;
    let probe = tunguard::platform::get_network_probe()?;
    let transport = tunguard::tunnel::get_transport(&config.tunnel)?;

    info!(
        "tunguard {} starting in {} mode, gateway {}, remote {}",
        env!("CARGO_PKG_VERSION"),
        cli.mode,
        config.network.gateway,
        config.tunnel.remote_host
    );

    let (tx, rx) = watch::channel(false);
    tokio::spawn(forward_shutdown(wait_for_signal(), tx));

    let mut supervisor = Supervisor::new(&config, cli.mode, routes, probe, transport);
    supervisor.run(rx).await;

    info!("tunguard stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;
    use std::time::Duration;

    #[test]
    fn test_parse_full_invocation() {
        let cli = Cli::try_parse_from(["tunguard", "-m", "full", "-f", "30", "-c", "/tmp/x.toml"])
            .unwrap();
        assert_eq!(cli.mode, Mode::Full);
        assert_eq!(cli.frequency, Some(30));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/x.toml")));
        assert!(!cli.verbose);
    }

    #[test]
    fn test_mode_is_required() {
        let err = Cli::try_parse_from(["tunguard"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let err = Cli::try_parse_from(["tunguard", "-m", "invalid"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }

    #[test]
    fn test_zero_frequency_rejected() {
        let err = Cli::try_parse_from(["tunguard", "-m", "light", "-f", "0"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }

    #[test]
    fn test_version_flags() {
        for flag in ["-V", "-v", "--version"] {
            let err = Cli::try_parse_from(["tunguard", flag]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::DisplayVersion);
        }
    }

    #[tokio::test]
    async fn test_delivered_signal_requests_shutdown() {
        let (tx, rx) = watch::channel(false);
        forward_shutdown(async { true }, tx).await;
        assert!(*rx.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_signal_setup_keeps_running() {
        let (tx, mut rx) = watch::channel(false);
        let forward = tokio::spawn(forward_shutdown(async { false }, tx));

        let changed = tokio::time::timeout(Duration::from_secs(3600), rx.changed()).await;

        // Neither a shutdown request nor a closed channel
        assert!(changed.is_err());
        assert!(!*rx.borrow());
        forward.abort();
    }

    #[test]
    fn test_verbose_is_long_only() {
        let cli = Cli::try_parse_from(["tunguard", "-m", "light", "--verbose"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.mode, Mode::Light);
    }
}
