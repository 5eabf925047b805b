use stackgate::config::Config;
use stackgate::error::{ProxyError, ServiceError};
use stackgate::lifecycle::{LifecycleState, ServiceSupervisor};
use stackgate::proxy::ProxySupervisor;
use stackgate::routes::{RouteTable, RouteTableBuilder};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_CONFIG_PATH: &str = "stackgate.toml";

const USAGE: &str = "\
Usage: stackgate [CONFIG] [OPTIONS] [status]

  CONFIG                 Path to a TOML config file (default: stackgate.toml, optional)
  --debug                Verbose logging for stackgate, the platform CLI and the proxy
  --force-restart        Restart the platform even if it is already running
  --proxy-host <HOST>    Base domain the route subdomains are built on
  --proxy-port <PORT>    Single proxy listen port
  --server-host <HOST>   Host of the local application server
  --server-port <PORT>   Port of the local application server
  status                 Print discovered endpoints and routes as JSON, then exit
";

#[derive(Debug, Default, PartialEq)]
struct CliArgs {
    config_path: Option<PathBuf>,
    debug: bool,
    force_restart: bool,
    status_only: bool,
    help: bool,
    proxy_host: Option<String>,
    proxy_port: Option<u16>,
    server_host: Option<String>,
    server_port: Option<u16>,
}

impl CliArgs {
    fn parse<I: IntoIterator<Item = String>>(args: I) -> anyhow::Result<Self> {
        let mut parsed = CliArgs::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--debug" => parsed.debug = true,
                "--force-restart" => parsed.force_restart = true,
                "--proxy-host" => parsed.proxy_host = Some(option_value(&arg, args.next())?),
                "--proxy-port" => parsed.proxy_port = Some(port_value(&arg, args.next())?),
                "--server-host" => parsed.server_host = Some(option_value(&arg, args.next())?),
                "--server-port" => parsed.server_port = Some(port_value(&arg, args.next())?),
                "-h" | "--help" => parsed.help = true,
                "status" => parsed.status_only = true,
                flag if flag.starts_with('-') => anyhow::bail!("Unknown option: {}", flag),
                path => {
                    if parsed.config_path.is_some() {
                        anyhow::bail!("Unexpected argument: {}", path);
                    }
                    parsed.config_path = Some(PathBuf::from(path));
                }
            }
        }
        Ok(parsed)
    }
}

fn option_value(flag: &str, value: Option<String>) -> anyhow::Result<String> {
    match value {
        Some(value) if !value.starts_with('-') => Ok(value),
        _ => anyhow::bail!("{} requires a value", flag),
    }
}

fn port_value(flag: &str, value: Option<String>) -> anyhow::Result<u16> {
    let value = option_value(flag, value)?;
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("{} expects a port number, got '{}'", flag, value))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match CliArgs::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}: {}\n\n{}", PKG_NAME, e, USAGE);
            return ExitCode::from(64);
        }
    };
    if args.help {
        print!("{}", USAGE);
        return ExitCode::SUCCESS;
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: failed to load configuration: {:#}", PKG_NAME, e);
            return ExitCode::from(78);
        }
    };

    init_logging(config.debug);

    let result = if args.status_only {
        print_status(&config).await
    } else {
        run(config).await
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let message = format!("{:#}", e);
            error!(error = %message, "Exiting");
            exit_code_for(&e)
        }
    }
}

/// Defaults, then the config file, then `STACKGATE_*`, then command-line flags
fn load_config(args: &CliArgs) -> anyhow::Result<Config> {
    let mut config = match &args.config_path {
        Some(path) => Config::load(path)?,
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default_path.exists() {
                Config::load(&default_path)?
            } else {
                Config::default()
            }
        }
    };

    config.apply_env_overrides(|key| std::env::var(key).ok())?;

    if args.debug {
        config.debug = true;
    }
    if args.force_restart {
        config.platform.force_restart = true;
    }
    if let Some(ref host) = args.proxy_host {
        config.proxy.host = host.clone();
    }
    if let Some(port) = args.proxy_port {
        config.proxy.ports = vec![port];
    }
    if let Some(ref host) = args.server_host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.server_port {
        config.server.port = port;
    }

    config.validate()?;
    Ok(config)
}

fn init_logging(debug: bool) {
    let directive = if debug { "stackgate=debug" } else { "stackgate=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().expect("valid log directive"))
                .add_directive("proxy=info".parse().expect("valid log directive")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn exit_code_for(e: &anyhow::Error) -> ExitCode {
    if let Some(e) = e.downcast_ref::<ServiceError>() {
        return e.exit_code();
    }
    if let Some(e) = e.downcast_ref::<ProxyError>() {
        return e.exit_code();
    }
    ExitCode::FAILURE
}

async fn run(config: Config) -> anyhow::Result<()> {
    print_startup_banner(&config);

    let platform = ServiceSupervisor::new(config.platform.clone(), config.debug);
    let mut proxy = ProxySupervisor::new(config.proxy.clone());

    start_platform(&platform, config.platform.force_restart).await?;

    info!("Creating proxy routes");
    let status = platform.get_status().await?;
    let routes = RouteTableBuilder::new(&config.proxy.host, &config.server).build(&status);

    if let Err(e) = proxy.setup_and_start(&routes, config.debug).await {
        error!(error = %e, "Failed to set up and start the proxy");
        return Err(e.into());
    }
    info!("Proxy routes are set up and running");
    log_routes(&config, &routes);

    wait_for_shutdown().await;

    proxy.stop().await;
    info!("Shutdown complete");
    Ok(())
}

async fn start_platform(platform: &ServiceSupervisor, force_restart: bool) -> anyhow::Result<()> {
    info!("Starting the platform");

    if platform.is_running().await && !force_restart {
        info!("Platform services are running");
        return Ok(());
    }

    let start_result = platform.initialize_and_start(force_restart).await;
    if let Err(ref e) = start_result {
        error!(error = %e, "Failed to initialize and start the platform");
    }

    if !platform.is_running().await {
        error!("Platform services are not running after initialization");
        return match start_result {
            Err(e) => Err(e.into()),
            Ok(()) => Err(anyhow::anyhow!("Platform services are not running after initialization")),
        };
    }

    if start_result.is_err() {
        warn!("Platform reported an error during startup but is running, continuing");
    }
    info!("Platform services are running");
    Ok(())
}

fn log_routes(config: &Config, routes: &RouteTable) {
    let listen = config
        .proxy
        .ports
        .iter()
        .map(|p| format!("{}:{}", config.proxy.host, p))
        .collect::<Vec<_>>()
        .join(", ");
    info!("Proxy routes and their endpoints:");
    for route in routes.routes() {
        info!(
            "{}: {} -> {} -> {}",
            route.label, listen, route.subdomain, route.upstream
        );
    }
}

async fn print_status(config: &Config) -> anyhow::Result<()> {
    let platform = ServiceSupervisor::new(config.platform.clone(), config.debug);
    let state = platform.state().await;
    let status = if state == LifecycleState::Running {
        platform.get_status().await?
    } else {
        Default::default()
    };
    let routes = RouteTableBuilder::new(&config.proxy.host, &config.server).build(&status);

    let report = serde_json::json!({
        "state": state,
        "status": status,
        "routes": routes.iter().map(|(key, route)| serde_json::json!({
            "key": key,
            "subdomain": route.subdomain,
            "upstream": route.upstream,
            "name": route.label,
        })).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting local stack");
    if config.debug {
        info!("Debug mode enabled");
    }
    info!(
        cli = %config.platform.cli,
        workdir = %config.platform.workdir.display(),
        force_restart = config.platform.force_restart,
        startup_timeout_secs = config.platform.startup_timeout_secs,
        "Platform settings"
    );
    info!(
        binary = %config.proxy.binary,
        host = %config.proxy.host,
        ports = ?config.proxy.ports,
        config_path = %config.proxy.config_path.display(),
        "Proxy settings"
    );
    info!(
        host = %config.server.host,
        port = config.server.port,
        "Application server"
    );
}
