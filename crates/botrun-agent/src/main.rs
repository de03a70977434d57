use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use botrun_config::{
    Account, Configuration, Proxy, Script, StaticWorldCatalog, WorldCatalog,
    persist::{self, DecodeContext},
};
use botrun_process::RunEvent;
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast;

mod client;
mod launcher;
mod monitor;
mod pids;
mod settings;

use client::JarClient;
use launcher::{LaunchOptions, Launcher};
use pids::SystemProcessTable;
use settings::Settings;

#[derive(Parser)]
#[command(name = "botrun")]
#[command(about = "Stores bot client run configurations and launches them", long_about = None)]
struct Cli {
    /// Store file, defaults to <BOTRUN_DATA_ROOT>/configurations.bin
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a configuration to the store
    New(NewArgs),

    /// Duplicate a stored configuration
    Copy {
        #[arg(short, long)]
        index: usize,
    },

    /// Delete a stored configuration
    Remove {
        #[arg(short, long)]
        index: usize,
    },

    /// List stored configurations
    Show,

    /// Run every script of a stored configuration, printing events as JSON lines
    Run {
        #[arg(short, long)]
        index: usize,
    },
}

#[derive(Args)]
struct NewArgs {
    /// user:password[:pin]
    #[arg(short, long)]
    account: String,

    /// id[:params], or local:file[:params] for a local script. Repeatable.
    #[arg(short, long = "script", required = true)]
    scripts: Vec<String>,

    /// Comma separated world pool (`m:` marks members worlds); defaults to BOTRUN_WORLDS
    #[arg(short, long)]
    worlds: Option<String>,

    /// ip:port or ip:port:user:password
    #[arg(short, long)]
    proxy: Option<String>,

    /// Client memory in MB
    #[arg(
        short,
        long,
        value_parser = clap::value_parser!(u32).range(0..=i64::from(Configuration::MAX_MEMORY))
    )]
    memory: Option<u32>,

    #[arg(long)]
    debug: bool,

    /// Fixed debug port; a free port is picked when omitted
    #[arg(long, requires = "debug")]
    debug_port: Option<u16>,

    #[arg(long)]
    collect_data: bool,

    #[arg(long)]
    low_cpu: bool,

    #[arg(long)]
    low_resource: bool,

    #[arg(long)]
    reflection: bool,

    #[arg(long)]
    no_randoms: bool,

    #[arg(long)]
    no_interface: bool,

    #[arg(long)]
    no_render: bool,

    #[arg(long)]
    dismiss_randoms: bool,

    #[arg(long)]
    new_mouse: bool,

    #[arg(long)]
    enable_breaks: bool,

    #[arg(long, requires = "enable_breaks")]
    stop_after_break: bool,

    #[arg(long)]
    mirror: bool,

    #[arg(long)]
    launch_game: bool,

    /// End each script's command when the client reports the script exited
    #[arg(long)]
    close_client: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env();
    let store = cli.store.clone().unwrap_or_else(|| settings.store_path());
    let catalog = settings.world_catalog()?;
    let ctx = DecodeContext {
        catalog: &catalog,
        logs_dir: &settings.logs_dir,
    };
    let mut configs = persist::open_store(&store, &ctx)?;
    tracing::debug!(store = %store.display(), count = configs.len(), "store loaded");

    match cli.command {
        Commands::New(args) => {
            let config = build_configuration(args, &settings, &catalog)?;
            config.ensure_log_file()?;
            println!("added configuration {} ({})", configs.len(), config.account);
            configs.push(config);
            persist::save(&store, &configs)?;
        }
        Commands::Copy { index } => {
            let copy = stored(&configs, index)?.copy();
            copy.ensure_log_file()?;
            println!("copied configuration {index} to {}", configs.len());
            configs.push(copy);
            persist::save(&store, &configs)?;
        }
        Commands::Remove { index } => {
            stored(&configs, index)?;
            let removed = configs.remove(index);
            println!("removed configuration {index} ({})", removed.account);
            persist::save(&store, &configs)?;
        }
        Commands::Show => {
            for (i, c) in configs.iter().enumerate() {
                let scripts: Vec<String> = c.scripts.iter().map(|s| s.to_string()).collect();
                let worlds: Vec<String> = c.worlds.iter().map(|w| w.number.to_string()).collect();
                println!("[{i}] {}", c.account);
                println!("    scripts: {}", scripts.join(", "));
                println!("    worlds:  {}", worlds.join(","));
                if let Some(proxy) = &c.proxy {
                    println!("    proxy:   {proxy}");
                }
                println!("    log:     {}", c.log_file().display());
            }
        }
        Commands::Run { index } => {
            let config = stored(&configs, index)?;
            let launcher = Launcher::new(
                Arc::new(JarClient::from_settings(&settings)),
                Arc::new(SystemProcessTable),
                LaunchOptions::from_settings(&settings),
            );
            run(&launcher, config).await?;
        }
    }

    Ok(())
}

fn stored(configs: &[Configuration], index: usize) -> anyhow::Result<&Configuration> {
    configs
        .get(index)
        .with_context(|| format!("no configuration at index {index} ({} stored)", configs.len()))
}

async fn run(launcher: &Launcher, config: &Configuration) -> anyhow::Result<()> {
    let mut events = config.run_state().subscribe_events();
    let handle = launcher.run(config)?;

    loop {
        tokio::select! {
            ev = events.recv() => match ev {
                Ok(ev) => {
                    println!("{}", serde_json::to_string(&ev)?);
                    if ev == RunEvent::RunCompleted {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event output fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            res = tokio::signal::ctrl_c() => {
                res.context("listen for ctrl-c")?;
                tracing::info!("interrupt received");
                launcher.stop(config);
            }
        }
    }

    handle.await.context("run task panicked")?;
    Ok(())
}

fn build_configuration(
    args: NewArgs,
    settings: &Settings,
    catalog: &dyn WorldCatalog,
) -> anyhow::Result<Configuration> {
    let account = parse_account(&args.account)?;
    let scripts = args
        .scripts
        .iter()
        .map(|s| parse_script(s).map(Arc::new))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut config = Configuration::new(Arc::new(account), scripts, &settings.logs_dir);
    config.worlds = match &args.worlds {
        Some(list) => StaticWorldCatalog::parse(list)?.worlds(),
        None => catalog.worlds(),
    };
    if config.worlds.is_empty() {
        anyhow::bail!("no worlds given; pass --worlds or set BOTRUN_WORLDS");
    }
    config.proxy = args.proxy.as_deref().map(parse_proxy).transpose()?;
    config.memory_allocation = args.memory;
    config.debug_mode = args.debug;
    config.debug_port = args.debug_port;
    config.collect_data = args.collect_data;
    config.low_cpu_mode = args.low_cpu;
    config.low_resource_mode = args.low_resource;
    config.reflection = args.reflection;
    config.no_randoms = args.no_randoms;
    config.no_interface = args.no_interface;
    config.no_render = args.no_render;
    config.dismiss_randoms = args.dismiss_randoms;
    config.new_mouse = args.new_mouse;
    config.enable_breaks = args.enable_breaks;
    config.stop_after_break = args.stop_after_break;
    config.mirror_mode = args.mirror;
    config.launch_game = args.launch_game;
    config.close_client = args.close_client;
    Ok(config)
}

fn parse_account(raw: &str) -> anyhow::Result<Account> {
    let mut parts = raw.splitn(3, ':');
    let (Some(user), Some(pass)) = (parts.next(), parts.next()) else {
        anyhow::bail!("account must be user:password[:pin]");
    };
    if user.is_empty() {
        anyhow::bail!("account username is empty");
    }
    let mut account = Account::new(user, pass);
    if let Some(pin) = parts.next() {
        let pin: u16 = pin
            .parse()
            .ok()
            .filter(|p| *p <= 9999)
            .with_context(|| format!("invalid bank pin: {pin}"))?;
        account.pin = Some(pin);
    }
    Ok(account)
}

fn parse_script(raw: &str) -> anyhow::Result<Script> {
    let (is_local, rest) = match raw.strip_prefix("local:") {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let (id, params) = rest.split_once(':').unwrap_or((rest, ""));
    if id.is_empty() {
        anyhow::bail!("script identifier is empty: {raw}");
    }
    Ok(Script::new(id, params, is_local))
}

fn parse_proxy(raw: &str) -> anyhow::Result<Proxy> {
    let parts: Vec<&str> = raw.split(':').collect();
    let port = |p: &str| -> anyhow::Result<u16> {
        p.parse().with_context(|| format!("invalid proxy port: {p}"))
    };
    match parts.as_slice() {
        [ip, p] => Ok(Proxy::basic(*ip, port(p)?)),
        [ip, p, user, pass] => Ok(Proxy::authenticated(*ip, port(p)?, *user, *pass)),
        _ => anyhow::bail!("proxy must be ip:port or ip:port:user:password"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_with_and_without_pin() {
        let a = parse_account("alice:hunter2").unwrap();
        assert_eq!((a.username.as_str(), a.password.as_str(), a.pin), ("alice", "hunter2", None));

        let a = parse_account("bob:pw:0042").unwrap();
        assert_eq!(a.pin, Some(42));

        assert!(parse_account("nopassword").is_err());
        assert!(parse_account("bob:pw:12345").is_err());
    }

    #[test]
    fn scripts_split_identifier_and_params() {
        let s = parse_script("Woodcutter:oak trees").unwrap();
        assert_eq!((s.identifier.as_str(), s.parameters.as_str(), s.is_local), ("Woodcutter", "oak trees", false));

        let s = parse_script("local:miner.jar").unwrap();
        assert_eq!((s.identifier.as_str(), s.parameters.as_str(), s.is_local), ("miner.jar", "", true));

        assert!(parse_script(":x").is_err());
    }

    #[test]
    fn proxy_forms() {
        assert_eq!(parse_proxy("1.2.3.4:8080").unwrap(), Proxy::basic("1.2.3.4", 8080));
        assert_eq!(
            parse_proxy("1.2.3.4:8080:u:p").unwrap(),
            Proxy::authenticated("1.2.3.4", 8080, "u", "p")
        );
        assert!(parse_proxy("1.2.3.4").is_err());
        assert!(parse_proxy("1.2.3.4:http").is_err());
    }

    #[test]
    fn cli_parses_new_with_repeated_scripts() {
        let cli = Cli::try_parse_from([
            "botrun", "new", "-a", "alice:pw", "-s", "One", "-s", "local:two.jar", "--worlds", "301,m:302",
            "--debug", "--debug-port", "5005",
        ])
        .unwrap();
        let Commands::New(args) = cli.command else {
            panic!("expected new");
        };
        assert_eq!(args.scripts.len(), 2);
        assert_eq!(args.debug_port, Some(5005));

        assert!(Cli::try_parse_from(["botrun", "new", "-a", "a:b", "-s", "x", "--debug-port", "1"]).is_err());
        assert!(Cli::try_parse_from(["botrun", "new", "-a", "a:b", "-s", "x", "-m", "3000000000"]).is_err());
    }
}
