use clap::Parser;
use config::Config;
use flume::bounded;
use memwatch::{
    cli::{Cli, Command, WatchArgs},
    demo::{Workload, apply_overrides},
    signals::{SignalEvent, wait_for_signal},
    summary::Summary,
};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, info, trace};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // NOTE: The verbosity flag takes precedence over the environment variable
    // for log control. For example, `MEMWATCH_LOG=warn memwatch -vvv watch`
    // will still log at the trace level. The environment variable
    // (`MEMWATCH_LOG`) can only set the log level per crate, e.g.
    // `MEMWATCH_LOG=watcher=warn memwatch -vvv watch`.
    let env_filter = EnvFilter::builder()
        .with_env_var("MEMWATCH_LOG")
        .from_env()?
        .add_directive(cli.verbosity.log_level_filter().as_str().parse()?);

    let layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .init();

    match &cli.command {
        Command::Summarize { log } => {
            let summary = Summary::load(log)?;
            let mut stdout = std::io::stdout().lock();
            serde_json::to_writer_pretty(&mut stdout, &summary)?;
            writeln!(stdout)?;
            Ok(())
        }
        Command::Watch(args) => {
            let mut config = load_config(cli.conffile.as_ref())?;
            apply_overrides(&mut config, args);
            debug!(?config, ?cli);
            watch(config, args).await
        }
    }
}

fn load_config(conffile: Option<&PathBuf>) -> anyhow::Result<Config> {
    let config = match conffile {
        Some(path) => Config::load_with_env(path)?,
        _ => {
            let mut candidates = glob::glob("/etc/memwatch/config.d/*.toml")?
                .filter_map(Result::ok)
                .collect::<Vec<_>>();
            candidates.insert(0, "/etc/memwatch/config.toml".into());
            trace!(?candidates, "config file candidates");
            Config::load_multiple(candidates)?
        }
    };
    Ok(config)
}

async fn watch(config: Config, args: &WatchArgs) -> anyhow::Result<()> {
    // install signal handlers before the watcher spawns its threads
    let (signals_tx, signals_rx) = bounded(8);
    let mut signal_handle = tokio::spawn(async move { wait_for_signal(signals_tx).await });

    let workload = Workload::start(config, args)?;
    let mut ticker = time::interval(Duration::from_millis(args.interval.max(1)));
    let mut ticks = 0u64;

    loop {
        tokio::select! {
            // bubble up any errors from the signal handlers
            res = &mut signal_handle => {
                let res = res?;
                if let Err(err) = &res {
                    error!("error happened during handling signals: {}", err);
                }
                res?;
                break;
            }

            event_res = signals_rx.recv_async() => {
                match event_res? {
                    SignalEvent::Shutdown => {
                        info!("shutdown requested");
                        break;
                    }
                    SignalEvent::DumpMetrics => {
                        info!(metrics = %serde_json::to_string(&workload.metrics())?, "current metrics");
                    }
                }
            }

            _ = ticker.tick() => {
                if args.iterations.is_some_and(|limit| ticks >= limit) {
                    break;
                }
                workload.tick();
                ticks += 1;
            }
        }
    }

    let metrics = workload.finish()?;
    info!(ticks, metrics = %serde_json::to_string(&metrics)?, "final metrics");
    Ok(())
}
