#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use etherip_lib::{
    load_from_path, read_tag_adhoc, write_tag_adhoc, Driver, TagInfo, TagState, TypedData,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "EtherNet/IP tag tool and scan daemon")]
struct Cli {
    /// Increase verbosity (repeat for more)
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,

    /// PLC hostname or IP address
    #[arg(short = 'i', long = "host")]
    host: Option<String>,

    /// TCP port
    #[arg(short, long, default_value_t = 0xAF12)]
    port: u16,

    /// Backplane slot of the controller CPU
    #[arg(short, long, default_value_t = 0)]
    slot: u8,

    /// Socket timeout in milliseconds
    #[arg(short, long = "timeout", default_value_t = 5000)]
    timeout_ms: u64,

    /// Number of array elements to transfer
    #[arg(short = 'a', long = "elements", default_value_t = 1)]
    array_size: u16,

    /// Value to write after the initial read
    #[arg(short = 'w', long = "write")]
    write: Option<String>,

    /// Run the scan daemon from a configuration TOML file instead
    #[arg(short, long, value_name = "FILE", conflicts_with = "host")]
    config: Option<PathBuf>,

    /// Tag to read or write
    tag: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = if let Some(config) = &cli.config {
        run_daemon(config).await
    } else {
        run_once(&cli).await
    };

    if let Err(err) = result {
        error!(%err, "failed");
        std::process::exit(1);
    }
}

/// One-shot read (and optional write) of a single tag.
async fn run_once(cli: &Cli) -> etherip_lib::Result<()> {
    let host = cli
        .host
        .as_deref()
        .ok_or_else(|| etherip_lib::EipError::Config("missing --host".into()))?;
    let tag = cli
        .tag
        .as_deref()
        .ok_or_else(|| etherip_lib::EipError::Config("missing tag argument".into()))?;
    let timeout = Duration::from_millis(cli.timeout_ms);

    let payload = match &cli.write {
        Some(value) => {
            write_tag_adhoc(host, cli.port, cli.slot, tag, cli.array_size, timeout, value).await?
        }
        None => read_tag_adhoc(host, cli.port, cli.slot, tag, cli.array_size, timeout).await?,
    };

    let typed = TypedData::parse(&payload)?;
    print!("{tag}");
    for i in 0..typed.element_count() {
        print!(" {}", typed.element(i)?);
    }
    println!();
    Ok(())
}

/// Scan all configured PLCs until ctrl-c.
async fn run_daemon(config: &Path) -> etherip_lib::Result<()> {
    let cfg = load_from_path(config)?;
    info!(plcs = cfg.plcs.len(), "configuration loaded");

    let driver = Arc::new(Driver::new(cfg.clone()));
    for plc_cfg in &cfg.plcs {
        let plc = driver
            .define_plc(&plc_cfg.name, &plc_cfg.host, plc_cfg.port, plc_cfg.slot)
            .await;
        for tag_cfg in &plc_cfg.tags {
            let period = tag_cfg
                .period_s
                .map(Duration::from_secs_f64)
                .unwrap_or_else(|| cfg.default_period());
            let tag = driver
                .add_tag(&plc, period, &tag_cfg.tag, tag_cfg.elements)
                .await?;
            driver.add_callback(&tag, Arc::new(log_sample));
        }
    }
    driver.start();

    tokio::signal::ctrl_c()
        .await
        .map_err(etherip_lib::EipError::Io)?;
    info!("shutting down");
    driver.shutdown().await;
    println!("{}", driver.report(3).await);
    Ok(())
}

fn log_sample(tag: &TagInfo, state: &TagState) {
    if state.valid_len < 2 {
        info!(tag = tag.tag(), "no valid data");
        return;
    }
    match TypedData::parse(&state.value[..state.valid_len]) {
        Ok(typed) => {
            let values: Vec<String> = (0..typed.element_count())
                .filter_map(|i| typed.element(i).ok())
                .map(|v| v.to_string())
                .collect();
            info!(tag = tag.tag(), ty = %typed.ty, value = values.join(" "));
        }
        Err(err) => info!(tag = tag.tag(), %err, "undecodable data"),
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
