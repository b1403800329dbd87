use anyhow::Context;
use clap::{Parser, ValueEnum};
use pointeuse::config::PointeuseConfig;
use pointeuse::orchestration::Terminal;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "pointeuse")]
#[command(about = "Unattended RFID/NFC time-and-attendance terminal")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "pointeuse.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable trace logging
    #[arg(short, long)]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    validate_config: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// List detected badge readers and exit
    #[arg(long)]
    list_readers: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogFormat {
    Pretty,
    Compact,
    Json,
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = if args.verbose {
        LevelFilter::TRACE
    } else if args.debug {
        LevelFilter::DEBUG
    } else if args.quiet {
        LevelFilter::WARN
    } else {
        LevelFilter::INFO
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pointeuse={level}")));

    let registry = tracing_subscriber::registry().with(filter);
    match args.log_format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact())
            .init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
    Ok(())
}

fn list_readers() {
    let serial = pointeuse::serial_reader::list_serial_ports();
    let pcsc = pointeuse::pcsc_reader::list_pcsc_readers();

    if serial.is_empty() && pcsc.is_empty() {
        println!("No badge reader detected");
        return;
    }
    for port in serial {
        println!("serial: {port}");
    }
    for reader in pcsc {
        println!("pcsc:   {reader}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    if args.list_readers {
        list_readers();
        return Ok(());
    }

    let config = PointeuseConfig::load_from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config))?;

    if args.print_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    config.validate().context("invalid configuration")?;
    if args.validate_config {
        println!("Configuration valid");
        return Ok(());
    }

    info!("Starting pointeuse terminal");
    let mut terminal = Terminal::new(config)
        .await
        .context("failed to initialize the terminal")?;
    terminal.start().await.context("failed to start reading")?;
    terminal.run().await.context("terminal stopped with an error")?;

    Ok(())
}
