//! Proxy launcher

use clap::Parser;
use sidetrack::{
  CaSigner, Config, DockerRegistryHijacker, Hijacker, MitmProxy, PassthroughHijacker, StatSink,
  StatsdSink,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
  name = "sidetrack",
  version,
  about = "MITM proxy that redirects container-image pulls to peer registries"
)]
struct Cli {
  /// Path to the YAML configuration file
  #[arg(long, env = "CONFIG", default_value = "config.yml")]
  config: PathBuf,

  /// Log level (trace, debug, info, warn, error)
  #[arg(long, env = "LOG_LEVEL")]
  log_level: Option<String>,
}

#[tokio::main]
async fn main() {
  let cli = Cli::parse();

  let config = match Config::from_file(&cli.config) {
    Ok(config) => config,
    Err(e) => {
      eprintln!("unable to load config {:?}: {}", cli.config, e);
      std::process::exit(1);
    }
  };

  let log_level = cli
    .log_level
    .or_else(|| config.log_level.clone())
    .unwrap_or_else(|| "info".to_string());
  let filter = match EnvFilter::try_new(&log_level) {
    Ok(filter) => filter,
    Err(e) => {
      eprintln!("unknown log level {:?}: {}", log_level, e);
      std::process::exit(1);
    }
  };
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(false)
    .init();

  if let Err(e) = run(config).await {
    tracing::error!("{}", e);
    std::process::exit(1);
  }
}

async fn run(config: Config) -> sidetrack::Result<()> {
  let signer = Arc::new(CaSigner::from_files(
    &config.ca.cert_path,
    &config.ca.key_path,
  )?);

  let sink: Option<Arc<dyn StatSink>> = match &config.statsd {
    Some(statsd) => Some(Arc::new(StatsdSink::from_config(statsd)?)),
    None => None,
  };

  let hijacker: Arc<dyn Hijacker> = if config.registries.is_empty() {
    tracing::warn!("no registries configured; proxying everything unmodified");
    Arc::new(PassthroughHijacker)
  } else {
    Arc::new(DockerRegistryHijacker::new(&config)?)
  };

  let proxy = Arc::new(
    MitmProxy::builder()
      .listen_address(&config.listen_address)
      .signer(signer)
      .hijacker(hijacker)
      .sink(sink)
      .build()?,
  );

  {
    let proxy = proxy.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("shutting down");
        proxy.shutdown();
      }
    });
  }

  proxy.start().await
}
