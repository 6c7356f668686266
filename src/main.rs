use std::process::ExitCode;

use ec2_nvme_exporter::config::Config;
use ec2_nvme_exporter::config::LogFormat;
use ec2_nvme_exporter::nvme::error::NvmeError;
use ec2_nvme_exporter::scraper::NvmeScraper;
use ec2_nvme_exporter::server::MetricsServer;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let config = match Config::parse() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("ec2-nvme-exporter: {}", error);
            return ExitCode::FAILURE;
        }
    };

    if let Err(error) = init_logging(&config.log_level, config.log_format) {
        eprintln!("ec2-nvme-exporter: {}", error);
        return ExitCode::FAILURE;
    }

    let scraper = NvmeScraper::new(config.clone());
    if !scraper.platform_supported() {
        warn!("nvme log page collection requires Linux, metric sets will be empty");
    }
    info!(
        listen_address = %config.listen_address,
        devices = ?config.devices,
        "starting ec2-nvme-exporter"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            error!(error = %error, "failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(MetricsServer::new(config, scraper).serve()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(error = %error, "server exited with an error");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str, format: LogFormat) -> Result<(), NvmeError> {
    let filter = EnvFilter::try_new(level)
        .map_err(|error| NvmeError::Parse(format!("invalid log filter '{}': {}", level, error)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let initialized = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    initialized.map_err(|error| NvmeError::Internal(format!("logging setup failed: {}", error)))
}
