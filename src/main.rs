use anyhow::Context;
use std::path::PathBuf;
use veilhub::config::VeilhubConfig;
use veilhub::telemetry;

enum CliCommand {
    Run { config_path: Option<PathBuf> },
    Help,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing().context("failed to initialise telemetry")?;

    match parse_cli_args()? {
        CliCommand::Run { config_path } => {
            let config = match config_path {
                Some(path) => VeilhubConfig::load_from(&path)
                    .with_context(|| format!("failed to load configuration {}", path.display()))?,
                None => VeilhubConfig::load().context("failed to load configuration")?,
            };

            let app = veilhub::app::VeilhubApp::initialise(config)
                .context("failed to construct application")?;
            app.run().await.context("application runtime error")
        }
        CliCommand::Help => {
            print_help();
            Ok(())
        }
    }
}

fn parse_cli_args() -> anyhow::Result<CliCommand> {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                if config_path.is_some() {
                    anyhow::bail!("configuration path specified multiple times");
                }
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("expected path after {arg}"))?;
                config_path = Some(PathBuf::from(value));
            }
            "-h" | "--help" => return Ok(CliCommand::Help),
            other => anyhow::bail!("unrecognised argument `{other}`"),
        }
    }

    Ok(CliCommand::Run { config_path })
}

fn print_help() {
    println!(
        "\
Usage: veilhub [OPTIONS]

Options:
  -c, --config <PATH>    Path to veilhub configuration file
  -h, --help             Print this help message

Environment:
  VEILHUB_UPSTREAM__ADDR          Analysis service address (host:port)
  VEILHUB_IPC__SOCKET_PATH        Client ingress Unix socket path
  VEILHUB_RELAY__CHUNK_SIZE       Items per upstream chunk
  VEILHUB_RELAY__ORIGIN_MAX_AGE   Optional origin-entry max age (e.g. 10m)
"
    );
}
