use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use url::Url;

use keepalive_monitor::observability::logging;
use keepalive_monitor::probe::{measure, IdleOutcome};

#[derive(Parser)]
#[command(name = "keepalive-check")]
#[command(about = "Measure the keep-alive idle timeout of one HTTP server", long_about = None)]
struct Cli {
    /// Maximum time to wait for the server to close the idle connection.
    #[arg(short, long, default_value = "5m", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// URL of the server, http or https.
    url: String,
}

/// Dialable `host:port` and TLS flag for `raw`.
fn dial_target(raw: &str) -> Result<(String, bool), String> {
    let url = Url::parse(raw).map_err(|e| format!("invalid url {raw}: {e}"))?;
    let tls = match url.scheme() {
        "http" => false,
        "https" => true,
        other => return Err(format!("unsupported scheme {other}")),
    };
    let host = url.host().ok_or_else(|| format!("url {raw} has no host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| format!("url {raw} has no port"))?;
    Ok((format!("{host}:{port}"), tls))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_logging("info");

    let (address, tls) = match dial_target(&cli.url) {
        Ok(target) => target,
        Err(e) => {
            eprintln!("check failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!("Checking keepalive timeout for {}...", cli.url);

    let result = tokio::select! {
        result = measure(&address, cli.timeout, tls) => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("check failed: interrupted");
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(m) => match m.outcome {
            IdleOutcome::ClosedByPeer => {
                println!("Connection closed by the server after {:?}", m.elapsed);
                ExitCode::SUCCESS
            }
            IdleOutcome::KeepAliveDisabled => {
                println!("Server does not keep connections alive");
                ExitCode::SUCCESS
            }
            IdleOutcome::DataReceived => {
                println!("Server sent data on the idle connection after {:?}", m.elapsed);
                ExitCode::SUCCESS
            }
            IdleOutcome::DeadlineElapsed => {
                println!("Timeout waiting for a timeout after {:?}", m.elapsed);
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("check failed: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports_follow_scheme() {
        assert_eq!(dial_target("http://example.com").unwrap(), ("example.com:80".into(), false));
        assert_eq!(dial_target("https://example.com/x").unwrap(), ("example.com:443".into(), true));
        assert_eq!(dial_target("http://[::1]:8080").unwrap(), ("[::1]:8080".into(), false));
        assert!(dial_target("ftp://example.com").is_err());
        assert!(dial_target("not a url").is_err());
    }

    #[test]
    fn timeout_flag_uses_human_durations() {
        let cli = Cli::try_parse_from(["keepalive-check", "http://example.com"]).unwrap();
        assert_eq!(cli.timeout, Duration::from_secs(300));

        let cli = Cli::try_parse_from(["keepalive-check", "-t", "1m30s", "http://example.com"]).unwrap();
        assert_eq!(cli.timeout, Duration::from_secs(90));

        let cli = Cli::try_parse_from(["keepalive-check", "--timeout", "500ms", "http://example.com"]).unwrap();
        assert_eq!(cli.timeout, Duration::from_millis(500));

        assert!(Cli::try_parse_from(["keepalive-check", "--timeout", "later", "http://example.com"]).is_err());
    }
}
