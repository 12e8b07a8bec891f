use anyhow::{Context, Result};
use heck::SnakeCase;
use std::time::Duration;
use structopt::StructOpt;

#[derive(Debug)]
pub struct Config {
    /// Enables verbose logging of errors that occur while serving metrics
    pub debug: bool,

    /// The address to bind the http server to.
    pub host: String,

    /// The port to bind the http server to.
    pub port: u16,

    /// The path the text exposition endpoint is served at.
    pub metrics_path: String,

    /// A static set of labels to append to every exposed series.
    /// e.g. "environment=production,version=0.5.0"
    pub export_labels: Vec<(String, String)>,

    /// How frequently to refresh the process uptime gauge.
    pub uptime_interval: Duration,
}

impl Config {
    /// Loads configuration from arguments, env and dotenv
    pub fn load() -> Result<Config> {
        // Attempts to find a `.env` file to initialize/extend the environment
        dotenv::dotenv().ok();

        // Load the config from arguments, then environment variables
        let env = Environment::from_args();

        Ok(Config {
            debug: env.debug
                || match dotenv::var("DEBUG").ok() {
                    Some(val) if val == "true" || val == "on" || val == "1" => true,
                    Some(val) if val == "false" || val == "off" || val == "0" || val == "" => false,
                    Some(val) => val.parse::<bool>().context("invalid DEBUG")?,
                    None => false,
                },
            host: env.host,
            port: env.port,
            metrics_path: if env.metrics_path.starts_with('/') {
                env.metrics_path
            } else {
                format!("/{}", env.metrics_path)
            },
            export_labels: parse_export_labels(&env.export_labels)?,
            uptime_interval: Duration::from_secs(env.uptime_interval),
        })
    }
}

/// Parses "name=value,..." pairs; label names must already be snake_case.
fn parse_export_labels(input: &str) -> Result<Vec<(String, String)>> {
    input
        .split(',')
        .filter(|x| !x.is_empty())
        .map(|name_value| {
            let name_value = name_value.splitn(2, '=').collect::<Vec<_>>();
            match name_value.as_slice() {
                [name, value]
                    if !value.is_empty()
                        && !name.is_empty()
                        && *name == name.to_snake_case() =>
                {
                    Ok((name.to_string(), value.to_string()))
                }
                _ => Err(anyhow::format_err!("invalid EXPORT_LABELS")),
            }
        })
        .collect::<Result<_, _>>()
}

#[derive(Debug, StructOpt)]
#[structopt(name = "exposition-server")]
struct Environment {
    /// Enables verbose logging of errors that occur while serving metrics
    #[structopt(short, long)]
    debug: bool,

    /// The address to bind the http server to
    #[structopt(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// The port to bind the http server to
    #[structopt(short, long, env = "PORT", default_value = "8080")]
    port: u16,

    /// The path to serve the text exposition format at
    #[structopt(long, env = "METRICS_PATH", default_value = "/metrics")]
    metrics_path: String,

    /// A comma separated list of static labels to add to exposed metrics
    #[structopt(long, env = "EXPORT_LABELS", default_value = "")]
    export_labels: String,

    /// How frequently (in seconds) to refresh the process uptime gauge
    #[structopt(long, env = "UPTIME_INTERVAL", default_value = "5")]
    uptime_interval: u64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_export_labels() {
        assert_eq!(parse_export_labels("").unwrap(), vec![]);
        assert_eq!(
            parse_export_labels("environment=production,version=0.5.0").unwrap(),
            vec![
                ("environment".to_string(), "production".to_string()),
                ("version".to_string(), "0.5.0".to_string()),
            ]
        );

        // Values may contain '='; only the first one splits
        assert_eq!(
            parse_export_labels("content=text==true").unwrap(),
            vec![("content".to_string(), "text==true".to_string())]
        );

        // Names must be non-empty snake_case, values non-empty
        assert!(parse_export_labels("EnvName=production").is_err());
        assert!(parse_export_labels("environment=").is_err());
        assert!(parse_export_labels("=production").is_err());
        assert!(parse_export_labels("environment").is_err());
    }
}
