use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use ldap_groups::ldap::Ldap3Directory;
use ldap_groups::{Configuration, GroupProvider, telemetry};
use serde::Serialize;

/// Resolve directory groups of users.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML file of `ldap.*` properties.
    config: PathBuf,
    /// Users to look up.
    #[arg(required = true)]
    users: Vec<String>,
}

#[derive(Serialize)]
struct Line<'a> {
    user: &'a str,
    groups: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(err) = telemetry::setup_logging() {
        eprintln!("failed to initialize logging: {err}");
    }
    telemetry::describe_metrics();

    let config = match Configuration::read(Some(args.config.as_path())) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(path = %args.config.display(), error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        },
    };
    let provider = GroupProvider::new(config, Ldap3Directory);

    for user in &args.users {
        let groups = provider.groups(user).await;
        let line = Line {
            user,
            groups: groups.into_iter().collect(),
        };
        match serde_json::to_string(&line) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                tracing::error!(user, error = %err, "failed to serialize groups");
                return ExitCode::FAILURE;
            },
        }
    }

    let stats = provider.cache_stats();
    tracing::debug!(hits = stats.hits, misses = stats.misses, "cache usage");

    ExitCode::SUCCESS
}
