use clap::{Arg, ArgAction, ArgMatches, Command};

pub fn build_cli() -> Command {
    let param = || {
        Arg::new("param")
            .short('p')
            .long("param")
            .num_args(1)
            .action(ArgAction::Append)
            .value_parser(parse_param)
            .help("Query parameter as key=value (repeatable)")
    };

    Command::new("keepa-client")
        .about("Token-budget-aware client for the Keepa data API")
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .global(true)
                .num_args(1)
                .help("Override RUST_LOG level (e.g., info, debug)"),
        )
        .arg(
            Arg::new("version")
                .long("version")
                .global(true)
                .help("Print version and exit")
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new("get")
                .about("GET an endpoint and print the raw response body")
                .arg(Arg::new("endpoint").required(true))
                .arg(param()),
        )
        .subcommand(
            Command::new("post")
                .about("POST a JSON body to an endpoint and print the raw response body")
                .arg(Arg::new("endpoint").required(true))
                .arg(
                    Arg::new("body")
                        .long("body")
                        .num_args(1)
                        .required(true)
                        .value_parser(parse_json)
                        .help("JSON request body"),
                )
                .arg(param()),
        )
        .subcommand(
            Command::new("tokens").about("Query the current token budget and print it as JSON"),
        )
}

/// Query parameters collected from repeated `-p key=value` flags.
pub fn params(matches: &ArgMatches) -> Vec<(String, String)> {
    matches
        .get_many::<(String, String)>("param")
        .map(|vals| vals.cloned().collect())
        .unwrap_or_default()
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got {raw:?}")),
    }
}

fn parse_json(raw: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON body: {e}"))
}

pub fn init_logging(level: Option<&str>) {
    // Explicit level wins, then RUST_LOG, then info. Logs go to stderr.
    if let Some(lvl) = level {
        std::env::set_var("RUST_LOG", lvl);
    } else if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}
