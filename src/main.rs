mod cli;

use anyhow::Context;
use keepa_client::{Config, KeepaClient, TokenSnapshot};
use log::error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cmd = cli::build_cli();
    let matches = cmd.get_matches();
    let log_level = matches.get_one::<String>("log-level").cloned();
    let version_flag = matches.get_flag("version");

    cli::init_logging(log_level.as_deref());

    if version_flag {
        println!("keepa-client {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let Some((name, sub)) = matches.subcommand() else {
        cli::build_cli().print_help()?;
        return Ok(());
    };

    let cfg = Config::from_env().context("invalid configuration")?;
    let client = KeepaClient::from_config(&cfg).context("failed to build client")?;
    let cancel = CancellationToken::new();

    let result = match name {
        "get" => {
            let endpoint = sub.get_one::<String>("endpoint").cloned().unwrap_or_default();
            client.get_raw(&endpoint, cli::params(sub), &cancel).await
        }
        "post" => {
            let endpoint = sub.get_one::<String>("endpoint").cloned().unwrap_or_default();
            let body = sub
                .get_one::<serde_json::Value>("body")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            client
                .post_raw_with_params(&endpoint, cli::params(sub), &body, &cancel)
                .await
        }
        "tokens" => client
            .get_raw("token", std::iter::empty::<(String, String)>(), &cancel)
            .await
            .map(|_| {
                let mut out = snapshot_json(&client.tokens().snapshot()).to_string();
                out.push('\n');
                out.into_bytes()
            }),
        other => anyhow::bail!("unknown command: {other}"),
    };

    let body = match result {
        Ok(body) => body,
        Err(e) => {
            error!("{} failed ({}): {}", name, e.code(), e);
            return Err(e.into());
        }
    };

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&body).await?;
    stdout.flush().await?;
    Ok(())
}

fn snapshot_json(s: &TokenSnapshot) -> serde_json::Value {
    serde_json::json!({
        "tokensLeft": s.tokens_left,
        "refillRate": s.refill_rate,
        "refillInMs": s.refill_in.as_millis() as u64,
        "lastUpdate": s.last_update.map(|t| t.to_rfc3339()),
        "minTokensThreshold": s.min_tokens_threshold,
        "maxWaitTimeSecs": s.max_wait_time.as_secs(),
        "rateLimitEnabled": s.rate_limit_enabled,
    })
}
