use reqwest::Client;
use std::time::Duration;

use crate::RunnerConfig;

// The downstream per-site endpoint that runs that site's scheduled work.
const TASK_ENDPOINT: &str = "wp-cron.php";
const DISPATCH_TIMEOUT_SECS: u64 = 10;
const PLAIN_MARKER: &str = "{PLAIN}";

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct BasicCredentials {
    pub user: String,
    pub password: String,
}

/// Resolve the outbound basic-auth pair, first non-empty source winning for
/// user and password independently:
/// user: CRONRUN_AUTH_USER, then BASIC_AUTH_USER.
/// password: CRONRUN_AUTH_PW, then BASIC_AUTH_PASSWORD, then
/// BASIC_AUTH_PASSWORD_HASH. A `{PLAIN}` marker is stripped from the
/// resolved password whatever its source. Both fields must resolve
/// non-empty for an Authorization header to be sent at all.
pub(crate) fn resolve_credentials(cfg: &RunnerConfig) -> Option<BasicCredentials> {
    let user = cfg
        .auth_user
        .clone()
        .or_else(|| cfg.basic_auth_user.clone())
        .filter(|v| !v.is_empty())?;

    let password = cfg
        .auth_pw
        .clone()
        .or_else(|| cfg.basic_auth_password.clone())
        .or_else(|| cfg.basic_auth_password_hash.clone())
        .map(|pw| pw.replace(PLAIN_MARKER, ""))
        .filter(|v| !v.is_empty())?;

    Some(BasicCredentials { user, password })
}

fn dispatch_client(cfg: &RunnerConfig) -> Result<Client, String> {
    Client::builder()
        .timeout(Duration::from_secs(DISPATCH_TIMEOUT_SECS))
        // Downstream sites routinely sit behind self-signed or internal
        // certificates; the trigger call is fire-and-forget either way.
        .danger_accept_invalid_certs(true)
        .user_agent(cfg.user_agent())
        .pool_max_idle_per_host(0)
        .build()
        .map_err(|e| e.to_string())
}

/// Dispatch one cron call per target, strictly sequentially. Every target
/// is recorded as attempted; individual call failures are logged and
/// swallowed, never aborting the loop or shrinking the returned list.
pub(crate) fn run_cron_for_sites(cfg: &RunnerConfig, targets: &[String]) -> Vec<String> {
    let credentials = resolve_credentials(cfg);
    let client = dispatch_client(cfg);
    if let Err(err) = &client {
        crate::log_message(&format!("warn dispatch-client-build-failed err={err}"));
    }

    let mut attempted = Vec::with_capacity(targets.len());
    for base_url in targets {
        if let Ok(client) = &client {
            if let Err(err) = run_cron(client, base_url, credentials.as_ref()) {
                crate::log_message(&format!("warn dispatch-failed site={base_url} err={err}"));
            }
        }
        attempted.push(base_url.clone());
    }
    attempted
}

fn run_cron(
    client: &Client,
    base_url: &str,
    credentials: Option<&BasicCredentials>,
) -> Result<(), String> {
    let cron_url = format!("{base_url}/{TASK_ENDPOINT}");

    let mut request = client.get(&cron_url);
    if let Some(creds) = credentials {
        request = request.basic_auth(&creds.user, Some(&creds.password));
    }

    let response = crate::runtime()
        .block_on(async move { request.send().await })
        .map_err(|e| e.to_string())?;

    // The outcome is deliberately not part of the contract, but a non-2xx
    // answer is worth a log line.
    if !response.status().is_success() {
        crate::log_message(&format!(
            "warn dispatch-status site={base_url} status={}",
            response.status().as_u16()
        ));
    }

    Ok(())
}
