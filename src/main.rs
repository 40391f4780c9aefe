use regex::Regex;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use sqlx::migrate::Migrator;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::HashMap;
use std::env;
use std::fs::{self, File};
use std::future::Future;
use std::io::{self, BufRead, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::runtime::Runtime;
use url::Url;

mod dispatch;
mod tenants;

const LOG_TAG: &str = "cron-runner";
pub(crate) const USER_AGENT_PRODUCT: &str = "cron-runner";

// The one request path that activates the runner. Trailing slashes are
// tolerated and stripped before comparison; everything else is a 404.
const TRIGGER_PATH: &str = "/run-cron";
const RESPONSE_TITLE: &str = "Cron Runner";
const REJECT_BODY: &str = "Cron runner: invalid request.";

const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:25210";
const DEFAULT_DB_PATH: &str = "data/cron-runner.db";
const DEFAULT_SCHEME: &str = "https";
const DEFAULT_HOME_URL: &str = "localhost";

// Environment variable names (external interface). Runner-specific variables
// use the CRONRUN_ prefix; the BASIC_AUTH_* names are deployment-wide
// constants shared with the hosting platform and are kept verbatim.
const ENV_PROFILE: &str = "CRONRUN_ENV";
const ENV_HTTP_ADDR: &str = "CRONRUN_HTTP_ADDR";
const ENV_DB_URL: &str = "CRONRUN_DB_URL";
const ENV_SCHEME: &str = "CRONRUN_SCHEME";
const ENV_MULTISITE: &str = "CRONRUN_MULTISITE";
const ENV_HOME_URL: &str = "CRONRUN_HOME_URL";
const ENV_AUTH_USER: &str = "CRONRUN_AUTH_USER";
const ENV_AUTH_PW: &str = "CRONRUN_AUTH_PW";
const ENV_BASIC_AUTH_USER: &str = "BASIC_AUTH_USER";
const ENV_BASIC_AUTH_PASSWORD: &str = "BASIC_AUTH_PASSWORD";
const ENV_BASIC_AUTH_PASSWORD_HASH: &str = "BASIC_AUTH_PASSWORD_HASH";

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);
static RUNTIME: OnceLock<Runtime> = OnceLock::new();
static DB_POOL: OnceLock<Result<SqlitePool, String>> = OnceLock::new();
pub(crate) static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub(crate) struct RequestContext {
    method: String,
    path: String,
    query: Option<String>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    raw_request: String,
    request_id: String,
    started_at: Instant,
    received_at: SystemTime,
}

/// Where a trigger invocation came from. Threaded explicitly into the gate
/// so re-entrancy checks never depend on ambient process state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum InvocationContext {
    ExternalRequest,
    BackgroundTask,
}

impl InvocationContext {
    // A request announcing our own product tag is one of our dispatches
    // looping back through a misconfigured tenant. Refuse to re-enter.
    fn from_user_agent(user_agent: Option<&str>) -> Self {
        match user_agent {
            Some(ua) if ua.trim_start().starts_with(USER_AGENT_PRODUCT) => {
                InvocationContext::BackgroundTask
            }
            _ => InvocationContext::ExternalRequest,
        }
    }
}

/// Deployment-wide settings, read from the environment once per process and
/// passed into the handler explicitly.
#[derive(Clone, Debug)]
pub(crate) struct RunnerConfig {
    pub scheme: Option<String>,
    pub multisite: bool,
    pub home_url: String,
    pub auth_user: Option<String>,
    pub auth_pw: Option<String>,
    pub basic_auth_user: Option<String>,
    pub basic_auth_password: Option<String>,
    pub basic_auth_password_hash: Option<String>,
}

impl RunnerConfig {
    fn load() -> Self {
        let non_empty = |key: &str| {
            env::var(key)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        RunnerConfig {
            scheme: non_empty(ENV_SCHEME),
            multisite: non_empty(ENV_MULTISITE)
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            home_url: non_empty(ENV_HOME_URL).unwrap_or_else(|| DEFAULT_HOME_URL.to_string()),
            auth_user: non_empty(ENV_AUTH_USER),
            auth_pw: non_empty(ENV_AUTH_PW),
            basic_auth_user: non_empty(ENV_BASIC_AUTH_USER),
            basic_auth_password: non_empty(ENV_BASIC_AUTH_PASSWORD),
            basic_auth_password_hash: non_empty(ENV_BASIC_AUTH_PASSWORD_HASH),
        }
    }

    pub(crate) fn resolved_scheme(&self) -> &str {
        self.scheme.as_deref().unwrap_or(DEFAULT_SCHEME)
    }

    /// Base URL of this deployment's own site: the configured home URL with
    /// the resolved scheme forced onto it and any trailing slash removed.
    pub(crate) fn home_base_url(&self) -> String {
        let scheme = self.resolved_scheme();
        let raw = self.home_url.trim().trim_end_matches('/');
        let candidate = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("{scheme}://{raw}")
        };

        match Url::parse(&candidate) {
            Ok(url) => {
                let host = url.host_str().unwrap_or(DEFAULT_HOME_URL);
                let mut base = format!("{scheme}://{host}");
                if let Some(port) = url.port() {
                    base.push_str(&format!(":{port}"));
                }
                let path = url.path().trim_end_matches('/');
                if !path.is_empty() && path != "/" {
                    base.push_str(path);
                }
                base
            }
            Err(_) => format!("{scheme}://{raw}"),
        }
    }

    pub(crate) fn user_agent(&self) -> String {
        format!(
            "{USER_AGENT_PRODUCT}/{}; {}",
            env!("CARGO_PKG_VERSION"),
            self.home_base_url()
        )
    }
}

fn main() {
    let mut args = env::args();
    let exe = args.next().unwrap_or_else(|| "cron-runner".into());
    let Some(raw_cmd) = args.next() else {
        print_usage(&exe);
        std::process::exit(1);
    };

    apply_env_profile_defaults();

    let command = normalize_command(&raw_cmd);
    let remaining: Vec<String> = args.collect();

    match command.as_str() {
        "server" => run_server(),
        "http-server" => run_http_server_cli(&remaining),
        "trigger" => run_trigger_cli(&remaining),
        "seed-demo" => run_seed_demo_cli(&remaining),
        "import-tenants" => run_import_tenants_cli(&remaining),
        "version" => {
            println!("{}", version_tag());
            std::process::exit(0);
        }
        "help" => {
            print_usage(&exe);
            std::process::exit(0);
        }
        _ => {
            eprintln!("unknown command: {raw_cmd}");
            print_usage(&exe);
            std::process::exit(2);
        }
    }
}

fn apply_env_profile_defaults() {
    // CRONRUN_ENV controls a coarse runtime profile. Explicit configuration
    // always wins; defaults are only filled in when a variable is unset or
    // empty.
    let profile = env::var(ENV_PROFILE)
        .unwrap_or_else(|_| "dev".to_string())
        .to_ascii_lowercase();

    let ensure = |key: &str, value: String| {
        if env::var(key)
            .ok()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
        {
            // SAFETY: called once at process start in main(), before any
            // other threads exist, so mutating the environment is safe.
            unsafe {
                env::set_var(key, value);
            }
        }
    };

    if profile == "test" || profile == "testing" {
        // Tests prefer an in-memory shared SQLite database unless a DB URL
        // is explicitly provided; keeps test runs isolated and fast.
        ensure(ENV_DB_URL, "sqlite::memory:?cache=shared".to_string());
    } else {
        // Anchor the default DB file under the compiled project root so the
        // path does not depend on the process CWD.
        let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
        let db_abs = manifest_dir.join(DEFAULT_DB_PATH);
        ensure(ENV_DB_URL, format!("sqlite://{}", db_abs.to_string_lossy()));
    }
}

fn normalize_command(raw: &str) -> String {
    raw.trim_start_matches('-').to_lowercase()
}

fn version_tag() -> String {
    format!("v{}", env!("CARGO_PKG_VERSION"))
}

fn print_usage(exe: &str) {
    eprintln!("Usage: {exe} <command> [options]\n");
    eprintln!("Commands:");
    eprintln!("  server                  Run a single HTTP request on stdin/stdout (internal)");
    eprintln!("  http-server             Run the persistent HTTP server bound to {ENV_HTTP_ADDR}");
    eprintln!("  trigger [--dry-run]     Resolve targets and dispatch cron calls from the CLI");
    eprintln!("  seed-demo               Seed a deterministic demo tenant dataset");
    eprintln!("  import-tenants <file>   Load tenant rows from a JSON array");
    eprintln!("  version                 Print the release tag");
    eprintln!("  help                    Show this message");
}

fn run_server() -> ! {
    if let Err(err) = handle_connection() {
        log_message(&format!("500 internal-error {err}"));
        let _ = write_response(500, "InternalServerError", "internal error");
        std::process::exit(1);
    }
    std::process::exit(0);
}

fn run_http_server_cli(_args: &[String]) -> ! {
    let addr = env::var(ENV_HTTP_ADDR).unwrap_or_else(|_| DEFAULT_HTTP_ADDR.to_string());
    let listener = TcpListener::bind(&addr).unwrap_or_else(|err| {
        eprintln!("failed to bind HTTP address {addr}: {err}");
        std::process::exit(1);
    });

    eprintln!("listening on http://{addr} (http-server)");

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                // Spawn a short-lived `cron-runner server` child per TCP
                // connection, wiring the stream to its stdin/stdout. Keeps
                // per-request state isolated in a dedicated process.
                if let Err(err) = spawn_server_for_stream(stream) {
                    eprintln!("failed to spawn server for {peer:?}: {err}");
                }
            }
            Err(err) => {
                eprintln!("accept failed: {err}");
                // avoid busy loop on fatal errors
                thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

fn spawn_server_for_stream(stream: TcpStream) -> Result<(), String> {
    stream
        .set_nodelay(true)
        .map_err(|e| format!("set_nodelay failed: {e}"))?;

    let stdin_stream = stream
        .try_clone()
        .map_err(|e| format!("failed to clone stream for stdin: {e}"))?;
    let stdout_stream = stream;

    let stdin_fd = stdin_stream.into_raw_fd();
    let stdout_fd = stdout_stream.into_raw_fd();

    let exe = env::current_exe().map_err(|e| e.to_string())?;

    let mut cmd = Command::new(exe);
    cmd.arg("server");
    // SAFETY: ownership of both raw FDs transfers into File and then into
    // the child's Stdio; the parent never touches them again.
    unsafe {
        cmd.stdin(Stdio::from(File::from_raw_fd(stdin_fd)));
        cmd.stdout(Stdio::from(File::from_raw_fd(stdout_fd)));
    }
    cmd.stderr(Stdio::null());

    cmd.spawn()
        .map_err(|e| format!("failed to spawn server child: {e}"))?;
    Ok(())
}

fn run_trigger_cli(args: &[String]) -> ! {
    let mut dry_run = false;
    for arg in args {
        match arg.as_str() {
            "--dry-run" => dry_run = true,
            other => {
                eprintln!("unknown trigger option: {other}");
                std::process::exit(2);
            }
        }
    }

    let cfg = RunnerConfig::load();
    let repo = tenants::SqliteTenantRepository;
    let targets = match tenants::site_targets(&cfg, &repo) {
        Ok(targets) => targets,
        Err(err) => {
            eprintln!("tenant enumeration failed: {err}");
            std::process::exit(1);
        }
    };

    let attempted = if dry_run {
        targets
    } else {
        dispatch::run_cron_for_sites(&cfg, &targets)
    };

    for site in &attempted {
        println!("{site}");
    }
    println!("{} sites", attempted.len());
    log_message(&format!(
        "cli-trigger sites={} dry_run={dry_run}",
        attempted.len()
    ));
    std::process::exit(0);
}

fn run_seed_demo_cli(_args: &[String]) -> ! {
    match tenants::seed_demo_tenants() {
        Ok(()) => {
            println!("seed-demo completed");
            std::process::exit(0);
        }
        Err(err) => {
            eprintln!("seed-demo failed: {err}");
            std::process::exit(1);
        }
    }
}

fn run_import_tenants_cli(args: &[String]) -> ! {
    let Some(file) = args.first() else {
        eprintln!("import-tenants requires a JSON file path");
        std::process::exit(2);
    };

    match tenants::import_tenants(Path::new(file)) {
        Ok(count) => {
            println!("imported {count} tenants");
            std::process::exit(0);
        }
        Err(err) => {
            eprintln!("import-tenants failed: {err}");
            std::process::exit(1);
        }
    }
}

fn handle_connection() -> Result<(), String> {
    let received_at = SystemTime::now();
    let started_at = Instant::now();
    let request_id = next_request_id();

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let mut request_line = String::new();
    reader
        .read_line(&mut request_line)
        .map_err(|e| e.to_string())?;
    let request_line = request_line.trim_end_matches(['\r', '\n']).to_string();

    let (method, raw_target) = parse_request_line(&request_line);
    if method.is_empty() || raw_target.is_empty() {
        log_message(&format!("400 bad-request {}", redact_token(&request_line)));
        return send_response(400, "BadRequest", "bad request");
    }

    let (path, query) = match parse_target(&raw_target) {
        Ok(parts) => parts,
        Err(e) => {
            log_message(&format!("400 bad-request {}", redact_token(&request_line)));
            return send_response(400, "BadRequest", &e);
        }
    };

    let headers = read_headers(&mut reader)?;
    let content_length = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok());
    let transfer_encoding = headers
        .get("transfer-encoding")
        .map(|s| s.to_ascii_lowercase());

    // Only read a body when the client explicitly signals one via
    // Content-Length or chunked Transfer-Encoding. Reading to EOF on a plain
    // GET would deadlock while the client keeps the socket open.
    let mut body = Vec::new();
    if let Some(len) = content_length {
        body.resize(len, 0);
        reader
            .read_exact(&mut body)
            .map_err(|e| format!("failed to read body: {e}"))?;
    } else if transfer_encoding
        .as_deref()
        .map(|enc| enc.contains("chunked"))
        .unwrap_or(false)
    {
        body = read_chunked_body(&mut reader)?;
    }

    let ctx = RequestContext {
        method,
        path,
        query,
        headers,
        body,
        raw_request: request_line,
        request_id,
        started_at,
        received_at,
    };

    let cfg = RunnerConfig::load();
    let invocation =
        InvocationContext::from_user_agent(ctx.headers.get("user-agent").map(|s| s.as_str()));

    match gate_decision(&ctx.path, &ctx.method, !ctx.body.is_empty(), invocation) {
        GateDecision::Accept => handle_trigger_request(&ctx, &cfg),
        GateDecision::Reject => {
            log_message(&format!(
                "400 invalid-request {}",
                redact_token(&ctx.raw_request)
            ));
            respond_plain(
                &ctx,
                400,
                "BadRequest",
                REJECT_BODY,
                "gate-reject",
                json!({ "invocation": format!("{invocation:?}") }),
            )
        }
        GateDecision::NotFound => {
            log_message(&format!("404 {}", redact_token(&ctx.raw_request)));
            respond_plain(&ctx, 404, "NotFound", "not found", "not-found", json!({}))
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum GateDecision {
    Accept,
    Reject,
    NotFound,
}

/// Accept iff the trailing-slash-normalized path equals the trigger path
/// exactly. A POST payload or a background-task invocation is invalid no
/// matter which path it arrives on.
pub(crate) fn gate_decision(
    path: &str,
    method: &str,
    has_body: bool,
    invocation: InvocationContext,
) -> GateDecision {
    if (method == "POST" && has_body) || invocation == InvocationContext::BackgroundTask {
        return GateDecision::Reject;
    }

    if path.trim_end_matches('/') != TRIGGER_PATH {
        return GateDecision::NotFound;
    }

    GateDecision::Accept
}

fn handle_trigger_request(ctx: &RequestContext, cfg: &RunnerConfig) -> Result<(), String> {
    let repo = tenants::SqliteTenantRepository;
    let targets = match tenants::site_targets(cfg, &repo) {
        Ok(targets) => targets,
        Err(err) => {
            // A broken tenant store aborts the whole request; the message is
            // surfaced verbatim so operators see the underlying failure.
            log_message(&format!("500 run-cron enumeration-failed err={err}"));
            return respond_plain(
                ctx,
                500,
                "InternalServerError",
                &err,
                "run-cron",
                json!({ "error": err.clone() }),
            );
        }
    };

    let attempted = dispatch::run_cron_for_sites(cfg, &targets);
    log_message(&format!("200 run-cron sites={}", attempted.len()));

    let body = render_summary(&attempted);
    respond_html(ctx, 200, "OK", &body, "run-cron", json!({ "sites": attempted }))
}

/// Minimal HTML document listing every base URL a dispatch was attempted
/// for. "Attempted" is the contract: outcomes are not inspected.
fn render_summary(sites: &[String]) -> String {
    let mut fragment = String::new();
    fragment.push_str("<h1>Cron runner executed for sites:</h1>\n");
    if sites.is_empty() {
        fragment.push_str("<strong>0 sites.</strong>\n");
    } else {
        fragment.push_str("<ul>\n");
        for site in sites {
            fragment.push_str("<li>");
            fragment.push_str(&html_escape(site));
            fragment.push_str("</li>\n");
        }
        fragment.push_str("</ul>\n");
    }

    format!(
        "<!doctype html>\n<html>\n<head><meta charset=\"utf-8\"><title>{RESPONSE_TITLE}</title></head>\n<body>\n{fragment}</body>\n</html>\n"
    )
}

fn html_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

fn parse_request_line(request_line: &str) -> (String, String) {
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let target = parts.next().unwrap_or("").to_string();
    (method, target)
}

fn parse_target(raw_target: &str) -> Result<(String, Option<String>), String> {
    if raw_target.is_empty() {
        return Err("empty target".into());
    }

    // Support both absolute-form and origin-form targets.
    let url = if raw_target.starts_with("http://") || raw_target.starts_with("https://") {
        Url::parse(raw_target).map_err(|e| e.to_string())?
    } else {
        Url::parse(&format!("http://dummy{raw_target}")).map_err(|e| e.to_string())?
    };

    let path = url.path().to_string();
    let query = url.query().map(|s| s.to_string());
    Ok((path, query))
}

fn read_headers<R: BufRead>(reader: &mut R) -> Result<HashMap<String, String>, String> {
    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .map_err(|e| format!("failed to read header: {e}"))?;
        let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
        if trimmed.is_empty() {
            break;
        }

        if let Some((name, value)) = trimmed.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Ok(headers)
}

fn read_chunked_body<R: BufRead>(reader: &mut R) -> Result<Vec<u8>, String> {
    let mut body = Vec::new();
    loop {
        let mut size_line = String::new();
        reader
            .read_line(&mut size_line)
            .map_err(|e| format!("failed to read chunk size: {e}"))?;
        let size_str = size_line.trim();
        if size_str.is_empty() {
            continue;
        }

        let size = usize::from_str_radix(size_str, 16)
            .map_err(|e| format!("invalid chunk size '{size_str}': {e}"))?;

        if size == 0 {
            loop {
                let mut trailer = String::new();
                reader
                    .read_line(&mut trailer)
                    .map_err(|e| format!("failed to read chunk trailer: {e}"))?;
                if trailer.trim().is_empty() {
                    break;
                }
            }
            break;
        }

        let mut chunk = vec![0u8; size];
        reader
            .read_exact(&mut chunk)
            .map_err(|e| format!("failed to read chunk body: {e}"))?;
        body.extend_from_slice(&chunk);

        let mut crlf = [0u8; 2];
        reader
            .read_exact(&mut crlf)
            .map_err(|e| format!("failed to read chunk terminator: {e}"))?;
    }

    Ok(body)
}

fn write_response(status: u16, reason: &str, body: &str) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    write!(stdout, "HTTP/1.1 {} {}\r\n", status, reason)?;
    stdout.write_all(b"Content-Type: text/plain; charset=utf-8\r\n")?;
    stdout.write_all(b"Connection: close\r\n")?;
    stdout.write_all(b"\r\n")?;
    if !body.is_empty() {
        writeln!(stdout, "{}", body)?;
    }
    stdout.flush()
}

fn write_payload_response(
    status: u16,
    reason: &str,
    content_type: &str,
    body: &[u8],
) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    write!(stdout, "HTTP/1.1 {} {}\r\n", status, reason)?;
    write!(stdout, "Content-Type: {}\r\n", content_type)?;
    write!(stdout, "Content-Length: {}\r\n", body.len())?;
    stdout.write_all(b"Connection: close\r\n")?;
    stdout.write_all(b"\r\n")?;
    stdout.write_all(body)?;
    stdout.flush()
}

fn send_response(status: u16, reason: &str, body: &str) -> Result<(), String> {
    match write_response(status, reason, body) {
        Ok(()) => Ok(()),
        Err(err)
            if err.kind() == io::ErrorKind::BrokenPipe
                || err.kind() == io::ErrorKind::ConnectionReset =>
        {
            Ok(())
        }
        Err(err) => Err(err.to_string()),
    }
}

fn send_html_response(status: u16, reason: &str, body: &str) -> Result<(), String> {
    match write_payload_response(status, reason, "text/html; charset=utf-8", body.as_bytes()) {
        Ok(()) => Ok(()),
        Err(err)
            if err.kind() == io::ErrorKind::BrokenPipe
                || err.kind() == io::ErrorKind::ConnectionReset =>
        {
            Ok(())
        }
        Err(err) => Err(err.to_string()),
    }
}

fn respond_plain(
    ctx: &RequestContext,
    status: u16,
    reason: &str,
    body: &str,
    action: &str,
    meta: Value,
) -> Result<(), String> {
    let result = send_response(status, reason, body);
    record_trigger_event(ctx, status, action, meta);
    result
}

fn respond_html(
    ctx: &RequestContext,
    status: u16,
    reason: &str,
    body: &str,
    action: &str,
    meta: Value,
) -> Result<(), String> {
    let result = send_html_response(status, reason, body);
    record_trigger_event(ctx, status, action, meta);
    result
}

fn record_trigger_event(ctx: &RequestContext, status: u16, action: &str, mut meta: Value) {
    let elapsed_ms = ctx.started_at.elapsed().as_millis() as i64;
    let ts = system_time_secs(ctx.received_at) as i64;
    if let Some(query) = &ctx.query {
        meta["query"] = Value::from(redact_token(query));
    }

    let Ok(meta_str) = serde_json::to_string(&meta) else {
        return;
    };

    let request_id = ctx.request_id.clone();
    let method = ctx.method.clone();
    let path = ctx.path.clone();
    let action = action.to_string();
    let status = status as i64;

    let result = with_db(move |pool| async move {
        sqlx::query(
            "INSERT INTO trigger_log (request_id, ts, method, path, status, action, duration_ms, meta) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(request_id)
        .bind(ts)
        .bind(method)
        .bind(path)
        .bind(status)
        .bind(action)
        .bind(elapsed_ms)
        .bind(meta_str)
        .execute(&pool)
        .await?;
        Ok(())
    });

    if let Err(err) = result {
        log_message(&format!("warn audit-insert-failed err={err}"));
    }
}

pub(crate) fn runtime() -> &'static Runtime {
    RUNTIME.get_or_init(|| Runtime::new().expect("failed to create runtime"))
}

pub(crate) fn db_pool() -> Result<SqlitePool, String> {
    DB_POOL.get_or_init(init_db_pool).clone()
}

fn init_db_pool() -> Result<SqlitePool, String> {
    let url = env::var(ENV_DB_URL)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| format!("sqlite://{DEFAULT_DB_PATH}"));
    let trimmed = url.trim().to_string();

    if !trimmed.starts_with("sqlite://") && !trimmed.starts_with("sqlite:") {
        let message = format!("unsupported database url: {url} (only sqlite is supported)");
        log_message(&format!("warn db-init-unsupported {message}"));
        return Err(message);
    }

    ensure_sqlite_storage(&trimmed)?;

    runtime()
        .block_on(async {
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&trimmed)
                .await?;
            MIGRATOR.run(&pool).await?;
            Ok::<SqlitePool, sqlx::Error>(pool)
        })
        .map_err(|err| {
            let message = format!("failed to initialize database at {url}: {err}");
            log_message(&format!("warn db-init-failed {message}"));
            message
        })
}

fn ensure_sqlite_storage(conn: &str) -> Result<(), String> {
    if let Some(path) = conn.strip_prefix("sqlite://") {
        let path = Path::new(path);
        if let Some(parent) = path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                return Err(format!(
                    "db-dir-create-failed path={} err={}",
                    parent.display(),
                    err
                ));
            }
        }

        // Create the file up front: connecting to a missing path can fail
        // with `code: 14` on some sqlite builds instead of creating it.
        if !path.exists() {
            if let Err(err) = File::create(path) {
                return Err(format!(
                    "db-file-create-failed path={} err={}",
                    path.display(),
                    err
                ));
            }
        }
    }

    Ok(())
}

pub(crate) fn with_db<F, Fut, T>(f: F) -> Result<T, String>
where
    F: FnOnce(SqlitePool) -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>> + Send + 'static,
    T: Send + 'static,
{
    let pool = db_pool()?;
    runtime()
        .block_on(async move { f(pool).await })
        .map_err(|e| e.to_string())
}

fn next_request_id() -> String {
    let seq = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis();
    format!("{ts:x}-{seq:04x}")
}

fn system_time_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

pub(crate) fn log_message(message: &str) {
    // Try system logger first; fall back to stderr so container logs capture it.
    let _ = Command::new("logger")
        .arg("-t")
        .arg(LOG_TAG)
        .arg(message)
        .status();
    eprintln!("{message}");
}

fn redact_token(input: &str) -> String {
    static TOKEN_RE: OnceLock<Regex> = OnceLock::new();
    let regex = TOKEN_RE
        .get_or_init(|| Regex::new(r"((?:token|password|pass|pw)=)[^&\s]+").unwrap());
    regex.replace_all(input, "$1***REDACTED***").into_owned()
}
