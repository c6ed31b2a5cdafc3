use clap::{Parser, Subcommand};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::Value;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{exit, Child, Command};
use std::thread::sleep;
use std::time::{Duration, Instant};

const SERVER_PACKAGE: &str = "meteorelay-server";
const SMOKE_SECRET: &str = "ci-health-smoke-secret";
const EXPECTED_SERIES: [&str; 2] = [
    "meteorelay_http_requests_total",
    "meteorelay_ws_connections_active",
];

/// fmt check, clippy and tests, once without and once with the `metrics` feature.
const CHECK_STEPS: [&[&str]; 5] = [
    &["fmt", "--all", "--", "--check"],
    &["clippy", "--workspace", "--", "-D", "warnings"],
    &["clippy", "--workspace", "--features", "metrics", "--", "-D", "warnings"],
    &["test", "--workspace"],
    &["test", "-p", SERVER_PACKAGE, "--features", "metrics"],
];

#[derive(Parser)]
#[command(author, version, about = "Developer tasks for the Meteorelay workspace")]
struct Cli {
    #[command(subcommand)]
    command: Task,
}

#[derive(Subcommand)]
enum Task {
    #[command(about = "Format the workspace in place")]
    Fmt,
    #[command(about = "Format check, clippy and tests with and without `metrics`")]
    Check,
    #[command(about = "Boot the relay and wait until `/health` reports the socket up")]
    HealthSmoke,
}

fn main() {
    let cli = Cli::parse();

    let Some(workspace_root) = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
    else {
        eprintln!("xtask must live inside the workspace");
        exit(1);
    };

    let passed = match cli.command {
        Task::Fmt => cargo(&workspace_root, &["fmt", "--all"]),
        Task::Check => CHECK_STEPS.iter().all(|args| cargo(&workspace_root, args)),
        Task::HealthSmoke => health_smoke(&workspace_root),
    };

    if !passed {
        exit(1);
    }
}

fn cargo(workspace_root: &Path, args: &[&str]) -> bool {
    match Command::new("cargo")
        .args(args)
        .current_dir(workspace_root)
        .status()
    {
        Ok(status) if status.success() => true,
        Ok(status) => {
            eprintln!("`cargo {}` failed with {status}", args.join(" "));
            false
        }
        Err(err) => {
            eprintln!("failed to spawn cargo: {err}");
            false
        }
    }
}

/// Relay process that is killed when dropped.
struct RelayProcess {
    child: Child,
    base_url: String,
}

impl RelayProcess {
    fn spawn(workspace_root: &Path) -> Option<Self> {
        let port = TcpListener::bind("127.0.0.1:0")
            .and_then(|listener| listener.local_addr())
            .map(|addr| addr.port())
            .map_err(|err| eprintln!("failed to reserve a free TCP port: {err}"))
            .ok()?;
        let bind_addr = format!("127.0.0.1:{port}");

        let child = Command::new("cargo")
            .args(["run", "--quiet", "--features", "metrics", "-p", SERVER_PACKAGE, "--"])
            .args(["--bind-addr", bind_addr.as_str()])
            .args(["--jwt-secret", SMOKE_SECRET])
            .args(["--metrics-enabled", "true"])
            .env("RUST_LOG", "warn")
            .current_dir(workspace_root)
            .spawn()
            .map_err(|err| eprintln!("failed to launch {SERVER_PACKAGE}: {err}"))
            .ok()?;

        Some(Self {
            child,
            base_url: format!("http://{bind_addr}"),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
}

impl Drop for RelayProcess {
    fn drop(&mut self) {
        if let Err(err) = self.child.kill() {
            if err.kind() != std::io::ErrorKind::InvalidInput {
                eprintln!("failed to terminate relay process: {err}");
            }
        }
        let _ = self.child.wait();
    }
}

fn health_smoke(workspace_root: &Path) -> bool {
    if !cargo(
        workspace_root,
        &["build", "--features", "metrics", "-p", SERVER_PACKAGE],
    ) {
        return false;
    }

    let Some(relay) = RelayProcess::spawn(workspace_root) else {
        return false;
    };

    // `/health` holds the request open while the liveness probe polls.
    let client = match Client::builder().timeout(Duration::from_secs(15)).build() {
        Ok(client) => client,
        Err(err) => {
            eprintln!("failed to build HTTP client: {err}");
            return false;
        }
    };

    if !wait_for_socket_up(&client, &relay.url("health"), Duration::from_secs(60)) {
        eprintln!("relay did not report a healthy socket in time");
        return false;
    }
    metrics_exposed(&client, &relay.url("metrics"))
}

fn socket_reported_up(body: &Value) -> bool {
    body["status"] == "ok" && body["info"]["socketServerAvailable"]["status"] == "up"
}

fn wait_for_socket_up(client: &Client, url: &str, budget: Duration) -> bool {
    let deadline = Instant::now() + budget;
    while Instant::now() < deadline {
        if let Ok(response) = client.get(url).send() {
            let status = response.status();
            match response.json::<Value>() {
                Ok(body) if socket_reported_up(&body) => return true,
                Ok(body) => eprintln!("health returned {status}: {body}"),
                Err(err) => eprintln!("failed to decode health body: {err}"),
            }
        }
        sleep(Duration::from_millis(500));
    }
    false
}

fn metrics_exposed(client: &Client, url: &str) -> bool {
    let body = match client.get(url).send() {
        Ok(response) if response.status() == StatusCode::OK => response.text(),
        Ok(response) => {
            eprintln!("unexpected metrics response status: {}", response.status());
            return false;
        }
        Err(err) => {
            eprintln!("failed to call metrics endpoint: {err}");
            return false;
        }
    };

    match body {
        Ok(body) => {
            let missing: Vec<_> = EXPECTED_SERIES
                .iter()
                .filter(|series| !body.contains(**series))
                .collect();
            if !missing.is_empty() {
                eprintln!("metrics endpoint is missing {missing:?}");
            }
            missing.is_empty()
        }
        Err(err) => {
            eprintln!("failed to read metrics body: {err}");
            false
        }
    }
}
