use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use lua_dap::runtime::{debug_lua, load_script};
use lua_dap::{DebugError, DebugSession, PipeTransport, SessionOptions, TcpTransport, Transport};
use lua_dap_config::{Endpoint, LuaDapConfig};

/// Runs a Lua 5.4 script under an in-process Debug Adapter Protocol debugger.
#[derive(Debug, Parser)]
#[command(name = "lua-dap", version, about)]
struct Cli {
    /// Script to debug.
    script: PathBuf,

    /// Path to a JSON config file.
    ///
    /// If unset, `LUA_DAP_CONFIG` is used as a fallback. When neither are
    /// provided the adapter uses in-memory defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the configured endpoint (`stdio` or `tcp://host:port`).
    #[arg(long)]
    endpoint: Option<String>,

    /// Stop on the first line even if the client does not ask to.
    #[arg(long)]
    stop_on_entry: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = load_config(cli.config.clone());
    lua_dap::hardening::init(&config.effective_logging());

    match run(&cli, &config) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) if config.test_mode => ExitCode::FAILURE,
        Ok(false) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(target: "lua_dap", error = %format!("{err:#}"), "lua-dap failed");
            eprintln!("lua-dap: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// `Ok(false)` when the script itself failed.
fn run(cli: &Cli, config: &LuaDapConfig) -> anyhow::Result<bool> {
    let endpoint = match &cli.endpoint {
        Some(endpoint) => Endpoint::parse(endpoint)?,
        None => config.endpoint()?,
    };
    let script = std::fs::canonicalize(&cli.script)
        .with_context(|| format!("script {} not found", cli.script.display()))?;

    let mut options = SessionOptions::from_config(config);
    options.stop_on_entry = cli.stop_on_entry;

    let transport = open_transport(&endpoint)?;
    let lua = debug_lua();
    let session = attach(&lua, transport, options)?;

    let succeeded = run_script(&lua, &session, &script);
    session.deinit();
    Ok(succeeded)
}

/// Connects the session and serves the configuration phase.
fn attach(
    lua: &mlua::Lua,
    transport: Box<dyn Transport>,
    options: SessionOptions,
) -> anyhow::Result<DebugSession> {
    // `DebugError` holds a non-`Send` Lua error, so it is rendered here.
    let session = DebugSession::connect(lua, transport, options)
        .map_err(|err| anyhow::anyhow!("failed to attach the debugger: {err}"))?;
    match session.init() {
        Ok(()) => {}
        Err(DebugError::Disconnected) => {
            tracing::info!(target: "lua_dap", "client left before launch; running undebugged");
        }
        Err(err) => anyhow::bail!("debug session setup failed: {err}"),
    }
    Ok(session)
}

fn run_script(lua: &mlua::Lua, session: &DebugSession, script: &Path) -> bool {
    let result = load_script(lua, script).and_then(|main| Ok(main.call::<()>(())?));
    match result {
        Ok(()) => true,
        Err(err) => {
            if session.was_terminated() {
                tracing::info!(target: "lua_dap", "script terminated by the client");
            } else {
                tracing::warn!(target: "lua_dap", error = %err, "script failed");
                if let DebugError::Lua(err) = &err {
                    session.report_fatal_error(err);
                }
            }
            false
        }
    }
}

fn open_transport(endpoint: &Endpoint) -> anyhow::Result<Box<dyn Transport>> {
    Ok(match endpoint {
        Endpoint::Stdio => Box::new(PipeTransport::stdio().context("failed to open stdio")?),
        Endpoint::Tcp { host, port } => Box::new(
            TcpTransport::connect(host, *port)
                .with_context(|| format!("failed to connect to {host}:{port}"))?,
        ),
    })
}

fn load_config(cli_path: Option<PathBuf>) -> LuaDapConfig {
    let path = cli_path.or_else(|| std::env::var_os("LUA_DAP_CONFIG").map(PathBuf::from));
    let Some(path) = path else {
        return LuaDapConfig::default();
    };

    match LuaDapConfig::load_from_path(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!(
                "lua-dap: failed to load config from {}: {err}; continuing with defaults",
                path.display()
            );
            LuaDapConfig::default()
        }
    }
}
