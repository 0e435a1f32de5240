use std::io::BufRead;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use parley_core::{
    default_state_root, ChatStore, ConfigStore, ContextBuilder, SessionRegistry, StatePaths,
    UserStore, DEFAULT_HOST, DEFAULT_PORT,
};
use parley_observability::{
    canonical_logs_dir_from_root, emit_event, init_cli_logging, init_process_logging,
    ObservabilityEvent, ProcessKind,
};
use parley_providers::{ProviderRegistry, GEMINI_PROVIDER_ID};
use parley_server::{serve, AppState, RuntimeState};
use parley_types::ChatMessage;
use tracing::info;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "parley-engine")]
#[command(about = "Parley: a multi-user Gemini chat server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API and web UI.
    Serve {
        #[arg(long, alias = "host", default_value = DEFAULT_HOST)]
        hostname: String,
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// Send a single prompt through the context builder and print the reply.
    Run {
        prompt: String,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// Manage accounts without a running server.
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    /// Import a legacy `saved_chats.json` into an account.
    Import {
        file: PathBuf,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        state_dir: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    Add {
        username: String,
        /// Read from stdin when omitted.
        #[arg(long, env = "PARLEY_USER_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        #[arg(long)]
        state_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
            config,
            api_key,
            model,
        } => {
            let overrides = build_cli_overrides(api_key, model);
            let paths = StatePaths::new(resolve_state_dir(state_dir));
            let logs_dir = canonical_logs_dir_from_root(&paths.root);
            let (_log_guard, log_info) = init_process_logging(ProcessKind::Server, &logs_dir, 14)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Server,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "engine.main",
                    status: Some("ok"),
                    detail: Some("server jsonl logging initialized"),
                    ..Default::default()
                },
            );
            info!("server logging initialized: {:?}", log_info);

            let startup_attempt_id = Uuid::new_v4().to_string();
            let state = AppState::new_starting(startup_attempt_id.clone());
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            log_startup_paths(&paths, &addr, &startup_attempt_id);

            let init_state = state.clone();
            let init_config_path = config.map(PathBuf::from);
            tokio::spawn(async move {
                if let Err(err) =
                    initialize_runtime(init_state.clone(), paths, overrides, init_config_path).await
                {
                    let err_text = format!("{err:#}");
                    init_state
                        .mark_failed("runtime_init", err_text.clone())
                        .await;
                    let detail = format!(
                        "attempt_id={} phase=runtime_init error={}",
                        startup_attempt_id, err_text
                    );
                    emit_event(
                        tracing::Level::ERROR,
                        ProcessKind::Server,
                        ObservabilityEvent {
                            event: "server.startup.failed",
                            component: "engine.main",
                            status: Some("failed"),
                            error_code: Some("ENGINE_STARTUP_FAILED"),
                            detail: Some(&detail),
                            ..Default::default()
                        },
                    );
                }
            });
            serve(addr, state).await?;
        }
        Command::Run {
            prompt,
            state_dir,
            config,
            api_key,
            model,
        } => {
            init_cli_logging();
            let prompt = prompt.trim();
            if prompt.is_empty() {
                anyhow::bail!("Message cannot be empty");
            }
            let overrides = build_cli_overrides(api_key, model);
            let paths = StatePaths::new(resolve_state_dir(state_dir));
            let config_path = config.map(PathBuf::from).unwrap_or(paths.config_path);
            let config = ConfigStore::new(config_path, overrides).await?;
            let effective = config.get().await;
            let builder =
                ContextBuilder::new(effective.chat.system_prompt.clone(), effective.chat.context_window);
            let providers = ProviderRegistry::new(effective.into());
            let request = builder.build(&[], &ChatMessage::user(prompt));
            let reply = providers.default_complete(&request).await?;
            println!("{reply}");
        }
        Command::User {
            command:
                UserCommand::Add {
                    username,
                    password,
                    state_dir,
                },
        } => {
            init_cli_logging();
            let password = match password {
                Some(password) => password,
                None => read_password_line()?,
            };
            let paths = StatePaths::new(resolve_state_dir(state_dir));
            let users = UserStore::new(&paths.storage_dir).await?;
            let username = users.register(&username, &password).await?;
            println!("created user `{username}`");
        }
        Command::Import {
            file,
            owner,
            state_dir,
        } => {
            init_cli_logging();
            let owner = parley_core::normalize_username(&owner)?;
            let paths = StatePaths::new(resolve_state_dir(state_dir));
            let users = UserStore::new(&paths.storage_dir).await?;
            if !users.exists(&owner).await {
                tracing::warn!(
                    "importing into `{}`, which has no account yet; run `user add` to sign in",
                    owner
                );
            }
            let chats = ChatStore::new(&paths.storage_dir).await?;
            let counts = chats
                .import_legacy_file(&file, &owner)
                .await
                .with_context(|| format!("failed to import {}", file.display()))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "owner": owner,
                    "chats": counts.chats,
                    "messages": counts.messages,
                    "skipped": counts.skipped,
                }))?
            );
        }
    }

    Ok(())
}

/// CLI flags become the top config layer, targeting the Gemini provider.
fn build_cli_overrides(
    api_key: Option<String>,
    model: Option<String>,
) -> Option<serde_json::Value> {
    let api_key = api_key.filter(|k| !k.trim().is_empty());
    let model = model.filter(|m| !m.trim().is_empty());
    if api_key.is_none() && model.is_none() {
        return None;
    }

    let mut provider_config = serde_json::Map::new();
    if let Some(k) = api_key {
        provider_config.insert("api_key".to_string(), serde_json::Value::String(k));
    }
    if let Some(m) = model {
        provider_config.insert(
            "default_model".to_string(),
            serde_json::Value::String(m.trim().to_string()),
        );
    }
    let mut providers = serde_json::Map::new();
    providers.insert(
        GEMINI_PROVIDER_ID.to_string(),
        serde_json::Value::Object(provider_config),
    );
    let mut root = serde_json::Map::new();
    root.insert(
        "providers".to_string(),
        serde_json::Value::Object(providers),
    );
    Some(serde_json::Value::Object(root))
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    resolve_state_dir_from(flag, std::env::var("PARLEY_STATE_DIR").ok())
}

fn resolve_state_dir_from(flag: Option<String>, env_dir: Option<String>) -> PathBuf {
    if let Some(dir) = flag.filter(|d| !d.trim().is_empty()) {
        return PathBuf::from(dir);
    }
    if let Some(dir) = env_dir.filter(|d| !d.trim().is_empty()) {
        return PathBuf::from(dir);
    }
    default_state_root().unwrap_or_else(|_| PathBuf::from(".parley"))
}

fn read_password_line() -> anyhow::Result<String> {
    eprint!("password: ");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn log_startup_paths(paths: &StatePaths, addr: &SocketAddr, startup_attempt_id: &str) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting parley-engine on http://{addr}");
    info!(
        "startup paths: attempt_id={} exe={} cwd={} state_dir={} config_path={} storage_dir={}",
        startup_attempt_id,
        exe.display(),
        cwd.display(),
        paths.root.display(),
        paths.config_path.display(),
        paths.storage_dir.display()
    );
}

async fn initialize_runtime(
    state: AppState,
    paths: StatePaths,
    overrides: Option<serde_json::Value>,
    config_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    let attempt_id = state.startup_snapshot().await.attempt_id;
    let init_started = Instant::now();

    let runtime = build_runtime(&paths, Some(&state), overrides, config_path).await?;
    state.mark_ready(runtime).await?;
    let detail = format!(
        "attempt_id={} elapsed_ms={}",
        attempt_id,
        init_started.elapsed().as_millis()
    );
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Server,
        ObservabilityEvent {
            event: "server.startup.ready",
            component: "engine.main",
            status: Some("ok"),
            detail: Some(&detail),
            ..Default::default()
        },
    );
    Ok(())
}

async fn build_runtime(
    paths: &StatePaths,
    startup_state: Option<&AppState>,
    cli_overrides: Option<serde_json::Value>,
    override_config_path: Option<PathBuf>,
) -> anyhow::Result<RuntimeState> {
    let startup = Instant::now();

    enter_phase(startup_state, "config_init").await;
    let phase_start = Instant::now();
    let config_path = override_config_path.unwrap_or_else(|| paths.config_path.clone());
    let config = ConfigStore::new(&config_path, cli_overrides)
        .await
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let effective = config.get().await;
    info!(
        "server.startup.phase config_init elapsed_ms={}",
        phase_start.elapsed().as_millis()
    );

    enter_phase(startup_state, "storage_init").await;
    let phase_start = Instant::now();
    let chats = Arc::new(ChatStore::new(&paths.storage_dir).await?);
    let users = Arc::new(UserStore::new(&paths.storage_dir).await?);
    if users.user_count().await == 0 && !effective.auth.allow_registration {
        tracing::warn!("registration is closed and no users exist; add one with `parley-engine user add`");
    }
    info!(
        "server.startup.phase storage_init elapsed_ms={} chats_file={}",
        phase_start.elapsed().as_millis(),
        chats.path().display()
    );

    enter_phase(startup_state, "provider_init").await;
    let phase_start = Instant::now();
    let sessions = Arc::new(SessionRegistry::new(effective.auth.session_ttl_secs));
    let providers = ProviderRegistry::new(effective.into());
    if providers.is_offline().await {
        tracing::warn!("no Gemini API key configured; replies come from the local echo provider");
    }
    info!(
        "server.startup.phase provider_init elapsed_ms={}",
        phase_start.elapsed().as_millis()
    );
    info!(
        "server.startup.phase runtime_build_complete elapsed_ms={}",
        startup.elapsed().as_millis()
    );

    Ok(RuntimeState {
        chats,
        users,
        sessions,
        config,
        providers,
    })
}

async fn enter_phase(state: Option<&AppState>, phase: &str) {
    let Some(state) = state else {
        return;
    };
    state.set_phase(phase).await;
    let snapshot = state.startup_snapshot().await;
    let detail = format!("attempt_id={} phase={}", snapshot.attempt_id, phase);
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Server,
        ObservabilityEvent {
            event: "server.startup.phase",
            component: "engine.main",
            status: Some("running"),
            detail: Some(&detail),
            ..Default::default()
        },
    );
}
