use std::ops::Deref;
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;

use parley_core::{ChatStore, ConfigStore, ContextBuilder, SessionRegistry, UserStore};
use parley_providers::ProviderRegistry;

mod http;
mod webui;

pub use http::{app_router, serve};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn build_id() -> String {
    if let Some(explicit) = option_env!("PARLEY_BUILD_ID") {
        let trimmed = explicit.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    env!("CARGO_PKG_VERSION").to_string()
}

#[derive(Clone)]
pub struct RuntimeState {
    pub chats: Arc<ChatStore>,
    pub users: Arc<UserStore>,
    pub sessions: Arc<SessionRegistry>,
    pub config: ConfigStore,
    pub providers: ProviderRegistry,
}

impl RuntimeState {
    /// Built per turn so runtime config patches apply to the next message.
    pub async fn context_builder(&self) -> ContextBuilder {
        let chat = self.config.get().await.chat;
        ContextBuilder::new(chat.system_prompt, chat.context_window)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStatus {
    Starting,
    Ready,
    Failed,
}

impl StartupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StartupStatus::Starting => "starting",
            StartupStatus::Ready => "ready",
            StartupStatus::Failed => "failed",
        }
    }
}

/// Startup progress as reported by `/global/health` and the startup gate.
#[derive(Debug, Clone)]
pub struct StartupState {
    pub status: StartupStatus,
    pub phase: String,
    pub started_at_ms: u64,
    pub attempt_id: String,
    pub last_error: Option<String>,
}

impl StartupState {
    fn begin(attempt_id: String) -> Self {
        Self {
            status: StartupStatus::Starting,
            phase: "boot".to_string(),
            started_at_ms: now_ms(),
            attempt_id,
            last_error: None,
        }
    }

    fn snapshot(&self) -> StartupSnapshot {
        StartupSnapshot {
            status: self.status,
            phase: self.phase.clone(),
            attempt_id: self.attempt_id.clone(),
            last_error: self.last_error.clone(),
            elapsed_ms: now_ms().saturating_sub(self.started_at_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StartupSnapshot {
    pub status: StartupStatus,
    pub phase: String,
    pub attempt_id: String,
    pub last_error: Option<String>,
    pub elapsed_ms: u64,
}

/// Shared handle given to every request. The runtime is filled in once
/// startup finishes; until then the startup gate answers 503.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<OnceLock<RuntimeState>>,
    pub startup: Arc<RwLock<StartupState>>,
}

impl AppState {
    pub fn new_starting(attempt_id: String) -> Self {
        Self {
            runtime: Arc::new(OnceLock::new()),
            startup: Arc::new(RwLock::new(StartupState::begin(attempt_id))),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.runtime.get().is_some()
    }

    pub async fn startup_snapshot(&self) -> StartupSnapshot {
        self.startup.read().await.snapshot()
    }

    pub async fn set_phase(&self, phase: impl Into<String>) {
        self.startup.write().await.phase = phase.into();
    }

    pub async fn mark_ready(&self, runtime: RuntimeState) -> anyhow::Result<()> {
        if self.runtime.set(runtime).is_err() {
            anyhow::bail!("runtime already initialized");
        }
        let mut startup = self.startup.write().await;
        startup.status = StartupStatus::Ready;
        startup.phase = "ready".to_string();
        startup.last_error = None;
        Ok(())
    }

    /// Startup cannot be retried in-process; the gate keeps answering 503
    /// with `ENGINE_STARTUP_FAILED` until the server is restarted.
    pub async fn mark_failed(&self, phase: impl Into<String>, error: impl Into<String>) {
        let mut startup = self.startup.write().await;
        *startup = StartupState {
            status: StartupStatus::Failed,
            phase: phase.into(),
            last_error: Some(error.into()),
            ..startup.clone()
        };
    }
}

impl Deref for AppState {
    type Target = RuntimeState;

    fn deref(&self) -> &Self::Target {
        self.runtime
            .get()
            .expect("runtime is only reachable behind the startup gate")
    }
}
