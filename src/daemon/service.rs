// Request dispatch and run loop of the daemon

use crate::config::{ConfigFile, ProcessSpec};
use crate::error::{OverseerError, Result};
use crate::ipc::protocol::{
    Command, ErrorReply, LogRequest, LogSection, LogStream, NameOutcome, ReloadReport,
    ResponseData, Target,
};
use crate::ipc::IpcServer;
use crate::logs::tail_lines;
use crate::process::{InstanceHandle, ReloadAction, Supervisor};
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// SIGINT and SIGTERM, installed up front so registration errors surface at startup
pub struct ShutdownSignals {
    sigterm: Signal,
    sigint: Signal,
}

impl ShutdownSignals {
    pub fn install() -> Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    pub async fn recv(mut self) {
        tokio::select! {
            _ = self.sigterm.recv() => info!("Received SIGTERM"),
            _ = self.sigint.recv() => info!("Received SIGINT"),
        }
    }
}

/// Answers client commands against one Supervisor
pub struct Daemon {
    supervisor: Supervisor,
    config_path: RwLock<Option<PathBuf>>,
    started_at: Instant,
}

impl Daemon {
    pub fn new(supervisor: Supervisor, config_path: Option<PathBuf>) -> Self {
        Self {
            supervisor,
            config_path: RwLock::new(config_path),
            started_at: Instant::now(),
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Start every process declared in `config`, logging rejected declarations
    pub async fn start_declared(&self, config: ConfigFile) -> Vec<NameOutcome<Vec<InstanceHandle>>> {
        let mut outcomes: Vec<_> = config
            .rejected
            .iter()
            .map(|e| {
                warn!("Skipping declaration: {}", e);
                NameOutcome {
                    name: rejected_name(e),
                    result: Err(ErrorReply::from(e)),
                }
            })
            .collect();

        for (name, result) in self.supervisor.start_all(config.specs).await {
            outcomes.push(NameOutcome::new(name, result));
        }
        outcomes
    }

    pub async fn handle_command(&self, command: Command) -> Result<ResponseData> {
        match command {
            Command::Start { target } => self.start(target).await,

            Command::Stop { target: Target::All } => {
                let outcomes = self
                    .supervisor
                    .stop_all()
                    .await
                    .into_iter()
                    .map(|(name, result)| NameOutcome::new(name, result))
                    .collect();
                Ok(ResponseData::Stopped(outcomes))
            }

            Command::Stop {
                target: Target::Name(name),
            } => {
                let outcome = self.supervisor.stop(&name).await;
                Ok(ResponseData::Stopped(vec![NameOutcome::new(name, outcome)]))
            }

            Command::Restart { name } => {
                let handles = self.supervisor.restart(&name).await?;
                Ok(ResponseData::Restarted(handles))
            }

            Command::Status { name } => {
                let statuses = self.supervisor.status(name.as_deref()).await?;
                Ok(ResponseData::Status(statuses))
            }

            Command::Reload { config } => self.reload(config).await,

            Command::Delete { name } => {
                let outcome = self.supervisor.delete(&name).await?;
                Ok(ResponseData::Deleted(outcome))
            }

            Command::Logs(request) => self.logs(request).await,

            Command::Ping => Ok(ResponseData::Pong {
                pid: std::process::id(),
                uptime: self.started_at.elapsed(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            }),
        }
    }

    async fn start(&self, target: Target) -> Result<ResponseData> {
        match target {
            Target::All => {
                let config = self.load_config(None).await?;
                Ok(ResponseData::Started(self.start_declared(config).await))
            }
            Target::Name(name) => {
                // A managed name restarts from its current spec
                let spec = match self.supervisor.spec(&name).await {
                    Ok(spec) => spec.as_ref().clone(),
                    Err(_) => self.declared_spec(&name).await?,
                };
                let result = self.supervisor.start(spec).await;
                Ok(ResponseData::Started(vec![NameOutcome::new(name, result)]))
            }
        }
    }

    async fn declared_spec(&self, name: &str) -> Result<ProcessSpec> {
        let config = self.load_config(None).await?;
        // The first valid declaration wins over any later duplicate
        if let Some(spec) = config.specs.into_iter().find(|spec| spec.name == name) {
            return Ok(spec);
        }
        match config.rejected.into_iter().find(|e| rejected_name(e) == name) {
            Some(rejected) => Err(rejected),
            None => Err(OverseerError::ProcessNotFound(name.to_string())),
        }
    }

    async fn reload(&self, config: Option<PathBuf>) -> Result<ResponseData> {
        let explicit = config.is_some();
        let file = self.load_config(config.as_deref()).await?;
        if explicit {
            *self.config_path.write().await = config;
        }

        let mut reports: Vec<ReloadReport> = Vec::new();
        let mut specs = file.specs;
        let mut kept = HashSet::new();

        // A name with no valid declaration left keeps its running predecessor.
        // A rejected duplicate of a valid declaration is only reported.
        for rejected in &file.rejected {
            let name = rejected_name(rejected);
            warn!("Reload skips {}: {}", name, rejected);
            let declared = specs.iter().any(|spec| spec.name == name);
            if !declared && !kept.contains(&name) {
                if let Ok(current) = self.supervisor.spec(&name).await {
                    specs.push(current.as_ref().clone());
                    kept.insert(name.clone());
                }
            }
            reports.push(ReloadReport {
                name,
                action: ReloadAction::Unchanged,
                error: Some(ErrorReply::from(rejected)),
            });
        }

        for entry in self.supervisor.reload(specs).await {
            if kept.contains(&entry.name) {
                continue;
            }
            reports.push(ReloadReport {
                name: entry.name,
                action: entry.action,
                error: entry.result.err().map(ErrorReply::from),
            });
        }

        Ok(ResponseData::Reloaded(reports))
    }

    async fn logs(&self, request: LogRequest) -> Result<ResponseData> {
        let spec = self.supervisor.spec(&request.name).await?;
        let log_dir = &self.supervisor.settings().log_dir;

        let mut sections = Vec::new();
        for index in 0..spec.instances {
            let paths = spec.log_paths(log_dir, index);
            let selected = match request.stream {
                Some(LogStream::Out) => vec![paths.out],
                Some(LogStream::Err) => vec![paths.err],
                None => vec![paths.out, paths.err],
            };
            for path in selected {
                let lines = tail_lines(&path, request.lines).await?;
                sections.push(LogSection { path, lines });
            }
        }
        Ok(ResponseData::Logs(sections))
    }

    async fn load_config(&self, path: Option<&Path>) -> Result<ConfigFile> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => self.config_path.read().await.clone().ok_or_else(|| {
                OverseerError::InvalidConfig("the daemon was started without --config".to_string())
            })?,
        };
        ConfigFile::load(&path)
    }

    /// Serve IPC requests until `shutdown` resolves, then stop every process
    pub async fn serve<S>(self: Arc<Self>, server: &IpcServer, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let daemon = Arc::clone(&self);
        let served = tokio::select! {
            result = server.run(move |command| {
                let daemon = Arc::clone(&daemon);
                async move { daemon.handle_command(command).await }
            }) => result,
            _ = shutdown => Ok(()),
        };

        info!("Stopping all processes");
        for (name, result) in self.supervisor.shutdown().await {
            if let Err(e) = result {
                error!("Failed to stop {}: {}", name, e);
            }
        }
        served
    }
}

/// Name carried by a rejected declaration
fn rejected_name(error: &OverseerError) -> String {
    match error {
        OverseerError::Validation { name, .. } => name.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::process::{ProcessStatus, SupervisorSettings};
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("ecosystem.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn daemon(dir: &TempDir, config: Option<PathBuf>) -> Daemon {
        let supervisor = Supervisor::new(SupervisorSettings {
            log_dir: dir.path().join("logs"),
            ..SupervisorSettings::default()
        });
        Daemon::new(supervisor, config)
    }

    fn sleeper(dir: &TempDir, name: &str, seconds: u32) -> String {
        format!(
            "[[processes]]\nname = \"{}\"\nscript = \"/bin/sleep\"\nargs = [\"{}\"]\ncwd = \"{}\"\n",
            name,
            seconds,
            dir.path().display()
        )
    }

    #[tokio::test]
    async fn test_ping() {
        let dir = TempDir::new().unwrap();
        match daemon(&dir, None).handle_command(Command::Ping).await.unwrap() {
            ResponseData::Pong { pid, version, .. } => {
                assert_eq!(pid, std::process::id());
                assert_eq!(version, env!("CARGO_PKG_VERSION"));
            }
            other => panic!("Unexpected response {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_all_without_config() {
        let dir = TempDir::new().unwrap();
        let result = daemon(&dir, None)
            .handle_command(Command::Start { target: Target::All })
            .await;
        assert!(matches!(result, Err(OverseerError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_start_by_name_from_config() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir, &(sleeper(&dir, "api", 30) + &sleeper(&dir, "worker", 30)));
        let daemon = daemon(&dir, Some(config));

        let response = daemon
            .handle_command(Command::Start {
                target: Target::Name("worker".to_string()),
            })
            .await
            .unwrap();
        match response {
            ResponseData::Started(outcomes) => {
                assert_eq!(outcomes.len(), 1);
                assert_eq!(outcomes[0].name, "worker");
                assert!(outcomes[0].result.is_ok());
            }
            other => panic!("Unexpected response {:?}", other),
        }
        assert_eq!(daemon.supervisor().names().await, vec!["worker"]);

        let missing = daemon
            .handle_command(Command::Start {
                target: Target::Name("ghost".to_string()),
            })
            .await;
        assert_eq!(missing.unwrap_err().kind(), ErrorKind::NotFound);
        daemon.supervisor().shutdown().await;
    }

    #[tokio::test]
    async fn test_reload_keeps_app_with_invalid_declaration() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir, &sleeper(&dir, "api", 30));
        let daemon = daemon(&dir, Some(config.clone()));
        daemon
            .handle_command(Command::Start { target: Target::All })
            .await
            .unwrap();

        std::fs::write(
            &config,
            sleeper(&dir, "api", 30).replace("[[processes]]", "[[processes]]\ninstances = 0"),
        )
        .unwrap();

        let response = daemon
            .handle_command(Command::Reload { config: None })
            .await
            .unwrap();
        assert_eq!(response.failure_kind(), Some(ErrorKind::InvalidSpec));

        let status = daemon.supervisor().status(Some("api")).await.unwrap();
        assert_eq!(status[0].status, ProcessStatus::Running);
        daemon.supervisor().shutdown().await;
    }

    #[tokio::test]
    async fn test_reload_first_duplicate_declaration_wins() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir, &sleeper(&dir, "api", 30));
        let daemon = daemon(&dir, Some(config.clone()));
        daemon
            .handle_command(Command::Start { target: Target::All })
            .await
            .unwrap();
        let before = daemon.supervisor().status(Some("api")).await.unwrap()[0].pid;

        std::fs::write(&config, sleeper(&dir, "api", 31) + &sleeper(&dir, "api", 32)).unwrap();
        let reports = match daemon
            .handle_command(Command::Reload { config: None })
            .await
            .unwrap()
        {
            ResponseData::Reloaded(reports) => reports,
            other => panic!("Unexpected response {:?}", other),
        };

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.name == "api"));
        let duplicate = reports.iter().find(|r| r.error.is_some()).unwrap();
        assert!(duplicate
            .error
            .as_ref()
            .unwrap()
            .message
            .contains("declared more than once"));
        assert!(reports
            .iter()
            .any(|r| r.action == ReloadAction::Restarted && r.error.is_none()));

        let spec = daemon.supervisor().spec("api").await.unwrap();
        assert_eq!(spec.args, vec!["31"]);
        let status = daemon.supervisor().status(Some("api")).await.unwrap().remove(0);
        assert_eq!(status.restarts, 1);
        assert_ne!(status.pid, before);
        daemon.supervisor().shutdown().await;
    }

    #[tokio::test]
    async fn test_start_by_name_ignores_later_duplicate() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir, &(sleeper(&dir, "api", 31) + &sleeper(&dir, "api", 32)));
        let daemon = daemon(&dir, Some(config));

        daemon
            .handle_command(Command::Start {
                target: Target::Name("api".to_string()),
            })
            .await
            .unwrap();
        let spec = daemon.supervisor().spec("api").await.unwrap();
        assert_eq!(spec.args, vec!["31"]);
        daemon.supervisor().shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_name_errors() {
        let dir = TempDir::new().unwrap();
        let daemon = daemon(&dir, None);
        for command in [
            Command::Restart {
                name: "ghost".to_string(),
            },
            Command::Delete {
                name: "ghost".to_string(),
            },
            Command::Status {
                name: Some("ghost".to_string()),
            },
        ] {
            let error = daemon.handle_command(command).await.unwrap_err();
            assert_eq!(error.kind(), ErrorKind::NotFound);
        }
    }
}
