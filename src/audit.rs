use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use log::debug;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    command::ShellCommand,
    executor::{CommandOutput, RemoteExecutor},
};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditLog {
    pub id: String,
    pub timestamp: DateTime<Local>,
    pub host: String,
    pub command: String,
    pub status: String,
    pub exit_code: Option<i32>,
    pub details: Option<String>,
}

impl AuditLog {
    pub fn new(
        host: &str,
        command: &str,
        status: &str,
        exit_code: Option<i32>,
        details: Option<&str>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Local::now(),
            host: host.to_string(),
            command: command.to_string(),
            status: status.to_string(),
            exit_code,
            details: details.map(|s| s.to_string()),
        }
    }
}

/// Записывает информацию аудита в журнал (одна JSON-строка на событие)
pub fn log_audit_event(audit_log: &AuditLog, log_file: &Path) -> Result<()> {
    if let Some(parent) = log_file.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Не удалось создать директорию для аудита: {:?}", parent)
            })?;
        }
    }

    let log_json =
        serde_json::to_string(audit_log).with_context(|| "Не удалось сериализовать лог аудита")?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("Не удалось открыть файл журнала аудита: {:?}", log_file))?;

    writeln!(file, "{}", log_json).with_context(|| "Не удалось записать лог аудита в файл")?;

    debug!("Записан аудит: {} - {}", audit_log.command, audit_log.status);

    Ok(())
}

/// Исполнитель, записывающий каждую команду в журнал аудита
pub struct Audited<E> {
    inner: E,
    log_file: PathBuf,
}

impl<E: RemoteExecutor> Audited<E> {
    pub fn new(inner: E, log_file: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            log_file: log_file.into(),
        }
    }

    fn record(
        &self,
        command: &str,
        status: &str,
        exit_code: Option<i32>,
        details: Option<&str>,
    ) -> Result<()> {
        let entry = AuditLog::new(self.inner.host(), command, status, exit_code, details);
        log_audit_event(&entry, &self.log_file)
    }
}

#[async_trait]
impl<E: RemoteExecutor> RemoteExecutor for Audited<E> {
    fn host(&self) -> &str {
        self.inner.host()
    }

    async fn run(&self, command: &ShellCommand) -> Result<CommandOutput> {
        let rendered = command.render();
        match self.inner.run(command).await {
            Ok(output) => {
                let status = if output.succeeded { "success" } else { "error" };
                let stderr = output.stderr.trim();
                self.record(
                    &rendered,
                    status,
                    Some(output.exit_code),
                    (!stderr.is_empty()).then_some(stderr),
                )?;
                Ok(output)
            }
            Err(e) => {
                self.record(&rendered, "error", None, Some(&format!("{:#}", e)))?;
                Err(e)
            }
        }
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let description = format!("upload {} -> {}", local_path.display(), remote_path);
        let result = self.inner.upload(local_path, remote_path).await;
        match &result {
            Ok(()) => self.record(&description, "success", None, None)?,
            Err(e) => self.record(&description, "error", None, Some(&format!("{:#}", e)))?,
        }
        result
    }
}
