use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, warn};
use std::process::Stdio;
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt, process::Command};

use crate::command::ShellCommand;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Команда завершилась с ошибкой (код {exit_code}) на {host}: {command}: {stderr}")]
    CommandFailed {
        host: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("Ошибка подключения к {host}: {reason}")]
    Connection { host: String, reason: String },
    #[error("Ошибка передачи файла {local} -> {remote}: {reason}")]
    Transfer {
        local: String,
        remote: String,
        reason: String,
    },
}

/// Как реагировать на ненулевой код возврата
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Ошибка прерывает выполнение
    Fatal,
    /// Ошибка записывается в лог, выполнение продолжается
    WarnOnly,
    /// Ненулевой код - обычный ответ "нет" (например, `test -e`)
    Probe,
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub succeeded: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Исполнитель команд на целевом хосте
///
/// Реализации выполняют ровно одну команду за раз и блокируют вызывающего
/// до ее завершения. Таймаутов нет.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Идентификатор хоста для логов и аудита
    fn host(&self) -> &str;

    /// Выполняет команду и возвращает результат без учета кода возврата
    async fn run(&self, command: &ShellCommand) -> Result<CommandOutput>;

    /// Загружает локальный файл на хост, перезаписывая существующий
    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<()>;

    /// Выполняет команду с заданной политикой обработки ошибок
    async fn execute(&self, command: &ShellCommand, mode: ExecMode) -> Result<CommandOutput> {
        debug!("[{}] {}", self.host(), command);
        let output = self.run(command).await?;

        if output.succeeded {
            return Ok(output);
        }

        match mode {
            ExecMode::Fatal => {
                error!(
                    "[{}] Команда завершилась с ошибкой (код {}): {}",
                    self.host(),
                    output.exit_code,
                    output.stderr.trim()
                );
                Err(ExecError::CommandFailed {
                    host: self.host().to_string(),
                    command: command.render(),
                    exit_code: output.exit_code,
                    stderr: output.stderr.trim().to_string(),
                }
                .into())
            }
            ExecMode::WarnOnly => {
                warn!(
                    "[{}] Команда '{}' завершилась с кодом {}, продолжаем: {}",
                    self.host(),
                    command,
                    output.exit_code,
                    output.stderr.trim()
                );
                Ok(output)
            }
            ExecMode::Probe => Ok(output),
        }
    }

    /// Проверяет наличие пути на хосте
    async fn exists(&self, path: &str) -> Result<bool> {
        let output = self
            .execute(&ShellCommand::test_exists(path), ExecMode::Probe)
            .await?;
        Ok(output.succeeded)
    }
}

/// Выполняет команды на управляющей машине
///
/// Используется для локальной стороны (сборка архивов) и как целевой хост,
/// когда утилита запущена прямо на сервере.
#[derive(Debug, Clone)]
pub struct LocalShell {
    name: String,
}

impl LocalShell {
    pub fn new() -> Self {
        Self {
            name: "localhost".to_string(),
        }
    }
}

impl Default for LocalShell {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteExecutor for LocalShell {
    fn host(&self) -> &str {
        &self.name
    }

    async fn run(&self, command: &ShellCommand) -> Result<CommandOutput> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Не удалось запустить команду: {}", command))?;

        if let (Some(input), Some(mut stdin)) = (&command.stdin, child.stdin.take()) {
            stdin
                .write_all(input.as_bytes())
                .await
                .with_context(|| format!("Не удалось передать данные в stdin: {}", command))?;
        }

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("Не удалось выполнить команду: {}", command))?;

        Ok(CommandOutput {
            succeeded: output.status.success(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let dest = Path::new(remote_path);
        // Как и scp, загрузка в существующую директорию кладет файл внутрь нее
        let dest = if fs::metadata(dest).await.map(|m| m.is_dir()).unwrap_or(false) {
            let file_name = local_path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("Не удалось получить имя файла из пути"))?;
            dest.join(file_name)
        } else {
            dest.to_path_buf()
        };

        fs::copy(local_path, &dest).await.map_err(|e| ExecError::Transfer {
            local: local_path.display().to_string(),
            remote: dest.display().to_string(),
            reason: e.to_string(),
        })?;

        debug!("Файл {:?} скопирован в {:?}", local_path, dest);
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use std::{
        collections::HashSet,
        path::PathBuf,
        sync::Mutex,
    };

    use super::*;

    /// Исполнитель-заглушка: записывает команды и отвечает по таблице путей
    #[derive(Default)]
    pub struct RecordingExecutor {
        pub commands: Mutex<Vec<String>>,
        pub uploads: Mutex<Vec<(PathBuf, String)>>,
        pub existing: Mutex<HashSet<String>>,
        pub failing: Mutex<HashSet<String>>,
    }

    impl RecordingExecutor {
        pub fn with_existing(paths: &[&str]) -> Self {
            let exec = Self::default();
            exec.existing
                .lock()
                .unwrap()
                .extend(paths.iter().map(|p| p.to_string()));
            exec
        }

        /// Команды, начинающиеся с `prefix`, будут завершаться с ошибкой
        pub fn fail_on(&self, prefix: &str) {
            self.failing.lock().unwrap().insert(prefix.to_string());
        }

        pub fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }

        /// Команды без проверок `test -e`
        pub fn mutations(&self) -> Vec<String> {
            self.commands()
                .into_iter()
                .filter(|c| !c.starts_with("test "))
                .collect()
        }
    }

    #[async_trait]
    impl RemoteExecutor for RecordingExecutor {
        fn host(&self) -> &str {
            "recording"
        }

        async fn run(&self, command: &ShellCommand) -> Result<CommandOutput> {
            let line = command.render();
            self.commands.lock().unwrap().push(line.clone());

            if command.program == "test" {
                let path = command.args.last().cloned().unwrap_or_default();
                let found = self.existing.lock().unwrap().contains(&path);
                return Ok(CommandOutput {
                    succeeded: found,
                    exit_code: if found { 0 } else { 1 },
                    ..Default::default()
                });
            }

            let failed = self
                .failing
                .lock()
                .unwrap()
                .iter()
                .any(|prefix| line.starts_with(prefix));

            Ok(CommandOutput {
                succeeded: !failed,
                exit_code: if failed { 2 } else { 0 },
                stdout: String::new(),
                stderr: if failed { "simulated failure".to_string() } else { String::new() },
            })
        }

        async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<()> {
            self.uploads
                .lock()
                .unwrap()
                .push((local_path.to_path_buf(), remote_path.to_string()));
            Ok(())
        }
    }
}
