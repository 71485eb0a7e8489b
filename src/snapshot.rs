//! Снимки защищаемых ресурсов
//!
//! Перед первой модификацией ресурса (директории с конфигурацией, webroot,
//! домашней директории) его содержимое сохраняется в архив в директории
//! бекапов на целевом хосте. Восстановление полностью заменяет текущее
//! содержимое ресурса содержимым архива и удаляет архив.
//!
//! Для ресурса существует не более одного архива: повторный бекап ничего не
//! делает, поэтому архив всегда хранит исходное состояние, а не состояние
//! после предыдущего запуска настройки.

use anyhow::{Context, Result};
use log::{debug, info};
use thiserror::Error;

use crate::{
    command::ShellCommand,
    executor::{ExecMode, RemoteExecutor},
};

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Архив {archive} находится внутри ресурса {resource}: восстановление удалило бы архив")]
    ArchiveInsideResource { archive: String, resource: String },
}

/// Совпадает ли `path` с `dir` или лежит внутри него (пути сравниваются как текст)
pub fn is_within(path: &str, dir: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    let path = path.trim_end_matches('/');
    dir.is_empty() || path == dir || path.starts_with(&format!("{}/", dir))
}

fn check_layout(resource_path: &str, archive_path: &str) -> Result<(), SnapshotError> {
    if is_within(archive_path, resource_path) {
        return Err(SnapshotError::ArchiveInsideResource {
            archive: archive_path.to_string(),
            resource: resource_path.to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    /// Абсолютный путь к защищаемому ресурсу на хосте
    pub resource_path: String,
    /// Абсолютный путь к каноническому архиву ресурса
    pub archive_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionState {
    Unprotected,
    Protected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupOutcome {
    Created,
    /// Архив уже существует, исходное состояние сохранено ранее
    AlreadyProtected,
    /// Ресурса нет на хосте, сохранять нечего
    MissingResource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored,
    /// Архива нет, восстанавливать нечего
    NothingToRestore,
}

impl SnapshotRecord {
    pub fn new(resource_path: &str, archive_path: &str) -> Self {
        Self {
            resource_path: resource_path.to_string(),
            archive_path: archive_path.to_string(),
        }
    }

    /// Проверяет наличие архива на хосте
    pub async fn state(&self, exec: &dyn RemoteExecutor) -> Result<ProtectionState> {
        if exec.exists(&self.archive_path).await? {
            Ok(ProtectionState::Protected)
        } else {
            Ok(ProtectionState::Unprotected)
        }
    }

    /// Сохраняет содержимое ресурса в архив, если архива еще нет
    pub async fn backup(&self, exec: &dyn RemoteExecutor) -> Result<BackupOutcome> {
        backup(exec, &self.resource_path, &self.archive_path).await
    }

    /// Восстанавливает ресурс из архива, если архив есть
    pub async fn restore(&self, exec: &dyn RemoteExecutor) -> Result<RestoreOutcome> {
        restore(exec, &self.resource_path, &self.archive_path).await
    }
}

/// Создает архив `resource_path` в `archive_path`
///
/// Ничего не делает, если архив уже существует или ресурса нет.
/// Ошибки tar прерывают выполнение; частично записанный архив не удаляется.
pub async fn backup(
    exec: &dyn RemoteExecutor,
    resource_path: &str,
    archive_path: &str,
) -> Result<BackupOutcome> {
    check_layout(resource_path, archive_path)?;

    if exec.exists(archive_path).await? {
        debug!(
            "Архив {} уже существует, бекап {} не требуется",
            archive_path, resource_path
        );
        return Ok(BackupOutcome::AlreadyProtected);
    }

    if !exec.exists(resource_path).await? {
        debug!("{} не существует, бекап не требуется", resource_path);
        return Ok(BackupOutcome::MissingResource);
    }

    exec.execute(
        &ShellCommand::tar_create_contents(archive_path, resource_path),
        ExecMode::Fatal,
    )
    .await
    .with_context(|| format!("Не удалось создать бекап {} в {}", resource_path, archive_path))?;

    info!("Создан бекап {} -> {}", resource_path, archive_path);
    Ok(BackupOutcome::Created)
}

/// Заменяет содержимое `resource_path` содержимым архива и удаляет архив
///
/// Если распаковка прервется после удаления ресурса, ресурс останется
/// пустым или заполненным частично, но архив сохранится для повторной попытки.
pub async fn restore(
    exec: &dyn RemoteExecutor,
    resource_path: &str,
    archive_path: &str,
) -> Result<RestoreOutcome> {
    check_layout(resource_path, archive_path)?;

    if !exec.exists(archive_path).await? {
        debug!(
            "Архив {} не найден, восстановление {} не требуется",
            archive_path, resource_path
        );
        return Ok(RestoreOutcome::NothingToRestore);
    }

    info!("Восстановление {} из {}...", resource_path, archive_path);

    exec.execute(&ShellCommand::remove_all(resource_path), ExecMode::Fatal)
        .await
        .with_context(|| format!("Не удалось удалить {}", resource_path))?;
    exec.execute(&ShellCommand::mkdir_p(resource_path), ExecMode::Fatal)
        .await
        .with_context(|| format!("Не удалось создать {}", resource_path))?;
    exec.execute(
        &ShellCommand::tar_extract(archive_path, resource_path),
        ExecMode::Fatal,
    )
    .await
    .with_context(|| {
        format!(
            "Не удалось распаковать {} в {}, архив сохранен для повторной попытки",
            archive_path, resource_path
        )
    })?;
    exec.execute(&ShellCommand::remove_file(archive_path), ExecMode::Fatal)
        .await
        .with_context(|| format!("Не удалось удалить использованный архив {}", archive_path))?;

    info!("{} восстановлен из бекапа", resource_path);
    Ok(RestoreOutcome::Restored)
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path};

    use super::*;
    use crate::executor::{testing::RecordingExecutor, LocalShell};
    use tempfile::TempDir;

    fn path_str(path: &Path) -> String {
        path.to_str().unwrap().to_string()
    }

    fn sandbox() -> (TempDir, SnapshotRecord) {
        let dir = TempDir::new().unwrap();
        let www = dir.path().join("var/www");
        fs::create_dir_all(www.join("apache")).unwrap();
        fs::write(www.join("index.html"), "<h1>original</h1>").unwrap();
        fs::write(www.join("apache/vhost.conf"), "ServerName localhost").unwrap();
        fs::create_dir_all(dir.path().join("var/backup")).unwrap();

        let record = SnapshotRecord::new(
            &path_str(&www),
            &path_str(&dir.path().join("var/backup/webroot.tar.gz")),
        );
        (dir, record)
    }

    #[tokio::test]
    async fn test_webroot_scenario() {
        let (_dir, record) = sandbox();
        let shell = LocalShell::new();
        let www = Path::new(&record.resource_path);

        assert_eq!(record.state(&shell).await.unwrap(), ProtectionState::Unprotected);
        assert_eq!(record.backup(&shell).await.unwrap(), BackupOutcome::Created);
        assert!(Path::new(&record.archive_path).exists());
        assert_eq!(record.state(&shell).await.unwrap(), ProtectionState::Protected);

        fs::remove_dir_all(www).unwrap();

        assert_eq!(record.restore(&shell).await.unwrap(), RestoreOutcome::Restored);
        assert_eq!(
            fs::read_to_string(www.join("index.html")).unwrap(),
            "<h1>original</h1>"
        );
        assert!(www.join("apache").is_dir());
        assert_eq!(
            fs::read_to_string(www.join("apache/vhost.conf")).unwrap(),
            "ServerName localhost"
        );
        assert!(!Path::new(&record.archive_path).exists());
        assert_eq!(record.state(&shell).await.unwrap(), ProtectionState::Unprotected);
    }

    #[tokio::test]
    async fn test_second_backup_keeps_original_state() {
        let (_dir, record) = sandbox();
        let shell = LocalShell::new();
        let www = Path::new(&record.resource_path);

        record.backup(&shell).await.unwrap();
        let first = fs::read(&record.archive_path).unwrap();

        fs::write(www.join("index.html"), "<h1>modified</h1>").unwrap();
        assert_eq!(
            record.backup(&shell).await.unwrap(),
            BackupOutcome::AlreadyProtected
        );
        assert_eq!(fs::read(&record.archive_path).unwrap(), first);

        record.restore(&shell).await.unwrap();
        assert_eq!(
            fs::read_to_string(www.join("index.html")).unwrap(),
            "<h1>original</h1>"
        );
    }

    #[tokio::test]
    async fn test_restore_replaces_without_merge() {
        let (_dir, record) = sandbox();
        let shell = LocalShell::new();
        let www = Path::new(&record.resource_path);

        record.backup(&shell).await.unwrap();
        fs::write(www.join("added-later.txt"), "new").unwrap();

        record.restore(&shell).await.unwrap();
        assert!(!www.join("added-later.txt").exists());
        assert!(www.join("index.html").exists());
    }

    #[tokio::test]
    async fn test_backup_of_missing_resource_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let record = SnapshotRecord::new(
            &path_str(&dir.path().join("absent")),
            &path_str(&dir.path().join("absent.tar.gz")),
        );

        assert_eq!(
            record.backup(&LocalShell::new()).await.unwrap(),
            BackupOutcome::MissingResource
        );
        assert!(!Path::new(&record.archive_path).exists());
    }

    #[tokio::test]
    async fn test_restore_without_archive_leaves_resource_untouched() {
        let (_dir, record) = sandbox();
        let www = Path::new(&record.resource_path);
        fs::write(www.join("index.html"), "<h1>current</h1>").unwrap();

        assert_eq!(
            record.restore(&LocalShell::new()).await.unwrap(),
            RestoreOutcome::NothingToRestore
        );
        assert_eq!(
            fs::read_to_string(www.join("index.html")).unwrap(),
            "<h1>current</h1>"
        );
    }

    #[tokio::test]
    async fn test_backup_is_a_single_tar_invocation() {
        let exec = RecordingExecutor::with_existing(&["/etc/nginx"]);

        backup(&exec, "/etc/nginx", "/var/backup/nginx.tar.gz")
            .await
            .unwrap();

        assert_eq!(
            exec.mutations(),
            vec!["tar -czf /var/backup/nginx.tar.gz -C /etc/nginx ."]
        );
    }

    #[tokio::test]
    async fn test_existing_archive_skips_tar() {
        let exec = RecordingExecutor::with_existing(&["/etc/nginx", "/var/backup/nginx.tar.gz"]);

        let outcome = backup(&exec, "/etc/nginx", "/var/backup/nginx.tar.gz")
            .await
            .unwrap();

        assert_eq!(outcome, BackupOutcome::AlreadyProtected);
        assert!(exec.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_restore_command_order() {
        let exec = RecordingExecutor::with_existing(&["/var/backup/nginx.tar.gz"]);

        restore(&exec, "/etc/nginx", "/var/backup/nginx.tar.gz")
            .await
            .unwrap();

        assert_eq!(
            exec.mutations(),
            vec![
                "rm -rf /etc/nginx",
                "mkdir -p /etc/nginx",
                "tar -xzf /var/backup/nginx.tar.gz -C /etc/nginx",
                "rm -f /var/backup/nginx.tar.gz",
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_extraction_keeps_archive() {
        let exec = RecordingExecutor::with_existing(&["/var/backup/nginx.tar.gz"]);
        exec.fail_on("tar -xzf");

        let result = restore(&exec, "/etc/nginx", "/var/backup/nginx.tar.gz").await;

        assert!(result.is_err());
        assert!(!exec
            .mutations()
            .iter()
            .any(|c| c.starts_with("rm -f /var/backup/nginx.tar.gz")));
    }

    #[tokio::test]
    async fn test_archive_inside_resource_is_refused() {
        let dir = TempDir::new().unwrap();
        let srv = dir.path().join("srv");
        fs::create_dir_all(srv.join("backup")).unwrap();
        fs::write(srv.join("index.html"), "<h1>live</h1>").unwrap();
        let archive = srv.join("backup/srv.tar.gz");
        fs::write(&archive, b"earlier snapshot").unwrap();
        let record = SnapshotRecord::new(&path_str(&srv), &path_str(&archive));
        let shell = LocalShell::new();

        let err = record.restore(&shell).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SnapshotError>(),
            Some(SnapshotError::ArchiveInsideResource { .. })
        ));
        assert!(record.backup(&shell).await.is_err());

        assert_eq!(fs::read(&archive).unwrap(), b"earlier snapshot");
        assert_eq!(
            fs::read_to_string(srv.join("index.html")).unwrap(),
            "<h1>live</h1>"
        );
    }

    #[tokio::test]
    async fn test_overlapping_layout_runs_no_commands() {
        let exec = RecordingExecutor::with_existing(&["/srv/backup/srv.tar.gz", "/srv"]);

        assert!(restore(&exec, "/srv/", "/srv/backup/srv.tar.gz").await.is_err());
        assert!(backup(&exec, "/", "/root/backup/root.tar.gz").await.is_err());
        assert!(exec.commands().is_empty());
    }

    #[test]
    fn test_is_within() {
        assert!(is_within("/srv/backup", "/srv"));
        assert!(is_within("/srv", "/srv/"));
        assert!(is_within("/root/backup", "/"));
        assert!(!is_within("/srv-old/backup", "/srv"));
        assert!(!is_within("/root/backup", "/var/www"));
    }
}
