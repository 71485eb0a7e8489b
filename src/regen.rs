use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use log::{debug, info};
use tokio::fs;

use crate::{
    command::ShellCommand,
    config::ProvisionConfig,
    executor::{ExecMode, LocalShell, RemoteExecutor},
};

/// Суффикс, добавляемый к имени предыдущей версии архива
pub const VERSION_SUFFIX: &str = ".tar.gz.bak.";

async fn path_exists(path: &Path) -> Result<bool> {
    fs::try_exists(path)
        .await
        .with_context(|| format!("Не удалось проверить наличие {:?}", path))
}

/// Путь, под которым сохраняется предыдущая версия архива
///
/// Если версия с этой меткой времени уже есть, к имени добавляется счетчик.
async fn versioned_name(archive_path: &Path, timestamp: &str) -> Result<PathBuf> {
    let base = format!("{}{}{}", archive_path.display(), VERSION_SUFFIX, timestamp);

    let mut candidate = PathBuf::from(&base);
    let mut counter = 1;
    while path_exists(&candidate).await? {
        candidate = PathBuf::from(format!("{}-{}", base, counter));
        counter += 1;
    }
    Ok(candidate)
}

/// Пересобирает архив `source_dir` в `archive_path`, сохраняя прежнюю версию
///
/// Существующий архив переименовывается с меткой времени и никогда не
/// перезаписывается. Новый архив собирается только если `source_dir` существует;
/// верхний уровень архива - имя самой директории.
///
/// Возвращает путь, куда была перенесена предыдущая версия.
pub async fn regenerate_versioned(
    shell: &LocalShell,
    source_dir: &Path,
    archive_path: &Path,
) -> Result<Option<PathBuf>> {
    let mut previous = None;

    if path_exists(archive_path).await? {
        let timestamp = Local::now().format("%Y-%m-%d_%H%M%S").to_string();
        let target = versioned_name(archive_path, &timestamp).await?;
        fs::rename(archive_path, &target).await.with_context(|| {
            format!(
                "Не удалось переименовать {:?} в {:?}",
                archive_path, target
            )
        })?;
        debug!("Предыдущая версия сохранена: {:?}", target);
        previous = Some(target);
    }

    if let Some(parent) = archive_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Не удалось создать директорию: {:?}", parent))?;
        }
    }

    if !path_exists(source_dir).await? {
        debug!("{:?} не существует, архив не собирается", source_dir);
        return Ok(previous);
    }

    let parent = match source_dir.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = source_dir
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Не удалось получить имя директории {:?}", source_dir))?;

    // tar выполняется из другой директории, поэтому путь к архиву делаем абсолютным
    let archive_abs = if archive_path.is_absolute() {
        archive_path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("Не удалось определить текущую директорию")?
            .join(archive_path)
    };

    shell
        .execute(
            &ShellCommand::tar_create_named(
                &archive_abs.to_string_lossy(),
                &parent.to_string_lossy(),
                &name.to_string_lossy(),
            ),
            ExecMode::Fatal,
        )
        .await
        .with_context(|| format!("Не удалось собрать архив {:?}", archive_path))?;

    info!("Собран архив {:?}", archive_path);
    Ok(previous)
}

/// Пересобирает все архивы конфигурации из `[[tarballs]]`
///
/// Архив `<local_config_dir>/<srcdir>/<source>` попадает в
/// `<local_tar_dir>/<srcdir>/<source>.tar.gz`.
pub async fn regen_tarballs(config: &ProvisionConfig, shell: &LocalShell) -> Result<()> {
    info!("Пересборка архивов конфигурации...");

    for dir in [&config.paths.local_backup_dir, &config.paths.local_tar_dir] {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Не удалось создать директорию: {:?}", dir))?;
    }

    for tarball in &config.tarballs {
        let (source, archive) = tarball_paths(config, &tarball.srcdir, &tarball.source);
        regenerate_versioned(shell, &source, &archive).await?;
    }

    info!("Архивы конфигурации пересобраны");
    Ok(())
}

/// Пути к исходной директории и архиву для записи `[[tarballs]]`
pub fn tarball_paths(config: &ProvisionConfig, srcdir: &str, source: &str) -> (PathBuf, PathBuf) {
    let source_dir = config.paths.local_config_dir.join(srcdir).join(source);
    let archive = config
        .paths
        .local_tar_dir
        .join(srcdir)
        .join(format!("{}.tar.gz", source));
    (source_dir, archive)
}
