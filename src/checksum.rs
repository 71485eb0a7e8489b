use std::path::Path;

use anyhow::{Context, Result};
use log::{info, warn};
use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;

use crate::{
    command::ShellCommand,
    confirm::Confirmation,
    executor::{ExecMode, RemoteExecutor},
};

#[derive(Error, Debug)]
pub enum ChecksumError {
    #[error("Некорректная контрольная сумма: {0}")]
    Malformed(String),
    #[error("Контрольная сумма {path} не совпадает, продолжение отклонено")]
    Rejected { path: String },
}

fn normalize(expected: &str) -> Result<String, ChecksumError> {
    let expected = expected.trim().to_ascii_lowercase();
    let pattern = Regex::new(r"^[0-9a-f]{64}$")
        .map_err(|e| ChecksumError::Malformed(e.to_string()))?;
    if !pattern.is_match(&expected) {
        return Err(ChecksumError::Malformed(expected));
    }
    Ok(expected)
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Сверяет сумму и при расхождении спрашивает оператора
fn decide(
    path: &str,
    actual: &str,
    expected: &str,
    confirm: &dyn Confirmation,
) -> Result<()> {
    if actual == expected {
        info!("Контрольная сумма {} совпадает", path);
        return Ok(());
    }

    warn!(
        "Контрольная сумма {} не совпадает: ожидалось {}, получено {}",
        path, expected, actual
    );

    if confirm.confirm(&format!("Файл {} поврежден. Продолжить?", path))? {
        warn!("Продолжаем с непроверенным файлом {}", path);
        Ok(())
    } else {
        Err(ChecksumError::Rejected {
            path: path.to_string(),
        }
        .into())
    }
}

/// Проверяет SHA-256 загруженного на хост файла
pub async fn verify_remote_artifact(
    exec: &dyn RemoteExecutor,
    path: &str,
    expected: &str,
    confirm: &dyn Confirmation,
) -> Result<()> {
    let expected = normalize(expected)?;
    let output = exec
        .execute(&ShellCommand::new("sha256sum").arg(path), ExecMode::Fatal)
        .await
        .with_context(|| format!("Не удалось вычислить контрольную сумму {}", path))?;

    let actual = output
        .stdout
        .split_whitespace()
        .next()
        .map(|s| s.to_ascii_lowercase())
        .ok_or_else(|| ChecksumError::Malformed(output.stdout.clone()))?;

    decide(path, &actual, &expected, confirm)
}

/// Проверяет SHA-256 локального файла
pub async fn verify_local_artifact(
    path: &Path,
    expected: &str,
    confirm: &dyn Confirmation,
) -> Result<()> {
    let expected = normalize(expected)?;
    let data = fs::read(path)
        .await
        .with_context(|| format!("Не удалось прочитать файл {:?}", path))?;

    decide(
        &path.display().to_string(),
        &sha256_hex(&data),
        &expected,
        confirm,
    )
}
