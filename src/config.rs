use std::{
    collections::HashSet,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::info;
use rand::{thread_rng, Rng};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;

use crate::snapshot::{is_within, SnapshotRecord};

pub const DEFAULT_CONFIG_FILE: &str = "provision.toml";
pub const CONFIG_ENV: &str = "PROVISION_CONFIG";
pub const ENCRYPTION_KEY_ENV: &str = "PROVISION_ENCRYPTION_KEY";

/// Префикс зашифрованных значений в конфигурации
pub const ENCRYPTED_PREFIX: &str = "enc:";

// Имена защищаемых ресурсов, с которыми работают задачи настройки
pub const WEBROOT_RESOURCE: &str = "webroot";
pub const APACHE_RESOURCE: &str = "apache2";
pub const NGINX_RESOURCE: &str = "nginx";
pub const TLS_RESOURCE: &str = "tls";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Ошибка шифрования: {0}")]
    EncryptionError(String),
    #[error("Недопустимое имя {kind}: {value}")]
    InvalidName { kind: &'static str, value: String },
    #[error("Ресурс {0} не найден в конфигурации")]
    UnknownResource(String),
    #[error("Ресурс {0} описан несколько раз")]
    DuplicateResource(String),
    #[error("Путь {0} должен быть абсолютным и не содержать '..'")]
    RelativePath(String),
    #[error("Директория бекапов {backup_dir} находится внутри ресурса {resource}")]
    BackupInsideResource { resource: String, backup_dir: String },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HostConfig {
    pub hostname: String,
    pub port: u16,
    /// Пользователь, от имени которого выполняются команды (обычно root)
    pub user: String,
    /// Приватный ключ; если не указан, используется ssh-agent
    pub identity_file: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PathsConfig {
    pub remote_backup_dir: String,
    pub remote_config_dir: String,
    pub local_config_dir: PathBuf,
    pub local_tar_dir: PathBuf,
    pub local_backup_dir: PathBuf,
    pub audit_log: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AccountsConfig {
    /// Объединяет deploy и main в одну учетную запись
    pub single_user_mode: bool,
    pub deploy_username: String,
    pub main_username: String,
    pub server_groupname: String,
    pub team_groupname: String,
    pub team_users: Vec<String>,
    pub team_sudo_cmds: Vec<String>,
    pub deploy_password: Option<String>,
    pub main_password: Option<String>,
    pub team_password: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ResourceConfig {
    pub name: String,
    pub path: String,
}

/// Архив конфигурации, собираемый локально: `<local_config_dir>/<srcdir>/<source>`
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TarballConfig {
    pub srcdir: String,
    pub source: String,
}

/// Директория веб-приложений и виртуальные окружения внутри нее
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WebappsConfig {
    pub location: String,
    pub virtual_environments: Vec<String>,
}

impl Default for WebappsConfig {
    fn default() -> Self {
        Self {
            location: "/srv/webapps".to_string(),
            virtual_environments: vec![],
        }
    }
}

/// Параметры самоподписанного сертификата
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TlsConfig {
    pub common_name: String,
    pub organization: String,
    pub contact: String,
    pub days: u32,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            common_name: "server.example.com".to_string(),
            organization: "Example, Inc.".to_string(),
            contact: "postmaster@example.com".to_string(),
            days: 365,
        }
    }
}

/// Конфигурация одного запуска
///
/// Создается один раз и передается в операции по ссылке, не изменяется.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProvisionConfig {
    pub host: HostConfig,
    pub paths: PathsConfig,
    pub accounts: AccountsConfig,
    pub resources: Vec<ResourceConfig>,
    pub tarballs: Vec<TarballConfig>,
    #[serde(default)]
    pub webapps: WebappsConfig,
    #[serde(default)]
    pub tls: TlsConfig,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            host: HostConfig {
                hostname: "example.com".to_string(),
                port: 22,
                user: "root".to_string(),
                identity_file: None,
            },
            paths: PathsConfig {
                remote_backup_dir: "/root/backup".to_string(),
                remote_config_dir: "/root/config".to_string(),
                local_config_dir: PathBuf::from("conf"),
                local_tar_dir: PathBuf::from("conf/tarballs"),
                local_backup_dir: PathBuf::from("conf/backup"),
                audit_log: PathBuf::from("audit/audit_log.json"),
            },
            accounts: AccountsConfig {
                single_user_mode: false,
                deploy_username: "deploy".to_string(),
                main_username: "admin".to_string(),
                server_groupname: "www-data".to_string(),
                team_groupname: "team".to_string(),
                team_users: vec![],
                team_sudo_cmds: vec![
                    "/usr/sbin/service apache2 *".to_string(),
                    "/usr/sbin/service nginx *".to_string(),
                ],
                deploy_password: None,
                main_password: None,
                team_password: None,
            },
            resources: vec![
                ResourceConfig {
                    name: WEBROOT_RESOURCE.to_string(),
                    path: "/var/www".to_string(),
                },
                ResourceConfig {
                    name: APACHE_RESOURCE.to_string(),
                    path: "/etc/apache2".to_string(),
                },
                ResourceConfig {
                    name: NGINX_RESOURCE.to_string(),
                    path: "/etc/nginx".to_string(),
                },
                ResourceConfig {
                    name: TLS_RESOURCE.to_string(),
                    path: "/srv/webapps/ssl".to_string(),
                },
            ],
            tarballs: vec![
                TarballConfig {
                    srcdir: String::new(),
                    source: "skel".to_string(),
                },
                TarballConfig {
                    srcdir: "apache/localhost".to_string(),
                    source: "public".to_string(),
                },
                TarballConfig {
                    srcdir: "apache".to_string(),
                    source: "sites-available".to_string(),
                },
                TarballConfig {
                    srcdir: "nginx".to_string(),
                    source: "sites-available".to_string(),
                },
            ],
            webapps: WebappsConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl ProvisionConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("Конфигурационный файл не найден, создаем по умолчанию");
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }

        let mut file = File::open(path)
            .with_context(|| format!("Не удалось открыть файл конфигурации: {:?}", path))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .with_context(|| format!("Не удалось прочитать файл конфигурации: {:?}", path))?;

        let config: Self = toml::from_str(&contents).with_context(|| {
            format!(
                "Не удалось десериализовать конфигурацию из файла: {:?}",
                path
            )
        })?;
        config.validate()?;

        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let text = toml::to_string_pretty(self)
            .with_context(|| "Не удалось сериализовать конфигурацию в TOML")?;

        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Не удалось создать директорию: {:?}", parent))?;
            }
        }

        let mut file = File::create(path)
            .with_context(|| format!("Не удалось создать файл конфигурации: {:?}", path))?;
        file.write_all(text.as_bytes())
            .with_context(|| format!("Не удалось записать в файл конфигурации: {:?}", path))?;

        info!("Конфигурация сохранена в {:?}", path);
        Ok(())
    }

    /// Проверяет имена учетных записей, групп и ресурсов, а также пути
    ///
    /// Директория бекапов не может лежать внутри ресурса: восстановление
    /// удаляет ресурс целиком до распаковки архива.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let accounts = &self.accounts;
        validate_name("пользователя", &accounts.deploy_username)?;
        validate_name("пользователя", &accounts.main_username)?;
        validate_name("группы", &accounts.server_groupname)?;
        validate_name("группы", &accounts.team_groupname)?;
        for user in &accounts.team_users {
            validate_name("пользователя", user)?;
        }

        for env in &self.webapps.virtual_environments {
            validate_name("окружения", env)?;
        }

        for dir in [
            &self.paths.remote_backup_dir,
            &self.paths.remote_config_dir,
            &self.webapps.location,
        ] {
            validate_remote_path(dir)?;
        }

        let mut seen = HashSet::new();
        for resource in &self.resources {
            validate_name("ресурса", &resource.name)?;
            if !seen.insert(resource.name.as_str()) {
                return Err(ConfigError::DuplicateResource(resource.name.clone()));
            }
            validate_remote_path(&resource.path)?;
            if is_within(&self.paths.remote_backup_dir, &resource.path) {
                return Err(ConfigError::BackupInsideResource {
                    resource: resource.name.clone(),
                    backup_dir: self.paths.remote_backup_dir.clone(),
                });
            }
        }

        Ok(())
    }

    /// Путь к единственному каноническому архиву ресурса
    pub fn archive_path(&self, name: &str) -> String {
        format!(
            "{}/{}.tar.gz",
            self.paths.remote_backup_dir.trim_end_matches('/'),
            name
        )
    }

    /// Запись снимка для ресурса, описанного в конфигурации
    pub fn resource(&self, name: &str) -> Result<SnapshotRecord, ConfigError> {
        self.resources
            .iter()
            .find(|r| r.name == name)
            .map(|r| SnapshotRecord::new(&r.path, &self.archive_path(&r.name)))
            .ok_or_else(|| ConfigError::UnknownResource(name.to_string()))
    }

    /// Запись снимка домашней директории пользователя
    pub fn home_resource(&self, user: &str) -> Result<SnapshotRecord, ConfigError> {
        validate_name("пользователя", user)?;
        Ok(SnapshotRecord::new(
            &format!("/home/{}", user),
            &self.archive_path(&format!("home_{}", user)),
        ))
    }

    /// Все ресурсы из конфигурации в порядке описания
    pub fn all_resources(&self) -> Vec<(String, SnapshotRecord)> {
        self.resources
            .iter()
            .map(|r| {
                (
                    r.name.clone(),
                    SnapshotRecord::new(&r.path, &self.archive_path(&r.name)),
                )
            })
            .collect()
    }

    /// Расшифровывает значение с префиксом `enc:`, остальные возвращает как есть
    pub fn reveal_secret(value: &str, key: Option<&str>) -> Result<String> {
        match value.strip_prefix(ENCRYPTED_PREFIX) {
            Some(encrypted) => {
                let key = key.ok_or_else(|| {
                    anyhow::anyhow!(
                        "Значение зашифровано, но переменная {} не задана",
                        ENCRYPTION_KEY_ENV
                    )
                })?;
                decrypt_string(key, encrypted)
            }
            None => Ok(value.to_string()),
        }
    }

    /// Генерирует надежный пароль
    pub fn generate_strong_password(length: usize) -> Result<String> {
        if length < 8 {
            return Err(anyhow::anyhow!(
                "Длина пароля должна быть не менее 8 символов"
            ));
        }

        let mut rng = thread_rng();
        loop {
            let password: String = (0..length)
                .map(|_| match rng.gen_range(0..3) {
                    0 => rng.gen_range(b'A'..=b'Z') as char,
                    1 => rng.gen_range(b'a'..=b'z') as char,
                    _ => rng.gen_range(b'0'..=b'9') as char,
                })
                .collect();

            let has_uppercase = password.chars().any(|c| c.is_ascii_uppercase());
            let has_lowercase = password.chars().any(|c| c.is_ascii_lowercase());
            let has_digit = password.chars().any(|c| c.is_ascii_digit());

            if has_uppercase && has_lowercase && has_digit {
                return Ok(password);
            }
        }
    }
}

fn validate_name(kind: &'static str, value: &str) -> Result<(), ConfigError> {
    let pattern = Regex::new(r"^[a-z_][a-z0-9_-]*$").map_err(|_| ConfigError::InvalidName {
        kind,
        value: value.to_string(),
    })?;

    if value.len() > 32 || !pattern.is_match(value) {
        return Err(ConfigError::InvalidName {
            kind,
            value: value.to_string(),
        });
    }

    Ok(())
}

fn validate_remote_path(path: &str) -> Result<(), ConfigError> {
    if !path.starts_with('/') || path.split('/').any(|part| part == "..") {
        return Err(ConfigError::RelativePath(path.to_string()));
    }
    Ok(())
}

/// Путь виртуального окружения внутри директории веб-приложений
pub fn virtual_environment_path(webapps: &WebappsConfig, name: &str) -> String {
    format!("{}/{}", webapps.location.trim_end_matches('/'), name)
}

fn cipher_from_key(key_b64: &str) -> Result<Aes256Gcm> {
    let key_bytes = STANDARD
        .decode(key_b64)
        .with_context(|| "Не удалось декодировать ключ шифрования из Base64")?;

    if key_bytes.len() != 32 {
        return Err(ConfigError::EncryptionError(format!(
            "ключ должен быть 32 байта, получено {}",
            key_bytes.len()
        ))
        .into());
    }

    let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
    Ok(Aes256Gcm::new(key))
}

/// Генерирует новый ключ AES-256 в Base64
pub fn generate_encryption_key() -> String {
    let key = OsRng.gen::<[u8; 32]>();
    STANDARD.encode(key)
}

/// Шифрует строку с использованием AES-GCM
pub fn encrypt_string(key_b64: &str, plaintext: &str) -> Result<String> {
    let cipher = cipher_from_key(key_b64)?;

    let nonce_bytes = OsRng.gen::<[u8; 12]>(); // 96 бит
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| ConfigError::EncryptionError(e.to_string()))?;

    // nonce хранится перед шифротекстом
    let mut result = Vec::with_capacity(nonce_bytes.len() + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);

    Ok(STANDARD.encode(result))
}

/// Дешифрует строку, зашифрованную с помощью AES-GCM
pub fn decrypt_string(key_b64: &str, encrypted: &str) -> Result<String> {
    let cipher = cipher_from_key(key_b64)?;
    let all_bytes = STANDARD
        .decode(encrypted)
        .with_context(|| "Не удалось декодировать Base64 данные")?;

    if all_bytes.len() < 12 {
        return Err(anyhow::anyhow!("Некорректный формат зашифрованных данных"));
    }

    let (nonce_bytes, ciphertext) = all_bytes.split_at(12);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| anyhow::anyhow!("Ошибка расшифровки: {}", e))?;

    String::from_utf8(plaintext)
        .with_context(|| "Не удалось преобразовать расшифрованные данные в строку")
}
