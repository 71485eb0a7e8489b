use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

mod accounts;
mod audit;
mod checksum;
mod command;
mod config;
mod confirm;
mod executor;
mod logger;
mod regen;
mod snapshot;
mod ssh;
mod tasks;

use crate::{
    audit::Audited,
    config::{ProvisionConfig, CONFIG_ENV, DEFAULT_CONFIG_FILE, ENCRYPTION_KEY_ENV},
    confirm::{Confirmation, FixedAnswer, TerminalConfirm},
    executor::{LocalShell, RemoteExecutor},
    snapshot::RestoreOutcome,
    ssh::SshSession,
    tasks::TaskContext,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Путь к файлу конфигурации
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Отвечать "да" на все подтверждения
    #[arg(short, long)]
    yes: bool,

    /// Выполнять команды на этой машине вместо подключения по SSH
    #[arg(long)]
    local: bool,

    /// Подробный лог
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Полная настройка сервера
    Setup,
    /// Восстановление исходных конфигураций и удаление учетных записей
    Clean,
    /// Удаление всех бекапов на сервере и локальных архивов
    CleanBackups,
    /// Бекап ресурса (если бекапа еще нет)
    Backup {
        /// Имя ресурса из конфигурации
        name: Option<String>,
        /// Все ресурсы из конфигурации
        #[arg(long, conflicts_with = "name")]
        all: bool,
    },
    /// Восстановление ресурса из бекапа
    Restore {
        /// Имя ресурса из конфигурации
        name: Option<String>,
        /// Все ресурсы из конфигурации
        #[arg(long, conflicts_with = "name")]
        all: bool,
    },
    /// Состояние бекапов всех ресурсов
    Status,
    /// Пересборка локальных архивов конфигурации
    RegenTarballs,
    /// Замена домашней директории пользователя скелетом (с бекапом)
    Reskel { user: String },
    /// Восстановление домашней директории пользователя
    RestoreHome { user: String },
    /// Проверка SHA-256 загруженного файла
    VerifyArtifact {
        path: String,
        #[arg(long)]
        sha256: String,
        /// Файл на этой машине, а не на сервере
        #[arg(long)]
        local_file: bool,
    },
    /// Шифрование значения для конфигурации
    EncryptSecret { value: String },
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

async fn connect(config: &ProvisionConfig, local: bool) -> Result<Box<dyn RemoteExecutor>> {
    let journal = config.paths.audit_log.clone();
    if local {
        return Ok(Box::new(Audited::new(LocalShell::new(), journal)));
    }
    let session = SshSession::connect(&config.host).await?;
    Ok(Box::new(Audited::new(session, journal)))
}

fn require_name(name: Option<String>, all: bool) -> Result<Option<String>> {
    match (name, all) {
        (Some(name), _) => Ok(Some(name)),
        (None, true) => Ok(None),
        (None, false) => Err(anyhow::anyhow!("Укажите имя ресурса или --all")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    logger::init(cli.verbose)?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        warn!("Получен сигнал прерывания, выполнение остановится после текущего шага");
        flag.store(true, Ordering::SeqCst);
    })
    .context("Не удалось установить обработчик Ctrl-C")?;

    // Команды, которым не нужна конфигурация
    if let Commands::EncryptSecret { value } = &cli.command {
        let key = match std::env::var(ENCRYPTION_KEY_ENV) {
            Ok(key) => key,
            Err(_) => {
                let key = config::generate_encryption_key();
                logger::password_info(&format!(
                    "Сгенерирован ключ шифрования, сохраните его в {}: {}",
                    ENCRYPTION_KEY_ENV, key
                ));
                key
            }
        };
        let encrypted = config::encrypt_string(&key, value)?;
        println!("{}{}", config::ENCRYPTED_PREFIX, encrypted);
        return Ok(());
    }

    let config = ProvisionConfig::load(config_path(&cli))?;
    let confirm: Box<dyn Confirmation> = if cli.yes {
        Box::new(FixedAnswer(true))
    } else {
        Box::new(TerminalConfirm)
    };
    let local = LocalShell::new();

    if let Commands::RegenTarballs = &cli.command {
        return regen::regen_tarballs(&config, &local).await;
    }
    if let Commands::VerifyArtifact {
        path,
        sha256,
        local_file: true,
    } = &cli.command
    {
        return checksum::verify_local_artifact(Path::new(path), sha256, confirm.as_ref()).await;
    }

    let exec = connect(&config, cli.local).await?;
    let ctx = TaskContext {
        config: &config,
        exec: exec.as_ref(),
        local: &local,
        confirm: confirm.as_ref(),
        interrupted: &interrupted,
    };

    match cli.command {
        Commands::Setup => tasks::setup(&ctx).await?,
        Commands::Clean => tasks::clean(&ctx).await?,
        Commands::CleanBackups => tasks::clean_backups(&ctx).await?,
        Commands::Backup { name, all } => match require_name(name, all)? {
            Some(name) => tasks::backup_named(&ctx, &name).await?,
            None => tasks::backup_all(&ctx).await?,
        },
        Commands::Restore { name, all } => match require_name(name, all)? {
            Some(name) => {
                tasks::restore_named(&ctx, &name).await?;
            }
            None => tasks::restore_all(&ctx).await?,
        },
        Commands::Status => {
            tasks::status(&ctx).await?;
        }
        Commands::Reskel { user } => {
            accounts::reskel_existing_user(ctx.exec, &config, &user).await?;
        }
        Commands::RestoreHome { user } => {
            if tasks::restore_home(&ctx, &user).await? == RestoreOutcome::NothingToRestore {
                info!("Бекап домашней директории {} не найден", user);
            }
        }
        Commands::VerifyArtifact { path, sha256, .. } => {
            checksum::verify_remote_artifact(ctx.exec, &path, &sha256, ctx.confirm).await?;
        }
        Commands::RegenTarballs | Commands::EncryptSecret { .. } => {}
    }

    Ok(())
}
