use std::{
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use thiserror::Error;
use tokio::fs;

use crate::{
    accounts,
    command::ShellCommand,
    config::{
        self, ProvisionConfig, APACHE_RESOURCE, NGINX_RESOURCE, TLS_RESOURCE, WEBROOT_RESOURCE,
    },
    confirm::Confirmation,
    executor::{ExecMode, LocalShell, RemoteExecutor},
    logger, regen,
    snapshot::{ProtectionState, RestoreOutcome},
};

/// Домашняя директория root, куда устанавливается приглашение командной строки
const ROOT_HOME: &str = "/root";

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Операция отменена оператором")]
    Aborted,
    #[error("Выполнение прервано перед шагом: {0}")]
    Interrupted(String),
}

/// Все, что нужно задаче: конфигурация, целевой хост и решение оператора
pub struct TaskContext<'a> {
    pub config: &'a ProvisionConfig,
    pub exec: &'a dyn RemoteExecutor,
    pub local: &'a LocalShell,
    pub confirm: &'a dyn Confirmation,
    /// Выставляется обработчиком Ctrl-C: текущая команда дорабатывает до
    /// конца, следующий шаг не запускается
    pub interrupted: &'a AtomicBool,
}

impl TaskContext<'_> {
    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

/// Шаг многошагового запуска
#[async_trait]
pub trait Step: Sync {
    fn describe(&self) -> &'static str;
    async fn run(&self, ctx: &TaskContext<'_>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    InitSystem,
    InitRootUser,
    InstallSkel,
    InstallAccounts,
    InstallSudoers,
    InstallWebroot,
    InstallApacheConfig,
    InstallNginxConfig,
    InstallWebapps,
    InstallTls,
    MakeVirtualEnvironments,
}

impl SetupStep {
    pub const ALL: [SetupStep; 11] = [
        SetupStep::InitSystem,
        SetupStep::InitRootUser,
        SetupStep::InstallSkel,
        SetupStep::InstallAccounts,
        SetupStep::InstallSudoers,
        SetupStep::InstallWebroot,
        SetupStep::InstallApacheConfig,
        SetupStep::InstallNginxConfig,
        SetupStep::InstallWebapps,
        SetupStep::InstallTls,
        SetupStep::MakeVirtualEnvironments,
    ];
}

#[async_trait]
impl Step for SetupStep {
    fn describe(&self) -> &'static str {
        match self {
            SetupStep::InitSystem => "Подготовка директорий и архивов",
            SetupStep::InitRootUser => "Приглашение командной строки root",
            SetupStep::InstallSkel => "Загрузка скелета домашних директорий",
            SetupStep::InstallAccounts => "Учетные записи",
            SetupStep::InstallSudoers => "Права sudo для команды",
            SetupStep::InstallWebroot => "Webroot",
            SetupStep::InstallApacheConfig => "Конфигурация Apache",
            SetupStep::InstallNginxConfig => "Конфигурация Nginx",
            SetupStep::InstallWebapps => "Директория веб-приложений",
            SetupStep::InstallTls => "Сертификат TLS",
            SetupStep::MakeVirtualEnvironments => "Виртуальные окружения",
        }
    }

    async fn run(&self, ctx: &TaskContext<'_>) -> Result<()> {
        match self {
            SetupStep::InitSystem => init_system(ctx).await,
            SetupStep::InitRootUser => {
                accounts::add_prompt_to_user(ctx.exec, ctx.config, ROOT_HOME, "root").await
            }
            SetupStep::InstallSkel => install_etc_skel(ctx).await,
            SetupStep::InstallAccounts => accounts::install_accounts(ctx.exec, ctx.config).await,
            SetupStep::InstallSudoers => accounts::install_team_sudoers(ctx.exec, ctx.config).await,
            SetupStep::InstallWebroot => install_webroot(ctx).await,
            SetupStep::InstallApacheConfig => install_apache_config(ctx).await,
            SetupStep::InstallNginxConfig => install_nginx_config(ctx).await,
            SetupStep::InstallWebapps => install_webapps_location(ctx).await,
            SetupStep::InstallTls => install_tls(ctx).await,
            SetupStep::MakeVirtualEnvironments => make_virtual_environments(ctx).await,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanStep {
    RestoreWebroot,
    RestoreApacheConfig,
    RestoreNginxConfig,
    RemoveTls,
    RemoveVirtualEnvironments,
    RemoveSudoers,
    RemoveAccounts,
    CleanRootUser,
    RemoveSkel,
    RemoveRemoteConfigDir,
}

impl CleanStep {
    pub const ALL: [CleanStep; 10] = [
        CleanStep::RestoreWebroot,
        CleanStep::RestoreApacheConfig,
        CleanStep::RestoreNginxConfig,
        CleanStep::RemoveTls,
        CleanStep::RemoveVirtualEnvironments,
        CleanStep::RemoveSudoers,
        CleanStep::RemoveAccounts,
        CleanStep::CleanRootUser,
        CleanStep::RemoveSkel,
        CleanStep::RemoveRemoteConfigDir,
    ];
}

#[async_trait]
impl Step for CleanStep {
    fn describe(&self) -> &'static str {
        match self {
            CleanStep::RestoreWebroot => "Восстановление webroot",
            CleanStep::RestoreApacheConfig => "Восстановление конфигурации Apache",
            CleanStep::RestoreNginxConfig => "Восстановление конфигурации Nginx",
            CleanStep::RemoveTls => "Восстановление сертификата TLS",
            CleanStep::RemoveVirtualEnvironments => "Удаление виртуальных окружений",
            CleanStep::RemoveSudoers => "Удаление прав sudo команды",
            CleanStep::RemoveAccounts => "Удаление учетных записей",
            CleanStep::CleanRootUser => "Восстановление .bashrc root",
            CleanStep::RemoveSkel => "Удаление скелета домашних директорий",
            CleanStep::RemoveRemoteConfigDir => "Удаление директории конфигурации",
        }
    }

    async fn run(&self, ctx: &TaskContext<'_>) -> Result<()> {
        match self {
            CleanStep::RestoreWebroot => restore_named(ctx, WEBROOT_RESOURCE).await.map(|_| ()),
            CleanStep::RestoreApacheConfig => {
                restore_named(ctx, APACHE_RESOURCE).await.map(|_| ())
            }
            CleanStep::RestoreNginxConfig => restore_named(ctx, NGINX_RESOURCE).await.map(|_| ()),
            CleanStep::RemoveTls => clean_tls(ctx).await,
            CleanStep::RemoveVirtualEnvironments => clean_virtual_environments(ctx).await,
            CleanStep::RemoveSudoers => accounts::clean_team_sudoers(ctx.exec, ctx.config).await,
            CleanStep::RemoveAccounts => accounts::clean_accounts(ctx.exec, ctx.config).await,
            CleanStep::CleanRootUser => accounts::remove_prompt_from_user(ctx.exec, ROOT_HOME).await,
            CleanStep::RemoveSkel => clean_etc_skel(ctx).await,
            CleanStep::RemoveRemoteConfigDir => {
                ctx.exec
                    .execute(
                        &ShellCommand::remove_all(&ctx.config.paths.remote_config_dir),
                        ExecMode::Fatal,
                    )
                    .await?;
                Ok(())
            }
        }
    }
}

fn progress_bar(len: usize) -> Result<ProgressBar> {
    let bar = ProgressBar::new(len as u64);
    bar.set_style(ProgressStyle::with_template(
        "{spinner} [{bar:30}] {pos}/{len} {msg}",
    )?);
    Ok(bar)
}

/// Выполняет шаги по порядку, проверяя Ctrl-C между ними
async fn run_steps<S: Step>(ctx: &TaskContext<'_>, steps: &[S]) -> Result<()> {
    let bar = progress_bar(steps.len())?;
    let mut result = Ok(());

    for step in steps {
        if ctx.is_interrupted() {
            result = Err(TaskError::Interrupted(step.describe().to_string()).into());
            break;
        }
        bar.set_message(step.describe());
        info!("{}...", step.describe());
        if let Err(e) = step.run(ctx).await {
            result = Err(e.context(format!(
                "Шаг \"{}\" завершился с ошибкой",
                step.describe()
            )));
            break;
        }
        bar.inc(1);
    }

    bar.finish_and_clear();
    result
}

/// Полная настройка сервера
///
/// При ошибке оператору предлагается откатить изменения из снимков.
pub async fn setup(ctx: &TaskContext<'_>) -> Result<()> {
    info!("Начало настройки сервера {}...", ctx.exec.host());

    let result = run_steps(ctx, &SetupStep::ALL).await;

    if let Err(e) = &result {
        error!("Произошла ошибка при настройке сервера: {:#}", e);

        if ctx
            .confirm
            .confirm("Произошла ошибка. Хотите откатить изменения из бекапов?")?
        {
            info!("Откат изменений...");
            if let Err(rollback_err) = restore_all(ctx).await {
                error!("Ошибка при откате изменений: {:#}", rollback_err);
            } else {
                info!("Изменения успешно откачены.");
            }
        }
        return result;
    }

    logger::success("Настройка сервера завершена");
    Ok(())
}

/// Возвращает сервер к исходному состоянию
pub async fn clean(ctx: &TaskContext<'_>) -> Result<()> {
    if !ctx.confirm.confirm(
        "Все конфигурации будут восстановлены из бекапов, учетные записи удалены. Продолжить?",
    )? {
        info!("Очистка отменена");
        return Err(TaskError::Aborted.into());
    }

    run_steps(ctx, &CleanStep::ALL).await?;

    logger::success("Сервер возвращен к исходному состоянию");
    Ok(())
}

/// Удаляет директорию бекапов на хосте и локальные архивы
pub async fn clean_backups(ctx: &TaskContext<'_>) -> Result<()> {
    let paths = &ctx.config.paths;
    let prompt = format!(
        "Будут удалены {} на {} и локальные {:?}, {:?}. Бекапы невозможно будет восстановить. Продолжить?",
        paths.remote_backup_dir,
        ctx.exec.host(),
        paths.local_tar_dir,
        paths.local_backup_dir
    );
    if !ctx.confirm.confirm(&prompt)? {
        info!("Удаление бекапов отменено");
        return Err(TaskError::Aborted.into());
    }

    ctx.exec
        .execute(
            &ShellCommand::remove_all(&paths.remote_backup_dir),
            ExecMode::Fatal,
        )
        .await?;

    for dir in [&paths.local_tar_dir, &paths.local_backup_dir] {
        remove_local_dir(dir).await?;
    }

    logger::success("Бекапы удалены");
    Ok(())
}

async fn remove_local_dir(dir: &Path) -> Result<()> {
    let present = fs::try_exists(dir)
        .await
        .with_context(|| format!("Не удалось проверить директорию {:?}", dir))?;
    if present {
        fs::remove_dir_all(dir)
            .await
            .with_context(|| format!("Не удалось удалить директорию {:?}", dir))?;
    }
    Ok(())
}

/// Создает локальные и удаленные рабочие директории, пересобирает архивы
pub async fn init_system(ctx: &TaskContext<'_>) -> Result<()> {
    regen::regen_tarballs(ctx.config, ctx.local).await?;

    for dir in [
        &ctx.config.paths.remote_backup_dir,
        &ctx.config.paths.remote_config_dir,
    ] {
        ctx.exec
            .execute(&ShellCommand::mkdir_p(dir), ExecMode::WarnOnly)
            .await?;
    }
    Ok(())
}

/// Загружает архив и распаковывает его в `dest`, архив удаляется
async fn upload_and_extract(ctx: &TaskContext<'_>, srcdir: &str, source: &str, dest: &str) -> Result<()> {
    let (_, archive) = regen::tarball_paths(ctx.config, srcdir, source);
    let remote_archive = format!("{}/{}.tar.gz", dest.trim_end_matches('/'), source);

    ctx.exec
        .upload(&archive, &remote_archive)
        .await
        .with_context(|| format!("Не удалось загрузить {:?}", archive))?;
    ctx.exec
        .execute(&ShellCommand::tar_extract(&remote_archive, dest), ExecMode::Fatal)
        .await?;
    ctx.exec
        .execute(&ShellCommand::remove_file(&remote_archive), ExecMode::Fatal)
        .await?;
    Ok(())
}

pub async fn install_etc_skel(ctx: &TaskContext<'_>) -> Result<()> {
    upload_and_extract(ctx, "", "skel", &ctx.config.paths.remote_config_dir).await
}

pub async fn clean_etc_skel(ctx: &TaskContext<'_>) -> Result<()> {
    let skel = format!("{}/skel", ctx.config.paths.remote_config_dir);
    ctx.exec
        .execute(&ShellCommand::remove_all(&skel), ExecMode::Fatal)
        .await?;
    Ok(())
}

/// Рекурсивно выдает группе права на запись, новые файлы наследуют группу
async fn configure_open_share(ctx: &TaskContext<'_>, user: &str, group: &str, dir: &str) -> Result<()> {
    let exec = ctx.exec;
    exec.execute(
        &ShellCommand::new("chown").args(["-R".to_string(), format!("{}:{}", user, group), dir.to_string()]),
        ExecMode::Fatal,
    )
    .await?;
    exec.execute(
        &ShellCommand::new("chmod").args(["-R", "g+w", dir]),
        ExecMode::Fatal,
    )
    .await?;
    exec.execute(
        &ShellCommand::new("find").args([dir, "-type", "d", "-exec", "chmod", "g+s", "{}", "+"]),
        ExecMode::Fatal,
    )
    .await?;
    Ok(())
}

/// Группа может добавлять файлы в директорию, но не менять чужие
async fn configure_restricted_share(ctx: &TaskContext<'_>, user: &str, group: &str, dir: &str) -> Result<()> {
    ctx.exec
        .execute(
            &ShellCommand::new("chown").args([format!("{}:{}", user, group), dir.to_string()]),
            ExecMode::Fatal,
        )
        .await?;
    ctx.exec
        .execute(&ShellCommand::new("chmod").args(["g+w", dir]), ExecMode::Fatal)
        .await?;
    Ok(())
}

/// Права на sites-available зависят от режима учетных записей
async fn share_sites_available(ctx: &TaskContext<'_>, dir: &str) -> Result<()> {
    let accounts = &ctx.config.accounts;
    if accounts.single_user_mode {
        configure_open_share(ctx, &accounts.deploy_username, &accounts.team_groupname, dir).await
    } else {
        configure_restricted_share(ctx, "root", &accounts.team_groupname, dir).await
    }
}

pub async fn install_webroot(ctx: &TaskContext<'_>) -> Result<()> {
    let record = ctx.config.resource(WEBROOT_RESOURCE)?;
    record.backup(ctx.exec).await?;

    let webroot = &record.resource_path;
    ctx.exec
        .execute(&ShellCommand::remove_all(webroot), ExecMode::Fatal)
        .await?;
    ctx.exec
        .execute(&ShellCommand::mkdir_p(&format!("{}/apache", webroot)), ExecMode::Fatal)
        .await?;

    let localhost = format!("{}/apache/localhost", webroot);
    ctx.exec
        .execute(&ShellCommand::mkdir_p(&localhost), ExecMode::Fatal)
        .await?;
    upload_and_extract(ctx, "apache/localhost", "public", &localhost).await?;

    let accounts = &ctx.config.accounts;
    configure_open_share(ctx, &accounts.deploy_username, &accounts.server_groupname, webroot).await?;

    info!("Webroot {} установлен", webroot);
    Ok(())
}

pub async fn install_apache_config(ctx: &TaskContext<'_>) -> Result<()> {
    let record = ctx.config.resource(APACHE_RESOURCE)?;
    record.backup(ctx.exec).await?;

    let root = &record.resource_path;
    let available = format!("{}/sites-available", root);
    let enabled = format!("{}/sites-enabled", root);

    for dir in [&available, &enabled] {
        ctx.exec
            .execute(&ShellCommand::mkdir_p(dir), ExecMode::Fatal)
            .await?;
        ctx.exec
            .execute(&ShellCommand::clear_dir(dir), ExecMode::Fatal)
            .await?;
    }
    upload_and_extract(ctx, "apache", "sites-available", root).await?;

    // Включаем все виртуальные хосты
    ctx.exec
        .execute(
            &ShellCommand::new("find").args([
                available.as_str(),
                "-type",
                "f",
                "-exec",
                "ln",
                "-s",
                "{}",
                enabled.as_str(),
                ";",
            ]),
            ExecMode::Fatal,
        )
        .await?;

    share_sites_available(ctx, &available).await?;
    ctx.exec
        .execute(
            &ShellCommand::new("service").args(["apache2", "restart"]),
            ExecMode::Fatal,
        )
        .await?;

    info!("Конфигурация Apache установлена");
    Ok(())
}

pub async fn install_nginx_config(ctx: &TaskContext<'_>) -> Result<()> {
    let record = ctx.config.resource(NGINX_RESOURCE)?;
    record.backup(ctx.exec).await?;

    let root = &record.resource_path;
    let available = format!("{}/sites-available", root);
    let enabled = format!("{}/sites-enabled", root);

    for dir in [&available, &enabled] {
        ctx.exec
            .execute(&ShellCommand::mkdir_p(dir), ExecMode::Fatal)
            .await?;
        ctx.exec
            .execute(&ShellCommand::clear_dir(dir), ExecMode::Fatal)
            .await?;
    }
    upload_and_extract(ctx, "nginx", "sites-available", root).await?;

    // Виртуальные хосты nginx не включаются: Apache остается основным сервером
    share_sites_available(ctx, &available).await?;
    ctx.exec
        .execute(
            &ShellCommand::new("service").args(["nginx", "restart"]),
            ExecMode::Fatal,
        )
        .await?;

    info!("Конфигурация Nginx установлена");
    Ok(())
}

/// Директория веб-приложений принадлежит серверной группе
pub async fn install_webapps_location(ctx: &TaskContext<'_>) -> Result<()> {
    let location = &ctx.config.webapps.location;
    let group = &ctx.config.accounts.server_groupname;
    ctx.exec
        .execute(&ShellCommand::mkdir_p(location), ExecMode::Fatal)
        .await?;
    ctx.exec
        .execute(
            &ShellCommand::new("chown").args([
                "-R".to_string(),
                format!("{0}:{0}", group),
                location.clone(),
            ]),
            ExecMode::Fatal,
        )
        .await?;
    Ok(())
}

/// Создает самоподписанный сертификат, сохранив прежнее содержимое директории
///
/// Существующий сертификат не перевыпускается.
pub async fn install_tls(ctx: &TaskContext<'_>) -> Result<()> {
    let record = ctx.config.resource(TLS_RESOURCE)?;
    record.backup(ctx.exec).await?;

    let dir = &record.resource_path;
    let cert = format!("{}/nginx.pem", dir);
    let key = format!("{}/nginx.key", dir);
    if ctx.exec.exists(&cert).await? {
        info!("Сертификат {} уже существует", cert);
        return Ok(());
    }

    ctx.exec
        .execute(&ShellCommand::mkdir_p(dir), ExecMode::Fatal)
        .await?;

    let tls = &ctx.config.tls;
    let subject = format!(
        "/O={}/CN={}/emailAddress={}",
        tls.organization, tls.common_name, tls.contact
    );
    ctx.exec
        .execute(
            &ShellCommand::new("openssl").args([
                "req".to_string(),
                "-new".to_string(),
                "-x509".to_string(),
                "-days".to_string(),
                tls.days.to_string(),
                "-nodes".to_string(),
                "-subj".to_string(),
                subject,
                "-out".to_string(),
                cert.clone(),
                "-keyout".to_string(),
                key.clone(),
            ]),
            ExecMode::Fatal,
        )
        .await
        .context("Не удалось создать сертификат")?;
    ctx.exec
        .execute(
            &ShellCommand::new("chmod").args(["600", cert.as_str(), key.as_str()]),
            ExecMode::Fatal,
        )
        .await?;

    info!("Сертификат TLS создан в {}", dir);
    Ok(())
}

/// Возвращает директорию сертификата из снимка, а без снимка удаляет ее
pub async fn clean_tls(ctx: &TaskContext<'_>) -> Result<()> {
    if restore_named(ctx, TLS_RESOURCE).await? == RestoreOutcome::NothingToRestore {
        let record = ctx.config.resource(TLS_RESOURCE)?;
        ctx.exec
            .execute(&ShellCommand::remove_all(&record.resource_path), ExecMode::Fatal)
            .await?;
    }
    Ok(())
}

/// Создает виртуальные окружения с каталогами для логов и конфигурации WSGI
pub async fn make_virtual_environments(ctx: &TaskContext<'_>) -> Result<()> {
    let webapps = &ctx.config.webapps;
    if webapps.virtual_environments.is_empty() {
        info!("Виртуальные окружения не заданы");
        return Ok(());
    }

    for name in &webapps.virtual_environments {
        let path = config::virtual_environment_path(webapps, name);
        ctx.exec
            .execute(
                &ShellCommand::new("virtualenv").arg(path.as_str()),
                ExecMode::Fatal,
            )
            .await
            .with_context(|| format!("Не удалось создать окружение {}", name))?;
        for sub in ["logs", "apache"] {
            ctx.exec
                .execute(
                    &ShellCommand::mkdir_p(&format!("{}/{}", path, sub)),
                    ExecMode::Fatal,
                )
                .await?;
        }
    }

    let group = &ctx.config.accounts.server_groupname;
    ctx.exec
        .execute(
            &ShellCommand::new("chown").args([
                "-R".to_string(),
                format!("{0}:{0}", group),
                webapps.location.clone(),
            ]),
            ExecMode::Fatal,
        )
        .await?;
    ctx.exec
        .execute(
            &ShellCommand::new("chmod").args(["-R", "ug+rw", webapps.location.as_str()]),
            ExecMode::Fatal,
        )
        .await?;
    Ok(())
}

pub async fn clean_virtual_environments(ctx: &TaskContext<'_>) -> Result<()> {
    for name in &ctx.config.webapps.virtual_environments {
        let path = config::virtual_environment_path(&ctx.config.webapps, name);
        ctx.exec
            .execute(&ShellCommand::remove_all(&path), ExecMode::Fatal)
            .await?;
    }
    Ok(())
}

/// Бекап ресурса по имени из конфигурации
pub async fn backup_named(ctx: &TaskContext<'_>, name: &str) -> Result<()> {
    let record = ctx.config.resource(name)?;
    let outcome = record.backup(ctx.exec).await?;
    info!("{}: {:?}", name, outcome);
    Ok(())
}

/// Восстановление ресурса по имени из конфигурации
pub async fn restore_named(ctx: &TaskContext<'_>, name: &str) -> Result<RestoreOutcome> {
    let record = ctx.config.resource(name)?;
    let outcome = record.restore(ctx.exec).await?;
    if outcome == RestoreOutcome::NothingToRestore {
        info!("Бекап {} не найден, пропускаем восстановление", name);
    }
    Ok(outcome)
}

pub async fn backup_all(ctx: &TaskContext<'_>) -> Result<()> {
    for (name, _) in ctx.config.all_resources() {
        backup_named(ctx, &name).await?;
    }
    Ok(())
}

/// Восстанавливает все ресурсы; ошибка одного не мешает остальным
pub async fn restore_all(ctx: &TaskContext<'_>) -> Result<()> {
    let mut failed = Vec::new();
    for (name, _) in ctx.config.all_resources() {
        if let Err(e) = restore_named(ctx, &name).await {
            warn!("Ошибка при восстановлении {}: {:#}", name, e);
            failed.push(name);
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "Не удалось восстановить: {}",
            failed.join(", ")
        ))
    }
}

pub async fn restore_home(ctx: &TaskContext<'_>, user: &str) -> Result<RestoreOutcome> {
    let record = ctx.config.home_resource(user)?;
    record.restore(ctx.exec).await
}

/// Печатает состояние защищенности всех ресурсов
pub async fn status(ctx: &TaskContext<'_>) -> Result<Vec<(String, ProtectionState)>> {
    let mut states = Vec::new();
    for (name, record) in ctx.config.all_resources() {
        let state = record.state(ctx.exec).await?;
        logger::protection(
            &name,
            &record.resource_path,
            state == ProtectionState::Protected,
        );
        states.push((name, state));
    }
    Ok(states)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{confirm::FixedAnswer, executor::testing::RecordingExecutor};

    static RUNNING: AtomicBool = AtomicBool::new(false);

    fn context<'a>(
        config: &'a ProvisionConfig,
        exec: &'a RecordingExecutor,
        local: &'a LocalShell,
        confirm: &'a FixedAnswer,
    ) -> TaskContext<'a> {
        TaskContext {
            config,
            exec,
            local,
            confirm,
            interrupted: &RUNNING,
        }
    }

    fn position(commands: &[String], prefix: &str) -> usize {
        commands
            .iter()
            .position(|c| c.starts_with(prefix))
            .unwrap_or_else(|| panic!("no command starting with {:?} in {:?}", prefix, commands))
    }

    #[tokio::test]
    async fn test_webroot_is_backed_up_before_removal() {
        let config = ProvisionConfig::default();
        let exec = RecordingExecutor::with_existing(&["/var/www"]);
        let local = LocalShell::new();
        let confirm = FixedAnswer(true);
        let ctx = context(&config, &exec, &local, &confirm);

        install_webroot(&ctx).await.unwrap();

        let commands = exec.mutations();
        let tar = position(&commands, "tar -czf /root/backup/webroot.tar.gz -C /var/www .");
        let rm = position(&commands, "rm -rf /var/www");
        assert!(tar < rm);
        assert_eq!(exec.uploads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_apache_config_reinstall_keeps_first_backup() {
        let config = ProvisionConfig::default();
        let exec =
            RecordingExecutor::with_existing(&["/etc/apache2", "/root/backup/apache2.tar.gz"]);
        let local = LocalShell::new();
        let confirm = FixedAnswer(true);
        let ctx = context(&config, &exec, &local, &confirm);

        install_apache_config(&ctx).await.unwrap();

        let commands = exec.mutations();
        assert!(commands.iter().all(|c| !c.starts_with("tar -czf")));
        assert!(commands
            .iter()
            .any(|c| c == "find /etc/apache2/sites-available -type f -exec ln -s '{}' /etc/apache2/sites-enabled ';'"));
        assert!(commands.iter().any(|c| c == "service apache2 restart"));
    }

    #[tokio::test]
    async fn test_clean_declined_changes_nothing() {
        let config = ProvisionConfig::default();
        let exec = RecordingExecutor::with_existing(&["/root/backup/nginx.tar.gz"]);
        let local = LocalShell::new();
        let confirm = FixedAnswer(false);
        let ctx = context(&config, &exec, &local, &confirm);

        let err = clean(&ctx).await.unwrap_err();

        assert!(matches!(err.downcast_ref::<TaskError>(), Some(TaskError::Aborted)));
        assert!(exec.commands().is_empty());
    }

    #[tokio::test]
    async fn test_clean_restores_only_protected_resources() {
        let config = ProvisionConfig::default();
        let exec = RecordingExecutor::with_existing(&["/root/backup/nginx.tar.gz"]);
        let local = LocalShell::new();
        let confirm = FixedAnswer(true);
        let ctx = context(&config, &exec, &local, &confirm);

        clean(&ctx).await.unwrap();

        let commands = exec.mutations();
        assert!(commands.contains(&"tar -xzf /root/backup/nginx.tar.gz -C /etc/nginx".to_string()));
        assert!(commands.iter().all(|c| c != "rm -rf /var/www" && c != "rm -rf /etc/apache2"));
        assert!(commands.contains(&"rm -rf /root/config".to_string()));
        assert!(commands.contains(&"rm -rf /root/config/skel".to_string()));
        // снимка сертификата нет, директория удаляется
        assert!(commands.contains(&"rm -rf /srv/webapps/ssl".to_string()));
    }

    #[tokio::test]
    async fn test_failed_setup_offers_rollback() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = ProvisionConfig::default();
        config.paths.local_config_dir = dir.path().join("conf");
        config.paths.local_tar_dir = dir.path().join("tarballs");
        config.paths.local_backup_dir = dir.path().join("backup");
        config.accounts.deploy_password = Some("Secret123".to_string());
        config.accounts.main_password = Some("Secret456".to_string());

        let exec = RecordingExecutor::with_existing(&["/root/backup/webroot.tar.gz"]);
        exec.fail_on("visudo");
        let local = LocalShell::new();
        let confirm = FixedAnswer(true);
        let ctx = context(&config, &exec, &local, &confirm);

        assert!(setup(&ctx).await.is_err());

        // откат восстановил webroot из существующего бекапа
        let commands = exec.mutations();
        assert!(commands.contains(&"tar -xzf /root/backup/webroot.tar.gz -C /var/www".to_string()));
    }

    #[tokio::test]
    async fn test_status_reports_each_resource() {
        let config = ProvisionConfig::default();
        let exec = RecordingExecutor::with_existing(&["/root/backup/apache2.tar.gz"]);
        let local = LocalShell::new();
        let confirm = FixedAnswer(true);
        let ctx = context(&config, &exec, &local, &confirm);

        let states = status(&ctx).await.unwrap();

        assert_eq!(
            states,
            vec![
                ("webroot".to_string(), ProtectionState::Unprotected),
                ("apache2".to_string(), ProtectionState::Protected),
                ("nginx".to_string(), ProtectionState::Unprotected),
                ("tls".to_string(), ProtectionState::Unprotected),
            ]
        );
    }

    #[tokio::test]
    async fn test_interrupt_stops_before_first_step() {
        let config = ProvisionConfig::default();
        let exec = RecordingExecutor::default();
        let local = LocalShell::new();
        let confirm = FixedAnswer(true);
        let interrupted = AtomicBool::new(true);
        let ctx = TaskContext {
            config: &config,
            exec: &exec,
            local: &local,
            confirm: &confirm,
            interrupted: &interrupted,
        };

        let err = run_steps(&ctx, &CleanStep::ALL).await.unwrap_err();

        match err.downcast_ref::<TaskError>() {
            Some(TaskError::Interrupted(step)) => {
                assert_eq!(step, CleanStep::RestoreWebroot.describe())
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(exec.commands().is_empty());
    }

    #[tokio::test]
    async fn test_tls_directory_is_backed_up_before_generation() {
        let config = ProvisionConfig::default();
        let exec = RecordingExecutor::with_existing(&["/srv/webapps/ssl"]);
        let local = LocalShell::new();
        let confirm = FixedAnswer(true);
        let ctx = context(&config, &exec, &local, &confirm);

        install_tls(&ctx).await.unwrap();

        let commands = exec.mutations();
        let tar = position(&commands, "tar -czf /root/backup/tls.tar.gz -C /srv/webapps/ssl .");
        let openssl = position(&commands, "openssl req -new -x509 -days 365 -nodes -subj");
        assert!(tar < openssl);
        assert!(commands[openssl].contains("'/O=Example, Inc./CN=server.example.com/emailAddress=postmaster@example.com'"));
        assert_eq!(
            commands.last().unwrap(),
            "chmod 600 /srv/webapps/ssl/nginx.pem /srv/webapps/ssl/nginx.key"
        );
    }

    #[tokio::test]
    async fn test_existing_certificate_is_kept() {
        let config = ProvisionConfig::default();
        let exec = RecordingExecutor::with_existing(&[
            "/srv/webapps/ssl",
            "/root/backup/tls.tar.gz",
            "/srv/webapps/ssl/nginx.pem",
        ]);
        let local = LocalShell::new();
        let confirm = FixedAnswer(true);
        let ctx = context(&config, &exec, &local, &confirm);

        install_tls(&ctx).await.unwrap();

        assert!(exec.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_virtual_environments_layout() {
        let mut config = ProvisionConfig::default();
        config.webapps.virtual_environments = vec!["blog".to_string()];
        let exec = RecordingExecutor::default();
        let local = LocalShell::new();
        let confirm = FixedAnswer(true);
        let ctx = context(&config, &exec, &local, &confirm);

        make_virtual_environments(&ctx).await.unwrap();
        clean_virtual_environments(&ctx).await.unwrap();

        assert_eq!(
            exec.mutations(),
            vec![
                "virtualenv /srv/webapps/blog",
                "mkdir -p /srv/webapps/blog/logs",
                "mkdir -p /srv/webapps/blog/apache",
                "chown -R www-data:www-data /srv/webapps",
                "chmod -R ug+rw /srv/webapps",
                "rm -rf /srv/webapps/blog",
            ]
        );
    }

    #[tokio::test]
    async fn test_clean_backups_removes_local_roots() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = ProvisionConfig::default();
        config.paths.local_tar_dir = dir.path().join("tarballs");
        config.paths.local_backup_dir = dir.path().join("backup");
        std::fs::create_dir_all(&config.paths.local_tar_dir).unwrap();
        let exec = RecordingExecutor::default();
        let local = LocalShell::new();
        let confirm = FixedAnswer(true);
        let ctx = context(&config, &exec, &local, &confirm);

        clean_backups(&ctx).await.unwrap();

        assert!(!config.paths.local_tar_dir.exists());
        assert_eq!(exec.mutations(), vec!["rm -rf /root/backup"]);
    }
}
