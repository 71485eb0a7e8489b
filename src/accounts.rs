//! Учетные записи сервера
//!
//! Однопользовательский и многопользовательский режимы описываются одним
//! планом: в однопользовательском режиме администратором становится
//! пользователь deploy, в многопользовательском - отдельный main-пользователь.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::fs;

use crate::{
    command::ShellCommand,
    config::{AccountsConfig, ProvisionConfig, ENCRYPTION_KEY_ENV},
    executor::{ExecMode, RemoteExecutor},
    logger,
    snapshot::BackupOutcome,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordRole {
    Deploy,
    Main,
    Team,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub password: PasswordRole,
    /// Получает authorized_keys пользователя root
    pub clone_root_key: bool,
    pub sudo: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountPlan {
    pub accounts: Vec<Account>,
    /// Пары (пользователь, группа)
    pub memberships: Vec<(String, String)>,
    pub team_group: String,
}

impl AccountPlan {
    pub fn from_config(accounts: &AccountsConfig) -> Self {
        let admin = if accounts.single_user_mode {
            &accounts.deploy_username
        } else {
            &accounts.main_username
        };

        let mut plan = Self {
            accounts: Vec::new(),
            memberships: Vec::new(),
            team_group: accounts.team_groupname.clone(),
        };

        plan.accounts.push(Account {
            name: accounts.deploy_username.clone(),
            password: PasswordRole::Deploy,
            clone_root_key: true,
            sudo: &accounts.deploy_username == admin,
        });
        if admin != &accounts.deploy_username {
            plan.accounts.push(Account {
                name: admin.clone(),
                password: PasswordRole::Main,
                clone_root_key: true,
                sudo: true,
            });
        }
        for name in &accounts.team_users {
            if plan.accounts.iter().any(|a| &a.name == name) {
                continue;
            }
            plan.accounts.push(Account {
                name: name.clone(),
                password: PasswordRole::Team,
                clone_root_key: false,
                sudo: false,
            });
        }

        for account in &plan.accounts {
            for group in [&accounts.team_groupname, &accounts.server_groupname] {
                plan.memberships.push((account.name.clone(), group.clone()));
            }
        }

        plan
    }

    pub fn admin(&self) -> Option<&Account> {
        self.accounts.iter().find(|a| a.sudo)
    }
}

/// Пароль для роли: из конфигурации (возможно, зашифрованный) или сгенерированный
fn resolve_password(accounts: &AccountsConfig, role: PasswordRole, user: &str) -> Result<String> {
    let stored = match role {
        PasswordRole::Deploy => accounts.deploy_password.as_deref(),
        PasswordRole::Main => accounts.main_password.as_deref(),
        PasswordRole::Team => accounts.team_password.as_deref(),
    };

    match stored {
        Some(value) => {
            let key = std::env::var(ENCRYPTION_KEY_ENV).ok();
            ProvisionConfig::reveal_secret(value, key.as_deref())
        }
        None => {
            let generated = ProvisionConfig::generate_strong_password(16)?;
            logger::password_info(&format!(
                "Сгенерирован надежный пароль для {}: {}",
                user, generated
            ));
            Ok(generated)
        }
    }
}

/// Создает пользователя с домашней директорией из скелета
async fn add_custom_user(
    exec: &dyn RemoteExecutor,
    config: &ProvisionConfig,
    account: &Account,
) -> Result<()> {
    let user = &account.name;
    let exists = exec
        .execute(&ShellCommand::new("id").args(["-u", user.as_str()]), ExecMode::Probe)
        .await?
        .succeeded;
    if exists {
        info!("Пользователь {} уже существует", user);
        return Ok(());
    }

    info!("Создание пользователя {}...", user);
    let skel = format!("{}/skel", config.paths.remote_config_dir);
    let home = format!("/home/{}", user);
    exec.execute(
        &ShellCommand::new("useradd").args([
            "--skel",
            skel.as_str(),
            "--create-home",
            "--home-dir",
            home.as_str(),
            "--shell",
            "/bin/bash",
            user.as_str(),
        ]),
        ExecMode::Fatal,
    )
    .await
    .with_context(|| format!("Не удалось создать пользователя {}", user))?;

    let password = resolve_password(&config.accounts, account.password, user)?;
    exec.execute(
        &ShellCommand::new("chpasswd").stdin(format!("{}:{}\n", user, password)),
        ExecMode::Fatal,
    )
    .await
    .with_context(|| format!("Не удалось установить пароль пользователя {}", user))?;

    Ok(())
}

/// Копирует ключи root, чтобы вход не требовал пароля
async fn clone_root_pubkey(exec: &dyn RemoteExecutor, user: &str) -> Result<()> {
    let ssh_dir = format!("/home/{}/.ssh", user);
    exec.execute(&ShellCommand::mkdir_p(&ssh_dir), ExecMode::Fatal)
        .await?;
    exec.execute(
        &ShellCommand::new("cp").args([
            "/root/.ssh/authorized_keys".to_string(),
            format!("{}/authorized_keys", ssh_dir),
        ]),
        ExecMode::Fatal,
    )
    .await?;
    exec.execute(
        &ShellCommand::new("chown").args(["-R".to_string(), format!("{0}:{0}", user), ssh_dir]),
        ExecMode::Fatal,
    )
    .await?;
    Ok(())
}

/// Создает учетные записи и членство в группах согласно плану
pub async fn install_accounts(exec: &dyn RemoteExecutor, config: &ProvisionConfig) -> Result<()> {
    let plan = AccountPlan::from_config(&config.accounts);
    info!(
        "Установка учетных записей: {} шт., администратор: {}",
        plan.accounts.len(),
        plan.admin().map(|a| a.name.as_str()).unwrap_or("-")
    );

    let group_exists = exec
        .execute(
            &ShellCommand::new("getent").args(["group", plan.team_group.as_str()]),
            ExecMode::Probe,
        )
        .await?
        .succeeded;
    if !group_exists {
        exec.execute(
            &ShellCommand::new("addgroup").arg(plan.team_group.as_str()),
            ExecMode::Fatal,
        )
        .await?;
    }

    for account in &plan.accounts {
        add_custom_user(exec, config, account).await?;
        if account.clone_root_key {
            clone_root_pubkey(exec, &account.name).await?;
        }
        if account.sudo {
            exec.execute(
                &ShellCommand::new("adduser").args([account.name.as_str(), "sudo"]),
                ExecMode::Fatal,
            )
            .await?;
        }
    }

    for (user, group) in &plan.memberships {
        exec.execute(
            &ShellCommand::new("adduser").args([user.as_str(), group.as_str()]),
            ExecMode::Fatal,
        )
        .await?;
    }

    logger::success("Учетные записи настроены");
    Ok(())
}

/// Файлы приглашения командной строки из локального скелета
pub const PROMPT_FILES: [&str; 3] = [".colors_prompts", ".bash_prompt", ".gemrc"];

/// Подключает приглашение из скелета к уже существующему пользователю
///
/// Исходный `.bashrc` копируется в `.bashrc.bak` только при первом запуске;
/// наличие копии означает, что строки подключения уже дописаны.
pub async fn add_prompt_to_user(
    exec: &dyn RemoteExecutor,
    config: &ProvisionConfig,
    home: &str,
    user: &str,
) -> Result<()> {
    let skel = config.paths.local_config_dir.join("skel");
    let mut installed = Vec::new();
    for name in PROMPT_FILES {
        let local = skel.join(name);
        if !fs::try_exists(&local)
            .await
            .with_context(|| format!("Не удалось проверить файл {:?}", local))?
        {
            warn!("{:?} не найден, пропускаем", local);
            continue;
        }
        let remote = format!("{}/{}", home, name);
        exec.upload(&local, &remote)
            .await
            .with_context(|| format!("Не удалось загрузить {:?}", local))?;
        installed.push(remote);
    }

    let bashrc = format!("{}/.bashrc", home);
    let original = format!("{}/.bashrc.bak", home);
    if exec.exists(&original).await? {
        debug!("{} уже существует, .bashrc не изменяется", original);
    } else {
        exec.execute(
            &ShellCommand::new("cp").args(["-p", bashrc.as_str(), original.as_str()]),
            ExecMode::Fatal,
        )
        .await?;
        let hook = format!(
            "\nif [ -f {0}/.colors_prompts ]; then . {0}/.colors_prompts; fi\n\
             if [ -f {0}/.bash_prompt ]; then . {0}/.bash_prompt; fi\n",
            home
        );
        exec.execute(
            &ShellCommand::new("tee").args(["-a", bashrc.as_str()]).stdin(hook),
            ExecMode::Fatal,
        )
        .await?;
    }

    if !installed.is_empty() {
        exec.execute(
            &ShellCommand::new("chown")
                .arg(format!("{0}:{0}", user))
                .args(installed),
            ExecMode::Fatal,
        )
        .await?;
    }

    info!("Приглашение командной строки установлено для {}", user);
    Ok(())
}

/// Убирает файлы приглашения и возвращает исходный `.bashrc`, если он сохранен
pub async fn remove_prompt_from_user(exec: &dyn RemoteExecutor, home: &str) -> Result<()> {
    let files: Vec<String> = PROMPT_FILES
        .iter()
        .map(|name| format!("{}/{}", home, name))
        .collect();
    exec.execute(
        &ShellCommand::new("rm").arg("-f").args(files),
        ExecMode::WarnOnly,
    )
    .await?;

    let original = format!("{}/.bashrc.bak", home);
    if exec.exists(&original).await? {
        exec.execute(
            &ShellCommand::new("mv").args([
                "-f".to_string(),
                original,
                format!("{}/.bashrc", home),
            ]),
            ExecMode::Fatal,
        )
        .await?;
        info!("Исходный .bashrc в {} восстановлен", home);
    }
    Ok(())
}

/// Удаляет учетные записи и их домашние директории
pub async fn clean_accounts(exec: &dyn RemoteExecutor, config: &ProvisionConfig) -> Result<()> {
    let plan = AccountPlan::from_config(&config.accounts);
    let mut names: Vec<&str> = plan.accounts.iter().map(|a| a.name.as_str()).collect();
    // main-пользователь мог остаться от запуска в многопользовательском режиме
    if !names.contains(&config.accounts.main_username.as_str()) {
        names.push(&config.accounts.main_username);
    }

    for name in names {
        exec.execute(&ShellCommand::new("deluser").arg(name), ExecMode::WarnOnly)
            .await?;
        exec.execute(
            &ShellCommand::remove_all(&format!("/home/{}", name)),
            ExecMode::WarnOnly,
        )
        .await?;
    }

    info!("Учетные записи удалены");
    Ok(())
}

fn sudoers_path(config: &ProvisionConfig) -> String {
    format!("/etc/sudoers.d/{}", config.accounts.team_groupname)
}

/// Разрешает команде управлять веб-серверами без пароля
pub async fn install_team_sudoers(
    exec: &dyn RemoteExecutor,
    config: &ProvisionConfig,
) -> Result<()> {
    let accounts = &config.accounts;
    let contents = format!(
        "Cmnd_Alias WEB_SERVER_CMDS = {}\n%{} ALL=(ALL) NOPASSWD: WEB_SERVER_CMDS\n",
        accounts.team_sudo_cmds.join(","),
        accounts.team_groupname
    );
    let path = sudoers_path(config);

    exec.execute(
        &ShellCommand::new("tee").arg(path.as_str()).stdin(contents),
        ExecMode::Fatal,
    )
    .await?;
    exec.execute(
        &ShellCommand::new("chmod").args(["440", path.as_str()]),
        ExecMode::Fatal,
    )
    .await?;
    exec.execute(
        &ShellCommand::new("visudo").args(["-cf", path.as_str()]),
        ExecMode::Fatal,
    )
    .await
    .with_context(|| format!("Файл {} не прошел проверку visudo", path))?;

    info!("Права sudo для группы {} настроены", accounts.team_groupname);
    Ok(())
}

pub async fn clean_team_sudoers(exec: &dyn RemoteExecutor, config: &ProvisionConfig) -> Result<()> {
    exec.execute(
        &ShellCommand::remove_file(&sudoers_path(config)),
        ExecMode::Fatal,
    )
    .await?;
    Ok(())
}

/// Заменяет домашнюю директорию пользователя скелетом, сохранив исходную
pub async fn reskel_existing_user(
    exec: &dyn RemoteExecutor,
    config: &ProvisionConfig,
    user: &str,
) -> Result<BackupOutcome> {
    let record = config.home_resource(user)?;
    let outcome = record.backup(exec).await?;

    let home = &record.resource_path;
    let skel = format!("{}/skel/.", config.paths.remote_config_dir);
    exec.execute(&ShellCommand::remove_all(home), ExecMode::Fatal)
        .await?;
    exec.execute(&ShellCommand::mkdir_p(home), ExecMode::Fatal)
        .await?;
    exec.execute(
        &ShellCommand::new("cp").args(["-a", skel.as_str(), home.as_str()]),
        ExecMode::Fatal,
    )
    .await?;
    exec.execute(
        &ShellCommand::new("chown").args(["-R".to_string(), format!("{0}:{0}", user), home.clone()]),
        ExecMode::Fatal,
    )
    .await?;

    info!("Домашняя директория {} заменена скелетом", home);
    Ok(outcome)
}
