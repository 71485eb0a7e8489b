use anyhow::Result;
use colored::*;
use env_logger::{Builder, Env};

/// Инициализирует логирование
///
/// Уровень берется из `RUST_LOG`, по умолчанию `info`; `--verbose` включает `debug`.
///
/// # Examples
/// ```rust
/// logger::init(false)?;
/// ```
pub fn init(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let env = Env::default()
        .filter_or("RUST_LOG", default_level)
        .write_style_or("RUST_LOG_STYLE", "always");

    Builder::from_env(env)
        .format_timestamp_secs()
        .format_module_path(true)
        .try_init()?;

    Ok(())
}

/// Выводит сгенерированный пароль отдельно от лога
pub fn password_info(message: &str) {
    println!(
        "{} {}",
        "[GENERATED PASSWORD]".magenta().bold(),
        message.cyan().bold()
    );
}

/// Логирует успешное выполнение шага
pub fn success(message: &str) {
    println!("{} {}", "[SUCCESS]".green().bold(), message);
}

/// Состояние защищенности ресурса для вывода `status`
pub fn protection(name: &str, path: &str, protected: bool) {
    let label = if protected {
        "PROTECTED".green().bold()
    } else {
        "UNPROTECTED".yellow().bold()
    };
    println!("{:<12} {:<40} {}", name, path, label);
}
