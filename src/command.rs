//! Типизированный построитель команд
//!
//! Команда хранится как программа и список аргументов. Для удаленного
//! выполнения она рендерится в строку, где каждый аргумент заключен в
//! одинарные кавычки, поэтому имена пользователей и пути не могут внедрить
//! в командную строку собственные конструкции shell.

use std::fmt;

/// Команда для выполнения на целевом хосте
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub stdin: Option<String>,
}

impl ShellCommand {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            cwd: None,
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Рабочая директория, в которой выполняется команда
    pub fn current_dir(mut self, dir: impl Into<String>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Данные, передаваемые команде через stdin (например, для chpasswd)
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Рендерит команду в строку для удаленного shell
    pub fn render(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(shell_quote(&self.program));
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        let line = parts.join(" ");

        match &self.cwd {
            Some(dir) => format!("cd {} && {}", shell_quote(dir), line),
            None => line,
        }
    }

    // Часто используемые команды

    /// `test -e <path>`
    pub fn test_exists(path: &str) -> Self {
        Self::new("test").args(["-e", path])
    }

    /// `mkdir -p <path>`
    pub fn mkdir_p(path: &str) -> Self {
        Self::new("mkdir").args(["-p", path])
    }

    /// `rm -rf <path>`
    pub fn remove_all(path: &str) -> Self {
        Self::new("rm").args(["-rf", path])
    }

    /// `rm -f <path>`
    pub fn remove_file(path: &str) -> Self {
        Self::new("rm").args(["-f", path])
    }

    /// Архивирует содержимое `dir` (пути относительно `dir`)
    pub fn tar_create_contents(archive: &str, dir: &str) -> Self {
        Self::new("tar").args(["-czf", archive, "-C", dir, "."])
    }

    /// Архивирует `name` вместе с именем директории, относительно `parent`
    pub fn tar_create_named(archive: &str, parent: &str, name: &str) -> Self {
        Self::new("tar").args(["-czf", archive, "-C", parent, name])
    }

    /// Распаковывает архив в директорию `dest`
    pub fn tar_extract(archive: &str, dest: &str) -> Self {
        Self::new("tar").args(["-xzf", archive, "-C", dest])
    }

    /// Удаляет содержимое директории, не трогая саму директорию
    pub fn clear_dir(path: &str) -> Self {
        Self::new("find").args([path, "-mindepth", "1", "-delete"])
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

/// Заключает строку в одинарные кавычки для POSIX shell
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return value.to_string();
    }

    format!("'{}'", value.replace('\'', r"'\''"))
}
