use std::{
    fs,
    io::{self, Read, Write},
    net::TcpStream,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use ssh2::{Channel, Session};

use crate::{
    command::ShellCommand,
    config::HostConfig,
    executor::{CommandOutput, ExecError, RemoteExecutor},
};

/// SSH-сессия с одним хостом
///
/// Команды выполняются последовательно в отдельных каналах одной сессии.
/// Вызовы ssh2 блокирующие, поэтому выносятся в `spawn_blocking`.
pub struct SshSession {
    identity: String,
    session: Arc<Mutex<Session>>,
}

impl SshSession {
    /// Подключается к хосту и проходит аутентификацию
    ///
    /// Если в конфигурации указан файл ключа, используется он, иначе ssh-agent.
    pub async fn connect(host: &HostConfig) -> Result<Self> {
        let identity = format!("{}@{}", host.user, host.hostname);
        info!("Подключение к {}:{}...", identity, host.port);

        let hostname = host.hostname.clone();
        let port = host.port;
        let user = host.user.clone();
        let key = host.identity_file.clone();
        let id = identity.clone();

        let session = tokio::task::spawn_blocking(move || {
            open_session(&hostname, port, &user, key.as_deref()).map_err(|e| {
                ExecError::Connection {
                    host: id,
                    reason: format!("{:#}", e),
                }
            })
        })
        .await
        .context("Поток подключения SSH завершился аварийно")??;

        info!("Подключение к {} установлено", identity);

        Ok(Self {
            identity,
            session: Arc::new(Mutex::new(session)),
        })
    }
}

fn open_session(hostname: &str, port: u16, user: &str, key: Option<&Path>) -> Result<Session> {
    let tcp = TcpStream::connect((hostname, port))
        .with_context(|| format!("Не удалось открыть TCP соединение с {}:{}", hostname, port))?;

    let mut session = Session::new().context("Не удалось создать SSH сессию")?;
    session.set_tcp_stream(tcp);
    session.handshake().context("Ошибка SSH рукопожатия")?;

    match key {
        Some(path) => session
            .userauth_pubkey_file(user, None, path, None)
            .with_context(|| format!("Ошибка аутентификации по ключу {:?}", path))?,
        None => session
            .userauth_agent(user)
            .context("Ошибка аутентификации через ssh-agent")?,
    }

    if !session.authenticated() {
        return Err(anyhow::anyhow!("Аутентификация пользователя {} не выполнена", user));
    }

    Ok(session)
}

fn run_blocking(session: &Session, line: &str, stdin: Option<&str>) -> Result<CommandOutput> {
    let mut channel = session.channel_session().context("Не удалось открыть SSH канал")?;
    channel
        .exec(line)
        .with_context(|| format!("Не удалось выполнить команду: {}", line))?;

    if let Some(input) = stdin {
        channel
            .write_all(input.as_bytes())
            .context("Не удалось передать данные в stdin")?;
    }
    channel.send_eof().context("Не удалось закрыть stdin канала")?;

    session.set_blocking(false);
    let drained = drain_output(&mut channel);
    session.set_blocking(true);
    let (stdout, stderr) = drained.context("Не удалось прочитать вывод команды")?;

    channel.wait_close().context("Ошибка закрытия SSH канала")?;
    let exit_code = channel.exit_status().context("Не удалось получить код возврата")?;

    Ok(CommandOutput {
        succeeded: exit_code == 0,
        exit_code,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pipe {
    Stdout,
    Stderr,
}

/// Два потока вывода команды, читаемые без блокировки
trait OutputPipes {
    fn read_pipe(&mut self, pipe: Pipe, buf: &mut [u8]) -> io::Result<usize>;
    /// Удаленная сторона закрыла оба потока
    fn finished(&self) -> bool;
}

impl OutputPipes for Channel {
    fn read_pipe(&mut self, pipe: Pipe, buf: &mut [u8]) -> io::Result<usize> {
        match pipe {
            Pipe::Stdout => self.read(buf),
            Pipe::Stderr => self.stderr().read(buf),
        }
    }

    fn finished(&self) -> bool {
        self.eof()
    }
}

/// Читает stdout и stderr поочередно, пока оба не закроются
///
/// Окно канала общее для обоих потоков: если читать только stdout, команда
/// с большим выводом в stderr остановится на записи.
fn drain_output<P: OutputPipes>(pipes: &mut P) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        let mut progressed = false;
        for (pipe, sink) in [(Pipe::Stdout, &mut stdout), (Pipe::Stderr, &mut stderr)] {
            match pipes.read_pipe(pipe, &mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    sink.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }

        if !progressed {
            if pipes.finished() {
                return Ok((stdout, stderr));
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

fn upload_blocking(session: &Session, local: &Path, remote: &str) -> Result<()> {
    let data = fs::read(local).with_context(|| format!("Не удалось прочитать файл {:?}", local))?;

    let mut channel = session
        .scp_send(Path::new(remote), 0o644, data.len() as u64, None)
        .with_context(|| format!("Не удалось открыть SCP канал для {}", remote))?;
    channel.write_all(&data).context("Ошибка передачи данных по SCP")?;
    channel.send_eof()?;
    channel.wait_eof()?;
    channel.close()?;
    channel.wait_close()?;

    Ok(())
}

#[async_trait]
impl RemoteExecutor for SshSession {
    fn host(&self) -> &str {
        &self.identity
    }

    async fn run(&self, command: &ShellCommand) -> Result<CommandOutput> {
        let session = Arc::clone(&self.session);
        let line = command.render();
        let stdin = command.stdin.clone();

        tokio::task::spawn_blocking(move || -> Result<CommandOutput> {
            let session = session
                .lock()
                .map_err(|_| anyhow::anyhow!("SSH сессия повреждена"))?;
            run_blocking(&session, &line, stdin.as_deref())
        })
        .await
        .context("Поток выполнения SSH команды завершился аварийно")?
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        // scp_send ожидает полный путь к файлу, а не директорию назначения
        let is_dir = self
            .run(&ShellCommand::new("test").args(["-d", remote_path]))
            .await?
            .succeeded;
        let target = if is_dir {
            let file_name = local_path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("Не удалось получить имя файла из пути"))?
                .to_string_lossy();
            format!("{}/{}", remote_path.trim_end_matches('/'), file_name)
        } else {
            remote_path.to_string()
        };

        debug!("Загрузка {:?} -> {}:{}", local_path, self.identity, target);

        let session = Arc::clone(&self.session);
        let local: PathBuf = local_path.to_path_buf();
        let remote = target.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let session = session
                .lock()
                .map_err(|_| anyhow::anyhow!("SSH сессия повреждена"))?;
            upload_blocking(&session, &local, &remote).map_err(|e| ExecError::Transfer {
                local: local.display().to_string(),
                remote: remote.clone(),
                reason: format!("{:#}", e),
            })?;
            Ok(())
        })
        .await
        .context("Поток загрузки файла завершился аварийно")?
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// Канал, в котором stdout не отдает данные, пока stderr не вычитан
    struct BackpressuredPipes {
        stdout: VecDeque<Vec<u8>>,
        stderr: VecDeque<Vec<u8>>,
    }

    impl OutputPipes for BackpressuredPipes {
        fn read_pipe(&mut self, pipe: Pipe, buf: &mut [u8]) -> io::Result<usize> {
            let queue = match pipe {
                Pipe::Stdout if !self.stderr.is_empty() => {
                    return Err(io::ErrorKind::WouldBlock.into())
                }
                Pipe::Stdout => &mut self.stdout,
                Pipe::Stderr => &mut self.stderr,
            };
            match queue.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        }

        fn finished(&self) -> bool {
            self.stdout.is_empty() && self.stderr.is_empty()
        }
    }

    #[test]
    fn test_stderr_is_drained_alongside_stdout() {
        let mut pipes = BackpressuredPipes {
            stdout: VecDeque::from(vec![b"done\n".to_vec()]),
            stderr: VecDeque::from(vec![b"warning 1\n".to_vec(), b"warning 2\n".to_vec()]),
        };

        let (stdout, stderr) = drain_output(&mut pipes).unwrap();

        assert_eq!(stdout, b"done\n");
        assert_eq!(stderr, b"warning 1\nwarning 2\n");
    }

    #[test]
    fn test_read_error_is_returned() {
        struct Broken;
        impl OutputPipes for Broken {
            fn read_pipe(&mut self, _: Pipe, _: &mut [u8]) -> io::Result<usize> {
                Err(io::ErrorKind::ConnectionReset.into())
            }
            fn finished(&self) -> bool {
                false
            }
        }

        let err = drain_output(&mut Broken).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }
}
