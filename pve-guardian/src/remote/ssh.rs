//! SSH/SFTP session backed by libssh2.

use std::fs::{self, File};
use std::io::{ErrorKind, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::thread;
use std::time::Duration;

use ssh2::{Channel, ErrorCode, Session, Sftp};

use super::{CommandExit, CommandOutput, Connector, Credential, RemoteError, RemoteSession, SshTarget};
use crate::transfer::progress::{copy_with_progress, part_path};

/// libssh2 status for a missing SFTP path
const SFTP_NO_SUCH_FILE: i32 = 2;

/// Pause between polls of an idle command channel
const POLL_INTERVAL: Duration = Duration::from_millis(20);
const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

impl Connector for SshConnector {
    fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let connect_err = |reason: String| RemoteError::Connect {
            host: target.host.clone(),
            port: target.port,
            reason,
        };

        let addr = (target.host.as_str(), target.port)
            .to_socket_addrs()
            .map_err(|e| connect_err(e.to_string()))?
            .next()
            .ok_or_else(|| connect_err("address did not resolve".into()))?;
        let tcp = TcpStream::connect_timeout(&addr, target.connect_timeout)
            .map_err(|e| connect_err(e.to_string()))?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(target.connect_timeout.as_millis() as u32);
        session
            .handshake()
            .map_err(|e| connect_err(format!("handshake failed: {e}")))?;

        let auth = match &target.credential {
            Credential::Password(password) => session.userauth_password(&target.username, password),
            Credential::KeyFile(key) => session.userauth_pubkey_file(&target.username, None, key, None),
        };
        auth.map_err(|e| RemoteError::Auth {
            user: target.username.clone(),
            reason: e.to_string(),
        })?;
        if !session.authenticated() {
            return Err(RemoteError::Auth {
                user: target.username.clone(),
                reason: "server rejected credentials".into(),
            });
        }

        // Dumps and restores can stay silent for a long time.
        session.set_timeout(0);

        tracing::debug!(host = %target.host, port = target.port, "SSH session established");
        Ok(Box::new(SshSession { session, sftp: None }))
    }
}

pub struct SshSession {
    session: Session,
    sftp: Option<Sftp>,
}

impl SshSession {
    fn sftp(&mut self) -> Result<&Sftp, RemoteError> {
        if self.sftp.is_none() {
            self.sftp = Some(self.session.sftp()?);
        }
        self.sftp.as_ref().ok_or_else(|| RemoteError::Transfer {
            path: String::new(),
            reason: "SFTP subsystem unavailable".into(),
        })
    }
}

fn sftp_error(path: &str, err: ssh2::Error) -> RemoteError {
    match err.code() {
        ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => RemoteError::NotFound(path.to_string()),
        _ => RemoteError::Transfer {
            path: path.to_string(),
            reason: err.to_string(),
        },
    }
}

impl RemoteSession for SshSession {
    fn execute(&mut self, command: &str) -> Result<Box<dyn CommandOutput + '_>, RemoteError> {
        tracing::debug!(command, "exec");
        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;
        // stdout and stderr share one channel window, so both are polled.
        self.session.set_blocking(false);
        Ok(Box::new(SshCommand {
            session: self.session.clone(),
            channel,
            stdout: Vec::new(),
            stderr: Vec::new(),
            eof: false,
        }))
    }

    fn upload(
        &mut self,
        local: &Path,
        remote: &str,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<u64, RemoteError> {
        let mut file = File::open(local)?;
        let total = file.metadata()?.len();
        let sftp = self.sftp()?;
        let mut remote_file = sftp
            .create(Path::new(remote))
            .map_err(|e| sftp_error(remote, e))?;

        copy_with_progress(&mut file, &mut remote_file, total, on_progress).map_err(|e| {
            RemoteError::Transfer {
                path: remote.to_string(),
                reason: e.to_string(),
            }
        })
    }

    fn download(
        &mut self,
        remote: &str,
        local: &Path,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<u64, RemoteError> {
        let sftp = self.sftp()?;
        let mut remote_file = sftp.open(Path::new(remote)).map_err(|e| sftp_error(remote, e))?;
        let total = remote_file.stat().ok().and_then(|s| s.size).unwrap_or(0);

        let part = part_path(local);
        let result = File::create(&part).and_then(|mut out| {
            let copied = copy_with_progress(&mut remote_file, &mut out, total, on_progress)?;
            out.sync_all()?;
            Ok(copied)
        });

        match result {
            Ok(copied) => {
                fs::rename(&part, local)?;
                Ok(copied)
            }
            Err(e) => {
                let _ = fs::remove_file(&part);
                Err(RemoteError::Transfer {
                    path: remote.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    fn remove(&mut self, remote: &str) -> Result<(), RemoteError> {
        self.sftp()?
            .unlink(Path::new(remote))
            .map_err(|e| sftp_error(remote, e))
    }

    fn stat(&mut self, remote: &str) -> Result<u64, RemoteError> {
        let stat = self
            .sftp()?
            .stat(Path::new(remote))
            .map_err(|e| sftp_error(remote, e))?;
        Ok(stat.size.unwrap_or(0))
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.sftp = None;
        let _ = self.session.disconnect(None, "session closed", None);
    }
}

struct SshCommand {
    session: Session,
    channel: Channel,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    eof: bool,
}

/// Append what `stream` has ready to `buf`; `Some(0)` at end of stream,
/// `None` when nothing is ready yet.
fn read_ready(stream: &mut impl Read, buf: &mut Vec<u8>) -> std::io::Result<Option<usize>> {
    let mut chunk = [0u8; READ_CHUNK];
    match stream.read(&mut chunk) {
        Ok(n) => {
            buf.extend_from_slice(&chunk[..n]);
            Ok(Some(n))
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

impl SshCommand {
    /// One non-blocking pass over both streams. Returns whether any bytes arrived.
    fn pump(&mut self) -> std::io::Result<bool> {
        let out = read_ready(&mut self.channel, &mut self.stdout)?;
        let err = read_ready(&mut self.channel.stderr(), &mut self.stderr)?;
        if out == Some(0) && self.channel.eof() {
            self.eof = true;
        }
        Ok(matches!(out, Some(n) if n > 0) || matches!(err, Some(n) if n > 0))
    }
}

/// Next complete line in `buf`, or the unterminated tail once the stream ended.
fn take_line(buf: &mut Vec<u8>, eof: bool) -> Option<String> {
    let end = match buf.iter().position(|b| *b == b'\n') {
        Some(pos) => pos + 1,
        None if eof && !buf.is_empty() => buf.len(),
        None => return None,
    };
    let mut line: Vec<u8> = buf.drain(..end).collect();
    while matches!(line.last(), Some(b'\n' | b'\r')) {
        line.pop();
    }
    Some(String::from_utf8_lossy(&line).into_owned())
}

impl Iterator for SshCommand {
    type Item = Result<String, RemoteError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(line) = take_line(&mut self.stdout, self.eof) {
                return Some(Ok(line));
            }
            if self.eof {
                return None;
            }
            match self.pump() {
                Ok(true) => {}
                Ok(false) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    self.eof = true;
                    self.stdout.clear();
                    return Some(Err(e.into()));
                }
            }
        }
    }
}

impl CommandOutput for SshCommand {
    fn finish(mut self: Box<Self>) -> Result<CommandExit, RemoteError> {
        while !self.eof {
            self.stdout.clear();
            if !self.pump()? {
                thread::sleep(POLL_INTERVAL);
            }
        }
        loop {
            match read_ready(&mut self.channel.stderr(), &mut self.stderr)? {
                Some(0) => break,
                Some(_) => {}
                None => thread::sleep(POLL_INTERVAL),
            }
        }

        self.session.set_blocking(true);
        self.channel.wait_close()?;
        let killed = self
            .channel
            .exit_signal()
            .map(|s| s.exit_signal.is_some())
            .unwrap_or(false);
        let status = if killed { None } else { self.channel.exit_status().ok() };

        Ok(CommandExit {
            status,
            stderr: String::from_utf8_lossy(&self.stderr).trim().to_string(),
        })
    }
}

impl Drop for SshCommand {
    fn drop(&mut self) {
        self.session.set_blocking(true);
    }
}
