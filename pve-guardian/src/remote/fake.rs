//! Scripted in-memory host used by engine tests.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::{CommandExit, CommandOutput, Connector, RemoteError, RemoteSession, SshTarget};

#[derive(Debug, Clone)]
pub struct Reply {
    pub stdout: Vec<String>,
    pub status: Option<i32>,
    pub stderr: String,
    /// Files that appear on the host when the command runs
    pub creates: Vec<(String, Vec<u8>)>,
}

impl Reply {
    pub fn ok(lines: &[&str]) -> Self {
        Self {
            stdout: lines.iter().map(|l| l.to_string()).collect(),
            status: Some(0),
            stderr: String::new(),
            creates: Vec::new(),
        }
    }

    pub fn failed(status: Option<i32>, stderr: &str) -> Self {
        Self {
            stdout: Vec::new(),
            status,
            stderr: stderr.to_string(),
            creates: Vec::new(),
        }
    }

    pub fn creating(mut self, path: &str, content: &[u8]) -> Self {
        self.creates.push((path.to_string(), content.to_vec()));
        self
    }
}

struct Rule {
    prefix: String,
    replies: VecDeque<Reply>,
}

#[derive(Default)]
struct HostState {
    rules: Vec<Rule>,
    commands: Vec<String>,
    files: HashMap<String, Vec<u8>>,
    connect_failures: usize,
    connects: usize,
    failing_downloads: Vec<String>,
}

/// Clones share one host.
#[derive(Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands starting with `prefix`. Queued replies are consumed
    /// in order; the last one repeats.
    pub fn on(&self, prefix: &str, reply: Reply) -> &Self {
        let mut state = self.state.lock().unwrap();
        match state.rules.iter_mut().find(|r| r.prefix == prefix) {
            Some(rule) => rule.replies.push_back(reply),
            None => state.rules.push(Rule {
                prefix: prefix.to_string(),
                replies: VecDeque::from([reply]),
            }),
        }
        self
    }

    pub fn fail_connects(&self, count: usize) {
        self.state.lock().unwrap().connect_failures = count;
    }

    pub fn fail_download(&self, path: &str) {
        self.state.lock().unwrap().failing_downloads.push(path.to_string());
    }

    pub fn put_file(&self, path: &str, content: &[u8]) {
        self.state.lock().unwrap().files.insert(path.to_string(), content.to_vec());
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.state.lock().unwrap().files.contains_key(path)
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn ran(&self, prefix: &str) -> bool {
        self.commands().iter().any(|c| c.starts_with(prefix))
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }
}

impl Connector for FakeHost {
    fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(RemoteError::Connect {
                host: target.host.clone(),
                port: target.port,
                reason: "connection refused".into(),
            });
        }
        Ok(Box::new(FakeSession { host: self.clone() }))
    }
}

struct FakeSession {
    host: FakeHost,
}

struct FakeOutput {
    lines: std::vec::IntoIter<String>,
    exit: CommandExit,
}

impl Iterator for FakeOutput {
    type Item = Result<String, RemoteError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.lines.next().map(Ok)
    }
}

impl CommandOutput for FakeOutput {
    fn finish(self: Box<Self>) -> Result<CommandExit, RemoteError> {
        Ok(self.exit)
    }
}

impl RemoteSession for FakeSession {
    fn execute(&mut self, command: &str) -> Result<Box<dyn CommandOutput + '_>, RemoteError> {
        let mut state = self.host.state.lock().unwrap();
        state.commands.push(command.to_string());

        let reply = state
            .rules
            .iter_mut()
            .filter(|r| command.starts_with(&r.prefix))
            .max_by_key(|r| r.prefix.len())
            .map(|rule| {
                if rule.replies.len() > 1 {
                    rule.replies.pop_front().unwrap()
                } else {
                    rule.replies[0].clone()
                }
            })
            .unwrap_or_else(|| Reply::failed(Some(1), ""));

        for (path, content) in &reply.creates {
            state.files.insert(path.clone(), content.clone());
        }

        Ok(Box::new(FakeOutput {
            lines: reply.stdout.into_iter(),
            exit: CommandExit {
                status: reply.status,
                stderr: reply.stderr,
            },
        }))
    }

    fn upload(
        &mut self,
        local: &Path,
        remote: &str,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<u64, RemoteError> {
        let content = std::fs::read(local)?;
        let len = content.len() as u64;
        self.host.put_file(remote, &content);
        on_progress(len, len);
        Ok(len)
    }

    fn download(
        &mut self,
        remote: &str,
        local: &Path,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<u64, RemoteError> {
        let state = self.host.state.lock().unwrap();
        if state.failing_downloads.iter().any(|p| p == remote) {
            return Err(RemoteError::Transfer {
                path: remote.to_string(),
                reason: "connection reset".into(),
            });
        }
        let content = state
            .files
            .get(remote)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(remote.to_string()))?;
        drop(state);

        std::fs::write(local, &content)?;
        let len = content.len() as u64;
        on_progress(len, len);
        Ok(len)
    }

    fn remove(&mut self, remote: &str) -> Result<(), RemoteError> {
        let mut state = self.host.state.lock().unwrap();
        state.commands.push(format!("<rm> {remote}"));
        state
            .files
            .remove(remote)
            .map(|_| ())
            .ok_or_else(|| RemoteError::NotFound(remote.to_string()))
    }

    fn stat(&mut self, remote: &str) -> Result<u64, RemoteError> {
        self.host
            .state
            .lock()
            .unwrap()
            .files
            .get(remote)
            .map(|c| c.len() as u64)
            .ok_or_else(|| RemoteError::NotFound(remote.to_string()))
    }
}
