use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use ftpbackup_core::{Connector, RemoteSession, SessionError};
use time::OffsetDateTime;
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File {
        body: Vec<u8>,
        modified: Option<OffsetDateTime>,
        size_known: bool,
    },
}

#[derive(Debug, Default)]
pub struct FakeState {
    nodes: BTreeMap<String, Node>,
    pub cursor: String,
    denied: HashSet<String>,
    broken: HashSet<String>,
    unlistable: HashSet<String>,
    failing_retrievals: HashMap<String, u32>,
    severed_by: Option<String>,
    severed: bool,
    pub retrievals: Vec<String>,
    pub closed: bool,
    pub connects: u32,
}

/// In-memory remote tree with a server-side cursor, shared with the test.
#[derive(Debug, Clone)]
pub struct FakeRemote {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRemote {
    pub fn new() -> Self {
        let state = FakeState {
            cursor: "/".to_string(),
            ..FakeState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn dir(self, path: &str) -> Self {
        self.lock().nodes.insert(path.to_string(), Node::Dir);
        self
    }

    pub fn file(self, path: &str, body: &[u8], modified: OffsetDateTime) -> Self {
        self.lock().nodes.insert(
            path.to_string(),
            Node::File {
                body: body.to_vec(),
                modified: Some(modified),
                size_known: true,
            },
        );
        self
    }

    /// A file whose size and modification time the server does not report.
    pub fn opaque_file(self, path: &str, body: &[u8]) -> Self {
        self.lock().nodes.insert(
            path.to_string(),
            Node::File {
                body: body.to_vec(),
                modified: None,
                size_known: false,
            },
        );
        self
    }

    pub fn touch(&self, path: &str, modified: OffsetDateTime) {
        if let Some(Node::File { modified: slot, .. }) = self.lock().nodes.get_mut(path) {
            *slot = Some(modified);
        }
    }

    /// Entering `path` fails with a 550 even though it is a directory.
    pub fn deny(self, path: &str) -> Self {
        self.lock().denied.insert(path.to_string());
        self
    }

    /// Entering `path` fails with a transient, non-rejection error.
    pub fn break_entry(self, path: &str) -> Self {
        self.lock().broken.insert(path.to_string());
        self
    }

    pub fn unlistable(self, path: &str) -> Self {
        self.lock().unlistable.insert(path.to_string());
        self
    }

    /// The next `times` retrievals of `path` write part of the body and then fail.
    pub fn fail_retrieval(self, path: &str, times: u32) -> Self {
        self.lock()
            .failing_retrievals
            .insert(path.to_string(), times);
        self
    }

    /// Retrieving `path` drops the connection; every later command fails.
    pub fn disconnect_on_retrieval(self, path: &str) -> Self {
        self.lock().severed_by = Some(path.to_string());
        self
    }

    pub fn set_cursor(&self, path: &str) {
        self.lock().cursor = path.to_string();
    }

    pub fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn session(&self) -> FakeSession {
        FakeSession {
            state: self.state.clone(),
        }
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            remote: self.clone(),
            refuse: false,
        }
    }

    pub fn refusing_connector(&self) -> FakeConnector {
        FakeConnector {
            remote: self.clone(),
            refuse: true,
        }
    }
}

pub struct FakeConnector {
    remote: FakeRemote,
    refuse: bool,
}

impl Connector for FakeConnector {
    type Session = FakeSession;

    async fn connect(&self) -> Result<FakeSession, SessionError> {
        if self.refuse {
            return Err(SessionError::Io(io::Error::from(
                io::ErrorKind::ConnectionRefused,
            )));
        }
        self.remote.lock().connects += 1;
        Ok(self.remote.session())
    }
}

pub struct FakeSession {
    state: Arc<Mutex<FakeState>>,
}

fn rejected(message: &str) -> SessionError {
    SessionError::Reply {
        code: 550,
        message: message.to_string(),
    }
}

fn resolve(cursor: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{cursor}/{path}")
    };
    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

impl FakeState {
    fn is_dir(&self, path: &str) -> bool {
        path == "/" || matches!(self.nodes.get(path), Some(Node::Dir))
    }

    fn connected(&self) -> Result<(), SessionError> {
        if self.severed {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }
}

impl RemoteSession for FakeSession {
    async fn change_directory(&mut self, path: &str) -> Result<(), SessionError> {
        let mut state = self.state.lock().unwrap();
        state.connected()?;
        let target = resolve(&state.cursor, path);
        if state.broken.contains(&target) {
            return Err(SessionError::Reply {
                code: 421,
                message: "service not available".to_string(),
            });
        }
        if state.denied.contains(&target) || !state.is_dir(&target) {
            return Err(rejected("not a directory"));
        }
        state.cursor = target;
        Ok(())
    }

    async fn current_directory(&mut self) -> Result<String, SessionError> {
        let state = self.state.lock().unwrap();
        state.connected()?;
        Ok(state.cursor.clone())
    }

    async fn list_names(&mut self, path: &str) -> Result<Vec<String>, SessionError> {
        let state = self.state.lock().unwrap();
        state.connected()?;
        let target = resolve(&state.cursor, path);
        if state.unlistable.contains(&target) {
            return Err(SessionError::Reply {
                code: 450,
                message: "listing unavailable".to_string(),
            });
        }
        if !state.is_dir(&target) {
            return Err(rejected("no such directory"));
        }
        let mut names = vec![".".to_string(), "..".to_string()];
        names.extend(
            state
                .nodes
                .keys()
                .filter(|candidate| candidate.as_str() != "/" && parent_of(candidate) == target)
                .filter_map(|candidate| candidate.rsplit('/').next())
                .map(str::to_string),
        );
        Ok(names)
    }

    async fn retrieve<W>(&mut self, path: &str, sink: &mut W) -> Result<u64, SessionError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let (body, fail) = {
            let mut state = self.state.lock().unwrap();
            state.connected()?;
            let target = resolve(&state.cursor, path);
            state.retrievals.push(target.clone());
            if state.severed_by.as_deref() == Some(target.as_str()) {
                state.severed = true;
                return Err(SessionError::Closed);
            }
            let body = match state.nodes.get(&target) {
                Some(Node::File { body, .. }) => body.clone(),
                _ => return Err(rejected("no such file")),
            };
            let fail = match state.failing_retrievals.get_mut(&target) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            };
            (body, fail)
        };

        if fail {
            sink.write_all(&body[..body.len() / 2]).await?;
            return Err(SessionError::Io(io::Error::from(
                io::ErrorKind::ConnectionReset,
            )));
        }
        sink.write_all(&body).await?;
        Ok(body.len() as u64)
    }

    async fn file_size(&mut self, path: &str) -> Result<u64, SessionError> {
        let state = self.state.lock().unwrap();
        state.connected()?;
        match state.nodes.get(&resolve(&state.cursor, path)) {
            Some(Node::File {
                body,
                size_known: true,
                ..
            }) => Ok(body.len() as u64),
            _ => Err(rejected("size unavailable")),
        }
    }

    async fn modified_time(&mut self, path: &str) -> Result<OffsetDateTime, SessionError> {
        let state = self.state.lock().unwrap();
        state.connected()?;
        match state.nodes.get(&resolve(&state.cursor, path)) {
            Some(Node::File {
                modified: Some(modified),
                ..
            }) => Ok(*modified),
            _ => Err(rejected("modification time unavailable")),
        }
    }

    async fn close(self) -> Result<(), SessionError> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}
