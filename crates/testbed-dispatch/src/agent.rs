//! Resident agent: the target-host side of the Remote Execution Protocol.
//!
//! The agent owns a root directory. Every assignment is staged into its own
//! subdirectory below that root, runs there through the local Subprocess
//! Driver, and is removed again on `Cleanup`. Paths outside the root are
//! refused.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use testbed_state::ArtifactEntry;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::driver::{CommandSpec, Driver};
use crate::error::{AgentError, AgentResult, DriverError, ProtocolResult};
use crate::protocol::{
    read_frame, sha256_hex, write_frame, CleanupRequest, ErrorResponse, ExecuteRequest,
    ExecuteResponse, Request, Response, StageRequest, AGENT_VERSION, ENVELOPE_SLACK,
    MAX_FRAME_LEN,
};

/// A staged assignment directory and the files put there by `Stage`.
#[derive(Debug, Clone)]
struct StagedDir {
    path: PathBuf,
    files: HashSet<String>,
}

/// Serves protocol requests against a local root directory.
#[derive(Debug)]
pub struct Agent {
    root: PathBuf,
    hostname: String,
    driver: Driver,
    staged: Mutex<HashMap<Uuid, StagedDir>>,
}

impl Agent {
    /// A relative `root` is resolved against the current directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            root: std::path::absolute(&root).unwrap_or(root),
            hostname: default_hostname(),
            driver: Driver::new(),
            staged: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_driver(mut self, driver: Driver) -> Self {
        self.driver = driver;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Accept connections forever, one task per connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = ?listener.local_addr().ok(), root = %self.root.display(), "agent listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "set_nodelay failed");
            }
            let agent = Arc::clone(&self);
            tokio::spawn(async move {
                debug!(%peer, "connection accepted");
                if let Err(e) = agent.handle_connection(stream).await {
                    warn!(%peer, error = %e, "connection ended with error");
                }
            });
        }
    }

    /// Serve requests on one connection until the peer closes it.
    ///
    /// The orchestrator sends nothing while an `Execute` is outstanding, so
    /// any read completing during execution means the peer has gone away;
    /// the running process is then killed.
    pub async fn handle_connection<S>(&self, stream: S) -> ProtocolResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        loop {
            let Some(request) = read_frame::<_, Request>(&mut reader).await? else {
                return Ok(());
            };
            debug!(request = request.name(), "request received");

            let response = match request {
                Request::Execute(req) => {
                    let assignment_id = req.assignment_id;
                    tokio::select! {
                        response = self.execute(req) => response,
                        _ = peer_gone(&mut reader) => {
                            warn!(%assignment_id, "peer disconnected during execute; process killed");
                            return Ok(());
                        }
                    }
                }
                other => self.handle(other).await,
            };
            write_frame(&mut writer, &response).await?;
        }
    }

    /// Answer one request. An `Execute` answered here is not watched for
    /// peer loss; that only happens inside [`Agent::handle_connection`].
    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong {
                version: AGENT_VERSION.to_string(),
                hostname: self.hostname.clone(),
            },
            Request::Stage(req) => {
                let assignment_id = req.assignment_id;
                match self.stage(req).await {
                    Ok(manifest) => Response::Staged {
                        assignment_id,
                        manifest,
                    },
                    Err(e) => error_response(e),
                }
            }
            Request::Execute(req) => self.execute(req).await,
            Request::Cleanup(req) => {
                let assignment_id = req.assignment_id;
                match self.cleanup(req).await {
                    Ok(()) => Response::CleanedUp { assignment_id },
                    Err(e) => error_response(e),
                }
            }
        }
    }

    #[instrument(skip(self, req), fields(assignment_id = %req.assignment_id))]
    async fn stage(&self, req: StageRequest) -> AgentResult<Vec<ArtifactEntry>> {
        let dir = self.inside_root(&req.destination)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AgentError::Staging(format!("create {}: {e}", dir.display())))?;

        let mut manifest = Vec::with_capacity(req.artifacts.len());
        let mut files = HashSet::new();
        for artifact in &req.artifacts {
            if !is_plain_file_name(&artifact.file_name) {
                return Err(AgentError::Staging(format!(
                    "artifact {}: bad file name {:?}",
                    artifact.name, artifact.file_name
                )));
            }
            let bytes = artifact.decode().map_err(AgentError::Staging)?;
            let target = dir.join(&artifact.file_name);
            tokio::fs::write(&target, &bytes)
                .await
                .map_err(|e| AgentError::Staging(format!("write {}: {e}", target.display())))?;
            manifest.push(ArtifactEntry {
                name: artifact.file_name.clone(),
                size: bytes.len() as u64,
                sha256: artifact.sha256.clone(),
            });
            files.insert(artifact.file_name.clone());
        }

        debug!(dir = %dir.display(), artifacts = manifest.len(), "staged");
        self.staged
            .lock()
            .await
            .insert(req.assignment_id, StagedDir { path: dir, files });
        Ok(manifest)
    }

    #[instrument(skip(self, req), fields(assignment_id = %req.assignment_id, command = %req.command))]
    async fn execute(&self, req: ExecuteRequest) -> Response {
        let assignment_id = req.assignment_id;
        let (base, staged_files) = match self.staged.lock().await.get(&assignment_id) {
            Some(staged) => (staged.path.clone(), staged.files.clone()),
            None => (self.root.join(assignment_id.to_string()), HashSet::new()),
        };
        let work_dir = match req.working_dir.as_deref() {
            Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
            Some(dir) => base.join(dir),
            None => base,
        };
        if let Err(e) = tokio::fs::create_dir_all(&work_dir).await {
            return error_response(AgentError::Launch(format!(
                "working directory {}: {e}",
                work_dir.display()
            )));
        }

        let spec = CommandSpec::new(&req.command)
            .args(req.args.iter().cloned())
            .current_dir(work_dir.clone())
            .timeout(Duration::from_millis(req.timeout_ms));

        let (output, timed_out) = match self.driver.run(&spec).await {
            Ok(output) => (output, false),
            Err(DriverError::TimeoutExceeded { output, .. }) => (*output, true),
            Err(e) => return error_response(AgentError::Launch(e.to_string())),
        };
        for failure in &output.reader_failures {
            warn!(failure = %failure, "output stream degraded");
        }

        let artifacts = match generated_files(&work_dir, &staged_files).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "could not list generated files");
                Vec::new()
            }
        };

        let mut response = ExecuteResponse {
            assignment_id,
            exit_status: output.exit_status,
            degraded: output.degraded(),
            duration_ms: output.elapsed.as_millis() as u64,
            timed_out,
            artifacts,
            dropped_lines: 0,
            reader_failures: output.reader_failures.iter().map(|f| f.to_string()).collect(),
            stdout: output.stdout,
            stderr: output.stderr,
        };
        if let Err(e) = response.fit_within(MAX_FRAME_LEN - ENVELOPE_SLACK) {
            return error_response(AgentError::Oversized(e.to_string()));
        }
        if response.dropped_lines > 0 {
            warn!(
                dropped_lines = response.dropped_lines,
                "output truncated to fit the response frame"
            );
        }
        Response::Executed(response)
    }

    /// Remove a staged directory. Naming the root itself empties it.
    #[instrument(skip(self, req), fields(assignment_id = %req.assignment_id))]
    async fn cleanup(&self, req: CleanupRequest) -> AgentResult<()> {
        let path = self.inside_root(&req.path)?;
        self.staged.lock().await.remove(&req.assignment_id);

        if path == self.root {
            let mut entries = match tokio::fs::read_dir(&path).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                remove_path(&entry.path()).await?;
            }
            return Ok(());
        }
        remove_path(&path).await
    }

    /// Resolve `path` and make sure it stays under the agent root. Relative
    /// paths are taken from the agent's current directory, as the root is.
    fn inside_root(&self, path: &str) -> AgentResult<PathBuf> {
        let outside = || AgentError::OutsideRoot(path.to_string());
        let candidate = Path::new(path);
        if candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(outside());
        }
        let candidate = std::path::absolute(candidate).map_err(|_| outside())?;
        if !candidate.starts_with(&self.root) {
            return Err(outside());
        }
        Ok(candidate)
    }
}

fn error_response(error: AgentError) -> Response {
    warn!(error = %error, "request failed");
    Response::Error(ErrorResponse::new(error.kind(), error.to_string()))
}

/// Completes when the peer closes its half or sends anything at all.
async fn peer_gone<R: AsyncRead + Unpin>(reader: &mut R) {
    let mut byte = [0u8; 1];
    let _ = reader.read(&mut byte).await;
}

fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

async fn remove_path(path: &Path) -> AgentResult<()> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(())
}

/// Regular files in `dir` that were not put there by staging.
async fn generated_files(
    dir: &Path,
    staged: &HashSet<String>,
) -> std::io::Result<Vec<ArtifactEntry>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if staged.contains(&name) || !entry.file_type().await?.is_file() {
            continue;
        }
        let bytes = tokio::fs::read(entry.path()).await?;
        found.push(ArtifactEntry {
            name,
            size: bytes.len() as u64,
            sha256: sha256_hex(&bytes),
        });
    }
    found.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(found)
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}
