//! The session layer: one 9P listener, a catalogue of windows, and the
//! high-level operations (open, save, search, edit, pipe, paging) that
//! drive documents through the OT server.

mod errors;
mod exec;
mod manager;
pub mod path;

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, PoisonError};

use anyhow::{anyhow, bail, Context as _, Result};
use tokio::net::UnixListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use paguridae_delta::Delta;
use paguridae_editor::Context as EditorContext;

use crate::config::Config;
use crate::deltautil::{delta_to_string, diff};
use crate::fs;
use crate::ot::{self, ClientChange, Event, ServerHandle};
use crate::protocol::{Action, Range, Selection};

pub use errors::ErrorsBuffer;
pub use manager::SessionManager;
pub use path::{
    extract_full_path, extract_path, parse_full_path, PathInfo, DEFAULT_LABEL, META_FILE_ID,
};

pub const SOCKET_DIR: &str = "/tmp/paguridae";

pub struct Session {
    session_id: Uuid,
    pub server: ServerHandle,
    pub(crate) config: Arc<Config>,
    flush_channels: StdMutex<HashMap<Uuid, mpsc::Sender<()>>>,
    listen_path: std::path::PathBuf,
    shutdown: broadcast::Sender<()>,
}

impl Session {
    /// Build a session: bind its UNIX listener, start the OT server,
    /// create the metafile and the two initial windows, and start the 9P
    /// surface. Construction failures tear everything down.
    pub async fn create(config: Arc<Config>) -> Result<Arc<Session>> {
        let session_id = Uuid::new_v4();
        std::fs::create_dir_all(SOCKET_DIR)
            .with_context(|| format!("failed to create session directory {SOCKET_DIR}"))?;
        let listen_path = Path::new(SOCKET_DIR).join(session_id.to_string());
        let listener = UnixListener::bind(&listen_path)
            .with_context(|| format!("failed to listen at {}", listen_path.display()))?;

        let (server, _loop_task) = ot::spawn();
        let mut events = server.connect(None).await;
        let first = events
            .recv()
            .await
            .context("ot server closed during connect")?;
        let system_client_id = first
            .connected_client_id
            .context("connect event is missing the client id")?;
        debug!(%system_client_id, "system client connected");

        let (shutdown, _) = broadcast::channel(4);
        let session = Arc::new(Session {
            session_id,
            server,
            config,
            flush_channels: StdMutex::new(HashMap::new()),
            listen_path,
            shutdown,
        });

        // The metafile refresher: reacts to every created/closed file by
        // rebuilding the metafile as a diff, atomically on the server loop.
        let refresher = session.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if event.created_file_ids.is_empty() && event.closed_file_ids.is_empty() {
                    continue;
                }
                if let Err(error) = refresher.refresh_metafile().await {
                    warn!(%error, "error refreshing meta file");
                }
            }
        });

        if let Err(error) = session.bootstrap().await {
            session.server.shutdown().await;
            let _ = std::fs::remove_file(&session.listen_path);
            return Err(error);
        }

        tokio::spawn(fs::serve(
            session.clone(),
            listener,
            session.shutdown.subscribe(),
        ));
        info!(session_id = %session.session_id, "session created");
        Ok(session)
    }

    async fn bootstrap(self: &Arc<Self>) -> Result<()> {
        let ids = self.server.create_files(vec![Delta::new()]).await?;
        if ids.first() != Some(&META_FILE_ID) {
            bail!("unexpected meta file id: {:?}", ids.first());
        }
        // A new session has two windows: an empty one, and one showing
        // the working directory.
        let current_dir = std::env::current_dir().context("cannot resolve working directory")?;
        self.create_dummy_file().await?;
        self.create_directory_listing_file(&current_dir.to_string_lossy())
            .await?;
        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.session_id
    }

    /// Register a browser client. The returned flush channel wakes the
    /// connection's drain loop.
    pub async fn connect(
        &self,
        client_id: Option<Uuid>,
    ) -> Result<(Uuid, mpsc::UnboundedReceiver<Event>, mpsc::Receiver<()>)> {
        let mut events = self.server.connect(client_id).await;
        let first = events
            .recv()
            .await
            .context("ot server closed during connect")?;
        let id = first
            .connected_client_id
            .context("connect event is missing the client id")?;
        let (flush_tx, flush_rx) = mpsc::channel(1);
        self.flush_channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, flush_tx);
        Ok((id, events, flush_rx))
    }

    pub async fn disconnect(&self, client_id: Uuid) {
        self.server.disconnect(client_id).await;
        self.flush_channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&client_id);
    }

    pub fn connections(&self) -> usize {
        self.flush_channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Wake every client's drain loop without blocking; a client whose
    /// signal slot is already full is woken anyway.
    pub fn flush(&self) {
        let channels: Vec<mpsc::Sender<()>> = self
            .flush_channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for channel in channels {
            let _ = channel.try_send(());
        }
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(());
        let _ = std::fs::remove_file(&self.listen_path);
        self.server.shutdown().await;
        info!(session_id = %self.session_id, "session stopped");
    }

    /// Rebuild the metafile as one line per open window label, preserving
    /// any per-line edits clients have made, and submit the result as a
    /// minimal diff.
    async fn refresh_metafile(&self) -> Result<()> {
        self.server
            .update_all(Box::new(|contents| {
                let old_meta = contents
                    .iter()
                    .find(|content| content.id == META_FILE_ID)
                    .ok_or_else(|| {
                        anyhow!("metafile does not exist, something is seriously wrong")
                    })?;
                let mut old_lines = HashMap::new();
                for line in delta_to_string(&old_meta.delta, true).split('\n') {
                    if line.is_empty() {
                        continue;
                    }
                    let (id_text, _) = line
                        .split_once(' ')
                        .ok_or_else(|| anyhow!("invalid metafile line: {line}"))?;
                    let id: u32 = id_text
                        .parse()
                        .with_context(|| format!("invalid metafile id in line: {line}"))?;
                    old_lines.insert(id, line.to_string());
                }
                let mut label_ids: Vec<u32> = contents
                    .iter()
                    .map(|content| content.id)
                    .filter(|id| id % 2 == 1)
                    .collect();
                label_ids.sort_unstable();
                let mut new_meta = Delta::new();
                for id in label_ids {
                    new_meta = match old_lines.get(&id) {
                        Some(line) => new_meta.insert(line.clone(), None).insert("\n", None),
                        None => new_meta.insert(format!("{id} 0 0\n"), None),
                    };
                }
                let patch = diff(&old_meta.delta, &new_meta);
                if patch.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(vec![ClientChange {
                    id: META_FILE_ID,
                    delta: patch,
                    base: old_meta.version,
                    client_version: 0,
                }])
            }))
            .await
    }

    /// Create a window: a label/content document pair with consecutive
    /// (odd, even) ids. Returns the content id.
    async fn create_file(&self, label: &str, content: Option<&str>) -> Result<u32> {
        let content_delta = match content {
            Some(text) => Delta::new().insert(text, None),
            None => Delta::new(),
        };
        let ids = self
            .server
            .create_files(vec![Delta::new().insert(label, None), content_delta])
            .await?;
        let (label_id, content_id) = (ids[0], ids[1]);
        if label_id % 2 != 1 || content_id != label_id + 1 {
            self.server.close_files(vec![label_id, content_id]).await;
            bail!("unexpected allocated file ids: {label_id} {content_id}");
        }
        Ok(content_id)
    }

    pub async fn create_dummy_file(&self) -> Result<u32> {
        self.create_file(DEFAULT_LABEL, None).await
    }

    /// Find the window whose label path matches `path`, or create an empty
    /// one labeled with it.
    pub async fn find_or_create_dummy_file(&self, path: &str) -> Result<u32> {
        for content in self.server.all_contents().await {
            if content.id % 2 == 1 && extract_path(&content.delta).path == path {
                return Ok(content.id + 1);
            }
        }
        self.create_file(&format!("{path}{DEFAULT_LABEL}"), None)
            .await
    }

    /// Open a window listing `path` via `ls -F`.
    pub async fn create_directory_listing_file(&self, path: &str) -> Result<()> {
        let mut path = path.to_string();
        if !path.ends_with('/') {
            path.push('/');
        }
        let output = tokio::process::Command::new("ls")
            .arg("-F")
            .arg(&path)
            .output()
            .await
            .context("failed to run ls")?;
        if !output.status.success() {
            bail!("ls -F {path} failed: {}", output.status);
        }
        let content = String::from_utf8_lossy(&output.stdout).into_owned();
        self.create_file(&format!("{path}{DEFAULT_LABEL}"), Some(&content))
            .await?;
        Ok(())
    }

    /// Run a sam address over a buffer. Failures are logged and treated as
    /// "no selection"; a located selection is clamped to half a page.
    fn sam_search(&self, file: &mut paguridae_editor::File, location: &str) -> (usize, usize) {
        if location.is_empty() {
            return (0, 0);
        }
        let program = match paguridae_editor::compile(&format!("{location}=")) {
            Ok(program) => program,
            Err(error) => {
                warn!(%error, location, "compile sam command error");
                return (0, 0);
            }
        };
        if let Err(error) = program.run(EditorContext {
            file,
            printer: None,
        }) {
            warn!(%error, location, "run sam command error");
            return (0, 0);
        }
        let (q0, q1) = file.dot();
        let length = (q1 - q0).min(self.config.page_size as usize / 2);
        (q0, q0 + length)
    }

    /// Open semantics: reuse a window matching this exact path identity,
    /// otherwise load from disk, promoting oversized files to partial-load
    /// windows around the sam address's focal point.
    pub async fn find_or_open_file(
        &self,
        mut info: PathInfo,
    ) -> Result<(Option<Selection>, bool)> {
        let all = self.server.all_contents().await;
        let label_id = all
            .iter()
            .filter(|content| content.id % 2 == 1)
            .find(|content| info.same(&extract_path(&content.delta)))
            .map(|content| content.id);
        if let Some(label_id) = label_id {
            let content_id = label_id + 1;
            let Some(content) = all.iter().find(|update| update.id == content_id) else {
                bail!("label file {label_id} is found but content file {content_id} is missing");
            };
            let mut file = paguridae_editor::File::from_delta(&content.delta);
            let (q0, q1) = self.sam_search(&mut file, &info.location);
            return Ok((
                Some(Selection {
                    id: content_id,
                    range: q_to_range(q0, q1),
                }),
                false,
            ));
        }

        let metadata = std::fs::metadata(&info.path)
            .with_context(|| format!("cannot stat {}", info.path))?;
        let size = metadata.len() as i64;
        let mut selected: Option<Range> = None;
        if info.partial_load() {
            let start = info.start.unwrap_or(0).max(0);
            let length = info.length.unwrap_or(0).min(size - start).max(0);
            info.start = Some(start);
            info.length = Some(length);
        } else if size > self.config.page_size as i64 {
            // No explicit range: use the sam address to pick a focal point
            // and promote to a partial-load window around it.
            let bytes = std::fs::read(&info.path)
                .with_context(|| format!("cannot read {}", info.path))?;
            let mut file = paguridae_editor::File::from_reader(bytes.as_slice())?;
            let (q0, q1) = self.sam_search(&mut file, &info.location);
            let mut start = 0i64;
            let mut length = self.config.page_size as i64;
            if q1 > q0 {
                start = (q0 as i64 - 128).max(0);
                length = length.min(size - start);
            }
            let relative0 = (q0 as i64 - start).max(0);
            let relative1 = (q1 as i64 - start).max(relative0);
            selected = Some(Range {
                index: relative0 as u32,
                length: (relative1 - relative0) as u32,
            });
            info.start = Some(start);
            info.length = Some(length);
        }

        let (content, label) = if info.partial_load() {
            let start = info.start.unwrap_or(0);
            let length = info.length.unwrap_or(0);
            let mut file = std::fs::File::open(&info.path)
                .with_context(|| format!("cannot open {}", info.path))?;
            file.seek(SeekFrom::Start(start as u64))?;
            let mut buffer = Vec::with_capacity(length.max(0) as usize);
            file.take(length.max(0) as u64).read_to_end(&mut buffer)?;
            (
                buffer,
                format!("({start},{length},{size}){}{DEFAULT_LABEL}", info.path),
            )
        } else {
            let buffer = std::fs::read(&info.path)
                .with_context(|| format!("cannot read {}", info.path))?;
            (buffer, format!("{}{DEFAULT_LABEL}", info.path))
        };

        let content_text = String::from_utf8_lossy(&content).into_owned();
        let content_id = self.create_file(&label, Some(&content_text)).await?;
        let range = match selected {
            Some(range) => range,
            None => {
                let mut file = paguridae_editor::File::from_delta(
                    &Delta::new().insert(content_text.as_str(), None),
                );
                let (q0, q1) = self.sam_search(&mut file, &info.location);
                q_to_range(q0, q1)
            }
        };
        Ok((
            Some(Selection {
                id: content_id,
                range,
            }),
            true,
        ))
    }

    /// Compile and run a sam script against a document, atomically on the
    /// server loop. Script failures leave the document untouched.
    pub(crate) async fn run_sam_command(&self, file_id: u32, script: &str) -> Result<()> {
        let program = paguridae_editor::compile(script)
            .with_context(|| format!("cannot compile sam script `{script}`"))?;
        self.server
            .update(
                file_id,
                Box::new(move |content| {
                    let mut file = paguridae_editor::File::from_delta(&content);
                    program.run(EditorContext {
                        file: &mut file,
                        printer: None,
                    })?;
                    Ok(file.changes())
                }),
            )
            .await
    }

    /// Rewrite the window's label to carry the `|*` dirty marker.
    pub(crate) async fn mark_dirty(&self, file_id: u32) -> Result<()> {
        self.run_sam_command(label_id_of(file_id), r"1s/\|\*?/|*/")
            .await
    }

    /// Drop the dirty marker after a successful save.
    pub(crate) async fn mark_clean(&self, file_id: u32) -> Result<()> {
        self.run_sam_command(label_id_of(file_id), r"1s/\|\*/|/").await
    }

    /// Submit a batch of client changes; every touched window's label gets
    /// the dirty marker. Changes to the metafile are ignored.
    pub async fn apply_changes(&self, client_id: Uuid, changes: Vec<ClientChange>) -> Result<()> {
        for change in changes {
            if change.id == META_FILE_ID {
                continue;
            }
            let file_id = change.id;
            self.server.submit(Some(client_id), vec![change]).await;
            self.mark_dirty(file_id).await?;
        }
        Ok(())
    }

    /// Run an `Edit` script over the window's content with the action's
    /// selection as dot. Error output lands in the window's `+Errors`.
    async fn edit_file(self: &Arc<Self>, action: &Action) {
        let script = action.command.get(4..).unwrap_or_default().trim().to_string();
        let selection = action.selection;
        let printed = Arc::new(StdMutex::new(Vec::<u8>::new()));
        let captured = printed.clone();
        let result = self
            .server
            .update(
                action.content_id(),
                Box::new(move |content| {
                    let mut file = paguridae_editor::File::from_delta(&content);
                    file.select(
                        selection.range.index as usize,
                        (selection.range.index + selection.range.length) as usize,
                    );
                    let program = paguridae_editor::compile(&script)?;
                    let mut printer = Vec::new();
                    let run_result = program.run(EditorContext {
                        file: &mut file,
                        printer: Some(&mut printer),
                    });
                    *captured.lock().unwrap_or_else(PoisonError::into_inner) = printer;
                    run_result?;
                    Ok(file.changes())
                }),
            )
            .await;

        match result {
            Ok(()) => {
                let output = printed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                if !output.is_empty() {
                    self.errors_buffer(Some(action.label_id()))
                        .await
                        .write(&String::from_utf8_lossy(&output))
                        .await;
                }
                // This marks windows dirty even for read-only scripts, but
                // the simple path is good enough for now.
                if let Err(error) = self.mark_dirty(action.content_id()).await {
                    warn!(%error, "cannot mark edited window dirty");
                }
                self.server.broadcast().await;
            }
            Err(error) => {
                self.errors_buffer(Some(action.label_id()))
                    .await
                    .write(&format!("Edit error: {error}\n"))
                    .await;
            }
        }
    }

    /// Dispatch a client action: `search` resolves paths/buffers, `execute`
    /// runs window commands and external programs.
    pub async fn execute(
        self: &Arc<Self>,
        _client_id: Uuid,
        action: &Action,
    ) -> Result<(Option<Selection>, bool)> {
        let label = self
            .server
            .content(action.label_id())
            .await
            .ok_or_else(|| {
                anyhow!(
                    "cannot find label file: {}, something must be wrong",
                    action.label_id()
                )
            })?;
        let label_path = extract_full_path(&label.delta);

        match action.kind.as_str() {
            "search" => self.search(action, &label_path).await,
            "execute" => {
                let result = self
                    .execute_command(parse_full_path(&label_path), action)
                    .await;
                if let Err(error) = &result {
                    self.errors_buffer(None)
                        .await
                        .write(&format!("Execution error: {error}\n"))
                        .await;
                }
                result
            }
            other => Err(anyhow!("unknown action type: {other}")),
        }
    }

    async fn search(
        self: &Arc<Self>,
        action: &Action,
        label_path: &str,
    ) -> Result<(Option<Selection>, bool)> {
        if action.command.is_empty() {
            return Ok((None, false));
        }
        let full_path = if path::ABSOLUTE_PATH_RE.is_match(&action.command) {
            action.command.clone()
        } else {
            let mut full = label_path.to_string();
            if !full.ends_with('/') {
                full.push_str("/../");
            }
            full.push_str(&action.command);
            full
        };
        let info = parse_full_path(&full_path);
        let metadata = match std::fs::metadata(&info.path) {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok((self.search_in_buffer(action).await, false));
            }
            Err(error) => return Err(error.into()),
        };
        if metadata.is_dir() {
            self.create_directory_listing_file(&info.path).await?;
            return Ok((None, false));
        }
        self.find_or_open_file(info).await
    }

    /// Plain-text search through the window body, starting past the
    /// current hit so repeated searches advance. No wraparound: matches
    /// before the cursor stay unfound.
    async fn search_in_buffer(&self, action: &Action) -> Option<Selection> {
        let update = self.server.content(action.content_id()).await?;
        let content = crate::deltautil::delta_to_runes(&update.delta, false);
        let target: Vec<char> = action.command.chars().collect();
        let length = target.len();
        let mut start = action.index as usize + length;
        while start + length <= content.len() {
            if content[start..start + length] == target[..] {
                return Some(Selection {
                    id: action.content_id(),
                    range: Range {
                        index: start as u32,
                        length: length as u32,
                    },
                });
            }
            start += 1;
        }
        None
    }
}

pub(crate) fn label_id_of(file_id: u32) -> u32 {
    file_id - 1 + file_id % 2
}

pub(crate) fn q_to_range(q0: usize, q1: usize) -> Range {
    Range {
        index: q0 as u32,
        length: (q1 - q0) as u32,
    }
}
