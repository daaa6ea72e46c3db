//! The `execute` dispatcher: window menu commands, atomic saves, and
//! external program execution with selection piping.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::warn;

use paguridae_delta::Delta;

use super::errors::ErrorsBuffer;
use super::path::{PathInfo, META_FILE_ID};
use super::Session;
use crate::deltautil::delta_to_string;
use crate::ot::ClientChange;
use crate::protocol::{Action, Range, Selection};

impl Session {
    pub(super) async fn execute_command(
        self: &Arc<Self>,
        mut path_info: PathInfo,
        action: &Action,
    ) -> Result<(Option<Selection>, bool)> {
        let words: Vec<&str> = action.command.split(' ').collect();
        match words.first().copied().unwrap_or_default() {
            "New" => {
                self.create_dummy_file().await?;
                Ok((None, false))
            }
            "Del" => {
                self.delete_window(action).await;
                Ok((None, false))
            }
            "Undo" => {
                // Undo errors are ignored.
                let _ = self.server.undo(action.content_id()).await;
                Ok((None, false))
            }
            "Redo" => {
                let _ = self.server.redo(action.content_id()).await;
                Ok((None, false))
            }
            "Next" => {
                if !path_info.partial_load() {
                    return Ok((None, false));
                }
                let start = path_info.start.unwrap_or(0) + self.parse_scroll_size(&words);
                path_info.start = Some(start);
                path_info.length = Some(self.config.page_size as i64);
                self.find_or_open_file(path_info).await
            }
            "Prev" => {
                if !path_info.partial_load() {
                    return Ok((None, false));
                }
                let start = (path_info.start.unwrap_or(0) - self.parse_scroll_size(&words)).max(0);
                path_info.start = Some(start);
                path_info.length = Some(self.config.page_size as i64);
                self.find_or_open_file(path_info).await
            }
            "Put" => {
                if action.id == META_FILE_ID || path_info.path.is_empty() || path_info.path == "." {
                    return Ok((None, false));
                }
                self.put(&path_info, action).await?;
                Ok((None, false))
            }
            _ if action.command.starts_with("Edit") => {
                self.edit_file(action).await;
                Ok((None, false))
            }
            _ => self.run_program(&path_info, action).await,
        }
    }

    /// Close the two halves independently, so either can go away even if
    /// the other is already gone.
    async fn delete_window(self: &Arc<Self>, action: &Action) {
        self.server.close_files(vec![action.label_id()]).await;
        self.server.close_files(vec![action.content_id()]).await;
    }

    fn parse_scroll_size(&self, words: &[&str]) -> i64 {
        if words.len() != 2 {
            return self.config.scroll_size as i64;
        }
        words[1]
            .parse()
            .unwrap_or(self.config.scroll_size as i64)
    }

    /// Serialize the window body (text only, embeds stripped) and replace
    /// the on-disk file atomically via a sibling temp file and rename.
    /// Partial-load windows splice the buffer into the existing file
    /// around their byte range.
    async fn put(&self, path_info: &PathInfo, action: &Action) -> Result<()> {
        let content = self
            .server
            .content(action.content_id())
            .await
            .ok_or_else(|| anyhow!("cannot find file {} to save", action.content_id()))?;
        let data = delta_to_string(&content.delta, false);

        let source_metadata = match std::fs::metadata(&path_info.path) {
            Ok(metadata) => Some(metadata),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
            Err(error) => return Err(error.into()),
        };
        if source_metadata.is_none() && path_info.partial_load() {
            bail!("partial loading requires a file that exists");
        }

        let directory = Path::new(&path_info.path)
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut saving = tempfile::Builder::new()
            .prefix("saving")
            .tempfile_in(directory)
            .with_context(|| format!("cannot create temp file in {}", directory.display()))?;

        let mut source = match &source_metadata {
            Some(_) => Some(
                std::fs::File::open(&path_info.path)
                    .with_context(|| format!("cannot open {}", path_info.path))?,
            ),
            None => None,
        };

        if path_info.partial_load() {
            let start = path_info.start.unwrap_or(0);
            if start > 0 {
                if let Some(source) = source.as_mut() {
                    std::io::copy(&mut std::io::Read::by_ref(source).take(start as u64), saving.as_file_mut())
                        .context("cannot copy file head")?;
                }
            }
        }
        saving
            .as_file_mut()
            .write_all(data.as_bytes())
            .context("cannot write window content")?;
        if path_info.partial_load() {
            let start = path_info.start.unwrap_or(0);
            let length = path_info.length.unwrap_or(0);
            let size = source_metadata.as_ref().map(|m| m.len() as i64).unwrap_or(0);
            if start + length < size {
                if let Some(source) = source.as_mut() {
                    source
                        .seek(SeekFrom::Start((start + length) as u64))
                        .context("cannot seek past saved range")?;
                    std::io::copy(source, saving.as_file_mut())
                        .context("cannot copy file tail")?;
                }
            }
        }
        saving
            .persist(&path_info.path)
            .with_context(|| format!("cannot replace {}", path_info.path))?;
        self.mark_clean(action.content_id()).await
    }

    /// Resolve the first token on `PATH` and spawn it. A leading sigil
    /// decides the piping: `|` and `>` feed the selection to stdin, `|`
    /// and `<` replace the selection with captured stdout. Everything
    /// else streams into the window's `+Errors`.
    async fn run_program(
        self: &Arc<Self>,
        path_info: &PathInfo,
        action: &Action,
    ) -> Result<(Option<Selection>, bool)> {
        let trimmed = action.command.trim();
        let words: Vec<&str> = trimmed.split(' ').collect();
        let Some(first) = words.first().copied().filter(|word| !word.is_empty()) else {
            return Ok((None, false));
        };
        let sigil = first.chars().next();
        let pipe_selection_to_stdin = matches!(sigil, Some('|' | '>'));
        let pipe_stdout_to_selection = matches!(sigil, Some('|' | '<'));
        let name = if pipe_selection_to_stdin || pipe_stdout_to_selection {
            &first[1..]
        } else {
            first
        };
        let Some(program) = lookup_path(name) else {
            return Ok((None, false));
        };

        let selection = action.selection;
        let selection_end = selection.range.index + selection.range.length;
        let mut command = tokio::process::Command::new(&program);
        command
            .args(&words[1..])
            .env("winid", action.id.to_string())
            .env("%", &path_info.path)
            .env("samfile", &path_info.path)
            .env("paguridae_session", self.id().to_string())
            .env("paguridae_selection_id", selection.id.to_string())
            .env(
                "paguridae_selection_addr",
                format!("#{},#{}", selection.range.index, selection_end),
            )
            .stdin(if pipe_selection_to_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .with_context(|| format!("cannot start {}", program.display()))?;

        if pipe_selection_to_stdin {
            let text = match self.server.content(selection.id).await {
                Some(update) => {
                    let slice = update
                        .delta
                        .slice(selection.range.index as usize, selection_end as usize);
                    delta_to_string(&slice, false)
                }
                None => String::new(),
            };
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    let _ = stdin.write_all(text.as_bytes()).await;
                });
            }
        }

        let errors = Arc::new(self.errors_buffer(Some(action.label_id())).await);
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_to_errors(stderr, errors.clone()));
        }

        if pipe_stdout_to_selection {
            let stdout = child.stdout.take();
            let deadline = Duration::from_secs(self.config.command_timeout_seconds);
            // The child is owned by this future: a timeout drops it, which
            // kills the process tree and aborts the replacement.
            let captured = tokio::time::timeout(deadline, async move {
                let mut buffer = Vec::new();
                if let Some(mut stdout) = stdout {
                    stdout.read_to_end(&mut buffer).await?;
                }
                let status = child.wait().await?;
                Ok::<_, std::io::Error>((buffer, status))
            })
            .await;
            let (buffer, status) = match captured {
                Ok(result) => result.context("cannot collect command output")?,
                Err(_) => bail!("command `{trimmed}` timed out"),
            };
            if !status.success() {
                bail!("command `{trimmed}` failed: {status}");
            }
            let inserted = String::from_utf8_lossy(&buffer).into_owned();
            let inserted_length = inserted.chars().count() as u32;
            let Some(old_content) = self.server.content(selection.id).await else {
                bail!("selection target {} disappeared", selection.id);
            };
            self.server
                .submit(
                    None,
                    vec![ClientChange {
                        id: selection.id,
                        base: old_content.version,
                        delta: Delta::new()
                            .retain(selection.range.index as usize, None)
                            .delete(selection.range.length as usize)
                            .insert(inserted, None),
                        client_version: 0,
                    }],
                )
                .await;
            return Ok((
                Some(Selection {
                    id: selection.id,
                    range: Range {
                        index: selection.range.index,
                        length: inserted_length,
                    },
                }),
                false,
            ));
        }

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_to_errors(stdout, errors));
        }
        tokio::spawn(async move {
            if let Err(error) = child.wait().await {
                warn!(%error, "cannot reap spawned command");
            }
        });
        Ok((None, false))
    }
}

async fn pump_to_errors<R: AsyncRead + Unpin>(mut reader: R, errors: Arc<ErrorsBuffer>) {
    let mut buffer = [0u8; 4096];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(read) => {
                errors
                    .write(&String::from_utf8_lossy(&buffer[..read]))
                    .await;
            }
        }
    }
}

/// Resolve a program name against `PATH`, accepting explicit paths as-is.
fn lookup_path(name: &str) -> Option<std::path::PathBuf> {
    if name.is_empty() {
        return None;
    }
    if name.contains('/') {
        let candidate = std::path::PathBuf::from(name);
        return is_executable(&candidate).then_some(candidate);
    }
    let path_variable = std::env::var_os("PATH")?;
    std::env::split_paths(&path_variable)
        .map(|directory| directory.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
