//! Per-directory `+Errors` windows: command failures and subprocess
//! output stay inside the editor's own interaction model.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use super::path::{clean_path, extract_path};
use super::Session;

/// A lazy writer into a directory's `+Errors` window. The window is
/// created on first write and reused afterwards.
pub struct ErrorsBuffer {
    session: Arc<Session>,
    dir: String,
    content_id: Mutex<Option<u32>>,
}

impl Session {
    /// An errors buffer for the directory of `label_id`'s window, or the
    /// working directory when no window is involved.
    pub(crate) async fn errors_buffer(self: &Arc<Self>, label_id: Option<u32>) -> ErrorsBuffer {
        let dir = match label_id {
            Some(id) => match self.server.content(id).await {
                Some(update) => parent_dir(&extract_path(&update.delta).path),
                None => String::new(),
            },
            None => String::new(),
        };
        ErrorsBuffer {
            session: self.clone(),
            dir,
            content_id: Mutex::new(None),
        }
    }
}

impl ErrorsBuffer {
    pub async fn write(&self, text: &str) {
        let mut guard = self.content_id.lock().await;
        let content_id = match *guard {
            Some(id) => id,
            None => {
                let path = join_errors_path(&self.dir);
                match self.session.find_or_create_dummy_file(&path).await {
                    Ok(id) => {
                        *guard = Some(id);
                        id
                    }
                    Err(error) => {
                        warn!(%error, path, "cannot create +Errors window");
                        return;
                    }
                }
            }
        };
        if let Err(error) = self.session.server.append(content_id, text.to_string()).await {
            warn!(%error, content_id, "cannot append to +Errors window");
        }
    }
}

fn parent_dir(path: &str) -> String {
    match std::path::Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_string_lossy().into_owned(),
        _ => {
            if path.starts_with('/') {
                "/".to_string()
            } else {
                ".".to_string()
            }
        }
    }
}

fn join_errors_path(dir: &str) -> String {
    if dir.is_empty() || dir == "." {
        "+Errors".to_string()
    } else {
        clean_path(&format!("{dir}/+Errors"))
    }
}

#[cfg(test)]
mod tests {
    use super::{join_errors_path, parent_dir};

    #[test]
    fn parent_dir_matches_directory_semantics() {
        assert_eq!(parent_dir("/tmp/file.txt"), "/tmp");
        assert_eq!(parent_dir("/tmp"), "/");
        assert_eq!(parent_dir("file.txt"), ".");
        assert_eq!(parent_dir(""), ".");
        assert_eq!(parent_dir("."), ".");
    }

    #[test]
    fn errors_path_stays_inside_the_directory() {
        assert_eq!(join_errors_path(""), "+Errors");
        assert_eq!(join_errors_path("."), "+Errors");
        assert_eq!(join_errors_path("/tmp"), "/tmp/+Errors");
        assert_eq!(join_errors_path("/tmp/"), "/tmp/+Errors");
    }
}
