//! The acme-style synthetic 9P filesystem served on the session's UNIX
//! listener. Qid paths pack three fields: the low bit selects root vs
//! window entries, bits 8..16 carry the entry kind, and the high 32 bits
//! carry the window's label id.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use paguridae_ninep::{
    read_fcall, write_fcall, Dir, Fcall, Qid, DMAPPEND, DMDIR, OCEXEC, OEXEC, ORCLOSE, ORDWR,
    OREAD, OTRUNC, OWRITE, QTAPPEND, QTDIR, QTFILE, VERSION_9P2000,
};

use crate::deltautil::delta_to_string;
use crate::session::Session;

const PATH_TYPE_MASK: u64 = 0x1;
const PATH_TYPE_ROOT: u64 = 0x0;
const PATH_TYPE_FILE: u64 = 0x1;

const Q_DIR: u64 = 0x0;
const Q_ROOT_CONS: u64 = 0x1;
const Q_ROOT_INDEX: u64 = 0x2;
const Q_ROOT_NEW: u64 = 0x3;
const Q_FILE_ADDR: u64 = 0x1;
const Q_FILE_BODY: u64 = 0x2;
const Q_FILE_CTL: u64 = 0x3;
const Q_FILE_DATA: u64 = 0x4;
const Q_FILE_ERRORS: u64 = 0x5;
const Q_FILE_EVENT: u64 = 0x6;
const Q_FILE_TAG: u64 = 0x7;
const Q_FILE_XDATA: u64 = 0x8;
const Q_FILE_RICH_BODY: u64 = 0x12;
const Q_FILE_RICH_DATA: u64 = 0x14;
const Q_MASK: u64 = 0xFF;

struct EntryInfo {
    name: &'static str,
    qtype: u8,
    perm: u32,
}

const fn entry(path: u64, name: &'static str, qtype: u8, perm: u32) -> (u64, EntryInfo) {
    (path, EntryInfo { name, qtype, perm })
}

static ENTRIES: &[(u64, EntryInfo)] = &[
    entry(PATH_TYPE_ROOT | (Q_DIR << 8), "/", QTDIR, 0o500 | DMDIR),
    entry(PATH_TYPE_ROOT | (Q_ROOT_CONS << 8), "cons", QTFILE, 0o600),
    entry(PATH_TYPE_ROOT | (Q_ROOT_INDEX << 8), "index", QTFILE, 0o400),
    entry(PATH_TYPE_ROOT | (Q_ROOT_NEW << 8), "new", QTDIR, 0o500 | DMDIR),
    entry(PATH_TYPE_FILE | (Q_DIR << 8), ".", QTDIR, 0o500 | DMDIR),
    entry(PATH_TYPE_FILE | (Q_FILE_ADDR << 8), "addr", QTFILE, 0o600),
    entry(
        PATH_TYPE_FILE | (Q_FILE_BODY << 8),
        "body",
        QTAPPEND,
        0o600 | DMAPPEND,
    ),
    entry(PATH_TYPE_FILE | (Q_FILE_CTL << 8), "ctl", QTFILE, 0o600),
    entry(PATH_TYPE_FILE | (Q_FILE_DATA << 8), "data", QTFILE, 0o600),
    entry(PATH_TYPE_FILE | (Q_FILE_ERRORS << 8), "errors", QTFILE, 0o200),
    entry(PATH_TYPE_FILE | (Q_FILE_EVENT << 8), "event", QTFILE, 0o600),
    entry(
        PATH_TYPE_FILE | (Q_FILE_TAG << 8),
        "tag",
        QTAPPEND,
        0o600 | DMAPPEND,
    ),
    entry(PATH_TYPE_FILE | (Q_FILE_XDATA << 8), "xdata", QTFILE, 0o600),
    entry(
        PATH_TYPE_FILE | (Q_FILE_RICH_BODY << 8),
        "rich_body",
        QTAPPEND,
        0o600 | DMAPPEND,
    ),
    entry(
        PATH_TYPE_FILE | (Q_FILE_RICH_DATA << 8),
        "rich_data",
        QTFILE,
        0o600,
    ),
];

fn entry_info(path: u64) -> Option<&'static EntryInfo> {
    let key = path & 0xFFFF_FFFF;
    ENTRIES
        .iter()
        .find(|(entry_path, _)| *entry_path == key)
        .map(|(_, info)| info)
}

static DIRECTORY_LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^ \n\|]+/\s+\|").expect("directory label pattern is valid"));
static DIRTY_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[^ \n\|]+\s+)?(\|\*)").expect("dirty label pattern is valid")
});

/// Accept loop: one task per 9P client connection.
pub async fn serve(
    session: Arc<Session>,
    listener: UnixListener,
    mut shutdown: broadcast::Receiver<()>,
) {
    let user = std::env::var("USER").unwrap_or_else(|_| "none".to_string());
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let session = session.clone();
                    let user = user.clone();
                    tokio::spawn(async move {
                        if let Err(error) = serve_connection(session, stream, user).await {
                            debug!(%error, "9p connection closed");
                        }
                    });
                }
                Err(error) => {
                    warn!(%error, "9p accept failed");
                }
            },
        }
    }
}

async fn serve_connection(
    session: Arc<Session>,
    mut stream: UnixStream,
    user: String,
) -> anyhow::Result<()> {
    let root_qid = Qid {
        path: PATH_TYPE_ROOT,
        version: 0,
        qtype: QTDIR,
    };

    // Tversion: only 9P2000 is spoken.
    let fcall = read_fcall(&mut stream).await?;
    let Fcall::Tversion {
        tag,
        msize,
        version,
    } = fcall
    else {
        anyhow::bail!("expected Tversion, got {fcall:?}");
    };
    if version != VERSION_9P2000 {
        anyhow::bail!("unsupported 9p version {version}");
    }
    write_fcall(
        &mut stream,
        &Fcall::Rversion {
            tag,
            msize,
            version,
        },
    )
    .await?;

    // Tauth: a no-op handshake that hands out the root qid.
    let fcall = read_fcall(&mut stream).await?;
    let Fcall::Tauth { tag, afid, .. } = fcall else {
        anyhow::bail!("expected Tauth, got {fcall:?}");
    };
    let mut assigned: HashMap<u32, Qid> = HashMap::new();
    let mut opened: HashSet<u32> = HashSet::new();
    assigned.insert(afid, root_qid);
    write_fcall(&mut stream, &Fcall::Rauth { tag, aqid: root_qid }).await?;

    loop {
        let fcall = match read_fcall(&mut stream).await {
            Ok(fcall) => fcall,
            Err(_) => return Ok(()),
        };
        let tag = fcall.tag();
        let response = handle_fcall(&session, &user, &mut assigned, &mut opened, fcall).await;
        let response = response.unwrap_or_else(|ename| Fcall::Rerror { tag, ename });
        write_fcall(&mut stream, &response).await?;
    }
}

async fn handle_fcall(
    session: &Arc<Session>,
    user: &str,
    assigned: &mut HashMap<u32, Qid>,
    opened: &mut HashSet<u32>,
    fcall: Fcall,
) -> Result<Fcall, String> {
    match fcall {
        Fcall::Tattach { tag, fid, afid, .. } => {
            let qid = *assigned
                .get(&afid)
                .ok_or_else(|| format!("afid {afid} is not assigned"))?;
            if assigned.contains_key(&fid) {
                return Err(format!("fid {fid} has already been used"));
            }
            assigned.insert(fid, qid);
            Ok(Fcall::Rattach { tag, qid })
        }
        Fcall::Tclunk { tag, fid } => {
            assigned.remove(&fid);
            opened.remove(&fid);
            Ok(Fcall::Rclunk { tag })
        }
        Fcall::Topen { tag, fid, mode } => {
            let qid = *assigned
                .get(&fid)
                .ok_or_else(|| format!("fid {fid} is not assigned"))?;
            let info = entry_info(qid.path).ok_or("unknown entry")?;
            let mode = mode & !(OTRUNC | OCEXEC);
            if mode == OEXEC || mode & ORCLOSE != 0 {
                return Err("invalid permission".to_string());
            }
            let wanted = match mode {
                OREAD => 0o400,
                OWRITE => 0o200,
                ORDWR => 0o600,
                _ => 0,
            };
            if wanted == 0 || info.perm & !(DMDIR | DMAPPEND) & wanted != wanted {
                return Err("invalid permission".to_string());
            }
            opened.insert(fid);
            Ok(Fcall::Ropen {
                tag,
                qid,
                iounit: 0,
            })
        }
        Fcall::Tread {
            tag,
            fid,
            offset,
            count,
        } => {
            let qid = *assigned
                .get(&fid)
                .ok_or_else(|| format!("fid {fid} is not assigned"))?;
            if !opened.contains(&fid) {
                return Err(format!("fid {fid} is not opened"));
            }
            let data = read_data(session, user, qid).await?;
            Ok(Fcall::Rread {
                tag,
                data: window(&data, offset, count),
            })
        }
        Fcall::Tstat { tag, fid } => {
            let qid = *assigned
                .get(&fid)
                .ok_or_else(|| format!("fid {fid} is not assigned"))?;
            let info = entry_info(qid.path).ok_or("unknown entry")?;
            Ok(Fcall::Rstat {
                tag,
                stat: generate_stat(qid, info.name, info.qtype, info.perm, user, unix_now()),
            })
        }
        Fcall::Twalk {
            tag,
            fid,
            newfid,
            wnames,
        } => {
            let qid = *assigned
                .get(&fid)
                .ok_or_else(|| format!("fid {fid} is not assigned"))?;
            if assigned.contains_key(&newfid) {
                return Err(format!("newfid {newfid} has already been used"));
            }
            let mut result_qid = qid;
            let mut save_newfid = true;
            let mut wqids = Vec::new();
            if !wnames.is_empty() {
                wqids = walk(session, qid, &wnames)
                    .await
                    .map_err(|error| format!("error occurs in walk: {error}"))?;
                if wqids.is_empty() {
                    return Err(format!("unable to walk to: {}", wnames[0]));
                }
                if wqids.len() != wnames.len() {
                    save_newfid = false;
                } else {
                    result_qid = wqids[wqids.len() - 1];
                }
            }
            if save_newfid {
                assigned.insert(newfid, result_qid);
            }
            Ok(Fcall::Rwalk { tag, wqids })
        }
        Fcall::Twrite {
            tag, fid, data, ..
        } => {
            let qid = *assigned
                .get(&fid)
                .ok_or_else(|| format!("fid {fid} is not assigned"))?;
            if !opened.contains(&fid) {
                return Err(format!("fid {fid} is not opened"));
            }
            let count = data.len() as u32;
            let text = String::from_utf8_lossy(&data).into_owned();
            let path_type = qid.path & PATH_TYPE_MASK;
            let kind = (qid.path >> 8) & Q_MASK;
            if path_type == PATH_TYPE_ROOT {
                if kind != Q_ROOT_CONS {
                    return Err("write not supported".to_string());
                }
                session.errors_buffer(None).await.write(&text).await;
            } else {
                let label_id = (qid.path >> 32) as u32;
                match kind {
                    Q_FILE_ERRORS => {
                        session
                            .errors_buffer(Some(label_id))
                            .await
                            .write(&text)
                            .await;
                    }
                    Q_FILE_TAG => {
                        session
                            .server
                            .append(label_id, text)
                            .await
                            .map_err(|error| format!("write error: {error}"))?;
                    }
                    Q_FILE_BODY => {
                        session
                            .server
                            .append(label_id + 1, text)
                            .await
                            .map_err(|error| format!("write error: {error}"))?;
                    }
                    _ => return Err("write not supported".to_string()),
                }
            }
            session.flush();
            Ok(Fcall::Rwrite { tag, count })
        }
        other => {
            warn!(?other, "unknown fcall");
            Err(format!("unknown fcall: {}", fcall_kind(&other)))
        }
    }
}

async fn read_data(session: &Arc<Session>, user: &str, qid: Qid) -> Result<Vec<u8>, String> {
    let path_type = qid.path & PATH_TYPE_MASK;
    if qid.qtype & QTDIR != 0 {
        return Ok(read_directory(session, user, qid, path_type).await);
    }
    let kind = (qid.path >> 8) & Q_MASK;
    if path_type == PATH_TYPE_ROOT {
        match kind {
            Q_ROOT_CONS => Ok(Vec::new()),
            Q_ROOT_INDEX => Ok(read_index(session).await),
            _ => Err("read not supported".to_string()),
        }
    } else {
        let label_id = (qid.path >> 32) as u32;
        match kind {
            Q_FILE_TAG => Ok(content_bytes(session, label_id).await),
            Q_FILE_BODY => Ok(content_bytes(session, label_id + 1).await),
            _ => Err("read not supported".to_string()),
        }
    }
}

async fn content_bytes(session: &Arc<Session>, file_id: u32) -> Vec<u8> {
    match session.server.content(file_id).await {
        Some(update) => delta_to_string(&update.delta, true).into_bytes(),
        None => Vec::new(),
    }
}

async fn read_directory(
    session: &Arc<Session>,
    user: &str,
    qid: Qid,
    path_type: u64,
) -> Vec<u8> {
    let now = unix_now();
    let mut data = Vec::new();
    for (entry_path, info) in ENTRIES {
        if entry_path & PATH_TYPE_MASK == path_type {
            let entry_qid = Qid {
                path: (qid.path >> 32 << 32) | entry_path,
                version: qid.version,
                qtype: info.qtype,
            };
            data.extend(generate_stat(
                entry_qid, info.name, info.qtype, info.perm, user, now,
            ));
        }
    }
    if path_type == PATH_TYPE_ROOT {
        // Every open window appears as a directory named by its label id.
        let mut labels: Vec<_> = session
            .server
            .all_contents()
            .await
            .into_iter()
            .filter(|update| update.id % 2 == 1)
            .collect();
        labels.sort_by_key(|update| update.id);
        let window_info = entry_info(PATH_TYPE_FILE | (Q_DIR << 8)).expect("window dir entry");
        for label in labels {
            let window_qid = Qid {
                path: PATH_TYPE_FILE | (Q_DIR << 8) | ((label.id as u64) << 32),
                version: label.version,
                qtype: window_info.qtype,
            };
            data.extend(generate_stat(
                window_qid,
                &label.id.to_string(),
                window_info.qtype,
                window_info.perm,
                user,
                now,
            ));
        }
    }
    data
}

/// One summary line per window: ids, lengths, directory and dirty flags,
/// and the label's first line.
async fn read_index(session: &Arc<Session>) -> Vec<u8> {
    let mut files: Vec<_> = session
        .server
        .all_contents()
        .await
        .into_iter()
        .filter(|update| update.id != 0)
        .collect();
    files.sort_by_key(|update| update.id);

    let mut output = String::new();
    let mut index = 0;
    while index + 1 < files.len() {
        if files[index + 1].id != files[index].id + 1 {
            index += 1;
            continue;
        }
        let label = &files[index];
        let content = &files[index + 1];
        let label_text = delta_to_string(&label.delta, true);
        let is_directory = DIRECTORY_LABEL_RE.is_match(&label_text) as u32;
        let changed = DIRTY_LABEL_RE.is_match(&label_text) as u32;
        let first_line = label_text.split('\n').next().unwrap_or_default();
        output.push_str(&format!(
            "{:16} {:16} {:16} {:16} {:16} {}\n",
            label.id,
            label.delta.length(),
            content.delta.length(),
            is_directory,
            changed,
            first_line,
        ));
        index += 2;
    }
    output.into_bytes()
}

async fn walk(
    session: &Arc<Session>,
    start: Qid,
    wnames: &[String],
) -> anyhow::Result<Vec<Qid>> {
    let mut results = Vec::new();
    let mut current = start;
    for wname in wnames {
        let mut full_qpath: Option<u64> = None;
        if wname == ".." {
            let mut parent = PATH_TYPE_ROOT;
            if current.path & PATH_TYPE_MASK == PATH_TYPE_FILE
                && (current.path >> 8) & Q_MASK != Q_DIR
            {
                parent = current.path & !(Q_MASK << 8) | (Q_DIR << 8);
            }
            full_qpath = Some(parent);
        } else if wname == "." {
            full_qpath = Some(current.path);
        } else if current.path == PATH_TYPE_ROOT | (Q_DIR << 8) {
            if let Ok(label_id) = wname.parse::<u32>() {
                full_qpath = Some(PATH_TYPE_FILE | (Q_DIR << 8) | ((label_id as u64) << 32));
            } else if wname == "new" {
                // Walking into `new` creates a window on the spot.
                let content_id = session.create_dummy_file().await?;
                session.flush();
                let label_id = content_id - 1;
                full_qpath = Some(PATH_TYPE_FILE | (Q_DIR << 8) | ((label_id as u64) << 32));
            }
        }

        let mut qid: Option<Qid> = None;
        if let Some(path) = full_qpath {
            if path & PATH_TYPE_MASK == PATH_TYPE_FILE {
                let label_id = (path >> 32) as u32;
                // Window directories exist only for live, odd label ids.
                if label_id % 2 == 1 {
                    if let Some(update) = session.server.content(label_id).await {
                        if let Some(info) = entry_info(path) {
                            qid = Some(Qid {
                                path,
                                version: update.version,
                                qtype: info.qtype,
                            });
                        }
                    }
                }
            } else if let Some(info) = entry_info(path) {
                qid = Some(Qid {
                    path,
                    version: 0,
                    qtype: info.qtype,
                });
            }
        }
        if qid.is_none() {
            for (entry_path, info) in ENTRIES {
                if current.path & PATH_TYPE_MASK == entry_path & PATH_TYPE_MASK
                    && (current.path >> 8) & Q_MASK == Q_DIR
                    && wname == info.name
                {
                    qid = Some(Qid {
                        path: entry_path | (current.path >> 32 << 32),
                        version: 0,
                        qtype: info.qtype,
                    });
                    break;
                }
            }
        }
        let Some(qid) = qid else {
            return Ok(results);
        };
        results.push(qid);
        current = qid;
    }
    Ok(results)
}

fn window(data: &[u8], offset: u64, count: u32) -> Vec<u8> {
    if offset >= data.len() as u64 {
        return Vec::new();
    }
    let start = offset as usize;
    let end = (offset + count as u64).min(data.len() as u64) as usize;
    data[start..end].to_vec()
}

fn generate_stat(qid: Qid, name: &str, qtype: u8, perm: u32, user: &str, now: u32) -> Vec<u8> {
    let name = if name == "/" { "." } else { name };
    let dir = Dir {
        dtype: qtype as u16,
        dev: 0,
        qid,
        mode: perm,
        atime: now,
        mtime: now,
        // acme reports zero length for synthetic files; clients re-read.
        length: 0,
        name: name.to_string(),
        uid: user.to_string(),
        gid: user.to_string(),
        muid: user.to_string(),
    };
    dir.encode()
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as u32)
        .unwrap_or(0)
}

fn fcall_kind(fcall: &Fcall) -> String {
    match fcall {
        Fcall::Unknown { message_type, .. } => message_type.to_string(),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_table_resolves_both_path_types() {
        assert_eq!(entry_info(PATH_TYPE_ROOT | (Q_ROOT_INDEX << 8)).unwrap().name, "index");
        assert_eq!(entry_info(PATH_TYPE_FILE | (Q_FILE_TAG << 8)).unwrap().name, "tag");
        // High label-id bits do not change the entry lookup.
        let qpath = PATH_TYPE_FILE | (Q_FILE_BODY << 8) | (7u64 << 32);
        assert_eq!(entry_info(qpath).unwrap().name, "body");
        assert!(entry_info(0xFF00).is_none());
    }

    #[test]
    fn index_label_patterns_classify_labels() {
        assert!(DIRECTORY_LABEL_RE.is_match("/tmp/ | New Del Put"));
        assert!(!DIRECTORY_LABEL_RE.is_match("/tmp/file | New Del Put"));
        assert!(DIRTY_LABEL_RE.is_match("/tmp/file |* New Del Put"));
        assert!(DIRTY_LABEL_RE.is_match("|* New Del Put"));
        assert!(!DIRTY_LABEL_RE.is_match("/tmp/file | New Del Put"));
    }

    #[test]
    fn window_slices_by_offset_and_count() {
        let data = b"hello world".to_vec();
        assert_eq!(window(&data, 0, 5), b"hello");
        assert_eq!(window(&data, 6, 100), b"world");
        assert_eq!(window(&data, 50, 10), b"");
    }

    #[test]
    fn permission_mask_allows_documented_modes() {
        // tag/body are 0600 append files: both read and write pass.
        let info = entry_info(PATH_TYPE_FILE | (Q_FILE_TAG << 8)).unwrap();
        for wanted in [0o400u32, 0o200, 0o600] {
            assert_eq!(info.perm & !(DMDIR | DMAPPEND) & wanted, wanted);
        }
        // errors is write-only.
        let errors = entry_info(PATH_TYPE_FILE | (Q_FILE_ERRORS << 8)).unwrap();
        assert_eq!(errors.perm & !(DMDIR | DMAPPEND) & 0o200, 0o200);
        assert_ne!(errors.perm & !(DMDIR | DMAPPEND) & 0o400, 0o400);
    }
}
