// End-to-end scenarios at the session level: window lifecycle, metafile
// bookkeeping, search, save, and pipe-to-selection.

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use paguridae_daemon::config::Config;
use paguridae_daemon::deltautil::delta_to_string;
use paguridae_daemon::ot::ClientChange;
use paguridae_daemon::protocol::{Action, Range, Selection};
use paguridae_daemon::session::{parse_full_path, Session, META_FILE_ID};
use paguridae_delta::Delta;

async fn test_session() -> Arc<Session> {
    Session::create(Arc::new(Config::default()))
        .await
        .expect("session should start")
}

async fn content_text(session: &Arc<Session>, file_id: u32) -> String {
    match session.server.content(file_id).await {
        Some(update) => delta_to_string(&update.delta, false),
        None => String::new(),
    }
}

/// Poll until the metafile text settles at `expected`; the refresher runs
/// asynchronously behind create/close events.
async fn wait_for_metafile(session: &Arc<Session>, expected: &str) {
    for _ in 0..200 {
        if content_text(session, META_FILE_ID).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "timed out waiting for metafile {expected:?}, got {:?}",
        content_text(session, META_FILE_ID).await
    );
}

/// Poll until a window label starting with `prefix` exists; returns its id.
async fn wait_for_window_label(session: &Arc<Session>, prefix: &str) -> u32 {
    for _ in 0..200 {
        let all = session.server.all_contents().await;
        let found = all.iter().find(|update| {
            update.id % 2 == 1 && delta_to_string(&update.delta, false).starts_with(prefix)
        });
        if let Some(label) = found {
            return label.id;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for a window labeled {prefix:?}");
}

fn action(id: u32, kind: &str, command: &str) -> Action {
    Action {
        id,
        kind: kind.to_string(),
        index: 0,
        command: command.to_string(),
        selection: Selection::default(),
    }
}

#[tokio::test]
async fn new_session_has_metafile_and_two_windows() {
    let session = test_session().await;
    // Windows (1,2) and (3,4) exist; the metafile lists both labels.
    wait_for_metafile(&session, "1 0 0\n3 0 0\n").await;
    let metafile = session.server.content(META_FILE_ID).await.unwrap();
    assert!(
        metafile.version <= 3,
        "empty refresh diffs must not bump the metafile version"
    );
    assert_eq!(content_text(&session, 1).await, " | New Del Put");
    // The directory listing window is labeled with the working directory.
    let label = content_text(&session, 3).await;
    assert!(label.ends_with("/ | New Del Put"), "label was {label:?}");
    assert!(!content_text(&session, 4).await.is_empty());
    session.stop().await;
}

#[tokio::test]
async fn client_change_marks_window_dirty() {
    let session = test_session().await;
    let (client_id, _events, _flush) = session.connect(None).await.unwrap();

    session
        .apply_changes(
            client_id,
            vec![ClientChange {
                id: 2,
                delta: Delta::new().insert("hi", None),
                base: 1,
                client_version: 1,
            }],
        )
        .await
        .unwrap();

    assert_eq!(content_text(&session, 2).await, "hi");
    assert_eq!(content_text(&session, 1).await, " |* New Del Put");
    session.stop().await;
}

#[tokio::test]
async fn put_saves_and_clears_dirty_marker() {
    let session = test_session().await;
    let (client_id, _events, _flush) = session.connect(None).await.unwrap();

    let directory = tempfile::tempdir().unwrap();
    let file_path = directory.path().join("note.txt");
    std::fs::write(&file_path, "before\n").unwrap();

    let info = parse_full_path(&file_path.to_string_lossy());
    let (selection, created) = session.find_or_open_file(info).await.unwrap();
    let selection = selection.unwrap();
    assert!(created);
    let content_id = selection.id;
    assert_eq!(content_text(&session, content_id).await, "before\n");

    // Replace the content and save.
    session
        .apply_changes(
            client_id,
            vec![ClientChange {
                id: content_id,
                delta: Delta::new().delete(7).insert("after\n", None),
                base: 1,
                client_version: 1,
            }],
        )
        .await
        .unwrap();
    let label_id = content_id - 1;
    let dirty = content_text(&session, label_id).await;
    assert!(dirty.contains("|*"), "label was {dirty:?}");

    session
        .execute(client_id, &action(content_id, "execute", "Put"))
        .await
        .unwrap();
    assert_eq!(std::fs::read_to_string(&file_path).unwrap(), "after\n");
    let clean = content_text(&session, label_id).await;
    assert!(!clean.contains("|*"), "label was {clean:?}");
    session.stop().await;
}

#[tokio::test]
async fn search_falls_back_to_buffer_text() {
    let session = test_session().await;
    let (client_id, _events, _flush) = session.connect(None).await.unwrap();

    session
        .apply_changes(
            client_id,
            vec![ClientChange {
                id: 2,
                delta: Delta::new().insert("foo bar foo", None),
                base: 1,
                client_version: 1,
            }],
        )
        .await
        .unwrap();

    // The scan starts past the first occurrence at action.index.
    let (selection, created) = session
        .execute(client_id, &action(2, "search", "foo"))
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(
        selection.unwrap(),
        Selection {
            id: 2,
            range: Range { index: 8, length: 3 }
        }
    );

    // Starting past the last occurrence finds nothing; no wraparound.
    let mut late = action(2, "search", "foo");
    late.index = 9;
    let (selection, _) = session.execute(client_id, &late).await.unwrap();
    assert!(selection.is_none());
    session.stop().await;
}

#[tokio::test]
async fn search_opens_directories_and_files() {
    let session = test_session().await;
    let (client_id, _events, _flush) = session.connect(None).await.unwrap();

    let directory = tempfile::tempdir().unwrap();
    std::fs::write(directory.path().join("inner.txt"), "inner content\n").unwrap();
    let directory_path = directory.path().to_string_lossy().into_owned();

    // An absolute directory path opens a listing window.
    let (selection, _) = session
        .execute(client_id, &action(2, "search", &directory_path))
        .await
        .unwrap();
    assert!(selection.is_none());
    let listing_label =
        wait_for_window_label(&session, &format!("{directory_path}/ ")).await;

    // A file path relative to the listing window opens the file.
    let (selection, created) = session
        .execute(
            client_id,
            &action(listing_label + 1, "search", "inner.txt"),
        )
        .await
        .unwrap();
    assert!(created);
    let opened = selection.unwrap();
    assert_eq!(content_text(&session, opened.id).await, "inner content\n");
    session.stop().await;
}

#[tokio::test]
async fn pipe_command_replaces_selection_with_stdout() {
    let session = test_session().await;
    let (client_id, _events, _flush) = session.connect(None).await.unwrap();

    session
        .apply_changes(
            client_id,
            vec![ClientChange {
                id: 2,
                delta: Delta::new().insert("hello\n", None),
                base: 1,
                client_version: 1,
            }],
        )
        .await
        .unwrap();

    let mut pipe = action(2, "execute", "|tr a-z A-Z");
    pipe.selection = Selection {
        id: 2,
        range: Range { index: 0, length: 6 },
    };
    let (selection, created) = session.execute(client_id, &pipe).await.unwrap();
    assert!(!created);
    assert_eq!(
        selection.unwrap(),
        Selection {
            id: 2,
            range: Range { index: 0, length: 6 }
        }
    );
    assert_eq!(content_text(&session, 2).await, "HELLO\n");
    session.stop().await;
}

#[tokio::test]
async fn failed_command_lands_in_errors_window() {
    let session = test_session().await;
    let (client_id, _events, _flush) = session.connect(None).await.unwrap();

    let mut failing = action(2, "execute", "|ls --definitely-not-a-flag");
    failing.selection = Selection {
        id: 2,
        range: Range { index: 0, length: 0 },
    };
    let result = session.execute(client_id, &failing).await;
    assert!(result.is_err());

    wait_for_window_label(&session, "+Errors").await;
    session.stop().await;
}

#[tokio::test]
async fn new_and_del_commands_update_the_metafile() {
    let session = test_session().await;
    let (client_id, _events, _flush) = session.connect(None).await.unwrap();
    wait_for_metafile(&session, "1 0 0\n3 0 0\n").await;

    session
        .execute(client_id, &action(2, "execute", "New"))
        .await
        .unwrap();
    wait_for_metafile(&session, "1 0 0\n3 0 0\n5 0 0\n").await;

    session
        .execute(client_id, &action(6, "execute", "Del"))
        .await
        .unwrap();
    wait_for_metafile(&session, "1 0 0\n3 0 0\n").await;
    session.stop().await;
}

#[tokio::test]
async fn metafile_refresh_preserves_client_edited_lines() {
    let session = test_session().await;
    let (client_id, _events, _flush) = session.connect(None).await.unwrap();
    wait_for_metafile(&session, "1 0 0\n3 0 0\n").await;

    // A client annotates the metafile line for window 1 (layout sizes).
    let current = session.server.content(META_FILE_ID).await.unwrap();
    session
        .server
        .submit(
            None,
            vec![ClientChange {
                id: META_FILE_ID,
                delta: Delta::new().retain(2, None).delete(3).insert("40 25", None),
                base: current.version,
                client_version: 0,
            }],
        )
        .await;
    assert_eq!(
        content_text(&session, META_FILE_ID).await,
        "1 40 25\n3 0 0\n"
    );

    session
        .execute(client_id, &action(2, "execute", "New"))
        .await
        .unwrap();
    wait_for_metafile(&session, "1 40 25\n3 0 0\n5 0 0\n").await;
    session.stop().await;
}

#[tokio::test]
async fn undo_and_redo_commands_drive_document_history() {
    let session = test_session().await;
    let (client_id, _events, _flush) = session.connect(None).await.unwrap();

    for (client_version, (base, text)) in [(1, "a"), (2, "b"), (3, "c")].into_iter().enumerate() {
        session
            .apply_changes(
                client_id,
                vec![ClientChange {
                    id: 2,
                    delta: Delta::new()
                        .retain(client_version, None)
                        .insert(text, None),
                    base,
                    client_version: client_version as u32 + 1,
                }],
            )
            .await
            .unwrap();
    }
    assert_eq!(content_text(&session, 2).await, "abc");

    session
        .execute(client_id, &action(2, "execute", "Undo"))
        .await
        .unwrap();
    assert_eq!(content_text(&session, 2).await, "ab");
    session
        .execute(client_id, &action(2, "execute", "Redo"))
        .await
        .unwrap();
    assert_eq!(content_text(&session, 2).await, "abc");
    session.stop().await;
}

#[tokio::test]
async fn partial_load_windows_page_through_large_files() {
    let config = Arc::new(Config {
        page_size: 64,
        scroll_size: 32,
        ..Config::default()
    });
    let session = Session::create(config).await.unwrap();
    let (client_id, _events, _flush) = session.connect(None).await.unwrap();

    let directory = tempfile::tempdir().unwrap();
    let file_path = directory.path().join("big.txt");
    let mut file = std::fs::File::create(&file_path).unwrap();
    for line in 0..32 {
        writeln!(file, "line {line:03}").unwrap();
    }
    drop(file);
    let size = std::fs::metadata(&file_path).unwrap().len();
    assert!(size > 64);

    let info = parse_full_path(&file_path.to_string_lossy());
    let (selection, created) = session.find_or_open_file(info).await.unwrap();
    assert!(created);
    let content_id = selection.unwrap().id;
    let label = content_text(&session, content_id - 1).await;
    let window_info = parse_full_path(&label);
    assert!(window_info.partial_load(), "label was {label:?}");
    assert_eq!(window_info.start, Some(0));
    assert_eq!(window_info.length, Some(64));
    assert_eq!(window_info.file_length, Some(size as i64));
    assert_eq!(content_text(&session, content_id).await.len(), 64);

    // Next advances the window by scroll_size and opens a new view.
    let (selection, created) = session
        .execute(client_id, &action(content_id, "execute", "Next"))
        .await
        .unwrap();
    assert!(created);
    let next_id = selection.unwrap().id;
    assert_ne!(next_id, content_id);
    let next_label = content_text(&session, next_id - 1).await;
    let next_info = parse_full_path(&next_label);
    assert_eq!(next_info.start, Some(32));
    session.stop().await;
}

#[tokio::test]
async fn reconnecting_client_keeps_its_identity() {
    let session = test_session().await;
    let (client_id, _events, _flush) = session.connect(None).await.unwrap();
    session.disconnect(client_id).await;
    assert_eq!(session.connections(), 0);

    let (reclaimed, _events, _flush) = session.connect(Some(client_id)).await.unwrap();
    assert_eq!(reclaimed, client_id);

    let stranger = Uuid::new_v4();
    let (fresh, _events2, _flush2) = session.connect(Some(stranger)).await.unwrap();
    assert_ne!(fresh, stranger);
    session.stop().await;
}
