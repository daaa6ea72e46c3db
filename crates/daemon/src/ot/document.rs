use paguridae_delta::Delta;
use uuid::Uuid;

use super::{ClientChange, OtError, ServerUpdate};

#[derive(Debug, Clone)]
struct HistorySlot {
    // The revert slots serve two purposes: they power undo/redo, and they
    // let update_since reconstruct old versions for slow clients.
    revert: Delta,
    client_id: Option<Uuid>,
}

/// One document under OT control: current content, a monotonic version,
/// and an invertible history of every accepted change.
#[derive(Debug, Clone)]
pub struct Document {
    id: u32,
    content: Delta,
    version: u32,
    history: Vec<HistorySlot>,
    undos: u32,
    redos: u32,
}

impl Document {
    pub fn new(id: u32, content: Delta) -> Self {
        Self {
            id,
            content,
            version: 1,
            history: Vec::new(),
            undos: 0,
            redos: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Full content as an update against base 0.
    pub fn content_update(&self) -> ServerUpdate {
        ServerUpdate {
            id: self.id,
            delta: self.content.clone(),
            base: 0,
            version: self.version,
            last_committed_client_version: None,
        }
    }

    /// Accept a change, transforming it over any history the submitter has
    /// not seen. On success the change is committed, history grows by its
    /// revert, and any undo/redo session ends.
    pub fn submit(
        &mut self,
        client_id: Option<Uuid>,
        mut change: ClientChange,
    ) -> Result<ServerUpdate, OtError> {
        if change.id != self.id {
            return Err(OtError::FileIdMismatch {
                expected: self.id,
                actual: change.id,
            });
        }
        if change.base > self.version {
            return Err(OtError::FutureBase {
                base: change.base,
                version: self.version,
            });
        }
        if change.base < self.version {
            // The net delta applied by others since the submitter's base;
            // existing history wins position ties.
            let operation = self.delta_since(change.base)?;
            change.delta = operation.transform(&change.delta, true);
            change.base = self.version;
        }
        let revert = change.delta.invert(&self.content);
        self.content = self.content.compose(&change.delta);
        self.version += 1;
        self.history.push(HistorySlot {
            revert,
            client_id,
        });
        self.undos = 0;
        self.redos = 0;
        Ok(ServerUpdate {
            id: self.id,
            delta: change.delta,
            base: change.base,
            version: self.version,
            last_committed_client_version: None,
        })
    }

    /// The catch-up delta for a client that has acknowledged `base`.
    ///
    /// The client has optimistically applied its own submissions past
    /// `base`, so the result first undoes those, then replays the full
    /// authoritative stream. When `base` is 0 or older than retained
    /// history, the full content is returned against base 0.
    pub fn update_since(&self, client_id: Option<Uuid>, base: u32) -> ServerUpdate {
        if base == 0 {
            return self.content_update();
        }
        let Ok((operations, base_content)) = self.deltas_since(base) else {
            return self.content_update();
        };
        let mut all_changes = Delta::new();
        let mut client_changes = Delta::new();
        for (delta, origin) in &operations {
            if same_client(client_id, *origin) {
                let transformed = all_changes.transform(delta, false);
                let transformed = client_changes.transform(&transformed, true);
                client_changes = client_changes.compose(&transformed);
            }
            all_changes = all_changes.compose(delta);
        }
        let client_reverts = client_changes.invert(&base_content);
        ServerUpdate {
            id: self.id,
            delta: client_reverts.compose(&all_changes),
            base,
            version: self.version,
            last_committed_client_version: None,
        }
    }

    pub fn undo(&mut self) -> Result<(), OtError> {
        let (mut undos, mut redos) = (self.undos, self.redos);
        // A redo streak followed by an undo restarts the undo session.
        if redos > 0 {
            undos = 0;
            redos = 0;
        }
        let skip = (redos + undos * 2) as usize;
        if skip >= self.history.len() {
            return Err(OtError::NothingToUndo);
        }
        let delta = self.history[self.history.len() - 1 - skip].revert.clone();
        self.submit(
            None,
            ClientChange {
                id: self.id,
                delta,
                base: self.version,
                client_version: 0,
            },
        )?;
        self.undos = undos + 1;
        self.redos = redos;
        Ok(())
    }

    pub fn redo(&mut self) -> Result<(), OtError> {
        if self.redos >= self.undos {
            return Err(OtError::NothingToRedo);
        }
        let redos = self.redos;
        let delta = self.history[self.history.len() - 1 - redos as usize]
            .revert
            .clone();
        self.submit(
            None,
            ClientChange {
                id: self.id,
                delta,
                base: self.version,
                client_version: 0,
            },
        )?;
        self.redos = redos + 1;
        Ok(())
    }

    /// Forward deltas (oldest first, with their origins) covering
    /// `base..version`, plus the reconstructed content at `base`.
    fn deltas_since(&self, base: u32) -> Result<(Vec<(Delta, Option<Uuid>)>, Delta), OtError> {
        let reverted = self.version as i64 - base as i64;
        if reverted < 0 || reverted > self.history.len() as i64 {
            return Err(OtError::HistoryTooOld {
                base,
                oldest: self.version - self.history.len() as u32,
            });
        }
        let reverted = reverted as usize;
        let mut content = self.content.clone();
        let mut deltas = vec![(Delta::new(), None); reverted];
        for i in 0..reverted {
            let slot = &self.history[self.history.len() - 1 - i];
            deltas[reverted - 1 - i] = (slot.revert.invert(&content), slot.client_id);
            content = content.compose(&slot.revert);
        }
        Ok((deltas, content))
    }

    /// The composite forward delta covering `base..version`.
    fn delta_since(&self, base: u32) -> Result<Delta, OtError> {
        let (deltas, _) = self.deltas_since(base)?;
        let mut current = Delta::new();
        for (delta, _) in &deltas {
            current = current.compose(delta);
        }
        Ok(current)
    }
}

fn same_client(client_id: Option<Uuid>, origin: Option<Uuid>) -> bool {
    matches!((client_id, origin), (Some(a), Some(b)) if a == b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deltautil::delta_to_string;

    fn change(id: u32, base: u32, delta: Delta) -> ClientChange {
        ClientChange {
            id,
            delta,
            base,
            client_version: 0,
        }
    }

    fn insert_at(pos: usize, text: &str) -> Delta {
        Delta::new().retain(pos, None).insert(text, None)
    }

    fn content_of(document: &Document) -> String {
        delta_to_string(&document.content_update().delta, false)
    }

    #[test]
    fn submit_increments_version_and_applies_delta() {
        let mut document = Document::new(2, Delta::new());
        let update = document
            .submit(None, change(2, 1, insert_at(0, "hi")))
            .unwrap();
        assert_eq!(update.version, 2);
        assert_eq!(update.base, 1);
        assert_eq!(content_of(&document), "hi");
    }

    #[test]
    fn submit_rejects_wrong_file_and_future_base() {
        let mut document = Document::new(2, Delta::new());
        assert!(matches!(
            document.submit(None, change(3, 1, insert_at(0, "x"))),
            Err(OtError::FileIdMismatch { .. })
        ));
        assert!(matches!(
            document.submit(None, change(2, 5, insert_at(0, "x"))),
            Err(OtError::FutureBase { .. })
        ));
        assert_eq!(document.version(), 1);
    }

    #[test]
    fn stale_submissions_transform_against_intervening_history() {
        let mut document = Document::new(2, Delta::new().insert("abc", None));
        // Another writer prepends at position 0 first.
        document.submit(None, change(2, 1, insert_at(0, "X"))).unwrap();
        // A stale change against version 1 inserts at the old position 3.
        let update = document
            .submit(None, change(2, 1, insert_at(3, "Y")))
            .unwrap();
        assert_eq!(update.base, 2);
        assert_eq!(update.version, 3);
        assert_eq!(content_of(&document), "XabcY");
    }

    #[test]
    fn concurrent_changes_converge_regardless_of_arrival_order() {
        let base = Delta::new().insert("abc", None);
        let first = insert_at(0, "X");
        let second = insert_at(3, "Y");

        let mut order_a = Document::new(2, base.clone());
        order_a.submit(None, change(2, 1, first.clone())).unwrap();
        order_a.submit(None, change(2, 1, second.clone())).unwrap();

        let mut order_b = Document::new(2, base);
        order_b.submit(None, change(2, 1, second)).unwrap();
        order_b.submit(None, change(2, 1, first)).unwrap();

        assert_eq!(content_of(&order_a), content_of(&order_b));
    }

    #[test]
    fn update_since_replays_other_clients_changes() {
        let observer = Uuid::new_v4();
        let writer = Uuid::new_v4();
        let mut document = Document::new(2, Delta::new().insert("base", None));
        document
            .submit(Some(writer), change(2, 1, insert_at(4, "+w1")))
            .unwrap();
        document
            .submit(Some(writer), change(2, 2, insert_at(7, "+w2")))
            .unwrap();

        let update = document.update_since(Some(observer), 1);
        assert_eq!(update.base, 1);
        assert_eq!(update.version, 3);
        let caught_up = Delta::new().insert("base", None).compose(&update.delta);
        assert_eq!(delta_to_string(&caught_up, false), "base+w1+w2");
    }

    #[test]
    fn update_since_undoes_own_optimistic_changes_first() {
        let client = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut document = Document::new(2, Delta::new().insert("abc", None));
        // The client's own change, already applied locally on its side.
        document
            .submit(Some(client), change(2, 1, insert_at(0, "M")))
            .unwrap();
        // Someone else's concurrent change.
        document
            .submit(Some(other), change(2, 2, insert_at(4, "O")))
            .unwrap();

        // The client's local view: base content plus its own change.
        let local = Delta::new().insert("Mabc", None);
        let update = document.update_since(Some(client), 1);
        let converged = local.compose(&update.delta);
        assert_eq!(
            delta_to_string(&converged, false),
            content_of(&document)
        );
    }

    #[test]
    fn update_since_falls_back_to_full_content_for_old_bases() {
        let mut document = Document::new(2, Delta::new());
        document.submit(None, change(2, 1, insert_at(0, "x"))).unwrap();
        let update = document.update_since(None, 0);
        assert_eq!(update.base, 0);
        assert_eq!(update.version, 2);
        assert_eq!(delta_to_string(&update.delta, false), "x");
    }

    #[test]
    fn undo_redo_walk_the_history() {
        let mut document = Document::new(2, Delta::new());
        document.submit(None, change(2, 1, insert_at(0, "a"))).unwrap();
        document.submit(None, change(2, 2, insert_at(1, "b"))).unwrap();
        document.submit(None, change(2, 3, insert_at(2, "c"))).unwrap();
        assert_eq!(content_of(&document), "abc");

        document.undo().unwrap();
        assert_eq!(content_of(&document), "ab");
        document.undo().unwrap();
        assert_eq!(content_of(&document), "a");
        document.redo().unwrap();
        assert_eq!(content_of(&document), "ab");

        // A fresh submission ends the undo/redo session.
        document.submit(None, change(2, 6, insert_at(2, "Z"))).unwrap();
        assert_eq!(content_of(&document), "abZ");
        assert!(matches!(document.redo(), Err(OtError::NothingToRedo)));
    }

    #[test]
    fn undo_fails_when_history_is_exhausted() {
        let mut document = Document::new(2, Delta::new());
        assert!(matches!(document.undo(), Err(OtError::NothingToUndo)));
        document.submit(None, change(2, 1, insert_at(0, "a"))).unwrap();
        document.undo().unwrap();
        assert!(matches!(document.undo(), Err(OtError::NothingToUndo)));
    }

    #[test]
    fn redo_without_undo_fails() {
        let mut document = Document::new(2, Delta::new());
        document.submit(None, change(2, 1, insert_at(0, "a"))).unwrap();
        assert!(matches!(document.redo(), Err(OtError::NothingToRedo)));
    }

    #[test]
    fn undo_after_redo_restarts_the_session() {
        let mut document = Document::new(2, Delta::new());
        document.submit(None, change(2, 1, insert_at(0, "a"))).unwrap();
        document.submit(None, change(2, 2, insert_at(1, "b"))).unwrap();
        document.undo().unwrap();
        document.redo().unwrap();
        assert_eq!(content_of(&document), "ab");
        // The undo now targets the redo itself.
        document.undo().unwrap();
        assert_eq!(content_of(&document), "a");
    }
}
