//! The multi-file OT server: a single-threaded command loop owning every
//! document and client record. All public access goes through
//! [`ServerHandle`], which enqueues tagged commands and awaits reply
//! channels, so no mutable state is ever reachable from other tasks.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use paguridae_delta::Delta;

use super::{ClientChange, Document, Event, OtError, ServerUpdate};

const GC_INTERVAL: Duration = Duration::from_secs(600);
const DISCONNECT_RETENTION: Duration = Duration::from_secs(3600);

pub type UpdateFn = Box<dyn FnOnce(Delta) -> anyhow::Result<Delta> + Send>;
pub type UpdateAllFn = Box<dyn FnOnce(&[ServerUpdate]) -> anyhow::Result<Vec<ClientChange>> + Send>;

enum Command {
    Connect {
        client_id: Option<Uuid>,
        events: mpsc::UnboundedSender<Event>,
    },
    Disconnect {
        client_id: Uuid,
    },
    CreateFiles {
        contents: Vec<Delta>,
        reply: oneshot::Sender<Result<Vec<u32>, OtError>>,
    },
    CloseFiles {
        file_ids: Vec<u32>,
    },
    Acks {
        client_id: Uuid,
        acks: HashMap<u32, u32>,
    },
    Content {
        file_id: u32,
        reply: oneshot::Sender<Option<ServerUpdate>>,
    },
    AllContents {
        reply: oneshot::Sender<Vec<ServerUpdate>>,
    },
    Submit {
        client_id: Option<Uuid>,
        changes: Vec<ClientChange>,
    },
    Undo {
        file_id: u32,
        reply: oneshot::Sender<Result<(), OtError>>,
    },
    Redo {
        file_id: u32,
        reply: oneshot::Sender<Result<(), OtError>>,
    },
    Update {
        file_id: u32,
        func: UpdateFn,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    UpdateAll {
        func: UpdateAllFn,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Broadcast,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front to the command loop.
#[derive(Clone)]
pub struct ServerHandle {
    commands: mpsc::Sender<Command>,
}

/// Start the server loop. The loop runs until [`ServerHandle::shutdown`]
/// is called or every handle is dropped.
pub fn spawn() -> (ServerHandle, JoinHandle<()>) {
    let (commands, receiver) = mpsc::channel(64);
    let task = tokio::spawn(run_loop(receiver));
    (ServerHandle { commands }, task)
}

impl ServerHandle {
    /// Register a client. The first event on the returned stream carries
    /// the connected client id; the second carries every current document.
    /// Supplying a previously seen id reclaims its disconnected record.
    pub async fn connect(&self, client_id: Option<Uuid>) -> mpsc::UnboundedReceiver<Event> {
        let (events, receiver) = mpsc::unbounded_channel();
        let _ = self.commands.send(Command::Connect { client_id, events }).await;
        receiver
    }

    pub async fn disconnect(&self, client_id: Uuid) {
        let _ = self.commands.send(Command::Disconnect { client_id }).await;
    }

    pub async fn create_files(&self, contents: Vec<Delta>) -> Result<Vec<u32>, OtError> {
        let (reply, response) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::CreateFiles { contents, reply })
            .await;
        response.await.unwrap_or(Err(OtError::ServerStopped))
    }

    pub async fn close_files(&self, file_ids: Vec<u32>) {
        let _ = self.commands.send(Command::CloseFiles { file_ids }).await;
    }

    pub async fn acks(&self, client_id: Uuid, acks: HashMap<u32, u32>) {
        let _ = self.commands.send(Command::Acks { client_id, acks }).await;
    }

    pub async fn content(&self, file_id: u32) -> Option<ServerUpdate> {
        let (reply, response) = oneshot::channel();
        let _ = self.commands.send(Command::Content { file_id, reply }).await;
        response.await.ok().flatten()
    }

    pub async fn all_contents(&self) -> Vec<ServerUpdate> {
        let (reply, response) = oneshot::channel();
        let _ = self.commands.send(Command::AllContents { reply }).await;
        response.await.unwrap_or_default()
    }

    pub async fn submit(&self, client_id: Option<Uuid>, changes: Vec<ClientChange>) {
        let _ = self
            .commands
            .send(Command::Submit { client_id, changes })
            .await;
    }

    pub async fn undo(&self, file_id: u32) -> Result<(), OtError> {
        let (reply, response) = oneshot::channel();
        let _ = self.commands.send(Command::Undo { file_id, reply }).await;
        response.await.unwrap_or(Err(OtError::ServerStopped))
    }

    pub async fn redo(&self, file_id: u32) -> Result<(), OtError> {
        let (reply, response) = oneshot::channel();
        let _ = self.commands.send(Command::Redo { file_id, reply }).await;
        response.await.unwrap_or(Err(OtError::ServerStopped))
    }

    /// Run `func` against the document's current content inside the loop
    /// and submit the returned delta as a system-originated change.
    pub async fn update(&self, file_id: u32, func: UpdateFn) -> anyhow::Result<()> {
        let (reply, response) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::Update {
                file_id,
                func,
                reply,
            })
            .await;
        response
            .await
            .unwrap_or_else(|_| Err(OtError::ServerStopped.into()))
    }

    /// Run `func` against every document's content inside the loop and
    /// submit the returned changes atomically with respect to other
    /// commands.
    pub async fn update_all(&self, func: UpdateAllFn) -> anyhow::Result<()> {
        let (reply, response) = oneshot::channel();
        let _ = self.commands.send(Command::UpdateAll { func, reply }).await;
        response
            .await
            .unwrap_or_else(|_| Err(OtError::ServerStopped.into()))
    }

    /// Append text to the end of a document.
    pub async fn append(&self, file_id: u32, text: String) -> anyhow::Result<()> {
        self.update(
            file_id,
            Box::new(move |content| {
                Ok(Delta::new().retain(content.length(), None).insert(text, None))
            }),
        )
        .await
    }

    pub async fn broadcast(&self) {
        let _ = self.commands.send(Command::Broadcast).await;
    }

    /// Stop the loop: every event stream closes, files and clients are
    /// dropped. Resolves once the loop has fully wound down.
    pub async fn shutdown(&self) {
        let (reply, response) = oneshot::channel();
        let _ = self.commands.send(Command::Shutdown { reply }).await;
        let _ = response.await;
    }
}

struct Client {
    acks: HashMap<u32, u32>,
    last: HashMap<u32, u32>,
    events: mpsc::UnboundedSender<Event>,
}

struct DisconnectedClient {
    acks: HashMap<u32, u32>,
    last: HashMap<u32, u32>,
    disconnected_at: Instant,
}

struct Server {
    next_file_id: u32,
    files: HashMap<u32, Document>,
    clients: HashMap<Uuid, Client>,
    disconnected: HashMap<Uuid, DisconnectedClient>,
}

async fn run_loop(mut commands: mpsc::Receiver<Command>) {
    let mut server = Server {
        next_file_id: 0,
        files: HashMap::new(),
        clients: HashMap::new(),
        disconnected: HashMap::new(),
    };
    let mut gc = tokio::time::interval(GC_INTERVAL);
    gc.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = gc.tick() => server.purge_disconnected(),
            command = commands.recv() => match command {
                Some(Command::Shutdown { reply }) => {
                    let _ = reply.send(());
                    break;
                }
                Some(command) => server.handle(command),
                None => break,
            },
        }
    }
    // Dropping client records closes every event stream.
    server.clients.clear();
    server.files.clear();
}

impl Server {
    fn handle(&mut self, command: Command) {
        match command {
            Command::Connect { client_id, events } => self.connect(client_id, events),
            Command::Disconnect { client_id } => self.disconnect(client_id),
            Command::CreateFiles { contents, reply } => {
                let _ = reply.send(self.create_files(contents));
            }
            Command::CloseFiles { file_ids } => self.close_files(file_ids),
            Command::Acks { client_id, acks } => self.acks(client_id, acks),
            Command::Content { file_id, reply } => {
                let _ = reply.send(self.files.get(&file_id).map(Document::content_update));
            }
            Command::AllContents { reply } => {
                let _ = reply.send(self.all_contents());
            }
            Command::Submit { client_id, changes } => self.submit(client_id, changes),
            Command::Undo { file_id, reply } => {
                let result = match self.files.get_mut(&file_id) {
                    Some(file) => file.undo(),
                    None => Err(OtError::UnknownFile(file_id)),
                };
                if result.is_ok() {
                    self.broadcast();
                }
                let _ = reply.send(result);
            }
            Command::Redo { file_id, reply } => {
                let result = match self.files.get_mut(&file_id) {
                    Some(file) => file.redo(),
                    None => Err(OtError::UnknownFile(file_id)),
                };
                if result.is_ok() {
                    self.broadcast();
                }
                let _ = reply.send(result);
            }
            Command::Update {
                file_id,
                func,
                reply,
            } => {
                let _ = reply.send(self.update(file_id, func));
            }
            Command::UpdateAll { func, reply } => {
                let _ = reply.send(self.update_all(func));
            }
            Command::Broadcast => self.broadcast(),
            Command::Shutdown { .. } => unreachable!("shutdown handled by the loop"),
        }
    }

    fn connect(&mut self, requested: Option<Uuid>, events: mpsc::UnboundedSender<Event>) {
        let (client_id, client) = match requested
            .and_then(|id| self.disconnected.remove(&id).map(|record| (id, record)))
        {
            Some((id, record)) => (
                id,
                Client {
                    acks: record.acks,
                    last: record.last,
                    events,
                },
            ),
            None => (
                Uuid::new_v4(),
                Client {
                    acks: HashMap::new(),
                    last: HashMap::new(),
                    events,
                },
            ),
        };
        let _ = client.events.send(Event {
            connected_client_id: Some(client_id),
            ..Event::default()
        });
        let mut contents = Event::default();
        for file in self.files.values() {
            contents.updates.push(file.content_update());
        }
        let _ = client.events.send(contents);
        self.clients.insert(client_id, client);
    }

    fn disconnect(&mut self, client_id: Uuid) {
        if let Some(client) = self.clients.remove(&client_id) {
            self.disconnected.insert(
                client_id,
                DisconnectedClient {
                    acks: client.acks,
                    last: client.last,
                    disconnected_at: Instant::now(),
                },
            );
        }
    }

    fn create_files(&mut self, contents: Vec<Delta>) -> Result<Vec<u32>, OtError> {
        let first_id = self.allocate_file_ids(contents.len() as u32)?;
        let mut file_ids = Vec::with_capacity(contents.len());
        for (offset, content) in contents.into_iter().enumerate() {
            let file_id = first_id.wrapping_add(offset as u32);
            self.files.insert(file_id, Document::new(file_id, content));
            file_ids.push(file_id);
        }
        let event = Event {
            created_file_ids: file_ids.clone(),
            ..Event::default()
        };
        for client in self.clients.values() {
            let _ = client.events.send(event.clone());
        }
        Ok(file_ids)
    }

    fn close_files(&mut self, file_ids: Vec<u32>) {
        for file_id in &file_ids {
            if !self.files.contains_key(file_id) {
                warn!(file_id, "cannot close unknown file");
                return;
            }
        }
        let mut event = Event::default();
        for file_id in file_ids {
            event.closed_file_ids.push(file_id);
            self.files.remove(&file_id);
            for client in self.clients.values_mut() {
                client.acks.remove(&file_id);
                client.last.remove(&file_id);
            }
        }
        for client in self.clients.values() {
            let _ = client.events.send(event.clone());
        }
    }

    fn acks(&mut self, client_id: Uuid, acks: HashMap<u32, u32>) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            for (file_id, version) in acks {
                client.acks.insert(file_id, version);
            }
            self.broadcast();
        }
    }

    fn all_contents(&self) -> Vec<ServerUpdate> {
        self.files.values().map(Document::content_update).collect()
    }

    fn submit(&mut self, client_id: Option<Uuid>, changes: Vec<ClientChange>) {
        if let Some(id) = client_id {
            if !self.clients.contains_key(&id) {
                warn!(client_id = %id, "submit from unknown client");
                return;
            }
        }
        for change in changes {
            if let Some(id) = client_id {
                // The per-client version gate: only the strict successor of
                // the last committed client version is accepted, which
                // silently drops duplicate and out-of-order retransmissions.
                let last = self
                    .clients
                    .get(&id)
                    .map(|client| *client.last.get(&change.id).unwrap_or(&0))
                    .unwrap_or(0);
                if change.client_version != last + 1 {
                    continue;
                }
            }
            let Some(file) = self.files.get_mut(&change.id) else {
                continue;
            };
            let file_id = change.id;
            let client_version = change.client_version;
            match file.submit(client_id, change) {
                Ok(_) => {
                    if let Some(id) = client_id {
                        if let Some(client) = self.clients.get_mut(&id) {
                            client.last.insert(file_id, client_version);
                        }
                    }
                }
                Err(error) => {
                    warn!(file_id, %error, "submit failed");
                    return;
                }
            }
        }
        self.broadcast();
    }

    fn update(&mut self, file_id: u32, func: UpdateFn) -> anyhow::Result<()> {
        let Some(file) = self.files.get_mut(&file_id) else {
            return Err(OtError::UnknownFile(file_id).into());
        };
        let content = file.content_update();
        let delta = func(content.delta)?;
        file.submit(
            None,
            ClientChange {
                id: content.id,
                delta,
                base: content.version,
                client_version: 0,
            },
        )?;
        Ok(())
    }

    fn update_all(&mut self, func: UpdateAllFn) -> anyhow::Result<()> {
        let contents = self.all_contents();
        let changes = func(&contents)?;
        for change in changes {
            let Some(file) = self.files.get_mut(&change.id) else {
                continue;
            };
            file.submit(None, change)?;
        }
        Ok(())
    }

    /// Send every client the updates it has not acknowledged. A file is
    /// included when it has a real pending delta for this client, or when
    /// a committed client version needs propagating back as the server's
    /// ack.
    fn broadcast(&mut self) {
        for (client_id, client) in &self.clients {
            let mut event = Event::default();
            for (file_id, file) in &self.files {
                let ack = *client.acks.get(file_id).unwrap_or(&0);
                let mut update = file.update_since(Some(*client_id), ack);
                let last = *client.last.get(file_id).unwrap_or(&0);
                if update.base != update.version || last > 0 {
                    update.last_committed_client_version = Some(last);
                    event.updates.push(update);
                }
            }
            if !event.updates.is_empty() {
                let _ = client.events.send(event);
            }
        }
    }

    /// Scan forward from `next_file_id` for `num` consecutive unoccupied
    /// ids, wrapping around the id space.
    fn allocate_file_ids(&mut self, num: u32) -> Result<u32, OtError> {
        let mut current = self.next_file_id;
        while current != self.next_file_id.wrapping_sub(1) {
            let available = (0..num).all(|offset| {
                !self.files.contains_key(&current.wrapping_add(offset))
            });
            if available {
                self.next_file_id = current.wrapping_add(num);
                return Ok(current);
            }
            current = current.wrapping_add(1);
        }
        Err(OtError::IdSpaceExhausted)
    }

    fn purge_disconnected(&mut self) {
        let now = Instant::now();
        self.disconnected
            .retain(|_, record| now.duration_since(record.disconnected_at) < DISCONNECT_RETENTION);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deltautil::delta_to_string;
    use crate::ot::Event;

    fn insert(text: &str) -> Delta {
        Delta::new().insert(text, None)
    }

    async fn recv(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event should arrive")
            .expect("stream should stay open")
    }

    async fn connect(handle: &ServerHandle) -> (Uuid, mpsc::UnboundedReceiver<Event>) {
        let mut events = handle.connect(None).await;
        let hello = recv(&mut events).await;
        let client_id = hello.connected_client_id.expect("first event carries id");
        // Second event: current documents.
        let _ = recv(&mut events).await;
        (client_id, events)
    }

    #[tokio::test]
    async fn connect_sends_identity_then_contents() {
        let (handle, _task) = spawn();
        handle.create_files(vec![insert("seed")]).await.unwrap();

        let mut events = handle.connect(None).await;
        let hello = recv(&mut events).await;
        assert!(hello.connected_client_id.is_some());
        assert!(hello.updates.is_empty());

        let contents = recv(&mut events).await;
        assert_eq!(contents.updates.len(), 1);
        assert_eq!(contents.updates[0].base, 0);
        assert_eq!(delta_to_string(&contents.updates[0].delta, false), "seed");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn create_files_allocates_sequential_ids() {
        let (handle, _task) = spawn();
        let first = handle.create_files(vec![Delta::new()]).await.unwrap();
        assert_eq!(first, vec![0]);
        let pair = handle
            .create_files(vec![Delta::new(), Delta::new()])
            .await
            .unwrap();
        assert_eq!(pair, vec![1, 2]);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn client_version_gate_drops_non_successors() {
        let (handle, _task) = spawn();
        let ids = handle.create_files(vec![insert("x")]).await.unwrap();
        let file_id = ids[0];
        let (client_id, _events) = connect(&handle).await;

        let change = |client_version, text: &str| ClientChange {
            id: file_id,
            delta: Delta::new().retain(1, None).insert(text, None),
            base: 1,
            client_version,
        };

        // client_version 2 is not the successor of 0: silently dropped.
        handle.submit(Some(client_id), vec![change(2, "a")]).await;
        // A duplicate of an unseen version 1 goes through exactly once.
        handle.submit(Some(client_id), vec![change(1, "b")]).await;
        handle.submit(Some(client_id), vec![change(1, "b")]).await;

        let content = handle.content(file_id).await.unwrap();
        assert_eq!(delta_to_string(&content.delta, false), "xb");
        assert_eq!(content.version, 2);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn broadcast_scopes_updates_to_acks() {
        let (handle, _task) = spawn();
        let ids = handle.create_files(vec![insert("x")]).await.unwrap();
        let file_id = ids[0];
        let (client_id, mut events) = connect(&handle).await;

        handle
            .submit(
                None,
                vec![ClientChange {
                    id: file_id,
                    delta: Delta::new().retain(1, None).insert("y", None),
                    base: 1,
                    client_version: 0,
                }],
            )
            .await;

        let event = recv(&mut events).await;
        assert_eq!(event.updates.len(), 1);
        // No ack recorded yet: the update comes against base 0.
        assert_eq!(event.updates[0].base, 0);
        assert_eq!(event.updates[0].version, 2);

        // After acking the current version, broadcasts stay silent.
        handle
            .acks(client_id, HashMap::from([(file_id, 2)]))
            .await;
        handle.broadcast().await;
        let pending =
            tokio::time::timeout(Duration::from_millis(100), events.recv()).await;
        assert!(pending.is_err(), "acked client should not receive updates");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn reconnect_claim_restores_acks_and_last() {
        let (handle, _task) = spawn();
        let ids = handle.create_files(vec![insert("x")]).await.unwrap();
        let file_id = ids[0];
        let (client_id, _events) = connect(&handle).await;

        handle
            .submit(
                Some(client_id),
                vec![ClientChange {
                    id: file_id,
                    delta: Delta::new().retain(1, None).insert("y", None),
                    base: 1,
                    client_version: 1,
                }],
            )
            .await;
        handle
            .acks(client_id, HashMap::from([(file_id, 2)]))
            .await;
        handle.disconnect(client_id).await;

        let mut events = handle.connect(Some(client_id)).await;
        let hello = recv(&mut events).await;
        assert_eq!(hello.connected_client_id, Some(client_id));
        let _ = recv(&mut events).await;

        // The gate remembers client_version 1: a replay is dropped, the
        // successor is accepted.
        handle
            .submit(
                Some(client_id),
                vec![ClientChange {
                    id: file_id,
                    delta: Delta::new().insert("!", None),
                    base: 2,
                    client_version: 1,
                }],
            )
            .await;
        assert_eq!(
            delta_to_string(&handle.content(file_id).await.unwrap().delta, false),
            "xy"
        );
        handle
            .submit(
                Some(client_id),
                vec![ClientChange {
                    id: file_id,
                    delta: Delta::new().insert("!", None),
                    base: 2,
                    client_version: 2,
                }],
            )
            .await;
        assert_eq!(
            delta_to_string(&handle.content(file_id).await.unwrap().delta, false),
            "!xy"
        );
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_reconnect_id_gets_a_fresh_identity() {
        let (handle, _task) = spawn();
        let stale = Uuid::new_v4();
        let mut events = handle.connect(Some(stale)).await;
        let hello = recv(&mut events).await;
        let granted = hello.connected_client_id.unwrap();
        assert_ne!(granted, stale);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn close_files_notifies_and_forgets_state() {
        let (handle, _task) = spawn();
        let ids = handle
            .create_files(vec![insert("a"), insert("b")])
            .await
            .unwrap();
        let (_client_id, mut events) = connect(&handle).await;

        handle.close_files(vec![ids[0]]).await;
        let event = recv(&mut events).await;
        assert_eq!(event.closed_file_ids, vec![ids[0]]);
        assert!(handle.content(ids[0]).await.is_none());
        assert!(handle.content(ids[1]).await.is_some());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn update_runs_against_current_content_inside_the_loop() {
        let (handle, _task) = spawn();
        let ids = handle.create_files(vec![insert("abc")]).await.unwrap();
        let file_id = ids[0];

        handle
            .update(
                file_id,
                Box::new(|content| {
                    Ok(Delta::new().retain(content.length(), None).insert("!", None))
                }),
            )
            .await
            .unwrap();

        let content = handle.content(file_id).await.unwrap();
        assert_eq!(delta_to_string(&content.delta, false), "abc!");
        assert_eq!(content.version, 2);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn update_all_mutates_multiple_documents_atomically() {
        let (handle, _task) = spawn();
        let ids = handle
            .create_files(vec![insert("a"), insert("b")])
            .await
            .unwrap();
        let (first, second) = (ids[0], ids[1]);

        handle
            .update_all(Box::new(move |contents| {
                Ok(contents
                    .iter()
                    .map(|content| ClientChange {
                        id: content.id,
                        delta: Delta::new()
                            .retain(content.delta.length(), None)
                            .insert("+", None),
                        base: content.version,
                        client_version: 0,
                    })
                    .collect())
            }))
            .await
            .unwrap();

        assert_eq!(
            delta_to_string(&handle.content(first).await.unwrap().delta, false),
            "a+"
        );
        assert_eq!(
            delta_to_string(&handle.content(second).await.unwrap().delta, false),
            "b+"
        );
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_event_streams() {
        let (handle, task) = spawn();
        let (_client_id, mut events) = connect(&handle).await;
        handle.shutdown().await;
        assert!(events.recv().await.is_none());
        let _ = task.await;
    }
}
