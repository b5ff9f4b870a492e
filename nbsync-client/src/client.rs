//! Notebook client.
//!
//! Mirrors one notebook over a [`Session`]:
//!
//! - local mutations go through [`NotebookClient::update_notebook`]: diffed
//!   against the current snapshot in FIFO order, applied locally at once
//!   (optimistic UI) and sent as one `UpdateNotebook` request;
//! - bond edits made while the notebook is busy are held back and sent as one
//!   combined patch once it turns idle;
//! - inbound `NotebookDiff` broadcasts pass the ordering guard and are applied
//!   in arrival order; a patch that does not apply triggers a resync;
//! - after a reconnect the notebook is fetched again, and a notebook with a
//!   different id rejects the resumed session.
//!
//! Refused updates are undone according to [`RejectionPolicy`].

use std::sync::Arc;

use async_trait::async_trait;
use nbsync_core::{
    apply_notebook, diff, diff_notebook, ensure_client_writable, fields, BondValue, LocalOverlay,
    Notebook, Patch, PatchError, Value,
};
use tokio::sync::{watch, Mutex};

use crate::config::{ClientConfig, RejectionPolicy};
use crate::correlator::PendingReply;
use crate::error::ClientError;
use crate::idle::{BondBuffer, IdleGate, UpdateTicket};
use crate::ordering::{OrderingGuard, Verdict};
use crate::protocol::{
    run_cells_body, update_body, Envelope, MessageType, NotebookDiff, RouteMetadata, SharedState,
    UpdateAck,
};
use crate::sequencer::UpdateSequencer;
use crate::session::{ConnectionStatus, Session, SessionHandler};
use crate::transport::Transport;

/// How an update ended.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The mutation changed nothing; nothing was sent.
    Unchanged,
    /// Only bond changes, held back until the notebook is idle.
    Deferred,
    /// Acknowledged; carries the acknowledgement body.
    Acknowledged(Value),
}

/// Client for one notebook.
pub struct NotebookClient {
    session: Session,
    state: Arc<NotebookState>,
}

struct NotebookState {
    notebook_id: String,
    policy: RejectionPolicy,
    sequencer: UpdateSequencer,
    doc: Mutex<DocState>,
    snapshots: watch::Sender<Arc<Notebook>>,
}

struct DocState {
    snapshot: Arc<Notebook>,
    overlay: LocalOverlay,
    guard: OrderingGuard,
    gate: IdleGate,
    bonds: BondBuffer,
    /// A full state has been received at least once.
    synced: bool,
    flush_scheduled: bool,
}

impl NotebookClient {
    /// Open a session for `notebook_id` and fetch the notebook.
    pub async fn open(
        transport: Arc<dyn Transport>,
        address: &str,
        notebook_id: impl Into<String>,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let notebook_id = notebook_id.into();
        let initial = Arc::new(Notebook::new(notebook_id.clone()));
        let (snapshots, _) = watch::channel(initial.clone());
        let state = Arc::new(NotebookState {
            notebook_id: notebook_id.clone(),
            policy: config.rejection_policy,
            sequencer: UpdateSequencer::new(),
            doc: Mutex::new(DocState {
                snapshot: initial,
                overlay: LocalOverlay::new(),
                guard: OrderingGuard::new(),
                gate: IdleGate::new(),
                bonds: BondBuffer::new(),
                synced: false,
                flush_scheduled: false,
            }),
            snapshots,
        });

        let handler = Arc::new(DocumentHandler {
            state: state.clone(),
        });
        let session = Session::open(
            transport,
            address,
            RouteMetadata::notebook(notebook_id),
            config,
            handler,
        )
        .await?;

        if let Err(e) = state.resync(&session).await {
            session.close().await;
            return Err(e);
        }
        Ok(Self { session, state })
    }

    pub fn notebook_id(&self) -> &str {
        &self.state.notebook_id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Current local snapshot, including unacknowledged local edits.
    pub fn notebook(&self) -> Arc<Notebook> {
        self.state.snapshots.borrow().clone()
    }

    /// Receiver that sees every new snapshot, local or remote.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Notebook>> {
        self.state.snapshots.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.session.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.session.watch_status()
    }

    /// No cell queued or running and no update waiting for its acknowledgement.
    pub async fn is_idle(&self) -> bool {
        self.state.doc.lock().await.gate.is_idle()
    }

    /// Bond changes waiting for the notebook to become idle.
    pub async fn deferred_bonds(&self) -> Vec<String> {
        let doc = self.state.doc.lock().await;
        doc.bonds.names().map(str::to_string).collect()
    }

    /// Mutate the notebook.
    ///
    /// The new snapshot is visible locally as soon as this call has sent the
    /// patch. Resolves when the remote party acknowledges, or fails with
    /// [`ClientError::RejectedMutation`] when it refuses; a refused update is
    /// undone according to the configured [`RejectionPolicy`].
    ///
    /// Like every request the acknowledgement has no timeout; a patch sent
    /// while disconnected is lost and its future only settles when the session
    /// closes. Dropping the future (e.g. on a caller's timeout) does not drop
    /// the acknowledgement: it is still processed when it arrives.
    pub async fn update_notebook<F>(&self, mutate: F) -> Result<UpdateOutcome, ClientError>
    where
        F: FnOnce(&mut Notebook),
    {
        let state = &self.state;
        let turn = state.sequencer.turn().await;

        let (before, sent, ticket, pending) = {
            let mut locked = state.doc.lock().await;
            let doc = &mut *locked;

            let change = diff_notebook(&doc.snapshot, mutate)?;
            if change.patch.is_empty() {
                return Ok(UpdateOutcome::Unchanged);
            }
            ensure_client_writable(&change.patch)?;

            let before = doc.snapshot.clone();
            let (deferred, sent) = if doc.gate.is_idle() {
                (Patch::default(), change.patch)
            } else {
                change.patch.partition(|op| op.touches(fields::BONDS))
            };
            if !deferred.is_empty() {
                log::debug!(
                    "Notebook busy, deferring {} bond operations",
                    deferred.len()
                );
                doc.bonds.defer_ops(&deferred, &before);
            }

            doc.snapshot = Arc::new(change.snapshot);
            state.publish(&doc.snapshot);
            if sent.is_empty() {
                return Ok(UpdateOutcome::Deferred);
            }

            let pending = self
                .session
                .request(MessageType::UpdateNotebook, update_body(&sent), None)
                .await?;
            // no await from here on: the ticket is always handed to `settle`
            let ticket = doc.gate.begin_update();
            (before, sent, ticket, pending)
        };
        drop(turn);

        let settling = tokio::spawn(state.clone().settle(
            self.session.clone(),
            ticket,
            pending,
            move || undo_patch(&before, &sent),
        ));
        match settling.await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Acknowledgement handling for {} ended: {e}", state.notebook_id);
                Err(ClientError::SessionClosed)
            }
        }
    }

    /// Set one bond.
    pub async fn set_bond(
        &self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<UpdateOutcome, ClientError> {
        let name = name.into();
        let value = BondValue::new(value);
        self.update_notebook(move |nb| {
            nb.bonds.insert(name, value);
        })
        .await
    }

    /// Stage code for a cell without sending it.
    pub async fn stage_code(&self, cell_id: impl Into<String>, code: impl Into<String>) {
        self.state.doc.lock().await.overlay.stage(cell_id, code);
    }

    /// Staged code if any, else the code of the current snapshot.
    pub async fn local_code(&self, cell_id: &str) -> Option<String> {
        let doc = self.state.doc.lock().await;
        doc.overlay
            .get(cell_id)
            .or_else(|| doc.snapshot.code(cell_id))
            .map(str::to_string)
    }

    pub async fn discard_staged(&self, cell_id: &str) -> Option<String> {
        self.state.doc.lock().await.overlay.discard(cell_id)
    }

    /// Submit the staged code of `cell_ids` as one update. Each staged entry
    /// is cleared once acknowledged, unless it was re-staged meanwhile.
    pub async fn submit_staged(&self, cell_ids: &[String]) -> Result<UpdateOutcome, ClientError> {
        let overlay = self.state.doc.lock().await.overlay.clone();
        let mut merged = Vec::new();
        let outcome = self
            .update_notebook(|nb| merged = overlay.merge_into(nb, cell_ids))
            .await?;

        if !matches!(outcome, UpdateOutcome::Deferred) {
            let mut doc = self.state.doc.lock().await;
            for (cell_id, code) in &merged {
                doc.overlay.clear_if_unchanged(cell_id, code);
            }
        }
        Ok(outcome)
    }

    /// Ask the remote party to run cells. Resolves with its reply body.
    pub async fn run_cells(&self, cell_ids: &[String]) -> Result<Value, ClientError> {
        let reply = self
            .session
            .request(MessageType::RunMultipleCells, run_cells_body(cell_ids), None)
            .await?
            .await?;
        Ok(reply.body)
    }

    /// Interrupt all running cells. Fire-and-forget.
    pub async fn interrupt(&self) -> Result<(), ClientError> {
        self.session
            .send(MessageType::InterruptAll, Value::map(), None, false)
            .await
            .map(|_| ())
    }

    /// Replace the local snapshot with the remote party's.
    pub async fn resync(&self) -> Result<(), ClientError> {
        self.state.resync(&self.session).await
    }

    /// Close the session. See [`Session::close`].
    pub async fn close(&self) {
        self.session.close().await;
    }
}

impl NotebookState {
    fn publish(&self, snapshot: &Arc<Notebook>) {
        self.snapshots.send_replace(snapshot.clone());
    }

    async fn resync(&self, session: &Session) -> Result<(), ClientError> {
        let reply = session
            .request(MessageType::ResetSharedState, Value::map(), None)
            .await?
            .await?;
        let shared = SharedState::from_body(&reply.body)?;
        if shared.notebook.notebook_id != self.notebook_id {
            return Err(ClientError::NotebookMismatch {
                expected: self.notebook_id.clone(),
                found: shared.notebook.notebook_id,
            });
        }

        let mut locked = self.doc.lock().await;
        let doc = &mut *locked;
        if !doc.bonds.is_empty() {
            log::warn!("Resync drops {} deferred bond changes", doc.bonds.len());
            doc.bonds.clear();
        }
        doc.snapshot = Arc::new(shared.notebook);
        doc.guard.reset(shared.counter);
        doc.gate.clear_in_flight();
        doc.gate.observe(&doc.snapshot);
        doc.synced = true;
        self.publish(&doc.snapshot);
        log::info!(
            "Notebook {} synced at counter {}",
            self.notebook_id,
            shared.counter
        );
        Ok(())
    }

    fn spawn_resync(self: &Arc<Self>, session: &Session) {
        let state = self.clone();
        let session = session.clone();
        tokio::spawn(async move {
            if let Err(e) = state.resync(&session).await {
                log::error!("Resync of notebook {} failed: {e}", state.notebook_id);
            }
        });
    }

    async fn receive_diff(self: &Arc<Self>, session: &Session, envelope: Envelope) {
        if let Some(id) = envelope.notebook_id.as_deref() {
            if id != self.notebook_id {
                log::debug!("Ignoring diff for notebook {id}");
                return;
            }
        }
        let remote = match NotebookDiff::from_body(&envelope.body) {
            Ok(remote) => remote,
            Err(e) => {
                log::error!("Malformed notebook diff: {e}");
                self.spawn_resync(session);
                return;
            }
        };

        let mut locked = self.doc.lock().await;
        let doc = &mut *locked;
        if !doc.synced {
            log::debug!("Diff {} arrived before the first sync", remote.counter);
            return;
        }
        if let Verdict::Stale { counter, last_seen } = doc.guard.check(remote.counter) {
            log::warn!("Discarding stale diff {counter}, last seen {last_seen}");
            return;
        }
        match apply_notebook(&doc.snapshot, &remote.patch) {
            Ok(next) => {
                doc.snapshot = Arc::new(next);
                doc.gate.observe(&doc.snapshot);
                self.publish(&doc.snapshot);
                self.schedule_flush(doc, session);
            }
            Err(e) => {
                log::error!("Diff {} does not apply: {e}", remote.counter);
                drop(locked);
                self.spawn_resync(session);
            }
        }
    }

    /// Wait for an update's acknowledgement and act on it.
    async fn settle<U>(
        self: Arc<Self>,
        session: Session,
        ticket: UpdateTicket,
        pending: PendingReply,
        undo: U,
    ) -> Result<UpdateOutcome, ClientError>
    where
        U: FnOnce() -> Result<Patch, PatchError>,
    {
        let reply = pending.await;
        self.doc.lock().await.gate.finish_update(ticket);

        let envelope = reply?;
        let ack = UpdateAck::from_body(&envelope.body)?;
        if ack.went_well {
            self.maybe_flush(&session).await;
            return Ok(UpdateOutcome::Acknowledged(envelope.body));
        }

        let why_not = ack.why_not.unwrap_or_else(|| "no reason given".to_string());
        log::error!("Update of notebook {} rejected: {why_not}", self.notebook_id);
        self.undo_rejected(&session, undo).await;
        self.maybe_flush(&session).await;
        Err(ClientError::RejectedMutation { why_not })
    }

    async fn undo_rejected<U>(&self, session: &Session, undo: U)
    where
        U: FnOnce() -> Result<Patch, PatchError>,
    {
        if self.policy == RejectionPolicy::Rollback {
            let mut locked = self.doc.lock().await;
            let doc = &mut *locked;
            match undo().and_then(|undo| apply_notebook(&doc.snapshot, &undo)) {
                Ok(previous) => {
                    doc.snapshot = Arc::new(previous);
                    doc.gate.observe(&doc.snapshot);
                    self.publish(&doc.snapshot);
                    log::info!("Rolled back rejected update");
                    return;
                }
                Err(e) => log::warn!("Rollback failed ({e}), resyncing instead"),
            }
        }
        if let Err(e) = self.resync(session).await {
            log::error!("Resync after rejected update failed: {e}");
        }
    }

    async fn maybe_flush(self: &Arc<Self>, session: &Session) {
        let mut locked = self.doc.lock().await;
        self.schedule_flush(&mut locked, session);
    }

    fn schedule_flush(self: &Arc<Self>, doc: &mut DocState, session: &Session) {
        if doc.flush_scheduled || doc.bonds.is_empty() || !doc.gate.is_idle() {
            return;
        }
        doc.flush_scheduled = true;
        let state = self.clone();
        let session = session.clone();
        tokio::spawn(async move { state.flush_bonds(&session).await });
    }

    /// Send the deferred bond changes as one update.
    async fn flush_bonds(self: &Arc<Self>, session: &Session) {
        let turn = self.sequencer.turn().await;
        let (undo, ticket, pending) = {
            let mut locked = self.doc.lock().await;
            let doc = &mut *locked;
            doc.flush_scheduled = false;
            // rescheduled when the notebook next turns idle
            if !doc.gate.is_idle() {
                return;
            }
            let flushed = doc.bonds.take_patch(&doc.snapshot);
            if flushed.patch.is_empty() {
                return;
            }
            log::debug!("Flushing {} deferred bond operations", flushed.patch.len());

            match session
                .request(MessageType::UpdateNotebook, update_body(&flushed.patch), None)
                .await
            {
                Ok(pending) => (flushed.inverse, doc.gate.begin_update(), pending),
                Err(e) => {
                    log::error!("Could not send deferred bonds: {e}");
                    return;
                }
            }
        };
        drop(turn);

        let settled = self
            .clone()
            .settle(session.clone(), ticket, pending, move || Ok(undo))
            .await;
        if let Err(e) = settled {
            log::error!("Deferred bond update failed: {e}");
        }
    }
}

/// Patch undoing `sent` on top of `base + sent`.
fn undo_patch(base: &Notebook, sent: &Patch) -> Result<Patch, PatchError> {
    let applied = apply_notebook(base, sent)?;
    Ok(diff(&applied.to_value(), &base.to_value()).patch)
}

struct DocumentHandler {
    state: Arc<NotebookState>,
}

#[async_trait]
impl SessionHandler for DocumentHandler {
    async fn on_unrequested_update(&self, session: &Session, envelope: Envelope, by_me: bool) {
        match envelope.msg_type {
            MessageType::NotebookDiff => self.state.receive_diff(session, envelope).await,
            MessageType::Ping | MessageType::Pong => {}
            other => log::debug!("Ignoring unrequested {other:?} (by me: {by_me})"),
        }
    }

    fn on_connection_status(&self, connected: bool, hopeless: bool) {
        if hopeless {
            log::error!(
                "Notebook {} lost its connection for good, refresh required",
                self.state.notebook_id
            );
        } else if connected {
            log::info!("Notebook {} connected", self.state.notebook_id);
        } else {
            log::warn!("Notebook {} disconnected", self.state.notebook_id);
        }
    }

    async fn on_reconnect(&self, session: &Session) -> bool {
        match self.state.resync(session).await {
            Ok(()) => true,
            Err(e) => {
                log::error!("Cannot resume notebook {}: {e}", self.state.notebook_id);
                false
            }
        }
    }
}
