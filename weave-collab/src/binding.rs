//! Binding between an editor widget and a [`DocumentSession`].
//!
//! Local widget events become replica operations; remote changes are
//! replayed into the widget. Edits the widget reports while it applies a
//! remote diff must be tagged [`EditOrigin::Remote`] so they are not
//! captured again as local edits.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::awareness::{PresenceState, PresenceUser};
use crate::replica::DiffOp;
use crate::session::{DocumentSession, RemoteCursor, SessionError};

/// Who caused a widget mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOrigin {
    Local,
    Remote,
}

/// Edit events reported by the widget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WidgetEdit {
    Insert { index: usize, text: String },
    Delete { index: usize, len: usize },
    CursorMove { position: usize },
    /// Selection from `anchor` to `head`; the cursor sits at `head`
    Select { anchor: usize, head: usize },
}

/// The external text widget.
///
/// Called from the session task; implementations must not block.
pub trait EditorWidget: Send + 'static {
    /// Replace the whole content (initial load).
    fn load(&mut self, text: &str);

    /// Apply remote ops in order.
    fn apply_remote_diff(&mut self, ops: &[DiffOp]);

    /// Show remote cursors.
    fn update_presence(&mut self, cursors: &[RemoteCursor]);
}

/// Keeps a widget and a session in step.
pub struct BindingAdapter<W: EditorWidget> {
    session: DocumentSession,
    widget: Arc<Mutex<W>>,
    user: PresenceUser,
}

fn lock<W>(widget: &Mutex<W>) -> MutexGuard<'_, W> {
    widget.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<W: EditorWidget> BindingAdapter<W> {
    /// Bind `widget` to `session`: subscribe to remote changes and
    /// presence, then load the current content.
    pub async fn bind(session: DocumentSession, widget: W, user_name: impl Into<String>) -> Result<Self, SessionError> {
        let widget = Arc::new(Mutex::new(widget));
        let user = PresenceUser::new(user_name, session.client_id());

        let target = widget.clone();
        session
            .on_remote_change(move |change| {
                let mut widget = lock(&target);
                widget.apply_remote_diff(change.ops);
                widget.update_presence(&change.remote_cursors());
            })
            .await?;

        let target = widget.clone();
        session
            .awareness()
            .on_change(move |event| lock(&target).update_presence(&event.remote_cursors()))
            .await?;

        // Runs on the session task after the subscriptions, so no remote
        // change falls between the load and the first callback.
        let target = widget.clone();
        session.read(move |store| lock(&target).load(&store.text())).await?;

        Ok(Self { session, widget, user })
    }

    pub fn session(&self) -> &DocumentSession {
        &self.session
    }

    /// Run `f` with the widget locked.
    pub fn with_widget<R>(&self, f: impl FnOnce(&mut W) -> R) -> R {
        f(&mut lock(&self.widget))
    }

    /// Route a widget event. Remote-origin events are ignored.
    pub async fn handle(&self, edit: WidgetEdit, origin: EditOrigin) -> Result<(), SessionError> {
        if origin == EditOrigin::Remote {
            log::trace!("Skipping remote-origin widget edit {edit:?}");
            return Ok(());
        }
        match edit {
            WidgetEdit::Insert { index, text } => self.on_local_insert(index, text).await,
            WidgetEdit::Delete { index, len } => self.on_local_delete(index, len).await,
            WidgetEdit::CursorMove { position } => self.on_local_cursor_move(position).await,
            WidgetEdit::Select { anchor, head } => self.on_local_selection(anchor, head).await,
        }
    }

    pub async fn on_local_insert(&self, index: usize, text: impl Into<String>) -> Result<(), SessionError> {
        self.session.local_insert(index, text).await
    }

    pub async fn on_local_delete(&self, index: usize, len: usize) -> Result<(), SessionError> {
        self.session.local_delete(index, len).await
    }

    /// Publish the cursor as an anchor so it survives concurrent edits.
    pub async fn on_local_cursor_move(&self, position: usize) -> Result<(), SessionError> {
        let anchor = self.session.anchor_at(position).await?;
        let presence = PresenceState {
            user: Some(self.user.clone()),
            cursor: Some(anchor),
            selection: None,
        };
        self.session.awareness().set_presence(&presence).await
    }

    pub async fn on_local_selection(&self, anchor: usize, head: usize) -> Result<(), SessionError> {
        let start = self.session.anchor_at(anchor).await?;
        let end = self.session.anchor_at(head).await?;
        let presence = PresenceState {
            user: Some(self.user.clone()),
            cursor: Some(end),
            selection: Some((start, end)),
        };
        self.session.awareness().set_presence(&presence).await
    }
}
