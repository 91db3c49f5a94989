//! Editable surface adapter.
//!
//! The host view is controlled: it reports input as [`InputEvent`]s and
//! only ever shows what the adapter patches into it.
//!
//! ```text
//! view input ──► SurfaceAdapter ──Edit──► ReplicaStore ──► Operation
//!                    │  ▲
//!        ViewPatch ◄─┘  └── remote content (prefix/suffix diff)
//! ```
//!
//! Undo history holds only local edits. Remote patches shift recorded
//! entries but never add to them, and an inverse range that a remote
//! insert lands inside is split around it.

use crate::awareness::CursorRange;
use crate::error::CollabError;
use crate::markup::{Mark, RichText, Span};
use crate::replica::{Edit, Operation, ReplicaStore};

const DEFAULT_MAX_HISTORY: usize = 200;

/// Host-side editor view.
pub trait EditorView: Send {
    /// Attach and show `content`. Failure aborts the session open.
    fn mount(&mut self, content: &RichText, editable: bool) -> Result<(), CollabError>;

    /// Replace everything shown.
    fn render(&mut self, content: &RichText);

    fn apply_patch(&mut self, patch: &ViewPatch);

    fn selection(&self) -> Option<CursorRange>;

    fn set_selection(&mut self, selection: Option<CursorRange>);

    fn set_editable(&mut self, editable: bool);

    fn unmount(&mut self) {}
}

/// Replace `delete` chars at `start` with `insert`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewPatch {
    pub start: usize,
    pub delete: usize,
    pub insert: Vec<Span>,
}

impl ViewPatch {
    /// Minimal single-range patch turning `old` into `new`, or `None`
    /// when they are equal. Marks count as part of each char.
    pub fn between(old: &RichText, new: &RichText) -> Option<ViewPatch> {
        if old == new {
            return None;
        }
        let old_chars: Vec<_> = old.chars().collect();
        let new_chars: Vec<_> = new.chars().collect();

        let prefix = old_chars
            .iter()
            .zip(&new_chars)
            .take_while(|(a, b)| a == b)
            .count();
        let max_suffix = old_chars.len().min(new_chars.len()) - prefix;
        let suffix = old_chars
            .iter()
            .rev()
            .zip(new_chars.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();

        Some(ViewPatch {
            start: prefix,
            delete: old_chars.len() - prefix - suffix,
            insert: new.slice(prefix, new_chars.len() - suffix).into_spans(),
        })
    }

    pub fn insert_len(&self) -> usize {
        self.insert.iter().map(|s| s.text.chars().count()).sum()
    }

    /// Apply to a local copy of the content.
    pub fn apply(&self, content: &RichText) -> RichText {
        let len = content.char_len();
        let mut out = content.slice(0, self.start);
        for span in &self.insert {
            out.push(span.text.clone(), span.marks.clone());
        }
        for span in content.slice(self.start + self.delete, len).into_spans() {
            out.push(span.text, span.marks);
        }
        out
    }

    /// Where a position before the patch ends up after it. Positions
    /// inside the replaced range collapse to its start.
    pub fn map_pos(&self, pos: usize) -> usize {
        if pos <= self.start {
            pos
        } else if pos >= self.start + self.delete {
            pos - self.delete + self.insert_len()
        } else {
            self.start
        }
    }

    /// Parts of `[index, index + len)` that survive the patch, in
    /// post-patch positions and ascending order. Replaced text drops out
    /// and inserted text is never included.
    pub fn split_range(&self, index: usize, len: usize) -> Vec<(usize, usize)> {
        let end = index + len;
        let cut = self.start + self.delete;
        let mut parts = Vec::with_capacity(2);
        let before_end = end.min(self.start);
        if before_end > index {
            parts.push((index, before_end - index));
        }
        if end > cut {
            let from = index.max(cut);
            parts.push((from - self.delete + self.insert_len(), end - from));
        }
        parts
    }

    pub fn map_range(&self, range: CursorRange) -> CursorRange {
        CursorRange::new(self.map_pos(range.anchor), self.map_pos(range.head))
    }
}

/// Input reported by the host view, in char positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    Insert { at: usize, text: String },
    Delete { at: usize, len: usize },
    Replace { at: usize, len: usize, text: String },
    Format { at: usize, len: usize, mark: Mark, enabled: bool },
    Select(Option<CursorRange>),
    Undo,
    Redo,
}

impl InputEvent {
    fn mutates(&self) -> bool {
        !matches!(self, InputEvent::Select(_))
    }
}

/// What handling one input produced.
#[derive(Debug, Clone, Default)]
pub struct InputOutcome {
    /// Operations to broadcast, in order
    pub ops: Vec<Operation>,
    /// Selection after the input, when it moved
    pub selection: Option<CursorRange>,
    pub content_changed: bool,
}

/// A group of edits that undoes (or redoes) one input.
#[derive(Debug, Clone)]
struct HistoryEntry {
    edits: Vec<Edit>,
}

impl HistoryEntry {
    /// Map every edit through a remote patch. Ranges never grow over text
    /// the patch inserted, so undo leaves other peers' text alone.
    fn shift(&mut self, patch: &ViewPatch) {
        let mut shifted = Vec::with_capacity(self.edits.len());
        for edit in self.edits.drain(..) {
            match edit {
                Edit::Insert { index, text, marks } => shifted.push(Edit::Insert {
                    index: patch.map_pos(index),
                    text,
                    marks,
                }),
                // Highest piece first so earlier indices stay valid
                Edit::Delete { index, len } => shifted.extend(
                    patch
                        .split_range(index, len)
                        .into_iter()
                        .rev()
                        .map(|(at, n)| Edit::delete(at, n)),
                ),
                Edit::Format {
                    index,
                    len,
                    mark,
                    enabled,
                } => shifted.extend(
                    patch
                        .split_range(index, len)
                        .into_iter()
                        .map(|(at, n)| Edit::format(at, n, mark.clone(), enabled)),
                ),
            }
        }
        self.edits = shifted;
    }
}

/// Binds an [`EditorView`] to a replica.
pub struct SurfaceAdapter<V: EditorView> {
    view: V,
    shown: RichText,
    read_only: bool,
    undo: Vec<HistoryEntry>,
    redo: Vec<HistoryEntry>,
    max_history: usize,
}

impl<V: EditorView> SurfaceAdapter<V> {
    /// Mount `view` showing `content`.
    pub fn mount(mut view: V, content: RichText, read_only: bool) -> Result<Self, CollabError> {
        view.mount(&content, !read_only)?;
        Ok(Self {
            view,
            shown: content,
            read_only,
            undo: Vec::new(),
            redo: Vec::new(),
            max_history: DEFAULT_MAX_HISTORY,
        })
    }

    pub fn with_max_history(mut self, max: usize) -> Self {
        self.max_history = max.max(1);
        self
    }

    pub fn view(&self) -> &V {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut V {
        &mut self.view
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
        self.view.set_editable(!read_only);
    }

    /// Canonical HTML of what the view shows.
    pub fn get_serialized_content(&self) -> String {
        self.shown.to_html()
    }

    pub fn shown(&self) -> &RichText {
        &self.shown
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    /// Patch the view to show `content` after a remote change.
    ///
    /// The selection and every history entry are mapped through the patch.
    pub fn apply_remote(&mut self, content: &RichText) -> Option<ViewPatch> {
        let patch = self.patch_view(content)?;
        for entry in self.undo.iter_mut().chain(self.redo.iter_mut()) {
            entry.shift(&patch);
        }
        log::trace!(
            "Remote patch at {} (-{} +{})",
            patch.start,
            patch.delete,
            patch.insert_len()
        );
        Some(patch)
    }

    /// Bring the view to `content`, mapping the selection. History is
    /// untouched.
    fn patch_view(&mut self, content: &RichText) -> Option<ViewPatch> {
        let patch = ViewPatch::between(&self.shown, content)?;
        let selection = self.view.selection().map(|s| patch.map_range(s));
        self.view.apply_patch(&patch);
        self.view.set_selection(selection);
        self.shown = content.clone();
        Some(patch)
    }

    /// Turn host input into replica edits.
    pub fn handle_input(
        &mut self,
        replica: &mut ReplicaStore,
        event: InputEvent,
    ) -> Result<InputOutcome, CollabError> {
        if self.read_only && event.mutates() {
            return Err(CollabError::ReadOnly);
        }
        self.apply_remote(&replica.rich_text());

        match event {
            InputEvent::Select(selection) => {
                let selection = selection.map(|s| self.clamp(s));
                self.view.set_selection(selection);
                Ok(InputOutcome {
                    selection,
                    ..InputOutcome::default()
                })
            }
            InputEvent::Undo => Ok(self.replay(replica, true)),
            InputEvent::Redo => Ok(self.replay(replica, false)),
            InputEvent::Insert { at, text } => {
                let caret = at.min(self.shown.char_len()) + text.chars().count();
                let edits = vec![Edit::insert(at, text)];
                Ok(self.record(replica, edits, CursorRange::caret(caret)))
            }
            InputEvent::Delete { at, len } => {
                let at = at.min(self.shown.char_len());
                Ok(self.record(replica, vec![Edit::delete(at, len)], CursorRange::caret(at)))
            }
            InputEvent::Replace { at, len, text } => {
                let at = at.min(self.shown.char_len());
                let caret = at + text.chars().count();
                let edits = vec![Edit::delete(at, len), Edit::insert(at, text)];
                Ok(self.record(replica, edits, CursorRange::caret(caret)))
            }
            InputEvent::Format {
                at,
                len,
                mark,
                enabled,
            } => {
                let selection = self.clamp(CursorRange::new(at, at + len));
                let edits = vec![Edit::format(at, len, mark, enabled)];
                Ok(self.record(replica, edits, selection))
            }
        }
    }

    /// Apply `edits` as a new history entry.
    fn record(
        &mut self,
        replica: &mut ReplicaStore,
        edits: Vec<Edit>,
        selection: CursorRange,
    ) -> InputOutcome {
        let (ops, inverse) = self.apply_edits(replica, edits);
        if ops.is_empty() {
            return InputOutcome::default();
        }
        self.push_undo(HistoryEntry { edits: inverse });
        self.redo.clear();
        self.finish(replica, ops, selection)
    }

    /// Pop from undo (or redo), apply, and push the inverse to the other stack.
    fn replay(&mut self, replica: &mut ReplicaStore, undo: bool) -> InputOutcome {
        let entry = if undo { self.undo.pop() } else { self.redo.pop() };
        let Some(entry) = entry else {
            return InputOutcome::default();
        };
        let caret = entry.edits.last().map_or(0, edit_end);
        let (ops, inverse) = self.apply_edits(replica, entry.edits);
        if !inverse.is_empty() {
            let entry = HistoryEntry { edits: inverse };
            if undo {
                self.redo.push(entry);
            } else {
                self.push_undo(entry);
            }
        }
        self.finish(replica, ops, CursorRange::caret(caret))
    }

    fn finish(
        &mut self,
        replica: &ReplicaStore,
        ops: Vec<Operation>,
        selection: CursorRange,
    ) -> InputOutcome {
        let changed = !ops.is_empty();
        // Own edits: history is already in post-edit positions
        self.patch_view(&replica.rich_text());
        let selection = self.clamp(selection);
        self.view.set_selection(Some(selection));
        InputOutcome {
            ops,
            selection: Some(selection),
            content_changed: changed,
        }
    }

    /// Apply edits to the replica, returning the ops and the edits that
    /// undo them (already in application order).
    fn apply_edits(&mut self, replica: &mut ReplicaStore, edits: Vec<Edit>) -> (Vec<Operation>, Vec<Edit>) {
        let mut ops = Vec::new();
        let mut inverse = Vec::new();
        for edit in edits {
            let before = replica.rich_text();
            let undo = invert(&before, &edit);
            if let Some(op) = replica.apply_local_change(edit).op {
                ops.push(op);
                inverse.push(undo);
            }
        }
        inverse.reverse();
        (ops, inverse.into_iter().flatten().collect())
    }

    fn push_undo(&mut self, entry: HistoryEntry) {
        if self.undo.len() >= self.max_history {
            self.undo.remove(0);
        }
        self.undo.push(entry);
    }

    fn clamp(&self, range: CursorRange) -> CursorRange {
        let len = self.shown.char_len();
        CursorRange::new(range.anchor.min(len), range.head.min(len))
    }
}

/// Edits that revert `edit` when applied to the state right after it.
fn invert(before: &RichText, edit: &Edit) -> Vec<Edit> {
    let len = before.char_len();
    match edit {
        Edit::Insert { index, text, .. } => {
            let at = (*index).min(len);
            vec![Edit::delete(at, text.chars().count())]
        }
        Edit::Delete { index, len: n } => {
            let mut at = (*index).min(len);
            let mut restore = Vec::new();
            for span in before.slice(at, at + n).into_spans() {
                let count = span.text.chars().count();
                restore.push(Edit::Insert {
                    index: at,
                    text: span.text,
                    marks: span.marks,
                });
                at += count;
            }
            restore
        }
        Edit::Format {
            index,
            len: n,
            mark,
            enabled,
        } => {
            let mut at = (*index).min(len);
            let mut restore = Vec::new();
            for span in before.slice(at, at + n).into_spans() {
                let count = span.text.chars().count();
                let mut after = span.marks.clone();
                after.set(mark, *enabled);
                if after != span.marks {
                    let (mark, enabled) = match (mark, &span.marks.link) {
                        (Mark::Link(_), Some(prev)) => (Mark::Link(prev.clone()), true),
                        (mark, _) => (mark.clone(), span.marks.has(mark)),
                    };
                    restore.push(Edit::format(at, count, mark, enabled));
                }
                at += count;
            }
            restore
        }
    }
}

fn edit_end(edit: &Edit) -> usize {
    match edit {
        Edit::Insert { index, text, .. } => index + text.chars().count(),
        Edit::Delete { index, .. } => *index,
        Edit::Format { index, len, .. } => index + len,
    }
}

/// View that keeps its state in memory. Used headless and in tests.
#[derive(Debug, Clone, Default)]
pub struct BufferView {
    pub content: RichText,
    pub selection: Option<CursorRange>,
    pub editable: bool,
    pub mounted: bool,
    pub patches: usize,
    /// Fail the next mount with a view error
    pub fail_mount: bool,
}

impl EditorView for BufferView {
    fn mount(&mut self, content: &RichText, editable: bool) -> Result<(), CollabError> {
        if self.fail_mount {
            return Err(CollabError::View("mount refused".into()));
        }
        self.content = content.clone();
        self.editable = editable;
        self.mounted = true;
        Ok(())
    }

    fn render(&mut self, content: &RichText) {
        self.content = content.clone();
    }

    fn apply_patch(&mut self, patch: &ViewPatch) {
        self.content = patch.apply(&self.content);
        self.patches += 1;
    }

    fn selection(&self) -> Option<CursorRange> {
        self.selection
    }

    fn set_selection(&mut self, selection: Option<CursorRange>) {
        self.selection = selection;
    }

    fn set_editable(&mut self, editable: bool) {
        self.editable = editable;
    }

    fn unmount(&mut self) {
        self.mounted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicaConfig;
    use crate::markup::Marks;
    use crate::protocol::PeerId;
    use uuid::Uuid;

    fn replica(n: u128) -> ReplicaStore {
        let mut replica = ReplicaStore::new(PeerId::from_uuid(Uuid::from_u128(n)), ReplicaConfig::default());
        replica.initialize("doc", "").unwrap();
        replica
    }

    fn adapter(replica: &ReplicaStore) -> SurfaceAdapter<BufferView> {
        SurfaceAdapter::mount(BufferView::default(), replica.rich_text(), false).unwrap()
    }

    fn insert(at: usize, text: &str) -> InputEvent {
        InputEvent::Insert {
            at,
            text: text.into(),
        }
    }

    #[test]
    fn test_patch_between() {
        let old = RichText::plain("hello world");
        let new = RichText::plain("hello brave world");
        let patch = ViewPatch::between(&old, &new).unwrap();
        assert_eq!(patch.start, 6);
        assert_eq!(patch.delete, 0);
        assert_eq!(patch.insert_len(), 6);
        assert_eq!(patch.apply(&old), new);
        assert!(ViewPatch::between(&new, &new).is_none());
    }

    #[test]
    fn test_patch_detects_mark_change() {
        let old = RichText::plain("abc");
        let mut new = RichText::plain("a");
        new.push("b", Marks::plain().with(Mark::Bold));
        new.push("c", Marks::plain());
        let patch = ViewPatch::between(&old, &new).unwrap();
        assert_eq!((patch.start, patch.delete), (1, 1));
        assert_eq!(patch.apply(&old), new);
    }

    #[test]
    fn test_patch_repeated_chars() {
        let old = RichText::plain("aaaa");
        let new = RichText::plain("aa");
        let patch = ViewPatch::between(&old, &new).unwrap();
        assert_eq!(patch.delete, 2);
        assert_eq!(patch.apply(&old), new);
    }

    #[test]
    fn test_map_pos() {
        let patch = ViewPatch {
            start: 2,
            delete: 3,
            insert: RichText::plain("xy").into_spans(),
        };
        assert_eq!(patch.map_pos(1), 1);
        assert_eq!(patch.map_pos(3), 2);
        assert_eq!(patch.map_pos(6), 5);
    }

    #[test]
    fn test_local_input_updates_view_and_caret() {
        let mut replica = replica(1);
        let mut surface = adapter(&replica);

        let out = surface.handle_input(&mut replica, insert(0, "Hello")).unwrap();
        assert_eq!(out.ops.len(), 1);
        assert!(out.content_changed);
        assert_eq!(out.selection, Some(CursorRange::caret(5)));
        assert_eq!(surface.view().content.plain_text(), "Hello");
        assert_eq!(surface.get_serialized_content(), "<p>Hello</p>");

        let out = surface
            .handle_input(
                &mut replica,
                InputEvent::Replace {
                    at: 0,
                    len: 5,
                    text: "Howdy".into(),
                },
            )
            .unwrap();
        assert_eq!(out.ops.len(), 2);
        assert_eq!(replica.plain_text(), "Howdy");
    }

    #[test]
    fn test_undo_redo_local_edits() {
        let mut replica = replica(1);
        let mut surface = adapter(&replica);

        surface.handle_input(&mut replica, insert(0, "Hello")).unwrap();
        surface.handle_input(&mut replica, insert(5, " world")).unwrap();
        surface
            .handle_input(
                &mut replica,
                InputEvent::Format {
                    at: 0,
                    len: 5,
                    mark: Mark::Bold,
                    enabled: true,
                },
            )
            .unwrap();
        assert_eq!(replica.materialize(), "<p><strong>Hello</strong> world</p>");

        surface.handle_input(&mut replica, InputEvent::Undo).unwrap();
        assert_eq!(replica.materialize(), "<p>Hello world</p>");
        surface.handle_input(&mut replica, InputEvent::Undo).unwrap();
        assert_eq!(replica.plain_text(), "Hello");
        surface.handle_input(&mut replica, InputEvent::Redo).unwrap();
        assert_eq!(replica.plain_text(), "Hello world");
        assert_eq!(surface.view().content, replica.rich_text());
    }

    #[test]
    fn test_undo_restores_deleted_marks() {
        let mut replica = replica(1);
        replica.initialize("doc", "<p>a<em>bc</em>d</p>").unwrap();
        let mut surface = adapter(&replica);

        surface
            .handle_input(&mut replica, InputEvent::Delete { at: 0, len: 4 })
            .unwrap();
        assert_eq!(replica.plain_text(), "");
        surface.handle_input(&mut replica, InputEvent::Undo).unwrap();
        assert_eq!(replica.materialize(), "<p>a<em>bc</em>d</p>");
    }

    #[test]
    fn test_remote_patch_never_enters_history() {
        let mut a = replica(1);
        let mut b = replica(2);
        let mut surface = adapter(&a);

        surface.handle_input(&mut a, insert(0, "world")).unwrap();
        let remote = b.apply_local_change(Edit::insert(0, ">> ")).op.unwrap();
        a.apply_remote_change(remote).unwrap();
        surface.apply_remote(&a.rich_text());
        assert_eq!(surface.view().content.plain_text(), a.plain_text());

        // Undo removes only the local word, shifted by the remote prefix
        surface.handle_input(&mut a, InputEvent::Undo).unwrap();
        assert_eq!(a.plain_text(), ">> ");
        assert!(!surface.can_undo());
    }

    #[test]
    fn test_undo_keeps_remote_text_inside_local_range() {
        let mut a = replica(1);
        let mut b = replica(2);
        let mut surface = adapter(&a);

        surface.handle_input(&mut a, insert(0, "abcdef")).unwrap();
        b.apply_state_update(&a.encode_state()).unwrap();
        let remote = b.apply_local_change(Edit::insert(3, "X")).op.unwrap();
        a.apply_remote_change(remote).unwrap();
        surface.apply_remote(&a.rich_text());
        assert_eq!(a.plain_text(), "abcXdef");

        surface.handle_input(&mut a, InputEvent::Undo).unwrap();
        assert_eq!(a.plain_text(), "X");
        assert_eq!(surface.view().content, a.rich_text());

        // Redo puts the local text back around it
        surface.handle_input(&mut a, InputEvent::Redo).unwrap();
        assert_eq!(a.plain_text(), "abcXdef");
    }

    #[test]
    fn test_split_range_skips_inserted_text() {
        let patch = ViewPatch {
            start: 3,
            delete: 1,
            insert: vec![Span {
                text: "XY".into(),
                marks: Marks::plain(),
            }],
        };
        assert_eq!(patch.split_range(0, 6), vec![(0, 3), (5, 2)]);
        assert_eq!(patch.split_range(0, 3), vec![(0, 3)]);
        assert_eq!(patch.split_range(4, 2), vec![(5, 2)]);
        assert_eq!(patch.split_range(3, 1), Vec::<(usize, usize)>::new());
    }

    #[test]
    fn test_remote_patch_maps_selection() {
        let mut a = replica(1);
        let mut b = replica(2);
        let mut surface = adapter(&a);
        surface.handle_input(&mut a, insert(0, "abc")).unwrap();
        surface
            .handle_input(&mut a, InputEvent::Select(Some(CursorRange::caret(2))))
            .unwrap();

        b.apply_state_update(&a.encode_state()).unwrap();
        let remote = b.apply_local_change(Edit::insert(0, "xx")).op.unwrap();
        a.apply_remote_change(remote).unwrap();
        surface.apply_remote(&a.rich_text());
        assert_eq!(surface.view().selection, Some(CursorRange::caret(4)));
    }

    #[test]
    fn test_read_only_rejects_edits_but_allows_selection() {
        let mut replica = replica(1);
        let mut surface = adapter(&replica);
        surface.set_read_only(true);
        assert!(!surface.view().editable);

        let err = surface.handle_input(&mut replica, insert(0, "x")).unwrap_err();
        assert!(matches!(err, CollabError::ReadOnly));
        assert!(surface
            .handle_input(&mut replica, InputEvent::Select(Some(CursorRange::caret(0))))
            .is_ok());
        assert_eq!(replica.plain_text(), "");
    }

    #[test]
    fn test_failed_mount_is_view_error() {
        let view = BufferView {
            fail_mount: true,
            ..BufferView::default()
        };
        assert!(matches!(
            SurfaceAdapter::mount(view, RichText::new(), false),
            Err(CollabError::View(_))
        ));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut replica = replica(1);
        let mut surface = adapter(&replica).with_max_history(2);
        for i in 0..5 {
            surface.handle_input(&mut replica, insert(i, "x")).unwrap();
        }
        surface.handle_input(&mut replica, InputEvent::Undo).unwrap();
        surface.handle_input(&mut replica, InputEvent::Undo).unwrap();
        surface.handle_input(&mut replica, InputEvent::Undo).unwrap();
        assert_eq!(replica.plain_text(), "xxx");
    }
}
