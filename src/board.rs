//! Replicated board document model.
//!
//! One [`BoardDocument`] holds the full CRDT state of a board inside a
//! `yrs::Doc` with four root containers:
//!
//! ```text
//! Doc
//! ├── "stickies"  Map<id, Map>   one nested map per sticky note
//! │                              ("text" field is a sequence-CRDT Text)
//! ├── "shapes"    Map<id, Map>   one nested map per shape
//! ├── "layers"    Array<id>      paint order, back to front
//! └── "meta"      Map            board settings, LWW per field
//! ```
//!
//! Mutations go through [`BoardDocument::apply_op`], which runs one yrs
//! transaction and returns the encoded delta for that transaction. Remote
//! deltas merge through [`BoardDocument::merge_remote_delta`]. Merge order
//! and duplication never change the converged state; operations that name a
//! vanished id (the other side deleted it concurrently) are silent no-ops.
//!
//! Scalar fields resolve last-writer-wins per key. Sticky note bodies are
//! yrs text, so concurrent character edits interleave instead of clobbering
//! each other.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayRef, Doc, GetString, Map, MapPrelim, MapRef, Out, ReadTxn, StateVector, Text,
    TextPrelim, Transact, Update,
};

/// Canonical sticky note palette.
pub const STICKY_PALETTE: [&str; 8] = [
    "#ffff00", "#ff6b6b", "#4ecdc4", "#45b7d1", "#96ceb4", "#feca57", "#ff9ff3", "#54a0ff",
];

/// Size a freshly created sticky gets when the caller does not say otherwise.
pub const DEFAULT_STICKY_SIZE: (f64, f64) = (200.0, 150.0);
/// Default shape size.
pub const DEFAULT_SHAPE_SIZE: (f64, f64) = (100.0, 100.0);

const DEFAULT_BACKGROUND: &str = "#f5f5f5";
const DEFAULT_GRID_COLOR: &str = "#e0e0e0";

// ───────────────────────────────────────────────────────────────────
// Materialized records
// ───────────────────────────────────────────────────────────────────

/// Plain snapshot of one sticky note, read out of the CRDT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StickyNote {
    pub id: String,
    pub text: String,
    pub color: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub rotation: f64,
    pub z_index: i64,
    pub created_by: String,
    /// Milliseconds since the Unix epoch
    pub created_at: i64,
    pub updated_at: i64,
}

impl StickyNote {
    /// Fresh sticky with a random id and the default look.
    pub fn new(created_by: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4().to_string(),
            text: String::new(),
            color: STICKY_PALETTE[0].to_string(),
            x: 0.0,
            y: 0.0,
            width: DEFAULT_STICKY_SIZE.0,
            height: DEFAULT_STICKY_SIZE.1,
            rotation: 0.0,
            z_index: 0,
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Fields shared by every shape variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeBase {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub rotation: f64,
    pub z_index: i64,
    pub created_by: String,
}

impl ShapeBase {
    pub fn new(created_by: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            x: 0.0,
            y: 0.0,
            width: DEFAULT_SHAPE_SIZE.0,
            height: DEFAULT_SHAPE_SIZE.1,
            rotation: 0.0,
            z_index: 0,
            created_by: created_by.into(),
        }
    }
}

/// Closed set of shape variants. The variant tag is fixed at creation;
/// no operation can change a rectangle into a circle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Shape {
    Rectangle {
        base: ShapeBase,
        fill: String,
        stroke: String,
        stroke_width: f64,
    },
    Circle {
        base: ShapeBase,
        fill: String,
        stroke: String,
        stroke_width: f64,
    },
    Text {
        base: ShapeBase,
        text: String,
        font_size: f64,
        font_family: String,
        fill: String,
    },
}

impl Shape {
    pub fn base(&self) -> &ShapeBase {
        match self {
            Shape::Rectangle { base, .. } | Shape::Circle { base, .. } | Shape::Text { base, .. } => {
                base
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.base().id
    }

    fn kind(&self) -> &'static str {
        match self {
            Shape::Rectangle { .. } => "rectangle",
            Shape::Circle { .. } => "circle",
            Shape::Text { .. } => "text",
        }
    }
}

/// Board-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardMeta {
    pub title: String,
    pub background: String,
    pub grid: GridConfig,
    pub zoom: ZoomConfig,
    pub pan: PanOffset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    pub enabled: bool,
    pub size: f64,
    pub color: String,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            size: 20.0,
            color: DEFAULT_GRID_COLOR.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoomConfig {
    pub level: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for ZoomConfig {
    fn default() -> Self {
        Self {
            level: 1.0,
            min: 0.1,
            max: 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PanOffset {
    pub x: f64,
    pub y: f64,
}

// ───────────────────────────────────────────────────────────────────
// Operations
// ───────────────────────────────────────────────────────────────────

/// Field-level patch for a sticky note. `None` leaves the field alone, so
/// concurrent patches to different fields merge independently.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StickyPatch {
    pub color: Option<String>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub rotation: Option<f64>,
    pub z_index: Option<i64>,
}

/// Field-level patch for a shape. Style fields that do not belong to the
/// target's variant are ignored (patching `font_size` on a rectangle does
/// nothing).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShapePatch {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub rotation: Option<f64>,
    pub z_index: Option<i64>,
    pub fill: Option<String>,
    pub stroke: Option<String>,
    pub stroke_width: Option<f64>,
    pub text: Option<String>,
    pub font_size: Option<f64>,
    pub font_family: Option<String>,
}

/// Patch for board settings. Grid/zoom/pan replace as whole units.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaPatch {
    pub title: Option<String>,
    pub background: Option<String>,
    pub grid: Option<GridConfig>,
    pub zoom: Option<ZoomConfig>,
    pub pan: Option<PanOffset>,
}

/// Every mutation the board model supports.
///
/// Carrying full records in the create variants makes each op invertible:
/// undo of a delete is a create with the captured record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BoardOp {
    CreateSticky(StickyNote),
    UpdateSticky { id: String, patch: StickyPatch },
    /// Replace the whole text body (single-field edits from a form input)
    SetStickyText { id: String, text: String },
    /// Character-level insert into the text body
    InsertStickyText { id: String, pos: u32, text: String },
    /// Character-level delete from the text body
    DeleteStickyText { id: String, pos: u32, len: u32 },
    DeleteSticky { id: String },
    CreateShape(Shape),
    UpdateShape { id: String, patch: ShapePatch },
    DeleteShape { id: String },
    MoveToFront { id: String },
    MoveToBack { id: String },
    MoveForward { id: String },
    MoveBackward { id: String },
    SetMeta(MetaPatch),
}

/// Who produced the update handed to an update handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    Local,
    Remote,
}

type UpdateHandler = Box<dyn FnMut(&[u8], UpdateOrigin) + Send>;

/// Document model errors.
#[derive(Debug, Clone)]
pub enum BoardError {
    /// Incoming bytes are not a decodable update/state vector
    MalformedUpdate(String),
    /// Update decoded but could not be integrated
    MergeFailed(String),
}

impl From<yrs::encoding::read::Error> for BoardError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        BoardError::MalformedUpdate(e.to_string())
    }
}

impl std::fmt::Display for BoardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedUpdate(e) => write!(f, "malformed update: {e}"),
            Self::MergeFailed(e) => write!(f, "merge failed: {e}"),
        }
    }
}

impl std::error::Error for BoardError {}

// ───────────────────────────────────────────────────────────────────
// BoardDocument
// ───────────────────────────────────────────────────────────────────

/// One board's replicated document.
pub struct BoardDocument {
    board_id: Uuid,
    doc: Doc,
    stickies: MapRef,
    shapes: MapRef,
    layers: ArrayRef,
    meta: MapRef,
    handler: Option<UpdateHandler>,
}

impl BoardDocument {
    /// Empty document for a board. Containers exist immediately; `meta`
    /// stays unpopulated until [`BoardDocument::init_meta`].
    pub fn new(board_id: Uuid) -> Self {
        let doc = Doc::new();
        let stickies = doc.get_or_insert_map("stickies");
        let shapes = doc.get_or_insert_map("shapes");
        let layers = doc.get_or_insert_array("layers");
        let meta = doc.get_or_insert_map("meta");
        Self {
            board_id,
            doc,
            stickies,
            shapes,
            layers,
            meta,
            handler: None,
        }
    }

    /// Document restored from a full-state encoding (e.g. a snapshot).
    pub fn from_full_state(board_id: Uuid, state: &[u8]) -> Result<Self, BoardError> {
        let mut doc = Self::new(board_id);
        doc.decode_full_state(state)?;
        Ok(doc)
    }

    pub fn board_id(&self) -> Uuid {
        self.board_id
    }

    /// Register the update handler. It runs synchronously after every
    /// transaction that changed the document, local or merged, with the
    /// encoded delta. Replaces any previous handler.
    pub fn on_update(&mut self, handler: impl FnMut(&[u8], UpdateOrigin) + Send + 'static) {
        self.handler = Some(Box::new(handler));
    }

    pub fn clear_update_handler(&mut self) {
        self.handler = None;
    }

    fn notify(&mut self, delta: &[u8], origin: UpdateOrigin) {
        if delta.is_empty() {
            return;
        }
        if let Some(handler) = self.handler.as_mut() {
            handler(delta, origin);
        }
    }

    // ─── Sync surface ────────────────────────────────────────────

    /// Apply one local operation. Returns the encoded delta for exactly
    /// this transaction — empty when the op was a no-op (missing id,
    /// nothing to change), in which case there is nothing to broadcast.
    pub fn apply_op(&mut self, op: &BoardOp) -> Result<Vec<u8>, BoardError> {
        let delta = {
            let mut txn = self.doc.transact_mut();
            let changed = match op {
                BoardOp::CreateSticky(sticky) => self.create_sticky_in(&mut txn, sticky),
                BoardOp::UpdateSticky { id, patch } => self.update_sticky_in(&mut txn, id, patch),
                BoardOp::SetStickyText { id, text } => self.set_sticky_text_in(&mut txn, id, text),
                BoardOp::InsertStickyText { id, pos, text } => {
                    self.splice_sticky_text_in(&mut txn, id, *pos, 0, text)
                }
                BoardOp::DeleteStickyText { id, pos, len } => {
                    self.splice_sticky_text_in(&mut txn, id, *pos, *len, "")
                }
                BoardOp::DeleteSticky { id } => self.delete_entry_in(&mut txn, id, Container::Stickies),
                BoardOp::CreateShape(shape) => self.create_shape_in(&mut txn, shape),
                BoardOp::UpdateShape { id, patch } => self.update_shape_in(&mut txn, id, patch),
                BoardOp::DeleteShape { id } => self.delete_entry_in(&mut txn, id, Container::Shapes),
                BoardOp::MoveToFront { id } => self.reorder_in(&mut txn, id, Reorder::Front),
                BoardOp::MoveToBack { id } => self.reorder_in(&mut txn, id, Reorder::Back),
                BoardOp::MoveForward { id } => self.reorder_in(&mut txn, id, Reorder::Forward),
                BoardOp::MoveBackward { id } => self.reorder_in(&mut txn, id, Reorder::Backward),
                BoardOp::SetMeta(patch) => self.set_meta_in(&mut txn, patch),
            };
            if !changed {
                return Ok(Vec::new());
            }
            txn.encode_update_v1()
        };
        self.notify(&delta, UpdateOrigin::Local);
        Ok(delta)
    }

    /// Merge a delta produced by another replica. Idempotent: merging the
    /// same delta again leaves the document unchanged.
    pub fn merge_remote_delta(&mut self, delta: &[u8]) -> Result<(), BoardError> {
        {
            let update = Update::decode_v1(delta)?;
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| BoardError::MergeFailed(e.to_string()))?;
        }
        self.notify(delta, UpdateOrigin::Remote);
        Ok(())
    }

    /// Encode the complete document state.
    pub fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Reset this replica to the given full state. Later merges apply on
    /// top as usual. The update handler is kept but not invoked — this is
    /// a reset, not an edit.
    pub fn decode_full_state(&mut self, state: &[u8]) -> Result<(), BoardError> {
        let doc = Doc::new();
        {
            let update = Update::decode_v1(state)?;
            let mut txn = doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| BoardError::MergeFailed(e.to_string()))?;
        }
        self.stickies = doc.get_or_insert_map("stickies");
        self.shapes = doc.get_or_insert_map("shapes");
        self.layers = doc.get_or_insert_array("layers");
        self.meta = doc.get_or_insert_map("meta");
        self.doc = doc;
        Ok(())
    }

    /// This replica's state vector, for requesting a catch-up diff.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything the replica behind `state_vector` is missing.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, BoardError> {
        let sv = StateVector::decode_v1(state_vector)?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    // ─── Meta ────────────────────────────────────────────────────

    /// Populate board settings if nobody has yet. The title only lands on
    /// first initialization; once the replicated value exists it is
    /// authoritative and later callers' defaults are ignored.
    pub fn init_meta(&mut self, title: &str) -> Result<Vec<u8>, BoardError> {
        let delta = {
            let mut txn = self.doc.transact_mut();
            if self.meta.get(&txn, "title").is_some() {
                return Ok(Vec::new());
            }
            self.meta.insert(&mut txn, "title", title);
            self.meta.insert(&mut txn, "background", DEFAULT_BACKGROUND);
            write_grid(&self.meta, &mut txn, &GridConfig::default());
            write_zoom(&self.meta, &mut txn, &ZoomConfig::default());
            write_pan(&self.meta, &mut txn, &PanOffset::default());
            txn.encode_update_v1()
        };
        self.notify(&delta, UpdateOrigin::Local);
        Ok(delta)
    }

    fn set_meta_in(&self, txn: &mut yrs::TransactionMut<'_>, patch: &MetaPatch) -> bool {
        let mut changed = false;
        if let Some(title) = &patch.title {
            self.meta.insert(txn, "title", title.as_str());
            changed = true;
        }
        if let Some(background) = &patch.background {
            self.meta.insert(txn, "background", background.as_str());
            changed = true;
        }
        if let Some(grid) = &patch.grid {
            write_grid(&self.meta, txn, grid);
            changed = true;
        }
        if let Some(zoom) = &patch.zoom {
            write_zoom(&self.meta, txn, zoom);
            changed = true;
        }
        if let Some(pan) = &patch.pan {
            write_pan(&self.meta, txn, pan);
            changed = true;
        }
        changed
    }

    // ─── Mutation internals (one yrs txn each) ───────────────────

    fn create_sticky_in(&self, txn: &mut yrs::TransactionMut<'_>, sticky: &StickyNote) -> bool {
        if self.stickies.get(txn, &sticky.id).is_some() {
            return false;
        }
        let entry = self.stickies.insert(txn, sticky.id.clone(), MapPrelim::default());
        entry.insert(txn, "id", sticky.id.as_str());
        entry.insert(txn, "color", sticky.color.as_str());
        entry.insert(txn, "x", sticky.x);
        entry.insert(txn, "y", sticky.y);
        entry.insert(txn, "width", sticky.width);
        entry.insert(txn, "height", sticky.height);
        entry.insert(txn, "rotation", sticky.rotation);
        entry.insert(txn, "z_index", sticky.z_index);
        entry.insert(txn, "created_by", sticky.created_by.as_str());
        entry.insert(txn, "created_at", sticky.created_at);
        entry.insert(txn, "updated_at", sticky.updated_at);
        entry.insert(txn, "text", TextPrelim::new(sticky.text.as_str()));
        self.layers.insert(txn, self.layers.len(txn), sticky.id.as_str());
        true
    }

    fn update_sticky_in(&self, txn: &mut yrs::TransactionMut<'_>, id: &str, patch: &StickyPatch) -> bool {
        let Some(Out::YMap(entry)) = self.stickies.get(txn, id) else {
            return false;
        };
        let mut changed = false;
        if let Some(color) = &patch.color {
            entry.insert(txn, "color", color.as_str());
            changed = true;
        }
        if let Some(x) = patch.x {
            entry.insert(txn, "x", x);
            changed = true;
        }
        if let Some(y) = patch.y {
            entry.insert(txn, "y", y);
            changed = true;
        }
        if let Some(width) = patch.width {
            entry.insert(txn, "width", width);
            changed = true;
        }
        if let Some(height) = patch.height {
            entry.insert(txn, "height", height);
            changed = true;
        }
        if let Some(rotation) = patch.rotation {
            entry.insert(txn, "rotation", rotation);
            changed = true;
        }
        if let Some(z_index) = patch.z_index {
            entry.insert(txn, "z_index", z_index);
            changed = true;
        }
        if changed {
            entry.insert(txn, "updated_at", now_ms());
        }
        changed
    }

    fn set_sticky_text_in(&self, txn: &mut yrs::TransactionMut<'_>, id: &str, text: &str) -> bool {
        let Some(body) = self.sticky_text_in(txn, id) else {
            return false;
        };
        let len = body.len(txn);
        if len > 0 {
            body.remove_range(txn, 0, len);
        }
        if !text.is_empty() {
            body.insert(txn, 0, text);
        }
        self.touch_sticky(txn, id);
        true
    }

    /// Insert and/or delete at a position. Out-of-range positions clamp
    /// instead of failing: a concurrent remote edit may have shortened
    /// the text since the caller looked at it.
    fn splice_sticky_text_in(
        &self,
        txn: &mut yrs::TransactionMut<'_>,
        id: &str,
        pos: u32,
        del: u32,
        insert: &str,
    ) -> bool {
        let Some(body) = self.sticky_text_in(txn, id) else {
            return false;
        };
        let len = body.len(txn);
        let pos = pos.min(len);
        let del = del.min(len - pos);
        if del == 0 && insert.is_empty() {
            return false;
        }
        if del > 0 {
            body.remove_range(txn, pos, del);
        }
        if !insert.is_empty() {
            body.insert(txn, pos, insert);
        }
        self.touch_sticky(txn, id);
        true
    }

    fn sticky_text_in(&self, txn: &yrs::TransactionMut<'_>, id: &str) -> Option<yrs::TextRef> {
        let Out::YMap(entry) = self.stickies.get(txn, id)? else {
            return None;
        };
        match entry.get(txn, "text") {
            Some(Out::YText(body)) => Some(body),
            _ => None,
        }
    }

    fn touch_sticky(&self, txn: &mut yrs::TransactionMut<'_>, id: &str) {
        if let Some(Out::YMap(entry)) = self.stickies.get(txn, id) {
            entry.insert(txn, "updated_at", now_ms());
        }
    }

    fn create_shape_in(&self, txn: &mut yrs::TransactionMut<'_>, shape: &Shape) -> bool {
        let base = shape.base();
        if self.shapes.get(txn, &base.id).is_some() {
            return false;
        }
        let entry = self.shapes.insert(txn, base.id.clone(), MapPrelim::default());
        entry.insert(txn, "id", base.id.as_str());
        entry.insert(txn, "kind", shape.kind());
        entry.insert(txn, "x", base.x);
        entry.insert(txn, "y", base.y);
        entry.insert(txn, "width", base.width);
        entry.insert(txn, "height", base.height);
        entry.insert(txn, "rotation", base.rotation);
        entry.insert(txn, "z_index", base.z_index);
        entry.insert(txn, "created_by", base.created_by.as_str());
        match shape {
            Shape::Rectangle { fill, stroke, stroke_width, .. }
            | Shape::Circle { fill, stroke, stroke_width, .. } => {
                entry.insert(txn, "fill", fill.as_str());
                entry.insert(txn, "stroke", stroke.as_str());
                entry.insert(txn, "stroke_width", *stroke_width);
            }
            Shape::Text { text, font_size, font_family, fill, .. } => {
                entry.insert(txn, "text", text.as_str());
                entry.insert(txn, "font_size", *font_size);
                entry.insert(txn, "font_family", font_family.as_str());
                entry.insert(txn, "fill", fill.as_str());
            }
        }
        self.layers.insert(txn, self.layers.len(txn), base.id.as_str());
        true
    }

    fn update_shape_in(&self, txn: &mut yrs::TransactionMut<'_>, id: &str, patch: &ShapePatch) -> bool {
        let Some(Out::YMap(entry)) = self.shapes.get(txn, id) else {
            return false;
        };
        let kind = read_str(&entry, txn, "kind");
        let mut changed = false;
        if let Some(x) = patch.x {
            entry.insert(txn, "x", x);
            changed = true;
        }
        if let Some(y) = patch.y {
            entry.insert(txn, "y", y);
            changed = true;
        }
        if let Some(width) = patch.width {
            entry.insert(txn, "width", width);
            changed = true;
        }
        if let Some(height) = patch.height {
            entry.insert(txn, "height", height);
            changed = true;
        }
        if let Some(rotation) = patch.rotation {
            entry.insert(txn, "rotation", rotation);
            changed = true;
        }
        if let Some(z_index) = patch.z_index {
            entry.insert(txn, "z_index", z_index);
            changed = true;
        }
        // Style fields are variant-specific; the tag decides what applies
        match kind.as_deref() {
            Some("rectangle") | Some("circle") => {
                if let Some(fill) = &patch.fill {
                    entry.insert(txn, "fill", fill.as_str());
                    changed = true;
                }
                if let Some(stroke) = &patch.stroke {
                    entry.insert(txn, "stroke", stroke.as_str());
                    changed = true;
                }
                if let Some(stroke_width) = patch.stroke_width {
                    entry.insert(txn, "stroke_width", stroke_width);
                    changed = true;
                }
            }
            Some("text") => {
                if let Some(text) = &patch.text {
                    entry.insert(txn, "text", text.as_str());
                    changed = true;
                }
                if let Some(font_size) = patch.font_size {
                    entry.insert(txn, "font_size", font_size);
                    changed = true;
                }
                if let Some(font_family) = &patch.font_family {
                    entry.insert(txn, "font_family", font_family.as_str());
                    changed = true;
                }
                if let Some(fill) = &patch.fill {
                    entry.insert(txn, "fill", fill.as_str());
                    changed = true;
                }
            }
            _ => {}
        }
        changed
    }

    fn delete_entry_in(&self, txn: &mut yrs::TransactionMut<'_>, id: &str, container: Container) -> bool {
        let map = match container {
            Container::Stickies => &self.stickies,
            Container::Shapes => &self.shapes,
        };
        if map.get(txn, id).is_none() {
            return false;
        }
        map.remove(txn, id);
        self.remove_layer_occurrences(txn, id);
        true
    }

    fn reorder_in(&self, txn: &mut yrs::TransactionMut<'_>, id: &str, mode: Reorder) -> bool {
        let order = layer_ids(&self.layers, txn);
        let occurrences = order.iter().filter(|entry| *entry == id).count();
        let Some(pos) = order.iter().position(|entry| entry == id) else {
            return false;
        };
        let last = order.len() - 1;
        let target = match mode {
            Reorder::Front => last,
            Reorder::Back => 0,
            Reorder::Forward => (pos + 1).min(last),
            Reorder::Backward => pos.saturating_sub(1),
        };
        if occurrences == 1 && target == pos {
            // Already in place and nothing to heal; must not touch the
            // array, or peers would see a delta-less mutation
            return false;
        }
        // Removing every occurrence heals duplicates a concurrent reorder
        // may have left behind, then reinserts exactly once
        self.remove_layer_occurrences(txn, id);
        let len = self.layers.len(txn);
        self.layers.insert(txn, (target as u32).min(len), id);
        true
    }

    fn remove_layer_occurrences(&self, txn: &mut yrs::TransactionMut<'_>, id: &str) -> usize {
        let mut removed = 0;
        loop {
            let order = layer_ids(&self.layers, txn);
            let Some(pos) = order.iter().position(|entry| entry == id) else {
                break;
            };
            self.layers.remove_range(txn, pos as u32, 1);
            removed += 1;
        }
        removed
    }

    // ─── Read surface ────────────────────────────────────────────

    /// Materialize one sticky, or `None` if it does not exist.
    pub fn sticky(&self, id: &str) -> Option<StickyNote> {
        let txn = self.doc.transact();
        let Out::YMap(entry) = self.stickies.get(&txn, id)? else {
            return None;
        };
        read_sticky(&entry, &txn)
    }

    /// All stickies, keyed by id.
    pub fn stickies(&self) -> HashMap<String, StickyNote> {
        let txn = self.doc.transact();
        let mut out = HashMap::new();
        let ids: Vec<String> = self.stickies.keys(&txn).map(|k| k.to_string()).collect();
        for id in ids {
            if let Some(Out::YMap(entry)) = self.stickies.get(&txn, &id) {
                if let Some(sticky) = read_sticky(&entry, &txn) {
                    out.insert(id, sticky);
                }
            }
        }
        out
    }

    /// The current text body of a sticky.
    pub fn sticky_text(&self, id: &str) -> Option<String> {
        let txn = self.doc.transact();
        let Out::YMap(entry) = self.stickies.get(&txn, id)? else {
            return None;
        };
        match entry.get(&txn, "text") {
            Some(Out::YText(body)) => Some(body.get_string(&txn)),
            _ => None,
        }
    }

    /// Materialize one shape.
    pub fn shape(&self, id: &str) -> Option<Shape> {
        let txn = self.doc.transact();
        let Out::YMap(entry) = self.shapes.get(&txn, id)? else {
            return None;
        };
        read_shape(&entry, &txn)
    }

    /// All shapes, keyed by id.
    pub fn shapes(&self) -> HashMap<String, Shape> {
        let txn = self.doc.transact();
        let mut out = HashMap::new();
        let ids: Vec<String> = self.shapes.keys(&txn).map(|k| k.to_string()).collect();
        for id in ids {
            if let Some(Out::YMap(entry)) = self.shapes.get(&txn, &id) {
                if let Some(shape) = read_shape(&entry, &txn) {
                    out.insert(id, shape);
                }
            }
        }
        out
    }

    /// Paint order, back to front.
    pub fn layer_order(&self) -> Vec<String> {
        let txn = self.doc.transact();
        layer_ids(&self.layers, &txn)
    }

    /// Board settings, or `None` before [`BoardDocument::init_meta`].
    pub fn meta(&self) -> Option<BoardMeta> {
        let txn = self.doc.transact();
        let title = read_str(&self.meta, &txn, "title")?;
        Some(BoardMeta {
            title,
            background: read_str(&self.meta, &txn, "background")
                .unwrap_or_else(|| DEFAULT_BACKGROUND.to_string()),
            grid: read_grid(&self.meta, &txn),
            zoom: read_zoom(&self.meta, &txn),
            pan: read_pan(&self.meta, &txn),
        })
    }
}

impl std::fmt::Debug for BoardDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoardDocument")
            .field("board_id", &self.board_id)
            .finish_non_exhaustive()
    }
}

enum Container {
    Stickies,
    Shapes,
}

enum Reorder {
    Front,
    Back,
    Forward,
    Backward,
}

// ───────────────────────────────────────────────────────────────────
// yrs value plumbing
// ───────────────────────────────────────────────────────────────────

fn layer_ids<T: ReadTxn>(layers: &ArrayRef, txn: &T) -> Vec<String> {
    layers
        .iter(txn)
        .filter_map(|item| match item {
            Out::Any(Any::String(s)) => Some(s.to_string()),
            _ => None,
        })
        .collect()
}

fn read_str<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> Option<String> {
    match map.get(txn, key) {
        Some(Out::Any(Any::String(s))) => Some(s.to_string()),
        _ => None,
    }
}

fn read_f64<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> Option<f64> {
    match map.get(txn, key) {
        Some(Out::Any(Any::Number(n))) => Some(n),
        Some(Out::Any(Any::BigInt(n))) => Some(n as f64),
        _ => None,
    }
}

fn read_i64<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> Option<i64> {
    match map.get(txn, key) {
        Some(Out::Any(Any::BigInt(n))) => Some(n),
        Some(Out::Any(Any::Number(n))) => Some(n as i64),
        _ => None,
    }
}

fn read_bool<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> Option<bool> {
    match map.get(txn, key) {
        Some(Out::Any(Any::Bool(b))) => Some(b),
        _ => None,
    }
}

fn read_sticky<T: ReadTxn>(entry: &MapRef, txn: &T) -> Option<StickyNote> {
    let text = match entry.get(txn, "text") {
        Some(Out::YText(body)) => body.get_string(txn),
        _ => String::new(),
    };
    Some(StickyNote {
        id: read_str(entry, txn, "id")?,
        text,
        color: read_str(entry, txn, "color").unwrap_or_else(|| STICKY_PALETTE[0].to_string()),
        x: read_f64(entry, txn, "x").unwrap_or(0.0),
        y: read_f64(entry, txn, "y").unwrap_or(0.0),
        width: read_f64(entry, txn, "width").unwrap_or(DEFAULT_STICKY_SIZE.0),
        height: read_f64(entry, txn, "height").unwrap_or(DEFAULT_STICKY_SIZE.1),
        rotation: read_f64(entry, txn, "rotation").unwrap_or(0.0),
        z_index: read_i64(entry, txn, "z_index").unwrap_or(0),
        created_by: read_str(entry, txn, "created_by").unwrap_or_default(),
        created_at: read_i64(entry, txn, "created_at").unwrap_or(0),
        updated_at: read_i64(entry, txn, "updated_at").unwrap_or(0),
    })
}

fn read_shape<T: ReadTxn>(entry: &MapRef, txn: &T) -> Option<Shape> {
    let base = ShapeBase {
        id: read_str(entry, txn, "id")?,
        x: read_f64(entry, txn, "x").unwrap_or(0.0),
        y: read_f64(entry, txn, "y").unwrap_or(0.0),
        width: read_f64(entry, txn, "width").unwrap_or(DEFAULT_SHAPE_SIZE.0),
        height: read_f64(entry, txn, "height").unwrap_or(DEFAULT_SHAPE_SIZE.1),
        rotation: read_f64(entry, txn, "rotation").unwrap_or(0.0),
        z_index: read_i64(entry, txn, "z_index").unwrap_or(0),
        created_by: read_str(entry, txn, "created_by").unwrap_or_default(),
    };
    let fill = read_str(entry, txn, "fill").unwrap_or_default();
    match read_str(entry, txn, "kind")?.as_str() {
        "rectangle" => Some(Shape::Rectangle {
            base,
            fill,
            stroke: read_str(entry, txn, "stroke").unwrap_or_default(),
            stroke_width: read_f64(entry, txn, "stroke_width").unwrap_or(1.0),
        }),
        "circle" => Some(Shape::Circle {
            base,
            fill,
            stroke: read_str(entry, txn, "stroke").unwrap_or_default(),
            stroke_width: read_f64(entry, txn, "stroke_width").unwrap_or(1.0),
        }),
        "text" => Some(Shape::Text {
            base,
            text: read_str(entry, txn, "text").unwrap_or_default(),
            font_size: read_f64(entry, txn, "font_size").unwrap_or(16.0),
            font_family: read_str(entry, txn, "font_family")
                .unwrap_or_else(|| "sans-serif".to_string()),
            fill,
        }),
        _ => None,
    }
}

fn write_grid(meta: &MapRef, txn: &mut yrs::TransactionMut<'_>, grid: &GridConfig) {
    meta.insert(txn, "grid_enabled", grid.enabled);
    meta.insert(txn, "grid_size", grid.size);
    meta.insert(txn, "grid_color", grid.color.as_str());
}

fn read_grid<T: ReadTxn>(meta: &MapRef, txn: &T) -> GridConfig {
    let defaults = GridConfig::default();
    GridConfig {
        enabled: read_bool(meta, txn, "grid_enabled").unwrap_or(defaults.enabled),
        size: read_f64(meta, txn, "grid_size").unwrap_or(defaults.size),
        color: read_str(meta, txn, "grid_color").unwrap_or(defaults.color),
    }
}

fn write_zoom(meta: &MapRef, txn: &mut yrs::TransactionMut<'_>, zoom: &ZoomConfig) {
    meta.insert(txn, "zoom_level", zoom.level);
    meta.insert(txn, "zoom_min", zoom.min);
    meta.insert(txn, "zoom_max", zoom.max);
}

fn read_zoom<T: ReadTxn>(meta: &MapRef, txn: &T) -> ZoomConfig {
    let defaults = ZoomConfig::default();
    ZoomConfig {
        level: read_f64(meta, txn, "zoom_level").unwrap_or(defaults.level),
        min: read_f64(meta, txn, "zoom_min").unwrap_or(defaults.min),
        max: read_f64(meta, txn, "zoom_max").unwrap_or(defaults.max),
    }
}

fn write_pan(meta: &MapRef, txn: &mut yrs::TransactionMut<'_>, pan: &PanOffset) {
    meta.insert(txn, "pan_x", pan.x);
    meta.insert(txn, "pan_y", pan.y);
}

fn read_pan<T: ReadTxn>(meta: &MapRef, txn: &T) -> PanOffset {
    PanOffset {
        x: read_f64(meta, txn, "pan_x").unwrap_or(0.0),
        y: read_f64(meta, txn, "pan_y").unwrap_or(0.0),
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
