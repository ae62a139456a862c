//! Render-target (renderbuffer) lifecycle and reuse.
//!
//! A renderbuffer is an owned render target: window-backed (one logical
//! entry per back buffer the windowing system rotates through),
//! CPU-memory-backed (painted offscreen, then copied into caller memory),
//! or dmabuf-backed. Window entries form an age pool mirroring the back
//! buffer rotation: the entry whose age matches the reported buffer age
//! holds exactly the damage accumulated since that buffer was last
//! painted. Damage is unioned into every non-stale entry each frame,
//! because which entry gets painted is only known at acquire time; it is
//! cleared only on the painted one.
//!
//! Teardown is two-phase: `discard` runs the owner's callback and releases
//! GPU objects but keeps the wrapper queryable as stale; `destroy` removes
//! the wrapper, releasing GPU objects iff `discard` has not already.

use crate::device::{DmabufAttributes, GpuDevice, TargetId};
use crate::error::RenderError;
use crate::format::Format;
use crate::geometry::{Rect, Region};
use bitflags::bitflags;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Window renderbuffer pool depth; matches the deepest back-buffer
/// rotation we track damage history for.
pub const DAMAGE_HISTORY_DEPTH: usize = 4;

bitflags! {
    /// Which output borders need redrawing into this renderbuffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BorderSides: u8 {
        const TOP = 1 << 0;
        const BOTTOM = 1 << 1;
        const LEFT = 1 << 2;
        const RIGHT = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderbufferId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderbufferKind {
    Window,
    CpuBuffer,
    Dmabuf,
}

/// Destination of the CPU copy-back performed after painting a
/// CPU-buffer renderbuffer.
#[derive(Clone)]
pub struct CpuBufferTarget {
    pub format: Format,
    /// Bytes per destination row.
    pub stride: u32,
    pub memory: Arc<Mutex<Vec<u8>>>,
}

impl std::fmt::Debug for CpuBufferTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuBufferTarget")
            .field("format", &self.format)
            .field("stride", &self.stride)
            .finish()
    }
}

type DiscardCallback = Box<dyn FnOnce(RenderbufferId)>;

pub struct Renderbuffer {
    id: RenderbufferId,
    kind: RenderbufferKind,
    /// The GPU target drawn into. Window entries all reference the
    /// output's window target and do not own it.
    target: TargetId,
    owns_target: bool,
    width: u32,
    height: u32,
    damage: Region,
    border_damage: BorderSides,
    /// Frames since this entry was last painted; 0 immediately after
    /// painting, `u32::MAX` for never-painted entries.
    age: u32,
    stale: bool,
    cpu: Option<CpuBufferTarget>,
    on_discard: Option<DiscardCallback>,
}

impl Renderbuffer {
    pub fn id(&self) -> RenderbufferId {
        self.id
    }

    pub fn kind(&self) -> RenderbufferKind {
        self.kind
    }

    pub fn target(&self) -> TargetId {
        self.target
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn damage(&self) -> &Region {
        &self.damage
    }

    pub fn border_damage(&self) -> BorderSides {
        self.border_damage
    }

    pub fn cpu_target(&self) -> Option<&CpuBufferTarget> {
        self.cpu.as_ref()
    }

    fn damage_fully(&mut self) {
        self.damage = Region::from_rect(Rect::new(0, 0, self.width as i32, self.height as i32));
        self.border_damage = BorderSides::all();
    }
}

impl std::fmt::Debug for Renderbuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderbuffer")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("age", &self.age)
            .field("stale", &self.stale)
            .finish()
    }
}

/// All renderbuffers of one output.
pub struct RenderbufferManager {
    entries: Vec<Renderbuffer>,
    next_id: u64,
    depth: usize,
}

impl RenderbufferManager {
    pub fn new() -> Self {
        Self::with_depth(DAMAGE_HISTORY_DEPTH)
    }

    pub fn with_depth(depth: usize) -> Self {
        RenderbufferManager {
            entries: Vec::new(),
            next_id: 1,
            depth: depth.max(1),
        }
    }

    fn alloc_id(&mut self) -> RenderbufferId {
        let id = RenderbufferId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn get(&self, id: RenderbufferId) -> Option<&Renderbuffer> {
        self.entries.iter().find(|rb| rb.id == id)
    }

    fn get_mut(&mut self, id: RenderbufferId) -> Option<&mut Renderbuffer> {
        self.entries.iter_mut().find(|rb| rb.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Selects the window renderbuffer for this frame.
    ///
    /// `age` is the windowing system's reported back-buffer age: 0 means
    /// unknown content (full repaint), K means the buffer was last painted
    /// K frames ago. A live entry with matching age is reused; below the
    /// history depth a new entry is allocated; otherwise the oldest entry
    /// is refurbished with full damage.
    pub fn acquire_window(
        &mut self,
        device: &mut dyn GpuDevice,
        window_target: TargetId,
        width: u32,
        height: u32,
    ) -> RenderbufferId {
        let age = device.buffer_age(window_target);
        if age > 0 {
            if let Some(rb) = self
                .entries
                .iter_mut()
                .find(|rb| !rb.stale && rb.kind == RenderbufferKind::Window && rb.age == age)
            {
                if rb.width != width || rb.height != height {
                    rb.width = width;
                    rb.height = height;
                    rb.damage_fully();
                }
                return rb.id;
            }
        }

        let window_count = self
            .entries
            .iter()
            .filter(|rb| !rb.stale && rb.kind == RenderbufferKind::Window)
            .count();
        if window_count < self.depth {
            let id = self.alloc_id();
            let mut rb = Renderbuffer {
                id,
                kind: RenderbufferKind::Window,
                target: window_target,
                owns_target: false,
                width,
                height,
                damage: Region::new(),
                border_damage: BorderSides::empty(),
                age: u32::MAX,
                stale: false,
                cpu: None,
                on_discard: None,
            };
            rb.damage_fully();
            debug!(?id, age, pool = window_count + 1, "allocated window renderbuffer");
            self.entries.push(rb);
            return id;
        }

        // Pool exhausted: refurbish the entry idle the longest.
        let rb = self
            .entries
            .iter_mut()
            .filter(|rb| !rb.stale && rb.kind == RenderbufferKind::Window)
            .max_by_key(|rb| rb.age)
            .expect("pool depth is at least 1");
        rb.width = width;
        rb.height = height;
        rb.damage_fully();
        debug!(id = ?rb.id, age, "refurbishing oldest window renderbuffer");
        rb.id
    }

    /// Creates a CPU-memory-backed renderbuffer painted through an
    /// offscreen target. The caller's memory and stride are validated
    /// here; the copy-back after each paint relies on them.
    pub fn create_cpu_buffer(
        &mut self,
        device: &mut dyn GpuDevice,
        width: u32,
        height: u32,
        cpu: CpuBufferTarget,
        on_discard: Option<DiscardCallback>,
    ) -> Result<RenderbufferId, RenderError> {
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidParameter(
                "zero-sized cpu renderbuffer".into(),
            ));
        }
        let bpp = crate::format::descriptor(cpu.format).bytes_per_pixel;
        if cpu.stride < width * bpp {
            return Err(RenderError::InvalidParameter(format!(
                "cpu buffer stride {} too small for width {} ({:?})",
                cpu.stride, width, cpu.format
            )));
        }
        let needed = cpu.stride as usize * (height as usize - 1) + (width * bpp) as usize;
        let len = cpu
            .memory
            .lock()
            .map_err(|_| RenderError::InvalidState("poisoned cpu buffer lock".into()))?
            .len();
        if len < needed {
            return Err(RenderError::InvalidParameter(format!(
                "cpu buffer holds {len} bytes, {width}x{height} at stride {} needs {needed}",
                cpu.stride
            )));
        }
        let target = device.create_offscreen_target(width, height, false)?;
        let id = self.alloc_id();
        let mut rb = Renderbuffer {
            id,
            kind: RenderbufferKind::CpuBuffer,
            target,
            owns_target: true,
            width,
            height,
            damage: Region::new(),
            border_damage: BorderSides::empty(),
            age: u32::MAX,
            stale: false,
            cpu: Some(cpu),
            on_discard,
        };
        rb.damage_fully();
        self.entries.push(rb);
        Ok(id)
    }

    /// Creates a renderbuffer drawing directly into caller-owned dmabuf
    /// memory.
    pub fn create_dmabuf(
        &mut self,
        device: &mut dyn GpuDevice,
        attrs: &DmabufAttributes,
        on_discard: Option<DiscardCallback>,
    ) -> Result<RenderbufferId, RenderError> {
        let target = device.create_dmabuf_target(attrs)?;
        let id = self.alloc_id();
        let mut rb = Renderbuffer {
            id,
            kind: RenderbufferKind::Dmabuf,
            target,
            owns_target: true,
            width: attrs.width,
            height: attrs.height,
            damage: Region::new(),
            border_damage: BorderSides::empty(),
            age: u32::MAX,
            stale: false,
            cpu: None,
            on_discard,
        };
        rb.damage_fully();
        self.entries.push(rb);
        Ok(id)
    }

    /// Unions frame damage into every live renderbuffer. Called once per
    /// frame before the painted target is known.
    pub fn add_damage(&mut self, damage: &Region) {
        for rb in self.entries.iter_mut().filter(|rb| !rb.stale) {
            rb.damage.union_with(damage);
        }
    }

    /// Marks every live renderbuffer's borders dirty.
    pub fn damage_borders(&mut self, sides: BorderSides) {
        for rb in self.entries.iter_mut().filter(|rb| !rb.stale) {
            rb.border_damage |= sides;
        }
    }

    /// Clears damage on the painted renderbuffer and resets its age.
    pub fn mark_painted(&mut self, id: RenderbufferId) {
        if let Some(rb) = self.get_mut(id) {
            rb.damage.clear();
            rb.border_damage = BorderSides::empty();
            rb.age = 0;
        }
    }

    /// Advances every live entry's age by one frame. Called after
    /// presentation.
    pub fn end_frame(&mut self) {
        for rb in self.entries.iter_mut().filter(|rb| !rb.stale) {
            rb.age = rb.age.saturating_add(1);
        }
    }

    /// First teardown phase: runs the owner's discard callback, releases
    /// GPU objects, and marks the wrapper stale. The wrapper stays until
    /// [`Self::destroy`].
    pub fn discard(&mut self, device: &mut dyn GpuDevice, id: RenderbufferId) {
        let Some(rb) = self.get_mut(id) else {
            warn!(?id, "discard of unknown renderbuffer");
            return;
        };
        if rb.stale {
            return;
        }
        if let Some(callback) = rb.on_discard.take() {
            callback(id);
        }
        if rb.owns_target {
            let target = rb.target;
            device.destroy_target(target);
        }
        if let Some(rb) = self.get_mut(id) {
            rb.stale = true;
        }
    }

    /// Second teardown phase: removes the wrapper. Releases GPU objects
    /// only if [`Self::discard`] has not run, so they are freed exactly
    /// once.
    pub fn destroy(&mut self, device: &mut dyn GpuDevice, id: RenderbufferId) {
        let Some(pos) = self.entries.iter().position(|rb| rb.id == id) else {
            return;
        };
        let mut rb = self.entries.remove(pos);
        if !rb.stale {
            if let Some(callback) = rb.on_discard.take() {
                callback(id);
            }
            if rb.owns_target {
                device.destroy_target(rb.target);
            }
        }
    }

    /// Discards every entry. Output teardown.
    pub fn discard_all(&mut self, device: &mut dyn GpuDevice) {
        let ids: Vec<RenderbufferId> = self.entries.iter().map(|rb| rb.id).collect();
        for id in ids {
            self.discard(device, id);
        }
    }
}

impl Default for RenderbufferManager {
    fn default() -> Self {
        Self::new()
    }
}
