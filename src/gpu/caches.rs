//! Composite-object caches. Driver-side aggregates (vertex-layout bindings,
//! attachment sets) are expensive to create, so they are memoized by full
//! structural identity and live until the owning native context is purged.

use std::collections::HashMap;

use smallvec::SmallVec;

use super::driver::types::{ContextKey, NativeObject};
use super::driver::Driver;
use super::structs::{Buffer, Extent, GraphicsPipeline, ImageView, MAX_RENDER_TARGETS, MAX_VERTEX_STREAMS};
use crate::utils::Handle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub buffer: Handle<Buffer>,
    pub offset: u64,
    pub stride: u32,
}

/// Structural identity of a vertex-layout binding: the pipeline supplies
/// the attribute layout, the streams supply buffer/stride/offset per slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexBindingKey {
    pub pipeline: Option<Handle<GraphicsPipeline>>,
    pub streams: SmallVec<[StreamKey; MAX_VERTEX_STREAMS]>,
    pub index_buffer: Option<(Handle<Buffer>, u64)>,
}

impl VertexBindingKey {
    /// Key of the shared empty binding, used when a pipeline consumes no
    /// vertex input (e.g. only the vertex index).
    pub fn empty() -> Self {
        Self {
            pipeline: None,
            streams: SmallVec::new(),
            index_buffer: None,
        }
    }
}

/// Structural identity of an attachment set: ordered view identities and
/// dimensions, or just dimensions for attachment-less rendering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AttachmentSetKey {
    Targets {
        colors: SmallVec<[Option<ImageView>; MAX_RENDER_TARGETS]>,
        depth: Option<ImageView>,
        extent: Extent,
    },
    Sized {
        extent: Extent,
        samples: u32,
    },
}

/// Caches for one native context. Composite handles cannot outlive the
/// context that created them, so every entry dies together on purge.
/// Access is lock-free: only one native context is current per thread.
#[derive(Default)]
pub struct ContextCaches {
    vertex_bindings: HashMap<VertexBindingKey, NativeObject>,
    attachment_sets: HashMap<AttachmentSetKey, NativeObject>,
}

impl ContextCaches {
    pub fn vertex_binding<D: Driver>(
        &mut self,
        driver: &mut D,
        key: &VertexBindingKey,
    ) -> NativeObject {
        if let Some(obj) = self.vertex_bindings.get(key) {
            return *obj;
        }
        let obj = driver.create_vertex_binding(key);
        self.vertex_bindings.insert(key.clone(), obj);
        obj
    }

    pub fn attachment_set<D: Driver>(
        &mut self,
        driver: &mut D,
        key: &AttachmentSetKey,
    ) -> NativeObject {
        if let Some(obj) = self.attachment_sets.get(key) {
            return *obj;
        }
        let obj = driver.create_attachment_set(key);
        self.attachment_sets.insert(key.clone(), obj);
        obj
    }

    pub fn vertex_binding_count(&self) -> usize {
        self.vertex_bindings.len()
    }

    pub fn attachment_set_count(&self) -> usize {
        self.attachment_sets.len()
    }
}

/// Device-owned map of per-context caches, keyed by the native context the
/// composites are bound to.
#[derive(Default)]
pub struct DeviceCaches {
    per_context: HashMap<ContextKey, ContextCaches>,
}

impl DeviceCaches {
    pub fn context(&mut self, key: ContextKey) -> &mut ContextCaches {
        self.per_context.entry(key).or_default()
    }

    pub fn context_ref(&self, key: ContextKey) -> Option<&ContextCaches> {
        self.per_context.get(&key)
    }

    /// Drop every composite created on `key`. Called on context loss or
    /// teardown; the native objects are already gone with the context.
    pub fn purge(&mut self, key: ContextKey) {
        self.per_context.remove(&key);
    }

    pub fn context_count(&self) -> usize {
        self.per_context.len()
    }
}
