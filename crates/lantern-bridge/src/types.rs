//! Native type descriptors and the per-runtime type registry
//!
//! Every native type that scripts can see is described by a `static`
//! [`TypeDescriptor`]. Descriptors form a single-inheritance tree through their
//! `parent` link and are compared by address, never by name.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Static description of a native type.
///
/// Must live in a `static` so its address is stable: two descriptors with the
/// same name are still two different types.
#[derive(Debug)]
pub struct TypeDescriptor {
    name: &'static str,
    parent: Option<&'static TypeDescriptor>,
}

impl TypeDescriptor {
    pub const fn new(name: &'static str, parent: Option<&'static TypeDescriptor>) -> Self {
        Self { name, parent }
    }
}

/// Boxed signed 64-bit integers
pub static INT64: TypeDescriptor = TypeDescriptor::new("int64", None);
/// Boxed unsigned 64-bit integers
pub static UINT64: TypeDescriptor = TypeDescriptor::new("uint64", None);

/// Identity of a registered type descriptor
#[derive(Clone, Copy)]
pub struct TypeTag(&'static TypeDescriptor);

impl TypeTag {
    pub const fn of(descriptor: &'static TypeDescriptor) -> Self {
        Self(descriptor)
    }

    pub fn name(self) -> &'static str {
        self.0.name
    }

    pub fn parent(self) -> Option<TypeTag> {
        self.0.parent.map(TypeTag)
    }

    /// Number of ancestors above this type
    pub fn depth(self) -> usize {
        self.ancestors().count() - 1
    }

    /// This type followed by each ancestor up to the root
    pub fn ancestors(self) -> impl Iterator<Item = TypeTag> {
        std::iter::successors(Some(self), |tag| tag.parent())
    }

    /// True if `self` is `other` or derives from it
    pub fn is_a(self, other: TypeTag) -> bool {
        self.ancestors().any(|tag| tag == other)
    }

    pub(crate) fn addr(self) -> usize {
        self.0 as *const TypeDescriptor as usize
    }
}

impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}

impl Eq for TypeTag {}

impl Hash for TypeTag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeTag({})", self.0.name)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.name)
    }
}

#[doc(hidden)]
pub trait AsAny {
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A host object that can be handed to scripts.
///
/// `type_tag` reports the most-derived type of this particular instance, so a
/// single Rust type can surface as different script types at runtime.
/// Objects are shared through `Arc`, so they must be `Send + Sync`.
pub trait NativeObject: AsAny + Send + Sync {
    fn type_tag(&self) -> TypeTag;
}

/// A native type with a fixed script type, which checks can downcast to
pub trait ScriptObject: NativeObject + Sized {
    const DESCRIPTOR: &'static TypeDescriptor;

    fn script_type() -> TypeTag {
        TypeTag::of(Self::DESCRIPTOR)
    }
}

/// The set of types known to one runtime instance
#[derive(Debug)]
pub struct TypeRegistry {
    types: Vec<TypeTag>,
    index: HashMap<TypeTag, usize>,
}

impl TypeRegistry {
    /// A registry holding the boxed integer types
    pub fn new() -> Self {
        let mut registry = Self {
            types: Vec::new(),
            index: HashMap::new(),
        };
        registry.register(&INT64);
        registry.register(&UINT64);
        registry
    }

    pub fn register(&mut self, descriptor: &'static TypeDescriptor) -> TypeTag {
        let tag = TypeTag::of(descriptor);
        if !self.index.contains_key(&tag) {
            self.index.insert(tag, self.types.len());
            self.types.push(tag);
        }
        tag
    }

    pub fn is_registered(&self, tag: TypeTag) -> bool {
        self.index.contains_key(&tag)
    }

    /// The most specific registered type in `tag`'s ancestry
    pub fn resolve(&self, tag: TypeTag) -> Option<TypeTag> {
        tag.ancestors().find(|t| self.is_registered(*t))
    }

    /// Registered strict subtypes of `tag`, most derived first.
    ///
    /// Types at the same depth keep registration order.
    pub fn descendants(&self, tag: TypeTag) -> Vec<TypeTag> {
        let mut found: Vec<TypeTag> = self
            .types
            .iter()
            .copied()
            .filter(|t| *t != tag && t.is_a(tag))
            .collect();
        found.sort_by(|a, b| b.depth().cmp(&a.depth()));
        found
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
