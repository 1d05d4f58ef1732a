//! The type model: primitives, pointers, arrays, structs, unions, tagged
//! enums, function pointers, refined wrappers, and the linear marker.
//!
//! Types live in an arena and are referred to by handle, so cyclic nominal
//! types (an enum variant whose payload points back at the enclosing enum)
//! are expressed as an index rather than by embedding.

use std::collections::{BTreeSet, HashMap};

use crate::error::{CoreError, ErrorKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IntWidth {
    W8,
    W16,
    W32,
    W64,
}

impl IntWidth {
    pub fn bits(self) -> u32 {
        match self {
            IntWidth::W8 => 8,
            IntWidth::W16 => 16,
            IntWidth::W32 => 32,
            IntWidth::W64 => 64,
        }
    }

    pub fn bytes(self) -> u64 {
        u64::from(self.bits()) / 8
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FloatKind {
    F16,
    BF16,
    F32,
    F64,
    F128,
}

impl FloatKind {
    pub fn bytes(self) -> u64 {
        match self {
            FloatKind::F16 | FloatKind::BF16 => 2,
            FloatKind::F32 => 4,
            FloatKind::F64 => 8,
            FloatKind::F128 => 16,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Field {
    pub name: Option<String>,
    pub ty: TypeId,
}

impl Field {
    pub fn named(name: &str, ty: TypeId) -> Self {
        Self {
            name: Some(name.to_string()),
            ty,
        }
    }

    pub fn anon(ty: TypeId) -> Self {
        Self { name: None, ty }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EnumVariant {
    pub name: String,
    pub tag: i64,
    pub payload: Option<TypeId>,
}

/// Reference to a predicate function. Identity is structural: two references
/// with the same symbol name denote the same predicate.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PredRef {
    pub name: String,
    pub arity: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Int { signed: bool, width: IntWidth },
    Float(FloatKind),
    Bool,
    Void,
    Ptr(TypeId),
    Array { elem: TypeId, dims: Vec<u64> },
    Struct { name: Option<String>, fields: Vec<Field> },
    Union { name: Option<String>, fields: Vec<Field> },
    Enum {
        name: String,
        tag_type: TypeId,
        variants: Vec<EnumVariant>,
    },
    Func {
        params: Vec<TypeId>,
        result: TypeId,
        variadic: bool,
    },
    /// Zero-width ownership marker.
    Linear,
    Refined {
        base: TypeId,
        preds: Vec<PredRef>,
        tags: BTreeSet<String>,
    },
    /// Reserved nominal slot, filled by `define`.
    Opaque(String),
}

/// A `(variable, field-path)` address into a linear-containing value.
pub type FieldPath = Vec<u32>;

pub struct TypeArena {
    kinds: Vec<TypeKind>,
    named: HashMap<String, TypeId>,
    prims: HashMap<&'static str, TypeId>,
}

impl Default for TypeArena {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeArena {
    pub fn new() -> Self {
        let mut arena = Self {
            kinds: Vec::new(),
            named: HashMap::new(),
            prims: HashMap::new(),
        };
        for (name, kind) in [
            ("void", TypeKind::Void),
            ("bool", TypeKind::Bool),
            ("i8", TypeKind::Int { signed: true, width: IntWidth::W8 }),
            ("i16", TypeKind::Int { signed: true, width: IntWidth::W16 }),
            ("i32", TypeKind::Int { signed: true, width: IntWidth::W32 }),
            ("i64", TypeKind::Int { signed: true, width: IntWidth::W64 }),
            ("u8", TypeKind::Int { signed: false, width: IntWidth::W8 }),
            ("u16", TypeKind::Int { signed: false, width: IntWidth::W16 }),
            ("u32", TypeKind::Int { signed: false, width: IntWidth::W32 }),
            ("u64", TypeKind::Int { signed: false, width: IntWidth::W64 }),
            ("f16", TypeKind::Float(FloatKind::F16)),
            ("bf16", TypeKind::Float(FloatKind::BF16)),
            ("f32", TypeKind::Float(FloatKind::F32)),
            ("f64", TypeKind::Float(FloatKind::F64)),
            ("f128", TypeKind::Float(FloatKind::F128)),
            ("linear", TypeKind::Linear),
        ] {
            let id = arena.push(kind);
            arena.prims.insert(name, id);
        }
        arena
    }

    fn push(&mut self, kind: TypeKind) -> TypeId {
        let id = TypeId(self.kinds.len() as u32);
        self.kinds.push(kind);
        id
    }

    pub fn kind(&self, id: TypeId) -> &TypeKind {
        &self.kinds[id.0 as usize]
    }

    pub fn primitive(&self, name: &str) -> Option<TypeId> {
        self.prims.get(name).copied()
    }

    pub fn void(&self) -> TypeId {
        self.prims["void"]
    }

    pub fn bool_(&self) -> TypeId {
        self.prims["bool"]
    }

    pub fn i32_(&self) -> TypeId {
        self.prims["i32"]
    }

    pub fn i64_(&self) -> TypeId {
        self.prims["i64"]
    }

    pub fn f64_(&self) -> TypeId {
        self.prims["f64"]
    }

    pub fn linear(&self) -> TypeId {
        self.prims["linear"]
    }

    pub fn lookup_named(&self, name: &str) -> Option<TypeId> {
        self.named.get(name).copied()
    }

    /// Reserve a nominal slot so self-referential definitions can point at
    /// it before it is filled in.
    pub fn reserve(&mut self, name: &str) -> TypeId {
        if let Some(id) = self.named.get(name) {
            return *id;
        }
        let id = self.push(TypeKind::Opaque(name.to_string()));
        self.named.insert(name.to_string(), id);
        id
    }

    pub fn define(&mut self, id: TypeId, kind: TypeKind) {
        self.kinds[id.0 as usize] = kind;
    }

    pub fn ptr(&mut self, pointee: TypeId) -> TypeId {
        self.push(TypeKind::Ptr(pointee))
    }

    pub fn array(&mut self, elem: TypeId, dims: Vec<u64>) -> Result<TypeId, CoreError> {
        if dims.is_empty() || dims.iter().any(|&d| d == 0) {
            return Err(CoreError::new(
                ErrorKind::TypeShapeInvalid,
                "array dimensions must be a nonempty list of positive integers",
            ));
        }
        if self.contains_linear(elem) {
            return Err(CoreError::new(
                ErrorKind::TypeShapeInvalid,
                "array elements may not contain linear markers",
            ));
        }
        Ok(self.push(TypeKind::Array { elem, dims }))
    }

    pub fn struct_type(
        &mut self,
        name: Option<&str>,
        fields: Vec<Field>,
    ) -> Result<TypeId, CoreError> {
        let kind = TypeKind::Struct {
            name: name.map(str::to_string),
            fields,
        };
        let id = match name.and_then(|n| self.named.get(n).copied()) {
            Some(reserved) => {
                self.define(reserved, kind);
                reserved
            }
            None => {
                let id = self.push(kind);
                if let Some(n) = name {
                    self.named.insert(n.to_string(), id);
                }
                id
            }
        };
        Ok(id)
    }

    pub fn union_type(
        &mut self,
        name: Option<&str>,
        fields: Vec<Field>,
    ) -> Result<TypeId, CoreError> {
        for f in &fields {
            if self.contains_linear(f.ty) {
                return Err(CoreError::new(
                    ErrorKind::TypeShapeInvalid,
                    "union fields may not contain linear markers",
                ));
            }
        }
        let kind = TypeKind::Union {
            name: name.map(str::to_string),
            fields,
        };
        let id = self.push(kind);
        if let Some(n) = name {
            self.named.insert(n.to_string(), id);
        }
        Ok(id)
    }

    pub fn enum_type(
        &mut self,
        name: &str,
        tag_type: TypeId,
        variants: Vec<EnumVariant>,
    ) -> Result<TypeId, CoreError> {
        if !matches!(self.kind(tag_type), TypeKind::Int { .. }) {
            return Err(CoreError::new(
                ErrorKind::TypeShapeInvalid,
                format!("enum '{name}' tag type must be an integer type"),
            ));
        }
        let mut names = BTreeSet::new();
        let mut tags = BTreeSet::new();
        for v in &variants {
            if !names.insert(v.name.clone()) {
                return Err(CoreError::new(
                    ErrorKind::TypeShapeInvalid,
                    format!("enum '{name}' has duplicate variant '{}'", v.name),
                ));
            }
            if !tags.insert(v.tag) {
                return Err(CoreError::new(
                    ErrorKind::TypeShapeInvalid,
                    format!("enum '{name}' has duplicate tag value {}", v.tag),
                ));
            }
            if let Some(payload) = v.payload {
                if self.contains_linear(payload) {
                    return Err(CoreError::new(
                        ErrorKind::TypeShapeInvalid,
                        format!("enum '{name}' variant '{}' payload may not contain linear markers", v.name),
                    ));
                }
            }
        }
        let kind = TypeKind::Enum {
            name: name.to_string(),
            tag_type,
            variants,
        };
        let id = match self.named.get(name).copied() {
            Some(reserved) => {
                self.define(reserved, kind);
                reserved
            }
            None => {
                let id = self.push(kind);
                self.named.insert(name.to_string(), id);
                id
            }
        };
        Ok(id)
    }

    pub fn func_type(&mut self, params: Vec<TypeId>, result: TypeId, variadic: bool) -> TypeId {
        self.push(TypeKind::Func {
            params,
            result,
            variadic,
        })
    }

    /// Construct a refined wrapper. All predicates must agree on arity: a
    /// unary set refines the base value in place, an N-ary set requires the
    /// base to be a struct with exactly N fields (the multi-value shape).
    pub fn refined(
        &mut self,
        base: TypeId,
        preds: Vec<PredRef>,
        tags: BTreeSet<String>,
    ) -> Result<TypeId, CoreError> {
        if let Some(first) = preds.first() {
            let arity = first.arity;
            if preds.iter().any(|p| p.arity != arity) {
                return Err(CoreError::new(
                    ErrorKind::RefinedArityMismatch,
                    "all predicates of a refined type must have the same arity",
                ));
            }
            if arity == 0 {
                return Err(CoreError::new(
                    ErrorKind::RefinedArityMismatch,
                    "refinement predicates must take at least one parameter",
                ));
            }
            if arity > 1 {
                let n_fields = match self.kind(base) {
                    TypeKind::Struct { fields, .. } => fields.len(),
                    _ => 0,
                };
                if n_fields != arity {
                    return Err(CoreError::new(
                        ErrorKind::RefinedArityMismatch,
                        format!(
                            "{arity}-ary predicates require a {arity}-field struct shape, got {}",
                            self.display(base)
                        ),
                    ));
                }
            }
        }
        Ok(self.push(TypeKind::Refined { base, preds, tags }))
    }

    /// The representation a value of this type has at runtime: refined
    /// wrappers forget to their base, everything else is itself.
    pub fn runtime_repr(&self, id: TypeId) -> TypeId {
        match self.kind(id) {
            TypeKind::Refined { base, .. } => self.runtime_repr(*base),
            _ => id,
        }
    }

    pub fn is_integral(&self, id: TypeId) -> bool {
        matches!(self.kind(self.runtime_repr(id)), TypeKind::Int { .. })
    }

    pub fn is_void(&self, id: TypeId) -> bool {
        matches!(self.kind(id), TypeKind::Void)
    }

    /// Every field path under `id` that bottoms out at a `Linear` marker.
    /// The empty path means the value itself is the marker.
    pub fn linear_paths(&self, id: TypeId) -> Vec<FieldPath> {
        let mut out = Vec::new();
        self.collect_linear_paths(id, &mut Vec::new(), &mut out);
        out
    }

    fn collect_linear_paths(&self, id: TypeId, prefix: &mut FieldPath, out: &mut Vec<FieldPath>) {
        match self.kind(id) {
            TypeKind::Linear => out.push(prefix.clone()),
            TypeKind::Refined { base, .. } => self.collect_linear_paths(*base, prefix, out),
            TypeKind::Struct { fields, .. } => {
                for (i, f) in fields.iter().enumerate() {
                    prefix.push(i as u32);
                    self.collect_linear_paths(f.ty, prefix, out);
                    prefix.pop();
                }
            }
            _ => {}
        }
    }

    pub fn contains_linear(&self, id: TypeId) -> bool {
        !self.linear_paths(id).is_empty()
    }

    pub fn align_of(&self, id: TypeId) -> u64 {
        match self.kind(id) {
            TypeKind::Int { width, .. } => width.bytes(),
            TypeKind::Float(k) => k.bytes(),
            TypeKind::Bool => 1,
            TypeKind::Void | TypeKind::Linear => 1,
            TypeKind::Ptr(_) | TypeKind::Func { .. } => 8,
            TypeKind::Array { elem, .. } => self.align_of(*elem),
            TypeKind::Struct { fields, .. } | TypeKind::Union { fields, .. } => fields
                .iter()
                .map(|f| self.align_of(f.ty))
                .max()
                .unwrap_or(1),
            TypeKind::Enum { tag_type, variants, .. } => {
                let mut a = self.align_of(*tag_type);
                for v in variants {
                    if let Some(p) = v.payload {
                        a = a.max(self.align_of(p));
                    }
                }
                a
            }
            TypeKind::Refined { base, .. } => self.align_of(*base),
            TypeKind::Opaque(_) => 1,
        }
    }

    /// C-style layout size, as `sizeof` reports it. Linear markers are
    /// zero-width and contribute nothing.
    pub fn size_of(&self, id: TypeId) -> u64 {
        fn align_to(off: u64, align: u64) -> u64 {
            if align <= 1 {
                off
            } else {
                off.div_ceil(align) * align
            }
        }
        match self.kind(id) {
            TypeKind::Int { width, .. } => width.bytes(),
            TypeKind::Float(k) => k.bytes(),
            TypeKind::Bool => 1,
            TypeKind::Void | TypeKind::Linear => 0,
            TypeKind::Ptr(_) | TypeKind::Func { .. } => 8,
            TypeKind::Array { elem, dims } => {
                let n: u64 = dims.iter().product();
                self.size_of(*elem) * n
            }
            TypeKind::Struct { fields, .. } => {
                let mut off = 0u64;
                for f in fields {
                    off = align_to(off, self.align_of(f.ty));
                    off += self.size_of(f.ty);
                }
                align_to(off, self.align_of(id))
            }
            TypeKind::Union { fields, .. } => {
                let max = fields.iter().map(|f| self.size_of(f.ty)).max().unwrap_or(0);
                align_to(max, self.align_of(id))
            }
            TypeKind::Enum { tag_type, variants, .. } => {
                let payload_align = variants
                    .iter()
                    .filter_map(|v| v.payload.map(|p| self.align_of(p)))
                    .max()
                    .unwrap_or(1);
                let payload_size = variants
                    .iter()
                    .filter_map(|v| v.payload.map(|p| self.size_of(p)))
                    .max()
                    .unwrap_or(0);
                let off = align_to(self.size_of(*tag_type), payload_align);
                align_to(off + payload_size, self.align_of(id))
            }
            TypeKind::Refined { base, .. } => self.size_of(*base),
            TypeKind::Opaque(_) => 0,
        }
    }

    pub fn display(&self, id: TypeId) -> String {
        match self.kind(id) {
            TypeKind::Int { signed, width } => {
                format!("{}{}", if *signed { "i" } else { "u" }, width.bits())
            }
            TypeKind::Float(k) => match k {
                FloatKind::F16 => "f16".into(),
                FloatKind::BF16 => "bf16".into(),
                FloatKind::F32 => "f32".into(),
                FloatKind::F64 => "f64".into(),
                FloatKind::F128 => "f128".into(),
            },
            TypeKind::Bool => "bool".into(),
            TypeKind::Void => "void".into(),
            TypeKind::Linear => "linear".into(),
            TypeKind::Ptr(p) => format!("ptr[{}]", self.display(*p)),
            TypeKind::Array { elem, dims } => {
                let dims_s = dims
                    .iter()
                    .map(|d| d.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("array[{}, {dims_s}]", self.display(*elem))
            }
            TypeKind::Struct { name: Some(n), .. } => n.clone(),
            TypeKind::Struct { name: None, fields } => {
                let fs = fields
                    .iter()
                    .map(|f| self.display(f.ty))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("({fs})")
            }
            TypeKind::Union { name: Some(n), .. } => n.clone(),
            TypeKind::Union { name: None, fields } => {
                let fs = fields
                    .iter()
                    .map(|f| self.display(f.ty))
                    .collect::<Vec<_>>()
                    .join(" | ");
                format!("union[{fs}]")
            }
            TypeKind::Enum { name, .. } => name.clone(),
            TypeKind::Func { params, result, variadic } => {
                let mut ps = params
                    .iter()
                    .map(|p| self.display(*p))
                    .collect::<Vec<_>>();
                if *variadic {
                    ps.push("...".into());
                }
                format!("fn({}) -> {}", ps.join(", "), self.display(*result))
            }
            TypeKind::Refined { base, preds, tags } => {
                let mut parts = vec![self.display(*base)];
                parts.extend(preds.iter().map(|p| p.name.clone()));
                parts.extend(tags.iter().map(|t| format!("\"{t}\"")));
                format!("refined[{}]", parts.join(", "))
            }
            TypeKind::Opaque(n) => n.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_intern_once() {
        let arena = TypeArena::new();
        assert_eq!(arena.primitive("i32"), Some(arena.i32_()));
        assert_eq!(arena.size_of(arena.i32_()), 4);
        assert_eq!(arena.size_of(arena.linear()), 0);
    }

    #[test]
    fn array_rejects_zero_dims() {
        let mut arena = TypeArena::new();
        let i32_ = arena.i32_();
        let err = arena.array(i32_, vec![]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeShapeInvalid);
        let err = arena.array(i32_, vec![4, 0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeShapeInvalid);
    }

    #[test]
    fn enum_rejects_duplicate_tags() {
        let mut arena = TypeArena::new();
        let i32_ = arena.i32_();
        let err = arena
            .enum_type(
                "Status",
                i32_,
                vec![
                    EnumVariant { name: "Ok".into(), tag: 0, payload: None },
                    EnumVariant { name: "Err".into(), tag: 0, payload: None },
                ],
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeShapeInvalid);
    }

    #[test]
    fn struct_layout_pads_fields() {
        let mut arena = TypeArena::new();
        let i8_ = arena.primitive("i8").unwrap();
        let i32_ = arena.i32_();
        let s = arena
            .struct_type(None, vec![Field::anon(i8_), Field::anon(i32_)])
            .unwrap();
        assert_eq!(arena.size_of(s), 8);
        assert_eq!(arena.align_of(s), 4);
    }

    #[test]
    fn linear_paths_walk_nested_structs() {
        let mut arena = TypeArena::new();
        let lin = arena.linear();
        let i32_ = arena.i32_();
        let inner = arena
            .struct_type(None, vec![Field::anon(lin), Field::anon(i32_)])
            .unwrap();
        let outer = arena
            .struct_type(None, vec![Field::anon(i32_), Field::anon(inner)])
            .unwrap();
        assert_eq!(arena.linear_paths(outer), vec![vec![1, 0]]);
        assert!(arena.contains_linear(outer));
        assert_eq!(arena.size_of(outer), 8);
    }

    #[test]
    fn cyclic_enum_via_reserve() {
        let mut arena = TypeArena::new();
        let node = arena.reserve("Node");
        let node_ptr = arena.ptr(node);
        let i32_ = arena.i32_();
        let id = arena
            .enum_type(
                "Node",
                i32_,
                vec![
                    EnumVariant { name: "Leaf".into(), tag: 0, payload: Some(i32_) },
                    EnumVariant { name: "Branch".into(), tag: 1, payload: Some(node_ptr) },
                ],
            )
            .unwrap();
        assert_eq!(id, node);
        assert_eq!(arena.display(id), "Node");
        // tag(4) padded to ptr align(8) + payload(8)
        assert_eq!(arena.size_of(id), 16);
    }

    #[test]
    fn refined_arity_checks() {
        let mut arena = TypeArena::new();
        let i32_ = arena.i32_();
        let ok = arena.refined(
            i32_,
            vec![PredRef { name: "is_positive".into(), arity: 1 }],
            BTreeSet::new(),
        );
        assert!(ok.is_ok());

        let err = arena
            .refined(
                i32_,
                vec![PredRef { name: "ordered".into(), arity: 2 }],
                BTreeSet::new(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RefinedArityMismatch);
    }
}
