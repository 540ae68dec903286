//! Per-property serialization attributes.

/// Chunk size used when a chunkable property does not name one.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Prefix marking a dynamic property as detachable.
pub const DETACH_PREFIX: char = '@';

/// Prefix of names the gatherer never emits.
pub const RESERVED_PREFIX: &str = "__";

/// How a property travels: inline, detached into its own record, or split into chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PropertyAttributes {
    /// The value becomes its own record and is replaced by a reference.
    pub detachable: bool,
    /// The list value is split into `chunk_size` sized chunk records.
    pub chunkable: bool,
    /// Elements per chunk; meaningful only when `chunkable` is set.
    pub chunk_size: usize,
    /// A null value is omitted on write and ignored on read.
    pub ignore_if_null: bool,
}

impl PropertyAttributes {
    /// Plain inline property.
    pub const INLINE: PropertyAttributes = PropertyAttributes {
        detachable: false,
        chunkable: false,
        chunk_size: DEFAULT_CHUNK_SIZE,
        ignore_if_null: false,
    };

    /// Marks the property detachable.
    pub const fn detach(mut self) -> Self {
        self.detachable = true;
        self
    }

    /// Marks the property detachable and chunked by `size` (zero picks the default).
    pub const fn chunked(mut self, size: usize) -> Self {
        self.detachable = true;
        self.chunkable = true;
        self.chunk_size = if size == 0 { DEFAULT_CHUNK_SIZE } else { size };
        self
    }

    /// Skips the property when its value is null.
    pub const fn ignore_null(mut self) -> Self {
        self.ignore_if_null = true;
        self
    }

    /// Derives attributes from a dynamic property name.
    ///
    /// `@name` detaches, `@(N)name` detaches and chunks by `N`, and `@()name`
    /// chunks by [`DEFAULT_CHUNK_SIZE`]. A parenthesised size that is not a
    /// number leaves the property detachable but unchunked.
    pub fn from_dynamic_name(name: &str) -> Self {
        let Some(rest) = name.strip_prefix(DETACH_PREFIX) else {
            return Self::INLINE;
        };
        let Some(spec) = rest.strip_prefix('(') else {
            return Self::INLINE.detach();
        };
        let Some(close) = spec.find(')') else {
            return Self::INLINE.detach();
        };
        let digits = spec[..close].trim();
        if digits.is_empty() {
            return Self::INLINE.chunked(DEFAULT_CHUNK_SIZE);
        }
        match digits.parse::<usize>() {
            Ok(size) => Self::INLINE.chunked(size),
            Err(_) => Self::INLINE.detach(),
        }
    }
}

impl Default for PropertyAttributes {
    fn default() -> Self {
        Self::INLINE
    }
}

/// Static description of one typed field of a node type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Field name as written to the record.
    pub name: &'static str,
    /// How the field is written.
    pub attributes: PropertyAttributes,
}

impl FieldDescriptor {
    /// Describes field `name`.
    pub const fn new(name: &'static str, attributes: PropertyAttributes) -> Self {
        Self { name, attributes }
    }
}

/// Names the gatherer skips: reserved `__` names and the fixed identity fields.
pub fn is_skipped_name(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX) || matches!(name, "id" | "speckle_type" | "applicationId")
}
