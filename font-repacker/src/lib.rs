//! Packing object graphs into font tables.
//!
//! Font tables are written as a collection of objects that refer to one
//! another through fixed-width offsets. A 16-bit offset can only reach
//! 64KiB past the start of the object that holds it, so the order objects
//! are written in determines whether a table can be encoded at all.
//!
//! This crate provides a [`Serializer`] for writing objects and recording
//! the links between them, and a repacker that reorders the resulting
//! object graph when the naive layout overflows.
//!
//! ```
//! use font_repacker::{resolve_overflows, LinkWidth, SerializeErrorFlags, Serializer};
//!
//! let mut s = Serializer::new(1 << 20);
//! s.start_serialize()?;
//!
//! s.push()?;
//! s.embed(0xbeef_u16)?;
//! let small = s.pop_pack(true)?;
//!
//! s.push()?;
//! s.embed_bytes(&vec![0; 70_000])?;
//! let big = s.pop_pack(true)?;
//!
//! s.push()?;
//! s.add_offset(big, LinkWidth::Two)?;
//! s.add_offset(small, LinkWidth::Two)?;
//! s.pop_pack(false)?;
//!
//! // the small object is written after the big one, out of reach of the root
//! assert_eq!(
//!     s.end_serialize(),
//!     Err(SerializeErrorFlags::SERIALIZE_ERROR_OFFSET_OVERFLOW)
//! );
//!
//! let bytes = resolve_overflows(s.packed_objects())?;
//! assert_eq!(&bytes[..6], &[0, 6, 0, 4, 0xbe, 0xef]);
//! # Ok::<_, Box<dyn std::error::Error>>(())
//! ```

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

mod error;
mod graph;
mod repack;
mod serialize;

pub use error::RepackError;
pub use graph::{Graph, Overflow, Vertex};
pub use repack::{resolve_overflows, Repacker, SortStrategy};
pub use serialize::{
    Link, LinkWidth, ObjIdx, Object, OffsetWhence, SerializeErrorFlags, Serializer,
};

/// Types used in the serialized representation of font data.
pub use font_types as types;
