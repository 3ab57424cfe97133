//! A scoped object serializer.
//!
//! Objects are written one at a time: [`Serializer::push`] starts a new
//! object, data and links are appended to it, and [`Serializer::pop_pack`]
//! finishes it and assigns it an index. Children must be packed before
//! their parents (a parent needs the child's index to link to it) so the
//! packed list is in reverse serialization order, with the root last.
//!
//! Index 0 of the packed list is always the nil object.

use fnv::FnvHashMap;
use font_types::Scalar;

/// The index of an object in a packed object list or graph.
pub type ObjIdx = usize;

/// Sticky error state of a [`Serializer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SerializeErrorFlags(u16);

impl SerializeErrorFlags {
    pub const SERIALIZE_ERROR_NONE: Self = Self(0x0000);
    pub const SERIALIZE_ERROR_OTHER: Self = Self(0x0001);
    pub const SERIALIZE_ERROR_OFFSET_OVERFLOW: Self = Self(0x0002);
    pub const SERIALIZE_ERROR_OUT_OF_ROOM: Self = Self(0x0004);
    pub const SERIALIZE_ERROR_INT_OVERFLOW: Self = Self(0x0008);

    /// `true` if every flag set in `other` is also set in `self`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for SerializeErrorFlags {
    fn default() -> Self {
        Self::SERIALIZE_ERROR_NONE
    }
}

impl std::ops::BitOrAssign for SerializeErrorFlags {
    /// Adds the set of flags.
    #[inline]
    fn bitor_assign(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl std::ops::Not for SerializeErrorFlags {
    type Output = bool;
    #[inline]
    fn not(self) -> bool {
        self == SerializeErrorFlags::SERIALIZE_ERROR_NONE
    }
}

impl std::fmt::Display for SerializeErrorFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const NAMES: [(SerializeErrorFlags, &str); 4] = [
            (SerializeErrorFlags::SERIALIZE_ERROR_OTHER, "other"),
            (
                SerializeErrorFlags::SERIALIZE_ERROR_OFFSET_OVERFLOW,
                "offset overflow",
            ),
            (SerializeErrorFlags::SERIALIZE_ERROR_OUT_OF_ROOM, "out of room"),
            (
                SerializeErrorFlags::SERIALIZE_ERROR_INT_OVERFLOW,
                "int overflow",
            ),
        ];
        if !*self {
            return write!(f, "no error");
        }
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}

impl std::error::Error for SerializeErrorFlags {}

/// The point an offset is measured from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OffsetWhence {
    /// Relative to the start of the object containing the offset.
    #[default]
    Head,
    /// Relative to the end of the object containing the offset.
    Tail,
    /// Relative to the start of the serialized buffer.
    Absolute,
}

/// The width of an offset field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LinkWidth {
    /// A 16-bit offset.
    #[default]
    Two = 2,
    /// A 32-bit offset.
    Four = 4,
}

impl LinkWidth {
    /// Construct a width from a size in bytes.
    pub fn new_checked(width: usize) -> Option<Self> {
        match width {
            2 => Some(LinkWidth::Two),
            4 => Some(LinkWidth::Four),
            _ => None,
        }
    }

    /// The size of the field, in bytes.
    pub const fn size(self) -> usize {
        self as u8 as usize
    }

    // penalty added to the edge weight when computing shortest distances;
    // narrow offsets are far more sensitive to distance than wide ones.
    pub(crate) const fn distance_penalty(self) -> i64 {
        match self {
            LinkWidth::Two => 1 << 16,
            LinkWidth::Four => 1 << 32,
        }
    }
}

/// An offset field inside an object, pointing at another object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Link {
    width: LinkWidth,
    is_signed: bool,
    whence: OffsetWhence,
    bias: u32,
    position: u32,
    objidx: ObjIdx,
}

impl Link {
    /// An unsigned, head-relative link with no bias.
    pub fn new(width: LinkWidth, objidx: ObjIdx, position: u32) -> Self {
        Link {
            width,
            objidx,
            position,
            ..Default::default()
        }
    }

    pub fn with_signed(mut self, is_signed: bool) -> Self {
        self.is_signed = is_signed;
        self
    }

    pub fn with_whence(mut self, whence: OffsetWhence) -> Self {
        self.whence = whence;
        self
    }

    /// Set a constant that is subtracted from the offset before it is encoded.
    pub fn with_bias(mut self, bias: u32) -> Self {
        self.bias = bias;
        self
    }

    pub fn width(&self) -> LinkWidth {
        self.width
    }

    pub fn is_signed(&self) -> bool {
        self.is_signed
    }

    pub fn whence(&self) -> OffsetWhence {
        self.whence
    }

    pub fn bias(&self) -> u32 {
        self.bias
    }

    /// The position of the offset field within the owning object.
    pub fn position(&self) -> u32 {
        self.position
    }

    /// The index of the object this link points to.
    pub fn obj_idx(&self) -> ObjIdx {
        self.objidx
    }

    pub(crate) fn update_obj_idx(&mut self, objidx: ObjIdx) {
        self.objidx = objidx;
    }

    /// Compute the value to encode, given the serialized positions of the
    /// owning object and of the target.
    pub(crate) fn offset(&self, parent_start: usize, parent_end: usize, child_start: usize) -> i64 {
        let offset = match self.whence {
            OffsetWhence::Head => child_start as i64 - parent_start as i64,
            OffsetWhence::Tail => child_start as i64 - parent_end as i64,
            OffsetWhence::Absolute => child_start as i64,
        };
        offset - self.bias as i64
    }

    /// `true` if `offset` can be encoded in this link's field.
    pub(crate) fn is_valid_offset(&self, offset: i64) -> bool {
        match (self.width, self.is_signed) {
            (LinkWidth::Two, false) => u16::try_from(offset).is_ok(),
            (LinkWidth::Two, true) => i16::try_from(offset).is_ok(),
            (LinkWidth::Four, false) => u32::try_from(offset).is_ok(),
            (LinkWidth::Four, true) => i32::try_from(offset).is_ok(),
        }
    }
}

/// A packed object: its encoded bytes and the links it contains.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Object {
    bytes: Vec<u8>,
    links: Vec<Link>,
}

impl Object {
    pub fn new(bytes: Vec<u8>, links: Vec<Link>) -> Self {
        Object { bytes, links }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Write a resolved offset into the start of `at`, big-endian.
pub(crate) fn encode_offset(
    at: &mut [u8],
    value: i64,
    width: LinkWidth,
    is_signed: bool,
) -> Result<(), SerializeErrorFlags> {
    fn write_scalar(at: &mut [u8], value: impl Scalar) -> Result<(), SerializeErrorFlags> {
        let raw = value.to_raw();
        let bytes = raw.as_ref();
        at.get_mut(..bytes.len())
            .ok_or(SerializeErrorFlags::SERIALIZE_ERROR_OTHER)?
            .copy_from_slice(bytes);
        Ok(())
    }

    let overflow = SerializeErrorFlags::SERIALIZE_ERROR_OFFSET_OVERFLOW;
    match (width, is_signed) {
        (LinkWidth::Two, false) => write_scalar(at, u16::try_from(value).map_err(|_| overflow)?),
        (LinkWidth::Two, true) => write_scalar(at, i16::try_from(value).map_err(|_| overflow)?),
        (LinkWidth::Four, false) => write_scalar(at, u32::try_from(value).map_err(|_| overflow)?),
        (LinkWidth::Four, true) => write_scalar(at, i32::try_from(value).map_err(|_| overflow)?),
    }
}

/// Writes objects and packs them into a single buffer.
#[derive(Debug, Default)]
pub struct Serializer {
    max_size: usize,
    // total bytes currently allocated, across all objects
    size: usize,
    errors: SerializeErrorFlags,

    // objects currently being written; the last is the current object
    stack: Vec<Object>,
    // finished objects, in reverse serialization order
    packed: Vec<Option<Object>>,
    packed_map: FnvHashMap<Object, ObjIdx>,

    out: Vec<u8>,
}

impl Serializer {
    /// Create a serializer that can hold at most `max_size` bytes.
    pub fn new(max_size: usize) -> Self {
        let mut this = Serializer {
            max_size,
            ..Default::default()
        };

        this.packed.push(None);
        this
    }

    /// Reset all state, ready to write a new set of objects.
    pub fn start_serialize(&mut self) -> Result<(), SerializeErrorFlags> {
        self.errors = SerializeErrorFlags::SERIALIZE_ERROR_NONE;
        self.size = 0;
        self.stack.clear();
        self.packed.clear();
        self.packed.push(None);
        self.packed_map.clear();
        self.out.clear();
        Ok(())
    }

    pub fn successful(&self) -> bool {
        !self.errors
    }

    pub fn in_error(&self) -> bool {
        !!self.errors
    }

    pub fn error(&self) -> SerializeErrorFlags {
        self.errors
    }

    pub(crate) fn set_err(&mut self, error_type: SerializeErrorFlags) -> SerializeErrorFlags {
        self.errors |= error_type;
        self.errors
    }

    fn check_ok(&self) -> Result<(), SerializeErrorFlags> {
        if self.in_error() {
            return Err(self.errors);
        }
        Ok(())
    }

    fn current_mut(&mut self) -> Result<&mut Object, SerializeErrorFlags> {
        if self.stack.is_empty() {
            return Err(self.set_err(SerializeErrorFlags::SERIALIZE_ERROR_OTHER));
        }
        self.stack
            .last_mut()
            .ok_or(SerializeErrorFlags::SERIALIZE_ERROR_OTHER)
    }

    /// Begin a new object.
    pub fn push(&mut self) -> Result<(), SerializeErrorFlags> {
        self.check_ok()?;
        self.stack.push(Object::default());
        Ok(())
    }

    /// Reserve `size` zeroed bytes at the end of the current object.
    ///
    /// Returns the position of the reserved bytes within the object.
    pub fn allocate_size(&mut self, size: usize) -> Result<usize, SerializeErrorFlags> {
        self.check_ok()?;

        let Some(new_size) = self.size.checked_add(size) else {
            return Err(self.set_err(SerializeErrorFlags::SERIALIZE_ERROR_INT_OVERFLOW));
        };
        if size > u32::MAX as usize || new_size > self.max_size {
            return Err(self.set_err(SerializeErrorFlags::SERIALIZE_ERROR_OUT_OF_ROOM));
        }

        let obj = self.current_mut()?;
        let ret = obj.bytes.len();
        obj.bytes.resize(ret + size, 0);
        self.size = new_size;
        Ok(ret)
    }

    /// Embed a single Scalar type
    pub fn embed(&mut self, obj: impl Scalar) -> Result<usize, SerializeErrorFlags> {
        let raw = obj.to_raw();
        self.embed_bytes(raw.as_ref())
    }

    /// Copy raw bytes into the current object.
    pub fn embed_bytes(&mut self, bytes: &[u8]) -> Result<usize, SerializeErrorFlags> {
        let ret = self.allocate_size(bytes.len())?;
        let obj = self.current_mut()?;
        obj.bytes[ret..ret + bytes.len()].copy_from_slice(bytes);
        Ok(ret)
    }

    /// Record a link in the current object.
    ///
    /// Links to the nil object (index 0) are ignored.
    pub fn add_link(&mut self, link: Link) -> Result<(), SerializeErrorFlags> {
        self.check_ok()?;
        if link.obj_idx() == 0 {
            return Ok(());
        }
        if link.obj_idx() >= self.packed.len() {
            return Err(self.set_err(SerializeErrorFlags::SERIALIZE_ERROR_OTHER));
        }
        self.current_mut()?.links.push(link);
        Ok(())
    }

    /// Append a zeroed, unsigned, head-relative offset field to the current
    /// object, pointing at `objidx`.
    pub fn add_offset(&mut self, objidx: ObjIdx, width: LinkWidth) -> Result<(), SerializeErrorFlags> {
        let pos = self.allocate_size(width.size())?;
        self.add_link(Link::new(width, objidx, pos as u32))
    }

    /// Write a resolved offset at `pos` within the current object.
    pub fn write_offset(
        &mut self,
        pos: usize,
        value: i64,
        width: LinkWidth,
        is_signed: bool,
    ) -> Result<(), SerializeErrorFlags> {
        self.check_ok()?;
        let obj = self.current_mut()?;
        let result = match obj.bytes.get_mut(pos..pos + width.size()) {
            Some(at) => encode_offset(at, value, width, is_signed),
            None => Err(SerializeErrorFlags::SERIALIZE_ERROR_OTHER),
        };
        result.map_err(|e| self.set_err(e))
    }

    /// Finish the current object, returning its packed index.
    ///
    /// If `share` is true and an identical object was already packed with
    /// sharing enabled, this object is dropped and the existing index is
    /// returned.
    pub fn pop_pack(&mut self, share: bool) -> Result<ObjIdx, SerializeErrorFlags> {
        self.check_ok()?;
        let Some(obj) = self.stack.pop() else {
            return Err(self.set_err(SerializeErrorFlags::SERIALIZE_ERROR_OTHER));
        };

        if share {
            if let Some(existing) = self.packed_map.get(&obj) {
                self.size -= obj.len();
                return Ok(*existing);
            }
        }

        let idx = self.packed.len();
        if share {
            self.packed_map.insert(obj.clone(), idx);
        }
        self.packed.push(Some(obj));
        Ok(idx)
    }

    /// Drop the current object without packing it.
    pub fn pop_discard(&mut self) -> Result<(), SerializeErrorFlags> {
        self.check_ok()?;
        let Some(obj) = self.stack.pop() else {
            return Err(self.set_err(SerializeErrorFlags::SERIALIZE_ERROR_OTHER));
        };
        self.size -= obj.len();
        Ok(())
    }

    /// Finish serialization: lay out the packed objects and resolve links.
    ///
    /// Objects are laid out in reverse pack order, so the last object packed
    /// (the root) is at the start of the buffer. If any link does not fit
    /// this layout, `SERIALIZE_ERROR_OFFSET_OVERFLOW` is set; the packed
    /// objects remain available for repacking.
    pub fn end_serialize(&mut self) -> Result<(), SerializeErrorFlags> {
        self.check_ok()?;
        if !self.stack.is_empty() {
            return Err(self.set_err(SerializeErrorFlags::SERIALIZE_ERROR_OTHER));
        }

        let mut positions = vec![(0, 0); self.packed.len()];
        let mut out = Vec::with_capacity(self.size);
        for (idx, obj) in self.packed.iter().enumerate().rev() {
            let Some(obj) = obj else {
                continue;
            };
            let start = out.len();
            out.extend_from_slice(obj.bytes());
            positions[idx] = (start, out.len());
        }

        if let Err(e) = self.resolve_links(&positions, &mut out) {
            return Err(self.set_err(e));
        }

        self.out = out;
        Ok(())
    }

    fn resolve_links(
        &self,
        positions: &[(usize, usize)],
        out: &mut [u8],
    ) -> Result<(), SerializeErrorFlags> {
        for (idx, obj) in self.packed.iter().enumerate() {
            let Some(obj) = obj else {
                continue;
            };
            let (start, end) = positions[idx];
            for link in obj.links() {
                let child_start = positions[link.obj_idx()].0;
                let offset = link.offset(start, end, child_start);
                let pos = start + link.position() as usize;
                let at = out
                    .get_mut(pos..end)
                    .ok_or(SerializeErrorFlags::SERIALIZE_ERROR_OTHER)?;
                encode_offset(at, offset, link.width(), link.is_signed()).inspect_err(|_| {
                    log::debug!("link {idx} -> {} does not fit: {offset}", link.obj_idx())
                })?;
            }
        }
        Ok(())
    }

    /// The objects packed so far, in reverse serialization order.
    ///
    /// The first entry is always the nil object.
    pub fn packed_objects(&self) -> &[Option<Object>] {
        &self.packed
    }

    /// Take the serialized bytes, after a successful [`Serializer::end_serialize`].
    pub fn copy_bytes(self) -> Result<Vec<u8>, SerializeErrorFlags> {
        if !self.successful() {
            return Err(self.errors);
        }
        Ok(self.out)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_serializer_embed() {
        let mut s = Serializer::new(2);
        s.push().unwrap();
        //fail when out of room
        assert_eq!(
            s.embed(1_u32),
            Err(SerializeErrorFlags::SERIALIZE_ERROR_OUT_OF_ROOM)
        );

        let mut s = Serializer::new(16384);
        s.push().unwrap();
        assert_eq!(s.embed(1_u32), Ok(0));

        //check that the position is advancing accordingly
        assert_eq!(s.embed(20_u16), Ok(4));
        assert_eq!(s.embed(-3_i16), Ok(6));
        assert_eq!(s.embed_bytes(&[7, 8, 9]), Ok(8));
        assert_eq!(s.pop_pack(false), Ok(1));
        s.end_serialize().unwrap();

        let out = s.copy_bytes().unwrap();
        assert_eq!(out, [0, 0, 0, 1, 0, 20, 0xff, 0xfd, 7, 8, 9]);
    }

    #[test]
    fn errors_are_sticky() {
        let mut s = Serializer::new(2);
        assert_eq!(s.push(), Ok(()));
        assert!(s.embed(1_u32).is_err());
        assert_eq!(
            s.push(),
            Err(SerializeErrorFlags::SERIALIZE_ERROR_OUT_OF_ROOM)
        );
        assert!(s.in_error());
        assert!(s.copy_bytes().is_err());
    }

    #[test]
    fn allocate_without_object() {
        let mut s = Serializer::new(10);
        assert_eq!(
            s.allocate_size(2),
            Err(SerializeErrorFlags::SERIALIZE_ERROR_OTHER)
        );
    }

    #[test]
    fn start_serialize_resets() {
        let mut s = Serializer::new(2);
        s.push().unwrap();
        assert!(s.embed(1_u32).is_err());
        s.start_serialize().unwrap();
        assert!(s.successful());
        assert_eq!(s.packed_objects(), &[None]);
    }

    #[test]
    fn pack_shares_identical_objects() {
        let mut s = Serializer::new(100);
        s.push().unwrap();
        s.embed(5_u16).unwrap();
        let a = s.pop_pack(true).unwrap();

        s.push().unwrap();
        s.embed(5_u16).unwrap();
        let b = s.pop_pack(true).unwrap();

        s.push().unwrap();
        s.embed(5_u16).unwrap();
        let c = s.pop_pack(false).unwrap();

        assert_eq!(a, 1);
        assert_eq!(a, b);
        assert_eq!(c, 2);
        assert_eq!(s.packed_objects().len(), 3);
        assert_eq!(s.size, 4);
    }

    #[test]
    fn pop_discard_releases_room() {
        let mut s = Serializer::new(4);
        s.push().unwrap();
        s.embed(1_u32).unwrap();
        s.pop_discard().unwrap();
        s.push().unwrap();
        assert_eq!(s.embed(2_u32), Ok(0));
    }

    #[test]
    fn nil_links_are_ignored() {
        let mut s = Serializer::new(100);
        s.push().unwrap();
        s.add_offset(0, LinkWidth::Two).unwrap();
        s.pop_pack(false).unwrap();
        let obj = s.packed_objects()[1].as_ref().unwrap();
        assert!(obj.links().is_empty());
        assert_eq!(obj.bytes(), &[0, 0]);
    }

    #[test]
    fn link_to_unpacked_object() {
        let mut s = Serializer::new(100);
        s.push().unwrap();
        assert_eq!(
            s.add_offset(3, LinkWidth::Two),
            Err(SerializeErrorFlags::SERIALIZE_ERROR_OTHER)
        );
    }

    #[test]
    fn end_serialize_resolves_links() {
        let mut s = Serializer::new(100);
        s.start_serialize().unwrap();

        s.push().unwrap();
        s.embed(0xbeef_u16).unwrap();
        let leaf = s.pop_pack(false).unwrap();

        s.push().unwrap();
        s.embed(1_u16).unwrap();
        s.add_offset(leaf, LinkWidth::Two).unwrap();
        s.add_offset(leaf, LinkWidth::Four).unwrap();
        let pos = s.allocate_size(2).unwrap();
        s.add_link(
            Link::new(LinkWidth::Two, leaf, pos as u32)
                .with_whence(OffsetWhence::Tail)
                .with_signed(true),
        )
        .unwrap();
        s.pop_pack(false).unwrap();

        s.end_serialize().unwrap();
        let out = s.copy_bytes().unwrap();
        assert_eq!(out, [0, 1, 0, 10, 0, 0, 0, 10, 0, 0, 0xbe, 0xef]);
    }

    #[test]
    fn end_serialize_reports_overflow() {
        let mut s = Serializer::new(100_000);
        s.start_serialize().unwrap();

        s.push().unwrap();
        s.embed(1_u16).unwrap();
        let small = s.pop_pack(false).unwrap();

        s.push().unwrap();
        s.embed_bytes(&vec![0; 70_000]).unwrap();
        let big = s.pop_pack(false).unwrap();

        s.push().unwrap();
        s.add_offset(big, LinkWidth::Two).unwrap();
        s.add_offset(small, LinkWidth::Two).unwrap();
        s.pop_pack(false).unwrap();

        assert_eq!(
            s.end_serialize(),
            Err(SerializeErrorFlags::SERIALIZE_ERROR_OFFSET_OVERFLOW)
        );
        // objects are still available for repacking
        assert_eq!(s.packed_objects().len(), 4);
    }

    #[test]
    fn write_offset_checks_range() {
        let mut s = Serializer::new(100);
        s.push().unwrap();
        s.allocate_size(6).unwrap();
        s.write_offset(0, -2, LinkWidth::Two, true).unwrap();
        s.write_offset(2, 0x1234_5678, LinkWidth::Four, false)
            .unwrap();
        assert_eq!(
            s.write_offset(0, -1, LinkWidth::Two, false),
            Err(SerializeErrorFlags::SERIALIZE_ERROR_OFFSET_OVERFLOW)
        );
        assert!(s.in_error());
    }

    #[test]
    fn write_offset_out_of_bounds() {
        let mut s = Serializer::new(100);
        s.push().unwrap();
        s.allocate_size(3).unwrap();
        assert_eq!(
            s.write_offset(2, 1, LinkWidth::Two, false),
            Err(SerializeErrorFlags::SERIALIZE_ERROR_OTHER)
        );
    }

    #[test]
    fn error_flags_display() {
        let mut flags = SerializeErrorFlags::SERIALIZE_ERROR_OFFSET_OVERFLOW;
        flags |= SerializeErrorFlags::SERIALIZE_ERROR_OUT_OF_ROOM;
        assert_eq!(flags.to_string(), "offset overflow | out of room");
        assert_eq!(
            SerializeErrorFlags::SERIALIZE_ERROR_NONE.to_string(),
            "no error"
        );
    }
}
