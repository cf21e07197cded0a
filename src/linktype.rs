/// A savefile data-link type.
///
/// Records in a savefile start with whatever header this value announces. rawcap writes
/// network-layer datagrams without any link framing, so it uses [`Linktype::RAW`]. A full list
/// of linktypes is available [here](http://www.tcpdump.org/linktypes.html).
/// ```rust
/// use rawcap::Linktype;
///
/// assert_eq!(Linktype::RAW, Linktype(101));
/// ```
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Linktype(pub i32);

impl Linktype {
    /// Raw IP; each record begins with an IPv4 or IPv6 header.
    pub const RAW: Self = Self(101);
}
