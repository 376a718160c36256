//! ICMP relatedness.
//!
//! An ICMP error quotes the header of the packet that triggered it. Mapping
//! that quote back to a tracked flow and rewriting it is left to an
//! installable [`IcmpRelation`]; the default treats every ICMP packet as
//! unrelated, so it continues through the stack untouched.

use flowgate_packet::{Headers, Packet};

use crate::context::Context;
use crate::pipeline::Verdict;

pub trait IcmpRelation: Send + Sync {
    /// Return a verdict when the packet belongs to a tracked connection and
    /// has been handled, or `None` to let it pass as ordinary traffic.
    fn related(&self, ctx: &Context, pkt: &mut Packet<'_>, h: &Headers) -> Option<Verdict>;
}

/// Never related.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl IcmpRelation for PassThrough {
    fn related(&self, _ctx: &Context, _pkt: &mut Packet<'_>, _h: &Headers) -> Option<Verdict> {
        None
    }
}
