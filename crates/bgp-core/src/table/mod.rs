pub mod cache;
pub mod decision;
pub mod deletion;
pub mod fanout;
pub mod filter;
pub mod ribin;
pub mod ribout;

use std::rc::Rc;

use ptree::Prefix;

use crate::message::{Genid, InternalMessage, UniqueId};

pub use cache::CacheTable;
pub use decision::DecisionTable;
pub use deletion::DeletionTable;
pub use fanout::FanoutTable;
pub use filter::FilterTable;
pub use ribin::RibInTable;
pub use ribout::RibOutTable;

/// Status of a table's output side, reported to whatever feeds it so the
/// whole pipeline never has to buffer more than the single message it's
/// currently passing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    Idle,
    Busy,
}

/// A node in the pipelined route-table stack. Downstream-facing calls
/// (`add_route`/`replace_route`/`delete_route`/`route_dump`/`push`) move a
/// change one hop further from the peer that originated it; upstream-facing
/// calls (`peering_went_down`/`peering_down_complete`/`peering_came_up`)
/// travel the other way along the parent pointer.
///
/// Implementations that have no opinion on an upstream-facing call accept
/// the default, which is a no-op forward — exactly one table (`RibInTable`)
/// originates these and exactly one (`DecisionTable`, fanning out to many
/// `RibOutTable`s) is their final destination, so most tables in between
/// only need to pass them on to whatever they're wired to.
pub trait RouteTable<P: Prefix> {
    fn add_route(&mut self, msg: Rc<InternalMessage<P>>) -> crate::message::AddRouteStatus;

    fn replace_route(
        &mut self,
        old: Rc<InternalMessage<P>>,
        new: Rc<InternalMessage<P>>,
    ) -> crate::message::AddRouteStatus;

    fn delete_route(&mut self, msg: Rc<InternalMessage<P>>);

    fn route_dump(&mut self, msg: Rc<InternalMessage<P>>, dump_peer: UniqueId) -> crate::message::AddRouteStatus;

    fn push(&mut self, origin_peer: UniqueId);

    fn output_state(&self) -> OutputState {
        OutputState::Idle
    }

    /// Resumes emitting after a prior `output_state() == Busy`; `next` is
    /// whatever the caller needs to know to pick up from where it left off
    /// (a prefix, typically).
    fn get_next_message(&mut self, _next: &P) {}

    fn lookup_route(&self, _net: &P) -> Option<(Rc<crate::route::SubnetRoute<P>>, Genid)> {
        None
    }

    fn route_used(&mut self, _route: &Rc<crate::route::SubnetRoute<P>>, _in_use: bool) {}

    fn peering_went_down(&mut self, _peer: UniqueId, _genid: Genid) {}

    fn peering_down_complete(&mut self, _peer: UniqueId, _genid: Genid) {}

    fn peering_came_up(&mut self, _peer: UniqueId, _genid: Genid) {}
}
