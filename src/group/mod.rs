//! Group conversation logic.
//!
//! - `turns`: RPG-mode rotation — whose turn is next, round boundaries. A pure
//!   function of the group config and the persisted message history; never of
//!   view state.
//! - `dynamic`: dynamic-mode speaker choice — @mention pings, participation
//!   balance heuristics, per-participant guard caps.
//! - `advance`: the auto-progress decision consulted after each completed
//!   generation.

pub mod advance;
pub mod dynamic;
pub mod turns;
