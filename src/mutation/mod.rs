//! Optimistic counter mutations.
//!
//! [`OptimisticMutationEngine`] is the only component that writes counter
//! values. Everything else reads [`CounterSnapshot`]s from it or from the
//! counter cache.

mod counter;
mod engine;

pub use counter::{
  Confidence, CounterKey, CounterPhase, CounterSnapshot, Mutation, MutationState, PendingMutation,
};
pub use engine::{LocalResult, MutationEvent, MutationTicket, OptimisticMutationEngine};
