use std::fmt::Debug;
use std::hash::Hash;

/// Identifier of one unit of work in a batch.
///
/// Items are supplied by the caller and moved into the batch. They must be hashable so that a
/// batch can reject duplicates, which would otherwise contribute two entries for one item.
pub trait WorkItem: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> WorkItem for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}
