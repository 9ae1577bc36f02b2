//! Sources, destinations and the inter-phase streaming pipe.

mod destination;
mod pipe;
mod source;

pub use destination::{CollectionDestination, Destination, FileDestination, Writer};
pub use pipe::Pipe;
pub use source::{AggregationSource, CollectionSource, FileSource, Source, COUNT_BUDGET};
