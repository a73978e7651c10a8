//! PSI table decoders.
//!
//! Each decoder consumes one complete section (as delivered by a
//! [`SectionFilter`](crate::SectionFilter) callback) and produces a
//! plain struct; all stateful bookkeeping (version diffing, target
//! selection, completeness) lives in [`PsiParser`](crate::PsiParser).

pub mod cat;
pub mod descriptors;
pub mod pat;
pub mod pmt;

pub use cat::CatSection;
pub use descriptors::{CaDescriptor, DescriptorIterator};
pub use pat::{PatProgram, PatSection};
pub use pmt::{PmtSection, PmtStream};
