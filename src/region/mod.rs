pub mod policy;
pub mod safety;

pub use policy::{count_words, ActiveRegion, RegionPolicy};
pub use safety::{align_range, align_to_grapheme_boundary, floor_boundary, is_caret_safe};
