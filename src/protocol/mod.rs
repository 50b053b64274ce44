pub mod decoder;

pub use decoder::{decode_body_composition, decode_weight};
