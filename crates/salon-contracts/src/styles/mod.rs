mod catalog;
mod composer;
mod selection;

pub use catalog::{HairColor, Haircut, Look, StyleOption, STYLE_CATALOG_VERSION};
pub use composer::{compose_instruction, SALON_SEATING_INSTRUCTION};
pub use selection::{StyleSelection, StyleUpdate};
