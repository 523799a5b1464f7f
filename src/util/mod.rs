pub mod buf;
pub mod clock;
pub mod safe_converter;
