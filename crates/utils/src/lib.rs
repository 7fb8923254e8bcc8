pub mod path;
pub mod procout;
pub mod text;
