mod app;
mod index;

pub use app::app;
