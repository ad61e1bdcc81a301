pub mod supply;

pub use supply::Supply;
