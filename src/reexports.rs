//! Reexports of crates, that are part of the public api, for convenience

pub use nix;
pub use smallvec;
pub use xkbcommon;
