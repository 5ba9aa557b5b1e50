//! Pacman package databases for pakt.
//!
//! [`ExpacDatabase`] is always available. [`AlpmDatabase`] talks to
//! libalpm directly and needs the `libalpm` feature.

#[cfg(feature = "libalpm")]
pub mod backend;
pub mod expac;
pub mod repos;

#[cfg(feature = "libalpm")]
pub use backend::AlpmDatabase;
pub use expac::ExpacDatabase;
pub use repos::pacman_repos;
