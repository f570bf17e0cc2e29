//! Ambient logging setup (`spec.md` §10), optional for embedders.
//!
//! The crate never installs a subscriber on its own — a library doesn't
//! get to decide how its host process logs — but it offers the same
//! default the teacher's own binary wires up in `main.rs`, for embedders
//! who have no stronger opinion of their own.

/// Installs the default `fmt` subscriber as the global default: pretty
/// output under debug builds, compact output in release, same as the
/// teacher's own startup sequence. Panics if a global subscriber is
/// already installed, same as `tracing_subscriber::fmt().init()` would.
pub fn install_default_subscriber() {
    let subscriber = tracing_subscriber::fmt();
    #[cfg(debug_assertions)]
    let subscriber = subscriber.pretty();
    subscriber.init();
}
