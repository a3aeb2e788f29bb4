pub mod controller;
pub mod environment;
pub mod executor;
pub mod guard;
pub mod lifecycle;
pub mod notify;
pub mod preflight;
pub mod process;
pub mod resolver;
pub mod runner;
pub mod snapshot;
pub mod state;
pub mod vcs;
