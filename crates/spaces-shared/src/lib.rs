//! Process plumbing shared by the spaces daemon and its clients:
//! diagnostics/logging setup, socket locations and the local transport.

pub mod diagnostics;
pub mod socket_path;
pub mod transport;
