mod cert;
mod state;

pub use cert::*;
pub use state::*;
