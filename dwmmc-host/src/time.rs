//! # Time units

// Frequency based

/// Hertz
pub type Hertz = fugit::HertzU32;
pub type Hz = Hertz;

/// KiloHertz
pub type KiloHertz = fugit::KilohertzU32;

/// MegaHertz
pub type MegaHertz = fugit::MegahertzU32;

// Period based

/// Milliseconds
pub type Milliseconds = fugit::MillisDurationU32;

/// Microseconds
pub type Microseconds = fugit::MicrosDurationU32;
